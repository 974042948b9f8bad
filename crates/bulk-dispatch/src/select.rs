/// Index of the first ready worker at or after `start`, wrapping around.
///
/// The scan covers each slot at most once, so an all-unready pool yields
/// `None` instead of spinning.
pub fn select_ready_worker(readiness: &[bool], start: usize) -> Option<usize> {
    let len = readiness.len();
    if len == 0 {
        return None;
    }
    (0..len)
        .map(|offset| (start + offset) % len)
        .find(|&slot| readiness[slot])
}
