//! At-most-two-attempts submission policy.
//!
//! A soft failure is an acknowledgment the peer returned without accepting
//! the message: either the all-zero message id some SMSCs use as a reject
//! marker, or a non-zero command status. The first soft failure earns one
//! retry; the second drops the message.

use bulk_common::SendRequest;
use bulk_smpp::SubmitAck;

/// Submissions per destination, first attempt included
pub const MAX_ATTEMPTS: u32 = 2;

/// A send request together with the attempt it is on.
#[derive(Debug, Clone)]
pub struct RetryRecord {
    pub request: SendRequest,
    /// 1 for the first submission
    pub attempt: u32,
}

impl RetryRecord {
    pub fn first(request: SendRequest) -> Self {
        Self { request, attempt: 1 }
    }

    pub fn next_attempt(self) -> Self {
        Self {
            request: self.request,
            attempt: self.attempt + 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Accepted by the peer; report processed
    Success,
    /// Soft failure on the first attempt; requeue ahead of new work
    RetryOnce,
    /// Soft failure with the retry spent; audit and forget
    Drop,
}

impl AckDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckDecision::Success => "accepted",
            AckDecision::RetryOnce => "retried",
            AckDecision::Drop => "dropped",
        }
    }
}

/// An all-zero message id (`"0000000000"`) marks a rejected submission.
pub fn is_sentinel_message_id(message_id: &str) -> bool {
    !message_id.is_empty() && message_id.bytes().all(|b| b == b'0')
}

pub fn is_soft_failure(ack: &SubmitAck) -> bool {
    ack.command_status != 0 || is_sentinel_message_id(&ack.message_id)
}

/// Decide what to do with a message after the peer answered `attempt`.
pub fn handle_ack(ack: &SubmitAck, attempt: u32) -> AckDecision {
    if is_soft_failure(ack) {
        after_soft_failure(attempt)
    } else {
        AckDecision::Success
    }
}

/// Decision for a submission the peer refused outright (e.g. generic_nack).
pub fn after_soft_failure(attempt: u32) -> AckDecision {
    if attempt < MAX_ATTEMPTS {
        AckDecision::RetryOnce
    } else {
        AckDecision::Drop
    }
}
