//! Session seam between workers and the SMPP transport
//!
//! Workers talk to a [`Session`] obtained from a [`SessionConnector`], so the
//! pool can run against a real SMSC or a scripted one in tests.

use async_trait::async_trait;
use bulk_common::{Credentials, DispatchJob};
use bulk_config::SmppConfig;
use bulk_smpp::{SessionOptions, SmppClient, SmppError, SubmitAck};
use tracing::debug;

/// A bound transceiver session
#[async_trait]
pub trait Session: Send + Sync {
    /// Submit one message and wait for the peer's acknowledgment
    async fn submit(&self, destination: &str, job: &DispatchJob) -> Result<SubmitAck, SmppError>;

    /// Resolves once the session is no longer usable
    async fn closed(&self);

    /// Graceful unbind; errors are not reported
    async fn unbind(&self);
}

/// Opens bound sessions
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, endpoint: &str, credentials: &Credentials) -> Result<Box<dyn Session>, SmppError>;
}

/// Connector for real SMSC endpoints
#[derive(Debug, Clone)]
pub struct SmppConnector {
    template: SessionOptions,
}

impl SmppConnector {
    /// `template` carries timeouts and addressing; credentials are filled per connect.
    pub fn new(template: SessionOptions) -> Self {
        Self { template }
    }

    pub fn from_config(config: &SmppConfig) -> Self {
        let mut template = SessionOptions::new(config.system_id.clone(), config.password.clone());
        template.connect_timeout = config.connect_timeout();
        template.response_timeout = config.response_timeout();
        template.enquire_link_interval = config.enquire_link_interval();
        template.source_addr_ton = config.source_addr_ton;
        template.source_addr_npi = config.source_addr_npi;
        template.dest_addr_ton = config.dest_addr_ton;
        template.dest_addr_npi = config.dest_addr_npi;
        template.data_coding = config.data_coding;
        Self { template }
    }
}

#[async_trait]
impl SessionConnector for SmppConnector {
    async fn connect(&self, endpoint: &str, credentials: &Credentials) -> Result<Box<dyn Session>, SmppError> {
        let mut options = self.template.clone();
        options.system_id = credentials.system_id.clone();
        options.password = credentials.password.clone();

        let client = SmppClient::connect(endpoint, options).await?;
        Ok(Box::new(SmppSession { client }))
    }
}

struct SmppSession {
    client: SmppClient,
}

#[async_trait]
impl Session for SmppSession {
    async fn submit(&self, destination: &str, job: &DispatchJob) -> Result<SubmitAck, SmppError> {
        self.client
            .submit_sm(&job.source_address, destination, &job.message_text)
            .await
    }

    async fn closed(&self) {
        self.client.closed().await
    }

    async fn unbind(&self) {
        if let Err(e) = self.client.unbind().await {
            debug!(endpoint = %self.client.endpoint(), error = %e, "Unbind did not complete cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_from_config() {
        let config = SmppConfig {
            system_id: "lbtest".to_string(),
            password: "secret".to_string(),
            enquire_link_secs: 30,
            data_coding: 0,
            ..Default::default()
        };

        let connector = SmppConnector::from_config(&config);
        assert_eq!(connector.template.system_id, "lbtest");
        assert_eq!(connector.template.enquire_link_interval.as_secs(), 30);
        assert_eq!(connector.template.data_coding, 0);
        assert_eq!(connector.template.source_addr_ton, 5);
    }
}
