//! Outbound email delivery.
//!
//! The engine renders subject and body, then hands the message to an
//! [`EmailSender`] together with the configured provider. `ProviderSender`
//! routes on the provider config; `CaptureSender` records messages for
//! tests.

pub mod postmark;
pub mod ses;

use std::sync::Mutex;

use segflow_core::types::{EmailProvider, EmailProviderConfig};
use segflow_core::SegflowResult;

/// A fully rendered email ready for delivery.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub provider_message_id: String,
}

pub trait EmailSender: Send + Sync {
    fn send(&self, provider: &EmailProvider, message: &EmailMessage)
        -> SegflowResult<SendReceipt>;
}

/// Dispatches to the provider named by the singleton configuration.
pub struct ProviderSender;

impl EmailSender for ProviderSender {
    fn send(
        &self,
        provider: &EmailProvider,
        message: &EmailMessage,
    ) -> SegflowResult<SendReceipt> {
        let receipt = match &provider.config {
            EmailProviderConfig::Postmark { api_key } => {
                postmark::send(api_key, &provider.from_address, message)?
            }
            EmailProviderConfig::Ses {
                access_key_id,
                region,
                ..
            } => ses::send(access_key_id, region, &provider.from_address, message)?,
        };
        metrics::counter!("email.sent").increment(1);
        Ok(receipt)
    }
}

/// In-memory sender that captures messages for testing.
#[derive(Default)]
pub struct CaptureSender {
    sent: Mutex<Vec<EmailMessage>>,
}

impl CaptureSender {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().expect("capture sender mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().expect("capture sender mutex poisoned").len()
    }

    pub fn clear(&self) {
        self.sent.lock().expect("capture sender mutex poisoned").clear();
    }
}

impl EmailSender for CaptureSender {
    fn send(
        &self,
        _provider: &EmailProvider,
        message: &EmailMessage,
    ) -> SegflowResult<SendReceipt> {
        self.sent
            .lock()
            .expect("capture sender mutex poisoned")
            .push(message.clone());
        Ok(SendReceipt {
            provider_message_id: format!("capture-{}", uuid::Uuid::new_v4()),
        })
    }
}

/// Sender that fails every delivery, for exercising transport-error paths.
pub struct FailingSender;

impl EmailSender for FailingSender {
    fn send(
        &self,
        _provider: &EmailProvider,
        _message: &EmailMessage,
    ) -> SegflowResult<SendReceipt> {
        Err(segflow_core::EngineError::Transport(
            "delivery refused".to_string(),
        ))
    }
}
