//! Transactional email dispatch.
//!
//! Runs after the event's transaction has committed. A failure here is
//! logged and swallowed; it never fails the event ingestion.

use segflow_channels::{EmailMessage, EmailSender, SendReceipt};
use segflow_core::types::{Attributes, EmailProvider, Event, Transaction};
use segflow_core::{EngineError, SegflowResult};
use segflow_sandbox::Sandbox;
use tracing::{debug, warn};

pub fn dispatch_transactional(
    sandbox: &Sandbox,
    sender: &dyn EmailSender,
    provider: Option<&EmailProvider>,
    transaction: &Transaction,
    user_attributes: &Attributes,
    event: &Event,
) {
    let result = send(sandbox, sender, provider, transaction, user_attributes, event);
    match result {
        Ok(receipt) => {
            metrics::counter!("email.transactional_sent").increment(1);
            debug!(
                transaction_id = %transaction.id,
                event = %event.name,
                provider_message_id = %receipt.provider_message_id,
                "Transactional email sent"
            );
        }
        Err(err) => {
            warn!(
                transaction_id = %transaction.id,
                event = %event.name,
                error = %err,
                "Transactional email failed"
            );
        }
    }
}

fn send(
    sandbox: &Sandbox,
    sender: &dyn EmailSender,
    provider: Option<&EmailProvider>,
    transaction: &Transaction,
    user_attributes: &Attributes,
    event: &Event,
) -> SegflowResult<SendReceipt> {
    let provider = provider
        .ok_or_else(|| EngineError::Transport("no email provider configured".to_string()))?;

    let user_value = serde_json::Value::Object(user_attributes.clone());
    let event_value = serde_json::Value::Object(event.attributes.clone());
    let vars: [(&str, &serde_json::Value); 2] = [("user", &user_value), ("event", &event_value)];

    let subject = sandbox.render(&transaction.subject, "", &vars)?;
    let html = sandbox.render(&transaction.html, &transaction.preamble, &vars)?;
    let to = user_attributes
        .get("email")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            EngineError::Validation(format!("user {} has no email attribute", event.user_id))
        })?
        .to_string();

    sender.send(provider, &EmailMessage { to, subject, html })
}
