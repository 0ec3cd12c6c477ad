use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user's attribute document. Always contains an `email` string.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub attributes: Attributes,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An immutable domain event emitted for a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub name: String,
    pub user_id: String,
    pub attributes: Attributes,
    pub created_at: DateTime<Utc>,
}

/// A declarative predicate over users: a SQL query whose `id` column yields
/// the matching user ids. May reference the `users` and `events` tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,
    pub evaluator: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignBehavior {
    /// Members stay enrolled once added, even if they stop matching.
    Static,
    /// Membership tracks the segment predicate; leavers are evicted.
    Dynamic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    /// Source of the resumable flow program run by the executor.
    pub flow: String,
    pub behavior: CampaignBehavior,
    pub segments: Vec<String>,
    pub exclude_segments: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Sleeping,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Sleeping => "sleeping",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Terminated
        )
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "sleeping" => Ok(ExecutionStatus::Sleeping),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "terminated" => Ok(ExecutionStatus::Terminated),
            other => Err(format!("unknown execution status `{other}`")),
        }
    }
}

/// The live state of one user's traversal of one campaign's flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub user_id: String,
    pub campaign_id: String,
    pub status: ExecutionStatus,
    pub sleep_until: DateTime<Utc>,
    pub error: Option<String>,
}

/// Attribute snapshot observed just before yielding the step of the same
/// index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryStep {
    pub step_index: i64,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub subject: String,
    pub html: String,
    pub preamble: String,
}

/// A one-shot email bound to an event name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub event: String,
    pub subject: String,
    pub html: String,
    pub preamble: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum EmailProviderConfig {
    Postmark {
        #[serde(rename = "apiKey")]
        api_key: String,
    },
    Ses {
        #[serde(rename = "accessKeyId")]
        access_key_id: String,
        #[serde(rename = "secretAccessKey")]
        secret_access_key: String,
        region: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailProvider {
    pub config: EmailProviderConfig,
    pub from_address: String,
}

// ─── Configuration documents (whole-config pushes) ──────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfigDocument {
    pub templates: BTreeMap<String, TemplateSpec>,
    pub segments: BTreeMap<String, SegmentSpec>,
    pub campaigns: BTreeMap<String, CampaignSpec>,
    pub transactions: BTreeMap<String, TransactionSpec>,
    pub email_provider: Option<EmailProvider>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub subject: String,
    pub html: String,
    #[serde(default)]
    pub preamble: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSpec {
    pub evaluator: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignSpec {
    pub flow: String,
    pub segments: Vec<String>,
    #[serde(default)]
    pub exclude_segments: Vec<String>,
    pub behavior: CampaignBehavior,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSpec {
    pub event: String,
    pub subject: String,
    pub html: String,
    #[serde(default)]
    pub preamble: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_status_round_trips() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Sleeping,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Terminated,
        ] {
            let parsed: ExecutionStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn provider_config_tagged_union() {
        let json = r#"{"name":"postmark","apiKey":"pm-123"}"#;
        let config: EmailProviderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config,
            EmailProviderConfig::Postmark {
                api_key: "pm-123".to_string()
            }
        );

        let json = r#"{"name":"ses","accessKeyId":"AK","secretAccessKey":"SK","region":"us-east-1"}"#;
        let config: EmailProviderConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(config, EmailProviderConfig::Ses { .. }));
    }

    #[test]
    fn config_document_defaults_to_empty() {
        let doc: ConfigDocument = serde_json::from_str("{}").unwrap();
        assert!(doc.templates.is_empty());
        assert!(doc.campaigns.is_empty());
        assert!(doc.email_provider.is_none());
    }
}
