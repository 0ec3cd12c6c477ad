//! Commands yielded by flow programs.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    SendEmail { template_id: String },
    Wait { duration: WaitSpec },
    SendSms { message: String },
}

/// Duration components of a `wait` command. Unset components are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitSpec {
    pub seconds: i64,
    pub minutes: i64,
    pub hours: i64,
    pub days: i64,
    pub weeks: i64,
}

impl WaitSpec {
    pub fn as_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.seconds)
            + chrono::Duration::minutes(self.minutes)
            + chrono::Duration::hours(self.hours)
            + chrono::Duration::days(self.days)
            + chrono::Duration::days(self.weeks * 7)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_spec_sums_components() {
        let spec = WaitSpec {
            seconds: 30,
            minutes: 1,
            hours: 2,
            days: 1,
            weeks: 1,
        };
        let expected = chrono::Duration::seconds(30 + 60 + 2 * 3600 + 86400 + 7 * 86400);
        assert_eq!(spec.as_duration(), expected);
    }

    #[test]
    fn command_serializes_tagged() {
        let cmd = Command::SendEmail {
            template_id: "welcome".to_string(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains(r#""type":"send_email""#));
    }
}
