use serde::Deserialize;
use url::Url;

use crate::account::{Account, DavError};

/// Processing state reported by a deferred-upload poll URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollStatus {
    Init,
    Started,
    Finished,
    Error,
}

impl PollStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PollStatus::Finished | PollStatus::Error)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollReply {
    pub status: PollStatus,
    #[serde(default)]
    pub error: Option<String>,
}

impl Account {
    /// One poll round against a `OC-JobStatus-Location` URL. The server hands
    /// out either absolute URLs or paths relative to the account base.
    pub async fn poll_job_status(&self, poll_url: &str) -> Result<PollReply, DavError> {
        let url = if poll_url.starts_with("http://") || poll_url.starts_with("https://") {
            Url::parse(poll_url)?
        } else {
            self.endpoint(poll_url.trim_start_matches('/'))?
        };
        let response = self
            .http()
            .get(url)
            .basic_auth(self.user(), Some(self.password()))
            .send()
            .await?;
        Self::handle_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_status_deserializes_lowercase() {
        let reply: PollReply = serde_json::from_str(r#"{"status": "started"}"#).unwrap();
        assert_eq!(reply.status, PollStatus::Started);
        assert!(!reply.status.is_terminal());
    }

    #[test]
    fn poll_error_carries_message() {
        let reply: PollReply =
            serde_json::from_str(r#"{"status": "error", "error": "processing failed"}"#).unwrap();
        assert_eq!(reply.status, PollStatus::Error);
        assert!(reply.status.is_terminal());
        assert_eq!(reply.error.as_deref(), Some("processing failed"));
    }
}
