use reqwest::{Client, StatusCode};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum DavError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("server returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("malformed server reply: {0}")]
    MalformedReply(#[from] serde_json::Error),
}

impl DavError {
    pub fn http_status(&self) -> Option<StatusCode> {
        match self {
            DavError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn error_body(&self) -> Option<&str> {
        match self {
            DavError::Api { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DavError::Request(err) if err.is_timeout())
    }

    pub fn is_connect(&self) -> bool {
        matches!(self, DavError::Request(err) if err.is_connect())
    }
}

/// Server-side feature set relevant to uploads. Filled from the capabilities
/// endpoint by the surrounding client; tests construct it directly.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub bulk_upload: bool,
    /// Checksum types the server can verify on transmission.
    pub supported_checksum_types: Vec<String>,
    pub upload_checksum_type: String,
    pub upload_checksums_enabled: bool,
    /// HTTP error codes that reset a failing upload after repeats.
    pub reset_error_codes: Vec<u16>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            bulk_upload: true,
            supported_checksum_types: vec!["MD5".to_string(), "SHA1".to_string()],
            upload_checksum_type: "MD5".to_string(),
            upload_checksums_enabled: true,
            reset_error_codes: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct Account {
    http: Client,
    base_url: Url,
    user: String,
    password: String,
    capabilities: Capabilities,
}

impl Account {
    pub fn with_base_url(
        base_url: &str,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, DavError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            user: user.into(),
            password: password.into(),
            capabilities: Capabilities::default(),
        })
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }

    pub(crate) fn endpoint(&self, path: &str) -> Result<Url, DavError> {
        Ok(self.base_url.join(path)?)
    }

    pub(crate) async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DavError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DavError::Api { status, body })
        }
    }
}
