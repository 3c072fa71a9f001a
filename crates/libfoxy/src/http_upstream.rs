//! Upstream reached over HTTP.
//!
//! Contract:
//! - `POST {base}/api/v1/apdu` with `{"reader", "apdu", "reset"}` answers
//!   `{"response": [...]}`
//! - `GET {base}/api/v1/inventory` answers `{"readers": [...]}`
//! - `GET {base}/api/v1/ping` answers 2xx while the upstream is up

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::upstream::{UpstreamError, UpstreamProvider, UpstreamSession};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct ApduRequest<'a> {
    reader: &'a str,
    apdu: Option<&'a str>,
    reset: bool,
}

#[derive(Deserialize)]
struct ApduReply {
    #[serde(default)]
    response: Vec<String>,
}

#[derive(Deserialize)]
struct InventoryReply {
    #[serde(default)]
    readers: Vec<String>,
}

impl HttpUpstream {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("foxy/{}", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| UpstreamError::Unreachable(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn transport(err: reqwest::Error) -> UpstreamError {
    if err.is_status() {
        UpstreamError::Rejected(err.to_string())
    } else if err.is_decode() {
        UpstreamError::Malformed(err.to_string())
    } else {
        UpstreamError::Unreachable(err.to_string())
    }
}

#[async_trait::async_trait]
impl UpstreamSession for HttpUpstream {
    async fn cmd(
        &self,
        apdu: Option<&str>,
        token: &str,
        reset: bool,
    ) -> Result<Vec<String>, UpstreamError> {
        let body = ApduRequest {
            reader: token,
            apdu,
            reset,
        };
        let reply: ApduReply = self
            .authorize(self.client.post(self.url("/api/v1/apdu")))
            .json(&body)
            .send()
            .await
            .map_err(transport)?
            .error_for_status()
            .map_err(transport)?
            .json()
            .await
            .map_err(transport)?;
        debug!(token, apdu = apdu.unwrap_or("<reset>"), reply = ?reply.response, "upstream command");
        Ok(reply.response)
    }

    async fn inventory(&self) -> Result<Vec<String>, UpstreamError> {
        let reply: InventoryReply = self
            .authorize(self.client.get(self.url("/api/v1/inventory")))
            .send()
            .await
            .map_err(transport)?
            .error_for_status()
            .map_err(transport)?
            .json()
            .await
            .map_err(transport)?;
        Ok(reply.readers)
    }
}

#[async_trait::async_trait]
impl UpstreamProvider for HttpUpstream {
    async fn connect(&self) -> Result<Box<dyn UpstreamSession>, UpstreamError> {
        Ok(Box::new(self.clone()))
    }

    async fn close(&self, _session: Box<dyn UpstreamSession>) {}

    async fn is_up(&self) -> bool {
        match self
            .authorize(self.client.get(self.url("/api/v1/ping")))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                debug!("upstream ping failed: {err}");
                false
            }
        }
    }
}
