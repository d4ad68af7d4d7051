use async_trait::async_trait;
use tracing::warn;

use crate::config::{CLOUD_HOST, SessionConfig};
use crate::error::SignalingError;

/// Capability that retrieves an initial identity from the rendezvous service.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn retrieve_identity(&self) -> Result<String, SignalingError>;
}

/// Default provider: one HTTP GET against the service's `{key}/id` endpoint.
pub struct HttpIdentityProvider {
    client: reqwest::Client,
    config: SessionConfig,
}

impl HttpIdentityProvider {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn retrieval_failed(&self) -> SignalingError {
        let mut message = String::from("Could not get an ID from the server.");
        if self.config.path == "/" && self.config.host != CLOUD_HOST {
            message.push_str(
                " If you passed in a `path` to your self-hosted rendezvous service, \
                 you'll also need to pass in that same path when creating a new session.",
            );
        }
        SignalingError::Server(message)
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn retrieve_identity(&self) -> Result<String, SignalingError> {
        let url = self.config.identity_url();
        let response = self.client.get(&url).send().await.map_err(|err| {
            warn!(target: "beacon::api", error = %err, "identity retrieval failed");
            self.retrieval_failed()
        })?;
        if response.status() != reqwest::StatusCode::OK {
            warn!(
                target: "beacon::api",
                status = %response.status(),
                "identity retrieval rejected"
            );
            return Err(self.retrieval_failed());
        }
        response.text().await.map_err(|err| {
            warn!(target: "beacon::api", error = %err, "identity response unreadable");
            self.retrieval_failed()
        })
    }
}
