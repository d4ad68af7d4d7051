use std::time::{Duration, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::SignalingError;

/// Host of the free cloud rendezvous service.
pub const CLOUD_HOST: &str = "0.peerjs.com";
pub const CLOUD_PORT: u16 = 443;
pub const DEFAULT_KEY: &str = "peerjs";
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);

/// Fixed endpoint segment appended to the configured path for the control
/// connection.
const CONTROL_ENDPOINT: &str = "peerjs";

pub static DEFAULT_ICE_SERVERS: Lazy<Vec<IceServer>> = Lazy::new(|| {
    vec![
        IceServer::new(&["stun:stun.l.google.com:19302"]),
        IceServer::new(&["stun:global.stun.twilio.com:3478"]),
        IceServer::with_credentials(&["turn:0.peerjs.com:3478"], "peerjs", "peerjsp"),
    ]
});

/// STUN/TURN server entry handed to the peer-connection factory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(urls: &[&str]) -> Self {
        Self {
            urls: urls.iter().map(|url| url.to_string()).collect(),
            username: None,
            credential: None,
        }
    }

    pub fn with_credentials(urls: &[&str], username: &str, credential: &str) -> Self {
        Self {
            urls: urls.iter().map(|url| url.to_string()).collect(),
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }
}

/// Resolved configuration for one signaling session.
///
/// Built through [`SessionConfigBuilder`]; caller overrides take precedence
/// over the cloud defaults at every field.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    /// Mount path of the rendezvous service, normalized to carry leading and
    /// trailing slashes.
    pub path: String,
    pub key: String,
    pub secure: bool,
    pub ping_interval: Duration,
    pub ice_servers: Vec<IceServer>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: CLOUD_HOST.to_string(),
            port: CLOUD_PORT,
            path: "/".to_string(),
            key: DEFAULT_KEY.to_string(),
            secure: true,
            ping_interval: DEFAULT_PING_INTERVAL,
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    /// URL of the control WebSocket for a given identity and session token.
    pub fn control_url(&self, identity: &str, token: &str) -> Result<Url, SignalingError> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let raw = format!(
            "{scheme}://{}:{}{}{CONTROL_ENDPOINT}?key={}&id={}&token={}",
            self.host, self.port, self.path, self.key, identity, token
        );
        Url::parse(&raw).map_err(|err| SignalingError::Socket(format!("invalid control url {raw}: {err}")))
    }

    /// URL of the identity-retrieval endpoint, with a cache-busting query.
    pub fn identity_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        format!(
            "{scheme}://{}:{}{}{}/id?ts={ts}{}",
            self.host,
            self.port,
            self.path,
            self.key,
            random_token()
        )
    }
}

/// Builder whose set values override the cloud defaults.
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    host: Option<String>,
    port: Option<u16>,
    path: Option<String>,
    key: Option<String>,
    secure: Option<bool>,
    ping_interval: Option<Duration>,
    ice_servers: Option<Vec<IceServer>>,
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = Some(secure);
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval);
        self
    }

    /// Replaces the default ICE server list entirely.
    pub fn ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_servers = Some(servers);
        self
    }

    pub fn build(self) -> SessionConfig {
        let host = self.host.unwrap_or_else(|| CLOUD_HOST.to_string());
        // The cloud service only accepts TLS; self-hosted services default to
        // plaintext unless the caller says otherwise.
        let secure = self.secure.unwrap_or(host == CLOUD_HOST);
        SessionConfig {
            secure,
            host,
            port: self.port.unwrap_or(CLOUD_PORT),
            path: normalize_path(self.path.as_deref().unwrap_or("/")),
            key: self.key.unwrap_or_else(|| DEFAULT_KEY.to_string()),
            ping_interval: self.ping_interval.unwrap_or(DEFAULT_PING_INTERVAL),
            ice_servers: self.ice_servers.unwrap_or_else(|| DEFAULT_ICE_SERVERS.clone()),
        }
    }
}

fn normalize_path(path: &str) -> String {
    let mut path = path.to_string();
    if !path.starts_with('/') {
        path.insert(0, '/');
    }
    if !path.ends_with('/') {
        path.push('/');
    }
    path
}

/// Short random token for session tokens and connection ids. Unguessable
/// enough to avoid collisions between concurrent attempts, not
/// cryptographically secure.
pub fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_cloud() {
        let config = SessionConfig::builder().build();
        assert_eq!(config.host, CLOUD_HOST);
        assert_eq!(config.port, CLOUD_PORT);
        assert_eq!(config.path, "/");
        assert_eq!(config.key, DEFAULT_KEY);
        assert!(config.secure);
        assert_eq!(config.ice_servers, *DEFAULT_ICE_SERVERS);
    }

    #[test]
    fn overrides_take_precedence() {
        let servers = vec![IceServer::new(&["stun:stun.example.org:3478"])];
        let config = SessionConfig::builder()
            .host("rendezvous.example.org")
            .port(9000)
            .key("testkey")
            .secure(true)
            .ping_interval(Duration::from_secs(1))
            .ice_servers(servers.clone())
            .build();
        assert_eq!(config.host, "rendezvous.example.org");
        assert_eq!(config.port, 9000);
        assert_eq!(config.key, "testkey");
        assert!(config.secure);
        assert_eq!(config.ping_interval, Duration::from_secs(1));
        assert_eq!(config.ice_servers, servers);
    }

    #[test]
    fn secure_is_inferred_from_host() {
        assert!(SessionConfig::builder().build().secure);
        assert!(!SessionConfig::builder().host("localhost").build().secure);
        assert!(SessionConfig::builder().host("localhost").secure(true).build().secure);
    }

    #[test]
    fn path_is_normalized() {
        assert_eq!(SessionConfig::builder().path("myapp").build().path, "/myapp/");
        assert_eq!(SessionConfig::builder().path("/myapp/").build().path, "/myapp/");
        assert_eq!(SessionConfig::builder().path("/").build().path, "/");
    }

    #[test]
    fn control_url_carries_identity_and_token() {
        let config = SessionConfig::builder()
            .host("localhost")
            .port(9000)
            .path("myapp")
            .build();
        let url = config.control_url("abc", "tok").unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/myapp/peerjs");
        let query = url.query().unwrap();
        assert!(query.contains("key=peerjs"));
        assert!(query.contains("id=abc"));
        assert!(query.contains("token=tok"));
    }

    #[test]
    fn identity_url_targets_key_endpoint() {
        let config = SessionConfig::builder().host("localhost").port(9000).build();
        let url = config.identity_url();
        assert!(url.starts_with("http://localhost:9000/peerjs/id?ts="));
    }

    #[test]
    fn random_tokens_are_distinct() {
        let a = random_token();
        let b = random_token();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}
