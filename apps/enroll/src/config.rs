use std::env;

use thiserror::Error;
use url::Url;

pub const DEFAULT_SIGNALING_PATH: &str = "/api/socket";
pub const DEFAULT_START_PATH: &str = "/api/registration/start";
pub const DEFAULT_FINISH_PATH: &str = "/api/registration/finish";
pub const DEFAULT_ADD_TOKEN_PATH: &str = "/api/registration/add";
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.services.mozilla.com";
pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "dataChannel";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid pairing configuration: {0}")]
    Invalid(String),
}

/// Endpoints and negotiation settings shared by both pairing roles.
#[derive(Debug, Clone)]
pub struct PairingConfig {
    server_base: Url,
    signaling_url: Url,
    start_path: String,
    finish_path: String,
    add_token_path: String,
    ice_servers: Vec<String>,
    data_channel_label: String,
    bearer_token: Option<String>,
    user_agent: String,
}

impl PairingConfig {
    /// Builds a configuration rooted at `server_base`. A bare host gets
    /// `http://` when it looks local and `https://` otherwise; the signaling
    /// endpoint is derived as the matching `ws`/`wss` url on the socket path.
    pub fn new(server_base: impl AsRef<str>) -> Result<Self, ConfigError> {
        let mut base = server_base.as_ref().trim().to_string();
        if base.is_empty() {
            return Err(ConfigError::Invalid("server base url cannot be empty".into()));
        }
        if !base.contains("://") {
            let scheme = infer_scheme(&base);
            base = format!("{scheme}{base}");
        }
        let server_base = Url::parse(&base)
            .map_err(|err| ConfigError::Invalid(format!("invalid server url {base}: {err}")))?;
        let signaling_url = derive_websocket_url(&server_base, DEFAULT_SIGNALING_PATH)?;
        Ok(Self {
            server_base,
            signaling_url,
            start_path: DEFAULT_START_PATH.to_string(),
            finish_path: DEFAULT_FINISH_PATH.to_string(),
            add_token_path: DEFAULT_ADD_TOKEN_PATH.to_string(),
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            bearer_token: None,
            user_agent: format!("enroll/{}", env!("CARGO_PKG_VERSION")),
        })
    }

    /// Reads `ENROLL_SERVER_BASE` (falling back to `default_base`) and applies
    /// the optional `ENROLL_*` overrides on top.
    pub fn from_env(default_base: &str) -> Result<Self, ConfigError> {
        let base = non_empty_var("ENROLL_SERVER_BASE").unwrap_or_else(|| default_base.to_string());
        let mut config = Self::new(base)?;
        if let Some(url) = non_empty_var("ENROLL_SIGNALING_URL") {
            config = config.with_signaling_url(&url)?;
        }
        if let Some(servers) = non_empty_var("ENROLL_ICE_SERVERS") {
            config.ice_servers = parse_ice_servers(&servers);
        }
        if let Some(label) = non_empty_var("ENROLL_DATA_CHANNEL_LABEL") {
            config.data_channel_label = label;
        }
        config.bearer_token = non_empty_var("ENROLL_BEARER_TOKEN");
        Ok(config)
    }

    pub fn with_signaling_url(mut self, url: &str) -> Result<Self, ConfigError> {
        let parsed = Url::parse(url.trim())
            .map_err(|err| ConfigError::Invalid(format!("invalid signaling url {url}: {err}")))?;
        match parsed.scheme() {
            "ws" | "wss" | "memory" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unsupported signaling scheme {other}"
                )));
            }
        }
        self.signaling_url = parsed;
        Ok(self)
    }

    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token.filter(|value| !value.trim().is_empty());
        self
    }

    pub fn with_data_channel_label(mut self, label: impl Into<String>) -> Self {
        self.data_channel_label = label.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn server_base(&self) -> &Url {
        &self.server_base
    }

    pub fn signaling_url(&self) -> &Url {
        &self.signaling_url
    }

    pub fn ice_servers(&self) -> &[String] {
        &self.ice_servers
    }

    pub fn data_channel_label(&self) -> &str {
        &self.data_channel_label
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.bearer_token.as_deref()
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn start_url(&self) -> Result<Url, ConfigError> {
        self.endpoint(&self.start_path)
    }

    pub fn finish_url(&self) -> Result<Url, ConfigError> {
        self.endpoint(&self.finish_path)
    }

    pub fn add_token_url(&self) -> Result<Url, ConfigError> {
        self.endpoint(&self.add_token_path)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ConfigError> {
        self.server_base
            .join(path)
            .map_err(|err| ConfigError::Invalid(format!("invalid endpoint {path}: {err}")))
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_ice_servers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|server| !server.is_empty())
        .map(str::to_string)
        .collect()
}

fn derive_websocket_url(base: &Url, path: &str) -> Result<Url, ConfigError> {
    let mut ws = base.clone();
    let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    ws.set_scheme(scheme)
        .map_err(|_| ConfigError::Invalid("invalid websocket scheme".into()))?;
    ws.set_path(path);
    ws.set_query(None);
    ws.set_fragment(None);
    Ok(ws)
}

fn infer_scheme(base: &str) -> &'static str {
    let host_part = base
        .split('/')
        .next()
        .unwrap_or(base)
        .trim_start_matches('[')
        .split(']')
        .next()
        .unwrap_or(base);
    let host_lower = host_part.to_ascii_lowercase();
    if host_lower.starts_with("localhost")
        || host_lower == "0.0.0.0"
        || host_lower.starts_with("127.")
        || host_lower == "::1"
        || host_lower.starts_with("10.")
        || host_lower.starts_with("192.168.")
        || host_lower
            .strip_prefix("172.")
            .and_then(|rest| rest.split('.').next())
            .and_then(|octet| octet.parse::<u8>().ok())
            .map(|octet| (16..32).contains(&octet))
            .unwrap_or(false)
    {
        "http://"
    } else {
        "https://"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_hosts_default_to_secure_schemes() {
        let config = PairingConfig::new("passkeys.example.com").unwrap();
        assert_eq!(config.server_base().as_str(), "https://passkeys.example.com/");
        assert_eq!(
            config.signaling_url().as_str(),
            "wss://passkeys.example.com/api/socket"
        );
    }

    #[test]
    fn local_hosts_default_to_plain_schemes() {
        let config = PairingConfig::new("localhost:3000").unwrap();
        assert_eq!(config.server_base().as_str(), "http://localhost:3000/");
        assert_eq!(config.signaling_url().as_str(), "ws://localhost:3000/api/socket");
    }

    #[test]
    fn private_ranges_default_to_plain_schemes() {
        assert_eq!(infer_scheme("172.20.0.5:8080"), "http://");
        assert_eq!(infer_scheme("172.31.255.1"), "http://");
        assert_eq!(infer_scheme("10.0.0.7:8080"), "http://");
        assert_eq!(infer_scheme("0.0.0.0"), "http://");
        assert_eq!(infer_scheme("172.32.0.1"), "https://");
        assert_eq!(infer_scheme("172.15.0.1"), "https://");
    }

    #[test]
    fn endpoints_are_joined_onto_the_base() {
        let config = PairingConfig::new("https://auth.example.com/ignored").unwrap();
        assert_eq!(
            config.start_url().unwrap().as_str(),
            "https://auth.example.com/api/registration/start"
        );
        assert_eq!(
            config.finish_url().unwrap().as_str(),
            "https://auth.example.com/api/registration/finish"
        );
        assert_eq!(
            config.add_token_url().unwrap().as_str(),
            "https://auth.example.com/api/registration/add"
        );
    }

    #[test]
    fn rejects_empty_base_and_http_signaling() {
        assert!(PairingConfig::new("  ").is_err());
        let config = PairingConfig::new("https://auth.example.com").unwrap();
        assert!(config.with_signaling_url("https://auth.example.com/socket").is_err());
    }

    #[test]
    fn ice_server_lists_skip_blanks() {
        assert_eq!(
            parse_ice_servers("stun:a.example:3478, ,turn:b.example"),
            vec!["stun:a.example:3478".to_string(), "turn:b.example".to_string()]
        );
    }

    #[test]
    fn blank_bearer_tokens_are_ignored() {
        let config = PairingConfig::new("https://auth.example.com")
            .unwrap()
            .with_bearer_token(Some("   ".into()));
        assert!(config.bearer_token().is_none());
    }
}
