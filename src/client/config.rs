use std::env;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub websocket_base_url: String,
    pub reconnect_interval: Duration,
    pub ws_handshake_timeout: Duration,
    pub http_timeout: Duration,
    pub storage_base_url: String,
    pub storage_bucket: String,
    pub data_dir: PathBuf,
    pub keyring_fallback: bool,
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api".to_string(),
            websocket_base_url: "http://localhost:8080".to_string(),
            reconnect_interval: Duration::from_millis(5000),
            ws_handshake_timeout: Duration::from_secs(10),
            http_timeout: Duration::from_secs(15),
            storage_base_url: "https://firebasestorage.googleapis.com".to_string(),
            storage_bucket: String::new(),
            data_dir: PathBuf::from("data"),
            keyring_fallback: false,
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset or unparsable keys keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        Self {
            api_base_url: lookup("API_BASE_URL").unwrap_or(d.api_base_url),
            websocket_base_url: lookup("WEBSOCKET_BASE_URL").unwrap_or(d.websocket_base_url),
            reconnect_interval: lookup("RECONNECT_INTERVAL_MS")
                .and_then(|v| v.parse().ok())
                // zero would spin the retry loop
                .filter(|ms: &u64| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(d.reconnect_interval),
            ws_handshake_timeout: lookup("WS_HANDSHAKE_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(d.ws_handshake_timeout),
            http_timeout: lookup("HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(d.http_timeout),
            storage_base_url: lookup("STORAGE_BASE_URL").unwrap_or(d.storage_base_url),
            storage_bucket: lookup("STORAGE_BUCKET").unwrap_or(d.storage_bucket),
            data_dir: lookup("DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            keyring_fallback: lookup("KEYRING_FALLBACK")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(d.keyring_fallback),
            log_level: lookup("LOG_LEVEL").unwrap_or(d.log_level),
        }
    }

    /// `ws(s)://<websocket base>/ws`, derived from the http(s) base URL.
    pub fn websocket_url(&self) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&self.websocket_base_url)?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        // http <-> ws is an allowed scheme swap for special schemes
        let _ = url.set_scheme(scheme);
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("ws");
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_when_unset() {
        let cfg = ClientConfig::from_lookup(|_| None);
        assert_eq!(cfg.api_base_url, "http://localhost:8080/api");
        assert_eq!(cfg.reconnect_interval, Duration::from_millis(5000));
        assert!(!cfg.keyring_fallback);
    }

    #[test]
    fn test_overrides_and_bad_numbers() {
        let vars: HashMap<&str, &str> = [
            ("RECONNECT_INTERVAL_MS", "250"),
            ("HTTP_TIMEOUT_SECS", "soon"),
            ("KEYRING_FALLBACK", "true"),
            ("WEBSOCKET_BASE_URL", "https://chat.example.org/"),
        ]
        .into_iter()
        .collect();
        let cfg = ClientConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.reconnect_interval, Duration::from_millis(250));
        assert_eq!(cfg.http_timeout, Duration::from_secs(15));
        assert!(cfg.keyring_fallback);
        assert_eq!(cfg.websocket_url().unwrap().as_str(), "wss://chat.example.org/ws");
    }

    #[test]
    fn test_zero_reconnect_interval_keeps_default() {
        let cfg = ClientConfig::from_lookup(|k| (k == "RECONNECT_INTERVAL_MS").then(|| "0".to_string()));
        assert_eq!(cfg.reconnect_interval, Duration::from_millis(5000));
    }

    #[test]
    fn test_websocket_url_from_http() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.websocket_url().unwrap().as_str(), "ws://localhost:8080/ws");
    }
}
