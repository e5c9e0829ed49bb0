//! Configuration module for pagewatch.
//!
//! Loads configuration from environment variables with sensible defaults.
//! User-editable settings live in the store instead (see [`crate::db::Settings`]).

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address for the command API (default: 127.0.0.1)
    pub bind_addr: String,
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "pagewatch.db")
    pub db_path: String,
    /// Upper bound on waiting for a page to load (default: 30s)
    pub page_load_timeout: Duration,
    pub user_agent: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            http_port: 8080,
            db_path: "pagewatch.db".to_string(),
            page_load_timeout: Duration::from_secs(30),
            user_agent: concat!("pagewatch/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PAGEWATCH_BIND_ADDR`: listen address (default: 127.0.0.1)
    /// - `PAGEWATCH_HTTP_PORT`: HTTP port (default: 8080)
    /// - `PAGEWATCH_DB_PATH`: Database file path (default: "pagewatch.db")
    /// - `PAGEWATCH_PAGE_LOAD_TIMEOUT`: page load timeout in seconds (default: 30)
    /// - `PAGEWATCH_USER_AGENT`: user agent for page fetches
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(addr) = lookup("PAGEWATCH_BIND_ADDR") {
            cfg.bind_addr = addr;
        }

        if let Some(port) = parse_var(&lookup, "PAGEWATCH_HTTP_PORT") {
            cfg.http_port = port;
        }

        if let Some(db_path) = lookup("PAGEWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(secs) = parse_var::<u64, _>(&lookup, "PAGEWATCH_PAGE_LOAD_TIMEOUT") {
            if secs > 0 {
                cfg.page_load_timeout = Duration::from_secs(secs);
            } else {
                tracing::warn!("PAGEWATCH_PAGE_LOAD_TIMEOUT must be positive, using default");
            }
        }

        if let Some(agent) = lookup("PAGEWATCH_USER_AGENT").filter(|a| !a.trim().is_empty()) {
            cfg.user_agent = agent;
        }

        cfg
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.http_port)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}={:?}, using default", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "pagewatch.db");
        assert_eq!(cfg.listen_addr(), "127.0.0.1:8080");
        assert_eq!(cfg.page_load_timeout, Duration::from_secs(30));
        assert!(cfg.user_agent.starts_with("pagewatch/"));
    }

    #[test]
    fn test_overrides() {
        let cfg = config_from(&[
            ("PAGEWATCH_BIND_ADDR", "0.0.0.0"),
            ("PAGEWATCH_HTTP_PORT", "9090"),
            ("PAGEWATCH_DB_PATH", "/tmp/pw.db"),
            ("PAGEWATCH_PAGE_LOAD_TIMEOUT", "45"),
            ("PAGEWATCH_USER_AGENT", "custom/1.0"),
        ]);
        assert_eq!(cfg.listen_addr(), "0.0.0.0:9090");
        assert_eq!(cfg.db_path, "/tmp/pw.db");
        assert_eq!(cfg.page_load_timeout, Duration::from_secs(45));
        assert_eq!(cfg.user_agent, "custom/1.0");
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let cfg = config_from(&[
            ("PAGEWATCH_HTTP_PORT", "eighty"),
            ("PAGEWATCH_PAGE_LOAD_TIMEOUT", "0"),
            ("PAGEWATCH_USER_AGENT", "  "),
        ]);
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.page_load_timeout, Duration::from_secs(30));
        assert!(cfg.user_agent.starts_with("pagewatch/"));
    }
}
