//!
//! almsgate runtime configuration
//! ------------------------------
//! Configuration is read from environment variables first and then overridden
//! by CLI flags, matching the precedence used by the server binary. All values
//! have working defaults so `almsgate` starts with no configuration at all
//! (local identity provider, in-memory profiles, token cache under
//! `almsgate_cache/`).

use std::env;

/// Runtime configuration for the almsgate server.
///
/// `backend_url` switches the server from the built-in local identity
/// provider to the hosted auth/profile backend; everything else tunes the
/// session and client-context lifecycle.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP listen port.
    pub http_port: u16,
    /// Base URL of the hosted auth/profile backend. None = local mode.
    pub backend_url: Option<String>,
    /// API key sent to the hosted backend.
    pub backend_key: Option<String>,
    /// Directory for persisted per-client token files. None disables the cache.
    pub cache_dir: Option<String>,
    /// Lifetime of issued access tokens, seconds.
    pub session_ttl_secs: u64,
    /// Idle time after which a server-side client context is retired, seconds.
    pub client_idle_secs: u64,
    /// Password for the seeded local super-admin account.
    pub dev_password: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            http_port: 7878,
            backend_url: None,
            backend_key: None,
            cache_dir: Some("almsgate_cache".to_string()),
            session_ttl_secs: 3600,
            client_idle_secs: 1800,
            dev_password: "almsgate".to_string(),
        }
    }
}

fn parse_port_env(name: &str) -> Option<u16> {
    match env::var(name) {
        Ok(val) => val.parse::<u16>().ok(),
        Err(_) => None,
    }
}

fn parse_u64_env(name: &str) -> Option<u64> {
    match env::var(name) {
        Ok(val) => val.parse::<u64>().ok(),
        Err(_) => None,
    }
}

fn env_string(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(val) if !val.trim().is_empty() => Some(val),
        _ => None,
    }
}

/// Return the value following `flag` in `args`, if present.
pub fn flag_value(args: &[String], flag: &str) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag
            && i + 1 < args.len() {
                return Some(args[i + 1].clone());
            }
        i += 1;
    }
    None
}

pub fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

/// An empty string or the word "none" disables an optional path setting.
fn optional_path(raw: Option<String>) -> Option<Option<String>> {
    raw.map(|v| {
        let t = v.trim();
        if t.is_empty() || t.eq_ignore_ascii_case("none") {
            None
        } else {
            Some(t.to_string())
        }
    })
}

impl AppConfig {
    /// Build configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut cfg = AppConfig::default();
        if let Some(p) = parse_port_env("ALMSGATE_HTTP_PORT") {
            cfg.http_port = p;
        }
        if let Some(url) = env_string("ALMSGATE_BACKEND_URL") {
            cfg.backend_url = Some(url);
        }
        if let Some(key) = env_string("ALMSGATE_BACKEND_KEY") {
            cfg.backend_key = Some(key);
        }
        if let Some(dir) = optional_path(env::var("ALMSGATE_CACHE_DIR").ok()) {
            cfg.cache_dir = dir;
        }
        if let Some(t) = parse_u64_env("ALMSGATE_SESSION_TTL_SECS") {
            cfg.session_ttl_secs = t;
        }
        if let Some(t) = parse_u64_env("ALMSGATE_CLIENT_IDLE_SECS") {
            cfg.client_idle_secs = t;
        }
        if let Some(pw) = env_string("ALMSGATE_DEV_PASSWORD") {
            cfg.dev_password = pw;
        }
        cfg
    }

    /// Environment first, then CLI flags override.
    pub fn from_env_and_args(args: &[String]) -> Self {
        let mut cfg = AppConfig::from_env();
        if let Some(p) = flag_value(args, "--http-port").and_then(|v| v.parse::<u16>().ok()) {
            cfg.http_port = p;
        }
        if let Some(url) = flag_value(args, "--backend-url") {
            cfg.backend_url = Some(url);
        }
        if let Some(key) = flag_value(args, "--backend-key") {
            cfg.backend_key = Some(key);
        }
        if let Some(dir) = optional_path(flag_value(args, "--cache-dir")) {
            cfg.cache_dir = dir;
        }
        if let Some(t) = flag_value(args, "--session-ttl").and_then(|v| v.parse::<u64>().ok()) {
            cfg.session_ttl_secs = t;
        }
        if let Some(t) = flag_value(args, "--client-idle").and_then(|v| v.parse::<u64>().ok()) {
            cfg.client_idle_secs = t;
        }
        if let Some(pw) = flag_value(args, "--dev-password") {
            cfg.dev_password = pw;
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn defaults_are_local_mode() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.http_port, 7878);
        assert!(cfg.backend_url.is_none());
        assert_eq!(cfg.cache_dir.as_deref(), Some("almsgate_cache"));
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = AppConfig::from_env_and_args(&args(&[
            "almsgate",
            "--http-port",
            "9090",
            "--backend-url",
            "https://auth.example.org",
            "--session-ttl",
            "120",
        ]));
        assert_eq!(cfg.http_port, 9090);
        assert_eq!(cfg.backend_url.as_deref(), Some("https://auth.example.org"));
        assert_eq!(cfg.session_ttl_secs, 120);
    }

    #[test]
    fn cache_dir_none_disables_cache() {
        let cfg = AppConfig::from_env_and_args(&args(&["almsgate", "--cache-dir", "none"]));
        assert!(cfg.cache_dir.is_none());
        let cfg = AppConfig::from_env_and_args(&args(&["almsgate", "--cache-dir", "/tmp/tokens"]));
        assert_eq!(cfg.cache_dir.as_deref(), Some("/tmp/tokens"));
    }

    #[test]
    fn flag_helpers() {
        let a = args(&["bin", "--http-port", "7000", "--verbose"]);
        assert_eq!(flag_value(&a, "--http-port").as_deref(), Some("7000"));
        assert_eq!(flag_value(&a, "--missing"), None);
        assert!(has_flag(&a, "--verbose"));
        assert!(!has_flag(&a, "--quiet"));
    }
}
