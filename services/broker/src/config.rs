use anyhow::{Context, Result};
use gmsg_authz::User;
use gmsg_wire::{DEFAULT_MAX_CONTROL_LINE, DEFAULT_MAX_PAYLOAD};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;

// Broker service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    // Client listener bind address.
    pub bind: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Name advertised in INFO.
    pub server_name: Option<String>,
    // Largest PUB payload accepted.
    pub max_payload: usize,
    // Longest control line accepted.
    pub max_control_line: usize,
    // Per-client outbound queue depth, in operations.
    pub client_queue_capacity: usize,
    // Time allowed between accept and CONNECT.
    pub auth_timeout_ms: u64,
    // Server-initiated PING period; zero disables it.
    pub ping_interval_ms: u64,
    // Unanswered server PINGs before the client is dropped.
    pub max_pings_out: usize,
    // Advertised in INFO. The plain TCP listener cannot honour it by itself.
    pub tls_required: bool,
    // Single-user credentials.
    pub user: Option<String>,
    pub password: Option<String>,
    // Single shared token.
    pub token: Option<String>,
    // Multi-user list; takes precedence over the single-user settings.
    pub users: Vec<User>,
}

pub const DEFAULT_BIND: &str = "0.0.0.0:4222";
pub const DEFAULT_METRICS_BIND: &str = "0.0.0.0:8222";
pub const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = gmsg_broker::DEFAULT_CLIENT_QUEUE_CAPACITY;
pub const DEFAULT_AUTH_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_PING_INTERVAL_MS: u64 = 120_000;
pub const DEFAULT_MAX_PINGS_OUT: usize = 2;

#[derive(Debug, Deserialize)]
struct BrokerConfigOverride {
    bind: Option<String>,
    metrics_bind: Option<String>,
    server_name: Option<String>,
    max_payload: Option<usize>,
    max_control_line: Option<usize>,
    client_queue_capacity: Option<usize>,
    auth_timeout_ms: Option<u64>,
    ping_interval_ms: Option<u64>,
    max_pings_out: Option<usize>,
    tls_required: Option<bool>,
    user: Option<String>,
    password: Option<String>,
    token: Option<String>,
    users: Option<Vec<User>>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 4222)),
            metrics_bind: SocketAddr::from(([0, 0, 0, 0], 8222)),
            server_name: None,
            max_payload: DEFAULT_MAX_PAYLOAD,
            max_control_line: DEFAULT_MAX_CONTROL_LINE,
            client_queue_capacity: DEFAULT_CLIENT_QUEUE_CAPACITY,
            auth_timeout_ms: DEFAULT_AUTH_TIMEOUT_MS,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            max_pings_out: DEFAULT_MAX_PINGS_OUT,
            tls_required: false,
            user: None,
            password: None,
            token: None,
            users: Vec::new(),
        }
    }
}

impl BrokerConfig {
    /// Loopback listener on an ephemeral port with default limits.
    pub fn local() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            metrics_bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self> {
        let bind = std::env::var("GMSG_BIND")
            .unwrap_or_else(|_| DEFAULT_BIND.to_string())
            .parse()
            .with_context(|| "parse GMSG_BIND")?;
        let metrics_bind = std::env::var("GMSG_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse GMSG_METRICS_BIND")?;
        let server_name = std::env::var("GMSG_SERVER_NAME").ok();
        let max_payload = std::env::var("GMSG_MAX_PAYLOAD")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_PAYLOAD);
        let max_control_line = std::env::var("GMSG_MAX_CONTROL_LINE")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_CONTROL_LINE);
        let client_queue_capacity = std::env::var("GMSG_CLIENT_QUEUE")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_CLIENT_QUEUE_CAPACITY);
        let auth_timeout_ms = std::env::var("GMSG_AUTH_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_AUTH_TIMEOUT_MS);
        // Zero is meaningful here: it turns server pings off.
        let ping_interval_ms = std::env::var("GMSG_PING_INTERVAL_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_PING_INTERVAL_MS);
        let max_pings_out = std::env::var("GMSG_MAX_PINGS_OUT")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_PINGS_OUT);
        let tls_required = std::env::var("GMSG_TLS_REQUIRED")
            .ok()
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let user = std::env::var("GMSG_USER").ok().filter(|value| !value.is_empty());
        let password = std::env::var("GMSG_PASSWORD").ok();
        let token = std::env::var("GMSG_TOKEN").ok().filter(|value| !value.is_empty());
        Ok(Self {
            bind,
            metrics_bind,
            server_name,
            max_payload,
            max_control_line,
            client_queue_capacity,
            auth_timeout_ms,
            ping_interval_ms,
            max_pings_out,
            tls_required,
            user,
            password,
            token,
            users: Vec::new(),
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("GMSG_CONFIG") {
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read GMSG_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        Ok(config)
    }

    /// Layer a YAML document over the current values. Missing keys leave the
    /// current value alone.
    pub fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: BrokerConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse broker config yaml")?;
        if let Some(value) = override_cfg.bind {
            self.bind = value.parse().with_context(|| "parse bind")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.server_name {
            self.server_name = Some(value);
        }
        if let Some(value) = override_cfg.max_payload
            && value > 0
        {
            self.max_payload = value;
        }
        if let Some(value) = override_cfg.max_control_line
            && value > 0
        {
            self.max_control_line = value;
        }
        if let Some(value) = override_cfg.client_queue_capacity
            && value > 0
        {
            self.client_queue_capacity = value;
        }
        if let Some(value) = override_cfg.auth_timeout_ms
            && value > 0
        {
            self.auth_timeout_ms = value;
        }
        if let Some(value) = override_cfg.ping_interval_ms {
            self.ping_interval_ms = value;
        }
        if let Some(value) = override_cfg.max_pings_out
            && value > 0
        {
            self.max_pings_out = value;
        }
        if let Some(value) = override_cfg.tls_required {
            self.tls_required = value;
        }
        if let Some(value) = override_cfg.user {
            self.user = Some(value);
        }
        if let Some(value) = override_cfg.password {
            self.password = Some(value);
        }
        if let Some(value) = override_cfg.token {
            self.token = Some(value);
        }
        if let Some(users) = override_cfg.users {
            for user in &users {
                user.validate()
                    .with_context(|| format!("validate user {:?}", user.username))?;
            }
            self.users = users;
        }
        Ok(())
    }

    pub fn auth_required(&self) -> bool {
        !self.users.is_empty() || self.user.is_some() || self.token.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    fn clear_env() -> Vec<EnvGuard> {
        [
            "GMSG_BIND",
            "GMSG_METRICS_BIND",
            "GMSG_SERVER_NAME",
            "GMSG_MAX_PAYLOAD",
            "GMSG_MAX_CONTROL_LINE",
            "GMSG_CLIENT_QUEUE",
            "GMSG_AUTH_TIMEOUT_MS",
            "GMSG_PING_INTERVAL_MS",
            "GMSG_MAX_PINGS_OUT",
            "GMSG_TLS_REQUIRED",
            "GMSG_USER",
            "GMSG_PASSWORD",
            "GMSG_TOKEN",
            "GMSG_CONFIG",
        ]
        .into_iter()
        .map(EnvGuard::unset)
        .collect()
    }

    #[test]
    #[serial]
    fn from_env_uses_defaults() {
        let _guards = clear_env();
        let config = BrokerConfig::from_env().expect("config");
        assert_eq!(config.bind.to_string(), DEFAULT_BIND);
        assert_eq!(config.metrics_bind.to_string(), DEFAULT_METRICS_BIND);
        assert_eq!(config.max_payload, DEFAULT_MAX_PAYLOAD);
        assert_eq!(config.auth_timeout_ms, DEFAULT_AUTH_TIMEOUT_MS);
        assert_eq!(config.ping_interval_ms, DEFAULT_PING_INTERVAL_MS);
        assert!(!config.auth_required());
    }

    #[test]
    #[serial]
    fn from_env_reads_overrides_and_ignores_zero_limits() {
        let _guards = clear_env();
        let _g1 = EnvGuard::set("GMSG_BIND", "127.0.0.1:5222");
        let _g2 = EnvGuard::set("GMSG_MAX_PAYLOAD", "0");
        let _g3 = EnvGuard::set("GMSG_CLIENT_QUEUE", "32");
        let _g4 = EnvGuard::set("GMSG_TOKEN", "s3cr3t");
        let _g5 = EnvGuard::set("GMSG_PING_INTERVAL_MS", "0");
        let config = BrokerConfig::from_env().expect("config");
        assert_eq!(config.bind.to_string(), "127.0.0.1:5222");
        assert_eq!(config.max_payload, DEFAULT_MAX_PAYLOAD);
        assert_eq!(config.client_queue_capacity, 32);
        assert_eq!(config.token.as_deref(), Some("s3cr3t"));
        assert_eq!(config.ping_interval_ms, 0);
        assert!(config.auth_required());
    }

    #[test]
    #[serial]
    fn from_env_rejects_bad_bind() {
        let _guards = clear_env();
        let _g1 = EnvGuard::set("GMSG_BIND", "not-an-addr");
        assert!(BrokerConfig::from_env().is_err());
    }

    #[test]
    #[serial]
    fn yaml_override_loads_users_with_nil_and_empty_lists() {
        let _guards = clear_env();
        let mut file = tempfile();
        writeln!(
            file.1,
            "bind: 127.0.0.1:0\nmax_payload: 2048\nusers:\n  - username: ivan\n    password: pwd\n    permissions:\n      publish: [foo]\n      subscribe: []\n  - username: derek\n    password: pass\n"
        )
        .expect("write");
        let _g1 = EnvGuard::set("GMSG_CONFIG", &file.0);
        let config = BrokerConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.bind.port(), 0);
        assert_eq!(config.max_payload, 2048);
        assert_eq!(config.users.len(), 2);
        let ivan = config.users[0].permissions.as_ref().expect("permissions");
        assert_eq!(ivan.publish, Some(vec!["foo".to_string()]));
        assert_eq!(ivan.subscribe, Some(Vec::new()));
        assert!(config.users[1].permissions.is_none());
        let _ = fs::remove_file(&file.0);
    }

    #[test]
    #[serial]
    fn yaml_override_missing_file_is_an_error() {
        let _guards = clear_env();
        let _g1 = EnvGuard::set("GMSG_CONFIG", "/nonexistent/gmsg-broker.yaml");
        assert!(BrokerConfig::from_env_or_yaml().is_err());
    }

    #[test]
    fn yaml_with_invalid_permission_pattern_is_rejected() {
        let mut config = BrokerConfig::local();
        let err = config
            .apply_yaml("users:\n  - username: bad\n    password: x\n    permissions:\n      publish: ['foo.>.bar']\n")
            .expect_err("invalid pattern");
        assert!(err.to_string().contains("bad"));
    }

    fn tempfile() -> (String, fs::File) {
        let path = std::env::temp_dir().join(format!(
            "gmsg-broker-config-{}-{}.yaml",
            std::process::id(),
            rand::random::<u32>()
        ));
        let file = fs::File::create(&path).expect("create temp file");
        (path.to_string_lossy().into_owned(), file)
    }
}
