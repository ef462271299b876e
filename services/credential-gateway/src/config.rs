//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Passwords are loaded from GATEWAY_PASSWORD / ADMIN_PASSWORD env vars or a
//! password_file, never stored in the TOML directly.

use common::Secret;
use serde::Deserialize;
use session_pool::PoolConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub endpoint: EndpointConfig,
    pub identity: IdentityConfig,
    /// Optional administrator identity used for privileged resets
    #[serde(default)]
    pub admin: Option<IdentityConfig>,
    #[serde(default)]
    pub pool: PoolConfig,
    /// JSON file where rotated pool passwords are persisted
    #[serde(default)]
    pub identity_store: Option<PathBuf>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    /// In-process directory, seeded from the configured identities
    Memory,
    /// Remote credential service
    Http,
}

/// Credential server settings
#[derive(Debug, Deserialize)]
pub struct EndpointConfig {
    pub kind: EndpointKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub connect_string: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// An account the gateway authenticates as
#[derive(Debug, Deserialize)]
pub struct IdentityConfig {
    pub user: String,
    #[serde(skip)]
    pub password: Option<Secret<String>>,
    /// Path to a file containing the password (alternative to the env var)
    #[serde(default)]
    pub password_file: Option<PathBuf>,
}

fn default_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    1000
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Password resolution order, per identity:
    /// 1. GATEWAY_PASSWORD (pool identity) or ADMIN_PASSWORD (admin) env var
    /// 2. password_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if config.endpoint.kind == EndpointKind::Http {
            match config.endpoint.url.as_deref() {
                Some(url) if url.starts_with("http://") || url.starts_with("https://") => {}
                Some(url) => {
                    return Err(common::Error::Config(format!(
                        "endpoint url must start with http:// or https://, got: {url}"
                    )));
                }
                None => {
                    return Err(common::Error::Config(
                        "endpoint url is required when kind = \"http\"".into(),
                    ));
                }
            }
        }

        if config.endpoint.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.gateway.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.identity.user.is_empty() {
            return Err(common::Error::Config("identity user must not be empty".into()));
        }

        config
            .pool
            .validate()
            .map_err(|e| common::Error::Config(e.message().to_owned()))?;

        resolve_password(&mut config.identity, "GATEWAY_PASSWORD")?;
        if let Some(admin) = config.admin.as_mut() {
            resolve_password(admin, "ADMIN_PASSWORD")?;
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("credential-gateway.toml")
    }
}

/// Env var takes precedence over file. An empty file yields no password.
fn resolve_password(identity: &mut IdentityConfig, env_var: &str) -> common::Result<()> {
    if let Ok(password) = std::env::var(env_var) {
        identity.password = Some(Secret::new(password));
    } else if let Some(ref password_file) = identity.password_file {
        let password = std::fs::read_to_string(password_file).map_err(|e| {
            common::Error::Config(format!(
                "failed to read password_file {}: {e}",
                password_file.display()
            ))
        })?;
        let password = password.trim().to_owned();
        if !password.is_empty() {
            identity.password = Some(Secret::new(password));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Serializes tests that mutate environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn clear_password_env() {
        unsafe {
            remove_env("GATEWAY_PASSWORD");
            remove_env("ADMIN_PASSWORD");
        }
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn valid_toml() -> &'static str {
        r#"
[gateway]
listen_addr = "127.0.0.1:8080"

[endpoint]
kind = "http"
url = "https://credentials.internal"
connect_string = "db.internal/XEPDB1"

[identity]
user = "scott"

[admin]
user = "sys"

[pool]
min = 1
max = 8
acquire_timeout_secs = 5
"#
    }

    #[test]
    fn test_load_valid_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_password_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.gateway.max_connections, 1000);
        assert_eq!(config.endpoint.kind, EndpointKind::Http);
        assert_eq!(config.endpoint.timeout_secs, 30);
        assert_eq!(config.endpoint.connect_string, "db.internal/XEPDB1");
        assert_eq!(config.identity.user, "scott");
        assert!(config.identity.password.is_none());
        assert_eq!(config.admin.as_ref().unwrap().user, "sys");
        assert_eq!(config.pool.min, 1);
        assert_eq!(config.pool.max, 8);
        assert_eq!(config.pool.acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.pool.keepalive_interval, Duration::from_secs(60));
        assert!(config.identity_store.is_none());
    }

    #[test]
    fn test_minimal_memory_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_password_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[gateway]
listen_addr = "127.0.0.1:8080"

[endpoint]
kind = "memory"

[identity]
user = "scott"
"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.endpoint.kind, EndpointKind::Memory);
        assert!(config.endpoint.url.is_none());
        assert!(config.admin.is_none());
        assert_eq!(config.pool.max, PoolConfig::default().max);
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        assert!(matches!(Config::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_passwords_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        unsafe {
            set_env("GATEWAY_PASSWORD", "tiger");
            set_env("ADMIN_PASSWORD", "manager");
        }
        let config = Config::load(&path).unwrap();
        clear_password_env();

        assert_eq!(config.identity.password.as_ref().unwrap().expose(), "tiger");
        assert_eq!(
            config.admin.unwrap().password.as_ref().unwrap().expose(),
            "manager"
        );
    }

    #[test]
    fn test_password_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_password_env();
        let dir = tempfile::tempdir().unwrap();
        let password_path = dir.path().join("password");
        std::fs::write(&password_path, "tiger\n").unwrap();

        let path = write_config(
            &dir,
            &format!(
                r#"
[gateway]
listen_addr = "127.0.0.1:8080"

[endpoint]
kind = "memory"

[identity]
user = "scott"
password_file = "{}"
"#,
                password_path.display()
            ),
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.identity.password.as_ref().unwrap().expose(), "tiger");
    }

    #[test]
    fn test_password_env_overrides_nonexistent_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[gateway]
listen_addr = "127.0.0.1:8080"

[endpoint]
kind = "memory"

[identity]
user = "scott"
password_file = "/nonexistent/path/password"
"#,
        );

        unsafe { set_env("GATEWAY_PASSWORD", "from-env") };
        let config = Config::load(&path).unwrap();
        clear_password_env();
        assert_eq!(
            config.identity.password.as_ref().unwrap().expose(),
            "from-env",
            "GATEWAY_PASSWORD must take precedence over password_file"
        );
    }

    #[test]
    fn test_password_file_nonexistent_returns_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_password_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[gateway]
listen_addr = "127.0.0.1:8080"

[endpoint]
kind = "memory"

[identity]
user = "scott"
password_file = "/nonexistent/path/password"
"#,
        );

        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_http_endpoint_requires_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_password_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[gateway]
listen_addr = "127.0.0.1:8080"

[endpoint]
kind = "http"

[identity]
user = "scott"
"#,
        );

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("url is required"), "got: {err}");
    }

    #[test]
    fn test_invalid_endpoint_url_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_password_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[gateway]
listen_addr = "127.0.0.1:8080"

[endpoint]
kind = "http"
url = "credentials.internal"

[identity]
user = "scott"
"#,
        );

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("must start with http"), "got: {err}");
    }

    #[test]
    fn test_unknown_endpoint_kind_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[gateway]
listen_addr = "127.0.0.1:8080"

[endpoint]
kind = "ldap"

[identity]
user = "scott"
"#,
        );

        assert!(matches!(Config::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_pool_bounds_validated() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_password_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[gateway]
listen_addr = "127.0.0.1:8080"

[endpoint]
kind = "memory"

[identity]
user = "scott"

[pool]
min = 5
max = 2
"#,
        );

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, common::Error::Config(_)));
        assert!(err.to_string().contains("must not exceed max"));
    }

    #[test]
    fn test_zero_limits_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_password_env();
        for (section, line) in [
            ("gateway", "max_connections = 0"),
            ("endpoint", "timeout_secs = 0"),
        ] {
            let dir = tempfile::tempdir().unwrap();
            let mut contents = String::from(
                r#"
[identity]
user = "scott"

[gateway]
listen_addr = "127.0.0.1:8080"
"#,
            );
            if section == "gateway" {
                contents.push_str(line);
                contents.push_str("\n\n[endpoint]\nkind = \"memory\"\n");
            } else {
                contents.push_str("\n[endpoint]\nkind = \"memory\"\n");
                contents.push_str(line);
                contents.push('\n');
            }
            let path = write_config(&dir, &contents);
            assert!(Config::load(&path).is_err(), "{line} must be rejected");
        }
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("credential-gateway.toml"));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(path, PathBuf::from("/cli/wins.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }
}
