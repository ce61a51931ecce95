//! Engine configuration.
//!
//! `Config` performs no file or environment parsing — the embedding
//! application reads its own TOML/env/whatever and calls [`ConfigBuilder`].
//! Validation happens once, at [`crate::engine::Engine::start`].

use std::path::PathBuf;
use std::sync::Arc;

use rustls::ServerConfig;

use crate::error::{Error, Result};

/// Logging verbosity, mapped to [`log::LevelFilter`] by the logging
/// subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warning => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
        }
    }
}

/// Recognized engine configuration, built via [`ConfigBuilder`].
#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub is_secure: bool,
    pub ssl_cert_path: Option<PathBuf>,
    pub ssl_key_path: Option<PathBuf>,
    pub ssl_context: Option<Arc<ServerConfig>>,
    pub n_worker_threads: u32,
    pub conn_timeout_sec: u32,
    pub max_data_per_conn: u32,
    pub debug_log_file: Option<PathBuf>,
    pub debug_log_level: LogLevel,
    pub ipv6: bool,
    pub reuse_address: bool,
}

impl Config {
    /// Starts a builder with the established defaults: 5 workers, a 60 s
    /// idle timeout, a 10 MiB request cap.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Checks the combinations that are invalid on their face (e.g. a
    /// secure listener with no certificate material). Does not open files
    /// or sockets; that happens at `Listener::start`/`Engine::start`.
    pub fn validate(&self) -> Result<()> {
        if self.is_secure && self.ssl_context.is_none() {
            let cert_missing = self
                .ssl_cert_path
                .as_ref()
                .map(|p| p.as_os_str().is_empty())
                .unwrap_or(true);
            let key_missing = self
                .ssl_key_path
                .as_ref()
                .map(|p| p.as_os_str().is_empty())
                .unwrap_or(true);
            if cert_missing || key_missing {
                return Err(Error::InvalidConfig(
                    "is_secure requires ssl_context or both ssl_cert_path and ssl_key_path",
                ));
            }
        }
        if self.n_worker_threads == 0 {
            return Err(Error::InvalidConfig("n_worker_threads must be >= 1"));
        }
        if self.max_data_per_conn == 0 {
            return Err(Error::InvalidConfig("max_data_per_conn must be >= 1"));
        }
        Ok(())
    }
}

/// Builder for [`Config`]. Every setter takes `self` by value so calls chain.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    server_port: u16,
    is_secure: bool,
    ssl_cert_path: Option<PathBuf>,
    ssl_key_path: Option<PathBuf>,
    ssl_context: Option<Arc<ServerConfig>>,
    n_worker_threads: u32,
    conn_timeout_sec: u32,
    max_data_per_conn: u32,
    debug_log_file: Option<PathBuf>,
    debug_log_level: LogLevel,
    ipv6: bool,
    reuse_address: bool,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            server_port: 8080,
            is_secure: false,
            ssl_cert_path: None,
            ssl_key_path: None,
            ssl_context: None,
            n_worker_threads: 5,
            conn_timeout_sec: 60,
            max_data_per_conn: 10 * 1024 * 1024,
            debug_log_file: None,
            debug_log_level: LogLevel::Info,
            ipv6: false,
            reuse_address: true,
        }
    }
}

impl ConfigBuilder {
    pub fn server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    pub fn secure(mut self, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        self.is_secure = true;
        self.ssl_cert_path = Some(cert_path.into());
        self.ssl_key_path = Some(key_path.into());
        self
    }

    pub fn ssl_context(mut self, context: Arc<ServerConfig>) -> Self {
        self.is_secure = true;
        self.ssl_context = Some(context);
        self
    }

    pub fn n_worker_threads(mut self, n: u32) -> Self {
        self.n_worker_threads = n;
        self
    }

    pub fn conn_timeout_sec(mut self, secs: u32) -> Self {
        self.conn_timeout_sec = secs;
        self
    }

    pub fn max_data_per_conn(mut self, bytes: u32) -> Self {
        self.max_data_per_conn = bytes;
        self
    }

    pub fn debug_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.debug_log_file = Some(path.into());
        self
    }

    pub fn debug_log_level(mut self, level: LogLevel) -> Self {
        self.debug_log_level = level;
        self
    }

    pub fn ipv6(mut self, enabled: bool) -> Self {
        self.ipv6 = enabled;
        self
    }

    pub fn reuse_address(mut self, enabled: bool) -> Self {
        self.reuse_address = enabled;
        self
    }

    pub fn build(self) -> Config {
        Config {
            server_port: self.server_port,
            is_secure: self.is_secure,
            ssl_cert_path: self.ssl_cert_path,
            ssl_key_path: self.ssl_key_path,
            ssl_context: self.ssl_context,
            n_worker_threads: self.n_worker_threads,
            conn_timeout_sec: self.conn_timeout_sec,
            max_data_per_conn: self.max_data_per_conn,
            debug_log_file: self.debug_log_file,
            debug_log_level: self.debug_log_level,
            ipv6: self.ipv6,
            reuse_address: self.reuse_address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::builder().build();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn secure_without_material_rejected() {
        let config = Config::builder().server_port(8443).build();
        let config = Config {
            is_secure: true,
            ..config
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn secure_with_paths_accepted() {
        let config = Config::builder().secure("cert.pem", "key.pem").build();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_workers_rejected() {
        let config = Config::builder().n_worker_threads(0).build();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
