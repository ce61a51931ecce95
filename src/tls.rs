//! TLS adapter built on `rustls`: process-wide context init, per-connection
//! session creation, and a non-blocking handshake driver.

use std::fs::File;
use std::io::{self, BufReader};
use std::sync::{Arc, Mutex, OnceLock};

use rustls::{ServerConfig, ServerConnection};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::Config;
use crate::error::{Error, Result};

static SHARED_CONFIG: OnceLock<Arc<ServerConfig>> = OnceLock::new();
static INIT_COUNT: Mutex<u32> = Mutex::new(0);

/// Builds (or reuses) the process-wide `rustls::ServerConfig`. The first
/// secure listener in the process pays the cost of loading certificate
/// material; every later one, and every later call from this function,
/// reuses the same `Arc`. An app-supplied `ssl_context` always wins and
/// skips file-based init entirely.
pub fn init(config: &Config) -> Result<Arc<ServerConfig>> {
    let mut count = INIT_COUNT.lock().unwrap();

    if let Some(ctx) = &config.ssl_context {
        *count += 1;
        return Ok(ctx.clone());
    }

    if let Some(existing) = SHARED_CONFIG.get() {
        *count += 1;
        return Ok(existing.clone());
    }

    let cert_path = config
        .ssl_cert_path
        .as_ref()
        .ok_or(Error::InvalidConfig("missing ssl_cert_path"))?;
    let key_path = config
        .ssl_key_path
        .as_ref()
        .ok_or(Error::InvalidConfig("missing ssl_key_path"))?;

    let built = Arc::new(build_server_config(cert_path, key_path)?);
    // Another thread may have raced us here; `OnceLock::set` silently loses
    // that race, which is fine since both builds are equivalent.
    let _ = SHARED_CONFIG.set(built.clone());
    let installed = SHARED_CONFIG.get().unwrap().clone();
    *count += 1;
    Ok(installed)
}

/// Drops this listener's reference on the process-wide init counter. The
/// last secure listener to release leaves the counter at zero; the shared
/// `Arc<ServerConfig>` itself is reclaimed when its last clone drops.
pub fn release() {
    let mut count = INIT_COUNT.lock().unwrap();
    *count = count.saturating_sub(1);
}

fn build_server_config(
    cert_path: &std::path::Path,
    key_path: &std::path::Path,
) -> Result<ServerConfig> {
    let cert_file = File::open(cert_path).map_err(Error::SyscallFailed)?;
    let key_file = File::open(key_path).map_err(Error::SyscallFailed)?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::SyscallFailed(io::Error::new(io::ErrorKind::InvalidData, e))
        })?;

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| Error::SyscallFailed(io::Error::new(io::ErrorKind::InvalidData, e)))?
        .ok_or(Error::InvalidConfig("no private key found in ssl_key_path"))?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(Error::TlsError)
}

/// Creates a fresh per-connection TLS session.
pub fn new_session(shared: &Arc<ServerConfig>) -> Result<ServerConnection> {
    ServerConnection::new(shared.clone()).map_err(Error::TlsError)
}

/// Outcome of one round of the non-blocking handshake driver.
pub enum HandshakeProgress {
    /// Handshake completed this round.
    Complete,
    /// Handshake needs another I/O round; caller should re-arm and wait.
    Incomplete,
}

/// Drives a `ServerConnection`'s handshake as far as non-blocking I/O
/// allows: reads any pending TLS records, processes them, and writes any
/// records that resulted. Mirrors `SSL_accept`'s retry-on-`WANT_READ`/
/// `WANT_WRITE` loop, except here "retry" just means "come back on the next
/// readiness event" since everything is non-blocking.
pub fn drive_handshake(
    tls: &mut ServerConnection,
    stream: &mut mio::net::TcpStream,
) -> Result<HandshakeProgress> {
    loop {
        if tls.wants_read() {
            match tls.read_tls(stream) {
                Ok(0) => {
                    return Err(Error::TlsAcceptFailed(rustls::Error::General(
                        "peer closed during handshake".into(),
                    )))
                }
                Ok(_) => {
                    if let Err(e) = tls.process_new_packets() {
                        return Err(Error::TlsAcceptFailed(e));
                    }
                }
                Err(e) if Error::is_transient_io(&e) => break,
                Err(e) => return Err(Error::SyscallFailed(e)),
            }
        } else if tls.wants_write() {
            match tls.write_tls(stream) {
                Ok(_) => {}
                Err(e) if Error::is_transient_io(&e) => break,
                Err(e) => return Err(Error::SyscallFailed(e)),
            }
        } else {
            break;
        }
    }

    if tls.is_handshaking() {
        Ok(HandshakeProgress::Incomplete)
    } else {
        Ok(HandshakeProgress::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_rejects_secure_config_without_material() {
        let config = Config::builder().build();
        let config = Config {
            is_secure: true,
            ..config
        };
        assert!(matches!(init(&config), Err(Error::InvalidConfig(_))));
    }
}
