//! The listening socket's lifecycle: bind, optional `REUSE_ADDR`/`V6ONLY`,
//! non-blocking, listen.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

use mio::net::TcpListener as MioTcpListener;

use crate::config::Config;
use crate::descriptor;
use crate::error::{Error, Result};

const DEFAULT_BACKLOG: i32 = 5;

/// A bound, non-blocking, listening socket wrapped for `mio` registration.
pub struct Listener {
    pub inner: MioTcpListener,
}

impl Listener {
    /// Binds per `config.server_port`, in IPv4 or IPv6 per `config.ipv6`.
    /// Applies `SO_REUSEADDR` when `config.reuse_address`, and `IPV6_V6ONLY`
    /// unconditionally on the IPv6 path so dual-stack behavior stays
    /// explicit and portable. Fails with `InvalidConfig` if `is_secure` is
    /// set without certificate material or a prebuilt context.
    pub fn start(config: &Config) -> Result<Self> {
        config.validate()?;

        let addr = if config.ipv6 {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), config.server_port)
        } else {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.server_port)
        };

        let domain = if config.ipv6 {
            libc::AF_INET6
        } else {
            libc::AF_INET
        };

        let raw_fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
        if raw_fd < 0 {
            return Err(Error::SyscallFailed(std::io::Error::last_os_error()));
        }

        if config.ipv6 {
            if let Err(e) = descriptor::set_v6only(raw_fd) {
                unsafe { libc::close(raw_fd) };
                return Err(e);
            }
        }
        if config.reuse_address {
            if let Err(e) = descriptor::set_reuseaddr(raw_fd) {
                unsafe { libc::close(raw_fd) };
                return Err(e);
            }
        }

        if let Err(e) = bind_raw(raw_fd, &addr) {
            unsafe { libc::close(raw_fd) };
            return Err(e);
        }

        let listen_ret = unsafe { libc::listen(raw_fd, DEFAULT_BACKLOG) };
        if listen_ret < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(raw_fd) };
            return Err(Error::SyscallFailed(err));
        }

        if let Err(e) = descriptor::set_nonblocking(raw_fd) {
            unsafe { libc::close(raw_fd) };
            return Err(e);
        }

        // SAFETY: raw_fd was just created, bound, and listened on above, and
        // is handed over to std exclusively from here.
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(raw_fd) };
        let inner = MioTcpListener::from_std(std_listener);

        Ok(Self { inner })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

fn bind_raw(fd: RawFd, addr: &SocketAddr) -> Result<()> {
    let (raw_addr, len) = socket_addr_to_raw(addr);
    let ret = unsafe { libc::bind(fd, raw_addr.as_ptr() as *const libc::sockaddr, len) };
    if ret < 0 {
        return Err(Error::SyscallFailed(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Converts a `std::net::SocketAddr` into the raw bytes `bind(2)` wants,
/// without pulling in a sockaddr-conversion crate for two branches.
fn socket_addr_to_raw(addr: &SocketAddr) -> (Vec<u8>, libc::socklen_t) {
    match addr {
        SocketAddr::V4(v4) => {
            let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            sa.sin_family = libc::AF_INET as libc::sa_family_t;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    &sa as *const _ as *const u8,
                    std::mem::size_of::<libc::sockaddr_in>(),
                )
            }
            .to_vec();
            (bytes, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let mut sa: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_addr.s6_addr = v6.ip().octets();
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    &sa as *const _ as *const u8,
                    std::mem::size_of::<libc::sockaddr_in6>(),
                )
            }
            .to_vec();
            (
                bytes,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_ephemeral_ipv4_port() {
        let config = Config::builder().server_port(0).build();
        let listener = Listener::start(&config).expect("bind");
        let addr = listener.inner.local_addr().expect("local_addr");
        assert!(addr.port() > 0);
    }

    #[test]
    fn rejects_secure_without_material() {
        let config = Config::builder().build();
        let config = Config {
            is_secure: true,
            ..config
        };
        assert!(matches!(
            Listener::start(&config),
            Err(Error::InvalidConfig(_))
        ));
    }
}
