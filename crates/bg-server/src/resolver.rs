//! Host name resolution
//!
//! The registry keys nodes by IP address, so hostnames supplied at
//! pre-registration are resolved first. Listings resolve the reverse
//! direction in the background to show node hostnames.

use std::io;
use std::net::IpAddr;

use async_trait::async_trait;

/// Forward and reverse name resolution
#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Resolve a hostname or IP literal to an IP address
    async fn resolve(&self, host: &str) -> io::Result<IpAddr>;

    /// Look up the hostname of an IP address
    async fn reverse(&self, ip: IpAddr) -> io::Result<String>;
}

/// Resolver backed by the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl AddressResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> io::Result<IpAddr> {
        let host = host.trim();
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip.to_canonical());
        }

        tokio::net::lookup_host((host, 0))
            .await?
            .next()
            .map(|addr| addr.ip().to_canonical())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("No address found for {}", host),
                )
            })
    }

    async fn reverse(&self, ip: IpAddr) -> io::Result<String> {
        tokio::task::spawn_blocking(move || reverse_lookup(ip))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }
}

#[cfg(unix)]
fn reverse_lookup(ip: IpAddr) -> io::Result<String> {
    use std::ffi::CStr;
    use std::mem;

    // NI_MAXHOST
    let mut host = [0 as libc::c_char; 1025];

    let rc = match ip {
        IpAddr::V4(v4) => {
            // SAFETY: sockaddr_in is plain old data, all-zero is a valid value.
            let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
            addr.sin_family = libc::AF_INET as libc::sa_family_t;
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
            {
                addr.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
            }
            addr.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.octets()),
            };
            // SAFETY: addr and host outlive the call and their sizes are passed along.
            unsafe {
                libc::getnameinfo(
                    &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    host.as_mut_ptr(),
                    host.len() as libc::socklen_t,
                    std::ptr::null_mut(),
                    0,
                    libc::NI_NAMEREQD,
                )
            }
        }
        IpAddr::V6(v6) => {
            // SAFETY: sockaddr_in6 is plain old data, all-zero is a valid value.
            let mut addr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
            addr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
            {
                addr.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
            }
            addr.sin6_addr = libc::in6_addr {
                s6_addr: v6.octets(),
            };
            // SAFETY: addr and host outlive the call and their sizes are passed along.
            unsafe {
                libc::getnameinfo(
                    &addr as *const libc::sockaddr_in6 as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                    host.as_mut_ptr(),
                    host.len() as libc::socklen_t,
                    std::ptr::null_mut(),
                    0,
                    libc::NI_NAMEREQD,
                )
            }
        }
    };

    if rc != 0 {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Reverse lookup of {} failed (code {})", ip, rc),
        ));
    }

    // SAFETY: getnameinfo succeeded, so host holds a NUL-terminated string.
    let name = unsafe { CStr::from_ptr(host.as_ptr()) };
    Ok(name.to_string_lossy().into_owned())
}

#[cfg(not(unix))]
fn reverse_lookup(ip: IpAddr) -> io::Result<String> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("Reverse lookup of {} is not supported on this platform", ip),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_ip_literal() {
        let ip = SystemResolver.resolve(" 10.1.2.3 ").await.unwrap();
        assert_eq!(ip, "10.1.2.3".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_mapped_ipv6_is_canonical() {
        let ip = SystemResolver.resolve("::ffff:10.1.2.3").await.unwrap();
        assert_eq!(ip, "10.1.2.3".parse::<IpAddr>().unwrap());
    }
}
