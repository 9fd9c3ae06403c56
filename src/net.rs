//! IPv6 listener and connection/address plumbing.

use crate::error::{JailError, Result};
use log::{error, info, warn};
use std::io;
use std::mem;
use std::net::Ipv6Addr;
use std::os::unix::io::RawFd;

/// Address text used when stdio is not a socket (standalone modes).
pub const STANDALONE_TXT: &str = "[STANDALONE_MODE]";

fn last_err() -> io::Error {
    io::Error::last_os_error()
}

/// Open, bind and start listening on the IPv6 wildcard address. Fatal on
/// failure: without the listen socket there is nothing to serve.
pub fn bind_and_listen(port: u16) -> Result<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_INET6, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(JailError::Net(format!("socket(AF_INET6): {}", last_err())));
    }

    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            mem::size_of_val(&one) as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(JailError::Net(format!(
            "setsockopt({}, SO_REUSEADDR): {}",
            fd,
            last_err()
        )));
    }

    let mut addr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
    addr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    addr.sin6_port = port.to_be();
    // sin6_addr stays zeroed: in6addr_any

    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(JailError::Net(format!("bind(port:{}): {}", port, last_err())));
    }

    if unsafe { libc::listen(fd, libc::SOMAXCONN) } == -1 {
        return Err(JailError::Net(format!(
            "listen({}): {}",
            libc::SOMAXCONN,
            last_err()
        )));
    }

    let (_, txt) = conn_to_text(fd, false);
    info!("listening on {}", txt);

    Ok(fd)
}

/// Block until the next connection. Returns `None` both for EINTR, so the
/// caller can service signals, and for other accept failures, which are
/// logged; either way the supervisor loop continues.
pub fn accept_conn(listen_fd: RawFd) -> Option<RawFd> {
    let connfd =
        unsafe { libc::accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
    if connfd < 0 {
        let err = last_err();
        if err.raw_os_error() != Some(libc::EINTR) {
            error!("accept({}): {}", listen_fd, err);
        }
        return None;
    }

    let (_, remote) = conn_to_text(connfd, true);
    let (_, local) = conn_to_text(connfd, false);
    info!("new connection from: {} on: {}", remote, local);

    // cork outgoing writes; purely an optimization, so failure only warns
    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            connfd,
            libc::SOL_TCP,
            libc::TCP_CORK,
            &one as *const _ as *const libc::c_void,
            mem::size_of_val(&one) as libc::socklen_t,
        )
    };
    if rc == -1 {
        warn!("setsockopt({}, TCP_CORK): {}", connfd, last_err());
    }

    Some(connfd)
}

fn is_socket(fd: RawFd) -> bool {
    let mut opt: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            &mut opt as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    rc == 0
}

/// Resolve a descriptor to its peer (or local) endpoint: the raw 16-byte
/// IPv6 address plus a printable "addr:port". Non-socket descriptors yield
/// the standalone sentinel and a zeroed address, which is what the roster
/// stores for console-driven jails.
pub fn conn_to_text(fd: RawFd, remote: bool) -> ([u8; 16], String) {
    if !is_socket(fd) {
        return ([0; 16], STANDALONE_TXT.to_string());
    }

    let mut addr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    let rc = if remote {
        unsafe { libc::getpeername(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len) }
    } else {
        unsafe { libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len) }
    };
    if rc == -1 {
        warn!(
            "{}({}): {}",
            if remote { "getpeername" } else { "getsockname" },
            fd,
            last_err()
        );
        return ([0; 16], "[unknown]".to_string());
    }

    let octets = addr.sin6_addr.s6_addr;
    let ip = Ipv6Addr::from(octets);
    (octets, format!("{}:{}", ip, u16::from_be(addr.sin6_port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_socket_fd_resolves_to_standalone_sentinel() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) }, 0);

        let (addr, txt) = conn_to_text(fds[0], true);
        assert_eq!(addr, [0; 16]);
        assert_eq!(txt, STANDALONE_TXT);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_bind_and_listen_reports_local_endpoint() {
        // port 0 lets the kernel pick a free port; the CLI layer forbids it
        // but the listener itself does not care
        let fd = bind_and_listen(0).expect("bind on an ephemeral port");

        let (addr, txt) = conn_to_text(fd, false);
        assert_eq!(addr, [0; 16], "wildcard bind address is all zeroes");
        assert!(txt.starts_with("::"), "unexpected endpoint text: {}", txt);
        let port: u16 = txt.rsplit(':').next().unwrap().parse().unwrap();
        assert!(port > 0);

        unsafe { libc::close(fd) };
    }
}
