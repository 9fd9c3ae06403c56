//! Parent-side creation of a virtual interface inside the child's network
//! namespace, over raw rtnetlink.
//!
//! A single RTM_NEWLINK request carries the device name, the master
//! interface index, the target namespace pid and the link kind; the kernel
//! acks with an NLMSG_ERROR frame whose code 0 means success.

use crate::config::JailConfig;
use crate::error::{JailError, Result};
use log::{error, info};
use nix::unistd::Pid;
use std::ffi::CString;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;

// rtnetlink attribute types not exposed by libc
const IFLA_IFNAME: u16 = 3;
const IFLA_LINK: u16 = 5;
const IFLA_LINKINFO: u16 = 18;
const IFLA_NET_NS_PID: u16 = 19;
const IFLA_INFO_KIND: u16 = 1;

const NLMSG_HDRLEN: usize = 16;
const IFINFOMSG_LEN: usize = 16;

/// Kind of virtual link cloned off a host interface.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkKind {
    MacVtap,
    MacVlan,
}

impl LinkKind {
    /// Interface name the link gets inside the jail.
    pub fn device_name(self) -> &'static str {
        match self {
            LinkKind::MacVtap => "vt0",
            LinkKind::MacVlan => "vl0",
        }
    }

    fn kind_str(self) -> &'static str {
        match self {
            LinkKind::MacVtap => "macvtap",
            LinkKind::MacVlan => "macvlan",
        }
    }
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

struct MsgBuilder {
    buf: Vec<u8>,
}

impl MsgBuilder {
    /// Start an rtnetlink message: netlink header plus a zeroed ifinfomsg
    /// (AF_UNSPEC, no index; the attributes carry everything).
    fn new_link_request() -> Self {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_len, fixed up later
        buf.extend_from_slice(&(libc::RTM_NEWLINK as u16).to_ne_bytes());
        let flags = (libc::NLM_F_REQUEST | libc::NLM_F_CREATE | libc::NLM_F_EXCL | libc::NLM_F_ACK)
            as u16;
        buf.extend_from_slice(&flags.to_ne_bytes());
        buf.extend_from_slice(&1u32.to_ne_bytes()); // nlmsg_seq
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_pid
        buf.resize(NLMSG_HDRLEN + IFINFOMSG_LEN, 0);
        MsgBuilder { buf }
    }

    fn push_attr(&mut self, atype: u16, payload: &[u8]) {
        let len = 4 + payload.len();
        self.buf.extend_from_slice(&(len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&atype.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.buf.resize(align4(self.buf.len()), 0);
    }

    /// Open a nested attribute; the returned offset closes it.
    fn begin_nested(&mut self, atype: u16) -> usize {
        let offset = self.buf.len();
        self.buf.extend_from_slice(&0u16.to_ne_bytes()); // length, fixed up
        self.buf.extend_from_slice(&atype.to_ne_bytes());
        offset
    }

    fn end_nested(&mut self, offset: usize) {
        let len = (self.buf.len() - offset) as u16;
        self.buf[offset..offset + 2].copy_from_slice(&len.to_ne_bytes());
    }

    fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}

fn build_newlink_request(kind: LinkKind, master_index: u32, ns_pid: Pid) -> Vec<u8> {
    let mut msg = MsgBuilder::new_link_request();

    let mut name = kind.device_name().as_bytes().to_vec();
    name.push(0);
    msg.push_attr(IFLA_IFNAME, &name);
    msg.push_attr(IFLA_LINK, &master_index.to_ne_bytes());
    msg.push_attr(IFLA_NET_NS_PID, &(ns_pid.as_raw() as u32).to_ne_bytes());

    let nested = msg.begin_nested(IFLA_LINKINFO);
    let mut kind_bytes = kind.kind_str().as_bytes().to_vec();
    kind_bytes.push(0);
    msg.push_attr(IFLA_INFO_KIND, &kind_bytes);
    msg.end_nested(nested);

    msg.finish()
}

struct NlSocket(RawFd);

impl NlSocket {
    fn route() -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_ROUTE,
            )
        };
        if fd < 0 {
            return Err(JailError::Net(format!(
                "socket(AF_NETLINK, NETLINK_ROUTE): {}",
                io::Error::last_os_error()
            )));
        }
        Ok(NlSocket(fd))
    }

    fn send(&self, msg: &[u8]) -> Result<()> {
        let mut dst: libc::sockaddr_nl = unsafe { mem::zeroed() };
        dst.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let rc = unsafe {
            libc::sendto(
                self.0,
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
                &dst as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(JailError::Net(format!(
                "sendto(netlink): {}",
                io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Read the kernel's reply to an NLM_F_ACK request and turn a negative
    /// error code into the corresponding errno.
    fn recv_ack(&self) -> Result<()> {
        let mut buf = [0u8; 4096];
        let n = unsafe { libc::recv(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            return Err(JailError::Net(format!(
                "recv(netlink): {}",
                io::Error::last_os_error()
            )));
        }
        let n = n as usize;
        if n < NLMSG_HDRLEN + 4 {
            return Err(JailError::Net(format!("short netlink reply: {} bytes", n)));
        }
        let msg_type = u16::from_ne_bytes([buf[4], buf[5]]);
        if i32::from(msg_type) != libc::NLMSG_ERROR {
            return Err(JailError::Net(format!(
                "unexpected netlink reply type {:#x}",
                msg_type
            )));
        }
        let code = i32::from_ne_bytes([
            buf[NLMSG_HDRLEN],
            buf[NLMSG_HDRLEN + 1],
            buf[NLMSG_HDRLEN + 2],
            buf[NLMSG_HDRLEN + 3],
        ]);
        if code != 0 {
            return Err(JailError::Net(format!(
                "netlink: {}",
                nix::errno::Errno::from_raw(-code)
            )));
        }
        Ok(())
    }
}

impl Drop for NlSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

/// Create a virtual link of the given kind whose master is `src_iface` and
/// move it into the network namespace of `ns_pid`.
pub fn attach(kind: LinkKind, src_iface: &str, ns_pid: Pid) -> Result<()> {
    let c_iface = CString::new(src_iface)
        .map_err(|_| JailError::Net(format!("interface name contains NUL: '{}'", src_iface)))?;
    let master_index = unsafe { libc::if_nametoindex(c_iface.as_ptr()) };
    if master_index == 0 {
        return Err(JailError::Net(format!("no such interface: '{}'", src_iface)));
    }

    let sock = NlSocket::route()?;
    sock.send(&build_newlink_request(kind, master_index, ns_pid))?;
    sock.recv_ack()?;

    info!(
        "created {} link '{}' (master '{}') in namespace of pid {}",
        kind.kind_str(),
        kind.device_name(),
        src_iface,
        ns_pid
    );
    Ok(())
}

/// Attach every configured virtual interface to the child's namespace.
pub fn attach_interfaces(cfg: &JailConfig, ns_pid: Pid) -> Result<()> {
    if let Some(iface) = &cfg.iface_macvtap {
        if let Err(e) = attach(LinkKind::MacVtap, iface, ns_pid) {
            error!("couldn't set up the macvtap interface: {}", e);
            return Err(e);
        }
    }
    if let Some(iface) = &cfg.iface_macvlan {
        if let Err(e) = attach(LinkKind::MacVlan, iface, ns_pid) {
            error!("couldn't set up the macvlan interface: {}", e);
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Yield (type, payload) for each top-level attribute in `buf`.
    fn attrs(buf: &[u8]) -> Vec<(u16, Vec<u8>)> {
        let mut out = Vec::new();
        let mut at = NLMSG_HDRLEN + IFINFOMSG_LEN;
        while at + 4 <= buf.len() {
            let len = u16::from_ne_bytes([buf[at], buf[at + 1]]) as usize;
            let atype = u16::from_ne_bytes([buf[at + 2], buf[at + 3]]);
            out.push((atype, buf[at + 4..at + len].to_vec()));
            at += align4(len);
        }
        out
    }

    #[test]
    fn test_request_layout() {
        let msg = build_newlink_request(LinkKind::MacVlan, 4, Pid::from_raw(1234));

        assert_eq!(msg.len() % 4, 0);
        let len = u32::from_ne_bytes([msg[0], msg[1], msg[2], msg[3]]);
        assert_eq!(len as usize, msg.len());
        let msg_type = u16::from_ne_bytes([msg[4], msg[5]]);
        assert_eq!(msg_type, libc::RTM_NEWLINK as u16);
    }

    #[test]
    fn test_request_attributes() {
        let msg = build_newlink_request(LinkKind::MacVtap, 7, Pid::from_raw(4321));
        let parsed = attrs(&msg);

        let name = parsed.iter().find(|(t, _)| *t == IFLA_IFNAME).unwrap();
        assert_eq!(name.1, b"vt0\0");

        let master = parsed.iter().find(|(t, _)| *t == IFLA_LINK).unwrap();
        assert_eq!(master.1, 7u32.to_ne_bytes());

        let pid = parsed.iter().find(|(t, _)| *t == IFLA_NET_NS_PID).unwrap();
        assert_eq!(pid.1, 4321u32.to_ne_bytes());

        let info = parsed.iter().find(|(t, _)| *t == IFLA_LINKINFO).unwrap();
        // nested attribute: IFLA_INFO_KIND carrying the kind string
        let kind_len = u16::from_ne_bytes([info.1[0], info.1[1]]) as usize;
        let kind_type = u16::from_ne_bytes([info.1[2], info.1[3]]);
        assert_eq!(kind_type, IFLA_INFO_KIND);
        assert_eq!(&info.1[4..kind_len], b"macvtap\0");
    }

    #[test]
    fn test_attach_unknown_interface_fails_cleanly() {
        let err = attach(LinkKind::MacVlan, "nosuchiface0", Pid::from_raw(1)).unwrap_err();
        assert!(err.to_string().contains("nosuchiface0"));
    }
}
