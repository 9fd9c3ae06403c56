//! Immutable jail parameters, resolved once at startup.

use crate::error::{JailError, Result};
use log::info;
use nix::sched::CloneFlags;
use nix::sys::personality::Persona;
use nix::sys::resource::{getrlimit, Resource};
use nix::unistd::{Gid, Uid};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

const MEGABYTE: u64 = 1024 * 1024;

/// Execution mode of the supervisor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    /// Accept TCP connections and run one jailed child per connection.
    ListenTcp,
    /// Run a single jailed child against the inherited stdio, then exit.
    StandaloneOnce,
    /// Run jailed children against the inherited stdio, forever.
    StandaloneRerun,
}

impl Mode {
    pub fn is_listen(self) -> bool {
        self == Mode::ListenTcp
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::ListenTcp => write!(f, "LISTEN_TCP"),
            Mode::StandaloneOnce => write!(f, "STANDALONE_ONCE"),
            Mode::StandaloneRerun => write!(f, "STANDALONE_RERUN"),
        }
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
///
/// Hex is accepted only with an explicit `0x`/`0X` prefix; a stray `x`
/// anywhere else is rejected.
pub fn parse_number(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// A resource limit as given on the command line, before resolution.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RlimitSpec {
    /// Absolute value, scaled by the per-resource unit.
    Val(u64),
    /// The hard limit in effect at supervisor start.
    Max,
    /// The soft limit in effect at supervisor start.
    Def,
}

impl FromStr for RlimitSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("max") {
            return Ok(RlimitSpec::Max);
        }
        if s.eq_ignore_ascii_case("def") {
            return Ok(RlimitSpec::Def);
        }
        parse_number(s)
            .map(RlimitSpec::Val)
            .ok_or_else(|| format!("expected a number, 'max' or 'def', got '{}'", s))
    }
}

impl RlimitSpec {
    /// Resolve against the limits currently in effect for this process.
    pub fn resolve(self, resource: Resource) -> Result<u64> {
        let (soft, hard) = getrlimit(resource).map_err(|e| {
            JailError::ResourceLimit(format!("getrlimit({:?}): {}", resource, e))
        })?;
        Ok(match self {
            RlimitSpec::Val(n) => n.saturating_mul(unit_for(resource)),
            RlimitSpec::Max => hard,
            RlimitSpec::Def => soft,
        })
    }
}

/// Scaling unit applied to numeric rlimit values. Byte-sized limits are
/// given in megabytes on the command line; count-sized limits are taken
/// verbatim.
fn unit_for(resource: Resource) -> u64 {
    match resource {
        Resource::RLIMIT_AS
        | Resource::RLIMIT_CORE
        | Resource::RLIMIT_FSIZE
        | Resource::RLIMIT_STACK => MEGABYTE,
        _ => 1,
    }
}

/// The seven limits applied to every jailed child, fully resolved to the
/// values handed to setrlimit (soft = hard).
#[derive(Clone, Copy, Debug)]
pub struct ResourceLimits {
    pub addr_space: u64,
    pub core: u64,
    pub cpu: u64,
    pub fsize: u64,
    pub nofile: u64,
    pub nproc: u64,
    pub stack: u64,
}

/// Jail parameters. Built once by the CLI layer and never mutated; the
/// cloned child reads only from this and a handful of descriptors.
#[derive(Clone, Debug)]
pub struct JailConfig {
    pub mode: Mode,
    pub chroot: String,
    pub hostname: String,
    /// Command and arguments executed inside the jail. Never empty.
    pub argv: Vec<String>,
    pub keep_env: bool,

    /// Identity the child switches to.
    pub uid: Uid,
    pub gid: Gid,
    /// Identity of the supervisor at startup, the outer side of the
    /// uid_map/gid_map entries written inside a user namespace.
    pub outer_uid: Uid,
    pub outer_gid: Gid,

    pub port: u16,
    pub max_conns_per_ip: u32,
    /// Per-child wall-clock limit in seconds, 0 for unlimited.
    pub tlimit: u64,

    pub daemonize: bool,
    pub verbose: bool,
    pub keep_caps: bool,
    pub is_root_rw: bool,
    pub is_silent: bool,

    pub clone_newnet: bool,
    pub clone_newuser: bool,
    pub clone_newns: bool,
    pub clone_newpid: bool,
    pub clone_newipc: bool,
    pub clone_newuts: bool,

    pub apply_sandbox: bool,
    pub personality: Persona,
    pub rlimits: ResourceLimits,

    pub iface_macvtap: Option<String>,
    pub iface_macvlan: Option<String>,
    pub bind_mounts: Vec<String>,
    pub tmpfs_mounts: Vec<String>,

    pub logfile: Option<PathBuf>,
}

impl JailConfig {
    /// Namespace flags requested for the child. The supervisor ORs these
    /// with SIGCHLD when cloning.
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.clone_newnet {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.clone_newuser {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if self.clone_newns {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.clone_newpid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.clone_newipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.clone_newuts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        flags
    }

    /// Log the effective jail parameters at startup.
    pub fn log_params(&self) {
        info!("mode: {}", self.mode);
        info!(
            "jail parameters: hostname:'{}', chroot:'{}', command:'{}', port:{}, \
             max_conns_per_ip:{}, uid:{}, gid:{}, time_limit:{}, personality:{:#x}, \
             daemonize:{}, clone_newnet:{}, clone_newuser:{}, clone_newns:{}, \
             clone_newpid:{}, clone_newipc:{}, clone_newuts:{}, apply_sandbox:{}, \
             keep_caps:{}",
            self.hostname,
            self.chroot,
            self.argv[0],
            self.port,
            self.max_conns_per_ip,
            self.uid,
            self.gid,
            self.tlimit,
            self.personality.bits(),
            self.daemonize,
            self.clone_newnet,
            self.clone_newuser,
            self.clone_newns,
            self.clone_newpid,
            self.clone_newipc,
            self.clone_newuts,
            self.apply_sandbox,
            self.keep_caps,
        );
        for pt in &self.bind_mounts {
            info!("additional bind mount point: '{}'", pt);
        }
        for pt in &self.tmpfs_mounts {
            info!("additional tmpfs mount point: '{}'", pt);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn test_parse_number_decimal_and_hex() {
        assert_eq!(parse_number("0"), Some(0));
        assert_eq!(parse_number("1234"), Some(1234));
        assert_eq!(parse_number("0x10"), Some(16));
        assert_eq!(parse_number("0X1f"), Some(31));
    }

    #[test]
    fn test_parse_number_rejects_stray_x() {
        // The original tool accepted 'x' anywhere in the string; here hex
        // requires the 0x prefix.
        assert_eq!(parse_number("1x0"), None);
        assert_eq!(parse_number("x10"), None);
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("max"), None);
    }

    #[test]
    fn test_rlimit_spec_from_str() {
        assert_eq!("max".parse::<RlimitSpec>(), Ok(RlimitSpec::Max));
        assert_eq!("MAX".parse::<RlimitSpec>(), Ok(RlimitSpec::Max));
        assert_eq!("def".parse::<RlimitSpec>(), Ok(RlimitSpec::Def));
        assert_eq!("16".parse::<RlimitSpec>(), Ok(RlimitSpec::Val(16)));
        assert_eq!("0x20".parse::<RlimitSpec>(), Ok(RlimitSpec::Val(32)));
        assert!("lots".parse::<RlimitSpec>().is_err());
    }

    #[test]
    fn test_rlimit_resolution_scales_byte_resources() {
        let v = RlimitSpec::Val(16).resolve(Resource::RLIMIT_AS).unwrap();
        assert_eq!(v, 16 * MEGABYTE);

        let v = RlimitSpec::Val(16).resolve(Resource::RLIMIT_NOFILE).unwrap();
        assert_eq!(v, 16);
    }

    #[test]
    fn test_rlimit_resolution_def_and_max_snapshot_current_limits() {
        let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
        assert_eq!(
            RlimitSpec::Def.resolve(Resource::RLIMIT_NOFILE).unwrap(),
            soft
        );
        assert_eq!(
            RlimitSpec::Max.resolve(Resource::RLIMIT_NOFILE).unwrap(),
            hard
        );
    }

    #[test]
    fn test_personality_bits_compose_by_or() {
        let mask = Persona::ADDR_NO_RANDOMIZE | Persona::MMAP_PAGE_ZERO;
        assert!(mask.contains(Persona::ADDR_NO_RANDOMIZE));
        assert!(mask.contains(Persona::MMAP_PAGE_ZERO));
        assert_eq!(
            mask.bits(),
            Persona::ADDR_NO_RANDOMIZE.bits() | Persona::MMAP_PAGE_ZERO.bits()
        );
    }

    #[test]
    fn test_clone_flags_follow_namespace_toggles() {
        let mut cfg = test_config();
        cfg.clone_newnet = false;
        cfg.clone_newpid = false;
        let flags = cfg.clone_flags();
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(!flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
    }

    pub(crate) fn test_config() -> JailConfig {
        JailConfig {
            mode: Mode::StandaloneOnce,
            chroot: "/chroot".to_string(),
            hostname: "NSJAIL".to_string(),
            argv: vec!["/bin/true".to_string()],
            keep_env: false,
            uid: nix::unistd::getuid(),
            gid: nix::unistd::getgid(),
            outer_uid: nix::unistd::getuid(),
            outer_gid: nix::unistd::getgid(),
            port: 31337,
            max_conns_per_ip: 0,
            tlimit: 600,
            daemonize: false,
            verbose: false,
            keep_caps: false,
            is_root_rw: false,
            is_silent: false,
            clone_newnet: true,
            clone_newuser: true,
            clone_newns: true,
            clone_newpid: true,
            clone_newipc: true,
            clone_newuts: true,
            apply_sandbox: true,
            personality: Persona::empty(),
            rlimits: ResourceLimits {
                addr_space: 512 * MEGABYTE,
                core: 0,
                cpu: 600,
                fsize: MEGABYTE,
                nofile: 32,
                nproc: 1024,
                stack: 8 * MEGABYTE,
            },
            iface_macvtap: None,
            iface_macvlan: None,
            bind_mounts: Vec::new(),
            tmpfs_mounts: Vec::new(),
            logfile: None,
        }
    }
}
