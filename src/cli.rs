//! Command-line surface and its resolution into a [`JailConfig`].

use crate::config::{parse_number, JailConfig, Mode, ResourceLimits, RlimitSpec};
use crate::error::{JailError, Result};
use clap::{ArgAction, Parser};
use nix::sys::personality::Persona;
use nix::sys::resource::Resource;
use nix::unistd::{getgid, getuid, Gid, Group, Uid, User};
use std::path::PathBuf;

fn parse_mode(s: &str) -> std::result::Result<Mode, String> {
    match s {
        "l" => Ok(Mode::ListenTcp),
        "o" => Ok(Mode::StandaloneOnce),
        "r" => Ok(Mode::StandaloneRerun),
        _ => Err(format!("'{}' is not one of 'l', 'o', 'r'", s)),
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "warden",
    about = "Process jail: runs a command inside fresh Linux namespaces, \
             optionally serving one jail per TCP connection",
    disable_help_flag = true
)]
pub struct Args {
    /// Print help
    #[arg(short = 'h', long = "help", short_alias = '?', action = ArgAction::Help)]
    help: Option<bool>,

    /// Execution mode: 'l' listen on a TCP port, 'o' launch once on the
    /// console, 'r' launch on the console and keep doing it forever
    #[arg(short = 'M', long = "mode", default_value = "l", value_parser = parse_mode)]
    pub mode: Mode,

    /// Directory containing / of the jail
    #[arg(short = 'c', long = "chroot", default_value = "/chroot")]
    pub chroot: String,

    /// User name or uid of processes inside the jail
    #[arg(short = 'u', long = "user", default_value = "nobody")]
    pub user: String,

    /// Group name or gid of processes inside the jail
    #[arg(short = 'g', long = "group", default_value = "nobody")]
    pub group: String,

    /// UTS name (hostname) of the jail
    #[arg(short = 'H', long = "hostname", default_value = "NSJAIL")]
    pub hostname: String,

    /// TCP port to bind to (listen mode only)
    #[arg(short = 'p', long = "port", default_value_t = 31337,
          value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    /// Maximum number of concurrent connections per remote IP (0 = unlimited)
    #[arg(short = 'i', long = "max_conns_per_ip", default_value_t = 0)]
    pub max_conns_per_ip: u32,

    /// Log file (default: stderr)
    #[arg(short = 'l', long = "log", value_name = "FILE")]
    pub log: Option<PathBuf>,

    /// Maximum time a jail may exist, in seconds (0 = unlimited)
    #[arg(short = 't', long = "time_limit", default_value_t = 600)]
    pub time_limit: u64,

    /// Daemonize after start
    #[arg(short = 'd', long = "daemon")]
    pub daemon: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Pass all environment variables to the child
    #[arg(short = 'e', long = "keep_env")]
    pub keep_env: bool,

    /// Don't drop capabilities inside the jail (DANGEROUS)
    #[arg(long = "keep_caps")]
    pub keep_caps: bool,

    /// RLIMIT_AS in MB, 'max' for the hard limit, 'def' for the current soft limit
    #[arg(long = "rlimit_as", default_value = "512")]
    pub rlimit_as: RlimitSpec,

    /// RLIMIT_CORE in MB, 'max' or 'def'
    #[arg(long = "rlimit_core", default_value = "0")]
    pub rlimit_core: RlimitSpec,

    /// RLIMIT_CPU in seconds, 'max' or 'def'
    #[arg(long = "rlimit_cpu", default_value = "600")]
    pub rlimit_cpu: RlimitSpec,

    /// RLIMIT_FSIZE in MB, 'max' or 'def'
    #[arg(long = "rlimit_fsize", default_value = "1")]
    pub rlimit_fsize: RlimitSpec,

    /// RLIMIT_NOFILE, 'max' or 'def'
    #[arg(long = "rlimit_nofile", default_value = "32")]
    pub rlimit_nofile: RlimitSpec,

    /// RLIMIT_NPROC, 'max' or 'def'
    #[arg(long = "rlimit_nproc", default_value = "def")]
    pub rlimit_nproc: RlimitSpec,

    /// RLIMIT_STACK in MB, 'max' or 'def'
    #[arg(long = "rlimit_stack", default_value = "def")]
    pub rlimit_stack: RlimitSpec,

    /// personality(ADDR_COMPAT_LAYOUT)
    #[arg(long = "persona_addr_compat_layout")]
    pub persona_addr_compat_layout: bool,

    /// personality(MMAP_PAGE_ZERO)
    #[arg(long = "persona_mmap_page_zero")]
    pub persona_mmap_page_zero: bool,

    /// personality(READ_IMPLIES_EXEC)
    #[arg(long = "persona_read_implies_exec")]
    pub persona_read_implies_exec: bool,

    /// personality(ADDR_LIMIT_3GB)
    #[arg(long = "persona_addr_limit_3gb")]
    pub persona_addr_limit_3gb: bool,

    /// personality(ADDR_NO_RANDOMIZE)
    #[arg(long = "persona_addr_no_randomize")]
    pub persona_addr_no_randomize: bool,

    /// Don't use CLONE_NEWNET (enables networking inside the jail)
    #[arg(short = 'N', long = "disable_clone_newnet")]
    pub disable_clone_newnet: bool,

    /// Don't use CLONE_NEWUSER
    #[arg(long = "disable_clone_newuser")]
    pub disable_clone_newuser: bool,

    /// Don't use CLONE_NEWNS
    #[arg(long = "disable_clone_newns")]
    pub disable_clone_newns: bool,

    /// Don't use CLONE_NEWPID
    #[arg(long = "disable_clone_newpid")]
    pub disable_clone_newpid: bool,

    /// Don't use CLONE_NEWIPC
    #[arg(long = "disable_clone_newipc")]
    pub disable_clone_newipc: bool,

    /// Don't use CLONE_NEWUTS
    #[arg(long = "disable_clone_newuts")]
    pub disable_clone_newuts: bool,

    /// Don't install the seccomp-bpf filter
    #[arg(long = "disable_sandbox")]
    pub disable_sandbox: bool,

    /// Mount / as read-write (default: read-only)
    #[arg(long = "rw")]
    pub rw: bool,

    /// Redirect the child's fd 0/1/2 to /dev/null
    #[arg(long = "silent")]
    pub silent: bool,

    /// Mount point to be bind-mounted inside the jail; may be given
    /// multiple times
    #[arg(short = 'B', long = "bindmount", value_name = "PATH")]
    pub bindmount: Vec<String>,

    /// Mount point for a fresh tmpfs inside the jail; may be given
    /// multiple times
    #[arg(short = 'T', long = "tmpfsmount", value_name = "PATH")]
    pub tmpfsmount: Vec<String>,

    /// Host interface cloned as MACVTAP and moved into the jail as vt0
    #[arg(long = "net_macvtap", value_name = "IFACE")]
    pub net_macvtap: Option<String>,

    /// Host interface cloned as MACVLAN and moved into the jail as vl0
    #[arg(long = "net_macvlan", value_name = "IFACE")]
    pub net_macvlan: Option<String>,

    /// Command to execute inside the jail, after '--'
    #[arg(last = true, required = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

fn resolve_user(name: &str) -> Result<Uid> {
    if let Ok(Some(user)) = User::from_name(name) {
        return Ok(user.uid);
    }
    match parse_number(name) {
        Some(n) if n <= u64::from(u32::MAX) => Ok(Uid::from_raw(n as u32)),
        _ => Err(JailError::Config(format!("no such user: '{}'", name))),
    }
}

fn resolve_group(name: &str) -> Result<Gid> {
    if let Ok(Some(group)) = Group::from_name(name) {
        return Ok(group.gid);
    }
    match parse_number(name) {
        Some(n) if n <= u64::from(u32::MAX) => Ok(Gid::from_raw(n as u32)),
        _ => Err(JailError::Config(format!("no such group: '{}'", name))),
    }
}

fn personality_mask(args: &Args) -> Persona {
    let mut persona = Persona::empty();
    if args.persona_addr_compat_layout {
        persona |= Persona::ADDR_COMPAT_LAYOUT;
    }
    if args.persona_mmap_page_zero {
        persona |= Persona::MMAP_PAGE_ZERO;
    }
    if args.persona_read_implies_exec {
        persona |= Persona::READ_IMPLIES_EXEC;
    }
    if args.persona_addr_limit_3gb {
        persona |= Persona::ADDR_LIMIT_3GB;
    }
    if args.persona_addr_no_randomize {
        persona |= Persona::ADDR_NO_RANDOMIZE;
    }
    persona
}

/// Turn parsed arguments into the immutable jail configuration. Resolves
/// uid/gid and snapshots the rlimit base values, so 'def' and 'max' refer
/// to the limits in effect right here.
pub fn resolve(args: Args) -> Result<JailConfig> {
    let uid = resolve_user(&args.user)?;
    let gid = resolve_group(&args.group)?;

    let rlimits = ResourceLimits {
        addr_space: args.rlimit_as.resolve(Resource::RLIMIT_AS)?,
        core: args.rlimit_core.resolve(Resource::RLIMIT_CORE)?,
        cpu: args.rlimit_cpu.resolve(Resource::RLIMIT_CPU)?,
        fsize: args.rlimit_fsize.resolve(Resource::RLIMIT_FSIZE)?,
        nofile: args.rlimit_nofile.resolve(Resource::RLIMIT_NOFILE)?,
        nproc: args.rlimit_nproc.resolve(Resource::RLIMIT_NPROC)?,
        stack: args.rlimit_stack.resolve(Resource::RLIMIT_STACK)?,
    };

    let personality = personality_mask(&args);

    Ok(JailConfig {
        mode: args.mode,
        chroot: args.chroot,
        hostname: args.hostname,
        argv: args.command,
        keep_env: args.keep_env,
        uid,
        gid,
        outer_uid: getuid(),
        outer_gid: getgid(),
        port: args.port,
        max_conns_per_ip: args.max_conns_per_ip,
        tlimit: args.time_limit,
        daemonize: args.daemon,
        verbose: args.verbose,
        keep_caps: args.keep_caps,
        is_root_rw: args.rw,
        is_silent: args.silent,
        clone_newnet: !args.disable_clone_newnet,
        clone_newuser: !args.disable_clone_newuser,
        clone_newns: !args.disable_clone_newns,
        clone_newpid: !args.disable_clone_newpid,
        clone_newipc: !args.disable_clone_newipc,
        clone_newuts: !args.disable_clone_newuts,
        apply_sandbox: !args.disable_sandbox,
        personality,
        rlimits,
        iface_macvtap: args.net_macvtap,
        iface_macvlan: args.net_macvlan,
        bind_mounts: args.bindmount,
        tmpfs_mounts: args.tmpfsmount,
        logfile: args.log,
    })
}

/// Parse the process arguments. clap handles help and usage errors itself,
/// exiting 0 for help and non-zero for a bad command line.
pub fn parse() -> Result<JailConfig> {
    resolve(Args::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    fn parse_args(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).expect("argument parse")
    }

    #[test]
    fn test_defaults() {
        let args = parse_args(&["warden", "--", "/bin/true"]);
        assert_eq!(args.mode, Mode::ListenTcp);
        assert_eq!(args.chroot, "/chroot");
        assert_eq!(args.user, "nobody");
        assert_eq!(args.group, "nobody");
        assert_eq!(args.hostname, "NSJAIL");
        assert_eq!(args.port, 31337);
        assert_eq!(args.max_conns_per_ip, 0);
        assert_eq!(args.time_limit, 600);
        assert_eq!(args.rlimit_as, RlimitSpec::Val(512));
        assert_eq!(args.rlimit_nproc, RlimitSpec::Def);
        assert_eq!(args.command, vec!["/bin/true"]);
    }

    #[test]
    fn test_short_options_and_trailing_command() {
        let args = parse_args(&[
            "warden", "-M", "o", "-c", "/jail", "-H", "box", "-t", "5", "-v", "--",
            "/bin/echo", "hi", "-n",
        ]);
        assert_eq!(args.mode, Mode::StandaloneOnce);
        assert_eq!(args.chroot, "/jail");
        assert_eq!(args.hostname, "box");
        assert_eq!(args.time_limit, 5);
        assert!(args.verbose);
        // everything after '--' belongs to the payload, flags included
        assert_eq!(args.command, vec!["/bin/echo", "hi", "-n"]);
    }

    #[test]
    fn test_missing_command_is_an_error() {
        let err = Args::try_parse_from(["warden", "-M", "o"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_unknown_option_is_an_error() {
        assert!(Args::try_parse_from(["warden", "--frobnicate", "--", "/bin/true"]).is_err());
    }

    #[test]
    fn test_port_zero_rejected() {
        assert!(Args::try_parse_from(["warden", "-p", "0", "--", "/bin/true"]).is_err());
    }

    #[test]
    fn test_bad_mode_rejected() {
        assert!(Args::try_parse_from(["warden", "-M", "x", "--", "/bin/true"]).is_err());
    }

    #[test]
    fn test_help_flag_variants() {
        for flag in ["-h", "--help", "-?"] {
            let err = Args::try_parse_from(["warden", flag]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::DisplayHelp, "flag {}", flag);
        }
    }

    #[test]
    fn test_repeatable_mounts() {
        let args = parse_args(&[
            "warden", "-B", "/lib", "-B", "/usr/lib", "-T", "/tmp", "--", "/bin/true",
        ]);
        assert_eq!(args.bindmount, vec!["/lib", "/usr/lib"]);
        assert_eq!(args.tmpfsmount, vec!["/tmp"]);
    }

    #[test]
    fn test_namespace_toggles_and_sandbox() {
        let args = parse_args(&[
            "warden",
            "-N",
            "--disable_clone_newuser",
            "--disable_sandbox",
            "--rw",
            "--silent",
            "--",
            "/bin/true",
        ]);
        let cfg = resolve(args).unwrap();
        assert!(!cfg.clone_newnet);
        assert!(!cfg.clone_newuser);
        assert!(cfg.clone_newpid);
        assert!(!cfg.apply_sandbox);
        assert!(cfg.is_root_rw);
        assert!(cfg.is_silent);
    }

    #[test]
    fn test_persona_flags_compose() {
        let args = parse_args(&[
            "warden",
            "--persona_addr_no_randomize",
            "--persona_mmap_page_zero",
            "--",
            "/bin/true",
        ]);
        let mask = personality_mask(&args);
        assert_eq!(
            mask,
            Persona::ADDR_NO_RANDOMIZE | Persona::MMAP_PAGE_ZERO
        );
    }

    #[test]
    fn test_numeric_user_and_group() {
        assert_eq!(resolve_user("1234").unwrap(), Uid::from_raw(1234));
        assert_eq!(resolve_user("0x3e8").unwrap(), Uid::from_raw(1000));
        assert_eq!(resolve_group("4321").unwrap(), Gid::from_raw(4321));
        assert!(resolve_user("nosuchuser9999").is_err());
        assert!(resolve_group("nosuchgroup9999").is_err());
    }

    #[test]
    fn test_resolve_snapshots_rlimits() {
        let args = parse_args(&[
            "warden",
            "--rlimit_as",
            "16",
            "--rlimit_nproc",
            "def",
            "-u",
            "1000",
            "-g",
            "1000",
            "--",
            "/usr/bin/env",
        ]);
        let cfg = resolve(args).unwrap();
        assert_eq!(cfg.rlimits.addr_space, 16 * 1024 * 1024);
        let (soft, _) = nix::sys::resource::getrlimit(Resource::RLIMIT_NPROC).unwrap();
        assert_eq!(cfg.rlimits.nproc, soft);
        assert_eq!(cfg.uid, Uid::from_raw(1000));
    }
}
