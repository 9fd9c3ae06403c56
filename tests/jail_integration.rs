//! Integration tests for the supervisor's spawn/reap/time-limit cycle.
//!
//! These run the real clone + containment path. With user namespaces
//! available the child execs its payload fully contained; on kernels or
//! containers where that is denied the spawn attempt is abandoned and the
//! supervisor still has to come back with an empty roster. The assertions
//! below hold in both worlds, and everything runs inside one test function
//! because concurrent supervisors in one process would steal each other's
//! wait results.

use nix::sys::personality::Persona;
use nix::sys::resource::Resource;
use nix::sys::signal::{raise, Signal};
use nix::unistd::{getgid, getuid};
use std::time::{Duration, Instant};
use warden::config::{JailConfig, Mode, ResourceLimits, RlimitSpec};
use warden::supervisor::Supervisor;

fn jail_config(argv: &[&str], mode: Mode, tlimit: u64) -> JailConfig {
    let rlimits = ResourceLimits {
        addr_space: RlimitSpec::Def.resolve(Resource::RLIMIT_AS).unwrap(),
        core: RlimitSpec::Def.resolve(Resource::RLIMIT_CORE).unwrap(),
        cpu: RlimitSpec::Def.resolve(Resource::RLIMIT_CPU).unwrap(),
        fsize: RlimitSpec::Def.resolve(Resource::RLIMIT_FSIZE).unwrap(),
        nofile: RlimitSpec::Def.resolve(Resource::RLIMIT_NOFILE).unwrap(),
        nproc: RlimitSpec::Def.resolve(Resource::RLIMIT_NPROC).unwrap(),
        stack: RlimitSpec::Def.resolve(Resource::RLIMIT_STACK).unwrap(),
    };

    JailConfig {
        mode,
        chroot: "/chroot".to_string(),
        hostname: "testjail".to_string(),
        argv: argv.iter().map(|s| s.to_string()).collect(),
        keep_env: false,
        // keep the current identity so the uid_map entry maps it onto itself
        uid: getuid(),
        gid: getgid(),
        outer_uid: getuid(),
        outer_gid: getgid(),
        port: 31337,
        max_conns_per_ip: 0,
        tlimit,
        daemonize: false,
        verbose: false,
        keep_caps: false,
        is_root_rw: false,
        is_silent: false,
        clone_newnet: false,
        clone_newuser: true,
        clone_newns: false,
        clone_newpid: false,
        clone_newipc: false,
        clone_newuts: true,
        apply_sandbox: false,
        personality: Persona::empty(),
        rlimits,
        iface_macvtap: None,
        iface_macvlan: None,
        bind_mounts: Vec::new(),
        tmpfs_mounts: Vec::new(),
        logfile: None,
    }
}

#[test]
fn test_standalone_lifecycle() {
    // one child, spawned and reaped, supervisor exits on its own
    let cfg = jail_config(&["/bin/true"], Mode::StandaloneOnce, 10);
    let mut supervisor = Supervisor::new(cfg).unwrap();
    supervisor.run().unwrap();
    assert!(
        supervisor.roster().is_empty(),
        "roster must drain after the only child is reaped"
    );

    // a sleeping child runs into the one-second time limit and is killed;
    // the whole cycle has to finish well under the payload's own duration
    let cfg = jail_config(&["/bin/sleep", "60"], Mode::StandaloneOnce, 1);
    let started = Instant::now();
    let mut supervisor = Supervisor::new(cfg).unwrap();
    supervisor.run().unwrap();
    assert!(supervisor.roster().is_empty());
    assert!(
        started.elapsed() < Duration::from_secs(15),
        "time-limit kill took {:?}",
        started.elapsed()
    );

    // rerun mode respawns until a terminating signal arrives; deliver one
    // after a few cycles and expect a clean, drained exit
    let cfg = jail_config(&["/bin/true"], Mode::StandaloneRerun, 10);
    let mut supervisor = Supervisor::new(cfg).unwrap();
    let killer = std::thread::spawn(|| {
        std::thread::sleep(Duration::from_secs(3));
        raise(Signal::SIGTERM).unwrap();
    });
    supervisor.run().unwrap();
    killer.join().unwrap();
    assert!(supervisor.roster().is_empty());
}
