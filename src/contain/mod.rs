//! The ordered containment sequence run inside the freshly cloned child.
//!
//! Order matters: filesystem work needs CAP_SYS_ADMIN in the new mount
//! namespace, so it precedes the privilege drop; descriptor setup precedes
//! rlimits so RLIMIT_NOFILE cannot invalidate descriptors still in use; the
//! seccomp filter is installed last because earlier steps use syscalls it
//! may deny. Every step is fatal: the caller exits the child with status 1
//! on the first error.

pub mod env;
pub mod fd;
pub mod fs;
pub mod privs;
pub mod rlimit;

use crate::config::JailConfig;
use crate::error::{JailError, Result};
use crate::logging;
use crate::sandbox;
use log::debug;
use nix::unistd::execve;
use std::convert::Infallible;
use std::ffi::CString;
use std::os::unix::io::RawFd;

/// Stdio descriptors handed to the child: the connection socket trio in
/// listen mode, the inherited 0/1/2 in standalone modes.
#[derive(Clone, Copy, Debug)]
pub struct StdioFds {
    pub fd_in: RawFd,
    pub fd_out: RawFd,
    pub fd_err: RawFd,
}

/// Run every containment step, then exec the target. Returns only on
/// failure; on success the process image is replaced.
pub fn build_and_exec(cfg: &JailConfig, fds: StdioFds, log_fd: RawFd) -> Result<Infallible> {
    // from here on every log line goes through the pipe to the supervisor
    logging::redirect_to_fd(log_fd);

    env::prepare(cfg)?;
    fd::setup_stdio(cfg, fds)?;
    fs::mount_jail(cfg)?;
    privs::drop(cfg)?;
    rlimit::apply(&cfg.rlimits)?;
    fd::make_cloexec_above_stderr()?;
    sandbox::apply(cfg)?;

    exec(cfg)
}

fn exec(cfg: &JailConfig) -> Result<Infallible> {
    let program = CString::new(cfg.argv[0].as_str())
        .map_err(|_| JailError::Config(format!("command contains NUL: '{}'", cfg.argv[0])))?;
    let args = cfg
        .argv
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| JailError::Config("argument contains NUL".to_string()))?;
    let environ = exec_environment(cfg)?;

    debug!("trying to execve('{}')", cfg.argv[0]);
    for (i, arg) in cfg.argv.iter().enumerate() {
        debug!(" arg[{}]: '{}'", i, arg);
    }

    execve(&program, &args, &environ)
        .map_err(|e| JailError::Process(format!("execve('{}'): {}", cfg.argv[0], e)))
}

/// The environment handed to the payload: the supervisor's own when
/// `keep_env` is set, empty otherwise.
fn exec_environment(cfg: &JailConfig) -> Result<Vec<CString>> {
    if !cfg.keep_env {
        return Ok(Vec::new());
    }
    std::env::vars()
        .map(|(k, v)| {
            CString::new(format!("{}={}", k, v))
                .map_err(|_| JailError::Config(format!("environment variable contains NUL: {}", k)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;

    #[test]
    fn test_exec_environment_scrubbed_by_default() {
        let cfg = test_config();
        assert!(exec_environment(&cfg).unwrap().is_empty());
    }

    #[test]
    fn test_exec_environment_passthrough_with_keep_env() {
        std::env::set_var("JAIL_ENV_PROBE", "1");
        let mut cfg = test_config();
        cfg.keep_env = true;
        let environ = exec_environment(&cfg).unwrap();
        assert!(environ
            .iter()
            .any(|e| e.to_bytes().starts_with(b"JAIL_ENV_PROBE=")));
        std::env::remove_var("JAIL_ENV_PROBE");
    }
}
