//! Containment step 1: process environment of the new child.

use crate::config::JailConfig;
use crate::error::{JailError, Result};
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::personality;
use nix::sys::prctl;
use nix::sys::signal::Signal;
use nix::unistd::sethostname;

pub fn prepare(cfg: &JailConfig) -> Result<()> {
    if cfg.clone_newuts {
        debug!("setting hostname to '{}'", cfg.hostname);
        sethostname(&cfg.hostname).map_err(|e| {
            JailError::Process(format!("sethostname('{}'): {}", cfg.hostname, e))
        })?;
    }

    // the jail must not outlive its supervisor
    prctl::set_pdeathsig(Signal::SIGKILL)
        .map_err(|e| JailError::Process(format!("prctl(PR_SET_PDEATHSIG, SIGKILL): {}", e)))?;

    if !cfg.personality.is_empty() {
        personality::set(cfg.personality).map_err(|e| {
            JailError::Process(format!(
                "personality({:#x}): {}",
                cfg.personality.bits(),
                e
            ))
        })?;
    }

    // -1 is a valid priority, so the errno tells failure apart
    Errno::clear();
    if unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, 19) } == -1 && Errno::last_raw() != 0 {
        warn!("setpriority(19): {}", Errno::last());
    }

    Ok(())
}
