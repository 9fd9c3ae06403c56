//! Containment step 5: resource limits, applied soft = hard.

use crate::config::ResourceLimits;
use crate::error::{JailError, Result};
use nix::sys::resource::{setrlimit, Resource};

pub fn apply(limits: &ResourceLimits) -> Result<()> {
    set(Resource::RLIMIT_AS, limits.addr_space)?;
    set(Resource::RLIMIT_CORE, limits.core)?;
    set(Resource::RLIMIT_CPU, limits.cpu)?;
    set(Resource::RLIMIT_FSIZE, limits.fsize)?;
    set(Resource::RLIMIT_NOFILE, limits.nofile)?;
    set(Resource::RLIMIT_NPROC, limits.nproc)?;
    set(Resource::RLIMIT_STACK, limits.stack)
}

fn set(resource: Resource, value: u64) -> Result<()> {
    setrlimit(resource, value, value).map_err(|e| {
        JailError::ResourceLimit(format!("setrlimit({:?}, {}): {}", resource, value, e))
    })
}
