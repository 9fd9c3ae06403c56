//! Containment step 4: privilege drop.
//!
//! Inside a user namespace the single-entry uid_map/gid_map pins the
//! configured inner identity to the supervisor's outer one. Group switch
//! strictly precedes the uid switch; capability handling goes through
//! securebits plus a raw capset(2), which libc does not wrap.

use crate::config::JailConfig;
use crate::error::{JailError, Result};
use log::{debug, warn};
use nix::unistd::{setgroups, setresgid, setresuid};
use std::fs::OpenOptions;
use std::io::{self, Write};

// securebits.h, not exposed by libc
const SECBIT_NOROOT: libc::c_ulong = 1 << 0;
const SECBIT_NOROOT_LOCKED: libc::c_ulong = 1 << 1;
const SECBIT_NO_SETUID_FIXUP: libc::c_ulong = 1 << 2;
const SECBIT_NO_SETUID_FIXUP_LOCKED: libc::c_ulong = 1 << 3;
const SECBIT_KEEP_CAPS: libc::c_ulong = 1 << 4;
const SECBIT_KEEP_CAPS_LOCKED: libc::c_ulong = 1 << 5;

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

pub fn drop(cfg: &JailConfig) -> Result<()> {
    deny_setgroups()?;
    write_id_maps(cfg)?;

    // only newer kernels support it
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } == -1 {
        warn!(
            "prctl(PR_SET_NO_NEW_PRIVS, 1): {}",
            io::Error::last_os_error()
        );
    }

    if cfg.keep_caps {
        keep_capabilities()?;
    } else {
        drop_capabilities()?;
    }

    // best effort: /proc/self/setgroups may already forbid it
    if let Err(e) = setgroups(&[]) {
        debug!("setgroups([]): {}", e);
    }

    setresgid(cfg.gid, cfg.gid, cfg.gid)
        .map_err(|e| JailError::Privilege(format!("setresgid({}): {}", cfg.gid, e)))?;
    setresuid(cfg.uid, cfg.uid, cfg.uid)
        .map_err(|e| JailError::Privilege(format!("setresuid({}): {}", cfg.uid, e)))?;

    Ok(())
}

fn deny_setgroups() -> Result<()> {
    let file = OpenOptions::new().write(true).open("/proc/self/setgroups");
    match file {
        Err(_) => {
            // not present with all kernels
            debug!("'/proc/self/setgroups' not present in this kernel?");
            Ok(())
        }
        Ok(mut f) => f.write_all(b"deny").map_err(|e| {
            JailError::Privilege(format!("write('/proc/self/setgroups', 'deny'): {}", e))
        }),
    }
}

fn write_id_maps(cfg: &JailConfig) -> Result<()> {
    if !cfg.clone_newuser {
        return Ok(());
    }
    write_map(
        "/proc/self/uid_map",
        cfg.uid.as_raw(),
        cfg.outer_uid.as_raw(),
    )?;
    write_map(
        "/proc/self/gid_map",
        cfg.gid.as_raw(),
        cfg.outer_gid.as_raw(),
    )
}

/// Single-entry map: the configured inner id maps one-to-one to the
/// supervisor's outer id.
fn write_map(path: &str, inner: u32, outer: u32) -> Result<()> {
    let entry = format!("{} {} 1", inner, outer);
    debug!("writing '{}' to {}", entry, path);
    let mut f = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| JailError::Privilege(format!("open('{}'): {}", path, e)))?;
    f.write_all(entry.as_bytes())
        .map_err(|e| JailError::Privilege(format!("write('{}', '{}'): {}", path, entry, e)))
}

fn set_securebits(bits: libc::c_ulong) -> Result<()> {
    if unsafe { libc::prctl(libc::PR_SET_SECUREBITS, bits, 0, 0, 0) } == -1 {
        return Err(JailError::Privilege(format!(
            "prctl(PR_SET_SECUREBITS, {:#x}): {}",
            bits,
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn capset(data: &[CapUserData; 2]) -> Result<()> {
    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let rc = unsafe {
        libc::syscall(
            libc::SYS_capset,
            &header as *const CapUserHeader,
            data.as_ptr(),
        )
    };
    if rc == -1 {
        return Err(JailError::Privilege(format!(
            "capset(): {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Zero every capability set and lock the securebits so no future uid
/// transition can regain them.
fn drop_capabilities() -> Result<()> {
    set_securebits(
        SECBIT_KEEP_CAPS_LOCKED
            | SECBIT_NO_SETUID_FIXUP
            | SECBIT_NO_SETUID_FIXUP_LOCKED
            | SECBIT_NOROOT
            | SECBIT_NOROOT_LOCKED,
    )?;
    let zeroed = CapUserData {
        effective: 0,
        permitted: 0,
        inheritable: 0,
    };
    capset(&[zeroed, zeroed])
}

/// Keep capabilities across the uid switch.
fn keep_capabilities() -> Result<()> {
    set_securebits(SECBIT_KEEP_CAPS)?;
    let full = CapUserData {
        effective: !0,
        permitted: !0,
        inheritable: !0,
    };
    capset(&[full, full])
}
