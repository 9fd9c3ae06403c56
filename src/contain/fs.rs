//! Containment step 3: the jail filesystem.
//!
//! Layout while staging: a fresh tmpfs covers /tmp in the new mount
//! namespace, the chroot source is bind-mounted at /tmp/new_root, and
//! pivot_root swings the namespace onto the tmpfs with the old root parked
//! at /tmp/pivot_root until it is detached.

use crate::config::JailConfig;
use crate::error::{JailError, Result};
use log::debug;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::{chdir, chroot, pivot_root};
use std::fs;
use std::io;

const STAGING_DIR: &str = "/tmp";
const NEW_ROOT: &str = "/tmp/new_root";
const PIVOT_OLD: &str = "/tmp/pivot_root";
const TMPFS_OPTS: &str = "size=4194304";

fn mount_err(what: &str, e: nix::errno::Errno) -> JailError {
    JailError::Mount(format!("mount {}: {}", what, e))
}

pub fn mount_jail(cfg: &JailConfig) -> Result<()> {
    if !cfg.clone_newns {
        return Ok(());
    }

    // keep every mount event below out of the parent namespace
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| mount_err("'/' MS_REC|MS_PRIVATE", e))?;

    mount(
        Some("none"),
        STAGING_DIR,
        Some("tmpfs"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|e| mount_err("staging tmpfs", e))?;

    mkdir(NEW_ROOT)?;
    debug!("binding chroot source '{}' on '{}'", cfg.chroot, NEW_ROOT);
    mount(
        Some(cfg.chroot.as_str()),
        NEW_ROOT,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| mount_err(&format!("'{}' on '{}'", cfg.chroot, NEW_ROOT), e))?;

    for pt in &cfg.bind_mounts {
        bind_readonly(pt)?;
    }

    mkdir(PIVOT_OLD)?;
    pivot_root(STAGING_DIR, PIVOT_OLD).map_err(|e| {
        JailError::Mount(format!(
            "pivot_root('{}', '{}'): {}",
            STAGING_DIR, PIVOT_OLD, e
        ))
    })?;

    mount(
        None::<&str>,
        "/new_root/proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .map_err(|e| mount_err("proc", e))?;

    umount2("/pivot_root", MntFlags::MNT_DETACH)
        .map_err(|e| JailError::Mount(format!("umount2('/pivot_root', MNT_DETACH): {}", e)))?;

    chroot("/new_root").map_err(|e| JailError::Mount(format!("chroot('/new_root'): {}", e)))?;
    chdir("/").map_err(|e| JailError::Mount(format!("chdir('/'): {}", e)))?;

    // only meaningful when the chroot source is '/' itself
    let _ = umount2(STAGING_DIR, MntFlags::MNT_DETACH);

    for pt in &cfg.tmpfs_mounts {
        mkdir_existing_ok(pt)?;
        debug!("mounting tmpfs at '{}'", pt);
        mount(
            None::<&str>,
            pt.as_str(),
            Some("tmpfs"),
            MsFlags::empty(),
            Some(TMPFS_OPTS),
        )
        .map_err(|e| mount_err(&format!("tmpfs at '{}'", pt), e))?;
    }

    if !cfg.is_root_rw {
        mount(
            Some("/"),
            "/",
            None::<&str>,
            MsFlags::MS_BIND
                | MsFlags::MS_RDONLY
                | MsFlags::MS_NOSUID
                | MsFlags::MS_NODEV
                | MsFlags::MS_REMOUNT
                | MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(|e| mount_err("'/' read-only remount", e))?;
    }

    Ok(())
}

/// Bind a host path into the staged root, then remount it read-only; bind
/// mounts ignore MS_RDONLY on the first pass.
fn bind_readonly(source: &str) -> Result<()> {
    let target = format!("{}/{}", NEW_ROOT, source.trim_start_matches('/'));
    mkdir_existing_ok(&target)?;

    debug!("mounting (bind) '{}' on '{}'", source, target);
    mount(
        Some(source),
        target.as_str(),
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| mount_err(&format!("'{}' on '{}'", source, target), e))?;

    mount(
        Some(source),
        target.as_str(),
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|e| mount_err(&format!("'{}' read-only remount", target), e))
}

fn mkdir(path: &str) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| JailError::Mount(format!("mkdir('{}'): {}", path, e)))
}

fn mkdir_existing_ok(path: &str) -> Result<()> {
    match fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(JailError::Mount(format!("mkdir('{}'): {}", path, e))),
    }
}
