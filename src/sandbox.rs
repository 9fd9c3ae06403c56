//! Seccomp-bpf syscall filter, installed as the last containment step.
//!
//! The program validates the audit architecture, kills the process on a
//! short list of introspection and kernel-surface syscalls a jailed payload
//! has no business making, and allows everything else. Installation relies
//! on PR_SET_NO_NEW_PRIVS, which the privilege-drop step has already set.

use crate::config::JailConfig;
use crate::error::{JailError, Result};
use log::debug;
use std::io;

// classic BPF opcode pieces
const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

const SECCOMP_RET_KILL: u32 = 0x0000_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

// offsets into struct seccomp_data
const SECCOMP_DATA_NR: u32 = 0;
const SECCOMP_DATA_ARCH: u32 = 4;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH_CURRENT: u32 = 0xc000_003e; // AUDIT_ARCH_X86_64
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH_CURRENT: u32 = 0xc000_00b7; // AUDIT_ARCH_AARCH64

fn stmt(code: u16, k: u32) -> libc::sock_filter {
    libc::sock_filter {
        code,
        k,
        jt: 0,
        jf: 0,
    }
}

fn jump(code: u16, k: u32, jt: u8, jf: u8) -> libc::sock_filter {
    libc::sock_filter { code, k, jt, jf }
}

/// Syscalls a jailed payload is never allowed to reach.
fn denied_syscalls() -> &'static [libc::c_long] {
    &[
        libc::SYS_ptrace,
        libc::SYS_process_vm_readv,
        libc::SYS_process_vm_writev,
        libc::SYS_perf_event_open,
        libc::SYS_add_key,
        libc::SYS_request_key,
        libc::SYS_keyctl,
        libc::SYS_kexec_load,
    ]
}

fn build_filter() -> Vec<libc::sock_filter> {
    let denied = denied_syscalls();
    let mut prog = Vec::with_capacity(4 + 2 * denied.len());

    // wrong architecture means the syscall numbers below are meaningless
    prog.push(stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_ARCH));
    prog.push(jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH_CURRENT, 1, 0));
    prog.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL));

    prog.push(stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_NR));
    for nr in denied {
        prog.push(jump(BPF_JMP | BPF_JEQ | BPF_K, *nr as u32, 0, 1));
        prog.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL));
    }
    prog.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));

    prog
}

/// Install the filter unless the configuration disables sandboxing.
pub fn apply(cfg: &JailConfig) -> Result<()> {
    if !cfg.apply_sandbox {
        debug!("seccomp-bpf sandbox disabled");
        return Ok(());
    }

    let prog = build_filter();
    let fprog = libc::sock_fprog {
        len: prog.len() as libc::c_ushort,
        filter: prog.as_ptr() as *mut libc::sock_filter,
    };

    let rc = unsafe {
        libc::prctl(
            libc::PR_SET_SECCOMP,
            libc::SECCOMP_MODE_FILTER as libc::c_ulong,
            &fprog as *const libc::sock_fprog,
            0,
            0,
        )
    };
    if rc != 0 {
        return Err(JailError::Sandbox(format!(
            "prctl(PR_SET_SECCOMP, SECCOMP_MODE_FILTER): {}",
            io::Error::last_os_error()
        )));
    }

    debug!("installed seccomp-bpf filter ({} instructions)", prog.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_shape() {
        let prog = build_filter();
        assert_eq!(prog.len(), 4 + 2 * denied_syscalls().len() + 1);

        // starts by loading and checking the architecture word
        assert_eq!(prog[0].code, BPF_LD | BPF_W | BPF_ABS);
        assert_eq!(prog[0].k, SECCOMP_DATA_ARCH);
        assert_eq!(prog[1].k, AUDIT_ARCH_CURRENT);
        assert_eq!(prog[2].k, SECCOMP_RET_KILL);

        // ends in the default-allow return
        let last = prog.last().unwrap();
        assert_eq!(last.code, BPF_RET | BPF_K);
        assert_eq!(last.k, SECCOMP_RET_ALLOW);
    }

    #[test]
    fn test_every_denied_syscall_pairs_with_a_kill() {
        let prog = build_filter();
        for (i, nr) in denied_syscalls().iter().enumerate() {
            let check = &prog[4 + 2 * i];
            let kill = &prog[4 + 2 * i + 1];
            assert_eq!(check.code, BPF_JMP | BPF_JEQ | BPF_K);
            assert_eq!(check.k, *nr as u32);
            assert_eq!(kill.k, SECCOMP_RET_KILL);
        }
    }
}
