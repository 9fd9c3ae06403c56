//! The supervisor: a single thread that spawns jailed children, reaps them,
//! enforces the per-child time limit and tears everything down on a
//! terminating signal.

use crate::config::{JailConfig, Mode};
use crate::contain::{self, StdioFds};
use crate::error::Result;
use crate::link;
use crate::logging;
use crate::net;
use crate::roster::{self, ChildRecord, Roster};
use crate::signals::{self, SignalWake};
use log::{debug, error, info, warn};
use nix::sched::clone;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Instant;

/// Read size for draining a child's log pipe.
const LOG_CHUNK: usize = 4096;
const CHILD_STACK_SIZE: usize = 2 * 1024 * 1024;
/// Poll timeout; bounds the latency of time-limit enforcement.
const WAIT_TICK_MS: libc::c_int = 1000;

pub struct Supervisor {
    cfg: JailConfig,
    roster: Roster,
    wake: SignalWake,
}

impl Supervisor {
    pub fn new(cfg: JailConfig) -> Result<Self> {
        Ok(Supervisor {
            cfg,
            roster: Roster::new(),
            wake: SignalWake::install()?,
        })
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn run(&mut self) -> Result<()> {
        match self.cfg.mode {
            Mode::ListenTcp => self.run_listen(),
            Mode::StandaloneOnce => self.run_standalone(false),
            Mode::StandaloneRerun => self.run_standalone(true),
        }
    }

    fn run_listen(&mut self) -> Result<()> {
        let listen_fd = net::bind_and_listen(self.cfg.port)?;

        loop {
            self.wake.drain();
            self.reap();
            self.enforce_time_limits();
            if signals::termination_requested() {
                break;
            }
            if !self.wait_readable(Some(listen_fd)) {
                continue;
            }

            let conn = match net::accept_conn(listen_fd) {
                Some(fd) => fd,
                None => continue,
            };
            let (addr, txt) = net::conn_to_text(conn, true);
            if !roster::allow(&self.roster, &addr, self.cfg.max_conns_per_ip) {
                warn!(
                    "rejecting connection from '{}', max_conns_per_ip limit reached: {}",
                    txt, self.cfg.max_conns_per_ip
                );
                unsafe { libc::close(conn) };
                continue;
            }

            self.spawn(StdioFds {
                fd_in: conn,
                fd_out: conn,
                fd_err: conn,
            });
            // the child owns its duplicate by now
            unsafe { libc::close(conn) };
        }

        self.shutdown();
        Ok(())
    }

    fn run_standalone(&mut self, rerun: bool) -> Result<()> {
        let fds = StdioFds {
            fd_in: libc::STDIN_FILENO,
            fd_out: libc::STDOUT_FILENO,
            fd_err: libc::STDERR_FILENO,
        };
        self.spawn(fds);

        loop {
            self.wait_readable(None);
            self.wake.drain();
            self.reap();
            self.enforce_time_limits();
            if signals::termination_requested() {
                self.shutdown();
                return Ok(());
            }
            if self.roster.is_empty() {
                if !rerun {
                    return Ok(());
                }
                self.spawn(fds);
            }
        }
    }

    /// Sleep until a signal wakeup, listener readiness or the tick timeout.
    /// True only when `listen_fd` is readable.
    fn wait_readable(&self, listen_fd: Option<RawFd>) -> bool {
        let mut fds = [
            libc::pollfd {
                fd: self.wake.fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: listen_fd.unwrap_or(-1),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let nfds = if listen_fd.is_some() { 2 } else { 1 };
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), nfds as libc::nfds_t, WAIT_TICK_MS) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                warn!("poll(): {}", err);
            }
            return false;
        }
        listen_fd.is_some() && fds[1].revents & libc::POLLIN != 0
    }

    /// Clone a jailed child for the given stdio trio. Every failure here is
    /// transient: the attempt is logged and abandoned, the supervisor
    /// carries on.
    fn spawn(&mut self, fds: StdioFds) {
        let flags = self.cfg.clone_flags();
        debug!(
            "creating new process with clone flags: {:#x}",
            flags.bits()
        );

        let mut pipefd = [-1; 2];
        if unsafe { libc::pipe2(pipefd.as_mut_ptr(), libc::O_CLOEXEC) } == -1 {
            error!("pipe2(O_CLOEXEC): {}", io::Error::last_os_error());
            return;
        }
        let (pipe_r, pipe_w) = (pipefd[0], pipefd[1]);

        let cfg = &self.cfg;
        let mut stack = vec![0u8; CHILD_STACK_SIZE];
        let cb: Box<dyn FnMut() -> isize + '_> = Box::new(move || {
            match contain::build_and_exec(cfg, fds, pipe_w) {
                Err(e) => {
                    error!("{}", e);
                    1
                }
                Ok(never) => match never {},
            }
        });

        let pid = match unsafe { clone(cb, &mut stack, flags, Some(libc::SIGCHLD)) } {
            Ok(pid) => pid,
            Err(e) => {
                error!(
                    "clone(flags={:#x}) failed: {}; unprivileged use needs a kernel with \
                     CLONE_NEWUSER support",
                    flags.bits(),
                    e
                );
                unsafe {
                    libc::close(pipe_r);
                    libc::close(pipe_w);
                }
                return;
            }
        };

        // only the child may hold the write end, so its exec (or death)
        // shows up as EOF on the read end
        unsafe { libc::close(pipe_w) };

        // interface attach runs while the child walks its containment steps
        if let Err(e) = link::attach_interfaces(&self.cfg, pid) {
            error!(
                "couldn't put a virtual interface into the namespace of pid {}: {}",
                pid, e
            );
        }

        drain_log_pipe(pipe_r);
        unsafe { libc::close(pipe_r) };

        let (remote_addr, remote_txt) = net::conn_to_text(fds.fd_in, true);
        self.roster.insert(ChildRecord {
            pid,
            start: Instant::now(),
            remote_addr,
            remote_txt: remote_txt.clone(),
        });
        info!(
            "pid {} about to execute '{}' for {}",
            pid, self.cfg.argv[0], remote_txt
        );
    }

    /// Collect every child the kernel has finished with.
    fn reap(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, status)) => {
                    self.roster.remove(pid);
                    info!(
                        "pid {} exited with status: {} ({} left)",
                        pid,
                        status,
                        self.roster.count()
                    );
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    self.roster.remove(pid);
                    info!(
                        "pid {} terminated with signal: {} ({} left)",
                        pid,
                        sig,
                        self.roster.count()
                    );
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => continue,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(nix::errno::Errno::ECHILD) => break,
                Err(e) => {
                    warn!("waitpid(-1, WNOHANG): {}", e);
                    break;
                }
            }
        }
    }

    /// SIGCONT then SIGKILL every child past its wall-clock budget. The
    /// reap path removes the record, so re-sending on the next tick is
    /// harmless.
    fn enforce_time_limits(&mut self) {
        if self.cfg.tlimit == 0 {
            return;
        }
        for rec in self.roster.iter() {
            let ran = rec.start.elapsed().as_secs();
            if ran >= self.cfg.tlimit {
                info!(
                    "pid {} run time >= time limit ({} >= {}) ({}), killing it",
                    rec.pid, ran, self.cfg.tlimit, rec.remote_txt
                );
                // a stopped namespaced process ignores KILL until continued
                let _ = kill(rec.pid, Signal::SIGCONT);
                let _ = kill(rec.pid, Signal::SIGKILL);
            }
        }
    }

    /// Terminating signal received: report, kill everything, drain reaps.
    fn shutdown(&mut self) {
        info!(
            "terminating signal received, killing {} jailed process(es)",
            self.roster.count()
        );
        self.roster.log_status(self.cfg.tlimit);
        self.roster.kill_all();
        while !self.roster.is_empty() {
            self.wake.drain();
            self.reap();
            if !self.roster.is_empty() {
                self.wait_readable(None);
            }
        }
    }
}

fn drain_log_pipe(fd: RawFd) {
    let mut buf = [0u8; LOG_CHUNK];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n > 0 {
            logging::write_raw(&buf[..n as usize]);
        } else if n == 0 {
            break;
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            warn!("read(log pipe): {}", err);
            break;
        }
    }
}
