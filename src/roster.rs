//! Live-child bookkeeping for the supervisor.

use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::time::Instant;

/// One spawned, not-yet-reaped jailed child.
#[derive(Clone, Debug)]
pub struct ChildRecord {
    pub pid: Pid,
    pub start: Instant,
    /// Remote peer address in its full 16-byte IPv6 form, zero-filled in
    /// standalone modes.
    pub remote_addr: [u8; 16],
    pub remote_txt: String,
}

/// The set of live children. Mutated only by the supervisor thread.
#[derive(Default)]
pub struct Roster {
    records: Vec<ChildRecord>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rec: ChildRecord) {
        debug!(
            "added pid {} to the roster for {}",
            rec.pid, rec.remote_txt
        );
        self.records.push(rec);
    }

    /// Remove the record for `pid`. Unknown pids are logged and ignored so a
    /// stray wait result cannot corrupt the roster.
    pub fn remove(&mut self, pid: Pid) -> bool {
        match self.records.iter().position(|r| r.pid == pid) {
            Some(ix) => {
                let rec = self.records.swap_remove(ix);
                debug!(
                    "removed pid {} from the roster (remote {})",
                    rec.pid, rec.remote_txt
                );
                true
            }
            None => {
                warn!("pid {} not found in the roster", pid);
                false
            }
        }
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChildRecord> {
        self.records.iter()
    }

    /// Number of live children whose peer equals `addr` byte-for-byte.
    /// IPv4 peers arrive as IPv4-mapped IPv6 addresses and count under that
    /// mapped form; there is no netmask coalescing.
    pub fn count_addr(&self, addr: &[u8; 16]) -> usize {
        self.records
            .iter()
            .filter(|r| &r.remote_addr == addr)
            .count()
    }

    /// SIGKILL every live child. Records stay until the reap path observes
    /// the exits.
    pub fn kill_all(&self) {
        for rec in &self.records {
            let _ = kill(rec.pid, Signal::SIGKILL);
        }
    }

    /// Log every live child with its run time and remaining time.
    pub fn log_status(&self, tlimit: u64) {
        info!("total number of spawned jails: {}", self.count());
        for rec in &self.records {
            let ran = rec.start.elapsed().as_secs();
            let left = if tlimit > 0 {
                tlimit.saturating_sub(ran)
            } else {
                0
            };
            info!(
                "pid: {}, remote host: {}, run time: {} sec. (time left: {} sec.)",
                rec.pid, rec.remote_txt, ran, left
            );
        }
    }
}

/// Admission check for a new connection: a cap of 0 admits everything,
/// otherwise the peer may hold strictly fewer than `cap` live jails.
pub fn allow(roster: &Roster, addr: &[u8; 16], cap: u32) -> bool {
    cap == 0 || (roster.count_addr(addr) as u32) < cap
}
