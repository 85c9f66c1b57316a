//  Copyright 2020 Two Sigma Investments, LP.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! Resource limits for apps and their processes.
//!
//! The per-process block is snapshotted from the config store before the
//! fork (the store client is not fork-safe) and applied in the child as
//! late as possible, after the supervisor's descriptors are closed.

use anyhow::Result;
use crate::config::ReadTxn;

#[derive(Debug, Clone, Copy)]
pub struct ProcLimits {
    pub core_dump_file_bytes: u64,
    pub max_file_bytes: u64,
    pub num_fds: u64,
    pub mqueue_bytes: u64,
    pub num_signals_queued: u64,
}

impl Default for ProcLimits {
    fn default() -> Self {
        Self {
            core_dump_file_bytes: 8192,
            max_file_bytes: 90 * 1024,
            num_fds: 256,
            mqueue_bytes: 512,
            num_signals_queued: 100,
        }
    }
}

impl ProcLimits {
    /// Reads the limit block from a process's config node.  Missing nodes
    /// keep their defaults.
    pub fn from_config(proc_cfg: &ReadTxn) -> Self {
        let d = Self::default();
        Self {
            core_dump_file_bytes: proc_cfg.get_u64("maxCoreDumpFileBytes", d.core_dump_file_bytes),
            max_file_bytes: proc_cfg.get_u64("maxFileBytes", d.max_file_bytes),
            num_fds: proc_cfg.get_u64("maxFileDescriptors", d.num_fds),
            mqueue_bytes: proc_cfg.get_u64("maxMQueueBytes", d.mqueue_bytes),
            num_signals_queued: proc_cfg.get_u64("maxQueuedSignals", d.num_signals_queued),
        }
    }

    /// Applies the block to the calling process.  Only used in the child
    /// between fork and exec.
    pub fn apply(&self) -> Result<()> {
        set_rlimit(libc::RLIMIT_CORE, self.core_dump_file_bytes)?;
        set_rlimit(libc::RLIMIT_FSIZE, self.max_file_bytes)?;
        set_rlimit(libc::RLIMIT_NOFILE, self.num_fds)?;
        set_rlimit(libc::RLIMIT_MSGQUEUE, self.mqueue_bytes)?;
        set_rlimit(libc::RLIMIT_SIGPENDING, self.num_signals_queued)?;
        Ok(())
    }
}

fn set_rlimit(resource: libc::__rlimit_resource_t, value: u64) -> Result<()> {
    let lim = libc::rlimit { rlim_cur: value, rlim_max: value };

    if unsafe { libc::setrlimit(resource, &lim) } != 0 {
        bail!("setrlimit({}) failed: {}", resource, std::io::Error::last_os_error());
    }

    Ok(())
}

/// Lift the nice-level rlimit for a realtime process so a later policy
/// change back to SCHED_OTHER can still adjust niceness.
pub fn lift_nice_limit(pid: nix::unistd::Pid) -> Result<()> {
    let lim = libc::rlimit { rlim_cur: libc::RLIM_INFINITY, rlim_max: libc::RLIM_INFINITY };

    let rc = unsafe {
        libc::prlimit(pid.as_raw(), libc::RLIMIT_NICE, &lim, std::ptr::null_mut())
    };

    if rc != 0 {
        bail!("prlimit(RLIMIT_NICE) failed for pid {}: {}",
              pid, std::io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Store;

    #[test]
    fn limits_read_from_config_with_defaults() {
        let mut store = Store::in_memory();
        let mut txn = store.write_txn("apps/cam/procs/main");
        txn.set_value("maxFileDescriptors", json!(512));
        txn.commit();

        let txn = store.read_txn("apps/cam/procs/main");
        let limits = ProcLimits::from_config(&txn);

        assert_eq!(limits.num_fds, 512);
        assert_eq!(limits.core_dump_file_bytes, ProcLimits::default().core_dump_file_bytes);
    }
}
