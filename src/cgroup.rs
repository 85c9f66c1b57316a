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

//! Freezer cgroup handling.
//!
//! One freezer group per app at `<root>/freezer/<appName>`.  The group both
//! enumerates every descendant of the app (including forks the supervisor
//! never heard of) and lets us pause them all so a kill signal cannot be
//! raced by a fork.

use anyhow::{Result, Context};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use crate::consts::*;

#[derive(Debug, PartialEq, Eq)]
pub enum FreezeState {
    Thawed,
    Freezing,
    Frozen,
}

pub struct Cgroups {
    root: PathBuf,
}

impl Cgroups {
    pub fn new() -> Self {
        Self::with_root(Path::new(CGROUP_ROOT))
    }

    pub fn with_root(root: &Path) -> Self {
        Self { root: root.to_owned() }
    }

    fn freezer_dir(&self, app_name: &str) -> PathBuf {
        self.root.join("freezer").join(app_name)
    }

    /// Create the app's freezer group with release notification enabled so
    /// the kernel tells us when the group empties.
    pub fn create_app(&self, app_name: &str) -> Result<()> {
        let dir = self.freezer_dir(app_name);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create cgroup {}", dir.display()))?;

        fs::write(dir.join("notify_on_release"), "1")
            .with_context(|| format!("Failed to enable release notification for '{}'", app_name))?;

        Ok(())
    }

    pub fn remove_app(&self, app_name: &str) {
        let dir = self.freezer_dir(app_name);
        if let Err(e) = fs::remove_dir(&dir) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Could not remove cgroup {}: {}", dir.display(), e);
            }
        }
    }

    pub fn add_proc(&self, app_name: &str, pid: Pid) -> Result<()> {
        let path = self.freezer_dir(app_name).join("cgroup.procs");
        fs::write(&path, pid.to_string())
            .with_context(|| format!("Failed to add pid {} to cgroup of '{}'", pid, app_name))
    }

    /// All pids currently in the app's group, descendants included.
    pub fn pids(&self, app_name: &str) -> Vec<Pid> {
        let path = self.freezer_dir(app_name).join("cgroup.procs");
        fs::read_to_string(&path).unwrap_or_default()
            .lines()
            .filter_map(|l| l.trim().parse::<i32>().ok())
            .map(Pid::from_raw)
            .collect()
    }

    pub fn is_empty(&self, app_name: &str) -> bool {
        self.pids(app_name).is_empty()
    }

    pub fn freeze(&self, app_name: &str) -> Result<()> {
        self.write_state(app_name, "FROZEN")
    }

    pub fn thaw(&self, app_name: &str) -> Result<()> {
        self.write_state(app_name, "THAWED")
    }

    fn write_state(&self, app_name: &str, state: &str) -> Result<()> {
        let path = self.freezer_dir(app_name).join("freezer.state");
        fs::write(&path, state)
            .with_context(|| format!("Failed to set freezer state {} for '{}'", state, app_name))
    }

    pub fn freeze_state(&self, app_name: &str) -> Result<FreezeState> {
        let path = self.freezer_dir(app_name).join("freezer.state");
        let s = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read freezer state of '{}'", app_name))?;

        Ok(match s.trim() {
            "FROZEN" => FreezeState::Frozen,
            "FREEZING" => FreezeState::Freezing,
            _ => FreezeState::Thawed,
        })
    }

    /// Polls until the group reports FROZEN, bounded by FREEZE_TIMEOUT.
    /// Freezing normally completes within a few scheduler ticks.
    pub fn wait_frozen(&self, app_name: &str) -> Result<()> {
        let deadline = Instant::now() + FREEZE_TIMEOUT;

        loop {
            if self.freeze_state(app_name)? == FreezeState::Frozen {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("App '{}' did not freeze within {:?}", app_name, FREEZE_TIMEOUT);
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Signal every pid in the group.  Returns the number of pids signaled.
    pub fn send_signal(&self, app_name: &str, sig: Signal) -> usize {
        let pids = self.pids(app_name);

        for pid in &pids {
            if let Err(e) = signal::kill(*pid, sig) {
                // The process may have exited between enumeration and kill.
                debug!("kill({}, {}) failed: {}", pid, sig, e);
            }
        }

        pids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(tag: &str) -> Cgroups {
        let root = std::env::temp_dir()
            .join(format!("av-cgroup-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        Cgroups::with_root(&root)
    }

    #[test]
    fn create_enables_release_notification() {
        let cg = scratch("create");
        cg.create_app("cam").unwrap();

        let flag = cg.freezer_dir("cam").join("notify_on_release");
        assert_eq!(fs::read_to_string(flag).unwrap(), "1");
    }

    #[test]
    fn empty_group_reports_no_pids() {
        let cg = scratch("empty");
        cg.create_app("cam").unwrap();
        fs::write(cg.freezer_dir("cam").join("cgroup.procs"), "").unwrap();

        assert!(cg.is_empty("cam"));
        assert_eq!(cg.send_signal("cam", Signal::SIGTERM), 0);
    }

    #[test]
    fn frozen_state_parses() {
        let cg = scratch("state");
        cg.create_app("cam").unwrap();

        fs::write(cg.freezer_dir("cam").join("freezer.state"), "FROZEN\n").unwrap();
        assert_eq!(cg.freeze_state("cam").unwrap(), FreezeState::Frozen);
        cg.wait_frozen("cam").unwrap();

        fs::write(cg.freezer_dir("cam").join("freezer.state"), "THAWED\n").unwrap();
        assert_eq!(cg.freeze_state("cam").unwrap(), FreezeState::Thawed);
    }
}
