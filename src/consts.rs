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

use std::time::{Duration, Instant};
use std::path::PathBuf;

lazy_static! {
    pub static ref START_TIME: Instant = Instant::now();

    pub static ref INVOCATION_ID: String = {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        (0..6).map(|_| rng.gen_range(b'A', b'Z'+1) as char).collect()
    };

    pub static ref AV_DIR: PathBuf = PathBuf::from("/var/run/appvisor");
    pub static ref AV_LOG_DIR: PathBuf = AV_DIR.join("logs");
    pub static ref CTRL_SOCKET_PATH: PathBuf = AV_DIR.join("ctrl.sock");
    pub static ref LOGD_SOCKET_PATH: PathBuf = AV_DIR.join("logd.sock");

    pub static ref CONFIG_PATH: PathBuf = PathBuf::from("/etc/appvisor/config.json");
}

/// Read-only app bundles live under `<APPS_INSTALL_DIR>/<appName>/read-only/{bin,lib,...}`.
pub const APPS_INSTALL_DIR: &str = "/opt/appvisor/apps";

/// Each app's writeable area, and the chroot root when sandboxed.
pub const APPS_WRITEABLE_DIR: &str = "/var/run/appvisor/apps";

pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";
pub const SMACKFS_ROOT: &str = "/sys/fs/smackfs";

pub const SYSTEM_MODULE_DIR: &str = "/opt/appvisor/modules";
pub const INSMOD_BIN: &str = "/sbin/insmod";
pub const RMMOD_BIN: &str = "/sbin/rmmod";

/// Invoked with (appName, procName, "REBOOT"?) to persist logs and cores after a fault.
pub const SAVE_LOGS_BIN: &str = "/usr/libexec/appvisor/save-logs";

pub const MAX_APP_NAME_LEN: usize = 47;
pub const MAX_PROC_NAME_LEN: usize = 47;
pub const MAX_NUM_SUPPLEMENTARY_GROUPS: usize = 10;

/// Longest label: "app." + name + "." + perms.
pub const MAX_SMACK_LABEL_LEN: usize = MAX_APP_NAME_LEN + 9;

/// Auxiliary process names take the form `<exe>@N`, N < MAX_AUX_PROCS.
pub const MAX_AUX_PROCS: usize = 32;

/// Grace period between SIGTERM and SIGKILL when stopping an app.
pub const KILL_TIMEOUT: Duration = Duration::from_secs(1);

/// Total time to wait for the freezer to report FROZEN.
pub const FREEZE_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a script-installed module may take to reach the "Live" state
/// before the system is rebooted.
pub const MODULE_LIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Two faults of the same process within this window exceed the fault limit.
pub const FAULT_LIMIT_INTERVAL: Duration = Duration::from_secs(10);

/// Bound on the unmount passes made while tearing down a sandbox.
pub const MAX_UNMOUNT_PASSES: u32 = 20;

/// Fixed size of the per-app tmpfs mounted at <workingDir>/tmp.
pub const APP_TMPFS_SIZE: usize = 90 * 1024;

pub const MAX_PROCESS_FD: i32 = 1024;

/// Default PATH given to processes that have no config entry.
pub const SANDBOXED_DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
pub const UNSANDBOXED_DEFAULT_PATH: &str =
    "/usr/local/bin:/usr/bin:/bin:/usr/local/sbin:/usr/sbin:/sbin";
