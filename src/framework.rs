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

//! Framework-wide state: the shutdown flag and the reboot escape hatch.

use std::sync::atomic::{AtomicBool, Ordering};

static STOPPING: AtomicBool = AtomicBool::new(false);

/// Once set, no app or process start is accepted anymore.
pub fn set_stopping() {
    STOPPING.store(true, Ordering::Relaxed);
}

pub fn is_stopping() -> bool {
    STOPPING.load(Ordering::Relaxed)
}

/// Reboots the device.  There is no state to save; everything that must
/// survive a reboot is already in the config store or on disk.
pub fn reboot() -> ! {
    error!("EMERG: Rebooting system");
    log::logger().flush();

    // sync() first so the logs above actually reach storage.
    unsafe { libc::sync() };

    match nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_AUTOBOOT) {
        // reboot(2) does not return on success.
        Err(e) => panic!("Reboot failed: {}", e),
        Ok(never) => match never {},
    }
}
