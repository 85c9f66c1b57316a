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

//! Identity derivation for apps.
//!
//! Account creation belongs to the installer; the supervisor only needs the
//! numeric ids.  Sandboxed apps get a uid/gid derived deterministically
//! from the app name so the same app always runs under the same identity,
//! with or without a passwd entry.

use anyhow::Result;
use std::ffi::CString;
use nix::unistd::{Uid, Gid};

/// First uid of the range reserved for apps.
const APP_UID_BASE: u32 = 10000;

/// Number of uids in the app range.
const APP_UID_RANGE: u32 = 20000;

/// FNV-1a, stable across builds and platforms.
fn fnv1a(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in data {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// uid/gid for a sandboxed app.  Never 0.
pub fn app_ids(app_name: &str) -> (Uid, Gid) {
    let id = APP_UID_BASE + (fnv1a(app_name.as_bytes()) % u64::from(APP_UID_RANGE)) as u32;
    (Uid::from_raw(id), Gid::from_raw(id))
}

/// Resolves a supplementary group name to its gid via the group database.
pub fn lookup_group(name: &str) -> Result<Gid> {
    let c_name = CString::new(name)?;

    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut buf = [0 as libc::c_char; 1024];
    let mut result: *mut libc::group = std::ptr::null_mut();

    let rc = unsafe {
        libc::getgrnam_r(c_name.as_ptr(), &mut grp,
                         buf.as_mut_ptr(), buf.len(), &mut result)
    };

    if rc != 0 {
        bail!("Failed to look up group '{}': errno {}", name, rc);
    }
    if result.is_null() {
        bail!("Group '{}' does not exist", name);
    }

    Ok(Gid::from_raw(grp.gr_gid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_ids_are_deterministic_and_unprivileged() {
        let (uid1, gid1) = app_ids("camService");
        let (uid2, gid2) = app_ids("camService");
        assert_eq!(uid1, uid2);
        assert_eq!(gid1, gid2);
        assert!(uid1.as_raw() >= APP_UID_BASE);
        assert!(uid1.as_raw() < APP_UID_BASE + APP_UID_RANGE);
    }

    #[test]
    fn different_apps_usually_get_different_ids() {
        let (a, _) = app_ids("camService");
        let (b, _) = app_ids("gpsService");
        assert_ne!(a, b);
    }
}
