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

//! SMACK primitives: subject/object labels and the allow-rule table.
//!
//! Rules are written to `<smackfs>/load2` as "subject object access".
//! Object labels live in the `security.SMACK64` xattr.  On kernels without
//! smackfs every mutation degrades to a no-op with a one-time warning, so
//! the rest of the supervisor does not need to care.

use anyhow::{Result, Context};
use std::{
    ffi::CString,
    fs,
    io::Write,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};
use crate::consts::*;

/// The wildcard object label: accessible to every subject.
pub const LABEL_WILDCARD: &str = "*";
pub const LABEL_FLOOR: &str = "_";
pub const LABEL_FRAMEWORK: &str = "framework";
pub const LABEL_ADMIN: &str = "admin";
pub const LABEL_SYSLOG: &str = "syslog";

pub struct Smack {
    fs_root: PathBuf,
    enabled: bool,
}

impl Smack {
    pub fn new() -> Self {
        Self::with_root(Path::new(SMACKFS_ROOT))
    }

    /// Tests point this at a scratch directory to observe the written rules.
    pub fn with_root(fs_root: &Path) -> Self {
        let enabled = fs_root.exists();
        if !enabled {
            warn!("smackfs not present at {}; MAC rules are disabled",
                  fs_root.display());
        }

        Self { fs_root: fs_root.to_owned(), enabled }
    }

    pub fn app_label(app_name: &str) -> String {
        format!("app.{}", app_name)
    }

    /// Label carried by the app's own files for a given permission class
    /// ("r", "rw", "rwx", ...).
    pub fn app_access_label(app_name: &str, perms: &str) -> String {
        format!("app.{}.{}", app_name, perms)
    }

    /// Label for a device node, derived from the device id so every app
    /// that imports the same device shares one label.
    pub fn dev_label(rdev: u64) -> String {
        format!("dev.{}.{}", libc::major(rdev), libc::minor(rdev))
    }

    /// Install an allow rule: subject may access object with `access`.
    pub fn set_rule(&self, subject: &str, access: &str, object: &str) {
        if !self.enabled {
            return;
        }

        debug_assert!(subject.len() <= MAX_SMACK_LABEL_LEN);
        debug_assert!(object.len() <= MAX_SMACK_LABEL_LEN);

        let rule = format!("{} {} {}", subject, object, access);

        if let Err(e) = append_to(&self.fs_root.join("load2"), &rule) {
            error!("Failed to install rule '{}': {}", rule, e);
        }
    }

    /// Remove every rule in which the given label appears as the subject.
    pub fn revoke_subject(&self, subject: &str) {
        if !self.enabled {
            return;
        }

        if let Err(e) = append_to(&self.fs_root.join("revoke-subject"), subject) {
            error!("Failed to revoke subject '{}': {}", subject, e);
        }
    }

    /// Set the label of a file system object.
    pub fn set_label(&self, path: &Path, label: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let c_path = CString::new(path.as_os_str().as_bytes())?;
        let c_name = CString::new("security.SMACK64")?;

        let rc = unsafe {
            libc::setxattr(c_path.as_ptr(), c_name.as_ptr(),
                           label.as_ptr() as *const libc::c_void, label.len(), 0)
        };

        if rc != 0 {
            let err = std::io::Error::last_os_error();

            // A kernel with smackfs mounted but the LSM inactive rejects
            // security xattrs; treat that as the disabled case.
            match err.raw_os_error() {
                Some(libc::EOPNOTSUPP) | Some(libc::EPERM) => {
                    debug!("Cannot label {} (SMACK inactive): {}", path.display(), err);
                    return Ok(());
                }
                _ => {
                    return Err(err).with_context(|| format!(
                        "Failed to set label '{}' on {}", label, path.display()));
                }
            }
        }

        Ok(())
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

/// Set the calling process's own subject label.  Called between fork and
/// exec; tolerates a kernel without SMACK.
pub fn set_my_label(label: &str) -> Result<()> {
    match fs::write("/proc/self/attr/current", label) {
        Ok(()) => Ok(()),
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to set own label to '{}'", label)),
    }
}

fn append_to(path: &Path, line: &str) -> Result<()> {
    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    f.write_all(line.as_bytes())?;
    f.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
pub mod testfs {
    use super::*;

    /// A scratch smackfs for tests; returns (Smack, rules file path).
    pub fn scratch(tag: &str) -> (Smack, PathBuf) {
        let root = std::env::temp_dir()
            .join(format!("av-smack-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        let load2 = root.join("load2");
        (Smack::with_root(&root), load2)
    }

    pub fn rules(load2: &Path) -> Vec<String> {
        fs::read_to_string(load2).unwrap_or_default()
            .lines().map(str::to_owned).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_stable() {
        assert_eq!(Smack::app_label("cam"), "app.cam");
        assert_eq!(Smack::app_access_label("cam", "rw"), "app.cam.rw");
    }

    #[test]
    fn dev_labels_share_by_device_id() {
        let tty0 = libc::makedev(4, 64);
        let tty1 = libc::makedev(4, 65);
        assert_eq!(Smack::dev_label(tty0), Smack::dev_label(libc::makedev(4, 64)));
        assert_ne!(Smack::dev_label(tty0), Smack::dev_label(tty1));
    }

    #[test]
    fn rules_are_appended_to_load2() {
        let (smack, load2) = testfs::scratch("rules");

        smack.set_rule("app.cam", "rwx", "framework");
        smack.set_rule("framework", "rwx", "app.cam");

        assert_eq!(testfs::rules(&load2), vec![
            "app.cam framework rwx",
            "framework app.cam rwx",
        ]);
    }

    #[test]
    fn missing_smackfs_disables_everything() {
        let smack = Smack::with_root(Path::new("/nonexistent/smackfs"));
        assert!(!smack.enabled());
        // Must not error or create anything.
        smack.set_rule("a", "r", "b");
        smack.revoke_subject("a");
        smack.set_label(Path::new("/nonexistent/file"), "x").unwrap();
    }
}
