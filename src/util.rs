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

use anyhow::{Result, Context};
use std::{
    fs,
    os::unix::io::{FromRawFd, RawFd},
    os::unix::fs::PermissionsExt,
    path::Path,
};
use nix::{
    fcntl::OFlag,
    unistd,
};

/// A pipe whose ends are owned `File`s so they close on drop.
pub struct Pipe {
    pub read: fs::File,
    pub write: fs::File,
}

impl Pipe {
    pub fn new(flags: OFlag) -> Result<Self> {
        let (fd_r, fd_w) = unistd::pipe2(flags).context("Failed to create a pipe")?;
        let read = unsafe { fs::File::from_raw_fd(fd_r) };
        let write = unsafe { fs::File::from_raw_fd(fd_w) };
        Ok(Self { read, write })
    }
}

/// fs::create_dir_all() with error context attached.
pub fn create_dir_all(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))
}

/// Create a directory (and parents) with the given mode bits.
pub fn create_dir_all_mode(dir: &Path, mode: u32) -> Result<()> {
    create_dir_all(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to chmod {}", dir.display()))
}

/// /tmp-like permissions (world-writable + sticky bit).
pub fn set_tmp_like_permissions(path: &Path) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o1777))
        .with_context(|| format!("Failed to chmod {}", path.display()))
}

/// Close an fd, discarding EBADF and EINTR.
pub fn close_fd(fd: RawFd) {
    let _ = unistd::close(fd);
}

/// Close every fd above stderr. Called in the child just before exec so the
/// app does not inherit supervisor descriptors.
pub fn close_all_non_std_fds() {
    for fd in 3..crate::consts::MAX_PROCESS_FD {
        let _ = unistd::close(fd);
    }
}

/// True if `path` is inside `dir` (component-wise; `/foo/bar` is inside
/// `/foo`, `/foobar` is not, and a path is not inside itself).
pub fn path_is_inside(path: &str, dir: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        return path.starts_with('/') && path.len() > 1;
    }

    match path.strip_prefix(dir) {
        Some(rest) => rest.starts_with('/') && rest.len() > 1,
        None => false,
    }
}

/// True if the two strings name the same path once trailing slashes are
/// ignored.
pub fn path_is_equivalent(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}

/// Join a relative destination onto a base directory.  The destination may
/// be given with a leading '/'; it is interpreted relative to the base.
pub fn join_under(base: &Path, rel: &str) -> std::path::PathBuf {
    base.join(rel.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_inside_matches_on_component_boundaries() {
        assert!(path_is_inside("/foo/bar", "/foo"));
        assert!(path_is_inside("/foo/bar/baz", "/foo/"));
        assert!(!path_is_inside("/foobar", "/foo"));
        assert!(!path_is_inside("/foo", "/foo"));
        assert!(!path_is_inside("/foo", "/foo/bar"));
    }

    #[test]
    fn path_equivalence_ignores_trailing_slash() {
        assert!(path_is_equivalent("/dev/shm", "/dev/shm/"));
        assert!(!path_is_equivalent("/dev/shm", "/dev/shmx"));
    }

    #[test]
    fn join_under_strips_leading_slash() {
        assert_eq!(join_under(Path::new("/work"), "/bin/ls"),
                   Path::new("/work/bin/ls"));
        assert_eq!(join_under(Path::new("/work"), "bin/ls"),
                   Path::new("/work/bin/ls"));
    }
}
