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

//! Sandbox assembly and teardown.
//!
//! A sandbox is a chroot plus bind mounts plus a MAC label scheme, not a
//! namespace.  The app's working directory becomes its root; everything
//! the app may see is linked in: bind mounts for sandboxed apps, symlinks
//! for unsandboxed ones.
//!
//! Link creation is two-phase.  A plan is assembled first, kept sorted by
//! destination so a directory is always mounted before anything that lands
//! inside it, and rejecting plans that would mount app content over system
//! paths (or the reverse).  Only then is the plan applied.

use anyhow::{Result, Context};
use std::{
    fs,
    io::ErrorKind,
    os::unix::fs::{symlink, FileTypeExt, MetadataExt, OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
};
use nix::{
    mount::{mount, umount2, MsFlags, MntFlags},
    unistd::{self, Uid, Gid},
};
use crate::{
    app::App,
    consts::*,
    error::Kind,
    smack::Smack,
    util::{self, path_is_inside, path_is_equivalent, join_under},
};

/// A link with a permission string, used for the platform defaults.  The
/// permission is only meaningful for device nodes, where it drives the
/// default device MAC rules.
pub struct DefaultLink {
    pub src: &'static str,
    pub dest: &'static str,
    pub perm: &'static str,
}

/// Files every sandboxed app gets: the loader, the core libraries, and the
/// basic devices.
pub const DEFAULT_LINKS: &[DefaultLink] = &[
    DefaultLink { src: "/lib/ld-linux.so.3",      dest: "/lib/", perm: "" },
    DefaultLink { src: "/lib/libc.so.6",          dest: "/lib/", perm: "" },
    DefaultLink { src: "/lib/libpthread.so.0",    dest: "/lib/", perm: "" },
    DefaultLink { src: "/lib/librt.so.1",         dest: "/lib/", perm: "" },
    DefaultLink { src: "/lib/libdl.so.2",         dest: "/lib/", perm: "" },
    DefaultLink { src: "/lib/libm.so.6",          dest: "/lib/", perm: "" },
    DefaultLink { src: "/lib/libgcc_s.so.1",      dest: "/lib/", perm: "" },
    DefaultLink { src: "/dev/log",                dest: "/dev/", perm: "w" },
    DefaultLink { src: "/dev/null",               dest: "/dev/", perm: "rw" },
    DefaultLink { src: "/dev/zero",               dest: "/dev/", perm: "r" },
    DefaultLink { src: "/dev/urandom",            dest: "/dev/", perm: "r" },
];

/// IPC endpoints linked under /tmp once the sandbox tmpfs is mounted.
pub const DEFAULT_TMP_LINKS: &[DefaultLink] = &[
    DefaultLink { src: "/var/run/appvisor/svcdir-server.sock", dest: "/tmp/appvisor/", perm: "" },
    DefaultLink { src: "/var/run/appvisor/svcdir-client.sock", dest: "/tmp/appvisor/", perm: "" },
];

/// One planned link.  The source is always absolute; the destination is
/// relative to the app's working directory (with a leading '/').
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEntry {
    pub src: String,
    pub dest: String,
}

/// The ordered set of links to materialize.  Kept sorted by destination so
/// that for any two entries where one destination prefixes the other, the
/// outer one comes first.
#[derive(Default)]
pub struct LinkPlan {
    entries: Vec<LinkEntry>,
}

impl LinkPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[LinkEntry] {
        &self.entries
    }

    /// Inserts a link at its sorted position.  If the new entry nests with
    /// an existing one, the inner entry's source must come from inside the
    /// app's install tree; anything else would let a link escape the app's
    /// view and is rejected.
    pub fn add(&mut self, install_dir: &Path, src: &str, dest: &str) -> Result<()> {
        assert!(src.starts_with('/'), "link source '{}' is not absolute", src);

        let dest = resolve_dest(src, dest);
        let new = LinkEntry { src: src.to_owned(), dest };
        let install = install_dir.to_string_lossy();

        let mut insert_at = self.entries.len();

        for (i, old) in self.entries.iter().enumerate() {
            if path_is_inside(&new.dest, &old.dest) {
                if !path_is_inside(&old.src, &install) {
                    bail!("Bind-mounting into a directory outside the app is not permitted. \
                           Rejecting attempt to mount at '{}' which is mounted from '{}'.",
                          new.dest, old.src);
                }
            } else if path_is_inside(&old.dest, &new.dest) {
                if !path_is_inside(&new.src, &install) {
                    bail!("Bind-mounting into a directory outside the app is not permitted. \
                           Rejecting attempt to mount at '{}' which is mounted from '{}'.",
                          old.dest, new.src);
                }
            }

            if new.dest < old.dest {
                insert_at = i;
                break;
            }
        }

        self.entries.insert(insert_at, new);
        Ok(())
    }
}

/// A destination ending in '/' takes the base name of the source.
fn resolve_dest(src: &str, dest: &str) -> String {
    if dest.ends_with('/') {
        let base = src.rsplit('/').next().unwrap_or("");
        format!("{}{}", dest, base)
    } else {
        dest.to_owned()
    }
}

/// Builds the complete link plan for an app from the platform defaults,
/// the app's lib/ and bin/ trees, and its bundles/requires config.
fn build_link_plan(app: &App, store: &crate::config::Store) -> Result<LinkPlan> {
    let mut plan = LinkPlan::new();
    let install_dir = app.install_dir();

    // Platform defaults first, so the app's own config can override them.
    if app.sandboxed() {
        for link in DEFAULT_LINKS {
            plan.add(install_dir, link.src, link.dest)?;
        }
    }

    // The app's lib and bin trees, file by file.
    let ro = install_dir.join("read-only");
    add_tree_to_plan(&mut plan, install_dir, &ro.join("lib"), "/lib")?;
    add_tree_to_plan(&mut plan, install_dir, &ro.join("bin"), "/bin")?;

    let cfg = store.read_txn(app.cfg_path());

    // Read-only bundles.  Writeable bundles are copied by the installer and
    // are none of our business.
    for section in &["bundles/dirs", "bundles/files"] {
        let expand_dirs = section.ends_with("dirs");

        for entry in cfg.child(section).elements() {
            if entry.get_bool("isWritable", false) {
                continue;
            }

            let src = bundled_src_path(app, &entry.get_str("src", ""))?;
            let dest = required_dest_path(&entry)?;

            if expand_dirs {
                add_tree_to_plan(&mut plan, install_dir, Path::new(&src), &dest)?;
            } else {
                plan.add(install_dir, &src, &dest)?;
            }
        }
    }

    // Required files, directories and devices from the host.
    for section in &["requires/dirs", "requires/files", "requires/devices"] {
        for entry in cfg.child(section).elements() {
            let src = required_src_path(&entry)?;
            let dest = required_dest_path(&entry)?;
            plan.add(install_dir, &src, &dest)?;
        }
    }

    Ok(plan)
}

/// Adds one plan entry per regular file or symlink under `src_dir`,
/// mirroring the subtree under `dest_dir`.  Traversal order is
/// deterministic (lexicographic).
fn add_tree_to_plan(plan: &mut LinkPlan, install_dir: &Path, src_dir: &Path, dest_dir: &str)
    -> Result<()>
{
    if !src_dir.is_dir() {
        // Apps without a lib/ or bin/ tree are fine.
        return Ok(());
    }

    let base_dest = resolve_dest(&src_dir.to_string_lossy(), dest_dir);

    let walker = walkdir::WalkDir::new(src_dir)
        .follow_links(false)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry.with_context(||
            format!("Could not read directory {}", src_dir.display()))?;

        if entry.file_type().is_dir() {
            continue;
        }

        let rel = entry.path().strip_prefix(src_dir).unwrap();
        let dest = format!("{}/{}", base_dest.trim_end_matches('/'),
                           rel.to_string_lossy());

        plan.add(install_dir, &entry.path().to_string_lossy(), &dest)?;
    }

    Ok(())
}

fn bundled_src_path(app: &App, src: &str) -> Result<String> {
    if src.is_empty() {
        bail!("Empty source file path supplied for app {}", app.name());
    }

    if src.starts_with('/') {
        Ok(src.to_owned())
    } else {
        // Relative bundle paths live under the read-only install tree.
        Ok(format!("{}/read-only/{}", app.install_dir().display(), src))
    }
}

fn required_src_path(entry: &crate::config::ReadTxn) -> Result<String> {
    let src = entry.get_str("src", "");
    if src.is_empty() {
        bail!("Empty src path supplied");
    }
    Ok(src)
}

fn required_dest_path(entry: &crate::config::ReadTxn) -> Result<String> {
    let dest = entry.get_str("dest", "");
    if dest.is_empty() {
        bail!("Empty dest path supplied");
    }
    Ok(dest)
}

/// Sets up the app's execution area: the working directory, and every link
/// in the plan.  For sandboxed apps the working directory is additionally
/// bind-mounted onto itself so teardown can always lazy-unmount it.
pub fn setup_area(app: &App, store: &crate::config::Store, smack: &Smack) -> Result<()> {
    let dir_label = Smack::app_access_label(app.name(), "rwx");

    make_dir_smack(app.working_dir(), 0o507, &dir_label, smack)?;

    if app.sandboxed() && !is_mount_point(app.working_dir())? {
        mount(Some(app.working_dir()), app.working_dir(),
              None::<&str>, MsFlags::MS_BIND, None::<&str>)
            .with_context(|| format!("Couldn't bind mount '{}' unto itself",
                                     app.working_dir().display()))?;
    }

    let plan = build_link_plan(app, store)?;

    for entry in plan.entries() {
        apply_link(app, &dir_label, smack, &entry.src, &entry.dest)?;
    }

    Ok(())
}

/// Creates a link for one plan entry, dispatching on the source type.
fn apply_link(app: &App, dir_label: &str, smack: &Smack, src: &str, dest: &str) -> Result<()> {
    let meta = fs::metadata(src)
        .with_context(|| format!("Could not stat file at '{}'", src))?;

    if meta.is_dir() {
        create_dir_link(app, dir_label, smack, src, dest)?;

        // A required /dev/shm directory is shared with everyone.
        if path_is_equivalent("/dev/shm", src) || path_is_inside(src, "/dev/shm") {
            smack.set_label(Path::new(src), crate::smack::LABEL_WILDCARD)?;
        }

        Ok(())
    } else {
        create_file_link(app, dir_label, smack, src, dest)
    }
}

/// Create the sandbox /tmp: a tmpfs of fixed size whose root carries the
/// app's directory label.
pub fn create_tmp_fs(app: &App, smack: &Smack) -> Result<()> {
    let dir_label = Smack::app_access_label(app.name(), "rwx");
    let tmp_path = app.working_dir().join("tmp");

    make_dir_smack(&tmp_path, 0o007, &dir_label, smack)?;

    let opts = format!("size={},mode={:04o},uid=0,gid=0,smackfsdef={},smackfsroot={}",
                       APP_TMPFS_SIZE, 0o007, dir_label, dir_label);

    // Unmount any instance left over from a previous run.
    try_lazy_umount(&tmp_path);

    mount(Some("tmpfs"), &tmp_path, Some("tmpfs"), MsFlags::MS_NOSUID, Some(opts.as_str()))
        .with_context(|| format!("Could not mount tmpfs for sandbox '{}'", app.name()))?;

    info!("Mounted tmpfs at {}.", tmp_path.display());

    smack.set_label(&tmp_path, &dir_label)
}

/// Links the default IPC endpoints into the freshly mounted /tmp.
pub fn create_default_tmp_links(app: &App, smack: &Smack) -> Result<()> {
    let dir_label = Smack::app_access_label(app.name(), "rwx");

    for link in DEFAULT_TMP_LINKS {
        create_file_link(app, &dir_label, smack, link.src, link.dest)?;
    }

    Ok(())
}

fn create_dir_link(app: &App, dir_label: &str, smack: &Smack, src: &str, dest: &str)
    -> Result<()>
{
    let src_meta = fs::metadata(src)
        .with_context(|| format!("Could not stat file at '{}'", src))?;

    if !src_meta.is_dir() {
        bail!("'{}' is not a directory.", src);
    }

    let dest_path = abs_dest_path(app.working_dir(), src, dest);

    create_intermediate_dirs(&dest_path, dir_label, smack)?;

    if link_exists(app, &src_meta, &dest_path) {
        info!("Skipping directory link '{}' to '{}': Already exists", src, dest_path.display());
        return Ok(());
    }

    if app.sandboxed() {
        make_dir_smack(&dest_path, 0o505, dir_label, smack)?;

        mount(Some(src), &dest_path, None::<&str>, MsFlags::MS_BIND, None::<&str>)
            .with_context(|| format!("Couldn't bind mount from '{}' to '{}'",
                                     src, dest_path.display()))?;
    } else {
        symlink(src, &dest_path)
            .with_context(|| format!("Could not create symlink from '{}' to '{}'",
                                     src, dest_path.display()))?;
    }

    info!("Created directory link '{}' to '{}'.", src, dest_path.display());

    Ok(())
}

fn create_file_link(app: &App, dir_label: &str, smack: &Smack, src: &str, dest: &str)
    -> Result<()>
{
    let src_meta = fs::metadata(src)
        .with_context(|| format!("Could not stat file at '{}'", src))?;

    if src_meta.is_dir() {
        bail!("'{}' is a directory.", src);
    }

    let dest_path = abs_dest_path(app.working_dir(), src, dest);

    create_intermediate_dirs(&dest_path, dir_label, smack)?;

    // Shared memory is expected to be shared with other apps and host
    // processes, so the source gets the wildcard label and no private link.
    if path_is_equivalent("/dev/shm", src) || path_is_inside(src, "/dev/shm") {
        return smack.set_label(Path::new(src), crate::smack::LABEL_WILDCARD);
    }

    if link_exists(app, &src_meta, &dest_path) {
        info!("Skipping file link '{}' to '{}': Already exists", src, dest_path.display());
        return Ok(());
    }

    let file_type = src_meta.file_type();

    if !app.sandboxed() {
        symlink(src, &dest_path)
            .with_context(|| format!("Could not create symlink from '{}' to '{}'",
                                     src, dest_path.display()))?;
    } else if file_type.is_char_device() || file_type.is_block_device() {
        // Devices get a fresh node rather than a bind mount, labeled by
        // device id so apps sharing the device share the label.
        let dev_label = Smack::dev_label(src_meta.rdev());

        let kind = if file_type.is_char_device() { libc::S_IFCHR } else { libc::S_IFBLK };

        mknod_at(&dest_path, kind | 0o600, src_meta.rdev())
            .with_context(|| format!("Could not create device '{}'", dest_path.display()))?;

        smack.set_label(&dest_path, &dev_label)
            .with_context(|| format!("Failed to set label for device '{}'",
                                     dest_path.display()))?;

        // Gift the device to the app.
        unistd::chown(&dest_path, Some(app.uid()), Some(app.gid()))
            .with_context(|| format!("Could not assign device '{}' to app",
                                     dest_path.display()))?;
    } else {
        // Bind mounts need an existing mount point.  Append mode so a
        // pre-existing file is not truncated.
        fs::OpenOptions::new()
            .append(true)
            .create(true)
            .mode(0o400)
            .open(&dest_path)
            .with_context(|| format!("Could not create file '{}'", dest_path.display()))?;

        mount(Some(src), &dest_path, None::<&str>, MsFlags::MS_BIND, None::<&str>)
            .with_context(|| format!("Couldn't bind mount from '{}' to '{}'",
                                     src, dest_path.display()))?;
    }

    info!("Created file link '{}' to '{}'.", src, dest_path.display());

    Ok(())
}

fn abs_dest_path(working_dir: &Path, src: &str, dest: &str) -> PathBuf {
    join_under(working_dir, &resolve_dest(src, dest))
}

fn mknod_at(path: &Path, mode: libc::mode_t, dev: u64) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())?;

    if unsafe { libc::mknod(c_path.as_ptr(), mode, dev) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    Ok(())
}

fn create_intermediate_dirs(dest_path: &Path, label: &str, smack: &Smack) -> Result<()> {
    if let Some(dir) = dest_path.parent() {
        make_dir_path_smack(dir, 0o505, label, smack)?;
    }
    Ok(())
}

fn make_dir_smack(dir: &Path, mode: u32, label: &str, smack: &Smack) -> Result<()> {
    let existed = dir.exists();
    util::create_dir_all_mode(dir, mode)?;
    if !existed {
        smack.set_label(dir, label)?;
    }
    Ok(())
}

/// Creates each missing component of the path with the given mode and
/// label; existing components are left untouched.
fn make_dir_path_smack(dir: &Path, mode: u32, label: &str, smack: &Smack) -> Result<()> {
    let mut partial = PathBuf::from("/");

    for comp in dir.components() {
        partial.push(comp);
        if !partial.exists() {
            fs::create_dir(&partial)
                .with_context(|| format!("Failed to create directory {}", partial.display()))?;
            fs::set_permissions(&partial, fs::Permissions::from_mode(mode))?;
            smack.set_label(&partial, label)?;
        }
    }

    Ok(())
}

/// Whether the destination of a link already refers to the same underlying
/// object.  A stale link in an unsandboxed app is deleted so it can be
/// re-created.
fn link_exists(app: &App, src_meta: &fs::Metadata, dest_path: &Path) -> bool {
    let dest_meta = match fs::metadata(dest_path) {
        Ok(m) => m,
        Err(ref e) if e.kind() == ErrorKind::NotFound => return false,
        Err(e) => {
            warn!("Could not stat file at '{}'. {}", dest_path.display(), e);
            return false;
        }
    };

    let src_type = src_meta.file_type();

    if src_type.is_char_device() || src_type.is_block_device() {
        // A created device node shares the device number but not the inode.
        if src_meta.rdev() == dest_meta.rdev() && src_meta.ino() != dest_meta.ino() {
            return true;
        }
    } else if src_meta.ino() == dest_meta.ino() && src_meta.dev() == dest_meta.dev() {
        return true;
    }

    if !app.sandboxed() {
        if let Err(e) = fs::remove_file(dest_path) {
            warn!("Could not delete {}. {}", dest_path.display(), e);
        }
    }

    false
}

/// Tears the app area down: every mount inside the working directory is
/// lazily unmounted and its mount point deleted, in repeated passes since
/// mounts can stack, then the working directory itself is unmounted and
/// removed.
pub fn remove_area(app: &App) -> Result<()> {
    let working_dir = app.working_dir().to_string_lossy().into_owned();

    let mut passes = MAX_UNMOUNT_PASSES;

    loop {
        let inside = mounts_inside(&read_mount_points(Path::new("/proc/mounts"))?,
                                   &working_dir);

        if inside.is_empty() || passes == 0 {
            break;
        }
        passes -= 1;

        for mnt in inside {
            debug!("Unmounting {}", mnt.display());

            match umount2(&mnt, MntFlags::MNT_DETACH) {
                Ok(()) | Err(nix::Error::Sys(nix::errno::Errno::ENOENT)) => {}
                Err(e) => bail!("Failed to unmount '{}': {}", mnt.display(), e),
            }

            // The mount point may still be busy (stacked mounts) or already
            // gone; both resolve on a later pass.
            if let Err(e) = remove_any(&mnt) {
                match e.kind() {
                    ErrorKind::NotFound => {}
                    _ if e.raw_os_error() == Some(libc::EBUSY) => {}
                    _ => bail!("Could not delete file '{}': {}", mnt.display(), e),
                }
            }
        }
    }

    debug!("Unmounting {}", working_dir);
    match umount2(app.working_dir(), MntFlags::MNT_DETACH) {
        Ok(()) => {}
        Err(nix::Error::Sys(nix::errno::Errno::ENOENT)) => {}
        Err(nix::Error::Sys(nix::errno::Errno::EINVAL)) => {}
        Err(e) => bail!("Failed to unmount '{}': {}", working_dir, e),
    }

    match fs::remove_dir_all(app.working_dir()) {
        Ok(()) => {}
        Err(ref e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(||
            format!("Could not delete folder '{}'", working_dir)),
    }

    info!("'{}' sandbox removed.", app.name());

    Ok(())
}

fn remove_any(path: &Path) -> std::io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    }
}

/// Mount points strictly inside the directory, deepest first so inner
/// mounts go before the directories containing them.
fn mounts_inside(mounts: &[PathBuf], dir: &str) -> Vec<PathBuf> {
    let mut inside: Vec<PathBuf> = mounts.iter()
        .filter(|m| path_is_inside(&m.to_string_lossy(), dir))
        .cloned()
        .collect();

    inside.sort_by(|a, b| b.cmp(a));
    inside
}

/// Parses the kernel's mount table.  Mount points with special characters
/// are octal-escaped (`\040` for space).
fn read_mount_points(table: &Path) -> Result<Vec<PathBuf>> {
    let data = fs::read_to_string(table)
        .with_context(|| format!("Could not read '{}'", table.display()))?;

    Ok(data.lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_mount_path)
        .map(PathBuf::from)
        .collect())
}

fn unescape_mount_path(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            if let Ok(v) = u8::from_str_radix(&s[i + 1..i + 4], 8) {
                out.push(v as char);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }

    out
}

pub fn is_mount_point(path: &Path) -> Result<bool> {
    let mounts = read_mount_points(Path::new("/proc/mounts"))?;
    Ok(mounts.iter().any(|m| m == path))
}

pub fn try_lazy_umount(path: &Path) {
    if let Err(e) = umount2(path, MntFlags::MNT_DETACH) {
        debug!("Lazy unmount of {} failed: {}", path.display(), e);
    }
}

/// Adds a single extra link into a (running) app.  Paths under /proc and
/// /sys import the entire tree since the kernel creates files there
/// dynamically.  Returns the destination recorded for later teardown.
pub fn add_link(app: &App, smack: &Smack, path: &str) -> Result<String> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(ref e) if e.kind() == ErrorKind::NotFound => {
            bail_kind!(Kind::NotFound, "No file at '{}'", path);
        }
        Err(ref e) if e.raw_os_error() == Some(libc::ENOTDIR) => {
            bail_kind!(Kind::NotFound, "No file at '{}'", path);
        }
        Err(e) => panic!("Could not stat path {}: {}", path, e),
    };

    if meta.is_dir() {
        bail_kind!(Kind::NotFound, "'{}' is a directory", path);
    }

    let (dest, is_dir) =
        if path_is_equivalent("/proc", path) || path_is_inside(path, "/proc") {
            ("/proc".to_owned(), true)
        } else if path_is_equivalent("/sys", path) || path_is_inside(path, "/sys") {
            ("/sys".to_owned(), true)
        } else {
            (path.to_owned(), false)
        };

    check_path_conflict(&dest, app.working_dir())?;

    let dir_label = Smack::app_access_label(app.name(), "rwx");

    if is_dir {
        create_dir_link(app, &dir_label, smack, &dest, &dest)?;
    } else {
        create_file_link(app, &dir_label, smack, path, &dest)?;
    }

    Ok(dest)
}

/// Rejects a destination that collides with anything already present under
/// the working directory: an existing final path, or a non-directory at
/// any intermediate segment.
pub fn check_path_conflict(dest: &str, working_dir: &Path) -> Result<()> {
    let mut curr = working_dir.to_path_buf();

    let segments: Vec<&str> = dest.split('/').filter(|s| !s.is_empty()).collect();

    for (i, seg) in segments.iter().enumerate() {
        curr.push(seg);

        let meta = match fs::symlink_metadata(&curr) {
            Ok(m) => m,
            Err(ref e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(ref e) if e.raw_os_error() == Some(libc::ENOTDIR) => return Ok(()),
            Err(e) => panic!("Could not stat path '{}': {}", curr.display(), e),
        };

        if !meta.is_dir() {
            bail_kind!(Kind::Duplicate, "'{}' already exists in app", curr.display());
        }

        if i == segments.len() - 1 {
            // The full destination already exists.
            bail_kind!(Kind::Duplicate, "'{}' already exists in app", curr.display());
        }
    }

    // Empty destination.
    bail_kind!(Kind::Duplicate, "Empty link destination")
}

/// Removes one link previously created by add_link().
pub fn remove_link(app: &App, dest: &str) {
    let full_path = join_under(app.working_dir(), dest);

    info!("Removing link {} from {}.", dest, app.name());

    if app.sandboxed() {
        try_lazy_umount(&full_path);
    }

    // Unsandboxed apps have a symlink here, sandboxed ones a mount point.
    let result = match fs::symlink_metadata(&full_path) {
        Ok(ref m) if m.is_dir() => fs::remove_dir(&full_path),
        Ok(_) => fs::remove_file(&full_path),
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        if e.kind() != ErrorKind::NotFound {
            error!("Could not delete {}. {}", full_path.display(), e);
        }
    }
}

/// Confines the calling process into the sandbox.  Called between fork and
/// exec.  The order is load-bearing: the uid change must come last since it
/// drops the privileges the other calls need.
pub fn confine_process(root: &Path, uid: Uid, gid: Gid, groups: &[Gid]) -> Result<()> {
    unistd::chdir(root)
        .with_context(|| format!("Could not change working directory to '{}'", root.display()))?;

    unistd::chroot(root)
        .with_context(|| format!("Could not chroot to '{}'", root.display()))?;

    unistd::setgroups(groups)
        .context("Could not set the supplementary groups list")?;

    unistd::setgid(gid).context("Could not set the group ID")?;

    // Also clears all capabilities.
    unistd::setuid(uid).context("Could not set the user ID")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSTALL: &str = "/opt/appvisor/apps/cam";

    fn plan_with(entries: &[(&str, &str)]) -> LinkPlan {
        let mut plan = LinkPlan::new();
        for (src, dest) in entries {
            plan.add(Path::new(INSTALL), src, dest).unwrap();
        }
        plan
    }

    fn dests(plan: &LinkPlan) -> Vec<&str> {
        plan.entries().iter().map(|e| e.dest.as_str()).collect()
    }

    #[test]
    fn plan_keeps_directories_before_their_contents() {
        let plan = plan_with(&[
            ("/opt/appvisor/apps/cam/read-only/bin/cam", "/bin/cam"),
            ("/lib/libc.so.6", "/lib/"),
            ("/opt/appvisor/apps/cam/read-only/lib/libfoo.so", "/lib/libfoo.so"),
            ("/dev/null", "/dev/"),
        ]);

        let d = dests(&plan);
        assert_eq!(d, vec!["/bin/cam", "/dev/null", "/lib/libc.so.6", "/lib/libfoo.so"]);

        // The invariant: for every nested pair, the outer entry precedes.
        for (i, a) in d.iter().enumerate() {
            for b in &d[i + 1..] {
                assert!(!crate::util::path_is_inside(a, b),
                        "{} appears after directory {}", a, b);
            }
        }
    }

    #[test]
    fn plan_appends_src_basename_to_directory_dest() {
        let plan = plan_with(&[("/dev/null", "/dev/")]);
        assert_eq!(plan.entries()[0].dest, "/dev/null");
        assert_eq!(plan.entries()[0].src, "/dev/null");
    }

    #[test]
    fn plan_rejects_mounting_over_foreign_directory() {
        let mut plan = LinkPlan::new();
        // /data comes from outside the install tree.
        plan.add(Path::new(INSTALL), "/data/stuff", "/data").unwrap();

        // Mounting app content inside it would escape the app's view.
        let err = plan.add(Path::new(INSTALL), "/etc/passwd", "/data/passwd");
        assert!(err.is_err());
    }

    #[test]
    fn plan_allows_nesting_inside_app_owned_directory() {
        let mut plan = LinkPlan::new();
        plan.add(Path::new(INSTALL),
                 "/opt/appvisor/apps/cam/read-only/share", "/share").unwrap();
        plan.add(Path::new(INSTALL), "/etc/resolv.conf", "/share/resolv.conf").unwrap();
        assert_eq!(dests(&plan), vec!["/share", "/share/resolv.conf"]);
    }

    #[test]
    fn plan_rejects_foreign_mount_under_new_outer_dir() {
        let mut plan = LinkPlan::new();
        plan.add(Path::new(INSTALL), "/data/stuff", "/data/inner").unwrap();

        // The new entry would become the outer mount of a foreign inner one.
        let err = plan.add(Path::new(INSTALL), "/var/lib/other", "/data");
        assert!(err.is_err());
    }

    #[test]
    fn mount_paths_unescape_octal() {
        assert_eq!(unescape_mount_path("/mnt/my\\040disk"), "/mnt/my disk");
        assert_eq!(unescape_mount_path("/plain/path"), "/plain/path");
        assert_eq!(unescape_mount_path("/tricky\\"), "/tricky\\");
    }

    #[test]
    fn mounts_inside_picks_strict_interior_deepest_first() {
        let mounts = vec![
            PathBuf::from("/var/run/appvisor/apps/cam"),
            PathBuf::from("/var/run/appvisor/apps/cam/tmp"),
            PathBuf::from("/var/run/appvisor/apps/cam/lib/libc.so.6"),
            PathBuf::from("/var/run/appvisor/apps/other/tmp"),
            PathBuf::from("/proc"),
        ];

        let inside = mounts_inside(&mounts, "/var/run/appvisor/apps/cam");

        // The working dir itself stays; it is unmounted last, separately.
        assert_eq!(inside, vec![
            PathBuf::from("/var/run/appvisor/apps/cam/tmp"),
            PathBuf::from("/var/run/appvisor/apps/cam/lib/libc.so.6"),
        ]);
    }

    #[test]
    fn path_conflict_detection() {
        let dir = std::env::temp_dir().join(format!("av-conflict-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(dir.join("bin")).unwrap();
        fs::write(dir.join("bin/ls"), "").unwrap();

        // Existing final segment conflicts.
        let e = check_path_conflict("/bin/ls", &dir).unwrap_err();
        assert_eq!(crate::error::kind(&e), Some(Kind::Duplicate));

        // Existing intermediate non-directory conflicts.
        let e = check_path_conflict("/bin/ls/deeper", &dir).unwrap_err();
        assert_eq!(crate::error::kind(&e), Some(Kind::Duplicate));

        // A fresh path under an existing directory is fine.
        assert!(check_path_conflict("/bin/cat", &dir).is_ok());

        // A fresh tree is fine.
        assert!(check_path_conflict("/etc/passwd", &dir).is_ok());

        let _ = fs::remove_dir_all(&dir);
    }
}
