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

//! Access policy: which subject may touch which object, and with what.
//!
//! Every app gets a unique subject label and a family of per-permission
//! object labels for its own files.  Bindings buy an app access to its
//! servers.  Device nodes are labeled by device id.  Host paths shared
//! between apps get a synthesized label tracked in the config store with
//! the set of apps using it; the label dies with its last user.

use anyhow::{Result, Context};
use std::{
    fs,
    os::unix::fs::{MetadataExt, FileTypeExt, PermissionsExt},
    path::Path,
};
use crate::{
    config::Store,
    error::Kind,
    sandbox::DEFAULT_LINKS,
    smack::{Smack, LABEL_FLOOR, LABEL_FRAMEWORK, LABEL_ADMIN, LABEL_SYSLOG},
};

const PERMISSION_CLASSES: &[&str] = &["x", "w", "wx", "r", "rx", "rw", "rwx"];

/// Framework helper apps that talk straight to the hardware-access
/// multiplexer.
const HW_BRIDGE_APPS: &[&str] = &["app.atService", "app.modemService", "app.devMode"];
const LABEL_HW_BRIDGE: &str = "hwbridge";

/// Installs the full rule set for an app: its own labels, the framework
/// links, bindings, device labels, and shared-resource grants.
pub fn set_app_rules(app_name: &str, sandboxed: bool, cfg_path: &str,
                     store: &mut Store, smack: &Smack) -> Result<()> {
    // Start from a clean slate in the shared-resource table.
    cleanup_resources(app_name, store);

    let app_label = Smack::app_label(app_name);

    set_default_rules(app_name, sandboxed, &app_label, smack);
    set_binding_rules(cfg_path, &app_label, store, smack);

    set_default_device_rules(&app_label, smack)?;
    set_required_resource_rules(app_name, cfg_path, store, smack)?;
    set_cfg_device_rules(cfg_path, &app_label, store, smack)?;

    Ok(())
}

/// Drops every rule in which the app is the subject.
pub fn revoke_app_rules(app_name: &str, smack: &Smack) {
    smack.revoke_subject(&Smack::app_label(app_name));
}

fn set_default_rules(app_name: &str, sandboxed: bool, app_label: &str, smack: &Smack) {
    // The app reaches its own files through the per-permission labels, and
    // the framework reaches everything of the app's.
    for perms in PERMISSION_CLASSES {
        let dir_label = Smack::app_access_label(app_name, perms);

        smack.set_rule(app_label, perms, &dir_label);
        smack.set_rule(LABEL_FRAMEWORK, perms, &dir_label);
        smack.set_rule(LABEL_ADMIN, perms, &dir_label);
    }

    smack.set_rule(LABEL_FRAMEWORK, "rwx", app_label);
    smack.set_rule(app_label, "rwx", LABEL_FRAMEWORK);

    // Syslog access is mutual: the app writes log records, the log daemon
    // writes to the app's stream sockets.
    smack.set_rule(app_label, "w", LABEL_SYSLOG);
    smack.set_rule(LABEL_SYSLOG, "w", app_label);

    smack.set_rule(LABEL_ADMIN, "rwx", app_label);

    if !sandboxed {
        smack.set_rule(app_label, "rwx", LABEL_FLOOR);
    }

    for helper in HW_BRIDGE_APPS {
        if *helper == app_label {
            smack.set_rule(helper, "rwx", LABEL_HW_BRIDGE);
            smack.set_rule(LABEL_HW_BRIDGE, "rwx", helper);
        }
    }
}

/// Client and server of every binding get mutual rwx.  x is included
/// because some servers resolve their clients through /proc/<pid>.
fn set_binding_rules(cfg_path: &str, app_label: &str, store: &Store, smack: &Smack) {
    for binding in store.read_txn(cfg_path).child("bindings").elements() {
        let server = binding.get_str("app", "");
        if server.is_empty() {
            continue;
        }

        let server_label = Smack::app_label(&server);
        smack.set_rule(app_label, "rwx", &server_label);
        smack.set_rule(&server_label, "rwx", app_label);
    }
}

/// The default device links every sandboxed app receives also need rules.
fn set_default_device_rules(app_label: &str, smack: &Smack) -> Result<()> {
    for link in DEFAULT_LINKS {
        if link.perm.is_empty() {
            continue;
        }

        let meta = match fs::metadata(link.src) {
            Ok(m) => m,
            Err(_) => continue,
        };

        if !meta.file_type().is_char_device() && !meta.file_type().is_block_device() {
            continue;
        }

        set_device_rule(app_label, link.src, link.perm, smack)
            .with_context(|| format!("Failed to set permissions ({}) on device '{}'",
                                     link.perm, link.src))?;
    }

    Ok(())
}

fn set_cfg_device_rules(cfg_path: &str, app_label: &str, store: &Store, smack: &Smack)
    -> Result<()>
{
    for entry in store.read_txn(cfg_path).child("requires/devices").elements() {
        let src = entry.get_str("src", "");
        if src.is_empty() {
            bail!("Empty source file path supplied for device");
        }

        let perm = permission_string(&entry);

        set_device_rule(app_label, &src, &perm, smack)
            .with_context(|| format!("Failed to set permissions ({}) on device '{}'",
                                     perm, src))?;
    }

    Ok(())
}

/// Labels a device by its device id and grants the app access to that
/// label.  Apps importing the same device share the label.
pub fn set_device_rule(app_label: &str, dev_path: &str, perm: &str, smack: &Smack)
    -> Result<()>
{
    let meta = match fs::metadata(dev_path) {
        Ok(m) => m,
        Err(e) => bail_kind!(Kind::NotFound, "Could not get file info for '{}': {}",
                             dev_path, e),
    };

    if !meta.file_type().is_char_device() && !meta.file_type().is_block_device() {
        bail_kind!(Kind::NotFound, "'{}' is not a device file", dev_path);
    }

    let dev_label = Smack::dev_label(meta.rdev());

    smack.set_label(Path::new(dev_path), &dev_label)?;
    smack.set_rule(app_label, perm, &dev_label);

    Ok(())
}

fn permission_string(entry: &crate::config::ReadTxn) -> String {
    let mut perm = String::new();
    if entry.get_bool("isReadable", false)   { perm.push('r'); }
    if entry.get_bool("isWritable", false)   { perm.push('w'); }
    if entry.get_bool("isExecutable", false) { perm.push('x'); }
    perm
}

/// Required dirs and files that declare a permission join the
/// shared-resource table.
fn set_required_resource_rules(app_name: &str, cfg_path: &str,
                               store: &mut Store, smack: &Smack) -> Result<()> {
    for kind in &["dirs", "files"] {
        let entries: Vec<(String, String)> =
            store.read_txn(cfg_path).child(&format!("requires/{}", kind)).elements()
                .iter()
                .filter_map(|e| {
                    let perm = permission_string(e);
                    let src = e.get_str("src", "");
                    if perm.is_empty() || src.is_empty() {
                        None
                    } else {
                        Some((src, perm))
                    }
                })
                .collect();

        for (src, perm) in entries {
            grant_shared_resource(app_name, kind, &src, &perm, store, smack);
        }
    }

    Ok(())
}

/// Grants one app access to one shared source path.  The first user
/// creates the record: a synthesized label (`files<N>` / `dirs<N>`) is
/// stamped on the path and DAC is widened once so the MAC label is the
/// only gate.  Later users just get their allow rule and join the record.
pub fn grant_shared_resource(app_name: &str, kind: &str, src: &str, perm: &str,
                             store: &mut Store, smack: &Smack) {
    let app_label = Smack::app_label(app_name);

    let mut txn = store.write_txn(&format!("resources/{}", kind));

    let records: Vec<(String, String, Vec<String>)> = txn.read("").children()
        .iter()
        .map(|(idx, rec)| (idx.clone(), rec.get_str("src", ""), rec.string_list("apps")))
        .collect();

    // An existing record for the source means the label already exists.
    if let Some((idx, _, apps)) = records.iter().find(|(_, s, _)| s == src) {
        let label = txn.read(&format!("{}/label", idx)).as_str().unwrap_or("").to_owned();

        debug!("Resource already exists, loading rules.");
        smack.set_rule(&app_label, perm, &label);

        if !apps.iter().any(|a| a == app_name) {
            let mut apps = apps.clone();
            apps.push(app_name.to_owned());
            txn.set_value(&format!("{}/apps", idx), json!(apps));
        }

        txn.commit();
        return;
    }

    let next_index = records.iter()
        .filter_map(|(idx, _, _)| idx.parse::<u32>().ok())
        .max()
        .map_or(0, |i| i + 1);

    let label = format!("{}{}", kind, next_index);

    debug!("Adding new resource with index: {}", next_index);

    txn.set_str(&format!("{}/src", next_index), src);
    txn.set_str(&format!("{}/label", next_index), &label);
    txn.set_value(&format!("{}/apps", next_index), json!([app_name]));

    widen_dac(src);
    if let Err(e) = smack.set_label(Path::new(src), &label) {
        error!("{}", e);
    }
    smack.set_rule(&app_label, perm, &label);

    txn.commit();
}

/// Removes the app from every shared-resource record, deleting records
/// whose user set empties.
pub fn cleanup_resources(app_name: &str, store: &mut Store) {
    for kind in &["dirs", "files"] {
        let mut txn = store.write_txn(&format!("resources/{}", kind));

        let records: Vec<(String, String, Vec<String>)> = txn.read("").children()
            .iter()
            .map(|(idx, rec)| (idx.clone(), rec.get_str("src", ""), rec.string_list("apps")))
            .collect();

        for (idx, src, apps) in records {
            if !apps.iter().any(|a| a == app_name) {
                continue;
            }

            let remaining: Vec<String> =
                apps.into_iter().filter(|a| a != app_name).collect();

            info!("Deleting appName {} from resource {}", app_name, src);

            if remaining.is_empty() {
                info!("Deleting resource: {}", src);
                txn.delete(&idx);
            } else {
                txn.set_value(&format!("{}/apps", idx), json!(remaining));
            }
        }

        txn.commit();
    }
}

/// DAC goes wide open on others once; MAC is the only access control on a
/// shared resource.
fn widen_dac(src: &str) {
    let meta = match fs::metadata(src) {
        Ok(m) => m,
        Err(e) => {
            error!("Unable to open {}: {}", src, e);
            return;
        }
    };

    let mode = meta.permissions().mode() | 0o007;
    if let Err(e) = fs::set_permissions(src, fs::Permissions::from_mode(mode)) {
        error!("Unable to change permission bit on {}: {}", src, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smack::testfs;

    #[test]
    fn default_rules_link_app_and_framework() {
        let (smack, load2) = testfs::scratch("default-rules");
        let mut store = Store::in_memory();

        set_app_rules("cam", true, "apps/cam", &mut store, &smack).unwrap();

        let rules = testfs::rules(&load2);
        assert!(rules.contains(&"app.cam app.cam.rwx rwx".to_owned()));
        assert!(rules.contains(&"framework app.cam rwx".to_owned()));
        assert!(rules.contains(&"app.cam framework rwx".to_owned()));
        assert!(rules.contains(&"app.cam syslog w".to_owned()));
        // Sandboxed apps get no floor access.
        assert!(!rules.contains(&"app.cam _ rwx".to_owned()));
    }

    #[test]
    fn unsandboxed_app_reaches_the_floor_label() {
        let (smack, load2) = testfs::scratch("floor");
        let mut store = Store::in_memory();

        set_app_rules("tools", false, "apps/tools", &mut store, &smack).unwrap();

        assert!(testfs::rules(&load2).contains(&"app.tools _ rwx".to_owned()));
    }

    #[test]
    fn binding_rules_are_bidirectional() {
        let (smack, load2) = testfs::scratch("bindings");
        let mut store = Store::in_memory();
        let mut txn = store.write_txn("apps/cam");
        txn.set_value("bindings", json!([{"app": "gps"}]));
        txn.commit();

        set_app_rules("cam", true, "apps/cam", &mut store, &smack).unwrap();

        let rules = testfs::rules(&load2);
        assert!(rules.contains(&"app.cam app.gps rwx".to_owned()));
        assert!(rules.contains(&"app.gps app.cam rwx".to_owned()));
    }

    #[test]
    fn shared_resource_label_is_allocated_then_reused() {
        let (smack, load2) = testfs::scratch("resources");
        let mut store = Store::in_memory();

        let src = std::env::temp_dir()
            .join(format!("av-shared-{}", std::process::id()));
        fs::write(&src, "").unwrap();
        let src = src.to_string_lossy().into_owned();

        // First app creates the record and the label.
        grant_shared_resource("cam", "files", &src, "r", &mut store, &smack);
        assert_eq!(store.read_txn("resources/files/0").get_str("label", ""), "files0");
        assert_eq!(store.read_txn("resources/files/0").string_list("apps"), vec!["cam"]);

        // Second app reuses the label and only adds its own rule.
        grant_shared_resource("gps", "files", &src, "rw", &mut store, &smack);
        assert_eq!(store.read_txn("resources/files").children().len(), 1);
        assert_eq!(store.read_txn("resources/files/0").string_list("apps"),
                   vec!["cam", "gps"]);

        let rules = testfs::rules(&load2);
        assert!(rules.contains(&"app.cam files0 r".to_owned()));
        assert!(rules.contains(&"app.gps files0 rw".to_owned()));

        // Deleting one app keeps the record; deleting the last collects it.
        cleanup_resources("cam", &mut store);
        assert_eq!(store.read_txn("resources/files/0").string_list("apps"), vec!["gps"]);

        cleanup_resources("gps", &mut store);
        assert!(!store.read_txn("resources/files/0").exists());

        let _ = fs::remove_file(&src);
    }

    #[test]
    fn allocation_restarts_once_all_records_are_collected() {
        let (smack, _) = testfs::scratch("indices");
        let mut store = Store::in_memory();

        let mk = |n: &str| {
            let p = std::env::temp_dir().join(format!("av-idx-{}-{}", n, std::process::id()));
            fs::write(&p, "").unwrap();
            p.to_string_lossy().into_owned()
        };
        let (a, b, c) = (mk("a"), mk("b"), mk("c"));

        grant_shared_resource("x", "dirs", &a, "r", &mut store, &smack);
        grant_shared_resource("x", "dirs", &b, "r", &mut store, &smack);
        cleanup_resources("x", &mut store);

        // Both records are gone; a fresh allocation starts over at 0.
        grant_shared_resource("y", "dirs", &c, "r", &mut store, &smack);
        assert_eq!(store.read_txn("resources/dirs/0").get_str("label", ""), "dirs0");

        for p in &[a, b, c] {
            let _ = fs::remove_file(p);
        }
    }

    #[test]
    fn non_device_path_is_not_found() {
        let (smack, _) = testfs::scratch("dev");
        let e = set_device_rule("app.cam", "/etc/hostname", "r", &smack).unwrap_err();
        assert_eq!(crate::error::kind(&e), Some(Kind::NotFound));
    }

    #[test]
    fn device_rule_uses_device_label() {
        let (smack, load2) = testfs::scratch("devrule");

        // /dev/null exists everywhere; label writes are best-effort.
        set_device_rule("app.cam", "/dev/null", "rw", &smack).unwrap();

        let meta = fs::metadata("/dev/null").unwrap();
        let expected = format!("app.cam {} rw", Smack::dev_label(meta.rdev()));
        assert!(testfs::rules(&load2).contains(&expected));
    }
}
