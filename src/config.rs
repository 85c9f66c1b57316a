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

//! Client for the configuration store.
//!
//! The store is an opaque key/value tree.  Keys are '/'-separated paths
//! ("apps/foo/procs").  Reads borrow the tree for the duration of a short
//! read transaction; writes stage against a copy and only become visible
//! (and durable) on commit.  Transactions must never be held across a fork
//! or a blocking syscall.

use anyhow::{Result, Context};
use std::{
    fs,
    path::{Path, PathBuf},
};
use serde_json::Value;

pub struct Store {
    path: Option<PathBuf>,
    root: Value,
}

impl Store {
    pub fn load(path: &Path) -> Result<Self> {
        let root = match fs::read_to_string(path) {
            Ok(s) => serde_json::from_str(&s)
                .with_context(|| format!("Config store {} is corrupt", path.display()))?,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => json!({}),
            Err(e) => return Err(e).with_context(||
                format!("Failed to read config store {}", path.display())),
        };

        Ok(Self { path: Some(path.to_owned()), root })
    }

    /// A store with no backing file.  Commits only update the in-memory tree.
    pub fn in_memory() -> Self {
        Self { path: None, root: json!({}) }
    }

    pub fn read_txn(&self, key: &str) -> ReadTxn {
        ReadTxn { node: value_at(&self.root, key) }
    }

    pub fn write_txn(&mut self, key: &str) -> WriteTxn {
        WriteTxn {
            work: self.root.clone(),
            base: key.to_owned(),
            store: self,
        }
    }
}

fn value_at<'v>(root: &'v Value, key: &str) -> Option<&'v Value> {
    let mut node = root;
    for seg in key.split('/').filter(|s| !s.is_empty()) {
        node = match node {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(node)
}

fn value_at_mut<'v>(root: &'v mut Value, key: &str) -> &'v mut Value {
    let mut node = root;
    for seg in key.split('/').filter(|s| !s.is_empty()) {
        if !node.is_object() {
            *node = json!({});
        }
        node = node.as_object_mut().unwrap()
            .entry(seg.to_owned())
            .or_insert(Value::Null);
    }
    node
}

#[derive(Clone, Copy)]
pub struct ReadTxn<'a> {
    node: Option<&'a Value>,
}

impl<'a> ReadTxn<'a> {
    pub fn exists(&self) -> bool {
        self.node.map_or(false, |n| !n.is_null())
    }

    pub fn child(&self, rel: &str) -> ReadTxn<'a> {
        ReadTxn { node: self.node.and_then(|n| value_at(n, rel)) }
    }

    pub fn get_str(&self, rel: &str, default: &str) -> String {
        self.child(rel).node
            .and_then(|n| n.as_str())
            .unwrap_or(default)
            .to_owned()
    }

    pub fn get_bool(&self, rel: &str, default: bool) -> bool {
        self.child(rel).node
            .and_then(|n| n.as_bool())
            .unwrap_or(default)
    }

    pub fn get_u64(&self, rel: &str, default: u64) -> u64 {
        self.child(rel).node
            .and_then(|n| n.as_u64())
            .unwrap_or(default)
    }

    pub fn as_str(&self) -> Option<&'a str> {
        self.node.and_then(|n| n.as_str())
    }

    /// Children of an object node, in key order (the store keeps objects
    /// sorted, which gives deterministic iteration).
    pub fn children(&self) -> Vec<(String, ReadTxn<'a>)> {
        match self.node {
            Some(Value::Object(map)) =>
                map.iter().map(|(k, v)| (k.clone(), ReadTxn { node: Some(v) })).collect(),
            _ => vec![],
        }
    }

    /// Elements of an array node, in order.
    pub fn elements(&self) -> Vec<ReadTxn<'a>> {
        match self.node {
            Some(Value::Array(items)) =>
                items.iter().map(|v| ReadTxn { node: Some(v) }).collect(),
            _ => vec![],
        }
    }

    /// An array of strings ("args", "groups", ...).
    pub fn string_list(&self, rel: &str) -> Vec<String> {
        self.child(rel).elements().iter()
            .filter_map(|e| e.as_str().map(str::to_owned))
            .collect()
    }
}

pub struct WriteTxn<'a> {
    store: &'a mut Store,
    work: Value,
    base: String,
}

impl<'a> WriteTxn<'a> {
    fn full_key(&self, rel: &str) -> String {
        if rel.is_empty() {
            self.base.clone()
        } else {
            format!("{}/{}", self.base, rel)
        }
    }

    pub fn read(&self, rel: &str) -> ReadTxn {
        ReadTxn { node: value_at(&self.work, &self.full_key(rel)) }
    }

    pub fn set_str(&mut self, rel: &str, value: &str) {
        let key = self.full_key(rel);
        *value_at_mut(&mut self.work, &key) = json!(value);
    }

    pub fn set_value(&mut self, rel: &str, value: Value) {
        let key = self.full_key(rel);
        *value_at_mut(&mut self.work, &key) = value;
    }

    pub fn delete(&mut self, rel: &str) {
        let key = self.full_key(rel);
        let (parent, leaf) = match key.rfind('/') {
            Some(i) => (&key[..i], &key[i + 1..]),
            None => ("", key.as_str()),
        };

        if let Some(node) = value_at_nested_mut(&mut self.work, parent) {
            if let Some(map) = node.as_object_mut() {
                map.remove(leaf);
            }
        }
    }

    /// Make the staged changes visible and durable.  A store write failure
    /// here is an internal store error, which is fatal per the error
    /// handling policy: supervisor state must never diverge from the store.
    pub fn commit(self) {
        self.store.root = self.work;

        if let Some(ref path) = self.store.path {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)
                    .unwrap_or_else(|e| panic!("Cannot create {}: {}", dir.display(), e));
            }
            let data = serde_json::to_string_pretty(&self.store.root)
                .expect("Config tree is not serializable");
            fs::write(path, data)
                .unwrap_or_else(|e| panic!("Cannot write config store {}: {}",
                                           path.display(), e));
        }
    }

    // Dropping a WriteTxn without commit() discards the staged changes.
}

fn value_at_nested_mut<'v>(root: &'v mut Value, key: &str) -> Option<&'v mut Value> {
    let mut node = root;
    for seg in key.split('/').filter(|s| !s.is_empty()) {
        node = match node {
            Value::Object(map) => map.get_mut(seg)?,
            _ => return None,
        };
    }
    Some(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_of_missing_key_is_empty() {
        let store = Store::in_memory();
        let txn = store.read_txn("apps/ghost");
        assert!(!txn.exists());
        assert_eq!(txn.get_str("name", "dflt"), "dflt");
        assert!(txn.children().is_empty());
    }

    #[test]
    fn write_then_read_roundtrip() {
        let mut store = Store::in_memory();

        let mut txn = store.write_txn("apps/cam");
        txn.set_str("procs/main/priority", "high");
        txn.set_value("sandboxed", json!(false));
        txn.commit();

        let txn = store.read_txn("apps/cam");
        assert_eq!(txn.get_str("procs/main/priority", ""), "high");
        assert!(!txn.get_bool("sandboxed", true));
    }

    #[test]
    fn uncommitted_writes_are_discarded() {
        let mut store = Store::in_memory();
        {
            let mut txn = store.write_txn("x");
            txn.set_str("y", "z");
            // dropped without commit
        }
        assert!(!store.read_txn("x").exists());
    }

    #[test]
    fn delete_removes_subtree() {
        let mut store = Store::in_memory();
        let mut txn = store.write_txn("resources/files");
        txn.set_str("0/src", "/data/x");
        txn.set_str("1/src", "/data/y");
        txn.commit();

        let mut txn = store.write_txn("resources/files");
        txn.delete("0");
        txn.commit();

        let txn = store.read_txn("resources/files");
        assert!(!txn.child("0").exists());
        assert_eq!(txn.get_str("1/src", ""), "/data/y");
    }

    #[test]
    fn children_iterate_in_key_order() {
        let mut store = Store::in_memory();
        let mut txn = store.write_txn("modules");
        txn.set_value("b.ko", json!({}));
        txn.set_value("a.ko", json!({}));
        txn.set_value("c.ko", json!({}));
        txn.commit();

        let names: Vec<String> = store.read_txn("modules").children()
            .into_iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["a.ko", "b.ko", "c.ko"]);
    }

    #[test]
    fn store_persists_to_disk() {
        let dir = std::env::temp_dir().join(format!("av-cfg-test-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let path = dir.join("config.json");

        {
            let mut store = Store::load(&path).unwrap();
            let mut txn = store.write_txn("apps/cam/procs/main");
            txn.set_value("args", json!(["/bin/cam", "--fast"]));
            txn.commit();
        }

        let store = Store::load(&path).unwrap();
        assert_eq!(store.read_txn("apps/cam/procs/main").string_list("args"),
                   vec!["/bin/cam", "--fast"]);

        let _ = fs::remove_dir_all(&dir);
    }
}
