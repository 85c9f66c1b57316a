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

//! Kernel module dependency handling.
//!
//! Modules form a DAG through their `requires.kernelModules` edges.  A load
//! walks the graph depth-first and installs leaves first; an unload walks
//! it the other way.  Every visit moves a reference count so a module stays
//! loaded exactly as long as someone needs it.  Cycles are not detected;
//! the configuration is trusted to be acyclic.

use anyhow::{Result, Context};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use crate::{
    consts::*,
    config::Store,
    error::Kind,
    framework,
    proc::command::Command,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Init,
    Try,
    Installed,
    Removed,
}

pub struct Module {
    name: String,
    path: PathBuf,
    /// insmod parameters, already in "name=value" form, values quoted when
    /// they contain whitespace.
    params: Vec<String>,
    install_script: Option<PathBuf>,
    remove_script: Option<PathBuf>,
    required: Vec<String>,
    status: LoadStatus,
    load_manual: bool,
    use_count: u32,
}

pub struct ModuleTable {
    modules: HashMap<String, Module>,
    /// Module names in alphabetical order; drives the deterministic boot
    /// auto-load.
    alpha_order: Vec<String>,
    proc_modules: PathBuf,
}

impl ModuleTable {
    /// Reads the whole module set from the config store into memory.
    pub fn init(store: &Store) -> Self {
        let mut table = Self {
            modules: HashMap::new(),
            alpha_order: vec![],
            proc_modules: PathBuf::from("/proc/modules"),
        };

        for (name, cfg) in store.read_txn("modules").children() {
            if !name.ends_with(".ko") {
                warn!("Ignoring module '{}' without .ko extension", name);
                continue;
            }

            let module = Module {
                path: Path::new(SYSTEM_MODULE_DIR).join(&name),
                params: read_params(&cfg),
                install_script: read_script(&name, &cfg, "scripts/install"),
                remove_script: read_script(&name, &cfg, "scripts/remove"),
                required: cfg.string_list("requires/kernelModules"),
                status: LoadStatus::Init,
                load_manual: cfg.get_bool("loadManual", false),
                use_count: 0,
                name: name.clone(),
            };

            table.alpha_order.push(name.clone());
            table.modules.insert(name, module);
        }

        table.alpha_order.sort();
        table
    }

    #[cfg(test)]
    fn insert_for_test(&mut self, name: &str, required: &[&str], load_manual: bool) {
        self.alpha_order.push(name.to_owned());
        self.alpha_order.sort();
        self.modules.insert(name.to_owned(), Module {
            name: name.to_owned(),
            path: Path::new(SYSTEM_MODULE_DIR).join(name),
            params: vec![],
            install_script: None,
            remove_script: None,
            required: required.iter().map(|s| s.to_string()).collect(),
            status: LoadStatus::Init,
            load_manual,
            use_count: 0,
        });
    }

    pub fn status(&self, name: &str) -> Option<LoadStatus> {
        self.modules.get(name).map(|m| m.status)
    }

    pub fn use_count(&self, name: &str) -> Option<u32> {
        self.modules.get(name).map(|m| m.use_count)
    }

    /// The order in which a load of `name` touches modules: dependencies
    /// first, `name` last.
    pub fn plan_insert(&self, name: &str) -> Result<Vec<String>> {
        let mut stack = vec![];
        self.traverse(name, &mut stack)?;
        stack.reverse();
        Ok(stack)
    }

    /// The order in which an unload of `name` touches modules: `name`
    /// first, dependencies after.
    pub fn plan_remove(&self, name: &str) -> Result<Vec<String>> {
        let mut queue = vec![];
        self.traverse(name, &mut queue)?;
        Ok(queue)
    }

    fn traverse(&self, name: &str, out: &mut Vec<String>) -> Result<()> {
        let module = self.modules.get(name)
            .with_context(|| format!("Lookup for module '{}' failed", name))?;

        out.push(name.to_owned());

        for dep in &module.required {
            self.traverse(dep, out)?;
        }

        Ok(())
    }

    /// Loads a module and everything it requires.  Every visited node gets
    /// a reference; the install itself only runs on the 0 -> 1 transition
    /// of a module that is not already live.
    pub fn install(&mut self, name: &str) -> Result<()> {
        for mod_name in self.plan_insert(name)? {
            let proc_modules = self.proc_modules.clone();
            let module = self.modules.get_mut(&mod_name).unwrap();

            module.use_count += 1;

            if module.use_count == 1 && module.status != LoadStatus::Installed {
                install_one(module, &proc_modules)?;
            }
        }

        Ok(())
    }

    /// Drops one reference from a module and everything it requires,
    /// unloading whatever reaches zero.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        for mod_name in self.plan_remove(name)? {
            let proc_modules = self.proc_modules.clone();
            let module = self.modules.get_mut(&mod_name).unwrap();

            if module.use_count != 0 {
                module.use_count -= 1;
            }

            if module.use_count == 0 && module.status != LoadStatus::Removed {
                remove_one(module, &proc_modules)?;
            }
        }

        Ok(())
    }

    /// Loads the modules an app requires, in config order.  A failure on an
    /// optional module logs and continues; a mandatory failure aborts.
    pub fn install_list(&mut self, modules: &[(String, bool)]) -> Result<()> {
        for (name, optional) in modules {
            if let Err(e) = self.install(name) {
                if *optional {
                    warn!("Optional module '{}' failed to load: {}", name, e);
                } else {
                    return Err(e).with_context(||
                        format!("Error in installing module {}", name));
                }
            }
        }

        Ok(())
    }

    /// Releases the references taken by a matching install_list() call.
    pub fn remove_list(&mut self, modules: &[(String, bool)]) -> Result<()> {
        let mut failed = false;

        for (name, _) in modules {
            if let Err(e) = self.remove(name) {
                error!("Error in removing module {}: {}", name, e);
                failed = true;
            }
        }

        if failed {
            bail!("Error in removing the list of kernel modules");
        }

        Ok(())
    }

    /// Boot-time auto-load: alphabetical order, manual modules skipped.
    pub fn insert_all(&mut self) {
        for name in self.alpha_order.clone() {
            if self.modules[&name].load_manual {
                continue;
            }

            if let Err(e) = self.install(&name) {
                error!("Error in installing module {}: {}", name, e);
                break;
            }
        }
    }

    /// Shutdown: reverse alphabetical order, manual modules skipped.
    pub fn remove_all(&mut self) {
        for name in self.alpha_order.clone().into_iter().rev() {
            if self.modules[&name].load_manual {
                continue;
            }

            if let Err(e) = self.remove(&name) {
                error!("Error in removing module {}: {}", name, e);
                break;
            }
        }
    }

    /// RPC: load a module on demand.
    pub fn load(&mut self, name: &str) -> Result<()> {
        info!("Requested to load module '{}'.", name);

        if !self.modules.contains_key(name) {
            bail_kind!(Kind::NotFound, "Lookup for module '{}' failed", name);
        }

        self.install(name)
    }

    /// RPC: unload a module on demand.
    pub fn unload(&mut self, name: &str) -> Result<()> {
        info!("Requested to unload module '{}'.", name);

        if !self.modules.contains_key(name) {
            bail_kind!(Kind::NotFound, "Lookup for module '{}' failed", name);
        }

        self.remove(name)
    }
}

fn read_params(cfg: &crate::config::ReadTxn) -> Vec<String> {
    cfg.child("params").children().into_iter()
        .filter_map(|(k, v)| v.as_str().map(|val| {
            if val.contains(|c: char| c.is_whitespace()) {
                format!("{}=\"{}\"", k, val)
            } else {
                format!("{}={}", k, val)
            }
        }))
        .collect()
}

/// Install/remove scripts are bundled with the module; only the base name
/// from the config is honored, re-rooted under the module's files.
fn read_script(mod_name: &str, cfg: &crate::config::ReadTxn, node: &str) -> Option<PathBuf> {
    let path = cfg.get_str(node, "");
    if path.is_empty() {
        return None;
    }

    let base = path.rsplit('/').next().unwrap();
    let stripped = mod_name.trim_end_matches(".ko");

    Some(Path::new(SYSTEM_MODULE_DIR).join(stripped).join("scripts").join(base))
}

fn install_one(module: &mut Module, proc_modules: &Path) -> Result<()> {
    if let Some(ref script) = module.install_script {
        Command::new(vec![script.as_os_str(), module.path.as_os_str()])
            .run_and_check()
            .with_context(|| format!("Install script {} execution failed", script.display()))?;

        // A script install is only done when the kernel reports the module
        // Live.  A module that never comes up leaves the system in an
        // unusable state, so we reboot.
        wait_until_live(&module.name, proc_modules);
    } else {
        let mut argv: Vec<String> = vec![
            INSMOD_BIN.to_owned(),
            module.path.to_string_lossy().into_owned(),
        ];
        argv.extend(module.params.iter().cloned());

        Command::new(argv).run_and_check()?;
    }

    module.status = LoadStatus::Installed;
    info!("New kernel module {}", module.name);

    Ok(())
}

fn remove_one(module: &mut Module, proc_modules: &Path) -> Result<()> {
    if let Some(ref script) = module.remove_script {
        Command::new(vec![script.as_os_str(), module.path.as_os_str()])
            .run_and_check()
            .with_context(|| format!("Remove script {} execution failed", script.display()))?;

        // The script must actually have removed it.
        if check_proc_modules(&module.name, proc_modules) != LoadStatus::Removed {
            bail!("Module {} found in {}. Module not removed",
                  module.name, proc_modules.display());
        }
    } else {
        Command::new(vec![RMMOD_BIN, module.name.trim_end_matches(".ko")])
            .run_and_check()?;
    }

    module.status = LoadStatus::Removed;
    info!("Removed kernel module {}", module.name);

    Ok(())
}

fn wait_until_live(mod_name: &str, proc_modules: &Path) {
    if check_proc_modules(mod_name, proc_modules) == LoadStatus::Installed {
        return;
    }

    info!("Module {} not in 'Live' state, waiting up to {:?}.",
          mod_name, MODULE_LIVE_TIMEOUT);

    let deadline = Instant::now() + MODULE_LIVE_TIMEOUT;

    while Instant::now() < deadline {
        thread::sleep(Duration::from_secs(1));

        if check_proc_modules(mod_name, proc_modules) == LoadStatus::Installed {
            return;
        }
    }

    error!("EMERG: Module {} not in 'Live' state. Restart system ...", mod_name);
    framework::reboot();
}

/// Looks the module up in the kernel's module table.  The kernel knows
/// three states: Live, Loading, Unloading.
fn check_proc_modules(mod_name: &str, proc_modules: &Path) -> LoadStatus {
    let stripped = mod_name.trim_end_matches(".ko");

    let data = match fs::read_to_string(proc_modules) {
        Ok(d) => d,
        Err(e) => {
            error!("Error in opening file {}: {}", proc_modules.display(), e);
            return LoadStatus::Init;
        }
    };

    for line in data.lines() {
        let mut fields = line.split_whitespace();

        if fields.next() == Some(stripped) {
            let state = fields.nth(3).unwrap_or("");
            return if state == "Live" {
                LoadStatus::Installed
            } else {
                LoadStatus::Try
            };
        }
    }

    LoadStatus::Removed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_chain() -> ModuleTable {
        // m1 -> m2 -> m3, and m4 standalone (manual).
        let mut t = ModuleTable::init(&Store::in_memory());
        t.insert_for_test("m3.ko", &[], false);
        t.insert_for_test("m2.ko", &["m3.ko"], false);
        t.insert_for_test("m1.ko", &["m2.ko"], false);
        t.insert_for_test("m4.ko", &[], true);
        t
    }

    #[test]
    fn insert_plan_is_dependencies_first() {
        let t = table_with_chain();
        assert_eq!(t.plan_insert("m1.ko").unwrap(),
                   vec!["m3.ko", "m2.ko", "m1.ko"]);
    }

    #[test]
    fn remove_plan_is_dependents_first() {
        let t = table_with_chain();
        assert_eq!(t.plan_remove("m1.ko").unwrap(),
                   vec!["m1.ko", "m2.ko", "m3.ko"]);
    }

    #[test]
    fn diamond_dependencies_are_visited_once_per_path() {
        // top requires left and right; both require base.  The base must be
        // referenced once per path so it outlives both branches.
        let mut t = ModuleTable::init(&Store::in_memory());
        t.insert_for_test("base.ko", &[], false);
        t.insert_for_test("left.ko", &["base.ko"], false);
        t.insert_for_test("right.ko", &["base.ko"], false);
        t.insert_for_test("top.ko", &["left.ko", "right.ko"], false);

        let plan = t.plan_insert("top.ko").unwrap();
        assert_eq!(plan.iter().filter(|n| n.as_str() == "base.ko").count(), 2);
        // Every occurrence of base precedes the branch that needs it.
        assert_eq!(plan.last().unwrap(), "top.ko");
    }

    #[test]
    fn unknown_module_fails_lookup() {
        let t = table_with_chain();
        assert!(t.plan_insert("ghost.ko").is_err());

        let mut t = table_with_chain();
        let e = t.load("ghost.ko").unwrap_err();
        assert_eq!(crate::error::kind(&e), Some(Kind::NotFound));
    }

    #[test]
    fn params_are_quoted_when_they_contain_whitespace() {
        let mut store = Store::in_memory();
        let mut txn = store.write_txn("modules/m.ko/params");
        txn.set_str("speed", "fast");
        txn.set_str("mode", "a b");
        txn.commit();

        let params = read_params(&store.read_txn("modules/m.ko"));
        assert_eq!(params, vec!["mode=\"a b\"", "speed=fast"]);
    }

    #[test]
    fn scripts_are_rerooted_under_module_files() {
        let mut store = Store::in_memory();
        let mut txn = store.write_txn("modules/m.ko/scripts");
        txn.set_str("install", "/somewhere/else/load.sh");
        txn.commit();

        let script = read_script("m.ko", &store.read_txn("modules/m.ko"), "scripts/install");
        assert_eq!(script.unwrap(),
                   Path::new(SYSTEM_MODULE_DIR).join("m/scripts/load.sh"));
    }

    #[test]
    fn proc_modules_parse() {
        let dir = std::env::temp_dir().join(format!("av-kmod-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let table = dir.join("modules");
        fs::write(&table, "\
alpha 16384 0 - Live 0x0000000000000000\n\
beta 20480 1 alpha, Loading 0x0000000000000000\n").unwrap();

        assert_eq!(check_proc_modules("alpha.ko", &table), LoadStatus::Installed);
        assert_eq!(check_proc_modules("beta.ko", &table), LoadStatus::Try);
        assert_eq!(check_proc_modules("gamma.ko", &table), LoadStatus::Removed);

        let _ = fs::remove_dir_all(&dir);
    }
}
