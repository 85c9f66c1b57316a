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

//! App objects and their lifecycle.
//!
//! An app owns its processes, its sandbox links, and a reference on each
//! required kernel module while running.  Starting is synchronous;
//! stopping is asynchronous and finishes only when the last owned process
//! has been reaped and the app's freezer cgroup is empty.

use anyhow::{Result, Context};
use std::{
    path::{Path, PathBuf},
    time::Instant,
};
use nix::{
    sys::signal::{self, Signal},
    sys::wait::WaitStatus,
    unistd::{Pid, Uid, Gid},
};
use crate::{
    consts::*,
    config::ReadTxn,
    error::Kind,
    framework, policy, sandbox, users,
    proc::{AppEnv, FaultAction, FollowUp, Process, ProcState, WatchdogAction},
    supervisor::Ctx,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Stopped,
    Running,
}

enum ProcSlot {
    Configured(usize),
    Aux(usize),
}

pub struct App {
    name: String,
    cfg_path: String,
    sandboxed: bool,
    start_manual: bool,
    install_dir: PathBuf,
    working_dir: PathBuf,
    uid: Uid,
    gid: Gid,
    supplementary_gids: Vec<Gid>,
    state: AppState,
    procs: Vec<Process>,
    /// Processes created at runtime through the control API.
    aux_procs: Vec<Process>,
    /// Destinations of links added with add_link(), torn down at stop.
    additional_links: Vec<String>,
    /// (module name, isOptional), loaded at start, released at stop.
    req_modules: Vec<(String, bool)>,
    /// When set, the graceful kill escalates to SIGKILL at this instant.
    kill_deadline: Option<Instant>,
}

impl App {
    /// Creates an app object from its config entry.  The app name is the
    /// last node of the config path.
    pub fn create(cfg_path: &str, ctx: &mut Ctx) -> Result<App> {
        let name = cfg_path.rsplit('/').next().unwrap_or("").to_owned();

        if name.is_empty() || name.len() > MAX_APP_NAME_LEN {
            bail!("Invalid app name '{}'", name);
        }

        info!("Creating app '{}'", name);

        let cfg = ctx.store.read_txn(cfg_path);
        let sandboxed = cfg.get_bool("sandboxed", true);
        let start_manual = cfg.get_bool("startManual", false);

        let (uid, gid) = if sandboxed {
            users::app_ids(&name)
        } else {
            // Unsandboxed apps keep root so they can perform system
            // operations such as changing routing tables.
            (Uid::from_raw(0), Gid::from_raw(0))
        };

        let group_names = read_supplementary_groups(&cfg, &name)?;
        let supplementary_gids = if sandboxed {
            group_names.iter()
                .map(|g| users::lookup_group(g))
                .collect::<Result<Vec<Gid>>>()
                .with_context(|| format!("Bad supplementary groups for app '{}'", name))?
        } else {
            vec![]
        };

        let procs: Vec<Process> = cfg.child("procs").children().iter()
            .map(|(proc_name, _)| {
                let proc_cfg_path = format!("{}/procs/{}", cfg_path, proc_name);
                Process::new(proc_name, Some(&proc_cfg_path), &ctx.store)
            })
            .collect();

        // The freezer group must exist before the first process starts,
        // with release notification on so an emptying group is observed.
        ctx.cgroups.create_app(&name)
            .with_context(|| format!("Could not set application resource limits for '{}'",
                                     name))?;

        Ok(App {
            install_dir: Path::new(APPS_INSTALL_DIR).join(&name),
            working_dir: Path::new(APPS_WRITEABLE_DIR).join(&name),
            name,
            cfg_path: cfg_path.to_owned(),
            sandboxed,
            start_manual,
            uid,
            gid,
            supplementary_gids,
            state: AppState::Stopped,
            procs: vec![],
            aux_procs: vec![],
            additional_links: vec![],
            req_modules: vec![],
            kill_deadline: None,
        }.with_procs(procs))
    }

    fn with_procs(mut self, procs: Vec<Process>) -> Self {
        self.procs = procs;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cfg_path(&self) -> &str {
        &self.cfg_path
    }

    pub fn sandboxed(&self) -> bool {
        self.sandboxed
    }

    pub fn start_manual(&self) -> bool {
        self.start_manual
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    pub fn state(&self) -> AppState {
        self.state
    }

    pub fn kill_deadline(&self) -> Option<Instant> {
        self.kill_deadline
    }

    /// True if the pid is one of the processes the supervisor started
    /// directly; forks of those are only visible through the cgroup.
    pub fn has_top_level_pid(&self, pid: Pid) -> bool {
        self.find_proc(pid).is_some()
    }

    fn find_proc(&self, pid: Pid) -> Option<ProcSlot> {
        if let Some(i) = self.procs.iter().position(|p| p.pid() == Some(pid)) {
            return Some(ProcSlot::Configured(i));
        }
        self.aux_procs.iter().position(|p| p.pid() == Some(pid)).map(ProcSlot::Aux)
    }

    fn proc_mut(&mut self, slot: &ProcSlot) -> &mut Process {
        match slot {
            ProcSlot::Configured(i) => &mut self.procs[*i],
            ProcSlot::Aux(i) => &mut self.aux_procs[*i],
        }
    }

    fn app_env<'a>(name: &'a str, sandboxed: bool, working_dir: &'a Path,
                   uid: Uid, gid: Gid, groups: &'a [Gid]) -> AppEnv<'a> {
        AppEnv { app_name: name, sandboxed, working_dir, uid, gid, groups }
    }

    /// Starts the app: loads required kernel modules, installs the MAC
    /// rules, assembles the sandbox, and starts every configured process.
    ///
    /// A module-load failure does not abort outright: each process's fault
    /// action decides whether to carry on, restart the app (Terminated),
    /// defer a stop (WouldBlock), or reboot.
    pub fn start(&mut self, ctx: &mut Ctx) -> Result<()> {
        info!("Starting app '{}'", self.name);

        if self.state == AppState::Running {
            bail!("Application '{}' is already running.", self.name);
        }

        if framework::is_stopping() {
            bail!("App '{}' cannot be started because framework is shutting down.",
                  self.name);
        }

        self.req_modules = read_required_modules(&ctx.store.read_txn(&self.cfg_path));

        let module_load_failed = match ctx.kmods.install_list(&self.req_modules) {
            Ok(()) => false,
            Err(e) => {
                error!("Error in installing dependent kernel modules for app '{}': {}",
                       self.name, e);
                true
            }
        };

        self.state = AppState::Running;

        policy::set_app_rules(&self.name, self.sandboxed, &self.cfg_path,
                              &mut ctx.store, &ctx.smack)
            .context("Failed to set MAC rules")?;

        sandbox::setup_area(self, &ctx.store, &ctx.smack)
            .context("Failed to set up app area")?;

        if self.sandboxed {
            sandbox::create_tmp_fs(self, &ctx.smack)?;
            sandbox::create_default_tmp_links(self, &ctx.smack)?;
        }

        let name = self.name.clone();
        let sandboxed = self.sandboxed;
        let working_dir = self.working_dir.clone();
        let (uid, gid) = (self.uid, self.gid);
        let groups = self.supplementary_gids.clone();

        for i in 0..self.procs.len() {
            if module_load_failed {
                match self.procs[i].fault_action() {
                    FaultAction::RestartApp => {
                        error!("Fault action is to restart app '{}'.", name);
                        bail_kind!(Kind::Terminated, "Module load failed for app '{}'", name);
                    }
                    FaultAction::StopApp => {
                        error!("Fault action is to stop app '{}'.", name);
                        bail_kind!(Kind::WouldBlock, "Module load failed for app '{}'", name);
                    }
                    FaultAction::Reboot => {
                        error!("EMERG: Fault action is to reboot the system.");
                        framework::reboot();
                    }
                    _ => {
                        info!("Proceed with starting processes.");
                    }
                }
            }

            let env = Self::app_env(&name, sandboxed, &working_dir, uid, gid, &groups);

            if let Err(e) = self.procs[i].start(&env, &ctx.store, &ctx.cgroups) {
                error!("Could not start all application processes.  \
                        Stopping the application '{}': {}", name, e);
                self.stop(ctx);
                bail!("Failed to start app '{}'", name);
            }
        }

        Ok(())
    }

    /// Stops the app.  Asynchronous: the state moves to Stopped only when
    /// every owned process is reaped and the cgroup has emptied, which the
    /// supervisor observes via SIGCHLD and the kill-deadline sweep.
    pub fn stop(&mut self, ctx: &mut Ctx) {
        info!("Stopping app '{}'", self.name);

        policy::revoke_app_rules(&self.name, &ctx.smack);

        if self.state == AppState::Stopped {
            error!("Application '{}' is already stopped.", self.name);
            return;
        }

        if !self.req_modules.is_empty() {
            if let Err(e) = ctx.kmods.remove_list(&self.req_modules) {
                error!("{}", e);
            }
        }
        self.req_modules.clear();

        if self.kill_procs(ctx, Signal::SIGTERM) > 0 {
            // Give the processes one grace period to exit on their own.
            self.kill_deadline = Some(Instant::now() + KILL_TIMEOUT);
        }
        // The supervisor's drain sweep observes the processes and the
        // cgroup emptying and completes the stop.
    }

    /// The grace period expired; no more mercy.
    pub fn hard_kill(&mut self, ctx: &mut Ctx) {
        warn!("Hard killing app '{}'", self.name);
        self.kill_deadline = None;
        self.kill_procs(ctx, Signal::SIGKILL);
    }

    /// Freezes the app, marks every running process as commanded to die,
    /// signals every pid in the cgroup (catching forks and grandchildren),
    /// then thaws so signal handlers can run.  Returns the number of pids
    /// signaled.
    fn kill_procs(&mut self, ctx: &mut Ctx, sig: Signal) -> usize {
        match ctx.cgroups.freeze(&self.name) {
            Ok(()) => {
                if let Err(e) = ctx.cgroups.wait_frozen(&self.name) {
                    error!("Could not get freeze state of application '{}': {}",
                           self.name, e);
                }
                debug!("App '{}' frozen.", self.name);
            }
            Err(e) => {
                error!("Could not freeze processes for application '{}': {}", self.name, e);
            }
        }

        for p in self.procs.iter_mut().chain(self.aux_procs.iter_mut()) {
            if p.state() != ProcState::Stopped {
                p.follow_up = FollowUp::None;
                p.stopping();
            }
        }

        let num = ctx.cgroups.send_signal(&self.name, sig);

        if let Err(e) = ctx.cgroups.thaw(&self.name) {
            error!("Could not thaw processes for application '{}': {}", self.name, e);
        }

        num
    }

    pub fn has_running_proc(&self, ctx: &Ctx) -> bool {
        self.procs.iter().chain(self.aux_procs.iter())
            .any(|p| p.state() == ProcState::Running)
            || !ctx.cgroups.is_empty(&self.name)
    }

    /// Called when the last process has been reaped and the cgroup is
    /// empty.
    pub fn stop_complete(&mut self) {
        self.kill_deadline = None;
        info!("app '{}' has stopped.", self.name);
        self.state = AppState::Stopped;
    }

    /// Routes a SIGCHLD to the owning process object and translates its
    /// verdict.  Restarting a single process is handled right here; the
    /// returned action is what the caller still has to do (restart or stop
    /// the whole app, or reboot).
    pub fn sig_child_handler(&mut self, pid: Pid, status: WaitStatus, ctx: &mut Ctx)
        -> FaultAction
    {
        let slot = match self.find_proc(pid) {
            Some(s) => s,
            None => return FaultAction::None,
        };

        let name = self.name.clone();
        let sandboxed = self.sandboxed;
        let working_dir = self.working_dir.clone();
        let (uid, gid) = (self.uid, self.gid);
        let groups = self.supplementary_gids.clone();
        let is_good = ctx.status.is_good();

        let proc_ = self.proc_mut(&slot);

        // Interested external parties hear about every death.
        if let FollowUp::NotifyExternal(ref mut notify) = proc_.follow_up {
            notify(exit_code_of(status));
        }

        let proc_action = proc_.sig_child_handler(status, is_good, &name);

        let mut action = FaultAction::None;

        match proc_action {
            FaultAction::None => {
                // A commanded death.  The watchdog may have asked for the
                // process to come back afterwards.
                if let FollowUp::RestartAfterStop = proc_.follow_up {
                    proc_.follow_up = FollowUp::None;

                    let env = Self::app_env(&name, sandboxed, &working_dir, uid, gid, &groups);
                    if let Err(e) = proc_.start(&env, &ctx.store, &ctx.cgroups) {
                        error!("Watchdog could not restart process '{}' in app '{}': {}",
                               proc_.name(), name, e);
                        action = FaultAction::StopApp;
                    }
                }
            }

            FaultAction::Ignore => {
                warn!("Process '{}' in app '{}' faulted: Ignored.", proc_.name(), name);
            }

            FaultAction::RestartProc => {
                error!("Process '{}' in app '{}' faulted: Restarting process.",
                       proc_.name(), name);

                let env = Self::app_env(&name, sandboxed, &working_dir, uid, gid, &groups);
                if let Err(e) = proc_.start(&env, &ctx.store, &ctx.cgroups) {
                    error!("Could not restart process '{}' in app '{}': {}",
                           proc_.name(), name, e);
                    action = FaultAction::StopApp;
                }
            }

            FaultAction::RestartApp => {
                error!("Process '{}' in app '{}' faulted: Restarting app.",
                       proc_.name(), name);
                action = FaultAction::RestartApp;
            }

            FaultAction::StopApp => {
                error!("Process '{}' in app '{}' faulted: Stopping app.",
                       proc_.name(), name);
                action = FaultAction::StopApp;
            }

            FaultAction::Reboot => {
                error!("EMERG: Process '{}' in app '{}' faulted: Rebooting system.",
                       proc_.name(), name);
                action = FaultAction::Reboot;
            }
        }

        // On a system still under probation, a stop is not enough: the
        // fault may well be the new system's, and a reboot rolls it back.
        if action == FaultAction::StopApp && !is_good {
            error!("EMERG: App '{}' would be stopped but system is on probation. \
                    Device will be rebooted.", name);
            action = FaultAction::Reboot;
        }

        action
    }

    /// Looks up and applies the watchdog policy for a process that missed
    /// its kick.  Process-level remedies (ignore, stop, restart) are fully
    /// handled here and report Handled; app-level ones are returned for
    /// the caller.
    pub fn watchdog_timeout_handler(&mut self, pid: Pid, _ctx: &mut Ctx)
        -> Result<WatchdogAction>
    {
        let slot = match self.find_proc(pid) {
            Some(s) => s,
            None => bail_kind!(Kind::NotFound, "No process with pid {} in app '{}'",
                               pid, self.name),
        };

        let app_name = self.name.clone();
        let proc_ = self.proc_mut(&slot);
        let action = proc_.watchdog_action();

        let handled = match action {
            WatchdogAction::NotFound | WatchdogAction::Error => {
                error!("The watchdog for process '{}' in app '{}' has timed out but there \
                        is no policy. The process will be restarted by default.",
                       proc_.name(), app_name);

                proc_.follow_up = FollowUp::RestartAfterStop;
                stop_proc(proc_);
                WatchdogAction::Handled
            }

            WatchdogAction::Ignore => {
                error!("The watchdog for process '{}' in app '{}' has timed out and will \
                        be ignored in accordance with its timeout policy.",
                       proc_.name(), app_name);
                WatchdogAction::Handled
            }

            WatchdogAction::Stop => {
                error!("The watchdog for process '{}' in app '{}' has timed out and will \
                        be terminated in accordance with its timeout policy.",
                       proc_.name(), app_name);

                stop_proc(proc_);
                WatchdogAction::Handled
            }

            WatchdogAction::Restart => {
                error!("The watchdog for process '{}' in app '{}' has timed out and will \
                        be restarted in accordance with its timeout policy.",
                       proc_.name(), app_name);

                proc_.follow_up = FollowUp::RestartAfterStop;
                stop_proc(proc_);
                WatchdogAction::Handled
            }

            WatchdogAction::RestartApp | WatchdogAction::StopApp => {
                error!("The watchdog for process '{}' in app '{}' has timed out; applying \
                        its app-level timeout policy.", proc_.name(), app_name);
                action
            }

            WatchdogAction::Reboot => {
                error!("EMERG: The watchdog for process '{}' in app '{}' has timed out and \
                        the system will now be rebooted in accordance with its timeout \
                        policy.", proc_.name(), app_name);
                action
            }

            WatchdogAction::Handled => action,
        };

        Ok(handled)
    }

    /// Returns the process with the given name, looking at configured
    /// processes first.
    pub fn get_proc_mut(&mut self, proc_name: &str) -> Option<&mut Process> {
        if let Some(i) = self.procs.iter().position(|p| p.name() == proc_name) {
            return Some(&mut self.procs[i]);
        }
        let i = self.aux_procs.iter().position(|p| p.name() == proc_name)?;
        Some(&mut self.aux_procs[i])
    }

    /// References a process for the control API.  Naming a configured
    /// process returns it (optionally overriding its executable); anything
    /// else creates an auxiliary process, which needs an executable path.
    /// Returns the process name.
    pub fn create_proc(&mut self, proc_name: Option<&str>, exec_path: Option<&str>,
                       ctx: &Ctx) -> Result<String>
    {
        if let Some(requested) = proc_name {
            if let Some(p) = self.get_proc_mut(requested) {
                if p.state() == ProcState::Running {
                    bail!("Process '{}' in app '{}' is already running.",
                          requested, self.name);
                }

                if let Some(exec) = exec_path {
                    p.set_exec_path(Some(exec));
                }

                return Ok(requested.to_owned());
            }
        }

        let exec = exec_path.with_context(||
            format!("Executable path for a new process in app {} cannot be empty",
                    self.name))?;

        let name = match proc_name {
            Some(n) => n.to_owned(),
            None => {
                let exe_base = exec.rsplit('/').next().unwrap_or(exec);
                self.make_temp_proc_name(exe_base)?
            }
        };

        let mut p = Process::new(&name, None, &ctx.store);
        p.set_exec_path(Some(exec));
        self.aux_procs.push(p);

        Ok(name)
    }

    /// Picks `<exe>@N` with the smallest free N.  The exe part is
    /// truncated when needed; N never exceeds two digits.
    fn make_temp_proc_name(&self, exe_name: &str) -> Result<String> {
        for i in 0..MAX_AUX_PROCS {
            let suffix = format!("@{}", i);

            let mut base = exe_name.to_owned();
            while base.len() + suffix.len() > MAX_PROC_NAME_LEN {
                base.pop();
            }

            let candidate = format!("{}{}", base, suffix);

            if !self.aux_procs.iter().any(|p| p.name() == candidate) {
                return Ok(candidate);
            }
        }

        bail!("No free process name for '{}' in app '{}'", exe_name, self.name)
    }

    pub fn start_proc(&mut self, proc_name: &str, ctx: &Ctx) -> Result<()> {
        let name = self.name.clone();
        let sandboxed = self.sandboxed;
        let working_dir = self.working_dir.clone();
        let (uid, gid) = (self.uid, self.gid);
        let groups = self.supplementary_gids.clone();

        let p = self.get_proc_mut(proc_name)
            .with_context(|| format!("No process '{}' in app '{}'", proc_name, name))?;

        if p.state() == ProcState::Running {
            return Ok(());
        }

        let env = Self::app_env(&name, sandboxed, &working_dir, uid, gid, &groups);
        p.start(&env, &ctx.store, &ctx.cgroups)
    }

    /// Deletes a process reference.  Configured processes survive with
    /// their overrides reset; auxiliary ones are destroyed.
    pub fn delete_proc(&mut self, proc_name: &str) -> Result<()> {
        let p = self.get_proc_mut(proc_name)
            .with_context(|| format!("No process '{}'", proc_name))?;

        if p.state() == ProcState::Running {
            stop_proc(p);
        }

        if p.cfg_path().is_some() {
            p.set_stdin(None);
            p.set_stdout(None);
            p.set_stderr(None);
            p.set_exec_path(None);
            let _ = p.set_priority(None);
            p.clear_args();
            p.set_fault_action(FaultAction::None);
            p.set_run(true);
            p.set_debug(false);
            p.follow_up = FollowUp::None;
        } else if let Some(i) = self.aux_procs.iter().position(|p| p.name() == proc_name) {
            self.aux_procs.remove(i);
        }

        Ok(())
    }

    /// Links one extra host file into the (running) app.
    pub fn add_link(&mut self, path: &str, ctx: &Ctx) -> Result<()> {
        let dest = sandbox::add_link(self, &ctx.smack, path)?;
        self.additional_links.push(dest);
        Ok(())
    }

    /// Tears down every link added with add_link().
    pub fn remove_all_links(&mut self) {
        for dest in std::mem::replace(&mut self.additional_links, vec![]) {
            sandbox::remove_link(self, &dest);
        }
    }

    pub fn set_dev_perm(&self, path: &str, perm: &str, ctx: &Ctx) -> Result<()> {
        policy::set_device_rule(&crate::smack::Smack::app_label(&self.name),
                                path, perm, &ctx.smack)
            .with_context(|| format!("Failed to set permissions ({}) for app '{}' \
                                      on device '{}'", perm, self.name, path))
    }

    /// Releases a process blocked between fork+init and exec.
    pub fn unblock(&mut self, pid: Pid) -> Result<()> {
        let slot = match self.find_proc(pid) {
            Some(s) => s,
            None => bail_kind!(Kind::NotFound, "No process with pid {} in app '{}'",
                               pid, self.name),
        };

        self.proc_mut(&slot).unblock();
        Ok(())
    }

    /// Final cleanup when the app object is removed.  The app must already
    /// be stopped.
    pub fn delete(&mut self, ctx: &mut Ctx) {
        assert_eq!(self.state, AppState::Stopped,
                   "app '{}' must be stopped before deletion", self.name);

        policy::revoke_app_rules(&self.name, &ctx.smack);
        policy::cleanup_resources(&self.name, &mut ctx.store);
        ctx.cgroups.remove_app(&self.name);

        self.procs.clear();
        self.aux_procs.clear();
    }
}

/// Kills one process.  The commanded-kill mark ensures the following
/// SIGCHLD does not count as a fault.
fn stop_proc(p: &mut Process) {
    p.stopping();

    if let Some(pid) = p.pid() {
        if let Err(e) = signal::kill(pid, Signal::SIGKILL) {
            warn!("Failed to kill pid {}: {}", pid, e);
        }
    }
}

fn exit_code_of(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, sig, _) => 128 + sig as i32,
        _ => -1,
    }
}

/// The supplementary group list is hard-bounded; a config with more
/// entries is a packaging error.
fn read_supplementary_groups(cfg: &ReadTxn, app_name: &str) -> Result<Vec<String>> {
    let groups = cfg.string_list("groups");

    if groups.len() > MAX_NUM_SUPPLEMENTARY_GROUPS {
        bail!("Too many supplementary groups for app '{}'.", app_name);
    }

    Ok(groups)
}

fn read_required_modules(cfg: &ReadTxn) -> Vec<(String, bool)> {
    cfg.child("requires/kernelModules").elements().iter()
        .filter_map(|e| {
            let name = e.get_str("name", "");
            if name.is_empty() {
                warn!("Found empty kernel module dependency");
                None
            } else {
                Some((name, e.get_bool("isOptional", false)))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Store;
    use crate::supervisor::Ctx;

    fn test_ctx(tag: &str) -> Ctx {
        Ctx::for_tests(tag)
    }

    fn app_config(store: &mut Store, name: &str, sandboxed: bool) {
        let mut txn = store.write_txn(&format!("apps/{}", name));
        txn.set_value("sandboxed", json!(sandboxed));
        txn.set_value("procs", json!({
            "main": { "args": ["/bin/echo", "hello"], "faultAction": "restart" }
        }));
        txn.commit();
    }

    #[test]
    fn create_reads_identity_and_procs() {
        let mut ctx = test_ctx("create");
        app_config(&mut ctx.store, "cam", true);

        let app = App::create("apps/cam", &mut ctx).unwrap();

        assert_eq!(app.name(), "cam");
        assert_eq!(app.state(), AppState::Stopped);
        assert!(app.sandboxed());
        assert_ne!(app.uid(), Uid::from_raw(0));
        assert_eq!(app.procs.len(), 1);
        assert_eq!(app.procs[0].name(), "main");
        assert_eq!(app.install_dir(), Path::new(APPS_INSTALL_DIR).join("cam"));
        assert_eq!(app.working_dir(), Path::new(APPS_WRITEABLE_DIR).join("cam"));
    }

    #[test]
    fn unsandboxed_app_is_root() {
        let mut ctx = test_ctx("root");
        app_config(&mut ctx.store, "tools", false);

        let app = App::create("apps/tools", &mut ctx).unwrap();
        assert_eq!(app.uid(), Uid::from_raw(0));
        assert_eq!(app.gid(), Gid::from_raw(0));
    }

    #[test]
    fn group_list_is_bounded() {
        let mut store = Store::in_memory();

        let at_bound: Vec<String> =
            (0..MAX_NUM_SUPPLEMENTARY_GROUPS).map(|i| format!("g{}", i)).collect();
        let mut txn = store.write_txn("apps/cam");
        txn.set_value("groups", json!(at_bound));
        txn.commit();

        let cfg = store.read_txn("apps/cam");
        assert_eq!(read_supplementary_groups(&cfg, "cam").unwrap().len(),
                   MAX_NUM_SUPPLEMENTARY_GROUPS);

        let over: Vec<String> =
            (0..MAX_NUM_SUPPLEMENTARY_GROUPS + 1).map(|i| format!("g{}", i)).collect();
        let mut txn = store.write_txn("apps/cam");
        txn.set_value("groups", json!(over));
        txn.commit();

        let cfg = store.read_txn("apps/cam");
        assert!(read_supplementary_groups(&cfg, "cam").is_err());
    }

    #[test]
    fn required_modules_parse_with_optional_flag() {
        let mut store = Store::in_memory();
        let mut txn = store.write_txn("apps/cam/requires");
        txn.set_value("kernelModules", json!([
            { "name": "m1.ko" },
            { "name": "m2.ko", "isOptional": true },
            { "name": "" },
        ]));
        txn.commit();

        let mods = read_required_modules(&store.read_txn("apps/cam"));
        assert_eq!(mods, vec![("m1.ko".to_owned(), false), ("m2.ko".to_owned(), true)]);
    }

    #[test]
    fn aux_proc_names_fill_the_at_slots() {
        let mut ctx = test_ctx("auxnames");
        app_config(&mut ctx.store, "cam", true);
        let mut app = App::create("apps/cam", &mut ctx).unwrap();

        for i in 0..MAX_AUX_PROCS {
            let name = app.create_proc(None, Some("/bin/worker"), &ctx).unwrap();
            assert_eq!(name, format!("worker@{}", i));
        }

        // All 32 slots taken; the next request has nowhere to go.
        assert!(app.create_proc(None, Some("/bin/worker"), &ctx).is_err());

        // Other executables are unaffected.
        assert_eq!(app.create_proc(None, Some("/bin/other"), &ctx).unwrap(), "other@0");
    }

    #[test]
    fn aux_proc_name_truncates_long_exe() {
        let mut ctx = test_ctx("longname");
        app_config(&mut ctx.store, "cam", true);
        let mut app = App::create("apps/cam", &mut ctx).unwrap();

        let long_exe = format!("/bin/{}", "x".repeat(2 * MAX_PROC_NAME_LEN));
        let name = app.create_proc(None, Some(&long_exe), &ctx).unwrap();

        assert!(name.len() <= MAX_PROC_NAME_LEN);
        assert!(name.ends_with("@0"));
    }

    #[test]
    fn create_proc_returns_configured_process() {
        let mut ctx = test_ctx("cfgproc");
        app_config(&mut ctx.store, "cam", true);
        let mut app = App::create("apps/cam", &mut ctx).unwrap();

        let name = app.create_proc(Some("main"), None, &ctx).unwrap();
        assert_eq!(name, "main");
        assert!(app.aux_procs.is_empty());

        // A brand-new name without an executable is refused.
        assert!(app.create_proc(Some("ghost"), None, &ctx).is_err());
    }

    #[test]
    fn delete_proc_removes_aux_but_resets_configured() {
        let mut ctx = test_ctx("delproc");
        app_config(&mut ctx.store, "cam", true);
        let mut app = App::create("apps/cam", &mut ctx).unwrap();

        let aux = app.create_proc(None, Some("/bin/worker"), &ctx).unwrap();
        app.delete_proc(&aux).unwrap();
        assert!(app.aux_procs.is_empty());

        app.delete_proc("main").unwrap();
        assert_eq!(app.procs.len(), 1);
    }

    #[test]
    fn sig_child_for_unknown_pid_is_a_noop() {
        let mut ctx = test_ctx("unknownpid");
        app_config(&mut ctx.store, "cam", true);
        let mut app = App::create("apps/cam", &mut ctx).unwrap();

        let action = app.sig_child_handler(
            Pid::from_raw(12345),
            WaitStatus::Exited(Pid::from_raw(12345), 1),
            &mut ctx);

        assert_eq!(action, FaultAction::None);
    }

    #[test]
    fn watchdog_restart_arms_follow_up_and_suppresses_fault() {
        let mut ctx = test_ctx("wdog");

        let mut txn = ctx.store.write_txn("apps/cam");
        txn.set_value("procs", json!({
            "main": { "args": ["/bin/cam"], "faultAction": "restart",
                      "watchdogAction": "restart" }
        }));
        txn.commit();

        let mut app = App::create("apps/cam", &mut ctx).unwrap();

        // Far beyond pid_max, so the SIGKILL goes nowhere.
        let pid = Pid::from_raw(99_999_999);
        app.procs[0].set_pid_for_test(Some(pid));

        let action = app.watchdog_timeout_handler(pid, &mut ctx).unwrap();
        assert_eq!(action, WatchdogAction::Handled);
        assert!(matches!(app.procs[0].follow_up, FollowUp::RestartAfterStop));

        // The ensuing SIGCHLD is a commanded death: no fault is raised and
        // the restart path runs (a no-op here since the proc is marked not
        // to run).
        app.procs[0].set_run(false);
        let action = app.sig_child_handler(
            pid, WaitStatus::Signaled(pid, Signal::SIGKILL, false), &mut ctx);
        assert_eq!(action, FaultAction::None);
        assert!(matches!(app.procs[0].follow_up, FollowUp::None));
    }

    #[test]
    fn watchdog_app_level_actions_propagate() {
        let mut ctx = test_ctx("wdogapp");

        let mut txn = ctx.store.write_txn("apps/cam");
        txn.set_value("procs", json!({
            "main": { "args": ["/bin/cam"], "watchdogAction": "stopApp" }
        }));
        txn.commit();

        let mut app = App::create("apps/cam", &mut ctx).unwrap();
        let pid = Pid::from_raw(99_999_998);
        app.procs[0].set_pid_for_test(Some(pid));

        let action = app.watchdog_timeout_handler(pid, &mut ctx).unwrap();
        assert_eq!(action, WatchdogAction::StopApp);

        let e = app.watchdog_timeout_handler(Pid::from_raw(1), &mut ctx).unwrap_err();
        assert_eq!(crate::error::kind(&e), Some(Kind::NotFound));
    }

    #[test]
    fn external_stop_notification_fires_on_death() {
        use std::rc::Rc;
        use std::cell::Cell;

        let mut ctx = test_ctx("notify");
        app_config(&mut ctx.store, "cam", true);
        let mut app = App::create("apps/cam", &mut ctx).unwrap();

        let seen = Rc::new(Cell::new(-1));
        let seen2 = seen.clone();
        app.procs[0].follow_up = FollowUp::NotifyExternal(Box::new(move |code| {
            seen2.set(code);
        }));

        let pid = Pid::from_raw(99_999_997);
        app.procs[0].set_pid_for_test(Some(pid));
        app.procs[0].set_run(false);

        app.sig_child_handler(pid, WaitStatus::Exited(pid, 3), &mut ctx);
        assert_eq!(seen.get(), 3);
    }

    #[test]
    fn stop_app_escalates_to_reboot_on_probation() {
        let mut ctx = test_ctx("probation");
        ctx.set_probation_for_tests(true);

        let mut txn = ctx.store.write_txn("apps/cam");
        txn.set_value("procs", json!({
            "main": { "args": ["/bin/cam"], "faultAction": "stopApp" }
        }));
        txn.commit();

        let mut app = App::create("apps/cam", &mut ctx).unwrap();
        let pid = Pid::from_raw(99_999_996);
        app.procs[0].set_pid_for_test(Some(pid));

        let action = app.sig_child_handler(
            pid, WaitStatus::Exited(pid, 1), &mut ctx);
        assert_eq!(action, FaultAction::Reboot);
    }
}
