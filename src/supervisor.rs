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

//! The supervisor proper: one single-threaded event loop over a signalfd
//! and the control socket.
//!
//! Control flows downward on requests (start, stop, module load) and
//! upward on SIGCHLD: the dead pid is matched to its app, the app decides
//! a fault action, and the loop applies it.  Kill escalation and
//! stop-completion are driven by the loop's timeout sweep rather than by
//! timers, so there is exactly one place where time passes.

use anyhow::{Result, Context};
use std::{
    collections::{HashMap, HashSet},
    fs,
    io::{BufRead, BufReader, Write},
    os::unix::io::AsRawFd,
    os::unix::net::{UnixListener, UnixStream},
    time::Instant,
};
use nix::{
    sys::signal::{self, SigSet, Signal, SigmaskHow},
    sys::signalfd::{SignalFd, SfdFlags},
    sys::wait::{waitpid, WaitPidFlag, WaitStatus},
    unistd::Pid,
};
use crate::{
    app::{App, AppState},
    cgroup::Cgroups,
    config::Store,
    consts::*,
    ctrl::{Request, Response, Code},
    error::Kind,
    framework,
    kmod::ModuleTable,
    poller::{Poller, EpollFlags},
    proc::FaultAction,
    smack::Smack,
    sys_status::SysStatus,
    util,
};

/// Everything the app and process machinery needs from its surroundings.
/// One per supervisor; tests build their own with scratch roots.
pub struct Ctx {
    pub store: Store,
    pub smack: Smack,
    pub cgroups: Cgroups,
    pub status: SysStatus,
    pub kmods: ModuleTable,
}

impl Ctx {
    pub fn new() -> Result<Self> {
        let store = Store::load(&CONFIG_PATH)?;
        let kmods = ModuleTable::init(&store);

        Ok(Self {
            store,
            smack: Smack::new(),
            cgroups: Cgroups::new(),
            status: SysStatus::new(),
            kmods,
        })
    }

    #[cfg(test)]
    pub fn for_tests(tag: &str) -> Self {
        let root = std::env::temp_dir()
            .join(format!("av-ctx-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(root.join("smack")).unwrap();
        fs::create_dir_all(root.join("cgroup")).unwrap();

        let store = Store::in_memory();
        let kmods = ModuleTable::init(&store);

        Self {
            store,
            smack: Smack::with_root(&root.join("smack")),
            cgroups: Cgroups::with_root(&root.join("cgroup")),
            status: SysStatus::with_marker(&root.join("probation")),
            kmods,
        }
    }

    #[cfg(test)]
    pub fn set_probation_for_tests(&mut self, on: bool) {
        let marker = std::env::temp_dir()
            .join(format!("av-probation-{}", std::process::id()));
        if on {
            fs::write(&marker, "").unwrap();
        } else {
            let _ = fs::remove_file(&marker);
        }
        self.status = SysStatus::with_marker(&marker);
    }
}

enum PollObj {
    Signals(SignalFd),
    Listener(UnixListener),
    Conn(BufReader<UnixStream>),
}

pub struct Supervisor {
    ctx: Ctx,
    apps: HashMap<String, App>,
    /// Apps to start again once their stop completes (RestartApp faults).
    pending_restarts: HashSet<String>,
}

impl Supervisor {
    pub fn new(ctx: Ctx) -> Self {
        Self {
            ctx,
            apps: HashMap::new(),
            pending_restarts: HashSet::new(),
        }
    }

    /// Daemon main: boot, then the event loop, then orderly shutdown.
    pub fn run(&mut self) -> Result<()> {
        ensure_privileges()?;

        util::create_dir_all(&AV_DIR)?;

        // Boot-time module auto-load, before any app needs them.
        self.ctx.kmods.insert_all();

        self.create_configured_apps();

        // SIGCHLD and the termination signals arrive through a signalfd so
        // child status is handled after the signal is drained, never in a
        // handler.
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        mask.add(Signal::SIGTERM);
        mask.add(Signal::SIGINT);
        signal::pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)
            .context("Failed to block signals")?;

        let signal_fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .context("Failed to create a signalfd")?;

        let _ = fs::remove_file(&*CTRL_SOCKET_PATH);
        let listener = UnixListener::bind(&*CTRL_SOCKET_PATH)
            .with_context(|| format!("Failed to bind socket to {}",
                                     CTRL_SOCKET_PATH.display()))?;

        let mut poller = Poller::<PollObj>::new()?;
        poller.add(signal_fd.as_raw_fd(), PollObj::Signals(signal_fd), EpollFlags::EPOLLIN)?;
        poller.add(listener.as_raw_fd(), PollObj::Listener(listener), EpollFlags::EPOLLIN)?;

        self.autostart_apps();

        info!("Supervisor is ready");

        loop {
            let timeout = self.poll_timeout_ms();

            let mut new_conn = None;
            let mut closed_conn = None;
            let mut request = None;
            let mut terminate = false;

            match poller.poll(8, timeout)? {
                None => {} // timeout; fall through to the sweeps
                Some((key, obj)) => match obj {
                    PollObj::Signals(sfd) => {
                        let mut got_sigchld = false;

                        while let Ok(Some(si)) = sfd.read_signal() {
                            if si.ssi_signo == Signal::SIGCHLD as u32 {
                                got_sigchld = true;
                            } else {
                                terminate = true;
                            }
                        }

                        if got_sigchld {
                            self.reap_children();
                        }
                    }
                    PollObj::Listener(listener) => {
                        match listener.accept() {
                            Ok((stream, _)) => new_conn = Some(stream),
                            Err(e) => error!("Failed to accept a control connection: {}", e),
                        }
                    }
                    PollObj::Conn(reader) => {
                        let mut line = String::new();
                        match reader.read_line(&mut line) {
                            Ok(0) => closed_conn = Some(key),
                            Ok(_) => request = Some((key, line)),
                            Err(e) => {
                                debug!("Control connection error: {}", e);
                                closed_conn = Some(key);
                            }
                        }
                    }
                },
            }

            if let Some(stream) = new_conn {
                poller.add(stream.as_raw_fd(), PollObj::Conn(BufReader::new(stream)),
                           EpollFlags::EPOLLIN)?;
            }

            if let Some((key, line)) = request {
                let response = self.dispatch_line(&line);

                if let Some(PollObj::Conn(reader)) = poller.get_mut(key) {
                    let stream = reader.get_mut();
                    let mut data = serde_json::to_string(&response).unwrap();
                    data.push('\n');
                    if stream.write_all(data.as_bytes()).is_err() {
                        closed_conn = Some(key);
                    }
                }
            }

            if let Some(key) = closed_conn {
                let _ = poller.remove(key);
            }

            self.sweep_kill_deadlines();
            self.sweep_draining_apps();

            if terminate {
                self.shutdown();
                return Ok(());
            }
        }
    }

    fn create_configured_apps(&mut self) {
        let cfg_paths: Vec<String> = self.ctx.store.read_txn("apps").children()
            .iter()
            .map(|(name, _)| format!("apps/{}", name))
            .collect();

        for cfg_path in cfg_paths {
            match App::create(&cfg_path, &mut self.ctx) {
                Ok(app) => {
                    self.apps.insert(app.name().to_owned(), app);
                }
                Err(e) => {
                    error!("Failed to create app from '{}': {:#}", cfg_path, e);
                }
            }
        }
    }

    fn autostart_apps(&mut self) {
        let auto: Vec<String> = self.apps.values()
            .filter(|a| !a.start_manual())
            .map(|a| a.name().to_owned())
            .collect();

        for name in auto {
            if let Err(e) = self.start_app(&name) {
                error!("Failed to start app '{}': {:#}", name, e);
            }
        }
    }

    /// Starts an app, applying the module-failure escalations from
    /// app::start: Terminated restarts the app, WouldBlock stops it.
    fn start_app(&mut self, name: &str) -> Result<()> {
        let app = match self.apps.get_mut(name) {
            Some(a) => a,
            None => bail_kind!(Kind::NotFound, "App '{}' is not installed", name),
        };

        match app.start(&mut self.ctx) {
            Ok(()) => Ok(()),
            Err(e) => {
                match crate::error::kind(&e) {
                    Some(Kind::Terminated) => {
                        app.stop(&mut self.ctx);
                        self.pending_restarts.insert(name.to_owned());
                    }
                    Some(Kind::WouldBlock) => {
                        app.stop(&mut self.ctx);
                    }
                    _ => {
                        // app::start already stopped itself on plain faults.
                    }
                }
                Err(e)
            }
        }
    }

    fn stop_app(&mut self, name: &str) -> Result<()> {
        let app = match self.apps.get_mut(name) {
            Some(a) => a,
            None => bail_kind!(Kind::NotFound, "App '{}' is not installed", name),
        };

        if app.state() == AppState::Stopped {
            bail!("Application '{}' is already stopped.", name);
        }

        app.stop(&mut self.ctx);
        Ok(())
    }

    /// Reaps every waitable child and routes each to its app.
    fn reap_children(&mut self) {
        loop {
            let status = match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(s) => s,
                Err(nix::Error::Sys(nix::errno::Errno::ECHILD)) => break,
                Err(e) => {
                    error!("wait() failed: {}", e);
                    break;
                }
            };

            let pid = match status {
                WaitStatus::Exited(pid, _) | WaitStatus::Signaled(pid, _, _) => pid,
                // Stop/continue events of traced children are not ours to
                // handle.
                _ => continue,
            };

            self.handle_child_death(pid, status);
        }
    }

    fn handle_child_death(&mut self, pid: Pid, status: WaitStatus) {
        let owner = self.apps.iter()
            .find(|(_, a)| a.has_top_level_pid(pid))
            .map(|(name, _)| name.clone());

        let name = match owner {
            Some(n) => n,
            None => {
                // Orphans re-parented to us; already reaped, nothing more.
                debug!("Reaped unknown pid {}", pid);
                return;
            }
        };

        let app = self.apps.get_mut(&name).unwrap();
        let action = app.sig_child_handler(pid, status, &mut self.ctx);

        match action {
            FaultAction::RestartApp => {
                app.stop(&mut self.ctx);
                self.pending_restarts.insert(name);
            }
            FaultAction::StopApp => {
                app.stop(&mut self.ctx);
            }
            FaultAction::Reboot => {
                framework::reboot();
            }
            _ => {}
        }
    }

    /// Soft-killed apps whose grace period ran out get the hard kill.
    fn sweep_kill_deadlines(&mut self) {
        let now = Instant::now();

        let due: Vec<String> = self.apps.values()
            .filter(|a| a.kill_deadline().map_or(false, |d| d <= now))
            .map(|a| a.name().to_owned())
            .collect();

        for name in due {
            let app = self.apps.get_mut(&name).unwrap();
            app.hard_kill(&mut self.ctx);
        }
    }

    /// Completes the stop of apps whose processes are all gone and whose
    /// cgroup has emptied, cleaning the sandbox and starting the app again
    /// if a restart is pending.
    fn sweep_draining_apps(&mut self) {
        let draining: Vec<String> = self.apps.values()
            .filter(|a| a.state() == AppState::Running)
            .filter(|a| !a.has_running_proc(&self.ctx))
            .map(|a| a.name().to_owned())
            .collect();

        for name in draining {
            let app = self.apps.get_mut(&name).unwrap();

            app.remove_all_links();
            app.stop_complete();

            if let Err(e) = crate::sandbox::remove_area(app) {
                error!("Failed to tear down area of app '{}': {:#}", name, e);
            }

            if self.pending_restarts.remove(&name) {
                info!("Restarting app '{}'", name);
                if let Err(e) = self.start_app(&name) {
                    error!("Failed to restart app '{}': {:#}", name, e);
                }
            }
        }
    }

    /// How long poll may sleep: up to the nearest kill deadline, briefly
    /// when a stop is draining, forever otherwise.
    fn poll_timeout_ms(&self) -> isize {
        let now = Instant::now();

        let nearest: Option<Instant> = self.apps.values()
            .filter_map(|a| a.kill_deadline())
            .min();

        if let Some(deadline) = nearest {
            let ms = deadline.saturating_duration_since(now).as_millis() as isize;
            return ms.max(0);
        }

        let draining = self.apps.values().any(|a| {
            a.state() == AppState::Running && a.kill_deadline().is_none()
                && !a.has_running_proc(&self.ctx)
        });

        if draining { 100 } else { -1 }
    }

    fn dispatch_line(&mut self, line: &str) -> Response {
        let request: Request = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                return Response {
                    result: Code::Fault,
                    detail: Some(format!("Bad request: {}", e)),
                };
            }
        };

        debug!("Control request: {:?}", request);

        match self.handle_request(request) {
            Ok(r) => r,
            Err(e) => Response::from_error(&e),
        }
    }

    fn handle_request(&mut self, request: Request) -> Result<Response> {
        use Request::*;

        match request {
            StartApp { app } => {
                self.start_app(&app)?;
                Ok(Response::ok())
            }

            StopApp { app } => {
                self.stop_app(&app)?;
                Ok(Response::ok())
            }

            DeleteApp { app } => {
                if self.app(&app)?.state() != AppState::Stopped {
                    bail!("Application '{}' must be stopped before removal", app);
                }

                let mut removed = self.apps.remove(&app).unwrap();
                removed.delete(&mut self.ctx);
                self.pending_restarts.remove(&app);
                Ok(Response::ok())
            }

            AppStatus { app } => {
                let app = self.app(&app)?;
                Ok(Response::ok_with(format!("{:?}", app.state())))
            }

            ListApps => {
                let mut names: Vec<&str> =
                    self.apps.values().map(|a| a.name()).collect();
                names.sort();
                Ok(Response::ok_with(names.join(" ")))
            }

            LoadKernelModule { module } => {
                self.ctx.kmods.load(&module)?;
                Ok(Response::ok())
            }

            UnloadKernelModule { module } => {
                self.ctx.kmods.unload(&module)?;
                Ok(Response::ok())
            }

            AddLink { app, path } => {
                let (app, ctx) = self.app_and_ctx(&app)?;
                app.add_link(&path, ctx)?;
                Ok(Response::ok())
            }

            RemoveAllLinks { app } => {
                self.app(&app)?.remove_all_links();
                Ok(Response::ok())
            }

            SetDevPermission { app, path, perm } => {
                let (app, ctx) = self.app_and_ctx(&app)?;
                app.set_dev_perm(&path, &perm, ctx)?;
                Ok(Response::ok())
            }

            CreateProc { app, proc_name, exec_path } => {
                let (app, ctx) = self.app_and_ctx(&app)?;
                let name = app.create_proc(proc_name.as_deref(), exec_path.as_deref(), ctx)?;
                Ok(Response::ok_with(name))
            }

            StartProc { app, proc_name } => {
                let (app, ctx) = self.app_and_ctx(&app)?;
                app.start_proc(&proc_name, ctx)?;
                Ok(Response::ok())
            }

            DeleteProc { app, proc_name } => {
                self.app(&app)?.delete_proc(&proc_name)?;
                Ok(Response::ok())
            }

            SetProcPriority { app, proc_name, priority } => {
                self.proc(&app, &proc_name)?.set_priority(priority.as_deref())?;
                Ok(Response::ok())
            }

            AddProcArg { app, proc_name, arg } => {
                self.proc(&app, &proc_name)?.add_arg(&arg);
                Ok(Response::ok())
            }

            ClearProcArgs { app, proc_name } => {
                self.proc(&app, &proc_name)?.clear_args();
                Ok(Response::ok())
            }

            SetProcFaultAction { app, proc_name, action } => {
                let parsed = crate::proc::FaultAction::from_config(&action, &proc_name);
                self.proc(&app, &proc_name)?.set_fault_action(parsed);
                Ok(Response::ok())
            }

            SetProcRun { app, proc_name, run } => {
                self.proc(&app, &proc_name)?.set_run(run);
                Ok(Response::ok())
            }

            SetProcDebug { app, proc_name, debug } => {
                self.proc(&app, &proc_name)?.set_debug(debug);
                Ok(Response::ok())
            }

            Unblock { app, pid } => {
                self.app(&app)?.unblock(Pid::from_raw(pid))?;
                Ok(Response::ok())
            }

            WatchdogExpired { app, pid } => {
                let pid = Pid::from_raw(pid);
                let (app_name, action) = {
                    let (app, ctx) = self.app_and_ctx(&app)?;
                    (app.name().to_owned(), app.watchdog_timeout_handler(pid, ctx)?)
                };

                use crate::proc::WatchdogAction as W;
                match action {
                    W::RestartApp => {
                        self.stop_app(&app_name)?;
                        self.pending_restarts.insert(app_name);
                    }
                    W::StopApp => {
                        self.stop_app(&app_name)?;
                    }
                    W::Reboot => {
                        framework::reboot();
                    }
                    _ => {}
                }

                Ok(Response::ok())
            }
        }
    }

    fn app(&mut self, name: &str) -> Result<&mut App> {
        match self.apps.get_mut(name) {
            Some(a) => Ok(a),
            None => bail_kind!(Kind::NotFound, "App '{}' is not installed", name),
        }
    }

    fn app_and_ctx(&mut self, name: &str) -> Result<(&mut App, &mut Ctx)> {
        match self.apps.get_mut(name) {
            Some(a) => Ok((a, &mut self.ctx)),
            None => bail_kind!(Kind::NotFound, "App '{}' is not installed", name),
        }
    }

    fn proc(&mut self, app_name: &str, proc_name: &str) -> Result<&mut crate::proc::Process> {
        let app = self.app(app_name)?;
        match app.get_proc_mut(proc_name) {
            Some(p) => Ok(p),
            None => bail_kind!(Kind::NotFound, "No process '{}' in app '{}'",
                               proc_name, app_name),
        }
    }

    /// Orderly shutdown: no new starts, stop everything, drain, unload the
    /// auto-loaded modules.
    fn shutdown(&mut self) {
        info!("Supervisor is shutting down");
        framework::set_stopping();

        let running: Vec<String> = self.apps.values()
            .filter(|a| a.state() == AppState::Running)
            .map(|a| a.name().to_owned())
            .collect();

        for name in running {
            let app = self.apps.get_mut(&name).unwrap();
            app.stop(&mut self.ctx);
        }

        // Drain until every app has stopped; the kill escalation gives this
        // a natural bound, with a backstop in case something refuses to die.
        let deadline = Instant::now() + std::time::Duration::from_secs(10);

        while Instant::now() < deadline {
            self.reap_children();
            self.sweep_kill_deadlines();
            self.sweep_draining_apps();

            if self.apps.values().all(|a| a.state() == AppState::Stopped) {
                break;
            }

            std::thread::sleep(std::time::Duration::from_millis(50));
        }

        self.ctx.kmods.remove_all();

        let _ = fs::remove_file(&*CTRL_SOCKET_PATH);
    }
}

/// The supervisor is useless without the capabilities that mounts,
/// identity drops and device nodes require; better to say so up front.
fn ensure_privileges() -> Result<()> {
    use caps::{CapSet, Capability};

    let required = [
        Capability::CAP_SYS_ADMIN,
        Capability::CAP_SETUID,
        Capability::CAP_SETGID,
        Capability::CAP_MKNOD,
        Capability::CAP_KILL,
    ];

    for cap in &required {
        let has = caps::has_cap(None, CapSet::Effective, *cap)
            .context("Failed to query capabilities")?;

        if !has {
            bail!("Missing capability {}; the supervisor must run as root", cap);
        }
    }

    Ok(())
}
