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

//! Process objects and the fork/exec pipeline.
//!
//! A child is released in two stages: it blocks on a sync pipe until the
//! parent has finished post-fork setup (priority, log pipes, cgroup
//! membership), and optionally on a second user-block pipe until an
//! external controller releases it.  The child path between fork and exec
//! is a linear sequence of steps; any failure is fatal to the child only.

pub mod command;

use anyhow::{Result, Context};
use std::{
    ffi::{CString, CStr},
    fs,
    io::Read,
    os::unix::io::{AsRawFd, RawFd},
    path::Path,
    time::Instant,
};
use nix::{
    fcntl::OFlag,
    sys::signal::{self, Signal, SigmaskHow, SigSet},
    sys::stat::{umask, Mode},
    sys::wait::WaitStatus,
    unistd::{self, ForkResult, Pid, Uid, Gid},
};
use crate::{
    consts::*,
    config::Store,
    cgroup::Cgroups,
    framework,
    logfd,
    logger,
    rlimits::{self, ProcLimits},
    sandbox,
    smack::{self, Smack},
    util::{Pipe, close_all_non_std_fds},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    None,
    Ignore,
    RestartProc,
    RestartApp,
    StopApp,
    Reboot,
}

impl FaultAction {
    /// Parses the config-store representation.  Missing or unrecognized
    /// values fall back to Ignore, with a log.
    pub fn from_config(s: &str, proc_name: &str) -> Self {
        match s {
            "ignore" => FaultAction::Ignore,
            "restart" => FaultAction::RestartProc,
            "restartApp" => FaultAction::RestartApp,
            "stopApp" => FaultAction::StopApp,
            "reboot" => FaultAction::Reboot,
            "" => {
                info!("No fault action specified for process '{}'. Assuming 'ignore'.",
                      proc_name);
                FaultAction::Ignore
            }
            other => {
                warn!("Unrecognized fault action '{}' for process '{}'.  Assume 'ignore'.",
                      other, proc_name);
                FaultAction::Ignore
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// No action is configured.
    NotFound,
    /// The configured action could not be read or is unknown.
    Error,
    /// Already serviced; nothing further to do.
    Handled,
    Ignore,
    Stop,
    Restart,
    RestartApp,
    StopApp,
    Reboot,
}

impl WatchdogAction {
    pub fn from_config(s: &str) -> Self {
        match s {
            "" => WatchdogAction::NotFound,
            "ignore" => WatchdogAction::Ignore,
            "stop" => WatchdogAction::Stop,
            "restart" => WatchdogAction::Restart,
            "restartApp" => WatchdogAction::RestartApp,
            "stopApp" => WatchdogAction::StopApp,
            "reboot" => WatchdogAction::Reboot,
            "handled" => WatchdogAction::Handled,
            _ => WatchdogAction::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Stopped,
    Running,
}

/// What to do when the process is next observed dead.  Inspected by the
/// SIGCHLD dispatch instead of calling through raw function pointers.
pub enum FollowUp {
    None,
    /// Restart the process once its commanded kill completes (watchdog
    /// restart policy).
    RestartAfterStop,
    /// Inform an external party of the death (exit status as from wait()).
    NotifyExternal(Box<dyn FnMut(i32)>),
}

/// Snapshot of the owning app's identity, taken by the app right before
/// starting a process so the launcher needs no back-reference.
pub struct AppEnv<'a> {
    pub app_name: &'a str,
    pub sandboxed: bool,
    pub working_dir: &'a Path,
    pub uid: Uid,
    pub gid: Gid,
    pub groups: &'a [Gid],
}

pub struct Process {
    name: String,
    cfg_path: Option<String>,
    pid: Option<Pid>,
    fault_time: Option<Instant>,
    /// Set when the supervisor itself kills the process; suppresses the
    /// fault action for the next SIGCHLD.
    cmd_kill: bool,
    stdin_fd: Option<RawFd>,
    stdout_fd: Option<RawFd>,
    stderr_fd: Option<RawFd>,
    exec_path: Option<String>,
    priority: Option<String>,
    args_override: Option<Vec<String>>,
    fault_action: FaultAction,
    default_fault_action: FaultAction,
    watchdog_action: WatchdogAction,
    run: bool,
    debug: bool,
    /// Write end of the user-block pipe; the read end is held by the child
    /// only.
    block_pipe: Option<fs::File>,
    block_callback: Option<Box<dyn Fn(Pid, &str)>>,
    pub follow_up: FollowUp,
}

impl Process {
    /// Creates a process object.  The fault and watchdog actions are
    /// snapshotted now so they remain available if the config store is
    /// unreachable at fault time.
    pub fn new(name: &str, cfg_path: Option<&str>, store: &Store) -> Self {
        let (default_fault_action, watchdog_action) = match cfg_path {
            Some(path) => {
                let cfg = store.read_txn(path);
                (FaultAction::from_config(&cfg.get_str("faultAction", ""), name),
                 WatchdogAction::from_config(&cfg.get_str("watchdogAction", "")))
            }
            None => (FaultAction::Ignore, WatchdogAction::NotFound),
        };

        Self {
            name: name.to_owned(),
            cfg_path: cfg_path.map(str::to_owned),
            pid: None,
            fault_time: None,
            cmd_kill: false,
            stdin_fd: None,
            stdout_fd: None,
            stderr_fd: None,
            exec_path: None,
            priority: None,
            args_override: None,
            fault_action: default_fault_action,
            default_fault_action,
            watchdog_action,
            run: true,
            debug: false,
            block_pipe: None,
            block_callback: None,
            follow_up: FollowUp::None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cfg_path(&self) -> Option<&str> {
        self.cfg_path.as_deref()
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn state(&self) -> ProcState {
        if self.pid.is_some() { ProcState::Running } else { ProcState::Stopped }
    }

    pub fn fault_action(&self) -> FaultAction {
        self.fault_action
    }

    pub fn watchdog_action(&self) -> WatchdogAction {
        self.watchdog_action
    }

    pub fn set_stdin(&mut self, fd: Option<RawFd>) {
        replace_fd(&mut self.stdin_fd, fd);
    }

    pub fn set_stdout(&mut self, fd: Option<RawFd>) {
        replace_fd(&mut self.stdout_fd, fd);
    }

    pub fn set_stderr(&mut self, fd: Option<RawFd>) {
        replace_fd(&mut self.stderr_fd, fd);
    }

    pub fn set_exec_path(&mut self, path: Option<&str>) {
        self.exec_path = path.map(str::to_owned);
    }

    /// Overrides the configured priority.  None reverts to the config.
    pub fn set_priority(&mut self, priority: Option<&str>) -> Result<()> {
        if let Some(p) = priority {
            if parse_priority(p).is_none() {
                bail!("Invalid priority '{}' for process '{}'", p, self.name);
            }
        }
        self.priority = priority.map(str::to_owned);
        Ok(())
    }

    pub fn add_arg(&mut self, arg: &str) {
        self.args_override.get_or_insert_with(Vec::new).push(arg.to_owned());
    }

    /// Marks the override list valid-but-empty, suppressing configured args.
    pub fn clear_args_to_empty(&mut self) {
        self.args_override = Some(vec![]);
    }

    /// Drops the override entirely; configured args apply again.
    pub fn clear_args(&mut self) {
        self.args_override = None;
    }

    /// FaultAction::None reverts to the configured action.
    pub fn set_fault_action(&mut self, action: FaultAction) {
        self.fault_action = match action {
            FaultAction::None => self.default_fault_action,
            a => a,
        };
    }

    pub fn set_run(&mut self, run: bool) {
        self.run = run;
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn set_block_callback(&mut self, cb: Option<Box<dyn Fn(Pid, &str)>>) {
        self.block_callback = cb;
    }

    /// Releases a child blocked between init and exec.
    pub fn unblock(&mut self) {
        // Closing the write end makes the child's blocking read return EOF.
        self.block_pipe = None;
    }

    /// The next death of this process is commanded, not a fault.
    pub fn stopping(&mut self) {
        assert!(self.pid.is_some());
        self.cmd_kill = true;
    }

    #[cfg(test)]
    pub fn set_pid_for_test(&mut self, pid: Option<Pid>) {
        self.pid = pid;
    }

    pub fn is_realtime(&self, store: &Store) -> bool {
        self.effective_priority(store).starts_with("rt")
    }

    fn effective_priority(&self, store: &Store) -> String {
        if let Some(ref p) = self.priority {
            return p.clone();
        }
        match self.cfg_path {
            Some(ref path) => store.read_txn(path).get_str("priority", "medium"),
            None => "medium".to_owned(),
        }
    }

    /// Starts the process.  If the app is sandboxed the child is confined
    /// to the app's root; otherwise it runs in the working directory.
    pub fn start(&mut self, env: &AppEnv, store: &Store, cgroups: &Cgroups) -> Result<()> {
        if !self.run {
            info!("Process '{}' is configured to not run.", self.name);
            return Ok(());
        }

        if let Some(pid) = self.pid {
            bail!("Process '{}' (PID: {}) cannot be started because it is already running.",
                  self.name, pid);
        }

        if framework::is_stopping() {
            bail!("Process '{}' cannot be started because framework is shutting down.",
                  self.name);
        }

        // Everything below that touches the config store must happen before
        // the fork; the store client is not fork-safe.
        let env_vars = self.get_environment(env, store);
        let (exec_path, argv) = self.get_args(store)?;
        let limits = match self.cfg_path {
            Some(ref path) => ProcLimits::from_config(&store.read_txn(path)),
            None => ProcLimits::default(),
        };
        let priority = self.effective_priority(store);

        let sync_pipe = Pipe::new(OFlag::empty())
            .context("Could not create synchronization pipe")?;

        let block_pipe = match self.block_callback {
            Some(_) => Some(Pipe::new(OFlag::empty()).context("Could not create block pipe")?),
            None => None,
        };

        let stdout_log_pipe = self.make_log_pipe(self.stdout_fd, "stdout");
        let stderr_log_pipe = self.make_log_pipe(self.stderr_fd, "stderr");

        match unsafe { unistd::fork() }.context("Failed to fork")? {
            ForkResult::Child => {
                self.child_run(env, exec_path, argv, env_vars, limits,
                               sync_pipe, block_pipe, stdout_log_pipe, stderr_log_pipe);
            }
            ForkResult::Parent { child } => {
                self.pid = Some(child);

                drop(sync_pipe.read);

                // The child is still blocked on the sync pipe, so its
                // scheduling class, log streams, and cgroup membership are
                // all in place before it runs a single instruction.
                if let Err(e) = set_scheduling_priority(&priority, child) {
                    error!("Could not set priority of process '{}': {}", self.name, e);
                    let _ = signal::kill(child, Signal::SIGKILL);
                }

                if let Some(pipe) = stderr_log_pipe {
                    logfd::send_stderr(pipe.read, env.app_name, &self.name, child);
                }
                if let Some(pipe) = stdout_log_pipe {
                    logfd::send_stdout(pipe.read, env.app_name, &self.name, child);
                }

                if let Err(e) = cgroups.add_proc(env.app_name, child) {
                    error!("{}", e);
                }

                info!("Starting process '{}' with pid {}", self.name, child);

                // Release the child.
                drop(sync_pipe.write);

                if let Some(pipe) = block_pipe {
                    // The read end belongs to the child only.
                    drop(pipe.read);
                    self.block_pipe = Some(pipe.write);
                }
            }
        }

        Ok(())
    }

    fn make_log_pipe(&self, override_fd: Option<RawFd>, stream: &str) -> Option<Pipe> {
        if override_fd.is_some() {
            return None;
        }

        match Pipe::new(OFlag::empty()) {
            Ok(pipe) => Some(pipe),
            Err(e) => {
                error!("Could not create pipe. {} process' {} will not be available. {}",
                       self.name, stream, e);
                None
            }
        }
    }

    /// Post-fork child path.  Never returns.  Failures are reported through
    /// the (already redirected) stderr and end the child, not the
    /// supervisor.
    fn child_run(&self,
                 env: &AppEnv,
                 exec_path: String,
                 argv: Vec<String>,
                 env_vars: Vec<(String, String)>,
                 limits: ProcLimits,
                 sync_pipe: Pipe,
                 block_pipe: Option<Pipe>,
                 stdout_log_pipe: Option<Pipe>,
                 stderr_log_pipe: Option<Pipe>) -> ! {
        // Wait for the parent to finish post-fork setup.
        drop(sync_pipe.write);
        block_on_pipe(sync_pipe.read);

        redirect_std_stream(self.stderr_fd, stderr_log_pipe, libc::STDERR_FILENO);
        redirect_std_stream(self.stdout_fd, stdout_log_pipe, libc::STDOUT_FILENO);
        redirect_stdin(self.stdin_fd);

        if let Err(e) = smack::set_my_label(&Smack::app_label(env.app_name)) {
            child_fatal(&format!("{}", e));
        }

        // Files must not be accidentally created group or world accessible.
        umask(Mode::S_IRWXG | Mode::S_IRWXO);

        let all = SigSet::all();
        let _ = signal::pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&all), None);

        apply_environment(&env_vars);

        if env.sandboxed {
            if let Err(e) = sandbox::confine_process(env.working_dir, env.uid, env.gid,
                                                     env.groups) {
                child_fatal(&format!("{}", e));
            }
        } else if let Err(e) = unistd::chdir(env.working_dir) {
            child_fatal(&format!("Could not change working directory to '{}': {}",
                                 env.working_dir.display(), e));
        }

        if let Some(pipe) = block_pipe {
            if let Some(ref cb) = self.block_callback {
                cb(unistd::getpid(), &self.name);
            }
            drop(pipe.write);
            block_on_pipe(pipe.read);
        }

        close_all_non_std_fds();

        // As late as possible, so the steps above are not tripped up by the
        // tighter fd and file size limits.
        if let Err(e) = limits.apply() {
            child_fatal(&format!("{}", e));
        }

        if self.debug {
            // Wait for a debugger to attach.
            let _ = signal::raise(Signal::SIGSTOP);
        }

        let exe = CString::new(exec_path.clone()).expect("exec path contains a NUL");
        let args: Vec<CString> = argv.into_iter()
            .map(|a| CString::new(a).expect("argument contains a NUL"))
            .collect();

        let args_refs: Vec<&CStr> = args.iter().map(|a| a.as_c_str()).collect();
        let err = unistd::execvp(&exe, &args_refs).unwrap_err();

        logger::reinit_after_fork();
        child_fatal(&format!("Could not exec '{}'. {}", exec_path, err));
    }

    fn get_environment(&self, env: &AppEnv, store: &Store) -> Vec<(String, String)> {
        if let Some(ref path) = self.cfg_path {
            let cfg = store.read_txn(path).child("envVars");
            let vars: Vec<(String, String)> = cfg.children().into_iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_owned())))
                .collect();

            if vars.is_empty() {
                warn!("No environment variables for process '{}'.", self.name);
            }
            vars
        } else {
            // Unconfigured (auxiliary) processes get the default PATH.
            let path = if env.sandboxed {
                SANDBOXED_DEFAULT_PATH.to_owned()
            } else {
                format!("{}:{}/{}/bin", UNSANDBOXED_DEFAULT_PATH,
                        APPS_WRITEABLE_DIR, env.app_name)
            };
            vec![("PATH".to_owned(), path)]
        }
    }

    /// Returns (exec path, argv).  argv[0] is the process name, so the app
    /// sees itself under its configured name; the remaining entries are the
    /// override args if present, else the configured args.
    fn get_args(&self, store: &Store) -> Result<(String, Vec<String>)> {
        let cfg_args: Vec<String> = match self.cfg_path {
            Some(ref path) => store.read_txn(path).string_list("args"),
            None => vec![],
        };

        let exec_path = match self.exec_path {
            Some(ref p) => p.clone(),
            None => cfg_args.first().cloned()
                .with_context(|| format!("No executable configured for process '{}'",
                                         self.name))?,
        };

        let tail: Vec<String> = match self.args_override {
            Some(ref args) => args.clone(),
            None => cfg_args.iter().skip(1).cloned().collect(),
        };

        let mut argv = vec![self.name.clone()];
        argv.extend(tail);

        Ok((exec_path, argv))
    }

    /// Handles the SIGCHLD for this process and decides the fault action.
    /// `system_is_good` comes from the system-status oracle and drives the
    /// fault-limit escalation.
    pub fn sig_child_handler(&mut self, status: WaitStatus, system_is_good: bool,
                             app_name: &str) -> FaultAction
    {
        if self.cmd_kill {
            // We killed it, so this death is not a fault.  Reset the flag
            // so faults of a restarted instance are still caught.
            self.cmd_kill = false;
            self.pid = None;
            return FaultAction::None;
        }

        let prev_fault_time = self.fault_time;
        self.fault_time = Some(Instant::now());

        let mut fault_action = FaultAction::None;

        match status {
            WaitStatus::Exited(pid, code) => {
                info!("Process '{}' (PID: {}) has exited with exit code {}.",
                      self.name, pid, code);
                if code != 0 {
                    fault_action = self.fault_action;
                }
            }
            WaitStatus::Signaled(pid, sig, _core_dumped) => {
                info!("Process '{}' (PID: {}) has exited due to signal {:?}.",
                      self.name, pid, sig);
                fault_action = self.fault_action;
            }
            other => panic!("Unexpected wait status {:?} for process '{}'", other, self.name),
        }

        self.pid = None;

        // A process that keeps faulting gets escalated so we stop the
        // apparently futile restart attempts.
        if reached_fault_limit(fault_action, prev_fault_time, self.fault_time) {
            if system_is_good {
                error!("Process '{}' reached the fault limit (in a 'good' system) \
                        and will be stopped.", self.name);
                fault_action = FaultAction::StopApp;
            } else {
                error!("EMERG: Process '{}' reached fault limit while system in probation. \
                        Device will be rebooted.", self.name);
                fault_action = FaultAction::Reboot;
            }
        }

        // Preserve whatever might explain the fault before anyone reacts
        // to it.
        if fault_action != FaultAction::None {
            self.capture_debug_data(app_name, fault_action == FaultAction::Reboot);
        }

        fault_action
    }

    /// Saves logs and cores for postmortem analysis via the debug-capture
    /// script.
    pub fn capture_debug_data(&self, app_name: &str, is_rebooting: bool) {
        let mut cmd = command::Command::new(vec![SAVE_LOGS_BIN, app_name, self.name.as_str()]);
        if is_rebooting {
            cmd.arg("REBOOT");
        }

        if let Err(e) = cmd.run_and_check() {
            error!("Could not save log and core file: {}", e);
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.set_stdin(None);
        self.set_stdout(None);
        self.set_stderr(None);
    }
}

fn replace_fd(slot: &mut Option<RawFd>, fd: Option<RawFd>) {
    if let Some(old) = slot.take() {
        crate::util::close_fd(old);
    }
    *slot = fd;
}

/// Blocks until the other end of the pipe is closed.  Both ends held by the
/// caller are closed on return.
fn block_on_pipe(mut read: fs::File) {
    let mut buf = [0u8; 1];
    loop {
        match read.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => child_fatal(&format!("Could not read pipe: {}", e)),
        }
    }
}

fn redirect_std_stream(override_fd: Option<RawFd>, log_pipe: Option<Pipe>, stream: RawFd) {
    match (override_fd, log_pipe) {
        (Some(fd), _) => {
            // Leave the original fd open so it can be re-used later.
            if unistd::dup2(fd, stream).is_err() {
                child_fatal("Could not duplicate fd");
            }
        }
        (None, Some(pipe)) => {
            if unistd::dup2(pipe.write.as_raw_fd(), stream).is_err() {
                child_fatal("Could not duplicate fd");
            }
            // Both pipe ends close when `pipe` drops; the dup2'ed stream
            // stays open.
        }
        (None, None) => {}
    }
}

fn redirect_stdin(override_fd: Option<RawFd>) {
    match override_fd {
        Some(fd) => {
            if unistd::dup2(fd, libc::STDIN_FILENO).is_err() {
                child_fatal("Could not duplicate fd");
            }
        }
        None => {
            // Standard in defaults to /dev/null.
            if let Ok(f) = fs::File::open("/dev/null") {
                let _ = unistd::dup2(f.as_raw_fd(), libc::STDIN_FILENO);
            }
        }
    }
}

fn apply_environment(vars: &[(String, String)]) {
    let existing: Vec<std::ffi::OsString> = std::env::vars_os().map(|(k, _)| k).collect();
    for k in existing {
        std::env::remove_var(k);
    }
    for (k, v) in vars {
        std::env::set_var(k, v);
    }
}

fn child_fatal(msg: &str) -> ! {
    error!("{}", msg);
    eprintln!("{}", msg);
    unsafe { libc::_exit(libc::EXIT_FAILURE) }
}

const MIN_RT_PRIORITY: i32 = 1;
const MAX_RT_PRIORITY: i32 = 32;

const LOW_PRIORITY_NICE_LEVEL: i32 = 10;
const MEDIUM_PRIORITY_NICE_LEVEL: i32 = 0;
const HIGH_PRIORITY_NICE_LEVEL: i32 = -10;

/// (scheduling policy, realtime priority, nice level) for a priority
/// string.  None if the string is not a recognized priority.
pub fn parse_priority(s: &str) -> Option<(libc::c_int, i32, i32)> {
    match s {
        "idle" => Some((libc::SCHED_IDLE, 0, MEDIUM_PRIORITY_NICE_LEVEL)),
        "low" => Some((libc::SCHED_OTHER, 0, LOW_PRIORITY_NICE_LEVEL)),
        "medium" => Some((libc::SCHED_OTHER, 0, MEDIUM_PRIORITY_NICE_LEVEL)),
        "high" => Some((libc::SCHED_OTHER, 0, HIGH_PRIORITY_NICE_LEVEL)),
        _ => {
            let level: i32 = s.strip_prefix("rt")?.parse().ok()?;
            if level < MIN_RT_PRIORITY || level > MAX_RT_PRIORITY {
                return None;
            }
            Some((libc::SCHED_RR, level, MEDIUM_PRIORITY_NICE_LEVEL))
        }
    }
}

/// Applies the scheduling policy, priority and nice level to a (blocked)
/// child.  An unrecognized string warns and falls back to medium.
fn set_scheduling_priority(priority: &str, pid: Pid) -> Result<()> {
    let (policy, rt_priority, nice) = match parse_priority(priority) {
        Some(p) => p,
        None => {
            warn!("Unrecognized priority level ({}) for process '{}'.  Using default priority.",
                  priority, pid);
            parse_priority("medium").unwrap()
        }
    };

    if policy == libc::SCHED_RR {
        // Lift the nice limit so the process can later be demoted to a
        // non-realtime policy and still adjust its nice level.
        if let Err(e) = rlimits::lift_nice_limit(pid) {
            error!("Could not set nice limit: {}", e);
        }
    }

    let param = libc::sched_param { sched_priority: rt_priority };

    if unsafe { libc::sched_setscheduler(pid.as_raw(), policy, &param) } == -1 {
        return Err(std::io::Error::last_os_error())
            .context("Could not set the scheduling policy");
    }

    if unsafe { libc::setpriority(libc::PRIO_PROCESS as _, pid.as_raw() as libc::id_t, nice) } == -1 {
        return Err(std::io::Error::last_os_error())
            .context("Could not set the nice level");
    }

    Ok(())
}

/// The fault limit is reached when two faults land within the limit
/// interval.  Only the restart actions are rate limited.
fn reached_fault_limit(action: FaultAction,
                       prev_fault_time: Option<Instant>,
                       fault_time: Option<Instant>) -> bool {
    match action {
        FaultAction::RestartProc | FaultAction::RestartApp => {
            match (prev_fault_time, fault_time) {
                (Some(prev), Some(now)) =>
                    now.duration_since(prev) <= FAULT_LIMIT_INTERVAL,
                _ => false,
            }
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn priority_strings_parse_per_policy() {
        assert_eq!(parse_priority("idle").unwrap().0, libc::SCHED_IDLE);
        assert_eq!(parse_priority("low").unwrap().2, 10);
        assert_eq!(parse_priority("medium").unwrap().2, 0);
        assert_eq!(parse_priority("high").unwrap().2, -10);

        let (policy, level, _) = parse_priority("rt1").unwrap();
        assert_eq!((policy, level), (libc::SCHED_RR, 1));
        assert_eq!(parse_priority("rt32").unwrap().1, 32);

        assert!(parse_priority("rt0").is_none());
        assert!(parse_priority("rt33").is_none());
        assert!(parse_priority("urgent").is_none());
        assert!(parse_priority("rt").is_none());
    }

    #[test]
    fn priority_setter_validates() {
        let store = Store::in_memory();
        let mut p = Process::new("web", None, &store);

        assert!(p.set_priority(Some("rt32")).is_ok());
        assert!(p.set_priority(Some("rt33")).is_err());
        assert!(p.set_priority(None).is_ok());
    }

    #[test]
    fn fault_actions_parse_with_ignore_fallback() {
        assert_eq!(FaultAction::from_config("restart", "p"), FaultAction::RestartProc);
        assert_eq!(FaultAction::from_config("restartApp", "p"), FaultAction::RestartApp);
        assert_eq!(FaultAction::from_config("stopApp", "p"), FaultAction::StopApp);
        assert_eq!(FaultAction::from_config("reboot", "p"), FaultAction::Reboot);
        assert_eq!(FaultAction::from_config("", "p"), FaultAction::Ignore);
        assert_eq!(FaultAction::from_config("bogus", "p"), FaultAction::Ignore);
    }

    #[test]
    fn fault_limit_applies_only_to_restart_actions() {
        let now = Instant::now();
        let recent = Some(now - Duration::from_secs(2));
        let old = Some(now - Duration::from_secs(60));

        assert!(reached_fault_limit(FaultAction::RestartProc, recent, Some(now)));
        assert!(reached_fault_limit(FaultAction::RestartApp, recent, Some(now)));
        assert!(!reached_fault_limit(FaultAction::RestartProc, old, Some(now)));
        assert!(!reached_fault_limit(FaultAction::RestartProc, None, Some(now)));
        assert!(!reached_fault_limit(FaultAction::StopApp, recent, Some(now)));
        assert!(!reached_fault_limit(FaultAction::Reboot, recent, Some(now)));
    }

    #[test]
    fn commanded_kill_suppresses_fault_action() {
        let mut store = Store::in_memory();
        let mut txn = store.write_txn("apps/cam/procs/main");
        txn.set_str("faultAction", "reboot");
        txn.commit();

        let mut p = Process::new("main", Some("apps/cam/procs/main"), &store);
        p.pid = Some(Pid::from_raw(1234));
        p.stopping();

        let action = p.sig_child_handler(
            WaitStatus::Signaled(Pid::from_raw(1234), Signal::SIGKILL, false), true, "cam");

        assert_eq!(action, FaultAction::None);
        assert_eq!(p.state(), ProcState::Stopped);

        // The flag is one-shot: a later uncommanded death is a fault again.
        p.pid = Some(Pid::from_raw(1235));
        let action = p.sig_child_handler(
            WaitStatus::Exited(Pid::from_raw(1235), 2), true, "cam");
        assert_eq!(action, FaultAction::Reboot);
    }

    #[test]
    fn clean_exit_is_not_a_fault() {
        let mut store = Store::in_memory();
        let mut txn = store.write_txn("apps/cam/procs/main");
        txn.set_str("faultAction", "restart");
        txn.commit();

        let mut p = Process::new("main", Some("apps/cam/procs/main"), &store);
        p.pid = Some(Pid::from_raw(77));

        let action = p.sig_child_handler(WaitStatus::Exited(Pid::from_raw(77), 0), true, "cam");
        assert_eq!(action, FaultAction::None);
    }

    #[test]
    fn second_fault_within_interval_escalates_to_stop_app() {
        let mut store = Store::in_memory();
        let mut txn = store.write_txn("apps/cam/procs/main");
        txn.set_str("faultAction", "restart");
        txn.commit();

        let mut p = Process::new("main", Some("apps/cam/procs/main"), &store);

        p.pid = Some(Pid::from_raw(80));
        let action = p.sig_child_handler(WaitStatus::Exited(Pid::from_raw(80), 2), true, "cam");
        assert_eq!(action, FaultAction::RestartProc);

        p.pid = Some(Pid::from_raw(81));
        let action = p.sig_child_handler(WaitStatus::Exited(Pid::from_raw(81), 2), true, "cam");
        assert_eq!(action, FaultAction::StopApp);
    }

    #[test]
    fn fault_limit_on_probation_escalates_to_reboot() {
        let mut store = Store::in_memory();
        let mut txn = store.write_txn("apps/cam/procs/main");
        txn.set_str("faultAction", "restart");
        txn.commit();

        let mut p = Process::new("main", Some("apps/cam/procs/main"), &store);

        p.pid = Some(Pid::from_raw(90));
        p.sig_child_handler(WaitStatus::Exited(Pid::from_raw(90), 2), false, "cam");

        p.pid = Some(Pid::from_raw(91));
        let action = p.sig_child_handler(WaitStatus::Exited(Pid::from_raw(91), 2), false, "cam");
        assert_eq!(action, FaultAction::Reboot);
    }

    #[test]
    fn args_compose_exec_name_and_tail() {
        let mut store = Store::in_memory();
        let mut txn = store.write_txn("apps/cam/procs/main");
        txn.set_value("args", json!(["/bin/cam", "--fast", "--loop"]));
        txn.commit();

        let p = Process::new("main", Some("apps/cam/procs/main"), &store);
        let (exec, argv) = p.get_args(&store).unwrap();
        assert_eq!(exec, "/bin/cam");
        assert_eq!(argv, vec!["main", "--fast", "--loop"]);
    }

    #[test]
    fn exec_override_and_arg_override() {
        let mut store = Store::in_memory();
        let mut txn = store.write_txn("apps/cam/procs/main");
        txn.set_value("args", json!(["/bin/cam", "--fast"]));
        txn.commit();

        let mut p = Process::new("main", Some("apps/cam/procs/main"), &store);
        p.set_exec_path(Some("/bin/cam-debug"));
        p.clear_args_to_empty();
        p.add_arg("--slow");

        let (exec, argv) = p.get_args(&store).unwrap();
        assert_eq!(exec, "/bin/cam-debug");
        assert_eq!(argv, vec!["main", "--slow"]);
    }

    #[test]
    fn unconfigured_process_requires_exec_path() {
        let store = Store::in_memory();
        let p = Process::new("aux", None, &store);
        assert!(p.get_args(&store).is_err());
    }

    #[test]
    fn realtime_detection_prefers_override_over_config() {
        let mut store = Store::in_memory();
        let mut txn = store.write_txn("apps/cam/procs/main");
        txn.set_str("priority", "rt5");
        txn.commit();

        let mut p = Process::new("main", Some("apps/cam/procs/main"), &store);
        assert!(p.is_realtime(&store));

        p.set_priority(Some("high")).unwrap();
        assert!(!p.is_realtime(&store));

        let q = Process::new("aux", None, &store);
        assert!(!q.is_realtime(&store));
    }

    #[test]
    fn watchdog_action_snapshot() {
        let mut store = Store::in_memory();
        let mut txn = store.write_txn("apps/cam/procs/main");
        txn.set_str("watchdogAction", "restart");
        txn.commit();

        let p = Process::new("main", Some("apps/cam/procs/main"), &store);
        assert_eq!(p.watchdog_action(), WatchdogAction::Restart);

        let q = Process::new("aux", None, &store);
        assert_eq!(q.watchdog_action(), WatchdogAction::NotFound);
    }
}
