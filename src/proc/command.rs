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
    ffi::OsStr,
    process::{Child, Command as StdCommand, ExitStatus},
};

// We wrap the standard library `Command` to provide additional features:
// * Logging of the command executed, and failures
// * wait_for_success() with the command line in the error message
// This is used for the helper programs the supervisor shells out to:
// insmod/rmmod, module install/remove scripts, and the debug-capture
// script.  App processes do NOT go through here; they need the full
// fork/exec pipeline in proc/mod.rs.

pub struct Command {
    inner: StdCommand,
    display_args: Vec<String>,
    show_cmd_on_spawn: bool,
}

impl Command {
    pub fn new<I: IntoIterator<Item = S>, S: AsRef<OsStr>>(args: I) -> Self {
        let mut args = args.into_iter();
        let program = args.next().unwrap(); // unwrap() is fine as we never pass empty args
        let mut cmd = Self {
            inner: StdCommand::new(&program),
            display_args: vec![Self::arg_for_display(&program)],
            show_cmd_on_spawn: true,
        };
        cmd.args(args);
        cmd
    }

    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.display_args.push(Self::arg_for_display(&arg));
        self.inner.arg(&arg);
        self
    }

    pub fn arg_for_display<S: AsRef<OsStr>>(arg: S) -> String {
        arg.as_ref().to_string_lossy().into_owned()
    }

    pub fn args<I: IntoIterator<Item = S>, S: AsRef<OsStr>>(&mut self, args: I) -> &mut Self {
        for arg in args { self.arg(arg); }
        self
    }

    pub fn show_cmd_on_spawn(&mut self, value: bool) -> &mut Self {
        self.show_cmd_on_spawn = value;
        self
    }

    pub fn spawn(&mut self) -> Result<Helper> {
        let display_cmd = self.display_args.join(" ");
        let inner = self.inner.spawn()
            .with_context(|| format!("Failed to spawn `{}`", display_cmd))?;
        if self.show_cmd_on_spawn {
            debug!("+ {}", display_cmd);
        }
        Ok(Helper { inner, display_cmd })
    }

    /// Spawn, wait, and fail unless the command exits 0.
    pub fn run_and_check(&mut self) -> Result<()> {
        self.spawn()?.wait_for_success()
    }
}

pub struct Helper {
    inner: Child,
    display_cmd: String,
}

impl Helper {
    pub fn wait(&mut self) -> Result<ExitStatus> {
        self.inner.wait()
            .with_context(|| format!("Failed to wait for `{}`", self.display_cmd))
    }

    pub fn wait_for_success(&mut self) -> Result<()> {
        let status = self.wait()?;

        if !status.success() {
            match status.code() {
                Some(code) =>
                    bail!("`{}` exited with error code {}", self.display_cmd, code),
                None =>
                    bail!("`{}` was killed by a signal", self.display_cmd),
            }
        }

        Ok(())
    }
}
