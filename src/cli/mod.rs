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
    io::{BufRead, BufReader, Write},
    os::unix::net::UnixStream,
};
use structopt::StructOpt;
use crate::{
    consts::*,
    ctrl::{Request, Response, Code},
    error::{Kind, KindContext},
    logger::LevelFilter,
    supervisor::{Ctx, Supervisor},
};

pub trait CLI {
    fn run(self) -> Result<()>;
}

/// Supervises, sandboxes and monitors the device's applications.
#[derive(StructOpt, Debug)]
#[structopt(after_help("\
EXIT CODES:
    1   Generic failure
    2   The named app, process or module does not exist
    3   The path conflicts with something already in the app
    6   The app must stop before the request can be applied"
))]
pub enum Opts {
    /// Run the supervisor daemon
    Run(Run),
    /// Start an installed application
    Start(StartApp),
    /// Stop a running application
    Stop(StopApp),
    /// Show the state of one app, or list all apps
    Status(Status),
    /// Load a kernel module bundled with the system
    Load(LoadModule),
    /// Unload a kernel module bundled with the system
    Unload(UnloadModule),
}

#[derive(StructOpt, Debug)]
pub struct Run {
    /// Verbosity. Can be repeated
    #[structopt(short, long, parse(from_occurrences))]
    pub verbose: u8,
}

#[derive(StructOpt, Debug)]
pub struct StartApp {
    /// Name of the application
    pub app: String,

    /// Verbosity. Can be repeated
    #[structopt(short, long, parse(from_occurrences))]
    pub verbose: u8,
}

#[derive(StructOpt, Debug)]
pub struct StopApp {
    /// Name of the application
    pub app: String,

    /// Verbosity. Can be repeated
    #[structopt(short, long, parse(from_occurrences))]
    pub verbose: u8,
}

#[derive(StructOpt, Debug)]
pub struct Status {
    /// Name of the application. Omit to list all apps
    pub app: Option<String>,

    /// Verbosity. Can be repeated
    #[structopt(short, long, parse(from_occurrences))]
    pub verbose: u8,
}

#[derive(StructOpt, Debug)]
pub struct LoadModule {
    /// Module name, including the .ko extension
    pub module: String,

    /// Verbosity. Can be repeated
    #[structopt(short, long, parse(from_occurrences))]
    pub verbose: u8,
}

#[derive(StructOpt, Debug)]
pub struct UnloadModule {
    /// Module name, including the .ko extension
    pub module: String,

    /// Verbosity. Can be repeated
    #[structopt(short, long, parse(from_occurrences))]
    pub verbose: u8,
}

impl Opts {
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose() {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    fn verbose(&self) -> u8 {
        match self {
            Opts::Run(c) => c.verbose,
            Opts::Start(c) => c.verbose,
            Opts::Stop(c) => c.verbose,
            Opts::Status(c) => c.verbose,
            Opts::Load(c) => c.verbose,
            Opts::Unload(c) => c.verbose,
        }
    }

    pub fn cmd_name(&self) -> &'static str {
        match self {
            Opts::Run(_) => "run",
            Opts::Start(_) => "start",
            Opts::Stop(_) => "stop",
            Opts::Status(_) => "status",
            Opts::Load(_) => "load",
            Opts::Unload(_) => "unload",
        }
    }

    /// Only the daemon writes a log file; the client commands just print.
    pub fn use_log_file(&self) -> bool {
        matches!(self, Opts::Run(_))
    }

    pub fn run(self) -> Result<()> {
        match self {
            Opts::Run(c) => c.run(),
            Opts::Start(c) => c.run(),
            Opts::Stop(c) => c.run(),
            Opts::Status(c) => c.run(),
            Opts::Load(c) => c.run(),
            Opts::Unload(c) => c.run(),
        }
    }
}

impl CLI for Run {
    fn run(self) -> Result<()> {
        let ctx = Ctx::new()?;
        Supervisor::new(ctx).run()
    }
}

impl CLI for StartApp {
    fn run(self) -> Result<()> {
        send_request(&Request::StartApp { app: self.app })
    }
}

impl CLI for StopApp {
    fn run(self) -> Result<()> {
        send_request(&Request::StopApp { app: self.app })
    }
}

impl CLI for Status {
    fn run(self) -> Result<()> {
        match self.app {
            Some(app) => send_request(&Request::AppStatus { app }),
            None => send_request(&Request::ListApps),
        }
    }
}

impl CLI for LoadModule {
    fn run(self) -> Result<()> {
        send_request(&Request::LoadKernelModule { module: self.module })
    }
}

impl CLI for UnloadModule {
    fn run(self) -> Result<()> {
        send_request(&Request::UnloadKernelModule { module: self.module })
    }
}

/// Sends one request to the daemon and prints the reply.  A non-Ok reply
/// becomes this process's error.
fn send_request(request: &Request) -> Result<()> {
    let stream = UnixStream::connect(&*CTRL_SOCKET_PATH)
        .with_context(|| format!("Is the supervisor running? Failed to connect to {}",
                                 CTRL_SOCKET_PATH.display()))?;

    let mut data = serde_json::to_string(request)?;
    data.push('\n');

    let mut reader = BufReader::new(stream);
    reader.get_mut().write_all(data.as_bytes())?;

    let mut line = String::new();
    reader.read_line(&mut line).context("The supervisor closed the connection")?;

    let response: Response = serde_json::from_str(line.trim_end())
        .context("Malformed reply from the supervisor")?;

    if let Some(ref detail) = response.detail {
        println!("{}", detail);
    }

    match response.result {
        Code::Ok => Ok(()),
        Code::NotFound   => Err(anyhow!("not found").context(KindContext(Kind::NotFound))),
        Code::Overflow   => Err(anyhow!("overflow").context(KindContext(Kind::Overflow))),
        Code::Duplicate  => Err(anyhow!("duplicate").context(KindContext(Kind::Duplicate))),
        Code::Timeout    => Err(anyhow!("timeout").context(KindContext(Kind::Timeout))),
        Code::WouldBlock => Err(anyhow!("would block").context(KindContext(Kind::WouldBlock))),
        Code::Terminated => Err(anyhow!("terminated").context(KindContext(Kind::Terminated))),
        Code::Fault      => bail!("The request failed"),
    }
}

pub fn exit_code(e: &anyhow::Error) -> i32 {
    match crate::error::kind(e) {
        Some(Kind::NotFound)   => 2,
        Some(Kind::Duplicate)  => 3,
        Some(Kind::Overflow)   => 4,
        Some(Kind::Timeout)    => 5,
        Some(Kind::WouldBlock) => 6,
        Some(Kind::Terminated) => 7,
        None                   => 1,
    }
}
