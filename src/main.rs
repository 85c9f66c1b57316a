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

#[macro_use]
extern crate log;

#[macro_use]
extern crate anyhow;

#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate serde_json;

mod consts;
#[macro_use]
mod error;
mod logger;
mod util;
mod config;
mod users;
mod smack;
mod policy;
mod cgroup;
mod rlimits;
mod kmod;
mod sandbox;
mod proc;
mod app;
mod framework;
mod sys_status;
mod logfd;
mod poller;
mod ctrl;
mod supervisor;
mod cli;

use anyhow::Result;
use structopt::StructOpt;
use crate::cli::Opts;

fn main() {
    let opts = Opts::from_args();

    logger::init(opts.log_level(), opts.cmd_name(), opts.use_log_file());

    if let Err(e) = do_main(opts) {
        log_error_chain(&e);
        std::process::exit(cli::exit_code(&e));
    }
}

fn do_main(opts: Opts) -> Result<()> {
    opts.run()
}

fn log_error_chain(e: &anyhow::Error) {
    error!("{}", e);
    for cause in e.chain().skip(1) {
        error!("  caused by: {}", cause);
    }
}
