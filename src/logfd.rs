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

//! Client for the log daemon.
//!
//! The read end of each process's stdout/stderr pipe is handed to the log
//! daemon over its Unix socket with SCM_RIGHTS, tagged with the app name,
//! process name and pid so the stream can be attributed.  The daemon owns
//! the fd from then on.  If the daemon is unreachable the pipe is simply
//! dropped: the app keeps running, its output does not.

use std::{
    fs,
    os::unix::io::AsRawFd,
    os::unix::net::UnixStream,
};
use nix::{
    sys::socket::{sendmsg, ControlMessage, MsgFlags},
    sys::uio::IoVec,
    unistd::Pid,
};
use crate::consts::LOGD_SOCKET_PATH;

pub fn send_stdout(pipe: fs::File, app_name: &str, proc_name: &str, pid: Pid) {
    send(pipe, "stdout", app_name, proc_name, pid);
}

pub fn send_stderr(pipe: fs::File, app_name: &str, proc_name: &str, pid: Pid) {
    send(pipe, "stderr", app_name, proc_name, pid);
}

fn send(pipe: fs::File, stream: &str, app_name: &str, proc_name: &str, pid: Pid) {
    let socket = match UnixStream::connect(&*LOGD_SOCKET_PATH) {
        Ok(s) => s,
        Err(e) => {
            warn!("Log daemon not reachable, {} of '{}' will not be logged: {}",
                  stream, proc_name, e);
            return;
        }
    };

    let header = format!("{} {} {} {}\n", stream, app_name, proc_name, pid);
    let iov = [IoVec::from_slice(header.as_bytes())];
    let fds = [pipe.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];

    if let Err(e) = sendmsg(socket.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None) {
        warn!("Failed to hand {} of '{}' to the log daemon: {}", stream, proc_name, e);
    }

    // `pipe` drops here; the daemon holds its own copy of the fd.
}
