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

//! Control protocol: newline-delimited JSON over the supervisor's Unix
//! socket.  Used by the CLI and by framework daemons (the watchdog
//! reports expiries here, debuggers block/unblock processes here).

use serde::{Serialize, Deserialize};
use crate::error::{self, Kind};

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    StartApp { app: String },
    StopApp { app: String },
    /// Removes the app object and its shared-resource grants.  Issued by
    /// the installer at uninstall time; the app must be stopped.
    DeleteApp { app: String },
    AppStatus { app: String },
    ListApps,
    LoadKernelModule { module: String },
    UnloadKernelModule { module: String },
    AddLink { app: String, path: String },
    RemoveAllLinks { app: String },
    SetDevPermission { app: String, path: String, perm: String },
    CreateProc {
        app: String,
        #[serde(default)]
        proc_name: Option<String>,
        #[serde(default)]
        exec_path: Option<String>,
    },
    StartProc { app: String, proc_name: String },
    DeleteProc { app: String, proc_name: String },
    SetProcPriority {
        app: String,
        proc_name: String,
        #[serde(default)]
        priority: Option<String>,
    },
    AddProcArg { app: String, proc_name: String, arg: String },
    ClearProcArgs { app: String, proc_name: String },
    SetProcFaultAction { app: String, proc_name: String, action: String },
    SetProcRun { app: String, proc_name: String, run: bool },
    SetProcDebug { app: String, proc_name: String, debug: bool },
    Unblock { app: String, pid: i32 },
    WatchdogExpired { app: String, pid: i32 },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Code {
    Ok,
    NotFound,
    Overflow,
    Duplicate,
    Fault,
    Timeout,
    WouldBlock,
    Terminated,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub result: Code,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Response {
    pub fn ok() -> Self {
        Self { result: Code::Ok, detail: None }
    }

    pub fn ok_with(detail: String) -> Self {
        Self { result: Code::Ok, detail: Some(detail) }
    }

    pub fn from_error(e: &anyhow::Error) -> Self {
        let result = match error::kind(e) {
            Some(Kind::NotFound)   => Code::NotFound,
            Some(Kind::Overflow)   => Code::Overflow,
            Some(Kind::Duplicate)  => Code::Duplicate,
            Some(Kind::Timeout)    => Code::Timeout,
            Some(Kind::WouldBlock) => Code::WouldBlock,
            Some(Kind::Terminated) => Code::Terminated,
            None                   => Code::Fault,
        };

        Self { result, detail: Some(format!("{:#}", e)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_roundtrip_as_tagged_json() {
        let req: Request =
            serde_json::from_str(r#"{"op":"startApp","app":"cam"}"#).unwrap();
        assert!(matches!(req, Request::StartApp { ref app } if app == "cam"));

        let req: Request = serde_json::from_str(
            r#"{"op":"createProc","app":"cam","execPath":"/bin/worker"}"#).unwrap();
        match req {
            Request::CreateProc { app, proc_name, exec_path } => {
                assert_eq!(app, "cam");
                assert_eq!(proc_name, None);
                assert_eq!(exec_path.as_deref(), Some("/bin/worker"));
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn error_kinds_map_to_wire_codes() {
        let e = anyhow!("nope").context(error::KindContext(Kind::Duplicate));
        assert_eq!(Response::from_error(&e).result, Code::Duplicate);

        let e = anyhow!("plain failure");
        assert_eq!(Response::from_error(&e).result, Code::Fault);
    }
}
