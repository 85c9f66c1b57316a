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

//! System status oracle.
//!
//! A freshly updated system runs on probation until the update framework
//! marks it good; fault escalation is harsher during probation (a
//! fault-looping process reboots the device instead of just stopping its
//! app).  The marker is maintained by the update framework; we only read
//! it.

use std::path::{Path, PathBuf};

const PROBATION_MARKER: &str = "/var/run/appvisor/probation";

pub struct SysStatus {
    marker: PathBuf,
}

impl SysStatus {
    pub fn new() -> Self {
        Self::with_marker(Path::new(PROBATION_MARKER))
    }

    pub fn with_marker(marker: &Path) -> Self {
        Self { marker: marker.to_owned() }
    }

    /// true once the system has been validated ("good"), false while on
    /// probation.
    pub fn is_good(&self) -> bool {
        !self.marker.exists()
    }
}
