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

use std::fmt;

/// Semantic error kinds attached to `anyhow` errors as context values.
/// An error carrying no `Kind` is a plain fault.
///
/// Callers that dispatch on the outcome of a public operation (e.g. the
/// control socket turning `Duplicate` into its own reply code) recover the
/// kind with `error::kind()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// The named entity does not exist.
    NotFound,
    /// A value did not fit within a fixed bound.
    Overflow,
    /// A path conflicts with something already present.
    Duplicate,
    /// An operation did not complete within its allotted time.
    Timeout,
    /// The app must be stopped before the request can be honored.
    WouldBlock,
    /// The caller asked for the app to be restarted.
    Terminated,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Kind::NotFound   => "not found",
            Kind::Overflow   => "overflow",
            Kind::Duplicate  => "duplicate",
            Kind::Timeout    => "timeout",
            Kind::WouldBlock => "would block",
            Kind::Terminated => "terminated",
        };
        write!(f, "{}", s)
    }
}

/// Returns the semantic kind of an error, if one was attached.  The
/// downcast finds the KindContext at any depth of the context chain.
pub fn kind(e: &anyhow::Error) -> Option<Kind> {
    e.downcast_ref::<KindContext>().map(|k| k.0)
}

// anyhow's context() needs the value to be an Error-ish display type.
#[derive(Debug)]
pub struct KindContext(pub Kind);

impl fmt::Display for KindContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for KindContext {}

/// Shorthand for bailing out with a kind attached.
macro_rules! bail_kind {
    ($kind:expr, $($arg:tt)*) => {
        return Err(anyhow!($($arg)*).context($crate::error::KindContext($kind)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn kind_is_recovered_through_context_layers() {
        let e: anyhow::Error = anyhow!("inner failure")
            .context(KindContext(Kind::Duplicate))
            .context("while adding a link");

        assert_eq!(kind(&e), Some(Kind::Duplicate));
    }

    #[test]
    fn plain_errors_have_no_kind() {
        let e = anyhow!("some fault");
        assert_eq!(kind(&e), None);
    }
}
