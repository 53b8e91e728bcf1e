// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Structured results for user-facing API calls
//!
//! A user-visible failure is reported as an [`ApiCallRcEntry`] carrying a
//! stable numeric [`RcCode`].  Internal errors are logged by the component
//! that hit them and only surface here as
//! [`RcCode::FailImplementationError`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Stable reason code of an API call result entry
///
/// Codes below 1000 report success; everything else is a failure.  The
/// numeric values are part of the external interface and must not change.
#[derive(Copy, Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(into = "u64", try_from = "u64")]
pub enum RcCode {
    Created,
    Modified,
    Deleted,
    FailInvalidName,
    FailNotFoundRscDfn,
    FailNotFoundRsc,
    FailNotFoundSnapshotDfn,
    FailExistsSnapshotDfn,
    FailSnapshotsNotSupported,
    FailNotConnected,
    FailInvalidSnapshotState,
    FailAccessDenied,
    FailDatastore,
    FailImplementationError,
}

impl RcCode {
    pub fn as_u64(&self) -> u64 {
        match self {
            RcCode::Created => 1,
            RcCode::Modified => 2,
            RcCode::Deleted => 3,
            RcCode::FailInvalidName => 1001,
            RcCode::FailNotFoundRscDfn => 1101,
            RcCode::FailNotFoundRsc => 1102,
            RcCode::FailNotFoundSnapshotDfn => 1103,
            RcCode::FailExistsSnapshotDfn => 1201,
            RcCode::FailSnapshotsNotSupported => 1301,
            RcCode::FailNotConnected => 1302,
            RcCode::FailInvalidSnapshotState => 1303,
            RcCode::FailAccessDenied => 1401,
            RcCode::FailDatastore => 1501,
            RcCode::FailImplementationError => 1999,
        }
    }

    pub fn is_error(&self) -> bool {
        self.as_u64() >= 1000
    }
}

impl fmt::Display for RcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.as_u64())
    }
}

impl From<RcCode> for u64 {
    fn from(code: RcCode) -> u64 {
        code.as_u64()
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unknown result code: {0}")]
pub struct UnknownRcCode(pub u64);

impl TryFrom<u64> for RcCode {
    type Error = UnknownRcCode;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        const ALL: [RcCode; 14] = [
            RcCode::Created,
            RcCode::Modified,
            RcCode::Deleted,
            RcCode::FailInvalidName,
            RcCode::FailNotFoundRscDfn,
            RcCode::FailNotFoundRsc,
            RcCode::FailNotFoundSnapshotDfn,
            RcCode::FailExistsSnapshotDfn,
            RcCode::FailSnapshotsNotSupported,
            RcCode::FailNotConnected,
            RcCode::FailInvalidSnapshotState,
            RcCode::FailAccessDenied,
            RcCode::FailDatastore,
            RcCode::FailImplementationError,
        ];
        ALL.into_iter()
            .find(|code| code.as_u64() == value)
            .ok_or(UnknownRcCode(value))
    }
}

/// One entry of an API call result
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ApiCallRcEntry {
    pub code: RcCode,
    pub message: String,
    pub cause: Option<String>,
    pub correction: Option<String>,
    /// Names of the objects the entry refers to, e.g. "rsc_dfn" => "rscA"
    pub object_refs: BTreeMap<String, String>,
}

impl ApiCallRcEntry {
    pub fn new(code: RcCode, message: impl Into<String>) -> ApiCallRcEntry {
        ApiCallRcEntry {
            code,
            message: message.into(),
            cause: None,
            correction: None,
            object_refs: BTreeMap::new(),
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_correction(mut self, correction: impl Into<String>) -> Self {
        self.correction = Some(correction.into());
        self
    }

    pub fn with_object_ref(
        mut self,
        key: impl Into<String>,
        value: impl fmt::Display,
    ) -> Self {
        self.object_refs.insert(key.into(), value.to_string());
        self
    }
}

/// The result of an API call: an ordered list of entries
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ApiCallRc {
    entries: Vec<ApiCallRcEntry>,
}

impl ApiCallRc {
    pub fn new() -> ApiCallRc {
        ApiCallRc::default()
    }

    pub fn single(entry: ApiCallRcEntry) -> ApiCallRc {
        ApiCallRc { entries: vec![entry] }
    }

    pub fn add_entry(&mut self, entry: ApiCallRcEntry) {
        self.entries.push(entry);
    }

    pub fn extend(&mut self, other: ApiCallRc) {
        self.entries.extend(other.entries);
    }

    pub fn entries(&self) -> &[ApiCallRcEntry] {
        &self.entries
    }

    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(|e| e.code.is_error())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the codes of every entry, in order
    pub fn codes(&self) -> Vec<RcCode> {
        self.entries.iter().map(|e| e.code).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(RcCode::FailSnapshotsNotSupported.as_u64(), 1301);
        assert_eq!(RcCode::try_from(1302), Ok(RcCode::FailNotConnected));
        assert_eq!(RcCode::try_from(7), Err(UnknownRcCode(7)));
        assert_eq!(
            serde_json::to_string(&RcCode::Created).unwrap(),
            "1"
        );
    }

    #[test]
    fn test_errors() {
        let mut rc = ApiCallRc::new();
        assert!(!rc.has_errors());
        rc.add_entry(ApiCallRcEntry::new(RcCode::Created, "created"));
        assert!(!rc.has_errors());
        rc.add_entry(
            ApiCallRcEntry::new(RcCode::FailNotConnected, "offline")
                .with_object_ref("node", "node-a"),
        );
        assert!(rc.has_errors());
        assert_eq!(rc.codes(), [RcCode::Created, RcCode::FailNotConnected]);
        assert_eq!(rc.entries()[1].object_refs["node"], "node-a");
    }
}
