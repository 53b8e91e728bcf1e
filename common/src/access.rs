// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Explicit call context for privilege checks
//!
//! Every operation that touches protected state takes an [`AccessContext`]
//! argument.  A context carries the identity it acts on behalf of, the set of
//! privileges it may enable (its limit) and the set currently enabled.  Actual
//! policy evaluation is out of scope: a context either holds the privilege an
//! operation requires or the operation fails with [`AccessDeniedError`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

#[derive(
    Copy, Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum Privilege {
    ObjView,
    ObjUse,
    ObjChange,
    ObjControl,
    /// Implies every other privilege
    SysAll,
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Privilege::ObjView => "OBJ_VIEW",
            Privilege::ObjUse => "OBJ_USE",
            Privilege::ObjChange => "OBJ_CHANGE",
            Privilege::ObjControl => "OBJ_CONTROL",
            Privilege::SysAll => "SYS_ALL",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("access denied: {subject} lacks {privilege} to {action}")]
pub struct AccessDeniedError {
    pub subject: String,
    pub privilege: Privilege,
    pub action: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AccessContext {
    subject: String,
    limit: BTreeSet<Privilege>,
    effective: BTreeSet<Privilege>,
}

impl AccessContext {
    /// Builds a context that may enable `limit` but has nothing enabled yet
    pub fn new(
        subject: impl Into<String>,
        limit: impl IntoIterator<Item = Privilege>,
    ) -> AccessContext {
        AccessContext {
            subject: subject.into(),
            limit: limit.into_iter().collect(),
            effective: BTreeSet::new(),
        }
    }

    /// The context used by system components (device manager, controller
    /// background work).  It may enable every privilege.
    pub fn system() -> AccessContext {
        AccessContext::new("SYSTEM", [Privilege::SysAll])
    }

    /// A context that holds no privileges at all
    pub fn public() -> AccessContext {
        AccessContext::new("PUBLIC", [])
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Enables the given privileges
    ///
    /// Fails if any of them is outside this context's limit; in that case no
    /// privilege is enabled.
    pub fn enable_privileges(
        &mut self,
        privileges: impl IntoIterator<Item = Privilege>,
    ) -> Result<(), AccessDeniedError> {
        let privileges: Vec<_> = privileges.into_iter().collect();
        let may_enable_all = self.limit.contains(&Privilege::SysAll);
        if let Some(missing) = privileges
            .iter()
            .find(|p| !may_enable_all && !self.limit.contains(p))
        {
            return Err(AccessDeniedError {
                subject: self.subject.clone(),
                privilege: *missing,
                action: String::from("enable privilege"),
            });
        }
        self.effective.extend(privileges);
        Ok(())
    }

    pub fn has(&self, privilege: Privilege) -> bool {
        self.effective.contains(&Privilege::SysAll)
            || self.effective.contains(&privilege)
    }

    /// Fails unless `privilege` is currently enabled
    pub fn require(
        &self,
        privilege: Privilege,
        action: &str,
    ) -> Result<(), AccessDeniedError> {
        if self.has(privilege) {
            Ok(())
        } else {
            Err(AccessDeniedError {
                subject: self.subject.clone(),
                privilege,
                action: action.to_string(),
            })
        }
    }
}
