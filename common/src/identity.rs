// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Validated names for nodes, resources, storage pools and snapshots
//!
//! Names are case-insensitive: the spelling supplied by the user is kept for
//! display, while comparison, hashing and ordering use the upper-cased form.
//! This gives every map keyed by a name a deterministic iteration order that
//! does not depend on how a particular caller spelled it.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("{kind} requires at least {min} characters: {name:?}")]
    TooShort { kind: &'static str, name: String, min: usize },
    #[error("{kind} may contain at most {max} characters: {name:?}")]
    TooLong { kind: &'static str, name: String, max: usize },
    #[error("{kind} must begin with {expected}: {name:?}")]
    InvalidFirstCharacter {
        kind: &'static str,
        name: String,
        expected: &'static str,
    },
    #[error("{kind} contains invalid character {c:?}: {name:?}")]
    InvalidCharacter { kind: &'static str, name: String, c: char },
    #[error("{kind} cannot end with {c:?}: {name:?}")]
    InvalidLastCharacter { kind: &'static str, name: String, c: char },
}

struct NameRules {
    kind: &'static str,
    min_len: usize,
    max_len: usize,
    first_allowed: fn(char) -> bool,
    first_expected: &'static str,
    inner_allowed: fn(char) -> bool,
    forbidden_last: &'static [char],
}

impl NameRules {
    fn validate(&self, value: &str) -> Result<(), NameError> {
        let kind = self.kind;
        let len = value.chars().count();
        if len < self.min_len {
            return Err(NameError::TooShort {
                kind,
                name: value.to_string(),
                min: self.min_len,
            });
        }
        if len > self.max_len {
            return Err(NameError::TooLong {
                kind,
                name: value.to_string(),
                max: self.max_len,
            });
        }

        let mut chars = value.chars();
        // `min_len` is at least 1 for every rule set
        let Some(first) = chars.next() else {
            return Err(NameError::TooShort {
                kind,
                name: value.to_string(),
                min: self.min_len,
            });
        };
        if !(self.first_allowed)(first) {
            return Err(NameError::InvalidFirstCharacter {
                kind,
                name: value.to_string(),
                expected: self.first_expected,
            });
        }

        let mut last = first;
        for c in chars {
            if !(self.inner_allowed)(c) {
                return Err(NameError::InvalidCharacter {
                    kind,
                    name: value.to_string(),
                    c,
                });
            }
            last = c;
        }

        if self.forbidden_last.contains(&last) {
            return Err(NameError::InvalidLastCharacter {
                kind,
                name: value.to_string(),
                c: last,
            });
        }

        Ok(())
    }
}

fn is_object_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn is_host_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '.'
}

const NODE_NAME_RULES: NameRules = NameRules {
    kind: "node name",
    min_len: 2,
    max_len: 253,
    first_allowed: |c| c.is_ascii_alphanumeric(),
    first_expected: "an ASCII letter or digit",
    inner_allowed: is_host_name_char,
    forbidden_last: &['-', '.'],
};

const RESOURCE_NAME_RULES: NameRules = NameRules {
    kind: "resource name",
    min_len: 2,
    max_len: 48,
    first_allowed: |c| c.is_ascii_alphabetic(),
    first_expected: "an ASCII letter",
    inner_allowed: is_object_name_char,
    forbidden_last: &[],
};

const STOR_POOL_NAME_RULES: NameRules = NameRules {
    kind: "storage pool name",
    min_len: 2,
    max_len: 48,
    first_allowed: |c| c.is_ascii_alphabetic(),
    first_expected: "an ASCII letter",
    inner_allowed: is_object_name_char,
    forbidden_last: &[],
};

const SNAPSHOT_NAME_RULES: NameRules = NameRules {
    kind: "snapshot name",
    min_len: 2,
    max_len: 48,
    first_allowed: |c| c.is_ascii_alphabetic(),
    first_expected: "an ASCII letter",
    inner_allowed: is_object_name_char,
    forbidden_last: &[],
};

macro_rules! checked_name {
    ($(#[$attr:meta])* $name:ident, $rules:expr) => {
        $(#[$attr])*
        #[derive(Clone, Debug, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name {
            display: String,
            key: String,
        }

        impl $name {
            pub fn new(value: impl Into<String>) -> Result<Self, NameError> {
                let display = value.into();
                $rules.validate(&display)?;
                let key = display.to_ascii_uppercase();
                Ok(Self { display, key })
            }

            /// The name as it was spelled when it was created
            pub fn display_value(&self) -> &str {
                &self.display
            }

            /// The case-normalized form used for comparisons
            pub fn value(&self) -> &str {
                &self.key
            }
        }

        impl TryFrom<String> for $name {
            type Error = NameError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(name: $name) -> String {
                name.display
            }
        }

        impl FromStr for $name {
            type Err = NameError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Self::new(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.display)
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.key == other.key
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.key.hash(state)
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                self.key.cmp(&other.key)
            }
        }
    };
}

checked_name!(
    /// Name of a node (controller or satellite host)
    NodeName,
    NODE_NAME_RULES
);

checked_name!(
    /// Name of a resource definition, shared by all of its per-node resources
    ResourceName,
    RESOURCE_NAME_RULES
);

checked_name!(
    /// Name of a storage pool
    ///
    /// The same storage pool name may exist on many nodes; a pool is
    /// identified by the (node, pool) pair.
    StorPoolName,
    STOR_POOL_NAME_RULES
);

checked_name!(
    /// Name of a snapshot, unique within its resource definition
    SnapshotName,
    SNAPSHOT_NAME_RULES
);
