// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistence of controller objects
//!
//! Mutations are prepared on copies of the affected objects and handed to the
//! [`Datastore`] as one [`Changeset`].  Only if the commit succeeds does the
//! caller install the copies in the [`crate::state::ClusterState`].

use crate::state::ResourceDefinition;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("datastore unavailable: {0}")]
    Unavailable(String),
}

/// The objects written by one transaction
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Changeset {
    pub resource_definitions: Vec<ResourceDefinition>,
}

impl Changeset {
    pub fn resource_definition(rsc_dfn: ResourceDefinition) -> Changeset {
        Changeset { resource_definitions: vec![rsc_dfn] }
    }
}

pub trait Datastore: Send + Sync {
    /// Durably stores every object of `changeset`, or none of them
    fn commit(&self, changeset: &Changeset) -> Result<(), DatastoreError>;
}

/// A [`Datastore`] that keeps every committed changeset in memory
#[derive(Debug, Default)]
pub struct InMemoryDatastore {
    commits: Mutex<Vec<Changeset>>,
    fail_commits: AtomicBool,
}

impl InMemoryDatastore {
    pub fn new() -> InMemoryDatastore {
        InMemoryDatastore::default()
    }

    /// Makes subsequent commits fail (or succeed again)
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn commit_count(&self) -> usize {
        self.commits.lock().unwrap().len()
    }

    pub fn commits(&self) -> Vec<Changeset> {
        self.commits.lock().unwrap().clone()
    }
}

impl Datastore for InMemoryDatastore {
    fn commit(&self, changeset: &Changeset) -> Result<(), DatastoreError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(DatastoreError::Unavailable(String::from(
                "commits disabled",
            )));
        }
        self.commits.lock().unwrap().push(changeset.clone());
        Ok(())
    }
}
