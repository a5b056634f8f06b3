// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Versioned key-value replica.
//!
//! A [`SharedMap`] is the stable copy of one side's state. Work happens on a
//! [`MapRef`] taken at the start of a transaction; the reference records every
//! mutation as a diff. Committing the prepared reference merges that diff and
//! bumps the version by exactly one.
//!
//! ```text
//!   SharedMap (v3) ──reference()──► MapRef(base v3) ──set/delete──► prepare()
//!        ▲                                                              │
//!        └──────────────────── commit(&MapRef) ◄────────────────────────┘
//!                              (v4 if changed)
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ReplicaError, Result};

/// A diff (or a full snapshot) of a [`SharedMap`].
///
/// A snapshot is a diff against the empty map at version 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Changes {
    /// Version the changes were computed against.
    pub base_version: u64,
    /// Version after applying the changes.
    pub version: u64,
    /// Keys added or updated.
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
    /// Keys deleted.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub removed: BTreeSet<String>,
}

impl Changes {
    /// True if applying these changes would not modify anything.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.removed.is_empty()
    }
}

/// Stable, versioned replica of one direction of device/cloud state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SharedMap {
    version: u64,
    values: BTreeMap<String, Value>,
}

impl SharedMap {
    /// Create an empty map at version 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version. Increases by one per mutating commit.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Read a value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Check whether a key is present.
    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Take a writable reference for the duration of one transaction.
    pub fn reference(&self) -> MapRef {
        MapRef::new(self, false)
    }

    /// Take a reference that rejects every mutation.
    pub fn reference_read_only(&self) -> MapRef {
        MapRef::new(self, true)
    }

    /// Merge the frozen diff of `map_ref` into this map.
    ///
    /// Returns `true` if the version advanced. Fails without touching the map
    /// if the reference was not prepared or was taken against another version.
    pub fn commit(&mut self, map_ref: &MapRef) -> Result<bool> {
        if !map_ref.frozen {
            return Err(ReplicaError::NotPrepared);
        }
        if map_ref.base_version != self.version {
            return Err(ReplicaError::VersionMismatch {
                expected: self.version,
                found: map_ref.base_version,
            });
        }
        if !map_ref.has_changed() {
            return Ok(false);
        }
        for key in &map_ref.removed {
            self.values.remove(key);
        }
        for (key, value) in &map_ref.updated {
            self.values.insert(key.clone(), value.clone());
        }
        self.version += 1;
        Ok(true)
    }

    /// Drop every entry and go back to version 0.
    pub fn reset(&mut self) {
        self.version = 0;
        self.values.clear();
    }

    /// Apply a diff or snapshot produced by the other side.
    ///
    /// The diff's base version must match the current version, so a full
    /// snapshot is applied after [`reset`](Self::reset).
    pub fn apply_changes(&mut self, changes: &Changes) -> Result<()> {
        if changes.base_version != self.version {
            return Err(ReplicaError::VersionMismatch {
                expected: self.version,
                found: changes.base_version,
            });
        }
        if changes.version < changes.base_version {
            return Err(ReplicaError::malformed(
                "version",
                format!(
                    "version {} precedes base version {}",
                    changes.version, changes.base_version
                ),
            ));
        }
        for key in &changes.removed {
            self.values.remove(key);
        }
        for (key, value) in &changes.values {
            self.values.insert(key.clone(), value.clone());
        }
        self.version = changes.version;
        Ok(())
    }

    /// Full contents as a diff against the empty map.
    pub fn snapshot(&self) -> Changes {
        Changes {
            base_version: 0,
            version: self.version,
            values: self.values.clone(),
            removed: BTreeSet::new(),
        }
    }
}

/// Transaction-scoped view of a [`SharedMap`] that records its own diff.
#[derive(Debug, Clone)]
pub struct MapRef {
    base_version: u64,
    values: BTreeMap<String, Value>,
    updated: BTreeMap<String, Value>,
    removed: BTreeSet<String>,
    frozen: bool,
    read_only: bool,
}

impl MapRef {
    fn new(map: &SharedMap, read_only: bool) -> Self {
        Self {
            base_version: map.version,
            values: map.values.clone(),
            updated: BTreeMap::new(),
            removed: BTreeSet::new(),
            frozen: false,
            read_only,
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(ReplicaError::ReadOnly);
        }
        if self.frozen {
            return Err(ReplicaError::Frozen);
        }
        Ok(())
    }

    /// Version of the map this reference was taken from.
    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    /// Read a value, including uncommitted changes.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Check whether a key is present.
    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Iterate over the keys currently visible through this reference.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    /// Set a value.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Result<()> {
        self.check_writable()?;
        let key = key.into();
        self.removed.remove(&key);
        self.values.insert(key.clone(), value.clone());
        self.updated.insert(key, value);
        Ok(())
    }

    /// Delete a key. Deleting a missing key is a no-op.
    pub fn delete(&mut self, key: &str) -> Result<()> {
        self.check_writable()?;
        self.updated.remove(key);
        if self.values.remove(key).is_some() {
            self.removed.insert(key.to_string());
        }
        Ok(())
    }

    /// True once any mutation has been recorded.
    pub fn has_changed(&self) -> bool {
        !self.updated.is_empty() || !self.removed.is_empty()
    }

    /// Freeze the diff. Further mutations fail with [`ReplicaError::Frozen`].
    pub fn prepare(&mut self) {
        self.frozen = true;
    }

    /// True once [`prepare`](Self::prepare) has been called.
    pub fn is_prepared(&self) -> bool {
        self.frozen
    }

    /// The diff recorded so far.
    pub fn changes(&self) -> Changes {
        let version = if self.has_changed() {
            self.base_version + 1
        } else {
            self.base_version
        };
        Changes {
            base_version: self.base_version,
            version,
            values: self.updated.clone(),
            removed: self.removed.clone(),
        }
    }
}
