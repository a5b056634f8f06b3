// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tether Replica - versioned state shared between a device and its cloud actor
//!
//! Each device owns two replicas:
//!
//! | Map | Written by | Read by |
//! |-----|-----------|---------|
//! | `toCloud` | device | cloud actor |
//! | `fromCloud` | cloud actor | device |
//!
//! Writers mutate a [`MapRef`] inside a transaction and merge it with
//! [`SharedMap::commit`]. The diff that [`MapRef::changes`] produces is what
//! travels over the link; the receiving side applies it with
//! [`SharedMap::apply_changes`].
//!
//! The [`channel`] module builds an ordered, at-least-once message stream on
//! top of a pair of maps. Bundles travel cloud → device on one channel and
//! their acknowledgements travel back on another.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use tether_replica::{SharedMap, channel};
//!
//! let mut from_cloud = SharedMap::new();
//! let mut r = from_cloud.reference();
//! channel::send(&mut r, "fromCloudChannel", vec![json!({"start": -1})]).unwrap();
//! r.prepare();
//! from_cloud.commit(&r).unwrap();
//!
//! let to_cloud = SharedMap::new();
//! let mut out = to_cloud.reference();
//! let got = channel::receive(&mut out, &from_cloud.reference_read_only(), "fromCloudChannel").unwrap();
//! assert_eq!(got.messages.len(), 1);
//! ```

#![deny(missing_docs)]

/// Ordered at-least-once channel over a pair of replicas.
pub mod channel;

/// Error types for replica operations.
pub mod error;

/// Versioned map and transaction-scoped references.
pub mod map;

pub use error::{ReplicaError, Result};
pub use map::{Changes, MapRef, SharedMap};
