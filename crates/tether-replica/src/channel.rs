// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ordered, at-least-once message channel layered over a pair of replicas.
//!
//! A channel lives in the sender's outbound map under its name:
//!
//! ```json
//! {"type": "tether.channel", "firstIndex": 7, "values": [...]}
//! ```
//!
//! The receiver acknowledges by writing the next index it expects under
//! `<name>-ack` in *its* outbound map. Once the sender sees that ack in its
//! inbound map, [`gc`] prunes everything below it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ReplicaError, Result};
use crate::map::MapRef;

/// Marker stored in the `type` field of every channel entry.
pub const CHANNEL_TYPE: &str = "tether.channel";

const ACK_SUFFIX: &str = "-ack";

/// Key under which acknowledgements for `name` are stored.
pub fn ack_key(name: &str) -> String {
    format!("{name}{ACK_SUFFIX}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelEntry {
    #[serde(rename = "type")]
    kind: String,
    first_index: u64,
    #[serde(default)]
    values: Vec<Value>,
}

impl ChannelEntry {
    fn empty() -> Self {
        Self {
            kind: CHANNEL_TYPE.to_string(),
            first_index: 0,
            values: Vec::new(),
        }
    }

    fn end_index(&self) -> u64 {
        self.first_index.saturating_add(self.values.len() as u64)
    }
}

fn read_entry(map: &MapRef, name: &str) -> Result<Option<ChannelEntry>> {
    match map.get(name) {
        None => Ok(None),
        Some(raw) => {
            let entry: ChannelEntry = serde_json::from_value(raw.clone())
                .map_err(|e| ReplicaError::malformed(name, e))?;
            if entry.kind != CHANNEL_TYPE {
                return Err(ReplicaError::malformed(
                    name,
                    format!("unexpected type '{}'", entry.kind),
                ));
            }
            if entry.first_index.checked_add(entry.values.len() as u64).is_none() {
                return Err(ReplicaError::malformed(name, "index range overflows"));
            }
            Ok(Some(entry))
        }
    }
}

fn write_entry(map: &mut MapRef, name: &str, entry: &ChannelEntry) -> Result<()> {
    let raw = serde_json::to_value(entry).map_err(|e| ReplicaError::malformed(name, e))?;
    map.set(name, raw)
}

fn read_ack(map: &MapRef, name: &str) -> Result<Option<u64>> {
    let key = ack_key(name);
    match map.get(&key) {
        None => Ok(None),
        Some(raw) => raw
            .as_u64()
            .map(Some)
            .ok_or_else(|| ReplicaError::malformed(&key, "ack is not an unsigned integer")),
    }
}

/// Messages returned by [`receive`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Received {
    /// Channel index of the first message in `messages`.
    pub index: u64,
    /// New messages, in send order.
    pub messages: Vec<Value>,
}

/// Append `values` to the channel `name` in `map`.
///
/// Returns the channel index assigned to the first value.
pub fn send(map: &mut MapRef, name: &str, values: Vec<Value>) -> Result<u64> {
    let mut entry = read_entry(map, name)?.unwrap_or_else(ChannelEntry::empty);
    let first = entry.end_index();
    if values.is_empty() {
        return Ok(first);
    }
    entry.values.extend(values);
    write_entry(map, name, &entry)?;
    Ok(first)
}

/// Index of the next message [`receive`] will return for channel `name`.
pub fn first_ack_index(out: &MapRef, name: &str) -> Result<u64> {
    Ok(read_ack(out, name)?.unwrap_or(0))
}

/// Read every unacknowledged message of channel `name` from `inp` and
/// acknowledge them in `out`.
///
/// If the sender already pruned messages this side never saw, the gap is
/// logged and skipped.
pub fn receive(out: &mut MapRef, inp: &MapRef, name: &str) -> Result<Received> {
    let expected = first_ack_index(out, name)?;
    let Some(entry) = read_entry(inp, name)? else {
        return Ok(Received {
            index: expected,
            messages: Vec::new(),
        });
    };

    let mut start = expected;
    if entry.first_index > expected {
        warn!(
            channel = name,
            expected,
            first_index = entry.first_index,
            "Channel gap, skipping messages that were never received"
        );
        start = entry.first_index;
    }

    let end = entry.end_index();
    if start >= end {
        if start > end {
            warn!(
                channel = name,
                ack = start,
                end,
                "Acknowledged index ahead of channel contents"
            );
        }
        return Ok(Received {
            index: start,
            messages: Vec::new(),
        });
    }

    let skip = (start - entry.first_index) as usize;
    let messages: Vec<Value> = entry.values.into_iter().skip(skip).collect();
    out.set(ack_key(name), Value::from(end))?;
    debug!(channel = name, index = start, count = messages.len(), "Received channel messages");

    Ok(Received {
        index: start,
        messages,
    })
}

/// Prune from `out` every channel message acknowledged in `inp`.
///
/// Returns the number of messages dropped.
pub fn gc(out: &mut MapRef, inp: &MapRef) -> Result<usize> {
    let names: Vec<String> = out
        .keys()
        .filter(|k| !k.ends_with(ACK_SUFFIX))
        .cloned()
        .collect();

    let mut pruned = 0;
    for name in names {
        let is_channel = out
            .get(&name)
            .and_then(|v| v.get("type"))
            .and_then(Value::as_str)
            == Some(CHANNEL_TYPE);
        if !is_channel {
            continue;
        }
        let Some(ack) = read_ack(inp, &name)? else {
            continue;
        };
        let Some(mut entry) = read_entry(out, &name)? else {
            continue;
        };
        if ack > entry.end_index() {
            warn!(
                channel = %name,
                ack,
                end = entry.end_index(),
                "Out-of-sequence ack beyond sent messages"
            );
        }
        let upto = ack.min(entry.end_index());
        if upto <= entry.first_index {
            continue;
        }
        let count = (upto - entry.first_index) as usize;
        entry.values.drain(..count);
        entry.first_index = upto;
        write_entry(out, &name, &entry)?;
        pruned += count;
    }
    Ok(pruned)
}
