//! Node state data model and the deep-merge law.
//!
//! Every field of a node record is independently optional. Absence is modelled by
//! `None` (serialized as key omission), never by a stored null. Updates are folded
//! in with [`Merge::merge_from`]: present values overwrite, absent values leave the
//! existing value untouched, nested structures merge recursively and are pruned
//! back to `None` when they end up empty.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical node address (the radio's 32-bit node number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Parse a textual node address: `!a1b2c3d4`, `0xa1b2c3d4`, or decimal.
    /// Returns `None` for anything else (display aliases are resolved by the registry).
    pub fn parse(s: &str) -> Option<NodeId> {
        let s = s.trim();
        if let Some(hex) = s.strip_prefix('!') {
            return parse_hex(hex);
        }
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            return parse_hex(hex);
        }
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            return s.parse::<u32>().ok().map(NodeId);
        }
        None
    }
}

fn parse_hex(hex: &str) -> Option<NodeId> {
    if hex.is_empty() || hex.len() > 8 {
        return None;
    }
    u32::from_str_radix(hex, 16).ok().map(NodeId)
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{:08x}", self.0)
    }
}

/// A node reference as it appears in the wild: a number or some string form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeRef {
    Num(u32),
    Name(String),
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRef::Num(n) => write!(f, "{}", n),
            NodeRef::Name(s) => f.write_str(s),
        }
    }
}

impl From<NodeId> for NodeRef {
    fn from(id: NodeId) -> Self {
        NodeRef::Num(id.0)
    }
}

/// Field-wise merge of a partial update into existing state.
pub trait Merge {
    /// Fold the present fields of `update` into `self`. Returns true if any value changed.
    fn merge_from(&mut self, update: &Self) -> bool;
    /// True when no field is present.
    fn is_empty(&self) -> bool;
}

fn merge_leaf<T: Clone + PartialEq>(dst: &mut Option<T>, src: &Option<T>) -> bool {
    match src {
        Some(v) if dst.as_ref() != Some(v) => {
            *dst = Some(v.clone());
            true
        }
        _ => false,
    }
}

/// Merge a nested structure, creating it on first present value and pruning it
/// when nothing is left inside.
fn merge_nested<T: Merge + Default>(dst: &mut Option<T>, src: &Option<T>) -> bool {
    let Some(update) = src.as_ref().filter(|u| !u.is_empty()) else {
        return false;
    };
    let target = dst.get_or_insert_with(T::default);
    let changed = target.merge_from(update);
    if target.is_empty() {
        *dst = None;
    }
    changed
}

macro_rules! impl_leaf_merge {
    ($ty:ty { $($field:ident),+ $(,)? }) => {
        impl Merge for $ty {
            fn merge_from(&mut self, update: &Self) -> bool {
                let mut changed = false;
                $(changed |= merge_leaf(&mut self.$field, &update.$field);)+
                changed
            }

            fn is_empty(&self) -> bool {
                true $(&& self.$field.is_none())+
            }
        }
    };
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct User {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "macaddr")]
    pub mac_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "hwModel")]
    pub hardware_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_licensed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl_leaf_merge!(User {
    id,
    long_name,
    short_name,
    mac_address,
    hardware_model,
    is_licensed,
    role,
});

/// Position fix. Both the floating-degree and the `1e-7` fixed-point forms are kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Position {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "latitudeI")]
    pub latitude_int: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "longitudeI")]
    pub longitude_int: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision_bits: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "satsInView")]
    pub satellites_in_view: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ground_speed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ground_track: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "PDOP")]
    pub pdop: Option<u32>,
}

impl_leaf_merge!(Position {
    latitude,
    longitude,
    latitude_int,
    longitude_int,
    altitude,
    time,
    precision_bits,
    satellites_in_view,
    ground_speed,
    ground_track,
    pdop,
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_utilization: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub air_util_tx: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u32>,
}

impl_leaf_merge!(DeviceMetrics {
    battery_level,
    voltage,
    channel_utilization,
    air_util_tx,
    uptime_seconds,
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Environment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative_humidity: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barometric_pressure: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_resistance: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub satellite_count: Option<u32>,
}

impl_leaf_merge!(Environment {
    temperature,
    relative_humidity,
    barometric_pressure,
    gas_resistance,
    voltage,
    current,
    satellite_count,
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Telemetry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_metrics: Option<DeviceMetrics>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "environmentMetrics")]
    pub environment: Option<Environment>,
}

impl Merge for Telemetry {
    fn merge_from(&mut self, update: &Self) -> bool {
        let mut changed = merge_leaf(&mut self.time, &update.time);
        changed |= merge_nested(&mut self.device_metrics, &update.device_metrics);
        changed |= merge_nested(&mut self.environment, &update.environment);
        changed
    }

    fn is_empty(&self) -> bool {
        self.time.is_none()
            && self.device_metrics.as_ref().map_or(true, Merge::is_empty)
            && self.environment.as_ref().map_or(true, Merge::is_empty)
    }
}

/// A partial update for one node. Produced by extraction, consumed by the registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snr: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heard: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hops_away: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via_relay: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_metrics: Option<DeviceMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<Telemetry>,
}

impl NodeUpdate {
    /// True when applying this update could not change any record.
    pub fn is_empty(&self) -> bool {
        self.snr.is_none()
            && self.last_heard.is_none()
            && self.hops_away.is_none()
            && self.via_relay.is_none()
            && self.user.as_ref().map_or(true, Merge::is_empty)
            && self.position.as_ref().map_or(true, Merge::is_empty)
            && self.device_metrics.as_ref().map_or(true, Merge::is_empty)
            && self.telemetry.as_ref().map_or(true, Merge::is_empty)
    }

    /// Combine two updates for the same node; values in `other` win.
    pub fn absorb(&mut self, other: &NodeUpdate) {
        merge_nested(&mut self.user, &other.user);
        merge_nested(&mut self.position, &other.position);
        merge_leaf(&mut self.snr, &other.snr);
        merge_leaf(&mut self.last_heard, &other.last_heard);
        merge_leaf(&mut self.hops_away, &other.hops_away);
        merge_leaf(&mut self.via_relay, &other.via_relay);
        merge_nested(&mut self.device_metrics, &other.device_metrics);
        merge_nested(&mut self.telemetry, &other.telemetry);
    }
}

/// Merged, long-lived state for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub num: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snr: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heard: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hops_away: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via_relay: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_metrics: Option<DeviceMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<Telemetry>,
    pub last_updated: DateTime<Utc>,
}

impl NodeRecord {
    pub fn new(num: NodeId, now: DateTime<Utc>) -> Self {
        Self {
            num,
            user: None,
            position: None,
            snr: None,
            last_heard: None,
            hops_away: None,
            via_relay: None,
            device_metrics: None,
            telemetry: None,
            last_updated: now,
        }
    }

    /// Apply the merge law. `last_updated` is stamped for every non-empty update,
    /// whether or not a field value changed. Returns true if any field changed.
    pub fn apply(&mut self, update: &NodeUpdate, now: DateTime<Utc>) -> bool {
        if update.is_empty() {
            return false;
        }
        let mut changed = merge_nested(&mut self.user, &update.user);
        changed |= merge_nested(&mut self.position, &update.position);
        changed |= merge_leaf(&mut self.snr, &update.snr);
        changed |= merge_leaf(&mut self.last_heard, &update.last_heard);
        changed |= merge_leaf(&mut self.hops_away, &update.hops_away);
        changed |= merge_leaf(&mut self.via_relay, &update.via_relay);
        changed |= merge_nested(&mut self.device_metrics, &update.device_metrics);
        changed |= merge_nested(&mut self.telemetry, &update.telemetry);
        self.last_updated = now;
        changed
    }

    /// Best human label: long name, then short name, then `!hex` address.
    pub fn label(&self) -> String {
        let user = self.user.as_ref();
        user.and_then(|u| u.long_name.as_deref())
            .or_else(|| user.and_then(|u| u.short_name.as_deref()))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.num.to_string())
    }
}
