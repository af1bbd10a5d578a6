//! # Node Database - Registry and Persistence Layer
//!
//! The node database is the single source of truth for what this service knows
//! about the mesh: one [`NodeRecord`] per node id, merged together from whatever
//! unordered mix of `nodeinfo`, `position`, `telemetry`, and text events the
//! gateway happens to publish. Every update is a partial merge; an event of one
//! kind never clears fields another kind set earlier.
//!
//! Persistence is a periodic full-registry snapshot to a YAML file. Writes go
//! to a unique temp file first and are renamed over the destination, so a
//! reader (or a crash) at any instant sees either the old complete database or
//! the new complete database, never a torn write. `BTreeMap`s keep key order
//! stable so consecutive snapshots diff cleanly.
//!
//! ```text
//! data flow:   tracker loop ──merge──▶ NodeDb ◀──snapshot── save loop
//! ```

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration};

use crate::event::{EventKind, DecodeError, MeshEvent};
use crate::metrics;

/// Last decoded position of a node, in decimal degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
    pub alt: i64,
    pub tim: i64,
}

/// Latest device telemetry of a node, stored verbatim from the wire payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub tx_util: f64,
    pub batt: i64,
    pub chan_util: f64,
    pub voltage: f64,
}

/// Timestamp and kind of the most recent event from a node, any kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastMessage {
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Per-kind arrival statistics for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindStat {
    pub latest: DateTime<Utc>,
    pub count: u64,
}

/// Everything this service knows about one mesh node.
///
/// All fields except `id` are filled in lazily as events arrive; a record that
/// has only ever been heard via telemetry will have no names, and vice versa.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Numeric mesh address. Immutable once the record exists.
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shortname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<Telemetry>,
    #[serde(default)]
    pub latest_rssi: i64,
    #[serde(default)]
    pub latest_snr: f64,
    /// -1 until a packet with hop information arrives.
    #[serde(default = "default_hops")]
    pub latest_hops: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub message_type_stats: BTreeMap<String, KindStat>,
}

fn default_hops() -> i64 {
    -1
}

impl NodeRecord {
    /// A fresh record carrying only the node's address.
    pub fn new(id: u32) -> Self {
        NodeRecord {
            id,
            shortname: None,
            longname: None,
            hardware: None,
            position: None,
            telemetry: None,
            latest_rssi: 0,
            latest_snr: 0.0,
            latest_hops: -1,
            last_message: None,
            message_type_stats: BTreeMap::new(),
        }
    }

    /// The node address in Meshtastic's `!hex` rendering.
    pub fn hex_id(&self) -> String {
        format!("!{:08x}", self.id)
    }
}

/// The in-memory registry plus its write metadata. Serialized whole to YAML.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDb {
    /// Stamped immediately before each persistence write.
    #[serde(default)]
    pub last_write: Option<DateTime<Utc>>,
    #[serde(default)]
    pub nodes: BTreeMap<u32, NodeRecord>,
}

impl NodeDb {
    /// Load the registry from `path`.
    ///
    /// A missing or empty file starts an empty registry; that is the normal
    /// first-boot case, not an error. A file that exists but fails to parse is
    /// an error: silently discarding a corrupt database would lose state.
    pub fn load(path: &Path) -> Result<NodeDb> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No node database at {}, starting empty", path.display());
                return Ok(NodeDb::default());
            }
            Err(e) => return Err(anyhow!("Failed to read node database {}: {}", path.display(), e)),
        };
        if content.trim().is_empty() {
            return Ok(NodeDb::default());
        }
        let db: NodeDb = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse node database {}", path.display()))?;
        info!(
            "Loaded node database {} ({} nodes)",
            path.display(),
            db.nodes.len()
        );
        Ok(db)
    }

    /// Serialize the whole registry. `BTreeMap` fields give stable key order.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| anyhow!("Failed to serialize node database: {}", e))
    }

    /// Merge one decoded event into the registry.
    ///
    /// Creates the record on first sight, then applies the unconditional
    /// updates (last message, per-kind stats, signal quality) before the
    /// kind-specific branch. A malformed kind payload fails this event after
    /// the unconditional updates, matching what the original gateway traffic
    /// tolerates; it never unwinds fields already set.
    ///
    /// `sendtext` reflections of our own traffic are discarded outright.
    pub fn apply_event(&mut self, event: &MeshEvent, now: DateTime<Utc>) -> Result<(), DecodeError> {
        if event.kind == EventKind::SendText {
            return Ok(());
        }

        let record = self
            .nodes
            .entry(event.from)
            .or_insert_with(|| NodeRecord::new(event.from));

        record.last_message = Some(LastMessage {
            ts: now,
            kind: event.kind.stat_key().to_string(),
        });
        let stat = record
            .message_type_stats
            .entry(event.kind.stat_key().to_string())
            .or_insert(KindStat { latest: now, count: 0 });
        stat.latest = now;
        stat.count += 1;

        record.latest_rssi = event.rssi;
        record.latest_snr = event.snr;
        record.latest_hops = event.hops_away;

        match &event.kind {
            EventKind::NodeInfo => {
                let info = event.node_info()?;
                record.hardware = Some(info.hardware);
                record.shortname = Some(info.shortname);
                record.longname = Some(info.longname);
            }
            EventKind::Position => {
                let pos = event.position()?;
                record.position = Some(Position {
                    lat: pos.latitude_i as f64 / 1e7,
                    lon: pos.longitude_i as f64 / 1e7,
                    alt: pos.altitude,
                    tim: pos.time,
                });
            }
            EventKind::Telemetry => {
                let tel = event.telemetry()?;
                record.telemetry = Some(Telemetry {
                    tx_util: tel.air_util_tx,
                    batt: tel.battery_level,
                    chan_util: tel.channel_utilization,
                    voltage: tel.voltage,
                });
            }
            // Text handling belongs to the responder; nothing extra to merge.
            EventKind::Text | EventKind::SendText | EventKind::Other(_) => {}
        }

        Ok(())
    }
}

/// Write `content` to `path` atomically.
///
/// Takes an exclusive lock on the destination, writes to a unique temp file in
/// the same directory, fsyncs it, renames it over the destination, then fsyncs
/// the directory so the rename itself is durable.
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    use std::fs::{self, File, OpenOptions};
    use std::io::Write;

    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open {} for locking", path.display()))?;
    lock_file.lock_exclusive()?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("nodedb.yaml");
    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut tmp) => {
                tmp.write_all(content.as_bytes())?;
                tmp.flush()?;
                let _ = tmp.sync_all();
                break candidate;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
                continue;
            }
            Err(e) => return Err(anyhow!("Failed to create temp file for atomic write: {}", e)),
        }
    };

    fs::rename(&tmp_path, path)?;

    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }

    drop(lock_file);
    Ok(())
}

/// Stamp the write timestamp, snapshot the registry, and write it atomically.
///
/// The mutex is held only while stamping and serializing, never across I/O.
pub fn flush(db: &Arc<Mutex<NodeDb>>, path: &Path) -> Result<()> {
    let content = {
        let mut guard = db.lock().expect("node registry mutex poisoned");
        guard.last_write = Some(Utc::now());
        guard.to_yaml()?
    };
    write_atomic(path, &content)
}

/// Periodic persistence loop: sleep, then flush, forever.
///
/// The sleep runs from the end of the previous cycle, so a slow write delays
/// the next cycle rather than stacking writes. A failed cycle is logged and
/// retried at the next interval; it never terminates the loop.
pub async fn save_loop(db: Arc<Mutex<NodeDb>>, path: PathBuf, every: Duration) {
    loop {
        sleep(every).await;
        match flush(&db, &path) {
            Ok(()) => {
                metrics::inc_saves_ok();
                debug!("Node database saved to {}", path.display());
            }
            Err(e) => {
                metrics::inc_saves_failed();
                error!("Node database save failed (will retry next cycle): {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(raw: &str) -> MeshEvent {
        MeshEvent::decode(raw.as_bytes()).expect("test event decodes")
    }

    #[test]
    fn first_event_creates_record_with_id() {
        let mut db = NodeDb::default();
        db.apply_event(&event(r#"{"type":"text","from":42,"payload":{"text":"hi"}}"#), Utc::now())
            .unwrap();
        let rec = db.nodes.get(&42).expect("record created");
        assert_eq!(rec.id, 42);
        assert_eq!(rec.hex_id(), "!0000002a");
        assert!(rec.shortname.is_none());
    }

    #[test]
    fn position_is_converted_to_degrees() {
        let mut db = NodeDb::default();
        db.apply_event(
            &event(
                r#"{"type":"position","from":1,"payload":
                   {"latitude_i":123456789,"longitude_i":-70456120,"altitude":120,"time":1700000000}}"#,
            ),
            Utc::now(),
        )
        .unwrap();
        let pos = db.nodes[&1].position.clone().expect("position set");
        assert_eq!(pos.lat, 12.3456789);
        assert_eq!(pos.lon, -7.0456120);
        assert_eq!(pos.alt, 120);
        assert_eq!(pos.tim, 1700000000);
    }

    #[test]
    fn sendtext_is_discarded_before_any_merge() {
        let mut db = NodeDb::default();
        db.apply_event(
            &event(r#"{"type":"sendtext","from":42,"payload":{"text":"our own echo"}}"#),
            Utc::now(),
        )
        .unwrap();
        assert!(db.nodes.is_empty());
    }

    #[test]
    fn stats_count_per_kind() {
        let mut db = NodeDb::default();
        let now = Utc::now();
        for _ in 0..3 {
            db.apply_event(&event(r#"{"type":"text","from":5,"payload":{"text":"x"}}"#), now)
                .unwrap();
        }
        db.apply_event(&event(r#"{"from":5}"#), now).unwrap();
        let rec = &db.nodes[&5];
        assert_eq!(rec.message_type_stats["text"].count, 3);
        assert_eq!(rec.message_type_stats["_"].count, 1);
        assert_eq!(rec.last_message.as_ref().unwrap().kind, "_");
    }

    #[test]
    fn malformed_nodeinfo_payload_keeps_unconditional_updates() {
        let mut db = NodeDb::default();
        let result = db.apply_event(
            &event(r#"{"type":"nodeinfo","from":9,"rssi":-80,"payload":{"hardware":31}}"#),
            Utc::now(),
        );
        assert!(result.is_err());
        let rec = &db.nodes[&9];
        assert_eq!(rec.latest_rssi, -80);
        assert!(rec.shortname.is_none());
        assert_eq!(rec.message_type_stats["nodeinfo"].count, 1);
    }

    #[test]
    fn yaml_round_trips() {
        let mut db = NodeDb::default();
        let now = Utc::now();
        db.apply_event(
            &event(
                r#"{"type":"nodeinfo","from":305419896,"sender":"!deadbeef","payload":
                   {"hardware":"TBEAM","shortname":"T1","longname":"Test Beam One"}}"#,
            ),
            now,
        )
        .unwrap();
        db.last_write = Some(now);
        let yaml = db.to_yaml().unwrap();
        let reloaded: NodeDb = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(reloaded, db);
        // Stable key order: serializing the reload is byte-identical.
        assert_eq!(reloaded.to_yaml().unwrap(), yaml);
    }
}
