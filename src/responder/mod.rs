//! # Auto-Responder
//!
//! Watches decoded text events for configured trigger phrases ("signal check"
//! style messages) and composes an on-air reply reporting how well the station
//! hears the sender. Matching is exact against the lower-cased, trimmed text:
//! a substring match would answer messages that merely mention a trigger.
//!
//! The reply identity comes from a configured table keyed by the *uplink*
//! node's `!hex` id (the station that bridged the packet onto MQTT), not the
//! originating sender. An uplink with no configured identity fails closed: we
//! don't know which of our stations heard it, so we say nothing.
//!
//! Composition here is pure and synchronous. The tracker applies the random
//! transmit jitter and the actual publish in a detached task so a pending
//! reply never delays registry merges.

use log::debug;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::config::{ReplyFrom, ResponderConfig};
use crate::event::{EventKind, MeshEvent};
use crate::mqtt::OutgoingText;
use crate::nodedb::NodeDb;

/// Reasons a matched trigger still produces no reply.
///
/// These are logged and skipped; they must never abort the event pipeline.
#[derive(Debug, Error)]
pub enum ResponderError {
    /// The event carried no `sender` uplink id at all.
    #[error("triggering event has no uplink sender id")]
    MissingUplink,

    /// The uplink id is not in the configured reply-identity table.
    #[error("uplink node {0} has no configured reply identity")]
    UnknownUplink(String),

    /// The uplink id could not be parsed as a `!hex` node address.
    #[error("uplink id {0} is not a valid !hex node address")]
    BadUplinkId(String),
}

/// Trigger matching and reply composition.
pub struct Responder {
    enabled: bool,
    /// Trigger phrases, stored lower-cased and trimmed.
    triggers: HashSet<String>,
    /// Uplink `!hex` id -> reply display name. Case-sensitive on purpose:
    /// node ids are canonical lowercase hex and typos should fail closed.
    identities: HashMap<String, String>,
    reply_from: ReplyFrom,
    node_id: u32,
}

impl Responder {
    pub fn new(cfg: &ResponderConfig) -> Self {
        Responder {
            enabled: cfg.enabled,
            triggers: cfg
                .triggers
                .iter()
                .map(|t| t.trim().to_lowercase())
                .collect(),
            identities: cfg.identities.clone(),
            reply_from: cfg.reply_from,
            node_id: cfg.node_id,
        }
    }

    /// Decide whether `event` warrants a reply and compose it.
    ///
    /// Returns `Ok(None)` when the event simply isn't a trigger (wrong kind,
    /// no text, phrase not configured, or the responder is disabled). Returns
    /// an error only for a matched trigger that fails the uplink lookup.
    pub fn check(&self, event: &MeshEvent, db: &NodeDb) -> Result<Option<OutgoingText>, ResponderError> {
        if !self.enabled || event.kind != EventKind::Text {
            return Ok(None);
        }
        let text = match event.text() {
            Some(text) => text,
            None => return Ok(None),
        };
        if !self.triggers.contains(&text.trim().to_lowercase()) {
            return Ok(None);
        }

        let uplink = event.sender.as_deref().ok_or(ResponderError::MissingUplink)?;
        let receiver = self
            .identities
            .get(uplink)
            .ok_or_else(|| ResponderError::UnknownUplink(uplink.to_string()))?;

        let from = match self.reply_from {
            ReplyFrom::Uplink => parse_hex_id(uplink)
                .ok_or_else(|| ResponderError::BadUplinkId(uplink.to_string()))?,
            ReplyFrom::NodeId => self.node_id,
        };

        let sender_name = db
            .nodes
            .get(&event.from)
            .and_then(|rec| rec.shortname.clone())
            .unwrap_or_else(|| {
                format!("!{:08x} (your nodeinfo is not yet in my DB)", event.from)
            });
        let distance = if event.hops_away > 0 {
            format!("{} hops away", event.hops_away)
        } else {
            // 0 and -1 both mean "no usable hop count": direct reception, or
            // firmware older than 2.3.0 that never reports hops.
            format!(
                "direct (RSSI:{}|SNR:{}) (or not 2.3.X)",
                event.rssi, event.snr
            )
        };

        debug!("Trigger matched from {} via {}", event.from, uplink);
        Ok(Some(OutgoingText {
            from,
            channel: event.channel,
            text: format!("Hello {sender_name}!\n{receiver} hears you {distance}"),
        }))
    }
}

/// Parse a `!hex` uplink id into a numeric node address.
fn parse_hex_id(id: &str) -> Option<u32> {
    let hex = id.strip_prefix('!')?;
    u32::from_str_radix(hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResponderConfig;
    use chrono::Utc;

    fn responder() -> Responder {
        let mut cfg = ResponderConfig::default();
        cfg.enabled = true;
        cfg.triggers = vec!["Signal Check".into(), "anyone receiving??".into()];
        cfg.identities
            .insert("!75e9a1cc".into(), "North Hill".into());
        cfg.node_id = 0x035e8236;
        Responder::new(&cfg)
    }

    fn text_event(raw: &str) -> MeshEvent {
        MeshEvent::decode(raw.as_bytes()).unwrap()
    }

    #[test]
    fn matches_case_insensitively_and_exactly() {
        let r = responder();
        let db = NodeDb::default();
        let ev = text_event(
            r#"{"type":"text","from":77,"sender":"!75e9a1cc","payload":{"text":"SIGNAL CHECK"}}"#,
        );
        assert!(r.check(&ev, &db).unwrap().is_some());

        let not_exact = text_event(
            r#"{"type":"text","from":77,"sender":"!75e9a1cc","payload":{"text":"signal check please"}}"#,
        );
        assert!(r.check(&not_exact, &db).unwrap().is_none());
    }

    #[test]
    fn unknown_uplink_fails_closed() {
        let r = responder();
        let db = NodeDb::default();
        let ev = text_event(
            r#"{"type":"text","from":77,"sender":"!0badf00d","payload":{"text":"signal check"}}"#,
        );
        assert!(matches!(
            r.check(&ev, &db),
            Err(ResponderError::UnknownUplink(_))
        ));

        let no_sender =
            text_event(r#"{"type":"text","from":77,"payload":{"text":"signal check"}}"#);
        assert!(matches!(
            r.check(&no_sender, &db),
            Err(ResponderError::MissingUplink)
        ));
    }

    #[test]
    fn reply_uses_shortname_when_known() {
        let r = responder();
        let mut db = NodeDb::default();
        db.apply_event(
            &text_event(
                r#"{"type":"nodeinfo","from":77,"payload":
                   {"hardware":4,"shortname":"WX77","longname":"Weather 77"}}"#,
            ),
            Utc::now(),
        )
        .unwrap();
        let ev = text_event(
            r#"{"type":"text","from":77,"sender":"!75e9a1cc","channel":3,
                "hops_away":2,"payload":{"text":"signal check"}}"#,
        );
        let out = r.check(&ev, &db).unwrap().expect("reply composed");
        assert_eq!(out.channel, 3);
        assert_eq!(out.from, 0x75e9a1cc);
        assert_eq!(out.text, "Hello WX77!\nNorth Hill hears you 2 hops away");
    }

    #[test]
    fn reply_falls_back_to_hex_id_and_direct_distance() {
        let r = responder();
        let db = NodeDb::default();
        let ev = text_event(
            r#"{"type":"text","from":77,"sender":"!75e9a1cc","rssi":-102,"snr":-3.5,
                "payload":{"text":"signal check"}}"#,
        );
        let out = r.check(&ev, &db).unwrap().expect("reply composed");
        assert_eq!(
            out.text,
            "Hello !0000004d (your nodeinfo is not yet in my DB)!\nNorth Hill hears you direct (RSSI:-102|SNR:-3.5) (or not 2.3.X)"
        );
    }

    #[test]
    fn non_text_and_sendtext_never_trigger() {
        let r = responder();
        let db = NodeDb::default();
        let reflection = text_event(
            r#"{"type":"sendtext","from":77,"sender":"!75e9a1cc","payload":{"text":"signal check"}}"#,
        );
        assert!(r.check(&reflection, &db).unwrap().is_none());

        let telemetry = text_event(r#"{"type":"telemetry","from":77,"sender":"!75e9a1cc"}"#);
        assert!(r.check(&telemetry, &db).unwrap().is_none());
    }

    #[test]
    fn disabled_responder_stays_quiet() {
        let mut cfg = ResponderConfig::default();
        cfg.enabled = false;
        cfg.triggers = vec!["signal check".into()];
        cfg.identities.insert("!75e9a1cc".into(), "Hill".into());
        let r = Responder::new(&cfg);
        let ev = text_event(
            r#"{"type":"text","from":77,"sender":"!75e9a1cc","payload":{"text":"signal check"}}"#,
        );
        assert!(r.check(&ev, &NodeDb::default()).unwrap().is_none());
    }

    #[test]
    fn reply_from_node_id_mode() {
        let mut cfg = ResponderConfig::default();
        cfg.enabled = true;
        cfg.triggers = vec!["signal check".into()];
        cfg.identities.insert("!75e9a1cc".into(), "Hill".into());
        cfg.node_id = 42;
        cfg.reply_from = ReplyFrom::NodeId;
        let r = Responder::new(&cfg);
        let ev = text_event(
            r#"{"type":"text","from":77,"sender":"!75e9a1cc","payload":{"text":"signal check"}}"#,
        );
        let out = r.check(&ev, &NodeDb::default()).unwrap().unwrap();
        assert_eq!(out.from, 42);
    }
}
