//! # Tracker Server - Orchestration
//!
//! [`TrackerServer`] owns the node registry and wires the pipeline together:
//! bus gateway → topic router → event decoder → registry merge → responder.
//! Alongside the main loop it spawns two long-lived tasks (the persistence
//! loop and the outbound writer) plus one short-lived jitter task per reply.
//!
//! Concurrency rules the loop upholds:
//!
//! - Registry merges happen inline in the select loop, in bus-delivery order,
//!   and never await. The registry mutex is held for one merge at a time.
//! - Reply publication is fire-and-forget: a detached task sleeps the random
//!   jitter, then hands the frame to the writer task's channel. A hung broker
//!   can therefore stall replies, never merges.
//! - Any per-message failure (unroutable topic, undecodable payload, uplink
//!   lookup miss) is logged and dropped; the loop keeps consuming.
//!
//! Ctrl-C triggers one final node database flush before exit, so state heard
//! in the last few seconds of a session is not lost to the save interval.

use anyhow::{anyhow, Result};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::config::Config;
use crate::event::{EventKind, MeshEvent};
use crate::logutil::escape_log;
use crate::metrics;
use crate::mqtt::{InboundMessage, MqttGateway, OutgoingText, TopicParts};
use crate::nodedb::{self, NodeDb};
use crate::responder::Responder;

/// The long-running tracker service.
pub struct TrackerServer {
    config: Config,
    db: Arc<Mutex<NodeDb>>,
    responder: Responder,
    outgoing_tx: mpsc::UnboundedSender<OutgoingText>,
    outgoing_rx: Option<mpsc::UnboundedReceiver<OutgoingText>>,
}

impl TrackerServer {
    /// Load the node database and assemble the pipeline. Does not connect to
    /// the broker yet; that happens in [`run`](TrackerServer::run).
    pub fn new(config: Config) -> Result<Self> {
        let db = NodeDb::load(Path::new(&config.storage.nodedb_path))?;
        let responder = Responder::new(&config.responder);
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        Ok(TrackerServer {
            config,
            db: Arc::new(Mutex::new(db)),
            responder,
            outgoing_tx,
            outgoing_rx: Some(outgoing_rx),
        })
    }

    /// Shared handle on the registry, for the save loop and for inspection.
    pub fn registry(&self) -> Arc<Mutex<NodeDb>> {
        self.db.clone()
    }

    /// Take the outbound reply channel. `run` consumes it to feed the writer
    /// task; tests take it to observe what would have been published.
    pub fn take_outgoing_rx(&mut self) -> Option<mpsc::UnboundedReceiver<OutgoingText>> {
        self.outgoing_rx.take()
    }

    /// Connect to the broker and process events until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        let (gateway, mut inbound_rx) = MqttGateway::connect(&self.config.mqtt);
        info!(
            "Tracker listening on {}/2/json/# via {}:{}",
            self.config.mqtt.root, self.config.mqtt.host, self.config.mqtt.port
        );

        let outgoing_rx = self
            .take_outgoing_rx()
            .ok_or_else(|| anyhow!("tracker already running"))?;
        tokio::spawn(writer_task(gateway, outgoing_rx));

        let save_path = PathBuf::from(&self.config.storage.nodedb_path);
        tokio::spawn(nodedb::save_loop(
            self.db.clone(),
            save_path.clone(),
            Duration::from_secs(self.config.storage.save_interval_secs),
        ));

        loop {
            tokio::select! {
                inbound = inbound_rx.recv() => {
                    match inbound {
                        Some(InboundMessage { topic, payload }) => {
                            self.handle_inbound(&topic, &payload);
                        }
                        None => {
                            warn!("Inbound channel closed, shutting down");
                            break;
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        // Flush once on the way out so the last interval's events survive.
        if let Err(e) = nodedb::flush(&self.db, &save_path) {
            error!("Final node database flush failed: {e:#}");
        } else {
            info!("Node database flushed to {}", save_path.display());
        }
        let stats = metrics::snapshot();
        info!(
            "Session totals: {} events decoded, {} decode errors, {} replies sent, {} skipped",
            stats.events_decoded, stats.decode_errors, stats.replies_sent, stats.replies_skipped
        );
        Ok(())
    }

    /// Route, decode, and merge one bus message, then consult the responder.
    ///
    /// Synchronous on purpose: everything up to the reply decision runs
    /// without awaiting, so message N+1 is never delayed by message N's
    /// reply. Failures here affect only this message.
    pub fn handle_inbound(&self, topic: &str, payload: &[u8]) {
        let parts = match TopicParts::parse(topic) {
            Some(parts) => parts,
            // Unrelated broker traffic (protobuf trees, stat topics).
            None => return,
        };
        if parts.encoding != "json" {
            return;
        }

        let event = match MeshEvent::decode(payload) {
            Ok(event) => {
                metrics::inc_events_decoded();
                event
            }
            Err(e) => {
                metrics::inc_decode_errors();
                warn!("Dropping undecodable message on {}: {}", topic, e);
                return;
            }
        };

        if event.kind == EventKind::SendText {
            debug!("Ignoring reflection of our own outbound text");
            return;
        }

        let reply = {
            let mut db = self.db.lock().expect("node registry mutex poisoned");
            if let Err(e) = db.apply_event(&event, Utc::now()) {
                warn!("Incomplete {} payload from node {}: {}", event.kind.label(), event.from, e);
            }
            match self.responder.check(&event, &db) {
                Ok(reply) => reply,
                Err(e) => {
                    metrics::inc_replies_skipped();
                    info!("Not replying to matched trigger: {}", e);
                    None
                }
            }
        };

        if let Some(out) = reply {
            info!(
                "Trigger {:?} from node {} on channel {}, queueing reply",
                event.text().map(escape_log).unwrap_or_default(),
                event.from,
                out.channel
            );
            let tx = self.outgoing_tx.clone();
            tokio::spawn(async move {
                // Random hold-off so several responders hearing the same
                // trigger don't key up in the same instant.
                sleep(Duration::from_secs_f64(rand::random::<f64>())).await;
                if tx.send(out).is_err() {
                    debug!("Writer task gone, reply dropped");
                }
            });
        }
    }
}

/// Drains composed replies into the gateway.
async fn writer_task(gateway: MqttGateway, mut rx: mpsc::UnboundedReceiver<OutgoingText>) {
    while let Some(msg) = rx.recv().await {
        match gateway.publish_text(&msg).await {
            Ok(()) => {
                metrics::inc_replies_sent();
                info!(
                    "Published reply on channel {}: {}",
                    msg.channel,
                    escape_log(&msg.text)
                );
            }
            Err(e) => {
                warn!("Reply publish failed: {e}");
            }
        }
    }
}
