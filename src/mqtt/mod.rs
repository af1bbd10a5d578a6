//! # MQTT Bus Gateway and Topic Routing
//!
//! A Meshtastic gateway node publishes every packet it hears under
//! `<root>/<version>/<encoding>/<channel>/<uplink-node-id>`. This module owns
//! both ends of our bus conversation:
//!
//! - [`TopicParts::parse`] routes inbound topics against that grammar. The
//!   broker carries plenty of traffic we don't care about (protobuf trees,
//!   stat topics), so a non-matching topic is silently dropped rather than
//!   logged as an error. Only the `json` encoding is processed further.
//! - [`MqttGateway`] wraps the rumqttc client: a reader task polls the
//!   connection, forwards JSON-tree publishes over an unbounded channel to
//!   the tracker loop, and resubscribes whenever the broker re-acknowledges a
//!   connection. Outbound replies are serialized as `sendtext` frames and
//!   published to `<root>/2/json/mqtt`.
//!
//! Connection management (retry, backoff, keep-alive) is rumqttc's job; the
//! reader task just logs connection errors and keeps polling.

use anyhow::Result;
use log::{debug, info, warn};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::config::MqttConfig;

/// Structured fields of a matched bus topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicParts {
    /// Root namespace, possibly several path segments.
    pub root: String,
    /// Payload encoding segment; only `json` is processed.
    pub encoding: String,
    /// Channel name the gateway bridged the packet from.
    pub channel: String,
    /// Uplink node id in `!hex` form.
    pub node_id: String,
}

impl TopicParts {
    /// Match a topic against `<root>/<version-digit>/<encoding>/<channel>/<node-id>`.
    ///
    /// `root` is one or more word-character segments, `channel` a word token,
    /// and `node-id` is `!` followed by lowercase hex digits. Returns `None`
    /// on any mismatch; that is normal bus traffic, not an error.
    pub fn parse(topic: &str) -> Option<TopicParts> {
        let segments: Vec<&str> = topic.split('/').collect();
        if segments.len() < 5 {
            return None;
        }
        let (root_segments, tail) = segments.split_at(segments.len() - 4);
        let [version, encoding, channel, node_id] = [tail[0], tail[1], tail[2], tail[3]];

        if root_segments.iter().any(|s| !is_word_token(s)) {
            return None;
        }
        if version.len() != 1 || !version.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        if !is_word_token(encoding) || !is_word_token(channel) {
            return None;
        }
        let hex = node_id.strip_prefix('!')?;
        if hex.is_empty() || !hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
            return None;
        }

        Some(TopicParts {
            root: root_segments.join("/"),
            encoding: encoding.to_string(),
            channel: channel.to_string(),
            node_id: node_id.to_string(),
        })
    }
}

fn is_word_token(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// One raw message delivered by the broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// One reply waiting to go out on the air.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingText {
    /// Node id the gateway should transmit as.
    pub from: u32,
    pub channel: u32,
    pub text: String,
}

/// Wire shape of an outbound `sendtext` frame.
#[derive(Serialize)]
struct SendTextFrame<'a> {
    from: u32,
    #[serde(rename = "type")]
    kind: &'a str,
    payload: &'a str,
    channel: u32,
}

impl OutgoingText {
    /// Serialize to the JSON frame the gateway expects.
    pub fn to_frame(&self) -> Result<String> {
        let frame = SendTextFrame {
            from: self.from,
            kind: "sendtext",
            payload: &self.text,
            channel: self.channel,
        };
        Ok(serde_json::to_string(&frame)?)
    }
}

/// Handle on the connected bus. Cheap to clone; clones share the client.
#[derive(Clone)]
pub struct MqttGateway {
    client: AsyncClient,
    root: String,
}

impl MqttGateway {
    /// Connect to the broker and spawn the reader task.
    ///
    /// Returns the gateway handle and the channel on which inbound messages
    /// arrive. The reader keeps polling through connection errors; rumqttc
    /// reconnects on the next poll and we resubscribe on every CONNACK.
    pub fn connect(cfg: &MqttConfig) -> (MqttGateway, mpsc::UnboundedReceiver<InboundMessage>) {
        let mut options = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
        options.set_keep_alive(Duration::from_secs(30));
        if !cfg.username.is_empty() {
            options.set_credentials(cfg.username.clone(), cfg.password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let (tx, rx) = mpsc::unbounded_channel();

        let gateway = MqttGateway {
            client: client.clone(),
            root: cfg.root.clone(),
        };
        let filter = format!("{}/2/json/#", cfg.root);

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to broker, subscribing {}", filter);
                        if let Err(e) = client.subscribe(filter.clone(), QoS::AtMostOnce).await {
                            warn!("Subscribe request failed: {e}");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let msg = InboundMessage {
                            topic: publish.topic,
                            payload: publish.payload.to_vec(),
                        };
                        if tx.send(msg).is_err() {
                            debug!("Tracker loop gone, stopping MQTT reader");
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT connection error: {e} (retrying)");
                        sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        (gateway, rx)
    }

    /// Publish one reply as a `sendtext` frame on `<root>/2/json/mqtt`.
    pub async fn publish_text(&self, msg: &OutgoingText) -> Result<()> {
        let topic = format!("{}/2/json/mqtt", self.root);
        let frame = msg.to_frame()?;
        self.client
            .publish(topic, QoS::AtMostOnce, false, frame)
            .await?;
        Ok(())
    }
}
