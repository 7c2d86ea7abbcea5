use crate::*;

use async_trait::async_trait;
use std::future::Future;
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};
use tracing::warn;

/// Broadcast bus collaborator. Transport is deliberately abstract; the core
/// only needs fan-out of signed envelopes and optional peer targeting.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn broadcast(&self, envelope: &Envelope) -> Result<(), Error>;
    async fn send_to(&self, peer_id: &str, envelope: &Envelope) -> Result<(), Error>;
}

/// Frames the relay server sends to clients.
///
/// Application frames are envelopes with a relay-attached `from_peer_id`.
/// That peer id is used for scoring only; signature verification always runs
/// against the in-envelope sender.
#[derive(Debug, Clone)]
pub enum ServerFrame {
    Welcome { peer_id: String, client_count: u64 },
    PeerJoined { peer_id: String },
    PeerLeft { peer_id: String },
    App {
        envelope: Envelope,
        from_peer_id: Option<String>,
    },
}

impl ServerFrame {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|_| Error::ValidationError("relay frame is not JSON".to_string()))?;

        let frame_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
        match frame_type {
            "welcome" => Ok(ServerFrame::Welcome {
                peer_id: string_field(&value, "peer_id")?,
                client_count: value
                    .get("client_count")
                    .and_then(|count| count.as_u64())
                    .unwrap_or(0),
            }),
            "peer:joined" => Ok(ServerFrame::PeerJoined {
                peer_id: string_field(&value, "peer_id")?,
            }),
            "peer:left" => Ok(ServerFrame::PeerLeft {
                peer_id: string_field(&value, "peer_id")?,
            }),
            _ => {
                let from_peer_id = value
                    .get("from_peer_id")
                    .and_then(|peer| peer.as_str())
                    .map(String::from);
                let envelope: Envelope = serde_json::from_value(value).map_err(|_| {
                    Error::ValidationError("unrecognized relay frame".to_string())
                })?;
                Ok(ServerFrame::App {
                    envelope,
                    from_peer_id,
                })
            }
        }
    }
}

fn string_field(value: &serde_json::Value, field: &str) -> Result<String, Error> {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| Error::ValidationError(format!("relay frame is missing {}", field)))
}

/// Frames a client sends to the relay server.
#[derive(Debug)]
pub enum ClientFrame<'a> {
    Broadcast(&'a Envelope),
    P2p {
        target_peer_id: &'a str,
        envelope: &'a Envelope,
    },
}

impl ClientFrame<'_> {
    pub fn to_json(&self) -> String {
        match self {
            ClientFrame::Broadcast(envelope) => serde_json::to_string(envelope)
                .expect("prestige: envelope cannot fail to serialize"),
            ClientFrame::P2p {
                target_peer_id,
                envelope,
            } => serde_json::to_string(&serde_json::json!({
                "type": "p2p",
                "target_peer_id": target_peer_id,
                "payload": envelope,
            }))
            .expect("prestige: envelope cannot fail to serialize"),
        }
    }
}

/// In-memory relay: every broadcast is delivered to every subscriber along
/// with the sending node's peer id. Multiple gossip nodes share one bus in
/// tests by cloning it with their own peer ids.
#[derive(Clone)]
pub struct MemRelay {
    peer_id: String,
    bus: broadcast::Sender<(String, Envelope)>,
}

impl MemRelay {
    pub fn new(peer_id: impl Into<String>) -> Self {
        let (bus, _) = broadcast::channel(256);
        MemRelay {
            peer_id: peer_id.into(),
            bus,
        }
    }

    /// Another handle on the same bus under a different peer id.
    pub fn peer(&self, peer_id: impl Into<String>) -> Self {
        MemRelay {
            peer_id: peer_id.into(),
            bus: self.bus.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(String, Envelope)> {
        self.bus.subscribe()
    }
}

#[async_trait]
impl Relay for MemRelay {
    async fn broadcast(&self, envelope: &Envelope) -> Result<(), Error> {
        // No receivers is fine; the bus just drops the message
        let _ = self.bus.send((self.peer_id.clone(), envelope.clone()));
        Ok(())
    }

    async fn send_to(&self, _peer_id: &str, envelope: &Envelope) -> Result<(), Error> {
        let _ = self.bus.send((self.peer_id.clone(), envelope.clone()));
        Ok(())
    }
}

/// Exponential backoff for relay (re)connection.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &PrestigeConfig) -> Self {
        ReconnectPolicy {
            max_attempts: config.max_reconnect_attempts,
            ..ReconnectPolicy::default()
        }
    }
}

/// Drive a connect attempt under the policy, doubling the delay after each
/// failure up to the cap, and giving up after `max_attempts`.
pub async fn connect_with_backoff<T, F, Fut>(
    policy: &ReconnectPolicy,
    mut connect: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut delay_ms = policy.base_delay_ms;
    let mut last_error = Error::RelayUnavailable("no connection attempts made".to_string());

    for attempt in 1..=policy.max_attempts {
        match connect().await {
            Ok(connection) => return Ok(connection),
            Err(error) => {
                warn!(attempt, error = %error, "relay connection failed");
                last_error = error;
            }
        }
        if attempt < policy.max_attempts {
            sleep(Duration::from_millis(delay_ms)).await;
            delay_ms = (delay_ms * 2).min(policy.max_delay_ms);
        }
    }

    Err(Error::RelayUnavailable(format!(
        "gave up after {} attempts: {}",
        policy.max_attempts, last_error
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn envelope() -> Envelope {
        let (secret, public) = generate_keypair();
        Envelope::sign(
            &secret,
            public,
            MessageType::Vote,
            serde_json::json!({"ballot_id": "b-1"}),
            1_000,
        )
    }

    #[test]
    fn server_frames_parse() {
        let frame =
            ServerFrame::parse(r#"{"type": "welcome", "peer_id": "p-9", "client_count": 4}"#)
                .unwrap();
        assert!(matches!(frame, ServerFrame::Welcome { ref peer_id, client_count: 4 } if peer_id == "p-9"));

        let frame = ServerFrame::parse(r#"{"type": "peer:left", "peer_id": "p-9"}"#).unwrap();
        assert!(matches!(frame, ServerFrame::PeerLeft { ref peer_id } if peer_id == "p-9"));

        assert!(ServerFrame::parse("not json").is_err());
        assert!(ServerFrame::parse(r#"{"type": "welcome"}"#).is_err());
    }

    #[test]
    fn app_frames_round_trip_with_relay_peer_id() {
        let envelope = envelope();
        let mut value = serde_json::to_value(&envelope).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("from_peer_id".to_string(), "p-3".into());

        let frame = ServerFrame::parse(&value.to_string()).unwrap();
        match frame {
            ServerFrame::App {
                envelope: parsed,
                from_peer_id,
            } => {
                assert_eq!(from_peer_id.as_deref(), Some("p-3"));
                parsed.verify().unwrap();
            }
            other => panic!("expected app frame, got {:?}", other),
        }
    }

    #[test]
    fn client_frames_serialize() {
        let envelope = envelope();
        let broadcast_json = ClientFrame::Broadcast(&envelope).to_json();
        let value: serde_json::Value = serde_json::from_str(&broadcast_json).unwrap();
        assert_eq!(value["type"], "vote");

        let p2p_json = ClientFrame::P2p {
            target_peer_id: "p-2",
            envelope: &envelope,
        }
        .to_json();
        let value: serde_json::Value = serde_json::from_str(&p2p_json).unwrap();
        assert_eq!(value["type"], "p2p");
        assert_eq!(value["target_peer_id"], "p-2");
        assert_eq!(value["payload"]["type"], "vote");
    }

    #[tokio::test]
    async fn mem_relay_delivers_to_subscribers() {
        let relay = MemRelay::new("p-1");
        let mut receiver = relay.subscribe();

        let envelope = envelope();
        relay.broadcast(&envelope).await.unwrap();

        let (from, received) = receiver.recv().await.unwrap();
        assert_eq!(from, "p-1");
        assert_eq!(received.timestamp_ms, envelope.timestamp_ms);
    }

    #[tokio::test]
    async fn backoff_retries_until_success() {
        let attempts = AtomicU32::new(0);
        let policy = ReconnectPolicy {
            base_delay_ms: 1,
            max_delay_ms: 4,
            max_attempts: 10,
        };

        let connected = connect_with_backoff(&policy, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt < 3 {
                    Err(Error::RelayUnavailable("offline".to_string()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(connected, 3);
    }

    #[tokio::test]
    async fn backoff_gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let policy = ReconnectPolicy {
            base_delay_ms: 1,
            max_delay_ms: 2,
            max_attempts: 3,
        };

        let result: Result<(), Error> = connect_with_backoff(&policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::RelayUnavailable("offline".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(Error::RelayUnavailable(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
