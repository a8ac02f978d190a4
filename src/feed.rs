//! Change Feed
//!
//! Durable LISTEN/NOTIFY subscription on the interface and peer
//! channels. The connection cycles Disconnected → Connecting →
//! Listening and drops back to Disconnected on any I/O error; there is
//! no terminal failure state while the daemon runs. Decoded events are
//! pushed into a bounded queue whose single consumer is the
//! reconciliation loop, preserving strict delivery order.

use sqlx::postgres::PgListener;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::store::model::{Interface, Peer};

/// A decoded row-change notification
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Interface {
        before: Option<Interface>,
        after: Option<Interface>,
    },
    Peer {
        before: Option<Peer>,
        after: Option<Peer>,
    },
}

#[derive(serde::Deserialize)]
struct RowDiff<T> {
    old: Option<T>,
    new: Option<T>,
}

/// Decode one notification payload into a typed event. The payload is
/// JSON `{old: row|null, new: row|null}` as produced by the row-diff
/// triggers.
pub fn decode_event(
    interface_channel: &str,
    peer_channel: &str,
    channel: &str,
    payload: &str,
) -> Result<ChangeEvent> {
    let malformed = |reason: String| Error::MalformedPayload {
        channel: channel.to_string(),
        reason,
    };

    if channel == interface_channel {
        let diff: RowDiff<Interface> =
            serde_json::from_str(payload).map_err(|e| malformed(e.to_string()))?;
        Ok(ChangeEvent::Interface {
            before: diff.old,
            after: diff.new,
        })
    } else if channel == peer_channel {
        let diff: RowDiff<Peer> =
            serde_json::from_str(payload).map_err(|e| malformed(e.to_string()))?;
        Ok(ChangeEvent::Peer {
            before: diff.old,
            after: diff.new,
        })
    } else {
        Err(malformed("unknown channel".to_string()))
    }
}

/// Long-lived subscription task feeding the reconciliation queue
pub struct ChangeFeed {
    database_url: String,
    interface_channel: String,
    peer_channel: String,
    keepalive: Duration,
    probe_timeout: Duration,
    retry_delay: Duration,
    tx: mpsc::Sender<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new(
        database_url: String,
        interface_channel: String,
        peer_channel: String,
        keepalive: Duration,
        probe_timeout: Duration,
        retry_delay: Duration,
        tx: mpsc::Sender<ChangeEvent>,
    ) -> Self {
        Self {
            database_url,
            interface_channel,
            peer_channel,
            keepalive,
            probe_timeout,
            retry_delay,
            tx,
        }
    }

    /// Run the connection loop until the consumer side of the queue is
    /// dropped. Connection errors are recovered internally with a
    /// fixed reconnect delay, never surfaced upward.
    pub async fn run(self) {
        loop {
            tracing::debug!("Change feed connecting");
            match self.listen_once().await {
                Ok(()) => {
                    tracing::info!("Change feed stopped");
                    return;
                }
                Err(e) => {
                    tracing::warn!("Change feed disconnected: {}", e);
                }
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    /// One Connecting → Listening cycle. Returns Ok on shutdown (queue
    /// closed) and Err on any connection failure. Subscriptions do not
    /// survive a connection replacement, so every cycle re-registers
    /// both channels.
    async fn listen_once(&self) -> Result<()> {
        let mut listener = PgListener::connect(&self.database_url).await?;
        listener
            .listen_all([
                self.interface_channel.as_str(),
                self.peer_channel.as_str(),
            ])
            .await?;
        tracing::info!(
            "Change feed listening on channels {:?} and {:?}",
            self.interface_channel,
            self.peer_channel
        );

        loop {
            match timeout(self.keepalive, listener.recv()).await {
                Ok(Ok(notification)) => {
                    let event = decode_event(
                        &self.interface_channel,
                        &self.peer_channel,
                        notification.channel(),
                        notification.payload(),
                    );
                    match event {
                        Ok(event) => {
                            if self.tx.send(event).await.is_err() {
                                // Consumer gone: shutdown.
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Dropping event: {}", e);
                        }
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    // Idle: probe for silent connection death.
                    self.probe(&mut listener).await?;
                }
            }
        }
    }

    /// Issue the keep-alive query on the subscription connection
    /// itself. A half-open LISTEN socket is only detectable there; any
    /// other connection can stay healthy while the subscription is
    /// dead.
    async fn probe(&self, listener: &mut PgListener) -> Result<()> {
        timeout(
            self.probe_timeout,
            sqlx::query("SELECT 1").execute(&mut *listener),
        )
        .await
        .map_err(|_| Error::Feed("keep-alive probe timed out".into()))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IFACE_ROW: &str = r#"{
        "id": 7, "server_name": "edge-1", "interface_name": "wg0",
        "private_key": "sec", "public_key": "pub", "listen_port": 51820,
        "address": "10.0.0.1/24", "dns": null, "mtu": null,
        "fw_mark": null, "table": null, "pre_up": null, "post_up": null,
        "pre_down": null, "post_down": null, "enabled": true,
        "ip_range": null, "public_endpoint": null, "client_dns": null,
        "client_allowed_ips": null, "client_persistent_keepalive": null
    }"#;

    #[test]
    fn test_decode_interface_update() {
        let payload = format!(r#"{{"old": {IFACE_ROW}, "new": {IFACE_ROW}}}"#);
        let event = decode_event("interface", "peer", "interface", &payload).unwrap();
        match event {
            ChangeEvent::Interface { before, after } => {
                assert_eq!(before.unwrap().id, 7);
                assert_eq!(after.unwrap().interface_name, "wg0");
            }
            _ => panic!("expected interface event"),
        }
    }

    #[test]
    fn test_decode_delete_has_no_after() {
        let payload = format!(r#"{{"old": {IFACE_ROW}, "new": null}}"#);
        let event = decode_event("interface", "peer", "interface", &payload).unwrap();
        match event {
            ChangeEvent::Interface { before, after } => {
                assert!(before.is_some());
                assert!(after.is_none());
            }
            _ => panic!("expected interface event"),
        }
    }

    #[test]
    fn test_decode_peer_insert() {
        let payload = r#"{"old": null, "new": {
            "id": 3, "interface_id": 7, "name": "alice",
            "description": null, "public_key": "pk", "preshared_key": null,
            "allowed_ips": null, "address": "10.0.0.2",
            "persistent_keepalive": 25, "enabled": true
        }}"#;
        let event = decode_event("interface", "peer", "peer", payload).unwrap();
        match event {
            ChangeEvent::Peer { before, after } => {
                assert!(before.is_none());
                assert_eq!(after.unwrap().interface_id, 7);
            }
            _ => panic!("expected peer event"),
        }
    }

    #[test]
    fn test_malformed_payload_is_an_error_not_a_panic() {
        assert!(matches!(
            decode_event("interface", "peer", "interface", "not json"),
            Err(Error::MalformedPayload { .. })
        ));
        assert!(matches!(
            decode_event("interface", "peer", "somewhere-else", "{}"),
            Err(Error::MalformedPayload { .. })
        ));
    }
}
