//! Outbound status frames.

use chrono::Utc;
use serde_json::{Value, json};
use tether_core::{StatusProjection, StatusUpdate};
use tether_session::StatusResponse;

/// Kind of the first frame on every socket.
pub const SNAPSHOT_KIND: &str = "status.snapshot";

/// First frame: the projection as of subscribe time.
pub fn snapshot_frame(projection: StatusProjection) -> Value {
    json!({
        "kind": SNAPSHOT_KIND,
        "payload": StatusResponse::from(projection),
        "timestamp": Utc::now(),
    })
}

/// One published update.
pub fn update_frame(update: &StatusUpdate) -> Value {
    json!({
        "kind": update.kind,
        "payload": update.payload,
        "timestamp": update.timestamp,
    })
}

#[cfg(test)]
mod tests {
    use tether_core::{
        ConnectionState, Identity, PairingKind, PairingPayload, StatusEventKind, UpdatePayload,
    };

    use super::*;

    #[test]
    fn snapshot_of_fresh_identity() {
        let frame = snapshot_frame(StatusProjection::initial(Identity::from("op-1")));
        assert_eq!(frame["kind"], "status.snapshot");
        assert_eq!(frame["payload"]["identity"], "op-1");
        assert_eq!(frame["payload"]["state"], "idle");
        assert!(frame["timestamp"].is_string());
    }

    #[test]
    fn pairing_update_carries_payload() {
        let update = StatusUpdate {
            identity: Identity::from("op-1"),
            kind: StatusEventKind::Pairing,
            payload: UpdatePayload {
                state: ConnectionState::AwaitingPairing,
                pairing: Some(PairingPayload {
                    kind: PairingKind::Code,
                    value: "ABCD-1234".into(),
                }),
                message: None,
                cause: None,
            },
            timestamp: Utc::now(),
        };
        let frame = update_frame(&update);
        assert_eq!(frame["kind"], "pairing");
        assert_eq!(frame["payload"]["state"], "awaiting_pairing");
        assert_eq!(frame["payload"]["pairing"]["kind"], "code");
        assert_eq!(frame["payload"]["pairing"]["value"], "ABCD-1234");
        assert!(frame.get("identity").is_none());
    }
}
