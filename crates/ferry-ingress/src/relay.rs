//! Statuses-topic relay.
//!
//! Consumes the statuses topic and mirrors each transition onto the
//! upstream provider's deployment record. Bad envelopes are dropped with
//! an error log and their offset stored, so one unverifiable message can
//! never wedge the relay. Upstream posting failures are logged and the
//! loop continues; the bus retains the authoritative stream.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

use ferry_core::bus::{ConsumedMessage, DualClient};
use ferry_core::protocol::envelope;
use ferry_core::upstream::StatusPoster;
use ferry_core::DeploymentStatus;

/// Opens one status frame and posts it upstream.
///
/// Envelope and posting failures are logged, not propagated; the relay
/// treats every frame as handled once this returns.
pub async fn relay_frame(frame: &[u8], key: &[u8], poster: &dyn StatusPoster) {
    let status = match envelope::open::<DeploymentStatus>(frame, key) {
        Ok(status) => status,
        Err(err) => {
            error!(error = %err, "dropping unverifiable status message");
            return;
        }
    };

    info!(
        delivery_id = %status.delivery_id,
        state = %status.state(),
        "relaying deployment status upstream"
    );

    if let Err(err) = poster.post(&status).await {
        error!(
            error = %err,
            delivery_id = %status.delivery_id,
            "unable to post deployment status upstream"
        );
    }
}

/// Runs the relay until the delivery channel closes.
pub async fn relay_loop(
    bus: Arc<DualClient>,
    mut rx: mpsc::Receiver<ConsumedMessage>,
    poster: Arc<dyn StatusPoster>,
) {
    info!("starting status relay loop");

    while let Some(msg) = rx.recv().await {
        relay_frame(&msg.payload, bus.signature_key(), poster.as_ref()).await;
        if let Err(err) = bus.store_offset(&msg) {
            error!(error = %err, offset = msg.offset, "unable to store status offset");
        }
    }

    info!("delivery channel closed; status relay loop exiting");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use ferry_core::protocol::{DeploymentState, DeploymentStatus};
    use ferry_core::upstream::UpstreamError;

    use super::*;

    struct RecordingPoster {
        posted: Mutex<Vec<DeploymentStatus>>,
    }

    #[async_trait]
    impl StatusPoster for RecordingPoster {
        async fn post(&self, status: &DeploymentStatus) -> Result<(), UpstreamError> {
            self.posted.lock().unwrap().push(status.clone());
            Ok(())
        }
    }

    const KEY: &[u8] = b"relay-key";

    fn status() -> DeploymentStatus {
        DeploymentStatus {
            deployment: None,
            delivery_id: "d-9".to_owned(),
            state: DeploymentState::Success as i32,
            description: "done".to_owned(),
        }
    }

    #[tokio::test]
    async fn valid_frame_is_posted() {
        let poster = RecordingPoster {
            posted: Mutex::new(Vec::new()),
        };
        let frame = envelope::seal(&status(), KEY);

        relay_frame(&frame, KEY, &poster).await;

        let posted = poster.posted.lock().unwrap();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].delivery_id, "d-9");
    }

    #[tokio::test]
    async fn tampered_frame_is_dropped() {
        let poster = RecordingPoster {
            posted: Mutex::new(Vec::new()),
        };
        let mut frame = envelope::seal(&status(), KEY);
        let last = frame.len() - 1;
        frame[last] ^= 0x01;

        relay_frame(&frame, KEY, &poster).await;

        assert!(poster.posted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn wrong_key_frame_is_dropped() {
        let poster = RecordingPoster {
            posted: Mutex::new(Vec::new()),
        };
        let frame = envelope::seal(&status(), b"other-key");

        relay_frame(&frame, KEY, &poster).await;

        assert!(poster.posted.lock().unwrap().is_empty());
    }
}
