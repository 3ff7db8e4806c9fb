//! Ringtone / connect-cue synchronization.
//!
//! An advisory observer of the snapshot stream. Nothing here may alter or
//! block the state machine; a sink failure (audio not yet permitted by
//! the platform, for instance) is logged and forgotten.

use super::machine::CallSnapshot;
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Platform audio/vibration hooks supplied by the embedding application.
#[async_trait]
pub trait CallCueSink: Send + Sync {
    async fn start_ringing(&self) -> Result<(), anyhow::Error>;

    async fn stop_ringing(&self) -> Result<(), anyhow::Error>;

    /// One-shot cue when remote media first appears.
    async fn play_connected(&self) -> Result<(), anyhow::Error>;
}

/// Drives a [`CallCueSink`] from a machine's snapshot stream.
///
/// The ringing cue plays while the phase is calling or incoming and no
/// remote media has arrived; the connect cue plays exactly once per
/// attempt when remote media first appears; everything stops on `Ended`.
pub struct NotificationSynchronizer;

impl NotificationSynchronizer {
    pub fn spawn(
        mut snapshots: watch::Receiver<CallSnapshot>,
        sink: Arc<dyn CallCueSink>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ringing = false;
            let mut connected_generation: Option<u64> = None;
            loop {
                let snapshot = snapshots.borrow_and_update().clone();

                let want_ring = snapshot.phase.is_ringing() && snapshot.remote_media.is_none();
                if want_ring && !ringing {
                    if let Err(e) = sink.start_ringing().await {
                        warn!(target: "Call/Notify", "ringing cue failed (advisory): {e:?}");
                    }
                    ringing = true;
                } else if !want_ring && ringing {
                    if let Err(e) = sink.stop_ringing().await {
                        warn!(target: "Call/Notify", "stopping ringing cue failed (advisory): {e:?}");
                    }
                    ringing = false;
                }

                if snapshot.remote_media.is_some()
                    && !snapshot.phase.is_ended()
                    && connected_generation != Some(snapshot.generation)
                {
                    connected_generation = Some(snapshot.generation);
                    debug!(target: "Call/Notify", "remote media present, playing connect cue");
                    if let Err(e) = sink.play_connected().await {
                        warn!(target: "Call/Notify", "connect cue failed (advisory): {e:?}");
                    }
                }

                if snapshots.changed().await.is_err() {
                    // Machine gone; silence whatever is still playing.
                    if ringing {
                        let _ = sink.stop_ringing().await;
                    }
                    return;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::record::CallId;
    use super::super::state::CallPhase;
    use super::*;
    use crate::media::{MediaTrack, RemoteMedia, TrackKind};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<&'static str>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CallCueSink for RecordingSink {
        async fn start_ringing(&self) -> Result<(), anyhow::Error> {
            self.events.lock().unwrap().push("ring");
            if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(anyhow::anyhow!("audio not permitted"));
            }
            Ok(())
        }

        async fn stop_ringing(&self) -> Result<(), anyhow::Error> {
            self.events.lock().unwrap().push("stop");
            Ok(())
        }

        async fn play_connected(&self) -> Result<(), anyhow::Error> {
            self.events.lock().unwrap().push("connected");
            Ok(())
        }
    }

    fn calling_snapshot(generation: u64) -> CallSnapshot {
        CallSnapshot {
            phase: CallPhase::Calling {
                call_id: CallId::new("CALL1"),
            },
            generation,
            ..Default::default()
        }
    }

    fn live_snapshot(generation: u64) -> CallSnapshot {
        CallSnapshot {
            phase: CallPhase::InCall {
                call_id: CallId::new("CALL1"),
                connected_at: chrono::Utc::now(),
            },
            remote_media: Some(RemoteMedia {
                tracks: vec![MediaTrack {
                    id: "remote-audio".into(),
                    kind: TrackKind::Audio,
                }],
            }),
            generation,
            ..Default::default()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_rings_then_connects_once() {
        let (tx, rx) = watch::channel(CallSnapshot::default());
        let sink = Arc::new(RecordingSink::default());
        let task = NotificationSynchronizer::spawn(rx, Arc::clone(&sink) as Arc<dyn CallCueSink>);

        tx.send_replace(calling_snapshot(1));
        settle().await;
        tx.send_replace(live_snapshot(1));
        settle().await;
        // A redelivered live snapshot of the same attempt must not replay
        // the connect cue.
        tx.send_replace(live_snapshot(1));
        settle().await;

        assert_eq!(sink.events(), vec!["ring", "stop", "connected"]);
        task.abort();
    }

    #[tokio::test]
    async fn test_stops_on_ended() {
        let (tx, rx) = watch::channel(CallSnapshot::default());
        let sink = Arc::new(RecordingSink::default());
        let task = NotificationSynchronizer::spawn(rx, Arc::clone(&sink) as Arc<dyn CallCueSink>);

        tx.send_replace(calling_snapshot(1));
        settle().await;
        tx.send_replace(CallSnapshot {
            phase: CallPhase::Ended {
                call_id: Some(CallId::new("CALL1")),
                reason: super::super::state::CallEndReason::RemoteHangup,
                ended_at: chrono::Utc::now(),
            },
            generation: 1,
            ..Default::default()
        });
        settle().await;

        assert_eq!(sink.events(), vec!["ring", "stop"]);
        task.abort();
    }

    /// Sink failures never propagate; the synchronizer keeps following
    /// the snapshot stream.
    #[tokio::test]
    async fn test_sink_failure_is_advisory() {
        let (tx, rx) = watch::channel(CallSnapshot::default());
        let sink = Arc::new(RecordingSink::default());
        sink.fail.store(true, std::sync::atomic::Ordering::Relaxed);
        let task = NotificationSynchronizer::spawn(rx, Arc::clone(&sink) as Arc<dyn CallCueSink>);

        tx.send_replace(calling_snapshot(1));
        settle().await;
        tx.send_replace(live_snapshot(1));
        settle().await;

        // The failed ring did not stop the connect cue from playing.
        assert!(sink.events().contains(&"connected"));
        task.abort();
    }

    /// A second attempt gets its own connect cue.
    #[tokio::test]
    async fn test_new_attempt_replays_connect_cue() {
        let (tx, rx) = watch::channel(CallSnapshot::default());
        let sink = Arc::new(RecordingSink::default());
        let task = NotificationSynchronizer::spawn(rx, Arc::clone(&sink) as Arc<dyn CallCueSink>);

        tx.send_replace(live_snapshot(1));
        settle().await;
        tx.send_replace(CallSnapshot::default());
        settle().await;
        tx.send_replace(live_snapshot(2));
        settle().await;

        assert_eq!(
            sink.events()
                .iter()
                .filter(|e| **e == "connected")
                .count(),
            2
        );
        task.abort();
    }
}
