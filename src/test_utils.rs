//! In-memory collaborators for tests and embedding-side test benches.
//!
//! [`MemoryRecordStore`] reproduces the delivery quirks this crate is
//! built to survive: the subscription replays the current row on attach
//! (the at-least-once echo), notifications can be silently dropped, and
//! writes can be made to fail on demand. The transport and media mocks
//! are scriptable from tests via their handles.

use crate::call::{
    CallId, CallMachine, CallRecord, CallSnapshot, CallStatus, IceCandidate, ParticipantId,
    RecordChange, RecordFilter, RecordOrder, RecordPatch, RecordStore, RoleContext, RouteHint,
    SessionDescription, StoreError,
};
use crate::config::CallConfig;
use crate::media::{
    LocalMedia, MediaConstraints, MediaError, MediaSource, MediaTrack, RemoteMedia, TrackKind,
};
use crate::transport::{
    CallTransport, ConnectionState, IceConnectionState, TransportEvent, TransportFactory,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Shared, ordered log of collaborator operations, for asserting ordering
/// guarantees (terminal write before resource release, for instance).
#[derive(Debug, Clone, Default)]
pub struct OpLog(Arc<Mutex<Vec<String>>>);

impl OpLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, op: impl Into<String>) {
        self.0.lock().unwrap().push(op.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Index of the first entry starting with `prefix`.
    pub fn index_of(&self, prefix: &str) -> Option<usize> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .position(|op| op.starts_with(prefix))
    }

    pub fn count_of(&self, prefix: &str) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|op| op.starts_with(prefix))
            .count()
    }
}

struct Subscriber {
    filter: RecordFilter,
    tx: mpsc::Sender<RecordChange>,
}

/// In-memory [`RecordStore`] with realistic delivery semantics.
#[derive(Default)]
pub struct MemoryRecordStore {
    rows: Mutex<HashMap<CallId, CallRecord>>,
    subscribers: Mutex<Vec<Subscriber>>,
    /// When false, change notifications are silently dropped (the
    /// best-effort stream failing), leaving polling as the only path.
    realtime: AtomicBool,
    fail_writes: AtomicUsize,
    ops: OpLog,
}

impl MemoryRecordStore {
    pub fn new() -> Arc<Self> {
        Self::with_log(OpLog::new())
    }

    pub fn with_log(ops: OpLog) -> Arc<Self> {
        Arc::new(Self {
            realtime: AtomicBool::new(true),
            ops,
            ..Default::default()
        })
    }

    pub fn set_realtime(&self, enabled: bool) {
        self.realtime.store(enabled, Ordering::Relaxed);
    }

    /// Make the next `count` writes fail with a store error.
    pub fn fail_next_writes(&self, count: usize) {
        self.fail_writes.store(count, Ordering::Relaxed);
    }

    pub fn get(&self, id: &CallId) -> Option<CallRecord> {
        self.rows.lock().unwrap().get(id).cloned()
    }

    pub fn ops(&self) -> &OpLog {
        &self.ops
    }

    fn take_write_failure(&self) -> bool {
        self.fail_writes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                (n > 0).then(|| n - 1)
            })
            .is_ok()
    }

    fn notify(&self, previous: Option<CallRecord>, current: &CallRecord) {
        if !self.realtime.load(Ordering::Relaxed) {
            return;
        }
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in subscribers.iter() {
            let matches_now = subscriber.filter.matches(current);
            let matched_before = previous
                .as_ref()
                .is_some_and(|p| subscriber.filter.matches(p));
            if matches_now || matched_before {
                // Best-effort, like the real stream: a full channel drops
                // the delivery on the floor.
                let _ = subscriber.tx.try_send(RecordChange {
                    previous: previous.clone(),
                    current: current.clone(),
                });
            }
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, record: &CallRecord) -> Result<CallId, StoreError> {
        if self.take_write_failure() {
            return Err(StoreError::Write("injected create failure".into()));
        }
        {
            let mut rows = self.rows.lock().unwrap();
            if rows.contains_key(&record.id) {
                return Err(StoreError::Write(format!("duplicate id {}", record.id)));
            }
            rows.insert(record.id.clone(), record.clone());
        }
        self.ops.push(format!("store.create {}", record.id));
        self.notify(None, record);
        Ok(record.id.clone())
    }

    async fn update(&self, id: &CallId, patch: RecordPatch) -> Result<(), StoreError> {
        if self.take_write_failure() {
            return Err(StoreError::Write("injected update failure".into()));
        }
        let is_terminal_write = patch.status == Some(CallStatus::Ended) || patch.ended_at.is_some();
        let (previous, current) = {
            let mut rows = self.rows.lock().unwrap();
            let row = rows
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            let previous = row.clone();
            patch.apply_to(row);
            (previous, row.clone())
        };
        if is_terminal_write {
            self.ops.push(format!("store.terminal {id}"));
        } else {
            self.ops.push(format!("store.update {id}"));
        }
        self.notify(Some(previous), &current);
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: RecordFilter,
    ) -> Result<mpsc::Receiver<RecordChange>, StoreError> {
        let (tx, rx) = mpsc::channel(32);
        // The at-least-once echo: existing matching rows are replayed as
        // if they just changed, with no previous snapshot.
        for row in self.rows.lock().unwrap().values() {
            if filter.matches(row) {
                let _ = tx.try_send(RecordChange {
                    previous: None,
                    current: row.clone(),
                });
            }
        }
        self.subscribers
            .lock()
            .unwrap()
            .push(Subscriber { filter, tx });
        Ok(rx)
    }

    async fn query(
        &self,
        filter: RecordFilter,
        limit: usize,
        order: RecordOrder,
    ) -> Result<Vec<CallRecord>, StoreError> {
        let mut rows: Vec<CallRecord> = self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        if order == RecordOrder::CreatedDesc {
            rows.reverse();
        }
        rows.truncate(limit);
        Ok(rows)
    }
}

/// Scriptable media source.
#[derive(Default)]
pub struct MockMediaSource {
    ops: OpLog,
    fail_acquire: Mutex<Option<MediaError>>,
    fail_release: AtomicBool,
    acquired: AtomicUsize,
    released: AtomicUsize,
    toggles: Mutex<Vec<(TrackKind, bool)>>,
}

impl MockMediaSource {
    pub fn new() -> Arc<Self> {
        Self::with_log(OpLog::new())
    }

    pub fn with_log(ops: OpLog) -> Arc<Self> {
        Arc::new(Self {
            ops,
            ..Default::default()
        })
    }

    /// Make every acquire fail with `error` until cleared.
    pub fn fail_acquire_with(&self, error: MediaError) {
        *self.fail_acquire.lock().unwrap() = Some(error);
    }

    pub fn clear_acquire_failure(&self) {
        *self.fail_acquire.lock().unwrap() = None;
    }

    pub fn fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::Relaxed);
    }

    pub fn acquired_count(&self) -> usize {
        self.acquired.load(Ordering::Relaxed)
    }

    pub fn released_count(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }

    pub fn toggles(&self) -> Vec<(TrackKind, bool)> {
        self.toggles.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        if let Some(error) = self.fail_acquire.lock().unwrap().clone() {
            return Err(error);
        }
        let n = self.acquired.fetch_add(1, Ordering::Relaxed);
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack {
                id: format!("local-audio-{n}"),
                kind: TrackKind::Audio,
            });
        }
        if constraints.video {
            tracks.push(MediaTrack {
                id: format!("local-video-{n}"),
                kind: TrackKind::Video,
            });
        }
        self.ops.push("media.acquire");
        Ok(LocalMedia { tracks })
    }

    async fn set_track_enabled(&self, _media: &LocalMedia, kind: TrackKind, enabled: bool) {
        self.toggles.lock().unwrap().push((kind, enabled));
    }

    async fn release(&self, _media: LocalMedia) -> Result<(), anyhow::Error> {
        self.released.fetch_add(1, Ordering::Relaxed);
        self.ops.push("media.release");
        if self.fail_release.load(Ordering::Relaxed) {
            return Err(anyhow::anyhow!("injected release failure"));
        }
        Ok(())
    }
}

static SDP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Scriptable transport handle. Tests drive negotiation progress by
/// emitting [`TransportEvent`]s through [`emit`](Self::emit).
pub struct MockCallTransport {
    label: String,
    ops: OpLog,
    events: mpsc::Sender<TransportEvent>,
    connection: Mutex<ConnectionState>,
    ice: Mutex<IceConnectionState>,
    local_descriptions: Mutex<Vec<SessionDescription>>,
    remote_description: Mutex<Option<SessionDescription>>,
    added_candidates: Mutex<Vec<IceCandidate>>,
    closed: AtomicBool,
    fail_negotiation: AtomicBool,
}

impl MockCallTransport {
    /// Inject a transport event, updating the readable states on the way.
    pub async fn emit(&self, event: TransportEvent) {
        match &event {
            TransportEvent::ConnectionStateChanged(state) => {
                *self.connection.lock().unwrap() = *state;
            }
            TransportEvent::IceStateChanged(state) => {
                *self.ice.lock().unwrap() = *state;
            }
            _ => {}
        }
        let _ = self.events.send(event).await;
    }

    /// Shorthand for "ICE connected and remote media arrived".
    pub async fn go_live(&self) {
        self.emit(TransportEvent::IceStateChanged(
            IceConnectionState::Connected,
        ))
        .await;
        self.emit(TransportEvent::ConnectionStateChanged(
            ConnectionState::Connected,
        ))
        .await;
        self.emit(TransportEvent::TrackReceived(remote_media())).await;
    }

    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.added_candidates.lock().unwrap().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.lock().unwrap().clone()
    }

    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.local_descriptions.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn fail_negotiation(&self, fail: bool) {
        self.fail_negotiation.store(fail, Ordering::Relaxed);
    }

    fn check_negotiation(&self) -> Result<(), anyhow::Error> {
        if self.fail_negotiation.load(Ordering::Relaxed) {
            return Err(anyhow::anyhow!("injected negotiation failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl CallTransport for MockCallTransport {
    async fn create_offer(&self) -> Result<SessionDescription, anyhow::Error> {
        self.check_negotiation()?;
        let n = SDP_COUNTER.fetch_add(1, Ordering::Relaxed);
        Ok(SessionDescription::offer(format!("v=0 mock-offer-{n}")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, anyhow::Error> {
        self.check_negotiation()?;
        let n = SDP_COUNTER.fetch_add(1, Ordering::Relaxed);
        Ok(SessionDescription::answer(format!("v=0 mock-answer-{n}")))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), anyhow::Error> {
        self.check_negotiation()?;
        self.local_descriptions.lock().unwrap().push(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), anyhow::Error> {
        self.check_negotiation()?;
        *self.remote_description.lock().unwrap() = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), anyhow::Error> {
        self.added_candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.connection.lock().unwrap()
    }

    fn ice_state(&self) -> IceConnectionState {
        *self.ice.lock().unwrap()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        *self.connection.lock().unwrap() = ConnectionState::Closed;
        self.ops.push(format!("transport.close {}", self.label));
    }
}

/// Factory handing out [`MockCallTransport`]s and keeping them reachable
/// for test scripting.
pub struct MockTransportFactory {
    label: String,
    ops: OpLog,
    created: Mutex<Vec<Arc<MockCallTransport>>>,
    fail_create: AtomicBool,
}

impl MockTransportFactory {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Self::with_log(label, OpLog::new())
    }

    pub fn with_log(label: impl Into<String>, ops: OpLog) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            ops,
            created: Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
        })
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::Relaxed);
    }

    /// The transport created for the most recent call attempt.
    pub fn latest(&self) -> Option<Arc<MockCallTransport>> {
        self.created.lock().unwrap().last().cloned()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create_transport(
        &self,
        _local_media: &LocalMedia,
    ) -> Result<(Arc<dyn CallTransport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        if self.fail_create.load(Ordering::Relaxed) {
            return Err(anyhow::anyhow!("injected transport construction failure"));
        }
        let (tx, rx) = mpsc::channel(16);
        let transport = Arc::new(MockCallTransport {
            label: self.label.clone(),
            ops: self.ops.clone(),
            events: tx,
            connection: Mutex::new(ConnectionState::New),
            ice: Mutex::new(IceConnectionState::New),
            local_descriptions: Mutex::new(Vec::new()),
            remote_description: Mutex::new(None),
            added_candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_negotiation: AtomicBool::new(false),
        });
        self.created.lock().unwrap().push(Arc::clone(&transport));
        Ok((transport, rx))
    }
}

pub fn remote_media() -> RemoteMedia {
    RemoteMedia {
        tracks: vec![
            MediaTrack {
                id: "remote-audio".into(),
                kind: TrackKind::Audio,
            },
            MediaTrack {
                id: "remote-video".into(),
                kind: TrackKind::Video,
            },
        ],
    }
}

pub fn parent_context() -> RoleContext {
    RoleContext {
        route: RouteHint::Neutral,
        authenticated_session: true,
        child_token: false,
    }
}

pub fn child_context() -> RoleContext {
    RoleContext {
        route: RouteHint::ChildOnly,
        authenticated_session: false,
        child_token: true,
    }
}

/// One endpoint wired to mocks, sharing the store (and optionally the op
/// log) with its peer.
pub struct TestEndpoint {
    pub machine: Arc<CallMachine>,
    pub transports: Arc<MockTransportFactory>,
    pub media: Arc<MockMediaSource>,
}

impl TestEndpoint {
    /// Build an endpoint. Must run inside a tokio runtime.
    pub fn new(
        store: Arc<MemoryRecordStore>,
        ctx: &RoleContext,
        local: &str,
        config: CallConfig,
        ops: OpLog,
    ) -> Self {
        let transports = MockTransportFactory::with_log(local, ops.clone());
        let media = MockMediaSource::with_log(ops);
        let machine = CallMachine::new(
            ctx,
            ParticipantId::new(local),
            store as Arc<dyn RecordStore>,
            Arc::clone(&transports) as Arc<dyn TransportFactory>,
            Arc::clone(&media) as Arc<dyn MediaSource>,
            config,
        )
        .expect("role must resolve for test endpoints");
        Self {
            machine,
            transports,
            media,
        }
    }

    pub fn transport(&self) -> Arc<MockCallTransport> {
        self.transports
            .latest()
            .expect("no transport created yet for this endpoint")
    }
}

/// Wait until the machine's snapshot satisfies `pred`, or panic after two
/// seconds. Test helper.
pub async fn wait_for_snapshot(
    snapshots: &mut watch::Receiver<CallSnapshot>,
    what: &str,
    pred: impl Fn(&CallSnapshot) -> bool,
) -> CallSnapshot {
    let deadline = Duration::from_secs(2);
    let result = tokio::time::timeout(deadline, async {
        loop {
            {
                let snapshot = snapshots.borrow();
                if pred(&snapshot) {
                    return snapshot.clone();
                }
            }
            if snapshots.changed().await.is_err() {
                panic!("snapshot channel closed while waiting for {what}");
            }
        }
    })
    .await;
    match result {
        Ok(snapshot) => snapshot,
        Err(_) => panic!(
            "timed out waiting for {what}; last snapshot: {:?}",
            snapshots.borrow().clone()
        ),
    }
}
