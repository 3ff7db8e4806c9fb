//! The call-lifecycle orchestrator.
//!
//! One [`CallMachine`] per endpoint. The machine is logically
//! single-threaded: every mutation of [`CallSession`] happens behind one
//! lock, fed by the UI-facing methods and by the spawned observer pumps
//! (record changes, transport events, inbound watcher). Collaborators are
//! supplied as trait objects and never constructed here.

use super::candidates::{IceCandidateQueue, RemoteCursor};
use super::driver::{InboundWatcher, SignalingDriver};
use super::error::CallError;
use super::record::{CallId, CallRecord, CallStatus, ParticipantId, Role, SessionDescription};
use super::role::{self, RoleBinding, RoleContext};
use super::state::{CallEndReason, CallPhase, CallSession, CallTransition, InvalidTransition};
use super::store::{RecordChange, RecordStore};
use super::termination::TerminationDetector;
use crate::config::CallConfig;
use crate::media::{LocalMedia, MediaSource, RemoteMedia, TrackKind};
use crate::transport::{CallTransport, ConnectionState, TransportEvent, TransportFactory};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify, mpsc, watch};

/// Options for starting a call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Whether this is a video call.
    pub video: bool,
}

impl CallOptions {
    pub fn audio() -> Self {
        Self::default()
    }

    pub fn video() -> Self {
        Self { video: true }
    }
}

/// Read-only view published to the UI layer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CallSnapshot {
    pub phase: CallPhase,
    pub local_media: Option<LocalMedia>,
    pub remote_media: Option<RemoteMedia>,
    pub audio_muted: bool,
    pub video_off: bool,
    /// Bumped on every new call attempt; lets observers tell a fresh
    /// attempt from a redelivered snapshot of the previous one.
    pub generation: u64,
}

/// Per-attempt resources, torn down as a unit.
struct Attempt {
    transport: Arc<dyn CallTransport>,
    local_media: LocalMedia,
    remote_media: Option<RemoteMedia>,
    queue: IceCandidateQueue,
    remote_cursor: RemoteCursor,
    transport_connected: bool,
}

#[derive(Default)]
struct MachineState {
    session: CallSession,
    generation: u64,
    pending_inbound: Option<CallRecord>,
    attempt: Option<Attempt>,
    /// Whether a record-change pump is watching the current call id.
    watching_record: bool,
}

/// Orchestrates the call lifecycle for one endpoint.
pub struct CallMachine {
    binding: RoleBinding,
    local: ParticipantId,
    config: CallConfig,
    store: Arc<dyn RecordStore>,
    transports: Arc<dyn TransportFactory>,
    media: Arc<dyn MediaSource>,
    signaling: SignalingDriver,
    detector: TerminationDetector,
    state: Mutex<MachineState>,
    snapshot_tx: watch::Sender<CallSnapshot>,
    on_call_view: Arc<AtomicBool>,
    shutdown_notifier: Arc<Notify>,
}

impl CallMachine {
    /// Resolve the local role synchronously and bring the machine up. The
    /// inbound watcher starts immediately; no transport exists until a
    /// call attempt begins.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        ctx: &RoleContext,
        local: ParticipantId,
        store: Arc<dyn RecordStore>,
        transports: Arc<dyn TransportFactory>,
        media: Arc<dyn MediaSource>,
        config: CallConfig,
    ) -> Result<Arc<Self>, CallError> {
        let resolved = role::resolve(ctx)?;
        info!(target: "Call/Machine", "endpoint {local} resolved as {resolved}");

        let (snapshot_tx, _) = watch::channel(CallSnapshot::default());
        let machine = Arc::new(Self {
            binding: RoleBinding::new(resolved),
            signaling: SignalingDriver::new(Arc::clone(&store), resolved, local.clone()),
            detector: TerminationDetector::new(config.seen_ttl),
            state: Mutex::new(MachineState::default()),
            snapshot_tx,
            on_call_view: Arc::new(AtomicBool::new(false)),
            shutdown_notifier: Arc::new(Notify::new()),
            local,
            config,
            store,
            transports,
            media,
        });
        machine.spawn_inbound_pump();
        Ok(machine)
    }

    pub fn role(&self) -> Role {
        self.binding.role()
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local
    }

    /// Feed a late asynchronous confirmation of the local role. A
    /// disagreement with the synchronous resolution is logged and the
    /// binding kept; writes already issued are not migrated.
    pub fn note_role_confirmation(&self, confirmed: Role) {
        self.binding.note_confirmation(confirmed);
    }

    /// Observable {phase, media, flags} for the UI layer.
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Start an outgoing call to `remote`.
    ///
    /// Acquires media, constructs the transport, publishes the offer
    /// record and begins listening for its changes. Any failure reverts
    /// to `Idle` with the error surfaced to the caller.
    pub async fn start(
        self: &Arc<Self>,
        remote: ParticipantId,
        options: CallOptions,
    ) -> Result<CallId, CallError> {
        let mut st = self.state.lock().await;
        if !st.session.phase.is_idle() {
            return Err(CallError::Busy);
        }

        let mut constraints = self.config.constraints;
        if !options.video {
            constraints.video = false;
        }
        let local_media = self.media.acquire(constraints).await?;

        let (transport, events) = match self.transports.create_transport(&local_media).await {
            Ok(pair) => pair,
            Err(e) => {
                self.release_media(local_media).await;
                return Err(CallError::TransportInit(e.to_string()));
            }
        };

        let staged: Result<(CallRecord, mpsc::Receiver<RecordChange>), CallError> = async {
            let offer = transport
                .create_offer()
                .await
                .map_err(|e| CallError::TransportInit(e.to_string()))?;
            transport
                .set_local_description(offer.clone())
                .await
                .map_err(|e| CallError::TransportInit(e.to_string()))?;
            let record = self.signaling.new_offer_record(&remote, offer);
            // Subscribe before the insert so the answer can never slip
            // into the gap between the two.
            let changes = self.signaling.subscribe_call(&record.id).await?;
            self.signaling.publish_offer(&record).await?;
            Ok((record, changes))
        }
        .await;

        let (record, changes) = match staged {
            Ok(staged) => staged,
            Err(e) => {
                warn!(target: "Call/Machine", "call initiation failed: {e}");
                transport.close().await;
                self.release_media(local_media).await;
                return Err(e);
            }
        };

        st.generation += 1;
        let generation = st.generation;
        st.session
            .apply_transition(CallTransition::StartRequested {
                call_id: record.id.clone(),
            })?;
        st.session.audio_muted = false;
        st.session.video_off = !constraints.video;
        st.attempt = Some(Attempt {
            transport,
            local_media,
            remote_media: None,
            queue: IceCandidateQueue::new(),
            remote_cursor: RemoteCursor::new(),
            transport_connected: false,
        });
        st.watching_record = true;
        self.spawn_record_pump(generation, changes);
        self.spawn_transport_pump(generation, events);
        self.on_call_view.store(true, Ordering::Relaxed);
        self.publish_snapshot(&st);
        info!(target: "Call/Machine", "calling {remote} (call {})", record.id);
        Ok(record.id)
    }

    /// Accept the inbound call currently ringing.
    ///
    /// Media and transport failures abandon the attempt back to `Idle`; a
    /// record write failure keeps `Incoming` so accept can be retried.
    pub async fn accept(self: &Arc<Self>, call_id: &CallId) -> Result<(), CallError> {
        let mut st = self.state.lock().await;
        match &st.session.phase {
            CallPhase::Incoming {
                call_id: current, ..
            } if current == call_id => {}
            CallPhase::Incoming { .. } => return Err(CallError::NotFound(call_id.clone())),
            phase => {
                return Err(CallError::InvalidTransition(InvalidTransition {
                    current_phase: format!("{:?}", phase),
                    attempted: "AcceptRequested".to_string(),
                }));
            }
        }
        let record = st
            .pending_inbound
            .clone()
            .ok_or_else(|| CallError::NotFound(call_id.clone()))?;
        let offer = record
            .offer
            .clone()
            .ok_or_else(|| CallError::MissingOffer(call_id.clone()))?;

        let local_media = match self.media.acquire(self.config.constraints).await {
            Ok(media) => media,
            Err(e) => {
                let e = CallError::from(e);
                self.abandon_incoming(&mut st, &e).await;
                return Err(e);
            }
        };
        let (transport, events) = match self.transports.create_transport(&local_media).await {
            Ok(pair) => pair,
            Err(e) => {
                self.release_media(local_media).await;
                let e = CallError::TransportInit(e.to_string());
                self.abandon_incoming(&mut st, &e).await;
                return Err(e);
            }
        };

        let mut queue = IceCandidateQueue::new();
        let mut cursor = RemoteCursor::new();
        let negotiated: Result<SessionDescription, CallError> = async {
            transport
                .set_remote_description(offer)
                .await
                .map_err(|e| CallError::TransportInit(e.to_string()))?;
            // Drain candidates the caller stored before we saw the row. A
            // fresh read catches appends since the ring-time snapshot; the
            // subscription covers everything after.
            let fresh = match self.signaling.fetch(&record.id).await {
                Ok(fresh) => fresh,
                Err(e) => {
                    debug!(target: "Call/Machine", "using ring-time snapshot for {}: {e}", record.id);
                    record.clone()
                }
            };
            for candidate in cursor.take_new(fresh.candidates_of(record.caller_role)) {
                if let Err(e) = transport.add_ice_candidate(candidate.clone()).await {
                    warn!(target: "Call/Machine", "stored candidate rejected: {e}");
                }
            }
            queue.mark_ready();
            let answer = transport
                .create_answer()
                .await
                .map_err(|e| CallError::TransportInit(e.to_string()))?;
            transport
                .set_local_description(answer.clone())
                .await
                .map_err(|e| CallError::TransportInit(e.to_string()))?;
            Ok(answer)
        }
        .await;
        let answer = match negotiated {
            Ok(answer) => answer,
            Err(e) => {
                transport.close().await;
                self.release_media(local_media).await;
                self.abandon_incoming(&mut st, &e).await;
                return Err(e);
            }
        };

        // Re-establish the record watch if the ring-time subscription
        // failed; without it neither candidates nor termination would be
        // observed.
        let late_changes = if st.watching_record {
            None
        } else {
            match self.signaling.subscribe_call(&record.id).await {
                Ok(changes) => Some(changes),
                Err(e) => {
                    warn!(target: "Call/Machine", "accept aborted, no record watch: {e}");
                    transport.close().await;
                    self.release_media(local_media).await;
                    return Err(CallError::RecordWrite(e));
                }
            }
        };

        // The answer write. Failure leaves `Incoming` so the user can
        // retry; the answer is only ever persisted on the existing row.
        if let Err(e) = self.signaling.publish_answer(&record.id, answer).await {
            warn!(target: "Call/Machine", "accept write failed, staying incoming for retry: {e}");
            transport.close().await;
            self.release_media(local_media).await;
            return Err(CallError::RecordWrite(e));
        }

        let generation = st.generation;
        st.session.apply_transition(CallTransition::AcceptRequested)?;
        st.session.audio_muted = false;
        st.session.video_off = !self.config.constraints.video;
        st.attempt = Some(Attempt {
            transport,
            local_media,
            remote_media: None,
            queue,
            remote_cursor: cursor,
            transport_connected: false,
        });
        if let Some(changes) = late_changes {
            st.watching_record = true;
            self.spawn_record_pump(generation, changes);
        }
        self.spawn_transport_pump(generation, events);
        self.publish_snapshot(&st);
        info!(target: "Call/Machine", "accepted call {}", record.id);
        Ok(())
    }

    /// Reject the inbound call currently ringing.
    pub async fn reject(self: &Arc<Self>, call_id: &CallId) -> Result<(), CallError> {
        let mut st = self.state.lock().await;
        match &st.session.phase {
            CallPhase::Incoming {
                call_id: current, ..
            } if current == call_id => {}
            CallPhase::Incoming { .. } => return Err(CallError::NotFound(call_id.clone())),
            phase => {
                return Err(CallError::InvalidTransition(InvalidTransition {
                    current_phase: format!("{:?}", phase),
                    attempted: "LocalRejected".to_string(),
                }));
            }
        }
        // Failure stays `Incoming` so reject can be retried too.
        self.signaling
            .publish_reject(call_id)
            .await
            .map_err(CallError::RecordWrite)?;
        st.session.apply_transition(CallTransition::LocalRejected)?;
        info!(target: "Call/Machine", "rejected call {call_id}");
        self.finish_ended(&mut st).await;
        Ok(())
    }

    /// Hang up the current call, from any live phase.
    ///
    /// The terminal record write happens before resource release; release
    /// then proceeds unconditionally, even mid-negotiation. An explicit
    /// local hangup is authoritative over connection ambiguity.
    pub async fn hangup(self: &Arc<Self>) -> Result<(), CallError> {
        let mut st = self.state.lock().await;
        if st.session.phase.is_idle() || st.session.phase.is_ended() {
            return Err(CallError::InvalidTransition(InvalidTransition {
                current_phase: format!("{:?}", st.session.phase),
                attempted: "LocalHangup".to_string(),
            }));
        }
        if let Some(call_id) = st.session.phase.call_id().cloned() {
            // Terminal write first. A failed write is logged; release must
            // never be blocked by it.
            if let Err(e) = self.signaling.publish_hangup(&call_id).await {
                warn!(target: "Call/Machine", "terminal write failed on hangup: {e}");
            }
            info!(target: "Call/Machine", "hung up call {call_id}");
        }
        st.session.apply_transition(CallTransition::LocalHangup)?;
        self.finish_ended(&mut st).await;
        Ok(())
    }

    /// Flip the microphone. Returns the new muted state.
    pub async fn toggle_mute(&self) -> bool {
        let mut st = self.state.lock().await;
        st.session.audio_muted = !st.session.audio_muted;
        let muted = st.session.audio_muted;
        if let Some(attempt) = &st.attempt {
            self.media
                .set_track_enabled(&attempt.local_media, TrackKind::Audio, !muted)
                .await;
        }
        self.publish_snapshot(&st);
        muted
    }

    /// Flip the camera. Returns the new video-off state.
    pub async fn toggle_video(&self) -> bool {
        let mut st = self.state.lock().await;
        st.session.video_off = !st.session.video_off;
        let video_off = st.session.video_off;
        if let Some(attempt) = &st.attempt {
            self.media
                .set_track_enabled(&attempt.local_media, TrackKind::Video, !video_off)
                .await;
        }
        self.publish_snapshot(&st);
        video_off
    }

    /// Stop the observer pumps and drop per-attempt resources without
    /// touching the record. Call [`hangup`](Self::hangup) first when the
    /// peer should be informed.
    pub async fn shutdown(&self) {
        self.shutdown_notifier.notify_waiters();
        let mut st = self.state.lock().await;
        self.teardown_attempt(&mut st).await;
        st.pending_inbound = None;
    }

    // ---- observer pumps ----------------------------------------------

    fn spawn_inbound_pump(self: &Arc<Self>) {
        let watcher = InboundWatcher::new(
            Arc::clone(&self.store),
            self.role(),
            self.local.clone(),
            self.config.poll_interval,
            self.config.poll_limit,
            self.config.seen_ttl,
            Arc::clone(&self.on_call_view),
            Arc::clone(&self.shutdown_notifier),
        );
        let mut inbound = watcher.spawn();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let shutdown = this.shutdown_notifier.notified();
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    _ = &mut shutdown => return,
                    record = inbound.recv() => match record {
                        Some(record) => this.handle_inbound(record).await,
                        None => return,
                    },
                }
            }
        });
    }

    fn spawn_record_pump(self: &Arc<Self>, generation: u64, mut changes: mpsc::Receiver<RecordChange>) {
        let this = Arc::clone(self);
        let mut snapshots = self.snapshot_tx.subscribe();
        tokio::spawn(async move {
            let shutdown = this.shutdown_notifier.notified();
            tokio::pin!(shutdown);
            loop {
                if pump_done(&snapshots, generation) {
                    return;
                }
                tokio::select! {
                    _ = &mut shutdown => return,
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    change = changes.recv() => match change {
                        Some(change) => this.handle_record_change(generation, change).await,
                        None => return,
                    },
                }
            }
        });
    }

    fn spawn_transport_pump(
        self: &Arc<Self>,
        generation: u64,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        let this = Arc::clone(self);
        let mut snapshots = self.snapshot_tx.subscribe();
        tokio::spawn(async move {
            let shutdown = this.shutdown_notifier.notified();
            tokio::pin!(shutdown);
            loop {
                if pump_done(&snapshots, generation) {
                    return;
                }
                tokio::select! {
                    _ = &mut shutdown => return,
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    event = events.recv() => match event {
                        Some(event) => this.handle_transport_event(generation, event).await,
                        None => return,
                    },
                }
            }
        });
    }

    // ---- event handlers ----------------------------------------------

    async fn handle_inbound(self: &Arc<Self>, record: CallRecord) {
        let mut st = self.state.lock().await;
        if !st.session.phase.is_idle() {
            debug!(target: "Call/Machine", "ignoring inbound ring {} while busy", record.id);
            return;
        }
        // Watch the record before surfacing it, so a caller hangup while
        // the phone rings is observed.
        let changes = match self.signaling.subscribe_call(&record.id).await {
            Ok(changes) => Some(changes),
            Err(e) => {
                warn!(target: "Call/Machine", "no record watch for inbound call {}: {e}", record.id);
                None
            }
        };
        // The ring may have been cancelled between the watcher seeing it
        // and this point; the subscription's initial echo must not fire
        // the termination detector, so check the row directly instead.
        if let Ok(fresh) = self.signaling.fetch(&record.id).await
            && fresh.status != CallStatus::Ringing
        {
            debug!(target: "Call/Machine", "inbound call {} already settled, not surfacing", record.id);
            return;
        }
        st.generation += 1;
        let generation = st.generation;
        if let Err(e) = st.session.apply_transition(CallTransition::InboundObserved {
            call_id: record.id.clone(),
            caller_role: record.caller_role,
        }) {
            warn!(target: "Call/Machine", "inbound surfacing rejected: {e}");
            return;
        }
        info!(target: "Call/Machine", "incoming call {} from {}", record.id, record.caller_role);
        st.pending_inbound = Some(record);
        st.watching_record = changes.is_some();
        if let Some(changes) = changes {
            self.spawn_record_pump(generation, changes);
        }
        self.on_call_view.store(true, Ordering::Relaxed);
        self.publish_snapshot(&st);
    }

    async fn handle_record_change(self: &Arc<Self>, generation: u64, change: RecordChange) {
        let mut st = self.state.lock().await;
        if st.generation != generation || st.session.phase.is_ended() {
            return;
        }
        if st.session.phase.call_id() != Some(&change.current.id) {
            return;
        }

        if self.detector.observe(&change) {
            info!(
                target: "Call/Machine",
                "call {} reached terminal state remotely", change.current.id
            );
            if let Err(e) = st.session.apply_transition(CallTransition::TerminationObserved) {
                warn!(target: "Call/Machine", "termination in unexpected phase: {e}");
            }
            // Cleanup is unconditional, whatever the transport thinks.
            self.finish_ended(&mut st).await;
            return;
        }

        let record = change.current;
        match record.status {
            CallStatus::Rejected => {
                if st
                    .session
                    .apply_transition(CallTransition::RemoteDeclined {
                        reason: CallEndReason::Rejected,
                    })
                    .is_ok()
                {
                    info!(target: "Call/Machine", "call {} was rejected", record.id);
                    self.finish_ended(&mut st).await;
                }
                return;
            }
            CallStatus::Missed => {
                if st
                    .session
                    .apply_transition(CallTransition::RemoteDeclined {
                        reason: CallEndReason::Missed,
                    })
                    .is_ok()
                {
                    info!(target: "Call/Machine", "call {} was missed", record.id);
                    self.finish_ended(&mut st).await;
                }
                return;
            }
            _ => {}
        }

        if matches!(st.session.phase, CallPhase::Calling { .. })
            && let Some(answer) = record.answer.clone()
        {
            self.on_answer(&mut st, answer).await;
        }

        self.drain_remote(&mut st, &record).await;
        self.publish_snapshot(&st);
    }

    /// Caller side: the stored answer appeared on the record.
    async fn on_answer(self: &Arc<Self>, st: &mut MachineState, answer: SessionDescription) {
        let Some(attempt) = st.attempt.as_mut() else {
            return;
        };
        if attempt.queue.is_ready() {
            // Redelivered row; the answer is already applied.
            return;
        }
        if let Err(e) = attempt.transport.set_remote_description(answer).await {
            warn!(target: "Call/Machine", "remote answer rejected: {e}");
            self.fail_transport(st).await;
            return;
        }
        // Flush candidates parked while no remote description existed.
        for candidate in attempt.queue.mark_ready() {
            if let Err(e) = attempt.transport.add_ice_candidate(candidate).await {
                warn!(target: "Call/Machine", "parked candidate rejected: {e}");
            }
        }
        if let Err(e) = st.session.apply_transition(CallTransition::AnswerObserved) {
            warn!(target: "Call/Machine", "answer in unexpected phase: {e}");
            return;
        }
        debug!(target: "Call/Machine", "answer applied, negotiating");
        self.maybe_media_live(st).await;
    }

    /// Consume newly appended candidates from the opposite role's list.
    async fn drain_remote(&self, st: &mut MachineState, record: &CallRecord) {
        let remote_role = self.role().opposite();
        let Some(attempt) = st.attempt.as_mut() else {
            return;
        };
        let fresh: Vec<_> = attempt
            .remote_cursor
            .take_new(record.candidates_of(remote_role))
            .to_vec();
        for candidate in fresh {
            // Parked until the remote description is set, applied directly
            // afterwards.
            if let Some(candidate) = attempt.queue.admit(candidate) {
                if let Err(e) = attempt.transport.add_ice_candidate(candidate).await {
                    warn!(target: "Call/Machine", "remote candidate rejected: {e}");
                }
            }
        }
    }

    async fn handle_transport_event(self: &Arc<Self>, generation: u64, event: TransportEvent) {
        let mut st = self.state.lock().await;
        if st.generation != generation || st.session.phase.is_ended() {
            return;
        }
        let Some(call_id) = st.session.phase.call_id().cloned() else {
            return;
        };
        match event {
            TransportEvent::CandidateGenerated(candidate) => {
                // Written to this role's list the moment it is generated;
                // duplicates are silently discarded downstream.
                if let Err(e) = self.signaling.emit_candidate(&call_id, candidate).await {
                    warn!(target: "Call/Machine", "candidate write failed: {e}");
                }
            }
            TransportEvent::TrackReceived(remote) => {
                debug!(target: "Call/Machine", "remote media arrived for call {call_id}");
                if let Some(attempt) = st.attempt.as_mut() {
                    attempt.remote_media = Some(remote);
                }
                self.maybe_media_live(&mut st).await;
                self.publish_snapshot(&st);
            }
            TransportEvent::ConnectionStateChanged(connection) => {
                debug!(target: "Call/Machine", "connection state for call {call_id}: {connection:?}");
                if let Some(attempt) = st.attempt.as_mut() {
                    attempt.transport_connected = connection.is_connected();
                }
                if connection == ConnectionState::Failed {
                    warn!(target: "Call/Machine", "transport failed for call {call_id}");
                    self.fail_transport(&mut st).await;
                } else {
                    self.maybe_media_live(&mut st).await;
                    self.publish_snapshot(&st);
                }
            }
            TransportEvent::IceStateChanged(ice) => {
                debug!(target: "Call/Machine", "ice state for call {call_id}: {ice:?}");
            }
        }
    }

    /// Advance `Connecting → InCall` once the transport independently
    /// reports connected and remote media is present.
    async fn maybe_media_live(self: &Arc<Self>, st: &mut MachineState) {
        if !matches!(st.session.phase, CallPhase::Connecting { .. }) {
            return;
        }
        let Some(attempt) = st.attempt.as_ref() else {
            return;
        };
        if !attempt.transport_connected || attempt.remote_media.is_none() {
            return;
        }
        let Some(call_id) = st.session.phase.call_id().cloned() else {
            return;
        };
        if st.session.apply_transition(CallTransition::MediaLive).is_ok() {
            info!(target: "Call/Machine", "call {call_id} is live");
            if let Err(e) = self.signaling.mark_active(&call_id).await {
                debug!(target: "Call/Machine", "active upgrade failed: {e}");
            }
        }
    }

    /// The transport gave up mid-call: terminal write first, then the
    /// usual unconditional cleanup.
    async fn fail_transport(self: &Arc<Self>, st: &mut MachineState) {
        if let Some(call_id) = st.session.phase.call_id().cloned() {
            if let Err(e) = self.signaling.publish_hangup(&call_id).await {
                warn!(target: "Call/Machine", "terminal write failed after transport failure: {e}");
            }
        }
        if st
            .session
            .apply_transition(CallTransition::TransportFailed)
            .is_ok()
        {
            self.finish_ended(st).await;
        }
    }

    // ---- teardown ----------------------------------------------------

    async fn abandon_incoming(self: &Arc<Self>, st: &mut MachineState, error: &CallError) {
        warn!(target: "Call/Machine", "abandoning incoming call: {error}");
        if st
            .session
            .apply_transition(CallTransition::SetupFailed)
            .is_ok()
        {
            st.pending_inbound = None;
            st.watching_record = false;
            self.on_call_view.store(false, Ordering::Relaxed);
            self.publish_snapshot(st);
        }
    }

    async fn finish_ended(self: &Arc<Self>, st: &mut MachineState) {
        self.teardown_attempt(st).await;
        self.publish_snapshot(st);
        self.schedule_reset(st.generation);
    }

    /// Release per-attempt resources. Best-effort throughout; a release
    /// failure never blocks navigation away.
    async fn teardown_attempt(&self, st: &mut MachineState) {
        st.pending_inbound = None;
        st.watching_record = false;
        let Some(attempt) = st.attempt.take() else {
            return;
        };
        // Media capture is released via a guard so it happens even if the
        // transport teardown panics.
        let release = scopeguard::guard(
            (Arc::clone(&self.media), attempt.local_media.clone()),
            |(media, local)| {
                tokio::spawn(async move {
                    if let Err(e) = media.release(local).await {
                        warn!(target: "Call/Machine", "media release failed (ignored): {e:?}");
                    }
                });
            },
        );
        attempt.transport.close().await;
        drop(release);
    }

    async fn release_media(&self, media: LocalMedia) {
        if let Err(e) = self.media.release(media).await {
            warn!(target: "Call/Machine", "media release failed (ignored): {e:?}");
        }
    }

    /// After the linger, return `Ended → Idle` unless a fresh attempt
    /// already took over.
    fn schedule_reset(self: &Arc<Self>, generation: u64) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = this.shutdown_notifier.notified() => return,
                _ = tokio::time::sleep(this.config.ended_linger) => {}
            }
            let mut st = this.state.lock().await;
            if st.generation != generation || !st.session.phase.is_ended() {
                return;
            }
            if st.session.apply_transition(CallTransition::Reset).is_ok() {
                st.session.audio_muted = false;
                st.session.video_off = false;
                this.on_call_view.store(false, Ordering::Relaxed);
                this.publish_snapshot(&st);
            }
        });
    }

    fn publish_snapshot(&self, st: &MachineState) {
        self.snapshot_tx.send_replace(CallSnapshot {
            phase: st.session.phase.clone(),
            local_media: st.attempt.as_ref().map(|a| a.local_media.clone()),
            remote_media: st.attempt.as_ref().and_then(|a| a.remote_media.clone()),
            audio_muted: st.session.audio_muted,
            video_off: st.session.video_off,
            generation: st.generation,
        });
    }
}

/// A pump is finished once its attempt is over: a later generation took
/// the machine, or the same attempt settled back to ended or idle. A
/// stale snapshot from before the attempt (lower generation) keeps the
/// pump alive.
fn pump_done(snapshots: &watch::Receiver<CallSnapshot>, generation: u64) -> bool {
    let snapshot = snapshots.borrow();
    snapshot.generation > generation
        || (snapshot.generation == generation
            && (snapshot.phase.is_ended() || snapshot.phase.is_idle()))
}
