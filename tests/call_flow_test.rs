//! End-to-end smoke test through the public API only: two machines on one
//! shared in-memory store, from ringing to in-call to hangup.

use nestcall::call::{CallEndReason, CallOptions, CallPhase, Role};
use nestcall::config::CallConfig;
use nestcall::test_utils::{
    MemoryRecordStore, OpLog, TestEndpoint, child_context, parent_context, wait_for_snapshot,
};
use nestcall::{CallStatus, ParticipantId};
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> CallConfig {
    CallConfig {
        poll_interval: Duration::from_millis(50),
        ended_linger: Duration::from_secs(60),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_parent_calls_child_end_to_end() {
    let _ = env_logger::builder().is_test(true).try_init();

    let ops = OpLog::new();
    let store = MemoryRecordStore::with_log(ops.clone());
    let parent = TestEndpoint::new(
        Arc::clone(&store),
        &parent_context(),
        "parent-device",
        test_config(),
        ops.clone(),
    );
    let child = TestEndpoint::new(
        Arc::clone(&store),
        &child_context(),
        "child-device",
        test_config(),
        ops.clone(),
    );
    assert_eq!(parent.machine.role(), Role::Parent);
    assert_eq!(child.machine.role(), Role::Child);

    let mut parent_watch = parent.machine.watch();
    let mut child_watch = child.machine.watch();

    let call_id = parent
        .machine
        .start(ParticipantId::new("child-device"), CallOptions::video())
        .await
        .expect("start should publish an offer");

    wait_for_snapshot(&mut child_watch, "child sees the ring", |s| {
        matches!(s.phase, CallPhase::Incoming { .. })
    })
    .await;

    child
        .machine
        .accept(&call_id)
        .await
        .expect("accept should publish the answer");

    parent.transport().go_live().await;
    child.transport().go_live().await;

    wait_for_snapshot(&mut parent_watch, "parent in-call", |s| {
        matches!(s.phase, CallPhase::InCall { .. })
    })
    .await;
    wait_for_snapshot(&mut child_watch, "child in-call", |s| {
        matches!(s.phase, CallPhase::InCall { .. })
    })
    .await;

    let record = store.get(&call_id).expect("record persists");
    assert!(record.status.is_live());
    assert!(record.offer.is_some());
    assert!(record.answer.is_some());

    // Parent hangs up; the child observes the terminal record.
    parent.machine.hangup().await.expect("hangup");
    wait_for_snapshot(&mut child_watch, "child ended", |s| {
        matches!(
            s.phase,
            CallPhase::Ended {
                reason: CallEndReason::RemoteHangup,
                ..
            }
        )
    })
    .await;

    let record = store.get(&call_id).expect("record persists after end");
    assert_eq!(record.status, CallStatus::Ended);
    assert!(record.ended_at.is_some());
    assert_eq!(record.ended_by, Some(Role::Parent));
}
