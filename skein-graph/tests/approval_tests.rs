//! Human-in-the-loop suspension and resumption

use skein_graph::node::DeadlinePolicy;
use skein_graph::prelude::*;
use skein_graph::stream::EventPayload;
use std::time::Duration;

fn approval_graph() -> Arc<Graph> {
    Arc::new(
        Graph::builder()
            .add_node(FunctionNode::new("prepare", |state| {
                state.set("plan", "deploy v2")?;
                Ok(None)
            }))
            .add_node(
                HumanApprovalNode::new("approve", "Deploy v2 to production?", "approval")
                    .with_deadline(Duration::from_secs(3600)),
            )
            .add_node(FunctionNode::new("finish", |state| {
                state.set("done", true)?;
                Ok(None)
            }))
            .add_edge("prepare", "approve")
            .add_edge("approve", "finish")
            .mark_terminal("finish")
            .build()
            .unwrap(),
    )
}

#[tokio::test]
async fn test_suspend_and_resume_in_process() {
    let mut executor = Executor::new("approval");
    let mut events = executor.subscribe();

    let err = executor
        .execute(approval_graph(), ExecutionState::new(), CancellationToken::new())
        .await
        .unwrap_err();

    let suspension = match err {
        GraphError::Suspended(info) => info,
        other => panic!("expected suspension, got {other:?}"),
    };
    assert_eq!(suspension.node_id, "approve");
    assert_eq!(suspension.prompt, "Deploy v2 to production?");

    let suspended_event = events
        .drain()
        .into_iter()
        .any(|e| matches!(e.payload, EventPayload::Suspended { ref node, .. } if node == "approve"));
    assert!(suspended_event);

    // The caller can amend the parked state before answering
    executor
        .update_suspended_state(&suspension.request_id, |state| {
            state.set("reviewer", "oncall")?;
            Ok(())
        })
        .unwrap();

    let final_state = executor
        .resume(&suspension.request_id, Value::from("granted"), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(final_state.get_str("approval"), Some("granted"));
    assert_eq!(final_state.get_bool("done"), Some(true));
    assert_eq!(final_state.get_str("reviewer"), Some("oncall"));

    let resumed_event = events
        .drain()
        .into_iter()
        .any(|e| matches!(e.payload, EventPayload::Resumed { ref node, .. } if node == "approve"));
    assert!(resumed_event);
}

#[tokio::test]
async fn test_suspend_checkpoint_restart_resume() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let graph = approval_graph();

    // First "process": runs until the approval suspends, checkpointing on
    // the way out.
    let execution_id = {
        let options = ExecutionOptions::default().with_checkpointing(1);
        let mut executor = Executor::with_options("before-restart", options);
        executor.set_checkpoint_store(store.clone());

        let err = executor
            .execute(graph.clone(), ExecutionState::new(), CancellationToken::new())
            .await
            .unwrap_err();
        let suspension = match err {
            GraphError::Suspended(info) => info,
            other => panic!("expected suspension, got {other:?}"),
        };
        assert!(suspension.checkpoint_id.is_some());
        suspension.execution_id
    };

    // Second "process": a fresh executor restores from the store and the
    // caller answers the pending approval.
    let options = ExecutionOptions::default().with_checkpointing(1);
    let mut executor = Executor::with_options("after-restart", options);
    executor.set_checkpoint_store(store);

    let final_state = executor
        .resume_from_checkpoint(
            graph,
            &execution_id,
            Some(Value::from("granted")),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(final_state.get_str("approval"), Some("granted"));
    assert_eq!(final_state.get_bool("done"), Some(true));
    // Pre-suspension work survived the round trip
    assert_eq!(final_state.get_str("plan"), Some("deploy v2"));
}

#[tokio::test]
async fn test_deadline_skip_policy_continues_without_response() {
    let graph = Arc::new(
        Graph::builder()
            .add_node(
                HumanApprovalNode::new("approve", "anyone there?", "approval")
                    .with_deadline(Duration::from_millis(0))
                    .with_deadline_policy(DeadlinePolicy::Skip),
            )
            .add_node(FunctionNode::new("finish", |state| {
                state.set("done", true)?;
                Ok(None)
            }))
            .add_edge("approve", "finish")
            .mark_terminal("finish")
            .build()
            .unwrap(),
    );

    let executor = Executor::new("deadline-skip");
    let err = executor
        .execute(graph, ExecutionState::new(), CancellationToken::new())
        .await
        .unwrap_err();
    let suspension = match err {
        GraphError::Suspended(info) => info,
        other => panic!("expected suspension, got {other:?}"),
    };

    // The zero deadline has elapsed by the time the caller responds
    tokio::time::sleep(Duration::from_millis(10)).await;
    let final_state = executor
        .resume(&suspension.request_id, Value::from("late"), CancellationToken::new())
        .await
        .unwrap();

    // Skipped: no approval recorded, but the flow completed
    assert!(!final_state.contains("approval"));
    assert_eq!(final_state.get_bool("done"), Some(true));
}

#[tokio::test]
async fn test_deadline_fail_policy_fails_the_run() {
    let graph = Arc::new(
        Graph::builder()
            .add_node(
                HumanApprovalNode::new("approve", "anyone there?", "approval")
                    .with_deadline(Duration::from_millis(0))
                    .with_deadline_policy(DeadlinePolicy::Fail),
            )
            .add_node(PassthroughNode::new("finish"))
            .add_edge("approve", "finish")
            .mark_terminal("finish")
            .build()
            .unwrap(),
    );

    let executor = Executor::new("deadline-fail");
    let err = executor
        .execute(graph, ExecutionState::new(), CancellationToken::new())
        .await
        .unwrap_err();
    let suspension = match err {
        GraphError::Suspended(info) => info,
        other => panic!("expected suspension, got {other:?}"),
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    let err = executor
        .resume(&suspension.request_id, Value::from("late"), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test]
async fn test_unknown_request_id_is_rejected() {
    let executor = Executor::new("unknown");
    let err = executor
        .resume("no-such-request", Value::from("x"), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::CheckpointNotFound(_)));
}
