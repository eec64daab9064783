//! Periodic checkpointing and restore

use skein_graph::prelude::*;
use skein_graph::stream::EventPayload;
use skein_graph::{CheckpointManager, MemoryCheckpointStore};

fn counting_chain() -> Arc<Graph> {
    let step = |id: &'static str| {
        FunctionNode::new(id, |state| {
            let n = state.get_int("n").unwrap_or(0);
            state.set("n", n + 1)?;
            Ok(None)
        })
    };

    Arc::new(
        Graph::builder()
            .add_node(step("one"))
            .add_node(step("two"))
            .add_node(step("three"))
            .add_node(step("four"))
            .add_edge("one", "two")
            .add_edge("two", "three")
            .add_edge("three", "four")
            .mark_terminal("four")
            .build()
            .unwrap(),
    )
}

#[tokio::test]
async fn test_periodic_checkpoints_every_n_nodes() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let options = ExecutionOptions::default().with_checkpointing(2);
    let mut executor = Executor::with_options("periodic", options);
    executor.set_checkpoint_store(store);
    let mut events = executor.subscribe();

    executor
        .execute(counting_chain(), ExecutionState::new(), CancellationToken::new())
        .await
        .unwrap();

    let checkpoints = events
        .drain()
        .into_iter()
        .filter(|e| matches!(e.payload, EventPayload::CheckpointCreated { .. }))
        .count();
    // Four completed nodes, every second one checkpointed
    assert_eq!(checkpoints, 2);
}

#[tokio::test]
async fn test_restore_continues_from_saved_queue() {
    let store = Arc::new(MemoryCheckpointStore::new());

    // Persist a checkpoint as if the run stopped after "two"
    {
        let manager = CheckpointManager::new(store.clone());
        let mut state = ExecutionState::new();
        state.set("n", 2i64).unwrap();
        let checkpoint = skein_graph::Checkpoint::new(
            "exec-halted",
            state,
            Some("two".to_string()),
            vec!["three".to_string()],
        );
        manager.save(&checkpoint).await.unwrap();
    }

    let mut executor = Executor::new("restorer");
    executor.set_checkpoint_store(store);

    let final_state = executor
        .resume_from_checkpoint(
            counting_chain(),
            "exec-halted",
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    // Only "three" and "four" ran after the restore
    assert_eq!(final_state.get_int("n"), Some(4));
}

#[tokio::test]
async fn test_restore_missing_execution_fails() {
    let mut executor = Executor::new("missing");
    executor.set_checkpoint_store(Arc::new(MemoryCheckpointStore::new()));

    let err = executor
        .resume_from_checkpoint(
            counting_chain(),
            "never-ran",
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::CheckpointNotFound(_)));
}
