//! Transaction scenarios: commit, abort with rollback, restore failure,
//! and single-shot enforcement against a live engine.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use tether_engine::prelude::*;

/// Creates host objects in an in-memory scene.
struct CreateObjectHandler {
    scene: Arc<MemoryStateProvider>,
}

impl CommandHandler for CreateObjectHandler {
    fn validate(&self, params: &Value) -> Validation {
        match params.get("type").and_then(Value::as_str) {
            Some(_) => Validation::ok(),
            None => Validation::reject("missing 'type'"),
        }
    }

    fn execute(&self, params: &Value) -> std::result::Result<Value, HandlerError> {
        let kind = params["type"].as_str().unwrap_or_default();
        let name = match kind {
            "cube" => "Cube",
            "sphere" => "Sphere",
            other => {
                return Err(HandlerError::invalid_argument(format!(
                    "unknown primitive '{other}'"
                )))
            }
        };
        self.scene
            .insert(name, json!({"type": kind}))
            .map_err(|e| HandlerError::host_state(e.to_string()))?;
        Ok(json!({"objectName": name}))
    }
}

/// Wraps the scene with a restore that always fails.
struct BrokenRestore {
    inner: Arc<MemoryStateProvider>,
}

impl StateProvider for BrokenRestore {
    fn capture(&self, detail: DetailLevel) -> tether_engine::error::Result<StateSnapshot> {
        self.inner.capture(detail)
    }

    fn restore(&self, _snapshot: &StateSnapshot) -> tether_engine::error::Result<()> {
        Err(tether_engine::error::Error::RestoreFailed {
            message: "host refused the restore".into(),
        })
    }
}

fn engine_over(provider: Arc<dyn StateProvider>, scene: &Arc<MemoryStateProvider>) -> EngineService {
    let engine = EngineService::with_defaults(provider);
    engine
        .register_command(
            "create_object",
            Arc::new(CreateObjectHandler {
                scene: Arc::clone(scene),
            }),
        )
        .unwrap();
    engine
}

fn engine_fixture() -> (Arc<MemoryStateProvider>, EngineService) {
    let scene = Arc::new(MemoryStateProvider::new());
    let engine = engine_over(Arc::clone(&scene) as Arc<dyn StateProvider>, &scene);
    (scene, engine)
}

fn create_object(kind: &str) -> Command {
    Command::standard("create_object", json!({"type": kind})).unwrap()
}

#[test]
fn committed_transaction_reports_every_result() {
    let (scene, engine) = engine_fixture();

    let tx = engine
        .create_transaction(Some("setup".into()), vec![create_object("cube")])
        .unwrap();
    engine
        .add_transaction_command(tx, create_object("sphere"))
        .unwrap();

    let report = engine.execute_transaction(tx, true).unwrap();
    assert!(report.success);
    assert_eq!(report.executed, 2);
    assert_eq!(report.total, 2);
    assert_eq!(report.results.len(), 2);
    assert!(report.results.iter().all(CommandResult::is_success));
    assert!(report.failure.is_none());
    assert!(scene.contains("Cube").unwrap());
    assert!(scene.contains("Sphere").unwrap());
}

#[test]
fn aborted_transaction_rolls_back_to_the_snapshot() {
    let (scene, engine) = engine_fixture();
    scene.insert("Lamp", json!({"energy": 100})).unwrap();

    let tx = engine
        .create_transaction(
            None,
            vec![
                create_object("cube"),
                Command::standard("nonexistent_command", json!({})).unwrap(),
                create_object("sphere"),
            ],
        )
        .unwrap();

    let report = engine.execute_transaction(tx, true).unwrap();
    assert!(!report.success);
    assert_eq!(report.executed, 1);
    assert_eq!(report.total, 3);
    // The failing command is recorded; the command after it never ran.
    assert_eq!(report.results.len(), 2);
    assert!(!report.results[1].is_success());
    assert!(report
        .failure
        .as_ref()
        .unwrap()
        .contains("nonexistent_command"));

    let rollback = report.rollback.expect("rollback status");
    assert!(rollback.attempted);
    assert!(rollback.restored);
    assert!(rollback.error.is_none());

    // State equals state-before, not state-after-cube.
    assert!(!scene.contains("Cube").unwrap());
    assert!(!scene.contains("Sphere").unwrap());
    assert!(scene.contains("Lamp").unwrap());
}

#[test]
fn restore_failure_is_secondary_to_the_original_cause() {
    let scene = Arc::new(MemoryStateProvider::new());
    let engine = engine_over(
        Arc::new(BrokenRestore {
            inner: Arc::clone(&scene),
        }),
        &scene,
    );

    let tx = engine
        .create_transaction(
            None,
            vec![
                create_object("cube"),
                Command::standard("nonexistent_command", json!({})).unwrap(),
            ],
        )
        .unwrap();

    let report = engine.execute_transaction(tx, true).unwrap();
    assert!(!report.success);
    // The primary cause stays the command failure.
    assert!(report
        .failure
        .as_ref()
        .unwrap()
        .contains("nonexistent_command"));

    // The restore failure is surfaced alongside, not promoted.
    let rollback = report.rollback.expect("rollback status");
    assert!(rollback.attempted);
    assert!(!rollback.restored);
    assert!(rollback
        .error
        .as_ref()
        .unwrap()
        .contains("host refused the restore"));
}

#[test]
fn second_execute_is_rejected_without_side_effects() {
    let (scene, engine) = engine_fixture();
    let tx = engine
        .create_transaction(None, vec![create_object("cube")])
        .unwrap();

    assert!(engine.execute_transaction(tx, false).unwrap().success);
    scene.remove("Cube").unwrap();

    let err = engine.execute_transaction(tx, false).unwrap_err();
    assert!(matches!(err, Error::TransactionAlreadyExecuted { .. }));
    assert!(!scene.contains("Cube").unwrap());

    let info = engine.transaction_info(tx).unwrap().unwrap();
    assert_eq!(info.state, TransactionState::Executed);
}

#[test]
fn transactions_and_ticks_share_the_apply_gate() {
    // A transaction executed while tasks are queued must not interleave
    // with them; ticking afterwards still drains the queue cleanly.
    let (scene, engine) = engine_fixture();

    engine
        .submit_task(
            TaskKind::Execute,
            json!({"kind": "standard", "name": "create_object", "params": {"type": "sphere"}}),
            None,
        )
        .unwrap();

    let tx = engine
        .create_transaction(None, vec![create_object("cube")])
        .unwrap();
    let report = engine.execute_transaction(tx, true).unwrap();
    assert!(report.success);

    while engine.tick().is_some() {}
    assert!(scene.contains("Cube").unwrap());
    assert!(scene.contains("Sphere").unwrap());
}

#[test]
fn lifecycle_info_delete_and_cleanup() {
    let (_scene, engine) = engine_fixture();

    let open = engine.create_transaction(None, Vec::new()).unwrap();
    let info = engine.transaction_info(open).unwrap().unwrap();
    assert_eq!(info.state, TransactionState::Initialized);
    assert_eq!(info.command_count, 0);

    let done = engine
        .create_transaction(None, vec![create_object("cube")])
        .unwrap();
    engine.execute_transaction(done, false).unwrap();

    assert_eq!(engine.cleanup_transactions(Duration::ZERO).unwrap(), 1);
    assert!(engine.transaction_info(done).unwrap().is_none());
    assert!(engine.transaction_info(open).unwrap().is_some());

    assert!(engine.delete_transaction(open).unwrap());
    assert!(!engine.delete_transaction(open).unwrap());
}
