//! Capability registry: contract enforcement, isolation and accounting.

use std::sync::Arc;
use std::time::Duration;

use evolve_core::registry::builtins::{evaluation_descriptor, ANALYZE_DATA};
use evolve_core::registry::{
    register_defaults, CapabilityDescriptor, CapabilityFault, CapabilityRegistry, Contract,
    FnHandler, InvocationBudget, ParamSpec, ParamType, RegistryError,
};
use evolve_core::FailureClass;
use serde_json::{json, Value};

fn registry() -> CapabilityRegistry {
    let registry = CapabilityRegistry::new(Duration::from_secs(5), 1 << 20, 64);
    register_defaults(&registry).unwrap();
    registry
}

fn register_sleeper(registry: &CapabilityRegistry, descriptor: CapabilityDescriptor, sleep: Duration) {
    registry
        .register(
            descriptor,
            Arc::new(FnHandler::new(move |_params: Value, _| async move {
                tokio::time::sleep(sleep).await;
                Ok::<_, CapabilityFault>(json!({"slept": true}))
            })),
        )
        .unwrap();
}

#[tokio::test]
async fn test_builtin_capabilities_are_listed_with_categories() {
    let registry = registry();
    let names: Vec<String> = registry.list().into_iter().map(|d| d.name).collect();
    assert_eq!(
        names,
        vec![
            "analyze_data",
            "automate_task",
            "evaluate_capability_set",
            "generate_report"
        ]
    );
    assert_eq!(
        registry.categories(),
        vec!["data_analysis", "evaluation", "report_generation", "task_automation"]
    );
    assert_eq!(registry.list_by_category("task_automation").len(), 1);
}

#[tokio::test]
async fn test_unknown_capability_is_not_found() {
    let registry = registry();
    let err = registry.invoke("nope", json!({}), None).await.unwrap_err();
    assert!(matches!(err, RegistryError::NotFound { ref name } if name == "nope"));
    assert_eq!(err.classification(), FailureClass::Permanent);
}

#[tokio::test]
async fn test_missing_required_param_is_contract_violation() {
    let registry = registry();
    let err = registry
        .invoke(ANALYZE_DATA, json!({"data": [1, 2]}), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "contract_violation");
    assert!(err.to_string().contains("analysis_type"));
}

#[tokio::test]
async fn test_wrong_type_and_enum_are_rejected_before_running() {
    let registry = registry();
    let wrong_type = registry
        .invoke(ANALYZE_DATA, json!({"data": "x", "analysis_type": "summary"}), None)
        .await
        .unwrap_err();
    assert_eq!(wrong_type.code(), "contract_violation");

    let bad_enum = registry
        .invoke(ANALYZE_DATA, json!({"data": [], "analysis_type": "guess"}), None)
        .await
        .unwrap_err();
    assert_eq!(bad_enum.code(), "contract_violation");

    // Rejected calls never reach the handler, but are still audited.
    assert_eq!(registry.stats(ANALYZE_DATA).unwrap().usage_count, 2);
    assert_eq!(registry.stats(ANALYZE_DATA).unwrap().success_rate, 0.0);
}

#[tokio::test]
async fn test_valid_call_gets_defaults_and_is_counted() {
    let registry = registry();
    let out = registry
        .invoke(
            ANALYZE_DATA,
            json!({"data": [1, 2, 3], "analysis_type": "trends"}),
            None,
        )
        .await
        .unwrap();
    assert_eq!(out["data_points"], 3);
    assert_eq!(out["output_format"], "json");

    let stats = registry.stats(ANALYZE_DATA).unwrap();
    assert_eq!(stats.usage_count, 1);
    assert_eq!(stats.success_rate, 1.0);
    assert!(stats.last_used.is_some());

    let audit = registry.audit_log();
    assert_eq!(audit.len(), 1);
    assert!(audit[0].succeeded());
    assert_eq!(audit[0].version, Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_enforced_and_transient() {
    let registry = registry();
    register_sleeper(
        &registry,
        CapabilityDescriptor::new("slow", 1),
        Duration::from_secs(10),
    );

    let budget = InvocationBudget::with_duration(Duration::from_secs(5));
    let err = registry
        .invoke("slow", json!({}), Some(budget))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        RegistryError::Timeout {
            name: "slow".into(),
            limit_ms: 5000
        }
    );
    assert_eq!(err.classification(), FailureClass::Transient);
}

#[tokio::test(start_paused = true)]
async fn test_descriptor_limit_caps_a_larger_budget() {
    let registry = registry();
    register_sleeper(
        &registry,
        CapabilityDescriptor::new("capped", 1).max_duration(Duration::from_secs(2)),
        Duration::from_secs(3),
    );

    let budget = InvocationBudget::with_duration(Duration::from_secs(30));
    let err = registry
        .invoke("capped", json!({}), Some(budget))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Timeout { limit_ms: 2000, .. }));
}

#[tokio::test]
async fn test_panicking_capability_is_contained() {
    let registry = registry();
    registry
        .register(
            CapabilityDescriptor::new("explode", 1),
            Arc::new(FnHandler::new(|_params: Value, _| async move {
                if true {
                    panic!("kaboom");
                }
                Ok::<_, CapabilityFault>(Value::Null)
            })),
        )
        .unwrap();

    let err = registry.invoke("explode", json!({}), None).await.unwrap_err();
    match err {
        RegistryError::Execution { class, cause, .. } => {
            assert_eq!(class, FailureClass::Permanent);
            assert!(cause.contains("kaboom"));
        }
        other => panic!("expected execution error, got {other:?}"),
    }

    // The registry keeps serving after a capability panics.
    assert!(registry
        .invoke(ANALYZE_DATA, json!({"data": [], "analysis_type": "summary"}), None)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_transient_fault_keeps_its_class() {
    let registry = registry();
    registry
        .register(
            CapabilityDescriptor::new("flaky", 1),
            Arc::new(FnHandler::new(|_params: Value, _| async move {
                Err::<Value, _>(CapabilityFault::transient("upstream 503"))
            })),
        )
        .unwrap();

    let err = registry.invoke("flaky", json!({}), None).await.unwrap_err();
    assert_eq!(err.classification(), FailureClass::Transient);
    assert!(err.to_string().contains("upstream 503"));
}

#[tokio::test]
async fn test_oversized_output_is_resource_exceeded() {
    let registry = registry();
    registry
        .register(
            CapabilityDescriptor::new("chatty", 1).max_memory_bytes(64),
            Arc::new(FnHandler::new(|_params: Value, _| async move {
                Ok::<_, CapabilityFault>(json!({"blob": "x".repeat(1024)}))
            })),
        )
        .unwrap();

    let err = registry.invoke("chatty", json!({}), None).await.unwrap_err();
    assert_eq!(err.code(), "resource_exceeded");
}

#[tokio::test]
async fn test_output_contract_violation_is_permanent_execution_error() {
    let registry = registry();
    registry
        .register(
            evaluation_descriptor(),
            Arc::new(FnHandler::new(|_params: Value, _| async move {
                Ok::<_, CapabilityFault>(json!({"passed": "yes"}))
            })),
        )
        .unwrap();

    let err = registry
        .invoke(
            "evaluate_capability_set",
            json!({"current": {}, "shadow": {}, "baseline": 0.5}),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "execution_error");
    assert_eq!(err.classification(), FailureClass::Permanent);
}

#[tokio::test]
async fn test_default_evaluator_projects_gain_and_penalises_removals() {
    let registry = registry();
    let current = json!({"a": {"version": 1, "config": {}}, "b": {"version": 1, "config": {}}});

    let grown = registry
        .invoke(
            "evaluate_capability_set",
            json!({
                "current": current,
                "shadow": {"a": {"version": 1, "config": {}}, "b": {"version": 1, "config": {}},
                           "c": {"version": 1, "config": {}}},
                "baseline": 0.4,
                "expected_gain": 0.1,
            }),
            None,
        )
        .await
        .unwrap();
    assert_eq!(grown["passed"], true);
    assert!((grown["projected_score"].as_f64().unwrap() - 0.5).abs() < 1e-9);

    let shrunk = registry
        .invoke(
            "evaluate_capability_set",
            json!({
                "current": current,
                "shadow": {"a": {"version": 1, "config": {}}},
                "baseline": 0.4,
            }),
            None,
        )
        .await
        .unwrap();
    assert_eq!(shrunk["passed"], false);
    assert!((shrunk["projected_score"].as_f64().unwrap() - 0.35).abs() < 1e-9);
}

#[tokio::test]
async fn test_same_version_with_new_contract_conflicts() {
    let registry = registry();
    let changed = CapabilityDescriptor::new(ANALYZE_DATA, 1).input(
        Contract::new().param("rows", ParamSpec::required(ParamType::Array)),
    );
    let err = registry
        .register(
            changed.clone(),
            Arc::new(FnHandler::new(|params: Value, _| async move {
                Ok::<_, CapabilityFault>(params)
            })),
        )
        .unwrap_err();
    assert!(matches!(err, RegistryError::Conflict { version: 1, .. }));

    // A new version is fine and becomes the default.
    let v2 = CapabilityDescriptor {
        version: 2,
        ..changed
    };
    registry
        .register(
            v2,
            Arc::new(FnHandler::new(|params: Value, _| async move {
                Ok::<_, CapabilityFault>(params)
            })),
        )
        .unwrap();
    assert_eq!(registry.descriptor(ANALYZE_DATA).unwrap().version, 2);
    let out = registry
        .invoke(ANALYZE_DATA, json!({"rows": [1]}), None)
        .await
        .unwrap();
    assert_eq!(out, json!({"rows": [1]}));
}
