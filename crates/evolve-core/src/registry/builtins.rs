//! Default capabilities installed into every registry.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};

use super::contract::{Contract, ParamSpec, ParamType};
use super::descriptor::CapabilityDescriptor;
use super::error::RegistryResult;
use super::handler::{CapabilityFault, FnHandler};
use super::manager::CapabilityRegistry;

pub const ANALYZE_DATA: &str = "analyze_data";
pub const GENERATE_REPORT: &str = "generate_report";
pub const AUTOMATE_TASK: &str = "automate_task";
pub const EVALUATE_CAPABILITY_SET: &str = "evaluate_capability_set";

/// Score penalty for every capability the shadow set drops.
const REMOVAL_PENALTY: f64 = 0.05;

pub fn register_defaults(registry: &CapabilityRegistry) -> RegistryResult<()> {
    registry.register(analyze_data_descriptor(), Arc::new(FnHandler::new(analyze_data)))?;
    registry.register(
        generate_report_descriptor(),
        Arc::new(FnHandler::new(|params: Value, _| async move {
            Ok::<_, CapabilityFault>(json!({
                "report_type": params["report_type"],
                "data_source": params["data_source"],
                "format": params["format"],
                "status": "generated",
                "timestamp": Utc::now().to_rfc3339(),
            }))
        })),
    )?;
    registry.register(
        automate_task_descriptor(),
        Arc::new(FnHandler::new(|params: Value, _| async move {
            Ok::<_, CapabilityFault>(json!({
                "task_type": params["task_type"],
                "parameters": params["parameters"],
                "schedule": params["schedule"],
                "status": "automated",
                "timestamp": Utc::now().to_rfc3339(),
            }))
        })),
    )?;
    registry.register(
        evaluation_descriptor(),
        Arc::new(FnHandler::new(|params, _| async move { evaluate(&params) })),
    )?;
    Ok(())
}

pub fn analyze_data_descriptor() -> CapabilityDescriptor {
    CapabilityDescriptor::new(ANALYZE_DATA, 1)
        .describe("Analyze data and generate insights")
        .category("data_analysis")
        .input(
            Contract::new()
                .param(
                    "data",
                    ParamSpec::required(ParamType::Array).describe("Data to analyze"),
                )
                .param(
                    "analysis_type",
                    ParamSpec::required(ParamType::String).one_of(["summary", "trends", "anomalies"]),
                )
                .param(
                    "output_format",
                    ParamSpec::optional(ParamType::String)
                        .default_value(json!("json"))
                        .one_of(["json", "csv", "table"]),
                ),
        )
}

async fn analyze_data(params: Value, _limits: super::EffectiveLimits) -> Result<Value, CapabilityFault> {
    let points = params["data"].as_array().map(Vec::len).unwrap_or(0);
    let analysis_type = params["analysis_type"].as_str().unwrap_or("summary");
    Ok(json!({
        "analysis_type": analysis_type,
        "data_points": points,
        "insights": format!("Generated {analysis_type} analysis for {points} data points"),
        "output_format": params["output_format"],
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

pub fn generate_report_descriptor() -> CapabilityDescriptor {
    CapabilityDescriptor::new(GENERATE_REPORT, 1)
        .describe("Generate business reports")
        .category("report_generation")
        .input(
            Contract::new()
                .param(
                    "report_type",
                    ParamSpec::required(ParamType::String)
                        .one_of(["performance", "financial", "operational"]),
                )
                .param(
                    "data_source",
                    ParamSpec::required(ParamType::String).describe("Source of report data"),
                )
                .param(
                    "format",
                    ParamSpec::optional(ParamType::String)
                        .default_value(json!("pdf"))
                        .one_of(["pdf", "html", "excel"]),
                ),
        )
}

pub fn automate_task_descriptor() -> CapabilityDescriptor {
    CapabilityDescriptor::new(AUTOMATE_TASK, 1)
        .describe("Automate repetitive tasks")
        .category("task_automation")
        .input(
            Contract::new()
                .param(
                    "task_type",
                    ParamSpec::required(ParamType::String)
                        .one_of(["data_processing", "email", "file_management"]),
                )
                .param(
                    "parameters",
                    ParamSpec::required(ParamType::Object).describe("Task parameters"),
                )
                .param(
                    "schedule",
                    ParamSpec::optional(ParamType::String)
                        .default_value(json!("immediate"))
                        .one_of(["immediate", "daily", "weekly"]),
                ),
        )
}

/// Held-out evaluation used by the Validate stage. Replacing its handler
/// (same contract, same version) swaps the evaluator.
pub fn evaluation_descriptor() -> CapabilityDescriptor {
    CapabilityDescriptor::new(EVALUATE_CAPABILITY_SET, 1)
        .describe("Project the score of a shadow capability set")
        .category("evaluation")
        .input(
            Contract::new()
                .param("current", ParamSpec::required(ParamType::Object))
                .param("shadow", ParamSpec::required(ParamType::Object))
                .param(
                    "baseline",
                    ParamSpec::required(ParamType::Number).range(Some(0.0), Some(1.0)),
                )
                .param(
                    "expected_gain",
                    ParamSpec::optional(ParamType::Number).default_value(json!(0.0)),
                ),
        )
        .output(
            Contract::new()
                .param("passed", ParamSpec::required(ParamType::Boolean))
                .param("projected_score", ParamSpec::required(ParamType::Number)),
        )
}

/// baseline + expected gain, minus a penalty per dropped capability,
/// clamped to [0, 1]. Passes when the projection does not fall below the
/// baseline and the shadow set is non-empty.
fn evaluate(params: &Value) -> Result<Value, CapabilityFault> {
    let current = params["current"]
        .as_object()
        .ok_or_else(|| CapabilityFault::permanent("current must be an object"))?;
    let shadow = params["shadow"]
        .as_object()
        .ok_or_else(|| CapabilityFault::permanent("shadow must be an object"))?;
    let baseline = params["baseline"].as_f64().unwrap_or(0.0);
    let gain = params["expected_gain"].as_f64().unwrap_or(0.0);

    let removed = current.keys().filter(|k| !shadow.contains_key(*k)).count();
    let projected = (baseline + gain - REMOVAL_PENALTY * removed as f64).clamp(0.0, 1.0);
    let passed = !shadow.is_empty() && projected >= baseline;

    Ok(json!({
        "passed": passed,
        "projected_score": projected,
        "removed": removed,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> CapabilityRegistry {
        let reg = CapabilityRegistry::new(Duration::from_secs(5), 1 << 20, 32);
        register_defaults(&reg).unwrap();
        reg
    }

    #[tokio::test]
    async fn analyze_data_fills_default_format() {
        let out = registry()
            .invoke(ANALYZE_DATA, json!({"data": [1, 2, 3], "analysis_type": "trends"}), None)
            .await
            .unwrap();
        assert_eq!(out["data_points"], 3);
        assert_eq!(out["output_format"], "json");
    }

    #[tokio::test]
    async fn automate_task_rejects_bad_schedule() {
        let err = registry()
            .invoke(
                AUTOMATE_TASK,
                json!({"task_type": "email", "parameters": {}, "schedule": "hourly"}),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "contract_violation");
    }

    #[tokio::test]
    async fn evaluation_rewards_gain_and_penalizes_removal() {
        let reg = registry();
        let out = reg
            .invoke(
                EVALUATE_CAPABILITY_SET,
                json!({
                    "current": {"a": {}, "b": {}},
                    "shadow": {"a": {}, "b": {}, "c": {}},
                    "baseline": 0.5,
                    "expected_gain": 0.1
                }),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out["passed"], true);
        assert!((out["projected_score"].as_f64().unwrap() - 0.6).abs() < 1e-9);

        let out = reg
            .invoke(
                EVALUATE_CAPABILITY_SET,
                json!({"current": {"a": {}, "b": {}}, "shadow": {"a": {}}, "baseline": 0.5}),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out["passed"], false);
    }

    #[test]
    fn defaults_cover_four_categories() {
        let cats = registry().categories();
        assert_eq!(
            cats,
            vec!["data_analysis", "evaluation", "report_generation", "task_automation"]
        );
    }
}
