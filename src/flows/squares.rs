//! Foreach flow: a flaky service call guarded by retries, then one task per
//! number squaring it, joined into a list and a sum.
//!
//! `flaky_failures` makes the service fail that many attempts before it
//! answers, so retry behaviour is reproducible.

use std::time::Duration;

use log::info;
use serde_json::{json, Value};

use crate::execution::step::StepContext;
use crate::workflow::{Flow, HandlerRegistry, ParamKind, Parameter, StepDefinition, StepResult};

/// Wait between attempts of the flaky service.
pub const SERVICE_BACKOFF: Duration = Duration::from_secs(3);

const SERVICE_ATTEMPTS: u32 = 3;

fn start(ctx: &mut StepContext) -> StepResult {
    // accept a JSON list or its string form
    let numbers = match ctx.get("numbers").cloned().unwrap_or(Value::Null) {
        Value::String(raw) => serde_json::from_str(&raw)?,
        other => other,
    };
    let num_list: Vec<i64> = serde_json::from_value(numbers)?;

    info!("[start] Parsed list: {:?}", num_list);
    ctx.set("num_list", num_list);
    Ok(())
}

fn flaky_service(ctx: &mut StepContext) -> StepResult {
    let failures: u32 = ctx.require("flaky_failures")?;
    info!("[flaky_service] Calling external API (attempt {})", ctx.attempt());

    if ctx.attempt() <= failures {
        return Err("Mock service unavailable".into());
    }
    info!("[flaky_service] Service call succeeded");
    Ok(())
}

fn square(ctx: &mut StepContext) -> StepResult {
    let num = ctx
        .input()
        .and_then(Value::as_i64)
        .ok_or("square expects an integer input")?;
    let squared = num * num;

    info!("[square] {}^2 = {}", num, squared);
    ctx.set("squared", squared);
    Ok(())
}

fn join(ctx: &mut StepContext) -> StepResult {
    let squares: Vec<i64> = ctx.collect("squared")?;
    let total: i64 = squares.iter().sum();

    info!("Original list : {}", ctx.get("num_list").unwrap_or(&json!([])));
    info!("Squared list  : {:?}", squares);
    info!("Sum of squares: {}", total);

    ctx.remove("squared");
    ctx.set("squares", squares);
    ctx.set("total", total);
    Ok(())
}

fn end(_: &mut StepContext) -> StepResult {
    Ok(())
}

/// The flow with the service retried every [`SERVICE_BACKOFF`].
pub fn flow() -> Flow {
    flow_with_backoff(SERVICE_BACKOFF)
}

/// The flow with a custom wait between service attempts.
pub fn flow_with_backoff(backoff: Duration) -> Flow {
    Flow::new("squares")
        .with_parameter(
            Parameter::new("numbers", ParamKind::Json, json!([1, 2, 3]))
                .with_help("JSON list of ints, e.g. \"[1, 2, 3]\""),
        )
        .with_parameter(
            Parameter::new("flaky_failures", ParamKind::Int, 0)
                .with_help("Attempts the mock service fails before answering"),
        )
        .with_step(StepDefinition::new("start", start).then("flaky_service"))
        .with_step(
            StepDefinition::new("flaky_service", flaky_service)
                .retry(SERVICE_ATTEMPTS, backoff)
                .foreach("num_list", "square"),
        )
        .with_step(StepDefinition::new("square", square).then("join"))
        .with_step(StepDefinition::new("join", join).join().then("end"))
        .with_step(StepDefinition::new("end", end))
}

pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register("start", start)
        .register("flaky_service", flaky_service)
        .register("square", square)
        .register("join", join)
        .register("end", end);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlowError;
    use crate::execution::Engine;
    use crate::workflow::Parameters;

    fn run(params: Parameters) -> crate::execution::RunResult {
        Engine::new(flow_with_backoff(Duration::ZERO)).run(params).unwrap()
    }

    #[test]
    fn test_squares_default_numbers() {
        let result = run(Parameters::new());
        let artifacts = result.artifacts.clone().unwrap();

        assert_eq!(artifacts.get("squares"), Some(&json!([1, 4, 9])));
        assert_eq!(artifacts.get("total"), Some(&json!(14)));
        assert_eq!(artifacts.get("num_list"), Some(&json!([1, 2, 3])));
        assert!(!artifacts.contains("squared"));
    }

    #[test]
    fn test_squares_from_string_parameter() {
        let result = run(Parameters::new().with("numbers", "[10, 20]"));
        let artifacts = result.artifacts.clone().unwrap();
        assert_eq!(artifacts.get("squares"), Some(&json!([100, 400])));
        assert_eq!(artifacts.get("total"), Some(&json!(500)));
    }

    #[test]
    fn test_flaky_service_recovers() {
        let result = run(Parameters::new().with("flaky_failures", 2));
        assert!(result.is_success());
        assert_eq!(result.attempts_for("flaky_service"), 3);
    }

    #[test]
    fn test_flaky_service_exhausts_retries() {
        let result = run(Parameters::new().with("flaky_failures", 3));
        let failure = result.failure.clone().unwrap();

        assert_eq!(failure.step, "flaky_service");
        assert_eq!(failure.attempts, 3);
        assert!(matches!(failure.error, FlowError::StepExecution { .. }));
        assert!(result.tasks_for("square").is_empty());
    }

    #[test]
    fn test_squares_empty_list() {
        let result = run(Parameters::new().with("numbers", json!([])));
        let artifacts = result.artifacts.clone().unwrap();
        assert_eq!(artifacts.get("squares"), Some(&json!([])));
        assert_eq!(artifacts.get("total"), Some(&json!(0)));
    }
}
