//! Linear arithmetic flow: artifacts carried from step to step.

use log::info;

use crate::execution::step::StepContext;
use crate::workflow::{Flow, HandlerRegistry, ParamKind, Parameter, StepDefinition, StepResult};

fn start(ctx: &mut StepContext) -> StepResult {
    let value: i64 = ctx.require("start_value")?;
    ctx.set("value", value);
    ctx.set("history", vec![value]);
    info!("[start] value = {}", value);
    Ok(())
}

/// Applies `op` to `value` and appends the result to `history`.
fn apply(ctx: &mut StepContext, op: impl Fn(i64) -> i64) -> StepResult {
    let value = op(ctx.require::<i64>("value")?);
    let mut history: Vec<i64> = ctx.require("history")?;
    history.push(value);

    info!("[{}] value = {}", ctx.step(), value);
    ctx.set("value", value);
    ctx.set("history", history);
    Ok(())
}

fn add(ctx: &mut StepContext) -> StepResult {
    apply(ctx, |v| v + 10)
}

fn subtract(ctx: &mut StepContext) -> StepResult {
    apply(ctx, |v| v - 20)
}

fn multiply(ctx: &mut StepContext) -> StepResult {
    apply(ctx, |v| v * 5)
}

fn end(ctx: &mut StepContext) -> StepResult {
    let history: Vec<i64> = ctx.require("history")?;
    let total: i64 = history.iter().sum();
    let average = total as f64 / history.len().max(1) as f64;

    info!("History : {:?}", history);
    info!("Sum     : {}", total);
    info!("Average : {:.2}", average);

    ctx.set("total", total);
    ctx.set("average", average);
    Ok(())
}

pub fn flow() -> Flow {
    Flow::new("artifacts")
        .with_parameter(
            Parameter::new("start_value", ParamKind::Int, 1).with_help("Initial number for the arithmetic flow"),
        )
        .with_step(StepDefinition::new("start", start).then("add"))
        .with_step(StepDefinition::new("add", add).then("subtract"))
        .with_step(StepDefinition::new("subtract", subtract).then("multiply"))
        .with_step(StepDefinition::new("multiply", multiply).then("end"))
        .with_step(StepDefinition::new("end", end))
}

pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register("start", start)
        .register("add", add)
        .register("subtract", subtract)
        .register("multiply", multiply)
        .register("end", end);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::Engine;
    use crate::workflow::Parameters;
    use serde_json::json;

    #[test]
    fn test_artifacts_flow() {
        let result = Engine::new(flow())
            .run(Parameters::new().with("start_value", 3))
            .unwrap();
        let artifacts = result.artifacts.clone().unwrap();

        // 3 -> 13 -> -7 -> -35
        assert_eq!(artifacts.get("history"), Some(&json!([3, 13, -7, -35])));
        assert_eq!(artifacts.get("value"), Some(&json!(-35)));
        assert_eq!(artifacts.get("total"), Some(&json!(-26)));
        assert_eq!(artifacts.get("average"), Some(&json!(-6.5)));
    }

    #[test]
    fn test_artifacts_default_start_value() {
        let result = Engine::new(flow()).run(Parameters::new()).unwrap();
        let artifacts = result.artifacts.clone().unwrap();
        assert_eq!(artifacts.get("history"), Some(&json!([1, 11, -9, -45])));
    }
}
