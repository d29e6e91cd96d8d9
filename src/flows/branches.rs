//! Static branch flow: add and multiply in parallel, then sum.

use log::info;

use crate::execution::step::StepContext;
use crate::workflow::{Flow, HandlerRegistry, ParamKind, Parameter, StepDefinition, StepResult};

const ADD_CONST: i64 = 3;
const MULT_CONST: i64 = 2;

fn start(ctx: &mut StepContext) -> StepResult {
    let x: i64 = ctx.require("start_value")?;
    ctx.set("x", x);
    Ok(())
}

fn add_branch(ctx: &mut StepContext) -> StepResult {
    let x: i64 = ctx.require("x")?;
    ctx.set("add_result", x + ADD_CONST);
    Ok(())
}

fn mult_branch(ctx: &mut StepContext) -> StepResult {
    let x: i64 = ctx.require("x")?;
    ctx.set("mult_result", x * MULT_CONST);
    Ok(())
}

fn join(ctx: &mut StepContext) -> StepResult {
    let add_val: i64 = ctx.require("add_result")?;
    let mult_val: i64 = ctx.require("mult_result")?;
    let total = add_val + mult_val;

    info!("Add  branch result : {}", add_val);
    info!("Mult branch result : {}", mult_val);
    info!("Sum of both        : {}", total);

    ctx.set("sum_of_results", total);
    Ok(())
}

fn end(ctx: &mut StepContext) -> StepResult {
    let x: i64 = ctx.require("x")?;
    let total: i64 = ctx.require("sum_of_results")?;
    info!("Start value : {}", x);
    info!("Final sum   : {}", total);
    Ok(())
}

pub fn flow() -> Flow {
    Flow::new("branches")
        .with_parameter(Parameter::new("start_value", ParamKind::Int, 1))
        .with_step(StepDefinition::new("start", start).branch(["add_branch", "mult_branch"]))
        .with_step(StepDefinition::new("add_branch", add_branch).then("join"))
        .with_step(StepDefinition::new("mult_branch", mult_branch).then("join"))
        .with_step(StepDefinition::new("join", join).join().then("end"))
        .with_step(StepDefinition::new("end", end))
}

pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register("start", start)
        .register("add_branch", add_branch)
        .register("mult_branch", mult_branch)
        .register("join", join)
        .register("end", end);
    registry
}
