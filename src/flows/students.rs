//! Roster flow: fan out over a list of students, bump every score, total
//! the results.

use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::execution::step::StepContext;
use crate::workflow::{Flow, HandlerRegistry, ParamKind, Parameter, StepDefinition, StepResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub name: String,
    pub score: i64,
}

/// Fixed roster used in place of a generated one.
pub fn mock_roster() -> Vec<Student> {
    [("ada", 71), ("brook", 58), ("chen", 92), ("dara", 45), ("emil", 83)]
        .into_iter()
        .map(|(name, score)| Student {
            name: name.to_string(),
            score,
        })
        .collect()
}

fn start(ctx: &mut StepContext) -> StepResult {
    let students = mock_roster();
    info!("[start] Mock students: {}", json!(students));
    ctx.set("students", serde_json::to_value(students)?);
    Ok(())
}

fn process_student(ctx: &mut StepContext) -> StepResult {
    let increase: i64 = ctx.require("increase")?;
    let mut student: Student = serde_json::from_value(ctx.input().cloned().unwrap_or_default())?;

    student.name = student.name.to_uppercase();
    student.score += increase;
    info!("[process] {} -> {}", student.name, student.score);

    ctx.set("updated", serde_json::to_value(student)?);
    Ok(())
}

fn join(ctx: &mut StepContext) -> StepResult {
    let updated: Vec<Student> = ctx.collect("updated")?;
    let total: i64 = updated.iter().map(|s| s.score).sum();

    for student in &updated {
        info!("{:<8} {}", student.name, student.score);
    }
    info!("Total score: {}", total);

    ctx.remove("updated");
    ctx.set("updated_students", serde_json::to_value(updated)?);
    ctx.set("total_score", total);
    Ok(())
}

fn end(_: &mut StepContext) -> StepResult {
    Ok(())
}

pub fn flow() -> Flow {
    Flow::new("students")
        .with_parameter(
            Parameter::new("increase", ParamKind::Int, 10).with_help("Points to add to each score"),
        )
        .with_step(StepDefinition::new("start", start).foreach("students", "process_student"))
        .with_step(
            StepDefinition::new("process_student", process_student)
                .retry(3, Duration::from_secs(3))
                .then("join"),
        )
        .with_step(StepDefinition::new("join", join).join().then("end"))
        .with_step(StepDefinition::new("end", end))
}

pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register("start", start)
        .register("process_student", process_student)
        .register("join", join)
        .register("end", end);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::Engine;
    use crate::workflow::Parameters;

    #[test]
    fn test_students_flow() {
        let result = Engine::new(flow())
            .run(Parameters::new().with("increase", 5))
            .unwrap();
        let artifacts = result.artifacts.clone().unwrap();

        let updated: Vec<Student> = artifacts.require("updated_students").unwrap();
        assert_eq!(updated.len(), 5);
        assert_eq!(updated[0], Student { name: "ADA".to_string(), score: 76 });
        assert_eq!(updated[4].name, "EMIL");

        let expected: i64 = mock_roster().iter().map(|s| s.score + 5).sum();
        assert_eq!(artifacts.get("total_score"), Some(&json!(expected)));
        assert_eq!(result.tasks_for("process_student").len(), 5);
    }
}
