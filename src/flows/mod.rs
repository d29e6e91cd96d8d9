//! Built-in Flows
//!
//! Small demonstration flows runnable from the command line. Each module
//! exposes `flow()` (the declared graph) and `registry()` (its handlers by
//! name, for binding YAML manifests).

pub mod artifacts;
pub mod branches;
pub mod csv_inspect;
pub mod squares;
pub mod students;

use crate::workflow::{Flow, HandlerRegistry};

/// A named, runnable flow.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinFlow {
    pub name: &'static str,
    pub description: &'static str,
    pub build: fn() -> Flow,
    pub registry: fn() -> HandlerRegistry,
}

/// All built-in flows, in display order.
pub fn catalog() -> Vec<BuiltinFlow> {
    vec![
        BuiltinFlow {
            name: "artifacts",
            description: "Linear arithmetic on start_value with history, sum and average",
            build: artifacts::flow,
            registry: artifacts::registry,
        },
        BuiltinFlow {
            name: "branches",
            description: "Static branch (add / multiply) joined and summed",
            build: branches::flow,
            registry: branches::registry,
        },
        BuiltinFlow {
            name: "squares",
            description: "Flaky service with retries, then foreach squaring of a JSON list",
            build: squares::flow,
            registry: squares::registry,
        },
        BuiltinFlow {
            name: "students",
            description: "Mock roster fanned out per student, scores bumped and totalled",
            build: students::flow,
            registry: students::registry,
        },
        BuiltinFlow {
            name: "csv_inspect",
            description: "Validates a CSV file parameter and reports its shape",
            build: csv_inspect::flow,
            registry: csv_inspect::registry,
        },
    ]
}

/// Looks up a built-in flow by name.
pub fn builtin(name: &str) -> Option<BuiltinFlow> {
    catalog().into_iter().find(|b| b.name == name)
}
