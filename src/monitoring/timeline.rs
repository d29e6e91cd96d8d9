//! Execution Timeline
//!
//! Tracks task start, retry and finish times for generating run
//! reports and Gantt charts.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::execution::task::TaskId;

/// Type of timeline event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventType {
    /// Task started executing
    Started,
    /// An attempt failed and the task will be retried
    Retrying { attempt: u32 },
    /// Task completed successfully
    Completed,
    /// Task failed
    Failed,
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub task: TaskId,
    /// Step name plus foreach index, e.g. `square[2]`
    pub label: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Tracks the execution timeline of a run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

#[derive(Debug, Default)]
struct Span {
    label: String,
    start: u128,
    end: Option<u128>,
    retries: u32,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a task.
    pub fn add_event(&mut self, task: TaskId, label: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            task,
            label: label.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Returns the total elapsed time since timeline creation.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn spans(&self) -> Vec<(TaskId, Span)> {
        let mut spans: HashMap<TaskId, Span> = HashMap::new();

        for event in &self.events {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();
            match event.event_type {
                EventType::Started => {
                    spans.insert(
                        event.task,
                        Span {
                            label: event.label.clone(),
                            start: elapsed,
                            ..Span::default()
                        },
                    );
                }
                EventType::Retrying { .. } => {
                    if let Some(span) = spans.get_mut(&event.task) {
                        span.retries += 1;
                    }
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(span) = spans.get_mut(&event.task) {
                        span.end = Some(elapsed);
                    }
                }
            }
        }

        let mut spans: Vec<(TaskId, Span)> = spans.into_iter().collect();
        spans.sort_by_key(|(task, span)| (span.start, *task));
        spans
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Each finished task is shown as a bar indicating when it ran
    /// relative to the total execution time.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = Instant::now().duration_since(self.start_time).as_millis();

        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        for (_, span) in self.spans() {
            let Some(end) = span.end else {
                continue;
            };

            let start_pos = (span.start as f64 * scale) as usize;
            let width = ((end - span.start) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(width));

            let retries = match span.retries {
                0 => String::new(),
                1 => ", 1 retry".to_string(),
                n => format!(", {} retries", n),
            };

            output.push_str(&format!(
                "{:14} |{}| ({} ms{})\n",
                truncate(&span.label, 14),
                bar,
                end - span.start,
                retries
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// Returns finished task durations in milliseconds, keyed by label.
    ///
    /// Labels are unique per task, so foreach children are reported
    /// individually.
    pub fn get_durations(&self) -> HashMap<String, u128> {
        self.spans()
            .into_iter()
            .filter_map(|(_, span)| span.end.map(|end| (span.label, end - span.start)))
            .collect()
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates a label to a fixed width.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
