//! File parameter flow: checks that the supplied text is well-formed CSV and
//! records its shape.

use log::{info, warn};

use crate::execution::step::StepContext;
use crate::workflow::{Flow, HandlerRegistry, ParamKind, Parameter, StepDefinition, StepResult};

/// Splits CSV text into records, honouring double-quoted fields. Quoted
/// fields may contain commas, doubled quotes and line breaks.
fn parse_records(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => record.push(std::mem::take(&mut field)),
            '\r' if !quoted && chars.peek() == Some(&'\n') => {}
            '\n' if !quoted => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    records
}

/// Shape of a parsed CSV document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvShape {
    pub rows: usize,
    pub cols: usize,
}

/// Parses `text`, requiring every row to have the same number of columns.
pub fn inspect(text: &str) -> Result<CsvShape, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("CSV is empty".to_string());
    }

    let widths: Vec<usize> = parse_records(text).iter().map(Vec::len).collect();
    let Some(&cols) = widths.first() else {
        return Err("CSV has no records".to_string());
    };
    if let Some(row) = widths.iter().position(|&w| w != cols) {
        return Err(format!(
            "inconsistent column counts (row {} has {}, expected {})",
            row + 1,
            widths[row],
            cols
        ));
    }

    Ok(CsvShape {
        rows: widths.len(),
        cols,
    })
}

fn start(ctx: &mut StepContext) -> StepResult {
    let text = ctx.get("file").and_then(|v| v.as_str()).unwrap_or("").to_string();

    match inspect(&text) {
        Ok(shape) => {
            info!("Parsed OK - rows: {}, cols: {}", shape.rows, shape.cols);
            ctx.set("n_rows", shape.rows);
            ctx.set("n_cols", shape.cols);
            ctx.set("valid", true);
        }
        Err(reason) => {
            warn!("Couldn't parse CSV - {}", reason);
            ctx.set("error", reason);
            ctx.set("valid", false);
        }
    }
    Ok(())
}

fn end(ctx: &mut StepContext) -> StepResult {
    if !ctx.require::<bool>("valid")? {
        warn!("Flow completed with CSV errors; see logs above.");
    }
    Ok(())
}

pub fn flow() -> Flow {
    Flow::new("csv_inspect")
        .with_parameter(
            Parameter::new("file", ParamKind::File, "").with_help("A CSV file to inspect (pass via file=@<path>)"),
        )
        .with_step(StepDefinition::new("start", start).then("end"))
        .with_step(StepDefinition::new("end", end))
}

pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("start", start).register("end", end);
    registry
}
