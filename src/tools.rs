//! Tool-facing string layer.
//!
//! The agent orchestration consumes plain strings: whatever happens inside
//! the sandbox, these functions produce a short human-readable result and
//! never panic or return `Err`. Formatted output is capped at the
//! configured maximum size.

use pyo3::prelude::*;
use pyo3::types::PyDict;
use tracing::debug;

use crate::chart::ChartRenderer;
use crate::sandbox::{ExecutionOutcome, PythonSandbox};

/// Marker appended when a formatted result was cut at the output cap.
const TRUNCATION_MARKER: &str = "... (output truncated)";

/// Executes analysis code and formats the outcome for the agent.
///
/// Expressions come back as their value, statement sequences as the dict
/// of newly introduced variables, and side-effect-only snippets as a fixed
/// success line. Every error becomes a one-line failure message.
pub fn run_code(sandbox: &PythonSandbox, code: &str) -> String {
    match sandbox.execute(code, None) {
        Ok(outcome) => format_outcome(sandbox, &outcome),
        Err(err) => format!("Code execution failed: {err}"),
    }
}

/// Executes charting code and persists the figure bound to `var_name`.
///
/// Returns a markdown image reference on success or a descriptive message
/// on failure; see [`ChartRenderer::render`].
pub fn render_chart(
    renderer: &ChartRenderer,
    sandbox: &PythonSandbox,
    code: &str,
    var_name: &str,
) -> String {
    renderer.render(sandbox, code, var_name)
}

fn format_outcome(sandbox: &PythonSandbox, outcome: &ExecutionOutcome) -> String {
    let limit = sandbox.config().max_output_size;
    let rendered = Python::attach(|py| match outcome {
        ExecutionOutcome::Value(value) => py_str(value.bind(py)),
        ExecutionOutcome::Bindings(bindings) => {
            let dict = PyDict::new(py);
            for (name, value) in bindings {
                if dict.set_item(name, value.clone_ref(py)).is_err() {
                    return String::from("<unprintable value>");
                }
            }
            py_str(dict.as_any())
        }
        ExecutionOutcome::Unit => String::from("Code executed successfully."),
    });
    truncate(&rendered, limit)
}

fn py_str(value: &Bound<'_, PyAny>) -> String {
    value
        .str()
        .map(|s| s.to_string())
        .unwrap_or_else(|_| String::from("<unprintable value>"))
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    debug!(limit, "tool output truncated");
    let mut capped: String = text.chars().take(limit).collect();
    capped.push_str(TRUNCATION_MARKER);
    capped
}
