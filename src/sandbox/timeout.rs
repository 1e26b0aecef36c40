//! Wall-clock resource boundary around one execution.
//!
//! Enforcement is SIGALRM-based and therefore best-effort: CPython only
//! allows installing signal handlers on the main interpreter thread. When a
//! tool call is dispatched from a worker thread (a realistic situation with
//! orchestration frameworks), the boundary degrades to a no-op and says so
//! in the logs instead of pretending to enforce the limit.

use std::time::Duration;

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use tracing::{debug, warn};

use crate::error::SandboxTimeoutError;

/// SIGALRM handler installed for the duration of one execution. Raises
/// [`SandboxTimeoutError`] with the configured bound in the message.
#[pyclass]
struct AlarmHandler {
    limit_secs: u64,
}

#[pymethods]
impl AlarmHandler {
    #[pyo3(signature = (_signum, _frame))]
    fn __call__(&self, _signum: i32, _frame: Option<Py<PyAny>>) -> PyResult<()> {
        Err(SandboxTimeoutError::new_err(format!(
            "code execution exceeded the {} second limit",
            self.limit_secs
        )))
    }
}

/// An armed (or degraded) execution timer.
///
/// Must be disarmed on every exit path; leaking an armed alarm into an
/// unrelated later call would interrupt it at a random point.
pub(crate) struct TimeoutGuard {
    armed: bool,
}

impl TimeoutGuard {
    /// Arms a SIGALRM timer for `limit`.
    ///
    /// Off the main interpreter thread this returns an unarmed guard and
    /// logs a warning; the caller proceeds unbounded by design.
    pub(crate) fn arm(py: Python<'_>, limit: Duration) -> PyResult<Self> {
        // alarm(2) has whole-second granularity and alarm(0) means disarm.
        let limit_secs = limit.as_secs().max(1);

        let signal = py.import("signal")?;
        let sigalrm = signal.getattr("SIGALRM")?;
        let handler = Py::new(py, AlarmHandler { limit_secs })?;

        match signal.call_method1("signal", (&sigalrm, handler)) {
            Ok(_) => {
                signal.call_method1("alarm", (limit_secs,))?;
                debug!(limit_secs, "execution timer armed");
                Ok(Self { armed: true })
            }
            Err(err) if err.is_instance_of::<PyValueError>(py) => {
                warn!(
                    limit_secs,
                    "wall-clock timeout unavailable off the main interpreter thread; \
                     this execution runs unbounded"
                );
                Ok(Self { armed: false })
            }
            Err(err) => Err(err),
        }
    }

    /// Disarms the timer. Safe to call on a degraded guard.
    pub(crate) fn disarm(&mut self, py: Python<'_>) {
        if !self.armed {
            return;
        }
        self.armed = false;
        if let Ok(signal) = py.import("signal") {
            let _ = signal.call_method1("alarm", (0u64,));
        }
        debug!("execution timer disarmed");
    }
}

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        debug_assert!(!self.armed, "TimeoutGuard dropped while still armed");
    }
}
