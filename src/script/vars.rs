//! Managed variables: host-owned bindings injected into script namespaces.
//!
//! A variable is injected at awaken when the script declares a top-level
//! binding of the same name, and its binding is refreshed after every
//! `step` call. Adding a new variable kind means implementing
//! [`ManagedVariable`]; the script step needs no changes.

use std::time::Instant;

use pyo3::prelude::*;

pub trait ManagedVariable: Send {
    /// Name of the script binding this variable manages.
    fn name(&self) -> &str;
    /// Value bound at awaken.
    fn initial_value(&mut self, py: Python<'_>) -> Py<PyAny>;
    /// Value bound after each `step` call.
    fn per_step_value(&mut self, py: Python<'_>) -> Py<PyAny>;
}

/// Seconds elapsed since the previous `step` invocation of the owning
/// script, as a float. `0.0` while the first invocation runs; the monotonic
/// clock starts at awaken and restarts on every read.
pub struct DeltaTime {
    last: Option<Instant>,
}

impl DeltaTime {
    pub fn new() -> Self {
        Self { last: None }
    }
}

impl Default for DeltaTime {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagedVariable for DeltaTime {
    fn name(&self) -> &str {
        "delta_time"
    }

    fn initial_value(&mut self, py: Python<'_>) -> Py<PyAny> {
        self.last = Some(Instant::now());
        0.0f64.into_py(py)
    }

    fn per_step_value(&mut self, py: Python<'_>) -> Py<PyAny> {
        let now = Instant::now();
        let delta = self
            .last
            .map(|last| now.duration_since(last).as_secs_f64())
            .unwrap_or(0.0);
        self.last = Some(now);
        delta.into_py(py)
    }
}
