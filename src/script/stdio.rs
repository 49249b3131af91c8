//! Routes Python `print` output into the host logger.
//!
//! The interpreter's `sys.stdout` and `sys.stderr` are replaced with these
//! adapters at host initialization. Output is line-buffered so one script
//! `print` becomes one log line; adapter-side problems are swallowed so a
//! logging hiccup can never crash user code.

use std::sync::Mutex;

use pyo3::prelude::*;
use tracing::{info, warn};

const TARGET: &str = "script";

#[pyclass]
struct StreamAdapter {
    stderr: bool,
    pending: Mutex<String>,
}

impl StreamAdapter {
    fn new(stderr: bool) -> Self {
        Self {
            stderr,
            pending: Mutex::new(String::new()),
        }
    }

    fn emit(&self, line: &str) {
        if line.is_empty() {
            return;
        }
        if self.stderr {
            warn!(target: TARGET, "{line}");
        } else {
            info!(target: TARGET, "{line}");
        }
    }
}

#[pymethods]
impl StreamAdapter {
    fn write(&self, text: &str) -> usize {
        let Ok(mut pending) = self.pending.lock() else {
            return text.len();
        };
        pending.push_str(text);
        while let Some(pos) = pending.find('\n') {
            let line: String = pending.drain(..=pos).collect();
            self.emit(line.trim_end_matches('\n'));
        }
        text.len()
    }

    fn flush(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            if !pending.is_empty() {
                let line = std::mem::take(&mut *pending);
                self.emit(&line);
            }
        }
    }

    fn isatty(&self) -> bool {
        false
    }

    #[getter]
    fn encoding(&self) -> &'static str {
        "utf-8"
    }
}

pub(crate) fn install(py: Python<'_>) -> PyResult<()> {
    let sys = py.import_bound("sys")?;
    sys.setattr("stdout", Py::new(py, StreamAdapter::new(false))?)?;
    sys.setattr("stderr", Py::new(py, StreamAdapter::new(true))?)?;
    Ok(())
}
