//! Script step: hosts one user script and invokes its `step` function per
//! iteration.
//!
//! Awaken executes the script's top level in a fresh namespace, checks that
//! `step` is a function taking 0 or 1 parameter (the count is cached for
//! invoke), detects an optional zero-parameter `end`, and injects every
//! managed variable the script declares a top-level binding for. After each
//! `step` call those bindings are refreshed, so the next invocation sees
//! current values.

use std::fs;
use std::path::PathBuf;

use pyo3::prelude::*;
use tracing::warn;

use crate::error::{Error, Result};
use crate::pipeline::step::Step;
use crate::script::{CallableInfo, ManagedVariable, ModuleSource, ScriptHost};
use crate::sync::CancelToken;

pub struct ScriptStep {
    path: PathBuf,
    label: String,
    host: Option<&'static ScriptHost>,
    module_key: Option<String>,
    step_arity: u32,
    has_end: bool,
    variables: Vec<Box<dyn ManagedVariable>>,
    /// Indices of variables the script declares a binding for; fixed at
    /// awaken.
    injected: Vec<usize>,
    ended: bool,
}

impl ScriptStep {
    pub fn new(path: PathBuf, variables: Vec<Box<dyn ManagedVariable>>) -> Self {
        let label = format!(
            "script {}",
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string())
        );
        Self {
            path,
            label,
            host: None,
            module_key: None,
            step_arity: 0,
            has_end: false,
            variables,
            injected: Vec::new(),
            ended: false,
        }
    }

    /// Calls the script's `step` with the previous step's value. An absent
    /// value is forwarded as the runtime's `None` when `step` takes a
    /// parameter, and ignored when it takes none.
    pub fn invoke(&mut self, arg: Option<&Py<PyAny>>) -> Result<Py<PyAny>> {
        let (host, key) = self.hosted()?;
        let key = key.to_string();
        host.acquire(|py| {
            let out = if self.step_arity == 0 {
                host.call_function(py, &key, "step", &[])?
            } else {
                let arg = match arg {
                    Some(value) => value.bind(py).clone(),
                    None => host.none(py).into_bound(py),
                };
                host.call_function(py, &key, "step", &[arg])?
            };

            for &index in &self.injected {
                let variable = &mut self.variables[index];
                let value = variable.per_step_value(py);
                host.set_global(py, &key, variable.name(), value.bind(py))?;
            }

            Ok(out.unbind())
        })
    }

    fn hosted(&self) -> Result<(&'static ScriptHost, &str)> {
        match (self.host, &self.module_key) {
            (Some(host), Some(key)) => Ok((host, key)),
            _ => Err(Error::Script(format!(
                "{} is not awakened",
                self.label
            ))),
        }
    }

    fn inspect_namespace(&mut self, py: Python<'_>, host: &'static ScriptHost, key: &str) -> Result<()> {
        self.step_arity = match host.callable_info(py, key, "step")? {
            CallableInfo::Function { arity: arity @ (0 | 1) } => arity,
            CallableInfo::Function { arity } => {
                return Err(Error::Script(format!(
                    "{}: `step` must take 0 or 1 parameter(s), found {arity}",
                    self.path.display()
                )));
            }
            CallableInfo::Missing => {
                return Err(Error::Script(format!(
                    "{}: script must define a `step` function",
                    self.path.display()
                )));
            }
            CallableInfo::NotCallable => {
                return Err(Error::Script(format!(
                    "{}: `step` is not callable",
                    self.path.display()
                )));
            }
            CallableInfo::Native => {
                return Err(Error::Script(format!(
                    "{}: `step` must be a plain Python function",
                    self.path.display()
                )));
            }
        };

        self.has_end = host.is_function(py, key, "end", 0)?;

        for index in 0..self.variables.len() {
            let name = self.variables[index].name().to_string();
            if host.is_global(py, key, &name)? {
                let value = self.variables[index].initial_value(py);
                host.set_global(py, key, &name, value.bind(py))?;
                self.injected.push(index);
            }
        }
        Ok(())
    }
}

impl Step for ScriptStep {
    fn label(&self) -> &str {
        &self.label
    }

    fn set_cancel(&mut self, _cancel: CancelToken) {
        // Script invocation is synchronous; cancellation between steps is
        // the driver's job.
    }

    fn awaken(&mut self) -> Result<()> {
        let host = ScriptHost::instance()?;
        let source = fs::read_to_string(&self.path).map_err(|e| {
            Error::Script(format!("failed to read {}: {e}", self.path.display()))
        })?;
        let prefix = self
            .path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "script".into());

        host.acquire(|py| {
            let key = host.add_module_auto_key(py, &prefix, ModuleSource::Code(&source))?;
            if let Err(e) = self.inspect_namespace(py, host, &key) {
                host.remove_module(py, &key);
                return Err(e);
            }
            self.module_key = Some(key);
            Ok(())
        })?;
        self.host = Some(host);
        Ok(())
    }

    fn end(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;

        let (Some(host), Some(key)) = (self.host.take(), self.module_key.take()) else {
            return;
        };
        host.acquire(|py| {
            if self.has_end {
                if let Err(e) = host.call_function(py, &key, "end", &[]) {
                    warn!("{}: end hook failed: {e}", self.label);
                }
            }
            host.remove_module(py, &key);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::DeltaTime;
    use crate::script::host::host_for_tests;
    use std::thread;
    use std::time::Duration;

    fn write_script(source: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("step.py");
        fs::write(&path, source).unwrap();
        (dir, path)
    }

    fn awakened(source: &str, variables: Vec<Box<dyn ManagedVariable>>) -> (tempfile::TempDir, ScriptStep) {
        host_for_tests();
        let (dir, path) = write_script(source);
        let mut step = ScriptStep::new(path, variables);
        step.awaken().unwrap();
        (dir, step)
    }

    #[test]
    fn test_counter_script_runs_three_iterations() {
        let (_dir, mut step) = awakened(
            "counter = 0\n\ndef step():\n    global counter\n    counter += 1\n    return counter\n",
            Vec::new(),
        );

        let host = ScriptHost::instance().unwrap();
        let mut last = 0i64;
        for _ in 0..3 {
            let out = step.invoke(None).unwrap();
            last = host.acquire(|py| out.extract::<i64>(py).unwrap());
        }
        assert_eq!(last, 3);
        step.end();
    }

    #[test]
    fn test_unary_step_receives_none_for_absent_input() {
        let (_dir, mut step) = awakened("def step(value):\n    return value is None\n", Vec::new());
        let host = ScriptHost::instance().unwrap();
        let out = step.invoke(None).unwrap();
        assert!(host.acquire(|py| out.extract::<bool>(py).unwrap()));
        step.end();
    }

    #[test]
    fn test_unary_step_receives_previous_value() {
        let (_dir, mut step) = awakened("def step(value):\n    return value * 2\n", Vec::new());
        let host = ScriptHost::instance().unwrap();
        let arg = host.acquire(|py| 21i64.into_py(py));
        let out = step.invoke(Some(&arg)).unwrap();
        assert_eq!(host.acquire(|py| out.extract::<i64>(py).unwrap()), 42);
        step.end();
    }

    #[test]
    fn test_delta_time_binding_is_injected_and_refreshed() {
        let (_dir, mut step) = awakened(
            "delta_time = -1.0\n\ndef step():\n    return delta_time\n",
            vec![Box::new(DeltaTime::new())],
        );
        let host = ScriptHost::instance().unwrap();

        // The awaken-time injection replaced the script's own value.
        let first = step.invoke(None).unwrap();
        assert_eq!(host.acquire(|py| first.extract::<f64>(py).unwrap()), 0.0);

        thread::sleep(Duration::from_millis(15));
        let second = step.invoke(None).unwrap();
        assert!(host.acquire(|py| second.extract::<f64>(py).unwrap()) >= 0.015);
        step.end();
    }

    #[test]
    fn test_scripts_without_binding_skip_injection() {
        let (_dir, mut step) = awakened(
            "def step():\n    return 'delta_time' in globals()\n",
            vec![Box::new(DeltaTime::new())],
        );
        let host = ScriptHost::instance().unwrap();
        let out = step.invoke(None).unwrap();
        assert!(!host.acquire(|py| out.extract::<bool>(py).unwrap()));
        step.end();
    }

    #[test]
    fn test_missing_step_function_is_fatal() {
        host_for_tests();
        let (_dir, path) = write_script("value = 1\n");
        let mut step = ScriptStep::new(path, Vec::new());
        let err = step.awaken().unwrap_err();
        assert!(err.to_string().contains("must define a `step` function"));
    }

    #[test]
    fn test_wrong_arity_is_fatal() {
        host_for_tests();
        let (_dir, path) = write_script("def step(a, b):\n    return a\n");
        let mut step = ScriptStep::new(path, Vec::new());
        let err = step.awaken().unwrap_err();
        assert!(err.to_string().contains("0 or 1 parameter(s)"));
    }

    #[test]
    fn test_top_level_error_is_fatal() {
        host_for_tests();
        let (_dir, path) = write_script("raise RuntimeError('broken import')\n");
        let mut step = ScriptStep::new(path, Vec::new());
        assert!(step.awaken().is_err());
    }

    #[test]
    fn test_end_hook_runs_and_errors_are_suppressed() {
        host_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ended.txt");
        let source = format!(
            "def step():\n    return None\n\ndef end():\n    open(r'{}', 'w').write('done')\n    raise RuntimeError('after the write')\n",
            marker.display()
        );
        let path = dir.path().join("step.py");
        fs::write(&path, source).unwrap();

        let mut step = ScriptStep::new(path, Vec::new());
        step.awaken().unwrap();
        step.invoke(None).unwrap();
        step.end();
        step.end();
        assert_eq!(fs::read_to_string(&marker).unwrap(), "done");
    }

    #[test]
    fn test_runtime_error_in_step_is_surfaced() {
        let (_dir, mut step) = awakened(
            "def step():\n    raise ValueError('bad value')\n",
            Vec::new(),
        );
        let err = step.invoke(None).unwrap_err();
        assert!(err.to_string().contains("bad value"));
        step.end();
    }
}
