//! Process-wide bridge to the embedded Python runtime.
//!
//! Exactly one interpreter exists per process. [`ScriptHost::initialize`]
//! spins it up once (a second call is refused), extends the module search
//! path, and reroutes `sys.stdout`/`sys.stderr` into the host logger.
//!
//! Script namespaces are cached per string key; a namespace is the dict a
//! script's top level has been executed in. Every method that touches
//! interpreter state takes a [`Python`] token, so holding the runtime's
//! exclusive execution right is enforced at the type level: [`acquire`]
//! hands the token out for a scoped closure and nothing else does.
//!
//! [`acquire`]: ScriptHost::acquire

use std::collections::HashMap;
use std::fmt::Display;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use pyo3::prelude::*;
use pyo3::types::{PyDict, PyTuple};

use crate::error::{Error, Result};
use crate::script::stdio;

static INSTANCE: OnceLock<ScriptHost> = OnceLock::new();

/// Namespace content handed to [`ScriptHost::add_module`].
pub enum ModuleSource<'a> {
    /// Python source executed in a fresh namespace.
    Code(&'a str),
    /// Name of an importable module whose namespace is used directly.
    Import(&'a str),
}

/// What a namespace binding looks like when probed as a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallableInfo {
    Missing,
    NotCallable,
    /// Callable without a recorded parameter count (builtin or other native
    /// callable), so arity cannot be verified against it.
    Native,
    Function {
        arity: u32,
    },
}

pub struct ScriptHost {
    modules: Mutex<HashMap<String, Py<PyDict>>>,
    auto_key: AtomicU64,
    none: Py<PyAny>,
}

fn script_err(what: impl Display, err: PyErr) -> Error {
    Error::Script(format!("{what}: {err}"))
}

fn recorded_arity(attr: &Bound<'_, PyAny>) -> Option<u32> {
    attr.getattr("__code__")
        .ok()?
        .getattr("co_argcount")
        .ok()?
        .extract()
        .ok()
}

impl ScriptHost {
    /// Brings the interpreter up, once per process. `python_home` overrides
    /// the runtime location; `module_search_root` is appended to the module
    /// search path so user scripts can import siblings.
    pub fn initialize(
        python_home: Option<&Path>,
        module_search_root: &Path,
    ) -> Result<&'static ScriptHost> {
        if INSTANCE.get().is_some() {
            return Err(Error::Script("script host is already initialized".into()));
        }
        if let Some(home) = python_home {
            // Must be in the environment before the interpreter first spins
            // up; initialize runs before any worker thread exists.
            unsafe { std::env::set_var("PYTHONHOME", home) };
        }
        pyo3::prepare_freethreaded_python();

        let host = Python::with_gil(|py| -> Result<ScriptHost> {
            let sys = py
                .import_bound("sys")
                .map_err(|e| script_err("failed to import sys", e))?;
            let path = sys
                .getattr("path")
                .map_err(|e| script_err("failed to read module search path", e))?;
            path.call_method1("append", (module_search_root.to_string_lossy().into_owned(),))
                .map_err(|e| script_err("failed to extend module search path", e))?;
            stdio::install(py).map_err(|e| script_err("failed to install stream adapters", e))?;

            Ok(ScriptHost {
                modules: Mutex::new(HashMap::new()),
                auto_key: AtomicU64::new(0),
                none: py.None(),
            })
        })?;

        INSTANCE
            .set(host)
            .map_err(|_| Error::Script("script host is already initialized".into()))?;
        Self::instance()
    }

    pub fn instance() -> Result<&'static ScriptHost> {
        INSTANCE
            .get()
            .ok_or_else(|| Error::Script("script host is not initialized".into()))
    }

    /// Scoped acquisition of the runtime's exclusive execution right. The
    /// token passed to `f` is the proof of acquisition every other method
    /// requires. Reentrant within a thread, contended across threads.
    pub fn acquire<R>(&self, f: impl FnOnce(Python<'_>) -> R) -> R {
        Python::with_gil(f)
    }

    /// Creates and caches a namespace under `key`. Duplicate keys are fatal.
    pub fn add_module(&self, py: Python<'_>, key: &str, source: ModuleSource<'_>) -> Result<()> {
        // The check precedes execution so a duplicate key cannot re-run a
        // script's top level.
        if self.contains_module(key) {
            return Err(Error::Script(format!("duplicate module key `{key}`")));
        }
        let namespace = self.build_namespace(py, key, source)?;
        self.modules
            .lock()
            .expect("module table lock poisoned")
            .insert(key.to_string(), namespace);
        Ok(())
    }

    /// [`add_module`](Self::add_module) under a generated, unused key.
    pub fn add_module_auto_key(
        &self,
        py: Python<'_>,
        prefix: &str,
        source: ModuleSource<'_>,
    ) -> Result<String> {
        let key = loop {
            let n = self.auto_key.fetch_add(1, Ordering::Relaxed);
            let candidate = format!("{prefix}#{n}");
            if !self.contains_module(&candidate) {
                break candidate;
            }
        };
        self.add_module(py, &key, source)?;
        Ok(key)
    }

    /// Drops the namespace cached under `key`. Idempotent.
    pub fn remove_module(&self, _py: Python<'_>, key: &str) {
        self.modules
            .lock()
            .expect("module table lock poisoned")
            .remove(key);
    }

    /// Drops every cached namespace.
    pub fn clear(&self, _py: Python<'_>) {
        self.modules
            .lock()
            .expect("module table lock poisoned")
            .clear();
    }

    pub fn callable_info(&self, py: Python<'_>, key: &str, name: &str) -> Result<CallableInfo> {
        let namespace = self.namespace(py, key)?;
        let namespace = namespace.bind(py);
        let Some(attr) = namespace
            .get_item(name)
            .map_err(|e| script_err(format!("failed to look up `{name}` in `{key}`"), e))?
        else {
            return Ok(CallableInfo::Missing);
        };
        if !attr.is_callable() {
            return Ok(CallableInfo::NotCallable);
        }
        Ok(match recorded_arity(&attr) {
            Some(arity) => CallableInfo::Function { arity },
            None => CallableInfo::Native,
        })
    }

    /// True iff the module binds `name` to a callable whose recorded
    /// parameter count equals `arity`. Native callables have no recorded
    /// count and match any arity.
    pub fn is_function(&self, py: Python<'_>, key: &str, name: &str, arity: u32) -> Result<bool> {
        Ok(match self.callable_info(py, key, name)? {
            CallableInfo::Missing | CallableInfo::NotCallable => false,
            CallableInfo::Native => true,
            CallableInfo::Function { arity: recorded } => recorded == arity,
        })
    }

    pub fn call_function<'py>(
        &self,
        py: Python<'py>,
        key: &str,
        name: &str,
        args: &[Bound<'py, PyAny>],
    ) -> Result<Bound<'py, PyAny>> {
        let namespace = self.namespace(py, key)?;
        let namespace = namespace.bind(py);
        let func = namespace
            .get_item(name)
            .map_err(|e| script_err(format!("failed to look up `{name}` in `{key}`"), e))?
            .ok_or_else(|| Error::Script(format!("module `{key}` has no function `{name}`")))?;
        let tuple = PyTuple::new_bound(py, args);
        func.call1(tuple).map_err(|e| {
            script_err(
                format!(
                    "`{name}` failed with {} argument(s) in module `{key}`",
                    args.len()
                ),
                e,
            )
        })
    }

    pub fn is_global(&self, py: Python<'_>, key: &str, name: &str) -> Result<bool> {
        let namespace = self.namespace(py, key)?;
        namespace
            .bind(py)
            .contains(name)
            .map_err(|e| script_err(format!("failed to probe global `{name}` in `{key}`"), e))
    }

    pub fn set_global(
        &self,
        py: Python<'_>,
        key: &str,
        name: &str,
        value: &Bound<'_, PyAny>,
    ) -> Result<()> {
        let namespace = self.namespace(py, key)?;
        namespace
            .bind(py)
            .set_item(name, value)
            .map_err(|e| script_err(format!("failed to set global `{name}` in `{key}`"), e))
    }

    /// Cached interpreter `None`, so forwarding a null argument does not
    /// round-trip the runtime.
    pub fn none(&self, py: Python<'_>) -> Py<PyAny> {
        self.none.clone_ref(py)
    }

    fn contains_module(&self, key: &str) -> bool {
        self.modules
            .lock()
            .expect("module table lock poisoned")
            .contains_key(key)
    }

    fn namespace(&self, py: Python<'_>, key: &str) -> Result<Py<PyDict>> {
        self.modules
            .lock()
            .expect("module table lock poisoned")
            .get(key)
            .map(|namespace| namespace.clone_ref(py))
            .ok_or_else(|| Error::Script(format!("unknown module key `{key}`")))
    }

    fn build_namespace(
        &self,
        py: Python<'_>,
        key: &str,
        source: ModuleSource<'_>,
    ) -> Result<Py<PyDict>> {
        match source {
            ModuleSource::Code(code) => {
                let globals = PyDict::new_bound(py);
                py.run_bound(code, Some(&globals), None)
                    .map_err(|e| script_err(format!("failed to execute module `{key}`"), e))?;
                Ok(globals.unbind())
            }
            ModuleSource::Import(name) => {
                let module = py
                    .import_bound(name)
                    .map_err(|e| script_err(format!("failed to import `{name}` as `{key}`"), e))?;
                Ok(module.dict().unbind())
            }
        }
    }
}

/// Shared interpreter for the crate's tests: first caller initializes, the
/// rest reuse the instance.
#[cfg(test)]
pub(crate) fn host_for_tests() -> &'static ScriptHost {
    ScriptHost::initialize(None, Path::new("."))
        .unwrap_or_else(|_| ScriptHost::instance().expect("host initialized"))
}
