//! Serialize and deserialize steps.
//!
//! These bridge the byte-level transport to the scripting runtime through a
//! pickle codec hosted as two Python modules (embedded below). The
//! deserialize step sits between the input step and the first script step;
//! the serialize step between the last script step and the output step. A
//! round trip reproduces an equal object for any picklable value.

use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyDict};

use crate::error::{Error, Result};
use crate::pipeline::step::Step;
use crate::script::{ModuleSource, ScriptHost};
use crate::sync::CancelToken;

const SERIALIZE_CODE: &str = include_str!("../script/code/pickle_serialize.py");
const DESERIALIZE_CODE: &str = include_str!("../script/code/pickle_deserialize.py");

#[derive(Default)]
pub struct DeserializeStep {
    host: Option<&'static ScriptHost>,
    key: Option<String>,
}

impl DeserializeStep {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turns one message per source into a runtime dict keyed by display
    /// name.
    pub fn deserialize(&self, entries: &[(String, Vec<u8>)]) -> Result<Py<PyAny>> {
        let (host, key) = self.hosted()?;
        host.acquire(|py| {
            let map = PyDict::new_bound(py);
            for (name, payload) in entries {
                map.set_item(name, PyBytes::new_bound(py, payload))
                    .map_err(|e| Error::Script(format!("failed to build source map: {e}")))?;
            }
            let out = host.call_function(py, key, "deserialize", &[map.into_any()])?;
            Ok(out.unbind())
        })
    }

    fn hosted(&self) -> Result<(&'static ScriptHost, &str)> {
        match (self.host, &self.key) {
            (Some(host), Some(key)) => Ok((host, key)),
            _ => Err(Error::Script("deserialize step is not awakened".into())),
        }
    }
}

impl Step for DeserializeStep {
    fn label(&self) -> &str {
        "deserialize"
    }

    fn set_cancel(&mut self, _cancel: CancelToken) {}

    fn awaken(&mut self) -> Result<()> {
        let host = ScriptHost::instance()?;
        let key = host.acquire(|py| {
            host.add_module_auto_key(py, "pickle_deserialize", ModuleSource::Code(DESERIALIZE_CODE))
        })?;
        self.host = Some(host);
        self.key = Some(key);
        Ok(())
    }

    fn end(&mut self) {
        if let (Some(host), Some(key)) = (self.host.take(), self.key.take()) {
            host.acquire(|py| host.remove_module(py, &key));
        }
    }
}

#[derive(Default)]
pub struct SerializeStep {
    host: Option<&'static ScriptHost>,
    key: Option<String>,
}

impl SerializeStep {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pickles the final script value. An absent value serializes the
    /// runtime's `None`.
    pub fn serialize(&self, value: Option<&Py<PyAny>>) -> Result<Vec<u8>> {
        let (host, key) = self.hosted()?;
        host.acquire(|py| {
            let arg = match value {
                Some(value) => value.bind(py).clone(),
                None => host.none(py).into_bound(py),
            };
            let out = host.call_function(py, key, "serialize", &[arg])?;
            let bytes = out
                .downcast::<PyBytes>()
                .map_err(|_| Error::Script("serialize() must return bytes".into()))?;
            Ok(bytes.as_bytes().to_vec())
        })
    }

    fn hosted(&self) -> Result<(&'static ScriptHost, &str)> {
        match (self.host, &self.key) {
            (Some(host), Some(key)) => Ok((host, key)),
            _ => Err(Error::Script("serialize step is not awakened".into())),
        }
    }
}

impl Step for SerializeStep {
    fn label(&self) -> &str {
        "serialize"
    }

    fn set_cancel(&mut self, _cancel: CancelToken) {}

    fn awaken(&mut self) -> Result<()> {
        let host = ScriptHost::instance()?;
        let key = host.acquire(|py| {
            host.add_module_auto_key(py, "pickle_serialize", ModuleSource::Code(SERIALIZE_CODE))
        })?;
        self.host = Some(host);
        self.key = Some(key);
        Ok(())
    }

    fn end(&mut self) {
        if let (Some(host), Some(key)) = (self.host.take(), self.key.take()) {
            host.acquire(|py| host.remove_module(py, &key));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::host::host_for_tests;

    fn awakened_pair() -> (SerializeStep, DeserializeStep) {
        host_for_tests();
        let mut serialize = SerializeStep::new();
        serialize.awaken().unwrap();
        let mut deserialize = DeserializeStep::new();
        deserialize.awaken().unwrap();
        (serialize, deserialize)
    }

    #[test]
    fn test_round_trip_reproduces_value() {
        let (mut serialize, mut deserialize) = awakened_pair();
        let host = ScriptHost::instance().unwrap();

        let value: Py<PyAny> = host.acquire(|py| {
            let dict = PyDict::new_bound(py);
            dict.set_item("count", 3).unwrap();
            dict.set_item("items", vec![1i64, 2, 3]).unwrap();
            dict.into_any().unbind()
        });

        let bytes = serialize.serialize(Some(&value)).unwrap();
        let out = deserialize.deserialize(&[("alpha".into(), bytes)]).unwrap();

        host.acquire(|py| {
            let entry = out.bind(py).get_item("alpha").unwrap();
            assert!(entry.eq(value.bind(py)).unwrap());
        });

        serialize.end();
        deserialize.end();
    }

    #[test]
    fn test_absent_value_round_trips_as_none() {
        let (mut serialize, mut deserialize) = awakened_pair();
        let host = ScriptHost::instance().unwrap();

        let bytes = serialize.serialize(None).unwrap();
        let out = deserialize.deserialize(&[("src".into(), bytes)]).unwrap();
        host.acquire(|py| {
            assert!(out.bind(py).get_item("src").unwrap().is_none());
        });

        serialize.end();
        deserialize.end();
    }

    #[test]
    fn test_end_is_idempotent() {
        let (mut serialize, _) = awakened_pair();
        serialize.end();
        serialize.end();
        assert!(serialize.serialize(None).is_err());
    }
}
