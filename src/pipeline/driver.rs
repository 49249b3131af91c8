//! Pipeline driver: validates the configured step chain, brings it up on a
//! dedicated worker thread, iterates until cancellation, and tears it down.
//!
//! The chain is fixed: input -> deserialize -> scripts (in order) ->
//! serialize -> output. Input/deserialize and serialize/output are paired;
//! a chain of only script steps is valid. The worker publishes its fate on
//! the caller-supplied exit channel: `Completed` for a clean (cancelled)
//! stop, `Failed` for anything else.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Sender, bounded};
use pyo3::prelude::*;
use tracing::{debug, error, info, warn};

use crate::config::{Environment, PipelineConfig};
use crate::discovery::DiscoveryConfig;
use crate::error::{Error, Result};
use crate::net::interfaces;
use crate::pipeline::codec::{DeserializeStep, SerializeStep};
use crate::pipeline::input::InputStep;
use crate::pipeline::output::OutputStep;
use crate::pipeline::script::ScriptStep;
use crate::pipeline::step::Step;
use crate::script::DeltaTime;
use crate::sync::CancelToken;

/// How long [`PipelineDriver::start`] waits for the worker to report in.
pub const START_TIMEOUT: Duration = Duration::from_secs(5);

/// Terminal state of a pipeline worker, published on the exit channel.
#[derive(Debug)]
pub enum ExitStatus {
    /// Clean stop after cancellation.
    Completed,
    Failed(Error),
}

pub struct PipelineDriver {
    name: String,
    pub(crate) input: Option<InputStep>,
    pub(crate) deserialize: Option<DeserializeStep>,
    pub(crate) scripts: Vec<ScriptStep>,
    pub(crate) serialize: Option<SerializeStep>,
    pub(crate) output: Option<OutputStep>,
}

/// Handle to a started worker thread.
#[derive(Debug)]
pub struct PipelineWorker {
    handle: JoinHandle<()>,
}

impl PipelineWorker {
    /// Reaps the worker thread; the exit channel has the outcome.
    pub fn join(self) {
        if self.handle.join().is_err() {
            warn!("pipeline worker panicked");
        }
    }
}

impl PipelineDriver {
    pub fn new(name: String) -> Self {
        Self {
            name,
            input: None,
            deserialize: None,
            scripts: Vec::new(),
            serialize: None,
            output: None,
        }
    }

    /// Assembles the step chain a configuration file describes.
    pub fn from_config(config: &PipelineConfig, environment: &Environment) -> Result<Self> {
        let mut driver = PipelineDriver::new(config.name.clone());

        if config.source_pipeline_count > 0 {
            let inbound_ip = match &environment.inbound_interface {
                Some(name) => interfaces::ipv4_of(name)?,
                None => interfaces::default_ipv4()?,
            };
            let discovery = DiscoveryConfig::from_interfaces(
                &environment.outbound_interfaces,
                environment.discovery_port,
            )?;
            driver = driver.with_input(
                InputStep::new(
                    config.name.clone(),
                    config.source_pipeline_count,
                    inbound_ip,
                    discovery,
                ),
                DeserializeStep::new(),
            );
        }

        for path in &config.scripts {
            driver = driver.with_script(ScriptStep::new(
                path.clone(),
                vec![Box::new(DeltaTime::new())],
            ));
        }

        if !config.target_pipeline_names.is_empty() {
            driver = driver.with_output(
                SerializeStep::new(),
                OutputStep::new(
                    config.name.clone(),
                    config.target_pipeline_names.clone(),
                    environment.discovery_port,
                ),
            );
        }

        Ok(driver)
    }

    pub fn with_input(mut self, input: InputStep, deserialize: DeserializeStep) -> Self {
        self.input = Some(input);
        self.deserialize = Some(deserialize);
        self
    }

    pub fn with_script(mut self, script: ScriptStep) -> Self {
        self.scripts.push(script);
        self
    }

    pub fn with_output(mut self, serialize: SerializeStep, output: OutputStep) -> Self {
        self.serialize = Some(serialize);
        self.output = Some(output);
        self
    }

    /// Validates the chain, spawns the worker, and waits up to
    /// [`START_TIMEOUT`] for it to report started. Validation failures are
    /// also published on `exit` before this returns the error.
    pub fn start(self, cancel: CancelToken, exit: Sender<ExitStatus>) -> Result<PipelineWorker> {
        if let Err(message) = self.validate() {
            let _ = exit.send(ExitStatus::Failed(Error::Config(message.clone())));
            return Err(Error::Config(message));
        }

        let (started_tx, started_rx) = bounded(1);
        let worker_cancel = cancel.clone();
        let mut driver = self;
        let handle = thread::Builder::new()
            .name("pipeline-worker".into())
            .spawn(move || driver.run(worker_cancel, started_tx, exit))?;

        match started_rx.recv_timeout(START_TIMEOUT) {
            Ok(()) => Ok(PipelineWorker { handle }),
            Err(_) => {
                cancel.fire();
                Err(Error::Startup(format!(
                    "pipeline worker did not report started within {START_TIMEOUT:?}"
                )))
            }
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.name.is_empty() {
            return Err("pipeline name is not assigned".into());
        }
        if self.scripts.is_empty() {
            return Err(format!("pipeline `{}` has no script steps", self.name));
        }
        if self.input.is_some() != self.deserialize.is_some() {
            return Err(format!(
                "pipeline `{}`: input and deserialize steps must be configured together",
                self.name
            ));
        }
        if self.serialize.is_some() != self.output.is_some() {
            return Err(format!(
                "pipeline `{}`: serialize and output steps must be configured together",
                self.name
            ));
        }
        Ok(())
    }

    fn run(&mut self, cancel: CancelToken, started: Sender<()>, exit: Sender<ExitStatus>) {
        let _ = started.send(());
        info!("pipeline `{}` worker started", self.name);

        if cancel.fired() {
            info!("pipeline `{}` cancelled before awaken", self.name);
            let _ = exit.send(ExitStatus::Completed);
            return;
        }

        for step in self.lifecycle_mut() {
            step.set_cancel(cancel.clone());
        }

        if let Err((error, awakened)) = self.awaken_all() {
            error!("pipeline `{}` failed to awaken: {error}", self.name);
            if awakened > 0 {
                self.end_first(awakened);
            }
            let _ = exit.send(ExitStatus::Failed(error));
            return;
        }

        info!("pipeline `{}` iterating", self.name);
        let outcome = loop {
            if cancel.fired() {
                break Ok(());
            }
            match self.run_iteration(&cancel) {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(e) if e.is_cancelled() => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.end_all();

        match outcome {
            Ok(()) => {
                info!("pipeline `{}` stopped", self.name);
                let _ = exit.send(ExitStatus::Completed);
            }
            Err(error) => {
                error!("pipeline `{}` failed: {error}", self.name);
                let _ = exit.send(ExitStatus::Failed(error));
            }
        }
    }

    /// One pass through the chain, with a cancellation check between
    /// stages. Returns `Ok(false)` when cancellation cut the pass short.
    fn run_iteration(&mut self, cancel: &CancelToken) -> Result<bool> {
        let received = match self.input.as_mut() {
            Some(input) => Some(input.receive()?),
            None => None,
        };
        if cancel.fired() {
            return Ok(false);
        }

        let mut value: Option<Py<PyAny>> = match (&self.deserialize, &received) {
            (Some(deserialize), Some(entries)) => Some(deserialize.deserialize(entries)?),
            _ => None,
        };
        if cancel.fired() {
            return Ok(false);
        }

        for script in &mut self.scripts {
            value = Some(script.invoke(value.as_ref())?);
            if cancel.fired() {
                return Ok(false);
            }
        }

        let payload = match &self.serialize {
            Some(serialize) => Some(serialize.serialize(value.as_ref())?),
            None => None,
        };
        if cancel.fired() {
            return Ok(false);
        }

        if let Some(output) = &self.output {
            output.send(payload)?;
        }
        Ok(true)
    }

    /// Steps in awaken order, leaves first.
    fn lifecycle_mut(&mut self) -> Vec<&mut dyn Step> {
        let mut steps: Vec<&mut dyn Step> = Vec::new();
        if let Some(step) = self.input.as_mut() {
            steps.push(step);
        }
        if let Some(step) = self.deserialize.as_mut() {
            steps.push(step);
        }
        for step in self.scripts.iter_mut() {
            steps.push(step);
        }
        if let Some(step) = self.serialize.as_mut() {
            steps.push(step);
        }
        if let Some(step) = self.output.as_mut() {
            steps.push(step);
        }
        steps
    }

    fn awaken_all(&mut self) -> std::result::Result<(), (Error, usize)> {
        for (index, step) in self.lifecycle_mut().into_iter().enumerate() {
            if let Err(error) = step.awaken() {
                return Err((error, index));
            }
            debug!("step `{}` awakened", step.label());
        }
        Ok(())
    }

    /// Ends the first `count` steps of the chain, in reverse order.
    fn end_first(&mut self, count: usize) {
        let mut steps = self.lifecycle_mut();
        steps.truncate(count);
        for step in steps.into_iter().rev() {
            debug!("ending step `{}`", step.label());
            step.end();
        }
    }

    fn end_all(&mut self) {
        let count = self.lifecycle_mut().len();
        self.end_first(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::free_udp_port;
    use crate::script::host::host_for_tests;
    use std::fs;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;
    use std::time::Instant;

    fn write_script(dir: &tempfile::TempDir, name: &str, source: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, source).unwrap();
        path
    }

    fn script_step(path: PathBuf) -> ScriptStep {
        ScriptStep::new(path, vec![Box::new(DeltaTime::new())])
    }

    #[test]
    fn test_validation_requires_script_steps() {
        let driver = PipelineDriver::new("alpha".into());
        let (exit_tx, exit_rx) = bounded(1);
        let err = driver.start(CancelToken::new(), exit_tx).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(matches!(
            exit_rx.try_recv().unwrap(),
            ExitStatus::Failed(Error::Config(_))
        ));
    }

    #[test]
    fn test_validation_requires_paired_codec_steps() {
        host_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "noop.py", "def step():\n    return None\n");

        let mut driver = PipelineDriver::new("alpha".into()).with_script(script_step(script));
        driver.deserialize = Some(DeserializeStep::new());

        let (exit_tx, _exit_rx) = bounded(1);
        let err = driver.start(CancelToken::new(), exit_tx).unwrap_err();
        assert!(err.to_string().contains("configured together"));
    }

    #[test]
    fn test_solo_counter_runs_until_cancelled() {
        host_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let out_file = dir.path().join("counts.txt");
        let source = format!(
            "import time\ncounter = 0\n\ndef step():\n    global counter\n    counter += 1\n    with open(r'{}', 'w') as f:\n        f.write(str(counter))\n    time.sleep(0.002)\n    return counter\n",
            out_file.display()
        );
        let script = write_script(&dir, "counter.py", &source);

        let driver = PipelineDriver::new("solo".into()).with_script(script_step(script));
        let cancel = CancelToken::new();
        let (exit_tx, exit_rx) = bounded(1);
        let worker = driver.start(cancel.clone(), exit_tx).unwrap();

        // Let a few iterations happen, then stop.
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Ok(text) = fs::read_to_string(&out_file) {
                if text.parse::<i64>().map(|n| n >= 3).unwrap_or(false) {
                    break;
                }
            }
            assert!(Instant::now() < deadline, "counter never reached 3");
            thread::sleep(Duration::from_millis(5));
        }
        cancel.fire();

        match exit_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            ExitStatus::Completed => {}
            ExitStatus::Failed(e) => panic!("expected clean exit, got {e}"),
        }
        worker.join();

        assert!(fs::read_to_string(&out_file).unwrap().parse::<i64>().unwrap() >= 3);
    }

    #[test]
    fn test_cancel_before_start_stops_without_awakening() {
        host_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("awakened.txt");
        let source = format!(
            "open(r'{}', 'w').write('yes')\n\ndef step():\n    return None\n",
            marker.display()
        );
        let script = write_script(&dir, "probe.py", &source);

        let driver = PipelineDriver::new("early".into()).with_script(script_step(script));
        let cancel = CancelToken::new();
        cancel.fire();
        let (exit_tx, exit_rx) = bounded(1);
        let worker = driver.start(cancel, exit_tx).unwrap();

        assert!(matches!(
            exit_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ExitStatus::Completed
        ));
        worker.join();
        assert!(!marker.exists(), "script top level ran despite pre-start cancel");
    }

    #[test]
    fn test_script_failure_publishes_failed_exit() {
        host_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            &dir,
            "boom.py",
            "def step():\n    raise RuntimeError('iteration failure')\n",
        );

        let driver = PipelineDriver::new("angry".into()).with_script(script_step(script));
        let (exit_tx, exit_rx) = bounded(1);
        let worker = driver.start(CancelToken::new(), exit_tx).unwrap();

        match exit_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            ExitStatus::Failed(Error::Script(message)) => {
                assert!(message.contains("iteration failure"));
            }
            other => panic!("expected script failure, got {other:?}"),
        }
        worker.join();
    }

    /// Point-to-point: `aye` counts upward and sends, `bee` records what it
    /// receives keyed by the producer's name.
    #[test]
    fn test_point_to_point_pipelines() {
        host_for_tests();
        let port = free_udp_port();
        let dir = tempfile::tempdir().unwrap();

        let producer = write_script(
            &dir,
            "producer.py",
            "import time\ncounter = 0\n\ndef step():\n    global counter\n    counter += 1\n    time.sleep(0.005)\n    return counter\n",
        );
        let received = dir.path().join("received.txt");
        let consumer_source = format!(
            "def step(inputs):\n    value = inputs['aye']\n    with open(r'{}', 'a') as f:\n        f.write(str(value) + '\\n')\n    return value\n",
            received.display()
        );
        let consumer = write_script(&dir, "consumer.py", &consumer_source);

        let cancel = CancelToken::new();

        let sink = PipelineDriver::new("bee".into())
            .with_input(
                InputStep::new("bee".into(), 1, Ipv4Addr::LOCALHOST, DiscoveryConfig::loopback(port)),
                DeserializeStep::new(),
            )
            .with_script(script_step(consumer));
        let (sink_exit_tx, sink_exit_rx) = bounded(1);
        let sink_worker = sink.start(cancel.clone(), sink_exit_tx).unwrap();

        let source = PipelineDriver::new("aye".into())
            .with_script(script_step(producer))
            .with_output(
                SerializeStep::new(),
                OutputStep::new("aye".into(), vec!["bee".into()], port),
            );
        let (source_exit_tx, source_exit_rx) = bounded(1);
        let source_worker = source.start(cancel.clone(), source_exit_tx).unwrap();

        // Wait for the first three values to land downstream.
        let deadline = Instant::now() + Duration::from_secs(20);
        let lines = loop {
            let text = fs::read_to_string(&received).unwrap_or_default();
            let lines: Vec<String> = text.lines().map(str::to_string).collect();
            if lines.len() >= 3 {
                break lines;
            }
            assert!(Instant::now() < deadline, "downstream never saw 3 values");
            thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(&lines[..3], &["1".to_string(), "2".to_string(), "3".to_string()]);

        cancel.fire();
        assert!(matches!(
            sink_exit_rx.recv_timeout(Duration::from_secs(10)).unwrap(),
            ExitStatus::Completed
        ));
        assert!(matches!(
            source_exit_rx.recv_timeout(Duration::from_secs(10)).unwrap(),
            ExitStatus::Completed
        ));
        sink_worker.join();
        source_worker.join();
    }
}
