//! Pipeline launcher.
//!
//! Takes one or more pipeline configuration files, spawns one worker
//! process per additional file, and runs the last one in this process.
//! Ctrl-C cancels the in-process pipeline; worker processes receive the
//! same interrupt through the process group and cancel themselves. Exit
//! code 0 on clean completion, 1 on any configuration, discovery, or
//! runtime error.

use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use anyhow::{Context, Result, bail};
use clap::Parser;
use crossbeam_channel::bounded;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use flowline::config::{DEFAULT_DISCOVERY_PORT, Environment, PipelineConfig};
use flowline::pipeline::{ExitStatus, PipelineDriver};
use flowline::script::ScriptHost;
use flowline::sync::CancelToken;

#[derive(Parser, Debug)]
#[command(
    name = "flowline",
    about = "Distributed script pipelines over LAN discovery"
)]
struct Cli {
    /// Pipeline configuration files; one worker process per file.
    #[arg(required = true)]
    configs: Vec<PathBuf>,

    /// UDP port used for peer discovery.
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    discovery_port: u16,

    /// Interface the data listener binds to; defaults to the first
    /// interface with a usable address.
    #[arg(long)]
    inbound_interface: Option<String>,

    /// Interface beacons broadcast on; repeat for several. Defaults to
    /// every broadcast-capable interface.
    #[arg(long = "outbound-interface")]
    outbound_interfaces: Vec<String>,

    /// Root of the Python installation to embed.
    #[arg(long)]
    python_home: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(Cli::parse()) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let cancel = CancelToken::new();
    let handler_cancel = cancel.clone();
    ctrlc::set_handler(move || {
        info!("interrupt received, cancelling");
        handler_cancel.fire();
    })
    .context("failed to install interrupt handler")?;

    let (last, rest) = cli
        .configs
        .split_last()
        .expect("clap requires at least one config");

    let mut children = Vec::new();
    for config in rest {
        children.push(
            spawn_worker(config, &cli)
                .with_context(|| format!("failed to spawn worker for {}", config.display()))?,
        );
    }

    let result = run_pipeline(last, &cli, cancel);

    let mut child_failed = false;
    for mut child in children {
        match child.wait() {
            Ok(status) if status.success() => {}
            Ok(status) => {
                error!("worker process exited with {status}");
                child_failed = true;
            }
            Err(e) => {
                error!("failed to reap worker process: {e}");
                child_failed = true;
            }
        }
    }

    result?;
    if child_failed {
        bail!("one or more worker processes failed");
    }
    Ok(())
}

fn spawn_worker(config: &Path, cli: &Cli) -> Result<Child> {
    let exe = std::env::current_exe().context("failed to locate the launcher executable")?;
    let mut command = Command::new(exe);
    command
        .arg(config)
        .arg("--discovery-port")
        .arg(cli.discovery_port.to_string());
    if let Some(inbound) = &cli.inbound_interface {
        command.arg("--inbound-interface").arg(inbound);
    }
    for outbound in &cli.outbound_interfaces {
        command.arg("--outbound-interface").arg(outbound);
    }
    if let Some(home) = &cli.python_home {
        command.arg("--python-home").arg(home);
    }
    info!("spawning worker process for {}", config.display());
    Ok(command.spawn()?)
}

fn run_pipeline(config_path: &Path, cli: &Cli, cancel: CancelToken) -> Result<()> {
    let config = PipelineConfig::load(config_path)?;

    // Scripts may import siblings, so their directory joins the module
    // search path.
    let search_root = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    ScriptHost::initialize(cli.python_home.as_deref(), search_root)?;

    let environment = Environment {
        python_home: cli.python_home.clone(),
        inbound_interface: cli.inbound_interface.clone(),
        outbound_interfaces: cli.outbound_interfaces.clone(),
        discovery_port: cli.discovery_port,
    };

    let driver = PipelineDriver::from_config(&config, &environment)?;
    let (exit_tx, exit_rx) = bounded(1);
    let worker = driver
        .start(cancel, exit_tx)
        .with_context(|| format!("failed to start pipeline `{}`", config.name))?;

    let outcome = exit_rx
        .recv()
        .context("pipeline worker vanished without reporting an exit")?;
    worker.join();

    match outcome {
        ExitStatus::Completed => {
            info!("pipeline `{}` completed", config.name);
            Ok(())
        }
        ExitStatus::Failed(e) => {
            Err(anyhow::Error::from(e).context(format!("pipeline `{}` failed", config.name)))
        }
    }
}
