//! Embedded Python hosting.
//!
//! - [`host`] - the process-wide runtime bridge ([`ScriptHost`])
//! - [`stdio`] - `sys.stdout`/`sys.stderr` adapters into the host logger
//! - [`vars`] - managed variables injected into script namespaces
//!
//! User scripts run inside namespaces owned by the one [`ScriptHost`]
//! instance; everything that touches interpreter state goes through it.

pub mod host;
pub mod stdio;
pub mod vars;

pub use host::{CallableInfo, ModuleSource, ScriptHost};
pub use vars::{DeltaTime, ManagedVariable};
