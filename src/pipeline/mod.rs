//! The pipeline runtime: driver, step lifecycle, and the five step roles.
//!
//! A pipeline process runs one ordered chain:
//!
//! ```text
//! input -> deserialize -> script ... script -> serialize -> output
//! ```
//!
//! - [`driver`] - validation, worker thread, iteration loop, teardown
//! - [`step`] - the lifecycle every role shares
//! - [`input`] / [`fanin`] - upstream discovery and multi-source gating
//! - [`output`] - target discovery and fan-out sending
//! - [`script`] - user script hosting
//! - [`codec`] - pickle serialize/deserialize bridging
//!
//! Input+deserialize and serialize+output are paired: either both present
//! or both absent. A chain of only script steps is a valid pure-compute
//! pipeline.

pub mod codec;
pub mod driver;
pub mod fanin;
pub mod input;
pub mod output;
pub mod script;
pub mod step;

pub use codec::{DeserializeStep, SerializeStep};
pub use driver::{ExitStatus, PipelineDriver, PipelineWorker, START_TIMEOUT};
pub use fanin::FanInBuffer;
pub use input::InputStep;
pub use output::OutputStep;
pub use script::ScriptStep;
pub use step::Step;
