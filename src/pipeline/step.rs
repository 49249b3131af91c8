//! Shared step lifecycle.
//!
//! Every step role goes through the same sequence: the driver hands it the
//! cancellation token, calls [`Step::awaken`] once before any iteration, and
//! calls [`Step::end`] once after the loop exits. The per-iteration work
//! methods are role-specific and live on the concrete step types.

use crate::error::Result;
use crate::sync::CancelToken;

pub trait Step {
    /// Short role name for log lines.
    fn label(&self) -> &str;

    /// Installed by the driver before [`Step::awaken`] is called.
    fn set_cancel(&mut self, cancel: CancelToken);

    /// Acquires the step's resources: binds sockets, completes discovery,
    /// executes script top-level code. Called once on the driver thread.
    fn awaken(&mut self) -> Result<()>;

    /// Best-effort resource release. Idempotent; never fails — problems are
    /// logged and swallowed.
    fn end(&mut self);
}
