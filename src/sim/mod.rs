//! The virtual-time scheduler: cooperative processes, suspension points,
//! and cross-process interrupts.

mod event;
mod scheduler;

pub mod interrupt;

pub use event::{all_of, any_of2, AnyOf2, Either};
pub use interrupt::{Cause, CauseReason, Interrupted};
pub use scheduler::{Ctx, Join, ProcessHandle, Scheduler, TaskId, Timeout, Until};
