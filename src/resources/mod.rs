//! Resource primitives the simulated nodes contend over: a FIFO bounded
//! counter (disk throughput, NIC bandwidth), a FIFO mutex, and a latched
//! event (disk-alive, buffer-full).

mod counter;
mod latch;
mod mutex;

pub use counter::{BoundedCounter, Get};
pub use latch::{Latch, Wait};
pub use mutex::{Acquire, Guard, Mutex};
