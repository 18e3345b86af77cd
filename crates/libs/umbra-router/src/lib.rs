//! The dispatch core: one logic task owning every table, a bounded crypto
//! pool for the expensive pure work, and the periodic jobs that keep
//! paths, introsets, and sessions alive.

pub mod dispatch;
pub mod pending;
pub mod router;
pub mod workers;

pub use dispatch::AppEvent;
pub use pending::PendingQueues;
pub use router::{Router, RouterKeys};
pub use workers::WorkerPool;
