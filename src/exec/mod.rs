//! Command execution: the dependency-gated scheduler, the per-command
//! executor (with cache probe and syscall tracing), and the trace parser.

pub mod executor;
pub mod scheduler;
pub mod trace;

pub use scheduler::Scheduler;
