//! Kernel runtime: the FSM engine and the workers that feed it.

pub mod actions;
pub mod context;
pub mod fsm;
pub mod plans;
pub mod rrule;
pub mod scheduler;
pub mod slices;

pub use actions::{ActionRegistry, GuardRegistry};
pub use context::RuntimeContext;
pub use fsm::FsmEngine;
pub use plans::{register_builtin_kinds, ExecutorRegistry, PlanWorker};
pub use scheduler::TimedScheduler;
pub use slices::{ProgramRegistry, SliceWorker};
