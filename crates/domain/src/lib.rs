//! Core value types shared across all nerve crates.
//!
//! Everything that flows between the kernel's subsystems lives here: signals,
//! normalized channel messages, action results, plan/timed/slice records, the
//! structured trace event, the renderer contract, and configuration.

pub mod action;
pub mod config;
pub mod error;
pub mod message;
pub mod plan;
pub mod render;
pub mod signal;
pub mod slice;
pub mod timed;
pub mod trace;

pub use action::{ActionResult, PlanRequest, ResultCode, SliceEnqueue, SliceRequest, TimedSignalRequest};
pub use error::{Error, Result};
pub use message::{Audience, AudienceKind, InboundMessage, OutboundMessage};
pub use plan::{PlanInstance, PlanRun, PlanStatus};
pub use signal::{Signal, SignalStatus};
pub use slice::{Checkpoint, SliceStatus, SliceTask};
pub use timed::{TimedSignal, TimedStatus};
pub use trace::{Level, ObsEvent};
