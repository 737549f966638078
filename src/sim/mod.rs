//! Controller and worker roles on top of the duplex channel.
//!
//! The worker owns a [`Simulation`] and the channel's named resources; the
//! controller drives it with `reset`/`step`/`close`, one request at a time.

mod controller;
mod demo;
mod simulation;
mod worker;

pub use controller::{Controller, ControllerState};
pub use demo::LineWalk;
pub use simulation::{Action, Simulation};
pub use worker::{Worker, WorkerState, WorkerSummary};
