//! Shared-memory request/reply transport between a simulation controller and
//! the worker process that hosts the simulation.
//!
//! Each direction is one fixed-capacity memory-mapped region guarded by a
//! pair of POSIX named semaphores: a mutex and a ready signal. See
//! [`ipc`] for the layering and the turn-taking rules, and [`sim`] for the
//! controller and worker roles.

pub mod core;
pub mod ipc;
pub mod protocol;
pub mod sim;

pub use crate::core::{Error, Result};
