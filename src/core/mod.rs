//! Operating-system building blocks of the transport.

pub mod config;
pub mod error;
pub mod mmap;
pub mod region;
pub mod semaphore;
pub mod wait;

pub use config::{ChannelConfig, Direction, Role};
pub use error::{Error, Result};
pub use region::FramedRegion;
pub use semaphore::{NamedSemaphore, SemaphoreGuard};
pub use wait::Backoff;
