//! Shared-memory transport between one controller and one worker.
//!
//! # Layers
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Roles (controller / worker state machines)   sim::      │
//! ├──────────────────────────────────────────────────────────┤
//! │  Messages (tagged, binary encoded)            protocol:: │
//! ├──────────────────────────────────────────────────────────┤
//! │  Duplex channel + handshake                   ipc::      │
//! ├──────────────────────────────────────────────────────────┤
//! │  Regions, named semaphores, mmap              core::     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use ferry::core::{ChannelConfig, Role};
//! use ferry::ipc::{handshake, DuplexChannel};
//!
//! let config = ChannelConfig::new("demo", 5005);
//!
//! // Worker process
//! let mut worker = DuplexChannel::create(&config, Role::Worker)?;
//! handshake::initiate(&mut worker, Some(config.connect_timeout()))?;
//! let request = worker.receive()?;
//! worker.send(&request)?;
//!
//! // Controller process
//! let mut controller = DuplexChannel::connect(&config, Role::Controller, config.connect_timeout())?;
//! handshake::accept(&mut controller, Some(config.connect_timeout()))?;
//! controller.send(b"ping")?;
//! let reply = controller.receive()?;
//! # Ok::<(), ferry::Error>(())
//! ```
//!
//! # Turn-taking
//!
//! Exactly one message is in flight at a time. The worker only sends right
//! after receiving a request; the controller only sends once it has the reply
//! to its previous request. Sending `Close` while the peer is waiting for a
//! differently-tagged reply breaks this rule and surfaces as
//! `Error::PeerClosed` or `Error::ProtocolViolation` on the peer.

mod channel;
pub mod handshake;

pub use channel::{ChannelStats, DuplexChannel, Endpoint};
