//! Opening exchange run once per channel before application traffic.
//!
//! ```text
//! creator (worker)                 opener (controller)
//!   send Request   ───────────────►  receive Request
//!   receive Status ◄───────────────  send Status
//!   send Request   ───────────────►  receive Request
//! ```
//!
//! After the third message both regions are empty, the creator waits for a
//! request and the opener holds the turn. Any other tag is a protocol violation.

use std::time::Duration;

use log::info;

use crate::core::{Error, Result};
use crate::ipc::DuplexChannel;
use crate::protocol::{Message, MessageTag};

/// Messages exchanged by a complete handshake.
pub const HANDSHAKE_EXCHANGES: usize = 3;

/// Creator side. `timeout` bounds the wait for the opener's reply.
pub fn initiate(channel: &mut DuplexChannel, timeout: Option<Duration>) -> Result<()> {
    send(channel, &Message::Request)?;
    expect(channel, MessageTag::Status, timeout)?;
    send(channel, &Message::Request)?;
    info!("handshake complete (creator)");
    Ok(())
}

/// Opener side. `timeout` bounds each wait for the creator's markers.
pub fn accept(channel: &mut DuplexChannel, timeout: Option<Duration>) -> Result<()> {
    expect(channel, MessageTag::Request, timeout)?;
    send(channel, &Message::Status)?;
    expect(channel, MessageTag::Request, timeout)?;
    info!("handshake complete (opener)");
    Ok(())
}

fn send(channel: &mut DuplexChannel, message: &Message) -> Result<()> {
    channel.send(&message.encode()?)
}

fn expect(channel: &mut DuplexChannel, tag: MessageTag, timeout: Option<Duration>) -> Result<()> {
    let bytes = channel.receive_timeout(timeout).map_err(|err| match err {
        Error::Timeout(_) => Error::Timeout("handshake"),
        other => other,
    })?;
    let message = Message::decode(&bytes)?;
    if message.tag() != tag {
        return Err(Error::violation(format!(
            "handshake expected {tag:?}, received {:?}",
            message.tag()
        )));
    }
    Ok(())
}
