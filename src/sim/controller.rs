use std::time::Duration;

use log::{debug, warn};

use crate::core::{ChannelConfig, Error, Result, Role};
use crate::ipc::{handshake, ChannelStats, DuplexChannel};
use crate::protocol::{ArrayPayload, Message, MessageTag, ScalarMap, StepReturn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    AwaitingResetReturn,
    AwaitingStepReturn,
    Closed,
    /// The channel's turn-taking is broken; only `close` is accepted.
    Failed,
}

/// Drives a remote simulation: one request, then its matching reply.
///
/// Every call blocks until the reply arrives (or the configured receive
/// timeout expires).
pub struct Controller {
    channel: Option<DuplexChannel>,
    state: ControllerState,
    close_timeout: Duration,
    buf: Vec<u8>,
}

impl Controller {
    /// Attaches to the worker's channel and completes the handshake.
    pub fn connect(config: &ChannelConfig) -> Result<Self> {
        let timeout = config.connect_timeout();
        let mut channel = DuplexChannel::connect(config, Role::Controller, timeout)?;
        handshake::accept(&mut channel, Some(timeout))?;
        Ok(Self {
            channel: Some(channel),
            state: ControllerState::Idle,
            close_timeout: config.recv_timeout().unwrap_or(timeout),
            buf: Vec::with_capacity(4096),
        })
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn stats(&self) -> Option<ChannelStats> {
        self.channel.as_ref().map(DuplexChannel::stats)
    }

    pub fn reset(&mut self, seed: Option<i64>, options: ScalarMap) -> Result<(ArrayPayload, ScalarMap)> {
        let request = Message::ResetArgs { seed, options };
        match self.exchange(&request, ControllerState::AwaitingResetReturn)? {
            Message::ResetReturn { observation, info } => {
                self.state = ControllerState::Idle;
                Ok((observation, info))
            }
            other => Err(self.unexpected(MessageTag::ResetReturn, &other)),
        }
    }

    /// Sends one action and waits for the step result.
    ///
    /// The returned `StepReturn` converts into the
    /// `(observation, reward, terminated, truncated, info)` tuple with `.into()`.
    pub fn step(&mut self, action: ArrayPayload) -> Result<StepReturn> {
        let request = Message::Action(action);
        match self.exchange(&request, ControllerState::AwaitingStepReturn)? {
            Message::StepReturn(step) => {
                self.state = ControllerState::Idle;
                Ok(step)
            }
            other => Err(self.unexpected(MessageTag::StepReturn, &other)),
        }
    }

    /// Asks the worker to close its simulation and tear the channel down, and
    /// waits for its acknowledgement. The worker unlinks every named object
    /// before acknowledging, so the identifiers are free once this returns.
    ///
    /// Idempotent. From `Failed` it only releases this side's handles.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            ControllerState::Closed => return Ok(()),
            ControllerState::Failed => {
                self.release();
                return Ok(());
            }
            ControllerState::Idle => {}
            state => return Err(Error::violation(format!("close requested while {state:?}"))),
        }
        let Some(channel) = self.channel.as_mut() else {
            return Err(Error::violation("controller has no channel"));
        };
        self.state = ControllerState::Closed;
        Message::Close.encode_into(&mut self.buf)?;
        let acked = channel
            .send(&self.buf)
            .and_then(|()| channel.receive_timeout(Some(self.close_timeout)))
            .and_then(|bytes| Message::decode(&bytes));
        self.release();
        match acked? {
            Message::Status => Ok(()),
            other => Err(Error::violation(format!(
                "close acknowledged with {:?}",
                other.tag()
            ))),
        }
    }

    fn exchange(&mut self, request: &Message, awaiting: ControllerState) -> Result<Message> {
        match self.state {
            ControllerState::Idle => {}
            ControllerState::Closed => return Err(Error::violation("controller is closed")),
            state => {
                return Err(Error::violation(format!(
                    "{:?} requested while {state:?}",
                    request.tag()
                )))
            }
        }
        let Some(channel) = self.channel.as_mut() else {
            return Err(Error::violation("controller has no channel"));
        };

        // Encoding failures and oversized requests leave shared memory untouched.
        request.encode_into(&mut self.buf)?;
        if let Err(err) = channel.send(&self.buf) {
            if !err.is_recoverable() {
                self.state = ControllerState::Failed;
            }
            return Err(err);
        }
        self.state = awaiting;
        debug!("controller sent {:?}, now {awaiting:?}", request.tag());

        match channel.receive().and_then(|bytes| Message::decode(&bytes)) {
            Ok(Message::Close) => {
                self.state = ControllerState::Failed;
                Err(Error::PeerClosed)
            }
            Ok(reply) => Ok(reply),
            Err(err) => {
                self.state = ControllerState::Failed;
                Err(err)
            }
        }
    }

    fn unexpected(&mut self, expected: MessageTag, received: &Message) -> Error {
        self.state = ControllerState::Failed;
        Error::violation(format!(
            "expected {expected:?}, received {:?}",
            received.tag()
        ))
    }

    fn release(&mut self) {
        if let Some(channel) = self.channel.take() {
            if let Err(err) = channel.close() {
                warn!("failed to release controller channel: {err}");
            }
        }
        self.state = ControllerState::Closed;
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if self.state != ControllerState::Idle {
            return;
        }
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        warn!("controller dropped without close(); sending Close");
        let sent = Message::Close
            .encode()
            .and_then(|bytes| channel.send(&bytes));
        if let Err(err) = sent {
            warn!("failed to send Close on drop: {err}");
        }
    }
}
