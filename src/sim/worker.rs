use std::time::Duration;

use log::{debug, info, warn};

use crate::core::{ChannelConfig, Error, Result, Role};
use crate::ipc::{handshake, DuplexChannel};
use crate::protocol::Message;
use crate::sim::simulation::{Action, Simulation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Handshaking,
    AwaitRequest,
    Dispatch,
    SendReply,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub resets: u64,
    pub steps: u64,
}

/// Serves one controller: receives requests, dispatches them to the
/// simulation and replies, until `Close`.
///
/// The worker creates the channel and owns its named resources; they are
/// removed when [`run`](Self::run) returns, whether it succeeds or not.
pub struct Worker<S: Simulation> {
    channel: DuplexChannel,
    simulation: S,
    state: WorkerState,
    handshake_timeout: Duration,
    buf: Vec<u8>,
    summary: WorkerSummary,
}

impl<S: Simulation> Worker<S> {
    /// Builds the simulation, then creates the channel described by `config`.
    pub fn new<F>(simulation_factory: F, config: ChannelConfig) -> Result<Self>
    where
        F: FnOnce() -> anyhow::Result<S>,
    {
        let simulation = simulation_factory()?;
        let channel = DuplexChannel::create(&config, Role::Worker)?;
        Ok(Self {
            channel,
            simulation,
            state: WorkerState::Handshaking,
            handshake_timeout: config.connect_timeout(),
            buf: Vec::with_capacity(4096),
            summary: WorkerSummary::default(),
        })
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Runs the handshake and the request loop until the controller closes.
    ///
    /// # Errors
    ///
    /// - `Error::Timeout`: no controller completed the handshake in time
    /// - `Error::ProtocolViolation`: a request arrived with a tag other than
    ///   `Action`, `ResetArgs` or `Close`
    /// - `Error::Simulation`: the simulation failed; the controller is sent
    ///   `Close` so it does not wait for a reply that will never come
    /// - `Error::Corrupt`: a request failed its checksum or decoding; the
    ///   controller is sent `Close` as well
    pub fn run(mut self) -> Result<WorkerSummary> {
        let served = self.serve();
        if let Err(err) = &served {
            warn!("worker stopping: {err}");
            if let Err(unlink_err) = self.channel.unlink_names() {
                warn!("failed to unlink channel names: {unlink_err}");
            }
            // The controller waits for a reply in all of these states.
            if matches!(
                self.state,
                WorkerState::AwaitRequest | WorkerState::Dispatch | WorkerState::SendReply
            ) {
                self.notify_abort();
            }
            if self.state != WorkerState::Closed {
                if let Err(close_err) = self.simulation.close() {
                    warn!("simulation close failed: {close_err:#}");
                }
                self.state = WorkerState::Closed;
            }
        }
        let summary = self.summary;
        let closed = self.channel.close();
        served?;
        closed?;
        info!(
            "worker finished after {} resets and {} steps",
            summary.resets, summary.steps
        );
        Ok(summary)
    }

    fn serve(&mut self) -> Result<()> {
        handshake::initiate(&mut self.channel, Some(self.handshake_timeout))?;
        loop {
            self.state = WorkerState::AwaitRequest;
            let bytes = self.channel.receive_timeout(None)?;
            self.state = WorkerState::Dispatch;
            let request = Message::decode(&bytes)?;
            debug!("worker dispatching {:?}", request.tag());

            let reply = match request {
                Message::Action(payload) => {
                    let step = self.simulation.step(Action::from_payload(payload))?;
                    self.summary.steps += 1;
                    Message::StepReturn(step)
                }
                Message::ResetArgs { seed, options } => {
                    let (observation, info) = self.simulation.reset(seed, options)?;
                    self.summary.resets += 1;
                    Message::ResetReturn { observation, info }
                }
                Message::Close => {
                    let closed = self.simulation.close();
                    // The controller may reuse the identifiers once it sees Status.
                    self.channel.unlink_names()?;
                    self.state = WorkerState::SendReply;
                    self.reply(&Message::Status)?;
                    self.state = WorkerState::Closed;
                    return closed.map_err(Error::from);
                }
                other @ (Message::Request
                | Message::ResetReturn { .. }
                | Message::StepReturn(_)
                | Message::Status) => {
                    return Err(Error::violation(format!(
                        "worker received {:?} while awaiting a request",
                        other.tag()
                    )));
                }
            };

            self.state = WorkerState::SendReply;
            self.reply(&reply)?;
        }
    }

    fn reply(&mut self, message: &Message) -> Result<()> {
        message.encode_into(&mut self.buf)?;
        self.channel.send(&self.buf)
    }

    /// Hands the turn back with `Close` so a waiting controller fails fast.
    fn notify_abort(&mut self) {
        if self.channel.outbound_pending() {
            return;
        }
        if let Err(err) = self.reply(&Message::Close) {
            warn!("failed to notify controller of abort: {err}");
        }
    }
}
