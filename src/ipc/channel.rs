//! Half-duplex-per-direction shared-memory channel.
//!
//! # Architecture
//!
//! ```text
//! Controller                                        Worker
//! ┌──────────────────┐                        ┌──────────────────┐
//! │ outbound (c2w)   │── c2w.region ─────────►│ inbound (c2w)    │
//! │   c2w.lock  (1)  │   guarded by c2w.lock  │                  │
//! │   c2w.ready (0)  │   signalled by c2w.ready                  │
//! │                  │                        │                  │
//! │ inbound (w2c)    │◄───────── w2c.region ──│ outbound (w2c)   │
//! └──────────────────┘                        └──────────────────┘
//! ```
//!
//! `send` writes the region under its mutex and only then posts the ready
//! signal, so a receiver woken by the signal always finds a complete payload.
//! The channel enforces one unconsumed message per direction: a send onto a
//! region the peer has not drained is rejected, never overwritten.

use std::time::Duration;

use log::{debug, info, warn};

use crate::core::config::{ChannelConfig, Direction, Role};
use crate::core::region::FramedRegion;
use crate::core::semaphore::NamedSemaphore;
use crate::core::wait::{retry_until, Backoff};
use crate::core::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Allocated every named resource and removes them on teardown.
    Creator,
    /// Attached to resources owned by the creator.
    Opener,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub sent: u64,
    pub received: u64,
}

struct Lane {
    region: FramedRegion,
    lock: NamedSemaphore,
    ready: NamedSemaphore,
}

impl Lane {
    fn create(config: &ChannelConfig, direction: Direction) -> Result<Self> {
        let lock = NamedSemaphore::create(&config.lock_name(direction), 1)?;
        let ready = NamedSemaphore::create(&config.ready_name(direction), 0)?;
        let region = FramedRegion::create(&config.region_path(direction), config.capacity)?;
        Ok(Self {
            region,
            lock,
            ready,
        })
    }

    fn open(config: &ChannelConfig, direction: Direction) -> Result<Self> {
        // The creator publishes regions last, so a visible region implies its
        // semaphores already exist.
        let region = FramedRegion::open(&config.region_path(direction))?;
        let lock = NamedSemaphore::open(&config.lock_name(direction))?;
        let ready = NamedSemaphore::open(&config.ready_name(direction))?;
        Ok(Self {
            region,
            lock,
            ready,
        })
    }

    fn unlink_names(&mut self) -> Result<()> {
        let region = self.region.unlink_file();
        let lock = self.lock.unlink_name();
        let ready = self.ready.unlink_name();
        region.and(lock).and(ready)
    }

    fn destroy(self) -> Result<()> {
        let region = self.region.destroy();
        let lock = self.lock.destroy();
        let ready = self.ready.destroy();
        region.and(lock).and(ready)
    }
}

/// One endpoint of a bidirectional shared-memory channel.
pub struct DuplexChannel {
    role: Role,
    endpoint: Endpoint,
    outbound: Lane,
    inbound: Lane,
    recv_timeout: Option<Duration>,
    lock_timeout: Option<Duration>,
    empty_read_retries: u32,
    stats: ChannelStats,
    label: String,
}

impl DuplexChannel {
    /// Allocates both regions and all four semaphores.
    ///
    /// # Errors
    ///
    /// - `Error::ResourceUnavailable`: a named object already exists (a live
    ///   channel, or leftovers of a crash unless `unlink_stale` is set)
    /// - `Error::InvalidConfig`: the configuration does not validate
    pub fn create(config: &ChannelConfig, role: Role) -> Result<Self> {
        config.validate()?;
        if config.unlink_stale {
            let removed = Self::unlink_all(config)?;
            if removed > 0 {
                warn!("removed {removed} stale objects for channel {}.{}", config.id, config.port);
            }
        }
        // Lanes created so far are owned and unlink themselves if a later step fails.
        let outbound = Lane::create(config, role.outbound())?;
        let inbound = Lane::create(config, role.inbound())?;
        let channel = Self::assemble(config, role, Endpoint::Creator, outbound, inbound)?;
        info!("created channel {}", channel.label);
        Ok(channel)
    }

    /// Attaches to a channel created by the peer. Never re-initializes it.
    pub fn open(config: &ChannelConfig, role: Role) -> Result<Self> {
        config.validate()?;
        let outbound = Lane::open(config, role.outbound())?;
        let inbound = Lane::open(config, role.inbound())?;
        let channel = Self::assemble(config, role, Endpoint::Opener, outbound, inbound)?;
        info!("opened channel {}", channel.label);
        Ok(channel)
    }

    /// Retries [`open`](Self::open) until the creator has published the
    /// channel or `timeout` elapses.
    pub fn connect(config: &ChannelConfig, role: Role, timeout: Duration) -> Result<Self> {
        let mut last_err = None;
        let opened = retry_until(
            timeout,
            Backoff::new(Duration::from_micros(100), Duration::from_millis(50)),
            || match Self::open(config, role) {
                Ok(channel) => Ok(Some(channel)),
                Err(err @ Error::ResourceUnavailable { .. }) => {
                    last_err = Some(err);
                    Ok(None)
                }
                Err(err) => Err(err),
            },
        )?;
        match (opened, last_err) {
            (Some(channel), _) => Ok(channel),
            (None, Some(err)) => Err(err),
            (None, None) => Err(Error::Timeout("channel to be created")),
        }
    }

    /// Removes every named semaphore and region file for `config`, including
    /// staging files left by a creator that died mid-create.
    ///
    /// Returns how many objects were removed. Only safe when no endpoint of
    /// that channel is alive.
    pub fn unlink_all(config: &ChannelConfig) -> Result<usize> {
        let mut removed = 0;
        for name in config.semaphore_names() {
            removed += usize::from(NamedSemaphore::unlink(&name)?);
        }
        for path in config.region_paths() {
            removed += usize::from(FramedRegion::remove(&path)?);
            removed += usize::from(FramedRegion::remove(&FramedRegion::staging_path(&path))?);
        }
        Ok(removed)
    }

    fn assemble(
        config: &ChannelConfig,
        role: Role,
        endpoint: Endpoint,
        outbound: Lane,
        inbound: Lane,
    ) -> Result<Self> {
        if config.memlock {
            outbound.region.lock()?;
            inbound.region.lock()?;
        }
        Ok(Self {
            role,
            endpoint,
            outbound,
            inbound,
            recv_timeout: config.recv_timeout(),
            lock_timeout: config.lock_timeout(),
            empty_read_retries: config.empty_read_retries,
            stats: ChannelStats::default(),
            label: format!("{}.{}/{:?}", config.id, config.port, role),
        })
    }

    /// Publishes `payload` to the peer and signals it. Does not wait for the
    /// peer to consume it.
    ///
    /// # Errors
    ///
    /// - `Error::CapacityExceeded`: payload larger than the region; nothing written
    /// - `Error::ProtocolViolation`: the previous message has not been received yet;
    ///   the pending message is left intact
    /// - `Error::Timeout`: the region mutex could not be acquired in time
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        let capacity = self.outbound.region.capacity();
        if payload.len() > capacity {
            return Err(Error::CapacityExceeded {
                len: payload.len(),
                capacity,
            });
        }
        {
            let _guard = self.outbound.lock.lock_timeout(self.lock_timeout)?;
            if !self.outbound.region.is_empty() {
                return Err(Error::violation(format!(
                    "send on {:?} while the previous message is still unconsumed",
                    self.role.outbound()
                )));
            }
            self.outbound.region.write(payload)?;
        }
        self.outbound.ready.release()?;
        self.stats.sent += 1;
        debug!("{} sent {} bytes", self.label, payload.len());
        Ok(())
    }

    /// Blocks until the peer's next message arrives, honoring the configured
    /// receive timeout.
    pub fn receive(&mut self) -> Result<Vec<u8>> {
        self.receive_timeout(self.recv_timeout)
    }

    /// Like [`receive`](Self::receive) with an explicit bound (`None` = forever).
    ///
    /// # Errors
    ///
    /// - `Error::Timeout`: no ready signal within `timeout`
    /// - `Error::ProtocolViolation`: signalled but the region stayed empty
    /// - `Error::Corrupt`: the payload failed its length or checksum check
    pub fn receive_timeout(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        match timeout {
            None => self.inbound.ready.acquire()?,
            Some(timeout) => {
                if !self.inbound.ready.acquire_timeout(timeout)? {
                    return Err(Error::Timeout("inbound message"));
                }
            }
        }

        // Unreachable while the peer follows the signal-after-write order;
        // bounded so a misbehaving peer cannot spin us forever.
        let mut backoff = Backoff::new(Duration::from_micros(10), Duration::from_millis(5));
        loop {
            {
                let _guard = self.inbound.lock.lock_timeout(self.lock_timeout)?;
                if !self.inbound.region.is_empty() {
                    let payload = self.inbound.region.read()?.to_vec();
                    self.inbound.region.clear();
                    self.stats.received += 1;
                    debug!("{} received {} bytes", self.label, payload.len());
                    return Ok(payload);
                }
            }
            if backoff.attempts() >= self.empty_read_retries {
                return Err(Error::violation(format!(
                    "ready signal on {:?} without a message",
                    self.role.inbound()
                )));
            }
            backoff.snooze();
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn capacity(&self) -> usize {
        self.outbound.region.capacity()
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    pub fn set_recv_timeout(&mut self, timeout: Option<Duration>) {
        self.recv_timeout = timeout;
    }

    /// True when the last message this endpoint sent is still unconsumed.
    pub fn outbound_pending(&self) -> bool {
        !self.outbound.region.is_empty()
    }

    /// Removes the channel's names from the system while both endpoints keep
    /// their handles, so the identifiers can be reused as soon as this returns.
    ///
    /// A no-op for the opener. The creator calls it before its final message so
    /// that the peer observes a fully released channel.
    pub fn unlink_names(&mut self) -> Result<()> {
        if self.endpoint != Endpoint::Creator {
            return Ok(());
        }
        let outbound = self.outbound.unlink_names();
        let inbound = self.inbound.unlink_names();
        info!("unlinked names of channel {}", self.label);
        outbound.and(inbound)
    }

    /// Tears the endpoint down. The creator unlinks every semaphore and
    /// deletes both region files; errors are reported rather than logged.
    pub fn close(self) -> Result<()> {
        let label = self.label;
        let outbound = self.outbound.destroy();
        let inbound = self.inbound.destroy();
        info!("closed channel {label}");
        outbound.and(inbound)
    }
}
