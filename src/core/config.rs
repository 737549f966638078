//! Channel configuration and derivation of the named OS resources.
//!
//! Both endpoints load the same [`ChannelConfig`]. Every name is derived from
//! `(id, port, direction)`, and the endpoint's [`Role`] decides which direction
//! it sends on, so the two processes never need hand-swapped names.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::region::MAX_REGION_CAPACITY;
use crate::core::{Error, Result};

pub const DEFAULT_ID: &str = "ferry";
pub const DEFAULT_PORT: u16 = 5005;
pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

/// Longest identifier accepted; keeps semaphore names within platform limits.
const MAX_ID_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ControllerToWorker,
    WorkerToController,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::ControllerToWorker, Direction::WorkerToController];

    pub fn tag(self) -> &'static str {
        match self {
            Direction::ControllerToWorker => "c2w",
            Direction::WorkerToController => "w2c",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Controller,
    Worker,
}

impl Role {
    pub fn outbound(self) -> Direction {
        match self {
            Role::Controller => Direction::ControllerToWorker,
            Role::Worker => Direction::WorkerToController,
        }
    }

    pub fn inbound(self) -> Direction {
        match self {
            Role::Controller => Direction::WorkerToController,
            Role::Worker => Direction::ControllerToWorker,
        }
    }
}

/// Configuration shared by both endpoints of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Channel identifier, the common prefix of every named resource.
    pub id: String,

    /// Numeric suffix separating concurrently running channels.
    pub port: u16,

    /// Directory holding the backing region files.
    /// Default: /dev/shm on Linux, the system temp dir elsewhere
    pub region_dir: PathBuf,

    /// Payload bytes per region.
    /// Default: 1 MiB
    pub capacity: usize,

    /// How long an opener retries before the creator's resources appear, and
    /// how long either side waits for the handshake.
    /// Default: 10 s
    pub connect_timeout_ms: u64,

    /// Bound on a controller's wait for a reply. `None` waits forever.
    pub recv_timeout_ms: Option<u64>,

    /// Bound on acquiring a region mutex.
    /// Default: 1 s
    pub lock_timeout_ms: Option<u64>,

    /// Retries when a ready signal arrives but the region is empty.
    /// Default: 8
    pub empty_read_retries: u32,

    /// Pin both regions in RAM.
    pub memlock: bool,

    /// Creator removes leftovers from a crashed run before creating.
    pub unlink_stale: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            id: DEFAULT_ID.to_string(),
            port: DEFAULT_PORT,
            region_dir: default_region_dir(),
            capacity: DEFAULT_CAPACITY,
            connect_timeout_ms: 10_000,
            recv_timeout_ms: None,
            lock_timeout_ms: Some(1_000),
            empty_read_retries: 8,
            memlock: false,
            unlink_stale: false,
        }
    }
}

impl ChannelConfig {
    pub fn new(id: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            port,
            ..Self::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|err| Error::InvalidConfig(format!("{}: {err}", path.as_ref().display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_region_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.region_dir = dir.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_recv_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.recv_timeout_ms = timeout.map(duration_ms);
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout_ms = timeout.map(duration_ms);
        self
    }

    pub fn with_unlink_stale(mut self, unlink_stale: bool) -> Self {
        self.unlink_stale = unlink_stale;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidConfig("channel id must not be empty".into()));
        }
        if self.id.len() > MAX_ID_LEN {
            return Err(Error::InvalidConfig(format!(
                "channel id longer than {MAX_ID_LEN} bytes"
            )));
        }
        if !self
            .id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(Error::InvalidConfig(format!(
                "channel id may only contain [A-Za-z0-9_-]: {}",
                self.id
            )));
        }
        if self.capacity == 0 || self.capacity > MAX_REGION_CAPACITY {
            return Err(Error::InvalidConfig(format!(
                "capacity must be in 1..={MAX_REGION_CAPACITY}, got {}",
                self.capacity
            )));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn recv_timeout(&self) -> Option<Duration> {
        self.recv_timeout_ms.map(Duration::from_millis)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    fn stem(&self, direction: Direction) -> String {
        format!("{}.{}.{}", self.id, self.port, direction.tag())
    }

    pub fn region_path(&self, direction: Direction) -> PathBuf {
        self.region_dir.join(format!("{}.region", self.stem(direction)))
    }

    /// Mutex guarding the region of `direction`.
    pub fn lock_name(&self, direction: Direction) -> String {
        format!("/{}.lock", self.stem(direction))
    }

    /// Signal posted when a message is ready in the region of `direction`.
    pub fn ready_name(&self, direction: Direction) -> String {
        format!("/{}.ready", self.stem(direction))
    }

    /// Every named semaphore of the channel.
    pub fn semaphore_names(&self) -> Vec<String> {
        Direction::ALL
            .iter()
            .flat_map(|&d| [self.lock_name(d), self.ready_name(d)])
            .collect()
    }

    /// Every backing region file of the channel.
    pub fn region_paths(&self) -> Vec<PathBuf> {
        Direction::ALL.iter().map(|&d| self.region_path(d)).collect()
    }
}

fn duration_ms(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

fn default_region_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if cfg!(target_os = "linux") && shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}
