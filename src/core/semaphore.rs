use std::ffi::CString;
use std::time::Duration;

use log::warn;

#[cfg(not(target_os = "linux"))]
use crate::core::wait::Backoff;
use crate::core::{Error, Result};

const SEM_MODE: libc::c_uint = 0o600;

/// A POSIX named semaphore shared between processes.
///
/// Used two ways by the channel: with an initial value of 1 as a mutex over a
/// region, and with an initial value of 0 as a "message ready" signal.
pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: String,
    c_name: CString,
    owner: bool,
    unlinked: bool,
}

// SAFETY: a sem_t handle returned by sem_open may be used from any thread.
unsafe impl Send for NamedSemaphore {}

impl NamedSemaphore {
    /// Creates the semaphore exclusively. Fails if the name already exists.
    pub fn create(name: &str, initial: u32) -> Result<Self> {
        let c_name = semaphore_name(name)?;
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                SEM_MODE,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(Error::unavailable(name, std::io::Error::last_os_error()));
        }
        Ok(Self {
            sem,
            name: name.to_string(),
            c_name,
            owner: true,
            unlinked: false,
        })
    }

    /// Attaches to a semaphore created by the peer. Never creates one.
    pub fn open(name: &str) -> Result<Self> {
        let c_name = semaphore_name(name)?;
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(Error::unavailable(name, std::io::Error::last_os_error()));
        }
        Ok(Self {
            sem,
            name: name.to_string(),
            c_name,
            owner: false,
            unlinked: false,
        })
    }

    /// Blocks until the count can be decremented.
    pub fn acquire(&self) -> Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(Error::Io(err));
            }
        }
    }

    /// Decrements the count if it is positive. Never blocks.
    pub fn try_acquire(&self) -> Result<bool> {
        loop {
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Ok(true);
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(Error::Io(err)),
            }
        }
    }

    /// Waits at most `timeout` for the count. Returns `false` on expiry.
    #[cfg(target_os = "linux")]
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = realtime_deadline(timeout)?;
        loop {
            if unsafe { libc::sem_timedwait(self.sem, &deadline) } == 0 {
                return Ok(true);
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ETIMEDOUT) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(Error::Io(err)),
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<bool> {
        let start = std::time::Instant::now();
        let mut backoff = Backoff::new(Duration::from_micros(50), Duration::from_millis(5));
        loop {
            if self.try_acquire()? {
                return Ok(true);
            }
            if start.elapsed() >= timeout {
                return Ok(false);
            }
            backoff.snooze();
        }
    }

    /// Increments the count, waking one waiter.
    pub fn release(&self) -> Result<()> {
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Acquires the semaphore as a mutex; the guard releases it on drop.
    pub fn lock(&self) -> Result<SemaphoreGuard<'_>> {
        self.acquire()?;
        Ok(SemaphoreGuard { sem: self })
    }

    /// Like [`lock`](Self::lock) but gives up after `timeout`.
    pub fn lock_timeout(&self, timeout: Option<Duration>) -> Result<SemaphoreGuard<'_>> {
        match timeout {
            None => self.lock(),
            Some(timeout) => {
                if self.acquire_timeout(timeout)? {
                    Ok(SemaphoreGuard { sem: self })
                } else {
                    Err(Error::Timeout("region mutex"))
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Removes the name while keeping this handle usable. Peers that already
    /// opened the semaphore keep working; new opens fail. No-op for openers.
    pub fn unlink_name(&mut self) -> Result<()> {
        if !self.owner || self.unlinked {
            return Ok(());
        }
        self.unlinked = true;
        Self::unlink(&self.name).map(|_| ())
    }

    /// Closes the handle and, for the creator, unlinks the name.
    pub fn destroy(mut self) -> Result<()> {
        self.close_handle()
    }

    /// Removes a semaphore by name. Returns `false` when it did not exist.
    pub fn unlink(name: &str) -> Result<bool> {
        let c_name = semaphore_name(name)?;
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            return Ok(false);
        }
        Err(Error::Io(err))
    }

    /// Reports whether a semaphore with this name currently exists.
    pub fn exists(name: &str) -> Result<bool> {
        match Self::open(name) {
            Ok(_) => Ok(true),
            Err(Error::ResourceUnavailable { source, .. })
                if source.raw_os_error() == Some(libc::ENOENT) =>
            {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    fn close_handle(&mut self) -> Result<()> {
        if self.sem.is_null() {
            return Ok(());
        }
        let closed = unsafe { libc::sem_close(self.sem) };
        self.sem = std::ptr::null_mut();
        let close_err = (closed != 0).then(std::io::Error::last_os_error);
        if self.owner && !self.unlinked && unsafe { libc::sem_unlink(self.c_name.as_ptr()) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(Error::Io(err));
            }
        }
        match close_err {
            Some(err) => Err(Error::Io(err)),
            None => Ok(()),
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        if let Err(err) = self.close_handle() {
            warn!("failed to release semaphore {}: {err}", self.name);
        }
    }
}

/// Scoped hold on a semaphore used as a mutex.
pub struct SemaphoreGuard<'a> {
    sem: &'a NamedSemaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.sem.release() {
            warn!("failed to release mutex {}: {err}", self.sem.name);
        }
    }
}

fn semaphore_name(name: &str) -> Result<CString> {
    if !name.starts_with('/') || name.len() < 2 || name[1..].contains('/') {
        return Err(Error::InvalidConfig(format!(
            "semaphore name must be '/' followed by a non-empty name without '/': {name}"
        )));
    }
    CString::new(name).map_err(|_| Error::InvalidConfig(format!("semaphore name contains NUL: {name}")))
}

#[cfg(target_os = "linux")]
fn realtime_deadline(timeout: Duration) -> Result<libc::timespec> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    let mut secs = (now.tv_sec as i64).saturating_add(timeout.as_secs().min(i64::MAX as u64) as i64);
    let mut nanos = now.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
    if nanos >= 1_000_000_000 {
        secs = secs.saturating_add(1);
        nanos -= 1_000_000_000;
    }
    Ok(libc::timespec {
        tv_sec: secs as libc::time_t,
        tv_nsec: nanos as libc::c_long,
    })
}
