//! # Cross-process resource acquisition
//!
//! Static IPs for connect machines and local ports for the share proxy are
//! handed out from fixed pools. Ownership is decided by an exclusive,
//! non-blocking advisory lock on a file named after the resource inside a
//! shared lock directory, so two sessions started at the same time on the
//! same host can never pick the same value.
//!
//! An [`Acquired`] value keeps the lock open until it is released, either
//! explicitly with [`Acquired::release`] or when it is dropped.

use std::fs::{File, OpenOptions};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{Result, ShareError};

/// Ephemeral port range the share proxy port is taken from, highest first.
pub const SHARE_PORT_RANGE: RangeInclusive<u16> = 49152..=65535;

/// Network the automatic connect IPs come from (`172.16.0.0/12`).
const IP_POOL_BASE: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 0);
const IP_POOL_PREFIX: u32 = 12;

/// The network and first host address of the pool are skipped; both tend to
/// clash with provider networking.
const IP_POOL_SKIP: u32 = 2;

const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// A resource held under an exclusive file lock.
#[derive(Debug)]
pub struct Acquired<T> {
    value: T,
    lock: Option<File>,
    path: PathBuf,
}

impl<T: Copy> Acquired<T> {
    pub fn value(&self) -> T {
        self.value
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes the lock and removes the backing file.
    pub fn release(mut self) {
        self.release_inner();
    }
}

impl<T> Acquired<T> {
    fn release_inner(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        // Unlink before unlocking. Whoever locks the old file afterwards
        // sees it is no longer at `path` and backs off.
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Released lock {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove lock file {}: {}", self.path.display(), e),
        }
        drop(lock);
    }
}

impl<T> Drop for Acquired<T> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

pub type AcquiredIp = Acquired<IpAddr>;
pub type AcquiredPort = Acquired<u16>;

/// Hands out IPs and ports, arbitrated through lock files in `lock_dir`.
#[derive(Debug, Clone)]
pub struct ResourceAcquirer {
    lock_dir: PathBuf,
}

impl ResourceAcquirer {
    pub fn new(lock_dir: impl Into<PathBuf>) -> Result<Self> {
        let lock_dir = lock_dir.into();
        std::fs::create_dir_all(&lock_dir)?;
        Ok(Self { lock_dir })
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Acquires `requested`, or the first free address of the pool.
    ///
    /// A requested IP that is already held elsewhere yields `Ok(None)` so
    /// the caller can decide what to do. Without a request the pool is
    /// walked in order; running off its end is an error.
    pub fn acquire_ip(&self, requested: Option<IpAddr>) -> Result<Option<AcquiredIp>> {
        if let Some(ip) = requested {
            return self.try_acquire_ip(ip);
        }

        for ip in ip_pool() {
            if let Some(acquired) = self.try_acquire_ip(IpAddr::V4(ip))? {
                return Ok(Some(acquired));
            }
        }
        Err(ShareError::IpCouldNotAutoAcquire)
    }

    fn try_acquire_ip(&self, ip: IpAddr) -> Result<Option<AcquiredIp>> {
        let path = self.lock_dir.join(format!("connect_{ip}"));
        match try_lock(&path)? {
            Some(lock) => {
                debug!("Acquired IP {}", ip);
                Ok(Some(Acquired {
                    value: ip,
                    lock: Some(lock),
                    path,
                }))
            }
            None => {
                debug!("IP {} is held by another session", ip);
                Ok(None)
            }
        }
    }

    /// Acquires `requested` if it is free, or the highest free port of
    /// [`SHARE_PORT_RANGE`].
    ///
    /// A port is free when its lock can be taken and nothing accepts
    /// connections on it locally.
    pub fn acquire_port(&self, requested: Option<u16>) -> Result<Option<AcquiredPort>> {
        if let Some(port) = requested {
            return self.try_acquire_port(port);
        }

        for port in SHARE_PORT_RANGE.rev() {
            if let Some(acquired) = self.try_acquire_port(port)? {
                return Ok(Some(acquired));
            }
        }
        Err(ShareError::PortCouldNotAcquire)
    }

    fn try_acquire_port(&self, port: u16) -> Result<Option<AcquiredPort>> {
        let path = self.lock_dir.join(format!("share_{port}"));
        let Some(lock) = try_lock(&path)? else {
            return Ok(None);
        };

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        match TcpStream::connect_timeout(&addr, PORT_PROBE_TIMEOUT) {
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                debug!("Acquired port {}", port);
                Ok(Some(Acquired {
                    value: port,
                    lock: Some(lock),
                    path,
                }))
            }
            _ => {
                debug!("Port {} is in use", port);
                Acquired {
                    value: port,
                    lock: Some(lock),
                    path,
                }
                .release();
                Ok(None)
            }
        }
    }
}

/// Attempts to reopen a lock file that was replaced while we were locking it.
const STALE_LOCK_RETRIES: usize = 3;

fn try_lock(path: &Path) -> Result<Option<File>> {
    for _ in 0..STALE_LOCK_RETRIES {
        match lock_opened(open_lock_file(path)?, path)? {
            LockAttempt::Held(file) => return Ok(Some(file)),
            LockAttempt::Contended => return Ok(None),
            LockAttempt::Stale => debug!("Lock file {} was replaced, retrying", path.display()),
        }
    }
    Ok(None)
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

#[derive(Debug)]
enum LockAttempt {
    Held(File),
    Contended,
    /// Locked, but the file was released and unlinked in the meantime.
    Stale,
}

fn lock_opened(file: File, path: &Path) -> io::Result<LockAttempt> {
    match file.try_lock_exclusive() {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
            return Ok(LockAttempt::Contended);
        }
        Err(e) => return Err(e),
    }

    if still_linked(&file, path)? {
        Ok(LockAttempt::Held(file))
    } else {
        Ok(LockAttempt::Stale)
    }
}

/// Whether `file` is still the file found at `path`.
#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

// Open files cannot be unlinked here, so a locked handle is never stale.
#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> io::Result<bool> {
    Ok(path.exists())
}

/// Host addresses of the automatic IP pool, in order.
fn ip_pool() -> impl Iterator<Item = Ipv4Addr> {
    let base = u32::from(IP_POOL_BASE);
    let size = 1u32 << (32 - IP_POOL_PREFIX);
    (base + IP_POOL_SKIP..base + size - 1).map(Ipv4Addr::from)
}

/// Whether `ip` lies inside the automatic IP pool network.
pub fn in_ip_pool(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let mask = u32::MAX << (32 - IP_POOL_PREFIX);
            u32::from(v4) & mask == u32::from(IP_POOL_BASE)
        }
        IpAddr::V6(_) => false,
    }
}
