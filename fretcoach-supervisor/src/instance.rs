//! Machine-wide single instance enforcement.
//!
//! The first shell takes an exclusive `flock` on `<runtime_dir>/instance.lock` and
//! keeps it for its whole life. A later launch fails to take the lock, asks the
//! holder to focus its window over the control socket, and exits.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::{self, ApiRequest, CONTROL_SOCKET};
use crate::error::Result;

pub const LOCK_FILE: &str = "instance.lock";

/// How long a second launch waits for the running instance to acknowledge focus.
const FOCUS_TIMEOUT: Duration = Duration::from_secs(2);

/// Held for the lifetime of the owning instance. Dropping it releases the lock.
#[derive(Debug)]
pub struct InstanceLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl InstanceLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug)]
pub enum Acquisition {
    Granted(InstanceLock),
    /// Another instance holds the lock.
    Denied { holder: Option<u32> },
}

pub struct InstanceGuard;

impl InstanceGuard {
    /// Try to become the only instance. Never blocks.
    pub fn acquire(runtime_dir: &Path) -> Result<Acquisition> {
        std::fs::create_dir_all(runtime_dir)?;
        let path = runtime_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(mut lock) => {
                // Record our pid for diagnostics; the lock itself is the source of truth.
                lock.set_len(0)?;
                write!(lock, "{}", std::process::id())?;
                debug!("Acquired instance lock {}", path.display());
                Ok(Acquisition::Granted(InstanceLock { _lock: lock, path }))
            }
            Err((_, Errno::EWOULDBLOCK)) => Ok(Acquisition::Denied {
                holder: read_holder(&path),
            }),
            Err((_, errno)) => Err(std::io::Error::from(errno).into()),
        }
    }

    /// Ask the running instance to bring its window to the front.
    pub async fn notify_existing(socket_path: &Path) -> miette::Result<()> {
        let request = api::api_request(socket_path, &ApiRequest::Focus);
        match tokio::time::timeout(FOCUS_TIMEOUT, request).await {
            Ok(response) => response.map(|_| ()),
            Err(_) => miette::bail!(
                "Running instance did not answer on {} within {:?}",
                socket_path.display(),
                FOCUS_TIMEOUT
            ),
        }
    }
}

/// Take the instance lock, or hand focus to the instance that holds it.
///
/// Returns `None` when another instance is running; the caller must then exit
/// without launching or reclaiming anything.
pub async fn claim_or_focus(runtime_dir: &Path) -> Result<Option<InstanceLock>> {
    match InstanceGuard::acquire(runtime_dir)? {
        Acquisition::Granted(lock) => Ok(Some(lock)),
        Acquisition::Denied { holder } => {
            match holder {
                Some(pid) => info!("FretCoach is already running (pid {})", pid),
                None => info!("FretCoach is already running"),
            }
            let socket = runtime_dir.join(CONTROL_SOCKET);
            if let Err(e) = InstanceGuard::notify_existing(&socket).await {
                warn!("Could not focus the running instance: {}", e);
            }
            Ok(None)
        }
    }
}

fn read_holder(path: &Path) -> Option<u32> {
    let mut content = String::new();
    File::open(path).ok()?.read_to_string(&mut content).ok()?;
    content.trim().parse().ok()
}
