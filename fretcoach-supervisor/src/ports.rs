//! Port reclamation.
//!
//! Before a launch and after a shutdown, anything still bound to the backend's
//! well-known port is killed. A crashed previous run otherwise leaves an orphan
//! holding the port and the new backend cannot bind.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

impl From<KillSignal> for Signal {
    fn from(signal: KillSignal) -> Self {
        match signal {
            KillSignal::Terminate => Signal::SIGTERM,
            KillSignal::Kill => Signal::SIGKILL,
        }
    }
}

/// OS process table operations used by the supervisor.
pub trait Platform: Send + Sync {
    /// Pids owning a TCP socket whose local port is `port`.
    fn processes_on_port(&self, port: u16) -> Vec<u32>;

    fn kill_pid(&self, pid: u32, signal: KillSignal) -> io::Result<()>;

    fn kill_group(&self, pgid: u32, signal: KillSignal) -> io::Result<()> {
        signal::killpg(Pid::from_raw(pgid as i32), Signal::from(signal)).map_err(io::Error::from)
    }
}

/// The real process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPlatform;

impl Platform for SystemPlatform {
    fn processes_on_port(&self, port: u16) -> Vec<u32> {
        use netstat2::{AddressFamilyFlags, ProtocolFlags, ProtocolSocketInfo, get_sockets_info};

        let af_flags = AddressFamilyFlags::IPV4 | AddressFamilyFlags::IPV6;
        let sockets = match get_sockets_info(af_flags, ProtocolFlags::TCP) {
            Ok(sockets) => sockets,
            Err(e) => {
                debug!("Could not list sockets: {}", e);
                return Vec::new();
            }
        };

        let pids: BTreeSet<u32> = sockets
            .into_iter()
            .filter(|socket| match &socket.protocol_socket_info {
                ProtocolSocketInfo::Tcp(tcp) => tcp.local_port == port,
                ProtocolSocketInfo::Udp(_) => false,
            })
            .flat_map(|socket| socket.associated_pids)
            .collect();
        pids.into_iter().collect()
    }

    fn kill_pid(&self, pid: u32, signal: KillSignal) -> io::Result<()> {
        signal::kill(Pid::from_raw(pid as i32), Signal::from(signal)).map_err(io::Error::from)
    }
}

/// Best-effort killer of whatever holds the backend port.
#[derive(Clone)]
pub struct PortReclaimer {
    platform: Arc<dyn Platform>,
    own_pid: u32,
}

impl PortReclaimer {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            own_pid: std::process::id(),
        }
    }

    /// Force-kill every process bound to `port`. Never fails; returns the pids signalled.
    ///
    /// The supervisor's own pid is never touched.
    pub fn reclaim(&self, port: u16) -> Vec<u32> {
        let pids: Vec<u32> = self
            .platform
            .processes_on_port(port)
            .into_iter()
            .filter(|pid| *pid != self.own_pid)
            .collect();

        if pids.is_empty() {
            debug!("Port {} is free", port);
            return pids;
        }

        let mut killed = Vec::with_capacity(pids.len());
        for pid in pids {
            match self.platform.kill_pid(pid, KillSignal::Kill) {
                Ok(()) => {
                    info!("Killed orphaned process {} holding port {}", pid, port);
                    killed.push(pid);
                }
                Err(e) if e.raw_os_error() == Some(nix::errno::Errno::ESRCH as i32) => {
                    debug!("Process {} on port {} already gone", pid, port);
                }
                Err(e) => {
                    warn!("Failed to kill process {} on port {}: {}", pid, port, e);
                }
            }
        }
        killed
    }

    /// `reclaim` off the async executor, since socket listing reads `/proc`.
    pub async fn reclaim_async(&self, port: u16) -> Vec<u32> {
        let reclaimer = self.clone();
        tokio::task::spawn_blocking(move || reclaimer.reclaim(port))
            .await
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakePlatform {
        listening: Vec<u32>,
        refuse: Vec<u32>,
        killed: Mutex<Vec<(u32, KillSignal)>>,
    }

    impl Platform for FakePlatform {
        fn processes_on_port(&self, _port: u16) -> Vec<u32> {
            self.listening.clone()
        }

        fn kill_pid(&self, pid: u32, signal: KillSignal) -> io::Result<()> {
            if self.refuse.contains(&pid) {
                return Err(io::Error::from_raw_os_error(nix::errno::Errno::EPERM as i32));
            }
            self.killed.lock().unwrap().push((pid, signal));
            Ok(())
        }
    }

    #[test]
    fn free_port_kills_nothing() {
        let platform = Arc::new(FakePlatform::default());
        let reclaimer = PortReclaimer::new(platform.clone());
        assert!(reclaimer.reclaim(8000).is_empty());
        assert!(platform.killed.lock().unwrap().is_empty());
    }

    #[test]
    fn kills_holders_but_never_itself() {
        let own = std::process::id();
        let platform = Arc::new(FakePlatform {
            listening: vec![4242, own, 4343],
            refuse: vec![4343],
            ..Default::default()
        });
        let reclaimer = PortReclaimer::new(platform.clone());

        assert_eq!(reclaimer.reclaim(8000), vec![4242]);
        assert_eq!(
            *platform.killed.lock().unwrap(),
            vec![(4242, KillSignal::Kill)]
        );
    }

    #[test]
    fn system_platform_finds_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let pids = SystemPlatform.processes_on_port(port);
        // Socket tables may hide pids without privileges; when listed, it must be us.
        assert!(pids.iter().all(|pid| *pid == std::process::id()));
    }
}
