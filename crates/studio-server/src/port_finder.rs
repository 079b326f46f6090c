use crate::error::PortError;
use anyhow::Result;
use async_trait::async_trait;
use nix::sys::signal::Signal;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use studio_core::config::StudioConfig;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Consecutive probe failures (other than "address in use") tolerated before
/// a scan gives up.
const MAX_PROBE_FAILURES: u32 = 64;

/// Frees a port held by a process the daemon no longer controls.
#[async_trait]
pub trait PortKiller: Send + Sync + std::fmt::Debug {
    /// Kill whatever listens on `port`. Returns how many processes were signalled.
    async fn kill_listeners(&self, port: u16) -> Result<usize>;
}

/// Finds listeners through `/proc` and sends them SIGKILL.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcPortKiller;

#[async_trait]
impl PortKiller for ProcPortKiller {
    async fn kill_listeners(&self, port: u16) -> Result<usize> {
        let own_pid = std::process::id();
        let mut killed = 0;
        for pid in studio_utils::discovery::find_pids_listening_on(port).await? {
            if pid == own_pid {
                continue;
            }
            let pid = i32::try_from(pid)?;
            studio_utils::process::kill_pid(pid, Signal::SIGKILL)?;
            killed += 1;
        }
        Ok(killed)
    }
}

#[derive(Debug)]
struct PortState {
    /// Next candidate for a scan.
    search_port: u16,
    /// Last port handed out.
    open_port: Option<u16>,
    /// Skipped by scans: seeded from persisted sites plus everything leased.
    unavailable: BTreeSet<u16>,
    /// Held by a live process started by this daemon.
    leased: BTreeSet<u16>,
}

impl PortState {
    fn lease(&mut self, port: u16) {
        self.unavailable.insert(port);
        self.leased.insert(port);
        self.open_port = Some(port);
        self.search_port = self.search_port.max(port.saturating_add(1));
    }

    fn forget(&mut self, port: u16, base_port: u16) {
        self.unavailable.remove(&port);
        self.leased.remove(&port);
        self.search_port = base_port;
    }
}

/// Hands out TCP ports for site servers.
///
/// The state lock is held across probe and lease, so two callers can never
/// observe the same port as free.
#[derive(Debug)]
pub struct PortFinder {
    base_port: u16,
    host: String,
    probe_timeout: Duration,
    killer: Arc<dyn PortKiller>,
    state: Mutex<PortState>,
}

impl PortFinder {
    #[must_use]
    pub fn new(config: &StudioConfig, killer: Arc<dyn PortKiller>) -> Self {
        let base_port = config.server.base_port;
        Self {
            base_port,
            host: config.server.host.clone(),
            probe_timeout: config.timeouts.probe(),
            killer,
            state: Mutex::new(PortState {
                search_port: base_port,
                open_port: None,
                unavailable: BTreeSet::new(),
                leased: BTreeSet::new(),
            }),
        }
    }

    #[must_use]
    pub const fn base_port(&self) -> u16 {
        self.base_port
    }

    /// Lease a free port, preferring `preferred` when no live site holds it.
    pub async fn get_open_port(&self, preferred: Option<u16>) -> Result<u16, PortError> {
        let mut state = self.state.lock().await;

        if let Some(port) = preferred
            && !state.leased.contains(&port)
        {
            match self.probe(port).await {
                Ok(true) => {
                    state.lease(port);
                    info!(port, "Leased preferred port");
                    return Ok(port);
                }
                Ok(false) => debug!(port, "Preferred port is taken"),
                Err(e) => debug!(port, "Failed to probe preferred port: {}", e),
            }
        }

        let from = state.search_port;
        let mut failures = 0;
        for port in from..=u16::MAX {
            if state.unavailable.contains(&port) {
                continue;
            }
            match self.probe(port).await {
                Ok(true) => {
                    state.lease(port);
                    info!(port, "Leased port");
                    return Ok(port);
                }
                Ok(false) => failures = 0,
                Err(source) => {
                    failures += 1;
                    if failures >= MAX_PROBE_FAILURES {
                        return Err(PortError::Probe { port, source });
                    }
                }
            }
        }

        Err(PortError::Exhausted { from })
    }

    /// Returns `Ok(true)` when a throwaway listener can bind `port`.
    async fn probe(&self, port: u16) -> std::io::Result<bool> {
        let bind = TcpListener::bind((self.host.as_str(), port));
        match tokio::time::timeout(self.probe_timeout, bind).await {
            Ok(Ok(listener)) => {
                drop(listener);
                Ok(true)
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::AddrInUse => Ok(false),
            Ok(Err(e)) => Err(e),
            // A bind that hangs is as good as taken
            Err(_) => Ok(false),
        }
    }

    /// Override the last issued port; the next scan starts there.
    pub async fn set_port(&self, port: u16) {
        let mut state = self.state.lock().await;
        state.open_port = Some(port);
        state.search_port = port;
    }

    /// Mark a port as in use without probing it.
    pub async fn add_unavailable_port(&self, port: u16) {
        self.state.lock().await.unavailable.insert(port);
    }

    /// Return a port whose process has exited.
    pub async fn release_port(&self, port: u16) {
        self.state.lock().await.forget(port, self.base_port);
        debug!(port, "Released port");
    }

    /// Kill whatever still holds `port`, then make it available again.
    ///
    /// Failures to kill are logged, never returned.
    pub async fn reclaim_unavailable_port(&self, port: u16) {
        match self.killer.kill_listeners(port).await {
            Ok(0) => {}
            Ok(n) => info!(port, "Killed {} process(es) holding port", n),
            Err(e) => warn!(port, "Failed to reclaim port: {}", e),
        }
        self.state.lock().await.forget(port, self.base_port);
    }

    pub async fn last_issued_port(&self) -> Option<u16> {
        self.state.lock().await.open_port
    }

    pub async fn is_unavailable(&self, port: u16) -> bool {
        self.state.lock().await.unavailable.contains(&port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingKiller {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PortKiller for CountingKiller {
        async fn kill_listeners(&self, _port: u16) -> Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }
    }

    /// A base port with a few free ports above it, found by binding port 0.
    async fn finder() -> (PortFinder, Arc<CountingKiller>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let base = listener.local_addr().unwrap().port().min(u16::MAX - 64);
        drop(listener);

        let mut config = StudioConfig::default();
        config.server.base_port = base;
        let killer = Arc::new(CountingKiller::default());
        (PortFinder::new(&config, killer.clone()), killer)
    }

    #[tokio::test]
    async fn concurrent_leases_are_distinct() {
        let (finder, _) = finder().await;
        let finder = Arc::new(finder);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let finder = finder.clone();
                tokio::spawn(async move { finder.get_open_port(None).await.unwrap() })
            })
            .collect();

        let mut ports = BTreeSet::new();
        for task in futures::future::join_all(tasks).await {
            assert!(ports.insert(task.unwrap()));
        }
        assert_eq!(ports.len(), 8);
    }

    #[tokio::test]
    async fn scans_skip_unavailable_and_bound_ports() {
        let (finder, _) = finder().await;
        let base = finder.base_port();
        finder.add_unavailable_port(base).await;

        let port = finder.get_open_port(None).await.unwrap();
        assert_ne!(port, base);
        assert!(port > base);
        assert!(finder.is_unavailable(port).await);
        assert_eq!(finder.last_issued_port().await, Some(port));
    }

    #[tokio::test]
    async fn preferred_port_wins_when_free() {
        let (finder, _) = finder().await;
        let preferred = finder.base_port() + 5;
        // Seeded ports stay usable as a site's own preferred port
        finder.add_unavailable_port(preferred).await;

        assert_eq!(finder.get_open_port(Some(preferred)).await.unwrap(), preferred);
        // ...but never twice while leased
        assert_ne!(finder.get_open_port(Some(preferred)).await.unwrap(), preferred);
    }

    #[tokio::test]
    async fn preferred_port_bound_elsewhere_falls_back_to_scan() {
        let (finder, _) = finder().await;
        let holder = std::net::TcpListener::bind(("127.0.0.1", finder.base_port() + 3));
        let Ok(holder) = holder else {
            return;
        };
        let held = holder.local_addr().unwrap().port();

        let port = finder.get_open_port(Some(held)).await.unwrap();
        assert_ne!(port, held);
    }

    #[tokio::test]
    async fn release_makes_port_reusable() {
        let (finder, _) = finder().await;
        let first = finder.get_open_port(None).await.unwrap();
        finder.release_port(first).await;

        assert!(!finder.is_unavailable(first).await);
        assert_eq!(finder.get_open_port(None).await.unwrap(), first);
    }

    #[tokio::test]
    async fn reclaim_invokes_killer_and_resets_cursor() {
        let (finder, killer) = finder().await;
        let first = finder.get_open_port(None).await.unwrap();
        let second = finder.get_open_port(None).await.unwrap();
        assert!(second > first);

        finder.reclaim_unavailable_port(first).await;
        assert_eq!(killer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(finder.get_open_port(None).await.unwrap(), first);
    }

    #[tokio::test]
    async fn scanning_past_the_last_port_is_bounded() {
        let (finder, _) = finder().await;
        finder.set_port(u16::MAX).await;
        finder.add_unavailable_port(u16::MAX).await;

        let err = finder.get_open_port(None).await.unwrap_err();
        assert!(matches!(err, PortError::Exhausted { from } if from == u16::MAX));
    }
}
