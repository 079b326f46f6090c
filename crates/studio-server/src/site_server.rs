//! Lifecycle control for one site's PHP runtime, and the registry of all
//! site servers known to the daemon.

use crate::error::SiteError;
use crate::port_finder::PortFinder;
use crate::runtime::{
    LaunchSpec, RuntimeExit, RuntimeHandle, SiteRuntime, WpCliOutput, WpCliSpec, wait_for_exit,
};
use crate::state::UserDataStore;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use studio_core::config::StudioConfig;
use studio_core::{ServerState, SiteDetails, SiteId, StudioEvent, ThemeDetails};
use studio_utils::probe::{PROBE_INTERVAL, wait_for_tcp};
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Extra time on top of the stop grace period before a stop is abandoned.
const STOP_SLACK: Duration = Duration::from_secs(2);

/// Files that mark a WordPress root.
pub const WORDPRESS_MARKERS: [(&str, bool); 4] = [
    ("wp-content", true),
    ("wp-includes", true),
    ("wp-load.php", false),
    ("wp-config.php", false),
];

/// Returns true if all four WordPress markers sit directly under `root`.
#[must_use]
pub fn has_wordpress_layout(root: &Path) -> bool {
    WORDPRESS_MARKERS.iter().all(|(name, is_dir)| {
        let path = root.join(name);
        if *is_dir { path.is_dir() } else { path.is_file() }
    })
}

/// The directory WordPress lives in: the site root, or its `wordpress/`
/// child when the install is nested one level down.
#[must_use]
pub fn wordpress_root(site_path: &Path) -> Option<PathBuf> {
    if has_wordpress_layout(site_path) {
        return Some(site_path.to_path_buf());
    }
    let nested = site_path.join("wordpress");
    has_wordpress_layout(&nested).then_some(nested)
}

/// Shared collaborators of every site server.
#[derive(Debug, Clone)]
pub struct ServerContext {
    pub ports: Arc<PortFinder>,
    pub runtime: Arc<dyn SiteRuntime>,
    pub store: Arc<UserDataStore>,
    pub config: Arc<StudioConfig>,
    pub events: broadcast::Sender<StudioEvent>,
}

/// How [`SiteServer::execute_wp_cli_command`] treats a stopped server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WpCliMode {
    /// Fail with [`SiteError::NotRunning`].
    RequireRunning,
    /// Start the server first. A server started for the command is stopped
    /// again afterwards unless `leave_running` is set.
    Ephemeral { leave_running: bool },
}

#[derive(Debug, Default)]
struct Lifecycle {
    handle: Option<RuntimeHandle>,
    monitor: Option<JoinHandle<()>>,
    port: Option<u16>,
    /// Bumped on every start so a stale crash monitor can tell it lost.
    generation: u64,
}

/// Controller for one site's runtime process.
///
/// Start and stop hold the lifecycle lock for the whole transition, so a
/// second `start` for the same site waits for the first and then sees it
/// running.
#[derive(Debug)]
pub struct SiteServer {
    ctx: ServerContext,
    details: RwLock<SiteDetails>,
    state: watch::Sender<ServerState>,
    lifecycle: Mutex<Lifecycle>,
}

impl SiteServer {
    fn new(ctx: ServerContext, mut details: SiteDetails) -> Self {
        details.running = false;
        let (state, _) = watch::channel(ServerState::Stopped);
        Self {
            ctx,
            details: RwLock::new(details),
            state,
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub async fn id(&self) -> SiteId {
        self.details.read().await.id
    }

    /// Current details with `running` reflecting the live process.
    pub async fn details(&self) -> SiteDetails {
        let mut details = self.details.read().await.clone();
        details.running = matches!(*self.state.borrow(), ServerState::Running);
        details
    }

    #[must_use]
    pub fn state(&self) -> ServerState {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.borrow(), ServerState::Running)
    }

    async fn set_state(&self, state: ServerState) {
        let site_id = self.id().await;
        info!(site = %site_id, "Site server {}", state);
        self.state.send_replace(state.clone());
        // No subscribers is fine
        let _ = self.ctx.events.send(StudioEvent::Site { site_id, state });
    }

    /// Apply `f` to the in-memory details. Persisting is up to the caller.
    pub async fn update_details<F>(&self, f: F) -> SiteDetails
    where
        F: FnOnce(&mut SiteDetails),
    {
        let mut details = self.details.write().await;
        f(&mut details);
        details.clone()
    }

    /// Start the site's runtime, or return the current details if it is
    /// already running.
    pub async fn start(self: &Arc<Self>) -> Result<SiteDetails, SiteError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.handle.is_some() && self.is_running().await {
            return Ok(self.details().await);
        }

        self.set_state(ServerState::Starting).await;
        let (site_id, preferred) = {
            let details = self.details.read().await;
            (details.id, details.port)
        };

        let port = match self.ctx.ports.get_open_port(preferred).await {
            Ok(port) => port,
            Err(e) => {
                self.set_state(ServerState::Error(e.to_string())).await;
                return Err(e.into());
            }
        };

        let handle = match self.launch_and_wait(port).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(site = %site_id, port, "Failed to start site: {}", e);
                self.ctx.ports.release_port(port).await;
                self.set_state(ServerState::Error(e.to_string())).await;
                return Err(e);
            }
        };

        lifecycle.generation += 1;
        lifecycle.port = Some(port);
        lifecycle.monitor = Some(self.spawn_monitor(&handle, lifecycle.generation));
        lifecycle.handle = Some(handle);

        self.update_details(|d| {
            d.port = Some(port);
            d.running = true;
        })
        .await;
        self.set_state(ServerState::Running).await;

        if let Err(e) = self
            .ctx
            .store
            .update(|data| {
                if let Some(site) = data.site_mut(site_id) {
                    site.port = Some(port);
                }
            })
            .await
        {
            warn!(site = %site_id, "Failed to persist port {}: {}", port, e);
        }

        Ok(self.details().await)
    }

    async fn launch_and_wait(&self, port: u16) -> Result<RuntimeHandle, SiteError> {
        let spec = {
            let details = self.details.read().await;
            LaunchSpec {
                site_id: details.id,
                document_root: wordpress_root(&details.path).unwrap_or_else(|| details.path.clone()),
                host: self.ctx.config.server.host.clone(),
                port,
                php_version: details.php_version.clone(),
            }
        };

        let handle = self.ctx.runtime.launch(&spec).await?;
        let mut exit = handle.exit_receiver();
        let address = spec.address();
        let timeout = self.ctx.config.timeouts.start();

        tokio::select! {
            ready = wait_for_tcp(&address, PROBE_INTERVAL, timeout) => {
                if ready {
                    Ok(handle)
                } else {
                    handle.shutdown().await;
                    Err(SiteError::StartTimeout(timeout))
                }
            }
            status = wait_for_exit(&mut exit) => {
                Err(SiteError::ExitedBeforeReady { code: status.code })
            }
        }
    }

    fn spawn_monitor(self: &Arc<Self>, handle: &RuntimeHandle, generation: u64) -> JoinHandle<()> {
        let mut exit = handle.exit_receiver();
        let server: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let status = wait_for_exit(&mut exit).await;
            if status.requested {
                return;
            }
            if let Some(server) = server.upgrade() {
                server.on_crash(status, generation).await;
            }
        })
    }

    async fn on_crash(&self, status: RuntimeExit, generation: u64) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.generation != generation || lifecycle.handle.is_none() {
            return;
        }

        lifecycle.handle = None;
        lifecycle.monitor = None;
        if let Some(port) = lifecycle.port.take() {
            self.ctx.ports.release_port(port).await;
        }

        self.update_details(|d| d.running = false).await;
        let reason = SiteError::Crashed { code: status.code }.to_string();
        let site_id = self.id().await;
        error!(site = %site_id, "{}", reason);
        self.set_state(ServerState::Error(reason)).await;
    }

    /// Stop the runtime. Stopping a stopped server is a no-op.
    pub async fn stop(&self) -> Result<SiteDetails, SiteError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(handle) = lifecycle.handle.take() else {
            if matches!(*self.state.borrow(), ServerState::Error(_)) {
                self.set_state(ServerState::Stopped).await;
            }
            return Ok(self.details().await);
        };

        if let Some(monitor) = lifecycle.monitor.take() {
            monitor.abort();
        }
        self.set_state(ServerState::Stopping).await;

        let deadline = self.ctx.config.timeouts.stop() + STOP_SLACK;
        let port = lifecycle.port.take();
        let site_id = self.id().await;
        match tokio::time::timeout(deadline, handle.shutdown()).await {
            Ok(exit) => {
                info!(site = %site_id, code = ?exit.code, "PHP runtime exited");
                if let Some(port) = port {
                    self.ctx.ports.release_port(port).await;
                }
            }
            Err(_) => {
                warn!(
                    site = %site_id,
                    "{}",
                    SiteError::StopTimeout(deadline)
                );
                if let Some(port) = port {
                    self.ctx.ports.reclaim_unavailable_port(port).await;
                }
            }
        }

        self.update_details(|d| d.running = false).await;
        self.set_state(ServerState::Stopped).await;
        Ok(self.details().await)
    }

    /// Run a WP-CLI command for this site.
    ///
    /// `args` excludes the leading `wp`. Command failures are reported in the
    /// returned output; only failing to run the command at all is an error.
    pub async fn execute_wp_cli_command(
        self: &Arc<Self>,
        args: &[String],
        mode: WpCliMode,
    ) -> Result<WpCliOutput, SiteError> {
        let mut started_here = false;
        if !self.is_running().await {
            match mode {
                WpCliMode::RequireRunning => return Err(SiteError::NotRunning),
                WpCliMode::Ephemeral { .. } => {
                    self.start().await?;
                    started_here = true;
                }
            }
        }

        let spec = {
            let details = self.details.read().await;
            WpCliSpec {
                site_id: details.id,
                site_root: wordpress_root(&details.path).unwrap_or_else(|| details.path.clone()),
                php_version: details.php_version.clone(),
                timeout: self.ctx.config.timeouts.wp_cli(),
            }
        };
        let output = self.ctx.runtime.run_wp_cli(&spec, args).await;

        if started_here && matches!(mode, WpCliMode::Ephemeral { leave_running: false }) {
            self.stop().await?;
        }
        output
    }

    /// Refresh the active theme from WP-CLI and persist it.
    ///
    /// Best effort: failures are logged and leave the old value.
    pub async fn refresh_theme_details(self: &Arc<Self>) -> Option<ThemeDetails> {
        let args: Vec<String> = [
            "theme",
            "list",
            "--status=active",
            "--fields=name,title,version",
            "--format=json",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        let site_id = self.id().await;
        let output = match self.execute_wp_cli_command(&args, WpCliMode::RequireRunning).await {
            Ok(output) if output.exit_code == 0 => output,
            Ok(output) => {
                warn!(site = %site_id, "Failed to list themes: {}", output.stderr.trim());
                return None;
            }
            Err(e) => {
                warn!(site = %site_id, "Failed to list themes: {}", e);
                return None;
            }
        };

        let site_path = self.details.read().await.path.clone();
        let theme = match parse_active_theme(&output.stdout, &site_path) {
            Ok(Some(theme)) => theme,
            Ok(None) => return None,
            Err(e) => {
                warn!(site = %site_id, "Unexpected theme list output: {}", e);
                return None;
            }
        };

        self.update_details(|d| d.theme_details = Some(theme.clone()))
            .await;
        let persisted = theme.clone();
        if let Err(e) = self
            .ctx
            .store
            .update(move |data| {
                if let Some(site) = data.site_mut(site_id) {
                    site.theme_details = Some(persisted);
                }
            })
            .await
        {
            warn!(site = %site_id, "Failed to persist theme details: {}", e);
        }
        Some(theme)
    }
}

#[derive(Debug, Deserialize)]
struct ThemeListEntry {
    name: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

fn parse_active_theme(
    stdout: &str,
    site_path: &Path,
) -> Result<Option<ThemeDetails>, serde_json::Error> {
    let entries: Vec<ThemeListEntry> = serde_json::from_str(stdout.trim())?;
    let Some(entry) = entries.into_iter().next() else {
        return Ok(None);
    };

    let root = wordpress_root(site_path).unwrap_or_else(|| site_path.to_path_buf());
    let theme_dir = root.join("wp-content/themes").join(&entry.name);
    let is_block_theme = theme_dir.join("templates/index.html").is_file()
        || theme_dir.join("block-templates/index.html").is_file();

    Ok(Some(ThemeDetails {
        name: entry.title.unwrap_or_else(|| entry.name.clone()),
        path: theme_dir.to_string_lossy().into_owned(),
        slug: entry.name,
        version: entry.version.filter(|v| !v.is_empty()),
        is_block_theme,
    }))
}

/// All site servers created during this daemon's lifetime, by site id.
#[derive(Debug)]
pub struct SiteRegistry {
    ctx: ServerContext,
    servers: Mutex<HashMap<SiteId, Arc<SiteServer>>>,
}

impl SiteRegistry {
    #[must_use]
    pub fn new(ctx: ServerContext) -> Self {
        Self {
            ctx,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Return the server for `details.id`, creating it on first use.
    pub async fn create(&self, details: SiteDetails) -> Arc<SiteServer> {
        let mut servers = self.servers.lock().await;
        servers
            .entry(details.id)
            .or_insert_with(|| Arc::new(SiteServer::new(self.ctx.clone(), details)))
            .clone()
    }

    pub async fn get(&self, id: SiteId) -> Option<Arc<SiteServer>> {
        self.servers.lock().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: SiteId) -> Option<Arc<SiteServer>> {
        self.servers.lock().await.remove(&id)
    }

    pub async fn all(&self) -> Vec<Arc<SiteServer>> {
        self.servers.lock().await.values().cloned().collect()
    }
}
