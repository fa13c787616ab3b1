//! Wires the request lifecycle together: builds every built-in module plus
//! whatever external modules are discoverable on disk, hands them to a
//! [`RequestProcessor`], and owns the spool/cache purge loop's lifetime.
//!
//! The broker transport itself (the PCP/WebSocket connect-and-retry loop,
//! association, TLS handshake) is outside this crate's scope; [`Connector`]
//! already models the only thing the request lifecycle needs from it — a
//! place to send responses. Since [`Connector`] has no inbound registration
//! method, "registering the two request callbacks" is modeled here as two
//! public methods callers invoke directly for each inbound request type,
//! rather than as a callback handed to the transport.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;

use crate::cache::ModuleCache;
use crate::config::Configuration;
use crate::connector::Connector;
use crate::modules::bolt::apply::{ApplyModule, ApplyTlsConfig};
use crate::modules::bolt::download_file::DownloadFileModule;
use crate::modules::bolt::script::ScriptModule;
use crate::modules::command::CommandModule;
use crate::modules::echo::EchoModule;
use crate::modules::external::ExternalModule;
use crate::modules::ping::PingModule;
use crate::modules::task::TaskModule;
use crate::modules::Module;
use crate::processor::RequestProcessor;
use crate::request::RequestType;
use crate::results::ResultsStorage;
use crate::time::{self, TimeError};

/// Fatal errors raised while building an [`Agent`]. Unlike a module failing
/// to load, these abort startup entirely — matching how the original agent
/// treats a malformed TLS or PCP configuration as fatal.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A `<n>{d|h|m}` duration setting (`spool_dir_purge_ttl`,
    /// `cache_dir_purge_ttl`) did not parse.
    #[error("invalid duration in configuration: {0}")]
    InvalidDuration(#[from] TimeError),
    /// The download HTTP client could not be built from the configured
    /// timeouts.
    #[error("failed to build the download HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Owns the loaded module set, the results storage, and the Connector this
/// agent reports through; drives the background purge sweep.
pub struct Agent {
    processor: Arc<RequestProcessor>,
    connector: Arc<dyn Connector>,
    purge_ttl: Duration,
    shutdown_tx: watch::Sender<bool>,
}

impl Agent {
    /// Build an agent from `config`: load every built-in module, discover
    /// external modules under `config.modules_dir`, and wire them into a
    /// [`RequestProcessor`] reporting through `connector`.
    ///
    /// A malformed external module is logged and skipped — it does not
    /// prevent the agent from starting. Only a malformed duration setting
    /// or an unbuildable HTTP client abort construction.
    ///
    /// # Errors
    /// Returns [`AgentError::InvalidDuration`] if `spool_dir_purge_ttl` or
    /// `cache_dir_purge_ttl` is malformed, or [`AgentError::HttpClient`] if
    /// the download client cannot be built.
    pub async fn new(config: &Configuration, connector: Arc<dyn Connector>) -> Result<Self, AgentError> {
        let spool_ttl = time::parse_duration(&config.spool_dir_purge_ttl)?;
        // Validated even though the current purge loop folds cache purging
        // into the single spool-driven sweep (see `run`) — a malformed
        // value here should still fail startup, not surface silently later.
        time::parse_duration(&config.cache_dir_purge_ttl)?;

        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.download_connect_timeout))
            .timeout(Duration::from_secs(config.download_timeout))
            .build()?;
        let cache = Arc::new(ModuleCache::new(config.cache_dir.clone(), http_client));
        let storage = ResultsStorage::new(config.spool_dir.clone());

        let mut modules: Vec<Arc<dyn Module>> = vec![
            Arc::new(EchoModule::new()),
            Arc::new(PingModule::new()),
            Arc::new(CommandModule::new()),
            Arc::new(TaskModule::new(config.tasks_dir.clone())),
            Arc::new(ScriptModule::new(Arc::clone(&cache))),
            Arc::new(DownloadFileModule::new(config.master_uris.clone(), Arc::clone(&cache))),
            Arc::new(ApplyModule::new(apply_tls_config(config), config.libexec_dir.clone(), Arc::clone(&cache))),
        ];
        modules.extend(discover_external_modules(config.modules_dir.as_ref(), config.modules_config_dir.as_ref()).await);

        let processor = Arc::new(RequestProcessor::new(modules, storage, Arc::downgrade(&connector)));
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self { processor, connector, purge_ttl: spool_ttl, shutdown_tx })
    }

    /// The processor backing this agent, for status reporting or tests.
    #[must_use]
    pub fn processor(&self) -> &Arc<RequestProcessor> { &self.processor }

    /// The Connector this agent reports through.
    #[must_use]
    pub fn connector(&self) -> &Arc<dyn Connector> { &self.connector }

    /// Handle one inbound Blocking request. Stands in for the "blocking
    /// request" callback the broker transport would invoke.
    pub async fn handle_blocking_request(&self, message_id: String, sender: String, data: &Value, debug: Vec<Value>) {
        self.processor.process_request(RequestType::Blocking, message_id, sender, data, debug).await;
    }

    /// Handle one inbound NonBlocking request. Stands in for the
    /// "non-blocking request" callback the broker transport would invoke.
    pub async fn handle_non_blocking_request(&self, message_id: String, sender: String, data: &Value, debug: Vec<Value>) {
        self.processor.process_request(RequestType::NonBlocking, message_id, sender, data, debug).await;
    }

    /// Spawn the spool/cache purge loop, returning its join handle. The
    /// loop runs until [`Agent::shutdown`] is called.
    pub fn spawn_purge_loop(&self) -> tokio::task::JoinHandle<()> {
        let processor = Arc::clone(&self.processor);
        let ttl = self.purge_ttl;
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move { processor.run_purge_loop(ttl, shutdown).await })
    }

    /// Signal the purge loop to exit and wait for every outstanding
    /// non-blocking worker to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.processor.shutdown().await;
    }
}

fn apply_tls_config(config: &Configuration) -> ApplyTlsConfig {
    ApplyTlsConfig {
        ca: config.ca.clone().unwrap_or_default(),
        crt: config.crt.clone().unwrap_or_default(),
        key: config.key.clone().unwrap_or_default(),
        crl: config.crl.clone().unwrap_or_default(),
        proxy: config.proxy.clone().unwrap_or_default(),
        master_uris: config.master_uris.clone(),
    }
}

async fn load_module_config(modules_config_dir: &Path, name: &str) -> Option<Value> {
    let path = modules_config_dir.join(format!("{name}.json"));
    let bytes = tokio::fs::read(&path).await.ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::warn!(module = name, path = %path.display(), %error, "ignoring malformed module configuration file");
            None
        }
    }
}

#[cfg(unix)]
async fn is_executable_file(entry: &tokio::fs::DirEntry) -> bool {
    use std::os::unix::fs::PermissionsExt as _;
    entry.metadata().await.map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0).unwrap_or(false)
}

#[cfg(not(unix))]
async fn is_executable_file(entry: &tokio::fs::DirEntry) -> bool {
    entry.file_type().await.map(|t| t.is_file()).unwrap_or(false)
}

/// Load every executable directly under `modules_dir` as an external
/// module, pairing it with `<modules_config_dir>/<name>.json` if present.
/// A missing `modules_dir` yields no modules; a module that fails to load
/// is logged and skipped.
async fn discover_external_modules(modules_dir: &Path, modules_config_dir: &Path) -> Vec<Arc<dyn Module>> {
    let mut modules: Vec<Arc<dyn Module>> = Vec::new();
    let mut entries = match tokio::fs::read_dir(modules_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            tracing::info!(dir = %modules_dir.display(), %error, "no external modules directory, skipping external module discovery");
            return modules;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                tracing::warn!(%error, "failed to read an entry from the external modules directory");
                break;
            }
        };
        if !is_executable_file(&entry).await {
            continue;
        }
        let path = entry.path();
        let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_owned) else {
            continue;
        };
        let config = load_module_config(modules_config_dir, &name).await;
        match ExternalModule::load(path, config).await {
            Ok(module) => modules.push(Arc::new(module)),
            Err(error) => tracing::warn!(module = %name, %error, "skipping external module that failed to load"),
        }
    }
    modules
}
