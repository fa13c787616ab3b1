//! The request processor: validates inbound requests, dispatches them to
//! modules, implements the blocking/non-blocking execution policy, answers
//! `status/query`, and runs the spool-directory purge loop.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::Instrument as _;

use crate::connector::Connector;
use crate::locale::format_msg;
use crate::modules::{Module, ModuleError, status};
use crate::pid_file::process_exists;
use crate::request::{ActionRequest, EnvelopeParseError, RequestType};
use crate::response::{ActionResponse, ModuleType};
use crate::results::ResultsStorage;
use crate::results::mutex_registry::ResultsMutexRegistry;
use crate::task_container::{TASKS_THRESHOLD, TaskContainer};

/// Errors that cause a request to be rejected with a PXPError rather than
/// dispatched to a module.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The envelope could not be parsed into an [`ActionRequest`].
    #[error("{0}")]
    Envelope(#[from] EnvelopeParseError),
    /// `request.module()` has no loaded module by that name.
    #[error("module '{0}' is not loaded")]
    UnknownModule(String),
    /// The module exists but has no such action.
    #[error("module '{module}' has no action '{action}'")]
    UnknownAction {
        /// The module that was targeted.
        module: String,
        /// The action name that was not found.
        action: String,
    },
    /// `params` did not validate against the action's input schema.
    #[error("invalid input for '{module}/{action}': {detail}")]
    InvalidInput {
        /// The module that was targeted.
        module: String,
        /// The action that was targeted.
        action: String,
        /// A human-readable description of the schema violation.
        detail: String,
    },
    /// A non-blocking request reused a transaction id with an existing spool
    /// directory.
    #[error("duplicate transaction id '{0}'")]
    DuplicateTransaction(String),
    /// Persisting the initial or final results metadata failed.
    #[error("results storage error: {0}")]
    Storage(#[from] crate::results::ResultsStorageError),
    /// Registering the transaction's result mutex failed (implies a
    /// concurrent duplicate request slipped past the spool-directory check).
    #[error("results mutex error: {0}")]
    Mutex(#[from] crate::results::mutex_registry::ResultsMutexError),
}

fn is_status_query(request: &ActionRequest) -> bool {
    request.module() == "status" && request.action() == "query"
}

/// The hub owning every loaded module, the results storage and mutex
/// registry, the non-blocking worker pool, and a weak handle back to the
/// Connector it reports through.
///
/// The handle to the Connector is `Weak` so that an `Agent` holding both an
/// `Arc<RequestProcessor>` and an `Arc<dyn Connector>` does not form a
/// reference cycle.
pub struct RequestProcessor {
    modules: HashMap<String, Arc<dyn Module>>,
    storage: ResultsStorage,
    mutex_registry: ResultsMutexRegistry,
    task_container: Arc<tokio::sync::Mutex<TaskContainer>>,
    connector: Weak<dyn Connector>,
}

impl RequestProcessor {
    /// Build a processor from its loaded modules, indexed by
    /// [`Module::name`]. Later entries with a duplicate name overwrite
    /// earlier ones.
    #[must_use]
    pub fn new(modules: Vec<Arc<dyn Module>>, storage: ResultsStorage, connector: Weak<dyn Connector>) -> Self {
        let mut by_name = HashMap::with_capacity(modules.len());
        for module in modules {
            by_name.insert(module.name().to_owned(), module);
        }
        Self {
            modules: by_name,
            storage,
            mutex_registry: ResultsMutexRegistry::new(),
            task_container: Arc::new(tokio::sync::Mutex::new(TaskContainer::new("non-blocking-actions"))),
            connector,
        }
    }

    /// Returns `true` if a module named `name` is loaded.
    #[must_use]
    pub fn has_module(&self, name: &str) -> bool { self.modules.contains_key(name) }

    /// Returns `true` if the loaded module `name` carries static
    /// configuration.
    #[must_use]
    pub fn has_module_config(&self, name: &str) -> bool {
        self.modules.get(name).is_some_and(|m| m.config().is_some())
    }

    /// The static configuration registered for module `name`.
    ///
    /// # Errors
    /// Returns [`RequestError::UnknownModule`] if no such module is loaded,
    /// or `Ok(None)` if the module carries no configuration.
    pub fn get_module_config(&self, name: &str) -> Result<Option<Value>, RequestError> {
        self.modules
            .get(name)
            .map(|m| m.config().cloned())
            .ok_or_else(|| RequestError::UnknownModule(name.to_owned()))
    }

    /// Outstanding non-blocking worker tasks not yet reaped.
    #[must_use]
    pub async fn outstanding_worker_count(&self) -> u64 { self.task_container.lock().await.num_outstanding() }

    fn connector(&self) -> Option<Arc<dyn Connector>> { self.connector.upgrade() }

    async fn send_pxp_error(&self, target: &str, transaction_id: &str, description: &str) {
        if let Some(connector) = self.connector() {
            connector.send_pxp_error(target, transaction_id, description).await;
        } else {
            tracing::warn!(transaction_id, description, "connector gone, dropping PXPError");
        }
    }

    /// Parse and dispatch one inbound envelope. Entry point invoked from the
    /// Connector's request callback.
    pub async fn process_request(
        self: &Arc<Self>,
        request_type: RequestType,
        message_id: String,
        sender: String,
        data: &Value,
        debug: Vec<Value>,
    ) {
        let raw_transaction_id = data.get("transaction_id").and_then(Value::as_str).unwrap_or("").to_owned();
        let request = match ActionRequest::from_envelope(request_type, message_id, sender.clone(), data, debug) {
            Ok(request) => request,
            Err(error) => {
                self.send_pxp_error(&sender, &raw_transaction_id, &error.to_string()).await;
                return;
            }
        };

        let span = tracing::info_span!("process_request", transaction_id = request.transaction_id());
        async {
            if let Err(error) = self.validate_request_content(&request) {
                self.send_pxp_error(request.sender(), request.transaction_id(), &error.to_string()).await;
                return;
            }

            match request.request_type() {
                RequestType::Blocking => self.process_blocking(request).await,
                RequestType::NonBlocking => self.process_non_blocking(request).await,
            }
        }
        .instrument(span)
        .await;
    }

    fn validate_request_content(&self, request: &ActionRequest) -> Result<(), RequestError> {
        if is_status_query(request) {
            if request.params().get("transaction_id").and_then(Value::as_str).is_none() {
                return Err(RequestError::InvalidInput {
                    module: "status".to_owned(),
                    action: "query".to_owned(),
                    detail: "missing 'transaction_id'".to_owned(),
                });
            }
            return Ok(());
        }

        let module = self
            .modules
            .get(request.module())
            .ok_or_else(|| RequestError::UnknownModule(request.module().to_owned()))?;
        if !module.has_action(request.action()) {
            return Err(RequestError::UnknownAction {
                module: request.module().to_owned(),
                action: request.action().to_owned(),
            });
        }
        module.validate_input(request.action(), request.params()).map_err(|error| match error {
            ModuleError::InvalidInput { action, detail } => {
                RequestError::InvalidInput { module: request.module().to_owned(), action, detail }
            }
            other => RequestError::InvalidInput {
                module: request.module().to_owned(),
                action: request.action().to_owned(),
                detail: other.to_string(),
            },
        })
    }

    async fn status_response(&self, request: &ActionRequest) -> ActionResponse {
        let transaction_id = request.params().get("transaction_id").and_then(Value::as_str).unwrap_or_default();
        let mut response = ActionResponse::new(ModuleType::Internal, request);
        match status::query_status(&self.storage, &self.mutex_registry, transaction_id, process_exists).await {
            Ok(results) => response.set_valid_results(results),
            Err(error) => response.set_execution_error(error.to_string()),
        }
        response
    }

    async fn process_blocking(&self, request: ActionRequest) {
        let response = if is_status_query(&request) {
            self.status_response(&request).await
        } else {
            let Some(module) = self.modules.get(request.module()) else {
                self.send_pxp_error(request.sender(), request.transaction_id(), "module disappeared after validation").await;
                return;
            };
            module.execute_action(&request).await
        };

        // "no debug entry" is the one module failure the agent reports as a
        // PXPError instead of a completed-but-failed response: ping's
        // execution depends on hop-tracking context that lives outside the
        // action's own input schema, so a missing debug chunk is really a
        // malformed request rather than a module execution failure.
        let no_debug_entry = request.module() == "ping"
            && response.metadata().get("execution_error") == Some(&Value::String("no debug entry".to_owned()));
        if no_debug_entry {
            self.send_pxp_error(request.sender(), request.transaction_id(), "no debug entry").await;
            return;
        }

        if let Some(connector) = self.connector() {
            connector.send_blocking_response(request.sender(), &response).await;
        } else {
            tracing::warn!(transaction_id = request.transaction_id(), "connector gone, dropping blocking response");
        }
    }

    async fn process_non_blocking(self: &Arc<Self>, request: ActionRequest) {
        let transaction_id = request.transaction_id().to_owned();

        if let Err(error) = self.begin_non_blocking(&request).await {
            self.send_pxp_error(request.sender(), &transaction_id, &error.to_string()).await;
            return;
        }

        if let Some(connector) = self.connector() {
            connector.send_provisional_response(request.sender(), &transaction_id).await;
        }

        let processor = Arc::clone(self);
        let should_spawn_monitor = {
            let mut task_container = self.task_container.lock().await;
            task_container.add(async move { processor.run_non_blocking_worker(request).await });
            let over_threshold = task_container.num_outstanding() > TASKS_THRESHOLD;
            if over_threshold && !task_container.is_monitoring() {
                task_container.start_monitoring();
                true
            } else {
                false
            }
        };
        if should_spawn_monitor {
            tokio::spawn(Self::monitor_task_container(Arc::clone(&self.task_container)));
        }
    }

    /// Background reaper spawned once [`TASKS_THRESHOLD`] outstanding
    /// non-blocking workers are live: wakes every 500ms, reclaims finished
    /// entries, and stops itself once the count falls back under threshold.
    async fn monitor_task_container(task_container: Arc<tokio::sync::Mutex<TaskContainer>>) {
        let mut interval = tokio::time::interval(Duration::from_millis(500));
        interval.tick().await;
        loop {
            interval.tick().await;
            let mut guard = task_container.lock().await;
            guard.reap_finished().await;
            if guard.num_outstanding() <= TASKS_THRESHOLD {
                guard.stop_monitoring();
                break;
            }
        }
    }

    async fn begin_non_blocking(&self, request: &ActionRequest) -> Result<(), RequestError> {
        let transaction_id = request.transaction_id();
        if self.storage.find(transaction_id) {
            return Err(RequestError::DuplicateTransaction(transaction_id.to_owned()));
        }

        let module_type = if is_status_query(request) {
            ModuleType::Internal
        } else {
            self.modules
                .get(request.module())
                .map(|m| m.module_type())
                .ok_or_else(|| RequestError::UnknownModule(request.module().to_owned()))?
        };

        request.set_results_dir(self.storage.spool_dir().join(transaction_id));
        let initial = ActionResponse::new(module_type, request);
        self.storage.initialize_metadata_file(transaction_id, initial.metadata()).await?;
        self.mutex_registry.add(transaction_id)?;
        Ok(())
    }

    async fn run_non_blocking_worker(&self, request: ActionRequest) {
        let transaction_id = request.transaction_id().to_owned();

        let mut response = if is_status_query(&request) {
            self.status_response(&request).await
        } else if let Some(module) = self.modules.get(request.module()) {
            module.execute_action(&request).await
        } else {
            let mut response = ActionResponse::new(ModuleType::Internal, &request);
            response.set_execution_error(format_msg("module '{1}' disappeared after dispatch", &[request.module()]));
            response
        };
        response.set_job_id(transaction_id.clone());

        let lock_guard = match self.mutex_registry.get(&transaction_id) {
            Ok(mutex) => Some(mutex.lock_owned().await),
            Err(error) => {
                tracing::warn!(transaction_id, %error, "results mutex missing for own transaction");
                None
            }
        };
        if let Err(error) = self.storage.update_metadata_file(&transaction_id, response.metadata()).await {
            tracing::warn!(transaction_id, %error, "failed to persist final results metadata");
        }
        drop(lock_guard);
        let _ = self.mutex_registry.remove(&transaction_id);

        if request.notify_outcome() {
            if let Some(connector) = self.connector() {
                connector.send_non_blocking_response(request.sender(), &response, &transaction_id).await;
            } else {
                tracing::warn!(transaction_id, "connector gone, dropping non-blocking response");
            }
        }
    }

    /// Run the spool-directory and module-cache purge sweep every
    /// `min(1h, ttl)` until `shutdown` fires.
    pub async fn run_purge_loop(self: Arc<Self>, ttl: Duration, mut shutdown: watch::Receiver<bool>) {
        let period = ttl.min(Duration::from_secs(3600)).max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.purge_once(ttl).await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn purge_once(&self, ttl: Duration) {
        let ongoing = self.mutex_registry.active_transactions();
        match purge_spool_dir(self.storage.spool_dir(), ttl, &ongoing).await {
            Ok(removed) => tracing::debug!(removed, "purged spool directory"),
            Err(error) => tracing::warn!(%error, "spool directory purge failed"),
        }
        for module in self.modules.values() {
            if let Err(error) = module.purge(ttl, &ongoing).await {
                tracing::warn!(module = module.name(), %error, "module purge failed");
            }
        }
    }

    /// Wait for shutdown: signal the worker pool and join every outstanding
    /// non-blocking task.
    pub async fn shutdown(&self) { self.task_container.lock().await.shutdown().await; }
}

async fn purge_spool_dir(spool_dir: &Path, ttl: Duration, ongoing_transactions: &[String]) -> std::io::Result<usize> {
    let cutoff = std::time::SystemTime::now().checked_sub(ttl).unwrap_or(std::time::SystemTime::UNIX_EPOCH);
    let mut removed = 0usize;
    let mut entries = match tokio::fs::read_dir(spool_dir).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(error) => return Err(error),
    };
    while let Some(entry) = entries.next_entry().await? {
        let Ok(file_type) = entry.file_type().await else { continue };
        if !file_type.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if ongoing_transactions.iter().any(|t| t == &name) {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else { continue };
        let Ok(modified) = metadata.modified() else { continue };
        if modified >= cutoff {
            continue;
        }
        match tokio::fs::remove_dir_all(entry.path()).await {
            Ok(()) => removed += 1,
            Err(error) => tracing::warn!(transaction_id = %name, %error, "failed to purge spool directory"),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::connector::{ChannelConnector, SentMessage};
    use crate::modules::echo::EchoModule;
    use crate::modules::ping::PingModule;

    fn build_processor(connector: &Arc<ChannelConnector>) -> Arc<RequestProcessor> {
        let dir = tempdir().unwrap();
        let storage = ResultsStorage::new(dir.path().to_path_buf());
        // leak the tempdir so it outlives the processor in these tests
        std::mem::forget(dir);
        let modules: Vec<Arc<dyn Module>> = vec![Arc::new(EchoModule::new()), Arc::new(PingModule::new())];
        Arc::new(RequestProcessor::new(modules, storage, Arc::downgrade(connector) as Weak<dyn Connector>))
    }

    #[tokio::test]
    async fn echo_blocking_sends_results() {
        let connector = Arc::new(ChannelConnector::new());
        let processor = build_processor(&connector);
        let data = json!({"transaction_id": "t1", "module": "echo", "action": "echo", "params": {"argument": "maradona"}});
        processor.process_request(RequestType::Blocking, "m1".into(), "client".into(), &data, vec![]).await;

        let sent = connector.sent().await;
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            SentMessage::Blocking(_, metadata) => {
                assert_eq!(metadata.get("results").unwrap().get("outcome"), Some(&Value::String("maradona".into())));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_without_debug_becomes_a_pxp_error() {
        let connector = Arc::new(ChannelConnector::new());
        let processor = build_processor(&connector);
        let data = json!({"transaction_id": "t1", "module": "ping", "action": "ping"});
        processor.process_request(RequestType::Blocking, "m1".into(), "client".into(), &data, vec![]).await;

        let sent = connector.sent().await;
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], SentMessage::PxpError(_, tx, desc) if tx == "t1" && desc == "no debug entry"));
    }

    #[tokio::test]
    async fn unknown_module_is_a_pxp_error() {
        let connector = Arc::new(ChannelConnector::new());
        let processor = build_processor(&connector);
        let data = json!({"transaction_id": "t1", "module": "nope", "action": "run"});
        processor.process_request(RequestType::Blocking, "m1".into(), "client".into(), &data, vec![]).await;

        let sent = connector.sent().await;
        assert!(matches!(&sent[0], SentMessage::PxpError(..)));
    }

    #[tokio::test]
    async fn status_query_on_unknown_transaction_is_unknown() {
        let connector = Arc::new(ChannelConnector::new());
        let processor = build_processor(&connector);
        let data = json!({"transaction_id": "status-1", "module": "status", "action": "query", "params": {"transaction_id": "nosuch"}});
        processor.process_request(RequestType::Blocking, "m1".into(), "client".into(), &data, vec![]).await;

        let sent = connector.sent().await;
        match &sent[0] {
            SentMessage::Blocking(_, metadata) => {
                let results = metadata.get("results").unwrap();
                assert_eq!(results.get("status"), Some(&Value::String("unknown".into())));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_blocking_echo_sends_provisional_then_final() {
        let connector = Arc::new(ChannelConnector::new());
        let processor = build_processor(&connector);
        let data = json!({
            "transaction_id": "t1",
            "module": "echo",
            "action": "echo",
            "params": {"argument": "hi"},
            "notify_outcome": true,
        });
        processor
            .process_request(RequestType::NonBlocking, "m1".into(), "client".into(), &data, vec![])
            .await;

        for _ in 0..50 {
            if processor.outstanding_worker_count().await == 0 {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }

        let sent = connector.sent().await;
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[0], SentMessage::Provisional(_, tx) if tx == "t1"));
        match &sent[1] {
            SentMessage::NonBlocking(_, job_id, metadata) => {
                assert_eq!(job_id, "t1");
                assert_eq!(metadata.get("results").unwrap().get("outcome"), Some(&Value::String("hi".into())));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_non_blocking_transaction_is_rejected() {
        let connector = Arc::new(ChannelConnector::new());
        let processor = build_processor(&connector);
        let data = json!({"transaction_id": "dup", "module": "echo", "action": "echo", "params": {"argument": "x"}, "notify_outcome": false});
        processor.process_request(RequestType::NonBlocking, "m1".into(), "client".into(), &data, vec![]).await;
        processor.process_request(RequestType::NonBlocking, "m2".into(), "client".into(), &data, vec![]).await;

        for _ in 0..50 {
            if processor.outstanding_worker_count().await == 0 {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }

        let sent = connector.sent().await;
        assert!(sent.iter().any(|m| matches!(m, SentMessage::PxpError(_, tx, _) if tx == "dup")));
    }

    #[tokio::test]
    async fn crossing_the_task_threshold_spawns_a_reaper_that_reclaims_workers() {
        let connector = Arc::new(ChannelConnector::new());
        let processor = build_processor(&connector);

        for i in 0..=crate::task_container::TASKS_THRESHOLD {
            let data = json!({
                "transaction_id": format!("t{i}"),
                "module": "echo",
                "action": "echo",
                "params": {"argument": "hi"},
                "notify_outcome": false,
            });
            processor
                .process_request(RequestType::NonBlocking, format!("m{i}"), "client".into(), &data, vec![])
                .await;
        }

        tokio::time::sleep(StdDuration::from_millis(1200)).await;
        assert_eq!(processor.outstanding_worker_count().await, 0);
    }

    #[tokio::test]
    async fn purge_spool_dir_skips_ongoing_and_fresh_entries() {
        let dir = tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join("old")).await.unwrap();
        tokio::fs::create_dir(dir.path().join("active")).await.unwrap();
        let stale = std::time::SystemTime::now() - StdDuration::from_secs(3600 * 2);
        let file_times = std::fs::FileTimes::new().set_modified(stale);
        std::fs::File::open(dir.path().join("old")).unwrap().set_times(file_times).unwrap();

        let removed = purge_spool_dir(dir.path(), StdDuration::from_secs(3600), &["active".to_owned()]).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!dir.path().join("old").exists());
        assert!(dir.path().join("active").exists());
    }
}
