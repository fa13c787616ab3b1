//! The `status/query` action: handled directly by the request processor
//! rather than routed to a module instance, because it reads and sometimes
//! finalizes another transaction's results rather than performing work of
//! its own.

use serde_json::{Value, json};

use crate::response::ActionStatus;
use crate::results::ResultsStorage;
use crate::results::mutex_registry::ResultsMutexRegistry;

use super::ModuleError;

/// Look up `transaction_id`'s status, finalizing it in place if its worker
/// has finished or the agent restarted mid-execution.
///
/// # Errors
/// Returns [`ModuleError::Processing`] if the metadata file exists but
/// cannot be read or parsed.
pub async fn query_status(
    storage: &ResultsStorage,
    mutex_registry: &ResultsMutexRegistry,
    transaction_id: &str,
    process_exists: impl Fn(u32) -> bool,
) -> Result<Value, ModuleError> {
    if !storage.find(transaction_id) {
        return Ok(json!({ "transaction_id": transaction_id, "status": "unknown" }));
    }

    let _guard = match mutex_registry.get(transaction_id) {
        Ok(mutex) => Some(mutex.lock_owned().await),
        Err(_) => None,
    };

    let mut metadata = storage
        .get_action_metadata(transaction_id)
        .await
        .map_err(|e| ModuleError::Processing(e.to_string()))?;

    let status = metadata.get("status").and_then(Value::as_str).unwrap_or("unknown");

    if status == "running" && storage.output_is_ready(transaction_id) {
        let output = storage.get_output(transaction_id).await.map_err(|e| ModuleError::Processing(e.to_string()))?;
        let new_status = if output.exitcode == 0 { ActionStatus::Success } else { ActionStatus::Failure };
        metadata.insert("status".into(), serde_json::to_value(new_status).unwrap_or(Value::Null));
        metadata.insert(
            "results".into(),
            json!({ "exitcode": output.exitcode, "stdout": output.stdout, "stderr": output.stderr }),
        );
        metadata.insert("results_are_valid".into(), Value::Bool(true));
        metadata.insert("end".into(), Value::String(chrono::Utc::now().to_rfc3339()));
        storage.update_metadata_file(transaction_id, &metadata).await.map_err(|e| ModuleError::Processing(e.to_string()))?;
    } else if status == "running" && !storage.output_is_ready(transaction_id) && storage.pid_file_exists(transaction_id) {
        let pid = storage.get_pid(transaction_id).await.map_err(|e| ModuleError::Processing(e.to_string()))?;
        if !process_exists(pid) {
            metadata.insert("status".into(), serde_json::to_value(ActionStatus::Undetermined).unwrap_or(Value::Null));
            metadata.insert("end".into(), Value::String(chrono::Utc::now().to_rfc3339()));
            storage.update_metadata_file(transaction_id, &metadata).await.map_err(|e| ModuleError::Processing(e.to_string()))?;
        }
    }

    Ok(Value::Object(metadata))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn unknown_transaction_returns_unknown_status() {
        let dir = tempdir().unwrap();
        let storage = ResultsStorage::new(dir.path());
        let registry = ResultsMutexRegistry::new();
        let result = query_status(&storage, &registry, "missing", |_| true).await.unwrap();
        assert_eq!(result.get("status"), Some(&Value::String("unknown".into())));
    }

    #[tokio::test]
    async fn finalizes_running_transaction_once_exitcode_appears() {
        let dir = tempdir().unwrap();
        let storage = ResultsStorage::new(dir.path());
        let registry = ResultsMutexRegistry::new();
        let metadata = json!({"status": "running"}).as_object().unwrap().clone();
        storage.initialize_metadata_file("t1", &metadata).await.unwrap();
        let txn_dir = dir.path().join("t1");
        tokio::fs::write(txn_dir.join("exitcode"), b"0").await.unwrap();
        tokio::fs::write(txn_dir.join("stdout"), b"done").await.unwrap();

        let result = query_status(&storage, &registry, "t1", |_| true).await.unwrap();
        assert_eq!(result.get("status"), Some(&Value::String("success".into())));
    }

    #[tokio::test]
    async fn finalizes_as_undetermined_when_pid_is_dead() {
        let dir = tempdir().unwrap();
        let storage = ResultsStorage::new(dir.path());
        let registry = ResultsMutexRegistry::new();
        let metadata = json!({"status": "running"}).as_object().unwrap().clone();
        storage.initialize_metadata_file("t1", &metadata).await.unwrap();
        tokio::fs::write(dir.path().join("t1").join("pid"), b"99999\n").await.unwrap();

        let result = query_status(&storage, &registry, "t1", |_| false).await.unwrap();
        assert_eq!(result.get("status"), Some(&Value::String("undetermined".into())));
    }
}
