//! The `download_file` module: downloads a single file into place. Unlike
//! the other bolt-family modules this doesn't run a child process at all —
//! `call_action` is overridden directly, matching the original agent's
//! `DownloadFile::callAction`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::cache::{CacheError, ModuleCache, UriSpec};
use crate::locale::format_msg;
use crate::modules::{ActionSchema, Module, ModuleError};
use crate::request::ActionRequest;
use crate::response::ModuleType;

/// Downloads a single file to a caller-specified destination, verifying its
/// sha256 digest. The input schema types `file` as an array in the original
/// agent, but the handler itself always reads a single object out of it —
/// this module follows that actual behavior.
pub struct DownloadFileModule {
    master_uris: Vec<String>,
    cache: Arc<ModuleCache>,
    actions: Vec<ActionSchema>,
}

impl DownloadFileModule {
    /// Build the `download_file` module, resolving relative `uri.path`
    /// values against `master_uris` in order and caching downloads under
    /// `cache`.
    #[must_use]
    pub fn new(master_uris: Vec<String>, cache: Arc<ModuleCache>) -> Self {
        Self {
            master_uris,
            cache,
            actions: vec![ActionSchema {
                name: "download".to_owned(),
                description: "Download a single file to a destination path".to_owned(),
                input: json!({
                    "type": "object",
                    "properties": {
                        "file": {
                            "type": "object",
                            "properties": {
                                "filename": { "type": "string" },
                                "destination": { "type": "string" },
                                "uri": {
                                    "type": "object",
                                    "properties": {
                                        "path": { "type": "string" },
                                        "params": { "type": "object" },
                                    },
                                    "required": ["path", "params"],
                                },
                                "sha256": { "type": "string" },
                            },
                            "required": ["filename", "destination", "uri", "sha256"],
                        },
                    },
                    "required": ["file"],
                }),
                results: json!({
                    "type": "object",
                    "properties": { "exitcode": { "type": "integer" } },
                    "required": ["exitcode"],
                }),
            }],
        }
    }

    fn candidate_uris(&self, path: &str) -> Vec<String> {
        if self.master_uris.is_empty() {
            return vec![path.to_owned()];
        }
        self.master_uris.iter().map(|base| format!("{}{}", base.trim_end_matches('/'), path)).collect()
    }
}

#[async_trait]
impl Module for DownloadFileModule {
    fn name(&self) -> &str { "download_file" }
    fn actions(&self) -> &[ActionSchema] { &self.actions }
    fn module_type(&self) -> ModuleType { ModuleType::Internal }

    async fn call_action(&self, request: &ActionRequest) -> Result<Value, ModuleError> {
        let file = request
            .params()
            .get("file")
            .ok_or_else(|| ModuleError::InvalidInput { action: "download".to_owned(), detail: "missing 'file'".to_owned() })?;
        let destination = file
            .get("destination")
            .and_then(Value::as_str)
            .ok_or_else(|| ModuleError::InvalidInput { action: "download".to_owned(), detail: "missing 'file.destination'".to_owned() })?;
        let sha256 = file
            .get("sha256")
            .and_then(Value::as_str)
            .ok_or_else(|| ModuleError::InvalidInput { action: "download".to_owned(), detail: "missing 'file.sha256'".to_owned() })?;
        let path = file
            .get("uri")
            .and_then(|u| u.get("path"))
            .and_then(Value::as_str)
            .ok_or_else(|| ModuleError::InvalidInput { action: "download".to_owned(), detail: "missing 'file.uri.path'".to_owned() })?;
        let filename = file.get("filename").and_then(Value::as_str).unwrap_or("download");

        self.cache.create_cache_dir(sha256).await.map_err(cache_error)?;
        let uri_spec = UriSpec { uris: self.candidate_uris(path), sha256: sha256.to_owned(), filename: filename.to_owned() };

        match self.cache.download_file_from_master(destination.as_ref(), &uri_spec).await {
            Ok(()) => Ok(json!({ "exitcode": 0 })),
            Err(error) => {
                let message = format_msg("Failed to download {1}; {2}", &[destination, &error.to_string()]);
                Ok(json!({ "exitcode": 1, "stderr": message }))
            }
        }
    }

    async fn purge(&self, ttl: std::time::Duration, ongoing_transactions: &[String]) -> Result<usize, ModuleError> {
        self.cache.purge_cache(ttl, ongoing_transactions).await.map_err(cache_error)
    }
}

fn cache_error(error: CacheError) -> ModuleError {
    ModuleError::Processing(error.to_string())
}

#[cfg(test)]
mod tests {
    use reqwest::Client;
    use tempfile::tempdir;

    use super::*;
    use crate::request::RequestType;

    #[tokio::test]
    async fn missing_file_field_is_an_invalid_input_error() {
        let cache = Arc::new(ModuleCache::new(tempdir().unwrap().path(), Client::new()));
        let module = DownloadFileModule::new(vec![], cache);
        let data = json!({"transaction_id": "t1", "module": "download_file", "action": "download", "params": {}});
        let request = ActionRequest::from_envelope(RequestType::Blocking, "m1".into(), "client".into(), &data, vec![]).unwrap();
        let error = module.call_action(&request).await.unwrap_err();
        assert!(matches!(error, ModuleError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn failed_download_reports_a_nonzero_exitcode() {
        let cache = Arc::new(ModuleCache::new(tempdir().unwrap().path(), Client::new()));
        let destination = tempdir().unwrap();
        let module = DownloadFileModule::new(vec![], cache);
        let data = json!({
            "transaction_id": "t1",
            "module": "download_file",
            "action": "download",
            "params": {
                "file": {
                    "filename": "thing",
                    "destination": destination.path().join("thing").to_string_lossy(),
                    "uri": { "path": "https://example.invalid/thing", "params": {} },
                    "sha256": "0".repeat(64),
                },
            },
        });
        let request = ActionRequest::from_envelope(RequestType::Blocking, "m1".into(), "client".into(), &data, vec![]).unwrap();
        let results = module.call_action(&request).await.unwrap();
        assert_eq!(results.get("exitcode"), Some(&Value::from(1)));
    }
}
