//! The `script` bolt-family module: fetches a script into the content cache
//! (downloading it if not already present) and runs it with `arguments`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{CommandObject, dispatch};
use crate::cache::{CacheError, ModuleCache, UriSpec};
use crate::modules::task::find_executable_and_arguments;
use crate::modules::{ActionSchema, Module, ModuleError};
use crate::request::ActionRequest;
use crate::response::ModuleType;

/// Downloads (and caches) a script file, then runs it with caller-supplied
/// arguments. Unlike `apply`, the broker's CRL is not required here — the
/// original agent sets it unconditionally on its download client with no
/// presence check.
pub struct ScriptModule {
    cache: Arc<ModuleCache>,
    actions: Vec<ActionSchema>,
}

impl ScriptModule {
    /// Build the `script` module backed by `cache` for fetching and caching
    /// script content.
    #[must_use]
    pub fn new(cache: Arc<ModuleCache>) -> Self {
        Self {
            cache,
            actions: vec![ActionSchema {
                name: "run".to_owned(),
                description: "Download and run a script".to_owned(),
                input: json!({
                    "type": "object",
                    "properties": {
                        "script": {
                            "type": "object",
                            "properties": {
                                "filename": { "type": "string" },
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
                            "required": ["filename", "uri", "sha256"],
                        },
                        "arguments": { "type": "array", "items": { "type": "string" } },
                    },
                    "required": ["script", "arguments"],
                }),
                results: json!({ "type": "object" }),
            }],
        }
    }

    async fn build_command_object(&self, request: &ActionRequest) -> Result<CommandObject, ModuleError> {
        let script = request
            .params()
            .get("script")
            .ok_or_else(|| ModuleError::InvalidInput { action: "run".to_owned(), detail: "missing 'script'".to_owned() })?;
        let filename = script
            .get("filename")
            .and_then(Value::as_str)
            .ok_or_else(|| ModuleError::InvalidInput { action: "run".to_owned(), detail: "missing 'script.filename'".to_owned() })?;
        let sha256 = script
            .get("sha256")
            .and_then(Value::as_str)
            .ok_or_else(|| ModuleError::InvalidInput { action: "run".to_owned(), detail: "missing 'script.sha256'".to_owned() })?;
        let path = script
            .get("uri")
            .and_then(|u| u.get("path"))
            .and_then(Value::as_str)
            .ok_or_else(|| ModuleError::InvalidInput { action: "run".to_owned(), detail: "missing 'script.uri.path'".to_owned() })?;
        let arguments = request
            .params()
            .get("arguments")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_owned).collect())
            .unwrap_or_default();

        let uri_spec = UriSpec { uris: vec![path.to_owned()], sha256: sha256.to_owned(), filename: filename.to_owned() };
        let script_file = self.cache.get_cached_file(&uri_spec).await.map_err(cache_error)?;
        let resolved = find_executable_and_arguments(&script_file);

        Ok(CommandObject {
            executable: resolved.executable,
            arguments: resolved.arguments.into_iter().chain(arguments).collect(),
            environment: HashMap::new(),
            input: String::new(),
        })
    }
}

fn cache_error(error: CacheError) -> ModuleError {
    ModuleError::Processing(error.to_string())
}

#[async_trait]
impl Module for ScriptModule {
    fn name(&self) -> &str { "script" }
    fn actions(&self) -> &[ActionSchema] { &self.actions }
    fn module_type(&self) -> ModuleType { ModuleType::Internal }

    async fn call_action(&self, request: &ActionRequest) -> Result<Value, ModuleError> {
        let cmd = self.build_command_object(request).await?;
        dispatch(request, &cmd).await
    }

    async fn purge(&self, ttl: std::time::Duration, ongoing_transactions: &[String]) -> Result<usize, ModuleError> {
        self.cache.purge_cache(ttl, ongoing_transactions).await.map_err(cache_error)
    }
}

#[cfg(test)]
mod tests {
    use reqwest::Client;
    use tempfile::tempdir;

    use super::*;
    use crate::request::RequestType;

    #[tokio::test]
    async fn missing_script_field_is_an_invalid_input_error() {
        let cache = Arc::new(ModuleCache::new(tempdir().unwrap().path(), Client::new()));
        let module = ScriptModule::new(cache);
        let data = json!({"transaction_id": "t1", "module": "script", "action": "run", "params": {"arguments": []}});
        let request = ActionRequest::from_envelope(RequestType::Blocking, "m1".into(), "client".into(), &data, vec![]).unwrap();
        let error = module.call_action(&request).await.unwrap_err();
        assert!(matches!(error, ModuleError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn runs_a_cached_script_directly_from_disk() {
        let cache_dir = tempdir().unwrap();
        let cache = Arc::new(ModuleCache::new(cache_dir.path(), Client::new()));

        let sha256 = "0".repeat(64);
        let entry_dir = cache.create_cache_dir(&sha256).await.unwrap();
        let script_path = entry_dir.join("greet.sh");
        tokio::fs::write(&script_path, b"#!/bin/sh\necho \"$1\"\n").await.unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            tokio::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).await.unwrap();
        }

        let module = ScriptModule::new(cache);
        let data = json!({
            "transaction_id": "t1",
            "module": "script",
            "action": "run",
            "params": {
                "script": { "filename": "greet.sh", "uri": { "path": "https://example.invalid/greet.sh", "params": {} }, "sha256": sha256 },
                "arguments": ["hi"],
            },
        });
        let request = ActionRequest::from_envelope(RequestType::Blocking, "m1".into(), "client".into(), &data, vec![]).unwrap();
        let results = module.call_action(&request).await.unwrap();
        assert_eq!(results.get("exitcode"), Some(&Value::from(0)));
        assert_eq!(results.get("stdout").unwrap().as_str().unwrap().trim(), "hi");
    }
}
