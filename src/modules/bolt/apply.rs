//! The `apply` bolt-family module: feeds a catalog (or a `prep` plugin-sync
//! request) to a bundled Ruby shim over stdin, injecting the broker's TLS
//! material and a plugin cache directory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{CommandObject, dispatch};
use crate::cache::{CacheError, ModuleCache};
use crate::locale::format_msg;
use crate::modules::task::find_executable_and_arguments;
use crate::modules::{ActionSchema, Module, ModuleError};
use crate::request::ActionRequest;
use crate::response::ModuleType;

const RUBY_SHIM_NAME: &str = "apply_ruby_shim.rb";

/// TLS material and broker connection details the Ruby shim needs to talk
/// back to the master for catalog compilation and plugin sync.
#[derive(Debug, Clone)]
pub struct ApplyTlsConfig {
    /// CA certificate path.
    pub ca: String,
    /// Client certificate path.
    pub crt: String,
    /// Client private key path.
    pub key: String,
    /// Certificate revocation list path. Required (non-empty) for `apply`;
    /// unlike `script`, there is no fallback.
    pub crl: String,
    /// Optional HTTP(S) proxy.
    pub proxy: String,
    /// Broker URIs to try in order.
    pub master_uris: Vec<String>,
}

/// Runs Puppet catalogs (`apply`) or primes the plugin cache (`prep`) via a
/// bundled Ruby shim.
pub struct ApplyModule {
    tls: ApplyTlsConfig,
    libexec_dir: PathBuf,
    cache: Arc<ModuleCache>,
    actions: Vec<ActionSchema>,
}

impl ApplyModule {
    /// Build the `apply` module, locating the Ruby shim under `libexec_dir`
    /// and using `cache` for the plugin cache directory.
    #[must_use]
    pub fn new(tls: ApplyTlsConfig, libexec_dir: impl Into<PathBuf>, cache: Arc<ModuleCache>) -> Self {
        Self {
            tls,
            libexec_dir: libexec_dir.into(),
            cache,
            actions: vec![
                ActionSchema {
                    name: "apply".to_owned(),
                    description: "Apply a compiled catalog".to_owned(),
                    input: json!({
                        "type": "object",
                        "properties": { "catalog": { "type": "object" }, "apply_options": { "type": "object" } },
                        "required": ["catalog", "apply_options"],
                    }),
                    results: json!({ "type": "object" }),
                },
                ActionSchema {
                    name: "prep".to_owned(),
                    description: "Prime the plugin cache for an environment".to_owned(),
                    input: json!({
                        "type": "object",
                        "properties": { "environment": { "type": "string" } },
                        "required": ["environment"],
                    }),
                    results: json!({ "type": "object" }),
                },
            ],
        }
    }

    async fn build_command_object(&self, request: &ActionRequest) -> Result<CommandObject, ModuleError> {
        if self.tls.crl.is_empty() {
            return Err(ModuleError::Processing(format_msg("ssl-crl setting is required for {1}", &["apply"])));
        }

        let Some(mut params) = request.params().as_object().cloned() else {
            return Err(ModuleError::InvalidInput { action: request.action().to_owned(), detail: "params must be an object".to_owned() });
        };
        params.insert("ca".to_owned(), Value::String(self.tls.ca.clone()));
        params.insert("crt".to_owned(), Value::String(self.tls.crt.clone()));
        params.insert("key".to_owned(), Value::String(self.tls.key.clone()));
        params.insert("crl".to_owned(), Value::String(self.tls.crl.clone()));
        params.insert("proxy".to_owned(), Value::String(self.tls.proxy.clone()));

        let plugin_cache_name = if request.action() == "apply" {
            let environment = catalog_environment(&params, request.action())?;
            params.insert("environment".to_owned(), Value::String(environment.clone()));
            params.insert("action".to_owned(), Value::String("apply".to_owned()));
            environment
        } else {
            let environment = params
                .get("environment")
                .and_then(Value::as_str)
                .ok_or_else(|| ModuleError::InvalidInput { action: "prep".to_owned(), detail: "missing 'environment'".to_owned() })?
                .to_owned();
            params.insert("action".to_owned(), Value::String("prep".to_owned()));
            environment
        };

        let plugin_cache = self.cache.create_cache_dir(&plugin_cache_name).await.map_err(cache_error)?;
        params.insert("plugin_cache".to_owned(), Value::String(plugin_cache.display().to_string()));
        params.insert("master_uris".to_owned(), Value::Array(self.tls.master_uris.iter().cloned().map(Value::String).collect()));

        let shim_path = self.libexec_dir.join(RUBY_SHIM_NAME);
        let resolved = find_executable_and_arguments(&shim_path);

        Ok(CommandObject {
            executable: resolved.executable,
            arguments: resolved.arguments,
            environment: HashMap::new(),
            input: Value::Object(params).to_string(),
        })
    }
}

fn catalog_environment(params: &Map<String, Value>, action: &str) -> Result<String, ModuleError> {
    params
        .get("catalog")
        .and_then(|c| c.get("environment"))
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| ModuleError::InvalidInput { action: action.to_owned(), detail: "missing 'catalog.environment'".to_owned() })
}

fn cache_error(error: CacheError) -> ModuleError {
    ModuleError::Processing(error.to_string())
}

#[async_trait]
impl Module for ApplyModule {
    fn name(&self) -> &str { "apply" }
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

    fn tls(crl: &str) -> ApplyTlsConfig {
        ApplyTlsConfig {
            ca: "ca.pem".to_owned(),
            crt: "crt.pem".to_owned(),
            key: "key.pem".to_owned(),
            crl: crl.to_owned(),
            proxy: String::new(),
            master_uris: vec!["https://master.example:8140".to_owned()],
        }
    }

    #[tokio::test]
    async fn missing_crl_is_rejected_before_anything_else() {
        let cache = Arc::new(ModuleCache::new(tempdir().unwrap().path(), Client::new()));
        let module = ApplyModule::new(tls(""), "/opt/puppetlabs/pxa/libexec", cache);
        let data = json!({"transaction_id": "t1", "module": "apply", "action": "apply", "params": {"catalog": {"environment": "production"}, "apply_options": {}}});
        let request = ActionRequest::from_envelope(RequestType::Blocking, "m1".into(), "client".into(), &data, vec![]).unwrap();
        let error = module.call_action(&request).await.unwrap_err();
        assert!(matches!(error, ModuleError::Processing(_)));
    }

    #[tokio::test]
    async fn prep_requires_an_environment() {
        let cache = Arc::new(ModuleCache::new(tempdir().unwrap().path(), Client::new()));
        let module = ApplyModule::new(tls("crl.pem"), "/opt/puppetlabs/pxa/libexec", cache);
        let data = json!({"transaction_id": "t1", "module": "apply", "action": "prep", "params": {}});
        let request = ActionRequest::from_envelope(RequestType::Blocking, "m1".into(), "client".into(), &data, vec![]).unwrap();
        let error = module.call_action(&request).await.unwrap_err();
        assert!(matches!(error, ModuleError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn apply_builds_a_plugin_cache_dir_named_after_the_environment() {
        let cache_root = tempdir().unwrap();
        let cache = Arc::new(ModuleCache::new(cache_root.path(), Client::new()));
        let module = ApplyModule::new(tls("crl.pem"), "/opt/puppetlabs/pxa/libexec", Arc::clone(&cache));
        let data = json!({
            "transaction_id": "t1",
            "module": "apply",
            "action": "apply",
            "params": {"catalog": {"environment": "production"}, "apply_options": {}},
        });
        let request = ActionRequest::from_envelope(RequestType::Blocking, "m1".into(), "client".into(), &data, vec![]).unwrap();
        let cmd = module.build_command_object(&request).await.unwrap();
        assert!(cache_root.path().join("production").is_dir());
        let sent: Value = serde_json::from_str(&cmd.input).unwrap();
        assert_eq!(sent.get("environment"), Some(&Value::String("production".into())));
        assert_eq!(sent.get("crl"), Some(&Value::String("crl.pem".into())));
    }
}
