//! The `ping` built-in module: echoes back the hop-tracking chain carried
//! in the request's first debug chunk.

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{ActionSchema, Module, ModuleError};
use crate::locale::format_msg;
use crate::request::ActionRequest;
use crate::response::ModuleType;

/// Reports the `hops` array from the request's first debug chunk.
pub struct PingModule {
    actions: Vec<ActionSchema>,
}

impl PingModule {
    /// Build the `ping` module with its single `ping` action registered.
    #[must_use]
    pub fn new() -> Self {
        Self {
            actions: vec![ActionSchema {
                name: "ping".to_owned(),
                description: "Report the request's hop-tracking chain".to_owned(),
                input: json!({ "type": "object" }),
                results: json!({
                    "type": "object",
                    "properties": { "request_hops": { "type": "array" } },
                    "required": ["request_hops"],
                }),
            }],
        }
    }
}

impl Default for PingModule {
    fn default() -> Self { Self::new() }
}

#[async_trait]
impl Module for PingModule {
    fn name(&self) -> &str { "ping" }
    fn actions(&self) -> &[ActionSchema] { &self.actions }
    fn module_type(&self) -> ModuleType { ModuleType::Internal }
    fn supports_async(&self) -> bool { false }

    async fn call_action(&self, request: &ActionRequest) -> Result<Value, ModuleError> {
        let Some(debug_entry) = request.debug().first() else {
            return Err(ModuleError::Processing(format_msg("no debug entry", &[])));
        };
        let hops = debug_entry
            .get("hops")
            .ok_or_else(|| ModuleError::Processing(format_msg("debug entry is not valid JSON", &[])))?;
        Ok(json!({ "request_hops": hops }))
    }
}

#[cfg(test)]
mod tests {
    use crate::request::RequestType;

    use super::*;

    #[tokio::test]
    async fn reports_hops_from_first_debug_chunk() {
        let module = PingModule::new();
        let data = json!({"transaction_id": "t1", "module": "ping", "action": "ping"});
        let debug = vec![json!({"hops": [
            {"server": "A", "time": "001", "stage": "accepted"},
            {"server": "A", "time": "007", "stage": "deliver"},
        ]})];
        let request = ActionRequest::from_envelope(RequestType::Blocking, "m1".into(), "client".into(), &data, debug).unwrap();
        let response = module.execute_action(&request).await;
        let results = response.metadata().get("results").unwrap();
        assert_eq!(results.get("request_hops").unwrap().as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_debug_entry_is_a_processing_error() {
        let module = PingModule::new();
        let data = json!({"transaction_id": "t1", "module": "ping", "action": "ping"});
        let request = ActionRequest::from_envelope(RequestType::Blocking, "m1".into(), "client".into(), &data, vec![]).unwrap();
        let response = module.execute_action(&request).await;
        assert_eq!(
            response.metadata().get("execution_error"),
            Some(&Value::String("no debug entry".to_owned()))
        );
    }
}
