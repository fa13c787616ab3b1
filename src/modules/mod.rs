//! The module abstraction: a capability contract every dispatch target
//! (built-in or external) implements, plus JSON-schema-backed validation of
//! inputs and results.

pub mod bolt;
pub mod command;
pub mod echo;
pub mod external;
pub mod ping;
pub mod status;
pub mod task;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::locale::format_msg;
use crate::request::ActionRequest;
use crate::response::{ActionResponse, ModuleType};

/// Errors raised while loading a module or running one of its actions.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// The module's own metadata, executable, or configuration was invalid
    /// and it was skipped at load time.
    #[error("module load error: {0}")]
    LoadError(String),
    /// `call_action` failed for a reason internal to the module (spawn
    /// failure, non-UTF8 output that a specific variant doesn't already
    /// cover, fetch failure, …).
    #[error("{0}")]
    Processing(String),
    /// The child process's stdout was not valid UTF-8.
    #[error("output of '{0}' is not valid UTF-8")]
    OutputEncoding(String),
    /// The parameters supplied did not validate against the action's input
    /// schema.
    #[error("invalid input for action '{action}': {detail}")]
    InvalidInput {
        /// The action whose input schema was violated.
        action: String,
        /// A human-readable description of the schema violation.
        detail: String,
    },
    /// The action's results did not validate against its output schema.
    #[error("invalid output for action '{action}': {detail}")]
    InvalidOutput {
        /// The action whose output schema was violated.
        action: String,
        /// A human-readable description of the schema violation.
        detail: String,
    },
    /// The requested action does not exist on this module.
    #[error("module '{module}' has no action '{action}'")]
    UnknownAction {
        /// The module that was targeted.
        module: String,
        /// The action name that was not found.
        action: String,
    },
}

/// One action's name, description, and input/results JSON schemas, as
/// registered at module-load time.
#[derive(Debug, Clone)]
pub struct ActionSchema {
    /// The action's name, unique within its module.
    pub name: String,
    /// A short human-readable description, as reported by the module.
    pub description: String,
    /// JSON schema the action's `params` must satisfy.
    pub input: Value,
    /// JSON schema the action's `results` must satisfy.
    pub results: Value,
}

/// Validate `instance` against the JSON schema `schema`.
///
/// # Errors
/// Returns a human-readable description of the first violation found.
pub fn validate_against_schema(schema: &Value, instance: &Value) -> Result<(), String> {
    let validator = jsonschema::validator_for(schema).map_err(|e| e.to_string())?;
    validator.validate(instance).map_err(|e| e.to_string())
}

/// A unit of dispatch offering one or more actions and their JSON schemas.
///
/// Implementors provide [`Module::call_action`]; [`Module::execute_action`]
/// wraps it with input/output validation and error-to-response translation,
/// matching the original agent's base-class contract.
#[async_trait]
pub trait Module: Send + Sync {
    /// The module's unique name.
    fn name(&self) -> &str;

    /// The actions this module supports, in registration order.
    fn actions(&self) -> &[ActionSchema];

    /// Whether this module is built in or backed by an external executable.
    fn module_type(&self) -> ModuleType;

    /// Whether this module may be invoked as a non-blocking action.
    fn supports_async(&self) -> bool { true }

    /// Static module-wide configuration, if any was loaded for it.
    fn config(&self) -> Option<&Value> { None }

    /// Purge cache entries older than `ttl` that aren't backing
    /// `ongoing_transactions`, returning how many entries were removed.
    /// Modules without a cache (the default) have nothing to purge.
    ///
    /// # Errors
    /// Returns [`ModuleError::Processing`] if the purge sweep fails.
    async fn purge(&self, ttl: std::time::Duration, ongoing_transactions: &[String]) -> Result<usize, ModuleError> {
        let _ = (ttl, ongoing_transactions);
        Ok(0)
    }

    /// Returns `true` if `action` is one of [`Module::actions`].
    fn has_action(&self, action: &str) -> bool {
        self.actions().iter().any(|a| a.name == action)
    }

    /// The schema entry for `action`, if this module has one.
    fn action_schema(&self, action: &str) -> Option<&ActionSchema> {
        self.actions().iter().find(|a| a.name == action)
    }

    /// Validate `params` against `action`'s input schema.
    ///
    /// # Errors
    /// Returns [`ModuleError::UnknownAction`] if the action does not exist,
    /// or [`ModuleError::InvalidInput`] if validation fails.
    fn validate_input(&self, action: &str, params: &Value) -> Result<(), ModuleError> {
        let schema = self.action_schema(action).ok_or_else(|| ModuleError::UnknownAction {
            module: self.name().to_owned(),
            action: action.to_owned(),
        })?;
        validate_against_schema(&schema.input, params).map_err(|detail| ModuleError::InvalidInput {
            action: action.to_owned(),
            detail,
        })
    }

    /// Run this module's private implementation of `request.action()`,
    /// returning the raw `results` JSON on success.
    ///
    /// # Errors
    /// Returns [`ModuleError`] if execution fails for any module-specific
    /// reason.
    async fn call_action(&self, request: &ActionRequest) -> Result<Value, ModuleError>;

    /// Run `request` end to end: call [`Module::call_action`], then
    /// validate the returned results against the action's output schema
    /// (unless the response already flagged itself invalid), translating
    /// any failure into a completed, well-formed [`ActionResponse`].
    async fn execute_action(&self, request: &ActionRequest) -> ActionResponse {
        let mut response = ActionResponse::new(self.module_type(), request);
        match self.call_action(request).await {
            Ok(results) => {
                let schema = self.action_schema(request.action());
                let validation = schema.map(|s| validate_against_schema(&s.results, &results));
                match validation {
                    Some(Err(detail)) => {
                        response.set_execution_error(format_msg("invalid output from module '{1}': {2}", &[self.name(), &detail]));
                    }
                    _ => response.set_valid_results(results),
                }
            }
            Err(error) => response.set_execution_error(error.to_string()),
        }
        response
    }
}
