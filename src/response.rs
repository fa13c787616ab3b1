//! The outgoing side of the data model: [`ActionOutput`], [`ActionResponse`],
//! [`ActionStatus`], [`ResponseType`], and [`ModuleType`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::request::{ActionRequest, RequestType};

/// Whether a module is implemented in-process or backed by an external
/// executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleType {
    /// Implemented in-process (echo, ping, status, command, bolt-family).
    Internal,
    /// Backed by an external executable discovered at load time.
    External,
}

/// Lifecycle state of a non-blocking action as recorded in `metadata`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// No record exists for this transaction.
    Unknown,
    /// The action is still executing.
    Running,
    /// The action completed with exit code zero / no processing error.
    Success,
    /// The action completed with a non-zero exit code or a processing error.
    Failure,
    /// The agent restarted while the action was running and its outcome
    /// could not be recovered.
    Undetermined,
}

/// The wire-shape a response is ultimately serialized as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    /// A single synchronous result.
    Blocking,
    /// The final out-of-band result for a non-blocking action.
    NonBlocking,
    /// The result of an in-processor status query.
    StatusOutput,
    /// An RPC-level error.
    RpcError,
}

/// The raw exit code / stdout / stderr captured from running a module's
/// action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutput {
    /// Process exit code (0 on success, by convention).
    pub exitcode: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// Errors raised by [`ActionResponse::valid_for`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResponseValidationError {
    /// A field required by the base `action_metadata` schema was absent.
    #[error("action_metadata missing required field '{0}'")]
    MissingBaseField(&'static str),
    /// A field required for the requested [`ResponseType`] was absent.
    #[error("response type {0:?} requires field '{1}'")]
    MissingTypeField(ResponseType, &'static str),
}

/// A module's completed (or still-running) response to an [`ActionRequest`],
/// together with the `action_metadata` JSON object that is ultimately
/// persisted to / read from the results directory.
#[derive(Debug, Clone)]
pub struct ActionResponse {
    module_type: ModuleType,
    request_type: RequestType,
    output: ActionOutput,
    metadata: Map<String, Value>,
}

impl ActionResponse {
    /// Start building a response for `request`, with status `Running` and
    /// `start` set to now. Callers fill in `results`/`execution_error`/`end`
    /// via the `set_*` helpers before returning it from `call_action`.
    #[must_use]
    pub fn new(module_type: ModuleType, request: &ActionRequest) -> Self {
        let mut metadata = Map::new();
        metadata.insert("module".into(), Value::String(request.module().to_owned()));
        metadata.insert("action".into(), Value::String(request.action().to_owned()));
        metadata.insert("request_id".into(), Value::String(request.message_id().to_owned()));
        metadata.insert(
            "transaction_id".into(),
            Value::String(request.transaction_id().to_owned()),
        );
        metadata.insert("request_params".into(), request.params().clone());
        metadata.insert("notify_outcome".into(), Value::Bool(request.notify_outcome()));
        metadata.insert("start".into(), Value::String(Utc::now().to_rfc3339()));
        metadata.insert("status".into(), to_value(ActionStatus::Running));
        metadata.insert("results_are_valid".into(), Value::Bool(false));

        Self {
            module_type,
            request_type: request.request_type(),
            output: ActionOutput::default(),
            metadata,
        }
    }

    /// The module kind that produced this response.
    #[must_use]
    pub const fn module_type(&self) -> ModuleType { self.module_type }

    /// The originating request's blocking/non-blocking kind.
    #[must_use]
    pub const fn request_type(&self) -> RequestType { self.request_type }

    /// The raw process output captured for this action, if any.
    #[must_use]
    pub fn output(&self) -> &ActionOutput { &self.output }

    /// Replace the captured process output.
    pub fn set_output(&mut self, output: ActionOutput) { self.output = output; }

    /// The current status recorded in `action_metadata.status`.
    #[must_use]
    pub fn status(&self) -> ActionStatus {
        self.metadata
            .get("status")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(ActionStatus::Unknown)
    }

    /// Mark the response complete with valid `results`, status `Success`,
    /// and `end` set to now.
    pub fn set_valid_results(&mut self, results: Value) {
        self.metadata.insert("results".into(), results);
        self.metadata.insert("results_are_valid".into(), Value::Bool(true));
        self.metadata.insert("status".into(), to_value(ActionStatus::Success));
        self.metadata.insert("end".into(), Value::String(Utc::now().to_rfc3339()));
    }

    /// Mark the response complete with an `execution_error`, status
    /// `Failure`, `results_are_valid=false`, and `end` set to now.
    pub fn set_execution_error(&mut self, message: String) {
        self.metadata.insert("execution_error".into(), Value::String(message));
        self.metadata.insert("results_are_valid".into(), Value::Bool(false));
        self.metadata.insert("status".into(), to_value(ActionStatus::Failure));
        self.metadata.insert("end".into(), Value::String(Utc::now().to_rfc3339()));
    }

    /// Assign a job id (used only for [`ResponseType::NonBlocking`] wire
    /// messages); by convention this is the transaction id.
    pub fn set_job_id(&mut self, job_id: String) {
        self.metadata.insert("job_id".into(), Value::String(job_id));
    }

    /// The `action_metadata` object, as persisted to / read from disk.
    #[must_use]
    pub fn metadata(&self) -> &Map<String, Value> { &self.metadata }

    /// Build an [`ActionResponse`] directly from a previously persisted
    /// `action_metadata` object (used by the status-query path).
    #[must_use]
    pub fn from_metadata(module_type: ModuleType, request_type: RequestType, metadata: Map<String, Value>) -> Self {
        Self {
            module_type,
            request_type,
            output: ActionOutput::default(),
            metadata,
        }
    }

    /// Check that the base `action_metadata` schema is satisfied.
    ///
    /// # Errors
    /// Returns [`ResponseValidationError::MissingBaseField`] if a required
    /// field is absent.
    pub fn valid(&self) -> Result<(), ResponseValidationError> {
        for field in ["module", "action", "request_id", "transaction_id", "notify_outcome", "start", "status"] {
            if !self.metadata.contains_key(field) {
                return Err(ResponseValidationError::MissingBaseField(field));
            }
        }
        Ok(())
    }

    /// Check that `self` carries everything required to serialize as
    /// `response_type`.
    ///
    /// # Errors
    /// Returns [`ResponseValidationError`] if the base schema or the
    /// type-specific fields are missing.
    pub fn valid_for(&self, response_type: ResponseType) -> Result<(), ResponseValidationError> {
        self.valid()?;
        let required_field = match response_type {
            ResponseType::Blocking => Some("results"),
            ResponseType::NonBlocking => Some("job_id"),
            ResponseType::StatusOutput | ResponseType::RpcError => None,
        };
        if let Some(field) = required_field {
            if !self.metadata.contains_key(field) {
                return Err(ResponseValidationError::MissingTypeField(response_type, field));
            }
        }
        Ok(())
    }
}

fn to_value<T: Serialize>(v: T) -> Value {
    serde_json::to_value(v).unwrap_or(Value::Null)
}
