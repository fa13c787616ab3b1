//! The incoming-request side of the data model: [`RequestType`] and
//! [`ActionRequest`].

use std::path::PathBuf;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Whether a request expects an immediate result or a provisional ack
/// followed by out-of-band completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    /// The requester waits for a single response containing results.
    Blocking,
    /// The requester receives an immediate provisional ack.
    NonBlocking,
}

/// Errors raised while turning a wire envelope into an [`ActionRequest`].
#[derive(Debug, Error)]
pub enum EnvelopeParseError {
    /// A required field was absent from the envelope.
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    /// A field had the wrong JSON type.
    #[error("field '{0}' has the wrong type")]
    WrongType(&'static str),
    /// `notify_outcome` is required for non-blocking requests but was absent.
    #[error("notify_outcome is required for non-blocking requests")]
    MissingNotifyOutcome,
}

/// An immutable view of an incoming request, built once from the parsed wire
/// envelope. `results_dir` is the only field the processor may set, and only
/// once, after choosing where this transaction's outputs live.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    request_type: RequestType,
    message_id: String,
    sender: String,
    transaction_id: String,
    module: String,
    action: String,
    notify_outcome: bool,
    params: Value,
    debug: Vec<Value>,
    results_dir: std::sync::Arc<RwLock<Option<PathBuf>>>,
}

impl ActionRequest {
    /// Build an [`ActionRequest`] from a parsed JSON envelope `data` object.
    ///
    /// # Errors
    /// Returns [`EnvelopeParseError`] if a required field is missing, has the
    /// wrong type, or `notify_outcome` is absent for a non-blocking request.
    pub fn from_envelope(
        request_type: RequestType,
        message_id: String,
        sender: String,
        data: &Value,
        debug: Vec<Value>,
    ) -> Result<Self, EnvelopeParseError> {
        let obj = data.as_object().ok_or(EnvelopeParseError::WrongType("data"))?;

        let transaction_id = required_string(obj, "transaction_id")?;
        let module = required_string(obj, "module")?;
        let action = required_string(obj, "action")?;
        let params = obj.get("params").cloned().unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        let notify_outcome = match request_type {
            RequestType::NonBlocking => obj
                .get("notify_outcome")
                .ok_or(EnvelopeParseError::MissingNotifyOutcome)?
                .as_bool()
                .ok_or(EnvelopeParseError::WrongType("notify_outcome"))?,
            RequestType::Blocking => true,
        };

        Ok(Self {
            request_type,
            message_id,
            sender,
            transaction_id,
            module,
            action,
            notify_outcome,
            params,
            debug,
            results_dir: std::sync::Arc::new(RwLock::new(None)),
        })
    }

    /// The request's blocking/non-blocking kind.
    #[must_use]
    pub const fn request_type(&self) -> RequestType { self.request_type }

    /// The id of the inbound wire message, for hop tracking.
    #[must_use]
    pub fn message_id(&self) -> &str { &self.message_id }

    /// The identity of the original requester, used to address responses.
    #[must_use]
    pub fn sender(&self) -> &str { &self.sender }

    /// The caller-chosen transaction id; unique for the lifetime of its
    /// spool directory.
    #[must_use]
    pub fn transaction_id(&self) -> &str { &self.transaction_id }

    /// The target module name.
    #[must_use]
    pub fn module(&self) -> &str { &self.module }

    /// The target action name on that module.
    #[must_use]
    pub fn action(&self) -> &str { &self.action }

    /// Whether the requester wants a completion notification once the
    /// non-blocking action finishes. Always `true` for blocking requests.
    #[must_use]
    pub const fn notify_outcome(&self) -> bool { self.notify_outcome }

    /// The request's parameters, as a JSON value (object).
    #[must_use]
    pub fn params(&self) -> &Value { &self.params }

    /// Opaque debug hop-tracking entries preserved from the envelope.
    #[must_use]
    pub fn debug(&self) -> &[Value] { &self.debug }

    /// The results directory chosen for this transaction, if any.
    #[must_use]
    pub fn results_dir(&self) -> Option<PathBuf> {
        #[expect(clippy::unwrap_used, reason = "lock is never poisoned by a panicking holder in this crate")]
        self.results_dir.read().unwrap().clone()
    }

    /// Set the results directory for this transaction. Intended to be called
    /// exactly once, by the processor, before dispatching a non-blocking
    /// action.
    pub fn set_results_dir(&self, dir: PathBuf) {
        #[expect(clippy::unwrap_used, reason = "lock is never poisoned by a panicking holder in this crate")]
        let mut guard = self.results_dir.write().unwrap();
        *guard = Some(dir);
    }

    /// A short label suitable for log lines, e.g. `"echo/echo transaction
    /// abc123 by 0MQ::requester"`.
    #[must_use]
    pub fn pretty_label(&self) -> String {
        format!(
            "{}/{} transaction {} for {}",
            self.module, self.action, self.transaction_id, self.sender
        )
    }
}

fn required_string(obj: &serde_json::Map<String, Value>, field: &'static str) -> Result<String, EnvelopeParseError> {
    obj.get(field)
        .ok_or(EnvelopeParseError::MissingField(field))?
        .as_str()
        .map(str::to_owned)
        .ok_or(EnvelopeParseError::WrongType(field))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_minimal_blocking_request() {
        let data = json!({"transaction_id": "t1", "module": "echo", "action": "echo"});
        let req = ActionRequest::from_envelope(
            RequestType::Blocking,
            "m1".into(),
            "client".into(),
            &data,
            vec![],
        )
        .unwrap();
        assert_eq!(req.transaction_id(), "t1");
        assert!(req.notify_outcome());
        assert_eq!(req.params(), &json!({}));
    }

    #[test]
    fn non_blocking_requires_notify_outcome() {
        let data = json!({"transaction_id": "t1", "module": "echo", "action": "echo"});
        let err = ActionRequest::from_envelope(
            RequestType::NonBlocking,
            "m1".into(),
            "client".into(),
            &data,
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, EnvelopeParseError::MissingNotifyOutcome));
    }

    #[test]
    fn missing_transaction_id_is_an_error() {
        let data = json!({"module": "echo", "action": "echo"});
        let err = ActionRequest::from_envelope(
            RequestType::Blocking,
            "m1".into(),
            "client".into(),
            &data,
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, EnvelopeParseError::MissingField("transaction_id")));
    }

    #[test]
    fn results_dir_is_settable_once() {
        let data = json!({"transaction_id": "t1", "module": "echo", "action": "echo"});
        let req = ActionRequest::from_envelope(
            RequestType::Blocking,
            "m1".into(),
            "client".into(),
            &data,
            vec![],
        )
        .unwrap();
        assert!(req.results_dir().is_none());
        req.set_results_dir(PathBuf::from("/tmp/spool/t1"));
        assert_eq!(req.results_dir(), Some(PathBuf::from("/tmp/spool/t1")));
    }
}
