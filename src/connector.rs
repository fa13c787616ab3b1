//! The abstract broker transport the core sends responses through.
//!
//! The wire protocol itself (WebSocket/PCP) is deliberately out of scope;
//! this module only defines the shape the request processor needs, plus an
//! in-memory test double so the processor and built-in modules can be
//! exercised without a real broker connection.

use async_trait::async_trait;

use crate::response::ActionResponse;

/// Thin shim turning a completed or provisional [`ActionResponse`] into an
/// outbound wire message addressed to `target`.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Send a PXPError addressed to `target` describing a request that
    /// could not be processed (parse failure, unknown module/action, schema
    /// mismatch, duplicate transaction).
    async fn send_pxp_error(&self, target: &str, transaction_id: &str, description: &str);

    /// Send the completed Blocking response for a synchronous request.
    ///
    /// # Panics
    /// Implementations may panic (in debug builds) if `response` does not
    /// carry the fields [`ActionResponse::valid_for`] requires for
    /// [`crate::response::ResponseType::Blocking`]; callers are expected to
    /// have already validated it.
    async fn send_blocking_response(&self, target: &str, response: &ActionResponse);

    /// Send the immediate acknowledgement for a non-blocking request, sent
    /// before the worker task starts running.
    async fn send_provisional_response(&self, target: &str, transaction_id: &str);

    /// Send the final out-of-band response for a non-blocking request whose
    /// worker has finished and `notify_outcome` was requested.
    async fn send_non_blocking_response(&self, target: &str, response: &ActionResponse, job_id: &str);
}

/// An in-memory [`Connector`] that records every message it was asked to
/// send, for use in unit and integration tests.
#[derive(Debug, Default)]
pub struct ChannelConnector {
    sent: tokio::sync::Mutex<Vec<SentMessage>>,
}

/// One message recorded by [`ChannelConnector`].
#[derive(Debug, Clone)]
pub enum SentMessage {
    /// A PXPError: `(target, transaction_id, description)`.
    PxpError(String, String, String),
    /// A completed Blocking response: `(target, action_metadata)`.
    Blocking(String, serde_json::Map<String, serde_json::Value>),
    /// A Provisional acknowledgement: `(target, transaction_id)`.
    Provisional(String, String),
    /// A completed NonBlocking response: `(target, job_id, action_metadata)`.
    NonBlocking(String, String, serde_json::Map<String, serde_json::Value>),
}

impl ChannelConnector {
    /// Build an empty recorder.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Every message sent so far, oldest first.
    pub async fn sent(&self) -> Vec<SentMessage> { self.sent.lock().await.clone() }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn send_pxp_error(&self, target: &str, transaction_id: &str, description: &str) {
        self.sent
            .lock()
            .await
            .push(SentMessage::PxpError(target.to_owned(), transaction_id.to_owned(), description.to_owned()));
    }

    async fn send_blocking_response(&self, target: &str, response: &ActionResponse) {
        self.sent
            .lock()
            .await
            .push(SentMessage::Blocking(target.to_owned(), response.metadata().clone()));
    }

    async fn send_provisional_response(&self, target: &str, transaction_id: &str) {
        self.sent
            .lock()
            .await
            .push(SentMessage::Provisional(target.to_owned(), transaction_id.to_owned()));
    }

    async fn send_non_blocking_response(&self, target: &str, response: &ActionResponse, job_id: &str) {
        self.sent.lock().await.push(SentMessage::NonBlocking(
            target.to_owned(),
            job_id.to_owned(),
            response.metadata().clone(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ActionRequest, RequestType};
    use crate::response::{ActionResponse, ModuleType};

    #[tokio::test]
    async fn records_every_message_kind() {
        let connector = ChannelConnector::new();
        connector.send_pxp_error("client", "t1", "bad request").await;
        connector.send_provisional_response("client", "t1").await;

        let data = serde_json::json!({"transaction_id": "t1", "module": "echo", "action": "echo"});
        let request = ActionRequest::from_envelope(RequestType::Blocking, "m1".into(), "client".into(), &data, vec![]).unwrap();
        let mut response = ActionResponse::new(ModuleType::Internal, &request);
        response.set_valid_results(serde_json::json!({}));
        connector.send_blocking_response("client", &response).await;
        connector.send_non_blocking_response("client", &response, "t1").await;

        assert_eq!(connector.sent().await.len(), 4);
    }
}
