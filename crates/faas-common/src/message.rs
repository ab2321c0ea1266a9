use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::encoding::base64_bytes;
use crate::{FaasError, FunctionName, Headers, Invocation, InvocationMode, Result};

/// Wire form of an async invocation.
///
/// Serialized as JSON; the body and header values are base64 so arbitrary
/// bytes round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub call_id: String,
    pub function: FunctionName,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Headers,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    #[serde(rename = "callbackURL")]
    pub callback_url: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    /// Delivery attempt as reported by the broker. Not part of the payload.
    #[serde(skip)]
    pub attempt: u32,
}

impl QueueMessage {
    pub fn from_invocation(invocation: &Invocation) -> Self {
        Self {
            call_id: invocation.call_id.clone(),
            function: invocation.function.clone(),
            method: invocation.method.clone(),
            path: invocation.path.clone(),
            query: invocation.query.clone(),
            headers: invocation.headers.clone(),
            body: invocation.body.clone(),
            callback_url: invocation.callback_url.clone(),
            enqueued_at: Utc::now(),
            attempt: 0,
        }
    }

    pub fn into_invocation(self) -> Invocation {
        Invocation {
            call_id: self.call_id,
            function: self.function,
            method: self.method,
            path: self.path,
            query: self.query,
            headers: self.headers,
            body: self.body,
            received_at: self.enqueued_at,
            mode: InvocationMode::Async,
            callback_url: self.callback_url,
        }
    }

    /// Serialize, refusing anything over `max_bytes` rather than truncating.
    pub fn encode(&self, max_bytes: usize) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| FaasError::EnqueueFailure(format!("encode failed: {e}")))?;
        if bytes.len() > max_bytes {
            return Err(FaasError::PayloadTooLarge {
                limit: max_bytes,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| FaasError::InvalidRequest(format!("undecodable queue message: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_invocation() -> Invocation {
        let headers: Headers = [
            ("Content-Type", b"application/octet-stream".to_vec()),
            ("X-Binary", vec![0xff, 0x00, 0x7f]),
        ]
        .into_iter()
        .collect();
        Invocation::new(
            FunctionName::parse("echo").unwrap(),
            InvocationMode::Async,
            "POST",
            headers,
            vec![0, 159, 146, 150, b'\n'],
        )
        .with_path("/sub", Some("x=1".into()))
        .with_callback(Some("http://callback:9000/done".into()))
    }

    #[test]
    fn test_message_preserves_bytes() {
        let invocation = sample_invocation();
        let message = QueueMessage::from_invocation(&invocation);
        let bytes = message.encode(1 << 20).unwrap();
        let decoded = QueueMessage::decode(&bytes).unwrap();

        assert_eq!(decoded, message);
        let restored = decoded.into_invocation();
        assert_eq!(restored.body, invocation.body);
        assert_eq!(restored.headers, invocation.headers);
        assert_eq!(restored.callback_url, invocation.callback_url);
        assert_eq!(restored.call_id, invocation.call_id);
        assert_eq!(restored.query.as_deref(), Some("x=1"));
    }

    #[test]
    fn test_wire_field_names() {
        let message = QueueMessage::from_invocation(&sample_invocation());
        let value: serde_json::Value =
            serde_json::from_slice(&message.encode(1 << 20).unwrap()).unwrap();
        assert_eq!(value["function"], "echo");
        assert_eq!(value["callbackURL"], "http://callback:9000/done");
        assert!(value.get("enqueuedAt").is_some());
        assert!(value.get("attempt").is_none());
    }

    #[test]
    fn test_oversized_message_is_rejected() {
        let mut invocation = sample_invocation();
        invocation.body = vec![b'a'; 4096];
        let err = QueueMessage::from_invocation(&invocation)
            .encode(1024)
            .unwrap_err();
        match err {
            FaasError::PayloadTooLarge { limit, actual } => {
                assert_eq!(limit, 1024);
                assert!(actual > 4096);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_garbage_is_not_decoded() {
        assert!(matches!(
            QueueMessage::decode(b"not json"),
            Err(FaasError::InvalidRequest(_))
        ));
    }
}
