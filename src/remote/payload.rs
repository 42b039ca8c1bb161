// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire envelope for the gRPC channel.
//!
//! Every message, in either direction, is a [`Payload`]:
//!
//! ```text
//! Payload
//! ├── metadata (2)
//! │   ├── type (3)       # e.g. "InstanceRequest"
//! │   ├── headers (7)    # string map
//! │   └── clientIp (8)
//! └── body (3): Any
//!     ├── type_url (1)
//!     └── value (2)      # UTF-8 JSON of the typed message
//! ```
//!
//! The protobuf messages are derived directly with `prost::Message`, so no
//! build script or protoc is needed. Typed bodies are plain serde structs that
//! implement [`RemoteMessage`].

use crate::error::{ClientError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Envelope metadata.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Metadata {
    #[prost(string, tag = "3")]
    pub r#type: ::prost::alloc::string::String,
    #[prost(map = "string, string", tag = "7")]
    pub headers: HashMap<String, String>,
    #[prost(string, tag = "8")]
    pub client_ip: ::prost::alloc::string::String,
}

/// Wire-compatible `google.protobuf.Any`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Any {
    #[prost(string, tag = "1")]
    pub type_url: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: ::prost::alloc::vec::Vec<u8>,
}

/// The one message type carried by both the unary and the streaming RPC.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Payload {
    #[prost(message, optional, tag = "2")]
    pub metadata: Option<Metadata>,
    #[prost(message, optional, tag = "3")]
    pub body: Option<Any>,
}

impl Payload {
    /// Message type name from the metadata, empty if absent.
    pub fn message_type(&self) -> &str {
        self.metadata.as_ref().map(|m| m.r#type.as_str()).unwrap_or("")
    }

    /// Raw JSON body, empty if absent.
    pub fn body_bytes(&self) -> &[u8] {
        self.body.as_ref().map(|b| b.value.as_slice()).unwrap_or(&[])
    }

    /// Whether the server expects an answer to this push.
    pub fn is_request(&self) -> bool {
        self.message_type().ends_with("Request")
    }
}

/// A typed message body with a fixed wire type name.
pub trait RemoteMessage: Serialize + DeserializeOwned {
    const TYPE: &'static str;
}

/// Build the envelope for a typed message.
pub fn encode<M: RemoteMessage>(message: &M, client_ip: &str) -> Result<Payload> {
    encode_as(M::TYPE, message, client_ip)
}

/// Build an envelope with an explicit type name.
pub fn encode_as<M: Serialize>(message_type: &str, message: &M, client_ip: &str) -> Result<Payload> {
    let value = serde_json::to_vec(message)?;
    Ok(Payload {
        metadata: Some(Metadata {
            r#type: message_type.to_string(),
            headers: HashMap::new(),
            client_ip: client_ip.to_string(),
        }),
        body: Some(Any {
            type_url: String::new(),
            value,
        }),
    })
}

/// Decode a typed message from an envelope.
pub fn decode<M: DeserializeOwned>(payload: &Payload) -> Result<M> {
    Ok(serde_json::from_slice(payload.body_bytes())?)
}

/// Type name of the response that answers `request_type`.
///
/// `"NotifySubscriberRequest"` → `"NotifySubscriberResponse"`.
pub fn response_type_for(request_type: &str) -> String {
    match request_type.strip_suffix("Request") {
        Some(prefix) => format!("{}Response", prefix),
        None => format!("{}Response", request_type),
    }
}

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(1);

/// Process-unique request id.
pub fn next_request_id() -> String {
    REQUEST_SEQ.fetch_add(1, Ordering::Relaxed).to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Common response fields
// ═══════════════════════════════════════════════════════════════════════════════

/// Result code of a successful response.
pub const SUCCESS_CODE: i32 = 200;

/// Fields every response body carries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseStatus {
    #[serde(default = "default_result_code")]
    pub result_code: i32,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

fn default_result_code() -> i32 {
    SUCCESS_CODE
}

impl ResponseStatus {
    /// A success answer for a request id.
    pub fn success(request_id: Option<String>) -> Self {
        Self {
            result_code: SUCCESS_CODE,
            error_code: 0,
            message: None,
            request_id,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result_code == SUCCESS_CODE
    }

    /// Map a failure answer onto the error taxonomy.
    pub fn into_result(self, server: &str) -> Result<()> {
        if self.is_success() {
            return Ok(());
        }
        let code = if self.error_code != 0 { self.error_code } else { self.result_code };
        Err(ClientError::from_error_code(
            server,
            code,
            self.message.unwrap_or_else(|| "no message".to_string()),
        ))
    }
}

/// A response body: status fields flattened next to the typed fields.
#[derive(Debug, Clone, Deserialize)]
pub struct Response<T> {
    #[serde(flatten)]
    pub status: ResponseStatus,
    #[serde(flatten)]
    pub body: T,
}

/// Decode a response envelope, turning error answers into errors.
pub fn decode_response<T: DeserializeOwned>(payload: &Payload, server: &str) -> Result<T> {
    if payload.message_type() == "ErrorResponse" {
        let status: ResponseStatus = decode(payload)?;
        status.into_result(server)?;
        return Err(ClientError::Internal("error response reported success".to_string()));
    }
    let response: Response<T> = decode(payload)?;
    response.status.into_result(server)?;
    Ok(response.body)
}

/// Request body whose only content is a request id and headers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmptyBody {}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Ping {
        request_id: String,
        service_name: String,
    }

    impl RemoteMessage for Ping {
        const TYPE: &'static str = "PingRequest";
    }

    #[test]
    fn test_encode_sets_type_and_json_body() {
        let ping = Ping { request_id: "1".into(), service_name: "orders".into() };
        let payload = encode(&ping, "10.1.1.1").unwrap();
        assert_eq!(payload.message_type(), "PingRequest");
        assert!(payload.is_request());
        assert_eq!(payload.metadata.as_ref().unwrap().client_ip, "10.1.1.1");
        let json = std::str::from_utf8(payload.body_bytes()).unwrap();
        assert!(json.contains("\"serviceName\":\"orders\""));
        assert_eq!(decode::<Ping>(&payload).unwrap(), ping);
    }

    #[test]
    fn test_protobuf_wire_tags() {
        let payload = encode_as("X", &EmptyBody {}, "").unwrap();
        let bytes = payload.encode_to_vec();
        // metadata is field 2, length-delimited
        assert_eq!(bytes[0], (2 << 3) | 2);
        let decoded = Payload::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_response_type_for() {
        assert_eq!(response_type_for("NotifySubscriberRequest"), "NotifySubscriberResponse");
        assert_eq!(response_type_for("ClientDetectionRequest"), "ClientDetectionResponse");
        assert_eq!(response_type_for("Odd"), "OddResponse");
    }

    #[test]
    fn test_request_ids_unique() {
        let a = next_request_id();
        let b = next_request_id();
        assert_ne!(a, b);
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct LockBody {
        #[serde(default)]
        result: bool,
    }

    #[test]
    fn test_decode_response_success() {
        let payload = encode_as(
            "LockOperationResponse",
            &serde_json::json!({"resultCode": 200, "errorCode": 0, "result": true}),
            "",
        )
        .unwrap();
        let body: LockBody = decode_response(&payload, "a:9848").unwrap();
        assert!(body.result);
    }

    #[test]
    fn test_decode_response_error_code_mapping() {
        let payload = encode_as(
            "InstanceResponse",
            &serde_json::json!({"resultCode": 500, "errorCode": 403, "message": "no permission"}),
            "",
        )
        .unwrap();
        let err = decode_response::<EmptyBody>(&payload, "a:9848").unwrap_err();
        assert!(matches!(err, ClientError::AuthDenied(_)));
    }

    #[test]
    fn test_decode_error_response() {
        let payload = encode_as(
            "ErrorResponse",
            &serde_json::json!({"resultCode": 500, "errorCode": 500, "message": "server busy"}),
            "",
        )
        .unwrap();
        let err = decode_response::<EmptyBody>(&payload, "a:9848").unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_decode_garbage_body_is_error() {
        let payload = Payload {
            metadata: None,
            body: Some(Any { type_url: String::new(), value: b"{not json".to_vec() }),
        };
        assert!(matches!(decode::<EmptyBody>(&payload), Err(ClientError::Serialization(_))));
        assert_eq!(payload.message_type(), "");
        assert!(!payload.is_request());
    }
}
