//! JSON-RPC Frame Codec
//!
//! Encodes outgoing requests and decodes inbound text frames for the duplex
//! trading API connection.
//!
//! # Wire Format
//!
//! ```json
//! {"id":1,"method":"Ping","params":{}}                      // request
//! {"id":1,"result":"pong"}                                  // response
//! {"id":2,"error":{"code":-32601,"message":"no method"}}    // error
//! {"id":3,"result":{"subscriptionId":"abc"}}                // confirmation
//! {"subscriptionId":"abc","result":{"px":"101.5"}}          // push
//! {"method":"update","params":{"subscription":"abc","result":1}} // push, nested
//! ```

use serde::Serialize;
use serde_json::{Map, Value};

use crate::application::ports::{CodecError, FrameDecoder, FrameEncoder};
use crate::domain::frame::{Frame, SUBSCRIPTION_ID_FIELD, token_from_value};
use crate::domain::ids::{RequestId, SubscriptionToken};

/// Version tag written when [`JsonRpcCodec::with_version_tag`] is enabled.
const JSONRPC_VERSION: &str = "2.0";

#[derive(Serialize)]
struct OutgoingRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    jsonrpc: Option<&'static str>,
    id: RequestId,
    method: &'a str,
    params: &'a Value,
}

/// JSON codec for the duplex connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRpcCodec {
    version_tag: bool,
}

impl JsonRpcCodec {
    /// Create a codec that writes bare `{id, method, params}` requests.
    #[must_use]
    pub const fn new() -> Self {
        Self { version_tag: false }
    }

    /// Also write `"jsonrpc": "2.0"` on every request.
    #[must_use]
    pub const fn with_version_tag(mut self, enabled: bool) -> Self {
        self.version_tag = enabled;
        self
    }
}

impl FrameEncoder for JsonRpcCodec {
    fn encode_request(
        &self,
        id: RequestId,
        method: &str,
        params: &Value,
    ) -> Result<String, CodecError> {
        let request = OutgoingRequest {
            jsonrpc: self.version_tag.then_some(JSONRPC_VERSION),
            id,
            method,
            params,
        };
        Ok(serde_json::to_string(&request)?)
    }
}

impl FrameDecoder for JsonRpcCodec {
    fn decode(&self, text: &str) -> Result<Frame, CodecError> {
        let trimmed = text.trim();
        let Value::Object(mut map) = serde_json::from_str::<Value>(trimmed)? else {
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON object, got: {}...",
                trimmed.chars().take(50).collect::<String>()
            )));
        };

        let id = decode_id(map.remove("id"))?;
        let error = map.remove("error").filter(|v| !v.is_null());
        let payload = map.remove("result").or_else(|| map.remove("params"));

        if let Some(token) = map.get(SUBSCRIPTION_ID_FIELD).and_then(token_from_value) {
            return Ok(Frame {
                id,
                error,
                result: payload,
                subscription: Some(token),
            });
        }

        // Nested pushes only make sense without a correlation id; a
        // confirmation result also carries `subscriptionId`.
        if id.is_none()
            && error.is_none()
            && let Some(Value::Object(inner)) = payload
        {
            return Ok(match split_nested_push(inner) {
                Ok((token, result)) => Frame {
                    id: None,
                    error: None,
                    result,
                    subscription: Some(token),
                },
                Err(inner) => Frame {
                    id: None,
                    error: None,
                    result: Some(Value::Object(inner)),
                    subscription: None,
                },
            });
        }

        Ok(Frame {
            id,
            error,
            result: payload,
            subscription: None,
        })
    }
}

fn decode_id(raw: Option<Value>) -> Result<Option<RequestId>, CodecError> {
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|id| Some(RequestId::new(id)))
            .ok_or_else(|| CodecError::InvalidFormat(format!("id is not an unsigned integer: {n}"))),
        Some(Value::String(s)) => s
            .parse::<u64>()
            .map(|id| Some(RequestId::new(id)))
            .map_err(|_| CodecError::InvalidFormat(format!("id is not numeric: {s:?}"))),
        Some(other) => Err(CodecError::InvalidFormat(format!(
            "unsupported id type: {other}"
        ))),
    }
}

/// Split `{"subscription"|"subscriptionId": token, "result"|"data": payload}`.
fn split_nested_push(
    mut inner: Map<String, Value>,
) -> Result<(SubscriptionToken, Option<Value>), Map<String, Value>> {
    let token = inner
        .get(SUBSCRIPTION_ID_FIELD)
        .or_else(|| inner.get("subscription"))
        .and_then(token_from_value);
    match token {
        Some(token) => {
            let payload = inner.remove("result").or_else(|| inner.remove("data"));
            Ok((token, payload))
        }
        None => Err(inner),
    }
}
