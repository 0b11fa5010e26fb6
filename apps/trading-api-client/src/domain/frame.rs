//! Decoded Inbound Frames
//!
//! A [`Frame`] is the transport-independent view of one inbound message:
//! a response (`id` set), a subscribe confirmation (`id` set, result carries a
//! token) or a push (`id` absent, `subscription` set). The reader classifies
//! frames by these fields only.

use serde_json::Value;

use super::ids::{RequestId, SubscriptionToken};

/// Field carrying the token inside a confirmation result or a push frame.
pub const SUBSCRIPTION_ID_FIELD: &str = "subscriptionId";

/// One decoded inbound message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    /// Correlation id; `None` for pushed data.
    pub id: Option<RequestId>,
    /// Server-reported failure payload.
    pub error: Option<Value>,
    /// Result or params payload.
    pub result: Option<Value>,
    /// Token of the subscription a push frame belongs to.
    pub subscription: Option<SubscriptionToken>,
}

impl Frame {
    /// A successful response to `id`.
    #[must_use]
    pub const fn response(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            error: None,
            result: Some(result),
            subscription: None,
        }
    }

    /// An error response to `id`.
    #[must_use]
    pub const fn failure(id: RequestId, error: Value) -> Self {
        Self {
            id: Some(id),
            error: Some(error),
            result: None,
            subscription: None,
        }
    }

    /// A push frame for `token`.
    #[must_use]
    pub const fn push(token: SubscriptionToken, payload: Value) -> Self {
        Self {
            id: None,
            error: None,
            result: Some(payload),
            subscription: Some(token),
        }
    }

    /// Token carried by a subscribe confirmation result.
    ///
    /// Accepts `{"subscriptionId": "..."}` or a bare string/number result.
    #[must_use]
    pub fn confirmation_token(&self) -> Option<SubscriptionToken> {
        match self.result.as_ref()? {
            Value::Object(map) => map.get(SUBSCRIPTION_ID_FIELD).and_then(token_from_value),
            other => token_from_value(other),
        }
    }
}

/// Read a token from a JSON string or number.
#[must_use]
pub fn token_from_value(value: &Value) -> Option<SubscriptionToken> {
    match value {
        Value::String(s) if !s.is_empty() => Some(SubscriptionToken::new(s.clone())),
        Value::Number(n) => Some(SubscriptionToken::new(n.to_string())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn confirmation_token_from_object() {
        let frame = Frame::response(RequestId::new(2), json!({"subscriptionId": "abc"}));
        assert_eq!(frame.confirmation_token(), Some(SubscriptionToken::from("abc")));
    }

    #[test]
    fn confirmation_token_from_bare_string() {
        let frame = Frame::response(RequestId::new(2), json!("0x9ce59a13"));
        assert_eq!(
            frame.confirmation_token(),
            Some(SubscriptionToken::from("0x9ce59a13"))
        );
    }

    #[test]
    fn confirmation_token_from_number() {
        let frame = Frame::response(RequestId::new(2), json!({"subscriptionId": 42}));
        assert_eq!(frame.confirmation_token(), Some(SubscriptionToken::from("42")));
    }

    #[test]
    fn no_token_in_plain_result() {
        let frame = Frame::response(RequestId::new(1), json!({"status": "ok"}));
        assert_eq!(frame.confirmation_token(), None);

        let frame = Frame::response(RequestId::new(1), json!(""));
        assert_eq!(frame.confirmation_token(), None);

        let frame = Frame::failure(RequestId::new(1), json!("denied"));
        assert_eq!(frame.confirmation_token(), None);
    }
}
