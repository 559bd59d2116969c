//! Wire message envelope.
//!
//! Every frame on the wire is one JSON-encoded [`Message`], length-prefixed
//! by [`crate::codec::JsonCodec`]. This plays the role `PerspectiveBroker`
//! played in the original: a `Call` names one of the sealed remote methods
//! (see `pydra_kernel::registry::WorkerRpc` plus the Controller/auth
//! surfaces) and carries its positional arguments as a JSON array; the
//! matching `Reply` carries either the method's return value or an error
//! string, correlated by `id`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Message {
    Call {
        id: u64,
        method: String,
        args: Vec<Value>,
    },
    Reply {
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Message {
    pub fn call(id: u64, method: impl Into<String>, args: Vec<Value>) -> Self {
        Message::Call {
            id,
            method: method.into(),
            args,
        }
    }

    pub fn ok(id: u64, result: Value) -> Self {
        Message::Reply {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: impl Into<String>) -> Self {
        Message::Reply {
            id,
            result: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_round_trips_through_json() {
        let msg = Message::call(7, "run_task", vec![Value::String("demo.Echo".into())]);
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        match back {
            Message::Call { id, method, args } => {
                assert_eq!(id, 7);
                assert_eq!(method, "run_task");
                assert_eq!(args.len(), 1);
            }
            _ => panic!("expected Call"),
        }
    }
}
