//! Request and reply envelopes in the JSON-RPC dialect Bitcoin Core speaks.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, RpcError};

/// A single method invocation. Sent alone or as one element of a batch.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct Call {
    pub(super) method: &'static str,
    pub(super) params: Vec<Value>,
}

impl Call {
    pub(super) fn new(method: &'static str, params: Vec<Value>) -> Self {
        Self { method, params }
    }

    pub(super) fn bare(method: &'static str) -> Self {
        Self::new(method, Vec::new())
    }
}

#[derive(Serialize)]
pub(super) struct Envelope<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: &'a [Value],
}

impl<'a> Envelope<'a> {
    pub(super) fn wrap(id: u64, call: &'a Call) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: call.method,
            params: &call.params,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct Reply {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

impl Reply {
    /// Numeric id of a batch reply. Proxies in front of the node sometimes
    /// echo ids back as strings.
    pub(super) fn id(&self) -> Result<u64, CoreError> {
        let parsed = match &self.id {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| {
            RpcError::InvalidResponse(format!("batch reply carries unusable id {}", self.id)).into()
        })
    }

    pub(super) fn into_result(self) -> Result<Value, CoreError> {
        match self.error {
            Some(err) => Err(server_error(err)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Typed `ServerError` for the usual `{code, message}` object; anything
/// else is kept verbatim as an invalid response.
fn server_error(raw: Value) -> CoreError {
    #[derive(Deserialize)]
    struct Fault {
        code: i64,
        message: String,
    }

    match Fault::deserialize(&raw) {
        Ok(Fault { code, message }) => RpcError::ServerError { code, message }.into(),
        Err(_) => RpcError::InvalidResponse(format!("unrecognised error object {raw}")).into(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn reply(raw: Value) -> Reply {
        serde_json::from_value(raw).expect("reply must decode")
    }

    #[test]
    fn reply_ids_accept_numbers_and_numeric_strings() {
        assert_eq!(reply(json!({"id": 7, "result": 1})).id().expect("numeric id"), 7);
        assert_eq!(reply(json!({"id": "19", "result": 1})).id().expect("string id"), 19);
        assert!(reply(json!({"id": [1], "result": 1})).id().is_err());
        assert!(reply(json!({"result": 1})).id().is_err());
    }

    #[test]
    fn null_error_field_is_success() {
        let value = reply(json!({"id": 1, "result": {"blocks": 3}, "error": null}))
            .into_result()
            .expect("null error means success");
        assert_eq!(value["blocks"], 3);
    }

    #[test]
    fn error_objects_become_server_errors() {
        let err = reply(json!({"id": 1, "result": null, "error": {"code": -8, "message": "bad vout"}}))
            .into_result()
            .expect_err("must fail");
        assert!(matches!(
            err,
            CoreError::Rpc(RpcError::ServerError { code: -8, ref message }) if message == "bad vout"
        ));

        let odd = reply(json!({"id": 1, "error": "boom"})).into_result().expect_err("must fail");
        assert!(matches!(odd, CoreError::Rpc(RpcError::InvalidResponse(_))));
    }

    #[test]
    fn envelope_borrows_call_params() {
        let call = Call::new("gettxout", vec![json!("ab"), json!(0)]);
        let encoded = serde_json::to_value(Envelope::wrap(4, &call)).expect("envelope encodes");
        assert_eq!(
            encoded,
            json!({"jsonrpc": "2.0", "id": 4, "method": "gettxout", "params": ["ab", 0]})
        );
    }
}
