//! RPC frames accepted on the status socket.

use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_core::{Identity, StopMode};
use tether_session::{Caller, CommandGateway};
use tracing::{debug, error, instrument, warn};

use crate::errors::ApiError;
use crate::metrics::{RPC_ERRORS_TOTAL, RPC_REQUESTS_TOTAL};

/// Method not found.
pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
/// Frame was not valid JSON or params did not parse.
pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
/// The call did not finish in time.
pub const TIMEOUT: &str = "TIMEOUT";

/// Maximum time a single RPC call may run.
const HANDLER_TIMEOUT: Duration = Duration::from_secs(60);

/// Incoming RPC frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Unique request identifier, echoed in the response.
    pub id: String,
    /// Method name (e.g. `session.start`).
    pub method: String,
    /// Optional parameters object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Outgoing RPC response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Echoed request identifier.
    pub id: String,
    /// Whether the call succeeded.
    pub success: bool,
    /// Result payload (present when `success == true`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error payload (present when `success == false`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

/// Error body inside an [`RpcResponse`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcErrorBody {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl RpcResponse {
    /// Build a success response.
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response.
    pub fn error(id: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            result: None,
            error: Some(RpcErrorBody {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

/// Parameters shared by the session methods. The identity defaults to the
/// one the socket follows.
#[derive(Debug, Default, Deserialize)]
struct SessionParams {
    #[serde(default)]
    identity: Option<Identity>,
    #[serde(default)]
    mode: StopMode,
}

/// Result of handling one inbound frame.
pub struct HandleResult {
    /// Serialized response to send back.
    pub response_json: String,
    /// Method called (empty if the frame did not parse).
    pub method: String,
    /// Typed response.
    pub response: RpcResponse,
}

/// Parse and run one text frame.
#[instrument(skip_all, fields(method))]
pub async fn handle_message(
    message: &str,
    gateway: &CommandGateway,
    caller: &Caller,
    identity: &Identity,
) -> HandleResult {
    let (method, response) = match serde_json::from_str::<RpcRequest>(message) {
        Ok(request) => {
            let method = request.method.clone();
            let _ = tracing::Span::current().record("method", method.as_str());
            (method, dispatch(request, gateway, caller, identity).await)
        }
        Err(e) => {
            warn!("invalid RPC frame received");
            (
                String::new(),
                RpcResponse::error("unknown", INVALID_PARAMS, format!("Invalid JSON: {e}")),
            )
        }
    };
    let response_json = serde_json::to_string(&response).unwrap_or_else(|e| {
        error!(error = %e, "failed to serialize RPC response");
        String::new()
    });
    HandleResult {
        response_json,
        method,
        response,
    }
}

/// Run one parsed request against the gateway.
pub async fn dispatch(
    request: RpcRequest,
    gateway: &CommandGateway,
    caller: &Caller,
    identity: &Identity,
) -> RpcResponse {
    let method = request.method.clone();
    counter!(RPC_REQUESTS_TOTAL, "method" => method.clone()).increment(1);
    debug!(method, id = %request.id, "dispatching RPC");

    let params: SessionParams = match request.params {
        None | Some(Value::Null) => SessionParams::default(),
        Some(value) => match serde_json::from_value(value) {
            Ok(params) => params,
            Err(e) => {
                counter!(RPC_ERRORS_TOTAL, "method" => method.clone(), "error_type" => INVALID_PARAMS).increment(1);
                return RpcResponse::error(&request.id, INVALID_PARAMS, e.to_string());
            }
        },
    };
    let target = params.identity.as_ref().unwrap_or(identity);

    let call = async {
        match method.as_str() {
            "session.start" => to_value(gateway.start(caller, Some(target)).await),
            "session.stop" => to_value(gateway.stop(caller, Some(target), params.mode).await),
            "session.status" => to_value(gateway.status(caller, Some(target))),
            _ => Err(None),
        }
    };

    match tokio::time::timeout(HANDLER_TIMEOUT, call).await {
        Ok(Ok(result)) => RpcResponse::success(&request.id, result),
        Ok(Err(None)) => {
            counter!(RPC_ERRORS_TOTAL, "method" => method.clone(), "error_type" => METHOD_NOT_FOUND).increment(1);
            RpcResponse::error(
                &request.id,
                METHOD_NOT_FOUND,
                format!("Method '{method}' not found"),
            )
        }
        Ok(Err(Some(err))) => {
            counter!(RPC_ERRORS_TOTAL, "method" => method.clone(), "error_type" => err.code()).increment(1);
            RpcResponse::error(&request.id, err.code(), err.to_string())
        }
        Err(_elapsed) => {
            counter!(RPC_ERRORS_TOTAL, "method" => method.clone(), "error_type" => TIMEOUT).increment(1);
            error!(method, "RPC call timed out after {HANDLER_TIMEOUT:?}");
            RpcResponse::error(
                &request.id,
                TIMEOUT,
                format!("'{method}' timed out"),
            )
        }
    }
}

fn to_value<T: Serialize, E: Into<ApiError>>(result: Result<T, E>) -> Result<Value, Option<ApiError>> {
    let value = result.map_err(|e| Some(e.into()))?;
    serde_json::to_value(value).map_err(|e| {
        Some(ApiError::Internal {
            code: "INTERNAL_ERROR",
            message: e.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tether_core::{
        ConnectionState, MemoryCredentialStore, MemoryGrantStore, MemoryProjectionStore,
    };
    use tether_session::transport::scripted::{ScriptedBehavior, ScriptedTransportFactory};
    use tether_session::{
        GatewayConfig, GrantAuthorizer, PersistenceRetry, SessionRegistry, StatusPublisher,
        WorkerDeps, WorkerPolicy,
    };

    use super::*;

    fn gateway() -> CommandGateway {
        let credentials = Arc::new(MemoryCredentialStore::new());
        let publisher = Arc::new(StatusPublisher::new(
            Arc::new(MemoryProjectionStore::new()),
            16,
            PersistenceRetry::default(),
        ));
        let registry = SessionRegistry::new(WorkerDeps {
            transports: Arc::new(ScriptedTransportFactory::with_behavior(
                ScriptedBehavior::AutoPair,
            )),
            credentials: credentials.clone(),
            sink: publisher.clone(),
            policy: Arc::new(WorkerPolicy::default()),
        });
        let grants = Arc::new(MemoryGrantStore::new());
        grants.grant("user-1", &Identity::from("op-1"));
        CommandGateway::new(
            registry,
            publisher,
            credentials,
            Arc::new(GrantAuthorizer::new(grants)),
            GatewayConfig::default(),
        )
    }

    async fn call(gateway: &CommandGateway, frame: Value) -> RpcResponse {
        handle_message(
            &frame.to_string(),
            gateway,
            &Caller::new("user-1"),
            &Identity::from("op-1"),
        )
        .await
        .response
    }

    #[tokio::test]
    async fn status_defaults_to_socket_identity() {
        let gateway = gateway();
        let resp = call(&gateway, json!({"id": "1", "method": "session.status"})).await;
        assert!(resp.success);
        assert_eq!(resp.id, "1");
        let result = resp.result.unwrap();
        assert_eq!(result["identity"], "op-1");
        assert_eq!(result["state"], "idle");
    }

    #[tokio::test]
    async fn start_then_stop() {
        let gateway = gateway();
        let resp = call(&gateway, json!({"id": "s", "method": "session.start"})).await;
        assert!(resp.success);
        assert_ne!(resp.result.unwrap()["state"], "idle");

        let resp = call(
            &gateway,
            json!({"id": "t", "method": "session.stop", "params": {"mode": "pause"}}),
        )
        .await;
        assert!(resp.success);
        assert_eq!(resp.result.unwrap()["ok"], true);
        let status = gateway
            .status(&Caller::new("user-1"), Some(&Identity::from("op-1")))
            .unwrap();
        assert_eq!(status.state, ConnectionState::Idle);
    }

    #[tokio::test]
    async fn foreign_identity_is_rejected() {
        let gateway = gateway();
        let resp = call(
            &gateway,
            json!({"id": "x", "method": "session.status", "params": {"identity": "op-2"}}),
        )
        .await;
        assert!(!resp.success);
        assert_eq!(resp.error.unwrap().code, "AUTHORIZATION_ERROR");
    }

    #[tokio::test]
    async fn unknown_method() {
        let gateway = gateway();
        let resp = call(&gateway, json!({"id": "u", "method": "session.explode"})).await;
        assert!(!resp.success);
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn bad_params() {
        let gateway = gateway();
        let resp = call(
            &gateway,
            json!({"id": "p", "method": "session.stop", "params": {"mode": "explode"}}),
        )
        .await;
        assert!(!resp.success);
        assert_eq!(resp.id, "p");
        assert_eq!(resp.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn invalid_json() {
        let gateway = gateway();
        let result = handle_message(
            "not json",
            &gateway,
            &Caller::new("user-1"),
            &Identity::from("op-1"),
        )
        .await;
        assert!(!result.response.success);
        assert_eq!(result.response.id, "unknown");
        assert!(result.method.is_empty());
        assert!(result.response_json.contains("INVALID_PARAMS"));
    }
}
