//! The RPC JSON envelope: every `POST /rpc/<procedure>` call carries
//! `{"json": <input>}` and every response carries `{"json": <output>}`,
//! mirroring tRPC-style wire framing. `Rpc<T>` is a small Axum
//! extractor/response pair over `axum::Json` so handlers never see the
//! envelope directly.

use axum::extract::{FromRequest, Request};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::AppError;

#[derive(serde::Deserialize)]
struct Envelope<T> {
    json: T,
}

/// Extracts the `json` field of an RPC request body into `T`.
pub struct Rpc<T>(pub T);

impl<S, T> FromRequest<S> for Rpc<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(envelope) = Json::<Envelope<T>>::from_request(req, state)
            .await
            .map_err(|e| AppError::InvalidArgument(e.to_string()))?;
        Ok(Rpc(envelope.json))
    }
}

/// Wraps a handler's return value in the `{"json": ...}` envelope.
pub struct RpcOk<T>(pub T);

impl<T: Serialize> IntoResponse for RpcOk<T> {
    fn into_response(self) -> Response {
        Json(json!({ "json": self.0 })).into_response()
    }
}

/// Empty input for procedures that take none (`syncAll`, `info`, ...). The
/// envelope still requires a `json` key; clients send `{"json": {}}` or
/// `{"json": null}` — either deserializes here, since the value is simply
/// discarded.
#[derive(Default)]
pub struct NoInput;

impl<'de> serde::de::Deserialize<'de> for NoInput {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        let _ = serde_json::Value::deserialize(deserializer)?;
        Ok(NoInput)
    }
}
