//! JSON-RPC envelope types and the per-connection remote-procedure proxy.
//!
//! The wire layer carries untyped JSON-RPC messages; typed LSP payloads are
//! serialized at the [`RpcProxy`] boundary and deserialized again on the way
//! out. One [`io::run_io`] task per connection owns the stream pair and
//! guarantees total ordering of outbound writes.

pub(crate) mod io;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use lsp_types::notification::Notification;
use lsp_types::request::Request;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};

use crate::{Error, Result};

/// Capacity of the per-connection outbound queue.
///
/// Requests await queue space; notifications fail fast with
/// [`Error::Backpressure`] so edit-driven callers can retry on their own
/// schedule instead of stalling.
pub(crate) const OUTBOUND_QUEUE: usize = 64;

/// JSON-RPC request identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
	/// Numeric identifier.
	Number(i64),
	/// String identifier.
	String(String),
}

/// An untyped JSON-RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnyRequest {
	/// Request identifier.
	pub id: RequestId,
	/// LSP method name.
	pub method: String,
	/// Raw request parameters.
	#[serde(default)]
	pub params: JsonValue,
}

/// An untyped JSON-RPC notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnyNotification {
	/// LSP method name.
	pub method: String,
	/// Raw notification parameters.
	#[serde(default)]
	pub params: JsonValue,
}

/// An untyped JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnyResponse {
	/// Identifier of the request being answered.
	pub id: RequestId,
	/// Result payload, absent on error.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result: Option<JsonValue>,
	/// Error payload, absent on success.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<ResponseError>,
}

/// The error object of a failed JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("jsonrpc error {code}: {message}")]
pub struct ResponseError {
	/// JSON-RPC error code.
	pub code: i32,
	/// Short error description.
	pub message: String,
	/// Optional structured data.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<JsonValue>,
}

impl ResponseError {
	/// JSON-RPC `MethodNotFound` error code.
	pub const METHOD_NOT_FOUND: i32 = -32601;
	/// JSON-RPC `InvalidParams` error code.
	pub const INVALID_PARAMS: i32 = -32602;

	/// Builds a `MethodNotFound` error for a server-initiated request this
	/// client does not handle.
	pub fn method_not_found(method: &str) -> Self {
		Self {
			code: Self::METHOD_NOT_FOUND,
			message: format!("client does not handle {method}"),
			data: None,
		}
	}
}

/// Outbound message envelope, processed in order by the I/O task.
pub(crate) enum Outbound {
	/// A client request awaiting a response.
	Request {
		request: AnyRequest,
		response_tx: oneshot::Sender<Result<AnyResponse>>,
	},
	/// A fire-and-forget notification.
	Notify { notif: AnyNotification },
	/// A reply to a server-initiated request.
	Reply {
		id: RequestId,
		resp: std::result::Result<JsonValue, ResponseError>,
	},
}

/// Inbound traffic that is not a response to one of our requests.
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
	/// A server-initiated request (e.g. `workspace/applyEdit`).
	Request(AnyRequest),
	/// A server notification (diagnostics, progress, logs).
	Notification(AnyNotification),
	/// The underlying channel closed; no further events follow.
	Closed,
}

/// Remote-procedure proxy for one live connection.
///
/// Cheap to clone; all clones feed the same ordered outbound queue.
#[derive(Clone)]
pub(crate) struct RpcProxy {
	outbound_tx: mpsc::Sender<Outbound>,
	next_id: Arc<AtomicI64>,
	timeout: Duration,
}

impl RpcProxy {
	pub(crate) fn new(outbound_tx: mpsc::Sender<Outbound>, timeout: Duration) -> Self {
		Self {
			outbound_tx,
			next_id: Arc::new(AtomicI64::new(1)),
			timeout,
		}
	}

	/// Sends a typed request and awaits the typed response under the
	/// connection deadline. A timeout is indistinguishable from transport
	/// failure to callers and never leaves cached state behind.
	pub(crate) async fn request<R: Request>(&self, params: R::Params) -> Result<R::Result> {
		let request = AnyRequest {
			id: RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed)),
			method: R::METHOD.into(),
			params: serde_json::to_value(params)?,
		};
		let (response_tx, response_rx) = oneshot::channel();
		self.outbound_tx
			.send(Outbound::Request { request, response_tx })
			.await
			.map_err(|_| Error::ServiceStopped)?;

		let resp = if self.timeout.is_zero() {
			response_rx.await.map_err(|_| Error::ServiceStopped)??
		} else {
			match tokio::time::timeout(self.timeout, response_rx).await {
				Ok(resp) => resp.map_err(|_| Error::ServiceStopped)??,
				Err(_) => return Err(Error::RequestTimeout(R::METHOD.into())),
			}
		};

		match resp.error {
			None => Ok(serde_json::from_value(resp.result.unwrap_or_default())?),
			Some(err) => Err(Error::Response(err)),
		}
	}

	/// Sends a typed notification without waiting.
	pub(crate) fn notify<N: Notification>(&self, params: N::Params) -> Result<()> {
		let notif = AnyNotification {
			method: N::METHOD.into(),
			params: serde_json::to_value(params)?,
		};
		self.send(Outbound::Notify { notif })
	}

	/// Replies to a server-initiated request.
	pub(crate) fn reply(
		&self,
		id: RequestId,
		resp: std::result::Result<JsonValue, ResponseError>,
	) -> Result<()> {
		self.send(Outbound::Reply { id, resp })
	}

	fn send(&self, msg: Outbound) -> Result<()> {
		self.outbound_tx.try_send(msg).map_err(|err| match err {
			mpsc::error::TrySendError::Closed(_) => Error::ServiceStopped,
			mpsc::error::TrySendError::Full(_) => Error::Backpressure,
		})
	}
}
