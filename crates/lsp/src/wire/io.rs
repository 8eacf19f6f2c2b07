//! Framed I/O loop for one server connection.
//!
//! Owns both stream halves. All outbound traffic flows through a single
//! queue so writes are totally ordered; inbound responses are matched
//! against a pending map while server-initiated traffic is forwarded to the
//! connection's event channel. A write failure or EOF tears the loop down
//! and fails every pending request with [`Error::ServiceStopped`].

use std::collections::HashMap;

use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

use super::{AnyNotification, AnyRequest, AnyResponse, ConnectionEvent, Outbound, RequestId};
use crate::{Error, Result};

/// Runs the I/O loop for a single server connection until EOF or failure.
pub(crate) async fn run_io<R, W>(
	reader: R,
	mut writer: W,
	mut outbound_rx: mpsc::Receiver<Outbound>,
	event_tx: mpsc::UnboundedSender<ConnectionEvent>,
) where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut reader = BufReader::new(reader);
	let mut pending: HashMap<RequestId, oneshot::Sender<Result<AnyResponse>>> = HashMap::new();
	let mut read_buf = String::new();

	loop {
		tokio::select! {
			Some(out) = outbound_rx.recv() => {
				let write_res: Result<()> = match out {
					Outbound::Notify { notif } => {
						write_frame(&mut writer, &serde_json::json!({
							"jsonrpc": "2.0",
							"method": notif.method,
							"params": notif.params,
						})).await
					}
					Outbound::Request { request, response_tx } => {
						let req_id = request.id.clone();
						let res = write_frame(&mut writer, &serde_json::json!({
							"jsonrpc": "2.0",
							"id": request.id,
							"method": request.method,
							"params": request.params,
						})).await;
						match res {
							Ok(()) => {
								pending.insert(req_id, response_tx);
								Ok(())
							}
							Err(e) => {
								let _ = response_tx.send(Err(Error::ServiceStopped));
								Err(e)
							}
						}
					}
					Outbound::Reply { id, resp } => {
						let obj = match resp {
							Ok(result) => serde_json::json!({
								"jsonrpc": "2.0",
								"id": id,
								"result": result,
							}),
							Err(err) => serde_json::json!({
								"jsonrpc": "2.0",
								"id": id,
								"error": err,
							}),
						};
						write_frame(&mut writer, &obj).await
					}
				};

				if let Err(e) = write_res {
					tracing::error!(error = %e, "outbound write failed; terminating connection I/O");
					break;
				}
			}

			result = read_frame(&mut reader, &mut read_buf) => {
				match result {
					Ok(Some(msg)) => route_inbound(msg, &mut pending, &event_tx),
					Ok(None) => {
						tracing::info!("language server closed its connection");
						break;
					}
					Err(e) => {
						tracing::error!(error = %e, "error reading from language server");
						break;
					}
				}
			}
		}
	}

	for (_, tx) in pending {
		let _ = tx.send(Err(Error::ServiceStopped));
	}
	outbound_rx.close();
	while let Ok(out) = outbound_rx.try_recv() {
		if let Outbound::Request { response_tx, .. } = out {
			let _ = response_tx.send(Err(Error::ServiceStopped));
		}
	}
	let _ = event_tx.send(ConnectionEvent::Closed);
}

/// Writes one `Content-Length`-framed JSON-RPC message.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, value: &JsonValue) -> Result<()> {
	let json = serde_json::to_string(value)?;
	let msg = format!("Content-Length: {}\r\n\r\n{}", json.len(), json);
	writer.write_all(msg.as_bytes()).await?;
	writer.flush().await?;
	Ok(())
}

/// Reads one `Content-Length`-framed JSON-RPC message.
///
/// Returns `Ok(None)` on a clean EOF at a message boundary.
pub(crate) async fn read_frame<R: tokio::io::AsyncBufRead + Unpin>(
	reader: &mut R,
	buf: &mut String,
) -> Result<Option<JsonValue>> {
	let mut content_length: Option<usize> = None;
	loop {
		buf.clear();
		let bytes_read = reader.read_line(buf).await?;
		if bytes_read == 0 {
			return Ok(None);
		}

		let line = buf.trim();
		if line.is_empty() {
			break;
		}

		if let Some(len_str) = line.strip_prefix("Content-Length: ") {
			content_length = len_str.trim().parse().ok();
		}
	}

	let length = content_length.ok_or_else(|| Error::Protocol("missing Content-Length header".into()))?;

	let mut body = vec![0u8; length];
	reader.read_exact(&mut body).await?;

	Ok(Some(serde_json::from_slice(&body)?))
}

/// Dispatches an inbound message to the pending map or the event channel.
fn route_inbound(
	msg: JsonValue,
	pending: &mut HashMap<RequestId, oneshot::Sender<Result<AnyResponse>>>,
	event_tx: &mpsc::UnboundedSender<ConnectionEvent>,
) {
	let has_id = msg.get("id").is_some();
	let has_method = msg.get("method").is_some();

	// Response to one of our requests.
	if has_id && !has_method {
		let resp: AnyResponse = match serde_json::from_value(msg) {
			Ok(r) => r,
			Err(e) => {
				tracing::warn!(error = %e, "failed to parse server response");
				return;
			}
		};
		if let Some(tx) = pending.remove(&resp.id) {
			let _ = tx.send(Ok(resp));
		} else {
			tracing::debug!(id = ?resp.id, "response for unknown request id");
		}
		return;
	}

	let method = msg
		.get("method")
		.and_then(|m| m.as_str())
		.unwrap_or_default()
		.to_string();
	let params = msg.get("params").cloned().unwrap_or(JsonValue::Null);

	// Server notification.
	if has_method && !has_id {
		let _ = event_tx.send(ConnectionEvent::Notification(AnyNotification { method, params }));
		return;
	}

	// Server-initiated request. An id we cannot echo back verbatim would
	// orphan the server's request, so the message is dropped instead of
	// answered under a fabricated id.
	if has_method && has_id {
		let id = match msg.get("id").cloned().unwrap_or(JsonValue::Null) {
			JsonValue::Number(n) => match n.as_i64() {
				Some(n) => RequestId::Number(n),
				None => {
					tracing::warn!(%method, id = %n, "dropping server request with non-integer id");
					return;
				}
			},
			JsonValue::String(s) => RequestId::String(s),
			other => {
				tracing::warn!(%method, id = ?other, "dropping server request with malformed id");
				return;
			}
		};
		let _ = event_tx.send(ConnectionEvent::Request(AnyRequest { id, method, params }));
		return;
	}

	tracing::warn!("inbound message is neither request, response, nor notification");
}
