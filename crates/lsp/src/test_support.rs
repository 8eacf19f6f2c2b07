//! Scripted fakes for exercising the binding manager without real servers.
//!
//! [`FakeServer`] speaks the server side of the framed protocol over any
//! stream pair (usually [`tokio::io::duplex`]) and answers the handshake
//! with a configurable result. [`MemoryDocumentStore`] provides open
//! documents with injectable commit failures. The provider and project
//! stubs let registry tests control exactly when a launch starts and
//! finishes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use lsp_types::Uri;
use parking_lot::Mutex;
use ropey::Rope;
use serde_json::{Value as JsonValue, json};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{Notify, mpsc};

use crate::provider::{CommitError, Document, DocumentStore, LanguageServerProvider, ProjectContext, ProjectQuery};
use crate::transport::ServerDescriptor;
use crate::wire::io::{read_frame, write_frame};

/// Configuration for a scripted fake language server.
#[derive(Clone)]
pub struct FakeServer {
	/// JSON value returned as the `initialize` result.
	pub init_result: JsonValue,
	/// When set, the `initialize` response is held until notified.
	pub init_gate: Option<Arc<Notify>>,
	/// Answer `workspace/executeCommand` with an error instead of `null`.
	pub fail_execute_command: bool,
}

impl Default for FakeServer {
	fn default() -> Self {
		Self {
			init_result: json!({
				"capabilities": {
					"documentSymbolProvider": true,
					"executeCommandProvider": { "commands": ["demo.fix"] },
				},
				"serverInfo": { "name": "fake-server", "version": "0.0.0" },
			}),
			init_gate: None,
			fail_execute_command: false,
		}
	}
}

/// Handle to a running [`FakeServer`] task.
#[derive(Clone)]
pub struct FakeServerHandle {
	seen: Arc<Mutex<Vec<(String, JsonValue)>>>,
	inject_tx: mpsc::UnboundedSender<JsonValue>,
	next_id: Arc<AtomicI64>,
}

impl FakeServerHandle {
	/// Methods the server has received so far, in order.
	pub fn methods(&self) -> Vec<String> {
		self.seen.lock().iter().map(|(m, _)| m.clone()).collect()
	}

	/// Raw params of the first message received for `method`.
	pub fn params_of(&self, method: &str) -> Option<JsonValue> {
		self.seen
			.lock()
			.iter()
			.find(|(m, _)| m == method)
			.map(|(_, p)| p.clone())
	}

	/// Number of messages received for `method`.
	pub fn count_of(&self, method: &str) -> usize {
		self.seen.lock().iter().filter(|(m, _)| m == method).count()
	}

	/// Client responses to server-initiated requests, in arrival order.
	pub fn client_responses(&self) -> Vec<JsonValue> {
		self.seen
			.lock()
			.iter()
			.filter(|(m, _)| m == "<response>")
			.map(|(_, p)| p.clone())
			.collect()
	}

	/// Sends a server-initiated request to the client.
	pub fn send_request(&self, method: &str, params: JsonValue) {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		self.send_request_with_id(id, method, params);
	}

	/// Sends a server-initiated request under an explicit id.
	pub fn send_request_with_id(&self, id: i64, method: &str, params: JsonValue) {
		let _ = self.inject_tx.send(json!({
			"jsonrpc": "2.0",
			"id": id,
			"method": method,
			"params": params,
		}));
	}

	/// Sends a server notification to the client.
	pub fn send_notification(&self, method: &str, params: JsonValue) {
		let _ = self.inject_tx.send(json!({
			"jsonrpc": "2.0",
			"method": method,
			"params": params,
		}));
	}
}

impl FakeServer {
	/// Spawns the server loop over the given stream halves.
	pub fn spawn<R, W>(self, reader: R, writer: W) -> FakeServerHandle
	where
		R: AsyncRead + Send + Unpin + 'static,
		W: AsyncWrite + Send + Unpin + 'static,
	{
		let seen = Arc::new(Mutex::new(Vec::new()));
		let (inject_tx, mut inject_rx) = mpsc::unbounded_channel::<JsonValue>();
		let handle = FakeServerHandle {
			seen: seen.clone(),
			inject_tx,
			next_id: Arc::new(AtomicI64::new(1000)),
		};

		tokio::spawn(async move {
			let mut reader = BufReader::new(reader);
			let mut writer = writer;
			let mut buf = String::new();
			loop {
				tokio::select! {
					Some(msg) = inject_rx.recv() => {
						if write_frame(&mut writer, &msg).await.is_err() {
							break;
						}
					}
					result = read_frame(&mut reader, &mut buf) => {
						let Ok(Some(msg)) = result else { break };
						let method = msg.get("method").and_then(|m| m.as_str()).map(str::to_owned);
						let id = msg.get("id").cloned();
						let params = msg.get("params").cloned().unwrap_or(JsonValue::Null);

						match (id, method) {
							(Some(id), Some(method)) => {
								seen.lock().push((method.clone(), params));
								let reply = self.answer(&method, &id).await;
								if write_frame(&mut writer, &reply).await.is_err() {
									break;
								}
							}
							(None, Some(method)) => {
								seen.lock().push((method, params));
							}
							(Some(_), None) => {
								seen.lock().push(("<response>".into(), msg));
							}
							(None, None) => {}
						}
					}
				}
			}
		});

		handle
	}

	async fn answer(&self, method: &str, id: &JsonValue) -> JsonValue {
		match method {
			"initialize" => {
				if let Some(gate) = &self.init_gate {
					gate.notified().await;
				}
				json!({ "jsonrpc": "2.0", "id": id, "result": self.init_result })
			}
			"workspace/executeCommand" if self.fail_execute_command => json!({
				"jsonrpc": "2.0",
				"id": id,
				"error": { "code": -32000, "message": "command rejected" },
			}),
			_ => json!({ "jsonrpc": "2.0", "id": id, "result": null }),
		}
	}

	/// Builds a [`ServerDescriptor::Streams`] backed by an in-memory duplex
	/// pipe, with this fake server running on the far end.
	pub fn into_descriptor(self) -> (ServerDescriptor, FakeServerHandle) {
		let (client_end, server_end) = tokio::io::duplex(1 << 20);
		let (client_read, client_write) = tokio::io::split(client_end);
		let (server_read, server_write) = tokio::io::split(server_end);
		let handle = self.spawn(server_read, server_write);
		let descriptor = ServerDescriptor::Streams {
			reader: Box::new(client_read),
			writer: Box::new(client_write),
			process: None,
		};
		(descriptor, handle)
	}
}

/// Project query stub: every file under `root` belongs to one project.
pub struct StubProjectQuery {
	/// Project root reported for matching files.
	pub root: PathBuf,
	/// MIME type reported for matching files.
	pub mime: String,
}

impl ProjectQuery for StubProjectQuery {
	fn locate(&self, file: &Path) -> Option<ProjectContext> {
		file.starts_with(&self.root).then(|| ProjectContext {
			root: self.root.clone(),
			mime: self.mime.clone(),
		})
	}
}

/// Provider stub that spawns a [`FakeServer`] per successful lookup.
pub struct ScriptedProvider {
	template: FakeServer,
	/// Number of `describe` invocations.
	pub describe_count: AtomicUsize,
	/// Notified when `describe` is entered.
	pub entered: Arc<Notify>,
	/// When set, `describe` blocks until notified.
	pub gate: Option<Arc<Notify>>,
	/// Always decline instead of producing a descriptor.
	pub decline: bool,
	/// Handles of the fake servers spawned so far.
	pub handles: Mutex<Vec<FakeServerHandle>>,
}

impl ScriptedProvider {
	/// A provider producing servers from the given template.
	pub fn new(template: FakeServer) -> Self {
		Self {
			template,
			describe_count: AtomicUsize::new(0),
			entered: Arc::new(Notify::new()),
			gate: None,
			decline: false,
			handles: Mutex::new(Vec::new()),
		}
	}

	/// A provider that declines every project.
	pub fn declining() -> Self {
		let mut p = Self::new(FakeServer::default());
		p.decline = true;
		p
	}
}

#[async_trait]
impl LanguageServerProvider for ScriptedProvider {
	async fn describe(&self, _project_root: &Path) -> Option<ServerDescriptor> {
		self.describe_count.fetch_add(1, Ordering::SeqCst);
		self.entered.notify_one();
		if let Some(gate) = &self.gate {
			gate.notified().await;
		}
		if self.decline {
			return None;
		}
		let (descriptor, handle) = self.template.clone().into_descriptor();
		self.handles.lock().push(handle);
		Some(descriptor)
	}
}

/// An open document held in memory with injectable commit failure.
pub struct MemoryDocument {
	uri: Uri,
	text: Mutex<Rope>,
	fail_next_commit: AtomicBool,
}

impl MemoryDocument {
	/// Creates a document with the given content.
	pub fn new(uri: Uri, text: &str) -> Arc<Self> {
		Arc::new(Self {
			uri,
			text: Mutex::new(Rope::from(text)),
			fail_next_commit: AtomicBool::new(false),
		})
	}

	/// Current content as a string.
	pub fn contents(&self) -> String {
		self.text.lock().to_string()
	}

	/// Makes the next commit fail, leaving the content untouched.
	pub fn fail_next_commit(&self) {
		self.fail_next_commit.store(true, Ordering::SeqCst);
	}
}

impl Document for MemoryDocument {
	fn uri(&self) -> Uri {
		self.uri.clone()
	}

	fn text(&self) -> Rope {
		self.text.lock().clone()
	}

	fn commit(&self, text: Rope) -> Result<(), CommitError> {
		if self.fail_next_commit.swap(false, Ordering::SeqCst) {
			return Err(CommitError("injected failure".into()));
		}
		*self.text.lock() = text;
		Ok(())
	}
}

/// Document store over in-memory documents.
#[derive(Default)]
pub struct MemoryDocumentStore {
	docs: Mutex<HashMap<String, Arc<MemoryDocument>>>,
}

impl MemoryDocumentStore {
	/// Creates an empty store.
	pub fn new() -> Self {
		Self::default()
	}

	/// Opens a document in the store and returns it.
	pub fn insert(&self, uri: Uri, text: &str) -> Arc<MemoryDocument> {
		let doc = MemoryDocument::new(uri.clone(), text);
		self.docs.lock().insert(uri.to_string(), doc.clone());
		doc
	}
}

impl DocumentStore for MemoryDocumentStore {
	fn open_document(&self, uri: &Uri) -> Option<Arc<dyn Document>> {
		self.docs
			.lock()
			.get(uri.as_str())
			.cloned()
			.map(|d| d as Arc<dyn Document>)
	}
}
