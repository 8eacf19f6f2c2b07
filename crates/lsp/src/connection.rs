//! A live language-server session and its typed sub-services.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lsp_types::{InitializeResult, PositionEncodingKind, ServerCapabilities, Uri};
use parking_lot::Mutex;
use tokio::process::Child;
use tokio::sync::mpsc;

use crate::transport::{self, ServerDescriptor};
use crate::wire::{self, ConnectionEvent, RpcProxy};
use crate::{Result, handshake};

/// Offset encoding for LSP positions.
///
/// LSP defaults to UTF-16; servers can negotiate another encoding during
/// the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetEncoding {
	/// UTF-8 byte offsets.
	Utf8,
	/// UTF-16 code unit offsets (LSP default).
	#[default]
	Utf16,
	/// UTF-32 / Unicode codepoint offsets.
	Utf32,
}

impl OffsetEncoding {
	/// Parses an LSP position encoding kind.
	pub fn from_lsp(kind: &PositionEncodingKind) -> Option<Self> {
		match kind.as_str() {
			"utf-8" => Some(Self::Utf8),
			"utf-16" => Some(Self::Utf16),
			"utf-32" => Some(Self::Utf32),
			_ => None,
		}
	}
}

/// One live server session.
///
/// Owns the remote-procedure proxy, the negotiated [`InitializeResult`]
/// (stored unmodified), and the OS process handle when this connection
/// spawned one. Connections are created by the registry on first resolution
/// for a scope key and are never explicitly closed by normal callers;
/// process death is observed lazily via [`Connection::is_alive`].
pub struct Connection {
	name: String,
	root: PathBuf,
	init: InitializeResult,
	proxy: RpcProxy,
	process: Option<Mutex<Child>>,
}

impl std::fmt::Debug for Connection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Connection")
			.field("name", &self.name)
			.field("root", &self.root)
			.field("has_process", &self.process.is_some())
			.finish_non_exhaustive()
	}
}

impl Connection {
	/// Launches the transport, performs the handshake rooted at `root`, and
	/// wraps the result.
	///
	/// Returns the connection together with the event stream carrying
	/// server-initiated requests and notifications; the caller decides how
	/// those are routed.
	pub(crate) async fn establish(
		name: impl Into<String>,
		root: &Path,
		descriptor: ServerDescriptor,
		timeout: Duration,
	) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ConnectionEvent>)> {
		let transport = transport::launch(descriptor, root).await?;

		let (outbound_tx, outbound_rx) = mpsc::channel(wire::OUTBOUND_QUEUE);
		let (event_tx, event_rx) = mpsc::unbounded_channel();
		tokio::spawn(wire::io::run_io(transport.reader, transport.writer, outbound_rx, event_tx));

		let proxy = RpcProxy::new(outbound_tx, timeout);
		let init = handshake::initialize(&proxy, root).await?;

		let conn = Arc::new(Self {
			name: name.into(),
			root: root.to_path_buf(),
			init,
			proxy,
			process: transport.process.map(Mutex::new),
		});
		Ok((conn, event_rx))
	}

	/// Human-readable name, usually the command or `host:port`.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Root the handshake was performed against.
	pub fn root(&self) -> &Path {
		&self.root
	}

	/// The raw handshake result, unmodified.
	pub fn initialize_result(&self) -> &InitializeResult {
		&self.init
	}

	/// Negotiated server capabilities.
	pub fn capabilities(&self) -> &ServerCapabilities {
		&self.init.capabilities
	}

	/// The offset encoding negotiated with the server.
	pub fn offset_encoding(&self) -> OffsetEncoding {
		self.capabilities()
			.position_encoding
			.as_ref()
			.and_then(OffsetEncoding::from_lsp)
			.unwrap_or_default()
	}

	/// Lazy liveness check.
	///
	/// `true` when no process is attached (externally managed socket) or
	/// when the attached process has not exited. Existing holders of a dead
	/// connection will see their calls fail; new callers are shielded by the
	/// registry consulting this before returning a cached entry.
	pub fn is_alive(&self) -> bool {
		match &self.process {
			None => true,
			Some(child) => matches!(child.lock().try_wait(), Ok(None)),
		}
	}

	/// Requests unconditional termination of the spawned process, if any.
	///
	/// Idempotent and infallible; used by the shutdown hook.
	pub fn terminate(&self) {
		if let Some(child) = &self.process {
			let _ = child.lock().start_kill();
		}
	}

	/// Asks the server to shut down gracefully, then exit.
	pub async fn shutdown_and_exit(&self) -> Result<()> {
		self.proxy.request::<lsp_types::request::Shutdown>(()).await?;
		self.proxy.notify::<lsp_types::notification::Exit>(())
	}

	/// Document-scoped operations.
	pub fn documents(&self) -> DocumentApi<'_> {
		DocumentApi { conn: self }
	}

	/// Workspace-scoped operations.
	pub fn workspace(&self) -> WorkspaceApi<'_> {
		WorkspaceApi { conn: self }
	}

	pub(crate) fn proxy(&self) -> &RpcProxy {
		&self.proxy
	}
}

/// Typed document operations on one connection.
pub struct DocumentApi<'a> {
	conn: &'a Connection,
}

impl DocumentApi<'_> {
	/// Notifies the server that a document was opened.
	pub fn did_open(&self, uri: Uri, language_id: impl Into<String>, version: i32, text: String) -> Result<()> {
		self.conn
			.proxy
			.notify::<lsp_types::notification::DidOpenTextDocument>(lsp_types::DidOpenTextDocumentParams {
				text_document: lsp_types::TextDocumentItem {
					uri,
					language_id: language_id.into(),
					version,
					text,
				},
			})
	}

	/// Notifies the server of a full-content document change.
	pub fn did_change_full(&self, uri: Uri, version: i32, text: String) -> Result<()> {
		self.conn
			.proxy
			.notify::<lsp_types::notification::DidChangeTextDocument>(lsp_types::DidChangeTextDocumentParams {
				text_document: lsp_types::VersionedTextDocumentIdentifier { uri, version },
				content_changes: vec![lsp_types::TextDocumentContentChangeEvent {
					range: None,
					range_length: None,
					text,
				}],
			})
	}

	/// Notifies the server that a document was closed.
	pub fn did_close(&self, uri: Uri) -> Result<()> {
		self.conn
			.proxy
			.notify::<lsp_types::notification::DidCloseTextDocument>(lsp_types::DidCloseTextDocumentParams {
				text_document: lsp_types::TextDocumentIdentifier { uri },
			})
	}

	/// Requests the symbol tree for a document.
	pub async fn document_symbols(&self, uri: Uri) -> Result<Option<lsp_types::DocumentSymbolResponse>> {
		self.conn
			.proxy
			.request::<lsp_types::request::DocumentSymbolRequest>(lsp_types::DocumentSymbolParams {
				text_document: lsp_types::TextDocumentIdentifier { uri },
				work_done_progress_params: Default::default(),
				partial_result_params: Default::default(),
			})
			.await
	}

	/// Whether the server advertises document symbol support.
	pub fn supports_symbols(&self) -> bool {
		self.conn.capabilities().document_symbol_provider.is_some()
	}
}

/// Typed workspace operations on one connection.
pub struct WorkspaceApi<'a> {
	conn: &'a Connection,
}

impl WorkspaceApi<'_> {
	/// Invokes `workspace/executeCommand` and awaits the acknowledgement.
	pub async fn execute_command(
		&self,
		command: String,
		arguments: Vec<serde_json::Value>,
	) -> Result<Option<serde_json::Value>> {
		self.conn
			.proxy
			.request::<lsp_types::request::ExecuteCommand>(lsp_types::ExecuteCommandParams {
				command,
				arguments,
				work_done_progress_params: Default::default(),
			})
			.await
	}

	/// Whether the server advertises execute-command support.
	pub fn supports_execute_command(&self) -> bool {
		self.conn.capabilities().execute_command_provider.is_some()
	}
}
