//! Language server binding manager.
//!
//! This crate discovers, launches, initializes, caches, and tears down
//! connections to external language-server processes, and multiplexes
//! per-file background analysis work across those connections.
//!
//! The central type is [`BindingRegistry`]: it resolves a file to its
//! [`Connection`], lazily creating one per scope key (project root + MIME
//! type, or an explicitly attached workspace root + file extension) with
//! single-flight semantics. [`BackgroundScheduler`] runs debounced analysis
//! closures against resolved connections on one dedicated worker, and
//! [`workspace_edit`] applies server-issued edit batches to open documents
//! atomically.
//!
//! External collaborators are injected at trait seams ([`provider`]): the
//! lookup that knows how to start a server for a MIME type, the query that
//! maps a file to its owning project, and the store of open documents.

use std::io;
use std::path::{Path, PathBuf};

/// Re-export of the [`lsp_types`] dependency of this crate.
pub use lsp_types;

pub mod actions;
mod capabilities;
pub mod connection;
mod handshake;
pub mod position;
pub mod provider;
pub mod registry;
pub mod scheduler;
pub mod transport;
mod wire;
pub mod workspace_edit;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use connection::{Connection, DocumentApi, OffsetEncoding, WorkspaceApi};
pub use provider::{Document, DocumentStore, LanguageServerProvider, ProjectContext, ProjectQuery};
pub use registry::{BindingConfig, BindingRegistry, ServerNotification};
pub use scheduler::{BackgroundScheduler, BackgroundTask};
pub use transport::ServerDescriptor;
pub use wire::{AnyNotification, AnyRequest, AnyResponse, RequestId, ResponseError};
pub use workspace_edit::{ApplyError, ApplyOutcome, apply_workspace_edit};

/// A convenient type alias for `Result` with `E` = [`enum@crate::Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Possible errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// The connection's I/O loop stopped.
	#[error("service stopped")]
	ServiceStopped,
	/// The peer replied an undecodable or invalid message.
	#[error("deserialization failed: {0}")]
	Deserialize(#[from] serde_json::Error),
	/// The peer replied an error.
	#[error("{0}")]
	Response(#[from] ResponseError),
	/// The peer violates the Language Server Protocol.
	#[error("protocol error: {0}")]
	Protocol(String),
	/// Input/output errors from the underlying channels.
	#[error("{0}")]
	Io(#[from] io::Error),
	/// The underlying channel reached EOF (end of file).
	#[error("the underlying channel reached EOF")]
	Eof,
	/// A language server process could not be spawned.
	#[error("failed to spawn {server}: {reason}")]
	ServerSpawn {
		/// Command that failed to start.
		server: String,
		/// Human-readable spawn failure.
		reason: String,
	},
	/// A request did not complete within its deadline.
	#[error("request timed out: {0}")]
	RequestTimeout(String),
	/// The outbound queue is full.
	#[error("outbound queue full")]
	Backpressure,
}

/// Converts a local filesystem path into a `file://` URI.
///
/// Percent-encodes reserved characters. Returns `None` for relative paths.
pub fn uri_from_path(path: &Path) -> Option<lsp_types::Uri> {
	let url = url::Url::from_file_path(path).ok()?;
	url.as_str().parse().ok()
}

/// Converts a `file://` URI back into a local filesystem path.
///
/// Returns `None` for non-`file` schemes or host-qualified URIs.
pub fn path_from_uri(uri: &lsp_types::Uri) -> Option<PathBuf> {
	url::Url::parse(uri.as_str()).ok()?.to_file_path().ok()
}
