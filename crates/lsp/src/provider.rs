//! Injected collaborator traits.
//!
//! The binding registry does not know how language servers are discovered,
//! how files map to projects, or what an open document looks like — those
//! are host concerns, injected at these seams so the registry stays
//! testable without global state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use lsp_types::Uri;
use ropey::Rope;

use crate::transport::ServerDescriptor;

/// Where a file lives: its owning project root and MIME type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProjectContext {
	/// Root folder of the owning project; also the handshake root.
	pub root: PathBuf,
	/// MIME type of the file (e.g. `text/x-rust`).
	pub mime: String,
}

/// Maps a file to its owning project and MIME type.
///
/// Returning `None` means resolution is impossible for this file; the
/// registry reports the file as unbound without error.
pub trait ProjectQuery: Send + Sync {
	/// Locates the project context for `file`.
	fn locate(&self, file: &Path) -> Option<ProjectContext>;
}

/// Knows how to start a language server for the projects it covers.
///
/// Providers are registered per MIME type in declaration order; the first
/// one returning a descriptor wins. A provider may decline a particular
/// project by returning `None`.
#[async_trait]
pub trait LanguageServerProvider: Send + Sync {
	/// Describes a server for the given project root, or declines.
	async fn describe(&self, project_root: &Path) -> Option<ServerDescriptor>;
}

/// Error raised when a document rejects an atomic content swap.
#[derive(Debug, thiserror::Error)]
#[error("document commit failed: {0}")]
pub struct CommitError(pub String);

/// An open in-memory document.
///
/// Snapshots are cheap (`ropey` ropes are persistent), and [`commit`]
/// replaces the visible content in one step: a concurrent reader observes
/// either the old text or the new text, never a partial application.
///
/// [`commit`]: Document::commit
pub trait Document: Send + Sync {
	/// The document's URI.
	fn uri(&self) -> Uri;
	/// A snapshot of the current content.
	fn text(&self) -> Rope;
	/// Atomically replaces the content.
	fn commit(&self, text: Rope) -> Result<(), CommitError>;
}

/// Lookup of open documents by URI.
pub trait DocumentStore: Send + Sync {
	/// Returns the open document for `uri`, if any.
	///
	/// Documents that are not open are simply absent — workspace edits for
	/// them are skipped, per the LSP convention that edits apply only to
	/// known-open documents.
	fn open_document(&self, uri: &Uri) -> Option<Arc<dyn Document>>;
}
