//! Workspace edit application.
//!
//! Consumes a server-issued [`WorkspaceEdit`] and applies it to open
//! documents, one atomic mutation per document. Application is best-effort
//! across documents: an entry whose document is not open is skipped, and a
//! failure in one document does not abort the others.
//!
//! Edits are normalized to character offsets against a single snapshot of
//! the document and replayed from the **highest** end offset to the lowest,
//! so earlier replacements cannot shift the coordinates of later ones. The
//! rewritten rope is committed in one step; a failed commit leaves the
//! document exactly as it was.

use std::collections::HashMap;

use lsp_types::{DocumentChanges, OneOf, TextEdit, Uri, WorkspaceEdit};
use ropey::Rope;
use thiserror::Error;

use crate::connection::OffsetEncoding;
use crate::position::lsp_position_to_char;
use crate::provider::{CommitError, Document, DocumentStore};

/// Per-document failure during workspace edit application.
#[derive(Debug, Error)]
pub enum ApplyError {
	/// An edit range could not be mapped to character offsets.
	#[error("failed to convert edit range for {0}")]
	RangeConversionFailed(String),
	/// Two edits target overlapping regions of the same document.
	#[error("overlapping edits for {0}")]
	OverlappingEdits(String),
	/// The document rejected the atomic content swap.
	#[error(transparent)]
	Commit(#[from] CommitError),
}

/// Summary of a workspace edit application.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
	/// Documents whose edits were fully applied.
	pub applied: usize,
	/// Entries skipped because the document is not open or the operation is
	/// not a text edit.
	pub skipped: usize,
	/// Documents whose edits failed; their content is unchanged.
	pub failed: usize,
}

impl ApplyOutcome {
	/// `true` when nothing failed (skipped entries are not failures).
	pub fn is_clean(&self) -> bool {
		self.failed == 0
	}
}

/// A single text replacement expressed in character offsets.
struct PlannedEdit {
	start: usize,
	end: usize,
	replacement: String,
}

/// Applies a server-issued edit batch to the open documents in `store`.
///
/// Both the legacy `changes` map and `documentChanges` edits are honored;
/// resource operations (create/rename/delete) are skipped with a log entry.
pub fn apply_workspace_edit(store: &dyn DocumentStore, edit: &WorkspaceEdit, encoding: OffsetEncoding) -> ApplyOutcome {
	let mut outcome = ApplyOutcome::default();
	let mut per_uri: HashMap<String, (Uri, Vec<TextEdit>)> = HashMap::new();

	if let Some(changes) = &edit.changes {
		for (uri, edits) in changes {
			per_uri
				.entry(uri.to_string())
				.or_insert_with(|| (uri.clone(), Vec::new()))
				.1
				.extend(edits.iter().cloned());
		}
	}

	match &edit.document_changes {
		Some(DocumentChanges::Edits(edits)) => {
			for doc_edit in edits {
				collect_document_edit(doc_edit, &mut per_uri);
			}
		}
		Some(DocumentChanges::Operations(ops)) => {
			for op in ops {
				match op {
					lsp_types::DocumentChangeOperation::Edit(doc_edit) => {
						collect_document_edit(doc_edit, &mut per_uri);
					}
					lsp_types::DocumentChangeOperation::Op(_) => {
						tracing::warn!("skipping unsupported resource operation in workspace edit");
						outcome.skipped += 1;
					}
				}
			}
		}
		None => {}
	}

	for (_, (uri, edits)) in per_uri {
		let Some(doc) = store.open_document(&uri) else {
			tracing::debug!(uri = %uri.as_str(), "workspace edit targets a document that is not open; skipping");
			outcome.skipped += 1;
			continue;
		};
		match apply_document_edits(&*doc, &uri, &edits, encoding) {
			Ok(()) => outcome.applied += 1,
			Err(e) => {
				tracing::warn!(uri = %uri.as_str(), error = %e, "workspace edit failed for document");
				outcome.failed += 1;
			}
		}
	}

	outcome
}

fn collect_document_edit(doc_edit: &lsp_types::TextDocumentEdit, per_uri: &mut HashMap<String, (Uri, Vec<TextEdit>)>) {
	let uri = &doc_edit.text_document.uri;
	let entry = per_uri
		.entry(uri.to_string())
		.or_insert_with(|| (uri.clone(), Vec::new()));
	for edit in &doc_edit.edits {
		match edit {
			OneOf::Left(text_edit) => entry.1.push(text_edit.clone()),
			OneOf::Right(annotated) => entry.1.push(annotated.text_edit.clone()),
		}
	}
}

/// Applies all edits for one document as a single atomic mutation.
fn apply_document_edits(doc: &dyn Document, uri: &Uri, edits: &[TextEdit], encoding: OffsetEncoding) -> Result<(), ApplyError> {
	if edits.is_empty() {
		return Ok(());
	}

	let snapshot = doc.text();
	let mut planned = Vec::with_capacity(edits.len());
	for edit in edits {
		let start = lsp_position_to_char(&snapshot, edit.range.start, encoding)
			.ok_or_else(|| ApplyError::RangeConversionFailed(uri.to_string()))?;
		let end = lsp_position_to_char(&snapshot, edit.range.end, encoding)
			.ok_or_else(|| ApplyError::RangeConversionFailed(uri.to_string()))?;
		if start > end {
			return Err(ApplyError::RangeConversionFailed(uri.to_string()));
		}
		planned.push(PlannedEdit {
			start,
			end,
			replacement: edit.new_text.clone(),
		});
	}

	// Highest end offset first: replacements can no longer shift the
	// coordinates of edits that come after them in application order.
	planned.sort_by(|a, b| b.end.cmp(&a.end).then(b.start.cmp(&a.start)));
	for pair in planned.windows(2) {
		if pair[1].end > pair[0].start {
			return Err(ApplyError::OverlappingEdits(uri.to_string()));
		}
	}

	let mut rewritten: Rope = snapshot.clone();
	for edit in &planned {
		rewritten.remove(edit.start..edit.end);
		if !edit.replacement.is_empty() {
			rewritten.insert(edit.start, &edit.replacement);
		}
	}

	doc.commit(rewritten)?;
	Ok(())
}
