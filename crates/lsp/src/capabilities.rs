//! Client capabilities declared during the handshake.

use lsp_types::{
	ClientCapabilities, DocumentSymbolClientCapabilities, GeneralClientCapabilities, PositionEncodingKind,
	TextDocumentClientCapabilities, WorkspaceClientCapabilities,
};

/// Builds the fixed capability set this client declares to every server.
///
/// The set is intentionally small: hierarchical document symbols, workspace
/// edits with document changes and file resource operations, and command
/// execution. Servers advertising more are free to; we only invoke what the
/// negotiated [`lsp_types::ServerCapabilities`] confirm.
pub fn client_capabilities() -> ClientCapabilities {
	ClientCapabilities {
		workspace: Some(WorkspaceClientCapabilities {
			apply_edit: Some(true),
			workspace_edit: Some(lsp_types::WorkspaceEditClientCapabilities {
				document_changes: Some(true),
				resource_operations: Some(vec![
					lsp_types::ResourceOperationKind::Create,
					lsp_types::ResourceOperationKind::Rename,
					lsp_types::ResourceOperationKind::Delete,
				]),
				failure_handling: Some(lsp_types::FailureHandlingKind::Abort),
				normalizes_line_endings: Some(false),
				change_annotation_support: None,
			}),
			execute_command: Some(lsp_types::DynamicRegistrationClientCapabilities {
				dynamic_registration: Some(false),
			}),
			workspace_folders: Some(true),
			..Default::default()
		}),
		text_document: Some(TextDocumentClientCapabilities {
			document_symbol: Some(DocumentSymbolClientCapabilities {
				hierarchical_document_symbol_support: Some(true),
				..Default::default()
			}),
			..Default::default()
		}),
		general: Some(GeneralClientCapabilities {
			position_encodings: Some(vec![
				PositionEncodingKind::UTF8,
				PositionEncodingKind::UTF32,
				PositionEncodingKind::UTF16,
			]),
			..Default::default()
		}),
		..Default::default()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn declares_hierarchical_symbols_and_resource_ops() {
		let caps = client_capabilities();
		let symbols = caps.text_document.unwrap().document_symbol.unwrap();
		assert_eq!(symbols.hierarchical_document_symbol_support, Some(true));

		let edit = caps.workspace.unwrap().workspace_edit.unwrap();
		assert_eq!(edit.document_changes, Some(true));
		let ops = edit.resource_operations.unwrap();
		assert!(ops.contains(&lsp_types::ResourceOperationKind::Create));
		assert!(ops.contains(&lsp_types::ResourceOperationKind::Rename));
		assert!(ops.contains(&lsp_types::ResourceOperationKind::Delete));
	}
}
