//! Code action execution.
//!
//! A code action from a server can carry a workspace edit, a command, or
//! both. The edit is applied first, then the command is forwarded back to
//! the server. Failures in either half are logged rather than propagated;
//! an edit that failed does not suppress the command.

use std::sync::Arc;

use lsp_types::{CodeAction, CodeActionOrCommand, Command};

use crate::connection::Connection;
use crate::provider::DocumentStore;
use crate::workspace_edit::apply_workspace_edit;

/// Executes a resolved code action against the given connection.
pub async fn execute_code_action(conn: &Arc<Connection>, store: &dyn DocumentStore, action: CodeActionOrCommand) {
	match action {
		CodeActionOrCommand::Command(command) => run_command(conn, command).await,
		CodeActionOrCommand::CodeAction(CodeAction { title, edit, command, .. }) => {
			if let Some(edit) = edit {
				let outcome = apply_workspace_edit(store, &edit, conn.offset_encoding());
				if !outcome.is_clean() {
					tracing::warn!(
						action = %title,
						failed = outcome.failed,
						"code action edit applied partially"
					);
				}
			}
			if let Some(command) = command {
				run_command(conn, command).await;
			}
		}
	}
}

async fn run_command(conn: &Arc<Connection>, command: Command) {
	if !conn.workspace().supports_execute_command() {
		tracing::warn!(server = conn.name(), command = %command.command, "server does not support executeCommand");
		return;
	}
	let args = command.arguments.unwrap_or_default();
	if let Err(e) = conn.workspace().execute_command(command.command.clone(), args).await {
		tracing::warn!(server = conn.name(), command = %command.command, error = %e, "executeCommand failed");
	}
}
