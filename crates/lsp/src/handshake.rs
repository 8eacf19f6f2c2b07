//! The `initialize` handshake that precedes every other LSP operation.

use std::path::Path;

use lsp_types::{ClientInfo, InitializeParams, InitializeResult, WorkspaceFolder};

use crate::capabilities::client_capabilities;
use crate::wire::RpcProxy;
use crate::{Result, uri_from_path};

/// Performs the `initialize` request/response exchange rooted at `root`.
///
/// Sends the fixed client capability set and awaits the response under the
/// proxy's deadline; on success the `initialized` notification is sent
/// before returning. The raw [`InitializeResult`] is handed back unmodified
/// so callers can inspect optional server capabilities later.
///
/// A timeout or transport failure abandons the handshake; the caller must
/// not cache anything for this attempt.
pub(crate) async fn initialize(proxy: &RpcProxy, root: &Path) -> Result<InitializeResult> {
	let root_uri = uri_from_path(root);

	#[allow(deprecated, reason = "root_path is deprecated but some servers still require it")]
	let params = InitializeParams {
		process_id: Some(std::process::id()),
		root_path: root.to_str().map(String::from),
		root_uri: root_uri.clone(),
		workspace_folders: root_uri.map(|uri| {
			vec![WorkspaceFolder {
				name: root
					.file_name()
					.map(|n| n.to_string_lossy().into_owned())
					.unwrap_or_else(|| "workspace".into()),
				uri,
			}]
		}),
		initialization_options: None,
		capabilities: client_capabilities(),
		trace: None,
		client_info: Some(ClientInfo {
			name: String::from("vellum"),
			version: Some(String::from(env!("CARGO_PKG_VERSION"))),
		}),
		locale: None,
		work_done_progress_params: Default::default(),
	};

	let result = proxy.request::<lsp_types::request::Initialize>(params).await?;

	proxy.notify::<lsp_types::notification::Initialized>(lsp_types::InitializedParams {})?;
	tracing::debug!(
		server = result.server_info.as_ref().map(|i| i.name.as_str()).unwrap_or("unknown"),
		root = %root.display(),
		"language server initialized"
	);

	Ok(result)
}
