//! End-to-end tests over in-memory duplex pipes with a scripted fake
//! server: handshake contents, server-initiated edit requests, and code
//! action execution.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use vellum_lsp::lsp_types::{
	CodeAction, CodeActionOrCommand, Command, Position, Range, TextEdit, Uri, WorkspaceEdit,
};
use vellum_lsp::test_support::{FakeServer, MemoryDocumentStore, ScriptedProvider, StubProjectQuery};
use vellum_lsp::{BindingRegistry, Error, LanguageServerProvider, ServerDescriptor, actions};

fn new_registry(store: Arc<MemoryDocumentStore>) -> Arc<BindingRegistry> {
	let _ = tracing_subscriber::fmt().with_test_writer().try_init();
	Arc::new(BindingRegistry::new(
		Arc::new(StubProjectQuery {
			root: PathBuf::from("/proj"),
			mime: "text/x-rust".to_owned(),
		}),
		store,
	))
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
	for _ in 0..200 {
		if condition() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("condition not met within deadline");
}

#[tokio::test]
async fn resolve_performs_full_handshake() {
	let store = Arc::new(MemoryDocumentStore::new());
	let registry = new_registry(store);
	let provider = Arc::new(ScriptedProvider::new(FakeServer::default()));
	registry.register_provider("text/x-rust", provider.clone());

	let conn = registry
		.resolve(Path::new("/proj/src/main.rs"))
		.await
		.unwrap()
		.expect("binding established");

	assert_eq!(conn.name(), "text/x-rust");
	assert_eq!(conn.root(), Path::new("/proj"));
	assert!(conn.documents().supports_symbols());
	assert!(conn.workspace().supports_execute_command());

	let handle = provider.handles.lock()[0].clone();
	let init = handle.params_of("initialize").expect("initialize sent");
	assert_eq!(init["rootUri"], "file:///proj");
	assert_eq!(init["processId"], json!(std::process::id()));
	assert_eq!(init["capabilities"]["workspace"]["applyEdit"], json!(true));

	// `initialized` is fire-and-forget and follows the response.
	wait_for(|| handle.count_of("initialized") == 1).await;
}

#[tokio::test]
async fn server_issued_edit_is_applied_and_answered() {
	let store = Arc::new(MemoryDocumentStore::new());
	let uri: Uri = "file:///proj/src/main.rs".parse().unwrap();
	let doc = store.insert(uri, "fn main() {}\n");

	let registry = new_registry(store);
	let provider = Arc::new(ScriptedProvider::new(FakeServer::default()));
	registry.register_provider("text/x-rust", provider.clone());
	registry.resolve(Path::new("/proj/src/main.rs")).await.unwrap().unwrap();

	let handle = provider.handles.lock()[0].clone();
	handle.send_request(
		"workspace/applyEdit",
		json!({
			"label": "rename main",
			"edit": {
				"changes": {
					"file:///proj/src/main.rs": [{
						"range": {
							"start": { "line": 0, "character": 3 },
							"end": { "line": 0, "character": 7 },
						},
						"newText": "run",
					}],
				},
			},
		}),
	);

	wait_for(|| !handle.client_responses().is_empty()).await;
	assert_eq!(doc.contents(), "fn run() {}\n");
	let resp = handle.client_responses().remove(0);
	assert_eq!(resp["result"]["applied"], json!(true));
}

#[tokio::test]
async fn unhandled_server_request_is_rejected() {
	let store = Arc::new(MemoryDocumentStore::new());
	let registry = new_registry(store);
	let provider = Arc::new(ScriptedProvider::new(FakeServer::default()));
	registry.register_provider("text/x-rust", provider.clone());
	registry.resolve(Path::new("/proj/src/main.rs")).await.unwrap().unwrap();

	let handle = provider.handles.lock()[0].clone();
	handle.send_request("window/showMessageRequest", json!({ "type": 1, "message": "?" }));

	wait_for(|| !handle.client_responses().is_empty()).await;
	let resp = handle.client_responses().remove(0);
	assert_eq!(resp["error"]["code"], json!(-32601));
}

#[tokio::test]
async fn request_id_beyond_32_bits_is_echoed_back() {
	let store = Arc::new(MemoryDocumentStore::new());
	let registry = new_registry(store);
	let provider = Arc::new(ScriptedProvider::new(FakeServer::default()));
	registry.register_provider("text/x-rust", provider.clone());
	registry.resolve(Path::new("/proj/src/main.rs")).await.unwrap().unwrap();

	// Some servers hand out 64-bit request ids; the reply must carry the id
	// verbatim or the server cannot correlate it.
	let id = i64::from(i32::MAX) + 7;
	let handle = provider.handles.lock()[0].clone();
	handle.send_request_with_id(id, "window/showMessageRequest", json!({ "type": 1, "message": "?" }));

	wait_for(|| !handle.client_responses().is_empty()).await;
	let resp = handle.client_responses().remove(0);
	assert_eq!(resp["id"], json!(id));
	assert_eq!(resp["error"]["code"], json!(-32601));
}

#[tokio::test]
async fn code_action_applies_edit_then_runs_command() {
	let store = Arc::new(MemoryDocumentStore::new());
	let uri: Uri = "file:///proj/src/lib.rs".parse().unwrap();
	let doc = store.insert(uri.clone(), "old\n");

	let registry = new_registry(store.clone());
	let provider = Arc::new(ScriptedProvider::new(FakeServer::default()));
	registry.register_provider("text/x-rust", provider.clone());
	let conn = registry.resolve(Path::new("/proj/src/lib.rs")).await.unwrap().unwrap();

	let mut changes = HashMap::new();
	changes.insert(
		uri,
		vec![TextEdit {
			range: Range {
				start: Position::new(0, 0),
				end: Position::new(0, 3),
			},
			new_text: "new".to_owned(),
		}],
	);
	let action = CodeActionOrCommand::CodeAction(CodeAction {
		title: "fix it".to_owned(),
		edit: Some(WorkspaceEdit {
			changes: Some(changes),
			..Default::default()
		}),
		command: Some(Command {
			title: "fix it".to_owned(),
			command: "demo.fix".to_owned(),
			arguments: Some(vec![json!("arg")]),
		}),
		..Default::default()
	});

	actions::execute_code_action(&conn, store.as_ref(), action).await;

	assert_eq!(doc.contents(), "new\n");
	let handle = provider.handles.lock()[0].clone();
	let params = handle.params_of("workspace/executeCommand").expect("command forwarded");
	assert_eq!(params["command"], json!("demo.fix"));
	assert_eq!(params["arguments"], json!(["arg"]));
}

#[tokio::test]
async fn bare_command_action_skips_edit_phase() {
	let store = Arc::new(MemoryDocumentStore::new());
	let registry = new_registry(store.clone());
	let provider = Arc::new(ScriptedProvider::new(FakeServer::default()));
	registry.register_provider("text/x-rust", provider.clone());
	let conn = registry.resolve(Path::new("/proj/src/lib.rs")).await.unwrap().unwrap();

	let action = CodeActionOrCommand::Command(Command {
		title: "reload".to_owned(),
		command: "demo.reload".to_owned(),
		arguments: None,
	});
	actions::execute_code_action(&conn, store.as_ref(), action).await;

	let handle = provider.handles.lock()[0].clone();
	assert_eq!(handle.params_of("workspace/executeCommand").unwrap()["command"], json!("demo.reload"));
}

#[tokio::test]
async fn failing_command_is_swallowed() {
	let store = Arc::new(MemoryDocumentStore::new());
	let registry = new_registry(store.clone());
	let mut server = FakeServer::default();
	server.fail_execute_command = true;
	let provider = Arc::new(ScriptedProvider::new(server));
	registry.register_provider("text/x-rust", provider.clone());
	let conn = registry.resolve(Path::new("/proj/src/lib.rs")).await.unwrap().unwrap();

	// Must not panic or propagate; the failure is logged only.
	let action = CodeActionOrCommand::Command(Command {
		title: "broken".to_owned(),
		command: "demo.broken".to_owned(),
		arguments: None,
	});
	actions::execute_code_action(&conn, store.as_ref(), action).await;

	let handle = provider.handles.lock()[0].clone();
	assert_eq!(handle.count_of("workspace/executeCommand"), 1);
}

#[tokio::test]
async fn server_notifications_reach_the_subscriber() {
	let store = Arc::new(MemoryDocumentStore::new());
	let registry = new_registry(store);
	let mut notifications = registry.subscribe_notifications();
	let provider = Arc::new(ScriptedProvider::new(FakeServer::default()));
	registry.register_provider("text/x-rust", provider.clone());
	registry.resolve(Path::new("/proj/src/main.rs")).await.unwrap().unwrap();

	let handle = provider.handles.lock()[0].clone();
	handle.send_notification(
		"textDocument/publishDiagnostics",
		json!({ "uri": "file:///proj/src/main.rs", "diagnostics": [] }),
	);

	let forwarded = tokio::time::timeout(Duration::from_secs(2), notifications.recv())
		.await
		.expect("notification forwarded")
		.unwrap();
	assert_eq!(forwarded.server, "text/x-rust");
	assert_eq!(forwarded.method, "textDocument/publishDiagnostics");
	assert_eq!(forwarded.params["uri"], json!("file:///proj/src/main.rs"));
}

struct BrokenProvider {
	describe_count: AtomicUsize,
}

#[async_trait]
impl LanguageServerProvider for BrokenProvider {
	async fn describe(&self, _project_root: &Path) -> Option<ServerDescriptor> {
		self.describe_count.fetch_add(1, Ordering::SeqCst);
		Some(ServerDescriptor::Command {
			command: "/nonexistent/language-server".to_owned(),
			args: Vec::new(),
			env: HashMap::new(),
			cwd: None,
		})
	}
}

#[tokio::test]
async fn spawn_failure_is_returned_and_never_cached() {
	// A real directory as project root so the spawn fails on the missing
	// binary, not on the working directory.
	let dir = tempfile::tempdir().unwrap();
	let root = dir.path().to_path_buf();
	let file = root.join("a.rs");

	let registry = Arc::new(BindingRegistry::new(
		Arc::new(StubProjectQuery {
			root,
			mime: "text/x-rust".to_owned(),
		}),
		Arc::new(MemoryDocumentStore::new()),
	));
	let provider = Arc::new(BrokenProvider {
		describe_count: AtomicUsize::new(0),
	});
	registry.register_provider("text/x-rust", provider.clone());

	let err = registry.resolve(&file).await.unwrap_err();
	assert!(matches!(err, Error::ServerSpawn { .. }), "got {err:?}");

	// The failure is not cached; the provider is consulted again.
	let _ = registry.resolve(&file).await.unwrap_err();
	assert_eq!(provider.describe_count.load(Ordering::SeqCst), 2);
}
