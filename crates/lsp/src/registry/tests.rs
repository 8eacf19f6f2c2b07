use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::*;
use crate::test_support::{FakeServer, MemoryDocumentStore, ScriptedProvider, StubProjectQuery};

fn registry_for(root: &str, mime: &str) -> Arc<BindingRegistry> {
	Arc::new(BindingRegistry::new(
		Arc::new(StubProjectQuery {
			root: PathBuf::from(root),
			mime: mime.to_owned(),
		}),
		Arc::new(MemoryDocumentStore::new()),
	))
}

#[tokio::test]
async fn resolve_singleflight() {
	let registry = registry_for("/proj", "text/x-rust");

	let gate = Arc::new(Notify::new());
	let mut provider = ScriptedProvider::new(FakeServer::default());
	provider.gate = Some(gate.clone());
	let entered = provider.entered.clone();
	let provider = Arc::new(provider);
	registry.register_provider("text/x-rust", provider.clone());

	let r1 = registry.clone();
	let r2 = registry.clone();
	let h1 = tokio::spawn(async move { r1.resolve(Path::new("/proj/src/main.rs")).await });

	// Wait for the leader to enter the provider.
	entered.notified().await;

	let h2 = tokio::spawn(async move { r2.resolve(Path::new("/proj/src/lib.rs")).await });

	// Give h2 a moment to surely be waiting on the watch channel.
	tokio::time::sleep(Duration::from_millis(50)).await;
	gate.notify_one();

	let (c1, c2) = tokio::join!(h1, h2);
	let c1 = c1.unwrap().unwrap().expect("first resolve bound");
	let c2 = c2.unwrap().unwrap().expect("second resolve bound");

	assert_eq!(provider.describe_count.load(Ordering::SeqCst), 1);
	assert!(Arc::ptr_eq(&c1, &c2));
}

#[tokio::test]
async fn repeated_resolve_reuses_cached_connection() {
	let registry = registry_for("/proj", "text/x-rust");
	let provider = Arc::new(ScriptedProvider::new(FakeServer::default()));
	registry.register_provider("text/x-rust", provider.clone());

	let c1 = registry.resolve(Path::new("/proj/a.rs")).await.unwrap().unwrap();
	let c2 = registry.resolve(Path::new("/proj/b.rs")).await.unwrap().unwrap();

	assert!(Arc::ptr_eq(&c1, &c2));
	assert_eq!(provider.describe_count.load(Ordering::SeqCst), 1);
	assert_eq!(registry.active_count(), 1);
}

#[tokio::test]
async fn declined_project_is_remembered() {
	let registry = registry_for("/proj", "text/x-rust");
	let declining = Arc::new(ScriptedProvider::declining());
	registry.register_provider("text/x-rust", declining.clone());

	assert!(registry.resolve(Path::new("/proj/a.rs")).await.unwrap().is_none());
	assert!(registry.resolve(Path::new("/proj/b.rs")).await.unwrap().is_none());
	// The sentinel answered the second resolution.
	assert_eq!(declining.describe_count.load(Ordering::SeqCst), 1);

	// A newly registered provider clears the sentinel.
	let working = Arc::new(ScriptedProvider::new(FakeServer::default()));
	registry.register_provider("text/x-rust", working.clone());

	let conn = registry.resolve(Path::new("/proj/a.rs")).await.unwrap();
	assert!(conn.is_some());
	assert_eq!(working.describe_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn providers_consulted_in_registration_order() {
	let registry = registry_for("/proj", "text/x-rust");
	let first = Arc::new(ScriptedProvider::declining());
	let second = Arc::new(ScriptedProvider::new(FakeServer::default()));
	registry.register_provider("text/x-rust", first.clone());
	registry.register_provider("text/x-rust", second.clone());

	let conn = registry.resolve(Path::new("/proj/a.rs")).await.unwrap();
	assert!(conn.is_some());
	assert_eq!(first.describe_count.load(Ordering::SeqCst), 1);
	assert_eq!(second.describe_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn file_outside_any_project_resolves_absent() {
	let registry = registry_for("/proj", "text/x-rust");
	let provider = Arc::new(ScriptedProvider::new(FakeServer::default()));
	registry.register_provider("text/x-rust", provider.clone());

	let conn = registry.resolve(Path::new("/elsewhere/a.rs")).await.unwrap();
	assert!(conn.is_none());
	assert_eq!(provider.describe_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn attached_workspace_shadows_project_binding() {
	let registry = registry_for("/proj", "text/x-rust");
	let provider = Arc::new(ScriptedProvider::new(FakeServer::default()));
	registry.register_provider("text/x-rust", provider.clone());

	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	tokio::spawn(async move {
		let (stream, _) = listener.accept().await.unwrap();
		let (read, write) = stream.into_split();
		FakeServer::default().spawn(read, write);
		// Keep the listener task alive for the duration of the test.
		std::future::pending::<()>().await;
	});

	let attached = registry
		.attach(PathBuf::from("/proj"), "127.0.0.1", port, vec!["rs".into()])
		.await
		.unwrap();

	// Covered file with a mapped extension resolves to the attachment
	// without ever consulting the providers.
	let conn = registry.resolve(Path::new("/proj/src/main.rs")).await.unwrap().unwrap();
	assert!(Arc::ptr_eq(&conn, &attached));
	assert_eq!(provider.describe_count.load(Ordering::SeqCst), 0);

	// An unmapped extension falls through to the project scope.
	let other = registry.resolve(Path::new("/proj/build.txt")).await.unwrap().unwrap();
	assert!(!Arc::ptr_eq(&other, &attached));
	assert_eq!(provider.describe_count.load(Ordering::SeqCst), 1);
}

/// Provider whose servers die immediately: streams from a fake server but a
/// process handle that has already exited.
struct DeadProcessProvider {
	describe_count: AtomicUsize,
}

#[async_trait]
impl LanguageServerProvider for DeadProcessProvider {
	async fn describe(&self, _project_root: &Path) -> Option<ServerDescriptor> {
		self.describe_count.fetch_add(1, Ordering::SeqCst);
		let (descriptor, _handle) = FakeServer::default().into_descriptor();
		let ServerDescriptor::Streams { reader, writer, .. } = descriptor else {
			unreachable!()
		};
		let child = tokio::process::Command::new("true").spawn().ok()?;
		Some(ServerDescriptor::Streams {
			reader,
			writer,
			process: Some(child),
		})
	}
}

#[cfg(unix)]
#[tokio::test]
async fn dead_connection_is_never_handed_out() {
	let registry = registry_for("/proj", "text/x-rust");
	let provider = Arc::new(DeadProcessProvider {
		describe_count: AtomicUsize::new(0),
	});
	registry.register_provider("text/x-rust", provider.clone());

	let conn = registry.resolve(Path::new("/proj/a.rs")).await.unwrap().unwrap();

	// `true` exits on its own; poll until the exit is observable.
	for _ in 0..100 {
		if !conn.is_alive() {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert!(!conn.is_alive());

	// The stale entry stays cached but is never handed out.
	assert!(registry.resolve(Path::new("/proj/a.rs")).await.unwrap().is_none());
	assert_eq!(provider.describe_count.load(Ordering::SeqCst), 1);

	// Explicit eviction re-opens the scope.
	assert_eq!(registry.evict_dead(), 1);
	let fresh = registry.resolve(Path::new("/proj/a.rs")).await.unwrap();
	assert!(fresh.is_some());
	assert_eq!(provider.describe_count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn finished_start_leaves_no_inflight_entry() {
	let registry = registry_for("/proj", "text/x-rust");
	let provider = Arc::new(ScriptedProvider::new(FakeServer::default()));
	registry.register_provider("text/x-rust", provider.clone());

	registry.resolve(Path::new("/proj/a.rs")).await.unwrap().unwrap();

	// The flight must be gone the moment resolve returns; a later caller
	// that joined it as a waiter would replay the old outcome and bypass
	// eviction and sentinel clearing.
	assert!(registry.inflight.lock().is_empty());

	// Back-to-back without a yield point: once the scope is re-opened the
	// next resolve must become a fresh leader and consult the provider
	// again.
	registry.shutdown_all().await;
	registry.resolve(Path::new("/proj/a.rs")).await.unwrap().unwrap();
	assert_eq!(provider.describe_count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn shutdown_all_is_idempotent() {
	let registry = registry_for("/proj", "text/x-rust");
	let provider = Arc::new(ScriptedProvider::new(FakeServer::default()));
	registry.register_provider("text/x-rust", provider.clone());

	registry.resolve(Path::new("/proj/a.rs")).await.unwrap().unwrap();
	assert_eq!(registry.active_count(), 1);

	registry.shutdown_all().await;
	assert_eq!(registry.active_count(), 0);
	registry.shutdown_all().await;
	assert_eq!(registry.active_count(), 0);

	let handle = provider.handles.lock()[0].clone();
	assert!(handle.methods().contains(&"shutdown".to_owned()));
	// `exit` is fire-and-forget; poll until the fake server has read it.
	for _ in 0..100 {
		if handle.count_of("exit") > 0 {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert_eq!(handle.count_of("exit"), 1);
}
