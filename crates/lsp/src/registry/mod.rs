//! Binding registry.
//!
//! Maps files to live server connections through two scopes: explicit
//! workspace-root attachments (keyed by root and file extension) and lazily
//! started project bindings (keyed by project root and MIME type). Workspace
//! attachments shadow project bindings for every file they cover.
//!
//! Project bindings are created on first resolution with a singleflight
//! protocol so concurrent callers for the same key share one server start.
//! A project the providers decline is remembered with a sentinel so the
//! providers are not asked again; registering a new provider for that MIME
//! type clears the matching sentinels.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lsp_types::request::{ApplyWorkspaceEdit, Request as _};
use lsp_types::{ApplyWorkspaceEditParams, ApplyWorkspaceEditResponse};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::provider::{DocumentStore, LanguageServerProvider, ProjectQuery};
use crate::transport::ServerDescriptor;
use crate::wire::{AnyRequest, ConnectionEvent, ResponseError};
use crate::workspace_edit::apply_workspace_edit;
use crate::{Error, Result};

/// Registry-wide tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingConfig {
	/// Request and handshake timeout in seconds.
	#[serde(default = "default_timeout")]
	pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
	30
}

impl Default for BindingConfig {
	fn default() -> Self {
		Self {
			timeout_secs: default_timeout(),
		}
	}
}

/// Project scope key: `(project_root, mime_type)`.
type ProjectKey = (PathBuf, String);

/// What the registry knows about one project scope.
enum ProjectScope {
	/// A connection was established for this scope.
	Bound(Arc<Connection>),
	/// Every provider declined this project; do not ask again.
	NoProvider,
}

/// Both scope maps under one lock so lookups observe a consistent view.
#[derive(Default)]
struct RegistryState {
	projects: HashMap<ProjectKey, ProjectScope>,
	/// Workspace root -> file extension -> connection.
	workspaces: HashMap<PathBuf, HashMap<String, Arc<Connection>>>,
}

/// Shared outcome of one server start, published to singleflight waiters.
type StartOutcome = Result<Option<Arc<Connection>>>;

/// Tracking state for a server start in progress.
struct InFlightStart {
	tx: watch::Sender<Option<Arc<StartOutcome>>>,
	rx: watch::Receiver<Option<Arc<StartOutcome>>>,
}

/// A notification received from some server, forwarded to the host.
#[derive(Debug)]
pub struct ServerNotification {
	/// Name of the originating connection.
	pub server: String,
	/// LSP method name.
	pub method: String,
	/// Raw notification parameters.
	pub params: JsonValue,
}

type NotificationSink = Arc<RwLock<Option<mpsc::UnboundedSender<ServerNotification>>>>;

/// Registry of file-to-server bindings.
///
/// All collaborators are injected; the registry holds no global state and
/// several instances can coexist in one process.
///
/// # Concurrency
///
/// - `providers` and `state`: `parking_lot::RwLock`, read-heavy.
/// - `inflight`: sync `Mutex` gate ensuring one server start per project
///   key across all concurrent resolvers; never held across an await.
pub struct BindingRegistry {
	query: Arc<dyn ProjectQuery>,
	store: Arc<dyn DocumentStore>,
	providers: RwLock<HashMap<String, Vec<Arc<dyn LanguageServerProvider>>>>,
	state: RwLock<RegistryState>,
	inflight: Arc<Mutex<HashMap<ProjectKey, Arc<InFlightStart>>>>,
	notifications: NotificationSink,
	timeout: Duration,
}

impl BindingRegistry {
	/// Creates a registry with default configuration.
	pub fn new(query: Arc<dyn ProjectQuery>, store: Arc<dyn DocumentStore>) -> Self {
		Self::with_config(query, store, BindingConfig::default())
	}

	/// Creates a registry with the given configuration.
	pub fn with_config(query: Arc<dyn ProjectQuery>, store: Arc<dyn DocumentStore>, config: BindingConfig) -> Self {
		Self {
			query,
			store,
			providers: RwLock::new(HashMap::new()),
			state: RwLock::new(RegistryState::default()),
			inflight: Arc::new(Mutex::new(HashMap::new())),
			notifications: Arc::new(RwLock::new(None)),
			timeout: Duration::from_secs(config.timeout_secs),
		}
	}

	/// Registers a provider for a MIME type. Providers are consulted in
	/// registration order; the first to produce a descriptor wins.
	///
	/// Projects previously remembered as having no provider for this MIME
	/// type are forgotten so the new provider gets a chance on the next
	/// resolution.
	pub fn register_provider(&self, mime: impl Into<String>, provider: Arc<dyn LanguageServerProvider>) {
		let mime = mime.into();
		self.providers.write().entry(mime.clone()).or_default().push(provider);
		self.state
			.write()
			.projects
			.retain(|(_, m), scope| !(*m == mime && matches!(scope, ProjectScope::NoProvider)));
	}

	/// Subscribes to notifications from all current and future connections.
	///
	/// Only one subscriber is supported; a later call replaces the earlier
	/// sink.
	pub fn subscribe_notifications(&self) -> mpsc::UnboundedReceiver<ServerNotification> {
		let (tx, rx) = mpsc::unbounded_channel();
		*self.notifications.write() = Some(tx);
		rx
	}

	/// Resolves the connection responsible for `file`, starting a server on
	/// first use.
	///
	/// Returns `Ok(None)` when the file is outside any known scope, its
	/// project cannot be determined, every provider declines, or the cached
	/// connection's process has exited. Transport and handshake failures are
	/// returned as errors and never cached, so the next resolution retries.
	///
	/// # Singleflight protocol
	///
	/// 1. Fast path: a cached scope answers without locking the gate.
	/// 2. Leader election: the first caller for a key becomes leader, the
	///    rest become waiters on a `watch` channel.
	/// 3. The leader consults providers, starts the server, removes the
	///    inflight entry, then publishes the shared outcome — in that
	///    order, so a caller arriving after completion never joins a
	///    finished flight.
	/// 4. Waiters receive the outcome directly.
	pub async fn resolve(&self, file: &Path) -> Result<Option<Arc<Connection>>> {
		// Workspace attachments shadow project bindings for covered files,
		// but only when the file's extension is actually mapped.
		if let Some(conn) = self.lookup_workspace(file) {
			if conn.is_alive() {
				return Ok(Some(conn));
			}
			debug!(server = conn.name(), file = %file.display(), "attached server is dead");
			return Ok(None);
		}

		let Some(ctx) = self.query.locate(file) else {
			return Ok(None);
		};
		let key: ProjectKey = (ctx.root, ctx.mime);

		// 1. Fast path
		if let Some(cached) = self.lookup_project(&key) {
			return Ok(cached);
		}

		// 2. Leader election
		let (inflight, is_leader) = {
			let mut inflight_map = self.inflight.lock();
			if let Some(f) = inflight_map.get(&key) {
				(f.clone(), false)
			} else {
				let (tx, rx) = watch::channel(None);
				let f = Arc::new(InFlightStart { tx, rx });
				inflight_map.insert(key.clone(), f.clone());
				(f, true)
			}
		};

		if !is_leader {
			// 4. Wait for the leader's outcome.
			let mut rx = inflight.rx.clone();
			loop {
				let outcome = rx.borrow().clone();
				if let Some(outcome) = outcome {
					return match outcome.as_ref() {
						Ok(conn) => Ok(conn.clone()),
						Err(e) => Err(Error::Protocol(e.to_string())),
					};
				}
				if rx.changed().await.is_err() {
					return Err(Error::Protocol("server start aborted (leader dropped)".into()));
				}
			}
		}

		// 3. Leader work
		let guard = StartGuard::new(key.clone(), self.inflight.clone(), inflight);

		// Re-check after winning the election; a previous leader may have
		// populated the scope between our fast path and now.
		if let Some(cached) = self.lookup_project(&key) {
			return guard.complete(Ok(cached));
		}

		let outcome = self.start_binding(&key).await;
		guard.complete(outcome)
	}

	/// Attaches an externally managed server over TCP and binds it to every
	/// given extension under `root`.
	///
	/// Unlike project resolution, attach failures surface directly to the
	/// caller; there is a human on the other end who typed the address.
	pub async fn attach(&self, root: PathBuf, host: &str, port: u16, extensions: Vec<String>) -> Result<Arc<Connection>> {
		let descriptor = ServerDescriptor::Socket {
			host: host.to_owned(),
			port,
		};
		let name = format!("{host}:{port}");
		info!(server = %name, root = %root.display(), "attaching workspace server");

		let (conn, events) = Connection::establish(name, &root, descriptor, self.timeout).await?;
		self.spawn_event_router(conn.clone(), events);

		let mut state = self.state.write();
		let bindings = state.workspaces.entry(root).or_default();
		for ext in extensions {
			bindings.insert(ext, conn.clone());
		}
		Ok(conn)
	}

	/// Drops every cached binding whose process has exited, allowing the
	/// next resolution to start fresh. Returns the number of evicted
	/// entries.
	pub fn evict_dead(&self) -> usize {
		let mut state = self.state.write();
		let mut evicted = 0;
		state.projects.retain(|_, scope| match scope {
			ProjectScope::Bound(conn) if !conn.is_alive() => {
				evicted += 1;
				false
			}
			_ => true,
		});
		for bindings in state.workspaces.values_mut() {
			bindings.retain(|_, conn| {
				let alive = conn.is_alive();
				if !alive {
					evicted += 1;
				}
				alive
			});
		}
		state.workspaces.retain(|_, bindings| !bindings.is_empty());
		evicted
	}

	/// Number of live bound connections across both scopes.
	pub fn active_count(&self) -> usize {
		let state = self.state.read();
		let projects = state
			.projects
			.values()
			.filter(|s| matches!(s, ProjectScope::Bound(_)))
			.count();
		let workspaces: usize = state.workspaces.values().map(HashMap::len).sum();
		projects + workspaces
	}

	/// Shuts down every connection: a graceful shutdown request with a short
	/// deadline, then unconditional process termination.
	///
	/// Idempotent and infallible; meant to be called once from the host's
	/// stop hook.
	pub async fn shutdown_all(&self) {
		let connections: Vec<Arc<Connection>> = {
			let mut state = self.state.write();
			let mut unique: Vec<Arc<Connection>> = Vec::new();
			let push = |conn: Arc<Connection>, unique: &mut Vec<Arc<Connection>>| {
				if !unique.iter().any(|c| Arc::ptr_eq(c, &conn)) {
					unique.push(conn);
				}
			};
			for (_, scope) in state.projects.drain() {
				if let ProjectScope::Bound(conn) = scope {
					push(conn, &mut unique);
				}
			}
			for (_, bindings) in state.workspaces.drain() {
				for (_, conn) in bindings {
					push(conn, &mut unique);
				}
			}
			unique
		};

		for conn in connections {
			match tokio::time::timeout(Duration::from_secs(2), conn.shutdown_and_exit()).await {
				Ok(Ok(())) => debug!(server = conn.name(), "server shut down gracefully"),
				Ok(Err(e)) => debug!(server = conn.name(), error = %e, "graceful shutdown failed"),
				Err(_) => debug!(server = conn.name(), "graceful shutdown timed out"),
			}
			conn.terminate();
			info!(server = conn.name(), "connection closed");
		}
	}

	fn lookup_workspace(&self, file: &Path) -> Option<Arc<Connection>> {
		let ext = file.extension()?.to_str()?;
		let state = self.state.read();
		// Deepest covering root with a mapping for this extension wins.
		state
			.workspaces
			.iter()
			.filter(|(root, bindings)| file.starts_with(root) && bindings.contains_key(ext))
			.max_by_key(|(root, _)| root.components().count())
			.map(|(_, bindings)| bindings[ext].clone())
	}

	/// Cached project scope answer, if any. `Some(None)` means the scope is
	/// known and resolves to nothing (declined, or bound but dead).
	fn lookup_project(&self, key: &ProjectKey) -> Option<Option<Arc<Connection>>> {
		let state = self.state.read();
		match state.projects.get(key) {
			Some(ProjectScope::Bound(conn)) if conn.is_alive() => Some(Some(conn.clone())),
			Some(ProjectScope::Bound(conn)) => {
				debug!(server = conn.name(), "cached connection is dead");
				Some(None)
			}
			Some(ProjectScope::NoProvider) => Some(None),
			None => None,
		}
	}

	async fn start_binding(&self, key: &ProjectKey) -> StartOutcome {
		let (root, mime) = key;
		let providers = self.providers.read().get(mime).cloned().unwrap_or_default();

		let mut descriptor = None;
		for provider in providers {
			if let Some(d) = provider.describe(root).await {
				descriptor = Some(d);
				break;
			}
		}
		let Some(descriptor) = descriptor else {
			info!(mime = %mime, root = %root.display(), "no provider for project");
			self.state
				.write()
				.projects
				.insert(key.clone(), ProjectScope::NoProvider);
			return Ok(None);
		};

		info!(mime = %mime, root = %root.display(), "starting language server");
		let (conn, events) = Connection::establish(mime.clone(), root, descriptor, self.timeout).await?;
		self.spawn_event_router(conn.clone(), events);
		self.state
			.write()
			.projects
			.insert(key.clone(), ProjectScope::Bound(conn.clone()));
		Ok(Some(conn))
	}

	/// Routes one connection's event stream: server-initiated requests are
	/// answered here, notifications are forwarded to the subscriber.
	fn spawn_event_router(&self, conn: Arc<Connection>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
		let store = self.store.clone();
		let notifications = self.notifications.clone();
		tokio::spawn(async move {
			while let Some(event) = events.recv().await {
				match event {
					ConnectionEvent::Request(req) => answer_server_request(&conn, store.as_ref(), req),
					ConnectionEvent::Notification(notif) => {
						if let Some(sink) = notifications.read().as_ref() {
							let _ = sink.send(ServerNotification {
								server: conn.name().to_owned(),
								method: notif.method,
								params: notif.params,
							});
						}
					}
					ConnectionEvent::Closed => {
						debug!(server = conn.name(), "event stream closed");
						break;
					}
				}
			}
		});
	}
}

fn answer_server_request(conn: &Connection, store: &dyn DocumentStore, req: AnyRequest) {
	let resp = match req.method.as_str() {
		m if m == ApplyWorkspaceEdit::METHOD => match serde_json::from_value::<ApplyWorkspaceEditParams>(req.params) {
			Ok(params) => {
				let outcome = apply_workspace_edit(store, &params.edit, conn.offset_encoding());
				let applied = outcome.is_clean();
				let response = ApplyWorkspaceEditResponse {
					applied,
					failure_reason: (!applied).then(|| format!("{} document(s) failed to apply", outcome.failed)),
					failed_change: None,
				};
				serde_json::to_value(response).map_err(|e| ResponseError {
					code: ResponseError::INVALID_PARAMS,
					message: e.to_string(),
					data: None,
				})
			}
			Err(e) => Err(ResponseError {
				code: ResponseError::INVALID_PARAMS,
				message: e.to_string(),
				data: None,
			}),
		},
		other => Err(ResponseError::method_not_found(other)),
	};
	if let Err(e) = conn.proxy().reply(req.id, resp) {
		warn!(server = conn.name(), method = %req.method, error = %e, "failed to answer server request");
	}
}

/// Un-wedges the inflight map and unblocks waiters if the leader fails or
/// is cancelled before publishing an outcome.
struct StartGuard {
	key: ProjectKey,
	inflight_map: Arc<Mutex<HashMap<ProjectKey, Arc<InFlightStart>>>>,
	inflight: Arc<InFlightStart>,
	completed: bool,
}

impl StartGuard {
	fn new(
		key: ProjectKey,
		inflight_map: Arc<Mutex<HashMap<ProjectKey, Arc<InFlightStart>>>>,
		inflight: Arc<InFlightStart>,
	) -> Self {
		Self {
			key,
			inflight_map,
			inflight,
			completed: false,
		}
	}

	fn complete(mut self, outcome: StartOutcome) -> StartOutcome {
		self.completed = true;

		// Remove the entry before publishing. Anyone arriving after this
		// point elects itself leader and consults the cache afresh instead
		// of replaying a flight that already landed; eviction and sentinel
		// clearing stay visible to the very next resolve.
		self.inflight_map.lock().remove(&self.key);

		// The shared copy carries a rendered error since I/O errors are not
		// cloneable.
		let shared: Arc<StartOutcome> = Arc::new(match &outcome {
			Ok(conn) => Ok(conn.clone()),
			Err(e) => Err(Error::Protocol(format!("server start failed: {e}"))),
		});
		let _ = self.inflight.tx.send(Some(shared));

		outcome
	}
}

impl Drop for StartGuard {
	fn drop(&mut self) {
		if self.completed {
			return;
		}

		// Leader exited early: un-wedge the map, then unblock waiters.
		self.inflight_map.lock().remove(&self.key);
		let _ = self.inflight.tx.send(Some(Arc::new(Err(Error::Protocol(
			"server start aborted (leader cancelled)".into(),
		)))));
	}
}

#[cfg(test)]
mod tests;
