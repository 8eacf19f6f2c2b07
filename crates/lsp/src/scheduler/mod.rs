//! Background task scheduler.
//!
//! Runs registered per-file tasks (formatting, linting, symbol indexing)
//! against the file's resolved connection, debounced and strictly
//! serialized: one worker consumes one queue, so no two tasks ever run
//! concurrently. That global ordering is a deliberate trade-off — it keeps
//! task authors free of cross-file locking at the cost of throughput, which
//! is acceptable for editor-idle workloads.
//!
//! Scheduling is caller-driven: a task runs once per schedule request and
//! never re-arms itself. Each `(file, task-name)` pair carries a generation
//! counter; re-registration or re-scheduling bumps the generation so at most
//! one queued unit per pair is live, and stale units are dropped at dequeue.
//! A task that already started is never interrupted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::registry::BindingRegistry;

/// Default delay between a schedule request and the task running.
pub const TASK_DEBOUNCE: Duration = Duration::from_millis(300);

/// A unit of background work tied to one file.
#[async_trait]
pub trait BackgroundTask: Send + Sync {
	/// Identity of the task; re-registering the same name for the same file
	/// replaces the earlier registration.
	fn name(&self) -> &str;

	/// Executes the task against the file's connection.
	async fn run(&self, conn: Arc<Connection>, file: &Path);
}

type TaskKey = (PathBuf, String);

struct TaskEntry {
	task: Arc<dyn BackgroundTask>,
	conn: Arc<Connection>,
	generation: u64,
}

#[derive(Default)]
struct SchedulerState {
	tasks: HashMap<TaskKey, TaskEntry>,
}

struct QueuedRun {
	key: TaskKey,
	generation: u64,
}

/// Debounced, serialized runner of per-file background tasks.
pub struct BackgroundScheduler {
	registry: Arc<BindingRegistry>,
	state: Arc<Mutex<SchedulerState>>,
	queue_tx: mpsc::UnboundedSender<QueuedRun>,
	debounce: Duration,
}

impl BackgroundScheduler {
	/// Creates a scheduler with the default debounce delay.
	pub fn new(registry: Arc<BindingRegistry>) -> Arc<Self> {
		Self::with_debounce(registry, TASK_DEBOUNCE)
	}

	/// Creates a scheduler with a custom debounce delay.
	pub fn with_debounce(registry: Arc<BindingRegistry>, debounce: Duration) -> Arc<Self> {
		let (queue_tx, queue_rx) = mpsc::unbounded_channel();
		let state = Arc::new(Mutex::new(SchedulerState::default()));
		spawn_worker(state.clone(), queue_rx);
		Arc::new(Self {
			registry,
			state,
			queue_tx,
			debounce,
		})
	}

	/// Registers `task` for `file` and schedules it after the debounce
	/// delay.
	///
	/// Resolves the file's connection up front; when no connection is
	/// available the registration is silently dropped, matching the
	/// best-effort nature of background work. Re-registering the same task
	/// name replaces the earlier registration and its pending run.
	pub async fn add_task(&self, file: &Path, task: Arc<dyn BackgroundTask>) {
		let conn = match self.registry.resolve(file).await {
			Ok(Some(conn)) => conn,
			Ok(None) => {
				debug!(file = %file.display(), task = task.name(), "no connection; task not registered");
				return;
			}
			Err(e) => {
				warn!(file = %file.display(), task = task.name(), error = %e, "resolve failed; task not registered");
				return;
			}
		};

		let key: TaskKey = (file.to_path_buf(), task.name().to_owned());
		let generation = {
			let mut state = self.state.lock();
			let generation = state.tasks.get(&key).map_or(1, |e| e.generation + 1);
			state.tasks.insert(
				key.clone(),
				TaskEntry {
					task,
					conn,
					generation,
				},
			);
			generation
		};
		self.arm(key, generation);
	}

	/// Re-schedules every task registered for `file` after the debounce
	/// delay, replacing any still-pending runs.
	pub fn schedule_tasks(&self, file: &Path) {
		let armed: Vec<(TaskKey, u64)> = {
			let mut state = self.state.lock();
			state
				.tasks
				.iter_mut()
				.filter(|((f, _), _)| f == file)
				.map(|(key, entry)| {
					entry.generation += 1;
					(key.clone(), entry.generation)
				})
				.collect()
		};
		for (key, generation) in armed {
			self.arm(key, generation);
		}
	}

	/// Unregisters a task. A pending run is dropped; a run that already
	/// started completes.
	pub fn remove_task(&self, file: &Path, name: &str) {
		let key: TaskKey = (file.to_path_buf(), name.to_owned());
		let _ = self.state.lock().tasks.remove(&key);
	}

	/// Number of registered `(file, task)` entries.
	pub fn task_count(&self) -> usize {
		self.state.lock().tasks.len()
	}

	fn arm(&self, key: TaskKey, generation: u64) {
		let tx = self.queue_tx.clone();
		let delay = self.debounce;
		tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			let _ = tx.send(QueuedRun { key, generation });
		});
	}
}

/// The single worker task. Serialization of all background work follows
/// from this loop awaiting each run to completion before dequeueing the
/// next unit.
fn spawn_worker(state: Arc<Mutex<SchedulerState>>, mut queue_rx: mpsc::UnboundedReceiver<QueuedRun>) {
	tokio::spawn(async move {
		while let Some(run) = queue_rx.recv().await {
			let entry = {
				let state = state.lock();
				match state.tasks.get(&run.key) {
					// Stale generation: the unit was replaced or removed
					// while queued.
					Some(e) if e.generation == run.generation => Some((e.task.clone(), e.conn.clone())),
					_ => None,
				}
			};
			let Some((task, conn)) = entry else { continue };
			if !conn.is_alive() {
				debug!(file = %run.key.0.display(), task = %run.key.1, "connection dead; skipping run");
				continue;
			}
			task.run(conn, &run.key.0).await;
		}
	});
}
