//! Transport launcher: turns a [`ServerDescriptor`] into a live byte stream.
//!
//! Produces a duplex pair of boxed stream halves plus, for process-based
//! servers, the OS process handle whose liveness the registry observes
//! lazily. Spawn and connect failures are returned to the caller and never
//! cached, so the next resolution retries from scratch.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

use crate::{Error, Result};

/// Boxed read half of a server connection.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half of a server connection.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Describes how to reach one language server instance.
///
/// Immutable once created; produced by a [`crate::LanguageServerProvider`]
/// or from a user-supplied host/port pair.
pub enum ServerDescriptor {
	/// Spawn the given command and speak over its stdio.
	Command {
		/// Executable to spawn.
		command: String,
		/// Arguments to pass.
		args: Vec<String>,
		/// Extra environment variables.
		env: HashMap<String, String>,
		/// Working directory for the process; the project root when absent.
		cwd: Option<PathBuf>,
	},
	/// A provider already produced the stream pair (and possibly spawned the
	/// process itself).
	Streams {
		/// Bytes flowing from the server.
		reader: BoxReader,
		/// Bytes flowing to the server.
		writer: BoxWriter,
		/// Process handle when the provider spawned one.
		process: Option<Child>,
	},
	/// Connect to an already-running server over TCP.
	Socket {
		/// Server host.
		host: String,
		/// Server port.
		port: u16,
	},
}

impl std::fmt::Debug for ServerDescriptor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Command { command, args, .. } => f
				.debug_struct("Command")
				.field("command", command)
				.field("args", args)
				.finish_non_exhaustive(),
			Self::Streams { process, .. } => f
				.debug_struct("Streams")
				.field("process", &process.is_some())
				.finish_non_exhaustive(),
			Self::Socket { host, port } => f
				.debug_struct("Socket")
				.field("host", host)
				.field("port", port)
				.finish(),
		}
	}
}

/// A launched transport: duplex stream halves plus an optional process.
pub struct Transport {
	pub(crate) reader: BoxReader,
	pub(crate) writer: BoxWriter,
	pub(crate) process: Option<Child>,
}

/// Launches the transport described by `descriptor`.
///
/// For [`ServerDescriptor::Command`] this spawns the process with piped
/// stdio; the child is killed when its handle is dropped so an abandoned
/// launch cannot leak a server.
pub async fn launch(descriptor: ServerDescriptor, root: &std::path::Path) -> Result<Transport> {
	match descriptor {
		ServerDescriptor::Command { command, args, env, cwd } => {
			let mut cmd = Command::new(&command);
			cmd.args(&args)
				.stdin(Stdio::piped())
				.stdout(Stdio::piped())
				.stderr(Stdio::null())
				.kill_on_drop(true)
				.current_dir(cwd.as_deref().unwrap_or(root));
			for (key, value) in &env {
				cmd.env(key, value);
			}

			let mut child = cmd.spawn().map_err(|e| Error::ServerSpawn {
				server: command.clone(),
				reason: e.to_string(),
			})?;
			let stdin = child.stdin.take().ok_or_else(|| Error::ServerSpawn {
				server: command.clone(),
				reason: "failed to capture stdin".into(),
			})?;
			let stdout = child.stdout.take().ok_or_else(|| Error::ServerSpawn {
				server: command.clone(),
				reason: "failed to capture stdout".into(),
			})?;

			tracing::info!(command = %command, root = %root.display(), "spawned language server");
			Ok(Transport {
				reader: Box::new(stdout),
				writer: Box::new(stdin),
				process: Some(child),
			})
		}
		ServerDescriptor::Streams { reader, writer, process } => Ok(Transport { reader, writer, process }),
		ServerDescriptor::Socket { host, port } => {
			let stream = TcpStream::connect((host.as_str(), port)).await?;
			let (read_half, write_half) = stream.into_split();
			tracing::info!(host = %host, port, "connected to language server socket");
			Ok(Transport {
				reader: Box::new(read_half),
				writer: Box::new(write_half),
				process: None,
			})
		}
	}
}
