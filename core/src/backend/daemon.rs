//! Daemon backend: an external file-alteration-monitor daemon reached
//! over a unix socket.
//!
//! The wire protocol is newline-delimited JSON, one object per line.
//! Requests name the operation and a caller-chosen request number;
//! notifications echo the number so replies can be matched without any
//! per-request state on this side:
//!
//! ```text
//! -> {"op":"monitor","req":7,"path":"/etc/hosts"}
//! <- {"req":7,"code":"ack"}
//! <- {"req":7,"code":"changed","path":"/etc/hosts"}
//! -> {"op":"cancel","req":7}
//! ```
//!
//! The daemon is trusted but not relied on: when the connection dies,
//! a [`RawEvent::DaemonGone`] tells the coordinator to rehome every
//! daemon-mode entry onto another backend.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
#[cfg(unix)]
use tokio::{
	io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
	net::UnixStream,
	task::JoinHandle,
};
#[cfg(unix)]
use tracing::{debug, trace, warn};

use super::RawEvent;

/// One request line sent to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum DaemonRequest {
	Monitor { req: u32, path: PathBuf },
	Cancel { req: u32 },
}

/// Notification codes the daemon can send. `Exists` and `EndExists`
/// bracket the initial enumeration of a monitored directory, and the
/// exec pair reports processes touching a path; none of those
/// represent a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum DaemonCode {
	Changed,
	Deleted,
	Created,
	Exists,
	EndExists,
	Ack,
	StartExec,
	StopExec,
}

/// One notification line received from the daemon. `path` is absolute
/// for events on the monitored path itself and a bare name for events
/// on a directory's children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DaemonNotification {
	pub req: u32,
	pub code: DaemonCode,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub path: Option<PathBuf>,
}

#[cfg(unix)]
pub(crate) struct DaemonSession {
	requests: mpsc::UnboundedSender<DaemonRequest>,
	writer: JoinHandle<()>,
	reader: JoinHandle<()>,
}

#[cfg(unix)]
impl DaemonSession {
	/// Connects to the daemon socket and starts the reader and writer
	/// tasks. `None` when nothing is listening.
	pub async fn connect(socket: &Path, raw_events: mpsc::UnboundedSender<RawEvent>) -> Option<Self> {
		let stream = match UnixStream::connect(socket).await {
			Ok(stream) => stream,
			Err(error) => {
				debug!(socket = %socket.display(), ?error, "monitoring daemon unreachable");
				return None;
			}
		};

		let (read_half, mut write_half) = stream.into_split();
		let (requests, mut request_rx) = mpsc::unbounded_channel::<DaemonRequest>();

		let writer = tokio::spawn({
			let raw_events = raw_events.clone();
			async move {
				while let Some(request) = request_rx.recv().await {
					let Ok(mut line) = serde_json::to_vec(&request) else {
						continue;
					};
					line.push(b'\n');

					if write_half.write_all(&line).await.is_err() {
						let _ = raw_events.send(RawEvent::DaemonGone);
						return;
					}
				}
			}
		});

		let reader = tokio::spawn(async move {
			let mut lines = BufReader::new(read_half).lines();
			loop {
				match lines.next_line().await {
					Ok(Some(line)) => match serde_json::from_str::<DaemonNotification>(&line) {
						Ok(notification) => {
							if raw_events.send(RawEvent::Daemon(notification)).is_err() {
								return;
							}
						}
						Err(error) => trace!(?error, line, "undecodable daemon line"),
					},
					Ok(None) => {
						warn!("monitoring daemon closed the connection");
						let _ = raw_events.send(RawEvent::DaemonGone);
						return;
					}
					Err(error) => {
						warn!(?error, "monitoring daemon read failed");
						let _ = raw_events.send(RawEvent::DaemonGone);
						return;
					}
				}
			}
		});

		Some(Self {
			requests,
			writer,
			reader,
		})
	}

	/// Asks the daemon to monitor `path` under request number `req`.
	/// Write failures surface later as [`RawEvent::DaemonGone`].
	pub fn monitor(&self, req: u32, path: &Path) {
		let _ = self.requests.send(DaemonRequest::Monitor {
			req,
			path: path.to_path_buf(),
		});
	}

	pub fn cancel(&self, req: u32) {
		let _ = self.requests.send(DaemonRequest::Cancel { req });
	}

	pub fn shutdown(self) {
		self.writer.abort();
		self.reader.abort();
	}
}

/// Stub for platforms without unix sockets; connecting always
/// declines, so entries fall through to the next backend.
#[cfg(not(unix))]
pub(crate) struct DaemonSession;

#[cfg(not(unix))]
impl DaemonSession {
	pub async fn connect(_socket: &Path, _raw_events: mpsc::UnboundedSender<RawEvent>) -> Option<Self> {
		None
	}

	pub fn monitor(&self, _req: u32, _path: &Path) {}

	pub fn cancel(&self, _req: u32) {}

	pub fn shutdown(self) {}
}
