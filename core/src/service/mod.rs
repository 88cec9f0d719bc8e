//! The watch service and its handles.
//!
//! A [`WatchService`] owns one coordinator task that holds every watch,
//! every backend and the poll scheduler. Callers talk to it through
//! [`WatchHandle`]s; each handle has its own event channel and its own
//! registrations, so several subsystems can watch overlapping paths
//! without seeing each other's events.

mod coordinator;

use std::{
	path::{Path, PathBuf},
	sync::atomic::{AtomicU64, Ordering},
	time::SystemTime,
};

use tokio::{
	sync::{mpsc, oneshot},
	task::JoinHandle,
};
use tracing::error;

use crate::{
	config::{BackendKind, WatchConfig},
	error::WatchError,
	event::{WatchEvent, WatchModes},
};

/// Identifies one [`WatchHandle`] inside the coordinator.
pub(crate) type HandleId = u64;

/// Everything a handle can ask the coordinator to do.
pub(crate) enum Command {
	RegisterHandle {
		handle: HandleId,
		events: async_channel::Sender<WatchEvent>,
	},
	DropHandle {
		handle: HandleId,
	},
	AddWatch {
		handle: HandleId,
		path: PathBuf,
		is_dir: bool,
		modes: WatchModes,
		ack: oneshot::Sender<()>,
	},
	RemoveWatch {
		handle: HandleId,
		path: PathBuf,
		ack: oneshot::Sender<()>,
	},
	Contains {
		handle: HandleId,
		path: PathBuf,
		reply: oneshot::Sender<bool>,
	},
	LastChangeTime {
		path: PathBuf,
		reply: oneshot::Sender<Option<SystemTime>>,
	},
	StopScan {
		handle: HandleId,
		ack: oneshot::Sender<()>,
	},
	StartScan {
		handle: HandleId,
		notify: bool,
		skipped_too: bool,
		ack: oneshot::Sender<()>,
	},
	StopDirScan {
		handle: HandleId,
		path: PathBuf,
		reply: oneshot::Sender<bool>,
	},
	RestartDirScan {
		handle: HandleId,
		path: PathBuf,
		reply: oneshot::Sender<bool>,
	},
	Statistics {
		reply: oneshot::Sender<WatchStatistics>,
	},
	ActiveBackend {
		reply: oneshot::Sender<BackendKind>,
	},
	RescanAll {
		ack: oneshot::Sender<()>,
	},
	Shutdown,
}

/// Snapshot of the coordinator's state, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct WatchStatistics {
	pub entries: Vec<EntrySummary>,
	/// Current poll timer period, `None` while nothing is polled.
	pub poll_period_ms: Option<u64>,
}

impl WatchStatistics {
	/// How many entries are pinned to `backend`.
	pub fn backend_count(&self, backend: BackendKind) -> usize {
		self.entries
			.iter()
			.filter(|entry| entry.backend == Some(backend))
			.count()
	}
}

/// One entry's corner of a [`WatchStatistics`] snapshot.
#[derive(Debug, Clone)]
pub struct EntrySummary {
	pub path: PathBuf,
	pub backend: Option<BackendKind>,
	pub exists: bool,
	pub is_dir: bool,
	/// Registrations across all handles, counting repeats.
	pub client_count: u32,
	/// Missing paths watching this one for their recreation.
	pub dependent_count: usize,
	/// Stat interval, for polled entries.
	pub poll_interval_ms: Option<u64>,
}

/// The change notification service. Dropping it (or calling
/// [`shutdown`](Self::shutdown)) stops the coordinator and ends every
/// handle's event stream.
#[derive(Debug)]
pub struct WatchService {
	commands: mpsc::UnboundedSender<Command>,
	actor: Option<JoinHandle<()>>,
	next_handle: AtomicU64,
}

impl WatchService {
	pub fn new(config: WatchConfig) -> Self {
		let (commands, command_rx) = mpsc::unbounded_channel();
		let actor = tokio::spawn(coordinator::run(config, command_rx));

		Self {
			commands,
			actor: Some(actor),
			next_handle: AtomicU64::new(1),
		}
	}

	/// Creates a new handle with an empty registration set and a fresh
	/// event channel.
	pub fn handle(&self) -> WatchHandle {
		let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
		let (events_tx, events) = async_channel::unbounded();

		let _ = self.commands.send(Command::RegisterHandle {
			handle: id,
			events: events_tx,
		});

		WatchHandle {
			id,
			commands: self.commands.clone(),
			events,
		}
	}

	pub async fn statistics(&self) -> Result<WatchStatistics, WatchError> {
		request(&self.commands, |reply| Command::Statistics { reply }).await
	}

	/// The strongest backend currently alive, not the backend of any
	/// particular entry.
	pub async fn active_backend(&self) -> Result<BackendKind, WatchError> {
		request(&self.commands, |reply| Command::ActiveBackend { reply }).await
	}

	/// Marks every entry for a re-stat on the next sweep. Useful after
	/// a suspend cycle or anything else that may have eaten events.
	pub async fn rescan_all(&self) -> Result<(), WatchError> {
		request(&self.commands, |ack| Command::RescanAll { ack }).await
	}

	pub async fn shutdown(mut self) {
		let _ = self.commands.send(Command::Shutdown);
		if let Some(actor) = self.actor.take() {
			if let Err(error) = actor.await {
				error!(?error, "watch coordinator task panicked");
			}
		}
	}
}

impl Drop for WatchService {
	fn drop(&mut self) {
		if self.actor.is_some() {
			let _ = self.commands.send(Command::Shutdown);
		}
	}
}

/// One subscriber's view of the service.
///
/// Registrations are per handle and refcounted: watching the same path
/// twice takes two removals to undo. Dropping the handle removes all
/// of its registrations.
#[derive(Debug)]
pub struct WatchHandle {
	id: HandleId,
	commands: mpsc::UnboundedSender<Command>,
	events: async_channel::Receiver<WatchEvent>,
}

impl WatchHandle {
	/// Watches a directory. `modes` selects which implicit child
	/// watches come with it; the directory entry itself is always
	/// covered.
	pub async fn add_dir(&self, path: impl AsRef<Path>, modes: WatchModes) -> Result<(), WatchError> {
		request(&self.commands, |ack| Command::AddWatch {
			handle: self.id,
			path: path.as_ref().to_path_buf(),
			is_dir: true,
			modes,
			ack,
		})
		.await
	}

	/// Watches a single file (or a path expected to become one).
	pub async fn add_file(&self, path: impl AsRef<Path>) -> Result<(), WatchError> {
		request(&self.commands, |ack| Command::AddWatch {
			handle: self.id,
			path: path.as_ref().to_path_buf(),
			is_dir: false,
			modes: WatchModes::DIR_ONLY,
			ack,
		})
		.await
	}

	pub async fn remove_dir(&self, path: impl AsRef<Path>) -> Result<(), WatchError> {
		self.remove(path.as_ref()).await
	}

	pub async fn remove_file(&self, path: impl AsRef<Path>) -> Result<(), WatchError> {
		self.remove(path.as_ref()).await
	}

	async fn remove(&self, path: &Path) -> Result<(), WatchError> {
		request(&self.commands, |ack| Command::RemoveWatch {
			handle: self.id,
			path: path.to_path_buf(),
			ack,
		})
		.await
	}

	/// Whether this handle currently watches `path`.
	pub async fn contains(&self, path: impl AsRef<Path>) -> Result<bool, WatchError> {
		request(&self.commands, |reply| Command::Contains {
			handle: self.id,
			path: path.as_ref().to_path_buf(),
			reply,
		})
		.await
	}

	/// When the watched path last changed, by the service's own records.
	/// `None` for unwatched paths and paths not currently existing.
	pub async fn last_change_time(
		&self,
		path: impl AsRef<Path>,
	) -> Result<Option<SystemTime>, WatchError> {
		request(&self.commands, |reply| Command::LastChangeTime {
			path: path.as_ref().to_path_buf(),
			reply,
		})
		.await
	}

	/// Suspends delivery for this handle. Changes observed while
	/// stopped accumulate per path and can be flushed by
	/// [`start_scan`](Self::start_scan).
	pub async fn stop_scan(&self) -> Result<(), WatchError> {
		request(&self.commands, |ack| Command::StopScan {
			handle: self.id,
			ack,
		})
		.await
	}

	/// Resumes delivery. With `notify` false each path is re-stat'ed so
	/// changes made while stopped are caught, and the accumulation is
	/// delivered now, compressed to at most one event per path; setting
	/// `skipped_too` discards the accumulation instead. With `notify`
	/// true the re-stat is skipped and only already-queued changes come
	/// through.
	pub async fn start_scan(&self, notify: bool, skipped_too: bool) -> Result<(), WatchError> {
		request(&self.commands, |ack| Command::StartScan {
			handle: self.id,
			notify,
			skipped_too,
			ack,
		})
		.await
	}

	/// Suspends delivery for one watched directory. Returns whether the
	/// path was a watched directory.
	pub async fn stop_dir_scan(&self, path: impl AsRef<Path>) -> Result<bool, WatchError> {
		request(&self.commands, |reply| Command::StopDirScan {
			handle: self.id,
			path: path.as_ref().to_path_buf(),
			reply,
		})
		.await
	}

	/// Resumes delivery for one watched directory, re-statting it first
	/// so changes made while stopped are noticed. Returns whether
	/// anything was resumed.
	pub async fn restart_dir_scan(&self, path: impl AsRef<Path>) -> Result<bool, WatchError> {
		request(&self.commands, |reply| Command::RestartDirScan {
			handle: self.id,
			path: path.as_ref().to_path_buf(),
			reply,
		})
		.await
	}

	/// The handle's event stream. The receiver is clonable; all clones
	/// share one stream.
	pub fn events(&self) -> async_channel::Receiver<WatchEvent> {
		self.events.clone()
	}

	/// Waits for the next event on this handle.
	pub async fn next_event(&self) -> Result<WatchEvent, WatchError> {
		self.events
			.recv()
			.await
			.map_err(|_| WatchError::ServiceStopped)
	}
}

impl Drop for WatchHandle {
	fn drop(&mut self) {
		let _ = self.commands.send(Command::DropHandle { handle: self.id });
	}
}

async fn request<T>(
	commands: &mpsc::UnboundedSender<Command>,
	build: impl FnOnce(oneshot::Sender<T>) -> Command,
) -> Result<T, WatchError> {
	let (tx, rx) = oneshot::channel();
	commands
		.send(build(tx))
		.map_err(|_| WatchError::ServiceStopped)?;
	rx.await.map_err(|_| WatchError::ServiceStopped)
}
