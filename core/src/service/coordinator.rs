//! The coordinator task: owns every entry, every backend and the poll
//! scheduler.
//!
//! All state lives on this one task, so backend callbacks and handle
//! commands can never race over the entry table. Backends push raw
//! notifications onto a channel; the coordinator looks up the affected
//! entry, marks it dirty and arms a short debounce so bursts of events
//! collapse into one reconciliation sweep. Removals requested while a
//! sweep is walking the table are parked and honored after it, which
//! also gives events already in flight a window to be silently dropped
//! rather than delivered for a dead watch.

use std::{
	collections::{HashMap, HashSet},
	path::{Path, PathBuf},
	time::Duration,
};

use tokio::{
	sync::mpsc,
	time::{sleep_until, Instant},
};
use tracing::{debug, info, trace, warn};

use vigil_mounts::MountTable;

use super::{Command, EntrySummary, HandleId, WatchStatistics};
use crate::{
	backend::{
		DaemonCode, DaemonNotification, DaemonSession, GenericBackend, KernelBackend,
		KernelSignal, RawEvent,
	},
	config::{BackendKind, WatchConfig, FALLBACK_ORDER},
	entry::{is_device_path, normalize_path, Entry, EntryTable, PathStatus},
	event::{is_noisy_file, ChangeSet, EventKind, WatchEvent, WatchModes},
	scan::{self, ScanOutcome},
};

/// Delay between a backend event and the reconciliation sweep it
/// triggers; further events within the window ride along.
const DEBOUNCE_MS: u64 = 50;

pub(super) async fn run(config: WatchConfig, command_rx: mpsc::UnboundedReceiver<Command>) {
	Coordinator::new(config, command_rx).await.run().await;
}

struct Coordinator {
	config: WatchConfig,
	mounts: MountTable,
	table: EntryTable,
	/// Event channel of each live handle.
	handles: HashMap<HandleId, async_channel::Sender<WatchEvent>>,
	/// Handles currently suspended via stop_scan; registrations made
	/// while suspended start out stopped too.
	stopped_handles: HashSet<HandleId>,

	kernel: Option<KernelBackend>,
	daemon: Option<DaemonSession>,
	generic: Option<GenericBackend>,
	next_daemon_request: u32,

	command_rx: mpsc::UnboundedReceiver<Command>,
	raw_rx: mpsc::UnboundedReceiver<RawEvent>,
	/// Kept so `raw_rx` never reports closed.
	_raw_tx: mpsc::UnboundedSender<RawEvent>,

	/// Poll timer period: the smallest interval over polled entries.
	poll_period_ms: Option<u64>,
	next_poll: Option<Instant>,
	debounce: Option<Instant>,

	/// True while a sweep walks the table; removals arriving then are
	/// parked in `pending_removals`.
	sweeping: bool,
	pending_removals: Vec<PathBuf>,
	rescan_all: bool,
}

impl Coordinator {
	async fn new(config: WatchConfig, command_rx: mpsc::UnboundedReceiver<Command>) -> Self {
		let (raw_tx, raw_rx) = mpsc::unbounded_channel();

		let mounts = MountTable::load().unwrap_or_else(|error| {
			warn!(?error, "mount table unavailable, treating all paths as local");
			MountTable::default()
		});

		let kernel = KernelBackend::init(raw_tx.clone());
		let daemon = match &config.daemon_socket {
			Some(socket) => DaemonSession::connect(socket, raw_tx.clone()).await,
			None => None,
		};
		let generic = GenericBackend::init(raw_tx.clone());

		info!(
			kernel = kernel.is_some(),
			daemon = daemon.is_some(),
			generic = generic.is_some(),
			"watch backends initialized"
		);

		Self {
			config,
			mounts,
			table: EntryTable::default(),
			handles: HashMap::new(),
			stopped_handles: HashSet::new(),
			kernel,
			daemon,
			generic,
			next_daemon_request: 1,
			command_rx,
			raw_rx,
			_raw_tx: raw_tx,
			poll_period_ms: None,
			next_poll: None,
			debounce: None,
			sweeping: false,
			pending_removals: Vec::new(),
			rescan_all: false,
		}
	}

	async fn run(mut self) {
		loop {
			// disabled branches still evaluate their expression, so the
			// deadlines need a harmless placeholder
			let poll_at = self.next_poll.unwrap_or_else(Instant::now);
			let debounce_at = self.debounce.unwrap_or_else(Instant::now);

			tokio::select! {
				command = self.command_rx.recv() => match command {
					Some(command) => {
						if !self.handle_command(command) {
							break;
						}
					}
					None => break,
				},
				Some(event) = self.raw_rx.recv() => self.handle_raw(event),
				() = sleep_until(poll_at), if self.next_poll.is_some() => self.poll_tick(),
				() = sleep_until(debounce_at), if self.debounce.is_some() => {
					self.debounce = None;
					self.sweep(0);
				}
			}
		}

		if let Some(kernel) = self.kernel.take() {
			kernel.shutdown();
		}
		if let Some(daemon) = self.daemon.take() {
			daemon.shutdown();
		}
		debug!("watch coordinator stopped");
	}

	/// Returns false when the coordinator should stop.
	fn handle_command(&mut self, command: Command) -> bool {
		match command {
			Command::RegisterHandle { handle, events } => {
				self.handles.insert(handle, events);
			}
			Command::DropHandle { handle } => self.drop_handle(handle),
			Command::AddWatch {
				handle,
				path,
				is_dir,
				modes,
				ack,
			} => {
				self.add_entry(Some(handle), &path, None, is_dir, modes);
				self.arm_debounce();
				let _ = ack.send(());
			}
			Command::RemoveWatch { handle, path, ack } => {
				self.remove_entry(Some(handle), &path, None);
				let _ = ack.send(());
			}
			Command::Contains {
				handle,
				path,
				reply,
			} => {
				let contained = normalize_path(&path)
					.and_then(|path| self.table.get(&path))
					.is_some_and(|entry| entry.clients.iter().any(|c| c.handle == handle));
				let _ = reply.send(contained);
			}
			Command::LastChangeTime { path, reply } => {
				let time = normalize_path(&path)
					.and_then(|path| self.table.get(&path))
					.and_then(|entry| entry.change_time);
				let _ = reply.send(time);
			}
			Command::StopScan { handle, ack } => {
				self.stop_scan(handle);
				let _ = ack.send(());
			}
			Command::StartScan {
				handle,
				notify,
				skipped_too,
				ack,
			} => {
				self.start_scan(handle, notify, skipped_too);
				let _ = ack.send(());
			}
			Command::StopDirScan {
				handle,
				path,
				reply,
			} => {
				let _ = reply.send(self.stop_dir_scan(handle, &path));
			}
			Command::RestartDirScan {
				handle,
				path,
				reply,
			} => {
				let _ = reply.send(self.restart_dir_scan(handle, &path));
			}
			Command::Statistics { reply } => {
				let _ = reply.send(self.statistics());
			}
			Command::ActiveBackend { reply } => {
				let _ = reply.send(self.active_backend());
			}
			Command::RescanAll { ack } => {
				self.rescan_all = true;
				self.arm_debounce();
				let _ = ack.send(());
			}
			Command::Shutdown => return false,
		}

		true
	}

	// ---- registration ----------------------------------------------------

	/// Registers a watch on `path`, either for a handle or as a
	/// dependent link from a missing child. Reuses the existing entry
	/// when there is one; otherwise stats the path, creates the entry,
	/// implicitly registers directory children per `modes`, and assigns
	/// a backend.
	fn add_entry(
		&mut self,
		instance: Option<HandleId>,
		path: &Path,
		dependent: Option<&Path>,
		is_dir_hint: bool,
		modes: WatchModes,
	) {
		let Some(path) = normalize_path(path) else {
			return;
		};
		if is_device_path(&path) {
			debug!(path = %path.display(), "device path refused");
			return;
		}

		if let Some(entry) = self.table.get_mut(&path) {
			if let Some(dependent) = dependent {
				if !entry.dependents.iter().any(|d| d == dependent) {
					entry.dependents.push(dependent.to_path_buf());
				}
				// the entry may have been armed before it had
				// dependents; re-arm so child events reach it
				if entry.mode == Some(BackendKind::Kernel) && entry.watch_descriptor.is_some() {
					let is_dir = entry.is_dir;
					let descriptor = self
						.kernel
						.as_mut()
						.and_then(|kernel| kernel.add(&path, is_dir));
					if let Some(descriptor) = descriptor {
						if let Some(entry) = self.table.get_mut(&path) {
							entry.watch_descriptor = Some(descriptor);
						}
					}
				}
			} else if let Some(handle) = instance {
				let stopped = self.stopped_handles.contains(&handle);
				entry.add_client(handle, modes, stopped);
			}
			return;
		}

		let mut entry = Entry::new(path.clone(), is_dir_hint);
		let mut modes = modes;
		if let Some(metadata) = scan::stat(&path) {
			entry.is_dir = metadata.is_dir();
			if entry.is_dir && !is_dir_hint {
				let is_symlink = std::fs::symlink_metadata(&path)
					.is_ok_and(|metadata| metadata.file_type().is_symlink());
				if is_symlink {
					// the link itself is the watched object
					entry.is_dir = false;
				} else {
					warn!(path = %path.display(), "directory registered as a file");
				}
			} else if !entry.is_dir && is_dir_hint {
				warn!(path = %path.display(), "file registered as a directory");
			}
			if !entry.is_dir && !modes.is_empty() {
				warn!(path = %path.display(), "child watch modes ignored on a file");
				modes = WatchModes::DIR_ONLY;
			}

			entry.status = PathStatus::Exists;
			entry.change_time = Some(scan::fingerprint(&metadata));
			entry.nlink = scan::link_count(&metadata);
		}

		let is_dir = entry.is_dir;
		let exists = entry.status == PathStatus::Exists;

		if let Some(dependent) = dependent {
			entry.dependents.push(dependent.to_path_buf());
		} else if let Some(handle) = instance {
			let stopped = self.stopped_handles.contains(&handle);
			entry.add_client(handle, modes, stopped);
		}

		debug!(path = %path.display(), is_dir, exists, "watch entry added");
		self.table.insert(entry);

		if path.file_name().is_some_and(is_noisy_file) {
			// keeps its entry so removal bookkeeping works, but gets no
			// backend and is never scanned
			return;
		}

		if exists && is_dir && !modes.is_empty() {
			// a kernel watch on the directory already reports its
			// files, so implicit file children are skipped when the
			// kernel backend leads
			let watch_dirs = modes.contains(WatchModes::SUB_DIRS);
			let watch_files = modes.contains(WatchModes::FILES)
				&& !(self.kernel.is_some()
					&& self.config.preferred_backend == BackendKind::Kernel);

			if watch_dirs || watch_files {
				if let Ok(children) = std::fs::read_dir(&path) {
					for child in children.flatten() {
						let Ok(file_type) = child.file_type() else {
							continue;
						};
						let child_is_dir = file_type.is_dir() && !file_type.is_symlink();
						if child_is_dir && watch_dirs {
							self.add_entry(instance, &child.path(), None, true, modes);
						} else if !child_is_dir && watch_files {
							self.add_entry(
								instance,
								&child.path(),
								None,
								false,
								WatchModes::DIR_ONLY,
							);
						}
					}
				}
			}
		}

		self.assign_backend(&path);
	}

	/// Unregisters one registration (or one dependent link); the entry
	/// and its backend resources go when the last one is gone. During a
	/// sweep the teardown is parked until the sweep finishes.
	fn remove_entry(&mut self, instance: Option<HandleId>, path: &Path, dependent: Option<&Path>) {
		let Some(path) = normalize_path(path) else {
			return;
		};
		let Some(entry) = self.table.get_mut(&path) else {
			trace!(path = %path.display(), "remove of unwatched path ignored");
			return;
		};

		if let Some(dependent) = dependent {
			entry.remove_dependent(dependent);
		} else if let Some(handle) = instance {
			entry.remove_client(handle);
		}

		if entry.is_valid() {
			return;
		}

		if self.sweeping {
			if !self.pending_removals.contains(&path) {
				self.pending_removals.push(path);
			}
			return;
		}

		self.teardown(&path);
	}

	/// Releases an entry's backend resources and drops it. The entry
	/// must already be invalid.
	fn teardown(&mut self, path: &Path) {
		let Some(entry) = self.table.remove(path) else {
			return;
		};
		self.pending_removals.retain(|pending| pending != path);
		debug!(path = %entry.path.display(), mode = ?entry.mode, "watch entry removed");

		match entry.mode {
			Some(BackendKind::Kernel) => {
				if let Some(descriptor) = entry.watch_descriptor {
					if let Some(kernel) = self.kernel.as_mut() {
						kernel.remove(descriptor);
					}
				} else if entry.status == PathStatus::Missing {
					let parent = entry.parent_directory();
					self.remove_entry(None, &parent, Some(&entry.path));
				}
			}
			Some(BackendKind::Daemon) => {
				if let Some(request) = entry.daemon_request {
					if let Some(daemon) = &self.daemon {
						daemon.cancel(request);
					}
				} else if entry.status == PathStatus::Missing {
					let parent = entry.parent_directory();
					self.remove_entry(None, &parent, Some(&entry.path));
				}
			}
			Some(BackendKind::Generic) => {
				if let Some(generic) = self.generic.as_mut() {
					generic.unwatch(&entry.path);
				}
				if entry.status == PathStatus::Missing {
					let parent = entry.parent_directory();
					self.remove_entry(None, &parent, Some(&entry.path));
				}
			}
			Some(BackendKind::Poll) => self.reschedule_polls(),
			None => {}
		}
	}

	/// Removes every registration a dropped handle left behind.
	fn drop_handle(&mut self, handle: HandleId) {
		self.handles.remove(&handle);
		self.stopped_handles.remove(&handle);

		let mut paths = Vec::new();
		for entry in self.table.iter_mut() {
			if let Some(client) = entry.clients.iter_mut().find(|c| c.handle == handle) {
				// collapse the refcount so one removal suffices
				client.count = 1;
				paths.push(entry.path.clone());
			}
		}
		for path in paths {
			self.remove_entry(Some(handle), &path, None);
		}
	}

	// ---- backend assignment ----------------------------------------------

	fn assign_backend(&mut self, path: &Path) {
		let preferred = if self.config.remote_preferred_backend.is_some() {
			self.config
				.preferred_for(self.mounts.is_probably_slow(path))
		} else {
			self.config.preferred_backend
		};

		if self.try_backend(preferred, path) {
			return;
		}
		for kind in FALLBACK_ORDER {
			if kind != preferred && self.try_backend(kind, path) {
				return;
			}
		}
	}

	fn try_backend(&mut self, kind: BackendKind, path: &Path) -> bool {
		match kind {
			BackendKind::Kernel => self.use_kernel(path),
			BackendKind::Daemon => self.use_daemon(path),
			BackendKind::Generic => self.use_generic(path),
			BackendKind::Poll => self.use_poll(path),
		}
	}

	/// Pins `path` to the kernel backend. Missing paths park on their
	/// parent directory until recreation.
	fn use_kernel(&mut self, path: &Path) -> bool {
		if self.kernel.is_none() {
			return false;
		}

		let (missing, is_dir, parent) = {
			let Some(entry) = self.table.get_mut(path) else {
				return false;
			};
			entry.mode = Some(BackendKind::Kernel);
			entry.dirty = false;
			entry.watch_descriptor = None;
			(
				entry.status == PathStatus::Missing,
				entry.is_dir,
				entry.parent_directory(),
			)
		};

		if missing {
			let target = path.to_path_buf();
			self.add_entry(None, &parent, Some(&target), true, WatchModes::DIR_ONLY);
			return true;
		}

		let descriptor = self
			.kernel
			.as_mut()
			.and_then(|kernel| kernel.add(path, is_dir));
		match descriptor {
			Some(descriptor) => {
				if let Some(entry) = self.table.get_mut(path) {
					entry.watch_descriptor = Some(descriptor);
				}
				true
			}
			None => false,
		}
	}

	fn use_daemon(&mut self, path: &Path) -> bool {
		if self.daemon.is_none() {
			return false;
		}

		let (missing, parent) = {
			let Some(entry) = self.table.get_mut(path) else {
				return false;
			};
			entry.mode = Some(BackendKind::Daemon);
			entry.dirty = false;
			entry.daemon_request = None;
			(entry.status == PathStatus::Missing, entry.parent_directory())
		};

		if missing {
			let target = path.to_path_buf();
			self.add_entry(None, &parent, Some(&target), true, WatchModes::DIR_ONLY);
			return true;
		}

		let request = self.next_daemon_request;
		self.next_daemon_request += 1;
		if let Some(daemon) = &self.daemon {
			daemon.monitor(request, path);
		}
		if let Some(entry) = self.table.get_mut(path) {
			entry.daemon_request = Some(request);
		}
		true
	}

	fn use_generic(&mut self, path: &Path) -> bool {
		if self.generic.is_none() {
			return false;
		}

		let (missing, parent) = {
			let Some(entry) = self.table.get_mut(path) else {
				return false;
			};
			entry.mode = Some(BackendKind::Generic);
			entry.dirty = false;
			(entry.status == PathStatus::Missing, entry.parent_directory())
		};

		if missing {
			let target = path.to_path_buf();
			self.add_entry(None, &parent, Some(&target), true, WatchModes::DIR_ONLY);
			return true;
		}

		self.generic
			.as_mut()
			.is_some_and(|generic| generic.watch(path))
	}

	/// Always succeeds; polling is the floor of the fallback chain.
	fn use_poll(&mut self, path: &Path) -> bool {
		let interval = self
			.config
			.poll_interval_for(self.mounts.is_probably_slow(path));

		if let Some(entry) = self.table.get_mut(path) {
			entry.mode = Some(BackendKind::Poll);
			entry.dirty = false;
			entry.poll_interval_ms = interval;
			entry.poll_countdown_ms = 0;
		}

		self.reschedule_polls();
		true
	}

	/// Recomputes the poll timer period as the minimum interval over
	/// polled entries, so the timer never drifts slower than the
	/// fastest one.
	fn reschedule_polls(&mut self) {
		let period = self
			.table
			.iter()
			.filter(|entry| entry.mode == Some(BackendKind::Poll))
			.map(|entry| entry.poll_interval_ms)
			.min();

		match period {
			Some(period) => {
				if self.poll_period_ms != Some(period) {
					trace!(period_ms = period, "poll period updated");
				}
				self.poll_period_ms = Some(period);

				let due = Instant::now() + Duration::from_millis(period);
				match self.next_poll {
					// a shorter period pulls an armed deadline forward
					Some(at) if at > due => self.next_poll = Some(due),
					Some(_) => {}
					None => self.next_poll = Some(due),
				}
			}
			None => {
				self.poll_period_ms = None;
				self.next_poll = None;
			}
		}
	}

	fn poll_tick(&mut self) {
		let Some(period) = self.poll_period_ms else {
			self.next_poll = None;
			return;
		};

		self.sweep(period);

		match self.poll_period_ms {
			Some(period) => self.next_poll = Some(Instant::now() + Duration::from_millis(period)),
			None => self.next_poll = None,
		}
	}

	fn arm_debounce(&mut self) {
		if self.debounce.is_none() {
			self.debounce = Some(Instant::now() + Duration::from_millis(DEBOUNCE_MS));
		}
	}

	// ---- reconciliation --------------------------------------------------

	/// One pass over the whole table: scan what is due, react to what
	/// changed, deliver events. `tick_ms` is how much to advance poll
	/// countdowns; debounce-triggered sweeps pass zero.
	fn sweep(&mut self, tick_ms: u64) {
		self.sweeping = true;

		if self.rescan_all {
			self.rescan_all = false;
			for entry in self.table.iter_mut() {
				entry.dirty = true;
				entry.poll_countdown_ms = 0;
			}
		} else {
			self.propagate_dirty();
		}

		for path in self.table.paths() {
			if self.pending_removals.contains(&path) {
				continue;
			}

			let Some(entry) = self.table.get_mut(&path) else {
				continue;
			};
			if !entry.is_valid() {
				continue;
			}

			let outcome = scan::scan_entry(entry, tick_ms);
			let mode = entry.mode;
			let is_dir = entry.is_dir;
			let descriptor = entry.watch_descriptor;
			let pending_children = std::mem::take(&mut entry.pending_children);

			match outcome {
				ScanOutcome::Created => {
					// the path is back; it no longer rides on its parent
					let parent = path
						.parent()
						.map_or_else(|| path.clone(), Path::to_path_buf);
					self.unlink_dependent(&parent, &path);

					if mode == Some(BackendKind::Kernel) && descriptor.is_none() {
						// the parked watch never existed; establish it now
						if !self.use_kernel(&path) {
							self.use_poll(&path);
						}
					}
				}
				ScanOutcome::Deleted if mode == Some(BackendKind::Kernel) => {
					if let Some(descriptor) = descriptor {
						if let Some(kernel) = self.kernel.as_mut() {
							kernel.remove(descriptor);
						}
						if let Some(entry) = self.table.get_mut(&path) {
							entry.watch_descriptor = None;
						}
					}
					self.watch_parent(&path);
				}
				_ => {}
			}

			if is_dir && !pending_children.is_empty() {
				let mut seen = HashSet::new();
				for child in pending_children {
					if seen.insert(child.clone()) {
						self.emit(&path, ChangeSet::CHANGED, Some(child));
					}
				}
			}

			if outcome != ScanOutcome::NoChange {
				self.emit(&path, outcome.into(), None);
			}
		}

		self.sweeping = false;
		self.flush_removals();
	}

	/// Dirt spreads from an entry to its missing dependents, so a
	/// recreation inside a dirty directory is noticed the same sweep.
	fn propagate_dirty(&mut self) {
		let mut queue = dirty_roots(&self.table);

		while let Some(path) = queue.pop() {
			if let Some(entry) = self.table.get_mut(&path) {
				if !entry.dirty {
					entry.dirty = true;
					entry.poll_countdown_ms = 0;
					queue.extend(entry.dependents.iter().cloned());
				}
			}
		}
	}

	fn flush_removals(&mut self) {
		while let Some(path) = self.pending_removals.pop() {
			// a registration during delivery can revalidate the entry
			if self.table.get(&path).is_some_and(|entry| !entry.is_valid()) {
				self.teardown(&path);
			}
		}
	}

	fn unlink_dependent(&mut self, parent: &Path, child: &Path) {
		self.remove_entry(None, parent, Some(child));
	}

	fn watch_parent(&mut self, path: &Path) {
		let parent = path
			.parent()
			.map_or_else(|| path.to_path_buf(), Path::to_path_buf);
		self.add_entry(None, &parent, Some(path), true, WatchModes::DIR_ONLY);
	}

	// ---- event delivery --------------------------------------------------

	/// Delivers `changes` on `path` to its clients, or parks them in
	/// per-client accumulators while stopped. `child` substitutes the
	/// affected path for events about a directory's children.
	///
	/// Deleted always travels alone; Created may be followed by a
	/// Changed observed in the same breath. An empty `changes` flushes
	/// whatever is pending.
	fn emit(&mut self, path: &Path, changes: ChangeSet, child: Option<PathBuf>) {
		let Some(entry) = self.table.get_mut(path) else {
			return;
		};
		let affected = child.unwrap_or_else(|| entry.path.clone());

		for client in &mut entry.clients {
			if client.stopped {
				client.pending = client.pending.accumulate(changes);
				continue;
			}

			let merged = if changes.intersects(ChangeSet::CREATED | ChangeSet::DELETED) {
				changes
			} else {
				changes | client.pending
			};
			client.pending = ChangeSet::empty();

			if merged.is_empty() {
				continue;
			}
			let Some(events) = self.handles.get(&client.handle) else {
				continue;
			};

			if merged.contains(ChangeSet::DELETED) {
				let _ = events.try_send(WatchEvent {
					path: affected.clone(),
					kind: EventKind::Deleted,
				});
				continue;
			}
			if merged.contains(ChangeSet::CREATED) {
				let _ = events.try_send(WatchEvent {
					path: affected.clone(),
					kind: EventKind::Created,
				});
			}
			if merged.contains(ChangeSet::CHANGED) {
				let _ = events.try_send(WatchEvent {
					path: affected.clone(),
					kind: EventKind::Changed,
				});
			}
		}
	}

	// ---- raw backend events ----------------------------------------------

	fn handle_raw(&mut self, event: RawEvent) {
		match event {
			RawEvent::Kernel { descriptor, signal } => {
				self.handle_kernel_event(descriptor, signal);
			}
			RawEvent::Daemon(notification) => self.handle_daemon_event(notification),
			RawEvent::DaemonGone => self.handle_daemon_gone(),
			RawEvent::Generic(path) => self.handle_generic_event(&path),
		}
	}

	fn handle_kernel_event(&mut self, descriptor: i32, signal: KernelSignal) {
		let Some(path) = self.table.path_by_watch_descriptor(descriptor) else {
			return;
		};
		trace!(path = %path.display(), ?signal, "kernel event");

		match signal {
			KernelSignal::SelfGone => {
				let taken = self.table.get_mut(&path).and_then(|entry| {
					entry.status = PathStatus::Missing;
					entry.change_time = None;
					entry.nlink = 0;
					entry.dirty = true;
					entry.watch_descriptor.take()
				});
				if let Some(descriptor) = taken {
					if let Some(kernel) = self.kernel.as_mut() {
						kernel.remove(descriptor);
					}
				}

				self.emit(&path, ChangeSet::DELETED, None);
				self.watch_parent(&path);
			}
			KernelSignal::SelfChanged => {
				if let Some(entry) = self.table.get_mut(&path) {
					entry.dirty = true;
				}
			}
			KernelSignal::ChildCreated(name) => {
				if is_noisy_file(&name) {
					return;
				}
				let child = path.join(&name);

				let (is_dependent, is_dir, clients) = {
					let Some(entry) = self.table.get_mut(&path) else {
						return;
					};
					entry.dirty = true;
					(
						entry.dependents.iter().any(|d| d == &child),
						entry.is_dir,
						entry
							.clients
							.iter()
							.map(|c| (c.handle, c.modes))
							.collect::<Vec<_>>(),
					)
				};

				if is_dependent {
					// a watched path came back; give it its own watch
					self.unlink_dependent(&path, &child);
					if !self.use_kernel(&child) {
						self.use_poll(&child);
					}
					if let Some(entry) = self.table.get_mut(&child) {
						entry.dirty = true;
					}
				} else if is_dir && !clients.is_empty() {
					let Some(metadata) = scan::stat(&child) else {
						return;
					};
					let child_is_dir = metadata.is_dir();
					let wanted = if child_is_dir {
						WatchModes::SUB_DIRS
					} else {
						WatchModes::FILES
					};

					let interested: Vec<_> = clients
						.into_iter()
						.filter(|(_, modes)| modes.contains(wanted))
						.collect();
					if child_is_dir {
						// new subdirectories get watches of their own;
						// new files are already covered by the
						// directory's kernel watch
						for (handle, modes) in &interested {
							self.add_entry(Some(*handle), &child, None, true, *modes);
						}
					}
					if !interested.is_empty() {
						self.emit(&path, ChangeSet::CREATED, Some(child));
					}
				}
			}
			KernelSignal::ChildGone(name) => {
				if is_noisy_file(&name) {
					return;
				}
				let child = path.join(&name);

				let announce = {
					let Some(entry) = self.table.get_mut(&path) else {
						return;
					};
					entry.dirty = true;
					if entry.is_dir && !entry.clients.is_empty() {
						// the child is usually gone by now, in which
						// case either kind of watcher cares
						let wanted = match scan::stat(&child) {
							Some(metadata) if metadata.is_dir() => WatchModes::SUB_DIRS,
							Some(_) => WatchModes::FILES,
							None => WatchModes::SUB_DIRS | WatchModes::FILES,
						};
						entry
							.clients
							.iter()
							.any(|client| client.modes.intersects(wanted))
					} else {
						false
					}
				};

				if announce {
					self.emit(&path, ChangeSet::DELETED, Some(child));
				}
			}
			KernelSignal::ChildChanged(name) => {
				if is_noisy_file(&name) {
					return;
				}
				let child = path.join(&name);

				if let Some(entry) = self.table.get_mut(&path) {
					entry.dirty = true;
					if entry.is_dir && !entry.clients.is_empty() {
						entry.pending_children.push(child);
					}
				}
			}
		}

		self.arm_debounce();
	}

	fn handle_daemon_event(&mut self, notification: DaemonNotification) {
		match notification.code {
			DaemonCode::Changed | DaemonCode::Deleted | DaemonCode::Created => {}
			// enumeration brackets, acks and exec notices are not changes
			_ => return,
		}

		if notification
			.path
			.as_deref()
			.and_then(Path::file_name)
			.is_some_and(is_noisy_file)
		{
			return;
		}

		let Some(path) = self.table.path_by_daemon_request(notification.req) else {
			return;
		};

		let (is_dir, request) = {
			let Some(entry) = self.table.get_mut(&path) else {
				return;
			};
			if entry.status == PathStatus::Missing {
				// the daemon is catching up on a path already parked
				trace!(path = %path.display(), "daemon event for missing path ignored");
				return;
			}
			entry.dirty = true;
			(entry.is_dir, entry.daemon_request)
		};
		self.arm_debounce();

		if !is_dir {
			return;
		}

		match notification.code {
			DaemonCode::Deleted => {
				// an absolute path means the monitored directory itself;
				// bare names are children, which the dirty scan covers
				if notification.path.as_deref().is_some_and(Path::is_absolute) {
					if let Some(entry) = self.table.get_mut(&path) {
						entry.status = PathStatus::Missing;
						entry.daemon_request = None;
					}
					if let (Some(daemon), Some(request)) = (&self.daemon, request) {
						daemon.cancel(request);
					}
					// the kept fingerprint lets the sweep report Deleted
					self.watch_parent(&path);
				}
			}
			DaemonCode::Created => {
				let Some(name) = notification.path else {
					return;
				};
				let child = if name.is_absolute() {
					name
				} else {
					path.join(name)
				};

				let (is_dependent, clients) = {
					let Some(entry) = self.table.get(&path) else {
						return;
					};
					(
						entry.dependents.iter().any(|d| d == &child),
						entry
							.clients
							.iter()
							.map(|c| (c.handle, c.modes))
							.collect::<Vec<_>>(),
					)
				};

				if is_dependent {
					self.unlink_dependent(&path, &child);
					if !self.use_daemon(&child) && !self.use_kernel(&child) {
						self.use_poll(&child);
					}
					if let Some(entry) = self.table.get_mut(&child) {
						entry.dirty = true;
					}
				} else if !clients.is_empty() {
					let Some(metadata) = scan::stat(&child) else {
						return;
					};
					let child_is_dir = metadata.is_dir();
					let wanted = if child_is_dir {
						WatchModes::SUB_DIRS
					} else {
						WatchModes::FILES
					};

					let interested: Vec<_> = clients
						.into_iter()
						.filter(|(_, modes)| modes.contains(wanted))
						.collect();
					for (handle, modes) in &interested {
						if child_is_dir {
							self.add_entry(Some(*handle), &child, None, true, *modes);
						} else {
							// unlike the kernel backend, the daemon
							// needs explicit per-file monitors
							self.add_entry(
								Some(*handle),
								&child,
								None,
								false,
								WatchModes::DIR_ONLY,
							);
						}
					}
					if !interested.is_empty() {
						self.emit(&path, ChangeSet::CREATED, Some(child));
					}
				}
			}
			_ => {}
		}
	}

	/// Rehomes every daemon entry after the connection died.
	fn handle_daemon_gone(&mut self) {
		if let Some(daemon) = self.daemon.take() {
			daemon.shutdown();
		}
		warn!("monitoring daemon lost, rehoming its entries");

		for path in self.table.paths() {
			let needs_move = self.table.get_mut(&path).is_some_and(|entry| {
				if entry.mode == Some(BackendKind::Daemon) && !entry.clients.is_empty() {
					entry.daemon_request = None;
					true
				} else {
					false
				}
			});
			if needs_move && !self.use_kernel(&path) {
				self.use_poll(&path);
			}
		}
	}

	/// The generic watcher only says "look here"; re-stat right away
	/// and work out the rest.
	fn handle_generic_event(&mut self, reported: &Path) {
		let Some(reported) = normalize_path(reported) else {
			return;
		};

		// child paths inside a watched directory map to the directory
		let path = if self.table.contains(&reported) {
			reported
		} else {
			match reported.parent() {
				Some(parent) if self.table.contains(parent) => parent.to_path_buf(),
				_ => return,
			}
		};

		let (outcome, is_dir, dependents) = {
			let Some(entry) = self.table.get_mut(&path) else {
				return;
			};
			entry.dirty = true;
			(
				scan::scan_entry(entry, 0),
				entry.is_dir,
				entry.dependents.clone(),
			)
		};
		trace!(path = %path.display(), ?outcome, "generic event");

		match outcome {
			ScanOutcome::NoChange => {}
			ScanOutcome::Created => {
				let parent = path
					.parent()
					.map_or_else(|| path.clone(), Path::to_path_buf);
				self.unlink_dependent(&parent, &path);
				self.emit(&path, ChangeSet::CREATED, None);
			}
			ScanOutcome::Deleted => {
				if let Some(generic) = self.generic.as_mut() {
					generic.unwatch(&path);
				}
				self.emit(&path, ChangeSet::DELETED, None);
				self.watch_parent(&path);
			}
			ScanOutcome::Changed => {
				self.emit(&path, ChangeSet::CHANGED, None);

				if is_dir && !dependents.is_empty() {
					// the change may be the recreation of a dependent;
					// graduate the first one whose on-disk shape
					// matches its registration
					let graduate = dependents.into_iter().find(|dependent| {
						let on_disk_dir = scan::stat(dependent).map(|m| m.is_dir());
						let registered_dir = self.table.get(dependent).map(|e| e.is_dir);
						matches!(
							(on_disk_dir, registered_dir),
							(Some(observed), Some(registered)) if observed == registered
						)
					});

					if let Some(child) = graduate {
						self.unlink_dependent(&path, &child);
						if !self.use_generic(&child) && !self.use_kernel(&child) {
							self.use_poll(&child);
						}
						self.handle_generic_event(&child);
					}
				}
			}
		}
	}

	// ---- suspension ------------------------------------------------------

	fn stop_scan(&mut self, handle: HandleId) {
		self.stopped_handles.insert(handle);
		for path in self.table.paths() {
			self.stop_entry_scan(&path, Some(handle));
		}
	}

	/// Marks matching clients stopped. When nobody is left watching, a
	/// non-kernel entry forgets its recorded state: it cannot tell what
	/// happens while suspended, so the resume re-stat starts from
	/// scratch. Kernel entries keep state; their events keep flowing
	/// into the accumulators regardless.
	fn stop_entry_scan(&mut self, path: &Path, instance: Option<HandleId>) {
		let Some(entry) = self.table.get_mut(path) else {
			return;
		};

		let mut still_watching = 0;
		for client in &mut entry.clients {
			if instance.map_or(true, |handle| client.handle == handle) {
				client.stopped = true;
			} else if !client.stopped {
				still_watching += client.count;
			}
		}

		if still_watching == 0 && entry.mode != Some(BackendKind::Kernel) {
			entry.change_time = None;
			entry.status = PathStatus::Missing;
		}
	}

	fn start_scan(&mut self, handle: HandleId, notify: bool, skipped_too: bool) {
		self.stopped_handles.remove(&handle);
		if !notify {
			self.reset_list(handle, skipped_too);
		}
		for path in self.table.paths() {
			self.restart_entry_scan(&path, Some(handle), notify);
		}
	}

	/// Clears pending accumulations ahead of a resume. Stopped clients
	/// keep theirs unless `skipped_too` asks for a silent resume.
	fn reset_list(&mut self, handle: HandleId, skipped_too: bool) {
		for entry in self.table.iter_mut() {
			for client in &mut entry.clients {
				if client.handle == handle && (!client.stopped || skipped_too) {
					client.pending = ChangeSet::empty();
				}
			}
		}
	}

	/// Wakes stopped clients back up. The first resumption of an entry
	/// re-stats it (unless `notify` says not to look) and flushes
	/// whatever accumulated. Returns whether anything woke up.
	fn restart_entry_scan(
		&mut self,
		path: &Path,
		instance: Option<HandleId>,
		notify: bool,
	) -> bool {
		let (new_watching, first_resume) = {
			let Some(entry) = self.table.get_mut(path) else {
				return false;
			};

			let mut was_watching = 0;
			let mut new_watching = 0;
			for client in &mut entry.clients {
				if !client.stopped {
					was_watching += client.count;
				} else if instance.map_or(true, |handle| client.handle == handle) {
					client.stopped = false;
					new_watching += client.count;
				}
			}
			(new_watching, was_watching == 0)
		};

		if new_watching == 0 {
			return false;
		}

		let mut changes = ChangeSet::empty();
		if first_resume {
			if !notify {
				let metadata = scan::stat(path);
				let exists = metadata.is_some();
				if let Some(entry) = self.table.get_mut(path) {
					match &metadata {
						Some(metadata) => {
							entry.change_time = Some(scan::fingerprint(metadata));
							entry.status = PathStatus::Exists;
							entry.nlink = scan::link_count(metadata);
						}
						None => {
							entry.change_time = None;
							entry.status = PathStatus::Missing;
							entry.nlink = 0;
						}
					}
				}
				if exists {
					// alive again; drop any recreation parking
					let parent = path
						.parent()
						.map_or_else(|| path.to_path_buf(), Path::to_path_buf);
					self.unlink_dependent(&parent, path);
				}
			}

			if let Some(entry) = self.table.get_mut(path) {
				entry.poll_countdown_ms = 0;
				changes = scan::scan_entry(entry, 0).into();
			}
		}

		// flushes the accumulators even when the scan saw nothing
		self.emit(path, changes, None);
		true
	}

	fn stop_dir_scan(&mut self, handle: HandleId, path: &Path) -> bool {
		let Some(path) = normalize_path(path) else {
			return false;
		};
		if !self.table.get(&path).is_some_and(|entry| entry.is_dir) {
			return false;
		}

		self.stop_entry_scan(&path, Some(handle));
		true
	}

	fn restart_dir_scan(&mut self, handle: HandleId, path: &Path) -> bool {
		let Some(path) = normalize_path(path) else {
			return false;
		};
		if !self.table.get(&path).is_some_and(|entry| entry.is_dir) {
			return false;
		}

		self.restart_entry_scan(&path, Some(handle), false)
	}

	// ---- introspection ---------------------------------------------------

	fn statistics(&self) -> WatchStatistics {
		let entries = self
			.table
			.iter()
			.map(|entry| EntrySummary {
				path: entry.path.clone(),
				backend: entry.mode,
				exists: entry.status == PathStatus::Exists,
				is_dir: entry.is_dir,
				client_count: entry.clients.iter().map(|client| client.count).sum(),
				dependent_count: entry.dependents.len(),
				poll_interval_ms: (entry.mode == Some(BackendKind::Poll))
					.then_some(entry.poll_interval_ms),
			})
			.collect();

		WatchStatistics {
			entries,
			poll_period_ms: self.poll_period_ms,
		}
	}

	/// The strongest backend currently alive.
	fn active_backend(&self) -> BackendKind {
		if self.kernel.is_some() {
			BackendKind::Kernel
		} else if self.daemon.is_some() {
			BackendKind::Daemon
		} else if self.generic.is_some() {
			BackendKind::Generic
		} else {
			BackendKind::Poll
		}
	}
}

/// The starting set for dirty propagation: dependents of dirty kernel
/// and daemon entries, whose dirt means an event arrived. Polled and
/// generic entries re-stat on their own schedule and spread nothing.
fn dirty_roots(table: &EntryTable) -> Vec<PathBuf> {
	table
		.iter()
		.filter(|entry| {
			entry.dirty
				&& matches!(
					entry.mode,
					Some(BackendKind::Kernel | BackendKind::Daemon)
				)
		})
		.flat_map(|entry| entry.dependents.iter().cloned())
		.collect()
}
