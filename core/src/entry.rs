//! Watched-path bookkeeping.
//!
//! One [`Entry`] exists per watched absolute path, no matter how many
//! handles registered it. Entries also exist for paths nobody asked
//! about directly: a watch on a missing path plants a dependent link on
//! its parent directory so the creation gets noticed, and removing the
//! last client or dependent tears the entry down.

use std::{
	collections::HashMap,
	path::{Path, PathBuf},
	time::SystemTime,
};

use crate::{
	config::BackendKind,
	event::{ChangeSet, WatchModes},
	service::HandleId,
};

/// Whether the path existed at the last reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PathStatus {
	Exists,
	Missing,
}

/// One handle's registration on an entry.
#[derive(Debug)]
pub(crate) struct Client {
	pub handle: HandleId,
	/// The same handle may register the same path several times; the
	/// client survives until as many removals arrive.
	pub count: u32,
	pub modes: WatchModes,
	/// While stopped, events accumulate in `pending` instead of being
	/// delivered.
	pub stopped: bool,
	pub pending: ChangeSet,
}

/// State for one watched path.
#[derive(Debug)]
pub(crate) struct Entry {
	pub path: PathBuf,
	/// Sticky: decided at registration and never flipped, even if the
	/// path is later recreated as the other kind. Symlinks count as
	/// files.
	pub is_dir: bool,
	pub status: PathStatus,
	/// The newer of ctime and mtime at the last reconciliation. `None`
	/// until the path has been seen to exist.
	pub change_time: Option<SystemTime>,
	pub nlink: u64,
	/// Sticky backend assignment. `None` until a backend accepts the
	/// entry; noisy files never get one and are never scanned.
	pub mode: Option<BackendKind>,
	/// Kernel watch descriptor, when `mode` is `Kernel` and the path
	/// exists.
	pub watch_descriptor: Option<i32>,
	/// Daemon request number, when `mode` is `Daemon` and the path
	/// exists.
	pub daemon_request: Option<u32>,
	/// Set by backend events, cleared by the next reconciliation scan.
	pub dirty: bool,
	/// Stat interval for this entry when polled, in milliseconds.
	pub poll_interval_ms: u64,
	/// Milliseconds until this polled entry is due for a stat.
	pub poll_countdown_ms: i64,
	pub clients: Vec<Client>,
	/// Paths of missing entries watching this one for their own
	/// recreation.
	pub dependents: Vec<PathBuf>,
	/// Children the kernel backend reported modified since the last
	/// sweep; the sweep dispatches them deduplicated.
	pub pending_children: Vec<PathBuf>,
}

impl Entry {
	pub fn new(path: PathBuf, is_dir: bool) -> Self {
		Self {
			path,
			is_dir,
			status: PathStatus::Missing,
			change_time: None,
			nlink: 0,
			mode: None,
			watch_descriptor: None,
			daemon_request: None,
			dirty: false,
			poll_interval_ms: 0,
			poll_countdown_ms: 0,
			clients: Vec::new(),
			dependents: Vec::new(),
			pending_children: Vec::new(),
		}
	}

	/// An entry with no clients and no dependents no longer justifies
	/// its watch.
	pub fn is_valid(&self) -> bool {
		!self.clients.is_empty() || !self.dependents.is_empty()
	}

	/// Registers `handle` on this entry, or bumps its refcount if it is
	/// already here. Re-registration replaces the watch modes.
	pub fn add_client(&mut self, handle: HandleId, modes: WatchModes, stopped: bool) {
		if let Some(client) = self.clients.iter_mut().find(|c| c.handle == handle) {
			client.count += 1;
			client.modes = modes;
			return;
		}

		self.clients.push(Client {
			handle,
			count: 1,
			modes,
			stopped,
			pending: ChangeSet::empty(),
		});
	}

	/// Drops one registration of `handle`; the client itself goes only
	/// when its refcount reaches zero.
	pub fn remove_client(&mut self, handle: HandleId) {
		if let Some(position) = self.clients.iter().position(|c| c.handle == handle) {
			let client = &mut self.clients[position];
			client.count -= 1;
			if client.count == 0 {
				self.clients.remove(position);
			}
		}
	}

	pub fn remove_dependent(&mut self, path: &Path) {
		self.dependents.retain(|dependent| dependent != path);
	}

	/// The directory that contains (or would contain) this path.
	pub fn parent_directory(&self) -> PathBuf {
		self.path
			.parent()
			.map_or_else(|| self.path.clone(), Path::to_path_buf)
	}
}

/// All entries, keyed by normalized absolute path.
#[derive(Debug, Default)]
pub(crate) struct EntryTable {
	entries: HashMap<PathBuf, Entry>,
}

impl EntryTable {
	pub fn get(&self, path: &Path) -> Option<&Entry> {
		self.entries.get(path)
	}

	pub fn get_mut(&mut self, path: &Path) -> Option<&mut Entry> {
		self.entries.get_mut(path)
	}

	pub fn contains(&self, path: &Path) -> bool {
		self.entries.contains_key(path)
	}

	pub fn insert(&mut self, entry: Entry) {
		self.entries.insert(entry.path.clone(), entry);
	}

	pub fn remove(&mut self, path: &Path) -> Option<Entry> {
		self.entries.remove(path)
	}

	pub fn iter(&self) -> impl Iterator<Item = &Entry> {
		self.entries.values()
	}

	pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Entry> {
		self.entries.values_mut()
	}

	/// Snapshot of all paths, for iteration that mutates the table.
	pub fn paths(&self) -> Vec<PathBuf> {
		self.entries.keys().cloned().collect()
	}

	/// Linear scan by kernel watch descriptor. Tables stay small enough
	/// that no reverse index is kept.
	pub fn path_by_watch_descriptor(&self, watch_descriptor: i32) -> Option<PathBuf> {
		self.entries
			.values()
			.find(|entry| entry.watch_descriptor == Some(watch_descriptor))
			.map(|entry| entry.path.clone())
	}

	/// Linear scan by daemon request number.
	pub fn path_by_daemon_request(&self, request: u32) -> Option<PathBuf> {
		self.entries
			.values()
			.find(|entry| entry.daemon_request == Some(request))
			.map(|entry| entry.path.clone())
	}
}

/// Normalizes a user-supplied path for table lookup: trailing slashes,
/// repeated separators and `.` components are dropped. `..` is kept
/// as-is, since resolving it lexically would lie about symlinked trees.
/// Relative and empty paths are rejected.
pub(crate) fn normalize_path(path: &Path) -> Option<PathBuf> {
	if path.as_os_str().is_empty() || path.is_relative() {
		return None;
	}

	Some(path.components().collect())
}

/// Device-special paths generate storms of spurious events and are
/// silently refused.
pub(crate) fn is_device_path(path: &Path) -> bool {
	path.starts_with("/dev")
}
