//! Event types delivered to watchers, and the bit sets used to build
//! them.

use std::{ffi::OsStr, path::PathBuf};

use bitflags::bitflags;

bitflags! {
	/// Which implicit child changes a directory watcher cares about,
	/// beyond the directory entry itself.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct WatchModes: u32 {
		/// Also watch subdirectories, registering them recursively.
		const SUB_DIRS = 0b01;
		/// Also watch files directly inside the directory.
		const FILES = 0b10;
	}
}

impl WatchModes {
	/// Watch only the directory entry itself.
	pub const DIR_ONLY: Self = Self::empty();
}

impl Default for WatchModes {
	fn default() -> Self {
		Self::DIR_ONLY
	}
}

bitflags! {
	/// Accumulated change classification for one client between
	/// dispatches.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub(crate) struct ChangeSet: u8 {
		const CHANGED = 0b001;
		const CREATED = 0b010;
		const DELETED = 0b100;
	}
}

impl ChangeSet {
	/// Folds a fresh observation into a pending accumulator. Created and
	/// Deleted supersede whatever came before; Changed only piles on.
	pub(crate) fn accumulate(self, incoming: ChangeSet) -> ChangeSet {
		if incoming.intersects(ChangeSet::CREATED | ChangeSet::DELETED) {
			incoming
		} else {
			self | incoming
		}
	}
}

/// What happened to a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
	Created,
	Changed,
	Deleted,
}

/// One change notification, delivered on a
/// [`WatchHandle`](crate::service::WatchHandle)'s event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
	pub path: PathBuf,
	pub kind: EventKind,
}

/// Files that churn constantly and would flood watchers with useless
/// notifications: X server and session error logs that grow on every
/// write, and the fontconfig cache rewritten at application startup.
pub(crate) fn is_noisy_file(name: &OsStr) -> bool {
	let Some(name) = name.to_str() else {
		return false;
	};

	name.starts_with(".X.err")
		|| name.starts_with(".xsession-errors")
		|| name.starts_with(".fonts.cache")
}
