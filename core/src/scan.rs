//! Per-entry reconciliation: compare an entry's recorded state against
//! a fresh stat and classify what happened since the last look.

use std::{
	fs::Metadata,
	path::Path,
	time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::{
	config::BackendKind,
	entry::{Entry, PathStatus},
	event::ChangeSet,
};

/// What one reconciliation pass concluded about an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanOutcome {
	NoChange,
	Created,
	Changed,
	Deleted,
}

impl From<ScanOutcome> for ChangeSet {
	fn from(outcome: ScanOutcome) -> Self {
		match outcome {
			ScanOutcome::NoChange => ChangeSet::empty(),
			ScanOutcome::Created => ChangeSet::CREATED,
			ScanOutcome::Changed => ChangeSet::CHANGED,
			ScanOutcome::Deleted => ChangeSet::DELETED,
		}
	}
}

/// The newer of ctime and mtime. Editors that restore mtime after a
/// rewrite still bump ctime, and metadata-only changes (chmod, link
/// count) never touch mtime at all.
pub(crate) fn fingerprint(metadata: &Metadata) -> SystemTime {
	let mtime = metadata.modified().unwrap_or(UNIX_EPOCH);

	#[cfg(unix)]
	{
		use std::os::unix::fs::MetadataExt;

		let ctime = UNIX_EPOCH
			+ Duration::from_secs(u64::try_from(metadata.ctime()).unwrap_or(0))
			+ Duration::from_nanos(u64::try_from(metadata.ctime_nsec()).unwrap_or(0));
		mtime.max(ctime)
	}

	#[cfg(not(unix))]
	mtime
}

pub(crate) fn link_count(metadata: &Metadata) -> u64 {
	#[cfg(unix)]
	{
		use std::os::unix::fs::MetadataExt;
		metadata.nlink()
	}

	#[cfg(not(unix))]
	1
}

/// Stats `path` following symlinks, the same way watch registration
/// does.
pub(crate) fn stat(path: &Path) -> Option<Metadata> {
	std::fs::metadata(path).ok()
}

/// Re-stats `entry` and updates its recorded state in place.
///
/// Event-driven entries are only scanned when a backend marked them
/// dirty; polled entries run a countdown decremented by `tick_ms` and
/// are scanned when it reaches zero. Entries without a backend are
/// never scanned at all.
///
/// Generic-mode entries report [`ScanOutcome::Changed`] whenever the
/// path exists, trusting the backend's word over the fingerprint: the
/// generic watcher says only that something happened, and a same-second
/// rewrite would otherwise slip through unnoticed.
pub(crate) fn scan_entry(entry: &mut Entry, tick_ms: u64) -> ScanOutcome {
	match entry.mode {
		Some(BackendKind::Kernel | BackendKind::Daemon | BackendKind::Generic) => {
			if !entry.dirty {
				return ScanOutcome::NoChange;
			}
			entry.dirty = false;
		}
		Some(BackendKind::Poll) => {
			entry.poll_countdown_ms -= i64::try_from(tick_ms).unwrap_or(i64::MAX);
			if entry.poll_countdown_ms > 0 {
				return ScanOutcome::NoChange;
			}
			entry.poll_countdown_ms += i64::try_from(entry.poll_interval_ms).unwrap_or(i64::MAX);
		}
		None => return ScanOutcome::NoChange,
	}

	let Some(metadata) = stat(&entry.path) else {
		// A recorded fingerprint means the path was seen alive, even if
		// a backend already flagged the entry missing; clearing it here
		// makes Deleted fire once per existence.
		if entry.change_time.is_some() {
			entry.change_time = None;
			entry.status = PathStatus::Missing;
			entry.nlink = 0;
			return ScanOutcome::Deleted;
		}

		entry.status = PathStatus::Missing;
		return ScanOutcome::NoChange;
	};

	let observed = fingerprint(&metadata);
	let observed_nlink = link_count(&metadata);

	if entry.status == PathStatus::Missing {
		entry.change_time = Some(observed);
		entry.nlink = observed_nlink;
		entry.status = PathStatus::Exists;
		return ScanOutcome::Created;
	}

	let recorded_time = entry.change_time;
	let recorded_nlink = entry.nlink;
	entry.change_time = Some(observed);
	entry.nlink = observed_nlink;

	let fingerprint_moved = recorded_time != Some(observed) || recorded_nlink != observed_nlink;
	if fingerprint_moved || entry.mode == Some(BackendKind::Generic) {
		return ScanOutcome::Changed;
	}

	ScanOutcome::NoChange
}
