//! Runtime configuration for the watch service.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Stat interval for polled entries, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Stat interval for polled entries on network mounts, in milliseconds.
/// Remote stats are expensive, so they run an order of magnitude slower.
pub const DEFAULT_REMOTE_POLL_INTERVAL_MS: u64 = 5000;

/// A change detection backend.
///
/// Every entry is pinned to exactly one backend when registered and
/// keeps it for life; a path that cannot get its preferred backend falls
/// down [`FALLBACK_ORDER`] until one accepts it. Polling accepts
/// anything.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BackendKind {
	/// Native kernel event interface (inotify on Linux).
	Kernel,
	/// External monitoring daemon reached over a unix socket.
	Daemon,
	/// Portable watcher built on the `notify` crate. Reports that
	/// something changed, never what.
	Generic,
	/// Periodic stat polling.
	Poll,
}

/// Backends tried in order for an entry whose preferred backend refused
/// it.
pub(crate) const FALLBACK_ORDER: [BackendKind; 4] = [
	BackendKind::Kernel,
	BackendKind::Daemon,
	BackendKind::Generic,
	BackendKind::Poll,
];

/// Configuration a [`WatchService`](crate::service::WatchService) is
/// built with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct WatchConfig {
	/// Backend tried first for new watches.
	pub preferred_backend: BackendKind,
	/// Backend tried first for watches on slow (network) mounts. `None`
	/// falls back to `preferred_backend`.
	pub remote_preferred_backend: Option<BackendKind>,
	/// Stat interval for polled entries, in milliseconds.
	pub poll_interval_ms: u64,
	/// Stat interval for polled entries on slow mounts, in milliseconds.
	pub remote_poll_interval_ms: u64,
	/// Socket path of an external monitoring daemon. `None` disables the
	/// daemon backend.
	pub daemon_socket: Option<PathBuf>,
}

impl Default for WatchConfig {
	fn default() -> Self {
		Self {
			preferred_backend: BackendKind::Kernel,
			remote_preferred_backend: None,
			poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
			remote_poll_interval_ms: DEFAULT_REMOTE_POLL_INTERVAL_MS,
			daemon_socket: None,
		}
	}
}

impl WatchConfig {
	/// The backend to try first for a path, given the slow verdict of
	/// its mount.
	pub(crate) fn preferred_for(&self, probably_slow: bool) -> BackendKind {
		if probably_slow {
			self.remote_preferred_backend
				.unwrap_or(self.preferred_backend)
		} else {
			self.preferred_backend
		}
	}

	/// The poll interval for a path, given the slow verdict of its
	/// mount.
	pub(crate) fn poll_interval_for(&self, probably_slow: bool) -> u64 {
		if probably_slow {
			self.remote_poll_interval_ms
		} else {
			self.poll_interval_ms
		}
	}
}
