//! Change detection backends.
//!
//! Each backend turns its native notification mechanism into
//! [`RawEvent`]s on a single channel owned by the coordinator, which
//! does all entry bookkeeping itself. Backends hold no entry state
//! beyond what their own mechanism requires (watch descriptors, request
//! numbers, watched path sets).

use std::{ffi::OsString, path::PathBuf};

pub(crate) mod daemon;
pub(crate) mod generic;

#[cfg(target_os = "linux")]
pub(crate) mod kernel;

pub(crate) use daemon::{DaemonCode, DaemonNotification, DaemonSession};
pub(crate) use generic::GenericBackend;

#[cfg(target_os = "linux")]
pub(crate) use kernel::KernelBackend;

/// One notification from a backend, before any entry lookup.
#[derive(Debug)]
pub(crate) enum RawEvent {
	/// Kernel event on a watch descriptor. One kernel record can carry
	/// several of these.
	Kernel { descriptor: i32, signal: KernelSignal },
	/// One decoded line from the monitoring daemon.
	Daemon(DaemonNotification),
	/// The daemon connection died; its entries need new homes.
	DaemonGone,
	/// The generic watcher saw activity at or under this path.
	Generic(PathBuf),
}

/// What a kernel event record means, decoded away from any specific
/// kernel API.
#[derive(Debug)]
pub(crate) enum KernelSignal {
	/// The watched path itself was deleted or moved away.
	SelfGone,
	/// The watched path's own metadata changed.
	SelfChanged,
	/// A directory entry appeared (created or moved in).
	ChildCreated(OsString),
	/// A directory entry vanished (deleted or moved out).
	ChildGone(OsString),
	/// A child's contents or metadata changed.
	ChildChanged(OsString),
}

/// Stub for platforms without a native kernel event interface; init
/// always declines, so entries fall through to the next backend.
#[cfg(not(target_os = "linux"))]
pub(crate) struct KernelBackend;

#[cfg(not(target_os = "linux"))]
impl KernelBackend {
	pub fn init(_raw_events: tokio::sync::mpsc::UnboundedSender<RawEvent>) -> Option<Self> {
		None
	}

	pub fn add(&mut self, _path: &std::path::Path, _is_dir: bool) -> Option<i32> {
		None
	}

	pub fn remove(&mut self, _descriptor: i32) {}

	pub fn shutdown(self) {}
}
