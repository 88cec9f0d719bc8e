//! Kernel backend: inotify.
//!
//! One inotify instance serves every entry. A reader task decodes the
//! event stream into [`KernelSignal`]s and forwards them to the
//! coordinator; watch management happens synchronously through a
//! cloned [`Watches`] handle, so adding and removing never touches the
//! reader.

use std::{collections::HashMap, ffi::OsString, path::Path};

use futures::StreamExt;
use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use super::{KernelSignal, RawEvent};

pub(crate) struct KernelBackend {
	watches: Watches,
	/// Raw descriptor ids to the kernel's owned descriptors, for
	/// removal. Entries store only the id.
	descriptors: HashMap<i32, WatchDescriptor>,
	reader: JoinHandle<()>,
}

impl KernelBackend {
	/// Sets up the inotify instance and its reader task. `None` when the
	/// kernel refuses (fd limits, unsupported kernel).
	pub fn init(raw_events: mpsc::UnboundedSender<RawEvent>) -> Option<Self> {
		let instance = match Inotify::init() {
			Ok(instance) => instance,
			Err(error) => {
				debug!(?error, "inotify unavailable");
				return None;
			}
		};

		let watches = instance.watches();
		let mut stream = match instance.into_event_stream([0u8; 4096]) {
			Ok(stream) => stream,
			Err(error) => {
				debug!(?error, "inotify event stream setup failed");
				return None;
			}
		};

		let reader = tokio::spawn(async move {
			while let Some(event) = stream.next().await {
				let event = match event {
					Ok(event) => event,
					Err(error) => {
						warn!(?error, "inotify read failed, kernel backend going quiet");
						return;
					}
				};

				let descriptor = event.wd.get_watch_descriptor_id();
				for signal in decode(event.mask, event.name) {
					if raw_events
						.send(RawEvent::Kernel { descriptor, signal })
						.is_err()
					{
						return;
					}
				}
			}
		});

		Some(Self {
			watches,
			descriptors: HashMap::new(),
			reader,
		})
	}

	/// Watches `path`, returning the descriptor id. Re-adding a watched
	/// path updates its mask in place and returns the same id. `None`
	/// when the kernel refuses (watch budget, permissions, vanished
	/// path).
	pub fn add(&mut self, path: &Path, is_dir: bool) -> Option<i32> {
		let mut mask = WatchMask::CREATE
			| WatchMask::DELETE
			| WatchMask::DELETE_SELF
			| WatchMask::MOVED_FROM
			| WatchMask::MOVED_TO
			| WatchMask::MOVE_SELF
			| WatchMask::MODIFY
			| WatchMask::ATTRIB
			| WatchMask::DONT_FOLLOW;
		if is_dir {
			// refuse the watch rather than misreport if the path got
			// swapped for a non-directory meanwhile
			mask |= WatchMask::ONLYDIR;
		}

		match self.watches.add(path, mask) {
			Ok(descriptor) => {
				let id = descriptor.get_watch_descriptor_id();
				self.descriptors.insert(id, descriptor);
				Some(id)
			}
			Err(error) => {
				debug!(path = %path.display(), ?error, "inotify watch refused");
				None
			}
		}
	}

	pub fn remove(&mut self, descriptor: i32) {
		if let Some(descriptor) = self.descriptors.remove(&descriptor) {
			// fails harmlessly when the kernel already dropped the
			// watch with the watched path
			let _ = self.watches.remove(descriptor);
		}
	}

	pub fn shutdown(self) {
		self.reader.abort();
	}
}

/// Maps one kernel event record to its meaning. Records can combine
/// bits, so this can yield more than one signal.
fn decode(mask: EventMask, name: Option<OsString>) -> Vec<KernelSignal> {
	let mut signals = Vec::new();

	if mask.intersects(EventMask::DELETE_SELF | EventMask::MOVE_SELF) {
		signals.push(KernelSignal::SelfGone);
	}

	if mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
		if let Some(name) = &name {
			signals.push(KernelSignal::ChildCreated(name.clone()));
		}
	}

	if mask.intersects(EventMask::DELETE | EventMask::MOVED_FROM) {
		if let Some(name) = &name {
			signals.push(KernelSignal::ChildGone(name.clone()));
		}
	}

	if mask.intersects(EventMask::MODIFY | EventMask::ATTRIB) {
		match name {
			Some(name) => signals.push(KernelSignal::ChildChanged(name)),
			None => signals.push(KernelSignal::SelfChanged),
		}
	}

	signals
}
