//! Generic backend: the portable watcher from the `notify` crate.
//!
//! Last resort before polling. Its reports are treated as a bare
//! "something happened here" and the coordinator re-stats to find out
//! what; the event kinds `notify` classifies are deliberately ignored,
//! since their meaning varies by platform.

use std::{
	collections::HashSet,
	path::{Path, PathBuf},
};

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::RawEvent;

pub(crate) struct GenericBackend {
	watcher: RecommendedWatcher,
	watched: HashSet<PathBuf>,
}

impl GenericBackend {
	pub fn init(raw_events: mpsc::UnboundedSender<RawEvent>) -> Option<Self> {
		let watcher = RecommendedWatcher::new(
			move |result: notify::Result<Event>| match result {
				Ok(event) => {
					for path in event.paths {
						if raw_events.send(RawEvent::Generic(path)).is_err() {
							break;
						}
					}
				}
				Err(error) => trace!(?error, "generic watcher error"),
			},
			Config::default(),
		);

		match watcher {
			Ok(watcher) => Some(Self {
				watcher,
				watched: HashSet::new(),
			}),
			Err(error) => {
				debug!(?error, "generic watcher unavailable");
				None
			}
		}
	}

	/// Watches `path` itself, never recursing. Children of a watched
	/// directory are still reported, which is all the coordinator
	/// needs.
	pub fn watch(&mut self, path: &Path) -> bool {
		if self.watched.contains(path) {
			return true;
		}

		match self.watcher.watch(path, RecursiveMode::NonRecursive) {
			Ok(()) => {
				self.watched.insert(path.to_path_buf());
				true
			}
			Err(error) => {
				debug!(path = %path.display(), ?error, "generic watch refused");
				false
			}
		}
	}

	pub fn unwatch(&mut self, path: &Path) {
		if self.watched.remove(path) {
			let _ = self.watcher.unwatch(path);
		}
	}
}
