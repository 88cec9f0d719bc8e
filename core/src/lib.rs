//! File and directory change notification.
//!
//! A [`WatchService`] watches paths on behalf of any number of
//! subscribers and tells each one, on its own channel, when a watched
//! path is created, changed or deleted. Change detection prefers the
//! native kernel interface and degrades per path through an external
//! monitoring daemon and a portable watcher down to stat polling, so a
//! watch always works; it just gets slower.
//!
//! ```no_run
//! use vigil_core::{WatchConfig, WatchModes, WatchService};
//!
//! # async fn demo() -> Result<(), vigil_core::WatchError> {
//! let service = WatchService::new(WatchConfig::default());
//! let handle = service.handle();
//!
//! handle
//! 	.add_dir("/etc", WatchModes::SUB_DIRS | WatchModes::FILES)
//! 	.await?;
//!
//! while let Ok(event) = handle.next_event().await {
//! 	println!("{:?} {}", event.kind, event.path.display());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod service;

mod backend;
mod entry;
mod scan;

pub use config::{BackendKind, WatchConfig};
pub use error::WatchError;
pub use event::{EventKind, WatchEvent, WatchModes};
pub use service::{EntrySummary, WatchHandle, WatchService, WatchStatistics};

pub use vigil_mounts as mounts;
