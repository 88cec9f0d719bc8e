//! Error types for the watch service.
//!
//! Almost nothing here, on purpose: backend trouble (a dead daemon, an
//! exhausted kernel watch budget, an unreadable directory) never reaches
//! the caller. Affected entries degrade to a weaker backend instead, and
//! bad paths are silent no-ops. The only failure a caller can see is the
//! service itself being gone.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatchError {
	/// The coordinator task has stopped; no further commands can be
	/// serviced.
	#[error("watch service already shut down")]
	ServiceStopped,
}
