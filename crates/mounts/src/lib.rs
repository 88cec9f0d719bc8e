//! Mount table introspection for watcher backend selection.
//!
//! Kernel change notification is unreliable on network and automounted
//! filesystems: changes made by another host never reach the local kernel,
//! and automounters expire mounts under the watcher's feet. Watchers poll
//! such locations instead, so this crate answers the one question they
//! need answered: is the filesystem under a given path probably slow?

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MountError {
	#[error("unable to read mount table: {0}")]
	Io(#[from] std::io::Error),
}

/// One row of the system mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
	/// Device or remote source the filesystem was mounted from.
	pub source: String,
	pub mount_point: PathBuf,
	pub fs_type: String,
	pub options: Vec<String>,
}

impl MountPoint {
	/// Whether changes under this mount are likely to bypass kernel
	/// notification. Covers remote filesystems and automounters, plus
	/// anything mounted from a `//server/share` style source.
	pub fn is_probably_slow(&self) -> bool {
		matches!(
			self.fs_type.as_str(),
			"nfs"
				| "nfs4"
				| "cifs"
				| "smbfs"
				| "smb3"
				| "sshfs"
				| "fuse.sshfs"
				| "fuse.rclone"
				| "autofs"
				| "subfs"
				| "9p"
				| "davfs"
				| "afs"
		) || self.source.starts_with("//")
	}
}

/// Snapshot of the mounted filesystems, queryable by path.
#[derive(Debug, Default, Clone)]
pub struct MountTable {
	mounts: Vec<MountPoint>,
}

impl MountTable {
	/// Reads the current mount table. Comes back empty on platforms
	/// without one.
	pub fn load() -> Result<Self, MountError> {
		#[cfg(target_os = "linux")]
		{
			let raw = std::fs::read_to_string("/proc/self/mounts")
				.or_else(|_| std::fs::read_to_string("/etc/mtab"))?;
			Ok(Self::parse(&raw))
		}

		#[cfg(not(target_os = "linux"))]
		Ok(Self::default())
	}

	/// Parses mtab format text: one `source mountpoint fstype options ...`
	/// row per line, whitespace inside fields octal-escaped.
	pub fn parse(raw: &str) -> Self {
		let mounts = raw
			.lines()
			.filter(|line| !line.is_empty() && !line.starts_with('#'))
			.filter_map(|line| {
				let mut fields = line.split_whitespace();
				let source = unescape(fields.next()?);
				let mount_point = PathBuf::from(unescape(fields.next()?));
				let fs_type = fields.next()?.to_string();
				let options = fields
					.next()
					.map(|raw| raw.split(',').map(str::to_string).collect())
					.unwrap_or_default();

				Some(MountPoint {
					source,
					mount_point,
					fs_type,
					options,
				})
			})
			.collect();

		Self { mounts }
	}

	/// The mount containing `path`: the one whose mount point is the
	/// longest prefix of it.
	pub fn find(&self, path: impl AsRef<Path>) -> Option<&MountPoint> {
		let path = path.as_ref();
		self.mounts
			.iter()
			.filter(|mount| path.starts_with(&mount.mount_point))
			.max_by_key(|mount| mount.mount_point.as_os_str().len())
	}

	/// Whether `path` sits on a mount that delivers unreliable kernel
	/// events. Unknown paths are assumed fast.
	pub fn is_probably_slow(&self, path: impl AsRef<Path>) -> bool {
		self.find(path).is_some_and(MountPoint::is_probably_slow)
	}
}

/// Undoes the mtab octal escapes: `\040` space, `\011` tab, `\012`
/// newline and `\134` backslash.
fn unescape(field: &str) -> String {
	let mut out = String::with_capacity(field.len());
	let mut chars = field.chars();

	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}

		let code: String = chars.by_ref().take(3).collect();
		match code.as_str() {
			"040" => out.push(' '),
			"011" => out.push('\t'),
			"012" => out.push('\n'),
			"134" => out.push('\\'),
			other => {
				out.push('\\');
				out.push_str(other);
			}
		}
	}

	out
}
