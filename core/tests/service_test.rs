//! Watch Service Integration Test
//!
//! Drives the service against a real filesystem through the whole
//! story: registration, event delivery per backend, suspend and
//! resume, recreation of missing paths, and backend fallback.

#![allow(clippy::unwrap_used)]

use std::{fs, path::Path, time::Duration};

use tempfile::TempDir;
use tokio::time::{sleep, timeout, Instant};
use vigil_core::{
	BackendKind, EventKind, WatchConfig, WatchEvent, WatchHandle, WatchModes, WatchService,
};

fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| "info".into()),
		)
		.with_test_writer()
		.try_init();
}

/// Waits until the handle delivers the wanted event for the wanted
/// path, ignoring unrelated chatter (a directory reporting itself
/// changed when a child appears, for example).
async fn wait_for(handle: &WatchHandle, path: &Path, kind: EventKind) -> WatchEvent {
	let result = timeout(Duration::from_secs(10), async {
		loop {
			let event = handle.next_event().await.unwrap();
			if event.path == path && event.kind == kind {
				return event;
			}
		}
	})
	.await;

	match result {
		Ok(event) => event,
		Err(_) => panic!("timed out waiting for {kind:?} on {}", path.display()),
	}
}

/// Collects everything delivered within `window`.
async fn drain_for(handle: &WatchHandle, window: Duration) -> Vec<WatchEvent> {
	let mut events = Vec::new();
	let deadline = Instant::now() + window;

	loop {
		let remaining = deadline.saturating_duration_since(Instant::now());
		if remaining.is_zero() {
			break;
		}
		match timeout(remaining, handle.next_event()).await {
			Ok(Ok(event)) => events.push(event),
			_ => break,
		}
	}

	events
}

fn poll_config(interval_ms: u64) -> WatchConfig {
	WatchConfig {
		preferred_backend: BackendKind::Poll,
		poll_interval_ms: interval_ms,
		..Default::default()
	}
}

// ============================================================================
// Lifecycle over polling (works on every platform)
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn file_lifecycle_over_polling() {
	init_tracing();
	let dir = TempDir::new().unwrap();
	let file = dir.path().join("story.txt");

	let service = WatchService::new(poll_config(100));
	let handle = service.handle();
	handle.add_file(&file).await.unwrap();
	assert!(handle.contains(&file).await.unwrap());

	fs::write(&file, b"chapter one").unwrap();
	wait_for(&handle, &file, EventKind::Created).await;

	// a later write moves the fingerprint
	sleep(Duration::from_millis(50)).await;
	fs::write(&file, b"chapter two, longer").unwrap();
	wait_for(&handle, &file, EventKind::Changed).await;

	fs::remove_file(&file).unwrap();
	wait_for(&handle, &file, EventKind::Deleted).await;

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn fallback_lands_on_polling() {
	init_tracing();
	let dir = TempDir::new().unwrap();
	let file = dir.path().join("f.txt");
	fs::write(&file, b"x").unwrap();

	let service = WatchService::new(poll_config(120));
	let handle = service.handle();
	handle.add_dir(dir.path(), WatchModes::DIR_ONLY).await.unwrap();
	handle.add_file(&file).await.unwrap();

	let stats = service.statistics().await.unwrap();
	assert_eq!(stats.entries.len(), 2);
	assert_eq!(stats.backend_count(BackendKind::Poll), 2);
	assert_eq!(stats.poll_period_ms, Some(120));

	let summary = stats
		.entries
		.iter()
		.find(|entry| entry.path == file)
		.unwrap();
	assert_eq!(summary.backend, Some(BackendKind::Poll));
	assert_eq!(summary.poll_interval_ms, Some(120));
	assert!(summary.exists);
	assert!(!summary.is_dir);

	// removing the only registrations stops the timer
	handle.remove_dir(dir.path()).await.unwrap();
	handle.remove_file(&file).await.unwrap();
	let stats = service.statistics().await.unwrap();
	assert!(stats.entries.is_empty());
	assert_eq!(stats.poll_period_ms, None);

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn registration_refcounts_per_handle() {
	init_tracing();
	let dir = TempDir::new().unwrap();
	let file = dir.path().join("counted.txt");
	fs::write(&file, b"x").unwrap();

	let service = WatchService::new(poll_config(100));
	let handle = service.handle();

	handle.add_file(&file).await.unwrap();
	handle.add_file(&file).await.unwrap();

	handle.remove_file(&file).await.unwrap();
	assert!(
		handle.contains(&file).await.unwrap(),
		"one removal must not undo two registrations"
	);

	handle.remove_file(&file).await.unwrap();
	assert!(!handle.contains(&file).await.unwrap());
	assert!(service.statistics().await.unwrap().entries.is_empty());

	// fully removed watches deliver nothing
	fs::write(&file, b"changed after removal").unwrap();
	assert!(drain_for(&handle, Duration::from_millis(300)).await.is_empty());

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_path_graduates_on_creation() {
	init_tracing();
	let dir = TempDir::new().unwrap();
	let file = dir.path().join("not-yet.txt");

	let service = WatchService::new(WatchConfig::default());
	let handle = service.handle();
	handle.add_file(&file).await.unwrap();
	assert!(handle.contains(&file).await.unwrap());

	fs::write(&file, b"here now").unwrap();
	wait_for(&handle, &file, EventKind::Created).await;

	// the recreated path must have a live watch of its own again
	sleep(Duration::from_millis(100)).await;
	fs::write(&file, b"and changed after that").unwrap();
	wait_for(&handle, &file, EventKind::Changed).await;

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn watch_handles_are_isolated() {
	init_tracing();
	let dir = TempDir::new().unwrap();
	let file = dir.path().join("shared.txt");
	fs::write(&file, b"x").unwrap();

	let service = WatchService::new(poll_config(100));
	let watcher = service.handle();
	let bystander = service.handle();

	watcher.add_file(&file).await.unwrap();

	sleep(Duration::from_millis(50)).await;
	fs::write(&file, b"different length now").unwrap();
	wait_for(&watcher, &file, EventKind::Changed).await;
	assert!(
		drain_for(&bystander, Duration::from_millis(300)).await.is_empty(),
		"a handle without registrations must stay silent"
	);
	assert!(!bystander.contains(&file).await.unwrap());

	// both subscribers of the same path hear its deletion
	bystander.add_file(&file).await.unwrap();
	fs::remove_file(&file).unwrap();
	wait_for(&watcher, &file, EventKind::Deleted).await;
	wait_for(&bystander, &file, EventKind::Deleted).await;

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn changes_while_suspended_collapse_on_resume() {
	init_tracing();
	let dir = TempDir::new().unwrap();
	let file = dir.path().join("batched.txt");
	fs::write(&file, b"start").unwrap();

	let service = WatchService::new(poll_config(100));
	let handle = service.handle();
	handle.add_file(&file).await.unwrap();

	// several sweeps observe the file while nobody is listening
	handle.stop_scan().await.unwrap();
	for content in ["one", "two again", "three more still"] {
		fs::write(&file, content).unwrap();
		sleep(Duration::from_millis(150)).await;
	}
	assert!(
		drain_for(&handle, Duration::from_millis(200)).await.is_empty(),
		"nothing may be delivered while suspended"
	);

	handle.start_scan(false, false).await.unwrap();
	let kinds: Vec<_> = drain_for(&handle, Duration::from_millis(400))
		.await
		.iter()
		.map(|event| event.kind)
		.collect();
	assert_eq!(
		kinds,
		vec![EventKind::Created, EventKind::Changed],
		"the backlog must flush as one Created and one Changed"
	);

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn device_and_noisy_paths_are_refused_quietly() {
	init_tracing();
	let dir = TempDir::new().unwrap();
	let noisy = dir.path().join(".xsession-errors");
	fs::write(&noisy, b"spam").unwrap();

	let service = WatchService::new(WatchConfig::default());
	let handle = service.handle();

	handle.add_file("/dev/null").await.unwrap();
	assert!(!handle.contains("/dev/null").await.unwrap());

	handle.add_file(&noisy).await.unwrap();
	assert!(handle.contains(&noisy).await.unwrap());
	let stats = service.statistics().await.unwrap();
	let summary = stats
		.entries
		.iter()
		.find(|entry| entry.path == noisy)
		.unwrap();
	assert_eq!(summary.backend, None, "noisy files get no backend");

	fs::write(&noisy, b"more spam").unwrap();
	assert!(drain_for(&handle, Duration::from_millis(300)).await.is_empty());

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_dir_scan_only_affects_directories() {
	init_tracing();
	let dir = TempDir::new().unwrap();
	let file = dir.path().join("f.txt");
	fs::write(&file, b"x").unwrap();

	let service = WatchService::new(poll_config(100));
	let handle = service.handle();
	handle.add_dir(dir.path(), WatchModes::DIR_ONLY).await.unwrap();
	handle.add_file(&file).await.unwrap();

	assert!(!handle.stop_dir_scan(&file).await.unwrap());
	assert!(!handle.stop_dir_scan("/nowhere/at/all").await.unwrap());
	assert!(handle.stop_dir_scan(dir.path()).await.unwrap());
	assert!(handle.restart_dir_scan(dir.path()).await.unwrap());

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn last_change_time_reports_recorded_stamp() {
	init_tracing();
	let dir = TempDir::new().unwrap();
	let file = dir.path().join("stamped.txt");
	fs::write(&file, b"x").unwrap();

	let service = WatchService::new(poll_config(100));
	let handle = service.handle();
	handle.add_file(&file).await.unwrap();

	assert!(handle.last_change_time(&file).await.unwrap().is_some());
	assert!(handle
		.last_change_time(dir.path().join("unwatched"))
		.await
		.unwrap()
		.is_none());

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_ends_handles() {
	init_tracing();
	let dir = TempDir::new().unwrap();

	let service = WatchService::new(WatchConfig::default());
	let handle = service.handle();
	handle.add_dir(dir.path(), WatchModes::DIR_ONLY).await.unwrap();

	service.shutdown().await;

	assert!(handle.add_dir(dir.path(), WatchModes::DIR_ONLY).await.is_err());
	assert!(handle.next_event().await.is_err());
}

// ============================================================================
// Kernel backend behavior (event semantics need inotify)
// ============================================================================

#[cfg(target_os = "linux")]
mod kernel {
	use super::*;

	#[tokio::test(flavor = "multi_thread")]
	async fn directory_reports_child_file_events() {
		init_tracing();
		let dir = TempDir::new().unwrap();
		let child = dir.path().join("a.txt");

		let service = WatchService::new(WatchConfig::default());
		let handle = service.handle();
		handle
			.add_dir(dir.path(), WatchModes::FILES | WatchModes::SUB_DIRS)
			.await
			.unwrap();

		fs::write(&child, b"").unwrap();
		wait_for(&handle, &child, EventKind::Created).await;

		fs::write(&child, b"content").unwrap();
		wait_for(&handle, &child, EventKind::Changed).await;

		fs::remove_file(&child).unwrap();
		wait_for(&handle, &child, EventKind::Deleted).await;

		service.shutdown().await;
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn subdirs_mode_ignores_file_children() {
		init_tracing();
		let dir = TempDir::new().unwrap();

		let service = WatchService::new(WatchConfig::default());
		let handle = service.handle();
		handle.add_dir(dir.path(), WatchModes::SUB_DIRS).await.unwrap();

		fs::write(dir.path().join("ignored.txt"), b"x").unwrap();
		let events = drain_for(&handle, Duration::from_millis(400)).await;
		assert!(
			events.iter().all(|event| event.path == dir.path()),
			"file children must not be announced, got {events:?}"
		);

		let sub = dir.path().join("noticed");
		fs::create_dir(&sub).unwrap();
		wait_for(&handle, &sub, EventKind::Created).await;

		service.shutdown().await;
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn rapid_writes_collapse_to_one_change() {
		init_tracing();
		let dir = TempDir::new().unwrap();
		let child = dir.path().join("busy.txt");
		fs::write(&child, b"").unwrap();

		let service = WatchService::new(WatchConfig::default());
		let handle = service.handle();
		handle.add_dir(dir.path(), WatchModes::FILES).await.unwrap();

		// back to back, well inside one debounce window
		fs::write(&child, b"one").unwrap();
		fs::write(&child, b"two").unwrap();
		fs::write(&child, b"three").unwrap();

		let events = drain_for(&handle, Duration::from_millis(600)).await;
		let changes = events
			.iter()
			.filter(|event| event.path == child && event.kind == EventKind::Changed)
			.count();
		assert_eq!(changes, 1, "got {events:?}");

		service.shutdown().await;
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn deleted_while_suspended_arrives_after_resume() {
		init_tracing();
		let dir = TempDir::new().unwrap();
		let file = dir.path().join("doomed.txt");
		fs::write(&file, b"x").unwrap();

		let service = WatchService::new(WatchConfig::default());
		let handle = service.handle();
		handle.add_file(&file).await.unwrap();

		handle.stop_scan().await.unwrap();
		fs::remove_file(&file).unwrap();
		sleep(Duration::from_millis(300)).await;
		assert!(
			drain_for(&handle, Duration::from_millis(200)).await.is_empty(),
			"nothing may be delivered while suspended"
		);

		handle.start_scan(false, false).await.unwrap();
		wait_for(&handle, &file, EventKind::Deleted).await;
		assert!(
			drain_for(&handle, Duration::from_millis(300)).await.is_empty(),
			"the suspended deletion must arrive exactly once"
		);

		service.shutdown().await;
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn silent_resume_discards_the_backlog() {
		init_tracing();
		let dir = TempDir::new().unwrap();
		let file = dir.path().join("quiet.txt");
		fs::write(&file, b"x").unwrap();

		let service = WatchService::new(WatchConfig::default());
		let handle = service.handle();
		handle.add_file(&file).await.unwrap();

		handle.stop_scan().await.unwrap();
		fs::remove_file(&file).unwrap();
		sleep(Duration::from_millis(300)).await;

		handle.start_scan(false, true).await.unwrap();
		assert!(drain_for(&handle, Duration::from_millis(400)).await.is_empty());

		service.shutdown().await;
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn rescan_all_stays_quiet_without_changes() {
		init_tracing();
		let dir = TempDir::new().unwrap();
		let file = dir.path().join("steady.txt");
		fs::write(&file, b"x").unwrap();

		let service = WatchService::new(WatchConfig::default());
		let handle = service.handle();
		handle.add_file(&file).await.unwrap();
		handle.add_dir(dir.path(), WatchModes::DIR_ONLY).await.unwrap();

		service.rescan_all().await.unwrap();
		assert!(drain_for(&handle, Duration::from_millis(400)).await.is_empty());
		assert_eq!(service.active_backend().await.unwrap(), BackendKind::Kernel);

		service.shutdown().await;
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn shared_directory_survives_one_handles_removal() {
		init_tracing();
		let dir = TempDir::new().unwrap();

		let service = WatchService::new(WatchConfig::default());
		let plain = service.handle();
		let recursive = service.handle();
		plain.add_dir(dir.path(), WatchModes::DIR_ONLY).await.unwrap();
		recursive.add_dir(dir.path(), WatchModes::SUB_DIRS).await.unwrap();

		// one entry carries both registrations
		let stats = service.statistics().await.unwrap();
		assert_eq!(stats.entries.len(), 1);
		assert_eq!(stats.entries[0].client_count, 2);

		plain.remove_dir(dir.path()).await.unwrap();
		let stats = service.statistics().await.unwrap();
		assert_eq!(stats.entries.len(), 1);
		assert_eq!(stats.entries[0].client_count, 1);

		// the surviving registration still hears about new subdirectories
		let sub = dir.path().join("fresh");
		fs::create_dir(&sub).unwrap();
		wait_for(&recursive, &sub, EventKind::Created).await;
		assert!(
			drain_for(&plain, Duration::from_millis(300)).await.is_empty(),
			"the removed registration must hear nothing"
		);

		service.shutdown().await;
	}
}

// ============================================================================
// Daemon backend, against a scripted fake daemon
// ============================================================================

#[cfg(unix)]
mod daemon {
	use super::*;

	use serde_json::{json, Value};
	use tokio::{
		io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
		net::{unix::OwnedWriteHalf, UnixListener},
	};

	struct FakeDaemon {
		lines: tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
		writer: OwnedWriteHalf,
	}

	impl FakeDaemon {
		async fn accept(listener: &UnixListener) -> Self {
			let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
				.await
				.unwrap()
				.unwrap();
			let (read_half, writer) = stream.into_split();
			Self {
				lines: BufReader::new(read_half).lines(),
				writer,
			}
		}

		async fn next_request(&mut self) -> Value {
			let line = timeout(Duration::from_secs(5), self.lines.next_line())
				.await
				.unwrap()
				.unwrap()
				.unwrap();
			serde_json::from_str(&line).unwrap()
		}

		async fn notify(&mut self, notification: Value) {
			let mut line = notification.to_string().into_bytes();
			line.push(b'\n');
			self.writer.write_all(&line).await.unwrap();
		}
	}

	fn daemon_config(socket: &Path) -> WatchConfig {
		WatchConfig {
			preferred_backend: BackendKind::Daemon,
			daemon_socket: Some(socket.to_path_buf()),
			..Default::default()
		}
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn monitor_cancel_and_change_round_trip() {
		init_tracing();
		let dir = TempDir::new().unwrap();
		let socket = dir.path().join("fam.sock");
		let file = dir.path().join("watched.txt");
		fs::write(&file, b"x").unwrap();

		let listener = UnixListener::bind(&socket).unwrap();
		let service = WatchService::new(daemon_config(&socket));
		let mut fake = FakeDaemon::accept(&listener).await;

		let handle = service.handle();
		handle.add_file(&file).await.unwrap();

		let request = fake.next_request().await;
		assert_eq!(request["op"], "monitor");
		assert_eq!(request["path"], file.to_str().unwrap());
		let req = request["req"].clone();

		let stats = service.statistics().await.unwrap();
		assert_eq!(stats.backend_count(BackendKind::Daemon), 1);

		// acks and enumeration brackets must not produce events
		fake.notify(json!({ "req": req, "code": "ack" })).await;
		fake.notify(json!({ "req": req, "code": "exists", "path": &file }))
			.await;
		fake.notify(json!({ "req": req, "code": "end-exists" })).await;
		assert!(drain_for(&handle, Duration::from_millis(300)).await.is_empty());

		// a real change, then the daemon's word for it
		fs::write(&file, b"now different").unwrap();
		fake.notify(json!({ "req": req, "code": "changed", "path": &file }))
			.await;
		wait_for(&handle, &file, EventKind::Changed).await;

		handle.remove_file(&file).await.unwrap();
		let request = fake.next_request().await;
		assert_eq!(request["op"], "cancel");
		assert_eq!(request["req"], req);

		service.shutdown().await;
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn daemon_loss_rehomes_entries() {
		init_tracing();
		let dir = TempDir::new().unwrap();
		let socket = dir.path().join("fam.sock");
		let file = dir.path().join("survivor.txt");
		fs::write(&file, b"x").unwrap();

		let listener = UnixListener::bind(&socket).unwrap();
		let service = WatchService::new(daemon_config(&socket));
		let fake = FakeDaemon::accept(&listener).await;

		let handle = service.handle();
		handle.add_file(&file).await.unwrap();
		assert_eq!(
			service.statistics().await.unwrap().backend_count(BackendKind::Daemon),
			1
		);

		drop(fake);

		let deadline = Instant::now() + Duration::from_secs(5);
		loop {
			let stats = service.statistics().await.unwrap();
			if stats.backend_count(BackendKind::Daemon) == 0 {
				let summary = &stats.entries[0];
				assert!(summary.backend.is_some(), "entry must land on a live backend");
				break;
			}
			assert!(Instant::now() < deadline, "daemon entries never rehomed");
			sleep(Duration::from_millis(50)).await;
		}

		// the rehomed watch still works
		sleep(Duration::from_millis(100)).await;
		fs::remove_file(&file).unwrap();
		wait_for(&handle, &file, EventKind::Deleted).await;

		service.shutdown().await;
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn unreachable_daemon_falls_down_the_chain() {
		init_tracing();
		let dir = TempDir::new().unwrap();
		let file = dir.path().join("f.txt");
		fs::write(&file, b"x").unwrap();

		// nothing listens on the socket
		let config = daemon_config(&dir.path().join("absent.sock"));
		let service = WatchService::new(config);
		let handle = service.handle();
		handle.add_file(&file).await.unwrap();

		let stats = service.statistics().await.unwrap();
		assert_eq!(stats.backend_count(BackendKind::Daemon), 0);
		assert!(stats.entries[0].backend.is_some());
		assert_ne!(service.active_backend().await.unwrap(), BackendKind::Daemon);

		service.shutdown().await;
	}
}
