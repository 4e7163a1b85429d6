use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::head,
    Router,
};
use futures::StreamExt;
use parking_lot::Mutex;
use shetab_core::{
    CoreEvent, DownloadManager, DownloadSnapshot, DownloadStatus, EngineConfig,
    ProgressCallback, TransferMode,
};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;
const SERVER_CHUNK: usize = 16 * KIB;
const WAIT: Duration = Duration::from_secs(30);

/// Body sent for a satisfiable range request
#[derive(Clone, Copy, Default, PartialEq, Eq)]
enum RangeBody {
    #[default]
    Exact,
    /// Half of the requested bytes, then a clean end of stream
    Short,
    /// The requested bytes plus one extra KiB
    Long,
}

#[derive(Clone, Default)]
struct Behaviour {
    accept_ranges: bool,
    advertise_length: bool,
    chunk_delay: Option<Duration>,
    fail_range_at: Option<usize>,
    disposition: Option<&'static str>,
    range_body: RangeBody,
}

#[derive(Clone)]
struct AppState {
    content: Arc<Vec<u8>>,
    behaviour: Behaviour,
    ranges: Arc<Mutex<Vec<String>>>,
}

fn ranged() -> Behaviour {
    Behaviour {
        accept_ranges: true,
        advertise_length: true,
        ..Behaviour::default()
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn handle_head(State(state): State<AppState>) -> Response {
    let mut headers = HeaderMap::new();
    if state.behaviour.advertise_length {
        headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&state.content.len().to_string()).unwrap(),
        );
    }
    if state.behaviour.accept_ranges {
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }
    if let Some(disposition) = state.behaviour.disposition {
        headers.insert(
            header::CONTENT_DISPOSITION,
            HeaderValue::from_static(disposition),
        );
    }
    (StatusCode::OK, headers).into_response()
}

async fn handle_get(headers: HeaderMap, State(state): State<AppState>) -> Response {
    let total = state.content.len();
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    if let Some(value) = &range {
        state.ranges.lock().push(value.clone());
    }

    if state.behaviour.accept_ranges {
        if let Some((start, end)) = range.as_deref().and_then(|v| parse_range(v, total)) {
            if state.behaviour.fail_range_at == Some(start) {
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }

            let requested = &state.content[start..=end];
            let slice = match state.behaviour.range_body {
                RangeBody::Exact => requested.to_vec(),
                RangeBody::Short => requested[..requested.len() / 2].to_vec(),
                RangeBody::Long => [requested, &[0u8; KIB][..]].concat(),
            };
            let exact = state.behaviour.range_body == RangeBody::Exact;

            let mut response_headers = HeaderMap::new();
            response_headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, total)).unwrap(),
            );
            if exact {
                response_headers.insert(
                    header::CONTENT_LENGTH,
                    HeaderValue::from_str(&slice.len().to_string()).unwrap(),
                );
            }
            return (
                StatusCode::PARTIAL_CONTENT,
                response_headers,
                body(&state.behaviour, slice, exact),
            )
                .into_response();
        }
    }

    let mut response_headers = HeaderMap::new();
    if state.behaviour.advertise_length {
        response_headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&total.to_string()).unwrap(),
        );
    }
    (
        StatusCode::OK,
        response_headers,
        body(
            &state.behaviour,
            state.content.to_vec(),
            state.behaviour.advertise_length,
        ),
    )
        .into_response()
}

/// Unsized bodies go out chunked, so their length is only known at the end
fn body(behaviour: &Behaviour, bytes: Vec<u8>, sized: bool) -> Body {
    if sized && behaviour.chunk_delay.is_none() {
        return Body::from(bytes);
    }

    let delay = behaviour.chunk_delay;
    let chunks: Vec<Vec<u8>> = bytes.chunks(SERVER_CHUNK).map(<[u8]>::to_vec).collect();
    Body::from_stream(futures::stream::iter(chunks).then(move |chunk| async move {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok::<_, std::io::Error>(chunk)
    }))
}

fn parse_range(value: &str, total: usize) -> Option<(usize, usize)> {
    let value = value.strip_prefix("bytes=")?;
    let (start_str, end_str) = value.split_once('-')?;
    let start: usize = start_str.parse().ok()?;
    let end: usize = if end_str.is_empty() {
        total.checked_sub(1)?
    } else {
        end_str.parse().ok()?
    };
    if start <= end && end < total {
        Some((start, end))
    } else {
        None
    }
}

struct TestServer {
    base: String,
    content: Arc<Vec<u8>>,
    ranges: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    fn url(&self) -> String {
        format!("{}/file.bin", self.base)
    }

    fn ranges(&self) -> Vec<String> {
        self.ranges.lock().clone()
    }
}

async fn spawn_server(content: Vec<u8>, behaviour: Behaviour) -> TestServer {
    let content = Arc::new(content);
    let ranges = Arc::new(Mutex::new(Vec::new()));
    let state = AppState {
        content: Arc::clone(&content),
        behaviour,
        ranges: Arc::clone(&ranges),
    };

    let app = Router::new()
        .route("/file.bin", head(handle_head).get(handle_get))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base: format!("http://{}", addr),
        content,
        ranges,
    }
}

struct Workspace {
    temp: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let temp = tempfile::Builder::new()
            .prefix("shetab-engine-")
            .tempdir()
            .expect("failed to create temp dir");
        std::fs::create_dir_all(temp.path().join("out")).unwrap();
        Self { temp }
    }

    fn out(&self) -> PathBuf {
        self.temp.path().join("out")
    }

    fn parts(&self) -> PathBuf {
        self.temp.path().join("parts")
    }

    fn config(&self) -> EngineConfig {
        EngineConfig {
            temp_dir: Some(self.parts()),
            chunk_size: SERVER_CHUNK,
            monitor_interval_ms: 50,
            read_timeout_secs: 10,
            ..EngineConfig::default()
        }
    }

    fn part_files(&self) -> Vec<PathBuf> {
        list_with_extension(&self.parts(), "part")
    }
}

fn list_with_extension(dir: &Path, extension: &str) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == extension))
            .collect(),
        Err(_) => Vec::new(),
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_status(
    manager: &DownloadManager,
    id: Uuid,
    status: DownloadStatus,
) -> DownloadSnapshot {
    let deadline = Instant::now() + WAIT;
    loop {
        let snapshot = manager.get_status(id).expect("download should exist");
        if snapshot.status == status {
            return snapshot;
        }
        if snapshot.status.is_terminal() {
            panic!(
                "download ended as {} instead of {}: {:?}",
                snapshot.status, status, snapshot.error
            );
        }
        assert!(Instant::now() < deadline, "timed out waiting for {}", status);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn assert_same_bytes(path: &Path, expected: &[u8]) {
    let actual = std::fs::read(path).unwrap();
    assert_eq!(actual.len(), expected.len(), "length of {:?}", path);
    assert!(actual == expected, "content of {:?} differs", path);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ten_mib_downloads_in_four_equal_segments() {
    let server = spawn_server(pattern(10 * MIB), ranged()).await;
    let ws = Workspace::new();
    let config = EngineConfig {
        max_segments_per_download: 4,
        min_segment_size: MIB as u64,
        ..ws.config()
    };
    let manager = assert_ok!(DownloadManager::new(config));

    let id = assert_ok!(manager.submit(&server.url(), ws.out(), None));
    let snapshot = wait_for_status(&manager, id, DownloadStatus::Completed).await;

    assert_eq!(snapshot.downloaded, 10 * MIB as u64);
    assert_eq!(snapshot.total, Some(10 * MIB as u64));
    assert_eq!(snapshot.progress_percent, 100.0);

    let download = manager.get_download(id).unwrap();
    assert_eq!(download.transfer_mode(), TransferMode::Segmented);
    assert_eq!(download.segments.len(), 4);
    for segment in &download.segments {
        assert_eq!(segment.size(), (10 * MIB / 4) as u64);
        assert!(segment.complete);
    }

    assert_same_bytes(&ws.out().join("file.bin"), &server.content);
    assert!(ws.part_files().is_empty());
    assert_eq!(server.ranges().len(), 4);

    let history = manager.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, DownloadStatus::Completed);
    assert_eq!(history[0].destination_path, ws.out().join("file.bin"));
    assert!(history[0].end_time.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn small_resource_uses_a_single_stream() {
    let server = spawn_server(pattern(500 * KIB), ranged()).await;
    let ws = Workspace::new();
    let manager = assert_ok!(DownloadManager::new(ws.config()));

    let id = assert_ok!(manager.submit(&server.url(), ws.out(), None));
    wait_for_status(&manager, id, DownloadStatus::Completed).await;

    let download = manager.get_download(id).unwrap();
    assert_eq!(download.segments.len(), 1);
    assert_eq!(download.transfer_mode(), TransferMode::Stream);
    assert_same_bytes(&ws.out().join("file.bin"), &server.content);
    assert!(server.ranges().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_without_ranges_gets_one_stream() {
    let behaviour = Behaviour {
        advertise_length: true,
        ..Behaviour::default()
    };
    let server = spawn_server(pattern(3 * MIB + 17), behaviour).await;
    let ws = Workspace::new();
    let manager = assert_ok!(DownloadManager::new(ws.config()));

    let id = assert_ok!(manager.submit(&server.url(), ws.out(), None));
    wait_for_status(&manager, id, DownloadStatus::Completed).await;

    let download = manager.get_download(id).unwrap();
    assert!(!download.range_supported);
    assert_eq!(download.segments.len(), 1);
    assert_same_bytes(&ws.out().join("file.bin"), &server.content);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_length_is_learned_at_end_of_stream() {
    let server = spawn_server(pattern(700 * KIB + 3), Behaviour::default()).await;
    let ws = Workspace::new();
    let manager = assert_ok!(DownloadManager::new(ws.config()));

    let id = assert_ok!(manager.submit(&server.url(), ws.out(), None));
    let snapshot = wait_for_status(&manager, id, DownloadStatus::Completed).await;

    assert_eq!(snapshot.total, Some((700 * KIB + 3) as u64));
    assert_same_bytes(&ws.out().join("file.bin"), &server.content);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_and_resume_keeps_segment_progress() {
    let behaviour = Behaviour {
        chunk_delay: Some(Duration::from_millis(15)),
        ..ranged()
    };
    let server = spawn_server(pattern(3 * MIB), behaviour).await;
    let ws = Workspace::new();
    let config = EngineConfig {
        max_segments_per_download: 3,
        ..ws.config()
    };
    let manager = assert_ok!(DownloadManager::new(config));

    let id = assert_ok!(manager.submit(&server.url(), ws.out(), None));
    wait_until("some progress", || {
        manager.get_status(id).is_some_and(|s| s.downloaded >= 64 * KIB as u64)
    })
    .await;

    assert!(manager.pause(id));
    assert!(!manager.pause(id), "pausing twice must be refused");
    assert_eq!(manager.get_status(id).unwrap().status, DownloadStatus::Paused);
    assert_eq!(manager.active_count(), 0);

    // Let in-flight chunks settle, then the counter must stay put
    tokio::time::sleep(Duration::from_millis(100)).await;
    let paused_at = manager.get_download(id).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(manager.get_download(id).unwrap().downloaded, paused_at.downloaded);
    assert_eq!(paused_at.segments.len(), 3);
    assert!(!ws.part_files().is_empty());

    assert!(manager.resume(id));
    assert!(!manager.resume(id), "resuming a running download must be refused");
    wait_for_status(&manager, id, DownloadStatus::Completed).await;

    assert_same_bytes(&ws.out().join("file.bin"), &server.content);
    assert!(ws.part_files().is_empty());

    // Resumed requests continue where each segment stopped
    let segment_starts = ["bytes=0-", "bytes=1048576-", "bytes=2097152-"];
    let resumed = server
        .ranges()
        .iter()
        .filter(|r| !segment_starts.iter().any(|s| r.starts_with(s)))
        .count();
    assert!(resumed > 0, "expected mid-segment range requests");
    let finished = manager.get_download(id).unwrap();
    for (segment, before) in finished.segments.iter().zip(&paused_at.segments) {
        assert!(segment.downloaded >= before.downloaded);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn non_resumable_stream_restarts_after_pause() {
    let behaviour = Behaviour {
        advertise_length: true,
        chunk_delay: Some(Duration::from_millis(10)),
        ..Behaviour::default()
    };
    let server = spawn_server(pattern(MIB), behaviour).await;
    let ws = Workspace::new();
    let manager = assert_ok!(DownloadManager::new(ws.config()));

    let id = assert_ok!(manager.submit(&server.url(), ws.out(), None));
    wait_until("some progress", || {
        manager.get_status(id).is_some_and(|s| s.downloaded > 0)
    })
    .await;
    assert!(manager.pause(id));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(manager.start(id));
    wait_for_status(&manager, id, DownloadStatus::Completed).await;

    assert_same_bytes(&ws.out().join("file.bin"), &server.content);
    assert!(server.ranges().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_limit_is_never_exceeded() {
    let behaviour = Behaviour {
        chunk_delay: Some(Duration::from_millis(5)),
        ..ranged()
    };
    let server = spawn_server(pattern(512 * KIB), behaviour).await;
    let ws = Workspace::new();
    let config = EngineConfig {
        max_concurrent_downloads: 2,
        ..ws.config()
    };
    let manager = assert_ok!(DownloadManager::new(config));

    let ids: Vec<Uuid> = (0..5)
        .map(|i| {
            let name = format!("copy-{}.bin", i);
            assert_ok!(manager.submit(&server.url(), ws.out(), Some(name.as_str())))
        })
        .collect();

    let count = |status: DownloadStatus| {
        manager
            .get_all()
            .iter()
            .filter(|s| s.status == status)
            .count()
    };
    assert_eq!(count(DownloadStatus::Downloading), 2);
    assert_eq!(count(DownloadStatus::Pending), 3);

    let deadline = Instant::now() + WAIT;
    while count(DownloadStatus::Completed) < ids.len() {
        let downloading = count(DownloadStatus::Downloading);
        assert!(downloading <= 2, "{} downloads running at once", downloading);
        assert!(count(DownloadStatus::Error) == 0);
        assert!(Instant::now() < deadline, "timed out waiting for the queue");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for i in 0..ids.len() {
        assert_same_bytes(&ws.out().join(format!("copy-{}.bin", i)), &server.content);
    }
    assert_eq!(manager.history().len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_removes_all_partial_data() {
    let behaviour = Behaviour {
        chunk_delay: Some(Duration::from_millis(15)),
        ..ranged()
    };
    let server = spawn_server(pattern(3 * MIB), behaviour).await;
    let ws = Workspace::new();
    let config = EngineConfig {
        max_segments_per_download: 3,
        ..ws.config()
    };
    let manager = assert_ok!(DownloadManager::new(config));

    let id = assert_ok!(manager.submit(&server.url(), ws.out(), None));
    wait_until("part files", || !ws.part_files().is_empty()).await;

    assert!(manager.cancel(id).await);

    let snapshot = manager.get_status(id).unwrap();
    assert_eq!(snapshot.status, DownloadStatus::Canceled);
    assert!(ws.part_files().is_empty());
    assert!(!ws.out().join("file.bin").exists());

    assert!(!manager.cancel(id).await);
    assert!(!manager.pause(id));
    assert!(!manager.start(id));

    let history = manager.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, DownloadStatus::Canceled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn probe_failure_marks_the_download_failed() {
    let server = spawn_server(pattern(KIB), ranged()).await;
    let ws = Workspace::new();
    let manager = assert_ok!(DownloadManager::new(ws.config()));

    let url = format!("{}/missing.bin", server.base);
    let id = assert_ok!(manager.submit(&url, ws.out(), None));
    let snapshot = wait_for_status(&manager, id, DownloadStatus::Error).await;

    let error = snapshot.error.unwrap();
    assert!(error.contains("404"), "unexpected error: {}", error);
    assert!(ws.part_files().is_empty());
    wait_until("history record", || !manager.history().is_empty()).await;
    assert_eq!(manager.active_count(), 0);
    assert_eq!(manager.history()[0].error_message.as_deref(), Some(error.as_str()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_segment_fails_the_whole_download() {
    let behaviour = Behaviour {
        fail_range_at: Some(MIB),
        ..ranged()
    };
    let server = spawn_server(pattern(3 * MIB), behaviour).await;
    let ws = Workspace::new();
    let config = EngineConfig {
        max_segments_per_download: 3,
        ..ws.config()
    };
    let manager = assert_ok!(DownloadManager::new(config));

    let id = assert_ok!(manager.submit(&server.url(), ws.out(), None));
    let snapshot = wait_for_status(&manager, id, DownloadStatus::Error).await;

    let error = snapshot.error.unwrap();
    assert!(error.contains("segment 1"), "unexpected error: {}", error);
    assert!(error.contains("500"), "unexpected error: {}", error);
    assert!(ws.part_files().is_empty());
    assert!(!ws.out().join("file.bin").exists());

    assert!(!manager.start(id), "failed downloads cannot be restarted");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submit_rejects_bad_input() {
    let ws = Workspace::new();
    let manager = assert_ok!(DownloadManager::new(ws.config()));

    let err = assert_err!(manager.submit("ftp://example.com/file", ws.out(), None));
    assert!(err.is_validation());
    let err = assert_err!(manager.submit("http://example.com/file", ws.out().join("nope"), None));
    assert!(err.is_validation());
    assert!(manager.get_all().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn filenames_come_from_disposition_unless_given() {
    let behaviour = Behaviour {
        disposition: Some("attachment; filename=\"report.pdf\""),
        ..ranged()
    };
    let server = spawn_server(pattern(64 * KIB), behaviour).await;
    let ws = Workspace::new();
    let manager = assert_ok!(DownloadManager::new(ws.config()));

    let from_server = assert_ok!(manager.submit(&server.url(), ws.out(), None));
    let explicit = assert_ok!(manager.submit(&server.url(), ws.out(), Some("mine.pdf")));
    wait_for_status(&manager, from_server, DownloadStatus::Completed).await;
    wait_for_status(&manager, explicit, DownloadStatus::Completed).await;

    assert_eq!(manager.get_status(from_server).unwrap().filename, "report.pdf");
    assert_same_bytes(&ws.out().join("report.pdf"), &server.content);
    assert_same_bytes(&ws.out().join("mine.pdf"), &server.content);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn progress_callback_sees_monotonic_counters() {
    let behaviour = Behaviour {
        chunk_delay: Some(Duration::from_millis(2)),
        ..ranged()
    };
    let server = spawn_server(pattern(3 * MIB), behaviour).await;
    let ws = Workspace::new();
    let config = EngineConfig {
        max_segments_per_download: 3,
        ..ws.config()
    };

    let seen: Arc<Mutex<Vec<DownloadSnapshot>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: ProgressCallback = Arc::new(move |snapshot: &DownloadSnapshot| {
        sink.lock().push(snapshot.clone());
    });
    let manager = assert_ok!(DownloadManager::with_callback(config, Some(callback)));

    let id = assert_ok!(manager.submit(&server.url(), ws.out(), None));
    wait_for_status(&manager, id, DownloadStatus::Completed).await;

    let seen = seen.lock();
    let running: Vec<u64> = seen
        .iter()
        // The start notification may race the first monitor tick
        .filter(|s| s.status == DownloadStatus::Downloading && s.downloaded > 0)
        .map(|s| s.downloaded)
        .collect();
    assert!(running.len() > 1, "expected several progress ticks");
    assert!(running.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(seen.last().unwrap().status, DownloadStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn events_follow_the_download_lifecycle() {
    let server = spawn_server(pattern(2 * MIB), ranged()).await;
    let ws = Workspace::new();
    let manager = assert_ok!(DownloadManager::new(ws.config()));
    let mut events = manager.subscribe();

    let id = assert_ok!(manager.submit(&server.url(), ws.out(), None));

    let mut saw_added = false;
    let mut saw_started = false;
    let record = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await.unwrap() {
                CoreEvent::DownloadAdded { download } => saw_added = download.id == id,
                CoreEvent::DownloadStatusChanged { status, .. } => {
                    saw_started |= status == DownloadStatus::Downloading
                }
                CoreEvent::DownloadFinished { record } => break record,
                _ => {}
            }
        }
    })
    .await
    .expect("download should finish");

    assert!(saw_added);
    assert!(saw_started);
    assert_eq!(record.id, id);
    assert_eq!(record.status, DownloadStatus::Completed);

    assert!(manager.remove(id).await);
    assert!(manager.get_status(id).is_none());
    let removed = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(removed, CoreEvent::DownloadRemoved { id: removed_id } if removed_id == id));
    assert!(ws.out().join("file.bin").exists(), "remove keeps finished files");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn paused_download_is_picked_up_again_when_auto_resume_is_on() {
    let behaviour = Behaviour {
        chunk_delay: Some(Duration::from_millis(5)),
        ..ranged()
    };
    let server = spawn_server(pattern(MIB), behaviour).await;
    let ws = Workspace::new();
    let config = EngineConfig {
        max_concurrent_downloads: 1,
        auto_resume_paused: true,
        ..ws.config()
    };
    let manager = assert_ok!(DownloadManager::new(config));

    let id = assert_ok!(manager.submit(&server.url(), ws.out(), None));
    wait_until("some progress", || {
        manager.get_status(id).is_some_and(|s| s.downloaded > 0)
    })
    .await;

    assert!(manager.pause(id));
    wait_for_status(&manager, id, DownloadStatus::Completed).await;
    assert_same_bytes(&ws.out().join("file.bin"), &server.content);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_freezes_counters_and_callback_snapshots() {
    let behaviour = Behaviour {
        advertise_length: true,
        chunk_delay: Some(Duration::from_millis(3)),
        ..Behaviour::default()
    };
    let server = spawn_server(pattern(MIB), behaviour).await;
    let ws = Workspace::new();

    let seen: Arc<Mutex<Vec<DownloadSnapshot>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: ProgressCallback = Arc::new(move |snapshot: &DownloadSnapshot| {
        sink.lock().push(snapshot.clone());
    });
    let manager = assert_ok!(DownloadManager::with_callback(ws.config(), Some(callback)));

    for round in 0..12u64 {
        let name = format!("round-{}.bin", round);
        let id = assert_ok!(manager.submit(&server.url(), ws.out(), Some(name.as_str())));
        let threshold = (round + 1) * SERVER_CHUNK as u64;
        wait_until("some progress", || {
            manager.get_status(id).is_some_and(|s| s.downloaded >= threshold)
        })
        .await;

        assert!(manager.cancel(id).await);
        let canceled = manager.get_download(id).unwrap();
        assert_eq!(canceled.status, DownloadStatus::Canceled);
        assert_eq!(
            canceled.downloaded,
            canceled.segments.iter().map(|s| s.downloaded).sum::<u64>()
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        let later = manager.get_download(id).unwrap();
        assert_eq!(later.downloaded, canceled.downloaded, "round {}", round);
        assert_eq!(later.speed, 0);

        for snapshot in seen.lock().iter().filter(|s| s.id == id) {
            if snapshot.status == DownloadStatus::Canceled {
                assert_eq!(snapshot.downloaded, later.downloaded, "round {}", round);
                assert_eq!(snapshot.speed, 0);
            }
        }
    }
    assert!(ws.part_files().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn short_range_body_fails_the_download() {
    let behaviour = Behaviour {
        range_body: RangeBody::Short,
        ..ranged()
    };
    let server = spawn_server(pattern(3 * MIB), behaviour).await;
    let ws = Workspace::new();
    let config = EngineConfig {
        max_segments_per_download: 3,
        ..ws.config()
    };
    let manager = assert_ok!(DownloadManager::new(config));

    let id = assert_ok!(manager.submit(&server.url(), ws.out(), None));
    let snapshot = wait_for_status(&manager, id, DownloadStatus::Error).await;

    let error = snapshot.error.unwrap();
    assert!(error.contains("ended early"), "unexpected error: {}", error);
    assert!(ws.part_files().is_empty());
    assert!(!ws.out().join("file.bin").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn over_long_range_body_fails_the_download() {
    let behaviour = Behaviour {
        range_body: RangeBody::Long,
        ..ranged()
    };
    let server = spawn_server(pattern(3 * MIB), behaviour).await;
    let ws = Workspace::new();
    let config = EngineConfig {
        max_segments_per_download: 3,
        ..ws.config()
    };
    let manager = assert_ok!(DownloadManager::new(config));

    let id = assert_ok!(manager.submit(&server.url(), ws.out(), None));
    let snapshot = wait_for_status(&manager, id, DownloadStatus::Error).await;

    let error = snapshot.error.unwrap();
    assert!(error.contains("more than"), "unexpected error: {}", error);
    assert!(ws.part_files().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn merge_failure_marks_the_download_failed() {
    let server = spawn_server(pattern(2 * MIB), ranged()).await;
    let ws = Workspace::new();
    let manager = assert_ok!(DownloadManager::new(ws.config()));

    // A directory where the output file should go
    std::fs::create_dir(ws.out().join("file.bin")).unwrap();

    let id = assert_ok!(manager.submit(&server.url(), ws.out(), None));
    let snapshot = wait_for_status(&manager, id, DownloadStatus::Error).await;

    let error = snapshot.error.unwrap();
    assert!(error.contains("Merge failed"), "unexpected error: {}", error);
    assert!(ws.part_files().is_empty());
    wait_until("history record", || !manager.history().is_empty()).await;
    assert_eq!(manager.active_count(), 0);
    assert_eq!(manager.history()[0].status, DownloadStatus::Error);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resume_without_a_free_slot_waits_in_the_queue() {
    let behaviour = Behaviour {
        chunk_delay: Some(Duration::from_millis(5)),
        ..ranged()
    };
    let server = spawn_server(pattern(MIB), behaviour).await;
    let ws = Workspace::new();
    let config = EngineConfig {
        max_concurrent_downloads: 1,
        ..ws.config()
    };
    let manager = assert_ok!(DownloadManager::new(config));

    let paused = assert_ok!(manager.submit(&server.url(), ws.out(), Some("paused.bin")));
    wait_until("some progress", || {
        manager.get_status(paused).is_some_and(|s| s.downloaded > 0)
    })
    .await;
    assert!(manager.pause(paused));

    let running = assert_ok!(manager.submit(&server.url(), ws.out(), Some("running.bin")));
    assert_eq!(
        manager.get_status(running).unwrap().status,
        DownloadStatus::Downloading
    );

    assert!(manager.resume(paused));
    assert_eq!(manager.get_status(paused).unwrap().status, DownloadStatus::Paused);
    assert_eq!(manager.active_count(), 1);

    wait_for_status(&manager, running, DownloadStatus::Completed).await;
    wait_for_status(&manager, paused, DownloadStatus::Completed).await;
    assert_same_bytes(&ws.out().join("paused.bin"), &server.content);
    assert_same_bytes(&ws.out().join("running.bin"), &server.content);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn paused_download_stays_paused_without_auto_resume() {
    let behaviour = Behaviour {
        chunk_delay: Some(Duration::from_millis(5)),
        ..ranged()
    };
    let server = spawn_server(pattern(MIB), behaviour).await;
    let ws = Workspace::new();
    let config = EngineConfig {
        max_concurrent_downloads: 1,
        ..ws.config()
    };
    assert!(!config.auto_resume_paused);
    let manager = assert_ok!(DownloadManager::new(config));

    let id = assert_ok!(manager.submit(&server.url(), ws.out(), None));
    wait_until("some progress", || {
        manager.get_status(id).is_some_and(|s| s.downloaded > 0)
    })
    .await;
    assert!(manager.pause(id));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(manager.get_status(id).unwrap().status, DownloadStatus::Paused);
    assert_eq!(manager.active_count(), 0);
    assert!(!ws.part_files().is_empty());

    assert!(manager.resume(id));
    wait_for_status(&manager, id, DownloadStatus::Completed).await;
    assert_same_bytes(&ws.out().join("file.bin"), &server.content);
}
