//! End-to-end cycles against an in-process mock inference server and a fake
//! screen.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD, Engine};
use image::{DynamicImage, Rgb, RgbImage};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use screenwatch_lib::ai::{ModelClient, FALLBACK_TEXT};
use screenwatch_lib::capture::{CaptureCoordinator, CaptureError, CaptureHost, ScreenGrabber};
use screenwatch_lib::config::{InferenceConfig, SchedulerConfig};
use screenwatch_lib::events::{EventSink, PipelineEvent};
use screenwatch_lib::history::HistoryStore;
use screenwatch_lib::pipeline::Pipeline;
use screenwatch_lib::state::{CaptureRegion, CyclePhase, PipelineState};

// ── Mock inference server ───────────────────────────────────────────

#[derive(Default)]
struct MockModel {
    analysis: String,
    classification: String,
    malformed: bool,
    delay_ms: u64,
    bodies: Mutex<Vec<Value>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

async fn generate(State(mock): State<Arc<MockModel>>, Json(body): Json<Value>) -> Json<Value> {
    let now = mock.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    mock.max_in_flight.fetch_max(now, Ordering::SeqCst);
    if mock.delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(mock.delay_ms)).await;
    }
    let is_classification = body["prompt"]
        .as_str()
        .unwrap_or_default()
        .contains("Respond with only 'Yes' or 'No'");
    mock.bodies.lock().push(body);
    mock.in_flight.fetch_sub(1, Ordering::SeqCst);

    if mock.malformed {
        return Json(json!({ "unexpected": true }));
    }
    let text = if is_classification {
        &mock.classification
    } else {
        &mock.analysis
    };
    Json(json!({ "results": [{ "text": text }] }))
}

async fn serve_mock(mock: Arc<MockModel>) -> String {
    let app = Router::new()
        .route("/api/v1/generate", post(generate))
        .with_state(mock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/api/v1/generate", addr)
}

fn unreachable_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{}/api/v1/generate", port)
}

// ── Fake screen ─────────────────────────────────────────────────────

#[derive(Default)]
struct ScreenLog {
    regions: Mutex<Vec<Option<CaptureRegion>>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

struct FakeScreen(Arc<ScreenLog>);

impl ScreenGrabber for FakeScreen {
    fn grab(&self, region: Option<CaptureRegion>) -> Result<DynamicImage, CaptureError> {
        let now = self.0.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.max_active.fetch_max(now, Ordering::SeqCst);
        self.0.regions.lock().push(region);
        let (w, h) = region.map(|r| (r.width, r.height)).unwrap_or((640, 480));
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([200, 20, 20])));
        self.0.active.fetch_sub(1, Ordering::SeqCst);
        Ok(image)
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Running {
    pipeline: Pipeline,
    events: mpsc::UnboundedReceiver<PipelineEvent>,
    history: Arc<HistoryStore>,
    screen: Arc<ScreenLog>,
    host: Option<CaptureHost>,
    /// Every event `wait_for` has consumed.
    seen: Vec<PipelineEvent>,
    _dir: tempfile::TempDir,
}

fn start(url: String, scheduler: SchedulerConfig, setup: impl FnOnce(&PipelineState)) -> Running {
    let history = Arc::new(HistoryStore::open_in_memory().unwrap());
    start_with_history(url, scheduler, history, tempfile::tempdir().unwrap(), setup)
}

fn start_with_history(
    url: String,
    scheduler: SchedulerConfig,
    history: Arc<HistoryStore>,
    dir: tempfile::TempDir,
    setup: impl FnOnce(&PipelineState),
) -> Running {
    let state = Arc::new(PipelineState::new("describe the image"));
    setup(&state);

    let (event_tx, events) = mpsc::unbounded_channel();
    let sink: Arc<dyn EventSink> = Arc::new(event_tx);
    let screen = Arc::new(ScreenLog::default());
    let coordinator = CaptureCoordinator::new(
        Arc::clone(&state),
        Box::new(FakeScreen(Arc::clone(&screen))),
        Arc::clone(&sink),
        dir.path().join("screenshots"),
        1_800_000,
    );
    let client = Arc::new(
        ModelClient::new(InferenceConfig {
            url,
            request_timeout_secs: 5,
            ..InferenceConfig::default()
        })
        .unwrap(),
    );

    let (pipeline, host) = Pipeline::start(
        state,
        client,
        Arc::clone(&history),
        sink,
        coordinator,
        scheduler,
    );
    Running {
        pipeline,
        events,
        history,
        screen,
        host: Some(host),
        seen: Vec::new(),
        _dir: dir,
    }
}

impl Running {
    /// Serves captures from a dedicated thread standing in for the UI thread.
    fn run_host(&mut self) {
        let host = self.host.take().expect("host already running");
        std::thread::spawn(move || host.run_blocking());
    }

    async fn wait_for(&mut self, pred: impl Fn(&PipelineEvent) -> bool) -> PipelineEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = self.events.recv().await.expect("event channel open");
                self.seen.push(event.clone());
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event arrived in time")
    }

    async fn wait_idle(&self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.pipeline.state().phase() != CyclePhase::Idle {
            assert!(Instant::now() < deadline, "cycle never finished");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn errors_seen(&mut self) -> Vec<String> {
        let rest = self.drain_events();
        self.seen
            .iter()
            .chain(rest.iter())
            .filter_map(|e| match e {
                PipelineEvent::Error { message } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    fn drain_events(&mut self) -> Vec<PipelineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

fn one_cycle() -> SchedulerConfig {
    SchedulerConfig {
        interval_ms: 60_000,
        capture_timeout_ms: 5_000,
    }
}

fn is_analysis(e: &PipelineEvent) -> bool {
    matches!(e, PipelineEvent::AnalysisComplete { .. })
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn region_analysis_is_published_and_recorded() {
    let mock = Arc::new(MockModel {
        analysis: "  A red car.\n".to_string(),
        ..MockModel::default()
    });
    let url = serve_mock(Arc::clone(&mock)).await;
    let region = CaptureRegion::new(100, 100, 400, 300).unwrap();
    let mut run = start(url, one_cycle(), |s| s.set_region(Some(region)));
    run.run_host();

    let event = run.wait_for(is_analysis).await;
    assert_eq!(
        event,
        PipelineEvent::AnalysisComplete {
            text: "A red car.".to_string()
        }
    );
    run.wait_idle().await;
    run.pipeline.stop().await.unwrap();

    let entries = run.history.list(None).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].analysis_text, "A red car.");
    assert_eq!(entries[0].prompt, "describe the image");
    assert_eq!(run.pipeline.session().len(), 1);
    assert_eq!(run.screen.regions.lock().as_slice(), &[Some(region)]);

    let bodies = mock.bodies.lock();
    assert_eq!(bodies.len(), 1, "no alert rule, so no classification call");
    let prompt = bodies[0]["prompt"].as_str().unwrap();
    assert!(prompt.contains("describe the image"));
    let jpeg = STANDARD
        .decode(bodies[0]["images"][0].as_str().unwrap())
        .unwrap();
    let decoded = image::load_from_memory(&jpeg).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (400, 300));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn positive_classification_fires_alert() {
    let mock = Arc::new(MockModel {
        analysis: "A red car.".to_string(),
        classification: "Yes".to_string(),
        ..MockModel::default()
    });
    let url = serve_mock(Arc::clone(&mock)).await;
    let mut run = start(url, one_cycle(), |s| s.set_alert("a red car appears"));
    run.run_host();

    let alert = run
        .wait_for(|e| matches!(e, PipelineEvent::AlertTriggered { .. }))
        .await;
    assert_eq!(
        alert,
        PipelineEvent::AlertTriggered {
            condition: "a red car appears".to_string(),
            analysis: "A red car.".to_string(),
        }
    );
    run.pipeline.stop().await.unwrap();

    let bodies = mock.bodies.lock();
    assert_eq!(bodies.len(), 2);
    let classify = bodies[1]["prompt"].as_str().unwrap();
    assert!(classify.contains("'a red car appears'"));
    assert!(classify.contains("Image analysis: A red car."));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn negative_classification_stays_quiet() {
    let mock = Arc::new(MockModel {
        analysis: "An empty street.".to_string(),
        classification: "No".to_string(),
        ..MockModel::default()
    });
    let url = serve_mock(mock).await;
    let mut run = start(url, one_cycle(), |s| s.set_alert("a red car appears"));
    run.run_host();

    run.wait_for(is_analysis).await;
    run.wait_idle().await;
    run.pipeline.stop().await.unwrap();
    assert!(!run
        .drain_events()
        .iter()
        .any(|e| matches!(e, PipelineEvent::AlertTriggered { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_server_yields_fallback_and_no_alert() {
    let mut run = start(unreachable_url(), one_cycle(), |s| s.set_alert("a red car appears"));
    run.run_host();

    let event = run.wait_for(is_analysis).await;
    assert_eq!(
        event,
        PipelineEvent::AnalysisComplete {
            text: FALLBACK_TEXT.to_string()
        }
    );
    run.wait_idle().await;
    run.pipeline.stop().await.unwrap();
    assert!(!run
        .drain_events()
        .iter()
        .any(|e| matches!(e, PipelineEvent::AlertTriggered { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_envelope_is_treated_as_failure() {
    let mock = Arc::new(MockModel {
        malformed: true,
        ..MockModel::default()
    });
    let url = serve_mock(mock).await;
    let mut run = start(url, one_cycle(), |_| {});
    run.run_host();

    let event = run.wait_for(is_analysis).await;
    assert_eq!(
        event,
        PipelineEvent::AnalysisComplete {
            text: FALLBACK_TEXT.to_string()
        }
    );
    run.pipeline.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cycles_never_overlap() {
    let mock = Arc::new(MockModel {
        analysis: "A red car.".to_string(),
        classification: "No".to_string(),
        delay_ms: 80,
        ..MockModel::default()
    });
    let url = serve_mock(Arc::clone(&mock)).await;
    let scheduler = SchedulerConfig {
        interval_ms: 10,
        capture_timeout_ms: 2_000,
    };
    let mut run = start(url, scheduler, |s| s.set_alert("a red car appears"));
    run.run_host();

    for _ in 0..3 {
        run.wait_for(is_analysis).await;
    }
    run.pipeline.stop().await.unwrap();

    assert_eq!(mock.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(run.screen.max_active.load(Ordering::SeqCst), 1);
    assert!(run.history.count().unwrap() >= 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_wakes_a_stalled_capture_wait() {
    let scheduler = SchedulerConfig {
        interval_ms: 60_000,
        capture_timeout_ms: 30_000,
    };
    // The host is never driven, so the capture request sits unanswered.
    let mut run = start(unreachable_url(), scheduler, |_| {});

    let deadline = Instant::now() + Duration::from_secs(5);
    while run.pipeline.state().phase() != CyclePhase::AwaitingCapture {
        assert!(Instant::now() < deadline, "scheduler never requested a capture");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let start = Instant::now();
    run.pipeline.stop().await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(run.history.count().unwrap(), 0);
    assert!(run.screen.regions.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paused_pipeline_never_captures() {
    let scheduler = SchedulerConfig {
        interval_ms: 10,
        capture_timeout_ms: 1_000,
    };
    let mut run = start(unreachable_url(), scheduler, |s| s.set_paused(true));
    run.run_host();

    tokio::time::sleep(Duration::from_millis(150)).await;
    run.pipeline.stop().await.unwrap();
    assert!(run.screen.regions.lock().is_empty());
    assert_eq!(run.history.count().unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deferred_callbacks_run_on_the_scheduler() {
    let scheduler = SchedulerConfig {
        interval_ms: 10,
        capture_timeout_ms: 1_000,
    };
    let mut run = start(unreachable_url(), scheduler, |s| s.set_paused(true));
    run.run_host();

    let (tx, rx) = tokio::sync::oneshot::channel();
    run.pipeline.queue_function(move || {
        let _ = tx.send(());
    });
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("callback ran")
        .unwrap();
    run.pipeline.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn controller_mutators_report_status() {
    let mut run = start(unreachable_url(), one_cycle(), |s| s.set_paused(true));

    assert!(!run.pipeline.toggle_pause());
    assert!(run.pipeline.toggle_pause());
    run.pipeline.set_alert("a red car appears");
    run.pipeline.clear_alert();
    assert!(!run.pipeline.toggle_hide_during_capture());
    assert!(run.pipeline.toggle_hide_during_capture());
    run.pipeline.set_system_prompt("count the cars");
    assert_eq!(run.pipeline.state().system_prompt(), "count the cars");
    run.pipeline.stop().await.unwrap();

    let statuses: Vec<String> = run
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            PipelineEvent::Status { message } => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            "Capture and analysis resumed",
            "Capture and analysis paused",
            "Alert set for condition: a red car appears",
            "Alert condition cleared",
            "Overlay will be visible during screenshots",
            "Overlay will be hidden during screenshots",
            "System prompt updated to: count the cars",
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_history_write_is_reported_and_alert_still_runs() {
    let mock = Arc::new(MockModel {
        analysis: "A red car.".to_string(),
        classification: "Yes".to_string(),
        ..MockModel::default()
    });
    let url = serve_mock(mock).await;
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("history.db");
    let history = Arc::new(HistoryStore::new(&db_path).unwrap());
    rusqlite::Connection::open(&db_path)
        .unwrap()
        .execute_batch("DROP TABLE analysis_history")
        .unwrap();

    let mut run = start_with_history(url, one_cycle(), history, dir, |s| {
        s.set_alert("a red car appears")
    });
    run.run_host();

    run.wait_for(|e| matches!(e, PipelineEvent::AlertTriggered { .. }))
        .await;
    run.pipeline.stop().await.unwrap();

    assert_eq!(run.pipeline.session().len(), 1);
    let errors = run.errors_seen();
    assert!(
        errors.iter().any(|m| m.starts_with("Failed to save analysis")),
        "errors: {:?}",
        errors
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_timeout_bounds_a_stalled_server() {
    let mock = Arc::new(MockModel {
        analysis: "late".to_string(),
        delay_ms: 5_000,
        ..MockModel::default()
    });
    let url = serve_mock(mock).await;
    let client = ModelClient::new(InferenceConfig {
        url,
        request_timeout_secs: 1,
        ..InferenceConfig::default()
    })
    .unwrap();

    let start = Instant::now();
    assert_eq!(client.analyze(None, "hello").await, FALLBACK_TEXT);
    assert!(start.elapsed() < Duration::from_secs(4), "took {:?}", start.elapsed());
}
