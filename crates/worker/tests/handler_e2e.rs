//! End-to-end handler runs against an in-process fake ComfyUI server.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as UrlPath, Query, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::{engine::general_purpose, Engine as _};
use serde_json::{json, Value};
use tokio::sync::Notify;
use vidgen_comfyui::retry::{Clock, RetryPolicy};
use vidgen_core::error::CoreError;
use vidgen_core::input::Fetcher;
use vidgen_worker::config::HandlerConfig;
use vidgen_worker::handler::JobHandler;
use vidgen_worker::response::JobResponse;

const PROMPT_ID: &str = "prompt-1";
const VIDEO_BYTES: &[u8] = b"\x00\x00\x00\x18ftypmp42 fake video";

// ---------------------------------------------------------------------------
// Fake ComfyUI
// ---------------------------------------------------------------------------

struct FakeComfy {
    /// Text frames sent once the prompt is queued, after a binary preview.
    events: Vec<String>,
    history_outputs: Value,
    submitted: Mutex<Option<Value>>,
    ws_client_id: Mutex<Option<String>>,
    queued: Notify,
}

impl FakeComfy {
    fn new(events: Vec<String>, history_outputs: Value) -> Arc<Self> {
        Arc::new(Self {
            events,
            history_outputs,
            submitted: Mutex::new(None),
            ws_client_id: Mutex::new(None),
            queued: Notify::new(),
        })
    }

    fn completing(history_outputs: Value) -> Arc<Self> {
        Self::new(
            vec![
                json!({"type": "execution_start", "data": {"prompt_id": PROMPT_ID}}).to_string(),
                // Completion of someone else's prompt must not end the wait.
                json!({"type": "executing", "data": {"node": null, "prompt_id": "other"}})
                    .to_string(),
                json!({"type": "executing", "data": {"node": "220", "prompt_id": PROMPT_ID}})
                    .to_string(),
                json!({"type": "progress", "data": {"value": 6, "max": 6, "prompt_id": PROMPT_ID}})
                    .to_string(),
                json!({"type": "executing", "data": {"node": null, "prompt_id": PROMPT_ID}})
                    .to_string(),
            ],
            history_outputs,
        )
    }
}

async fn root() -> &'static str {
    "ComfyUI"
}

async fn submit(State(fake): State<Arc<FakeComfy>>, Json(body): Json<Value>) -> Json<Value> {
    *fake.submitted.lock().unwrap() = Some(body);
    fake.queued.notify_one();
    Json(json!({"prompt_id": PROMPT_ID, "number": 1, "node_errors": {}}))
}

async fn history(State(fake): State<Arc<FakeComfy>>, UrlPath(id): UrlPath<String>) -> Json<Value> {
    if id != PROMPT_ID {
        return Json(json!({}));
    }
    Json(json!({
        PROMPT_ID: {
            "prompt": [],
            "outputs": fake.history_outputs.clone(),
            "status": {"status_str": "success", "completed": true, "messages": []}
        }
    }))
}

async fn ws(
    State(fake): State<Arc<FakeComfy>>,
    Query(params): Query<HashMap<String, String>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    *fake.ws_client_id.lock().unwrap() = params.get("clientId").cloned();
    upgrade.on_upgrade(move |socket| stream_events(socket, fake))
}

async fn stream_events(mut socket: WebSocket, fake: Arc<FakeComfy>) {
    let status = json!({"type": "status", "data": {"status": {"exec_info": {"queue_remaining": 0}}, "sid": "s"}});
    if socket.send(Message::Text(status.to_string().into())).await.is_err() {
        return;
    }

    fake.queued.notified().await;

    if socket
        .send(Message::Binary(vec![1u8, 2, 3, 4].into()))
        .await
        .is_err()
    {
        return;
    }
    for event in &fake.events {
        if socket.send(Message::Text(event.clone().into())).await.is_err() {
            return;
        }
    }

    // Hold the socket open until the worker closes it.
    while let Some(Ok(_)) = socket.recv().await {}
}

async fn spawn_fake(fake: Arc<FakeComfy>) -> u16 {
    let app = Router::new()
        .route("/", get(root))
        .route("/prompt", post(submit))
        .route("/history/{id}", get(history))
        .route("/ws", get(ws))
        .with_state(fake);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

// ---------------------------------------------------------------------------
// Test doubles and fixtures
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingFetcher {
    urls: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl Fetcher for RecordingFetcher {
    async fn fetch(&self, url: &str, target: &Path) -> Result<(), CoreError> {
        self.urls.lock().unwrap().push(url.to_string());
        tokio::fs::write(target, b"\xff\xd8\xff jpeg").await?;
        Ok(())
    }
}

#[derive(Default)]
struct RecordingClock {
    sleeps: Mutex<Vec<Duration>>,
}

#[async_trait::async_trait]
impl Clock for RecordingClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

fn template() -> Value {
    json!({
        "244": {"class_type": "LoadImage", "inputs": {"image": "example.png"}},
        "541": {"class_type": "WanVideoEmptyEmbeds", "inputs": {"num_frames": 81, "width": ["235", 0]}},
        "135": {"class_type": "WanVideoTextEncode", "inputs": {"positive_prompt": "", "negative_prompt": ""}},
        "220": {"class_type": "WanVideoSampler", "inputs": {"seed": 0, "steps": 30, "cfg": 6.0}},
        "235": {"class_type": "INTConstant", "inputs": {"value": 0}},
        "236": {"class_type": "INTConstant", "inputs": {"value": 0}},
        "498": {"class_type": "WanVideoContextOptions", "inputs": {"context_frames": 81}},
        "279": {"class_type": "WanVideoLoraSelectMulti", "inputs": {}},
        "131": {"class_type": "VHS_VideoCombine", "inputs": {"images": ["500", 0], "frame_rate": 16}}
    })
}

struct Fixture {
    dir: tempfile::TempDir,
    video_path: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("workflow.json"), template().to_string()).unwrap();
        let loras = dir.path().join("loras");
        std::fs::create_dir_all(&loras).unwrap();
        std::fs::write(loras.join("wan22_5b_lightning.safetensors"), b"").unwrap();

        let video_path = dir.path().join("wan_00001.mp4");
        std::fs::write(&video_path, VIDEO_BYTES).unwrap();

        Self { dir, video_path }
    }

    fn config(&self, port: u16) -> HandlerConfig {
        let root = self.dir.path();
        HandlerConfig {
            server_address: "127.0.0.1".into(),
            comfyui_port: port,
            workflow_path: root.join("workflow.json"),
            lora_dir: root.join("loras"),
            output_dir: root.to_path_buf(),
            default_image: root.join("example_image.png"),
            scratch_root: root.join("scratch"),
            http_ready: RetryPolicy::fixed(Duration::from_millis(10), 5),
            ws_connect: RetryPolicy::fixed(Duration::from_millis(10), 5),
            completion_timeout: Some(Duration::from_secs(10)),
            ..HandlerConfig::default()
        }
    }

    fn video_outputs(&self) -> Value {
        json!({
            "131": {"gifs": [{
                "filename": "wan_00001.mp4",
                "subfolder": "",
                "type": "output",
                "format": "video/h264-mp4",
                "fullpath": self.video_path.to_string_lossy()
            }]}
        })
    }

    fn scratch_entries(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("scratch"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn image_url_job_returns_encoded_video() {
    let fixture = Fixture::new();
    let fake = FakeComfy::completing(fixture.video_outputs());
    let port = spawn_fake(Arc::clone(&fake)).await;
    let fetcher = Arc::new(RecordingFetcher::default());

    let handler = JobHandler::new(fixture.config(port)).with_fetcher(fetcher.clone());
    let response = handler
        .handle_value(json!({
            "id": "job-1",
            "input": {
                "image_url": "https://example.com/cat.jpg",
                "prompt": "a cat walks",
                "length": 65
            }
        }))
        .await;

    let video = assert_matches!(response, JobResponse::Video(video) => video);
    assert!(!video.video.is_empty());
    assert_eq!(
        general_purpose::STANDARD.decode(&video.video).unwrap(),
        VIDEO_BYTES
    );
    assert_eq!(video.frames, 65);
    assert_eq!(video.model, "5B_I2V");
    assert_eq!(video.steps, 6);
    assert_eq!(video.prompt_id, PROMPT_ID);
    assert!(video.generation_time >= 0.0);

    assert_eq!(
        *fetcher.urls.lock().unwrap(),
        vec!["https://example.com/cat.jpg".to_string()]
    );

    let submitted = fake.submitted.lock().unwrap().clone().unwrap();
    let prompt = &submitted["prompt"];
    assert_eq!(prompt["541"]["inputs"]["num_frames"], 65);
    assert_eq!(prompt["135"]["inputs"]["positive_prompt"], "a cat walks");
    assert_eq!(
        prompt["279"]["inputs"]["lora_0"],
        "wan22_5b_lightning.safetensors"
    );
    assert!(prompt["244"]["inputs"]["image"]
        .as_str()
        .unwrap()
        .ends_with("input_image.jpg"));

    // The websocket and the submission share one client id.
    let ws_client_id = fake.ws_client_id.lock().unwrap().clone();
    assert_eq!(ws_client_id.as_deref(), submitted["client_id"].as_str());

    // The per-job scratch directory is gone once the job finishes.
    assert_eq!(fixture.scratch_entries(), 0);
}

#[tokio::test]
async fn empty_history_yields_no_output() {
    let fixture = Fixture::new();
    let fake = FakeComfy::completing(json!({}));
    let port = spawn_fake(fake).await;

    let response = JobHandler::new(fixture.config(port))
        .handle_value(json!({"input": {"image_path": "/in.png"}}))
        .await;

    assert_eq!(response, JobResponse::no_output());
    assert_eq!(
        serde_json::to_value(&response).unwrap(),
        json!({"error": "No video generated"})
    );
}

#[tokio::test]
async fn execution_error_fails_the_job() {
    let fixture = Fixture::new();
    let fake = FakeComfy::new(
        vec![json!({
            "type": "execution_error",
            "data": {
                "prompt_id": PROMPT_ID,
                "node_id": "220",
                "exception_type": "torch.OutOfMemoryError",
                "exception_message": "CUDA out of memory"
            }
        })
        .to_string()],
        fixture.video_outputs(),
    );
    let port = spawn_fake(fake).await;

    let response = JobHandler::new(fixture.config(port))
        .handle_value(json!({"input": {}}))
        .await;

    assert_matches!(response, JobResponse::Failed { ref code, .. } if code == "EXECUTION_FAILED");
}

#[tokio::test]
async fn unreachable_server_fails_after_readiness_attempts() {
    let fixture = Fixture::new();
    // Reserve a port, then free it so nothing listens there.
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let clock = Arc::new(RecordingClock::default());

    let config = HandlerConfig {
        http_ready: RetryPolicy::fixed(Duration::from_secs(1), 4),
        ..fixture.config(port)
    };
    let response = JobHandler::new(config)
        .with_clock(clock.clone())
        .handle_value(json!({"input": {"image_path": "/in.png"}}))
        .await;

    assert_matches!(response, JobResponse::Failed { ref code, .. } if code == "SERVER_UNREACHABLE");
    assert!(response.is_failure());
    assert_eq!(
        *clock.sleeps.lock().unwrap(),
        vec![Duration::from_secs(1); 3]
    );
}
