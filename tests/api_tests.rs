//! Integration tests for the HTTP API.
//!
//! These tests spawn a real Axum server on a random port and use reqwest
//! (directly and through the CLI helpers) to hit it with actual HTTP requests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ci_autoinstall::cli::{packages, send_json};
use ci_autoinstall::errors::InstallError;
use ci_autoinstall::fetcher::netdrive::NoopDriveMapper;
use ci_autoinstall::fetcher::ArtifactFetcher;
use ci_autoinstall::installer::script::MockScriptRunner;
use ci_autoinstall::installer::{InstallRunner, MockCommandRunner};
use ci_autoinstall::models::{
    AgentConfig, Artifact, Build, BuildRef, BuildResult, ChangeSet, InstallOutcome, Job, Package,
};
use ci_autoinstall::notify::NoopNotifier;
use ci_autoinstall::orchestrator::Orchestrator;
use ci_autoinstall::remote::{BuildSource, ByteStream};
use ci_autoinstall::server::health::HealthResponse;
use ci_autoinstall::server::{self, AppState};
use ci_autoinstall::storage::packages::JsonPackageStore;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tempfile::TempDir;
use tokio::sync::{broadcast, Notify, RwLock};

// ---------------------------------------------------------------------------
// In-memory build source
// ---------------------------------------------------------------------------

struct InMemoryBuildSource {
    builds: RwLock<Vec<Build>>,
}

impl InMemoryBuildSource {
    fn new() -> Self {
        Self {
            builds: RwLock::new(Vec::new()),
        }
    }

    async fn publish(&self, number: u64) {
        self.builds.write().await.push(Build {
            number,
            result: Some(BuildResult::Success),
            building: false,
            artifacts: vec![Artifact {
                file_name: "app.msi".to_string(),
                relative_path: "dist/app.msi".to_string(),
                display_path: None,
            }],
            culprits: vec![],
            change_set: ChangeSet::default(),
            change_sets: vec![],
            url: format!("http://ci.local/job/Nightly/{}/", number),
            display_name: None,
            timestamp: None,
        });
    }
}

#[async_trait]
impl BuildSource for InMemoryBuildSource {
    async fn get_job(&self, job: &str) -> Result<Job, InstallError> {
        if job != "Nightly" {
            return Err(InstallError::RemoteQuery(format!(
                "GET http://ci.local/job/{}/api/json: HTTP 404 Not Found",
                job
            )));
        }
        let builds = self.builds.read().await;
        let refs: Vec<BuildRef> = builds
            .iter()
            .map(|b| BuildRef {
                number: b.number,
                url: b.url.clone(),
            })
            .collect();
        Ok(Job {
            name: job.to_string(),
            url: "http://ci.local/job/Nightly/".to_string(),
            buildable: Some(true),
            last_build: refs.last().cloned(),
            last_successful_build: refs.last().cloned(),
            builds: refs,
        })
    }

    async fn get_build(&self, job: &str, number: u64) -> Result<Build, InstallError> {
        self.builds
            .read()
            .await
            .iter()
            .find(|b| b.number == number)
            .cloned()
            .ok_or_else(|| InstallError::RemoteQuery(format!("Build '{}' #{} not found", job, number)))
    }

    async fn open_artifact(&self, url: &str) -> Result<ByteStream, InstallError> {
        Ok(stream::iter(vec![Ok(url.as_bytes().to_vec())]).boxed())
    }
}

// ---------------------------------------------------------------------------
// Helper to spawn a test server on a random port
// ---------------------------------------------------------------------------

struct TestServer {
    base_url: String,
    port: u16,
    source: Arc<InMemoryBuildSource>,
    commands: Arc<MockCommandRunner>,
    _tmp: TempDir,
}

async fn spawn_test_server() -> TestServer {
    let tmp = TempDir::new().expect("create temp dir");
    let config = Arc::new(AgentConfig {
        jobs: vec!["Nightly".to_string()],
        data_dir: Some(tmp.path().to_path_buf()),
        artifacts_dir: Some(tmp.path().join("artifacts")),
        ..Default::default()
    });

    let source = Arc::new(InMemoryBuildSource::new());
    source.publish(34).await;
    let dyn_source: Arc<dyn BuildSource> = source.clone();

    let commands = Arc::new(MockCommandRunner::new());
    let (event_tx, _) = broadcast::channel(64);
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&config),
        Arc::clone(&dyn_source),
        Arc::new(
            JsonPackageStore::new(tmp.path().to_path_buf())
                .await
                .expect("open store"),
        ),
        Arc::new(ArtifactFetcher::new(
            dyn_source,
            2,
            Arc::new(NoopDriveMapper),
            None,
        )),
        Arc::new(InstallRunner::new(
            Arc::clone(&config),
            commands.clone(),
            Arc::new(MockScriptRunner::new()),
        )),
        Arc::new(NoopNotifier),
        event_tx,
    ));

    let state = Arc::new(AppState {
        orchestrator,
        poll_notify: Arc::new(Notify::new()),
        config,
        start_time: Instant::now(),
        shutdown_tx: None,
    });
    let router = server::create_router(state);

    // Bind to port 0 to get a random available port
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to random port");
    let addr = listener.local_addr().expect("get local addr");

    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    // Give the server a moment to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        base_url: format!("http://{}", addr),
        port: addr.port(),
        source,
        commands,
        _tmp: tmp,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_health_endpoint_returns_typed_response() {
    let server = spawn_test_server().await;
    let client = reqwest::Client::new();

    let health: HealthResponse = send_json(
        client.get(format!("{}/health", server.base_url)),
        "127.0.0.1",
        server.port,
    )
    .await
    .expect("health");

    assert_eq!(health.status, "ok");
    assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
    assert_eq!(health.watched_jobs, vec!["Nightly".to_string()]);
    assert_eq!(health.installed_packages, 0);
}

#[tokio::test]
async fn test_install_and_list_via_http() {
    let server = spawn_test_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/jobs/Nightly/install", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let outcome: InstallOutcome = resp.json().await.unwrap();
    assert_eq!(outcome.build_number(), 34);
    assert!(!outcome.is_no_change());

    let resp = client
        .get(format!("{}/api/packages", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let packages: Vec<Package> = resp.json().await.unwrap();
    assert_eq!(packages.len(), 1);
    assert_eq!(packages[0].job, "Nightly");
    assert_eq!(packages[0].url, "http://ci.local/job/Nightly/34/");
    assert!(packages[0].paths[0].ends_with("app.msi"));
}

#[tokio::test]
async fn test_error_body_shape() {
    let server = spawn_test_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/jobs/Missing/install", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["error"], "remote_query");
    assert!(json["message"].as_str().unwrap().contains("Missing"));

    let resp = client
        .get(format!("{}/api/packages/Nightly", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["error"], "not_found");
}

#[tokio::test]
async fn test_cli_commands_against_daemon() {
    let server = spawn_test_server().await;
    let port = server.port;

    packages::cmd_install("127.0.0.1", port, "Nightly", None)
        .await
        .expect("install");
    packages::cmd_check("127.0.0.1", port, "Nightly")
        .await
        .expect("check");
    packages::cmd_list("127.0.0.1", port, false)
        .await
        .expect("list");
    packages::cmd_list("127.0.0.1", port, true)
        .await
        .expect("list --json");

    server.source.publish(35).await;
    packages::cmd_install("127.0.0.1", port, "Nightly", Some(35))
        .await
        .expect("install #35");
    assert_eq!(
        server
            .commands
            .calls()
            .iter()
            .map(|c| c.args[0].as_str())
            .collect::<Vec<_>>(),
        vec!["/i", "/x", "/i"]
    );

    packages::cmd_uninstall("127.0.0.1", port, "Nightly")
        .await
        .expect("uninstall");
    packages::cmd_poll("127.0.0.1", port).await.expect("poll");
}

#[tokio::test]
async fn test_cli_reports_daemon_error_message() {
    let server = spawn_test_server().await;

    let err = packages::cmd_install("127.0.0.1", server.port, "Missing", None)
        .await
        .unwrap_err()
        .to_string();
    assert!(err.contains("HTTP 502"), "Got: {}", err);
    assert!(err.contains("Missing"), "Got: {}", err);

    let err = packages::cmd_install("127.0.0.1", server.port, "Nightly", Some(99))
        .await
        .unwrap_err()
        .to_string();
    assert!(err.contains("#99 not found"), "Got: {}", err);
}

#[tokio::test]
async fn test_events_stream_over_http() {
    let server = spawn_test_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/api/events?job=Nightly", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .starts_with("text/event-stream"));

    client
        .post(format!("{}/api/jobs/Nightly/install", server.base_url))
        .send()
        .await
        .unwrap();

    let mut body = resp.bytes_stream();
    let mut received = String::new();
    let read = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = body.next().await {
            received.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
            if received.contains("event: Installed") {
                break;
            }
        }
    })
    .await;

    assert!(read.is_ok(), "Timed out, received: {}", received);
    assert!(received.contains("event: CheckStarted"));
    assert!(received.contains("event: Downloaded"));
    assert!(received.contains("\"build_number\":34"));
}
