//! End-to-end install cycle against a fake Jenkins server.
//!
//! The fake server is an Axum app on a random port; the real
//! `JenkinsClient`, `JsonPackageStore` and `ArtifactFetcher` talk to it.
//! Only msiexec and hook scripts are mocked.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::broadcast;

use ci_autoinstall::errors::InstallError;
use ci_autoinstall::fetcher::netdrive::NoopDriveMapper;
use ci_autoinstall::fetcher::ArtifactFetcher;
use ci_autoinstall::installer::script::MockScriptRunner;
use ci_autoinstall::installer::{InstallRunner, MockCommandRunner};
use ci_autoinstall::models::{AgentConfig, InstallOutcome};
use ci_autoinstall::notify::notifier_from_config;
use ci_autoinstall::orchestrator::Orchestrator;
use ci_autoinstall::remote::{BuildSource, JenkinsClient};
use ci_autoinstall::storage::packages::JsonPackageStore;
use ci_autoinstall::storage::PackageStore;

// ---------------------------------------------------------------------------
// Fake Jenkins
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeJenkins {
    base_url: String,
    builds: Mutex<HashMap<(String, u64), Value>>,
    last_successful: Mutex<HashMap<String, u64>>,
    /// Artifact bodies by `<job>/<number>/<relativePath>`. Missing entries 404.
    artifacts: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeJenkins {
    fn build_url(&self, job: &str, number: u64) -> String {
        format!("{}/job/{}/{}/", self.base_url, job, number)
    }

    /// Publish a successful build. Files named in `missing` are listed but
    /// not served.
    fn publish(&self, job: &str, number: u64, files: &[&str], missing: &[&str]) {
        let artifacts: Vec<Value> = files
            .iter()
            .map(|f| json!({ "fileName": f, "relativePath": format!("dist/{}", f) }))
            .collect();
        let build = json!({
            "number": number,
            "result": "SUCCESS",
            "building": false,
            "url": self.build_url(job, number),
            "displayName": format!("#{}", number),
            "artifacts": artifacts,
            "culprits": [{ "fullName": "Ada Lovelace" }],
            "changeSet": {
                "kind": "git",
                "items": [{
                    "msg": format!("Change for build {}", number),
                    "author": { "fullName": "Ada Lovelace" },
                    "commitId": format!("c0ffee{}", number),
                    "affectedPaths": ["src/app.rs"]
                }]
            }
        });
        self.builds
            .lock()
            .unwrap()
            .insert((job.to_string(), number), build);
        self.last_successful
            .lock()
            .unwrap()
            .insert(job.to_string(), number);

        let mut served = self.artifacts.lock().unwrap();
        for f in files.iter().filter(|f| !missing.contains(f)) {
            served.insert(
                format!("{}/{}/dist/{}", job, number, f),
                format!("{} of {} #{}", f, job, number).into_bytes(),
            );
        }
    }
}

async fn job_api(
    State(fake): State<Arc<FakeJenkins>>,
    UrlPath(job): UrlPath<String>,
) -> Response {
    let last = fake.last_successful.lock().unwrap().get(&job).copied();
    let numbers: Vec<u64> = fake
        .builds
        .lock()
        .unwrap()
        .keys()
        .filter(|(j, _)| *j == job)
        .map(|(_, n)| *n)
        .collect();
    if numbers.is_empty() {
        return StatusCode::NOT_FOUND.into_response();
    }
    let build_ref = |n: u64| json!({ "number": n, "url": fake.build_url(&job, n) });
    Json(json!({
        "name": job,
        "url": format!("{}/job/{}/", fake.base_url, job),
        "buildable": true,
        "lastBuild": numbers.iter().max().map(|n| build_ref(*n)),
        "lastSuccessfulBuild": last.map(build_ref),
        "builds": numbers.iter().map(|n| build_ref(*n)).collect::<Vec<_>>(),
    }))
    .into_response()
}

async fn build_api(
    State(fake): State<Arc<FakeJenkins>>,
    UrlPath((job, number)): UrlPath<(String, u64)>,
) -> Response {
    match fake.builds.lock().unwrap().get(&(job, number)) {
        Some(build) => Json(build.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn artifact(
    State(fake): State<Arc<FakeJenkins>>,
    UrlPath((job, number, path)): UrlPath<(String, u64, String)>,
) -> Response {
    let key = format!("{}/{}/{}", job, number, path);
    match fake.artifacts.lock().unwrap().get(&key) {
        Some(body) => body.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Start the fake server; returns it once its base URL is known.
async fn start_fake_jenkins() -> Arc<FakeJenkins> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to random port");
    let addr = listener.local_addr().expect("get local addr");
    let fake = Arc::new(FakeJenkins {
        base_url: format!("http://{}", addr),
        ..Default::default()
    });

    let router = Router::new()
        .route("/job/{job}/api/json", get(job_api))
        .route("/job/{job}/{number}/api/json", get(build_api))
        .route("/job/{job}/{number}/artifact/{*path}", get(artifact))
        .with_state(Arc::clone(&fake));
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    fake
}

// ---------------------------------------------------------------------------
// Agent under test
// ---------------------------------------------------------------------------

struct Agent {
    orchestrator: Orchestrator,
    commands: Arc<MockCommandRunner>,
    scripts: Arc<MockScriptRunner>,
    registry: PathBuf,
    artifacts: PathBuf,
    data_dir: PathBuf,
    post_install: PathBuf,
    pre_uninstall: PathBuf,
    _tmp: TempDir,
}

impl Agent {
    fn registry_bytes(&self) -> Vec<u8> {
        std::fs::read(&self.registry).expect("read packages.json")
    }

    fn build_dir(&self, job: &str, number: u64) -> PathBuf {
        ci_autoinstall::fetcher::build_dir(&self.artifacts, job, number)
    }

    fn calls_with_flag(&self, flag: &str) -> Vec<String> {
        self.commands
            .calls()
            .into_iter()
            .filter(|c| c.args.first().map(String::as_str) == Some(flag))
            .map(|c| c.args[1].clone())
            .collect()
    }
}

async fn start_agent(fake: &FakeJenkins, configure: impl FnOnce(&mut AgentConfig)) -> Agent {
    let tmp = TempDir::new().expect("create temp dir");
    let data_dir = tmp.path().join("data");
    let artifacts = tmp.path().join("artifacts");
    // Hooks only run when the script file exists.
    let hooks = tmp.path().join("hooks");
    std::fs::create_dir_all(&hooks).expect("create hooks dir");
    let post_install = hooks.join("post-install.ps1");
    let pre_uninstall = hooks.join("pre-uninstall.ps1");
    std::fs::write(&post_install, "exit 0").expect("write hook");
    std::fs::write(&pre_uninstall, "exit 0").expect("write hook");
    let mut config = AgentConfig {
        server_url: fake.base_url.clone(),
        jobs: vec!["Nightly".to_string()],
        data_dir: Some(data_dir.clone()),
        artifacts_dir: Some(artifacts.clone()),
        post_install_script: Some(post_install.clone()),
        pre_uninstall_script: Some(pre_uninstall.clone()),
        ..Default::default()
    };
    configure(&mut config);
    let config = Arc::new(config);

    let source: Arc<dyn BuildSource> =
        Arc::new(JenkinsClient::from_config(&config).expect("create client"));
    let store = JsonPackageStore::new(data_dir.clone())
        .await
        .expect("open store");
    let registry = store.path().to_path_buf();
    let store: Arc<dyn PackageStore> = Arc::new(store);
    let fetcher = Arc::new(ArtifactFetcher::new(
        Arc::clone(&source),
        config.max_concurrent_downloads,
        Arc::new(NoopDriveMapper),
        None,
    ));
    let commands = Arc::new(MockCommandRunner::new());
    let scripts = Arc::new(MockScriptRunner::new());
    let installer = Arc::new(InstallRunner::new(
        Arc::clone(&config),
        commands.clone(),
        scripts.clone(),
    ));
    let notifier = notifier_from_config(&config, &data_dir).expect("notifier");
    let (event_tx, _) = broadcast::channel(64);

    Agent {
        orchestrator: Orchestrator::new(
            config, source, store, fetcher, installer, notifier, event_tx,
        ),
        commands,
        scripts,
        registry,
        artifacts,
        data_dir,
        post_install,
        pre_uninstall,
        _tmp: tmp,
    }
}

fn installed_report(outcome: InstallOutcome) -> ci_autoinstall::models::InstallReport {
    match outcome {
        InstallOutcome::Installed(report) => report,
        other => panic!("expected Installed, got {:?}", other),
    }
}

fn read_registry(path: &Path) -> Value {
    serde_json::from_slice(&std::fs::read(path).expect("read registry")).expect("parse registry")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_full_install_cycle() {
    let fake = start_fake_jenkins().await;
    fake.publish("Nightly", 34, &["app.msi", "readme.txt"], &[]);
    let agent = start_agent(&fake, |_| {}).await;

    // First install.
    let report = installed_report(
        agent
            .orchestrator
            .install_latest_successful_build("Nightly")
            .await
            .expect("install #34"),
    );
    let dir34 = agent.build_dir("Nightly", 34);
    assert_eq!(report.previous_build, None);
    assert_eq!(report.paths, vec![dir34.join("app.msi"), dir34.join("readme.txt")]);
    assert_eq!(
        std::fs::read_to_string(dir34.join("app.msi")).unwrap(),
        "app.msi of Nightly #34"
    );
    assert_eq!(
        agent.calls_with_flag("/i"),
        vec![dir34.join("app.msi").display().to_string()]
    );
    assert_eq!(agent.scripts.runs(), vec![agent.post_install.clone()]);

    let registry = read_registry(&agent.registry);
    assert_eq!(registry.as_array().unwrap().len(), 1);
    assert_eq!(registry[0]["job"], "Nightly");
    assert_eq!(registry[0]["build"]["number"], 34);
    assert_eq!(registry[0]["url"], fake.build_url("Nightly", 34));
    assert_eq!(registry[0]["changeSet"]["items"][0]["msg"], "Change for build 34");

    // Same build again: nothing happens, registry untouched byte for byte.
    let before = agent.registry_bytes();
    let calls = agent.commands.call_count();
    let outcome = agent
        .orchestrator
        .install_latest_successful_build("Nightly")
        .await
        .expect("repeat");
    assert_eq!(
        outcome,
        InstallOutcome::NoChange {
            job: "Nightly".to_string(),
            build_number: 34
        }
    );
    assert_eq!(agent.registry_bytes(), before);
    assert_eq!(agent.commands.call_count(), calls);

    // New build: old one uninstalled first, then replaced.
    fake.publish("Nightly", 35, &["app.msi"], &[]);
    let report = installed_report(
        agent
            .orchestrator
            .install_latest_successful_build("Nightly")
            .await
            .expect("install #35"),
    );
    let dir35 = agent.build_dir("Nightly", 35);
    assert_eq!(report.previous_build, Some(34));
    assert_eq!(
        agent.calls_with_flag("/x"),
        vec![dir34.join("app.msi").display().to_string()]
    );
    assert_eq!(
        agent.calls_with_flag("/i").last(),
        Some(&dir35.join("app.msi").display().to_string())
    );
    assert_eq!(
        agent.scripts.runs(),
        vec![
            agent.post_install.clone(),
            agent.pre_uninstall.clone(),
            agent.post_install.clone(),
        ]
    );
    assert!(!dir34.join("app.msi").exists());
    let registry = read_registry(&agent.registry);
    assert_eq!(registry.as_array().unwrap().len(), 1);
    assert_eq!(registry[0]["build"]["number"], 35);
}

#[tokio::test]
async fn test_download_failure_keeps_installed_build() {
    let fake = start_fake_jenkins().await;
    fake.publish("Nightly", 35, &["app.msi"], &[]);
    let agent = start_agent(&fake, |_| {}).await;
    agent
        .orchestrator
        .install_latest_successful_build("Nightly")
        .await
        .expect("install #35");

    let before = agent.registry_bytes();
    let calls = agent.commands.call_count();
    fake.publish("Nightly", 36, &["app.msi", "server.msi"], &["server.msi"]);

    let result = agent
        .orchestrator
        .install_latest_successful_build("Nightly")
        .await;

    match result {
        Err(InstallError::ArtifactDownload(message)) => {
            assert!(message.contains("server.msi"), "Got: {}", message)
        }
        other => panic!("expected ArtifactDownload, got {:?}", other),
    }
    assert_eq!(agent.registry_bytes(), before);
    assert_eq!(agent.commands.call_count(), calls);
    assert!(agent.build_dir("Nightly", 35).join("app.msi").exists());
}

#[tokio::test]
async fn test_uninstall_downloads_missing_files_again() {
    let fake = start_fake_jenkins().await;
    fake.publish("Nightly", 34, &["app.msi"], &[]);
    let agent = start_agent(&fake, |_| {}).await;
    agent
        .orchestrator
        .install_latest_successful_build("Nightly")
        .await
        .expect("install #34");

    let dir34 = agent.build_dir("Nightly", 34);
    std::fs::remove_dir_all(&dir34).expect("delete artifacts");

    let removed = agent
        .orchestrator
        .uninstall_build("Nightly")
        .await
        .expect("uninstall");

    assert!(removed);
    assert_eq!(
        agent.calls_with_flag("/x"),
        vec![dir34.join("app.msi").display().to_string()]
    );
    assert_eq!(read_registry(&agent.registry), json!([]));
    assert!(!agent
        .orchestrator
        .uninstall_build("Nightly")
        .await
        .expect("second uninstall"));
}

#[tokio::test]
async fn test_unknown_job_is_remote_query_error() {
    let fake = start_fake_jenkins().await;
    let agent = start_agent(&fake, |_| {}).await;

    let result = agent
        .orchestrator
        .install_latest_successful_build("Missing")
        .await;

    assert!(matches!(result, Err(InstallError::RemoteQuery(_))));
    assert!(!agent.registry.exists());
}

#[tokio::test]
async fn test_check_against_server() {
    let fake = start_fake_jenkins().await;
    fake.publish("Nightly", 34, &["app.msi"], &[]);
    let agent = start_agent(&fake, |_| {}).await;

    let status = agent.orchestrator.check("Nightly").await.expect("check");
    assert_eq!(status.installed_build, None);
    assert_eq!(status.latest_successful_build, Some(34));

    agent
        .orchestrator
        .install_latest_successful_build("Nightly")
        .await
        .expect("install");
    fake.publish("Nightly", 35, &["app.msi"], &[]);

    let status = agent.orchestrator.check("Nightly").await.expect("check");
    assert_eq!(status.installed_build, Some(34));
    assert_eq!(status.latest_successful_build, Some(35));
    assert!(!status.up_to_date());
}

#[tokio::test]
async fn test_install_queues_notification_mail() {
    let fake = start_fake_jenkins().await;
    fake.publish("Nightly", 34, &["app.msi"], &[]);
    let agent = start_agent(&fake, |config| {
        config.notification.enabled = true;
        config.notification.to = vec!["qa@example.com".to_string()];
    })
    .await;

    agent
        .orchestrator
        .install_latest_successful_build("Nightly")
        .await
        .expect("install");

    let mail_dir = agent.data_dir.join("mail");
    let mails: Vec<PathBuf> = std::fs::read_dir(&mail_dir)
        .expect("mail dir")
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(mails.len(), 1);
    let message = std::fs::read_to_string(&mails[0]).unwrap();
    assert!(message.contains("To: qa@example.com\r\n"));
    assert!(message.contains("Subject: [autoinstall] Nightly #34 installed\r\n"));
    assert!(message.contains("Change for build 34 (Ada Lovelace)"));
}
