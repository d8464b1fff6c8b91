//! Daemon tests driven through the spool directory

use std::path::{Path, PathBuf};
use std::time::Duration;

use deploy_api::{DeploymentReport, DeploymentState, DeploymentStatus};
use tokio::sync::oneshot;

use dropletd::app::options::AppOptions;
use dropletd::app::run::run;
use dropletd::errors::DeployError;

use crate::common::Fixture;

struct Daemon {
    spool: PathBuf,
    stop: oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<Result<(), DeployError>>,
}

impl Daemon {
    fn start(fixture: &Fixture) -> Self {
        let mut settings = fixture.settings.clone();
        settings.certificates.enabled = false;

        let mut options = AppOptions::from_settings(settings);
        options.spool.interval = Duration::from_millis(100);
        let spool = options.spool.spool_dir.clone();
        std::fs::create_dir_all(&spool).unwrap();

        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(run("test".to_string(), options, async move {
            let _ = stopped.await;
        }));
        Self {
            spool,
            stop,
            handle,
        }
    }

    fn submit(&self, id: &str, request: serde_json::Value) {
        // Written under another name first so the worker never sees half a file
        let tmp = self.spool.join(format!("{}.json.part", id));
        std::fs::write(&tmp, serde_json::to_vec(&request).unwrap()).unwrap();
        std::fs::rename(tmp, self.spool.join(format!("{}.json", id))).unwrap();
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        tokio::time::timeout(Duration::from_secs(30), self.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

async fn wait_for(path: &Path, contains: &str) -> String {
    for _ in 0..300 {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if contents.contains(contains) {
                return contents;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("{} never contained {:?}", path.display(), contains);
}

async fn wait_for_report(spool: &Path, id: &str) -> DeploymentReport {
    let contents = wait_for(&spool.join(format!("{}.result.json", id)), "status").await;
    serde_json::from_str(&contents).unwrap()
}

fn request(id: &str, build: Option<&str>) -> serde_json::Value {
    serde_json::json!({
        "deploymentId": id,
        "siteId": "site-1",
        "siteName": "Acme",
        "domain": "https://Acme.dev/",
        "repo": "acme/site",
        "buildCommand": build,
    })
}

#[tokio::test]
async fn test_spooled_request_is_deployed_and_reported() {
    let fixture = Fixture::new();
    fixture.repo("site", &[("index.html", "<h1>Acme</h1>\n")]);
    let daemon = Daemon::start(&fixture);

    daemon.submit("d-1", request("d-1", None));
    let report = wait_for_report(&daemon.spool, "d-1").await;

    assert_eq!(report.status, DeploymentStatus::Success, "{}", report.build_log);
    assert_eq!(report.deployment_id, "d-1");
    assert_eq!(report.message, "Initial commit");
    assert!(report.error.is_none());
    assert!(report.build_log.contains("SSL setup disabled, skipping"));

    let log = std::fs::read_to_string(daemon.spool.join("d-1.log")).unwrap();
    assert_eq!(log.trim_end(), report.build_log);
    assert!(daemon.spool.join("d-1.claimed.json").exists());

    let state: DeploymentState =
        serde_json::from_str(&std::fs::read_to_string(daemon.spool.join("d-1.status.json")).unwrap()).unwrap();
    assert_eq!(state.status, DeploymentStatus::Success);
    assert!(state.started_at.unwrap() <= state.completed_at.unwrap());
    assert!(!daemon.spool.join("d-1.json").exists());

    // Domain was normalized before it reached the host
    let published = fixture.layout().site_dir("acme.dev");
    assert!(published.path().join("index.html").exists());

    daemon.stop().await;
}

#[tokio::test]
async fn test_cancel_file_cancels_deployment() {
    let fixture = Fixture::new();
    fixture.repo("site", &[("index.html", "<h1>Acme</h1>\n")]);
    let daemon = Daemon::start(&fixture);

    daemon.submit("d-2", request("d-2", Some("sleep 30")));
    wait_for(&daemon.spool.join("d-2.log"), "Running build: sleep 30").await;
    std::fs::write(daemon.spool.join("d-2.cancel"), "").unwrap();

    let report = wait_for_report(&daemon.spool, "d-2").await;
    assert_eq!(report.status, DeploymentStatus::Canceled);
    assert!(report.build_log.ends_with("🛑 Deployment canceled"));

    daemon.stop().await;
}

#[tokio::test]
async fn test_shutdown_cancels_in_flight_deployments() {
    let fixture = Fixture::new();
    fixture.repo("site", &[("index.html", "<h1>Acme</h1>\n")]);
    let daemon = Daemon::start(&fixture);
    let spool = daemon.spool.clone();

    daemon.submit("d-3", request("d-3", Some("sleep 30")));
    wait_for(&spool.join("d-3.log"), "Running build: sleep 30").await;
    daemon.stop().await;

    let report = wait_for_report(&spool, "d-3").await;
    assert_eq!(report.status, DeploymentStatus::Canceled);
}
