//! End-to-end pipeline tests against a local git remote and a sandboxed host

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use dropletd::deploy::context::NoopObserver;
use dropletd::models::deployment::DeploymentOutcome;
use dropletd::models::site::{SiteKind, SiteSpec};
use secrecy::SecretString;

use crate::common::{line_index, Fixture, MemorySupervisor, RecordingObserver, PUBLIC_IP};

const INDEX: &str = "<h1>Acme</h1>\n";

fn static_site(build: Option<&str>, output_dir: &str) -> SiteSpec {
    let mut site = SiteSpec::new("site-1", "acme.dev", "acme/site", "main");
    site.name = "Acme".to_string();
    site.build_command = build.map(str::to_string);
    site.output_dir = output_dir.to_string();
    site
}

fn backend_site() -> SiteSpec {
    let mut site = SiteSpec::new("api-1", "api.acme.dev", "acme/api", "main");
    site.name = "Acme API".to_string();
    site.kind = SiteKind::Backend;
    site.start_command = "node server.js".to_string();
    site
}

#[tokio::test]
async fn test_static_site_end_to_end() {
    let fixture = Fixture::new();
    fixture.repo("site", &[("index.html", INDEX)]);
    let pipeline = fixture.pipeline(Arc::new(MemorySupervisor::default()));
    let observer = Arc::new(RecordingObserver::default());

    let mut site = static_site(Some("mkdir -p dist && cp index.html dist/index.html"), "dist");
    site.env_vars = Some("API_URL=https://api.acme.dev\n".to_string());
    let result = pipeline
        .deploy(&site, CancellationToken::new(), observer.clone())
        .await;

    assert!(result.success, "{}", result.log);
    assert_eq!(result.outcome, DeploymentOutcome::Succeeded);
    assert_eq!(result.commit_message, "Initial commit");
    assert_eq!(result.port, None);

    // Steps ran in order
    let log = &result.log;
    assert!(line_index(log, "Cloning acme/site (main)...") < line_index(log, "Repository ready"));
    assert!(line_index(log, "Repository ready") < line_index(log, "Injecting stored .env variables..."));
    assert!(line_index(log, "Running build:") < line_index(log, "Build complete"));
    assert!(line_index(log, "Build complete") < line_index(log, "Files deployed to"));
    assert!(line_index(log, "Files deployed to") < line_index(log, "Configuring Nginx..."));
    assert!(line_index(log, "Nginx configured and reloaded") < line_index(log, "Setting up SSL..."));
    assert!(log.lines().last().unwrap().starts_with("✅ Deployed successfully in"));

    // Host state
    let layout = fixture.layout();
    let tree = layout.repo_dir("site-1");
    assert_eq!(
        std::fs::read_to_string(tree.path().join(".env")).unwrap(),
        "API_URL=https://api.acme.dev\n"
    );
    let site_dir = layout.site_dir("acme.dev");
    assert_eq!(std::fs::read_to_string(site_dir.path().join("index.html")).unwrap(), INDEX);

    let vhost = std::fs::read_to_string(layout.available_config("acme.dev").path()).unwrap();
    assert!(vhost.contains("server_name acme.dev;"));
    assert!(vhost.contains(&format!("root {};", site_dir.path().display())));
    let link = std::fs::symlink_metadata(layout.enabled_link("acme.dev").path()).unwrap();
    assert!(link.file_type().is_symlink());

    // Observer saw everything exactly once
    assert_eq!(observer.lines.lock().unwrap().join("\n"), result.log);
    let progress = observer.progress.lock().unwrap().clone();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", progress);
    assert_eq!(progress.last(), Some(&7));
    assert_eq!(*observer.finished.lock().unwrap(), 1);

    // Transcript archived
    let archived = layout.transcripts_dir("site-1").list_files().await.unwrap();
    assert_eq!(archived.len(), 1);
}

#[tokio::test]
async fn test_redeploy_updates_tree_and_keeps_vhost() {
    let fixture = Fixture::new();
    let repo = fixture.repo("site", &[("index.html", INDEX)]);
    let pipeline = fixture.pipeline(Arc::new(MemorySupervisor::default()));
    let site = static_site(None, ".");

    let first = pipeline
        .deploy(&site, CancellationToken::new(), Arc::new(NoopObserver))
        .await;
    assert!(first.success, "{}", first.log);
    let vhost = fixture.layout().available_config("acme.dev");
    let written = std::fs::metadata(vhost.path()).unwrap().modified().unwrap();

    repo.commit(&[("index.html", "<h1>Acme v2</h1>\n")], "Second commit");
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = pipeline
        .deploy(&site, CancellationToken::new(), Arc::new(NoopObserver))
        .await;
    assert!(second.success, "{}", second.log);
    assert_eq!(second.commit_message, "Second commit");
    assert!(second.log.contains("Updating acme/site (main)..."));
    assert!(second.log.contains("Virtual host unchanged"));
    assert_eq!(std::fs::metadata(vhost.path()).unwrap().modified().unwrap(), written);

    let published = fixture.layout().site_dir("acme.dev");
    assert_eq!(
        std::fs::read_to_string(published.path().join("index.html")).unwrap(),
        "<h1>Acme v2</h1>\n"
    );
}

#[tokio::test]
async fn test_whole_tree_publish_skips_git_and_env() {
    let fixture = Fixture::new();
    fixture.repo("site", &[("index.html", INDEX), ("css/site.css", "body {}\n")]);
    let pipeline = fixture.pipeline(Arc::new(MemorySupervisor::default()));

    let mut site = static_site(None, ".");
    site.env_vars = Some("SECRET=1\n".to_string());
    let result = pipeline
        .deploy(&site, CancellationToken::new(), Arc::new(NoopObserver))
        .await;
    assert!(result.success, "{}", result.log);
    assert!(result.log.contains("No build command configured, skipping build"));

    let published = fixture.layout().site_dir("acme.dev");
    assert!(published.path().join("index.html").exists());
    assert!(published.path().join("css/site.css").exists());
    assert!(!published.path().join(".git").exists());
    assert!(!published.path().join(".env").exists());
}

#[tokio::test]
async fn test_backend_redeploy_replaces_process_on_same_port() {
    let fixture = Fixture::new();
    fixture.repo("api", &[("server.js", "require('http').createServer().listen(process.env.PORT)\n")]);
    let supervisor = Arc::new(MemorySupervisor::default());
    let pipeline = fixture.pipeline(supervisor.clone());
    let observer = Arc::new(RecordingObserver::default());

    let mut site = backend_site();
    site.env_vars = Some("DATABASE_URL=postgres://db/acme\n".to_string());
    let first = pipeline
        .deploy(&site, CancellationToken::new(), observer.clone())
        .await;
    assert!(first.success, "{}", first.log);
    assert_eq!(first.port, Some(3001));
    assert_eq!(*observer.ports.lock().unwrap(), vec![3001]);
    assert!(first.log.contains("Assigned port 3001"));

    {
        let processes = supervisor.processes.lock().unwrap();
        assert_eq!(processes.len(), 1);
        let spec = &processes[0];
        assert_eq!(spec.name, "api.acme.dev");
        assert_eq!(spec.program, "node");
        assert_eq!(spec.args, vec!["server.js"]);
        assert_eq!(spec.env.get("PORT").map(String::as_str), Some("3001"));
        assert_eq!(
            spec.env.get("DATABASE_URL").map(String::as_str),
            Some("postgres://db/acme")
        );
    }
    let vhost = std::fs::read_to_string(fixture.layout().available_config("api.acme.dev").path()).unwrap();
    assert!(vhost.contains("proxy_pass http://127.0.0.1:3001;"));

    // The control plane hands the assigned port back on the next request
    site.port = first.port;
    let second = pipeline
        .deploy(&site, CancellationToken::new(), observer.clone())
        .await;
    assert!(second.success, "{}", second.log);
    assert_eq!(second.port, Some(3001));
    assert!(second.log.contains("Using assigned port 3001"));
    assert!(second.log.contains("Stopped previous instance of api.acme.dev"));
    assert_eq!(supervisor.names(), vec!["api.acme.dev"]);
    assert_eq!(*observer.ports.lock().unwrap(), vec![3001]);
}

#[tokio::test]
async fn test_backends_get_distinct_ports() {
    let fixture = Fixture::new();
    fixture.repo("api", &[("server.js", "\n")]);
    let supervisor = Arc::new(MemorySupervisor::default());
    let pipeline = fixture.pipeline(supervisor.clone());

    let first = pipeline
        .deploy(&backend_site(), CancellationToken::new(), Arc::new(NoopObserver))
        .await;

    let mut other = backend_site();
    other.id = "api-2".to_string();
    other.domain = "api2.acme.dev".to_string();
    let second = pipeline
        .deploy(&other, CancellationToken::new(), Arc::new(NoopObserver))
        .await;

    assert_eq!(first.port, Some(3001));
    assert_eq!(second.port, Some(3002));
    assert_eq!(supervisor.names().len(), 2);
}

#[tokio::test]
async fn test_cancel_during_build() {
    let fixture = Fixture::new();
    fixture.repo("site", &[("index.html", INDEX)]);
    let pipeline = fixture.pipeline(Arc::new(MemorySupervisor::default()));
    let site = static_site(Some("sleep 30"), "dist");

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = pipeline.deploy(&site, cancel, Arc::new(NoopObserver)).await;

    assert!(started.elapsed() < Duration::from_secs(15));
    assert_eq!(result.outcome, DeploymentOutcome::Canceled);
    assert!(!result.success);
    assert_eq!(result.log.lines().last(), Some("🛑 Deployment canceled"));
    assert!(result.log.contains("Running build: sleep 30"));
    assert!(!fixture.layout().available_config("acme.dev").exists().await);
    assert!(!fixture.layout().site_dir("acme.dev").exists().await);
}

#[tokio::test]
async fn test_output_dir_falls_back_to_build() {
    let fixture = Fixture::new();
    fixture.repo("site", &[("index.html", INDEX)]);
    let pipeline = fixture.pipeline(Arc::new(MemorySupervisor::default()));
    let site = static_site(Some("mkdir -p build && cp index.html build/"), "dist");

    let result = pipeline
        .deploy(&site, CancellationToken::new(), Arc::new(NoopObserver))
        .await;

    assert!(result.success, "{}", result.log);
    assert!(result
        .log
        .contains("Output directory 'dist' not found, using 'build' instead"));
    let published = fixture.layout().site_dir("acme.dev");
    assert!(published.path().join("index.html").exists());
}

#[tokio::test]
async fn test_missing_artifact_fails() {
    let fixture = Fixture::new();
    fixture.repo("site", &[("index.html", INDEX)]);
    let pipeline = fixture.pipeline(Arc::new(MemorySupervisor::default()));
    let observer = Arc::new(RecordingObserver::default());

    let result = pipeline
        .deploy(&static_site(None, "dist"), CancellationToken::new(), observer.clone())
        .await;

    assert_eq!(result.outcome, DeploymentOutcome::Failed);
    assert_eq!(result.commit_message, "Manual deployment");
    assert!(result
        .log
        .lines()
        .last()
        .unwrap()
        .starts_with("❌ Deploy failed: Artifact missing"));
    assert_eq!(observer.progress.lock().unwrap().last(), Some(&7));
    assert!(!fixture.layout().available_config("acme.dev").exists().await);
}

#[tokio::test]
async fn test_build_failure_reports_exit_status() {
    let fixture = Fixture::new();
    fixture.repo("site", &[("index.html", INDEX)]);
    let pipeline = fixture.pipeline(Arc::new(MemorySupervisor::default()));

    let result = pipeline
        .deploy(
            &static_site(Some("echo compiling && exit 3"), "dist"),
            CancellationToken::new(),
            Arc::new(NoopObserver),
        )
        .await;

    assert_eq!(result.outcome, DeploymentOutcome::Failed);
    let error = result.error.unwrap();
    assert!(error.starts_with("Build error"), "{}", error);
    assert!(error.contains("exit status: 3"), "{}", error);
    assert!(result.log.contains("    compiling"));
}

#[tokio::test]
async fn test_access_token_never_reaches_transcript() {
    let fixture = Fixture::new();
    fixture.repo("site", &[("index.html", INDEX)]);
    let pipeline = fixture.pipeline(Arc::new(MemorySupervisor::default()));

    let mut site = static_site(Some("echo ghs_s3cr3t && exit 1"), "dist");
    site.access_token = Some(SecretString::from("ghs_s3cr3t".to_string()));
    let result = pipeline
        .deploy(&site, CancellationToken::new(), Arc::new(NoopObserver))
        .await;

    assert_eq!(result.outcome, DeploymentOutcome::Failed);
    assert!(!result.log.contains("ghs_s3cr3t"), "{}", result.log);
    assert!(!result.error.unwrap().contains("ghs_s3cr3t"));
    assert!(result.log.contains("    ***"));
}

#[tokio::test]
async fn test_missing_repository_is_source_error() {
    let fixture = Fixture::new();
    let pipeline = fixture.pipeline(Arc::new(MemorySupervisor::default()));
    let mut site = static_site(None, ".");
    site.repo = "acme/missing".to_string();

    let result = pipeline
        .deploy(&site, CancellationToken::new(), Arc::new(NoopObserver))
        .await;

    assert_eq!(result.outcome, DeploymentOutcome::Failed);
    assert!(result.error.unwrap().starts_with("Source error"));
}

#[tokio::test]
async fn test_dns_mismatch_still_succeeds() {
    let fixture = Fixture::new();
    fixture.repo("site", &[("index.html", INDEX)]);
    let pipeline = fixture.pipeline(Arc::new(MemorySupervisor::default()));

    let result = pipeline
        .deploy(&static_site(None, "."), CancellationToken::new(), Arc::new(NoopObserver))
        .await;

    assert!(result.success, "{}", result.log);
    assert!(result
        .log
        .contains("SSL warning: DNS for acme.dev does not point to this server (203.0.113.1)"));
    assert!(!result.log.contains("SSL certificate installed"));
}

#[tokio::test]
async fn test_certificate_issued_when_dns_matches() {
    let fixture = Fixture::new();
    fixture.repo("site", &[("index.html", INDEX)]);
    let pipeline = fixture.pipeline_with_dns(Arc::new(MemorySupervisor::default()), PUBLIC_IP);

    let result = pipeline
        .deploy(&static_site(None, "."), CancellationToken::new(), Arc::new(NoopObserver))
        .await;

    assert!(result.success, "{}", result.log);
    assert!(line_index(&result.log, "SSL certificate installed") < line_index(&result.log, "✅"));
}
