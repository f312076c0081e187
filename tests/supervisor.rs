use httpmock::prelude::*;
use httpmock::Mock;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use serde_json::{json, Value};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether::configs::ProcessConfig;
use tether::process::{CommandLauncher, Launcher};
use tether::{
    RequestGateway, StartOutcome, StopOutcome, Supervisor, SupervisorError, SupervisorState,
};
use tokio::process::Child;

fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"))
}

fn config_for(server: &MockServer, script: &str) -> ProcessConfig {
    ProcessConfig {
        host: server.host(),
        port: server.port(),
        runtime: "sh".into(),
        script: Some(fixture(script).into()),
        max_startup_wait: Duration::from_secs(5),
        poll_interval: Duration::from_millis(100),
        probe_timeout: Duration::from_millis(500),
        health_interval: Duration::from_secs(30),
        grace_period: Duration::from_secs(2),
        ..Default::default()
    }
}

async fn healthy(server: &MockServer) -> Mock<'_> {
    server
        .mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(200).json_body(json!({"status": "ok"}));
        })
        .await
}

async fn unhealthy(server: &MockServer) -> Mock<'_> {
    server
        .mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(500);
        })
        .await
}

async fn wait_for_state(supervisor: &Supervisor, state: SupervisorState) {
    let mut states = supervisor.subscribe();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for state")
        .expect("supervisor gone");
}

fn is_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[derive(Clone, Default)]
struct CountingLauncher {
    launches: Arc<AtomicUsize>,
}

impl Launcher for CountingLauncher {
    fn launch(&self, config: &ProcessConfig) -> io::Result<Child> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        CommandLauncher.launch(config)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn start_resolves_once_health_path_answers() {
    let server = MockServer::start_async().await;
    let config = ProcessConfig {
        poll_interval: Duration::from_millis(500),
        ..config_for(&server, "idle_backend.sh")
    };
    let supervisor = Supervisor::new(config).unwrap();

    let started = Instant::now();
    let (outcome, _health) = tokio::join!(supervisor.start(), async {
        tokio::time::sleep(Duration::from_millis(800)).await;
        healthy(&server).await
    });

    assert_eq!(outcome, Ok(StartOutcome::Started));
    assert!(started.elapsed() >= Duration::from_millis(800));
    let status = supervisor.status();
    assert!(status.running);
    assert_eq!(status.state, SupervisorState::Running);
    assert_eq!(status.base_url, format!("http://{}:{}", server.host(), server.port()));
    assert!(status.pid.is_some());

    assert_eq!(supervisor.stop().await, Ok(StopOutcome::Graceful));
}

#[tokio::test(flavor = "multi_thread")]
async fn start_times_out_when_never_ready() {
    let server = MockServer::start_async().await;
    unhealthy(&server).await;
    let config = ProcessConfig {
        max_startup_wait: Duration::from_secs(2),
        poll_interval: Duration::from_millis(500),
        ..config_for(&server, "idle_backend.sh")
    };
    let supervisor = Supervisor::new(config).unwrap();

    let started = Instant::now();
    let err = supervisor.start().await.unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(
        err,
        SupervisorError::StartupTimeout {
            waited: Duration::from_secs(2)
        }
    );
    assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(2500), "{elapsed:?}");
    let status = supervisor.status();
    assert_eq!(status.state, SupervisorState::Stopped);
    assert!(!status.running);
    assert_eq!(status.pid, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_starts_launch_one_process() {
    let server = MockServer::start_async().await;
    healthy(&server).await;
    let launcher = CountingLauncher::default();
    let supervisor =
        Supervisor::with_launcher(config_for(&server, "idle_backend.sh"), launcher.clone())
            .unwrap();

    let outcomes = futures::future::join_all((0..8).map(|_| supervisor.start())).await;

    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    assert!(outcomes.iter().all(|o| *o == Ok(StartOutcome::Started)));
    assert_eq!(supervisor.state(), SupervisorState::Running);

    supervisor.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn start_while_running_is_a_noop() {
    let server = MockServer::start_async().await;
    let health = healthy(&server).await;
    let launcher = CountingLauncher::default();
    let supervisor =
        Supervisor::with_launcher(config_for(&server, "idle_backend.sh"), launcher.clone())
            .unwrap();

    assert_eq!(supervisor.start().await, Ok(StartOutcome::Started));
    let pid = supervisor.status().pid;
    let probes = health.hits_async().await;

    assert_eq!(supervisor.start().await, Ok(StartOutcome::AlreadyRunning));
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    assert_eq!(supervisor.status().pid, pid);
    assert_eq!(health.hits_async().await, probes);

    supervisor.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_failing_starts_share_the_failure() {
    let server = MockServer::start_async().await;
    unhealthy(&server).await;
    let launcher = CountingLauncher::default();
    let config = ProcessConfig {
        max_startup_wait: Duration::from_millis(500),
        ..config_for(&server, "idle_backend.sh")
    };
    let supervisor = Supervisor::with_launcher(config, launcher.clone()).unwrap();

    let (a, b) = tokio::join!(supervisor.start(), supervisor.start());

    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    assert!(matches!(a, Err(SupervisorError::StartupTimeout { .. })));
    assert_eq!(a, b);
    assert_eq!(supervisor.state(), SupervisorState::Stopped);

    // A later start gets a fresh attempt.
    let _ = supervisor.start().await;
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn request_while_stopped_fails_without_network() {
    let server = MockServer::start_async().await;
    let anything = server
        .mock_async(|_when, then| {
            then.status(200).json_body(json!({}));
        })
        .await;
    let supervisor = Supervisor::new(config_for(&server, "idle_backend.sh")).unwrap();
    let gateway = RequestGateway::new(supervisor.clone());

    let err = gateway.get("/x").await.unwrap_err();

    assert_eq!(err, SupervisorError::NotRunning);
    assert_eq!(anything.hits_async().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_kills_backend_that_ignores_sigterm() {
    let server = MockServer::start_async().await;
    healthy(&server).await;
    let config = ProcessConfig {
        grace_period: Duration::from_secs(1),
        ..config_for(&server, "stubborn_backend.sh")
    };
    let supervisor = Supervisor::new(config).unwrap();
    supervisor.start().await.unwrap();
    let pid = supervisor.status().pid.unwrap();
    // Give the shell a moment to install its trap.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    let outcome = supervisor.stop().await;
    let elapsed = started.elapsed();

    assert_eq!(outcome, Ok(StopOutcome::Forced));
    assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert_eq!(supervisor.status().pid, None);
    assert!(!is_alive(pid));

    let gateway = RequestGateway::new(supervisor.clone());
    assert_eq!(gateway.get("/x").await, Err(SupervisorError::NotRunning));
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_stops_share_one_shutdown() {
    let server = MockServer::start_async().await;
    healthy(&server).await;
    let supervisor = Supervisor::new(config_for(&server, "idle_backend.sh")).unwrap();
    supervisor.start().await.unwrap();

    let (a, b) = tokio::join!(supervisor.stop(), supervisor.stop());

    assert_eq!(a, Ok(StopOutcome::Graceful));
    assert_eq!(b, Ok(StopOutcome::Graceful));
    assert_eq!(supervisor.stop().await, Ok(StopOutcome::NotRunning));
}

#[tokio::test(flavor = "multi_thread")]
async fn start_during_shutdown_is_refused() {
    let server = MockServer::start_async().await;
    healthy(&server).await;
    let config = ProcessConfig {
        grace_period: Duration::from_millis(500),
        ..config_for(&server, "stubborn_backend.sh")
    };
    let supervisor = Supervisor::new(config).unwrap();
    supervisor.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stopping = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.stop().await }
    });
    wait_for_state(&supervisor, SupervisorState::Stopping).await;

    assert_eq!(supervisor.start().await, Err(SupervisorError::ShuttingDown));
    assert_eq!(stopping.await.unwrap(), Ok(StopOutcome::Forced));
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_waits_for_startup_in_progress() {
    let server = MockServer::start_async().await;
    let supervisor = Supervisor::new(config_for(&server, "idle_backend.sh")).unwrap();

    let starting = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.start().await }
    });
    wait_for_state(&supervisor, SupervisorState::Starting).await;

    let (stopped, _health) = tokio::join!(supervisor.stop(), async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        healthy(&server).await
    });

    assert_eq!(stopped, Ok(StopOutcome::Graceful));
    assert_eq!(starting.await.unwrap(), Ok(StartOutcome::Started));
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_health_check_degrades_without_touching_process() {
    let server = MockServer::start_async().await;
    let mut ok = healthy(&server).await;
    let config = ProcessConfig {
        health_interval: Duration::from_millis(200),
        ..config_for(&server, "idle_backend.sh")
    };
    let supervisor = Supervisor::new(config).unwrap();
    let gateway = RequestGateway::new(supervisor.clone());
    supervisor.start().await.unwrap();
    let pid = supervisor.status().pid.unwrap();

    ok.delete_async().await;
    let mut failing = unhealthy(&server).await;
    wait_for_state(&supervisor, SupervisorState::Degraded).await;

    let status = supervisor.status();
    assert!(!status.running);
    assert_eq!(status.pid, Some(pid));
    assert!(is_alive(pid));
    assert_eq!(gateway.get("/x").await, Err(SupervisorError::NotRunning));

    failing.delete_async().await;
    healthy(&server).await;
    wait_for_state(&supervisor, SupervisorState::Running).await;
    assert!(supervisor.status().running);
    assert_eq!(supervisor.status().pid, Some(pid));

    supervisor.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_while_running_returns_to_stopped() {
    let server = MockServer::start_async().await;
    healthy(&server).await;
    let supervisor = Supervisor::new(config_for(&server, "idle_backend.sh")).unwrap();
    supervisor.start().await.unwrap();
    let pid = supervisor.status().pid.unwrap();

    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
    wait_for_state(&supervisor, SupervisorState::Stopped).await;

    assert_eq!(supervisor.status().pid, None);
    assert_eq!(supervisor.stop().await, Ok(StopOutcome::NotRunning));
    // The next start launches a new process.
    assert_eq!(supervisor.start().await, Ok(StartOutcome::Started));
    assert_ne!(supervisor.status().pid, Some(pid));
    supervisor.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn exit_during_startup_fails_start() {
    let server = MockServer::start_async().await;
    unhealthy(&server).await;
    let supervisor = Supervisor::new(config_for(&server, "crashing_backend.sh")).unwrap();

    let started = Instant::now();
    let err = supervisor.start().await.unwrap_err();

    match err {
        SupervisorError::ExitedDuringStartup(info) => assert_eq!(info.code, Some(3)),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    // The stderr reader can trail the exit slightly.
    let deadline = Instant::now() + Duration::from_secs(1);
    while !supervisor.recent_output().contains("loading model") {
        assert!(Instant::now() < deadline, "{:?}", supervisor.recent_output());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn launch_failure_is_reported() {
    let server = MockServer::start_async().await;
    let config = ProcessConfig {
        runtime: "/nonexistent/tether-runtime".into(),
        ..config_for(&server, "idle_backend.sh")
    };
    let supervisor = Supervisor::new(config).unwrap();

    let err = supervisor.start().await.unwrap_err();

    assert!(matches!(err, SupervisorError::ProcessCreation(_)), "{err:?}");
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert_eq!(supervisor.status().pid, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn gateway_talks_json_to_running_backend() {
    let server = MockServer::start_async().await;
    healthy(&server).await;
    let chat = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chat")
                .header("content-type", "application/json")
                .header("x-session", "abc")
                .json_body(json!({"message": "hello"}));
            then.status(200).json_body(json!({"reply": "hi there"}));
        })
        .await;
    let rejected = server
        .mock_async(|when, then| {
            when.method(POST).path("/safety");
            then.status(422).body("unsafe input");
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/plain");
            then.status(200).body("not json");
        })
        .await;

    let supervisor = Supervisor::new(config_for(&server, "idle_backend.sh")).unwrap();
    let gateway = RequestGateway::new(supervisor.clone());
    supervisor.start().await.unwrap();

    let mut headers = HeaderMap::new();
    headers.insert("x-session", HeaderValue::from_static("abc"));
    let reply = gateway
        .request(Method::POST, "/chat", Some(&json!({"message": "hello"})), Some(headers))
        .await
        .unwrap();
    assert_eq!(reply, json!({"reply": "hi there"}));
    assert_eq!(chat.hits_async().await, 1);

    let err = gateway.post("/safety", &json!({"text": "x"})).await.unwrap_err();
    assert_eq!(
        err,
        SupervisorError::RequestFailed {
            status: 422,
            body: "unsafe input".into()
        }
    );
    assert_eq!(rejected.hits_async().await, 1);

    let err = gateway.get("/plain").await.unwrap_err();
    assert!(matches!(err, SupervisorError::InvalidResponse(_)), "{err:?}");

    #[derive(serde::Deserialize)]
    struct Health {
        status: String,
    }
    let health: Health = gateway
        .request_as(Method::GET, "/health", None::<&Value>, None)
        .await
        .unwrap();
    assert_eq!(health.status, "ok");

    supervisor.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn health_checks_end_before_stop_signals() {
    let server = MockServer::start_async().await;
    let health = healthy(&server).await;
    let config = ProcessConfig {
        health_interval: Duration::from_millis(100),
        grace_period: Duration::from_secs(1),
        ..config_for(&server, "stubborn_backend.sh")
    };
    let supervisor = Supervisor::new(config).unwrap();
    supervisor.start().await.unwrap();

    // Let the monitor run a few rounds first.
    let after_start = health.hits_async().await;
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(health.hits_async().await > after_start);

    let stopping = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.stop().await }
    });
    wait_for_state(&supervisor, SupervisorState::Stopping).await;
    // A check already on the wire may still land.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let at_stop = health.hits_async().await;

    // The backend ignores SIGTERM, so it sits in the grace period here.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(supervisor.state(), SupervisorState::Stopping);
    assert_eq!(health.hits_async().await, at_stop);

    assert_eq!(stopping.await.unwrap(), Ok(StopOutcome::Forced));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(health.hits_async().await, at_stop);
}

#[tokio::test(flavor = "multi_thread")]
async fn health_checks_end_when_backend_crashes() {
    let server = MockServer::start_async().await;
    let health = healthy(&server).await;
    let config = ProcessConfig {
        health_interval: Duration::from_millis(100),
        ..config_for(&server, "idle_backend.sh")
    };
    let supervisor = Supervisor::new(config).unwrap();
    supervisor.start().await.unwrap();
    let pid = supervisor.status().pid.unwrap();

    let after_start = health.hits_async().await;
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(health.hits_async().await > after_start);

    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
    wait_for_state(&supervisor, SupervisorState::Stopped).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let at_exit = health.hits_async().await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(health.hits_async().await, at_exit);
}

#[tokio::test(flavor = "multi_thread")]
async fn exit_racing_readiness_keeps_exit_code() {
    let server = MockServer::start_async().await;
    healthy(&server).await;
    let config = ProcessConfig {
        script: None,
        args: vec!["-c".into(), "exit 7".into()],
        ..config_for(&server, "idle_backend.sh")
    };
    let supervisor = Supervisor::new(config).unwrap();

    for _ in 0..5 {
        match supervisor.start().await {
            // Readiness won; the exit still lands afterwards.
            Ok(outcome) => assert_eq!(outcome, StartOutcome::Started),
            Err(SupervisorError::ExitedDuringStartup(info)) => assert_eq!(info.code, Some(7)),
            Err(other) => panic!("unexpected error {other:?}"),
        }
        wait_for_state(&supervisor, SupervisorState::Stopped).await;
        assert_eq!(supervisor.status().pid, None);
    }
}
