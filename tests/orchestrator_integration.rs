//! Integration tests for the Orchestrator

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use composed::shutdown::ConsoleSignaler;
use composed::{
    ForceKillTimeout, Orchestrator, OrchestratorOptions, ServiceGraph, ServiceSpec, ServiceStatus,
    ShutdownReason, ShutdownSignal,
};
use tokio::time::timeout;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn unique_test_dir() -> PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = PathBuf::from(format!("/tmp/composed-orchestrator-test-{}-{}", std::process::id(), id));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn sh(id: &str, script: &str) -> ServiceSpec {
    ServiceSpec::new(id, ["/bin/sh", "-c", script])
        .env("PATH", std::env::var("PATH").unwrap_or_default())
        .ready(|mut ctx| async move { ctx.once_output_line_is("ready").await })
}

fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[derive(Default)]
struct CountingConsole {
    interrupts: AtomicUsize,
}

impl ConsoleSignaler for CountingConsole {
    fn interrupt_console(&self) -> std::io::Result<()> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_dependencies_ready_before_dependents_start() {
    let dir = unique_test_dir();
    let log = dir.join("started");
    let service = |id: &str| {
        sh(
            id,
            &format!("echo {id} >> {}; sleep 0.2; echo ready; exec sleep 30", log.display()),
        )
    };

    let graph = ServiceGraph::build([
        service("c").dependency("b"),
        service("b").dependency("a"),
        service("a"),
    ])
    .unwrap();
    let orchestrator = Orchestrator::new(graph, OrchestratorOptions::default());

    timeout(Duration::from_secs(10), orchestrator.start_all())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read_lines(&log), vec!["a", "b", "c"]);
    for id in ["a", "b", "c"] {
        assert_eq!(orchestrator.controller(id).unwrap().status(), ServiceStatus::Ready);
    }

    timeout(Duration::from_secs(5), orchestrator.stop_all()).await.unwrap();
    for id in ["a", "b", "c"] {
        assert_eq!(orchestrator.controller(id).unwrap().status(), ServiceStatus::Stopped);
    }
    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_graceful_shutdown_stops_dependents_first() {
    let dir = unique_test_dir();
    let log = dir.join("stopped");
    let service = |id: &str| {
        sh(
            id,
            &format!(
                "trap 'echo {id} >> {}; exit 0' INT; echo ready; while sleep 0.05; do :; done",
                log.display()
            ),
        )
    };

    let graph = ServiceGraph::build([
        service("a"),
        service("b").dependency("a"),
        service("c").dependency("b"),
    ])
    .unwrap();
    let options = OrchestratorOptions {
        graceful_shutdown: true,
        windows_ctrl_c_shutdown: false,
    };
    let orchestrator = Orchestrator::new(graph, options);

    timeout(Duration::from_secs(10), orchestrator.start_all())
        .await
        .unwrap()
        .unwrap();
    timeout(Duration::from_secs(10), orchestrator.stop_all()).await.unwrap();

    assert_eq!(read_lines(&log), vec!["c", "b", "a"]);
    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_console_interrupt_sent_once() {
    let console = Arc::new(CountingConsole::default());
    let service = |id: &str| {
        sh(id, "echo ready; exec sleep 30")
            .force_kill_timeout(ForceKillTimeout::After(Duration::from_millis(200)))
    };
    let graph = ServiceGraph::build([
        service("a"),
        service("b").dependency("a"),
        service("c"),
    ])
    .unwrap();
    let options = OrchestratorOptions {
        graceful_shutdown: true,
        windows_ctrl_c_shutdown: true,
    };
    let orchestrator = Orchestrator::with_console(graph, options, console.clone());
    assert!(!orchestrator.options().graceful_shutdown);

    timeout(Duration::from_secs(10), orchestrator.start_all())
        .await
        .unwrap()
        .unwrap();

    let first = orchestrator.stop_all();
    let second = orchestrator.stop_all();
    timeout(Duration::from_secs(5), first).await.unwrap();
    timeout(Duration::from_secs(1), second).await.unwrap();
    timeout(Duration::from_secs(1), orchestrator.stop_all()).await.unwrap();

    assert_eq!(console.interrupts.load(Ordering::SeqCst), 1);
    for id in ["a", "b", "c"] {
        assert_eq!(orchestrator.controller(id).unwrap().status(), ServiceStatus::Stopped);
    }
}

#[tokio::test]
async fn test_fatal_error_exit_code() {
    let graph = ServiceGraph::build([
        ServiceSpec::new("broken", ["/nonexistent/composed-test-binary"])
            .ready(|ctx| async move { ctx.once_delay(Duration::ZERO).await }),
        sh("web", "echo ready; exec sleep 30").dependency("broken"),
    ])
    .unwrap();
    let orchestrator = Orchestrator::new(graph, OrchestratorOptions::default());

    let code = timeout(
        Duration::from_secs(10),
        orchestrator.run_until(std::future::pending::<ShutdownSignal>()),
    )
    .await
    .unwrap();

    assert_eq!(code, 1);
    assert!(orchestrator.is_stopping());
    assert!(orchestrator.controller("web").unwrap().process().is_none());
}

#[tokio::test]
async fn test_signal_exit_code() {
    let graph = ServiceGraph::build([sh("web", "echo ready; exec sleep 30")]).unwrap();
    let orchestrator = Orchestrator::new(graph, OrchestratorOptions::default());

    let run = orchestrator.run_until(async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        ShutdownSignal::Int
    });
    let code = timeout(Duration::from_secs(10), run).await.unwrap();

    assert_eq!(code, 130);
    assert_eq!(orchestrator.controller("web").unwrap().status(), ServiceStatus::Stopped);
}

#[tokio::test]
async fn test_shutdown_before_start_cancels_everything() {
    let graph = ServiceGraph::build([
        sh("a", "echo ready; exec sleep 30"),
        sh("b", "echo ready; exec sleep 30").dependency("a"),
    ])
    .unwrap();
    let orchestrator = Orchestrator::new(graph, OrchestratorOptions::default());
    orchestrator.request_shutdown(ShutdownReason::Signal(ShutdownSignal::Term));

    let code = timeout(
        Duration::from_secs(5),
        orchestrator.run_until(std::future::pending::<ShutdownSignal>()),
    )
    .await
    .unwrap();
    assert_eq!(code, 143);

    // Let the straggling startup walk observe the shutdown
    tokio::time::sleep(Duration::from_millis(100)).await;
    for id in ["a", "b"] {
        assert!(orchestrator.controller(id).unwrap().process().is_none());
    }
}

#[tokio::test]
async fn test_run_only_once() {
    let graph = ServiceGraph::build([sh("web", "echo ready; exec sleep 30")]).unwrap();
    let orchestrator = Orchestrator::new(graph, OrchestratorOptions::default());
    orchestrator.request_shutdown(ShutdownReason::Signal(ShutdownSignal::Int));

    let code = timeout(
        Duration::from_secs(5),
        orchestrator.run_until(std::future::pending::<ShutdownSignal>()),
    )
    .await
    .unwrap();
    assert_eq!(code, 130);

    let again = orchestrator.run_until(async { ShutdownSignal::Int }).await;
    assert_eq!(again, 1);
}

#[tokio::test]
async fn test_output_is_labelled() {
    let graph = ServiceGraph::build([sh("web", "echo ready; echo hello; exec sleep 30")]).unwrap();
    let orchestrator = Orchestrator::new(graph, OrchestratorOptions::default());
    let mut output = orchestrator.take_output().unwrap();
    assert!(orchestrator.take_output().is_none());

    timeout(Duration::from_secs(5), orchestrator.start_all())
        .await
        .unwrap()
        .unwrap();

    let first = timeout(Duration::from_secs(5), output.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(5), output.recv()).await.unwrap().unwrap();
    assert_eq!((first.service_id.as_str(), first.line.as_str()), ("web", "ready"));
    assert_eq!((second.service_id.as_str(), second.line.as_str()), ("web", "hello"));

    timeout(Duration::from_secs(5), orchestrator.stop_all()).await.unwrap();
}

#[tokio::test]
async fn test_independent_dependencies_start_concurrently() {
    let slow = |id: &str| sh(id, "sleep 0.5; echo ready; exec sleep 30");
    let graph = ServiceGraph::build([
        sh("app", "echo ready; exec sleep 30").dependency("db").dependency("cache"),
        slow("db"),
        slow("cache"),
    ])
    .unwrap();
    let orchestrator = Orchestrator::new(graph, OrchestratorOptions::default());

    let started = Instant::now();
    timeout(Duration::from_secs(10), orchestrator.start_all())
        .await
        .unwrap()
        .unwrap();
    let elapsed = started.elapsed();

    // db and cache each take 500ms; one after the other would be 1s or more
    assert!(elapsed >= Duration::from_millis(500), "started in {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(900), "started in {:?}", elapsed);
    assert_eq!(orchestrator.controller("app").unwrap().status(), ServiceStatus::Ready);

    timeout(Duration::from_secs(5), orchestrator.stop_all()).await.unwrap();
}

#[tokio::test]
async fn test_diamond_shared_dependency_starts_once() {
    let dir = unique_test_dir();
    let log = dir.join("started");
    let service = |id: &str, secs: &str| {
        sh(
            id,
            &format!("echo {id} >> {}; sleep {secs}; echo ready; exec sleep 30", log.display()),
        )
    };
    let graph = ServiceGraph::build([
        service("top", "0").dependency("left").dependency("right"),
        service("left", "0.4").dependency("base"),
        service("right", "0.4").dependency("base"),
        service("base", "0.1"),
    ])
    .unwrap();
    let orchestrator = Orchestrator::new(graph, OrchestratorOptions::default());

    let started = Instant::now();
    timeout(Duration::from_secs(10), orchestrator.start_all())
        .await
        .unwrap()
        .unwrap();
    let elapsed = started.elapsed();

    // base, then left and right together, then top
    assert!(elapsed >= Duration::from_millis(500), "started in {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(850), "started in {:?}", elapsed);
    let lines = read_lines(&log);
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "base");
    assert_eq!(lines[3], "top");

    timeout(Duration::from_secs(5), orchestrator.stop_all()).await.unwrap();
    let _ = fs::remove_dir_all(&dir);
}
