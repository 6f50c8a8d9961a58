//! End-to-end tests for the `caesar-service` binary.
//!
//! The service is driven through real POSIX objects under a unique
//! namespace; the client side uses the library directly.

#![cfg(target_os = "linux")]

use caesar_core::registry::QueueCapacity;
use caesar_core::{
    rotate_via_service, NamedResourceRegistry, PayloadRecord, PosixRegistry, Registration,
    ResourceKind, ResourceNames, SessionConfig,
};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};

const SERVICE: &str = env!("CARGO_BIN_EXE_caesar-service");

fn unique(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

fn wait_until(what: &str, mut ready: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !ready() {
        assert!(Instant::now() < deadline, "Timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn registration_exists(names: &ResourceNames) -> bool {
    PosixRegistry::new()
        .exists(&names.registration, ResourceKind::Queue)
        .unwrap()
}

fn spawn_service(ns: &str) -> Child {
    Command::new(SERVICE)
        .args(["--namespace", ns, "--client-timeout-secs", "5"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to spawn caesar-service")
}

fn interrupt(child: Child) -> Output {
    kill(Pid::from_raw(child.id() as i32), Signal::SIGINT).unwrap();
    child.wait_with_output().unwrap()
}

#[test]
fn test_serves_clients_and_cleans_up_on_sigint() {
    let ns = unique("e2e");
    let names = ResourceNames::namespaced(&ns);
    let child = spawn_service(&ns);
    wait_until("the service to start", || registration_exists(&names));

    let result = rotate_via_service(
        &PosixRegistry::new(),
        &names,
        &Registration::new(unique("alice"), 3).unwrap(),
        &PayloadRecord::new("Hello", 3).unwrap(),
        SessionConfig::new().with_reply_timeout(Some(Duration::from_secs(5))),
    )
    .unwrap();
    assert_eq!(result.message, "Khoor");

    let output = interrupt(child);
    assert!(
        output.status.success(),
        "service exited with {:?}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );

    let registry = PosixRegistry::new();
    assert!(!registry.exists(&names.registration, ResourceKind::Queue).unwrap());
    assert!(!registry.exists(&names.payload, ResourceKind::SharedRegion).unwrap());
    assert!(!registry.exists(&names.mutex, ResourceKind::Mutex).unwrap());
}

#[test]
fn test_existing_registration_queue_is_fatal() {
    let ns = unique("stale");
    let names = ResourceNames::namespaced(&ns);
    let registry = PosixRegistry::new();
    let _stale = registry
        .create_queue(&names.registration, QueueCapacity::default())
        .unwrap();

    let output = Command::new(SERVICE)
        .args(["--namespace", &ns])
        .stdin(Stdio::null())
        .output()
        .unwrap();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success());
    assert_eq!(stderr.matches("mq_open").count(), 1, "stderr: {}", stderr);

    // Setup was rolled back; only our own queue is left.
    assert!(!registry.exists(&names.payload, ResourceKind::SharedRegion).unwrap());
    assert!(!registry.exists(&names.mutex, ResourceKind::Mutex).unwrap());
    registry.destroy(&names.registration, ResourceKind::Queue).unwrap();
}

#[test]
fn test_reclaim_replaces_stale_objects() {
    let ns = unique("reclaim");
    let names = ResourceNames::namespaced(&ns);
    let registry = PosixRegistry::new();
    drop(registry.create_mutex(&names.mutex).unwrap());

    let child = Command::new(SERVICE)
        .args(["--namespace", &ns, "--reclaim"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    wait_until("the service to start", || registration_exists(&names));

    let output = interrupt(child);
    assert!(output.status.success());
    assert!(!registry.exists(&names.mutex, ResourceKind::Mutex).unwrap());
}

#[test]
fn test_daemon_mode_logs_to_file_and_stops_on_sigterm() {
    let ns = unique("daemon");
    let names = ResourceNames::namespaced(&ns);
    let dir = tempfile::TempDir::new().expect("Failed to create temp dir");
    let log_file = dir.path().join("service.log");

    let status = Command::new(SERVICE)
        .args(["-d", "--namespace", &ns, "--log-file"])
        .arg(&log_file)
        .stdin(Stdio::null())
        .status()
        .unwrap();
    assert!(status.success(), "foreground parent should exit 0");
    wait_until("the daemon to start", || registration_exists(&names));

    let log = std::fs::read_to_string(&log_file).unwrap();
    let pid: i32 = log
        .split("(pid ")
        .nth(1)
        .and_then(|rest| rest.split(')').next())
        .and_then(|pid| pid.parse().ok())
        .unwrap_or_else(|| panic!("no pid in log: {}", log));
    assert_ne!(pid as u32, std::process::id());

    kill(Pid::from_raw(pid), Signal::SIGTERM).unwrap();
    wait_until("the daemon to log its shutdown", || {
        std::fs::read_to_string(&log_file)
            .map(|log| log.contains("Service stopped"))
            .unwrap_or(false)
    });
    assert!(!registration_exists(&names));
}

#[test]
fn test_rejects_bad_arguments() {
    let output = Command::new(SERVICE)
        .args(["--client-timeout-secs", "0"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(!output.stderr.is_empty());

    let output = Command::new(SERVICE).arg("--bogus").output().unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_version() {
    let output = Command::new(SERVICE).arg("--version").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}
