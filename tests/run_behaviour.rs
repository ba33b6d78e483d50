//! Behavioural tests for the run orchestrator using in-memory fakes.
//!
//! The fakes stand in for the platform API and the SSH transport so the
//! full workflow (provision, power on, wait, upload, exec, download,
//! teardown) can be exercised deterministically, including the teardown
//! guarantees on failure paths.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use caravel::config::RunConfig;
use caravel::platform::{
    ComputeUnit, CreateRequest, Endpoint, LIVENESS_PORT, LifecycleState, PlatformClient,
    PlatformError, PlatformFuture, PortMapping, SHELL_PORT, ServiceInfo,
};
use caravel::run::{RunError, RunOrchestrator};
use caravel::transport::{ExecSinks, SessionTransport, TransportError, TransportFuture};

/// Shared, ordered record of every call the fakes receive.
#[derive(Clone, Default)]
struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().expect("log lock").push(entry.into());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().expect("log lock").clone()
    }

    fn count_of(&self, prefix: &str) -> usize {
        self.entries()
            .iter()
            .filter(|entry| entry.starts_with(prefix))
            .count()
    }
}

#[derive(Default)]
struct FakePlatform {
    log: CallLog,
    power_on_fails: bool,
    stuck_booting: bool,
    statuses: Mutex<VecDeque<LifecycleState>>,
    port_mappings: Vec<PortMapping>,
    cancel_on_read: Option<CancellationToken>,
}

impl PlatformClient for FakePlatform {
    fn create_app<'a>(&'a self, request: &'a CreateRequest) -> PlatformFuture<'a, ComputeUnit> {
        Box::pin(async move {
            self.log.push(format!("create {}", request.name));
            Ok(ComputeUnit {
                app_id: String::from("app-1"),
                service_id: String::from("svc-1"),
            })
        })
    }

    fn read_app<'a>(&'a self, app_id: &'a str) -> PlatformFuture<'a, ComputeUnit> {
        Box::pin(async move {
            self.log.push("read-app");
            Ok(ComputeUnit {
                app_id: app_id.to_owned(),
                service_id: String::from("svc-1"),
            })
        })
    }

    fn delete_app<'a>(&'a self, _app_id: &'a str) -> PlatformFuture<'a, ()> {
        Box::pin(async move {
            self.log.push("delete");
            Ok(())
        })
    }

    fn read_service<'a>(&'a self, _service_id: &'a str) -> PlatformFuture<'a, ServiceInfo> {
        Box::pin(async move {
            self.log.push("read-service");
            if let Some(cancel) = &self.cancel_on_read {
                cancel.cancel();
            }
            let state = if self.stuck_booting {
                LifecycleState::Booting
            } else {
                self.statuses
                    .lock()
                    .expect("status lock")
                    .pop_front()
                    .unwrap_or(LifecycleState::Running)
            };
            Ok(ServiceInfo {
                state,
                port_mappings: self.port_mappings.clone(),
            })
        })
    }

    fn power_on<'a>(&'a self, _service_id: &'a str) -> PlatformFuture<'a, ()> {
        Box::pin(async move {
            self.log.push("power-on");
            if self.power_on_fails {
                return Err(PlatformError::Api {
                    status: 500,
                    message: String::from("power endpoint unavailable"),
                });
            }
            Ok(())
        })
    }
}

#[derive(Default)]
struct FakeTransport {
    log: CallLog,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: u32,
    remote_tree: Vec<(&'static str, &'static str)>,
}

impl SessionTransport for FakeTransport {
    fn exec<'a, 'w: 'a>(
        &'a self,
        target: &'a Endpoint,
        command: &'a str,
        sinks: ExecSinks<'w>,
    ) -> TransportFuture<'a, u32> {
        Box::pin(async move {
            self.log.push(format!("exec {target} {command}"));
            let ExecSinks { stdout, stderr } = sinks;
            stdout
                .write_all(&self.stdout)
                .await
                .map_err(TransportError::Sink)?;
            stderr
                .write_all(&self.stderr)
                .await
                .map_err(TransportError::Sink)?;
            Ok(self.exit_code)
        })
    }

    fn send_file<'a>(
        &'a self,
        _target: &'a Endpoint,
        local: &'a Utf8Path,
        remote_dir: &'a str,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            self.log.push(format!("send-file {local} -> {remote_dir}"));
            Ok(())
        })
    }

    fn send_dir<'a>(
        &'a self,
        _target: &'a Endpoint,
        local_dir: &'a Utf8Path,
        remote_dir: &'a str,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            self.log.push(format!("send-dir {local_dir} -> {remote_dir}"));
            Ok(())
        })
    }

    fn receive_dir<'a>(
        &'a self,
        _target: &'a Endpoint,
        remote_dir: &'a str,
        local_dir: &'a Utf8Path,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            self.log.push(format!("receive-dir {remote_dir}"));
            for (relative, contents) in &self.remote_tree {
                let dest = local_dir.join(relative);
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent).map_err(|source| TransportError::LocalIo {
                        path: parent.to_string(),
                        source,
                    })?;
                }
                std::fs::write(&dest, contents).map_err(|source| TransportError::LocalIo {
                    path: dest.to_string(),
                    source,
                })?;
            }
            Ok(())
        })
    }
}

fn published_mappings() -> Vec<PortMapping> {
    vec![
        PortMapping {
            container_port: LIVENESS_PORT,
            service_port: 31_000,
            host: String::from("shell.example.com"),
        },
        PortMapping {
            container_port: SHELL_PORT,
            service_port: 31_001,
            host: String::from("shell.example.com"),
        },
    ]
}

fn ready_platform(log: &CallLog) -> FakePlatform {
    FakePlatform {
        log: log.clone(),
        statuses: Mutex::new(VecDeque::from(vec![
            LifecycleState::Creating,
            LifecycleState::Booting,
        ])),
        port_mappings: published_mappings(),
        ..FakePlatform::default()
    }
}

fn run_config() -> RunConfig {
    RunConfig {
        public_key: String::new(),
        private_key: String::new(),
        app_name: String::from("caravel-server"),
        plan: String::from("free"),
        image_type: String::from("alpine"),
        image_name: String::new(),
        commands: vec![String::from("true")],
        command_file: None,
        sync_dir: None,
        upload_only: false,
        download_only: false,
        boot_timeout: Duration::from_secs(5),
        exec_timeout: Duration::from_secs(5),
    }
}

fn orchestrator<P, T>(platform: P, transport: T) -> RunOrchestrator<P, T>
where
    P: PlatformClient,
    T: SessionTransport,
{
    RunOrchestrator::new(platform, transport)
        .with_poll_interval(Duration::from_millis(10))
        .with_cleanup_timeout(Duration::from_secs(1))
}

fn utf8_tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 temp path");
    (dir, path)
}

async fn run_to_result<P, T>(
    runner: &RunOrchestrator<P, T>,
    cancel: &CancellationToken,
    config: &RunConfig,
) -> Result<(), RunError>
where
    P: PlatformClient,
    T: SessionTransport,
{
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let sinks = ExecSinks {
        stdout: &mut stdout,
        stderr: &mut stderr,
    };
    runner.run(cancel, config, sinks).await
}

#[tokio::test]
async fn successful_run_deletes_the_unit_exactly_once() {
    let log = CallLog::default();
    let runner = orchestrator(ready_platform(&log), FakeTransport {
        log: log.clone(),
        ..FakeTransport::default()
    });

    let result = run_to_result(&runner, &CancellationToken::new(), &run_config()).await;

    assert!(result.is_ok(), "run should succeed: {result:?}");
    assert_eq!(log.count_of("create"), 1);
    assert_eq!(log.count_of("power-on"), 1);
    assert_eq!(log.count_of("delete"), 1);
    let entries = log.entries();
    let exec_index = entries
        .iter()
        .position(|entry| entry.starts_with("exec"))
        .expect("exec recorded");
    let delete_index = entries
        .iter()
        .position(|entry| entry == "delete")
        .expect("delete recorded");
    assert!(exec_index < delete_index, "teardown follows execution");
}

#[tokio::test]
async fn exec_targets_the_published_shell_endpoint() {
    let log = CallLog::default();
    let runner = orchestrator(ready_platform(&log), FakeTransport {
        log: log.clone(),
        ..FakeTransport::default()
    });

    run_to_result(&runner, &CancellationToken::new(), &run_config())
        .await
        .expect("run should succeed");

    assert!(
        log.entries()
            .iter()
            .any(|entry| entry == "exec shell.example.com:31001 true"),
        "exec should target the mapped shell port: {:?}",
        log.entries()
    );
}

#[tokio::test]
async fn power_on_failure_still_tears_down() {
    let log = CallLog::default();
    let platform = FakePlatform {
        log: log.clone(),
        power_on_fails: true,
        port_mappings: published_mappings(),
        ..FakePlatform::default()
    };
    let runner = orchestrator(platform, FakeTransport {
        log: log.clone(),
        ..FakeTransport::default()
    });

    let result = run_to_result(&runner, &CancellationToken::new(), &run_config()).await;

    assert!(matches!(result, Err(RunError::PowerOn { .. })));
    assert_eq!(log.count_of("delete"), 1);
}

#[tokio::test]
async fn boot_timeout_tears_down() {
    let log = CallLog::default();
    let platform = FakePlatform {
        log: log.clone(),
        stuck_booting: true,
        port_mappings: published_mappings(),
        ..FakePlatform::default()
    };
    let runner = orchestrator(platform, FakeTransport {
        log: log.clone(),
        ..FakeTransport::default()
    });
    let mut config = run_config();
    config.boot_timeout = Duration::from_millis(50);

    let result = run_to_result(&runner, &CancellationToken::new(), &config).await;

    assert!(matches!(result, Err(RunError::BootTimeout { .. })));
    assert_eq!(log.count_of("delete"), 1);
    assert_eq!(log.count_of("exec"), 0);
}

#[tokio::test]
async fn cancellation_during_the_readiness_wait_tears_down() {
    let log = CallLog::default();
    let cancel = CancellationToken::new();
    let platform = FakePlatform {
        log: log.clone(),
        stuck_booting: true,
        port_mappings: published_mappings(),
        cancel_on_read: Some(cancel.clone()),
        ..FakePlatform::default()
    };
    let runner = orchestrator(platform, FakeTransport {
        log: log.clone(),
        ..FakeTransport::default()
    });

    let result = run_to_result(&runner, &cancel, &run_config()).await;

    assert!(matches!(result, Err(RunError::Cancelled { .. })));
    assert_eq!(log.count_of("delete"), 1);
    assert_eq!(log.count_of("exec"), 0);
}

#[tokio::test]
async fn missing_shell_mapping_fails_and_tears_down() {
    let log = CallLog::default();
    let platform = FakePlatform {
        log: log.clone(),
        port_mappings: vec![PortMapping {
            container_port: LIVENESS_PORT,
            service_port: 31_000,
            host: String::from("shell.example.com"),
        }],
        ..FakePlatform::default()
    };
    let runner = orchestrator(platform, FakeTransport {
        log: log.clone(),
        ..FakeTransport::default()
    });

    let result = run_to_result(&runner, &CancellationToken::new(), &run_config()).await;

    assert!(matches!(result, Err(RunError::Endpoint { .. })));
    assert_eq!(log.count_of("delete"), 1);
    assert_eq!(log.count_of("exec"), 0);
}

#[tokio::test]
async fn nonzero_exit_reports_the_code_and_skips_download() {
    let (_dir, sync_dir) = utf8_tempdir();
    let log = CallLog::default();
    let transport = FakeTransport {
        log: log.clone(),
        exit_code: 7,
        ..FakeTransport::default()
    };
    let runner = orchestrator(ready_platform(&log), transport);
    let mut config = run_config();
    config.sync_dir = Some(sync_dir);

    let result = run_to_result(&runner, &CancellationToken::new(), &config).await;

    let err = result.expect_err("non-zero exit should fail the run");
    assert_eq!(err.remote_exit_code(), Some(7));
    assert_eq!(log.count_of("receive-dir"), 0);
    assert_eq!(log.count_of("delete"), 1);
}

#[tokio::test]
async fn remote_output_reaches_the_sinks() {
    let log = CallLog::default();
    let transport = FakeTransport {
        log: log.clone(),
        stdout: b"result line\n".to_vec(),
        stderr: b"diagnostic line\n".to_vec(),
        ..FakeTransport::default()
    };
    let runner = orchestrator(ready_platform(&log), transport);

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let sinks = ExecSinks {
        stdout: &mut stdout,
        stderr: &mut stderr,
    };
    runner
        .run(&CancellationToken::new(), &run_config(), sinks)
        .await
        .expect("run should succeed");

    assert_eq!(stdout, b"result line\n");
    assert_eq!(stderr, b"diagnostic line\n");
}

#[tokio::test]
async fn downloaded_results_replace_the_sync_dir_contents() {
    let (_dir, sync_dir) = utf8_tempdir();
    std::fs::write(sync_dir.join("stale.txt"), "old").expect("seed stale entry");

    let log = CallLog::default();
    let transport = FakeTransport {
        log: log.clone(),
        remote_tree: vec![("result.txt", "done"), ("nested/inner.txt", "deep")],
        ..FakeTransport::default()
    };
    let runner = orchestrator(ready_platform(&log), transport);
    let mut config = run_config();
    config.sync_dir = Some(sync_dir.clone());
    config.download_only = true;

    run_to_result(&runner, &CancellationToken::new(), &config)
        .await
        .expect("run should succeed");

    assert!(!sync_dir.join("stale.txt").exists(), "stale entry replaced");
    let result = std::fs::read_to_string(sync_dir.join("result.txt")).expect("result present");
    assert_eq!(result, "done");
    let nested = std::fs::read_to_string(sync_dir.join("nested/inner.txt")).expect("tree kept");
    assert_eq!(nested, "deep");
}

#[tokio::test]
async fn upload_sends_command_file_and_sync_dir_before_exec() {
    let (_dir, sync_dir) = utf8_tempdir();
    let script = sync_dir.join("task.sh");
    std::fs::write(&script, "echo hi\n").expect("write script");

    let log = CallLog::default();
    let runner = orchestrator(ready_platform(&log), FakeTransport {
        log: log.clone(),
        ..FakeTransport::default()
    });
    let mut config = run_config();
    config.commands = Vec::new();
    config.command_file = Some(script.clone());
    config.sync_dir = Some(sync_dir.clone());

    run_to_result(&runner, &CancellationToken::new(), &config)
        .await
        .expect("run should succeed");

    let entries = log.entries();
    assert!(
        entries.contains(&format!("send-file {script} -> /tmp")),
        "command file uploaded: {entries:?}"
    );
    assert!(
        entries.contains(&format!("send-dir {sync_dir} -> /workdir")),
        "sync dir uploaded: {entries:?}"
    );
    assert!(
        entries
            .iter()
            .any(|entry| entry == "exec shell.example.com:31001 /bin/bash /tmp/task.sh"),
        "script runs through the base command: {entries:?}"
    );
}

#[tokio::test]
async fn download_only_skips_the_upload_phase() {
    let (_dir, sync_dir) = utf8_tempdir();
    let log = CallLog::default();
    let runner = orchestrator(ready_platform(&log), FakeTransport {
        log: log.clone(),
        ..FakeTransport::default()
    });
    let mut config = run_config();
    config.sync_dir = Some(sync_dir);
    config.download_only = true;

    run_to_result(&runner, &CancellationToken::new(), &config)
        .await
        .expect("run should succeed");

    assert_eq!(log.count_of("send-dir"), 0);
    assert_eq!(log.count_of("send-file"), 0);
    assert_eq!(log.count_of("receive-dir"), 1);
}

#[tokio::test]
async fn upload_only_skips_the_download_phase() {
    let (_dir, sync_dir) = utf8_tempdir();
    let log = CallLog::default();
    let runner = orchestrator(ready_platform(&log), FakeTransport {
        log: log.clone(),
        ..FakeTransport::default()
    });
    let mut config = run_config();
    config.sync_dir = Some(sync_dir);
    config.upload_only = true;

    run_to_result(&runner, &CancellationToken::new(), &config)
        .await
        .expect("run should succeed");

    assert_eq!(log.count_of("send-dir"), 1);
    assert_eq!(log.count_of("receive-dir"), 0);
}
