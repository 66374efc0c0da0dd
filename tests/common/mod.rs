//! Shared test infrastructure: spawns a real `wavegate` binary against a
//! filesystem-backed store in a temp directory, and waits for it to accept
//! connections before handing control to the test.

#![allow(dead_code)]

use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

static PORT_COUNTER: AtomicU16 = AtomicU16::new(19500);

pub struct TestServer {
    process: Child,
    port: u16,
    _data_dir: TempDir,
}

impl TestServer {
    /// Start a server with default thresholds against a fresh filesystem root.
    pub async fn start() -> Self {
        Self::start_with_env(&[]).await
    }

    /// Start a server with additional environment overrides applied on top
    /// of the filesystem-root defaults.
    pub async fn start_with_env(extra_env: &[(&str, &str)]) -> Self {
        let port = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
        let data_dir = TempDir::new().expect("failed to create temp dir");

        let mut command = Command::new(env!("CARGO_BIN_EXE_wavegate"));
        command
            .env("PORT", port.to_string())
            .env("WAVEGATE_FILESYSTEM_ROOT", data_dir.path())
            .env("RUST_LOG", "wavegate=warn");
        for (key, value) in extra_env {
            command.env(key, value);
        }

        let process = command.spawn().expect("failed to start wavegate");
        let mut server = Self {
            process,
            port,
            _data_dir: data_dir,
        };
        server.wait_ready().await;
        server
    }

    async fn wait_ready(&mut self) {
        let addr = format!("127.0.0.1:{}", self.port);
        for _ in 0..150 {
            if std::net::TcpStream::connect(&addr).is_ok() {
                sleep(Duration::from_millis(50)).await;
                return;
            }
            if let Ok(Some(status)) = self.process.try_wait() {
                panic!("wavegate exited before becoming ready: {status}");
            }
            sleep(Duration::from_millis(100)).await;
        }
        let _ = self.process.kill();
        panic!("timed out waiting for wavegate on {addr}");
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.process.kill();
    }
}
