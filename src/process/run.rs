use crate::configs::ProcessConfig;
use parking_lot::Mutex;
use std::fmt::Write;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, info_span, Instrument};

pub const HOST_ENV: &str = "BACKEND_HOST";
pub const PORT_ENV: &str = "BACKEND_PORT";
pub const UNBUFFERED_ENV: &str = "PYTHONUNBUFFERED";

/// Recent backend output, oldest bytes dropped first.
pub type OutputCache = Arc<Mutex<log_buffer::LogBuffer<Vec<u8>>>>;

pub fn output_cache(size: usize) -> OutputCache {
    Arc::new(Mutex::new(log_buffer::LogBuffer::new(vec![0; size.max(1)])))
}

/// Creates the backend process. The supervisor calls this at most once per
/// start attempt.
pub trait Launcher: Send + Sync + 'static {
    fn launch(&self, config: &ProcessConfig) -> io::Result<Child>;
}

/// Runs `runtime [script] [args..]` with the bind address in the environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandLauncher;

impl Launcher for CommandLauncher {
    fn launch(&self, config: &ProcessConfig) -> io::Result<Child> {
        let mut command = Command::new(&config.runtime);
        if let Some(script) = &config.script {
            command.arg(script);
        }
        command
            .args(&config.args)
            .env(HOST_ENV, &config.host)
            .env(PORT_ENV, config.port.to_string())
            .env(UNBUFFERED_ENV, "1")
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_directory {
            command.current_dir(dir);
        }
        command.spawn()
    }
}

/// Forwards the child's stdout and stderr to the log and the output cache.
pub fn forward_output(child: &mut Child, pid: u32, cache: &OutputCache) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(
            read_lines(stdout, "stdout", cache.clone()).instrument(info_span!("read_stdout", pid)),
        );
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(
            read_lines(stderr, "stderr", cache.clone()).instrument(info_span!("read_stderr", pid)),
        );
    }
}

async fn read_lines<R>(stream: R, name: &'static str, cache: OutputCache)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        // Keep draining whatever the backend writes; a closed pipe would kill it.
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                error!(?err, "Reading {name} failed");
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf);
        info!(target: "backend", stream = name, "{}", line.trim_end());
        if let Err(err) = cache.lock().write_str(&line) {
            error!(?err, "Cache error");
        }
    }
    debug!("{name} closed");
}
