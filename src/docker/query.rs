use std::collections::HashSet;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Result of `DockerQuery::running_names`: distinguishes "the runtime
/// answered, and no containers are running" from "the runtime could
/// not be reached at all". Reaping must treat `Unknown` as "do not
/// reclaim" — preferring stale allocations over wrongly freeing ports
/// out from under a container that is, in fact, still running.
#[derive(Debug, Clone)]
pub enum RunningNames {
    Known(HashSet<String>),
    Unknown,
}

/// Thin wrapper around container-runtime CLI queries. Every operation
/// has a bounded timeout, default 5s.
#[derive(Debug, Clone)]
pub struct DockerQuery {
    binary: String,
    timeout: Duration,
}

impl Default for DockerQuery {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerQuery {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    /// The runtime binary this instance shells out to (e.g. `"docker"`
    /// or a test double). Exposed so callers that need to spawn a raw
    /// `Command` themselves, such as the launcher's detached `run`,
    /// stay pointed at the same binary as every other query.
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Names of all currently-running containers, or `Unknown` if the
    /// runtime is unreachable or the invocation times out.
    pub fn running_names(&self) -> RunningNames {
        let mut cmd = self.command();
        cmd.args(["ps", "--format", "{{.Names}}"]);
        match run_with_timeout(cmd, self.timeout) {
            Ok(output) if output.status.success() => {
                let names = String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                RunningNames::Known(names)
            }
            _ => {
                log::warn!("docker ps failed or timed out; treating runtime as unreachable");
                RunningNames::Unknown
            }
        }
    }

    /// `true` iff an image with this tag is present locally.
    pub fn image_exists(&self, tag: &str) -> bool {
        let mut cmd = self.command();
        cmd.args(["images", "-q", tag]);
        match run_with_timeout(cmd, self.timeout) {
            Ok(output) => output.status.success() && !output.stdout.is_empty(),
            Err(_) => false,
        }
    }

    /// Best-effort kill; success means the container is gone afterward
    /// (an already-absent container is not an error).
    pub fn kill(&self, name: &str) -> bool {
        let mut cmd = self.command();
        cmd.args(["kill", name]);
        run_with_timeout(cmd, self.timeout).is_ok()
    }

    /// Best-effort force-remove.
    pub fn remove(&self, name: &str) -> bool {
        let mut cmd = self.command();
        cmd.args(["rm", "-f", name]);
        run_with_timeout(cmd, self.timeout).is_ok()
    }

    /// Run `argv` inside the named container, returning combined
    /// stdout on success.
    pub fn exec(&self, name: &str, argv: &[&str], timeout: Duration) -> Option<Vec<u8>> {
        let mut cmd = self.command();
        cmd.arg("exec").arg(name).args(argv);
        match run_with_timeout(cmd, timeout) {
            Ok(output) if output.status.success() => Some(output.stdout),
            _ => None,
        }
    }

    /// Run an arbitrary `docker <args>` invocation (used by the
    /// launcher to issue `run --detach ...`), returning the raw output
    /// so the caller can classify stderr and decide whether to retry.
    pub fn run_raw(&self, args: &[String], timeout: Duration) -> std::io::Result<std::process::Output> {
        let mut cmd = self.command();
        cmd.args(args);
        run_with_timeout(cmd, timeout)
    }
}

fn run_with_timeout(mut cmd: Command, timeout: Duration) -> std::io::Result<std::process::Output> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let mut child: Child = cmd.spawn()?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_thread = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(p) = stdout_pipe.as_mut() {
            let _ = p.read_to_end(&mut buf);
        }
        buf
    });
    let stderr_thread = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(p) = stderr_pipe.as_mut() {
            let _ = p.read_to_end(&mut buf);
        }
        buf
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "command timed out",
            ));
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    let stdout = stdout_thread.join().unwrap_or_default();
    let stderr = stderr_thread.join().unwrap_or_default();
    Ok(std::process::Output {
        status,
        stdout,
        stderr,
    })
}
