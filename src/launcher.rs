// End-to-end container lifecycle: stop any existing instance, allocate
// ports, start the container, wait for it to become ready, and retry
// on a detected port/name conflict.
use crate::allocator::Allocator;
use crate::clock::Clock;
use crate::docker::DockerQuery;
use crate::errors::{NekoError, Result};
use crate::process::ProcessHandle;
use crate::profile_cleaner::ProfileCleaner;
use crate::screenshot::ScreenshotLoop;
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;

/// Reserved UDP range width, mirrored from `state::WEBRTC_RANGE_SIZE`
/// for readability at call sites that only deal with `LaunchConfig`.
pub use crate::state::WEBRTC_RANGE_SIZE as WEBRTC_RANGE;

const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRY_ATTEMPTS: u32 = 3;
const GRACEFUL_TERM_WAIT: Duration = Duration::from_secs(3);
const GRACEFUL_KILL_WAIT: Duration = Duration::from_secs(1);
const SCREENSHOT_INTERVAL: Duration = Duration::from_secs(2);
const SCREENSHOT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Inputs to a launch. Output ports are written back into this
/// record by the Allocator before the container is started.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub container_name: String,
    pub url: String,
    pub profile_dir: PathBuf,
    pub connection_timeout_s: u64,
    pub chrome_flags: String,
    pub host_network: bool,
    pub image_tag: String,
    pub take_screenshot: bool,
    pub extra_flags: Vec<String>,

    pub server_port: u16,
    pub debug_port: u16,
    pub webrtc_start: u16,
}

impl LaunchConfig {
    pub fn new(container_name: impl Into<String>, url: impl Into<String>, image_tag: impl Into<String>) -> Self {
        Self {
            container_name: container_name.into(),
            url: url.into(),
            profile_dir: PathBuf::from("/tmp/neko-profile"),
            connection_timeout_s: 30,
            chrome_flags: String::new(),
            host_network: false,
            image_tag: image_tag.into(),
            take_screenshot: false,
            extra_flags: Vec::new(),
            server_port: 0,
            debug_port: 0,
            webrtc_start: 0,
        }
    }
}

/// Builds a container externally when `image_exists` reports false
/// Building the image itself is an external collaborator; this core
/// only decides *whether* to call it.
pub trait ImageBuilder: Send + Sync {
    fn build(&self, image_tag: &str) -> std::result::Result<(), String>;
}

/// The readiness probe. A trait so tests can substitute a canned
/// response instead of actually binding a port and speaking HTTP.
pub trait DebugEndpointClient: Send + Sync {
    /// A single poll attempt. `Ok(Some(ws_url))` on a 200 response with
    /// a parseable `webSocketDebuggerUrl` field, `Ok(None)` on any other
    /// response (retryable), `Err` on a transport-level failure
    /// (also retryable by the caller's loop).
    fn try_once(&self, debug_port: u16) -> Result<Option<String>>;
}

pub struct HttpDebugEndpointClient;

impl DebugEndpointClient for HttpDebugEndpointClient {
    fn try_once(&self, debug_port: u16) -> Result<Option<String>> {
        let url = format!("http://localhost:{debug_port}/json/version");
        let response = match reqwest::blocking::get(&url) {
            Ok(r) => r,
            Err(_) => return Ok(None),
        };
        if !response.status().is_success() {
            return Ok(None);
        }
        let body: serde_json::Value = match response.json() {
            Ok(b) => b,
            Err(_) => return Ok(None),
        };
        Ok(body
            .get("webSocketDebuggerUrl")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()))
    }
}

/// Orchestrates image check, conflict stop, allocation, container
/// start, readiness wait, and teardown.
pub struct Launcher<C: Clock = crate::clock::SystemClock> {
    allocator: Allocator,
    docker: DockerQuery,
    clock: C,
    image_builder: Option<Box<dyn ImageBuilder>>,
    debug_client: Box<dyn DebugEndpointClient>,
    screenshot_root: PathBuf,
}

impl Launcher<crate::clock::SystemClock> {
    pub fn new(allocator: Allocator, docker: DockerQuery) -> Self {
        Self {
            allocator,
            docker,
            clock: crate::clock::SystemClock,
            image_builder: None,
            debug_client: Box::new(HttpDebugEndpointClient),
            screenshot_root: PathBuf::from("."),
        }
    }
}

impl<C: Clock> Launcher<C> {
    pub fn with_clock(allocator: Allocator, docker: DockerQuery, clock: C) -> Self {
        Self {
            allocator,
            docker,
            clock,
            image_builder: None,
            debug_client: Box::new(HttpDebugEndpointClient),
            screenshot_root: PathBuf::from("."),
        }
    }

    pub fn with_image_builder(mut self, builder: Box<dyn ImageBuilder>) -> Self {
        self.image_builder = Some(builder);
        self
    }

    pub fn with_debug_client(mut self, client: Box<dyn DebugEndpointClient>) -> Self {
        self.debug_client = client;
        self
    }

    pub fn with_screenshot_root(mut self, root: PathBuf) -> Self {
        self.screenshot_root = root;
        self
    }

    /// Run the end-to-end launch sequence.
    pub fn launch(&self, mut config: LaunchConfig) -> Result<(ProcessHandle, String, Option<ScreenshotLoop>)> {
        let name = config.container_name.clone();

        if !self.docker.image_exists(&config.image_tag) {
            self.ensure_image(&config.image_tag)?;
        }

        self.stop_by_name(&name)?;
        std::fs::create_dir_all(&config.profile_dir)?;
        ProfileCleaner::clean(&config.profile_dir);

        let mut attempt = 0u32;
        loop {
            let (server, debug, webrtc_start) = self.allocator.allocate(&name)?;
            config.server_port = server;
            config.debug_port = debug;
            config.webrtc_start = webrtc_start;

            match self.try_start_and_wait(&config) {
                Ok((child, ws_url)) => {
                    let handle = ProcessHandle::new(name.clone(), child, self.docker.binary());
                    let screenshot = if config.take_screenshot {
                        ScreenshotLoop::spawn(
                            &name,
                            DockerQuery::default(),
                            SCREENSHOT_INTERVAL,
                            self.screenshot_root.clone(),
                        )
                    } else {
                        None
                    };
                    return Ok((handle, ws_url, screenshot));
                }
                Err(RetryDecision::Retry(reason)) => {
                    let _ = self.allocator.release(&name);
                    attempt += 1;
                    if attempt > MAX_RETRY_ATTEMPTS {
                        return Err(reason);
                    }
                    if matches!(reason, NekoError::NameConflict(_)) {
                        self.docker.remove(&name);
                    }
                    let backoff = jittered_backoff(attempt);
                    log::warn!(
                        "retrying launch of '{name}' (attempt {attempt}) after {backoff:?}: {reason}"
                    );
                    self.clock.sleep(backoff);
                }
                Err(RetryDecision::Fatal(err)) => {
                    // `try_start_and_wait` may have succeeded in starting
                    // the container (e.g. readiness never responded)
                    // before failing fatally; `stop_by_name` kills and
                    // removes it if the runtime still lists it running,
                    // then releases the ports, so the container never
                    // outlives a failed launch.
                    if let Err(e) = self.stop_by_name(&name) {
                        log::warn!("rollback stop_by_name failed for '{name}': {e}");
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Idempotent teardown. Every step
    /// swallows individual failures and logs; a partial teardown never
    /// blocks the others.
    pub fn cleanup(
        &self,
        config: &LaunchConfig,
        mut handle: ProcessHandle,
        screenshot: Option<ScreenshotLoop>,
    ) {
        if let Some(loop_handle) = screenshot {
            loop_handle.stop(SCREENSHOT_STOP_GRACE);
        }

        self.graceful_close(&config.container_name);

        if let Err(e) = self.stop_by_name(&config.container_name) {
            log::warn!("stop_by_name during cleanup failed for '{}': {e}", config.container_name);
        }

        handle.terminate(Duration::from_secs(5));
    }

    /// Send a terminate-signal to every in-container browser process,
    /// wait, then SIGKILL survivors.
    fn graceful_close(&self, name: &str) {
        let running = matches!(
            self.docker.running_names(),
            crate::docker::RunningNames::Known(ref names) if names.contains(name)
        );
        if !running {
            return;
        }

        let killed_by_broadcast = self
            .docker
            .exec(name, &["killall", "-TERM", "chrome"], Duration::from_secs(5))
            .is_some();
        if !killed_by_broadcast {
            // Fallback: enumerate PIDs and signal each.
            if let Some(pids) = self.docker.exec(name, &["pgrep", "chrome"], Duration::from_secs(5)) {
                for pid in String::from_utf8_lossy(&pids).lines() {
                    let _ = self
                        .docker
                        .exec(name, &["kill", "-TERM", pid.trim()], Duration::from_secs(5));
                }
            }
        }

        self.clock.sleep(GRACEFUL_TERM_WAIT);

        if let Some(pids) = self.docker.exec(name, &["pgrep", "chrome"], Duration::from_secs(5)) {
            for pid in String::from_utf8_lossy(&pids).lines() {
                let _ = self
                    .docker
                    .exec(name, &["kill", "-KILL", pid.trim()], Duration::from_secs(5));
            }
        }
        self.clock.sleep(GRACEFUL_KILL_WAIT);
    }

    /// If `name` is listed by the runtime, kill then remove it, then
    /// release any port allocation it held — guarantees a fresh start
    /// is never racing its own previous instance.
    fn stop_by_name(&self, name: &str) -> Result<()> {
        let is_running = matches!(
            self.docker.running_names(),
            crate::docker::RunningNames::Known(ref names) if names.contains(name)
        );
        if is_running {
            self.docker.kill(name);
            self.docker.remove(name);
        }
        self.allocator.release(name)
    }

    fn ensure_image(&self, image_tag: &str) -> Result<()> {
        match &self.image_builder {
            Some(builder) => builder
                .build(image_tag)
                .map_err(|e| NekoError::ImageMissing(image_tag.to_string(), e)),
            None => Err(NekoError::ImageMissing(
                image_tag.to_string(),
                "no image builder configured".to_string(),
            )),
        }
    }

    fn try_start_and_wait(&self, config: &LaunchConfig) -> std::result::Result<(std::process::Child, String), RetryDecision> {
        let args = build_run_args(config);
        let mut cmd = std::process::Command::new(self.docker.binary());
        cmd.args(&args);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return Err(RetryDecision::Fatal(NekoError::RuntimeUnavailable(e.to_string()))),
        };

        // `docker run --detach` prints the container id and exits
        // quickly; wait for that with a bounded timeout and classify a
        // non-zero exit as a retryable conflict or a fatal error.
        match wait_detached(child, DEFAULT_RUN_TIMEOUT) {
            DetachOutcome::Started(child) => match self.poll_ready(config) {
                Ok(ws_url) => Ok((child, ws_url)),
                Err(e) => Err(RetryDecision::Fatal(e)),
            },
            DetachOutcome::Failed(stderr) => Err(classify_start_failure(&config.container_name, &stderr)),
            DetachOutcome::TimedOut => Err(RetryDecision::Fatal(NekoError::RuntimeUnavailable(
                "docker run did not return within the startup timeout".to_string(),
            ))),
        }
    }

    fn poll_ready(&self, config: &LaunchConfig) -> Result<String> {
        let deadline = self.clock.now() + Duration::from_secs(config.connection_timeout_s);
        loop {
            match self.debug_client.try_once(config.debug_port)? {
                Some(ws_url) => return Ok(ws_url),
                None => {}
            }
            if self.clock.now() >= deadline {
                return Err(NekoError::ReadinessTimeout {
                    name: config.container_name.clone(),
                    timeout_s: config.connection_timeout_s,
                });
            }
            self.clock.sleep(Duration::from_secs(1));
        }
    }
}

enum RetryDecision {
    Retry(NekoError),
    Fatal(NekoError),
}

enum DetachOutcome {
    Started(std::process::Child),
    Failed(String),
    TimedOut,
}

fn wait_detached(mut child: std::process::Child, timeout: Duration) -> DetachOutcome {
    // `docker run --detach` forks the container and the parent process
    // exits almost immediately; we need its exit status (to detect a
    // conflict) without blocking indefinitely.
    let deadline = std::time::Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if status.success() {
                    return DetachOutcome::Started(child);
                }
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    use std::io::Read;
                    let _ = pipe.read_to_string(&mut stderr);
                }
                return DetachOutcome::Failed(stderr);
            }
            Ok(None) => {
                if std::time::Instant::now() >= deadline {
                    let _ = child.kill();
                    return DetachOutcome::TimedOut;
                }
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(_) => return DetachOutcome::TimedOut,
        }
    }
}

/// Classify a failed `docker run` by its stderr output.
fn classify_start_failure(name: &str, stderr: &str) -> RetryDecision {
    let lower = stderr.to_lowercase();
    if lower.contains("port is already allocated") || lower.contains("address already in use") {
        RetryDecision::Retry(NekoError::PortConflict(name.to_string()))
    } else if lower.contains("already in use by container") || lower.contains("conflict") {
        RetryDecision::Retry(NekoError::NameConflict(name.to_string()))
    } else {
        RetryDecision::Fatal(NekoError::RuntimeUnavailable(stderr.to_string()))
    }
}

/// `base * 2^attempt * U(1.5, 3.5)` seconds.
fn jittered_backoff(attempt: u32) -> Duration {
    const BASE_SECS: f64 = 1.0;
    let jitter = rand::thread_rng().gen_range(1.5..3.5);
    let secs = BASE_SECS * 2f64.powi(attempt as i32) * jitter;
    Duration::from_secs_f64(secs)
}

/// Compose the `docker run` argument vector.
fn build_run_args(config: &LaunchConfig) -> Vec<String> {
    let w1 = config.webrtc_start + WEBRTC_RANGE - 1;
    let mut args = vec![
        "run".to_string(),
        "--detach".to_string(),
        "--name".to_string(),
        config.container_name.clone(),
        "--rm".to_string(),
    ];
    if config.host_network {
        args.push("--network=host".to_string());
    }
    args.push("-p".to_string());
    args.push(format!("{}:8080", config.server_port));
    args.push("-p".to_string());
    args.push(format!("{}:9223", config.debug_port));
    args.push("-p".to_string());
    args.push(format!(
        "{}-{}:{}-{}/udp",
        config.webrtc_start, w1, config.webrtc_start, w1
    ));
    args.push("--cap-add=SYS_ADMIN".to_string());
    args.push("-v".to_string());
    args.push(format!(
        "{}:/home/neko/chrome-profile",
        config.profile_dir.display()
    ));
    args.push("-e".to_string());
    args.push(format!("NEKO_WEBRTC_EPR={}-{}", config.webrtc_start, w1));
    args.push("-e".to_string());
    args.push("NEKO_WEBRTC_NAT1TO1=127.0.0.1".to_string());
    args.push("-e".to_string());
    args.push(format!("NEKO_CHROME_FLAGS={}", config.chrome_flags));
    args.push("-e".to_string());
    args.push("NEKO_DISABLE_AUDIO=1".to_string());
    args.extend(config.extra_flags.iter().cloned());
    args.push(config.image_tag.clone());
    args
}
