// Supervised background screenshot loop: periodically captures a
// screenshot from inside a running container and atomically publishes
// it to disk, on an in-process thread rather than a detached shell
// polling loop.
use crate::docker::{DockerQuery, RunningNames};
use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

fn active_names() -> &'static Mutex<HashSet<String>> {
    static ACTIVE: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    ACTIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Single-instance-per-name background loop that periodically captures
/// a screenshot from inside a container and atomically publishes it as
/// `./<name>/screenshot.png`.
pub struct ScreenshotLoop {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ScreenshotLoop {
    /// Spawn the loop for `name`. A second spawn while one is already
    /// running for the same name is a no-op and returns `None`.
    pub fn spawn(
        name: &str,
        docker: DockerQuery,
        interval: Duration,
        output_root: PathBuf,
    ) -> Option<Self> {
        {
            let mut active = active_names().lock().unwrap_or_else(|p| p.into_inner());
            if !active.insert(name.to_string()) {
                log::debug!("screenshot loop for '{name}' already running; skipping spawn");
                return None;
            }
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread_name = name.to_string();
        let handle = std::thread::spawn(move || {
            run_loop(&thread_name, &docker, interval, &output_root, &thread_stop);
            active_names()
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&thread_name);
        });

        Some(Self {
            name: name.to_string(),
            stop,
            handle: Some(handle),
        })
    }

    /// Signal the loop to stop and wait up to `grace` for it to notice.
    /// OS threads cannot be force-killed from safe Rust; if the loop
    /// hasn't exited within `grace` this logs a warning and detaches
    /// the thread rather than blocking the caller indefinitely.
    pub fn stop(mut self, grace: Duration) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let (tx, rx) = std::sync::mpsc::channel();
            let name = self.name.clone();
            std::thread::spawn(move || {
                let _ = handle.join();
                let _ = tx.send(());
            });
            if rx.recv_timeout(grace).is_err() {
                log::warn!("screenshot loop for '{name}' did not stop within grace period");
            }
        }
    }
}

impl Drop for ScreenshotLoop {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn run_loop(
    name: &str,
    docker: &DockerQuery,
    interval: Duration,
    output_root: &PathBuf,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::SeqCst) {
        match docker.running_names() {
            RunningNames::Known(names) if !names.contains(name) => {
                log::debug!("container '{name}' no longer running; exiting screenshot loop");
                return;
            }
            RunningNames::Unknown => {
                log::debug!("runtime unreachable; exiting screenshot loop for '{name}'");
                return;
            }
            _ => {}
        }

        if let Err(e) = capture_once(name, docker, output_root) {
            log::warn!("screenshot capture failed for '{name}': {e}");
        }

        sleep_responsively(interval, stop);
    }
}

fn sleep_responsively(total: Duration, stop: &AtomicBool) {
    let step = Duration::from_millis(100).min(total);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let this_step = step.min(remaining);
        std::thread::sleep(this_step);
        remaining = remaining.saturating_sub(this_step);
    }
}

fn capture_once(name: &str, docker: &DockerQuery, output_root: &PathBuf) -> std::io::Result<()> {
    let ts = Utc::now().format("%Y%m%d_%H%M%S%.f").to_string();
    let remote_path = format!("/tmp/{ts}.png");

    docker
        .exec(name, &["scrot", &remote_path], Duration::from_secs(10))
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "in-container screenshot command failed"))?;

    let container_dir = output_root.join(name);
    std::fs::create_dir_all(&container_dir)?;
    let tmp_out = container_dir.join("screenshot_tmp.png");
    let final_out = container_dir.join("screenshot.png");

    let status = docker
        .run_raw(
            &[
                "cp".to_string(),
                format!("{name}:{remote_path}"),
                tmp_out.to_string_lossy().into_owned(),
            ],
            Duration::from_secs(10),
        )?
        .status;
    if !status.success() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "docker cp failed",
        ));
    }

    // Rename, not copy-in-place, so a concurrent reader of
    // screenshot.png never observes a partially-written file.
    std::fs::rename(&tmp_out, &final_out)?;
    Ok(())
}
