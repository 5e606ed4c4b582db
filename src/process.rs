// ProcessHandle / exit hook registry.
//
// A Rust binary embedding this crate has no guarantee that an orderly
// `cleanup()` call always runs before the process exits, so a
// process-wide registry tracks every live launch and a signal handler
// (installed once, lazily) tears all of them down best-effort on
// SIGINT/SIGTERM before the process actually exits.
use crate::docker::DockerQuery;
use std::sync::{Mutex, OnceLock};

struct ExitEntry {
    container_name: String,
    docker_binary: String,
}

fn registry() -> &'static Mutex<Vec<ExitEntry>> {
    static REGISTRY: OnceLock<Mutex<Vec<ExitEntry>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

fn install_handler_once() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let result = ctrlc::set_handler(|| {
            run_exit_hooks();
            std::process::exit(130);
        });
        if let Err(e) = result {
            log::warn!("failed to install exit-hook signal handler: {e}");
        }
    });
}

fn run_exit_hooks() {
    let entries = registry().lock().unwrap_or_else(|p| p.into_inner());
    for entry in entries.iter() {
        log::warn!(
            "process exiting abnormally; force-stopping container '{}'",
            entry.container_name
        );
        let docker = DockerQuery::new(entry.docker_binary.clone());
        docker.kill(&entry.container_name);
        docker.remove(&entry.container_name);
    }
}

/// A live launch's handle to its detached subprocess and container
/// name. Dropping it deregisters the exit hook (it does not itself
/// stop the container — that remains the caller's explicit
/// `Launcher::cleanup` responsibility).
pub struct ProcessHandle {
    pub container_name: String,
    child: Option<std::process::Child>,
    registered: bool,
}

impl ProcessHandle {
    pub fn new(container_name: impl Into<String>, child: std::process::Child, docker_binary: &str) -> Self {
        let container_name = container_name.into();
        install_handler_once();
        registry().lock().unwrap_or_else(|p| p.into_inner()).push(ExitEntry {
            container_name: container_name.clone(),
            docker_binary: docker_binary.to_string(),
        });
        Self {
            container_name,
            child: Some(child),
            registered: true,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }

    /// Terminate the captured subprocess handle, force-killing it if it
    /// does not exit within `grace`.
    pub fn terminate(&mut self, grace: std::time::Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        #[cfg(unix)]
        {
            // SAFETY: `child.id()` is a live PID owned by this process
            // for as long as `child` hasn't been waited on, which holds
            // here since we only take() it once, right before this call.
            unsafe {
                libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.kill();
        }

        let deadline = std::time::Instant::now() + grace;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => {
                    if std::time::Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return;
                    }
                    std::thread::sleep(std::time::Duration::from_millis(25));
                }
                Err(_) => return,
            }
        }
    }

    fn deregister(&mut self) {
        if !self.registered {
            return;
        }
        self.registered = false;
        let mut entries = registry().lock().unwrap_or_else(|p| p.into_inner());
        entries.retain(|e| e.container_name != self.container_name);
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.deregister();
    }
}
