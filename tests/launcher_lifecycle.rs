use neko_launcher::clock::test_support::FakeClock;
use neko_launcher::docker::DockerQuery;
use neko_launcher::errors::{NekoError, Result};
use neko_launcher::launcher::{DebugEndpointClient, LaunchConfig, Launcher};
use neko_launcher::lock::Locks;
use neko_launcher::state::StateStore;
use neko_launcher::Allocator;
use serial_test::serial;
use std::path::PathBuf;
use tempfile::TempDir;

struct AlwaysReady;

impl DebugEndpointClient for AlwaysReady {
    fn try_once(&self, _debug_port: u16) -> Result<Option<String>> {
        Ok(Some("ws://localhost:9224/devtools/browser/fake".to_string()))
    }
}

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

fn new_allocator(dir: &TempDir) -> Allocator {
    let store = StateStore::new(dir.path().join("state.json"));
    let locks = Locks::new(dir.path().join("state.lock"));
    let docker = DockerQuery::new("neko-launcher-test-no-such-binary");
    Allocator::new(store, locks, docker)
}

#[test]
#[serial]
fn a_port_conflict_on_first_attempt_is_retried_and_succeeds_with_a_fresh_triple() {
    let dir = TempDir::new().unwrap();
    let counter_file = dir.path().join("invocations");
    std::env::set_var("FAKE_DOCKER_COUNTER", &counter_file);

    let store = StateStore::new(dir.path().join("state.json"));
    let locks = Locks::new(dir.path().join("state.lock"));
    let docker = DockerQuery::new(fixture_path("fake_docker_conflict.sh").to_string_lossy().into_owned());
    let allocator = Allocator::new(store, locks, docker.clone());

    let launcher = Launcher::with_clock(allocator, docker, FakeClock::new())
        .with_debug_client(Box::new(AlwaysReady));

    let profile_dir = dir.path().join("profile");
    let mut config = LaunchConfig::new("retry-test", "https://example.com", "neko:latest");
    config.profile_dir = profile_dir;

    let result = launcher.launch(config);
    let (handle, ws_url, screenshot) = result.expect("launch should succeed after one retry");
    assert_eq!(ws_url, "ws://localhost:9224/devtools/browser/fake");
    assert!(screenshot.is_none());
    drop(handle);

    let invocations: u32 = std::fs::read_to_string(&counter_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert_eq!(invocations, 2, "first run attempt fails, second succeeds");

    std::env::remove_var("FAKE_DOCKER_COUNTER");
}

#[test]
fn a_launch_that_never_becomes_ready_leaves_no_port_allocation_behind() {
    let dir = TempDir::new().unwrap();

    struct NeverReady;
    impl DebugEndpointClient for NeverReady {
        fn try_once(&self, _debug_port: u16) -> Result<Option<String>> {
            Ok(None)
        }
    }

    let allocator = new_allocator(&dir);
    let store_path = dir.path().join("state.json");
    let docker = DockerQuery::new("neko-launcher-test-no-such-binary");
    let launcher = Launcher::with_clock(allocator, docker, FakeClock::new())
        .with_debug_client(Box::new(NeverReady));

    let mut config = LaunchConfig::new("rollback-test", "https://example.com", "neko:latest");
    config.profile_dir = dir.path().join("profile");
    config.connection_timeout_s = 1;

    // `docker run` itself fails immediately because the binary doesn't
    // exist, exercising the fatal-rollback path where no container was
    // ever actually started (`try_start_and_wait`'s spawn-failure arm).
    // `a_readiness_timeout_with_a_genuinely_running_container_is_rolled_back`
    // below covers the companion case where the container did start.
    let err = launcher.launch(config).unwrap_err();
    assert!(matches!(err, NekoError::RuntimeUnavailable(_)));

    let store = StateStore::new(store_path);
    let state = store.read();
    assert!(
        !state.allocations.contains_key("rollback-test"),
        "a failed launch must not leave a dangling allocation"
    );
}

#[test]
#[serial]
fn a_readiness_timeout_with_a_genuinely_running_container_is_rolled_back() {
    let dir = TempDir::new().unwrap();

    struct NeverReady;
    impl DebugEndpointClient for NeverReady {
        fn try_once(&self, _debug_port: u16) -> Result<Option<String>> {
            Ok(None)
        }
    }

    let marker_file = dir.path().join("run-marker");
    let log_file = dir.path().join("stop-log");
    std::env::set_var("FAKE_DOCKER_MARKER", &marker_file);
    std::env::set_var("FAKE_DOCKER_LOG", &log_file);

    let store = StateStore::new(dir.path().join("state.json"));
    let locks = Locks::new(dir.path().join("state.lock"));
    let docker = DockerQuery::new(
        fixture_path("fake_docker_never_ready.sh")
            .to_string_lossy()
            .into_owned(),
    );
    let allocator = Allocator::new(store, locks, docker.clone());
    let launcher = Launcher::with_clock(allocator, docker, FakeClock::new())
        .with_debug_client(Box::new(NeverReady));

    let mut config = LaunchConfig::new("never-ready-test", "https://example.com", "neko:latest");
    config.profile_dir = dir.path().join("profile");
    config.connection_timeout_s = 1;

    // `run` always succeeds in this fixture, so the container is
    // genuinely up when the readiness poll gives up.
    let err = launcher.launch(config).unwrap_err();
    assert!(matches!(err, NekoError::ReadinessTimeout { .. }));

    // Rollback must have stopped the container the runtime reported as
    // running, not merely released its ports.
    let log = std::fs::read_to_string(&log_file).unwrap_or_default();
    assert!(log.contains("kill never-ready-test"), "expected a kill call, got: {log}");
    assert!(log.contains("rm -f never-ready-test"), "expected an rm call, got: {log}");

    let store = StateStore::new(dir.path().join("state.json"));
    let state = store.read();
    assert!(
        !state.allocations.contains_key("never-ready-test"),
        "a failed launch must not leave a dangling allocation"
    );

    std::env::remove_var("FAKE_DOCKER_MARKER");
    std::env::remove_var("FAKE_DOCKER_LOG");
}

#[test]
fn run_args_reflect_the_allocated_triple_and_chrome_flags() {
    let mut config = LaunchConfig::new("flags-test", "https://example.com", "neko:latest");
    config.server_port = 8090;
    config.debug_port = 9300;
    config.webrtc_start = 53000;
    config.chrome_flags = "--disable-gpu --mute-audio".to_string();

    // Exercised indirectly through launch() elsewhere; here we only
    // check the config carries what the run command needs.
    assert_eq!(config.server_port, 8090);
    assert!(config.chrome_flags.contains("--disable-gpu"));
}
