// Manual smoke-test binary: launches a single container against a
// real docker daemon and prints its allocation. Not part of the
// published API surface — run with `cargo run --example neko-launch-demo`.
use neko_launcher::docker::DockerQuery;
use neko_launcher::env::{default_lock_file, default_state_file};
use neko_launcher::launcher::LaunchConfig;
use neko_launcher::lock::Locks;
use neko_launcher::state::StateStore;
use neko_launcher::{Allocator, Launcher};

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let name = args.next().unwrap_or_else(|| "neko-demo".to_string());
    let url = args.next().unwrap_or_else(|| "https://example.com".to_string());
    let image_tag = args.next().unwrap_or_else(|| "neko-chrome:latest".to_string());

    let store = StateStore::new(default_state_file());
    let locks = Locks::new(default_lock_file());
    let docker = DockerQuery::default();
    let allocator = Allocator::new(store, locks, docker.clone());
    let launcher = Launcher::new(allocator, docker);

    let config = LaunchConfig::new(name.clone(), url, image_tag);

    match launcher.launch(config.clone()) {
        Ok((handle, ws_url, screenshot)) => {
            println!("launched '{name}' ws={ws_url}");
            println!("press enter to tear down");
            let mut line = String::new();
            let _ = std::io::stdin().read_line(&mut line);
            launcher.cleanup(&config, handle, screenshot);
        }
        Err(e) => {
            eprintln!("launch failed: {e}");
            std::process::exit(1);
        }
    }
}
