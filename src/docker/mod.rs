// Container-runtime collaborator: the narrow set of primitives the
// allocator and launcher need from the `docker` CLI — listing running
// names, checking image existence, killing/removing a container by
// name, and running a command inside one. Every call is wrapped with a
// wall-clock timeout so a hung runtime fails predictably instead of
// blocking the caller forever.
mod query;

pub use query::{DockerQuery, RunningNames};
