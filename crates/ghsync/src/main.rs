//! ghsync.
//!
//! ghsync is a web service that keeps locally cached GitHub profiles and repositories fresh
//! while shielding the GitHub API from duplicate and excessive calls. Concurrent requests for
//! the same user share a single fetch, and cached data is served while it is within its TTL.

#![warn(
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

mod cli;
mod endpoints;
mod healthcheck;
mod logging;
mod server;
mod service;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
