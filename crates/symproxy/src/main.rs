//! symproxy.
//!
//! symproxy is a pull-through cache for debug symbol files. Clients request symbols by module
//! name, debug identifier and file name. Cached files are served directly, missing ones are
//! downloaded in the background from upstream symbol servers such as Microsoft's public symbol
//! server or Mozilla's symbol store.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod endpoints;
mod healthcheck;
mod logging;
mod server;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
