//! Helper program for the external-process transport.
//!
//! Usage: `isoload-helper <spec.json>`. Logs go to stderr; stdout carries
//! only the result block.

use isoload_core::LocalDelivery;
use tracing_subscriber::EnvFilter;

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    std::process::exit(isoload_core::helper::run(&args, LocalDelivery::boxed));
}
