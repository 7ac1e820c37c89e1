//! Operations that misbehave in every way a worker can, for exercising the
//! executor's outcomes by hand and in the integration tests.
//!
//! ```text
//! cargo run -p isoload-demos --bin failure_modes -- exec panics
//! cargo run -p isoload-demos --bin failure_modes -- exec hangs --timeout 2s
//! ```

use isoload::prelude::*;
use isoload_demos::uproot_raw_spec;
use std::io::Write;
use std::time::Duration;

/// A file that exists wherever this binary was built
const LOCAL_FILE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/Cargo.toml");

const REMOTE_PREFIX: &str = "root://eospublic.cern.ch//eos/opendata/atlas/rucio/data16_13TeV/DAOD_PHYSLITE";

#[derive(Default)]
struct FailureModes;

#[load_tasks]
impl FailureModes {
    #[load_task]
    fn quick_local_query(&self) -> Spec {
        uproot_raw_spec("local", vec![LOCAL_FILE.to_string()], "events", &["pt"])
    }

    #[load_task]
    fn chatty(&self) -> Spec {
        println!("chatty: building query");
        eprintln!("chatty: warning from the query client");
        let _ = std::io::stdout().flush();
        uproot_raw_spec("chatty", vec![LOCAL_FILE.to_string()], "events", &["eta"])
    }

    #[load_task]
    fn large_output(&self) -> Spec {
        let files = (0..20_000)
            .map(|i| format!("{REMOTE_PREFIX}.{i:08}._000001.pool.root.1"))
            .collect();
        uproot_raw_spec("large", files, "CollectionTree", &["el_pt"])
    }

    #[load_task]
    fn raises_error(&self) -> anyhow::Result<Spec> {
        let inner = anyhow::anyhow!("transform request rejected");
        Err(inner.context("query construction failed"))
    }

    #[load_task]
    fn panics(&self) -> Spec {
        panic!("query client panicked")
    }

    #[load_task]
    fn invalid_spec(&self) -> Spec {
        Spec::new(Vec::new())
    }

    #[load_task]
    fn missing_file(&self) -> Spec {
        uproot_raw_spec(
            "missing",
            vec!["/nonexistent/isoload/missing.root".to_string()],
            "events",
            &["pt"],
        )
    }

    #[load_task]
    fn hangs(&self) -> Spec {
        loop {
            std::thread::sleep(Duration::from_secs(3600));
        }
    }

    #[load_task]
    fn ignores_sigterm(&self) -> Spec {
        // SAFETY: replacing the disposition of a signal nothing else handles
        unsafe {
            libc::signal(libc::SIGTERM, libc::SIG_IGN);
        }
        loop {
            std::thread::sleep(Duration::from_secs(3600));
        }
    }

    #[load_task]
    fn exits_without_payload(&self) -> Spec {
        std::process::exit(0)
    }

    #[load_task]
    fn exits_with_code(&self) -> Spec {
        std::process::exit(7)
    }

    #[load_task]
    fn _private_helper(&self) -> Spec {
        Spec::default()
    }
}

fn main() -> anyhow::Result<()> {
    isoload::run()
}
