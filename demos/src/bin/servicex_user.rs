//! ServiceX load test: every task builds a query specification and runs its
//! delivery in a disposable worker process.
//!
//! ```text
//! cargo run -p isoload-demos --bin servicex_user -- list
//! cargo run -p isoload-demos --bin servicex_user -- exec uproot_raw_query
//! cargo run -p isoload-demos --bin servicex_user -- --users 4 --run-time 2m
//! ```

use isoload::prelude::*;
use isoload_demos::{ATLAS_DATA16_FILES, ATLAS_MC20_FILE, configured_files, uproot_raw_spec};

#[derive(Default)]
struct ServiceXTest;

#[load_tasks]
impl ServiceXTest {
    #[load_task]
    fn uproot_raw_query(&self) -> Spec {
        Spec::new(vec![Sample::new(
            "FuncADL_Uproot_Dict",
            Dataset::file_list(ATLAS_DATA16_FILES.iter().copied()),
            Query::func_adl_uproot(
                "CollectionTree",
                r#"Select(lambda e: {"el_pt": e["AnalysisElectronsAuxDyn.pt"]})"#,
            ),
        )])
    }

    #[load_task]
    fn func_adl_xaod_simple(&self) -> Spec {
        let selection = concat!(
            r#"Select(lambda e: e.Jets("AnalysisJets"))"#,
            r#".Select(lambda jets: {"pt": jets.Select(lambda j: j.pt()), "eta": jets.Select(lambda j: j.eta())})"#,
        );
        Spec::new(vec![Sample::new(
            "func_adl_xAOD_simple",
            Dataset::file_list([ATLAS_MC20_FILE]),
            Query::FuncAdlAtlasR22 {
                selection: selection.to_string(),
            },
        )])
    }

    #[load_task(weight = 2)]
    fn configured_atlas_files(&self) -> anyhow::Result<Spec> {
        let files = configured_files("atlas")?;
        Ok(uproot_raw_spec(
            "configured_atlas",
            files,
            "CollectionTree",
            &["AnalysisElectronsAuxDyn.pt", "AnalysisElectronsAuxDyn.eta"],
        ))
    }
}

fn main() -> anyhow::Result<()> {
    isoload::run()
}
