//! Shared pieces of the demo load tests.

use isoload::{Dataset, LoadConfig, Query, Sample, Spec};

/// ATLAS open-data PHYSLITE files, 2016 data
pub const ATLAS_DATA16_FILES: &[&str] = &[
    "root://eospublic.cern.ch//eos/opendata/atlas/rucio/data16_13TeV/DAOD_PHYSLITE.37019878._000001.pool.root.1",
    "root://eospublic.cern.ch//eos/opendata/atlas/rucio/data16_13TeV/DAOD_PHYSLITE.37019878._000002.pool.root.1",
    "root://eospublic.cern.ch//eos/opendata/atlas/rucio/data16_13TeV/DAOD_PHYSLITE.37019878._000003.pool.root.1",
];

/// ATLAS open-data PHYSLITE file, MC20 simulation
pub const ATLAS_MC20_FILE: &str =
    "root://eospublic.cern.ch//eos/opendata/atlas/rucio/mc20_13TeV/DAOD_PHYSLITE.37622528._000013.pool.root.1";

/// Configured test files for `experiment` ("atlas" or "cms").
///
/// Workers are fresh processes, so the configuration is resolved again from
/// the same file and environment the load generator used.
pub fn configured_files(experiment: &str) -> anyhow::Result<Vec<String>> {
    let config = LoadConfig::resolve(None)?;
    let files = match experiment {
        "atlas" => config.test_data.atlas_files,
        "cms" => config.test_data.cms_files,
        other => anyhow::bail!("unknown experiment: {other}"),
    };
    anyhow::ensure!(
        !files.is_empty(),
        "no {experiment} test files configured (set test_data.{experiment}_files or {}_TEST_FILES)",
        experiment.to_uppercase()
    );
    Ok(files)
}

/// Single-sample specification reading `files` with an uproot-raw query on `tree`
pub fn uproot_raw_spec(name: &str, files: Vec<String>, tree: &str, branches: &[&str]) -> Spec {
    Spec::new(vec![Sample::new(
        name,
        Dataset::file_list(files),
        Query::uproot_raw(serde_json::json!([{"treename": tree, "filter_name": branches}])),
    )])
}
