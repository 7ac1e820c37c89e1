//! Registration through `#[load_tasks]` and binding into a task table.

use isoload::prelude::*;
use isoload::{ExecutionError, Isolate, Registry, ResultPayload, TaskBinder};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct AtlasTasks {
    calls: u32,
}

#[load_tasks]
impl AtlasTasks {
    #[load_task]
    fn raw_query(&self) -> Spec {
        Spec::new(vec![Sample::new(
            "raw",
            Dataset::file_list(["root://eospublic.cern.ch//eos/opendata/atlas/raw.root"]),
            Query::uproot_raw(serde_json::json!([{"treename": "nominal", "filter_name": ["el_pt"]}])),
        )])
    }

    #[load_task(weight = 4)]
    fn counted_query(&mut self) -> anyhow::Result<Spec> {
        self.calls += 1;
        // A fresh instance per invocation, so the counter never exceeds one
        anyhow::ensure!(self.calls == 1, "instance was reused");
        Ok(Spec::new(vec![Sample::new(
            "counted",
            Dataset::file_list(["/data/counted.root"]),
            Query::func_adl_uproot("nominal", "Select(lambda e: e.el_pt)"),
        )]))
    }

    #[load_task(name = "renamed_query")]
    fn original_name(&self) -> Result<Spec, std::io::Error> {
        Err(std::io::Error::other("backend unavailable"))
    }

    #[load_task]
    fn _private_setup(&self) -> Spec {
        Spec::default()
    }

    fn not_an_operation(&self) -> u32 {
        self.calls
    }
}

#[derive(Default)]
struct CmsTasks;

#[load_tasks]
impl CmsTasks {
    #[load_task]
    fn cms_query(&self) -> Spec {
        Spec::new(vec![Sample::new(
            "cms",
            Dataset::file_list(["root://eospublic.cern.ch//eos/opendata/cms/events.root"]),
            Query::uproot_raw(serde_json::json!([{"treename": "Events"}])),
        )])
    }
}

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<String>>,
}

impl Isolate for Recorder {
    fn execute(&self, operation: &str, _timeout: Duration) -> Result<ResultPayload, ExecutionError> {
        self.calls.lock().unwrap().push(operation.to_string());
        Ok(ResultPayload::new(vec!["Sample".to_string()], BTreeMap::new()))
    }
}

#[test]
fn macro_generates_task_definition() {
    assert_eq!(AtlasTasks::NAME, "AtlasTasks");
    assert_eq!(
        AtlasTasks::OPERATIONS,
        ["raw_query", "counted_query", "renamed_query", "_private_setup"]
    );
    assert_eq!(AtlasTasks::default().not_an_operation(), 0);
}

#[test]
fn discovered_operations_resolve_and_run() {
    let registry = Registry::discover();

    let spec = registry.invoke("raw_query").unwrap();
    assert_eq!(spec.sample_names().collect::<Vec<_>>(), ["raw"]);

    // Each invocation builds a fresh instance
    registry.invoke("counted_query").unwrap();
    registry.invoke("counted_query").unwrap();

    assert_eq!(registry.resolve("counted_query").unwrap().weight, 4);
    assert!(registry.resolve("original_name").is_err());
    assert!(registry.resolve("not_an_operation").is_err());
}

#[test]
fn operation_errors_carry_the_chain() {
    let registry = Registry::discover();
    match registry.invoke("renamed_query").unwrap_err() {
        OperationError::Failed { name, error, traceback } => {
            assert_eq!(name, "renamed_query");
            assert_eq!(error, "backend unavailable");
            assert!(traceback.contains("backend unavailable"));
        }
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[test]
fn binder_creates_suffixed_tasks_per_definition() {
    let registry = Registry::discover();
    let recorder = Arc::new(Recorder::default());

    let table = TaskBinder::new().with::<AtlasTasks>().bind(&registry, recorder.clone());
    assert_eq!(
        table.names(),
        ["counted_query_task", "raw_query_task", "renamed_query_task"]
    );
    assert!(table.get("_private_setup_task").is_none());
    assert!(table.get("cms_query_task").is_none());

    table
        .get("raw_query_task")
        .unwrap()
        .run(Duration::from_secs(1))
        .unwrap();
    assert_eq!(*recorder.calls.lock().unwrap(), ["raw_query"]);
}

#[test]
fn binder_spans_definitions() {
    let registry = Registry::discover();
    let table = TaskBinder::new()
        .with::<AtlasTasks>()
        .with::<CmsTasks>()
        .filter(Regex::new("query$").unwrap())
        .bind(&registry, Arc::new(Recorder::default()));

    assert_eq!(table.len(), 4);
    assert_eq!(table.get("cms_query_task").unwrap().owner, "CmsTasks");
}
