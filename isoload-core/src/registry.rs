//! Operation Registry
//!
//! Load-test operations are registered statically: `#[load_tasks]` submits one
//! [`OperationDef`] per flagged method through `inventory`, and the registry
//! collects them at startup. Explicit registration is available for code that
//! builds its operation table by hand.

use crate::spec::Spec;
use std::collections::BTreeMap;
use thiserror::Error;

/// A registered load-test operation
#[derive(Debug, Clone, Copy)]
pub struct OperationDef {
    /// Operation name, unique across the process
    pub name: &'static str,
    /// Name of the task-definition type owning the operation
    pub owner: &'static str,
    /// Capability flag marking the entry as a load-test operation
    pub load_task: bool,
    /// Relative scheduling weight of the bound task
    pub weight: u32,
    /// Builds a fresh owner instance and runs the operation
    pub run_fn: fn() -> Result<Spec, OperationError>,
    /// Source file path
    pub file: &'static str,
    /// Source line number
    pub line: u32,
    /// Module path
    pub module_path: &'static str,
}

inventory::collect!(OperationDef);

/// Anchor to prevent LTO from stripping inventory entries
#[used]
#[doc(hidden)]
pub static REGISTRY_ANCHOR: fn() = || {
    for _ in inventory::iter::<OperationDef> {}
};

/// A type whose methods provide load-test operations.
///
/// Implemented by `#[load_tasks]`.
pub trait TaskDefinition: Default + 'static {
    /// Type name
    const NAME: &'static str;
    /// Names of the flagged operations, in declaration order
    const OPERATIONS: &'static [&'static str];
}

/// Errors raised while resolving or running an operation
#[derive(Debug, Error)]
pub enum OperationError {
    /// No operation with this name is registered
    #[error("unknown operation: {0}")]
    Unknown(String),

    /// The name is registered but lacks the load-task flag
    #[error("{0} is not a valid load-test operation")]
    NotLoadTask(String),

    /// The operation body failed
    #[error("operation {name} failed: {error}")]
    Failed {
        /// Operation name
        name: String,
        /// Error message
        error: String,
        /// Full error chain, outermost first
        traceback: String,
    },
}

impl OperationError {
    /// Wrap a failure raised by an operation body
    pub fn failed(name: &str, error: anyhow::Error) -> Self {
        OperationError::Failed {
            name: name.to_string(),
            error: error.to_string(),
            traceback: error_chain(&error),
        }
    }

    /// True when the name could not be resolved to a flagged operation
    pub fn is_unknown(&self) -> bool {
        matches!(self, OperationError::Unknown(_) | OperationError::NotLoadTask(_))
    }
}

/// Render an error and its causes, one per line
pub fn error_chain(error: &anyhow::Error) -> String {
    let mut out = String::new();
    for (depth, cause) in error.chain().enumerate() {
        if depth == 0 {
            out.push_str(&format!("Error: {cause}\n"));
        } else {
            out.push_str(&format!("  caused by: {cause}\n"));
        }
    }
    let backtrace = error.backtrace().to_string();
    if !backtrace.is_empty() && backtrace != "disabled backtrace" {
        out.push_str("\nStack backtrace:\n");
        out.push_str(&backtrace);
    }
    out
}

/// Conversion from an operation method's return value
#[doc(hidden)]
pub trait IntoSpecResult {
    /// Normalise into a fallible specification
    fn into_spec_result(self) -> anyhow::Result<Spec>;
}

impl IntoSpecResult for Spec {
    fn into_spec_result(self) -> anyhow::Result<Spec> {
        Ok(self)
    }
}

impl<E> IntoSpecResult for Result<Spec, E>
where
    E: Into<anyhow::Error>,
{
    fn into_spec_result(self) -> anyhow::Result<Spec> {
        self.map_err(Into::into)
    }
}

/// The set of operations known to this process
#[derive(Debug, Clone, Default)]
pub struct Registry {
    operations: BTreeMap<&'static str, OperationDef>,
}

impl Registry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect every operation submitted through `inventory`
    pub fn discover() -> Self {
        let mut registry = Self::new();
        for def in inventory::iter::<OperationDef> {
            registry.register(*def);
        }
        registry
    }

    /// Add one operation. The first registration of a name wins.
    pub fn register(&mut self, def: OperationDef) -> &mut Self {
        if let Some(existing) = self.operations.get(def.name) {
            tracing::warn!(
                operation = def.name,
                kept = %format!("{}:{}", existing.file, existing.line),
                ignored = %format!("{}:{}", def.file, def.line),
                "duplicate operation name"
            );
        } else {
            self.operations.insert(def.name, def);
        }
        self
    }

    /// Look up a flagged operation by name
    pub fn resolve(&self, name: &str) -> Result<&OperationDef, OperationError> {
        match self.operations.get(name) {
            None => Err(OperationError::Unknown(name.to_string())),
            Some(def) if !def.load_task => Err(OperationError::NotLoadTask(name.to_string())),
            Some(def) => Ok(def),
        }
    }

    /// Resolve and run an operation, returning the specification it builds
    pub fn invoke(&self, name: &str) -> Result<Spec, OperationError> {
        let def = self.resolve(name)?;
        (def.run_fn)()
    }

    /// Flagged operations that are exposed for scheduling (names starting
    /// with `_` are internal)
    pub fn load_tasks(&self) -> impl Iterator<Item = &OperationDef> {
        self.operations
            .values()
            .filter(|def| def.load_task && !def.name.starts_with('_'))
    }

    /// Flagged, exposed operations owned by `owner`
    pub fn operations_of<'a>(&'a self, owner: &'a str) -> impl Iterator<Item = &'a OperationDef> {
        self.load_tasks().filter(move |def| def.owner == owner)
    }

    /// Number of registered operations, flagged or not
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{Dataset, Query, Sample};

    fn ok_spec() -> Result<Spec, OperationError> {
        Ok(Spec::new(vec![Sample::new(
            "s",
            Dataset::file_list(["a.root"]),
            Query::uproot_raw(serde_json::json!([])),
        )]))
    }

    fn failing() -> Result<Spec, OperationError> {
        let err = anyhow::anyhow!("no such tree").context("building query");
        Err(OperationError::failed("failing", err))
    }

    fn def(name: &'static str, owner: &'static str, load_task: bool) -> OperationDef {
        OperationDef {
            name,
            owner,
            load_task,
            weight: 1,
            run_fn: ok_spec,
            file: file!(),
            line: line!(),
            module_path: module_path!(),
        }
    }

    #[test]
    fn resolve_requires_flag() {
        let mut registry = Registry::new();
        registry
            .register(def("uproot_raw_query", "Tasks", true))
            .register(def("helper_method", "Tasks", false));

        assert!(registry.resolve("uproot_raw_query").is_ok());
        assert!(matches!(
            registry.resolve("helper_method"),
            Err(OperationError::NotLoadTask(_))
        ));
        assert!(registry.resolve("missing").unwrap_err().is_unknown());
    }

    #[test]
    fn private_names_are_not_scheduled() {
        let mut registry = Registry::new();
        registry
            .register(def("visible", "A", true))
            .register(def("_internal", "A", true))
            .register(def("other", "B", true));

        let names: Vec<_> = registry.load_tasks().map(|d| d.name).collect();
        assert_eq!(names, ["other", "visible"]);
        let owned: Vec<_> = registry.operations_of("A").map(|d| d.name).collect();
        assert_eq!(owned, ["visible"]);
        // Still resolvable by name
        assert!(registry.resolve("_internal").is_ok());
    }

    #[test]
    fn first_registration_wins() {
        let mut registry = Registry::new();
        let mut second = def("dup", "B", true);
        second.run_fn = failing;
        registry.register(def("dup", "A", true)).register(second);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve("dup").unwrap().owner, "A");
    }

    #[test]
    fn failure_keeps_error_chain() {
        let mut registry = Registry::new();
        let mut broken = def("failing", "A", true);
        broken.run_fn = failing;
        registry.register(broken);

        match registry.invoke("failing") {
            Err(OperationError::Failed { error, traceback, .. }) => {
                assert_eq!(error, "building query");
                assert!(traceback.contains("caused by: no such tree"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
