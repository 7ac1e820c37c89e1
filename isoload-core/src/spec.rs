//! Query Specifications
//!
//! A specification describes a delivery request: a list of named samples,
//! each pairing a dataset with a query. The serialized form uses the ServiceX
//! key spelling, and datasets and queries use the generic tagged
//! `{"type": ..., ...}` representation so a specification can be written to a
//! file and rebuilt by another program.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;

/// Errors raised while validating or rebuilding a specification
#[derive(Debug, Error)]
pub enum SpecError {
    /// The specification has no samples
    #[error("specification contains no samples")]
    NoSamples,

    /// A sample has an empty name
    #[error("sample {index} has an empty name")]
    EmptyName {
        /// Position of the sample
        index: usize,
    },

    /// Two samples share a name
    #[error("duplicate sample name: {0}")]
    DuplicateName(String),

    /// A file-list dataset with no files
    #[error("sample {0} has an empty file list")]
    EmptyFileList(String),

    /// A Rucio dataset with an empty identifier
    #[error("sample {0} has an empty dataset identifier")]
    EmptyDid(String),

    /// A dataset tag that is not recognised
    #[error("Unknown dataset type: {0}")]
    UnknownDatasetType(String),

    /// A query tag that is not recognised
    #[error("Unknown query type: {0}")]
    UnknownQueryType(String),

    /// The tagged form is structurally invalid
    #[error("malformed specification: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A delivery request
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Spec {
    /// Request-wide settings
    #[serde(rename = "General", default, skip_serializing_if = "Option::is_none")]
    pub general: Option<General>,
    /// Samples to deliver
    #[serde(rename = "Sample")]
    pub sample: Vec<Sample>,
}

/// Request-wide settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct General {
    /// Output file format
    #[serde(rename = "OutputFormat", default)]
    pub output_format: OutputFormat,
    /// How results are handed back
    #[serde(rename = "Delivery", default)]
    pub delivery: DeliveryMode,
}

/// Output file format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputFormat {
    /// Apache Parquet
    #[default]
    #[serde(rename = "parquet")]
    Parquet,
    /// ROOT TTree
    #[serde(rename = "root-ttree")]
    RootTtree,
}

/// How delivered files are handed back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Downloaded into the local cache
    #[default]
    LocalCache,
    /// Left remote and returned as URLs
    URLs,
}

/// One named dataset/query pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Unique sample name, used as the key of the delivered result set
    #[serde(rename = "Name")]
    pub name: String,
    /// Where the input comes from
    #[serde(rename = "Dataset")]
    pub dataset: Dataset,
    /// What to extract
    #[serde(rename = "Query")]
    pub query: Query,
    /// Limit on the number of input files
    #[serde(rename = "NFiles", default, skip_serializing_if = "Option::is_none")]
    pub n_files: Option<usize>,
}

/// Input dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Dataset {
    /// Explicit list of file paths or URLs
    FileList {
        /// Files in the dataset
        files: Vec<String>,
    },
    /// Rucio dataset identifier
    Rucio {
        /// Dataset identifier (`scope:name`)
        did: String,
    },
}

/// Query applied to every file of a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Query {
    /// Raw uproot query description
    UprootRaw {
        /// Query body, passed through untouched
        data: Value,
    },
    /// func_adl query over a flat tree
    #[serde(rename = "FuncADL_Uproot")]
    FuncAdlUproot {
        /// Tree to read
        tree: String,
        /// Selection expression
        selection: String,
    },
    /// func_adl query over ATLAS release 22 xAOD
    #[serde(rename = "FuncADL_ATLASr22")]
    FuncAdlAtlasR22 {
        /// Selection expression
        selection: String,
    },
    /// Source of a python function run per file
    PythonFunction {
        /// Function source
        function: String,
    },
}

impl Dataset {
    /// Tags accepted in the `type` field
    pub const TYPES: &'static [&'static str] = &["FileList", "Rucio"];

    /// A file-list dataset
    pub fn file_list<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Dataset::FileList {
            files: files.into_iter().map(Into::into).collect(),
        }
    }

    /// The `type` tag of this dataset
    pub fn type_name(&self) -> &'static str {
        match self {
            Dataset::FileList { .. } => "FileList",
            Dataset::Rucio { .. } => "Rucio",
        }
    }
}

impl Query {
    /// Tags accepted in the `type` field
    pub const TYPES: &'static [&'static str] =
        &["UprootRaw", "FuncADL_Uproot", "FuncADL_ATLASr22", "PythonFunction"];

    /// An uproot-raw query
    pub fn uproot_raw(data: Value) -> Self {
        Query::UprootRaw { data }
    }

    /// A func_adl query over `tree`
    pub fn func_adl_uproot(tree: impl Into<String>, selection: impl Into<String>) -> Self {
        Query::FuncAdlUproot {
            tree: tree.into(),
            selection: selection.into(),
        }
    }

    /// The `type` tag of this query
    pub fn type_name(&self) -> &'static str {
        match self {
            Query::UprootRaw { .. } => "UprootRaw",
            Query::FuncAdlUproot { .. } => "FuncADL_Uproot",
            Query::FuncAdlAtlasR22 { .. } => "FuncADL_ATLASr22",
            Query::PythonFunction { .. } => "PythonFunction",
        }
    }
}

impl Sample {
    /// A sample with no file limit
    pub fn new(name: impl Into<String>, dataset: Dataset, query: Query) -> Self {
        Self {
            name: name.into(),
            dataset,
            query,
            n_files: None,
        }
    }
}

impl Spec {
    /// A specification over the given samples
    pub fn new(sample: Vec<Sample>) -> Self {
        Self {
            general: None,
            sample,
        }
    }

    /// Top-level keys of the serialized form, in order
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(2);
        if self.general.is_some() {
            keys.push("General".to_string());
        }
        keys.push("Sample".to_string());
        keys
    }

    /// Sample names, in order
    pub fn sample_names(&self) -> impl Iterator<Item = &str> {
        self.sample.iter().map(|s| s.name.as_str())
    }

    /// Check the structural rules a delivery call relies on
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.sample.is_empty() {
            return Err(SpecError::NoSamples);
        }

        let mut seen = BTreeSet::new();
        for (index, sample) in self.sample.iter().enumerate() {
            if sample.name.trim().is_empty() {
                return Err(SpecError::EmptyName { index });
            }
            if !seen.insert(sample.name.as_str()) {
                return Err(SpecError::DuplicateName(sample.name.clone()));
            }
            match &sample.dataset {
                Dataset::FileList { files } if files.is_empty() => {
                    return Err(SpecError::EmptyFileList(sample.name.clone()));
                }
                Dataset::Rucio { did } if did.trim().is_empty() => {
                    return Err(SpecError::EmptyDid(sample.name.clone()));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Serialize to the generic tagged representation
    pub fn to_tagged(&self) -> Result<Value, SpecError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Rebuild a specification from its tagged representation.
    ///
    /// Unknown dataset or query tags are reported by name rather than as a
    /// generic decode failure.
    pub fn from_tagged(value: Value) -> Result<Self, SpecError> {
        if let Some(samples) = value.get("Sample").and_then(Value::as_array) {
            for sample in samples {
                check_tag(sample.get("Dataset"), Dataset::TYPES, SpecError::UnknownDatasetType)?;
                check_tag(sample.get("Query"), Query::TYPES, SpecError::UnknownQueryType)?;
            }
        }
        Ok(serde_json::from_value(value)?)
    }
}

fn check_tag(
    node: Option<&Value>,
    known: &[&str],
    unknown: fn(String) -> SpecError,
) -> Result<(), SpecError> {
    let Some(tag) = node.and_then(|n| n.get("type")) else {
        // Missing tags surface as a decode error
        return Ok(());
    };
    match tag.as_str() {
        Some(name) if known.contains(&name) => Ok(()),
        Some(name) => Err(unknown(name.to_string())),
        None => Err(unknown(tag.to_string())),
    }
}
