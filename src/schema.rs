//! JSON Schema validation of replicant values.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::{Backtrace, ResultExt, Snafu};

/// Errors loading or compiling a schema.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum SchemaError {
    #[snafu(display("failed to read schema file {}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("schema file {} is not valid JSON", path.display()))]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[snafu(display("invalid JSON schema: {message}"))]
    Invalid { message: String },
}

/// Stable hash of a schema's canonical text.
///
/// Only compared for equality, to detect peers holding a different schema version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(transparent)]
pub struct SchemaSum(String);

impl SchemaSum {
    /// Hash the canonical text of `schema`.
    ///
    /// Object keys serialize sorted, so equal schemas hash equally regardless of key order.
    pub fn of(schema: &Value) -> Self {
        let canonical = schema.to_string();
        Self(blake3::hash(canonical.as_bytes()).to_hex().to_string())
    }

    /// The hex representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The first schema violation found in a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    /// Path of the offending value, `/` for the root.
    pub path: String,
    /// What is wrong with it.
    pub message: String,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// A compiled JSON Schema together with its [`SchemaSum`].
///
/// Cheap to clone.
#[derive(Clone)]
pub struct Schema(Arc<Inner>);

struct Inner {
    json: Value,
    sum: SchemaSum,
    validator: jsonschema::Validator,
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema").field("sum", &self.0.sum).finish()
    }
}

impl Schema {
    /// Compile a schema from its JSON document.
    pub fn compile(json: Value) -> Result<Self, SchemaError> {
        let validator = jsonschema::options()
            .should_validate_formats(true)
            .build(&json)
            .map_err(|e| {
                InvalidSnafu {
                    message: e.to_string(),
                }
                .build()
            })?;
        let sum = SchemaSum::of(&json);
        Ok(Self(Arc::new(Inner {
            json,
            sum,
            validator,
        })))
    }

    /// Read and compile the schema file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        let json = serde_json::from_str(&text).context(ParseSnafu { path })?;
        Self::compile(json)
    }

    /// The schema document.
    pub fn json(&self) -> &Value {
        &self.0.json
    }

    /// The schema sum.
    pub fn sum(&self) -> &SchemaSum {
        &self.0.sum
    }

    /// Validate `value`, reporting the first violation.
    ///
    /// An undefined value has nothing to validate and always passes.
    pub fn validate(&self, value: Option<&Value>) -> Result<(), ValidationFailure> {
        let Some(value) = value else {
            return Ok(());
        };
        self.0.validator.validate(value).map_err(|error| {
            let path = error.instance_path.to_string();
            ValidationFailure {
                path: if path.is_empty() { "/".to_string() } else { path },
                message: error.to_string(),
            }
        })
    }

    /// The value described by the `default` keywords of the schema, if any.
    ///
    /// An explicit `default` wins; otherwise objects are assembled from the defaults of their
    /// properties.
    pub fn default_value(&self) -> Option<Value> {
        defaults_of(&self.0.json)
    }
}

fn defaults_of(schema: &Value) -> Option<Value> {
    let schema = schema.as_object()?;
    if let Some(default) = schema.get("default") {
        return Some(default.clone());
    }
    let properties = schema.get("properties")?.as_object()?;
    let object: Map<String, Value> = properties
        .iter()
        .filter_map(|(prop, sub)| defaults_of(sub).map(|d| (prop.clone(), d)))
        .collect();
    let is_object = schema.get("type").is_none_or(|t| t == "object");
    (is_object && !object.is_empty()).then_some(Value::Object(object))
}
