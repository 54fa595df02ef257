//! Prefix-scoped batched value transformation
//!
//! Streams every entry under a prefix, computes new value bytes via one of
//! three transformation styles, and commits through the normal batch path so
//! every rewritten key produces a `Put` event.

use smol_str::SmolStr;
use tokio_util::sync::CancellationToken;

use crate::datastore::Datastore;
use crate::error::{DatastoreError, Result};

/// Default number of entries per committed batch
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// A compiled filter expression, reusable across entries
pub trait CompiledExpression: Send + Sync {
    /// Run the expression against one JSON value
    ///
    /// Returns the first result, or `None` when the expression produced
    /// nothing for this value.
    fn apply(&self, value: &serde_json::Value) -> Result<Option<serde_json::Value>>;
}

/// External expression engine contract
///
/// Compilation happens once per transform run; the compiled program is then
/// applied to every entry.
pub trait ExpressionFilter: Send + Sync {
    /// Compile an expression, failing on malformed source
    fn compile(&self, source: &str) -> Result<Box<dyn CompiledExpression>>;
}

/// What to do to each value (exactly one of three styles)
#[derive(Debug, Clone)]
pub enum Transformation {
    /// Run a compiled filter expression and keep its first result
    Expression(String),
    /// Replace the value with the subtree at a slash/dot path
    ExtractPath(String),
    /// Apply structural patch directives to a top-level JSON object
    Patches(Vec<PatchOp>),
}

/// Patch operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// Write a field (alias: add)
    Replace,
    /// Write a field
    Add,
    /// Delete a field
    Remove,
}

/// One parsed `op path = [type#]value` directive
#[derive(Debug, Clone, PartialEq)]
pub struct PatchOp {
    /// What to do
    pub op: PatchKind,
    /// Target field; multi-segment paths are rejected
    pub path: SmolStr,
    /// Literal for replace/add; `None` for remove
    pub value: Option<serde_json::Value>,
}

impl PatchOp {
    /// Parse a directive like `replace price=42.0#float` or `remove deprecated`
    ///
    /// The type tag (`int`, `float`, `bool`, `json`; default string) is
    /// accepted on either side of the `#`.
    pub fn parse(directive: &str) -> Result<Self> {
        let directive = directive.trim();
        let (op_token, rest) = directive
            .split_once(char::is_whitespace)
            .ok_or_else(|| bad_directive(directive, "missing path"))?;
        let rest = rest.trim();

        match op_token {
            "remove" => {
                let path = parse_path(rest, directive)?;
                Ok(Self {
                    op: PatchKind::Remove,
                    path,
                    value: None,
                })
            }
            "replace" | "add" => {
                let (path, literal) = rest
                    .split_once('=')
                    .ok_or_else(|| bad_directive(directive, "missing `=`"))?;
                let path = parse_path(path.trim(), directive)?;
                let value = parse_literal(literal.trim())?;
                Ok(Self {
                    op: if op_token == "replace" {
                        PatchKind::Replace
                    } else {
                        PatchKind::Add
                    },
                    path,
                    value: Some(value),
                })
            }
            other => Err(bad_directive(directive, &format!("unknown op `{}`", other))),
        }
    }

    /// Parse a whole directive list
    pub fn parse_all<'a>(directives: impl IntoIterator<Item = &'a str>) -> Result<Vec<Self>> {
        directives.into_iter().map(Self::parse).collect()
    }
}

fn bad_directive(directive: &str, why: &str) -> DatastoreError {
    DatastoreError::invalid_input(format!("bad patch directive `{}`: {}", directive, why))
        .with_help("expected `replace path=[type#]value`, `add path=[type#]value` or `remove path`")
}

fn parse_path(path: &str, directive: &str) -> Result<SmolStr> {
    if path.is_empty() {
        return Err(bad_directive(directive, "empty path"));
    }
    if path.contains('/') || path.contains('.') {
        return Err(bad_directive(directive, "nested paths are not supported"));
    }
    Ok(SmolStr::new(path))
}

const LITERAL_TYPES: [&str; 4] = ["int", "float", "bool", "json"];

fn parse_literal(literal: &str) -> Result<serde_json::Value> {
    let (ty, raw) = match literal.split_once('#') {
        Some((a, b)) if LITERAL_TYPES.contains(&a) => (a, b),
        Some((a, b)) if LITERAL_TYPES.contains(&b) => (b, a),
        _ => return Ok(serde_json::Value::String(literal.to_string())),
    };

    match ty {
        "int" => raw
            .parse::<i64>()
            .map(serde_json::Value::from)
            .map_err(|e| DatastoreError::invalid_input(format!("bad int literal `{}`: {}", raw, e))),
        "float" => raw
            .parse::<f64>()
            .map(serde_json::Value::from)
            .map_err(|e| {
                DatastoreError::invalid_input(format!("bad float literal `{}`: {}", raw, e))
            }),
        "bool" => raw
            .parse::<bool>()
            .map(serde_json::Value::Bool)
            .map_err(|e| {
                DatastoreError::invalid_input(format!("bad bool literal `{}`: {}", raw, e))
            }),
        // Only "json" remains of LITERAL_TYPES.
        _ => serde_json::from_str(raw)
            .map_err(|e| DatastoreError::invalid_input(format!("bad json literal `{}`: {}", raw, e))),
    }
}

/// Knobs for one transform run
#[derive(Clone, Default)]
pub struct TransformOptions {
    /// Entries per committed batch; 0 means [`DEFAULT_BATCH_SIZE`]
    pub batch_size: usize,
    /// Skip entries that fail instead of aborting the run
    pub ignore_errors: bool,
    /// Compute and report without writing
    pub dry_run: bool,
    /// Observed on every entry; firing aborts with `Cancelled`
    pub cancel: CancellationToken,
}

/// Outcome of a transform run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformReport {
    /// Entries read under the prefix
    pub examined: usize,
    /// Entries whose new bytes were computed (and written unless dry-run)
    pub transformed: usize,
    /// Entries skipped by `ignore_errors`
    pub skipped: usize,
    /// Batches committed
    pub committed: usize,
}

/// Prefix-scoped batched read-modify-write over the datastore
pub struct TransformEngine<'a> {
    datastore: &'a Datastore,
}

impl<'a> TransformEngine<'a> {
    /// Engine bound to a datastore
    pub fn new(datastore: &'a Datastore) -> Self {
        Self { datastore }
    }

    /// Apply `transformation` to every entry under `prefix`
    pub async fn run(
        &self,
        prefix: &str,
        transformation: &Transformation,
        options: &TransformOptions,
    ) -> Result<TransformReport> {
        let compiled = match transformation {
            Transformation::Expression(source) => {
                let filter = self.datastore.expression_filter().ok_or_else(|| {
                    DatastoreError::invalid_input(
                        "expression transform requires an expression engine in the config",
                    )
                })?;
                Some(filter.compile(source)?)
            }
            Transformation::ExtractPath(path) if path.is_empty() => {
                return Err(DatastoreError::invalid_input("empty extract path"));
            }
            _ => None,
        };

        let batch_size = if options.batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            options.batch_size
        };

        let mut report = TransformReport::default();
        let mut batch = self.datastore.batch();
        let mut pending = 0usize;

        for entry in self.datastore.scan(prefix)? {
            if options.cancel.is_cancelled() {
                return Err(DatastoreError::cancelled());
            }
            let entry = entry?;
            report.examined += 1;

            let new_bytes = match apply_one(transformation, compiled.as_deref(), &entry.value) {
                Ok(bytes) => bytes,
                Err(e) if options.ignore_errors => {
                    tracing::debug!(key = %entry.key, error = %e, "skipping entry");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e.with_context(format!("key: {}", entry.key))),
            };

            report.transformed += 1;
            if options.dry_run {
                continue;
            }

            // TTL survives the rewrite.
            batch.put_with_expiry(entry.key.as_str(), new_bytes, entry.expires_at)?;
            pending += 1;
            if pending >= batch_size {
                batch.commit().await?;
                report.committed += 1;
                batch = self.datastore.batch();
                pending = 0;
            }
        }

        if pending > 0 {
            batch.commit().await?;
            report.committed += 1;
        }

        Ok(report)
    }
}

/// Compute the replacement bytes for one stored value
fn apply_one(
    transformation: &Transformation,
    compiled: Option<&dyn CompiledExpression>,
    raw: &[u8],
) -> Result<Vec<u8>> {
    let value: serde_json::Value = serde_json::from_slice(raw)
        .map_err(|e| DatastoreError::invalid_input(format!("value is not JSON: {}", e)))?;

    let out = match transformation {
        Transformation::Expression(_) => {
            let program = compiled.ok_or_else(|| {
                DatastoreError::invalid_input("expression transform without compiled program")
            })?;
            program.apply(&value)?.ok_or_else(|| {
                DatastoreError::invalid_input("expression produced no result")
            })?
        }
        Transformation::ExtractPath(path) => extract_path(&value, path)?,
        Transformation::Patches(ops) => apply_patches(value, ops)?,
    };

    serde_json::to_vec(&out).map_err(DatastoreError::serialization)
}

/// Descend a slash- or dot-separated path through objects and array indices
fn extract_path(value: &serde_json::Value, path: &str) -> Result<serde_json::Value> {
    let mut cursor = value;
    for segment in path.split(['/', '.']).filter(|s| !s.is_empty()) {
        cursor = match cursor {
            serde_json::Value::Object(map) => map.get(segment).ok_or_else(|| {
                DatastoreError::not_found(format!("path segment `{}`", segment))
            })?,
            serde_json::Value::Array(items) => {
                let idx: usize = segment.parse().map_err(|_| {
                    DatastoreError::invalid_input(format!(
                        "segment `{}` indexes an array but is not a number",
                        segment
                    ))
                })?;
                items.get(idx).ok_or_else(|| {
                    DatastoreError::not_found(format!("array index {}", idx))
                })?
            }
            _ => {
                return Err(DatastoreError::invalid_input(format!(
                    "segment `{}` descends into a scalar",
                    segment
                )));
            }
        };
    }
    Ok(cursor.clone())
}

/// Apply patch directives to a top-level JSON object
fn apply_patches(value: serde_json::Value, ops: &[PatchOp]) -> Result<serde_json::Value> {
    let serde_json::Value::Object(mut map) = value else {
        return Err(DatastoreError::invalid_input(
            "patch transform requires a top-level JSON object",
        ));
    };

    for op in ops {
        match op.op {
            PatchKind::Replace | PatchKind::Add => {
                let literal = op.value.clone().ok_or_else(|| {
                    DatastoreError::invalid_input("write op without a literal")
                })?;
                map.insert(op.path.to_string(), literal);
            }
            PatchKind::Remove => {
                map.remove(op.path.as_str());
            }
        }
    }

    Ok(serde_json::Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_replace_with_tag_on_either_side() {
        let a = PatchOp::parse("replace price=42.0#float").unwrap();
        let b = PatchOp::parse("replace price=float#42.0").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.value, Some(json!(42.0)));

        let c = PatchOp::parse("add count=int#7").unwrap();
        assert_eq!(c.op, PatchKind::Add);
        assert_eq!(c.value, Some(json!(7)));
    }

    #[test]
    fn test_parse_default_is_string() {
        let op = PatchOp::parse("replace name=alice").unwrap();
        assert_eq!(op.value, Some(json!("alice")));

        // A `#` with no recognized tag stays part of the string.
        let op = PatchOp::parse("replace color=tone#1").unwrap();
        assert_eq!(op.value, Some(json!("tone#1")));
    }

    #[test]
    fn test_parse_bool_and_json() {
        let op = PatchOp::parse("replace active=bool#true").unwrap();
        assert_eq!(op.value, Some(json!(true)));

        let op = PatchOp::parse("replace tags=json#[1,2]").unwrap();
        assert_eq!(op.value, Some(json!([1, 2])));
    }

    #[test]
    fn test_parse_remove() {
        let op = PatchOp::parse("remove deprecated").unwrap();
        assert_eq!(op.op, PatchKind::Remove);
        assert_eq!(op.value, None);
    }

    #[test]
    fn test_parse_rejections() {
        assert!(PatchOp::parse("replace").is_err());
        assert!(PatchOp::parse("replace price").is_err());
        assert!(PatchOp::parse("frobnicate x=1").is_err());
        assert!(PatchOp::parse("replace a/b=1").is_err());
        assert!(PatchOp::parse("remove a.b").is_err());
        assert!(PatchOp::parse("replace n=int#forty").is_err());
    }

    #[test]
    fn test_extract_path_variants() {
        let value = json!({"a": {"b": [10, {"c": "deep"}]}});
        assert_eq!(extract_path(&value, "a/b/0").unwrap(), json!(10));
        assert_eq!(extract_path(&value, "a.b.1.c").unwrap(), json!("deep"));
        assert!(extract_path(&value, "a/missing").unwrap_err().is_not_found());
        assert!(extract_path(&value, "a/b/x").is_err());
    }

    #[test]
    fn test_apply_patches() {
        let ops = PatchOp::parse_all(["replace price=42.0#float", "remove deprecated"]).unwrap();
        let out = apply_patches(
            json!({"price": 1, "deprecated": true, "name": "x"}),
            &ops,
        )
        .unwrap();
        assert_eq!(out, json!({"price": 42.0, "name": "x"}));

        assert!(apply_patches(json!([1, 2]), &ops).is_err());
    }
}
