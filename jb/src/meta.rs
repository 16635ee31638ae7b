//! Filename metadata codec
//!
//! A queue entry can carry a small mapping of scalars in its own file name,
//! stored as a YAML flow mapping just before the extension:
//!
//! ```text
//! report{repeat: 2}.csv
//! ^^^^^^^^^^^^^^^^^ ^^^^
//! base + meta       extension
//! ```
//!
//! The job environment uses this to count how often an entry has been put
//! back on the pending queue, without keeping any state outside the file
//! system.
//!
//! Limitation: keys and string values may not contain `{`, because the
//! decoder finds the start of the mapping by scanning backwards for the last
//! opening brace. `/` and control characters are rejected as well since they
//! cannot live in a file name. [`FileMeta::encode`] refuses such values rather
//! than writing a name that would not decode.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{JobError, JobResult};

/// Metadata key holding the requeue counter
pub const REPEAT_KEY: &str = "repeat";

/// Decoded metadata, kept sorted so encoding is stable
pub type MetaMap = BTreeMap<String, MetaValue>;

/// A scalar metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        MetaValue::Bool(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Int(value)
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        MetaValue::Float(value)
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Str(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::Str(value)
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Bool(b) => write!(f, "{}", b),
            MetaValue::Int(n) => write!(f, "{}", n),
            MetaValue::Float(x) => f.write_str(&format_float(*x)),
            MetaValue::Str(s) => f.write_str(&format_str(s)),
        }
    }
}

/// A file path split into its directory, base name, metadata and extension
#[derive(Debug, Clone, PartialEq)]
pub struct FileMeta {
    /// Parent directory (empty for a bare file name)
    pub directory: PathBuf,
    /// File name without metadata and extension
    pub base: String,
    /// Extension including the leading dot, or empty
    pub extension: String,
    /// The bracketed metadata text as it appears in the name, or empty
    pub meta_string: String,
    /// Decoded metadata
    pub meta: MetaMap,
}

impl FileMeta {
    /// Split a path and decode the metadata in its file name
    ///
    /// A name whose stem does not end in `}` has no metadata. A stem that
    /// does end in `}` must hold a valid flow mapping of scalars, otherwise
    /// this fails with [`JobError::MalformedMetadata`].
    pub fn decode(path: impl AsRef<Path>) -> JobResult<Self> {
        let path = path.as_ref();
        let directory = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let name = match path.file_name() {
            None => String::new(),
            Some(name) => name
                .to_str()
                .ok_or_else(|| JobError::NonUtf8Name(path.to_path_buf()))?
                .to_string(),
        };
        let (stem, extension) = split_extension(&name);

        let (base, meta_string, meta) = if stem.ends_with('}') {
            let open = stem
                .rfind('{')
                .ok_or_else(|| JobError::malformed(&name, "closing '}' without an opening '{'"))?;
            let meta_string = &stem[open..];
            let meta = parse_meta(&name, meta_string)?;
            (stem[..open].to_string(), meta_string.to_string(), meta)
        } else {
            (stem.to_string(), String::new(), MetaMap::new())
        };

        debug!(%name, %base, %meta_string, "FileMeta::decode");
        Ok(Self {
            directory,
            base,
            extension: extension.to_string(),
            meta_string,
            meta,
        })
    }

    /// Merge `overrides` onto the current metadata and rebuild the name
    pub fn encode(&self, overrides: &MetaMap) -> JobResult<FileMeta> {
        let mut meta = self.meta.clone();
        meta.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        let meta_string = format_meta(&self.base, &meta)?;
        Ok(FileMeta {
            directory: self.directory.clone(),
            base: self.base.clone(),
            extension: self.extension.clone(),
            meta_string,
            meta,
        })
    }

    /// The file name: `base{meta}extension`
    pub fn file_name(&self) -> String {
        format!("{}{}{}", self.base, self.meta_string, self.extension)
    }

    /// The directory joined with the file name
    pub fn full_path(&self) -> PathBuf {
        self.directory.join(self.file_name())
    }

    /// Requeue counter, 0 when the name carries none
    pub fn repeat(&self) -> JobResult<i64> {
        match self.meta.get(REPEAT_KEY) {
            None => Ok(0),
            Some(MetaValue::Int(n)) => Ok(*n),
            Some(other) => Err(JobError::malformed(
                self.file_name(),
                format!("'{}' is not an integer: {}", REPEAT_KEY, other),
            )),
        }
    }
}

/// Split off the extension the way the platform convention does, except that
/// a candidate extension containing `}` belongs to the metadata instead
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(dot) if !name[..dot].chars().all(|c| c == '.') && !name[dot..].contains('}') => {
            (&name[..dot], &name[dot..])
        }
        _ => (name, ""),
    }
}

fn parse_meta(name: &str, meta_string: &str) -> JobResult<MetaMap> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(meta_string).map_err(|e| JobError::malformed(name, e.to_string()))?;
    if !value.is_mapping() {
        return Err(JobError::malformed(name, "metadata is not a mapping"));
    }
    serde_yaml::from_value(value).map_err(|e| JobError::malformed(name, format!("values must be scalars: {}", e)))
}

fn format_meta(name: &str, meta: &MetaMap) -> JobResult<String> {
    if meta.is_empty() {
        return Ok(String::new());
    }
    let mut parts = Vec::with_capacity(meta.len());
    for (key, value) in meta {
        check_representable(name, key)?;
        if let MetaValue::Str(s) = value {
            check_representable(name, s)?;
        }
        parts.push(format!("{}: {}", format_str(key), value));
    }
    Ok(format!("{{{}}}", parts.join(", ")))
}

fn check_representable(name: &str, text: &str) -> JobResult<()> {
    if let Some(bad) = text.chars().find(|c| *c == '{' || *c == '/' || c.is_control()) {
        return Err(JobError::malformed(
            name,
            format!("{:?} cannot be stored in a file name ({:?})", text, bad),
        ));
    }
    Ok(())
}

fn format_float(x: f64) -> String {
    if x.is_nan() {
        ".nan".to_string()
    } else if x.is_infinite() {
        let text = if x > 0.0 { ".inf" } else { "-.inf" };
        text.to_string()
    } else {
        format!("{:?}", x)
    }
}

/// Render a string as a plain scalar when it reads back unchanged, otherwise
/// single-quoted
fn format_str(s: &str) -> String {
    if is_plain_safe(s) {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "''"))
    }
}

fn is_plain_safe(s: &str) -> bool {
    let Some(first) = s.chars().next() else {
        return false;
    };
    if s.trim() != s || "-?:,[]{}#&*!|>'\"%@`~".contains(first) {
        return false;
    }
    if s.chars().any(|c| matches!(c, ',' | '[' | ']' | '{' | '}' | '#' | ':' | '\'' | '"')) {
        return false;
    }
    matches!(serde_yaml::from_str::<MetaValue>(s), Ok(MetaValue::Str(ref parsed)) if parsed == s)
}
