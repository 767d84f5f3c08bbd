//! File-backed typed key/value store.
//!
//! One directory per record, one file per key. Each file holds a single
//! JSON-encoded, type-tagged scalar. Writes go to a hidden temporary file in
//! the same directory that is then renamed over the key, so readers in any
//! process see either the old value or the new one, never a torn write.
//!
//! Keys are flat strings; dots give them a hierarchy (`group.g1`,
//! `_alloc.queue.<...>`) which only matters for removal: removing `a.b`
//! also removes every `a.b.*`.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::{AllocResult, AllocatorError};

/// Longest key accepted (a file name on most filesystems).
pub const KEY_LEN_MAX: usize = 255;

/// Scalar stored under a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point.
    Float(f64),
    /// String.
    Str(String),
}

impl Value {
    /// The string, if this is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The integer, if this is one.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The boolean, if this is one.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// On-disk form: the type travels with the value so `"1"` and `1` never
/// get confused when read back.
#[derive(Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
enum Tagged {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<Value> for Tagged {
    fn from(v: Value) -> Self {
        match v {
            Value::Bool(b) => Self::Bool(b),
            Value::Int(i) => Self::Int(i),
            Value::Float(f) => Self::Float(f),
            Value::Str(s) => Self::Str(s),
        }
    }
}

impl From<Tagged> for Value {
    fn from(v: Tagged) -> Self {
        match v {
            Tagged::Bool(b) => Self::Bool(b),
            Tagged::Int(i) => Self::Int(i),
            Tagged::Float(f) => Self::Float(f),
            Tagged::Str(s) => Self::Str(s),
        }
    }
}

/// Handle over one fsdb directory. Cheap to clone; holds no open files.
#[derive(Debug, Clone)]
pub struct Fsdb {
    location: PathBuf,
}

impl Fsdb {
    /// Open a store, creating its directory if needed.
    pub fn open(location: impl AsRef<Path>) -> AllocResult<Self> {
        let location = location.as_ref().to_path_buf();
        fs::create_dir_all(&location)?;
        Ok(Self { location })
    }

    /// Attach to a store whose directory must already exist.
    pub fn attach(location: impl AsRef<Path>) -> AllocResult<Self> {
        let location = location.as_ref().to_path_buf();
        if !location.is_dir() {
            return Err(AllocatorError::Invalid(format!(
                "{}: no such record",
                location.display()
            )));
        }
        Ok(Self { location })
    }

    /// Directory backing this store.
    #[must_use]
    pub fn location(&self) -> &Path {
        &self.location
    }

    fn key_path(&self, key: &str) -> AllocResult<PathBuf> {
        if !is_valid_key(key) {
            return Err(AllocatorError::InvalidKey(key.to_owned()));
        }
        Ok(self.location.join(key))
    }

    /// Set `key` to `value`; `None` removes the key and all its descendants.
    pub fn set(&self, key: &str, value: Option<Value>) -> AllocResult<()> {
        match value {
            Some(value) => self.write(key, value),
            None => self.remove(key),
        }
    }

    /// Set `key` to anything convertible into a [`Value`].
    pub fn put(&self, key: &str, value: impl Into<Value>) -> AllocResult<()> {
        self.write(key, value.into())
    }

    fn write(&self, key: &str, value: Value) -> AllocResult<()> {
        let path = self.key_path(key)?;
        let encoded = serde_json::to_vec(&Tagged::from(value))?;
        let tmp = self.location.join(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
        let written = (|| -> std::io::Result<()> {
            let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        })();
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    /// Remove `key` and every `key.*` below it. Missing keys are fine.
    pub fn remove(&self, key: &str) -> AllocResult<()> {
        let path = self.key_path(key)?;
        remove_if_present(&path)?;
        for child in self.keys(&format!("{key}.*"))? {
            remove_if_present(&self.location.join(child))?;
        }
        Ok(())
    }

    /// Read `key`; `None` if it is not set.
    pub fn get(&self, key: &str) -> AllocResult<Option<Value>> {
        let path = self.key_path(key)?;
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let tagged: Tagged =
            serde_json::from_slice(&raw).map_err(|e| AllocatorError::Corrupt {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(Some(tagged.into()))
    }

    /// Read a string key.
    pub fn get_str(&self, key: &str) -> AllocResult<Option<String>> {
        match self.get(key)? {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s)),
            Some(other) => Err(type_mismatch(key, "string", &other)),
        }
    }

    /// Read an integer key.
    pub fn get_int(&self, key: &str) -> AllocResult<Option<i64>> {
        match self.get(key)? {
            None => Ok(None),
            Some(Value::Int(i)) => Ok(Some(i)),
            Some(other) => Err(type_mismatch(key, "int", &other)),
        }
    }

    /// Read a boolean key.
    pub fn get_bool(&self, key: &str) -> AllocResult<Option<bool>> {
        match self.get(key)? {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(b)),
            Some(other) => Err(type_mismatch(key, "bool", &other)),
        }
    }

    /// Keys matching a glob (`*`, `?`), sorted ascending.
    pub fn keys(&self, pattern: &str) -> AllocResult<Vec<String>> {
        let entries = match fs::read_dir(&self.location) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(AllocatorError::Invalid(format!(
                    "{}: no such record",
                    self.location.display()
                )))
            }
            Err(err) => return Err(err.into()),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') || !entry.file_type()?.is_file() {
                continue;
            }
            if glob_match(pattern.as_bytes(), name.as_bytes()) {
                keys.push(name);
            }
        }
        keys.sort_unstable();
        Ok(keys)
    }

    /// `(key, value)` pairs for keys matching `pattern`, sorted by key.
    ///
    /// Keys that vanish or fail to decode between listing and reading are
    /// skipped; the former is a concurrent removal, the latter is logged.
    pub fn entries(&self, pattern: &str) -> AllocResult<Vec<(String, Value)>> {
        let mut out = Vec::new();
        for key in self.keys(pattern)? {
            match self.get(&key) {
                Ok(Some(value)) => out.push((key, value)),
                Ok(None) => {}
                Err(AllocatorError::Corrupt { key, reason }) => {
                    tracing::warn!(record = %self.location.display(), %key, %reason, "skipping corrupt fsdb entry");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }
}

fn type_mismatch(key: &str, expected: &str, got: &Value) -> AllocatorError {
    AllocatorError::Corrupt {
        key: key.to_owned(),
        reason: format!("expected {expected}, found {got:?}"),
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// True if `key` can be stored as a plain file name inside the record.
#[must_use]
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= KEY_LEN_MAX
        && !key.starts_with('.')
        && !key.contains(['/', '\\', '\0'])
}

/// Shell-style wildcard match supporting `*` and `?`.
#[must_use]
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}
