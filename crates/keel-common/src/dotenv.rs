//! Local dotenv ingestion for adhoc environments

use std::collections::BTreeMap;
use std::path::Path;

use tracing::debug;

use crate::hash::content_hash;
use crate::{Error, Result};

/// Parsed dotenv file with a checksum of its raw content
#[derive(Clone, Debug, PartialEq)]
pub struct DotenvFile {
    /// Parsed key/value pairs
    pub values: BTreeMap<String, String>,
    /// Checksum of the raw file bytes
    pub checksum: String,
}

/// Read a dotenv file. Returns `None` when the file does not exist.
pub fn read_dotenv(path: impl AsRef<Path>) -> Result<Option<DotenvFile>> {
    let path = path.as_ref();
    let shown = path.display().to_string();

    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %shown, "no dotenv file");
            return Ok(None);
        }
        Err(e) => return Err(Error::io(shown, e)),
    };

    let iter = dotenvy::from_read_iter(raw.as_slice());
    let mut values = BTreeMap::new();
    for item in iter {
        let (k, v) = item.map_err(|e| Error::config("dotenv", format!("{}: {}", shown, e)))?;
        values.insert(k, v);
    }

    Ok(Some(DotenvFile {
        values,
        checksum: content_hash(&raw),
    }))
}
