//! Single-file JSON backend: the whole map is rewritten on each commit via
//! temp-file + fsync + rename, so a crash leaves either the old or the new map.
//!
//! Intended for one process per file; cross-process sharing needs the SQLite
//! backend.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::core::errors::{BeaconError, Result};
use crate::store::backend::{
    Expectation, Mutation, StorageBackend, apply_to_map, first_conflict,
};

/// File-backed key/value map with atomic whole-file commits.
#[derive(Debug)]
pub struct JsonFileBackend {
    path: PathBuf,
    map: Mutex<BTreeMap<String, String>>,
}

impl JsonFileBackend {
    /// Open (or lazily create) the store at `path`.
    ///
    /// A corrupt file is moved aside to `<path>.corrupt` and the store starts
    /// empty rather than failing.
    pub fn open(path: &Path) -> Result<Self> {
        let map = if path.exists() {
            let raw = fs::read_to_string(path).map_err(|source| BeaconError::io(path, source))?;
            match serde_json::from_str::<BTreeMap<String, String>>(&raw) {
                Ok(map) => map,
                Err(e) => {
                    let aside = path.with_extension("json.corrupt");
                    eprintln!(
                        "[UMB-STORE] corrupt store {} ({e}); moving to {}",
                        path.display(),
                        aside.display()
                    );
                    let _ = fs::rename(path, &aside);
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            map: Mutex::new(map),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for JsonFileBackend {
    fn name(&self) -> &'static str {
        "json"
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn commit(&self, expected: &[Expectation], mutations: &[Mutation]) -> Result<()> {
        let mut map = self.map.lock();
        if let Some(key) = first_conflict(expected, |k| Ok(map.get(k).cloned()))? {
            return Err(BeaconError::StoreConflict { key });
        }
        if mutations.is_empty() {
            return Ok(());
        }
        let mut next = map.clone();
        apply_to_map(&mut next, mutations);
        write_atomic(&self.path, &next)?;
        *map = next;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.map.lock().keys().cloned().collect())
    }
}

fn write_atomic(path: &Path, map: &BTreeMap<String, String>) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| BeaconError::io(parent, source))?;
    }

    let json = serde_json::to_vec_pretty(map)?;

    let result = (|| {
        {
            let mut opts = OpenOptions::new();
            opts.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt as _;
                opts.mode(0o600);
            }
            let mut file = opts.open(&tmp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)
    })();

    if let Err(source) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(BeaconError::io(path, source));
    }
    Ok(())
}
