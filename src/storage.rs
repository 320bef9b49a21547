// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Local persistence of control values.
//!
//! Virtual devices keep their state across driver restarts. The broker's
//! retained topics are the primary source; a [`ValueStorage`] lets a driver
//! additionally survive broker resets. Controls opt in through their
//! `load_previous` flag; the driver stores every confirmed value and seeds
//! fresh controls from the stored one when no explicit value was given.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{DriverError, Result};

/// Persistent store for raw control values, keyed by device and control id.
pub trait ValueStorage: Send + Sync {
    /// Returns the stored raw value, or `None` if nothing is stored.
    fn load(&self, device_id: &str, control_id: &str) -> Result<Option<String>>;

    /// Stores `raw_value` for the control.
    fn store(&self, device_id: &str, control_id: &str, raw_value: &str) -> Result<()>;

    /// Forgets the stored value for the control, if any.
    fn remove(&self, device_id: &str, control_id: &str) -> Result<()>;

    /// Forgets every stored value of the device.
    fn remove_device(&self, device_id: &str) -> Result<()>;
}

type ValueMap = BTreeMap<String, BTreeMap<String, String>>;

/// In-memory [`ValueStorage`]; values do not survive the process.
///
/// Useful in tests and for drivers that only rely on broker retention.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<ValueMap>,
}

impl MemoryStorage {
    /// Creates an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ValueStorage for MemoryStorage {
    fn load(&self, device_id: &str, control_id: &str) -> Result<Option<String>> {
        Ok(self
            .values
            .lock()
            .get(device_id)
            .and_then(|controls| controls.get(control_id))
            .cloned())
    }

    fn store(&self, device_id: &str, control_id: &str, raw_value: &str) -> Result<()> {
        self.values
            .lock()
            .entry(device_id.to_string())
            .or_default()
            .insert(control_id.to_string(), raw_value.to_string());
        Ok(())
    }

    fn remove(&self, device_id: &str, control_id: &str) -> Result<()> {
        let mut values = self.values.lock();
        if let Some(controls) = values.get_mut(device_id) {
            controls.remove(control_id);
            if controls.is_empty() {
                values.remove(device_id);
            }
        }
        Ok(())
    }

    fn remove_device(&self, device_id: &str) -> Result<()> {
        self.values.lock().remove(device_id);
        Ok(())
    }
}

/// File-backed [`ValueStorage`] holding all values in one JSON document.
///
/// The whole document is rewritten on every mutation; the value set of a
/// driver is small, so this keeps the format trivially inspectable.
#[derive(Debug)]
pub struct JsonFileStorage {
    path: PathBuf,
    values: Mutex<ValueMap>,
}

impl JsonFileStorage {
    /// Opens the storage at `path`, loading existing values.
    ///
    /// A missing file starts empty. A file that exists but does not parse
    /// is treated as empty and overwritten on the next store.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(values) => values,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "value storage file is not valid JSON, starting empty"
                    );
                    ValueMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => ValueMap::new(),
            Err(e) => {
                return Err(DriverError::Storage(format!(
                    "failed to read {}: {e}",
                    path.display()
                ))
                .into());
            }
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Returns the file path the storage persists to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &ValueMap) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| {
                DriverError::Storage(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let contents = serde_json::to_string_pretty(values)
            .map_err(|e| DriverError::Storage(e.to_string()))?;
        fs::write(&self.path, contents).map_err(|e| {
            DriverError::Storage(format!("failed to write {}: {e}", self.path.display()))
        })?;
        Ok(())
    }
}

impl ValueStorage for JsonFileStorage {
    fn load(&self, device_id: &str, control_id: &str) -> Result<Option<String>> {
        Ok(self
            .values
            .lock()
            .get(device_id)
            .and_then(|controls| controls.get(control_id))
            .cloned())
    }

    fn store(&self, device_id: &str, control_id: &str, raw_value: &str) -> Result<()> {
        let mut values = self.values.lock();
        values
            .entry(device_id.to_string())
            .or_default()
            .insert(control_id.to_string(), raw_value.to_string());
        self.persist(&values)
    }

    fn remove(&self, device_id: &str, control_id: &str) -> Result<()> {
        let mut values = self.values.lock();
        if let Some(controls) = values.get_mut(device_id) {
            controls.remove(control_id);
            if controls.is_empty() {
                values.remove(device_id);
            }
            self.persist(&values)?;
        }
        Ok(())
    }

    fn remove_device(&self, device_id: &str) -> Result<()> {
        let mut values = self.values.lock();
        if values.remove(device_id).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.load("dev", "ctl").unwrap(), None);

        storage.store("dev", "ctl", "21.5").unwrap();
        assert_eq!(storage.load("dev", "ctl").unwrap(), Some("21.5".to_string()));

        storage.remove("dev", "ctl").unwrap();
        assert_eq!(storage.load("dev", "ctl").unwrap(), None);
    }

    #[test]
    fn memory_storage_remove_device_drops_all_controls() {
        let storage = MemoryStorage::new();
        storage.store("dev", "a", "1").unwrap();
        storage.store("dev", "b", "2").unwrap();
        storage.store("other", "a", "3").unwrap();

        storage.remove_device("dev").unwrap();
        assert_eq!(storage.load("dev", "a").unwrap(), None);
        assert_eq!(storage.load("dev", "b").unwrap(), None);
        assert_eq!(storage.load("other", "a").unwrap(), Some("3".to_string()));
    }

    #[test]
    fn json_file_storage_survives_reopen() {
        let path = std::env::temp_dir().join(format!(
            "mqttconv-storage-test-{}.json",
            std::process::id()
        ));
        let _ = fs::remove_file(&path);

        {
            let storage = JsonFileStorage::open(&path).unwrap();
            storage.store("dev", "ctl", "42").unwrap();
        }
        {
            let storage = JsonFileStorage::open(&path).unwrap();
            assert_eq!(storage.load("dev", "ctl").unwrap(), Some("42".to_string()));
            storage.remove_device("dev").unwrap();
        }
        {
            let storage = JsonFileStorage::open(&path).unwrap();
            assert_eq!(storage.load("dev", "ctl").unwrap(), None);
        }

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_starts_empty() {
        let path = std::env::temp_dir().join(format!(
            "mqttconv-storage-missing-{}.json",
            std::process::id()
        ));
        let _ = fs::remove_file(&path);
        let storage = JsonFileStorage::open(&path).unwrap();
        assert_eq!(storage.load("x", "y").unwrap(), None);
    }
}
