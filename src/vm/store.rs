//! VM record store: one directory per VM under the `vms` root, each holding
//! a `vm.json` document.
//!
//! Writes go to a temporary file in the same directory and are renamed over
//! `vm.json`, so a concurrent reader (another CLI invocation) sees either the
//! old or the new record, never a partial one.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, VirtError};
use crate::vm::record::{VmRecord, validate_name};

pub const RECORD_FILENAME: &str = "vm.json";

#[derive(Debug, Clone)]
pub struct RecordStore {
    root: PathBuf,
}

impl RecordStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory owned by the VM called `name`.
    pub fn vm_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join(RECORD_FILENAME)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.record_path(name).is_file()
    }

    pub fn load(&self, name: &str) -> Result<VmRecord> {
        validate_name(name)?;
        let path = self.record_path(name);
        let content = match std::fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VirtError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let record: VmRecord = serde_json::from_slice(&content).map_err(|e| {
            VirtError::CorruptState { path: path.clone(), reason: e.to_string() }
        })?;
        if record.name != name {
            return Err(VirtError::CorruptState {
                path,
                reason: format!("record names VM {:?}", record.name),
            });
        }
        Ok(record)
    }

    /// Atomically replace the record file.
    pub fn save(&self, record: &VmRecord) -> Result<()> {
        let tmp = self.stage(record)?;
        tmp.persist(self.record_path(&record.name)).map_err(|e| e.error)?;
        debug!(vm = %record.name, status = %record.status, "record saved");
        Ok(())
    }

    /// Write a brand-new record, refusing to replace an existing one.
    ///
    /// The final link is made without clobbering, so of two concurrent
    /// creates for the same name exactly one wins.
    pub fn create(&self, record: &VmRecord) -> Result<()> {
        validate_name(&record.name)?;
        if self.exists(&record.name) {
            return Err(VirtError::AlreadyExists(record.name.clone()));
        }
        let tmp = self.stage(record)?;
        match tmp.persist_noclobber(self.record_path(&record.name)) {
            Ok(_) => {
                debug!(vm = %record.name, "record created");
                Ok(())
            }
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(VirtError::AlreadyExists(record.name.clone()))
            }
            Err(e) => Err(e.error.into()),
        }
    }

    /// Serialize `record` into a synced temporary file inside its VM directory.
    fn stage(&self, record: &VmRecord) -> Result<tempfile::NamedTempFile> {
        validate_name(&record.name)?;
        let dir = self.vm_dir(&record.name);
        std::fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, record)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    }

    /// Names of every VM directory holding a loadable record.
    ///
    /// Corrupt records are logged and left out rather than failing the list.
    pub fn list(&self) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_name(&name).is_err() || !self.exists(&name) {
                continue;
            }
            match self.load(&name) {
                Ok(_) => {
                    names.insert(name);
                }
                Err(e) => warn!(vm = %name, error = %e, "skipping unreadable VM record"),
            }
        }
        Ok(names)
    }

    /// Remove the VM directory and everything in it.
    pub fn delete(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        if !self.exists(name) {
            return Err(VirtError::NotFound(name.to_string()));
        }
        std::fs::remove_dir_all(self.vm_dir(name))?;
        Ok(())
    }
}
