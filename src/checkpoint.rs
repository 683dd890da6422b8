//! Checkpoints on disk: a directory holding the compressed machine state and
//! a JSON metadata record
//!
//! ```text
//! {root}/
//! \- {name}/
//!    |- machine.state.zst
//!    \- metadata.json
//! ```
use crate::{Error, Machine, RegionTracker, Result, RunState};
use chrono::Local;
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufWriter, ErrorKind, Read, Write},
    path::{Path, PathBuf},
};

pub const CHECKPOINT_VERSION: u32 = 1;
const METADATA_FILE: &str = "metadata.json";
const STATE_FILE: &str = "machine.state.zst";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointMetadata {
    pub version: u32,
    /// memory size in bytes at save time
    pub memory_size: u64,
    pub core_count: usize,
    /// region a restore resumes into
    pub region_id: Option<String>,
    /// target within that region
    pub target_index: usize,
    pub warmed_up: bool,
    pub run_state: RunState,
    /// local time of capture, RFC 3339
    pub created: String,
}

impl CheckpointMetadata {
    pub fn new(memory_size: u64, core_count: usize, run_state: RunState) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            memory_size,
            core_count,
            region_id: None,
            target_index: run_state.target_index,
            warmed_up: run_state.warmed_up,
            run_state,
            created: Local::now().to_rfc3339(),
        }
    }

    /// Describe the machine and the tracker position right now
    pub fn capture(machine: &dyn Machine, tracker: &RegionTracker) -> Self {
        let mut metadata = Self::new(machine.memory_size(), machine.core_count(), *tracker.state());
        metadata.region_id = tracker.current_region().map(|region| region.id.clone());
        metadata
    }

    /// Resume at the first target of `region_id`
    pub fn starting_region(mut self, region_id: &str) -> Self {
        self.region_id = Some(region_id.to_string());
        self.target_index = 0;
        self.warmed_up = false;
        self
    }

    /// Fails when the checkpoint needs more than the target offers
    pub fn check_compatible(&self, path: &Path, memory_size: u64, core_count: usize) -> Result<()> {
        if self.memory_size > memory_size || self.core_count > core_count {
            return Err(Error::IncompatibleCheckpoint {
                path: path.to_path_buf(),
                checkpoint_memory: self.memory_size,
                checkpoint_cores: self.core_count,
                target_memory: memory_size,
                target_cores: core_count,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub path: PathBuf,
    pub metadata: CheckpointMetadata,
    pub state: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative names live under the root, absolute paths are taken as is
    pub fn path_for<P: AsRef<Path>>(&self, name: P) -> PathBuf {
        self.root.join(name)
    }

    /// Write a checkpoint and publish it with a single rename, so a crash
    /// mid-write never leaves something that looks complete
    pub fn save<P: AsRef<Path>>(
        &self,
        name: P,
        state: &[u8],
        metadata: &CheckpointMetadata,
    ) -> Result<PathBuf> {
        let dest = self.path_for(name);
        let parent = dest
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let io_err = |source| Error::checkpoint_io(&dest, source);

        if dest.exists() {
            return Err(io_err(std::io::Error::new(
                ErrorKind::AlreadyExists,
                "checkpoints are never overwritten",
            )));
        }
        std::fs::create_dir_all(&parent).map_err(io_err)?;

        // staging directory next to the destination so the rename stays on
        // one filesystem
        let staging = tempfile::Builder::new()
            .prefix(".partial-")
            .tempdir_in(&parent)
            .map_err(io_err)?;

        let file = File::create(staging.path().join(STATE_FILE)).map_err(io_err)?;
        let mut encoder = zstd::Encoder::new(BufWriter::new(file), 0).map_err(io_err)?;
        encoder.write_all(state).map_err(io_err)?;
        let writer = encoder.finish().map_err(io_err)?;
        let file = writer.into_inner().map_err(|err| io_err(err.into_error()))?;
        file.sync_all().map_err(io_err)?;

        let content = serde_json::to_vec_pretty(metadata).map_err(|err| io_err(err.into()))?;
        let mut file = File::create(staging.path().join(METADATA_FILE)).map_err(io_err)?;
        file.write_all(&content).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        std::fs::rename(staging.path(), &dest).map_err(io_err)?;
        // already moved into place, nothing left to clean up
        let _ = staging.keep();

        info!(
            "Saved checkpoint {} ({} bytes of state)",
            dest.display(),
            state.len()
        );
        Ok(dest)
    }

    pub fn read_metadata<P: AsRef<Path>>(&self, name: P) -> Result<CheckpointMetadata> {
        self.metadata_at(&self.path_for(name))
    }

    fn metadata_at(&self, path: &Path) -> Result<CheckpointMetadata> {
        let io_err = |source| Error::checkpoint_io(path, source);
        let content = std::fs::read(path.join(METADATA_FILE)).map_err(io_err)?;
        let metadata: CheckpointMetadata =
            serde_json::from_slice(&content).map_err(|err| io_err(err.into()))?;
        if metadata.version != CHECKPOINT_VERSION {
            return Err(io_err(std::io::Error::new(
                ErrorKind::InvalidData,
                format!(
                    "checkpoint version {} is not supported, expected {}",
                    metadata.version, CHECKPOINT_VERSION
                ),
            )));
        }
        Ok(metadata)
    }

    fn read_state(&self, path: &Path) -> Result<Vec<u8>> {
        let io_err = |source| Error::checkpoint_io(path, source);
        let file = File::open(path.join(STATE_FILE)).map_err(io_err)?;
        let mut decoder = zstd::Decoder::new(file).map_err(io_err)?;
        let mut state = vec![];
        decoder.read_to_end(&mut state).map_err(io_err)?;
        Ok(state)
    }

    /// Read a checkpoint back without applying it
    pub fn restore<P: AsRef<Path>>(&self, name: P) -> Result<Checkpoint> {
        let path = self.path_for(name);
        let metadata = self.metadata_at(&path)?;
        let state = self.read_state(&path)?;
        Ok(Checkpoint {
            path,
            metadata,
            state,
        })
    }

    /// Validate against the machine, then load the state into it.
    ///
    /// Compatibility is checked from the metadata alone, before the state is
    /// even read, so a rejected checkpoint leaves the machine as it was.
    pub fn restore_into<P: AsRef<Path>>(
        &self,
        name: P,
        machine: &mut dyn Machine,
    ) -> Result<CheckpointMetadata> {
        let path = self.path_for(name);
        let metadata = self.metadata_at(&path)?;
        metadata.check_compatible(&path, machine.memory_size(), machine.core_count())?;
        let state = self.read_state(&path)?;
        machine
            .load_machine_state(&state)
            .map_err(|source| Error::checkpoint_io(&path, source))?;
        info!(
            "Restored checkpoint {} taken {}",
            path.display(),
            metadata.created
        );
        Ok(metadata)
    }
}
