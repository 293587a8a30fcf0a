//! Versioned binary snapshots of engine weights.
//!
//! Engines never persist anything themselves; callers save and restore
//! weights through [`Checkpointable`]. Every snapshot starts with a version
//! header so files written by an incompatible schema are rejected on load.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Schema version written into every snapshot.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Errors that can occur while saving or loading checkpoints.
#[derive(Debug)]
pub enum CheckpointError {
    /// Underlying I/O failure while reading or writing checkpoint files.
    Io(std::io::Error),
    /// Serialization or deserialization error from the binary codec.
    Serialization(bincode::Error),
    /// The file was well formed but written by another schema version.
    VersionMismatch { expected: u32, found: u32 },
    /// The decoded weights are internally inconsistent.
    InvalidFormat(String),
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointError::Io(err) => write!(f, "I/O error while accessing checkpoint: {err}"),
            CheckpointError::Serialization(err) => {
                write!(f, "Failed to (de)serialize checkpoint payload: {err}")
            }
            CheckpointError::VersionMismatch { expected, found } => write!(
                f,
                "Checkpoint version mismatch: expected {expected}, found {found}",
            ),
            CheckpointError::InvalidFormat(msg) => {
                write!(f, "Checkpoint file has invalid structure: {msg}")
            }
        }
    }
}

impl std::error::Error for CheckpointError {}

impl From<std::io::Error> for CheckpointError {
    fn from(err: std::io::Error) -> Self {
        CheckpointError::Io(err)
    }
}

impl From<bincode::Error> for CheckpointError {
    fn from(err: bincode::Error) -> Self {
        CheckpointError::Serialization(err)
    }
}

impl From<EngineError> for CheckpointError {
    fn from(err: EngineError) -> Self {
        CheckpointError::InvalidFormat(err.to_string())
    }
}

/// Deterministic binary codec options shared by all checkpoint implementations.
fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_little_endian()
}

/// Version header plus payload.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Snapshot<T> {
    pub version: u32,
    pub payload: T,
}

impl<T> Snapshot<T> {
    pub(crate) fn current(payload: T) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            payload,
        }
    }

    /// Unwrap the payload, rejecting foreign schema versions.
    pub(crate) fn into_payload(self) -> Result<T, CheckpointError> {
        if self.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::VersionMismatch {
                expected: CHECKPOINT_VERSION,
                found: self.version,
            });
        }
        Ok(self.payload)
    }
}

/// Components that support deterministic persistence implement this trait.
pub trait Checkpointable: Sized {
    /// Save the current state to `path` using the deterministic codec.
    fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<(), CheckpointError>;

    /// Load a state from `path`.
    fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Self, CheckpointError>;

    /// Utility for writing a serializable snapshot with the shared codec.
    fn write_snapshot<P, T>(snapshot: &T, path: P) -> Result<(), CheckpointError>
    where
        P: AsRef<Path>,
        T: Serialize,
    {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        codec().serialize_into(&mut writer, snapshot)?;
        writer.flush()?;
        Ok(())
    }

    /// Utility for reading a serializable snapshot with the shared codec.
    fn read_snapshot<P, T>(path: P) -> Result<T, CheckpointError>
    where
        P: AsRef<Path>,
        T: serde::de::DeserializeOwned,
    {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        Ok(codec().deserialize_from(&mut reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Fixture {
        values: Vec<f64>,
    }

    impl Checkpointable for Fixture {
        fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<(), CheckpointError> {
            Self::write_snapshot(&Snapshot::current(&self.values), path)
        }

        fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Self, CheckpointError> {
            let snapshot: Snapshot<Vec<f64>> = Self::read_snapshot(path)?;
            Ok(Fixture {
                values: snapshot.into_payload()?,
            })
        }
    }

    fn scratch_path(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("cogstate_checkpoint_{}_{}.bin", name, std::process::id()));
        path
    }

    #[test]
    fn roundtrip_preserves_values() {
        let path = scratch_path("roundtrip");
        let fixture = Fixture {
            values: vec![1.5, -0.25, f64::INFINITY],
        };
        fixture.save_checkpoint(&path).expect("save");
        let restored = Fixture::load_checkpoint(&path).expect("load");
        std::fs::remove_file(&path).ok();
        assert_eq!(restored, fixture);
    }

    #[test]
    fn foreign_version_is_rejected() {
        let path = scratch_path("version");
        let snapshot = Snapshot {
            version: CHECKPOINT_VERSION + 1,
            payload: vec![0.0_f64],
        };
        Fixture::write_snapshot(&snapshot, &path).expect("write");
        let err = Fixture::load_checkpoint(&path).expect_err("version mismatch");
        std::fs::remove_file(&path).ok();
        assert!(matches!(
            err,
            CheckpointError::VersionMismatch { expected, found }
                if expected == CHECKPOINT_VERSION && found == CHECKPOINT_VERSION + 1
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Fixture::load_checkpoint(scratch_path("missing")).expect_err("missing");
        assert!(matches!(err, CheckpointError::Io(_)));
    }
}
