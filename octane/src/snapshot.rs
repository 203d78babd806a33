//! On-disk snapshots: lz4-framed bincode of the particle state.

use crate::error::Result;
use crate::part::{GPart, Part, SPart};
use crate::space::{Space, SpaceParams};
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// A complete dump of the particle state at one instant.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Snapshot {
    /// Periodic box size.
    pub dim: [f64; 3],
    /// Physical time of the dump.
    pub time: f64,
    /// Gas particles.
    pub parts: Vec<Part>,
    /// Gravity particles.
    pub gparts: Vec<GPart>,
    /// Star particles.
    pub sparts: Vec<SPart>,
}

impl Snapshot {
    /// Captures the particle state of `space`.
    #[must_use]
    pub fn from_space(space: &mut Space, time: f64) -> Self {
        Self {
            dim: space.dim,
            time,
            parts: space.parts.as_mut_slice().to_vec(),
            gparts: space.gparts.as_mut_slice().to_vec(),
            sparts: space.sparts.as_mut_slice().to_vec(),
        }
    }

    /// Rebuilds a space from the snapshot. The tree is not part of the
    /// dump; call [`Space::rebuild`] afterwards.
    #[must_use]
    pub fn into_space(self, params: SpaceParams) -> Space {
        Space::with_particles(self.dim, params, self.parts, self.gparts, self.sparts)
    }

    /// Writes the snapshot, lz4-compressed.
    pub fn write(&self, writer: impl Write) -> Result<()> {
        let mut encoder = FrameEncoder::new(writer);
        bincode::serialize_into(&mut encoder, self)?;
        encoder
            .finish()
            .map_err(|err| crate::error::Error::General(err.to_string()))?;
        Ok(())
    }

    /// Reads a snapshot written by [`Self::write`].
    pub fn read(reader: impl Read) -> Result<Self> {
        let decoder = FrameDecoder::new(reader);
        Ok(bincode::deserialize_from(decoder)?)
    }

    /// Writes the snapshot to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.write(BufWriter::new(File::create(path)?))
    }

    /// Reads a snapshot from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::read(BufReader::new(File::open(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::Part;

    #[test]
    fn round_trip_through_bytes() {
        let snapshot = Snapshot {
            dim: [4.0; 3],
            time: 0.125,
            parts: vec![Part::at([1.0, 2.0, 3.0], 0.1, 1.5)],
            gparts: Vec::new(),
            sparts: Vec::new(),
        };
        let mut bytes = Vec::new();
        snapshot.write(&mut bytes).unwrap();
        let back = Snapshot::read(bytes.as_slice()).unwrap();
        assert_eq!(back.dim, snapshot.dim);
        assert_eq!(back.time, snapshot.time);
        assert_eq!(back.parts.len(), 1);
        assert_eq!(back.parts[0].x, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.oct");
        let snapshot = Snapshot {
            dim: [2.0; 3],
            time: 0.0,
            parts: (0..100)
                .map(|i| Part::at([f64::from(i) * 0.01, 0.5, 0.5], 0.05, 1.0))
                .collect(),
            gparts: Vec::new(),
            sparts: Vec::new(),
        };
        snapshot.save(&path).unwrap();
        let back = Snapshot::load(&path).unwrap();
        assert_eq!(back.parts.len(), 100);
    }
}
