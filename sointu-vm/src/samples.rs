// sointu -- a modular synthesizer for size-restricted music
// Copyright (C) 2021  Fabian Thorand
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! The sample data of sample oscillators, taken from the General MIDI sound
//! bank that ships with Windows.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use once_cell::sync::Lazy;

/// Number of bytes read from gm.dls.
pub const SAMPLE_TABLE_SIZE: usize = 3_440_660;

static GLOBAL: Lazy<Arc<SampleTable>> = Lazy::new(|| Arc::new(SampleTable::load()));

/// Signed 16-bit little endian samples.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleTable {
    data: Vec<u8>,
}

impl SampleTable {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// The table loaded from gm.dls by the first call, shared by every synth
    /// in the process. Empty if no gm.dls was found.
    pub fn global() -> Arc<SampleTable> {
        Arc::clone(&GLOBAL)
    }

    /// Places gm.dls is looked for, in order.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("gm.dls")];
        if let Some(root) = std::env::var_os("SystemRoot") {
            let root = PathBuf::from(root);
            paths.push(root.join("system32").join("drivers").join("gm.dls"));
            paths.push(root.join("SysWOW64").join("drivers").join("gm.dls"));
        }
        paths
    }

    fn load() -> Self {
        for path in Self::search_paths() {
            match Self::read_file(&path) {
                Ok(table) => {
                    info!("Loaded samples from {}", path.display());
                    return table;
                }
                Err(err) => debug!("No samples at {}: {}", path.display(), err),
            }
        }
        debug!("gm.dls not found, sample oscillators will be silent");
        Self::default()
    }

    /// Read at most `SAMPLE_TABLE_SIZE` bytes of a file.
    pub fn read_file(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let mut data = Vec::new();
        file.take(SAMPLE_TABLE_SIZE as u64).read_to_end(&mut data)?;
        Ok(Self { data })
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The sample at a word index, scaled to [-1, 1]. Indices outside the
    /// table read as silence.
    pub fn read(&self, index: i64) -> f32 {
        if index < 0 {
            return 0.0;
        }
        let start = index as usize * 2;
        match self.data.get(start..start + 2) {
            Some(bytes) => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32767.0,
            None => 0.0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_read() {
        let table = SampleTable::from_bytes(vec![0xFF, 0x7F, 0x01, 0x80, 0x00]);
        assert_eq!(table.read(0), 1.0);
        assert_eq!(table.read(1), -1.0);
        // the odd byte at the end is not a sample
        assert_eq!(table.read(2), 0.0);
        assert_eq!(table.read(-1), 0.0);
        assert_eq!(SampleTable::default().read(0), 0.0);
    }

    #[test]
    fn test_read_file() {
        let dir = std::env::temp_dir().join(format!("sointu-samples-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("gm.dls");
        std::fs::write(&path, [0x00u8, 0x40]).unwrap();
        let table = SampleTable::read_file(&path).unwrap();
        assert_eq!(table.read(0), 16384.0 / 32767.0);
        std::fs::remove_dir_all(&dir).unwrap();
        assert!(SampleTable::read_file(&path).is_err());
    }
}
