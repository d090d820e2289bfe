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

//! Songs: a score of tracks played by a patch.

use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::patch::Patch;

/// Sample rate everything in sointu is rendered at.
pub const SAMPLE_RATE: usize = 44100;

/// Note byte releasing the current voice of a track.
pub const NOTE_RELEASE: u8 = 0;
/// Note byte keeping the current voice of a track as it is.
pub const NOTE_HOLD: u8 = 1;

/// Rows of notes of one track. Rows beyond the end read as hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pattern(pub Vec<u8>);

impl Pattern {
    pub fn get(&self, row: usize) -> u8 {
        self.0.get(row).copied().unwrap_or(NOTE_HOLD)
    }

    /// Set a row, growing the pattern with holds as needed.
    pub fn set(&mut self, row: usize, note: u8) {
        if self.0.len() <= row {
            self.0.resize(row + 1, NOTE_HOLD);
        }
        self.0[row] = note;
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Which pattern a track plays at each position of the song. Negative
/// entries are rests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Order(pub Vec<i32>);

impl Order {
    /// The pattern index at a position, or -1 beyond the end.
    pub fn get(&self, position: usize) -> i32 {
        self.0.get(position).copied().unwrap_or(-1)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// The patterns and order list of one track. Each track triggers its own
/// block of voices, cycling through them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Track {
    #[serde(rename = "numvoices", alias = "NumVoices")]
    pub num_voices: usize,
    /// Display hint for trackers; has no effect on playback.
    #[serde(alias = "Effect", skip_serializing_if = "is_false")]
    pub effect: bool,
    #[serde(alias = "Order")]
    pub order: Order,
    #[serde(alias = "Patterns")]
    pub patterns: Vec<Pattern>,
}

impl Track {
    pub fn new(num_voices: usize, order: Vec<i32>, patterns: Vec<Vec<u8>>) -> Self {
        Self {
            num_voices,
            effect: false,
            order: Order(order),
            patterns: patterns.into_iter().map(Pattern).collect(),
        }
    }
}

/// The arrangement of the notes of a song.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Score {
    #[serde(alias = "Tracks")]
    pub tracks: Vec<Track>,
    #[serde(rename = "rowsperpattern", alias = "RowsPerPattern")]
    pub rows_per_pattern: usize,
    /// Length of the song in patterns.
    #[serde(alias = "Length")]
    pub length: usize,
}

impl Score {
    pub fn num_voices(&self) -> usize {
        self.tracks.iter().map(|t| t.num_voices).sum()
    }

    pub fn first_voice_for_track(&self, track: usize) -> usize {
        self.tracks.iter().take(track).map(|t| t.num_voices).sum()
    }

    pub fn length_in_rows(&self) -> usize {
        self.rows_per_pattern * self.length
    }
}

/// Possible reasons for a song to be unplayable.
#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum SongError {
    #[snafu(display("BPM should be > 0"))]
    InvalidBpm,
    #[snafu(display("Rows per beat should be > 0"))]
    InvalidRowsPerBeat,
    #[snafu(display("Rows per pattern should be > 0"))]
    InvalidRowsPerPattern,
    #[snafu(display("Song contains no tracks"))]
    NoTracks,
    #[snafu(display("Tracks use {} voices, but the patch only has {}", score, patch))]
    TooManyTrackVoices { score: usize, patch: usize },
}

/// A complete song.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Song {
    #[serde(alias = "BPM")]
    pub bpm: usize,
    #[serde(rename = "rowsperbeat", alias = "RowsPerBeat")]
    pub rows_per_beat: usize,
    #[serde(alias = "Score")]
    pub score: Score,
    #[serde(alias = "Patch")]
    pub patch: Patch,
}

impl Song {
    /// Fill in the values song files are allowed to leave out.
    pub fn apply_defaults(&mut self) {
        if self.rows_per_beat == 0 {
            self.rows_per_beat = 4;
        }
        if self.score.length == 0 {
            self.score.length = self.score.tracks.first().map_or(0, |t| t.order.len());
        }
    }

    /// Number of samples in each row at the song's tempo.
    pub fn samples_per_row(&self) -> usize {
        SAMPLE_RATE * 60 / (self.bpm * self.rows_per_beat).max(1)
    }

    pub fn validate(&self) -> Result<(), SongError> {
        if self.bpm < 1 {
            return Err(SongError::InvalidBpm);
        }
        if self.rows_per_beat < 1 {
            return Err(SongError::InvalidRowsPerBeat);
        }
        if self.score.rows_per_pattern < 1 {
            return Err(SongError::InvalidRowsPerPattern);
        }
        if self.score.tracks.is_empty() {
            return Err(SongError::NoTracks);
        }
        let (score, patch) = (self.score.num_voices(), self.patch.num_voices());
        if score > patch {
            return Err(SongError::TooManyTrackVoices { score, patch });
        }
        Ok(())
    }
}
