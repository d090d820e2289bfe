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

//! Compression of the score into one shared table of unique patterns plus a
//! byte order list per track.

use log::debug;
use snafu::Snafu;

use sointu_core::song::{NOTE_HOLD, NOTE_RELEASE};
use sointu_core::{Song, Track};

/// Marks a row whose value does not matter, because the note playing there
/// has already been released.
const DONT_CARE: i32 = -1;

/// Order lists are bytes.
const MAX_PATTERNS: usize = 256;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum PatternError {
    #[snafu(display(
        "The pattern table would need {} unique patterns, but at most 256 are supported",
        count
    ))]
    TooManyPatterns { count: usize },
}

/// The score in the form the players consume it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPatterns {
    /// Unique patterns, each `rows_per_pattern` long.
    pub patterns: Vec<Vec<u8>>,
    /// For every track, the index of the pattern played at each position.
    pub orders: Vec<Vec<u8>>,
    pub rows_per_pattern: usize,
}

impl EncodedPatterns {
    /// The note a track plays at an absolute row.
    pub fn note(&self, track: usize, row: usize) -> u8 {
        let rows = self.rows_per_pattern.max(1);
        self.orders
            .get(track)
            .and_then(|order| order.get(row / rows))
            .and_then(|&pattern| self.patterns.get(pattern as usize))
            .and_then(|pattern| pattern.get(row % rows))
            .copied()
            .unwrap_or(NOTE_RELEASE)
    }
}

/// All notes of a track as one sequence. Positions of the order list that do
/// not refer to a pattern are silent.
fn flatten_track(track: &Track, length: usize, rows_per_pattern: usize) -> Vec<i32> {
    let mut notes = Vec::with_capacity(length * rows_per_pattern);
    for position in 0..length {
        let index = track.order.get(position);
        let pattern = if index >= 0 {
            track.patterns.get(index as usize)
        } else {
            None
        };
        for row in 0..rows_per_pattern {
            let note = pattern.map_or(NOTE_RELEASE, |p| p.get(row));
            notes.push(note as i32);
        }
    }
    // nothing can be held before the first row
    if notes.first() == Some(&(NOTE_HOLD as i32)) {
        notes[0] = NOTE_RELEASE as i32;
    }
    notes
}

/// Holds and releases following a release are don't cares.
fn mark_dont_cares(notes: &mut [i32]) {
    let mut dont_care = false;
    for note in notes.iter_mut() {
        if dont_care && *note <= NOTE_HOLD as i32 {
            *note = DONT_CARE;
        } else {
            dont_care = *note == NOTE_RELEASE as i32;
        }
    }
}

/// Split into pattern sized chunks, padding the last one with don't cares.
fn split_sequence(notes: &[i32], rows_per_pattern: usize) -> Vec<Vec<i32>> {
    notes
        .chunks(rows_per_pattern)
        .map(|chunk| {
            let mut chunk = chunk.to_vec();
            chunk.resize(rows_per_pattern, DONT_CARE);
            chunk
        })
        .collect()
}

/// Whether two patterns can be played by the same table entry.
fn compatible(existing: &[i32], candidate: &[i32]) -> bool {
    existing.iter().zip(candidate).all(|(&n, &m)| {
        let conflict = (n > DONT_CARE && m > DONT_CARE && n != m)
            || (n == DONT_CARE && m > NOTE_HOLD as i32)
            || (n > NOTE_HOLD as i32 && m == DONT_CARE);
        !conflict
    })
}

/// Find or insert a pattern in the table, returning its index.
fn add_to_table(table: &mut Vec<Vec<i32>>, pattern: Vec<i32>) -> usize {
    for (index, existing) in table.iter_mut().enumerate() {
        if compatible(existing, &pattern) {
            for (slot, &note) in existing.iter_mut().zip(&pattern) {
                if note != DONT_CARE {
                    *slot = note;
                }
            }
            return index;
        }
    }
    table.push(pattern);
    table.len() - 1
}

/// Compress the score of a song.
pub fn construct_patterns(song: &Song) -> Result<EncodedPatterns, PatternError> {
    let rows_per_pattern = song.score.rows_per_pattern;
    let mut table: Vec<Vec<i32>> = Vec::new();
    let mut sequences: Vec<Vec<usize>> = Vec::with_capacity(song.score.tracks.len());
    if rows_per_pattern > 0 {
        for track in &song.score.tracks {
            let mut notes = flatten_track(track, song.score.length, rows_per_pattern);
            mark_dont_cares(&mut notes);
            let sequence = split_sequence(&notes, rows_per_pattern)
                .into_iter()
                .map(|chunk| add_to_table(&mut table, chunk))
                .collect();
            sequences.push(sequence);
        }
    } else {
        sequences.resize(song.score.tracks.len(), Vec::new());
    }
    if table.len() > MAX_PATTERNS {
        return Err(PatternError::TooManyPatterns { count: table.len() });
    }

    let mut patterns: Vec<Vec<u8>> = table
        .iter()
        .map(|pattern| pattern.iter().map(|&n| n.max(0) as u8).collect())
        .collect();
    let mut orders: Vec<Vec<u8>> = sequences
        .iter()
        .map(|sequence| sequence.iter().map(|&i| i as u8).collect())
        .collect();

    // an all-release pattern is likely the most common one, so it goes first
    if let Some(silent) = patterns
        .iter()
        .position(|p| p.iter().all(|&n| n == NOTE_RELEASE))
    {
        if silent != 0 {
            patterns.swap(0, silent);
            let silent = silent as u8;
            for order in orders.iter_mut() {
                for index in order.iter_mut() {
                    if *index == 0 {
                        *index = silent;
                    } else if *index == silent {
                        *index = 0;
                    }
                }
            }
        }
    }
    debug!(
        "Encoded {} tracks into {} unique patterns of {} rows",
        orders.len(),
        patterns.len(),
        rows_per_pattern
    );
    Ok(EncodedPatterns {
        patterns,
        orders,
        rows_per_pattern,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use expect_test::expect;
    use sointu_core::{Instrument, Score};

    fn song(tracks: Vec<Track>, rows_per_pattern: usize, length: usize) -> Song {
        Song {
            bpm: 100,
            rows_per_beat: 4,
            score: Score {
                tracks,
                rows_per_pattern,
                length,
            },
            patch: vec![Instrument::new(1, vec![])].into(),
        }
    }

    fn flattened(track: &Track, length: usize, rows_per_pattern: usize) -> Vec<u8> {
        flatten_track(track, length, rows_per_pattern)
            .into_iter()
            .map(|n| n as u8)
            .collect()
    }

    #[test]
    fn test_identical_patterns_merge() {
        let song = song(
            vec![Track::new(1, vec![0, 0, 1], vec![vec![64, 1, 1, 0], vec![64, 1, 1, 0]])],
            4,
            3,
        );
        let encoded = construct_patterns(&song).unwrap();
        assert_eq!(encoded.patterns, vec![vec![64, 1, 1, 0]]);
        assert_eq!(encoded.orders, vec![vec![0, 0, 0]]);
    }

    #[test]
    fn test_dont_cares() {
        let mut notes = vec![64, 1, 0, 1, 0, 65, 1, 0];
        mark_dont_cares(&mut notes);
        assert_eq!(notes, vec![64, 1, 0, -1, -1, 65, 1, 0]);
    }

    #[test]
    fn test_compatibility() {
        assert!(compatible(&[64, -1, -1], &[64, 1, 0]));
        assert!(compatible(&[64, 1, 0], &[64, -1, -1]));
        assert!(!compatible(&[64, -1], &[64, 65]));
        assert!(!compatible(&[64, 65], &[64, -1]));
        assert!(!compatible(&[64, 1], &[64, 0]));
    }

    #[test]
    fn test_flatten() {
        let track = Track::new(1, vec![1, -1, 5, 0], vec![vec![70, 0], vec![1, 1]]);
        assert_eq!(flattened(&track, 4, 2), vec![0, 1, 0, 0, 0, 0, 70, 0]);
        // rows beyond the end of a pattern are holds
        let short = Track::new(1, vec![0], vec![vec![70]]);
        assert_eq!(flattened(&short, 1, 3), vec![70, 1, 1]);
    }

    #[test]
    fn test_silent_pattern_first() {
        let song = song(
            vec![
                Track::new(1, vec![0, 1], vec![vec![64, 1], vec![0, 0]]),
                Track::new(1, vec![0, 0], vec![vec![72, 0]]),
            ],
            2,
            2,
        );
        let encoded = construct_patterns(&song).unwrap();
        expect![[r#"EncodedPatterns { patterns: [[0, 0], [64, 1], [72, 0]], orders: [[1, 0], [2, 2]], rows_per_pattern: 2 }"#]]
            .assert_eq(&format!("{:?}", encoded));
    }

    #[test]
    fn test_round_trip() {
        let tracks = vec![
            Track::new(2, vec![0, 1, 2, 1], vec![vec![64, 1, 0, 1], vec![1, 66, 1, 0], vec![0; 4]]),
            Track::new(1, vec![1, 0], vec![vec![60, 0, 62, 0], vec![60, 0, 1, 1]]),
        ];
        let song = song(tracks, 4, 4);
        let encoded = construct_patterns(&song).unwrap();
        for (t, track) in song.score.tracks.iter().enumerate() {
            let mut expected: Vec<i32> = flatten_track(track, 4, 4);
            mark_dont_cares(&mut expected);
            for (row, &note) in expected.iter().enumerate() {
                let actual = encoded.note(t, row) as i32;
                if note == DONT_CARE {
                    assert!(actual <= NOTE_HOLD as i32, "row {}", row);
                } else {
                    assert_eq!(actual, note, "track {} row {}", t, row);
                }
            }
        }
    }

    #[test]
    fn test_too_many_patterns() {
        let patterns: Vec<Vec<u8>> = (0..=MAX_PATTERNS).map(|i| vec![(i % 250 + 2) as u8, (i / 250 + 2) as u8]).collect();
        let order: Vec<i32> = (0..patterns.len() as i32).collect();
        let length = order.len();
        let song = song(vec![Track::new(1, order, patterns)], 2, length);
        assert_eq!(
            construct_patterns(&song),
            Err(PatternError::TooManyPatterns { count: 257 })
        );
    }
}
