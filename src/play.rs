// sointu -- a modular synthesizer for size-restricted music
// Copyright (C) 2021  Fabian Thorand
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation.
//
// A copy of the license can be found in the LICENSE file in the root of
// this repository.

//! Render a whole song by walking its score row by row.

use log::{info, warn};
use snafu::{ResultExt, Snafu};

use sointu_core::song::NOTE_HOLD;
use sointu_core::{Song, SongError};
use sointu_vm::bytecode::MAX_VOICES;
use sointu_vm::{
    construct_patterns, CompileError, EncodedPatterns, PatternError, RenderError, Stereo, Synth,
    Synther,
};

/// Render calls allowed per row before giving up. A speed unit that slows
/// the song down needs several calls for each row.
const MAX_TRIES_PER_ROW: usize = 100;

#[derive(Debug, Snafu)]
pub enum PlayError {
    #[snafu(display("Invalid song: {}", source))]
    InvalidSong { source: SongError },
    #[snafu(display("Could not compile the patch: {}", source))]
    Compile { source: CompileError },
    #[snafu(display("Could not encode the patterns: {}", source))]
    Patterns { source: PatternError },
    #[snafu(display("Rendering failed: {}", source))]
    Render { source: RenderError },
    #[snafu(display(
        "Row {} of pattern {} does not advance; the song is likely slowed down too much",
        row,
        pattern
    ))]
    Stalled { pattern: usize, row: usize },
}

/// Play a song from start to end and return the rendered audio.
///
/// With `release`, every voice starts out released, so that envelopes of
/// voices that are never triggered stay silent.
pub fn play(synther: &dyn Synther, song: &Song, release: bool) -> Result<Vec<Stereo<f32>>, PlayError> {
    song.validate().context(InvalidSong)?;
    for (index, instr) in song.patch.iter().enumerate() {
        for advisory in instr.stack_check() {
            warn!("Instrument {}: {}", index, advisory);
        }
    }
    let patterns = construct_patterns(song).context(Patterns)?;
    let mut synth = synther.synth(&song.patch, song.bpm).context(Compile)?;
    let result = play_patterns(synth.as_mut(), song, &patterns, release);
    synth.close();
    result
}

fn play_patterns(
    synth: &mut dyn Synth,
    song: &Song,
    patterns: &EncodedPatterns,
    release: bool,
) -> Result<Vec<Stereo<f32>>, PlayError> {
    if release {
        for voice in 0..MAX_VOICES {
            synth.release(voice);
        }
    }
    let score = &song.score;
    let samples_per_row = song.samples_per_row();
    let rows = score.length_in_rows();
    info!(
        "Playing {} rows at {} bpm, {} samples per row",
        rows, song.bpm, samples_per_row
    );

    let mut current_voices: Vec<usize> = (0..score.tracks.len())
        .map(|t| score.first_voice_for_track(t))
        .collect();
    let mut buffer = Vec::with_capacity(rows * samples_per_row);
    let mut row_buffer = vec![Stereo::SILENCE; samples_per_row];
    for row in 0..rows {
        for (t, track) in score.tracks.iter().enumerate() {
            let note = patterns.note(t, row);
            if note == NOTE_HOLD {
                continue;
            }
            synth.release(current_voices[t]);
            if note > NOTE_HOLD {
                let first = score.first_voice_for_track(t);
                current_voices[t] += 1;
                if current_voices[t] >= first + track.num_voices {
                    current_voices[t] = first;
                }
                synth.trigger(current_voices[t], note);
            }
        }

        let mut row_time = 0;
        let mut tries = 0;
        while row_time < samples_per_row {
            if tries >= MAX_TRIES_PER_ROW {
                return Err(PlayError::Stalled {
                    pattern: row / score.rows_per_pattern,
                    row: row % score.rows_per_pattern,
                });
            }
            tries += 1;
            let rendered = synth
                .render(&mut row_buffer, (samples_per_row - row_time) as i64)
                .context(Render)?;
            buffer.extend_from_slice(&row_buffer[..rendered.samples]);
            row_time += rendered.time.max(0) as usize;
        }
    }
    Ok(buffer)
}
