// sointu -- a modular synthesizer for size-restricted music
// Copyright (C) 2021  Fabian Thorand
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation.
//
// A copy of the license can be found in the LICENSE file in the root of
// this repository.

//! Exporting rendered audio.

use std::io::{Cursor, Seek, Write};

use hound::{SampleFormat, WavSpec, WavWriter};

use sointu_core::song::SAMPLE_RATE;
use sointu_vm::wave::{copy_f32_bytes, copy_i16_bytes};
use sointu_vm::Stereo;

fn spec(pcm16: bool) -> WavSpec {
    WavSpec {
        channels: 2,
        sample_rate: SAMPLE_RATE as u32,
        bits_per_sample: if pcm16 { 16 } else { 32 },
        sample_format: if pcm16 {
            SampleFormat::Int
        } else {
            SampleFormat::Float
        },
    }
}

/// Write a stereo WAV file, either as 32-bit floats or, with `pcm16`, as
/// 16-bit integers clipped to [-1, 1].
pub fn wav<W: Write + Seek>(audio: &[Stereo<f32>], pcm16: bool, writer: W) -> hound::Result<()> {
    let mut wav = WavWriter::new(writer, spec(pcm16))?;
    for frame in audio {
        if pcm16 {
            let frame = frame.to_i16();
            wav.write_sample(frame.left)?;
            wav.write_sample(frame.right)?;
        } else {
            wav.write_sample(frame.left)?;
            wav.write_sample(frame.right)?;
        }
    }
    wav.finalize()
}

/// The contents of a WAV file.
pub fn wav_bytes(audio: &[Stereo<f32>], pcm16: bool) -> hound::Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    wav(audio, pcm16, &mut cursor)?;
    Ok(cursor.into_inner())
}

/// Interleaved little endian samples without any header.
pub fn raw(audio: &[Stereo<f32>], pcm16: bool) -> Vec<u8> {
    if pcm16 {
        let mut bytes = vec![0; audio.len() * 4];
        copy_i16_bytes(audio, &mut bytes);
        bytes
    } else {
        let mut bytes = vec![0; audio.len() * 8];
        copy_f32_bytes(audio, &mut bytes);
        bytes
    }
}
