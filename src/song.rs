// sointu -- a modular synthesizer for size-restricted music
// Copyright (C) 2021  Fabian Thorand
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation.
//
// A copy of the license can be found in the LICENSE file in the root of
// this repository.

//! Reading and writing song files.
//!
//! Songs are stored as YAML or JSON. Files written by other tools often leave
//! out `rowsperbeat` and the score length, so defaults are filled in after
//! parsing.

use std::path::{Path, PathBuf};

use snafu::{ResultExt, Snafu};

use sointu_core::Song;

#[derive(Debug, Snafu)]
pub enum LoadError {
    #[snafu(display("Could not read {}: {}", path.display(), source))]
    ReadSong {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "Song could not be parsed as JSON ({}) or as YAML ({})",
        json,
        yaml
    ))]
    ParseSong { json: String, yaml: String },
}

/// Parse a song, trying JSON first and YAML second.
pub fn parse_song(contents: &[u8]) -> Result<Song, LoadError> {
    let mut song = match serde_json::from_slice::<Song>(contents) {
        Ok(song) => song,
        Err(json) => match serde_yaml::from_slice::<Song>(contents) {
            Ok(song) => song,
            Err(yaml) => {
                return Err(LoadError::ParseSong {
                    json: json.to_string(),
                    yaml: yaml.to_string(),
                })
            }
        },
    };
    song.apply_defaults();
    Ok(song)
}

pub fn load_song(path: &Path) -> Result<Song, LoadError> {
    let contents = std::fs::read(path).context(ReadSong { path })?;
    parse_song(&contents)
}

pub fn to_json(song: &Song) -> serde_json::Result<String> {
    serde_json::to_string(song)
}

pub fn to_yaml(song: &Song) -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(song)
}
