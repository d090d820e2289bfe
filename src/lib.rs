// sointu -- a modular synthesizer for size-restricted music
// Copyright (C) 2021  Fabian Thorand
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation.
//
// A copy of the license can be found in the LICENSE file in the root of
// this repository.

//! Playing sointu songs and the `sointu-compile` tool.

// songs
pub mod play;
pub mod song;

// command line
pub mod compile;
pub mod output;

pub use play::{play, PlayError};
pub use song::{load_song, parse_song, LoadError};
