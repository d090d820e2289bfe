// sointu -- a modular synthesizer for size-restricted music
// Copyright (C) 2021  Fabian Thorand
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation.
//
// A copy of the license can be found in the LICENSE file in the root of
// this repository.

//! `sointu-compile` - compiles songs into bytecode listings and WAV files.

use std::io;

use structopt::StructOpt;

use sointu::compile::{Compiler, Opt};

fn main() {
    let opt = Opt::from_args();
    if opt.version {
        println!("sointu-compile {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let level = match opt.verbose {
        0 => log::Level::Info,
        1 => log::Level::Debug,
        _ => log::Level::Trace,
    };
    if let Err(err) = simple_logger::init_with_level(level) {
        eprintln!("Could not set up logging: {}", err);
    }

    if opt.paths.is_empty() && !opt.library {
        let _ = Opt::clap().print_help();
        println!();
        return;
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let failures = Compiler::new(opt).run(&mut out);
    std::process::exit(if failures > 0 { 1 } else { 0 });
}
