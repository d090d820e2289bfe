// sointu -- a modular synthesizer for size-restricted music
// Copyright (C) 2021  Fabian Thorand
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation.
//
// A copy of the license can be found in the LICENSE file in the root of
// this repository.

//! The `sointu-compile` command line tool.
//!
//! Every song given on the command line is compiled into a listing of its
//! bytecode and encoded patterns (`.lst`) and rendered to a WAV file
//! (`.wav`). Alternatively the song can be converted between JSON and YAML.
//! Files whose contents would not change are left untouched.

use std::fmt::Write as _;
use std::io::{self, Write};
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::str::FromStr;

use log::{debug, error, info};
use snafu::{ResultExt, Snafu};
use structopt::StructOpt;

use sointu_core::Song;
use sointu_vm::features::{AllFeatures, FeatureSet, NecessaryFeatures};
use sointu_vm::opcodes::Opcode;
use sointu_vm::{
    construct_patterns, Bytecode, CompileError, InterpreterSynther, ParallelSynther, PatternError,
    Synther,
};

use crate::output;
use crate::play::{play, PlayError};
use crate::song::{load_song, to_json, to_yaml, LoadError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86,
    Amd64,
    Wasm,
}

impl Arch {
    /// The architecture this program was built for.
    pub fn host() -> Self {
        match std::env::consts::ARCH {
            "x86" => Arch::X86,
            "wasm32" => Arch::Wasm,
            _ => Arch::Amd64,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Arch::X86 => "386",
            Arch::Amd64 => "amd64",
            Arch::Wasm => "wasm",
        }
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "386" => Ok(Arch::X86),
            "amd64" => Ok(Arch::Amd64),
            "wasm" => Ok(Arch::Wasm),
            other => Err(format!(
                "unknown architecture {}, expected 386, amd64 or wasm",
                other
            )),
        }
    }
}

/// Operating systems other than windows and darwin are treated as linux.
fn normalize_os(os: &str) -> &'static str {
    match os {
        "windows" => "windows",
        "darwin" | "macos" => "darwin",
        _ => "linux",
    }
}

#[derive(Debug, StructOpt)]
#[structopt(
    name = "sointu-compile",
    about = "Compiles sointu songs (.yml or .json) into bytecode listings and rendered audio"
)]
pub struct Opt {
    /// Never overwrite files; fail if a file exists and would change.
    #[structopt(short = "n")]
    pub safe: bool,

    /// Do not write files; list the files that would change instead.
    #[structopt(short = "l")]
    pub list: bool,

    /// Do not write files; write to standard output instead.
    #[structopt(short = "s")]
    pub stdout: bool,

    /// Emit the opcode table of the virtual machine. Needs no input files.
    #[structopt(short = "a")]
    pub library: bool,

    /// Output the song as a .json file instead of compiling.
    #[structopt(short = "j")]
    pub json: bool,

    /// Output the song as a .yml file instead of compiling.
    #[structopt(short = "y")]
    pub yaml: bool,

    /// Template directory. No template backends are built in, so giving one
    /// is an error.
    #[structopt(short = "t", parse(from_os_str))]
    pub templates: Option<PathBuf>,

    /// Directory or file name of the output. The extension is replaced.
    /// Directories are created as needed. Defaults to the working directory.
    #[structopt(short = "o", parse(from_os_str))]
    pub output: Option<PathBuf>,

    /// Only output files with these comma separated extensions, e.g. wav,lst
    #[structopt(short = "e")]
    pub extensions: Option<String>,

    /// Target architecture: 386, amd64 or wasm. Defaults to the host.
    #[structopt(long = "arch")]
    pub arch: Option<Arch>,

    /// Target operating system: windows, darwin or linux. Defaults to the host.
    #[structopt(long = "os")]
    pub os: Option<String>,

    /// Output 16-bit integer audio instead of floats.
    #[structopt(short = "i")]
    pub pcm16: bool,

    /// Render on a single thread even if the patch asks for more cores.
    #[structopt(short = "f")]
    pub single_thread: bool,

    /// Print the version and exit.
    #[structopt(short = "v")]
    pub version: bool,

    /// Write the current row as sync channel 0.
    #[structopt(short = "r")]
    pub row_sync: bool,

    #[structopt(long = "verbose", parse(from_occurrences))]
    pub verbose: usize,

    /// Song files, or directories of song files.
    #[structopt(parse(from_os_str))]
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{}", source))]
    Load { source: LoadError },
    #[snafu(display("{}", source))]
    Play { source: PlayError },
    #[snafu(display("Could not compile the patch: {}", source))]
    Listing { source: CompileError },
    #[snafu(display("Could not encode the patterns: {}", source))]
    Patterns { source: PatternError },
    #[snafu(display("Could not encode the audio: {}", source))]
    Wav { source: hound::Error },
    #[snafu(display("Could not serialize the song as JSON: {}", source))]
    Json { source: serde_json::Error },
    #[snafu(display("Could not serialize the song as YAML: {}", source))]
    Yaml { source: serde_yaml::Error },
    #[snafu(display("Templates are not supported, but {} was given", dir.display()))]
    Templates { dir: PathBuf },
    #[snafu(display("File {} would be overwritten", path.display()))]
    WouldOverwrite { path: PathBuf },
    #[snafu(display("Could not create directory {}: {}", path.display(), source))]
    CreateDir { path: PathBuf, source: io::Error },
    #[snafu(display("Could not write {}: {}", path.display(), source))]
    WriteFile { path: PathBuf, source: io::Error },
    #[snafu(display("Could not list {}: {}", path.display(), source))]
    ReadDir { path: PathBuf, source: io::Error },
    #[snafu(display("Could not write to standard output: {}", source))]
    WriteStdout { source: io::Error },
    #[snafu(display(
        "Could not get the working directory, give an output directory explicitly: {}",
        source
    ))]
    CurrentDir { source: io::Error },
}

/// One output file, before the output directory is decided.
struct Artifact {
    extension: &'static str,
    contents: Vec<u8>,
}

pub struct Compiler {
    opt: Opt,
}

impl Compiler {
    pub fn new(opt: Opt) -> Self {
        Self { opt }
    }

    fn compiles(&self) -> bool {
        !self.opt.json && !self.opt.yaml
    }

    /// Process the library and all paths. Listed files and standard output
    /// contents go to `out`. Returns the number of failures.
    pub fn run(&self, out: &mut dyn Write) -> usize {
        if let Some(dir) = &self.opt.templates {
            error!("{}", Error::Templates { dir: dir.clone() });
            return 1;
        }
        let mut failures = 0;
        if self.opt.library {
            let artifacts = self.filter(vec![Artifact {
                extension: ".lst",
                contents: library_listing().into_bytes(),
            }]);
            for artifact in artifacts {
                if let Err(err) = self.output(Path::new("sointu"), &artifact, out) {
                    error!("Could not output the library: {}", err);
                    failures += 1;
                }
            }
        }
        for path in &self.opt.paths {
            let files = if path.is_dir() {
                match song_files(path) {
                    Ok(files) => files,
                    Err(err) => {
                        error!("{}", err);
                        failures += 1;
                        continue;
                    }
                }
            } else {
                vec![path.clone()]
            };
            for file in files {
                if let Err(err) = self.process(&file, out) {
                    error!("Could not process {}: {}", file.display(), err);
                    failures += 1;
                }
            }
        }
        failures
    }

    fn process(&self, path: &Path, out: &mut dyn Write) -> Result<(), Error> {
        info!("Processing {}", path.display());
        let song = load_song(path).context(Load)?;
        let mut artifacts = Vec::new();
        if self.compiles() {
            artifacts.extend(self.filter(self.compile_song(&song)?));
        }
        if self.opt.json {
            let json = to_json(&song).context(Json)?;
            artifacts.push(Artifact {
                extension: ".json",
                contents: json.into_bytes(),
            });
        }
        if self.opt.yaml {
            let yaml = to_yaml(&song).context(Yaml)?;
            artifacts.push(Artifact {
                extension: ".yml",
                contents: yaml.into_bytes(),
            });
        }
        for artifact in &artifacts {
            self.output(path, artifact, out)?;
        }
        Ok(())
    }

    fn filter(&self, artifacts: Vec<Artifact>) -> Vec<Artifact> {
        match &self.opt.extensions {
            None => artifacts,
            Some(extensions) => {
                let keep: Vec<String> = extensions
                    .split(',')
                    .map(|e| format!(".{}", e.trim()))
                    .collect();
                artifacts
                    .into_iter()
                    .filter(|a| keep.iter().any(|k| k == a.extension))
                    .collect()
            }
        }
    }

    fn compile_song(&self, song: &Song) -> Result<Vec<Artifact>, Error> {
        let listing = self.song_listing(song)?;
        let keeps_wav = self
            .opt
            .extensions
            .as_ref()
            .map_or(true, |e| e.split(',').any(|e| e.trim() == "wav"));
        let mut artifacts = vec![Artifact {
            extension: ".lst",
            contents: listing.into_bytes(),
        }];
        if keeps_wav {
            let interpreter = InterpreterSynther::new();
            let audio = if self.opt.single_thread || song.patch.num_cores() == 1 {
                play(&interpreter, song, true)
            } else {
                play(&ParallelSynther::new(interpreter), song, true)
            }
            .context(Play)?;
            artifacts.push(Artifact {
                extension: ".wav",
                contents: output::wav_bytes(&audio, self.opt.pcm16).context(Wav)?,
            });
        }
        Ok(artifacts)
    }

    fn song_listing(&self, song: &Song) -> Result<String, Error> {
        song.validate()
            .map_err(|source| PlayError::InvalidSong { source })
            .context(Play)?;
        let bytecode = Bytecode::new(&song.patch, &AllFeatures, song.bpm).context(Listing)?;
        let patterns = construct_patterns(song).context(Patterns)?;
        let features = NecessaryFeatures::for_patch(&song.patch);

        let mut listing = String::new();
        let arch = self.opt.arch.unwrap_or_else(Arch::host);
        let os = normalize_os(self.opt.os.as_deref().unwrap_or(std::env::consts::OS));
        let _ = writeln!(
            listing,
            "; arch={} os={} output={} rowsync={} cores={}",
            arch.name(),
            os,
            if self.opt.pcm16 { "int16" } else { "float32" },
            self.opt.row_sync,
            if self.opt.single_thread {
                1
            } else {
                song.patch.num_cores()
            },
        );
        let _ = writeln!(
            listing,
            "; bpm={} rowsperbeat={} samplesperrow={} rows={}",
            song.bpm,
            song.rows_per_beat,
            song.samples_per_row(),
            song.score.length_in_rows()
        );
        let _ = writeln!(listing, "; features: {}", features.instructions().join(" "));
        listing.push_str(&bytecode.disassemble());
        let _ = writeln!(listing, "patterns:");
        for (index, pattern) in patterns.patterns.iter().enumerate() {
            let notes: Vec<String> = pattern.iter().map(|n| n.to_string()).collect();
            let _ = writeln!(listing, "  {:3}: {}", index, notes.join(" "));
        }
        let _ = writeln!(listing, "orders:");
        for (track, order) in patterns.orders.iter().enumerate() {
            let indices: Vec<String> = order.iter().map(|i| i.to_string()).collect();
            let _ = writeln!(listing, "  {:3}: {}", track, indices.join(" "));
        }
        Ok(listing)
    }

    /// Where an output file of an input goes.
    fn output_path(&self, input: &Path, extension: &str) -> Result<PathBuf, Error> {
        let mut name = input.file_name().map(PathBuf::from).unwrap_or_default();
        let mut dir = None;
        if let Some(out) = &self.opt.output {
            let text = out.to_string_lossy();
            if out.is_dir() || text.ends_with('/') || text.ends_with(MAIN_SEPARATOR) {
                dir = Some(out.clone());
            } else {
                if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
                    dir = Some(parent.to_path_buf());
                }
                if let Some(file_name) = out.file_name() {
                    name = PathBuf::from(file_name);
                }
            }
        }
        let dir = match dir {
            Some(dir) => dir,
            None => std::env::current_dir().context(CurrentDir)?,
        };
        let stem = name.file_stem().map(PathBuf::from).unwrap_or_default();
        let mut file_name = stem.into_os_string();
        file_name.push(extension);
        Ok(dir.join(file_name))
    }

    fn output(&self, input: &Path, artifact: &Artifact, out: &mut dyn Write) -> Result<(), Error> {
        if self.opt.stdout {
            return out.write_all(&artifact.contents).context(WriteStdout);
        }
        let path = self.output_path(input, artifact.extension)?;
        if let Ok(existing) = std::fs::read(&path) {
            if existing == artifact.contents {
                debug!("{} is up to date", path.display());
                return Ok(());
            }
            if self.opt.safe && !self.opt.list {
                return Err(Error::WouldOverwrite { path });
            }
        }
        if self.opt.list {
            return writeln!(out, "{}", path.display()).context(WriteStdout);
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).context(CreateDir { path: dir })?;
        }
        std::fs::write(&path, &artifact.contents).context(WriteFile { path: &path })?;
        info!("Wrote {}", path.display());
        Ok(())
    }
}

/// The `.yml` and `.json` files in a directory, YAML first.
fn song_files(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let entries = std::fs::read_dir(dir).context(ReadDir { path: dir })?;
    let mut yml = Vec::new();
    let mut json = Vec::new();
    for entry in entries {
        let path = entry.context(ReadDir { path: dir })?.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some("yml") => yml.push(path),
            Some("json") => json.push(path),
            _ => {}
        }
    }
    yml.sort();
    json.sort();
    yml.extend(json);
    Ok(yml)
}

/// Opcode numbers and operand counts of the virtual machine with all unit
/// types compiled in.
pub fn library_listing() -> String {
    let mut listing = String::from("; opcode transforms operands name\n");
    for name in AllFeatures.instructions() {
        let opcode = AllFeatures.opcode(name).unwrap_or(0);
        let extra = Opcode::from_index(opcode >> 1).map_or(0, Opcode::extra_operands);
        let _ = writeln!(
            listing,
            "{:#04x} {} {} {}",
            opcode,
            AllFeatures.transform_count(name),
            extra,
            name
        );
    }
    listing
}

#[cfg(test)]
mod test {
    use super::*;
    use expect_test::expect;
    use tempfile::tempdir;

    const SONG: &str = "
bpm: 120
score:
  rowsperpattern: 2
  tracks:
    - numvoices: 1
      order: [0]
      patterns: [[64, 0]]
patch:
  - numvoices: 1
    units:
      - type: envelope
        parameters: {attack: 16, decay: 32, gain: 100, release: 16, stereo: 0, sustain: 64}
      - type: oscillator
        parameters: {color: 128, detune: 64, gain: 128, phase: 0, shape: 64, stereo: 0, transpose: 64, type: 0}
      - type: mulp
      - type: pan
        parameters: {panning: 64, stereo: 0}
      - type: out
        parameters: {gain: 128, stereo: 1}
";

    fn opt(args: &[&str]) -> Opt {
        let mut all = vec!["sointu-compile"];
        all.extend_from_slice(args);
        Opt::from_iter(all)
    }

    fn run(args: &[&str]) -> (usize, String) {
        let mut out = Vec::new();
        let failures = Compiler::new(opt(args)).run(&mut out);
        (failures, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_compile_song() {
        let dir = tempdir().unwrap();
        let song = dir.path().join("tune.yml");
        std::fs::write(&song, SONG).unwrap();
        let out = dir.path().join("out");
        let out_arg = format!("{}/", out.display());
        let song_arg = song.to_str().unwrap();

        assert_eq!(run(&["-o", &out_arg, song_arg]).0, 0);
        let listing = std::fs::read_to_string(out.join("tune.lst")).unwrap();
        assert!(listing.contains("; bpm=120 rowsperbeat=4 samplesperrow=5512 rows=2"));
        assert!(listing.contains("orders:\n    0: 0\n"));
        let wav = hound::WavReader::open(out.join("tune.wav")).unwrap();
        assert_eq!(wav.duration(), 2 * 5512);

        // identical outputs are fine even in safe mode
        assert_eq!(run(&["-n", "-o", &out_arg, song_arg]).0, 0);
        std::fs::write(out.join("tune.lst"), "changed").unwrap();
        assert_eq!(run(&["-n", "-o", &out_arg, song_arg]).0, 1);
        let (failures, listed) = run(&["-l", "-o", &out_arg, song_arg]);
        assert_eq!(failures, 0);
        assert_eq!(listed.trim(), out.join("tune.lst").display().to_string());
        assert_eq!(std::fs::read_to_string(out.join("tune.lst")).unwrap(), "changed");
    }

    #[test]
    fn test_directory_and_conversion() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.yml"), SONG).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a song").unwrap();
        let out = dir.path().join("converted");
        let out_arg = format!("{}/", out.display());

        let (failures, _) = run(&["-j", "-o", &out_arg, dir.path().to_str().unwrap()]);
        assert_eq!(failures, 0);
        let json = std::fs::read_to_string(out.join("a.json")).unwrap();
        assert!(json.contains("\"rowsperpattern\":2"));
        assert!(!out.join("a.lst").exists());
        assert!(!out.join("notes.json").exists());
    }

    #[test]
    fn test_extension_filter_and_stdout() {
        let dir = tempdir().unwrap();
        let song = dir.path().join("tune.yml");
        std::fs::write(&song, SONG).unwrap();
        let (failures, listing) = run(&["-s", "-e", "lst", "--arch", "wasm", song.to_str().unwrap()]);
        assert_eq!(failures, 0);
        assert!(listing.starts_with("; arch=wasm "));
        assert!(!listing.contains("RIFF"));
    }

    #[test]
    fn test_failures() {
        let dir = tempdir().unwrap();
        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{").unwrap();
        let missing = dir.path().join("missing.yml");
        let (failures, _) = run(&["-s", broken.to_str().unwrap(), missing.to_str().unwrap()]);
        assert_eq!(failures, 2);
        assert_eq!(run(&["-t", "templates", "-a"]).0, 1);
    }

    #[test]
    fn test_library() {
        let (failures, listing) = run(&["-a", "-s"]);
        assert_eq!(failures, 0);
        assert_eq!(listing, library_listing());
        expect![[r#"
            ; opcode transforms operands name
            0x02 0 0 add
            0x04 0 0 addp
            0x06 1 1 aux
            0x08 0 0 clip
            0x0a 5 0 compressor
            0x0c 1 0 crush
            0x0e 1 0 dbgain
            0x10 4 2 delay
            0x12 1 0 distort
            0x14 5 0 envelope
            0x16 2 1 filter
            0x18 1 0 gain
            0x1a 1 0 hold
            0x1c 0 1 in
            0x1e 1 0 invgain
            0x20 0 0 loadnote
            0x22 1 0 loadval
            0x24 0 0 mul
            0x26 0 0 mulp
            0x28 2 0 noise
            0x2a 6 1 oscillator
            0x2c 1 0 out
            0x2e 2 0 outaux
            0x30 1 0 pan
            0x32 0 0 pop
            0x34 0 0 push
            0x36 0 0 receive
            0x38 1 2 send
            0x3a 0 0 speed
            0x3c 0 0 sync
            0x3e 0 0 xch
        "#]]
        .assert_eq(&listing);
    }

    #[test]
    fn test_arch() {
        assert_eq!("386".parse::<Arch>(), Ok(Arch::X86));
        assert!("arm".parse::<Arch>().is_err());
        assert_eq!(normalize_os("freebsd"), "linux");
        assert_eq!(normalize_os("windows"), "windows");
    }
}
