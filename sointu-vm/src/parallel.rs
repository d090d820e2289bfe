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

//! Rendering a patch on several threads.
//!
//! The patch is split by the core masks of its instruments into one sub-patch
//! per core. Every sub-patch gets its own synth, so cores share no state: not
//! even the global bus. A render call hands each synth, together with a
//! scratch buffer, to a pool of worker threads and mixes the buffers as they
//! come back. Since the order of completion varies, so does the order of
//! summation, and outputs may differ from a single threaded render in the
//! last bits.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, trace, warn};

use sointu_core::{Instrument, Patch};

use crate::bytecode::{Bytecode, CompileError, MAX_VOICES};
use crate::features::AllFeatures;
use crate::synth::{CpuLoad, RenderError, RenderErrorKind, Rendered, Synth, Synther};
use crate::wave::Stereo;

/// Upper bound for the number of sub-patches.
pub const MAX_CORES: usize = 4;

/// For every core, the core local index of each global voice.
type VoiceMapping = Vec<[Option<usize>; MAX_VOICES]>;

/// The cores rendering an instrument, as a bit set limited to `cores`.
/// Instruments whose mask names no existing core fall back to core 0.
fn core_bits(instr: &Instrument, cores: usize) -> u32 {
    let bits = instr.core_mask_minus_one.wrapping_add(1) & ((1 << cores) - 1);
    if bits == 0 {
        1
    } else {
        bits
    }
}

struct CoreSplit {
    patches: Vec<Patch>,
    mapping: VoiceMapping,
    /// For every core, the patch index of each instrument of its sub-patch.
    instruments: Vec<Vec<usize>>,
}

impl CoreSplit {
    fn new(patch: &Patch) -> Self {
        let cores = patch.num_cores().min(MAX_CORES).max(1);
        let mut split = CoreSplit {
            patches: vec![Patch::default(); cores],
            mapping: vec![[None; MAX_VOICES]; cores],
            instruments: vec![Vec::new(); cores],
        };
        for core in 0..cores {
            let mut core_voice = 0;
            let mut voice = 0;
            for (index, instr) in patch.iter().enumerate() {
                if core_bits(instr, cores) & (1 << core) != 0 {
                    split.patches[core].0.push(instr.clone());
                    split.instruments[core].push(index);
                    for j in 0..instr.num_voices {
                        if let Some(slot) = split.mapping[core].get_mut(voice + j) {
                            *slot = Some(core_voice + j);
                        }
                    }
                    core_voice += instr.num_voices;
                }
                voice += instr.num_voices;
            }
        }
        split
    }

    /// Report instruments of a sub-patch by their index in the whole patch.
    fn patch_error(&self, core: usize, err: CompileError) -> CompileError {
        let index = |local: usize| self.instruments[core].get(local).copied().unwrap_or(local);
        match err {
            CompileError::NoVoices { instrument } => CompileError::NoVoices {
                instrument: index(instrument),
            },
            CompileError::TooManyUnits { instrument } => CompileError::TooManyUnits {
                instrument: index(instrument),
            },
            other => other,
        }
    }

    fn synths(&self, synther: &dyn Synther, bpm: usize) -> Result<Vec<Option<Box<dyn Synth>>>, CompileError> {
        self.patches
            .iter()
            .enumerate()
            .map(|(core, p)| {
                synther
                    .synth(p, bpm)
                    .map(Some)
                    .map_err(|err| self.patch_error(core, err))
            })
            .collect()
    }
}

/// Split a patch into one sub-patch per core.
pub fn split_patch_by_cores(patch: &Patch) -> (Vec<Patch>, VoiceMapping) {
    let split = CoreSplit::new(patch);
    (split.patches, split.mapping)
}

struct Job {
    core: usize,
    synth: Box<dyn Synth>,
    buffer: Vec<Stereo<f32>>,
    frames: usize,
    max_time: i64,
}

struct Done {
    core: usize,
    /// `None` if the synth was lost to a panic.
    synth: Option<Box<dyn Synth>>,
    buffer: Vec<Stereo<f32>>,
    result: Result<Rendered, RenderError>,
}

impl Job {
    fn run(mut self) -> Done {
        self.buffer.clear();
        self.buffer.resize(self.frames, Stereo::SILENCE);
        let result = self.synth.render(&mut self.buffer, self.max_time);
        Done {
            core: self.core,
            synth: Some(self.synth),
            buffer: self.buffer,
            result,
        }
    }

    /// Run the job, turning a panic of the synth into a lost synth.
    fn run_guarded(self) -> Done {
        let core = self.core;
        match panic::catch_unwind(AssertUnwindSafe(|| self.run())) {
            Ok(done) => done,
            Err(_) => {
                warn!("The synth of core {} panicked while rendering", core);
                Done {
                    core,
                    synth: None,
                    buffer: Vec::new(),
                    result: Err(RenderError::new(Rendered::default(), RenderErrorKind::WorkerLost)),
                }
            }
        }
    }
}

fn worker(jobs: Receiver<Job>, done: Sender<Done>) {
    for job in jobs.iter() {
        if done.send(job.run_guarded()).is_err() {
            break;
        }
    }
}

struct Pool {
    jobs: Option<Sender<Job>>,
    done: Receiver<Done>,
    handles: Vec<JoinHandle<()>>,
}

impl Pool {
    /// Start up to `size` workers. Returns `None` if no thread could be
    /// spawned at all.
    fn start(size: usize) -> Option<Self> {
        let (job_tx, job_rx) = bounded::<Job>(MAX_CORES);
        let (done_tx, done_rx) = bounded::<Done>(MAX_CORES);
        let mut handles = Vec::with_capacity(size);
        for id in 0..size {
            let jobs = job_rx.clone();
            let done = done_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("sointu-worker-{}", id))
                .spawn(move || worker(jobs, done));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    warn!("Could not spawn render worker {}: {}", id, err);
                    break;
                }
            }
        }
        if handles.is_empty() {
            return None;
        }
        debug!("Started {} render workers", handles.len());
        Some(Self {
            jobs: Some(job_tx),
            done: done_rx,
            handles,
        })
    }

    fn stop(&mut self) {
        // workers exit once the job channel is closed
        self.jobs = None;
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("A render worker panicked");
            }
        }
    }
}

/// Creates [`ParallelSynth`]s that render the cores of a patch with synths
/// from an inner synther.
#[derive(Clone)]
pub struct ParallelSynther {
    inner: Arc<dyn Synther + Send + Sync>,
    name: String,
    workers: usize,
}

impl ParallelSynther {
    pub fn new<S: Synther + Send + Sync + 'static>(inner: S) -> Self {
        let name = format!("parallel {}", inner.name());
        Self {
            inner: Arc::new(inner),
            name,
            workers: num_cpus::get().max(1),
        }
    }

    /// Override the size of the worker pool. Zero renders on the calling
    /// thread.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}

impl Synther for ParallelSynther {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_parallelism(&self) -> bool {
        true
    }

    fn synth(&self, patch: &Patch, bpm: usize) -> Result<Box<dyn Synth>, CompileError> {
        let split = CoreSplit::new(patch);
        let synths = split.synths(&*self.inner, bpm)?;
        let workers = self.workers.min(MAX_CORES);
        let pool = if workers > 1 { Pool::start(workers) } else { None };
        debug!(
            "Split patch into {} cores, rendering on {} workers",
            synths.len(),
            pool.as_ref().map_or(0, |p| p.handles.len())
        );
        Ok(Box::new(ParallelSynth {
            inner: Arc::clone(&self.inner),
            synths,
            buffers: vec![Vec::new(); split.patches.len()],
            mapping: split.mapping,
            pool,
            load: CpuLoad::default(),
        }))
    }
}

/// A synth rendering sub-patches concurrently.
pub struct ParallelSynth {
    inner: Arc<dyn Synther + Send + Sync>,
    /// `None` while the synth of a core is out at a worker, or after it
    /// panicked.
    synths: Vec<Option<Box<dyn Synth>>>,
    buffers: Vec<Vec<Stereo<f32>>>,
    mapping: VoiceMapping,
    pool: Option<Pool>,
    load: CpuLoad,
}

impl ParallelSynth {
    fn for_each_mapped<F: FnMut(&mut dyn Synth, usize)>(&mut self, voice: usize, mut f: F) {
        for (synth, voices) in self.synths.iter_mut().zip(&self.mapping) {
            if let (Some(synth), Some(Some(local))) = (synth, voices.get(voice)) {
                f(synth.as_mut(), *local);
            }
        }
    }

    /// Render every core and return, per core, the result together with its
    /// scratch buffer.
    fn render_cores(&mut self, frames: usize, max_time: i64) -> Vec<Done> {
        let mut jobs = Vec::with_capacity(self.synths.len());
        let mut done = Vec::with_capacity(self.synths.len());
        for (core, (synth, buffer)) in self.synths.iter_mut().zip(&mut self.buffers).enumerate() {
            if let Some(synth) = synth.take() {
                trace!("Rendering {} frames of core {}", frames, core);
                jobs.push(Job {
                    core,
                    synth,
                    buffer: std::mem::take(buffer),
                    frames,
                    max_time,
                });
            }
        }
        let sender = self.pool.as_ref().and_then(|p| p.jobs.as_ref());
        let mut sent = 0;
        for job in jobs {
            match sender {
                Some(sender) => match sender.send(job) {
                    Ok(()) => sent += 1,
                    Err(returned) => done.push(returned.0.run_guarded()),
                },
                None => done.push(job.run_guarded()),
            }
        }
        if let Some(pool) = &self.pool {
            for _ in 0..sent {
                match pool.done.recv() {
                    Ok(result) => done.push(result),
                    Err(_) => break,
                }
            }
        }
        done
    }
}

impl Synth for ParallelSynth {
    fn trigger(&mut self, voice: usize, note: u8) {
        self.for_each_mapped(voice, |synth, local| synth.trigger(local, note));
    }

    fn release(&mut self, voice: usize) {
        self.for_each_mapped(voice, |synth, local| synth.release(local));
    }

    fn update(&mut self, patch: &Patch, bpm: usize) -> Result<(), CompileError> {
        let split = CoreSplit::new(patch);
        if split.mapping != self.mapping || self.synths.iter().any(Option::is_none) {
            debug!("Core split changed, rebuilding {} synths", split.patches.len());
            let synths = split.synths(&*self.inner, bpm)?;
            for synth in self.synths.iter_mut().flatten() {
                synth.close();
            }
            self.synths = synths;
            self.buffers.resize(split.patches.len(), Vec::new());
            self.mapping = split.mapping;
            return Ok(());
        }
        // every core must compile before any of them changes
        for (core, sub_patch) in split.patches.iter().enumerate() {
            Bytecode::new(sub_patch, &AllFeatures, bpm).map_err(|err| split.patch_error(core, err))?;
        }
        for (core, (synth, sub_patch)) in self.synths.iter_mut().zip(&split.patches).enumerate() {
            if let Some(synth) = synth {
                synth
                    .update(sub_patch, bpm)
                    .map_err(|err| split.patch_error(core, err))?;
            }
        }
        Ok(())
    }

    fn render(&mut self, buffer: &mut [Stereo<f32>], max_time: i64) -> Result<Rendered, RenderError> {
        let start = Instant::now();
        let expected = self.synths.len();
        let results = self.render_cores(buffer.len(), max_time);
        for frame in buffer.iter_mut() {
            *frame = Stereo::SILENCE;
        }
        let mut rendered: Option<Rendered> = None;
        let mut error = None;
        let returned = results.len();
        for done in results {
            let progress = match &done.result {
                Ok(progress) => *progress,
                Err(err) => {
                    if error.is_none() {
                        error = Some(err.kind.clone());
                    }
                    err.rendered
                }
            };
            for (out, frame) in buffer.iter_mut().zip(&done.buffer[..progress.samples]) {
                *out += *frame;
            }
            rendered = Some(match rendered {
                Some(r) => Rendered {
                    samples: r.samples.min(progress.samples),
                    time: r.time.min(progress.time),
                },
                None => progress,
            });
            self.synths[done.core] = done.synth;
            self.buffers[done.core] = done.buffer;
        }
        let rendered = rendered.unwrap_or_default();
        self.load = CpuLoad::measure(start.elapsed(), rendered.samples);
        if returned < expected && error.is_none() {
            error = Some(RenderErrorKind::WorkerLost);
        }
        match error {
            Some(kind) => Err(RenderError::new(rendered, kind)),
            None => Ok(rendered),
        }
    }

    fn close(&mut self) {
        if let Some(mut pool) = self.pool.take() {
            pool.stop();
        }
        for synth in self.synths.iter_mut().flatten() {
            synth.close();
        }
    }

    fn num_cores(&self) -> usize {
        self.synths.len()
    }

    fn cpu_load(&self, loads: &mut [CpuLoad]) -> usize {
        let mut written = 0;
        for (synth, load) in self.synths.iter().zip(loads.iter_mut()) {
            let mut core = [CpuLoad::default()];
            *load = match synth {
                Some(synth) if synth.cpu_load(&mut core) > 0 => core[0],
                _ => self.load,
            };
            written += 1;
        }
        written
    }
}

impl Drop for ParallelSynth {
    fn drop(&mut self) {
        self.close();
    }
}
