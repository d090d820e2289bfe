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

//! The shared table of delay times.
//!
//! Every delay unit only stores where its delay times start in one global
//! table, so units with identical or overlapping delay times share entries.

use sointu_core::song::SAMPLE_RATE;
use sointu_core::Patch;

/// Above this many arrays the pairwise search gets too slow, and the first
/// two arrays are merged without looking for the best pair.
const MAX_MERGES: usize = 1000;

/// Length of the longest suffix of `a` that is a prefix of `b` (or all of
/// `b`, if `b` is contained in `a`), and where in `a` that overlap starts.
fn overlap(a: &[i32], b: &[i32]) -> (usize, usize) {
    let mut min_shift = a.len();
    for shift in (0..a.len()).rev() {
        let end = a.len().min(b.len() + shift);
        if (shift..end).all(|k| a[k] == b[k - shift]) {
            min_shift = shift;
        }
    }
    ((a.len() - min_shift).min(b.len()), min_shift)
}

/// Find a short array containing every given array as a contiguous run.
///
/// Returns the super array and the start index of every input array in it.
/// Empty arrays start at 0. The search is greedy, so the result is small but
/// not necessarily the shortest possible.
///
/// ```
/// # use sointu_vm::delaytable::find_super_array;
/// let (table, starts) = find_super_array(&[vec![4, 5, 6], vec![1, 2, 3], vec![3, 4]]);
/// assert_eq!(table, vec![1, 2, 3, 4, 5, 6]);
/// assert_eq!(starts, vec![3, 0, 2]);
/// ```
pub fn find_super_array(arrays: &[Vec<i32>]) -> (Vec<i32>, Vec<usize>) {
    let mut slice_numbers: Vec<Option<usize>> = Vec::with_capacity(arrays.len());
    let mut start_indices = vec![0; arrays.len()];
    let mut processed: Vec<Vec<i32>> = Vec::new();
    for array in arrays {
        if array.is_empty() {
            slice_numbers.push(None);
        } else {
            slice_numbers.push(Some(processed.len()));
            processed.push(array.clone());
        }
    }
    if processed.is_empty() {
        return (Vec::new(), start_indices);
    }
    while processed.len() > 1 {
        let (max_i, max_j, max_overlap, max_shift) = if processed.len() < MAX_MERGES {
            let mut best: Option<(usize, usize, usize, usize)> = None;
            for i in 0..processed.len() {
                for j in 0..processed.len() {
                    if i == j {
                        continue;
                    }
                    let (o, shift) = overlap(&processed[i], &processed[j]);
                    if best.map_or(true, |(_, _, best_o, _)| o > best_o) {
                        best = Some((i, j, o, shift));
                    }
                }
            }
            // there are at least two arrays, so some pair was looked at
            best.unwrap_or((0, 1, 0, processed[0].len()))
        } else {
            let (o, shift) = overlap(&processed[0], &processed[1]);
            (0, 1, o, shift)
        };
        for (number, start) in slice_numbers.iter_mut().zip(start_indices.iter_mut()) {
            if let Some(n) = number {
                if *n == max_j {
                    *n = max_i;
                    *start += max_shift;
                }
                if *n > max_j {
                    *n -= 1;
                }
            }
        }
        let merged = processed.remove(max_j);
        let target = if max_i > max_j { max_i - 1 } else { max_i };
        if max_overlap < merged.len() {
            processed[target].extend_from_slice(&merged[max_overlap..]);
        }
    }
    (processed.remove(0), start_indices)
}

/// Convert a delay time given in 48ths of a beat to samples at a tempo.
fn bpm_synced(value: i32, bpm: usize) -> i32 {
    let samples = SAMPLE_RATE as i64 * 60 * value as i64 / 48 / bpm.max(1) as i64;
    samples.min(65535) as i32
}

/// Build the delay time table of a patch.
///
/// Returns the table and, for every instrument and unit, the start index of
/// the unit's delay times. Entries of units other than enabled delays are 0.
pub fn construct_delay_time_table(patch: &Patch, bpm: usize) -> (Vec<u16>, Vec<Vec<usize>>) {
    let mut arrays = Vec::new();
    let mut array_index = Vec::with_capacity(patch.len());
    for instr in patch.iter() {
        let mut indices = vec![None; instr.units.len()];
        for (u, unit) in instr.units.iter().enumerate() {
            if unit.unit_type != "delay" || unit.disabled {
                continue;
            }
            indices[u] = Some(arrays.len());
            let times: Vec<i32> = if unit.param("notetracking") == 2 {
                unit.var_args.iter().map(|&t| bpm_synced(t, bpm)).collect()
            } else {
                unit.var_args.clone()
            };
            arrays.push(times);
        }
        array_index.push(indices);
    }
    let (table, starts) = find_super_array(&arrays);
    let unit_indices = array_index
        .into_iter()
        .map(|indices| {
            indices
                .into_iter()
                .map(|index| index.map_or(0, |i| starts[i]))
                .collect()
        })
        .collect();
    (table.into_iter().map(|t| t as u16).collect(), unit_indices)
}

#[cfg(test)]
mod test {
    use super::*;
    use sointu_core::{Instrument, Unit};

    fn check_contains(arrays: &[Vec<i32>]) -> Vec<i32> {
        let (table, starts) = find_super_array(arrays);
        for (array, start) in arrays.iter().zip(starts.iter()) {
            assert_eq!(&table[*start..*start + array.len()], &array[..]);
        }
        table
    }

    #[test]
    fn test_overlap() {
        assert_eq!(overlap(&[1, 2, 3], &[3, 4]), (1, 2));
        assert_eq!(overlap(&[1, 2, 3], &[2, 3]), (2, 1));
        assert_eq!(overlap(&[1, 2, 3], &[5]), (0, 3));
        assert_eq!(overlap(&[1, 2, 3, 4], &[2, 3]), (2, 1));
    }

    #[test]
    fn test_identical_and_contained() {
        let table = check_contains(&[vec![1116, 1188, 1276], vec![1116, 1188, 1276], vec![1188]]);
        assert_eq!(table, vec![1116, 1188, 1276]);
    }

    #[test]
    fn test_empty_arrays() {
        let (table, starts) = find_super_array(&[vec![], vec![7, 8], vec![]]);
        assert_eq!(table, vec![7, 8]);
        assert_eq!(starts, vec![0, 0, 0]);
        let (table, starts) = find_super_array(&[]);
        assert!(table.is_empty());
        assert!(starts.is_empty());
    }

    #[test]
    fn test_many_arrays() {
        let arrays: Vec<Vec<i32>> = (0..40).map(|i| vec![i % 7, i % 5, i % 3]).collect();
        let table = check_contains(&arrays);
        assert!(table.len() <= 40 * 3);
    }

    #[test]
    fn test_patch_table() {
        let patch: Patch = vec![
            Instrument::new(
                1,
                vec![
                    Unit::new("oscillator"),
                    Unit::new("delay").with_var_args(&[3, 4]),
                ],
            ),
            Instrument::new(
                1,
                vec![
                    Unit::new("delay").with_var_args(&[1, 2, 3]),
                    Unit {
                        disabled: true,
                        ..Unit::new("delay").with_var_args(&[9])
                    },
                    Unit::new("delay")
                        .with("notetracking", 2)
                        .with_var_args(&[48, 1_000_000]),
                ],
            ),
        ]
        .into();
        let (table, indices) = construct_delay_time_table(&patch, 120);
        assert_eq!(indices[0][0], 0);
        assert_eq!(&table[indices[0][1]..indices[0][1] + 2], &[3, 4]);
        assert_eq!(&table[indices[1][0]..indices[1][0] + 3], &[1, 2, 3]);
        assert_eq!(indices[1][1], 0);
        assert_eq!(
            &table[indices[1][2]..indices[1][2] + 2],
            &[22050, 65535]
        );
        assert!(!table.contains(&9));
    }
}
