// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Logical chip grid and the batch register executor.
//!
//! Chips sit in a serpentine layout over four vertical board sections of 11
//! rows by 3 columns (taller boards carry 50 rows). Even rows take ids from
//! the low range, odd rows from the high range. Partitions group chips so
//! that frequency sweeps can be staggered by column and spread bus load.

use crate::aura::{self, ChipAddress};
use crate::chain::{AsicRw as _, NO_RESPONSE_LIMIT};
use crate::error::{self, ErrorKind};
use crate::logging::macros::*;
use crate::registry::BoardRegistry;

/// One chip position on the grid
#[derive(Clone, Debug)]
pub struct Entry {
    pub board: u8,
    pub row: usize,
    pub col: usize,
    /// Wire chip id
    pub id: u8,
    /// Derived logical position
    pub x: i32,
    pub y: i32,
    /// Per-chip temperature calibration
    pub temp_y: f32,
    pub temp_k: f32,
    pub temperature: f32,
    pub frequency: f32,
    /// Hit rate as a ratio (0..1)
    pub hitrate: f32,
    pub voltage: f32,
    pub voltage_gain: f32,
    pub voltage_offset: f32,
    pub bad_temp_ctr: u32,
    pub bad_volt_ctr: u32,
    pub no_response_ctr: u32,
}

impl Entry {
    pub fn temp(&self, raw: i64) -> f32 {
        let raw = (raw & 0xffff) as f32;
        (raw - 0.5) * self.temp_y / 4096.0 + self.temp_k
    }

    /// Raw sensor value for a temperature, with this chip's calibration
    pub fn inverse_temp(&self, temp: f32) -> u32 {
        (((temp - self.temp_k) / self.temp_y * 4096.0) as i64 & 0xffff) as u32
    }

    pub fn voltage_from_raw(&self, raw: i64) -> f32 {
        (raw & 0xffff) as f32 * self.voltage_gain + self.voltage_offset
    }
}

/// Serpentine positions for one board. Rows alternate direction within
/// each of the four sections; even rows draw ids from the low range, odd
/// rows from the high range.
pub fn create_board_topology(board: u8, tall_board: bool) -> Vec<Entry> {
    let row_count = if tall_board { 50 } else { 44 };
    let mut left_count = 0u8;
    let mut right_count = 128u8;
    let mut entries = Vec::with_capacity(row_count * 3);

    for r in 0..row_count {
        for c in 0..3usize {
            let (x, y) = if r < 11 {
                let direction = r & 1 != 0;
                let x = if direction { 2 - c } else { c };
                (x as i32, r as i32)
            } else if r < 22 {
                let direction = r & 1 == 0;
                let x = 3 + if direction { 2 - c } else { c };
                (x as i32, 21 - r as i32)
            } else if r < 33 {
                let direction = r & 1 != 0;
                let x = 6 + if direction { 2 - c } else { c };
                (x as i32, r as i32 - 22)
            } else {
                let direction = r & 1 == 0;
                let x = 9 + if direction { 2 - c } else { c };
                (x as i32, 43 - r as i32)
            };

            let id = if r & 1 == 0 {
                let id = left_count;
                left_count += 1;
                id
            } else {
                let id = right_count;
                right_count += 1;
                id
            };

            entries.push(Entry {
                board,
                row: r,
                col: c,
                id,
                x,
                y,
                temp_y: aura::TEMP_Y as f32,
                temp_k: aura::TEMP_K as f32,
                temperature: 0.0,
                frequency: crate::config::MIN_FREQ,
                hitrate: 0.0,
                voltage: 0.0,
                voltage_gain: aura::DEFAULT_VOLT_GAIN,
                voltage_offset: aura::DEFAULT_VOLT_OFFSET,
                bad_temp_ctr: 0,
                bad_volt_ctr: 0,
                no_response_ctr: 0,
            });
        }
    }
    entries
}

/// The whole system grid plus the column/row partitions
pub struct Topology {
    pub entries: Vec<Entry>,
    pub num_boards: usize,
    pub num_rows: usize,
    pub num_cols: usize,
    /// `num_cols * 4` buckets; bucket `i` holds the chips in column `i/4`
    /// whose row is `i % 4` modulo 4
    pub partitions: Vec<Vec<usize>>,
}

impl Topology {
    pub fn build(boards: &[(u8, bool)]) -> error::Result<Topology> {
        let mut entries = Vec::new();
        for &(board, tall) in boards {
            entries.extend(create_board_topology(board, tall));
        }
        entries.sort_by(|a, b| (a.board, a.row, a.col).cmp(&(b.board, b.row, b.col)));

        let num_boards = boards.len();
        let num_rows = entries.iter().map(|e| e.row + 1).max().unwrap_or(0);
        let num_cols = entries.iter().map(|e| e.col + 1).max().unwrap_or(0);

        let mut partitions = Vec::with_capacity(num_cols * 4);
        for i in 0..num_cols * 4 {
            let bucket: Vec<usize> = entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.col == i / 4 && e.row % 4 == i % 4)
                .map(|(k, _)| k)
                .collect();
            partitions.push(bucket);
        }
        let covered: usize = partitions.iter().map(|p| p.len()).sum();
        if covered != entries.len() {
            Err(ErrorKind::General(
                "partitioning does not cover the topology".to_string(),
            ))?
        }

        Ok(Topology {
            entries,
            num_boards,
            num_rows,
            num_cols,
            partitions,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn chip_index(&self, board: u8, id: u8) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.board == board && e.id == id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BatchAction {
    Nop,
    Read,
    Write,
    ReadWrite,
}

/// One queued register operation. `id` of -1 addresses every chip on the
/// board via broadcast.
#[derive(Clone, Debug)]
pub struct BatchOp {
    pub board: u8,
    pub id: i32,
    pub addr: u8,
    pub data: u32,
    pub action: BatchAction,
}

/// Ordered register batch executed against the board registry. Operations
/// touching a dead board short-circuit with an all-ones data marker;
/// per-chip read failures are accumulated on the topology entries.
#[derive(Default)]
pub struct Batch {
    pub ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add(&mut self, board: u8, id: i32, addr: u8, data: u32, action: BatchAction) {
        self.ops.push(BatchOp {
            board,
            id,
            addr,
            data,
            action,
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub async fn execute(
        &mut self,
        boards: &BoardRegistry,
        topology: &mut Topology,
    ) -> error::Result<()> {
        for op in self.ops.iter_mut() {
            let chain = match boards.get(op.board) {
                Some(chain) => chain.clone(),
                None => {
                    op.data = 0xffff_ffff;
                    continue;
                }
            };
            if chain.is_dead() {
                op.data = 0xffff_ffff;
                continue;
            }

            match op.action {
                BatchAction::Nop => {}
                BatchAction::Read | BatchAction::ReadWrite => {
                    if op.id < 0 {
                        error!("batch read of board {} cannot be broadcast", op.board);
                        continue;
                    }
                    let chip = op.id as u8;
                    let result = if op.action == BatchAction::Read {
                        chain.reg_read(chip, op.addr).await
                    } else {
                        chain.reg_read_write(chip, op.addr, op.data).await
                    };
                    let index = topology.chip_index(op.board, chip);
                    match result {
                        Ok(value) => {
                            op.data = value;
                            if let Some(index) = index {
                                let entry = &mut topology.entries[index];
                                if entry.no_response_ctr >= NO_RESPONSE_LIMIT {
                                    info!(
                                        "dead chip {}/{} is back to life after {} missed responses",
                                        op.board, chip, entry.no_response_ctr
                                    );
                                }
                                entry.no_response_ctr = 0;
                            }
                        }
                        Err(_) => {
                            op.data = 0xffff_ffff;
                            if let Some(index) = index {
                                let entry = &mut topology.entries[index];
                                entry.no_response_ctr += 1;
                                if entry.no_response_ctr == NO_RESPONSE_LIMIT {
                                    error!("dead chip {}/{} detected", op.board, chip);
                                }
                            }
                        }
                    }
                }
                BatchAction::Write => {
                    let addr = if op.id < 0 {
                        ChipAddress::All
                    } else {
                        ChipAddress::One(op.id as u8)
                    };
                    if let Err(e) = chain.reg_write(addr, op.addr, op.data) {
                        error!(
                            "batch write board {} id {} addr {:#x} failed: {}",
                            op.board, op.id, op.addr, e
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::aura::ChipIdMap;

    #[test]
    fn test_board_topology_id_assignment() {
        let entries = create_board_topology(1, false);
        assert_eq!(entries.len(), 132);
        // even rows take the low id range, odd rows the high one
        let low: Vec<u8> = entries
            .iter()
            .filter(|e| e.row % 2 == 0)
            .map(|e| e.id)
            .collect();
        let high: Vec<u8> = entries
            .iter()
            .filter(|e| e.row % 2 == 1)
            .map(|e| e.id)
            .collect();
        assert_eq!(low.len(), 66);
        assert_eq!(high.len(), 66);
        assert_eq!(*low.iter().min().expect("empty"), 0);
        assert_eq!(*low.iter().max().expect("empty"), 65);
        assert_eq!(*high.iter().min().expect("empty"), 128);
        assert_eq!(*high.iter().max().expect("empty"), 193);
        // every id sits inside the expected id map
        let map = ChipIdMap::default();
        for entry in &entries {
            assert!(map.id_to_index(entry.id).is_some());
        }
    }

    #[test]
    fn test_board_topology_serpentine_positions() {
        let entries = create_board_topology(1, false);
        let at = |row: usize, col: usize| {
            entries
                .iter()
                .find(|e| e.row == row && e.col == col)
                .expect("missing entry")
        };
        // first section walks straight, odd rows reverse
        assert_eq!((at(0, 0).x, at(0, 0).y), (0, 0));
        assert_eq!((at(0, 2).x, at(0, 2).y), (2, 0));
        assert_eq!((at(1, 0).x, at(1, 0).y), (2, 1));
        // second section mirrors vertically
        assert_eq!(at(11, 0).y, 10);
        assert_eq!(at(21, 0).y, 0);
        // sections shift the x origin by three columns each
        assert!(entries.iter().filter(|e| e.row < 11).all(|e| e.x < 3));
        assert!(entries
            .iter()
            .filter(|e| e.row >= 11 && e.row < 22)
            .all(|e| e.x >= 3 && e.x < 6));
        assert!(entries
            .iter()
            .filter(|e| e.row >= 33)
            .all(|e| e.x >= 9 && e.x < 12));
    }

    #[test]
    fn test_tall_board_row_count() {
        let entries = create_board_topology(2, true);
        assert_eq!(entries.len(), 150);
        assert_eq!(entries.iter().map(|e| e.row).max(), Some(49));
    }

    #[test]
    fn test_partitions_cover_everything_once() {
        let topology = Topology::build(&[(1, false)]).expect("build failed");
        assert_eq!(topology.num_cols, 3);
        assert_eq!(topology.num_rows, 44);
        assert_eq!(topology.partitions.len(), 12);
        let mut seen = vec![0u32; topology.len()];
        for bucket in &topology.partitions {
            for &index in bucket {
                seen[index] += 1;
            }
        }
        assert!(seen.iter().all(|&n| n == 1));
        // a bucket never holds two chips from the same row
        for bucket in &topology.partitions {
            let mut rows: Vec<usize> = bucket.iter().map(|&i| topology.entries[i].row).collect();
            rows.sort_unstable();
            rows.dedup();
            assert_eq!(rows.len(), bucket.len());
        }
    }

    #[test]
    fn test_chip_index_lookup() {
        let topology = Topology::build(&[(1, false)]).expect("build failed");
        let index = topology.chip_index(1, 0).expect("chip 0 missing");
        let entry = &topology.entries[index];
        assert_eq!(entry.row, 0);
        assert_eq!(entry.col, 0);
        assert_eq!(topology.chip_index(1, 66), None);
        assert_eq!(topology.chip_index(9, 0), None);
    }

    #[test]
    fn test_temperature_calibration_round_trip() {
        let entries = create_board_topology(1, false);
        let entry = &entries[0];
        let raw = entry.inverse_temp(75.0);
        let back = entry.temp(i64::from(raw));
        assert!((back - 75.0).abs() < 0.25, "75C round-tripped to {}", back);
    }
}
