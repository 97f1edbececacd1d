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

//! The message shape exchanged with the job source / device manager. Jobs
//! come in and solutions plus periodic hash-rate reports go out in the same
//! structure.

use serde::{Deserialize, Serialize};

/// Highest sequence number a chip can echo back
pub const SEQ_MAX: u32 = 255;

/// Sequence value marking a synthetic hash-rate update rather than a
/// solution
pub const SEQ_HASHRATE_UPDATE: u32 = 9999;

/// Size of the per-chip report vectors (chip ids are sparse bytes)
pub const CHIP_MAX: usize = 256;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Message {
    /// Job sequence tag, or `SEQ_HASHRATE_UPDATE`
    pub seq: u32,
    /// Compact difficulty (nbits) of the job or hit
    pub diff: u32,
    /// Chip that produced a solution
    pub chip: u32,
    /// Engine within the chip that produced a solution
    pub engine: u32,
    /// Hash board the message belongs to
    pub board: u32,
    /// Per-chip true-hit totals since the last report, indexed by wire id
    pub true_hit: Vec<u64>,
    /// Per-chip general-hit totals since the last report, indexed by wire id
    pub gen_hit: Vec<u64>,
    /// Per-chip hit rate in percent, indexed by wire id
    pub hit_rate: Vec<f32>,
    /// 80-byte block header (job in, winning header out), hex encoded
    pub body: String,
    /// Pool version-rolling mask for jobs
    pub version_mask: u32,
}

impl Message {
    /// Shell of a periodic hash-rate update with report vectors allocated
    pub fn hashrate_update(board: u32) -> Self {
        Self {
            seq: SEQ_HASHRATE_UPDATE,
            board,
            true_hit: vec![0; CHIP_MAX],
            gen_hit: vec![0; CHIP_MAX],
            hit_rate: vec![0.0; CHIP_MAX],
            ..Default::default()
        }
    }

    pub fn is_hashrate_update(&self) -> bool {
        self.seq == SEQ_HASHRATE_UPDATE
    }
}
