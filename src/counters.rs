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

//! Hit-counter snapshot ring for estimating hashrate.
//!
//! The chip counters are free running; every capture turns the raw totals
//! into per-chip deltas, sanity-clamps them and stores them in a short ring.
//! A report cursor trails the write cursor so the periodic hash-rate update
//! can sum exactly the snapshots nobody has seen yet.

use std::time::{Duration, Instant};

/// Snapshots retained; one minute of history at the 5 s cadence
pub const STATS_RING_SIZE: usize = 12;

/// Cadence of counter captures
pub const CNT_READ_INTERVAL: Duration = Duration::from_secs(5);

/// About 3x the most hits a single chip can produce in one capture period.
/// Deltas above this are readout glitches, not hashing.
pub const HIT_MAX: u32 = 2000;

/// One capture period worth of per-chip deltas
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub elapsed: Duration,
    pub total_ghits: u32,
    pub total_thits: u32,
    pub delta_ghits: Vec<u32>,
    pub delta_thits: Vec<u32>,
    /// Per-chip hit rate in percent as of this capture
    pub hit_rates: Vec<f32>,
}

impl Snapshot {
    fn new(chip_slots: usize) -> Self {
        Self {
            delta_ghits: vec![0; chip_slots],
            delta_thits: vec![0; chip_slots],
            hit_rates: vec![0.0; chip_slots],
            ..Default::default()
        }
    }
}

/// Aggregate of all unreported snapshots, indexed by chip-table slot
#[derive(Clone, Debug, Default)]
pub struct Report {
    pub gen_hit: Vec<u64>,
    pub true_hit: Vec<u64>,
    pub hit_rate: Vec<f32>,
}

pub struct HitStats {
    ring: Vec<Snapshot>,
    cursor: usize,
    report_cursor: usize,
    /// Last raw counter totals, used to compute deltas
    thits: Vec<u32>,
    ghits: Vec<u32>,
    /// Latest per-chip hit rate in percent
    rates: Vec<f32>,
    last_capture: Instant,
}

impl HitStats {
    pub fn new(chip_slots: usize) -> Self {
        Self {
            ring: (0..STATS_RING_SIZE).map(|_| Snapshot::new(chip_slots)).collect(),
            cursor: 0,
            report_cursor: 0,
            thits: vec![0; chip_slots],
            ghits: vec![0; chip_slots],
            rates: vec![0.0; chip_slots],
            last_capture: Instant::now(),
        }
    }

    /// Is the next capture due?
    pub fn due(&self) -> bool {
        self.last_capture.elapsed() >= CNT_READ_INTERVAL
    }

    pub fn last_capture(&self) -> Instant {
        self.last_capture
    }

    /// Latest hit rate of one chip slot in percent
    pub fn chip_rate(&self, slot: usize) -> f32 {
        self.rates.get(slot).copied().unwrap_or(0.0)
    }

    /// Turn one round of raw counter reads into a ring snapshot.
    ///
    /// A slot value below zero means the chip did not respond; its delta is
    /// zero and its raw total is left alone so the next good read absorbs
    /// the gap. Deltas above `HIT_MAX` are replaced: slot 0 drops to zero,
    /// anything else inherits its neighbor's delta.
    pub fn capture(&mut self, thit_reads: &[i64], ghit_reads: &[i64]) -> &Snapshot {
        let chip_slots = self.thits.len();
        let mut snap = Snapshot::new(chip_slots);
        snap.elapsed = self.last_capture.elapsed();

        for i in 0..chip_slots {
            let read = thit_reads.get(i).copied().unwrap_or(-1);
            if read < 0 {
                snap.delta_thits[i] = 0;
                continue;
            }
            let mut delta = (read as u32).wrapping_sub(self.thits[i]);
            if delta > HIT_MAX {
                delta = if i == 0 { 0 } else { snap.delta_thits[i - 1] };
            }
            snap.delta_thits[i] = delta;
            snap.total_thits += delta;
            self.thits[i] = read as u32;
        }

        for i in 0..chip_slots {
            let read = ghit_reads.get(i).copied().unwrap_or(-1);
            if read < 0 {
                snap.delta_ghits[i] = 0;
                continue;
            }
            let mut delta = (read as u32).wrapping_sub(self.ghits[i]);
            if delta > HIT_MAX {
                delta = if i == 0 { 0 } else { snap.delta_ghits[i - 1] };
            }
            snap.delta_ghits[i] = delta;
            if delta > 0 {
                snap.total_ghits += delta;
                self.rates[i] = snap.delta_thits[i] as f32 * 100.0 / delta as f32;
            }
            self.ghits[i] = read as u32;
        }
        snap.hit_rates = self.rates.clone();

        self.ring[self.cursor] = snap;
        let stored = self.cursor;
        self.cursor = (self.cursor + 1) % STATS_RING_SIZE;
        self.last_capture = Instant::now();
        &self.ring[stored]
    }

    pub fn has_unreported(&self) -> bool {
        self.report_cursor != self.cursor
    }

    /// Sum every snapshot between the report cursor and the write cursor
    /// and advance the report cursor.
    pub fn take_report(&mut self) -> Report {
        let chip_slots = self.thits.len();
        let mut report = Report {
            gen_hit: vec![0; chip_slots],
            true_hit: vec![0; chip_slots],
            hit_rate: vec![0.0; chip_slots],
        };
        let mut i = self.report_cursor;
        while i != self.cursor {
            let snap = &self.ring[i];
            for j in 0..chip_slots {
                report.gen_hit[j] += u64::from(snap.delta_ghits[j]);
                report.true_hit[j] += u64::from(snap.delta_thits[j]);
                report.hit_rate[j] = snap.hit_rates[j];
            }
            i = (i + 1) % STATS_RING_SIZE;
        }
        self.report_cursor = self.cursor;
        report
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_capture_deltas_and_rates() {
        let mut stats = HitStats::new(2);
        stats.capture(&[80, 190], &[100, 200]);
        let report = stats.take_report();
        assert_eq!(report.gen_hit, vec![100, 200]);
        assert_eq!(report.true_hit, vec![80, 190]);
        assert!((report.hit_rate[0] - 80.0).abs() < 1e-3);
        assert!((report.hit_rate[1] - 95.0).abs() < 1e-3);
    }

    /// Report aggregates every unreported snapshot, then resets
    #[test]
    fn test_report_cursor_aggregation() {
        let mut stats = HitStats::new(1);
        stats.capture(&[80], &[100]);
        stats.capture(&[160], &[200]);
        stats.capture(&[240], &[300]);
        assert!(stats.has_unreported());
        let report = stats.take_report();
        assert_eq!(report.gen_hit[0], 300);
        assert_eq!(report.true_hit[0], 240);
        assert!(!stats.has_unreported());
        // nothing new means an empty report
        let report = stats.take_report();
        assert_eq!(report.gen_hit[0], 0);
    }

    /// Counter glitches clamp to zero (slot 0) or the neighbor's delta
    #[test]
    fn test_delta_clamping() {
        let mut stats = HitStats::new(3);
        stats.capture(&[10, 10, 10], &[20, 20, 20]);
        // chip 1 jumps way past HIT_MAX, chip 0 too
        let snap = stats.capture(&[100_000, 100_000, 20], &[100_000, 100_000, 40]);
        assert_eq!(snap.delta_thits[0], 0);
        assert_eq!(snap.delta_thits[1], 0); // inherited from slot 0
        assert_eq!(snap.delta_thits[2], 10);
        assert_eq!(snap.delta_ghits[2], 20);
    }

    /// Non-responding chips produce a zero delta and keep their total
    #[test]
    fn test_no_response_slots() {
        let mut stats = HitStats::new(2);
        stats.capture(&[100, 100], &[100, 100]);
        let snap = stats.capture(&[-1, 200], &[-1, 200]);
        assert_eq!(snap.delta_thits[0], 0);
        assert_eq!(snap.delta_thits[1], 100);
        // the skipped read is absorbed by the next good one
        let snap = stats.capture(&[300, 300], &[300, 300]);
        assert_eq!(snap.delta_thits[0], 200);
        assert_eq!(snap.delta_thits[1], 100);
    }
}
