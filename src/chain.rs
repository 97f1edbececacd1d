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

//! Hash-chain controller: chip discovery, the register read/write API with
//! pipelined batch reads, job dispatch with version rolling, hit and
//! counter collection, and the faulty-chip bookkeeping.
//!
//! All hardware access from other components goes through the `AsicRw`
//! trait implemented here; the DVFS engine and the device manager hold
//! `Arc<dyn AsicRw>` handles.

use crate::aura::{self, ChipAddress, Register};
use crate::config;
use crate::counters::HitStats;
use crate::error::{self, ErrorKind};
use crate::logging::macros::*;
use crate::message::Message;
use crate::power;
use crate::transport::{Io, Uart, NO_RESPONSE};

use async_trait::async_trait;

use std::collections::{HashMap, VecDeque};
use std::convert::TryInto;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::time::sleep;

/// Idle preamble at discovery, in case chips are mid-frame out of reset
const DISCOVERY_IDLE_BYTES: usize = 100;

/// Counter sampling stops when no job arrived for this long
const MAX_JOB_INTERVAL: Duration = Duration::from_secs(300);

/// Throttle for temperature/voltage/frequency re-reads
const ASIC_READING_DURATION: Duration = Duration::from_secs(2);

/// Minimum spacing of SUMMARY polls
const MIN_POLLING_INTERVAL: Duration = Duration::from_millis(10);

/// SUMMARY registers polled per round, to bound bus latency
const SUMMARY_POLL_BATCH: usize = 44;

/// Version-rolling window is refreshed every so many jobs even without a
/// mask change
const VER_ROLL_REFRESH_JOBS: u64 = 16;

/// Voltage snapshots retained for post-mortem diagnostics
const VOLT_TRACE_LEN: usize = 30;

/// DVM configuration settle time per step
const DVM_SETTLE: Duration = Duration::from_millis(10);

/// Cached-temperature sentinel for chips that did not answer
pub const NO_TEMP: f64 = -1000.0;

/// Consecutive no-response reads before a chip counts as dead
pub const NO_RESPONSE_LIMIT: u32 = 3;

// Faulty-chip tracker thresholds
const ASIC_FAULTY_WINDOW: Duration = Duration::from_secs(10);
const ASIC_FAULTY_THRESHOLD_COUNT: u32 = 10;
const ASIC_FALSE_FAULTY_WINDOW: Duration = Duration::from_secs(10 * 60);
const ASIC_FALSE_FAULTY_THRESHOLD_COUNT: u32 = 3;

/// One slot in the expected-chip table
#[derive(Clone, Debug)]
pub struct ChipEntry {
    pub chip_id: u8,
    pub frequency: f32,
    /// Hit rate in percent
    pub hit_rate: f32,
    pub voltage: f32,
    pub temperature: f32,
    pub volt_gain: f32,
    pub volt_offset: f32,
    pub not_found: bool,
    pub not_responsive: bool,
    pub no_response_ctr: u32,
}

impl ChipEntry {
    fn new(chip_id: u8, not_found: bool) -> Self {
        Self {
            chip_id,
            frequency: 0.0,
            hit_rate: 0.0,
            voltage: 0.0,
            temperature: 0.0,
            volt_gain: 0.0,
            volt_offset: 0.0,
            not_found,
            not_responsive: false,
            no_response_ctr: 0,
        }
    }
}

struct FaultyTracker {
    first_occurrence: Instant,
    counts: u32,
    is_faulty: bool,
    false_bad_checks: u32,
}

/// Tracks chips that keep missing register reads. A chip is faulty after
/// `threshold_count` misses inside `faulty_window`; it can be re-admitted
/// `false_faulty_limit` times once `false_faulty_window` has passed since
/// the last marking, to guard against false positives.
struct FaultyMap {
    chips: HashMap<u8, FaultyTracker>,
    last_marking: Option<Instant>,
    faulty_window: Duration,
    threshold_count: u32,
    false_faulty_window: Duration,
    false_faulty_limit: u32,
}

impl FaultyMap {
    fn new() -> Self {
        Self {
            chips: HashMap::new(),
            last_marking: None,
            faulty_window: ASIC_FAULTY_WINDOW,
            threshold_count: ASIC_FAULTY_THRESHOLD_COUNT,
            false_faulty_window: ASIC_FALSE_FAULTY_WINDOW,
            false_faulty_limit: ASIC_FALSE_FAULTY_THRESHOLD_COUNT,
        }
    }

    fn is_faulty(&self, chip_id: u8) -> bool {
        self.chips
            .get(&chip_id)
            .map(|tracker| tracker.is_faulty)
            .unwrap_or(false)
    }

    fn counts(&self, chip_id: u8) -> u32 {
        self.chips
            .get(&chip_id)
            .map(|tracker| tracker.counts)
            .unwrap_or(0)
    }

    /// Record one missed read. Returns true when the chip just got marked.
    fn update(&mut self, chip_id: u8) -> bool {
        let threshold_count = self.threshold_count;
        let faulty_window = self.faulty_window;
        let tracker = self.chips.entry(chip_id).or_insert_with(|| FaultyTracker {
            first_occurrence: Instant::now(),
            counts: 0,
            is_faulty: false,
            false_bad_checks: 0,
        });
        if tracker.counts == 0 {
            tracker.counts = 1;
            return false;
        }
        if tracker.first_occurrence.elapsed() < faulty_window {
            tracker.counts += 1;
            if tracker.counts == threshold_count {
                tracker.is_faulty = true;
                self.last_marking = Some(Instant::now());
                return true;
            }
        } else {
            *tracker = FaultyTracker {
                first_occurrence: Instant::now(),
                counts: 1,
                is_faulty: false,
                false_bad_checks: 0,
            };
        }
        false
    }

    /// Re-admit a marked chip when the re-admission window has passed.
    /// Returns true if the chip may be used again.
    fn clear(&mut self, chip_id: u8) -> bool {
        let window_passed = self
            .last_marking
            .map(|at| at.elapsed() > self.false_faulty_window)
            .unwrap_or(true);
        let limit = self.false_faulty_limit;
        if let Some(tracker) = self.chips.get_mut(&chip_id) {
            if tracker.false_bad_checks < limit && window_passed {
                tracker.false_bad_checks += 1;
                tracker.first_occurrence = Instant::now();
                tracker.counts = 1;
                tracker.is_faulty = false;
                return true;
            }
        }
        false
    }
}

struct ChainState {
    chips: Vec<ChipEntry>,
    cache_temps: Vec<f64>,
    cache_volts: Vec<f64>,
    cache_freqs: Vec<f64>,
    last_temp_reading: Instant,
    last_volt_reading: Instant,
    last_freq_reading: Instant,
    ver_mask: u32,
    job_count: u64,
    auto_report: bool,
    disable_cd: bool,
    stats: HitStats,
    last_cntr_reading: Instant,
    last_polling: Instant,
    polling_start: usize,
}

/// Discovery and runtime parameters of one chain
#[derive(Clone, Debug)]
pub struct ChainOptions {
    /// Board / chain id, 1-based
    pub board: u8,
    pub chip_map: aura::ChipIdMap,
    /// Highest chip id probed during discovery
    pub max_chip_id: usize,
    pub disable_cd: bool,
    /// Baud rate to switch to once discovery is done
    pub working_baud: u32,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            board: 1,
            chip_map: aura::ChipIdMap::default(),
            max_chip_id: config::MAX_CHIP_ID,
            disable_cd: false,
            working_baud: config::WORKING_BAUD_RATE,
        }
    }
}

/// One hash board worth of chips behind a shared serial line
pub struct HashChain {
    board: u8,
    io: Io,
    chip_map: aura::ChipIdMap,
    seq_chip_ids: Vec<u8>,
    actual_chip_ids: Vec<u8>,
    revision: u8,
    num_engines: u16,
    working_baud: u32,
    board_ctl: Arc<dyn power::BoardControl>,
    dead_board: AtomicBool,
    init_complete: AtomicBool,
    state: Mutex<ChainState>,
    faulty: Mutex<FaultyMap>,
    volt_trace: Mutex<VecDeque<Vec<f64>>>,
}

impl HashChain {
    /// Enumerate the chain and build the controller.
    ///
    /// Runs on the synchronous transport surface: probe every possible id
    /// for the chip fingerprint, build the expected-chip table, gate on the
    /// interface version, then clear counters and bring the PLL to a sane
    /// state before switching the transport to async mode.
    pub fn init(
        mut uart: Uart,
        opts: ChainOptions,
        board_ctl: Arc<dyn power::BoardControl>,
    ) -> error::Result<HashChain> {
        let board = opts.board;
        info!("B{}: starting chip discovery", board);

        // chips may be mid-frame out of reset
        uart.write_idle(DISCOVERY_IDLE_BYTES)?;
        let hit_cfg = aura::HitConfigReg {
            auto_report: false,
            disable_cd: opts.disable_cd,
        };
        uart.blocking_write(0, aura::HIT_CONFIG, aura::CMD_WRITE, hit_cfg.to_reg(), true)?;
        uart.clear_responses();

        for chip_id in 0..=opts.max_chip_id {
            uart.blocking_write(chip_id as u8, aura::CHIP_UNIQUE, aura::CMD_READ, 0, false)?;
            uart.write_idle(aura::IDLE_BYTES)?;
        }

        let window = uart.reg_read_window(opts.max_chip_id as u64);
        let start = Instant::now();
        let mut found: Vec<u8> = Vec::new();
        loop {
            while let Some(resp) = uart.poll_response() {
                if resp.data == aura::CHIP_FINGERPRINT
                    && resp.addr == aura::CHIP_UNIQUE
                    && usize::from(resp.id) <= opts.max_chip_id
                {
                    found.push(resp.id);
                }
            }
            if start.elapsed() > window {
                break;
            }
            std::thread::sleep(Duration::from_micros(50));
        }

        if found.is_empty() {
            error!("B{}: no Aura chip detected", board);
            let _ = board_ctl.power_off(board);
            let _ = board_ctl.reset(board);
            Err(ErrorKind::Hashboard(
                board as usize,
                "no chips detected".to_string(),
            ))?
        }
        found.sort_unstable();
        found.dedup();
        info!("B{}: {} chips found: {:?}", board, found.len(), found);

        let chip_count = opts.chip_map.chip_count();
        let mut chips = Vec::with_capacity(chip_count);
        let mut seq_chip_ids = Vec::with_capacity(chip_count);
        let mut next_found = 0usize;
        for index in 0..chip_count {
            let chip_id = opts
                .chip_map
                .index_to_id(index)
                .expect("BUG: index inside the chip table");
            seq_chip_ids.push(chip_id);
            let detected = next_found < found.len() && found[next_found] == chip_id;
            if detected {
                next_found += 1;
            }
            chips.push(ChipEntry::new(chip_id, !detected));
        }
        info!(
            "B{}: expected {} chips, detected {}",
            board,
            chip_count,
            found.len()
        );

        let revision_raw = uart.blocking_read(found[0], aura::CHIP_REVISION, aura::CMD_READ, 0)?;
        let revision = aura::ChipRevisionReg::from_reg(revision_raw);
        if revision.iface_version != aura::SUPPORTED_IFACE_VERSION {
            Err(ErrorKind::UnexpectedVersion(
                "chip interface".to_string(),
                revision.iface_version.to_string(),
                aura::SUPPORTED_IFACE_VERSION.to_string(),
            ))?
        }

        Self::clear_all_counters_sync(&mut uart)?;
        Self::pll_init_sync(&mut uart)?;

        let io = uart.enable_async_rw()?;

        let now = Instant::now();
        let counters_idle = now.checked_sub(MAX_JOB_INTERVAL).unwrap_or(now);
        Ok(HashChain {
            board,
            io,
            chip_map: opts.chip_map,
            seq_chip_ids,
            actual_chip_ids: found,
            revision: revision.revision,
            num_engines: revision.num_engines,
            working_baud: opts.working_baud,
            board_ctl,
            dead_board: AtomicBool::new(false),
            init_complete: AtomicBool::new(false),
            state: Mutex::new(ChainState {
                chips,
                cache_temps: vec![NO_TEMP; chip_count],
                cache_volts: vec![-1.0; chip_count],
                cache_freqs: vec![-1.0; chip_count],
                last_temp_reading: counters_idle,
                last_volt_reading: counters_idle,
                last_freq_reading: counters_idle,
                ver_mask: 0,
                job_count: 0,
                auto_report: false,
                disable_cd: opts.disable_cd,
                stats: HitStats::new(chip_count),
                last_cntr_reading: counters_idle,
                last_polling: now,
                polling_start: 0,
            }),
            faulty: Mutex::new(FaultyMap::new()),
            volt_trace: Mutex::new(VecDeque::new()),
        })
    }

    fn clear_all_counters_sync(uart: &mut Uart) -> error::Result<()> {
        for addr in &[
            aura::COM_ERROR,
            aura::RSP_ERROR,
            aura::HIT_COUNT_GENERAL,
            aura::HIT_COUNT_SPECIFIC,
            aura::TRUEHIT_COUNT_GENERAL,
            aura::TRUEHIT_COUNT_SPECIFIC,
            aura::HIT_COUNT_DIFFICULT,
            aura::HIT_COUNT_DROPPED_DIFF,
        ] {
            uart.blocking_write(0, *addr, aura::CMD_WRITE, 0, true)?;
        }
        Ok(())
    }

    fn pll_init_sync(uart: &mut Uart) -> error::Result<()> {
        let freq_reg = aura::freq_to_reg(config::MIN_FREQ);
        uart.blocking_write(0, aura::PLL_FREQ, aura::CMD_WRITE, freq_reg, true)?;
        for word in &aura::duty_cycle_words(config::MIN_FREQ) {
            uart.blocking_write(0, aura::DUTY_CYCLE, aura::CMD_WRITE, *word, true)?;
        }
        uart.blocking_write(0, aura::PLL_CONFIG, aura::CMD_WRITE, 0x12, true)?;
        uart.blocking_write(0, aura::PLL_CONFIG, aura::CMD_WRITE, aura::pll_config_word(), true)?;
        Ok(())
    }

    /// Post-discovery bring-up on the asynchronous surface: working baud,
    /// sensor enables, thermal trip, duty-cycle extension, starting
    /// frequency and the first sensor sweep.
    pub async fn setup(&self) -> error::Result<()> {
        self.set_baud_rate(self.working_baud)?;
        self.reg_write_all(aura::CLOCK_RETARD_BASE, 0)?;
        self.reg_write_all(aura::IP_CFG, 0x1)?;
        self.reg_write_all(aura::TEMP_CFG, 0xd)?;
        self.set_thermal_trip(config::ASIC_TEMP_LIMIT)?;
        self.set_duty_cycle_extend().await?;
        self.set_frequency(ChipAddress::All, config::MIN_FREQ)?;
        self.init_complete.store(true, Ordering::Relaxed);
        self.read_all_temperature().await;
        self.read_all_voltage().await;
        Ok(())
    }

    /// Program the chip-side divisor first, then flip the host. The host
    /// change rides the same queue so the divisor frames drain at the old
    /// rate.
    pub fn set_baud_rate(&self, baud: u32) -> error::Result<()> {
        let reg = aura::BaudDivisorReg::from_baud_rate(baud);
        self.reg_write_all(aura::BAUD_DIVISOR, reg.to_reg())?;
        self.io.set_host_baud(baud)?;
        info!("B{}: baud rate set to {}", self.board, baud);
        Ok(())
    }

    async fn set_duty_cycle_extend(&self) -> error::Result<()> {
        let first = self.actual_chip_ids[0];
        let value = self.reg_read(first, aura::HASH_CONFIG).await?;
        self.reg_write_all(aura::HASH_CONFIG, value | aura::HASH_CONFIG_DUTY_EXTEND)
    }

    fn check_alive(&self) -> error::Result<()> {
        if self.dead_board.load(Ordering::Relaxed) {
            Err(ErrorKind::Hashboard(
                self.board as usize,
                "non-responsive".to_string(),
            ))?
        }
        Ok(())
    }

    pub fn board(&self) -> u8 {
        self.board
    }

    pub fn revision(&self) -> (u8, u16) {
        (self.revision, self.num_engines)
    }

    /// Snapshot of the expected-chip table
    pub fn chip_entries(&self) -> Vec<ChipEntry> {
        self.state
            .lock()
            .expect("BUG: state lock poisoned")
            .chips
            .clone()
    }

    pub fn io(&self) -> &Io {
        &self.io
    }

    pub fn reg_write(&self, addr: ChipAddress, reg: u8, data: u32) -> error::Result<()> {
        self.check_alive()?;
        let targets = match addr {
            ChipAddress::All => Vec::new(),
            ChipAddress::One(id) => vec![id],
        };
        self.io
            .non_blocking_write(targets, vec![reg], vec![i64::from(data)], addr.is_broadcast())
    }

    pub fn reg_write_all(&self, reg: u8, data: u32) -> error::Result<()> {
        self.reg_write(ChipAddress::All, reg, data)
    }

    async fn reg_read_cmd(&self, chip: u8, reg: u8, cmd: u8) -> error::Result<u32> {
        self.check_alive()?;
        let outcome = self
            .io
            .non_blocking_read(vec![chip], vec![reg], cmd)
            .await?;
        match outcome.data.first() {
            Some(&value) if outcome.status == 0 && value >= 0 => Ok(value as u32),
            _ => Err(ErrorKind::Timeout(format!(
                "chip {} register {:#x} read failed",
                chip, reg
            )))?,
        }
    }

    pub async fn reg_read(&self, chip: u8, reg: u8) -> error::Result<u32> {
        self.reg_read_cmd(chip, reg, aura::CMD_READ).await
    }

    /// Read a register and let the chip clear it afterwards
    pub async fn reg_read_write(&self, chip: u8, reg: u8, _data: u32) -> error::Result<u32> {
        self.reg_read_cmd(chip, reg, aura::CMD_READWRITE).await
    }

    /// Pipelined multi-register read.
    ///
    /// `targets = None` addresses every expected chip. Faulty chips
    /// (subject to the re-admission rule) and undetected chips are skipped
    /// on the wire; the result vector is still sized for the requested
    /// target list with `NO_RESPONSE` in every skipped or failed slot. A
    /// failure within a target's register group bumps its faulty tracker
    /// once.
    pub async fn read_regs_pipelined(
        &self,
        targets: Option<&[u8]>,
        addrs: &[u8],
    ) -> error::Result<Vec<i64>> {
        self.check_alive()?;
        let implicit_all = targets.is_none();
        let requested: Vec<u8> = match targets {
            Some(targets) => targets.to_vec(),
            None => self.seq_chip_ids.clone(),
        };

        let mut wire_targets = Vec::with_capacity(requested.len());
        let mut index_map = Vec::with_capacity(requested.len());
        {
            let mut faulty = self.faulty.lock().expect("BUG: faulty lock poisoned");
            for (idx, &chip) in requested.iter().enumerate() {
                if faulty.is_faulty(chip) && !faulty.clear(chip) {
                    continue;
                }
                if implicit_all && !self.is_detected(chip) {
                    continue;
                }
                index_map.push(idx);
                wire_targets.push(chip);
            }
        }

        let mut results = vec![NO_RESPONSE; requested.len() * addrs.len()];
        if wire_targets.is_empty() {
            return Ok(results);
        }

        let outcome = self
            .io
            .non_blocking_read(wire_targets.clone(), addrs.to_vec(), aura::CMD_READ)
            .await?;

        for (wire_idx, &chip) in wire_targets.iter().enumerate() {
            let mut failed = false;
            for reg_idx in 0..addrs.len() {
                let value = outcome.data[wire_idx * addrs.len() + reg_idx];
                results[index_map[wire_idx] * addrs.len() + reg_idx] = value;
                if value == NO_RESPONSE && !failed {
                    failed = true;
                    self.update_faulty_tracker(chip);
                }
            }
        }
        Ok(results)
    }

    pub async fn read_all_pipelined(&self, addr: u8) -> error::Result<Vec<i64>> {
        self.read_regs_pipelined(None, &[addr]).await
    }

    pub fn is_detected(&self, chip_id: u8) -> bool {
        self.actual_chip_ids.binary_search(&chip_id).is_ok()
    }

    pub fn is_faulty(&self, chip_id: u8) -> bool {
        self.faulty
            .lock()
            .expect("BUG: faulty lock poisoned")
            .is_faulty(chip_id)
    }

    /// Current miss count of a chip's faulty tracker
    pub fn faulty_counts(&self, chip_id: u8) -> u32 {
        self.faulty
            .lock()
            .expect("BUG: faulty lock poisoned")
            .counts(chip_id)
    }

    /// Diagnostic hook: mark a chip faulty without waiting for misses
    pub fn force_faulty(&self, chip_id: u8) {
        let mut faulty = self.faulty.lock().expect("BUG: faulty lock poisoned");
        faulty.chips.insert(
            chip_id,
            FaultyTracker {
                first_occurrence: Instant::now(),
                counts: ASIC_FAULTY_THRESHOLD_COUNT,
                is_faulty: true,
                false_bad_checks: ASIC_FALSE_FAULTY_THRESHOLD_COUNT,
            },
        );
        faulty.last_marking = Some(Instant::now());
    }

    pub fn update_faulty_tracker(&self, chip_id: u8) {
        let marked = self
            .faulty
            .lock()
            .expect("BUG: faulty lock poisoned")
            .update(chip_id);
        if marked {
            error!("B{}: marking ASIC {} faulty", self.board, chip_id);
        }
    }

    fn enable_auto_reporting(&self, enabled: bool) -> error::Result<()> {
        let disable_cd = {
            let mut state = self.state.lock().expect("BUG: state lock poisoned");
            state.auto_report = enabled;
            state.disable_cd
        };
        let cfg = aura::HitConfigReg {
            auto_report: enabled,
            disable_cd,
        };
        debug!("B{}: auto reporting {}", self.board, enabled);
        self.reg_write_all(aura::HIT_CONFIG, cfg.to_reg())
    }

    fn clear_all_counters(&self) -> error::Result<()> {
        for addr in &[
            aura::COM_ERROR,
            aura::RSP_ERROR,
            aura::HIT_COUNT_GENERAL,
            aura::HIT_COUNT_SPECIFIC,
            aura::TRUEHIT_COUNT_GENERAL,
            aura::TRUEHIT_COUNT_SPECIFIC,
            aura::HIT_COUNT_DIFFICULT,
            aura::HIT_COUNT_DROPPED_DIFF,
        ] {
            self.reg_write_all(*addr, 0)?;
        }
        Ok(())
    }

    fn clear_results(&self) -> error::Result<()> {
        self.reg_write_all(aura::HIT2, 0)?;
        self.reg_write_all(aura::HIT1, 0)?;
        self.reg_write_all(aura::HIT0, 0)
    }

    fn set_version_rolling(&self, shift: u32, lower: u32, upper: u32) -> error::Result<()> {
        let lower = (lower + 3) / 4 * 4;
        let detected = self.actual_chip_ids.len().max(1) as u32;
        let mut window = (upper - lower + 1) / detected;
        window = window / 4 * 4;
        if window < 4 {
            window = 4;
        }
        for (i, &chip) in self.actual_chip_ids.iter().enumerate() {
            let min = lower + window * i as u32;
            let max = min + window - 1;
            let bound = aura::VersionBoundReg {
                lower: (min & 0xffff) as u16,
                upper: (max & 0xffff) as u16,
            };
            self.reg_write(ChipAddress::One(chip), aura::VERSION_BOUND, bound.to_reg())?;
        }
        debug!(
            "B{}: version rolling shift {} window {}",
            self.board, shift, window
        );
        self.reg_write_all(aura::VERSION_SHIFT, shift)
    }

    /// Load a job on all chips.
    ///
    /// Recomputes the version-rolling partition when the pool mask changed
    /// or every `VER_ROLL_REFRESH_JOBS` jobs; the first job also clears all
    /// counters and stale results.
    pub async fn send_job(&self, msg: &Message) -> error::Result<()> {
        self.check_alive()?;
        let header_bytes = hex::decode(&msg.body)
            .map_err(|e| ErrorKind::General(format!("bad job body: {}", e)))?;
        if header_bytes.len() != 80 {
            Err(ErrorKind::General(format!(
                "wrong job length {}",
                header_bytes.len()
            )))?
        }
        let header: [u8; 80] = header_bytes
            .as_slice()
            .try_into()
            .expect("BUG: length checked above");

        let (ver_mask, job_count) = {
            let state = self.state.lock().expect("BUG: state lock poisoned");
            (state.ver_mask, state.job_count)
        };
        if msg.version_mask != ver_mask || job_count % VER_ROLL_REFRESH_JOBS == 0 {
            let (shift, max) =
                aura::version_rolling_params(msg.version_mask, self.seq_chip_ids.len());
            self.set_version_rolling(shift, 0, max)?;
            self.state
                .lock()
                .expect("BUG: state lock poisoned")
                .ver_mask = msg.version_mask;
        }

        self.io
            .asic_load(msg.diff as u8, msg.seq as u8, &header)?;

        if job_count == 0 {
            self.clear_all_counters()?;
            self.clear_results()?;
            self.enable_auto_reporting(false)?;
        }

        let mut state = self.state.lock().expect("BUG: state lock poisoned");
        state.job_count += 1;
        state.last_cntr_reading = Instant::now();
        Ok(())
    }

    async fn check_hit_counters(&self) -> error::Result<()> {
        let thits = self.read_all_pipelined(aura::TRUEHIT_COUNT_GENERAL).await?;
        let ghits = self.read_all_pipelined(aura::HIT_COUNT_GENERAL).await?;
        let mut state = self.state.lock().expect("BUG: state lock poisoned");
        let (total_thits, total_ghits, elapsed, rates) = {
            let snap = state.stats.capture(&thits, &ghits);
            (
                snap.total_thits,
                snap.total_ghits,
                snap.elapsed,
                snap.hit_rates.clone(),
            )
        };
        for (slot, chip) in state.chips.iter_mut().enumerate() {
            chip.hit_rate = rates[slot];
        }
        let seconds = elapsed.as_secs_f64();
        if seconds > 0.0 {
            debug!(
                "B{}: performance in last {:.0}s: {:.0}/{:.0} GH/s",
                self.board,
                seconds,
                f64::from(total_thits) * 4.295 / seconds,
                f64::from(total_ghits) * 4.295 / seconds
            );
        }
        Ok(())
    }

    /// Poll one SUMMARY batch: fetch pending hits with `CMD_RETURN_HIT`
    /// and refresh the cached temperatures that ride along in the same
    /// register.
    async fn poll_hit_results(&self) -> error::Result<usize> {
        let chiplen = self.actual_chip_ids.len();
        if chiplen == 0 {
            return Ok(0);
        }
        let (start, end) = {
            let mut state = self.state.lock().expect("BUG: state lock poisoned");
            let mut start = state.polling_start;
            if start >= chiplen {
                start = 0;
            }
            let end = (start + SUMMARY_POLL_BATCH).min(chiplen);
            state.polling_start = end;
            (start, end)
        };
        let batch = self.actual_chip_ids[start..end].to_vec();
        let results = self
            .read_regs_pipelined(Some(&batch), &[aura::SUMMARY])
            .await?;

        let mut total_hits = 0usize;
        let mut state = self.state.lock().expect("BUG: state lock poisoned");
        state.last_temp_reading = Instant::now();
        for (i, &chip_id) in batch.iter().enumerate() {
            let slot = self
                .chip_map
                .id_to_index(chip_id)
                .expect("BUG: detected chip outside the id map");
            let value = results[i];
            if value == NO_RESPONSE {
                state.cache_temps[slot] = NO_TEMP;
                state.chips[slot].temperature = NO_TEMP as f32;
                continue;
            }
            let summary = aura::SummaryReg::from_reg(value as u32);
            if summary.pending_hits > 0 {
                debug!(
                    "B{}: chip {} has {} hit results",
                    self.board, chip_id, summary.pending_hits
                );
                for _ in 0..summary.pending_hits {
                    let _ = self.io.request_hit_result(chip_id);
                }
                total_hits += usize::from(summary.pending_hits);
            }
            let celsius = summary.celsius();
            state.cache_temps[slot] = celsius;
            state.chips[slot].temperature = celsius as f32;
        }
        Ok(total_hits)
    }

    /// Collect the next outbound message: a solution hit if one is queued
    /// (polling for them when auto-reporting is off), otherwise a periodic
    /// hash-rate update once unreported counter snapshots exist.
    pub async fn check_results(&self) -> error::Result<Option<Message>> {
        let (job_count, counters_due, auto_report, polling_due) = {
            let state = self.state.lock().expect("BUG: state lock poisoned");
            (
                state.job_count,
                state.stats.due() && state.last_cntr_reading.elapsed() < MAX_JOB_INTERVAL,
                state.auto_report,
                state.last_polling.elapsed() > MIN_POLLING_INTERVAL,
            )
        };
        if job_count == 0 {
            return Ok(None);
        }
        if counters_due {
            self.check_hit_counters().await?;
        }

        let mut hit = self.io.check_hit_result();
        if hit.is_none() && !auto_report && polling_due {
            let started = Instant::now();
            let requested = self.poll_hit_results().await?;
            self.state
                .lock()
                .expect("BUG: state lock poisoned")
                .last_polling = Instant::now();
            if requested > 0 {
                hit = self.io.check_hit_result();
                for _ in 0..10 {
                    if hit.is_some() {
                        break;
                    }
                    sleep(Duration::from_millis(2)).await;
                    hit = self.io.check_hit_result();
                }
                info!(
                    "B{}: polling took {:?}, requested {} hits, returned {}",
                    self.board,
                    started.elapsed(),
                    requested,
                    hit.is_some()
                );
            }
        }

        if let Some(hit) = hit {
            let msg = Message {
                seq: hit.seq.into(),
                diff: hit.nbits.into(),
                chip: hit.id.into(),
                engine: hit.result[76].into(),
                board: self.board.into(),
                body: hex::encode(&hit.result[..]),
                ..Default::default()
            };
            return Ok(Some(msg));
        }

        let mut state = self.state.lock().expect("BUG: state lock poisoned");
        if state.stats.has_unreported() {
            let report = state.stats.take_report();
            let mut msg = Message::hashrate_update(self.board.into());
            for (slot, &chip_id) in self.seq_chip_ids.iter().enumerate() {
                let id = usize::from(chip_id);
                msg.gen_hit[id] = report.gen_hit[slot];
                msg.true_hit[id] = report.true_hit[slot];
                msg.hit_rate[id] = report.hit_rate[slot];
            }
            return Ok(Some(msg));
        }
        Ok(None)
    }

    /// Temperatures for every expected chip slot, `NO_TEMP` where unknown.
    /// Throttled; between reads the cache is served.
    pub async fn read_all_temperature(&self) -> Vec<f64> {
        {
            let state = self.state.lock().expect("BUG: state lock poisoned");
            if state.last_temp_reading.elapsed() <= ASIC_READING_DURATION {
                return state.cache_temps.clone();
            }
        }
        let _ = self.reg_write_all(aura::TEMP_CFG, 0xd);
        let results = match self.read_all_pipelined(aura::TEMPERATURE).await {
            Ok(results) => results,
            Err(e) => {
                error!("B{}: temperature read error: {}", self.board, e);
                return Vec::new();
            }
        };
        let mut state = self.state.lock().expect("BUG: state lock poisoned");
        let mut temps = Vec::with_capacity(results.len());
        for (slot, &value) in results.iter().enumerate() {
            if value == NO_RESPONSE {
                temps.push(NO_TEMP);
                continue;
            }
            let reg = aura::TemperatureReg::from_reg(value as u32);
            if !reg.fault_ok {
                error!(
                    "B{}: chip {} temperature fault, raw value {:#010x}",
                    self.board, self.seq_chip_ids[slot], value
                );
            }
            let celsius = reg.celsius();
            temps.push(celsius);
            state.chips[slot].temperature = celsius as f32;
        }
        if temps.len() == state.cache_temps.len() {
            state.cache_temps.clone_from(&temps);
        }
        state.last_temp_reading = Instant::now();
        temps
    }

    /// Voltages for every expected chip slot, -1.0 where unknown. Runs the
    /// DVM configuration sequence (channel 5) with settle delays before
    /// sampling; throttled like the temperatures.
    pub async fn read_all_voltage(&self) -> Vec<f64> {
        if !self.init_complete.load(Ordering::Relaxed) {
            error!("B{}: voltage read before setup finished", self.board);
            return Vec::new();
        }
        {
            let state = self.state.lock().expect("BUG: state lock poisoned");
            if state.last_volt_reading.elapsed() <= ASIC_READING_DURATION {
                return state.cache_volts.clone();
            }
        }
        for &word in &[0x2u32, 0x3, 0x1, 0x9 | (5 << 12), 0x5] {
            let _ = self.reg_write_all(aura::DVM_CFG, word);
            sleep(DVM_SETTLE).await;
        }
        let results = match self.read_all_pipelined(aura::VOLTAGE).await {
            Ok(results) => results,
            Err(e) => {
                error!("B{}: voltage read error: {}", self.board, e);
                return Vec::new();
            }
        };
        let volts = {
            let mut state = self.state.lock().expect("BUG: state lock poisoned");
            let mut volts = Vec::with_capacity(results.len());
            for (slot, &value) in results.iter().enumerate() {
                if value == NO_RESPONSE {
                    volts.push(-1.0);
                    continue;
                }
                let chip = &mut state.chips[slot];
                if chip.volt_gain == 0.0 {
                    chip.volt_gain = aura::DEFAULT_VOLT_GAIN;
                    chip.volt_offset = aura::DEFAULT_VOLT_OFFSET;
                }
                let reg = aura::VoltageReg::from_reg(value as u32);
                let v = reg.volts(chip.volt_gain, chip.volt_offset);
                chip.voltage = v;
                volts.push(f64::from(v));
            }
            if volts.len() == state.cache_volts.len() {
                state.cache_volts.clone_from(&volts);
            }
            state.last_volt_reading = Instant::now();
            volts
        };
        let mut trace = self.volt_trace.lock().expect("BUG: trace lock poisoned");
        trace.push_back(volts.clone());
        if trace.len() > VOLT_TRACE_LEN {
            trace.pop_front();
        }
        volts
    }

    /// Frequencies for every expected chip slot, -1.0 where unknown
    pub async fn read_all_frequency(&self) -> Vec<f64> {
        {
            let state = self.state.lock().expect("BUG: state lock poisoned");
            if state.last_freq_reading.elapsed() <= ASIC_READING_DURATION {
                return state.cache_freqs.clone();
            }
        }
        let results = match self.read_all_pipelined(aura::PLL_FREQ).await {
            Ok(results) => results,
            Err(e) => {
                error!("B{}: frequency read error: {}", self.board, e);
                return Vec::new();
            }
        };
        let mut state = self.state.lock().expect("BUG: state lock poisoned");
        let mut freqs = Vec::with_capacity(results.len());
        for (slot, &value) in results.iter().enumerate() {
            if value < 0 {
                freqs.push(-1.0);
                continue;
            }
            let freq = aura::reg_to_freq(value as u32);
            freqs.push(f64::from(freq));
            state.chips[slot].frequency = freq;
        }
        if freqs.len() == state.cache_freqs.len() {
            state.cache_freqs.clone_from(&freqs);
        }
        state.last_freq_reading = Instant::now();
        freqs
    }

    /// Dump the retained voltage snapshots, oldest first
    pub fn dump_voltage_trace(&self) {
        let mut trace = self.volt_trace.lock().expect("BUG: trace lock poisoned");
        info!("B{}: traced voltages:", self.board);
        let len = trace.len();
        for (i, snapshot) in trace.drain(..).enumerate() {
            info!("t-{}: {:?}", len - i, snapshot);
        }
    }

    /// Program the PLL, duty cycle and PLL config of one chip or all of
    /// them. Frequencies outside `[MIN_FREQ, MAX_FREQ]` are rejected.
    pub fn set_frequency(&self, addr: ChipAddress, freq: f32) -> error::Result<()> {
        if freq < config::MIN_FREQ || freq > config::MAX_FREQ {
            error!(
                "B{}: frequency {:.2} is out of valid range",
                self.board, freq
            );
            Err(ErrorKind::PLL(format!("invalid frequency {:.2}", freq)))?
        }
        let reg = aura::PllFreqReg::from_freq(freq);
        self.reg_write(addr, aura::PLL_FREQ, reg.to_reg())?;
        let words = aura::duty_cycle_words(freq);
        self.reg_write(addr, aura::DUTY_CYCLE, words[0])?;
        self.reg_write(addr, aura::DUTY_CYCLE, words[1])?;
        self.reg_write(addr, aura::PLL_CONFIG, aura::pll_config_word())?;

        let mut state = self.state.lock().expect("BUG: state lock poisoned");
        match addr {
            ChipAddress::All => {
                for chip in state.chips.iter_mut() {
                    chip.frequency = freq;
                }
            }
            ChipAddress::One(id) => {
                if let Some(slot) = self.chip_map.id_to_index(id) {
                    state.chips[slot].frequency = freq;
                }
            }
        }
        Ok(())
    }

    /// Thermal trip threshold; rejected above the hard chip limit
    pub fn set_thermal_trip(&self, celsius: f32) -> error::Result<()> {
        if celsius < 0.0 || celsius > config::ASIC_TEMP_LIMIT {
            error!(
                "B{}: thermal trip {:.2} above limit {:.2}; ignoring",
                self.board,
                celsius,
                config::ASIC_TEMP_LIMIT
            );
            Err(ErrorKind::General(format!(
                "thermal trip {:.2} out of range",
                celsius
            )))?
        }
        let reg = aura::ThermalTripReg::from_celsius(f64::from(celsius));
        self.reg_write_all(aura::THERMAL_TRIP, reg.to_reg())
    }

    /// Put the chips back on the boot baud and stop the transport threads
    pub fn close(&self) {
        if self.working_baud != config::INIT_BAUD_RATE {
            let _ = self.set_baud_rate(config::INIT_BAUD_RATE);
        }
        self.io.shutdown();
    }

    pub fn is_dead(&self) -> bool {
        self.dead_board.load(Ordering::Relaxed)
    }

    /// Give up on the board: short-circuit further register traffic and
    /// have the power controller cut it off and hold it in reset.
    pub fn mark_dead(&self) {
        if self.dead_board.swap(true, Ordering::Relaxed) {
            return;
        }
        error!("B{}: marking board dead, cutting power", self.board);
        let _ = self.board_ctl.power_off(self.board);
        let _ = self.board_ctl.reset(self.board);
    }
}

/// Hardware access surface the DVFS engine and the device manager consume
#[async_trait]
pub trait AsicRw: Send + Sync {
    fn board(&self) -> u8;
    fn is_dead(&self) -> bool;
    fn mark_dead(&self);
    fn set_init_complete(&self, complete: bool);
    fn chip_map(&self) -> aura::ChipIdMap;
    /// Expected chip ids (the full table, detected or not)
    fn expected_chip_ids(&self) -> &[u8];
    fn detected_chip_ids(&self) -> &[u8];

    async fn send_job(&self, msg: &Message) -> error::Result<()>;
    async fn check_results(&self) -> error::Result<Option<Message>>;

    fn reg_write(&self, addr: ChipAddress, reg: u8, data: u32) -> error::Result<()>;
    async fn reg_read(&self, chip: u8, reg: u8) -> error::Result<u32>;
    async fn reg_read_write(&self, chip: u8, reg: u8, data: u32) -> error::Result<u32>;
    async fn read_regs_pipelined(
        &self,
        targets: Option<&[u8]>,
        addrs: &[u8],
    ) -> error::Result<Vec<i64>>;

    async fn read_all_temperature(&self) -> Vec<f64>;
    async fn read_all_voltage(&self) -> Vec<f64>;
    async fn read_all_frequency(&self) -> Vec<f64>;

    fn set_frequency(&self, addr: ChipAddress, mhz: f32) -> error::Result<()>;
    fn set_thermal_trip(&self, celsius: f32) -> error::Result<()>;

    /// Cached temperature of one chip, `NO_TEMP` when unknown
    fn cached_temp(&self, chip_id: u8) -> f64;
    /// Cached voltage of one chip, negative when unknown
    fn cached_volt(&self, chip_id: u8) -> f64;
    /// Account one read result for a chip. Returns true when the chip just
    /// crossed the no-response limit.
    fn note_chip_response(&self, chip_id: u8, ok: bool) -> bool;
    /// Chips currently past the no-response limit
    fn not_responsive_count(&self) -> usize;
    fn dump_voltage_trace(&self);
}

#[async_trait]
impl AsicRw for HashChain {
    fn board(&self) -> u8 {
        HashChain::board(self)
    }

    fn is_dead(&self) -> bool {
        HashChain::is_dead(self)
    }

    fn mark_dead(&self) {
        HashChain::mark_dead(self)
    }

    fn set_init_complete(&self, complete: bool) {
        self.init_complete.store(complete, Ordering::Relaxed);
    }

    fn chip_map(&self) -> aura::ChipIdMap {
        self.chip_map
    }

    fn expected_chip_ids(&self) -> &[u8] {
        &self.seq_chip_ids
    }

    fn detected_chip_ids(&self) -> &[u8] {
        &self.actual_chip_ids
    }

    async fn send_job(&self, msg: &Message) -> error::Result<()> {
        HashChain::send_job(self, msg).await
    }

    async fn check_results(&self) -> error::Result<Option<Message>> {
        HashChain::check_results(self).await
    }

    fn reg_write(&self, addr: ChipAddress, reg: u8, data: u32) -> error::Result<()> {
        HashChain::reg_write(self, addr, reg, data)
    }

    async fn reg_read(&self, chip: u8, reg: u8) -> error::Result<u32> {
        HashChain::reg_read(self, chip, reg).await
    }

    async fn reg_read_write(&self, chip: u8, reg: u8, data: u32) -> error::Result<u32> {
        HashChain::reg_read_write(self, chip, reg, data).await
    }

    async fn read_regs_pipelined(
        &self,
        targets: Option<&[u8]>,
        addrs: &[u8],
    ) -> error::Result<Vec<i64>> {
        HashChain::read_regs_pipelined(self, targets, addrs).await
    }

    async fn read_all_temperature(&self) -> Vec<f64> {
        HashChain::read_all_temperature(self).await
    }

    async fn read_all_voltage(&self) -> Vec<f64> {
        HashChain::read_all_voltage(self).await
    }

    async fn read_all_frequency(&self) -> Vec<f64> {
        HashChain::read_all_frequency(self).await
    }

    fn set_frequency(&self, addr: ChipAddress, mhz: f32) -> error::Result<()> {
        HashChain::set_frequency(self, addr, mhz)
    }

    fn set_thermal_trip(&self, celsius: f32) -> error::Result<()> {
        HashChain::set_thermal_trip(self, celsius)
    }

    fn cached_temp(&self, chip_id: u8) -> f64 {
        let slot = match self.chip_map.id_to_index(chip_id) {
            Some(slot) => slot,
            None => return NO_TEMP,
        };
        self.state.lock().expect("BUG: state lock poisoned").cache_temps[slot]
    }

    fn cached_volt(&self, chip_id: u8) -> f64 {
        let slot = match self.chip_map.id_to_index(chip_id) {
            Some(slot) => slot,
            None => return -1.0,
        };
        self.state.lock().expect("BUG: state lock poisoned").cache_volts[slot]
    }

    fn note_chip_response(&self, chip_id: u8, ok: bool) -> bool {
        let slot = match self.chip_map.id_to_index(chip_id) {
            Some(slot) => slot,
            None => return false,
        };
        let mut state = self.state.lock().expect("BUG: state lock poisoned");
        let chip = &mut state.chips[slot];
        if ok {
            if chip.no_response_ctr >= NO_RESPONSE_LIMIT {
                info!(
                    "B{}: chip {} is back after {} missed responses",
                    self.board, chip_id, chip.no_response_ctr
                );
            }
            chip.no_response_ctr = 0;
            chip.not_responsive = false;
            false
        } else {
            chip.no_response_ctr += 1;
            if chip.no_response_ctr > NO_RESPONSE_LIMIT && !chip.not_responsive {
                chip.not_responsive = true;
                error!("B{}: dead chip {} detected", self.board, chip_id);
                true
            } else {
                false
            }
        }
    }

    fn not_responsive_count(&self) -> usize {
        self.state
            .lock()
            .expect("BUG: state lock poisoned")
            .chips
            .iter()
            .filter(|chip| chip.not_responsive)
            .count()
    }

    fn dump_voltage_trace(&self) {
        HashChain::dump_voltage_trace(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_faulty_tracker_marks_after_threshold() {
        let mut map = FaultyMap::new();
        for _ in 0..ASIC_FAULTY_THRESHOLD_COUNT - 1 {
            assert!(!map.update(7));
            assert!(!map.is_faulty(7));
        }
        assert!(map.update(7));
        assert!(map.is_faulty(7));
        assert_eq!(map.counts(7), ASIC_FAULTY_THRESHOLD_COUNT);
    }

    #[test]
    fn test_faulty_tracker_clear_respects_window() {
        let mut map = FaultyMap::new();
        for _ in 0..ASIC_FAULTY_THRESHOLD_COUNT {
            map.update(7);
        }
        assert!(map.is_faulty(7));
        // marking just happened, re-admission window has not passed
        assert!(!map.clear(7));
        assert!(map.is_faulty(7));

        // with the window elapsed the chip comes back, a limited number of
        // times
        map.false_faulty_window = Duration::from_secs(0);
        std::thread::sleep(Duration::from_millis(1));
        for _ in 0..ASIC_FALSE_FAULTY_THRESHOLD_COUNT {
            assert!(map.clear(7));
            assert!(!map.is_faulty(7));
            for _ in 0..ASIC_FAULTY_THRESHOLD_COUNT {
                map.update(7);
            }
            assert!(map.is_faulty(7));
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!map.clear(7));
        assert!(map.is_faulty(7));
    }

    #[test]
    fn test_faulty_tracker_window_reset() {
        let mut map = FaultyMap::new();
        map.faulty_window = Duration::from_millis(1);
        map.update(3);
        std::thread::sleep(Duration::from_millis(2));
        // outside the window the streak starts over
        assert!(!map.update(3));
        assert_eq!(map.counts(3), 1);
        assert!(!map.is_faulty(3));
    }
}
