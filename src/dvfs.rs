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

//! Closed-loop voltage/frequency tuning.
//!
//! A single task owns all hardware access: it brings the boards up to the
//! target hash rate by stepping supply voltage and per-chip frequency, then
//! holds there while watching temperature, chip voltage and input power.
//! Overshoot shrinks the internal target with a decaying back-off; sustained
//! stable operation ratchets it back toward the configured target, never
//! above it.

use crate::aura;
use crate::chain::AsicRw;
use crate::config;
use crate::error;
use crate::halt;
use crate::logging::macros::*;
use crate::power;
use crate::registry::BoardRegistry;
use crate::topology::{Batch, BatchAction, Entry, Topology};

use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;

/// Hit rate the tuner drives toward
const LOW_RATE: f32 = 0.97;
/// Below this at maximum supply the tune gives up early
const START_RATE: f32 = LOW_RATE - 0.02;
/// Fraction of chips that must pass 50% hit rate before fine tuning
const OPTIMIZE_TRIGGER_RATE: f32 = 0.70;

/// First back-off after a thermal/power overrun
const BACK_OFF_PCT_BIG_STEP: f32 = 0.10;
/// Back-off for a mild power overrun
const BACK_OFF_PCT_SMALL_STEP: f32 = 0.06;
/// The back-off geometrically approaches this floor
const MIN_PCT_STEP: f32 = 0.015;

/// Optimize-pass iterations
const TUNE_LOOPS: usize = 10;
/// Largest per-pass frequency exchange, as a fraction of the average
const MAX_FREQ_CHANGE: f32 = 0.05;

/// Hash-rate history ring; averages use the last 5 entries
const HASH_RATE_HIST: usize = 16;

/// Chips per hit-counter fetch; 22 chips with two counters each transfer
/// in about 6 ms at 3 Mbaud
const COUNTER_BATCH: usize = 22;

/// Power readings at or above this are sensor glitches
const POWER_GLITCH_LIMIT: f32 = 20000.0;

/// Target re-expansion requires this much sustained stability
const EXPANSION_HOLDOFF: Duration = Duration::from_secs(30 * 60);

/// No target adaptation for this long after a tune finishes
const ADAPTATION_HOLDOFF: Duration = Duration::from_secs(2 * 60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DvfsState {
    Tuning,
    Normal,
    Standby,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TuneState {
    Init,
    SetFreq,
    SteppingUp,
    Optimize,
    Finetune,
    Done,
}

/// Electrical and thermal envelope the tuner works inside
#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub min_voltage: f32,
    pub max_voltage: f32,
    pub voltage_step: f32,
    pub max_power: f32,
    pub refclk: f32,
    pub min_frequency: f32,
    pub max_frequency: f32,
    pub max_junction_temp: f32,
    pub thermal_trip_temp: f32,
    pub optimal_temp: f32,
    pub allowable_bad_engines: u32,
}

impl SystemInfo {
    fn new(limits: &power::PsuLimits, power_high_water: f32) -> Self {
        Self {
            min_voltage: limits.vout_min,
            max_voltage: limits.vout_max,
            voltage_step: 0.005,
            max_power: power_high_water,
            refclk: aura::REF_CLK_MHZ,
            min_frequency: config::MIN_FREQ,
            max_frequency: config::MAX_FREQ,
            max_junction_temp: 110.0,
            thermal_trip_temp: config::ASIC_TEMP_LIMIT,
            optimal_temp: 55.0,
            allowable_bad_engines: 12,
        }
    }
}

/// Exchange frequency between the best and worst chips by hit rate,
/// preserving the system total. Only the outlying quartiles move, scaled by
/// how far out they rank; everything is clamped to `[0.4 * avg, max]`.
fn plan_frequency_exchange(entries: &mut [Entry], average_f: f32, max_frequency: f32) {
    let mut ranking: Vec<usize> = (0..entries.len()).collect();
    ranking.sort_by(|&a, &b| {
        entries[a]
            .hitrate
            .partial_cmp(&entries[b].hitrate)
            .unwrap_or(CmpOrdering::Equal)
            .then(
                entries[b]
                    .frequency
                    .partial_cmp(&entries[a].frequency)
                    .unwrap_or(CmpOrdering::Equal),
            )
    });

    let quarter = ranking.len() / 4;
    let half = ranking.len() / 2;
    if half == 0 {
        return;
    }
    for i in 0..quarter {
        let step = MAX_FREQ_CHANGE * ((half - i) as f32 / half as f32);
        let f_incr = average_f * step;
        let slow = ranking[i];
        let fast = ranking[ranking.len() - 1 - i];
        entries[fast].frequency += f_incr;
        entries[slow].frequency -= f_incr;
    }
    for entry in entries.iter_mut() {
        if entry.frequency < average_f * 0.4 {
            entry.frequency = average_f * 0.4;
        } else if entry.frequency > max_frequency {
            entry.frequency = max_frequency;
        }
    }
}

/// Inter-cycle sleep: long enough for roughly 300 hits per chip so the hit
/// rate is stable, bounded to keep the loop responsive. Fine tuning gets an
/// extra second of measurement; a chain still below 50% hit rate is polled
/// faster.
fn cycle_sleep_secs(cur_target_ths: f32, chips: usize, hitrate: f32, tune_state: TuneState) -> u64 {
    let asic_ths = if chips > 0 {
        cur_target_ths / chips as f32
    } else {
        0.0
    };
    let mut secs: i64 = if asic_ths > 0.0 {
        (1.3 / asic_ths).round() as i64
    } else {
        3
    };
    if hitrate < 0.5 {
        secs = 3;
        if matches!(tune_state, TuneState::Init | TuneState::SetFreq) {
            secs = 1;
        }
    } else {
        if tune_state == TuneState::Finetune {
            secs += 1;
        }
        secs = secs.max(2).min(6);
    }
    secs as u64
}

pub struct Dvfs {
    boards: BoardRegistry,
    psu: Arc<dyn power::Psu>,
    board_ctl: Arc<dyn power::BoardControl>,
    halt: halt::Receiver,
    topology: Topology,
    sysinfo: SystemInfo,
    /// Chains the chassis was built for, for prorating the minimum target
    total_chains: usize,

    state: DvfsState,
    tune_state: TuneState,

    /// User-configured target
    org_target_ths: f32,
    /// Current internal target after back-offs / re-expansions
    target_ths: f32,
    /// Target the running tune was started for
    cur_target_ths: f32,

    back_off_pct: f32,
    n_bouncing_back: u32,
    target_reducing: bool,

    voltage: f32,
    old_average_f: f32,
    tune_done_time: Instant,

    hash_rate_hist: [f32; HASH_RATE_HIST],
    hash_rate_hist_idx: usize,
    board_hash_rates: HashMap<u8, f32>,

    avg_temp: f32,
    max_temp: f32,
    hot_chip: i32,
    hot_board: i32,
    avg_volt: HashMap<u8, f32>,
    min_volt: HashMap<u8, f32>,
    max_volt: HashMap<u8, f32>,

    cur_power: f32,
    power_high: bool,
    temp_high_water: f32,
    power_high_water: f32,
    power_low_water: f32,

    max_dead_asics: usize,
    dead_asic_ctr: HashMap<u8, usize>,
    zero_hash: HashSet<u8>,
    zero_hash_ctr: HashMap<u8, u32>,

    volt_loop_ctr: u32,
    last_hitrate: f32,
    measurement: f32,
    last_measurement: f32,
    min_ths_rate: f32,
}

impl Dvfs {
    pub fn new(
        boards: BoardRegistry,
        psu: Arc<dyn power::Psu>,
        board_ctl: Arc<dyn power::BoardControl>,
        halt: halt::Receiver,
        target_ths: f32,
    ) -> error::Result<Self> {
        let board_list: Vec<(u8, bool)> = boards
            .iter()
            .map(|(&id, chain)| (id, chain.chip_map().is_tall_board()))
            .collect();
        let topology = Topology::build(&board_list)?;
        let limits = psu.limits();
        let power_high_water = limits.power_max * 0.99;
        let sysinfo = SystemInfo::new(&limits, power_high_water);
        let max_chain = boards
            .iter()
            .map(|(_, chain)| chain.expected_chip_ids().len())
            .max()
            .unwrap_or(0);
        let voltage = limits.vout_min;

        Ok(Self {
            total_chains: boards.len().max(1),
            boards,
            psu,
            board_ctl,
            halt,
            topology,
            sysinfo,
            state: DvfsState::Tuning,
            tune_state: TuneState::Init,
            org_target_ths: target_ths,
            target_ths,
            cur_target_ths: target_ths,
            back_off_pct: BACK_OFF_PCT_BIG_STEP,
            n_bouncing_back: 0,
            target_reducing: false,
            voltage,
            old_average_f: config::MIN_FREQ,
            tune_done_time: Instant::now(),
            hash_rate_hist: [0.0; HASH_RATE_HIST],
            hash_rate_hist_idx: 0,
            board_hash_rates: HashMap::new(),
            avg_temp: 40.0,
            max_temp: 0.0,
            hot_chip: -1,
            hot_board: -1,
            avg_volt: HashMap::new(),
            min_volt: HashMap::new(),
            max_volt: HashMap::new(),
            cur_power: 0.0,
            power_high: false,
            temp_high_water: config::ASIC_TEMP_LIMIT - 10.0,
            power_high_water,
            power_low_water: power_high_water * 0.95,
            max_dead_asics: max_chain / 2,
            dead_asic_ctr: HashMap::new(),
            zero_hash: HashSet::new(),
            zero_hash_ctr: HashMap::new(),
            volt_loop_ctr: 0,
            last_hitrate: 0.0,
            measurement: 0.0,
            last_measurement: 0.0,
            min_ths_rate: config::MIN_THS_RATE,
        })
    }

    pub fn state(&self) -> DvfsState {
        self.state
    }

    /// One-time bring-up before the control loop: minimum frequency and
    /// duty cycle everywhere, thermal trips armed, supply at its minimum,
    /// then the board power switches staggered on.
    pub async fn initial_setup(&mut self) -> error::Result<()> {
        info!(
            "DVFS: target {:.1} THS, power high-water {:.1} W",
            self.org_target_ths, self.power_high_water
        );
        let trip_raw = self
            .topology
            .entries
            .first()
            .map(|entry| entry.inverse_temp(self.sysinfo.thermal_trip_temp))
            .unwrap_or(0);
        let mut batch = Batch::new();
        for (&board, chain) in self.boards.iter() {
            if chain.is_dead() {
                continue;
            }
            batch.add(
                board,
                -1,
                aura::PLL_FREQ,
                aura::freq_to_reg(self.sysinfo.min_frequency),
                BatchAction::Write,
            );
            let words = aura::duty_cycle_words(self.sysinfo.min_frequency);
            batch.add(board, -1, aura::DUTY_CYCLE, words[0], BatchAction::Write);
            batch.add(board, -1, aura::DUTY_CYCLE, words[1], BatchAction::Write);
            batch.add(board, -1, aura::MAX_TEMP_SEEN, 0, BatchAction::Write);
            batch.add(board, -1, aura::THERMAL_TRIP, trip_raw, BatchAction::Write);
        }
        batch.execute(&self.boards, &mut self.topology).await?;

        for (_, chain) in self.boards.iter() {
            chain.set_init_complete(true);
        }

        let min_voltage = self.sysinfo.min_voltage;
        self.set_voltage(min_voltage).await;
        sleep(Duration::from_millis(500)).await; // let the supply settle

        for board in self.boards.board_ids() {
            let _ = self.board_ctl.power_on(board);
            sleep(Duration::from_millis(1000)).await; // stagger board power-up
        }
        Ok(())
    }

    pub async fn run(mut self) {
        // give the result pollers a moment to start
        sleep(Duration::from_secs(5)).await;
        if self.boards.is_empty() {
            error!("DVFS: no system ASICs detected; aborting");
            return;
        }
        sleep(Duration::from_secs(1)).await;
        self.main_loop().await;
    }

    async fn main_loop(&mut self) {
        self.start_min_freq().await;
        sleep(Duration::from_secs(2)).await;

        let mut hitrate: f32 = 0.0;
        info!("DVFS: main loop starting");

        let mut ts_poll = Instant::now();
        let mut hitcounters = self.get_hit_counters_all().await;

        self.tune_init();
        let mut old_state = self.state;
        let mut old_tune_state = self.tune_state;

        loop {
            if self.halt.is_halted() {
                info!("DVFS: halted");
                return;
            }
            if self.state != old_state {
                info!("DVFS: state changed from {:?} to {:?}", old_state, self.state);
                old_state = self.state;
            } else if self.state == DvfsState::Tuning && self.tune_state != old_tune_state {
                info!(
                    "DVFS: tune state changed from {:?} to {:?}",
                    old_tune_state, self.tune_state
                );
                old_tune_state = self.tune_state;
            }

            let sec_sleep = cycle_sleep_secs(
                self.cur_target_ths,
                self.topology.len(),
                hitrate,
                self.tune_state,
            );
            debug!("DVFS: sleeping {}s to check hitrate", sec_sleep);
            for _ in 0..sec_sleep {
                if self.per_second_check(hitrate).await {
                    error!("DVFS: per-second check exiting sleep early");
                    break;
                }
                sleep(Duration::from_secs(1)).await;
                if self.halt.is_halted() {
                    return;
                }
            }

            let mut total_hash_rate = 0.0f32;
            if self.state != DvfsState::Standby {
                self.per_monitor_cycle_check().await;

                let ts = Instant::now();
                let (rate, speeds, counters) = self
                    .get_hash_rate(&hitcounters, ts.duration_since(ts_poll))
                    .await;
                hitrate = rate;
                hitcounters = counters;
                ts_poll = ts;

                total_hash_rate = speeds.values().sum::<f32>() / 1000.0;
                info!(
                    "DVFS: hitrate {:.3}, boardspeeds {:?}, total {:.2} THS",
                    hitrate, speeds, total_hash_rate
                );
            }

            match self.state {
                DvfsState::Tuning => {
                    if self.tune_hash_rate(hitrate).await {
                        self.tune_done();
                    }
                }
                DvfsState::Normal => {
                    self.check_zero_hash();
                    let avg_hash_rate = self.get_avg_hash_rate(total_hash_rate);
                    let elapsed = self.tune_done_time.elapsed();
                    if elapsed > ADAPTATION_HOLDOFF
                        && self.monitor_power_target(avg_hash_rate, elapsed)
                    {
                        // chase the adapted target
                        self.tune_init();
                    }
                }
                DvfsState::Standby => {}
            }
        }
    }

    fn tune_init(&mut self) {
        self.state = DvfsState::Tuning;
        self.tune_state = TuneState::Init;
        self.cur_target_ths = self.target_ths;
    }

    fn tune_done(&mut self) {
        self.state = DvfsState::Normal;
        self.tune_state = TuneState::Done;
        self.tune_done_time = Instant::now();
        self.clear_hash_rate_history();
    }

    fn clear_hash_rate_history(&mut self) {
        self.hash_rate_hist = [0.0; HASH_RATE_HIST];
    }

    /// The average per-chip frequency needed to reach a system target,
    /// clamped to the supported range
    fn get_avg_freq(&self, ths: f32) -> f32 {
        let average_f =
            ths * 1_000_000.0 / (254.0 * 4.0 / 3.0) / self.topology.len().max(1) as f32 / LOW_RATE;
        average_f
            .max(self.sysinfo.min_frequency)
            .min(self.sysinfo.max_frequency)
    }

    async fn set_voltage(&mut self, voltage: f32) {
        let voltage = voltage.max(self.sysinfo.min_voltage);
        if let Err(e) = self.psu.set_voltage(voltage).await {
            error!("DVFS: psu voltage request failed: {}", e);
        }
        self.voltage = voltage;
    }

    /// Column-staggered frequency/duty writes for the whole topology
    fn staggered_freq_batch(&self) -> Batch {
        let mut batch = Batch::new();
        for stagger in 0..self.topology.num_cols.max(1) {
            let mut i = stagger;
            while i < self.topology.entries.len() {
                let entry = &self.topology.entries[i];
                batch.add(
                    entry.board,
                    i32::from(entry.id),
                    aura::PLL_FREQ,
                    aura::freq_to_reg(entry.frequency),
                    BatchAction::Write,
                );
                let words = aura::duty_cycle_words(entry.frequency);
                batch.add(
                    entry.board,
                    i32::from(entry.id),
                    aura::DUTY_CYCLE,
                    words[0],
                    BatchAction::Write,
                );
                batch.add(
                    entry.board,
                    i32::from(entry.id),
                    aura::DUTY_CYCLE,
                    words[1],
                    BatchAction::Write,
                );
                i += self.topology.num_cols.max(1);
            }
        }
        batch
    }

    async fn set_freq_all(&mut self, average_f: f32) {
        info!(
            "DVFS: setting all chips from {:.1} to {:.1} MHz",
            self.old_average_f, average_f
        );
        for entry in self.topology.entries.iter_mut() {
            entry.frequency = average_f;
        }
        let mut batch = self.staggered_freq_batch();
        let _ = batch.execute(&self.boards, &mut self.topology).await;
        self.old_average_f = average_f;
    }

    async fn start_min_freq(&mut self) {
        let min_frequency = self.sysinfo.min_frequency;
        for entry in self.topology.entries.iter_mut() {
            entry.frequency = min_frequency;
        }
        let mut batch = self.staggered_freq_batch();
        let _ = batch.execute(&self.boards, &mut self.topology).await;
        self.old_average_f = min_frequency;
    }

    /// Fold cached temperatures into the topology and find the hot spot.
    /// True means thermal alarm.
    fn process_temp(&mut self) -> bool {
        self.hot_chip = -1;
        self.hot_board = -1;
        self.max_temp = -40.0;
        let mut bad_temps = 0usize;
        let mut sum = 0.0f32;

        for i in 0..self.topology.entries.len() {
            let (board, id) = {
                let entry = &self.topology.entries[i];
                (entry.board, entry.id)
            };
            let chain = match self.boards.get(board) {
                Some(chain) if !chain.is_dead() => chain.clone(),
                _ => {
                    bad_temps += 1;
                    continue;
                }
            };
            let new_temp = chain.cached_temp(id) as f32;
            let entry = &mut self.topology.entries[i];
            if new_temp > -300.0 {
                if new_temp > 170.0 {
                    entry.bad_temp_ctr += 1;
                    entry.temperature = 0.0;
                } else {
                    entry.bad_temp_ctr = 0;
                    entry.temperature = new_temp;
                }
                sum += entry.temperature;
                if entry.temperature > self.max_temp {
                    self.hot_chip = i32::from(id);
                    self.hot_board = i32::from(board);
                    self.max_temp = entry.temperature;
                }
                if entry.bad_temp_ctr == 2 {
                    error!(
                        "DVFS ALARM: invalid temperature {:.1} on chip {}/{}",
                        entry.temperature, board, id
                    );
                }
            } else {
                bad_temps += 1;
            }
        }

        let good = self.topology.entries.len().saturating_sub(bad_temps);
        self.avg_temp = if good > 0 { sum / good as f32 } else { 0.0 };

        if self.max_temp >= self.sysinfo.thermal_trip_temp {
            error!(
                "DVFS ALARM: ASIC temp max is {:.1} on chip {}/{}; going to standby mode",
                self.max_temp, self.hot_board, self.hot_chip
            );
            return true;
        }
        false
    }

    /// Fold cached voltages into the topology and keep per-board
    /// aggregates. Out-of-window readings alarm after three in a row.
    fn process_volt(&mut self) -> bool {
        self.avg_volt.clear();
        self.min_volt.clear();
        self.max_volt.clear();
        let mut bad_volts: HashMap<u8, usize> = HashMap::new();
        let mut sums: HashMap<u8, f32> = HashMap::new();

        for i in 0..self.topology.entries.len() {
            let (board, id) = {
                let entry = &self.topology.entries[i];
                (entry.board, entry.id)
            };
            let chain = match self.boards.get(board) {
                Some(chain) => chain.clone(),
                None => continue,
            };
            let volts = chain.cached_volt(id) as f32;
            let entry = &mut self.topology.entries[i];
            entry.voltage = volts;
            if volts > config::MAX_CHIP_VOLT || volts < config::MIN_CHIP_VOLT {
                if volts < 0.0 || volts > 0.800 {
                    // read failure or non-sane value
                    entry.voltage = 0.0;
                    *bad_volts.entry(board).or_insert(0) += 1;
                    continue;
                }
                entry.bad_volt_ctr += 1;
                if entry.bad_volt_ctr == 3 {
                    error!(
                        "DVFS ALARM: voltage for chip {}/{} is {:.4} V; out of range {:.3} - {:.3}",
                        board,
                        id,
                        volts,
                        config::MIN_CHIP_VOLT,
                        config::MAX_CHIP_VOLT
                    );
                    chain.dump_voltage_trace();
                }
            } else {
                entry.bad_volt_ctr = 0;
            }
            *sums.entry(board).or_insert(0.0) += entry.voltage;
            let min = self.min_volt.entry(board).or_insert(400.0);
            if entry.voltage < *min {
                *min = entry.voltage;
            }
            let max = self.max_volt.entry(board).or_insert(0.0);
            if entry.voltage > *max {
                *max = entry.voltage;
            }
        }

        let per_board = if self.topology.num_boards > 0 {
            self.topology.len() / self.topology.num_boards
        } else {
            0
        };
        for (board, sum) in sums {
            let good = per_board.saturating_sub(bad_volts.get(&board).copied().unwrap_or(0));
            let avg = if good > 0 { sum / good as f32 } else { 0.0 };
            self.avg_volt.insert(board, avg);
        }
        false
    }

    async fn monitor_temp_volt(&mut self) -> (bool, bool) {
        if self.volt_loop_ctr % 2 == 0 {
            let chains: Vec<Arc<dyn AsicRw>> =
                self.boards.iter().map(|(_, chain)| chain.clone()).collect();
            for chain in chains {
                if !chain.is_dead() {
                    let _ = chain.read_all_temperature().await;
                    let _ = chain.read_all_voltage().await;
                }
            }
        }
        self.volt_loop_ctr += 1;

        let temp_alarm = self.process_temp();
        let volt_alarm = self.process_volt();
        (temp_alarm, volt_alarm)
    }

    /// True when the input power demands a slowdown
    async fn check_power(&mut self) -> bool {
        if self.psu.is_alarm() {
            // the supply shut itself down; nothing sane to drive anymore,
            // the supervisor restarts the whole process
            panic!("PSU powered itself off");
        }
        match self.psu.input_power().await {
            Ok(reading) if reading < POWER_GLITCH_LIMIT => self.cur_power = reading,
            Ok(reading) => {
                error!("DVFS monitor: power read {:.1} W; ignoring", reading);
            }
            Err(e) => error!("DVFS monitor: power read failed: {}", e),
        }

        let mut slowdown = false;
        if self.cur_power > self.power_high_water {
            if self.cur_target_ths > self.min_ths_rate {
                slowdown = true;
            }
            if !self.power_high {
                error!(
                    "DVFS ALARM: power is {:.1} W; reducing hash rate",
                    self.cur_power
                );
                self.power_high = true;
            }
        } else if self.power_high && self.cur_power < self.power_low_water {
            self.power_high = false;
            info!(
                "DVFS monitor: power is {:.1} W; below low-water mark",
                self.cur_power
            );
        }
        slowdown
    }

    /// Runs inside every sleep second. True breaks the sleep early.
    async fn per_second_check(&mut self, hitrate: f32) -> bool {
        let (temp_alarm, volt_alarm) = self.monitor_temp_volt().await;
        if temp_alarm {
            self.enter_standby().await;
            return true;
        }
        if self.check_power().await {
            self.reduce_target_ths(hitrate < 0.95, "reached power limit");
            self.tune_init();
            return true;
        }
        volt_alarm
    }

    async fn per_monitor_cycle_check(&mut self) {
        let _ = self.monitor_temp_volt().await;
        info!(
            "DVFS: avg_temp {:.2}, max_temp {:.2} ({}/{}), power {:.1}",
            self.avg_temp, self.max_temp, self.hot_board, self.hot_chip, self.cur_power
        );
        for (&board, avg) in self.avg_volt.iter() {
            debug!(
                "DVFS: board {} volt avg {:.4} min {:.4} max {:.4}",
                board,
                avg,
                self.min_volt.get(&board).copied().unwrap_or(0.0),
                self.max_volt.get(&board).copied().unwrap_or(0.0)
            );
        }
    }

    async fn enter_standby(&mut self) {
        self.state = DvfsState::Standby;
        info!("DVFS: entering standby mode");
        // give the job source a chance to park itself
        sleep(Duration::from_secs(2)).await;
        if let Err(e) = self.psu.power_off().await {
            error!("DVFS: psu power-off failed: {}", e);
        }
        for board in self.boards.board_ids() {
            if let Some(chain) = self.boards.get(board) {
                chain.set_init_complete(false);
            }
            let _ = self.board_ctl.power_off(board);
        }
        info!("DVFS: standby wait");
    }

    /// Shrink the internal target after an overrun. Repeated reductions
    /// decay the step toward `MIN_PCT_STEP`; the target never drops below
    /// the prorated system minimum.
    fn reduce_target_ths(&mut self, big_step: bool, reason: &str) {
        if self.n_bouncing_back == 0 {
            self.back_off_pct = if big_step {
                BACK_OFF_PCT_BIG_STEP
            } else {
                BACK_OFF_PCT_SMALL_STEP
            };
            self.n_bouncing_back += 1;
        } else if !self.target_reducing && self.back_off_pct > MIN_PCT_STEP {
            // the previous round cranked the target back up, so this level
            // was reachable once; back off more gently
            self.back_off_pct *= self.n_bouncing_back as f32 / (self.n_bouncing_back + 1) as f32;
            self.n_bouncing_back += 1;
        }
        self.target_reducing = true;

        self.target_ths = self.cur_target_ths * (1.0 - self.back_off_pct);
        let real_min =
            self.min_ths_rate * self.topology.num_boards as f32 / self.total_chains as f32;
        if self.target_ths < real_min {
            self.target_ths = real_min;
        }
        info!(
            "DVFS: reducing target hashrate {:.1}% to {:.2}: {}",
            self.back_off_pct * 100.0,
            self.target_ths,
            reason
        );
    }

    /// Ratchet the target back toward the configured value when there is
    /// sustained head-room. Returns true when the target changed.
    fn monitor_power_target(&mut self, avg_hash_rate: f32, since_tune_done: Duration) -> bool {
        if self.target_ths >= self.org_target_ths * 0.99 {
            return false;
        }
        let hashpct = avg_hash_rate / self.org_target_ths;
        let pwrpct = self.cur_power / self.power_high_water;

        if hashpct < 0.95
            && pwrpct < 0.95
            && self.voltage < self.sysinfo.max_voltage - 0.03
            && self.max_temp < self.temp_high_water - 10.0
        {
            let mut suggested_step = 0.0f32;
            if since_tune_done > EXPANSION_HOLDOFF {
                if hashpct < 0.75 && pwrpct < 0.75 && self.max_temp < self.temp_high_water - 25.0 {
                    // cooled down a lot; restart from the original target
                    self.target_ths = self.org_target_ths;
                    self.n_bouncing_back = 0;
                    info!("DVFS: reset target hashrate to original");
                    return true;
                } else if hashpct < 0.80
                    && pwrpct < 0.80
                    && self.max_temp < self.temp_high_water - 20.0
                {
                    suggested_step = BACK_OFF_PCT_BIG_STEP;
                } else if hashpct < 0.90
                    && pwrpct < 0.90
                    && self.max_temp < self.temp_high_water - 15.0
                {
                    suggested_step = BACK_OFF_PCT_SMALL_STEP;
                }
            }

            let ratio;
            if suggested_step >= MIN_PCT_STEP {
                self.n_bouncing_back = 1;
                self.back_off_pct = suggested_step;
                self.target_reducing = false;
                ratio = 1.0 + self.back_off_pct;
            } else {
                if self.n_bouncing_back >= 5 || self.back_off_pct <= MIN_PCT_STEP {
                    // tried many times or converged already, stop trying
                    return false;
                }
                let mut r = if hashpct < pwrpct {
                    0.965 / pwrpct
                } else {
                    0.965 / hashpct
                };
                if self.n_bouncing_back == 0 {
                    self.n_bouncing_back = 1;
                }
                if self.target_reducing {
                    // just backed off, do not go back up the full amount
                    self.back_off_pct *=
                        self.n_bouncing_back as f32 / (self.n_bouncing_back + 1) as f32;
                    self.n_bouncing_back += 1;
                    self.target_reducing = false;
                }
                if r > 1.0 + self.back_off_pct {
                    r = 1.0 + self.back_off_pct;
                }
                ratio = r;
            }

            let mut new_target = self.target_ths * ratio;
            if new_target >= self.org_target_ths {
                new_target = self.org_target_ths;
            }
            if new_target / self.target_ths < 1.01 {
                return false;
            }
            info!(
                "DVFS: increasing target hashrate {:.1}% to {:.2}",
                (new_target / self.target_ths - 1.0) * 100.0,
                new_target
            );
            self.target_ths = new_target;
            return true;
        }
        false
    }

    /// Average of the last five hash-rate samples, prorated when boards
    /// dropped out
    fn get_avg_hash_rate(&mut self, cur_hash_rate: f32) -> f32 {
        let functional = self.boards.functional_count();
        let mut cur = cur_hash_rate;
        if functional != 0 && functional != self.topology.num_boards {
            cur *= self.topology.num_boards as f32 / functional as f32;
        }
        self.hash_rate_hist[self.hash_rate_hist_idx] = cur;
        self.hash_rate_hist_idx = (self.hash_rate_hist_idx + 1) % self.hash_rate_hist.len();

        let mut nonzero = 0u32;
        let mut avg = 0.0f32;
        for i in 1..=5usize {
            let idx = (self.hash_rate_hist_idx + self.hash_rate_hist.len() - i)
                % self.hash_rate_hist.len();
            if self.hash_rate_hist[idx] > 0.0 {
                nonzero += 1;
                avg += self.hash_rate_hist[idx];
            }
        }
        if nonzero > 0 {
            avg / nonzero as f32
        } else {
            0.0
        }
    }

    fn check_zero_hash(&mut self) {
        for board in self.boards.board_ids() {
            let alive = self
                .boards
                .get(board)
                .map(|chain| !chain.is_dead())
                .unwrap_or(false);
            if !alive {
                continue;
            }
            let rate = self.board_hash_rates.get(&board).copied().unwrap_or(0.0);
            if rate == 0.0 {
                if self.zero_hash.insert(board) {
                    error!("DVFS ALARM: hash board {} has zero hash rate", board);
                }
                *self.zero_hash_ctr.entry(board).or_insert(0) += 1;
            } else {
                if self.zero_hash.remove(&board) {
                    info!(
                        "DVFS: hash board {} no longer has zero hash rate; alarm cleared",
                        board
                    );
                }
                self.zero_hash_ctr.insert(board, 0);
            }
        }
    }

    /// Fetch `(true_hit, gen_hit)` for every chip of one board, in batches
    /// with a single retry. Chips that fail the retry count toward the
    /// board's dead-chip tally; past half the chain the board is given up.
    async fn get_hit_counters_board(&mut self, board: u8) -> Option<Vec<[i64; 2]>> {
        let chain = self.boards.get(board)?.clone();
        if chain.is_dead() {
            return None;
        }
        let detected = chain.detected_chip_ids().to_vec();
        let map = chain.chip_map();
        let mut counters = vec![[0i64; 2]; chain.expected_chip_ids().len()];
        let addrs = [aura::TRUEHIT_COUNT_GENERAL, aura::HIT_COUNT_GENERAL];

        let mut to_retry: Vec<u8> = Vec::new();
        for batch in detected.chunks(COUNTER_BATCH) {
            let cnts = match chain.read_regs_pipelined(Some(batch), &addrs).await {
                Ok(cnts) => cnts,
                Err(e) => {
                    error!(
                        "DVFS ALARM: pipelined counter read board {} returned {}",
                        board, e
                    );
                    continue;
                }
            };
            for (ii, &chip) in batch.iter().enumerate() {
                let thit = cnts[ii * 2];
                let ghit = cnts[ii * 2 + 1];
                if thit == -1 || ghit == -1 {
                    to_retry.push(chip);
                    continue;
                }
                if let Some(index) = map.id_to_index(chip) {
                    counters[index] = [thit, ghit];
                }
                chain.note_chip_response(chip, true);
            }
        }

        if !to_retry.is_empty() {
            debug!("B{}: retrying hit counters for chips {:?}", board, to_retry);
            let cnts = chain
                .read_regs_pipelined(Some(&to_retry), &addrs)
                .await
                .unwrap_or_else(|_| vec![-1; to_retry.len() * 2]);
            let mut failed = 0usize;
            for (ii, &chip) in to_retry.iter().enumerate() {
                let thit = cnts[ii * 2];
                let ghit = cnts[ii * 2 + 1];
                if let Some(index) = map.id_to_index(chip) {
                    counters[index] = [thit, ghit];
                }
                if thit != -1 || ghit != -1 {
                    chain.note_chip_response(chip, true);
                } else {
                    failed += 1;
                    chain.note_chip_response(chip, false);
                }
            }
            self.dead_asic_ctr
                .insert(board, chain.not_responsive_count());
            let dead = self.dead_asic_ctr.get(&board).copied().unwrap_or(0);
            if dead > self.max_dead_asics && !chain.is_dead() {
                error!(
                    "DVFS ALARM: marking board {} dead with {} non-responsive ASICs",
                    board, dead
                );
                chain.mark_dead();
            }
            if failed > 10 {
                error!(
                    "B{}: too many chips failed to read hit counters: {}",
                    board, failed
                );
            }
        }

        Some(counters)
    }

    async fn get_hit_counters_all(&mut self) -> HashMap<u8, Vec<[i64; 2]>> {
        let started = Instant::now();
        let mut all = HashMap::new();
        for board in self.boards.board_ids() {
            if let Some(counters) = self.get_hit_counters_board(board).await {
                all.insert(board, counters);
            }
        }
        debug!("DVFS: counter sweep took {:?}", started.elapsed());
        all
    }

    /// System hit rate and per-board hash rates from counter deltas.
    ///
    /// Gen-hit counters are calibrated against the expected-rate model
    /// `freq * 0.07885 * period` (a 2x band) so a wild counter does not
    /// corrupt the ratio; a true-hit above gen-hit clamps to it.
    async fn get_hash_rate(
        &mut self,
        base: &HashMap<u8, Vec<[i64; 2]>>,
        period: Duration,
    ) -> (f32, HashMap<u8, f32>, HashMap<u8, Vec<[i64; 2]>>) {
        let counters = self.get_hit_counters_all().await;
        let mut board_speed: HashMap<u8, f32> = HashMap::new();
        let mut expected_total = 0.0f32;
        let mut true_total = 0.0f32;

        for i in 0..self.topology.entries.len() {
            let (board, id) = {
                let entry = &self.topology.entries[i];
                (entry.board, entry.id)
            };
            let chain = match self.boards.get(board) {
                Some(chain) if !chain.is_dead() => chain.clone(),
                _ => continue,
            };
            let index = match chain.chip_map().id_to_index(id) {
                Some(index) => index,
                None => continue,
            };
            let (cnt1, cnt0) = match (counters.get(&board), base.get(&board)) {
                (Some(c1), Some(c0)) if index < c1.len() && index < c0.len() => {
                    (c1[index], c0[index])
                }
                _ => continue,
            };

            let mut gen_delta = cnt1[1] - cnt0[1];
            let mut true_delta = cnt1[0] - cnt0[0];
            let entry = &mut self.topology.entries[i];

            if true_delta < 0 || gen_delta < 0 {
                info!(
                    "DVFS: WARNING: ASIC {}/{} hit counters went backwards ({}/{})",
                    board, id, true_delta, gen_delta
                );
                continue;
            }
            if gen_delta == 0 {
                entry.hitrate = 0.0;
                continue;
            }

            // 0.07885 = 1M * 254 * 4 / 3 / 2^32 (frequency in MHz)
            let model = (entry.frequency * 0.07885 * period.as_secs_f32()) as i64;
            if gen_delta > model * 2 || gen_delta < model / 2 {
                if true_delta > 0 {
                    debug!(
                        "DVFS WARNING: ASIC {}/{} hit counters out of range ({}/{}, model {}), freq {:.1}",
                        board, id, true_delta, gen_delta, model, entry.frequency
                    );
                }
                gen_delta = model;
            }
            if gen_delta <= 0 {
                entry.hitrate = 0.0;
                continue;
            }
            if true_delta > gen_delta {
                if true_delta as f32 / gen_delta as f32 > 1.02 {
                    info!(
                        "DVFS: suspicious reading board {} chip {} freq {:.1} ({}/{})",
                        board, id, entry.frequency, true_delta, gen_delta
                    );
                }
                true_delta = gen_delta;
            }

            expected_total += gen_delta as f32;
            true_total += true_delta as f32;
            entry.hitrate = true_delta as f32 / gen_delta as f32;
            *board_speed.entry(board).or_insert(0.0) += entry.frequency * entry.hitrate;
        }

        let hit_rate = if expected_total > 0.0 {
            true_total / expected_total
        } else {
            0.0
        };
        for (board, speed) in board_speed.iter_mut() {
            *speed *= 254.0 * 4.0 / 3000.0; // GH/s
            self.board_hash_rates.insert(*board, *speed);
        }
        (hit_rate, board_speed, counters)
    }

    fn pct_over_50(&self) -> f32 {
        let over = self
            .topology
            .entries
            .iter()
            .filter(|entry| entry.hitrate >= 0.50)
            .count();
        let pct = over as f32 / self.topology.len().max(1) as f32;
        debug!("DVFS: pct_over_50: {:.3}", pct);
        pct
    }

    /// One tuning step. Returns true when the tune is complete.
    async fn tune_hash_rate(&mut self, hitrate: f32) -> bool {
        let average_f = self.get_avg_freq(self.cur_target_ths);
        loop {
            match self.tune_state {
                TuneState::Init => {
                    info!(
                        "DVFS: tune init at {:.3} V (supply minimum {:.3}) for target {:.3}",
                        self.voltage, self.sysinfo.min_voltage, self.target_ths
                    );
                    // walk the supply down before touching frequencies, to
                    // avoid an unexpectedly high chip voltage
                    if self.voltage > self.sysinfo.min_voltage {
                        let lowered = self.voltage - 0.5;
                        self.set_voltage(lowered).await;
                        info!("DVFS: lowered voltage to {:.3}", self.voltage);
                    }
                    if self.voltage <= self.sysinfo.min_voltage {
                        self.tune_state = TuneState::SetFreq;
                    }
                    return false;
                }
                TuneState::SetFreq => {
                    self.set_freq_all(average_f).await;
                    self.last_hitrate = 0.0;
                    self.measurement = OPTIMIZE_TRIGGER_RATE;
                    self.last_measurement = OPTIMIZE_TRIGGER_RATE;
                    self.tune_state = TuneState::SteppingUp;
                    return false;
                }
                TuneState::SteppingUp => {
                    if self.voltage >= self.sysinfo.max_voltage {
                        info!("DVFS: supply maximum has been reached");
                        return true;
                    }
                    let pct = self.pct_over_50();
                    if pct < OPTIMIZE_TRIGGER_RATE {
                        self.last_hitrate = hitrate;
                        self.last_measurement = self.measurement;
                        self.measurement = OPTIMIZE_TRIGGER_RATE - hitrate;
                        info!(
                            "DVFS: stepping up at {:.3} V, hitrate {:.3} (last {:.3}), gap [{:.3} {:.3}]",
                            self.voltage,
                            hitrate,
                            self.last_hitrate,
                            self.measurement,
                            self.last_measurement
                        );
                        // larger steps while few chips are passing
                        let step = if pct < 0.1 {
                            20.0
                        } else if pct < 0.3 {
                            10.0
                        } else {
                            4.0
                        };
                        let raised = (self.voltage + self.sysinfo.voltage_step * step)
                            .min(self.sysinfo.max_voltage);
                        self.set_voltage(raised).await;
                        info!(
                            "DVFS: stepping up voltage by {:.0} steps to {:.3}",
                            step, self.voltage
                        );
                        return false;
                    }
                    self.tune_state = TuneState::Finetune;
                    continue;
                }
                TuneState::Optimize => {
                    info!("DVFS: optimize pass at average frequency {:.3}", average_f);
                    if self.tune(average_f).await {
                        self.tune_state = TuneState::Finetune;
                    }
                    return false;
                }
                TuneState::Finetune => {
                    let reached_max = self.voltage >= self.sysinfo.max_voltage;
                    if hitrate <= START_RATE && reached_max {
                        info!("DVFS: supply maximum has been reached");
                        return true;
                    }
                    self.last_hitrate = hitrate;
                    self.last_measurement = self.measurement;
                    self.measurement = LOW_RATE - hitrate;
                    info!(
                        "DVFS: fine-tune at {:.3} V, hitrate {:.3} (last {:.3}), gap [{:.3} {:.3}]",
                        self.voltage,
                        hitrate,
                        self.last_hitrate,
                        self.measurement,
                        self.last_measurement
                    );
                    if hitrate >= LOW_RATE {
                        return true;
                    }
                    let mut step = ((LOW_RATE - hitrate) * 100.0).floor();
                    if step < 1.0 {
                        step = 1.0;
                    }
                    let raised = (self.voltage + self.sysinfo.voltage_step * step)
                        .min(self.sysinfo.max_voltage);
                    self.set_voltage(raised).await;
                    info!(
                        "DVFS: fine-tune stepping up voltage by {:.0} steps to {:.3}",
                        step, self.voltage
                    );
                    return false;
                }
                TuneState::Done => return true,
            }
        }
    }

    /// Optimize pass: exchange frequency between the best and worst chips
    /// over several iterations, settling and re-measuring between each.
    /// Exits early on any alarm or halt.
    async fn tune(&mut self, average_f: f32) -> bool {
        for iteration in 0..TUNE_LOOPS {
            info!("DVFS tune: iteration {}", iteration);
            let max_frequency = self.sysinfo.max_frequency;
            plan_frequency_exchange(&mut self.topology.entries, average_f, max_frequency);
            let mut batch = self.staggered_freq_batch();
            let _ = batch.execute(&self.boards, &mut self.topology).await;

            // wait for a fresh hit-rate reading
            for _ in 0..5 {
                if self.halt.is_halted() {
                    return true;
                }
                if self.per_second_check(0.50).await {
                    error!("DVFS: optimize pass exiting early");
                    return true;
                }
                sleep(Duration::from_secs(1)).await;
            }
            let ts_poll = Instant::now();
            let counters = self.get_hit_counters_all().await;
            let _ = self.get_hash_rate(&counters, ts_poll.elapsed()).await;
        }
        true
    }

    /// Any condition the chassis should alarm on
    pub fn hash_board_alarm(&self) -> bool {
        if self.psu.is_alarm() {
            return true;
        }
        for (_, chain) in self.boards.iter() {
            if chain.is_dead() {
                return true;
            }
        }
        !self.zero_hash.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{MockBoard, MockBoardControl, MockPsu};

    fn make_dvfs(target: f32) -> (Dvfs, Arc<MockBoard>, Arc<MockPsu>) {
        let board = Arc::new(MockBoard::new(1));
        let psu = Arc::new(MockPsu::new());
        let mut boards = BoardRegistry::new();
        boards.insert(1, board.clone());
        let (_halt_tx, halt_rx) = halt::make_pair();
        // keep the sender alive for the lifetime of the engine
        std::mem::forget(_halt_tx);
        let dvfs = Dvfs::new(
            boards,
            psu.clone(),
            Arc::new(MockBoardControl::default()),
            halt_rx,
            target,
        )
        .expect("constructing engine failed");
        (dvfs, board, psu)
    }

    #[test]
    fn test_reduce_target_is_monotone_with_floor() {
        let (mut dvfs, _board, _psu) = make_dvfs(90.0);
        let mut previous = dvfs.target_ths;
        for _ in 0..50 {
            dvfs.cur_target_ths = dvfs.target_ths;
            dvfs.reduce_target_ths(true, "test");
            assert!(dvfs.target_ths < previous || dvfs.target_ths == 30.0);
            assert!(dvfs.target_ths >= 30.0, "went below the floor");
            previous = dvfs.target_ths;
        }
        // one board in a one-chain system floors at MIN_THS_RATE
        assert_eq!(dvfs.target_ths, 30.0);
    }

    #[test]
    fn test_reduce_target_back_off_selection() {
        let (mut dvfs, _board, _psu) = make_dvfs(90.0);
        dvfs.reduce_target_ths(false, "mild overrun");
        assert!((dvfs.back_off_pct - BACK_OFF_PCT_SMALL_STEP).abs() < 1e-6);
        assert!((dvfs.target_ths - 90.0 * (1.0 - BACK_OFF_PCT_SMALL_STEP)).abs() < 1e-3);
        assert_eq!(dvfs.n_bouncing_back, 1);
        // back-to-back reductions keep the step
        dvfs.cur_target_ths = dvfs.target_ths;
        dvfs.reduce_target_ths(true, "again");
        assert!((dvfs.back_off_pct - BACK_OFF_PCT_SMALL_STEP).abs() < 1e-6);
    }

    #[test]
    fn test_expansion_never_exceeds_original() {
        let (mut dvfs, _board, _psu) = make_dvfs(90.0);
        dvfs.state = DvfsState::Normal;
        dvfs.cur_power = 100.0;
        dvfs.max_temp = 30.0;
        dvfs.voltage = dvfs.sysinfo.min_voltage;

        // long-stable and cool: full reset to the original target
        dvfs.target_ths = 60.0;
        assert!(dvfs.monitor_power_target(50.0, Duration::from_secs(31 * 60)));
        assert_eq!(dvfs.target_ths, dvfs.org_target_ths);

        // ratio path close to the original clamps at it
        dvfs.target_ths = 89.0;
        dvfs.n_bouncing_back = 1;
        dvfs.back_off_pct = BACK_OFF_PCT_BIG_STEP;
        dvfs.target_reducing = false;
        assert!(dvfs.monitor_power_target(85.0, Duration::from_secs(3 * 60)));
        assert!(dvfs.target_ths <= dvfs.org_target_ths);
        assert_eq!(dvfs.target_ths, dvfs.org_target_ths);

        // near the original nothing changes
        dvfs.target_ths = dvfs.org_target_ths * 0.995;
        assert!(!dvfs.monitor_power_target(85.0, Duration::from_secs(31 * 60)));
    }

    #[test]
    fn test_expansion_stops_after_bounce_limit() {
        let (mut dvfs, _board, _psu) = make_dvfs(90.0);
        dvfs.cur_power = 100.0;
        dvfs.max_temp = 30.0;
        dvfs.voltage = dvfs.sysinfo.min_voltage;
        dvfs.target_ths = 60.0;
        dvfs.n_bouncing_back = 5;
        assert!(!dvfs.monitor_power_target(55.0, Duration::from_secs(3 * 60)));
        assert_eq!(dvfs.target_ths, 60.0);
    }

    #[tokio::test]
    async fn test_thermal_alarm_enters_standby() {
        let (mut dvfs, board, psu) = make_dvfs(90.0);
        board.set_temp(5, f64::from(config::ASIC_TEMP_LIMIT) + 1.0);
        let writes_before = board.write_count();

        assert!(dvfs.per_second_check(0.9).await);
        assert_eq!(dvfs.state, DvfsState::Standby);
        assert_eq!(psu.off_count.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert!(!board
            .init_complete
            .load(std::sync::atomic::Ordering::Relaxed));
        // no register traffic issued on the way down
        assert_eq!(board.write_count(), writes_before);
        assert!((dvfs.max_temp - (config::ASIC_TEMP_LIMIT + 1.0)).abs() < 0.01);
        assert_eq!(dvfs.hot_chip, 5);
    }

    #[tokio::test]
    async fn test_power_overrun_restarts_tuning_with_reduced_target() {
        let (mut dvfs, _board, psu) = make_dvfs(90.0);
        dvfs.state = DvfsState::Normal;
        dvfs.tune_state = TuneState::Done;
        psu.set_power(dvfs.power_high_water + 100.0);

        assert!(dvfs.per_second_check(0.9).await);
        assert_eq!(dvfs.state, DvfsState::Tuning);
        assert_eq!(dvfs.tune_state, TuneState::Init);
        assert!(dvfs.target_ths < 90.0);
        assert_eq!(dvfs.cur_target_ths, dvfs.target_ths);
        assert!(dvfs.power_high);
    }

    #[test]
    fn test_avg_freq_is_clamped() {
        let (dvfs, _board, _psu) = make_dvfs(90.0);
        // 90 THS over 132 chips needs more than the PLL can do
        assert_eq!(dvfs.get_avg_freq(90.0), config::MAX_FREQ);
        assert_eq!(dvfs.get_avg_freq(0.001), config::MIN_FREQ);
    }

    #[test]
    fn test_cycle_sleep_bounds() {
        // slow chain polls at the cap
        assert_eq!(cycle_sleep_secs(90.0, 132, 0.9, TuneState::SteppingUp), 2);
        assert_eq!(cycle_sleep_secs(9.0, 132, 0.9, TuneState::SteppingUp), 6);
        // fine tuning adds a second but stays inside the cap
        assert_eq!(cycle_sleep_secs(9.0, 132, 0.9, TuneState::Finetune), 6);
        // low hit rate boots poll fast
        assert_eq!(cycle_sleep_secs(90.0, 132, 0.1, TuneState::SteppingUp), 3);
        assert_eq!(cycle_sleep_secs(90.0, 132, 0.1, TuneState::Init), 1);
    }

    #[test]
    fn test_pct_over_50() {
        let (mut dvfs, _board, _psu) = make_dvfs(90.0);
        let n = dvfs.topology.len();
        for (i, entry) in dvfs.topology.entries.iter_mut().enumerate() {
            entry.hitrate = if i < n / 2 { 0.6 } else { 0.4 };
        }
        assert!((dvfs.pct_over_50() - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_frequency_exchange_moves_quartiles() {
        let (mut dvfs, _board, _psu) = make_dvfs(90.0);
        let n = dvfs.topology.len();
        for (i, entry) in dvfs.topology.entries.iter_mut().enumerate() {
            entry.frequency = 500.0;
            entry.hitrate = i as f32 / n as f32;
        }
        plan_frequency_exchange(&mut dvfs.topology.entries, 500.0, config::MAX_FREQ);

        // worst chip slowed down, best chip sped up, totals preserved
        let worst = dvfs
            .topology
            .entries
            .iter()
            .min_by(|a, b| a.hitrate.partial_cmp(&b.hitrate).expect("nan"))
            .expect("empty topology");
        let best = dvfs
            .topology
            .entries
            .iter()
            .max_by(|a, b| a.hitrate.partial_cmp(&b.hitrate).expect("nan"))
            .expect("empty topology");
        assert!(worst.frequency < 500.0);
        assert!(best.frequency > 500.0);
        let total: f32 = dvfs.topology.entries.iter().map(|e| e.frequency).sum();
        assert!((total - 500.0 * n as f32).abs() < 1.0);
        for entry in &dvfs.topology.entries {
            assert!(entry.frequency >= 500.0 * 0.4);
            assert!(entry.frequency <= config::MAX_FREQ);
        }
    }

    #[test]
    fn test_avg_hash_rate_window() {
        let (mut dvfs, _board, _psu) = make_dvfs(90.0);
        for _ in 0..3 {
            dvfs.get_avg_hash_rate(60.0);
        }
        let avg = dvfs.get_avg_hash_rate(90.0);
        // (60 + 60 + 60 + 90) / 4
        assert!((avg - 67.5).abs() < 0.01);
    }
}
