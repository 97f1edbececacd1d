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

//! Scripted hardware doubles shared by the unit tests.

use crate::aura::{self, ChipAddress};
use crate::chain::{AsicRw, NO_RESPONSE_LIMIT, NO_TEMP};
use crate::error;
use crate::message::Message;
use crate::power::{BoardControl, Psu, PsuLimits};

use async_trait::async_trait;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

/// A hash board whose registers and sensors are plain maps
pub struct MockBoard {
    pub board: u8,
    pub chip_map: aura::ChipIdMap,
    pub expected: Vec<u8>,
    pub detected: Vec<u8>,
    pub dead: AtomicBool,
    pub init_complete: AtomicBool,
    /// Cached per-chip temperature, defaults to a sane reading
    pub temps: Mutex<HashMap<u8, f64>>,
    pub volts: Mutex<HashMap<u8, f64>>,
    /// `(chip, register)` values served to reads
    pub reg_values: Mutex<HashMap<(u8, u8), i64>>,
    /// Chips that never answer reads
    pub silent: Mutex<HashSet<u8>>,
    pub write_log: Mutex<Vec<(i32, u8, u32)>>,
    pub freq_log: Mutex<Vec<(i32, f32)>>,
    no_response: Mutex<HashMap<u8, u32>>,
    not_responsive: Mutex<HashSet<u8>>,
}

impl MockBoard {
    pub fn new(board: u8) -> Self {
        let chip_map = aura::ChipIdMap::default();
        let expected: Vec<u8> = (0..chip_map.chip_count())
            .map(|i| chip_map.index_to_id(i).expect("BUG: index in range"))
            .collect();
        Self {
            board,
            chip_map,
            detected: expected.clone(),
            expected,
            dead: AtomicBool::new(false),
            init_complete: AtomicBool::new(true),
            temps: Mutex::new(HashMap::new()),
            volts: Mutex::new(HashMap::new()),
            reg_values: Mutex::new(HashMap::new()),
            silent: Mutex::new(HashSet::new()),
            write_log: Mutex::new(Vec::new()),
            freq_log: Mutex::new(Vec::new()),
            no_response: Mutex::new(HashMap::new()),
            not_responsive: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_temp(&self, chip: u8, celsius: f64) {
        self.temps.lock().unwrap().insert(chip, celsius);
    }

    pub fn set_volt(&self, chip: u8, volts: f64) {
        self.volts.lock().unwrap().insert(chip, volts);
    }

    pub fn set_reg(&self, chip: u8, reg: u8, value: i64) {
        self.reg_values.lock().unwrap().insert((chip, reg), value);
    }

    pub fn write_count(&self) -> usize {
        self.write_log.lock().unwrap().len()
    }

    fn read_value(&self, chip: u8, reg: u8) -> i64 {
        if self.silent.lock().unwrap().contains(&chip) {
            return -1;
        }
        self.reg_values
            .lock()
            .unwrap()
            .get(&(chip, reg))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl AsicRw for MockBoard {
    fn board(&self) -> u8 {
        self.board
    }

    fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Relaxed)
    }

    fn mark_dead(&self) {
        self.dead.store(true, Ordering::Relaxed);
    }

    fn set_init_complete(&self, complete: bool) {
        self.init_complete.store(complete, Ordering::Relaxed);
    }

    fn chip_map(&self) -> aura::ChipIdMap {
        self.chip_map
    }

    fn expected_chip_ids(&self) -> &[u8] {
        &self.expected
    }

    fn detected_chip_ids(&self) -> &[u8] {
        &self.detected
    }

    async fn send_job(&self, _msg: &Message) -> error::Result<()> {
        Ok(())
    }

    async fn check_results(&self) -> error::Result<Option<Message>> {
        Ok(None)
    }

    fn reg_write(&self, addr: ChipAddress, reg: u8, data: u32) -> error::Result<()> {
        let id = match addr {
            ChipAddress::All => -1,
            ChipAddress::One(id) => i32::from(id),
        };
        self.write_log.lock().unwrap().push((id, reg, data));
        Ok(())
    }

    async fn reg_read(&self, chip: u8, reg: u8) -> error::Result<u32> {
        let value = self.read_value(chip, reg);
        if value < 0 {
            Err(crate::error::ErrorKind::Timeout(format!(
                "chip {} register {:#x}",
                chip, reg
            )))?
        }
        Ok(value as u32)
    }

    async fn reg_read_write(&self, chip: u8, reg: u8, _data: u32) -> error::Result<u32> {
        self.reg_read(chip, reg).await
    }

    async fn read_regs_pipelined(
        &self,
        targets: Option<&[u8]>,
        addrs: &[u8],
    ) -> error::Result<Vec<i64>> {
        let requested: Vec<u8> = match targets {
            Some(targets) => targets.to_vec(),
            None => self.expected.clone(),
        };
        let mut results = Vec::with_capacity(requested.len() * addrs.len());
        for &chip in &requested {
            for &reg in addrs {
                results.push(self.read_value(chip, reg));
            }
        }
        Ok(results)
    }

    async fn read_all_temperature(&self) -> Vec<f64> {
        self.expected
            .iter()
            .map(|chip| self.cached_temp(*chip))
            .collect()
    }

    async fn read_all_voltage(&self) -> Vec<f64> {
        self.expected
            .iter()
            .map(|chip| self.cached_volt(*chip))
            .collect()
    }

    async fn read_all_frequency(&self) -> Vec<f64> {
        vec![f64::from(crate::config::MIN_FREQ); self.expected.len()]
    }

    fn set_frequency(&self, addr: ChipAddress, mhz: f32) -> error::Result<()> {
        let id = match addr {
            ChipAddress::All => -1,
            ChipAddress::One(id) => i32::from(id),
        };
        self.freq_log.lock().unwrap().push((id, mhz));
        Ok(())
    }

    fn set_thermal_trip(&self, _celsius: f32) -> error::Result<()> {
        Ok(())
    }

    fn cached_temp(&self, chip_id: u8) -> f64 {
        if self.silent.lock().unwrap().contains(&chip_id) {
            return NO_TEMP;
        }
        self.temps
            .lock()
            .unwrap()
            .get(&chip_id)
            .copied()
            .unwrap_or(45.0)
    }

    fn cached_volt(&self, chip_id: u8) -> f64 {
        self.volts
            .lock()
            .unwrap()
            .get(&chip_id)
            .copied()
            .unwrap_or(0.3)
    }

    fn note_chip_response(&self, chip_id: u8, ok: bool) -> bool {
        let mut counters = self.no_response.lock().unwrap();
        if ok {
            counters.insert(chip_id, 0);
            self.not_responsive.lock().unwrap().remove(&chip_id);
            false
        } else {
            let counter = counters.entry(chip_id).or_insert(0);
            *counter += 1;
            if *counter > NO_RESPONSE_LIMIT {
                self.not_responsive.lock().unwrap().insert(chip_id)
            } else {
                false
            }
        }
    }

    fn not_responsive_count(&self) -> usize {
        self.not_responsive.lock().unwrap().len()
    }

    fn dump_voltage_trace(&self) {}
}

/// Recording PSU double
pub struct MockPsu {
    pub voltage: Mutex<f32>,
    pub power: Mutex<f32>,
    pub off_count: AtomicU32,
    pub alarm: AtomicBool,
    pub limits: PsuLimits,
}

impl MockPsu {
    pub fn new() -> Self {
        Self {
            voltage: Mutex::new(0.0),
            power: Mutex::new(100.0),
            off_count: AtomicU32::new(0),
            alarm: AtomicBool::new(false),
            limits: PsuLimits::default(),
        }
    }

    pub fn set_power(&self, watts: f32) {
        *self.power.lock().unwrap() = watts;
    }
}

#[async_trait]
impl Psu for MockPsu {
    async fn set_voltage(&self, volts: f32) -> error::Result<()> {
        *self.voltage.lock().unwrap() = volts;
        Ok(())
    }

    async fn input_power(&self) -> error::Result<f32> {
        Ok(*self.power.lock().unwrap())
    }

    async fn power_off(&self) -> error::Result<()> {
        self.off_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn is_alarm(&self) -> bool {
        self.alarm.load(Ordering::Relaxed)
    }

    fn limits(&self) -> PsuLimits {
        self.limits
    }
}

/// Recording board power-switch double
#[derive(Default)]
pub struct MockBoardControl {
    pub events: Mutex<Vec<(u8, &'static str)>>,
}

impl BoardControl for MockBoardControl {
    fn power_on(&self, board: u8) -> error::Result<()> {
        self.events.lock().unwrap().push((board, "on"));
        Ok(())
    }

    fn power_off(&self, board: u8) -> error::Result<()> {
        self.events.lock().unwrap().push((board, "off"));
        Ok(())
    }

    fn reset(&self, board: u8) -> error::Result<()> {
        self.events.lock().unwrap().push((board, "reset"));
        Ok(())
    }

    fn unreset(&self, board: u8) -> error::Result<()> {
        self.events.lock().unwrap().push((board, "unreset"));
        Ok(())
    }
}
