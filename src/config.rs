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

//! Driver configuration and configuration file parsing

use crate::error::{self, ErrorKind};
use crate::power::PsuLimits;

use serde::{Deserialize, Serialize};

use failure::ResultExt;

use std::fs;

/// Location of default config
pub const DEFAULT_CONFIG_PATH: &str = "/etc/auraminer.toml";

/// Override the default drain channel size as the driver tends to burst
/// messages into the logger
pub const ASYNC_LOGGER_DRAIN_CHANNEL_SIZE: usize = 4096;

/// Baud rate the chips wake up with
pub const INIT_BAUD_RATE: u32 = 115_200;

/// Baud rate while hashing
pub const WORKING_BAUD_RATE: u32 = 3_000_000;

/// Highest chip id probed during discovery
pub const MAX_CHIP_ID: usize = 255;

/// Range of per-chip PLL frequency in MHz
pub const MIN_FREQ: f32 = 200.0;
pub const MAX_FREQ: f32 = 2000.0;

/// Any chip at or above this temperature sends the system to standby
pub const ASIC_TEMP_LIMIT: f32 = 120.0;

/// Per-chip core voltage window in volts; outside is an alarm
pub const MIN_CHIP_VOLT: f32 = 0.170;
pub const MAX_CHIP_VOLT: f32 = 0.440;

/// Target hash-rate floor in TH/s
pub const MIN_THS_RATE: f32 = 30.0;

/// Default tuning target in TH/s for one board
pub const DEFAULT_TARGET_THS: f32 = 90.0;

/// Default serial device template; the board id is appended
pub const DEFAULT_DEVICE_PREFIX: &str = "/dev/ttyS";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoardConfig {
    /// Board / chain id, 1-based
    pub id: u8,
    /// Serial device; defaults to `DEFAULT_DEVICE_PREFIX<id>`
    pub device: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Backend {
    #[serde(default)]
    pub board: Vec<BoardConfig>,
    /// Tuning target in TH/s for the whole system
    pub target_ths: Option<f32>,
    /// Input power ceiling in watts
    pub max_power: Option<f32>,
    /// PSU output voltage window
    pub psu_vout_min: Option<f32>,
    pub psu_vout_max: Option<f32>,
    /// Disable collision detection on the response line
    #[serde(default)]
    pub disable_cd: bool,
}

impl Default for Backend {
    fn default() -> Self {
        Self {
            board: vec![BoardConfig {
                id: 1,
                device: None,
            }],
            target_ths: None,
            max_power: None,
            psu_vout_min: None,
            psu_vout_max: None,
            disable_cd: false,
        }
    }
}

impl Backend {
    pub fn parse(config_path: &str) -> error::Result<Self> {
        let contents = fs::read_to_string(config_path)
            .with_context(|_| ErrorKind::Config(format!("cannot read '{}'", config_path)))?;
        let backend: Backend = toml::from_str(&contents)
            .map_err(|e| ErrorKind::Config(format!("'{}': {}", config_path, e)))?;
        backend.sanity_check()?;
        Ok(backend)
    }

    fn sanity_check(&self) -> error::Result<()> {
        if let Some(ths) = self.target_ths {
            if ths < MIN_THS_RATE {
                Err(ErrorKind::Config(format!(
                    "target_ths {} below minimum {}",
                    ths, MIN_THS_RATE
                )))?
            }
        }
        if self.board.is_empty() {
            Err(ErrorKind::Config("no boards configured".to_string()))?
        }
        Ok(())
    }

    pub fn device_for(&self, board: &BoardConfig) -> String {
        board
            .device
            .clone()
            .unwrap_or_else(|| format!("{}{}", DEFAULT_DEVICE_PREFIX, board.id))
    }

    pub fn psu_limits(&self) -> PsuLimits {
        let defaults = PsuLimits::default();
        PsuLimits {
            vout_min: self.psu_vout_min.unwrap_or(defaults.vout_min),
            vout_max: self.psu_vout_max.unwrap_or(defaults.vout_max),
            power_max: self.max_power.unwrap_or(defaults.power_max),
        }
    }

    pub fn target_ths(&self) -> f32 {
        self.target_ths.unwrap_or(DEFAULT_TARGET_THS)
    }
}
