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

//! Power interfaces consumed by the controller and the DVFS engine. The
//! concrete PSU (SMBus) and power-switch (GPIO) drivers live outside this
//! crate; everything here talks to them through these traits.

use crate::error;
use crate::logging::macros::*;

use async_trait::async_trait;

use futures::lock::Mutex;

use std::sync::Arc;

/// Board supply limits as the DVFS engine needs them
#[derive(Debug, Clone, Copy)]
pub struct PsuLimits {
    /// Lowest supported output voltage in volts
    pub vout_min: f32,
    /// Highest supported output voltage in volts
    pub vout_max: f32,
    /// Input power ceiling in watts
    pub power_max: f32,
}

impl Default for PsuLimits {
    fn default() -> Self {
        Self {
            vout_min: 11.0,
            vout_max: 15.0,
            power_max: 4000.0,
        }
    }
}

/// Board supply controller.
///
/// Implementations speak PMBus to the actual supply. Readings that use the
/// Linear11 format must follow the PMBus sign-extension rules for negative
/// mantissas; the values surfaced here are plain floats.
#[async_trait]
pub trait Psu: Send + Sync {
    async fn set_voltage(&self, volts: f32) -> error::Result<()>;

    /// Momentary input power in watts
    async fn input_power(&self) -> error::Result<f32>;

    /// Cut the output. The supply stays off until an external restart.
    async fn power_off(&self) -> error::Result<()>;

    /// Did the supply trip on its own?
    fn is_alarm(&self) -> bool;

    fn limits(&self) -> PsuLimits;
}

/// Per-board power switch and reset lines
pub trait BoardControl: Send + Sync {
    fn power_on(&self, board: u8) -> error::Result<()>;
    fn power_off(&self, board: u8) -> error::Result<()>;
    fn reset(&self, board: u8) -> error::Result<()>;
    fn unreset(&self, board: u8) -> error::Result<()>;
}

/// Serializes access to one PSU bus. The bus carries multi-byte
/// transactions that must not interleave, so every caller goes through the
/// single mutex here.
pub struct SharedPsu {
    inner: Mutex<Arc<dyn Psu>>,
    limits: PsuLimits,
}

impl SharedPsu {
    pub fn new(psu: Arc<dyn Psu>) -> Self {
        let limits = psu.limits();
        Self {
            inner: Mutex::new(psu),
            limits,
        }
    }
}

#[async_trait]
impl Psu for SharedPsu {
    async fn set_voltage(&self, volts: f32) -> error::Result<()> {
        let psu = self.inner.lock().await;
        psu.set_voltage(volts).await
    }

    async fn input_power(&self) -> error::Result<f32> {
        let psu = self.inner.lock().await;
        psu.input_power().await
    }

    async fn power_off(&self) -> error::Result<()> {
        let psu = self.inner.lock().await;
        psu.power_off().await
    }

    fn is_alarm(&self) -> bool {
        // alarm flag is a cached read, no transaction involved
        match self.inner.try_lock() {
            Some(psu) => psu.is_alarm(),
            None => false,
        }
    }

    fn limits(&self) -> PsuLimits {
        self.limits
    }
}

/// Bench bring-up stand-ins for rigs without a managed supply (eval boards
/// fed from a lab PSU). Voltage requests and switch operations are logged
/// and dropped, power reads as zero.
pub struct UnmanagedPsu {
    limits: PsuLimits,
}

impl UnmanagedPsu {
    pub fn new(limits: PsuLimits) -> Self {
        Self { limits }
    }
}

#[async_trait]
impl Psu for UnmanagedPsu {
    async fn set_voltage(&self, volts: f32) -> error::Result<()> {
        info!("PSU (unmanaged): ignoring voltage request {:.3} V", volts);
        Ok(())
    }

    async fn input_power(&self) -> error::Result<f32> {
        Ok(0.0)
    }

    async fn power_off(&self) -> error::Result<()> {
        warn!("PSU (unmanaged): power-off requested, nothing to switch");
        Ok(())
    }

    fn is_alarm(&self) -> bool {
        false
    }

    fn limits(&self) -> PsuLimits {
        self.limits
    }
}

pub struct UnmanagedBoardControl;

impl BoardControl for UnmanagedBoardControl {
    fn power_on(&self, board: u8) -> error::Result<()> {
        info!("board {}: power on (unmanaged)", board);
        Ok(())
    }

    fn power_off(&self, board: u8) -> error::Result<()> {
        warn!("board {}: power off (unmanaged)", board);
        Ok(())
    }

    fn reset(&self, board: u8) -> error::Result<()> {
        info!("board {}: reset asserted (unmanaged)", board);
        Ok(())
    }

    fn unreset(&self, board: u8) -> error::Result<()> {
        info!("board {}: reset released (unmanaged)", board);
        Ok(())
    }
}
