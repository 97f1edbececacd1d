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

//! Aura chip protocol: wire frame layouts with their CRC-32 convention,
//! command codes, the register address map with typed register views, and
//! the PLL/baud/temperature conversions shared by the transport, the
//! controller and the DVFS engine.
//!
//! All frames are little-endian, byte-aligned, framed by a fixed magic plus
//! a fixed length. Nothing on this bus is escaped.

use crate::error::{self, ErrorKind};

use byteorder::{ByteOrder, LittleEndian};

use lazy_static::lazy_static;

use std::convert::TryInto;
use std::fmt::Debug;

/// Command code low nibble
pub const CMD_NOP: u8 = 0;
pub const CMD_WRITE: u8 = 1;
/// Read a register
pub const CMD_READ: u8 = 2;
/// Read a register, then the chip overwrites it (typically with 0)
pub const CMD_READWRITE: u8 = 3;
/// Load a job into context copies 0..3
pub const CMD_LOAD0: u8 = 4;
pub const CMD_LOAD1: u8 = 5;
pub const CMD_LOAD2: u8 = 6;
pub const CMD_LOAD3: u8 = 7;

/// Bit 6: the addressed chip replies with its most recent hit. Never
/// combined with `CMD_BROADCAST`.
pub const CMD_RETURN_HIT: u8 = 0x40;
/// Bit 7: chip id field is ignored and every chip accepts the command
pub const CMD_BROADCAST: u8 = 0x80;

/// Magic leading every host->chip frame
pub const CMD_MAGIC: u32 = 0x12345678;
/// Magic leading every chip->host frame (config and hit alike)
pub const RSP_MAGIC: u32 = 0xdac07654;
/// `RSP_MAGIC` as it appears on the wire
pub const RSP_MAGIC_BYTES: [u8; 4] = [0x54, 0x76, 0xc0, 0xda];

pub const CMD_LEN_CFG: usize = 16;
pub const CMD_LEN_LOAD: usize = 92;
pub const RSP_LEN_CFG: usize = 16;
pub const RSP_LEN_HIT: usize = 92;

/// Idle separator emitted between request bursts to let the bus quiesce
pub const IDLE_BYTES: usize = 20;

/// Value of `CHIP_UNIQUE` on a live chip ("Aura" in ASCII)
pub const CHIP_FINGERPRINT: u32 = 0x6172_7541;

/// Interface version the driver is written against
pub const SUPPORTED_IFACE_VERSION: u8 = 1;

// Register address map (the subset the driver touches plus immediate
// neighbors kept for diagnostics).
pub const CHIP_UNIQUE: u8 = 0;
pub const CHIP_REVISION: u8 = 1;
pub const ASIC_ID: u8 = 2;
pub const BAUD_DIVISOR: u8 = 3;
pub const COM_ERROR: u8 = 10;
pub const RSP_ERROR: u8 = 11;
pub const VERSION_BOUND: u8 = 16;
pub const VERSION_SHIFT: u8 = 17;
pub const SUMMARY: u8 = 18;
pub const HIT_CONFIG: u8 = 19;
pub const HASH_CONFIG: u8 = 20;
pub const PLL_CONFIG: u8 = 24;
pub const PLL_FREQ: u8 = 25;
pub const IP_CFG: u8 = 28;
pub const TEMP_CFG: u8 = 29;
pub const TEMPERATURE: u8 = 30;
pub const DVM_CFG: u8 = 31;
pub const VOLTAGE: u8 = 32;
pub const THERMAL_TRIP: u8 = 35;
pub const MAX_TEMP_SEEN: u8 = 36;
pub const HIT_COUNT_GENERAL: u8 = 96;
pub const TRUEHIT_COUNT_GENERAL: u8 = 97;
pub const HIT_COUNT_SPECIFIC: u8 = 98;
pub const TRUEHIT_COUNT_SPECIFIC: u8 = 99;
pub const HIT_COUNT_DIFFICULT: u8 = 100;
pub const HIT_COUNT_DROPPED_DIFF: u8 = 102;
pub const DUTY_CYCLE: u8 = 104;
pub const CLOCK_RETARD_BASE: u8 = 106;
pub const HIT0: u8 = 216;
pub const HIT1: u8 = 238;
pub const HIT2: u8 = 239;

/// `HASH_CONFIG` bit enabling duty-cycle extension
pub const HASH_CONFIG_DUTY_EXTEND: u32 = 1 << 9;

lazy_static! {
    static ref CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let mut c = i as u32;
            for _ in 0..8 {
                c = if c & 1 != 0 {
                    0xedb8_8320 ^ (c >> 1)
                } else {
                    c >> 1
                };
            }
            *entry = c;
        }
        table
    };
}

/// Standard (reflected, IEEE polynomial) CRC-32
pub fn crc32(data: &[u8]) -> u32 {
    let mut c = 0xffff_ffffu32;
    for &byte in data {
        c = CRC32_TABLE[((c ^ u32::from(byte)) & 0xff) as usize] ^ (c >> 8);
    }
    c ^ 0xffff_ffff
}

/// CRC as carried in the frame's trailing field: CRC-32 over everything
/// preceding the field, bit-inverted at the end.
pub fn frame_crc(prefix: &[u8]) -> u32 {
    crc32(prefix) ^ 0xffff_ffff
}

/// Verify the trailing CRC field of a complete frame
pub fn frame_crc_ok(frame: &[u8]) -> bool {
    if frame.len() < 4 {
        return false;
    }
    let (prefix, tail) = frame.split_at(frame.len() - 4);
    frame_crc(prefix) == LittleEndian::read_u32(tail)
}

/// Pack a 16-byte command-config frame
pub fn pack_cmd_cfg(id: u8, cmd: u8, addr: u8, data: u32) -> [u8; CMD_LEN_CFG] {
    let mut buf = [0u8; CMD_LEN_CFG];
    LittleEndian::write_u32(&mut buf[0..4], CMD_MAGIC);
    buf[4] = id;
    buf[5] = cmd;
    buf[6] = 0; // spare, driven to 0
    buf[7] = addr;
    LittleEndian::write_u32(&mut buf[8..12], data);
    let crc = frame_crc(&buf[..CMD_LEN_CFG - 4]);
    LittleEndian::write_u32(&mut buf[12..16], crc);
    buf
}

/// Pack a 92-byte broadcast job-load frame
///
/// * `nbits` - compact difficulty carried alongside the job
/// * `seq` - sequence tag the chip echoes back in hits; not interpreted by
///   the hardware
/// * `header` - 80-byte block header, nonce field ignored on load
pub fn pack_cmd_load(nbits: u8, seq: u8, header: &[u8; 80]) -> [u8; CMD_LEN_LOAD] {
    let mut buf = [0u8; CMD_LEN_LOAD];
    LittleEndian::write_u32(&mut buf[0..4], CMD_MAGIC);
    buf[4] = 0;
    buf[5] = CMD_LOAD0 | CMD_BROADCAST;
    buf[6] = nbits;
    buf[7] = seq;
    buf[8..88].copy_from_slice(header);
    let crc = frame_crc(&buf[..CMD_LEN_LOAD - 4]);
    LittleEndian::write_u32(&mut buf[88..92], crc);
    buf
}

/// Pack a 16-byte config response. The driver only ever parses responses;
/// this is for bus simulators and protocol tests.
pub fn pack_resp_cfg(id: u8, cmd: u8, addr: u8, data: u32) -> [u8; RSP_LEN_CFG] {
    let mut buf = [0u8; RSP_LEN_CFG];
    LittleEndian::write_u32(&mut buf[0..4], RSP_MAGIC);
    buf[4] = id;
    buf[5] = cmd;
    buf[6] = 0;
    buf[7] = addr;
    LittleEndian::write_u32(&mut buf[8..12], data);
    let crc = frame_crc(&buf[..RSP_LEN_CFG - 4]);
    LittleEndian::write_u32(&mut buf[12..16], crc);
    buf
}

/// Pack a 92-byte hit response. For bus simulators and protocol tests.
pub fn pack_resp_hit(id: u8, cmd: u8, nbits: u8, seq: u8, result: &[u8; 80]) -> [u8; RSP_LEN_HIT] {
    let mut buf = [0u8; RSP_LEN_HIT];
    LittleEndian::write_u32(&mut buf[0..4], RSP_MAGIC);
    buf[4] = id;
    buf[5] = cmd;
    buf[6] = nbits;
    buf[7] = seq;
    buf[8..88].copy_from_slice(result);
    let crc = frame_crc(&buf[..RSP_LEN_HIT - 4]);
    LittleEndian::write_u32(&mut buf[88..92], crc);
    buf
}

/// Parsed 16-byte config response
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseCfg {
    /// Chip that responded
    pub id: u8,
    /// Echo of the command that caused the response, `CMD_RETURN_HIT` clear
    pub cmd: u8,
    /// Echo of the spare field
    pub spare: u8,
    /// Echo of the register address
    pub addr: u8,
    pub data: u32,
    pub crc: u32,
}

impl ResponseCfg {
    /// Unpack from an exact-length frame. CRC is *not* checked here, the
    /// caller verifies it against the prefix and rejects on mismatch.
    pub fn unpack(buf: &[u8]) -> error::Result<Self> {
        if buf.len() != RSP_LEN_CFG {
            Err(ErrorKind::Frame(format!(
                "config response has {} bytes, expected {}",
                buf.len(),
                RSP_LEN_CFG
            )))?
        }
        if LittleEndian::read_u32(&buf[0..4]) != RSP_MAGIC {
            Err(ErrorKind::Frame("config response magic mismatch".to_string()))?
        }
        Ok(Self {
            id: buf[4],
            cmd: buf[5],
            spare: buf[6],
            addr: buf[7],
            data: LittleEndian::read_u32(&buf[8..12]),
            crc: LittleEndian::read_u32(&buf[12..16]),
        })
    }
}

/// Parsed 92-byte hit response
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHit {
    /// Chip that found the hit
    pub id: u8,
    /// Which context copy had the hit (`CMD_LOAD0..3`), `CMD_RETURN_HIT` set
    pub cmd: u8,
    /// Leading-zero count of the hit; 0 when there was no hit
    pub nbits: u8,
    /// Sequence tag of the job that produced the hit
    pub seq: u8,
    /// Winning 80-byte block header
    pub result: [u8; 80],
    pub crc: u32,
}

impl ResponseHit {
    pub fn unpack(buf: &[u8]) -> error::Result<Self> {
        if buf.len() != RSP_LEN_HIT {
            Err(ErrorKind::Frame(format!(
                "hit response has {} bytes, expected {}",
                buf.len(),
                RSP_LEN_HIT
            )))?
        }
        if LittleEndian::read_u32(&buf[0..4]) != RSP_MAGIC {
            Err(ErrorKind::Frame("hit response magic mismatch".to_string()))?
        }
        Ok(Self {
            id: buf[4],
            cmd: buf[5],
            nbits: buf[6],
            seq: buf[7],
            result: buf[8..88].try_into().expect("BUG: slice length"),
            crc: LittleEndian::read_u32(&buf[88..92]),
        })
    }
}

/// Chip addressing as the controller sees it: either one chip by its wire
/// id, or all of them via the broadcast command bit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChipAddress {
    All,
    One(u8),
}

impl ChipAddress {
    pub fn is_broadcast(&self) -> bool {
        match self {
            ChipAddress::All => true,
            ChipAddress::One(_) => false,
        }
    }

    /// Wire id, 0 for broadcast (the id field is ignored by the chips then)
    pub fn to_id(&self) -> u8 {
        match self {
            ChipAddress::All => 0,
            ChipAddress::One(id) => *id,
        }
    }
}

/// Map between wire chip ids and chip-table indices.
///
/// The expected id set is two disjoint contiguous ranges (left and right
/// half of the board), so a raw id from the wire has to be converted any
/// time it indexes the chip table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChipIdMap {
    /// Inclusive id range of the left board half
    pub low: (u8, u8),
    /// Inclusive id range of the right board half
    pub high: (u8, u8),
}

impl Default for ChipIdMap {
    fn default() -> Self {
        Self {
            low: (0, 65),
            high: (128, 193),
        }
    }
}

impl ChipIdMap {
    /// Number of chip slots in the expected-chip table
    pub fn chip_count(&self) -> usize {
        (self.low.1 - self.low.0 + 1) as usize + (self.high.1 - self.high.0 + 1) as usize
    }

    /// Table index for a wire id, `None` for ids outside both ranges
    pub fn id_to_index(&self, id: u8) -> Option<usize> {
        if id > self.high.1 || (id > self.low.1 && id < self.high.0) {
            return None;
        }
        if id >= self.high.0 {
            Some((id - self.high.0) as usize + (self.low.1 - self.low.0 + 1) as usize)
        } else {
            Some((id - self.low.0) as usize)
        }
    }

    /// Wire id for a table index, `None` past the end of the table
    pub fn index_to_id(&self, index: usize) -> Option<u8> {
        if index >= self.chip_count() {
            return None;
        }
        let low_span = (self.low.1 - self.low.0 + 1) as usize;
        if index < low_span {
            Some(self.low.0 + index as u8)
        } else {
            Some(self.high.0 + (index - low_span) as u8)
        }
    }

    /// Boards with the extended right-hand id range carry 50 chip rows
    /// instead of 44.
    pub fn is_tall_board(&self) -> bool {
        self.high.1 == 202
    }
}

/// `Register` trait represents a register on chip. A register:
///
/// * converts from/to its 32-bit wire value (`from_reg`/`to_reg`)
/// * is identified by its address on chip (`REG_NUM`)
///
/// Registers are read with `CMD_READ` and written with `CMD_WRITE`.
pub trait Register: Sized + Send + Sync + PartialEq + Debug {
    const REG_NUM: u8;

    fn from_reg(reg: u32) -> Self;
    fn to_reg(&self) -> u32;
}

/// Chip revision and interface version
#[derive(Debug, Clone, PartialEq)]
pub struct ChipRevisionReg {
    pub revision: u8,
    /// Must be `SUPPORTED_IFACE_VERSION`
    pub iface_version: u8,
    pub num_engines: u16,
}

impl Register for ChipRevisionReg {
    const REG_NUM: u8 = CHIP_REVISION;

    fn from_reg(reg: u32) -> Self {
        Self {
            revision: (reg & 0xff) as u8,
            iface_version: ((reg >> 8) & 0xff) as u8,
            num_engines: (reg >> 16) as u16,
        }
    }

    fn to_reg(&self) -> u32 {
        u32::from(self.num_engines) << 16
            | u32::from(self.iface_version) << 8
            | u32::from(self.revision)
    }
}

/// Pending hit count plus free-running temperature in one poll
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryReg {
    /// Low nibble: hits waiting to be fetched with `CMD_RETURN_HIT`
    pub pending_hits: u8,
    /// High 16 bits: raw temperature reading
    pub temp_raw: u16,
}

impl SummaryReg {
    pub fn celsius(&self) -> f64 {
        raw_to_celsius(u32::from(self.temp_raw))
    }
}

impl Register for SummaryReg {
    const REG_NUM: u8 = SUMMARY;

    fn from_reg(reg: u32) -> Self {
        Self {
            pending_hits: (reg & 0xf) as u8,
            temp_raw: (reg >> 16) as u16,
        }
    }

    fn to_reg(&self) -> u32 {
        u32::from(self.temp_raw) << 16 | u32::from(self.pending_hits & 0xf)
    }
}

/// Dedicated temperature sensor register
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureReg {
    /// Low 12 bits of the reading
    pub raw: u16,
    /// Sensor fault bits are inverted: both set means the reading is good
    pub fault_ok: bool,
}

impl TemperatureReg {
    pub fn celsius(&self) -> f64 {
        raw_to_celsius(u32::from(self.raw))
    }
}

impl Register for TemperatureReg {
    const REG_NUM: u8 = TEMPERATURE;

    fn from_reg(reg: u32) -> Self {
        Self {
            raw: (reg & 0xfff) as u16,
            fault_ok: reg & TEMP_FAULT_MASK == TEMP_FAULT_MASK,
        }
    }

    fn to_reg(&self) -> u32 {
        let fault = if self.fault_ok { TEMP_FAULT_MASK } else { 0 };
        fault | u32::from(self.raw)
    }
}

/// Raw digital voltage meter reading
#[derive(Debug, Clone, PartialEq)]
pub struct VoltageReg {
    pub raw: u16,
}

impl VoltageReg {
    /// Convert to volts with per-chip calibration
    pub fn volts(&self, gain: f32, offset: f32) -> f32 {
        f32::from(self.raw) * gain + offset
    }
}

impl Register for VoltageReg {
    const REG_NUM: u8 = VOLTAGE;

    fn from_reg(reg: u32) -> Self {
        Self {
            raw: (reg & 0xffff) as u16,
        }
    }

    fn to_reg(&self) -> u32 {
        u32::from(self.raw)
    }
}

/// UART clock divisor, replicated in both halves of the register
#[derive(Debug, Clone, PartialEq)]
pub struct BaudDivisorReg {
    pub divisor: u16,
}

impl BaudDivisorReg {
    pub fn from_baud_rate(baud: u32) -> Self {
        Self {
            divisor: baud_divisor(baud) as u16,
        }
    }
}

impl Register for BaudDivisorReg {
    const REG_NUM: u8 = BAUD_DIVISOR;

    fn from_reg(reg: u32) -> Self {
        Self {
            divisor: (reg & 0xffff) as u16,
        }
    }

    fn to_reg(&self) -> u32 {
        u32::from(self.divisor) << 16 | u32::from(self.divisor)
    }
}

/// Per-chip version-rolling window bounds
#[derive(Debug, Clone, PartialEq)]
pub struct VersionBoundReg {
    pub lower: u16,
    pub upper: u16,
}

impl Register for VersionBoundReg {
    const REG_NUM: u8 = VERSION_BOUND;

    fn from_reg(reg: u32) -> Self {
        Self {
            lower: (reg & 0xffff) as u16,
            upper: (reg >> 16) as u16,
        }
    }

    fn to_reg(&self) -> u32 {
        u32::from(self.upper) << 16 | u32::from(self.lower)
    }
}

/// Hit reporting configuration
#[derive(Debug, Clone, PartialEq)]
pub struct HitConfigReg {
    /// Chips push hit frames unsolicited instead of waiting for
    /// `CMD_RETURN_HIT`
    pub auto_report: bool,
    /// Disable collision detection on the shared response line
    pub disable_cd: bool,
}

impl HitConfigReg {
    const BASE: u32 = 0x18;
}

impl Register for HitConfigReg {
    const REG_NUM: u8 = HIT_CONFIG;

    fn from_reg(reg: u32) -> Self {
        Self {
            auto_report: reg & 0x1 != 0,
            disable_cd: reg & 0x2 != 0,
        }
    }

    fn to_reg(&self) -> u32 {
        Self::BASE | u32::from(self.auto_report) | u32::from(self.disable_cd) << 1
    }
}

/// PLL frequency register, kept raw with conversions on the side
#[derive(Debug, Clone, PartialEq)]
pub struct PllFreqReg {
    pub raw: u32,
}

impl PllFreqReg {
    pub fn from_freq(mhz: f32) -> Self {
        Self {
            raw: freq_to_reg(mhz),
        }
    }

    pub fn freq(&self) -> f32 {
        reg_to_freq(self.raw)
    }
}

impl Register for PllFreqReg {
    const REG_NUM: u8 = PLL_FREQ;

    fn from_reg(reg: u32) -> Self {
        Self { raw: reg }
    }

    fn to_reg(&self) -> u32 {
        self.raw
    }
}

/// Thermal trip threshold in raw sensor units
#[derive(Debug, Clone, PartialEq)]
pub struct ThermalTripReg {
    pub raw: u32,
}

impl ThermalTripReg {
    pub fn from_celsius(celsius: f64) -> Self {
        Self {
            raw: celsius_to_raw(celsius),
        }
    }
}

impl Register for ThermalTripReg {
    const REG_NUM: u8 = THERMAL_TRIP;

    fn from_reg(reg: u32) -> Self {
        Self { raw: reg }
    }

    fn to_reg(&self) -> u32 {
        self.raw
    }
}

// Temperature sensor IP conversion. A single-point calibration can improve
// on these default coefficients.
pub const TEMP_Y: f64 = 662.88;
pub const TEMP_K: f64 = -287.48;
/// Inverted fault bits in `TEMPERATURE`: both set means the reading is good
pub const TEMP_FAULT_MASK: u32 = 0x50000;

pub fn raw_to_celsius(raw: u32) -> f64 {
    (f64::from(raw) - 0.5) * TEMP_Y / 4096.0 + TEMP_K
}

pub fn celsius_to_raw(celsius: f64) -> u32 {
    ((celsius - TEMP_K) / (TEMP_Y / 4096.0) + 0.5) as u32
}

/// Uncalibrated defaults for the voltage meter conversion
pub const DEFAULT_VOLT_GAIN: f32 = 0.00010467773;
pub const DEFAULT_VOLT_OFFSET: f32 = -0.285892339;

// PLL setup shared by every chip on the board
pub const REF_CLK_MHZ: f32 = 25.0;
pub const PLL_VCO_SEL: u32 = 2;
pub const PLL_DIV1: u32 = 1;
pub const PLL_DIV2: u32 = 1;

const PLL_DIVIDER: u32 = (PLL_DIV1 + 1) * (PLL_DIV2 + 1);

/// `PLL_FREQ` register value for a target frequency in MHz
pub fn freq_to_reg(mhz: f32) -> u32 {
    (mhz / REF_CLK_MHZ * (PLL_DIVIDER * (1 << 20)) as f32) as u32
}

/// Frequency in MHz for a `PLL_FREQ` register value
pub fn reg_to_freq(reg: u32) -> f32 {
    reg as f32 * REF_CLK_MHZ / (PLL_DIVIDER * (1 << 20)) as f32
}

/// `PLL_CONFIG` word for the fixed divider/VCO setup
pub fn pll_config_word() -> u32 {
    0x1d + (PLL_DIV2 << 13) + (PLL_DIV1 << 10) + (PLL_VCO_SEL << 8)
}

/// The two `DUTY_CYCLE` words for a frequency. The setting must be written
/// twice, with bit 18 clear and then set, to latch.
pub fn duty_cycle_words(mhz: f32) -> [u32; 2] {
    let setting = ((48000.0 / mhz) as i32 - 32).max(0).min(64) as u32;
    [setting | (1 << 17), setting | (1 << 17) | (1 << 18)]
}

/// Chip-side UART divisor for a baud rate (25 MHz oscillator, 64x base)
pub fn baud_divisor(baud: u32) -> u32 {
    (25_000_000 * 64 + baud / 2) / baud
}

/// Version-rolling shift and exclusive upper bound for a pool version mask.
///
/// A zero mask falls back to shift 13 with a window sized for the chain.
pub fn version_rolling_params(mask: u32, chip_count: usize) -> (u32, u32) {
    let shift = mask.trailing_zeros();
    if shift < 32 {
        let span = 32 - shift - mask.leading_zeros();
        let max = if span >= 32 { u32::max_value() } else { 1 << span };
        (shift, max)
    } else {
        (13, (4 * chip_count) as u32)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    #[test]
    fn test_crc32_known_vector() {
        // standard CRC-32 check value
        assert_eq!(crc32(b"123456789"), 0xcbf43926);
        assert_eq!(frame_crc(b"123456789"), 0xcbf43926 ^ 0xffff_ffff);
    }

    #[test]
    fn test_cmd_cfg_layout() {
        let frame = pack_cmd_cfg(9, CMD_READ, PLL_FREQ, 0x0102_0304);
        assert_eq!(frame.len(), CMD_LEN_CFG);
        // magic is little-endian on the wire
        assert_eq!(&frame[0..4], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(frame[4], 9);
        assert_eq!(frame[5], CMD_READ);
        assert_eq!(frame[6], 0);
        assert_eq!(frame[7], PLL_FREQ);
        assert_eq!(&frame[8..12], &[0x04, 0x03, 0x02, 0x01]);
        assert!(frame_crc_ok(&frame));
    }

    #[test]
    fn test_cmd_load_layout() {
        let mut header = [0u8; 80];
        for (i, b) in header.iter_mut().enumerate() {
            *b = i as u8;
        }
        let frame = pack_cmd_load(0x1d, 7, &header);
        assert_eq!(frame.len(), CMD_LEN_LOAD);
        assert_eq!(frame[5], CMD_LOAD0 | CMD_BROADCAST);
        assert_eq!(frame[6], 0x1d);
        assert_eq!(frame[7], 7);
        assert_eq!(&frame[8..88], &header[..]);
        assert!(frame_crc_ok(&frame));
    }

    #[test]
    fn test_resp_cfg_round_trip() {
        let frame = pack_resp_cfg(0x81, CMD_READ, TEMPERATURE, 0xdead_beef);
        let resp = ResponseCfg::unpack(&frame).expect("unpacking failed");
        assert_eq!(resp.id, 0x81);
        assert_eq!(resp.cmd, CMD_READ);
        assert_eq!(resp.addr, TEMPERATURE);
        assert_eq!(resp.data, 0xdead_beef);
        assert_eq!(resp.crc, frame_crc(&frame[..RSP_LEN_CFG - 4]));
    }

    #[test]
    fn test_resp_hit_round_trip() {
        let mut result = [0u8; 80];
        result[76] = 42; // engine byte
        let frame = pack_resp_hit(5, CMD_LOAD0 | CMD_RETURN_HIT, 32, 3, &result);
        let resp = ResponseHit::unpack(&frame).expect("unpacking failed");
        assert_eq!(resp.id, 5);
        assert_eq!(resp.cmd, CMD_LOAD0 | CMD_RETURN_HIT);
        assert_eq!(resp.nbits, 32);
        assert_eq!(resp.seq, 3);
        assert_eq!(resp.result[76], 42);
        assert!(frame_crc_ok(&frame));
    }

    /// Flipping any single bit must break the CRC check
    #[test]
    fn test_crc_rejects_bit_flips() {
        let frame = pack_resp_cfg(1, CMD_READ, SUMMARY, 0x1234_5678);
        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupt = frame;
                corrupt[byte] ^= 1 << bit;
                assert!(
                    !frame_crc_ok(&corrupt),
                    "flip of byte {} bit {} went undetected",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_unpack_rejects_wrong_length() {
        let frame = pack_resp_cfg(1, CMD_READ, SUMMARY, 0);
        assert!(ResponseCfg::unpack(&frame[..15]).is_err());
        assert!(ResponseHit::unpack(&frame).is_err());
    }

    /// Every expected id maps to an index and back; everything else is
    /// rejected.
    #[test]
    fn test_chip_id_map_bijection() {
        let map = ChipIdMap::default();
        assert_eq!(map.chip_count(), 132);
        for id in 0u8..=65 {
            let index = map.id_to_index(id).expect("low range id rejected");
            assert_eq!(map.index_to_id(index), Some(id));
        }
        for id in 128u8..=193 {
            let index = map.id_to_index(id).expect("high range id rejected");
            assert_eq!(map.index_to_id(index), Some(id));
        }
        for id in 66u8..=127 {
            assert_eq!(map.id_to_index(id), None);
        }
        for id in 194u8..=255 {
            assert_eq!(map.id_to_index(id), None);
        }
        assert_eq!(map.index_to_id(132), None);
    }

    #[test]
    fn test_chip_id_map_offsets() {
        let map = ChipIdMap::default();
        assert_eq!(map.id_to_index(0), Some(0));
        assert_eq!(map.id_to_index(65), Some(65));
        assert_eq!(map.id_to_index(128), Some(66));
        assert_eq!(map.id_to_index(193), Some(131));
    }

    /// Round trip is bounded by the sensor quantization (one raw LSB is
    /// about 0.162 degrees), so half an LSB plus float slack.
    #[test]
    fn test_temperature_round_trip() {
        let tolerance = TEMP_Y / 4096.0 / 2.0 + 1e-6;
        let mut t = -50.0f64;
        while t <= 125.0 {
            let raw = celsius_to_raw(t);
            assert_abs_diff_eq!(raw_to_celsius(raw), t, epsilon = tolerance);
            t += 0.37;
        }
    }

    #[test]
    fn test_pll_conversions() {
        // 200 MHz with refclk 25 and divider 4
        assert_eq!(freq_to_reg(200.0), 0x0200_0000);
        assert_relative_eq!(reg_to_freq(0x0200_0000), 200.0, epsilon = 1e-3);
        assert_eq!(pll_config_word(), 0x1d + (1 << 13) + (1 << 10) + (2 << 8));
    }

    #[test]
    fn test_duty_cycle_words() {
        // 48000/1000 - 32 = 16
        let words = duty_cycle_words(1000.0);
        assert_eq!(words[0], 16 | (1 << 17));
        assert_eq!(words[1], 16 | (1 << 17) | (1 << 18));
        // low frequency clamps to 64
        assert_eq!(duty_cycle_words(200.0)[0], 64 | (1 << 17));
        // high frequency clamps to 0
        assert_eq!(duty_cycle_words(2000.0)[0], 1 << 17);
    }

    #[test]
    fn test_baud_divisor() {
        assert_eq!(baud_divisor(115200), (25_000_000 * 64 + 57600) / 115200);
        let reg = BaudDivisorReg::from_baud_rate(3_000_000);
        assert_eq!(u32::from(reg.divisor), baud_divisor(3_000_000));
        assert_eq!(
            reg.to_reg(),
            u32::from(reg.divisor) << 16 | u32::from(reg.divisor)
        );
    }

    #[test]
    fn test_version_rolling_params() {
        // classic version-rolling mask
        let (shift, max) = version_rolling_params(0x1fffe000, 132);
        assert_eq!(shift, 13);
        assert_eq!(max, 1 << 16);
        // zero mask falls back to a chain-sized window
        let (shift, max) = version_rolling_params(0, 132);
        assert_eq!(shift, 13);
        assert_eq!(max, 4 * 132);
    }

    #[test]
    fn test_register_views() {
        let rev = ChipRevisionReg::from_reg(0x0040_0102);
        assert_eq!(rev.revision, 0x02);
        assert_eq!(rev.iface_version, 0x01);
        assert_eq!(rev.num_engines, 0x40);
        assert_eq!(rev.to_reg(), 0x0040_0102);

        let summary = SummaryReg::from_reg(0x0a3c_0005);
        assert_eq!(summary.pending_hits, 5);
        assert_eq!(summary.temp_raw, 0x0a3c);
        assert_eq!(summary.to_reg(), 0x0a3c_0005);

        let temp = TemperatureReg::from_reg(TEMP_FAULT_MASK | 0x800);
        assert!(temp.fault_ok);
        assert_eq!(temp.raw, 0x800);
        assert!(!TemperatureReg::from_reg(0x800).fault_ok);

        let bound = VersionBoundReg {
            lower: 0x100,
            upper: 0x1ff,
        };
        assert_eq!(bound.to_reg(), 0x01ff_0100);
        assert_eq!(VersionBoundReg::from_reg(0x01ff_0100), bound);

        let hit_cfg = HitConfigReg {
            auto_report: true,
            disable_cd: false,
        };
        assert_eq!(hit_cfg.to_reg(), 0x19);
        assert_eq!(
            HitConfigReg::from_reg(0x1a),
            HitConfigReg {
                auto_report: false,
                disable_cd: true,
            }
        );

        let pll = PllFreqReg::from_freq(650.0);
        assert!((pll.freq() - 650.0).abs() < 0.1);
    }
}
