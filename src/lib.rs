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

//! Driver for Aura SHA-256 hash boards: a framed, CRC-checked register
//! protocol multiplexed over one serial line shared by every chip on the
//! board, job dispatch with solution collection, and the closed-loop
//! voltage/frequency tuner that keeps the chain at the highest sustainable
//! hash rate inside its thermal and power budget.

pub mod aura;
pub mod chain;
pub mod config;
pub mod counters;
pub mod dvfs;
pub mod error;
pub mod halt;
pub mod logging;
pub mod message;
pub mod power;
pub mod registry;
pub mod topology;
pub mod transport;

#[cfg(test)]
pub mod test_utils;

pub use chain::{AsicRw, ChainOptions, HashChain};
pub use dvfs::Dvfs;
pub use message::Message;
pub use registry::BoardRegistry;
