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

//! Owner of all hash-board controllers, keyed by board id. The DVFS engine
//! and the device manager receive clones of the `Arc` handles at
//! construction; nobody reaches for process-wide state.

use crate::chain::AsicRw;

use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Default)]
pub struct BoardRegistry {
    boards: BTreeMap<u8, Arc<dyn AsicRw>>,
}

impl BoardRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert(&mut self, board: u8, chain: Arc<dyn AsicRw>) {
        self.boards.insert(board, chain);
    }

    pub fn get(&self, board: u8) -> Option<&Arc<dyn AsicRw>> {
        self.boards.get(&board)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u8, &Arc<dyn AsicRw>)> {
        self.boards.iter()
    }

    pub fn board_ids(&self) -> Vec<u8> {
        self.boards.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.boards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boards.is_empty()
    }

    /// Boards that are still alive
    pub fn functional_count(&self) -> usize {
        self.boards.values().filter(|b| !b.is_dead()).count()
    }
}
