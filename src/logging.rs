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

//! Global logger setup. Everything logs through the scoped global drain so
//! call sites only need `use crate::logging::macros::*;`.

use slog::Drain;

/// Logging macros bound to the process-wide scoped logger.
pub mod macros {
    pub use slog_scope::{crit, debug, error, info, trace, warn};
}

/// Install a terminal drain behind an async channel as the global logger.
///
/// The returned guard must be held for the lifetime of the application,
/// dropping it tears the global logger down.
pub fn setup_for_app(drain_channel_size: usize) -> slog_scope::GlobalLoggerGuard {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(drain_channel_size)
        .build()
        .fuse();
    let logger = slog::Logger::root(drain, slog::o!());
    slog_scope::set_global_logger(logger)
}

/// Plain discard logger for unit tests that do not care about output.
#[allow(dead_code)]
pub fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}
