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

use auraminer::logging::macros::*;

use auraminer::chain::{AsicRw, ChainOptions, HashChain};
use auraminer::config;
use auraminer::dvfs::Dvfs;
use auraminer::registry::BoardRegistry;
use auraminer::{halt, logging, power, transport};

use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    let app = clap::App::new("auraminer")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            clap::Arg::with_name("config")
                .long("config")
                .help("Set config file path")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("device")
                .long("device")
                .help("Override the serial device of the first board")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("target-ths")
                .long("target-ths")
                .help("Set tuning target in TH/s")
                .required(false)
                .takes_value(true),
        );

    let matches = app.get_matches();
    let _log_guard = logging::setup_for_app(config::ASYNC_LOGGER_DRAIN_CHANNEL_SIZE);

    let config_path = matches
        .value_of("config")
        .unwrap_or(config::DEFAULT_CONFIG_PATH);
    let mut backend = match config::Backend::parse(config_path) {
        Ok(backend) => backend,
        Err(e) => {
            warn!("Cannot load configuration file \"{}\": {}", config_path, e);
            warn!("Continuing with defaults");
            config::Backend::default()
        }
    };
    if let Some(device) = matches.value_of("device") {
        if let Some(board) = backend.board.first_mut() {
            board.device = Some(device.to_string());
        }
    }
    let target_ths = match matches.value_of("target-ths") {
        Some(value) => value.parse::<f32>().expect("target-ths is not a number"),
        None => backend.target_ths(),
    };

    // platform power drivers are wired up by the chassis integration;
    // bench rigs run unmanaged
    let psu: Arc<dyn power::Psu> = Arc::new(power::SharedPsu::new(Arc::new(
        power::UnmanagedPsu::new(backend.psu_limits()),
    )));
    let board_ctl: Arc<dyn power::BoardControl> = Arc::new(power::UnmanagedBoardControl);

    let mut registry = BoardRegistry::new();
    let mut chains: Vec<Arc<HashChain>> = Vec::new();
    for board_cfg in backend.board.clone() {
        let device = backend.device_for(&board_cfg);
        let opts = ChainOptions {
            board: board_cfg.id,
            disable_cd: backend.disable_cd,
            ..Default::default()
        };
        info!("board {}: opening {}", board_cfg.id, device);
        let port = match transport::open(&device, config::INIT_BAUD_RATE) {
            Ok(port) => port,
            Err(e) => {
                error!("board {}: cannot open {}: {}", board_cfg.id, device, e);
                continue;
            }
        };
        let board_ctl = board_ctl.clone();
        let chain = tokio::task::spawn_blocking(move || -> auraminer::error::Result<HashChain> {
            let uart = transport::Uart::new(port, config::INIT_BAUD_RATE, opts.board)?;
            HashChain::init(uart, opts, board_ctl)
        })
        .await
        .expect("BUG: discovery task panicked");
        let chain = match chain {
            Ok(chain) => chain,
            Err(e) => {
                error!("board {}: discovery failed: {}", board_cfg.id, e);
                continue;
            }
        };
        if let Err(e) = chain.setup().await {
            error!("board {}: setup failed: {}", board_cfg.id, e);
            continue;
        }
        let chain = Arc::new(chain);
        chains.push(chain.clone());
        registry.insert(board_cfg.id, chain);
    }

    if registry.is_empty() {
        error!("no hash boards came up; exiting");
        return;
    }

    let pollers: Vec<Arc<dyn AsicRw>> = registry.iter().map(|(_, c)| c.clone()).collect();
    let (halt_tx, halt_rx) = halt::make_pair();

    let mut engine = Dvfs::new(registry, psu, board_ctl, halt_rx.clone(), target_ths)
        .expect("building the DVFS engine failed");
    if let Err(e) = engine.initial_setup().await {
        error!("DVFS initial setup failed: {}", e);
        return;
    }
    halt_rx.spawn(engine.run());

    // drain results; the pool adapter plugs in here
    for chain in pollers {
        halt_rx.spawn(async move {
            loop {
                match chain.check_results().await {
                    Ok(Some(msg)) if msg.is_hashrate_update() => {
                        let gen: u64 = msg.gen_hit.iter().sum();
                        let tru: u64 = msg.true_hit.iter().sum();
                        info!(
                            "board {}: hashrate update, {} gen / {} true hits",
                            msg.board, gen, tru
                        );
                    }
                    Ok(Some(msg)) => {
                        info!(
                            "board {}: solution from chip {} engine {} seq {}",
                            msg.board, msg.chip, msg.engine, msg.seq
                        );
                    }
                    Ok(None) => {}
                    Err(e) => warn!("result collection: {}", e),
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
    }

    tokio::signal::ctrl_c().await.expect("signal handling failed");
    info!("shutting down");
    halt_tx.do_stop().await;
    for chain in chains {
        chain.close();
    }
}
