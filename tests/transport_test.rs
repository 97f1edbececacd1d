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

//! End-to-end transport and controller scenarios against a scripted chip
//! chain on the far end of a socket pair.

use auraminer::aura;
use auraminer::chain::{AsicRw, ChainOptions, HashChain};
use auraminer::power::UnmanagedBoardControl;
use auraminer::transport::{self, Uart};

use std::collections::HashSet;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const CMD_MAGIC_BYTES: [u8; 4] = [0x78, 0x56, 0x34, 0x12];

/// A register the scripted chips serve with a chip-dependent value
const TEST_REG: u8 = 0x1e;

struct MockChain {
    known: Vec<u8>,
    /// `(chip, register)` pairs that never answer
    silent: HashSet<(u8, u8)>,
    loads_seen: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
}

impl MockChain {
    fn new(known: Vec<u8>) -> Self {
        Self {
            known,
            silent: HashSet::new(),
            loads_seen: Arc::new(AtomicUsize::new(0)),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    fn register_value(chip: u8, addr: u8) -> u32 {
        match addr {
            aura::CHIP_UNIQUE => aura::CHIP_FINGERPRINT,
            // revision 2, interface version 1, 64 engines
            aura::CHIP_REVISION => (64 << 16) | (1 << 8) | 2,
            aura::TEMPERATURE => aura::TEMP_FAULT_MASK | 0x800,
            aura::VOLTAGE => 0x1900,
            TEST_REG => 0x1e00 + u32::from(chip),
            _ => 0,
        }
    }

    fn handle_frame(&self, stream: &mut UnixStream, frame: &[u8]) {
        let id = frame[4];
        let cmd = frame[5];
        let addr = frame[7];
        let code = cmd & 0x0f;
        let broadcast = cmd & aura::CMD_BROADCAST != 0;

        if code >= aura::CMD_LOAD0 && broadcast {
            self.loads_seen.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if (code == aura::CMD_READ || code == aura::CMD_READWRITE) && !broadcast {
            if !self.known.contains(&id) || self.silent.contains(&(id, addr)) {
                return;
            }
            let resp = aura::pack_resp_cfg(id, code, addr, Self::register_value(id, addr));
            let _ = stream.write_all(&resp);
        }
    }

    fn spawn(self, mut stream: UnixStream) -> thread::JoinHandle<()> {
        stream
            .set_read_timeout(Some(Duration::from_millis(20)))
            .expect("setting responder timeout failed");
        thread::spawn(move || {
            let mut acc: Vec<u8> = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                if self.stop.load(Ordering::Relaxed) {
                    break;
                }
                let n = match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(ref e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue;
                    }
                    Err(_) => break,
                };
                acc.extend_from_slice(&buf[..n]);
                loop {
                    // commands are zero-padded on the wire; sync on the magic
                    match acc
                        .windows(CMD_MAGIC_BYTES.len())
                        .position(|w| w == CMD_MAGIC_BYTES)
                    {
                        Some(idx) => {
                            acc.drain(..idx);
                        }
                        None => {
                            let tail = acc.len().min(3);
                            acc.drain(..acc.len() - tail);
                            break;
                        }
                    }
                    if acc.len() < 6 {
                        break;
                    }
                    let code = acc[5] & 0x0f;
                    let frame_len = if code >= aura::CMD_LOAD0 {
                        aura::CMD_LEN_LOAD
                    } else {
                        aura::CMD_LEN_CFG
                    };
                    if acc.len() < frame_len {
                        break;
                    }
                    let frame: Vec<u8> = acc.drain(..frame_len).collect();
                    self.handle_frame(&mut stream, &frame);
                }
            }
        })
    }
}

fn chain_options() -> ChainOptions {
    ChainOptions::default()
}

fn bring_up(known: Vec<u8>, silent: HashSet<(u8, u8)>) -> (HashChain, Arc<AtomicBool>, Arc<AtomicUsize>) {
    let (host_side, chip_side) = UnixStream::pair().expect("socket pair failed");
    let mut mock = MockChain::new(known);
    mock.silent = silent;
    let stop = mock.stop.clone();
    let loads = mock.loads_seen.clone();
    mock.spawn(chip_side);

    // the working baud keeps discovery windows short in tests
    let uart = Uart::new(
        Box::new(host_side),
        auraminer::config::WORKING_BAUD_RATE,
        1,
    )
    .expect("creating uart failed");
    let chain = HashChain::init(uart, chain_options(), Arc::new(UnmanagedBoardControl))
        .expect("chain discovery failed");
    (chain, stop, loads)
}

/// Discovery must produce exactly the responding chips, with the full
/// expected table marking everything else as missing.
#[tokio::test(flavor = "multi_thread")]
async fn test_discovery_builds_expected_table() {
    let known = vec![0u8, 1, 5, 128, 129];
    let (chain, stop, _loads) = bring_up(known.clone(), HashSet::new());

    assert_eq!(chain.detected_chip_ids(), &known[..]);
    let entries = chain.chip_entries();
    assert_eq!(entries.len(), 132);
    for entry in &entries {
        if known.contains(&entry.chip_id) {
            assert!(!entry.not_found, "chip {} marked missing", entry.chip_id);
        } else {
            assert!(entry.not_found, "chip {} marked present", entry.chip_id);
        }
    }
    let (rev, engines) = chain.revision();
    assert_eq!(rev, 2);
    assert_eq!(engines, 64);

    chain.io().shutdown();
    stop.store(true, Ordering::Relaxed);
}

/// A faulty chip is skipped on the wire, a dead one times out; both come
/// back as sentinels in their original slots and the dead chip's tracker
/// is bumped. Once the read completes the payload index holds no trace of
/// it.
#[tokio::test(flavor = "multi_thread")]
async fn test_pipelined_read_with_faulty_and_timeout() {
    let known = vec![0u8, 1, 2, 3];
    let mut silent = HashSet::new();
    silent.insert((3u8, TEST_REG));
    let (chain, stop, _loads) = bring_up(known, silent);

    chain.force_faulty(2);
    let results = chain
        .read_regs_pipelined(Some(&[0, 1, 2, 3]), &[TEST_REG])
        .await
        .expect("pipelined read failed");
    assert_eq!(results, vec![0x1e00, 0x1e01, -1, -1]);
    assert_eq!(chain.faulty_counts(3), 1);

    // completion (or timeout) must leave no record behind
    let (history, payloads, reverse) = chain.io().pending_reads();
    assert_eq!((history, payloads, reverse), (0, 0, 0));

    chain.io().shutdown();
    stop.store(true, Ordering::Relaxed);
}

/// A read addressed to a chip that never answers completes through the
/// reaper with a nonzero status and sentinel data.
#[tokio::test(flavor = "multi_thread")]
async fn test_timeout_surfaces_nonzero_status() {
    let known = vec![0u8, 1];
    let (chain, stop, _loads) = bring_up(known, HashSet::new());

    let outcome = chain
        .io()
        .non_blocking_read(vec![60], vec![TEST_REG], aura::CMD_READ)
        .await
        .expect("read call failed");
    assert_ne!(outcome.status, 0);
    assert_eq!(outcome.data, vec![transport::NO_RESPONSE]);

    chain.io().shutdown();
    stop.store(true, Ordering::Relaxed);
}

/// Full bring-up plus a job load: setup traffic flows, the broadcast load
/// frame reaches the chips, and a second job does not re-clear counters.
#[tokio::test(flavor = "multi_thread")]
async fn test_setup_and_job_dispatch() {
    let known = vec![0u8, 1, 2];
    let (chain, stop, loads) = bring_up(known, HashSet::new());

    chain.setup().await.expect("setup failed");

    let job = auraminer::Message {
        seq: 1,
        diff: 0x1d,
        version_mask: 0x1fffe000,
        body: hex::encode(&[0x42u8; 80][..]),
        ..Default::default()
    };
    chain.send_job(&job).await.expect("job dispatch failed");

    // the load is a high-priority frame; give the writer a moment
    for _ in 0..50 {
        if loads.load(Ordering::Relaxed) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(loads.load(Ordering::Relaxed), 1);

    chain.io().shutdown();
    stop.store(true, Ordering::Relaxed);
}
