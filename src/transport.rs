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

//! Serial transport for the Aura register protocol.
//!
//! One serial line is shared by every chip on the board, half duplex. The
//! transport has two surfaces:
//!
//!   * `Uart` - synchronous, used during discovery before the worker
//!     threads exist. Reads are drained inline.
//!   * `Io` - asynchronous, obtained from `Uart::enable_async_rw`. Three
//!     dedicated threads (writer, reader, timeout reaper) own the device;
//!     callers talk to them over channels and suspend on per-request
//!     completion signals.
//!
//! Outstanding reads are tracked in a history of records plus a payload
//! index mapping `(chip, register)` to the pending records for that pair.
//! An incoming response is matched to the oldest record for its pair;
//! records that stop responding are force-completed by the reaper with the
//! `NO_RESPONSE` sentinel in their data slots.

use crate::aura;
use crate::error::{self, ErrorKind};
use crate::logging::macros::*;

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

/// Sentinel for a `(chip, register)` pair that never answered
pub const NO_RESPONSE: i64 = -1;

/// Cadence of the timeout reaper
const REAPER_PERIOD: Duration = Duration::from_millis(20);
/// Age at which a pending read is considered timed out, assuming the reader
/// is running
const READ_TIMEOUT: Duration = Duration::from_millis(200);
/// Age past which a pending read times out no matter what the reader was
/// doing (covers the bad-chip case)
const READ_MAX_TIMEOUT: Duration = Duration::from_millis(1000);
/// No reader activity for this long means the reader is descheduled, so a
/// pending read is re-queued instead of timed out
const ACTIVITY_MAX_TIMEOUT: Duration = Duration::from_millis(100);
/// Reader activity this recent means a response is probably in flight, so
/// give the read a little longer
const ACTIVITY_MIN_TIMEOUT: Duration = Duration::from_millis(20);
/// A reader iteration gap longer than this is recorded as a blackout
/// window; reads submitted before it get their clock restarted
const BLACKOUT_THRESHOLD: Duration = Duration::from_millis(50);
/// Bytes accumulated without a magic before the buffer is cut down
const RESYNC_DISCARD_THRESHOLD: usize = 1024;
/// Serial write attempts before giving up on a frame
const WRITE_RETRIES: usize = 3;
/// Reader poll granularity once the worker threads run
const READER_POLL: Duration = Duration::from_millis(50);
/// Pending reads above this are logged as a backlog
const PENDING_BACKLOG_WARN: usize = 8;

/// Byte source/sink the transport runs on. The production implementation
/// is a tty; tests substitute a socket pair.
pub trait Wire: Read + Write + Send {
    fn try_clone_wire(&self) -> error::Result<Box<dyn Wire>>;
    fn set_baud(&mut self, baud: u32) -> error::Result<()>;
    fn set_read_timeout(&mut self, timeout: Duration) -> error::Result<()>;
}

impl Wire for Box<dyn serialport::SerialPort> {
    fn try_clone_wire(&self) -> error::Result<Box<dyn Wire>> {
        let port = self.try_clone()?;
        Ok(Box::new(port))
    }

    fn set_baud(&mut self, baud: u32) -> error::Result<()> {
        self.set_baud_rate(baud)?;
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> error::Result<()> {
        self.set_timeout(timeout)?;
        Ok(())
    }
}

impl Wire for UnixStream {
    fn try_clone_wire(&self) -> error::Result<Box<dyn Wire>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn set_baud(&mut self, _baud: u32) -> error::Result<()> {
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> error::Result<()> {
        UnixStream::set_read_timeout(self, Some(timeout))?;
        Ok(())
    }
}

/// Open the serial device in raw 8-N-1 mode
pub fn open(path: &str, baud: u32) -> error::Result<Box<dyn Wire>> {
    let port = serialport::new(path, baud)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .timeout(Duration::from_millis(50))
        .open()?;
    Ok(Box::new(port))
}

/// Blocking-read window: per-response transfer time at the current baud
/// rate times the expected response count plus slack, with a 1 ms floor.
pub fn reg_read_timeout(baud: u32, responses: u64) -> Duration {
    let base = aura::RSP_LEN_CFG as u64 * 10_000_000 * 5 / u64::from(baud);
    let mut micros = base * (responses + 20);
    if micros < 1000 {
        micros = 1000;
    }
    Duration::from_micros(micros)
}

fn is_would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn write_with_retry(port: &mut Box<dyn Wire>, msg: &[u8], board: u8) -> error::Result<()> {
    let mut last_err = None;
    for retry in 0..WRITE_RETRIES {
        match port.write_all(msg) {
            Ok(()) => {
                if retry > 0 {
                    info!("B{}: write succeeded on retry {}", board, retry);
                }
                return Ok(());
            }
            Err(e) => last_err = Some(e),
        }
    }
    let e = last_err.expect("BUG: no write error recorded");
    error!("B{}: write failed after {} attempts: {}", board, WRITE_RETRIES, e);
    Err(e.into())
}

fn write_idle(port: &mut Box<dyn Wire>, n: usize, board: u8) -> error::Result<()> {
    let zeros = vec![0u8; n];
    write_with_retry(port, &zeros, board)
}

/// A frame extracted from the byte stream, not yet CRC-checked
#[derive(Debug, PartialEq)]
pub(crate) enum Frame {
    Cfg(Vec<u8>),
    Hit(Vec<u8>),
}

/// Accumulating frame scanner. Frames are delimited by the response magic
/// plus a fixed length keyed off the echoed command byte; the scanner also
/// recovers the two observed single-byte-loss shapes.
pub(crate) struct Deframer {
    board: u8,
    acc: Vec<u8>,
    frame_start: bool,
}

impl Deframer {
    pub(crate) fn new(board: u8) -> Self {
        Self {
            board,
            acc: Vec::new(),
            frame_start: false,
        }
    }

    pub(crate) fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.acc.extend_from_slice(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = self.extract() {
            frames.push(frame);
        }
        frames
    }

    fn find_magic(acc: &[u8]) -> Option<usize> {
        acc.windows(aura::RSP_MAGIC_BYTES.len())
            .position(|window| window == aura::RSP_MAGIC_BYTES)
    }

    fn extract(&mut self) -> Option<Frame> {
        if !self.frame_start {
            if self.acc.len() > 4 {
                let mut idx = Self::find_magic(&self.acc);
                // A magic one short of the frame length (or an accumulator
                // stuck at that length) points at one byte dropped inside
                // the leading magic itself.
                let shifted = idx == Some(aura::RSP_LEN_CFG - 1)
                    || idx == Some(2 * (aura::RSP_LEN_CFG - 1))
                    || (idx.is_none()
                        && (self.acc.len() == aura::RSP_LEN_CFG - 1
                            || self.acc.len() == 2 * (aura::RSP_LEN_CFG - 1)));
                if shifted {
                    let m = aura::RSP_MAGIC_BYTES;
                    let (b0, b1, b2) = (self.acc[0], self.acc[1], self.acc[2]);
                    let magic_like = (b1 == m[2] && b2 == m[3] && (b0 == m[0] || b0 == m[1]))
                        || (b0 == m[0] && b1 == m[1] && (b2 == m[2] || b2 == m[3]));
                    if magic_like
                        && (self.acc[4] == aura::CMD_READ || self.acc[4] == aura::CMD_READWRITE)
                        && self.acc[5] == 0
                    {
                        info!("B{}: recovered from 1B loss in leading magic", self.board);
                        let mut rebuilt = m.to_vec();
                        rebuilt.extend_from_slice(&self.acc[3..]);
                        self.acc = rebuilt;
                        idx = Some(0);
                    }
                }
                match idx {
                    Some(0) => self.frame_start = true,
                    Some(i) => {
                        info!("B{}: dropped {}B before magic", self.board, i);
                        self.acc.drain(..i);
                        self.frame_start = true;
                    }
                    None => {}
                }
            }
            if !self.frame_start {
                if self.acc.len() > RESYNC_DISCARD_THRESHOLD {
                    // keep a tail in case a magic is split across reads
                    let tail_from = self.acc.len() - 3;
                    self.acc.drain(..tail_from);
                }
                return None;
            }
        }

        if self.acc.len() >= 6 {
            let cmd = self.acc[5];
            let hit_lo = aura::CMD_LOAD0 | aura::CMD_RETURN_HIT;
            let hit_hi = aura::CMD_LOAD3 | aura::CMD_RETURN_HIT;
            if cmd >= hit_lo && cmd <= hit_hi {
                if self.acc.len() >= aura::RSP_LEN_HIT {
                    let frame: Vec<u8> = self.acc.drain(..aura::RSP_LEN_HIT).collect();
                    self.frame_start = false;
                    return Some(Frame::Hit(frame));
                }
            } else if self.acc.len() >= aura::RSP_LEN_CFG {
                let mut take = aura::RSP_LEN_CFG;
                // the frame lost its final byte when the next magic starts
                // one position early
                if self.acc.len() > aura::RSP_LEN_CFG
                    && self.acc[aura::RSP_LEN_CFG - 1] == aura::RSP_MAGIC_BYTES[0]
                    && self.acc[aura::RSP_LEN_CFG] == aura::RSP_MAGIC_BYTES[1]
                {
                    take = aura::RSP_LEN_CFG - 1;
                }
                let frame: Vec<u8> = self.acc.drain(..take).collect();
                self.frame_start = false;
                return Some(Frame::Cfg(frame));
            }
        }
        None
    }
}

/// Validate a config frame: attempt single-byte-loss reconstruction of
/// 15-byte fragments, then verify the CRC against the prefix. A frame that
/// fails the CRC is dropped, never passed upward.
fn check_cfg_resp(mut buf: Vec<u8>, board: u8) -> Option<aura::ResponseCfg> {
    let mut loss_offset = 0usize;
    if buf.len() == aura::RSP_LEN_CFG - 1 {
        if buf[4] != aura::CMD_READ && buf[5] == 0 {
            // command byte missing, spare slid into its place
            buf.insert(5, aura::CMD_READ);
            loss_offset = 5;
        } else if buf[5] == aura::CMD_READ && buf[6] != 0 {
            // spare byte missing
            buf.insert(6, 0);
            loss_offset = 6;
        } else {
            error!("B{}: dropped unrecoverable short resp {}", board, hex::encode(&buf));
            return None;
        }
    }
    if buf.len() != aura::RSP_LEN_CFG {
        return None;
    }
    if !aura::frame_crc_ok(&buf) {
        error!("B{}: dropped resp on crc32 mismatch {}", board, hex::encode(&buf));
        return None;
    }
    if loss_offset > 0 {
        info!("B{}: recovered from 1B loss at offset {}", board, loss_offset);
    }
    aura::ResponseCfg::unpack(&buf).ok()
}

/// Validate a hit frame. Sequence 0 marks a stale hit from before the
/// first job and is dropped regardless of CRC.
fn check_hit_resp(buf: Vec<u8>, board: u8) -> Result<Option<aura::ResponseHit>, ()> {
    if buf.len() != aura::RSP_LEN_HIT {
        return Err(());
    }
    if buf[7] == 0 {
        debug!("B{}: hit ignored for seq 0", board);
        return Ok(None);
    }
    if !aura::frame_crc_ok(&buf) {
        error!("B{}: dropped hit on crc32 mismatch", board);
        return Err(());
    }
    match aura::ResponseHit::unpack(&buf) {
        Ok(hit) => Ok(Some(hit)),
        Err(_) => Err(()),
    }
}

/// Completion of one pipelined read: nonzero status means at least one
/// slot carries the `NO_RESPONSE` sentinel because of a timeout.
#[derive(Debug)]
pub struct ReadOutcome {
    pub status: i32,
    pub data: Vec<i64>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct Payload {
    chip: u8,
    addr: u8,
}

struct ReadRecord {
    seq: u64,
    targets: Vec<u8>,
    addrs: Vec<u8>,
    data: Vec<i64>,
    resps: usize,
    request_time: Instant,
    response_time: Option<Instant>,
    done_tx: Option<oneshot::Sender<ReadOutcome>>,
}

enum Request {
    Write {
        targets: Vec<u8>,
        addrs: Vec<u8>,
        data: Vec<i64>,
        broadcast: bool,
    },
    Read {
        targets: Vec<u8>,
        addrs: Vec<u8>,
        cmd: u8,
        done_tx: oneshot::Sender<ReadOutcome>,
    },
    ReturnHit {
        chip: u8,
    },
    Load {
        frame: Vec<u8>,
    },
    SetBaud(u32),
    Shutdown,
}

#[derive(Default)]
struct RegMap {
    by_payload: HashMap<Payload, VecDeque<u64>>,
    by_record: HashMap<u64, Vec<Payload>>,
}

#[derive(Default)]
struct History {
    records: HashMap<u64, ReadRecord>,
    order: VecDeque<u64>,
}

struct Activity {
    read_time: Instant,
    alive_time: Instant,
    blackout_time: Instant,
    blackout_duration: Duration,
}

struct Shared {
    board: u8,
    regmap: Mutex<RegMap>,
    history: Mutex<History>,
    activity: Mutex<Activity>,
    hits: Mutex<VecDeque<aura::ResponseHit>>,
    hi_tx: Mutex<mpsc::Sender<Request>>,
    cmd_tx: Mutex<mpsc::Sender<Request>>,
    crc_err_cfg: AtomicU32,
    crc_err_hit: AtomicU32,
    shutdown: AtomicBool,
}

/// Synchronous transport surface used during chip discovery
pub struct Uart {
    port: Box<dyn Wire>,
    baud: u32,
    board: u8,
    deframer: Deframer,
    responses: VecDeque<aura::ResponseCfg>,
    hits: VecDeque<aura::ResponseHit>,
}

impl Uart {
    pub fn new(mut port: Box<dyn Wire>, baud: u32, board: u8) -> error::Result<Self> {
        port.set_read_timeout(Duration::from_millis(1))?;
        Ok(Self {
            port,
            baud,
            board,
            deframer: Deframer::new(board),
            responses: VecDeque::new(),
            hits: VecDeque::new(),
        })
    }

    pub fn board(&self) -> u8 {
        self.board
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// Emit `n` zero bytes to separate bursts and let the bus quiesce
    pub fn write_idle(&mut self, n: usize) -> error::Result<()> {
        write_idle(&mut self.port, n, self.board)
    }

    pub fn blocking_write(
        &mut self,
        target: u8,
        addr: u8,
        cmd: u8,
        data: u32,
        broadcast: bool,
    ) -> error::Result<()> {
        let cmd = if broadcast { cmd | aura::CMD_BROADCAST } else { cmd };
        let frame = aura::pack_cmd_cfg(target, cmd, addr, data);
        write_with_retry(&mut self.port, &frame, self.board)
    }

    /// Write a read request and spin on the response queue until a frame
    /// matching `(target, cmd, addr)` arrives or the window closes.
    pub fn blocking_read(
        &mut self,
        target: u8,
        addr: u8,
        cmd: u8,
        data: u32,
    ) -> error::Result<u32> {
        self.write_idle(aura::IDLE_BYTES)?;
        self.blocking_write(target, addr, cmd, data, false)?;
        let timeout = reg_read_timeout(self.baud, 40);
        let start = Instant::now();
        loop {
            thread::sleep(Duration::from_micros(1));
            while let Some(resp) = self.poll_response() {
                if resp.id == target && resp.cmd == cmd && resp.addr == addr {
                    return Ok(resp.data);
                }
            }
            if start.elapsed() > timeout {
                break;
            }
        }
        Err(ErrorKind::Timeout(format!(
            "chip {} register {:#x} did not respond",
            target, addr
        )))?
    }

    /// Pull whatever the line has and return the next validated config
    /// response, if any
    pub fn poll_response(&mut self) -> Option<aura::ResponseCfg> {
        self.drain();
        self.responses.pop_front()
    }

    pub fn clear_responses(&mut self) {
        self.drain();
        self.responses.clear();
    }

    pub fn reg_read_window(&self, responses: u64) -> Duration {
        reg_read_timeout(self.baud, responses)
    }

    /// Change the host-side baud rate. The chips must already have their
    /// divisor register updated or the bus becomes unintelligible.
    pub fn set_host_baud(&mut self, baud: u32) -> error::Result<()> {
        self.port.set_baud(baud)?;
        self.baud = baud;
        Ok(())
    }

    fn drain(&mut self) {
        let mut buf = [0u8; 512];
        loop {
            match self.port.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for frame in self.deframer.feed(&buf[..n]) {
                        match frame {
                            Frame::Cfg(bytes) => {
                                if let Some(resp) = check_cfg_resp(bytes, self.board) {
                                    self.responses.push_back(resp);
                                }
                            }
                            Frame::Hit(bytes) => {
                                if let Ok(Some(hit)) = check_hit_resp(bytes, self.board) {
                                    self.hits.push_back(hit);
                                }
                            }
                        }
                    }
                }
                Err(ref e) if is_would_block(e) => break,
                Err(e) => {
                    warn!("B{}: serial read error: {}", self.board, e);
                    break;
                }
            }
        }
    }

    /// Spawn the writer, reader and timeout-reaper threads and hand out
    /// the asynchronous surface. The synchronous surface is consumed.
    pub fn enable_async_rw(mut self) -> error::Result<Io> {
        let mut reader_port = self.port.try_clone_wire()?;
        reader_port.set_read_timeout(READER_POLL)?;
        let writer_port = self.port.try_clone_wire()?;

        let (hi_tx, hi_rx) = mpsc::channel();
        let (cmd_tx, cmd_rx) = mpsc::channel();

        let now = Instant::now();
        let shared = Arc::new(Shared {
            board: self.board,
            regmap: Mutex::new(RegMap::default()),
            history: Mutex::new(History::default()),
            activity: Mutex::new(Activity {
                read_time: now,
                alive_time: now,
                blackout_time: now,
                blackout_duration: Duration::from_secs(0),
            }),
            hits: Mutex::new(self.hits.drain(..).collect()),
            hi_tx: Mutex::new(hi_tx),
            cmd_tx: Mutex::new(cmd_tx),
            crc_err_cfg: AtomicU32::new(0),
            crc_err_hit: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
        });

        let board = self.board;
        let deframer = self.deframer;

        let reader_shared = shared.clone();
        thread::Builder::new()
            .name(format!("uart{}-reader", board))
            .spawn(move || reader_thread(reader_port, reader_shared, deframer))?;

        let writer_shared = shared.clone();
        thread::Builder::new()
            .name(format!("uart{}-writer", board))
            .spawn(move || writer_thread(writer_port, writer_shared, hi_rx, cmd_rx))?;

        let reaper_shared = shared.clone();
        thread::Builder::new()
            .name(format!("uart{}-reaper", board))
            .spawn(move || reaper_thread(reaper_shared))?;

        Ok(Io { shared })
    }
}

/// Asynchronous transport surface. Cloneable; all clones feed the same
/// worker threads.
#[derive(Clone)]
pub struct Io {
    shared: Arc<Shared>,
}

impl Io {
    fn send_request(&self, request: Request, high_priority: bool) -> error::Result<()> {
        let sender = if high_priority {
            self.shared.hi_tx.lock().expect("BUG: sender lock poisoned")
        } else {
            self.shared.cmd_tx.lock().expect("BUG: sender lock poisoned")
        };
        sender
            .send(request)
            .map_err(|_| ErrorKind::Io("transport is shut down".to_string()))?;
        Ok(())
    }

    /// Enqueue a write batch. Broadcast writes carry one data word per
    /// register, per-chip writes one word per `(target, register)` pair.
    pub fn non_blocking_write(
        &self,
        targets: Vec<u8>,
        addrs: Vec<u8>,
        data: Vec<i64>,
        broadcast: bool,
    ) -> error::Result<()> {
        let expected = if broadcast {
            addrs.len()
        } else {
            targets.len() * addrs.len()
        };
        if data.len() != expected {
            Err(ErrorKind::General(format!(
                "write data length {} does not match {} register slots",
                data.len(),
                expected
            )))?
        }
        self.send_request(
            Request::Write {
                targets,
                addrs,
                data,
                broadcast,
            },
            false,
        )
    }

    /// Enqueue a read batch and wait for its completion signal. The result
    /// vector has `targets.len() * addrs.len()` slots in target-major
    /// order; unanswered slots hold `NO_RESPONSE`.
    pub async fn non_blocking_read(
        &self,
        targets: Vec<u8>,
        addrs: Vec<u8>,
        cmd: u8,
    ) -> error::Result<ReadOutcome> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send_request(
            Request::Read {
                targets,
                addrs,
                cmd,
                done_tx,
            },
            false,
        )?;
        done_rx
            .await
            .map_err(|_| ErrorKind::Timeout("read abandoned by transport shutdown".to_string()).into())
    }

    /// Ask one chip for its most recent hit; the reply lands in the hit
    /// queue. High priority: preempts pipelined reads between frames.
    pub fn request_hit_result(&self, chip: u8) -> error::Result<()> {
        self.send_request(Request::ReturnHit { chip }, true)
    }

    /// Broadcast a job load. No response is expected.
    pub fn asic_load(&self, nbits: u8, seq: u8, header: &[u8; 80]) -> error::Result<()> {
        let frame = aura::pack_cmd_load(nbits, seq, header).to_vec();
        self.send_request(Request::Load { frame }, true)
    }

    /// Pop the next validated hit frame, if any
    pub fn check_hit_result(&self) -> Option<aura::ResponseHit> {
        self.shared
            .hits
            .lock()
            .expect("BUG: hit queue lock poisoned")
            .pop_front()
    }

    /// Apply a host-side baud change, ordered after everything already in
    /// the command queue (so the divisor frames drain at the old rate).
    pub fn set_host_baud(&self, baud: u32) -> error::Result<()> {
        self.send_request(Request::SetBaud(baud), false)
    }

    /// Stop the worker threads. Pending reads complete with an error
    /// status once the reaper gets to them.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        let _ = self.send_request(Request::Shutdown, true);
    }

    /// (config CRC failures, hit CRC failures) since start
    pub fn crc_error_counts(&self) -> (u32, u32) {
        (
            self.shared.crc_err_cfg.load(Ordering::Relaxed),
            self.shared.crc_err_hit.load(Ordering::Relaxed),
        )
    }

    /// Diagnostic snapshot of the pending-read bookkeeping:
    /// (history records, forward payload entries, reverse map records)
    pub fn pending_reads(&self) -> (usize, usize, usize) {
        let history = self.shared.history.lock().expect("BUG: history lock poisoned");
        let regmap = self.shared.regmap.lock().expect("BUG: regmap lock poisoned");
        (
            history.order.len(),
            regmap.by_payload.values().map(|q| q.len()).sum(),
            regmap.by_record.len(),
        )
    }
}

fn register_read(
    shared: &Shared,
    seq: u64,
    targets: Vec<u8>,
    addrs: Vec<u8>,
    done_tx: oneshot::Sender<ReadOutcome>,
) {
    let record = ReadRecord {
        seq,
        data: vec![NO_RESPONSE; targets.len() * addrs.len()],
        resps: 0,
        request_time: Instant::now(),
        response_time: None,
        done_tx: Some(done_tx),
        targets,
        addrs,
    };
    {
        let mut regmap = shared.regmap.lock().expect("BUG: regmap lock poisoned");
        let mut payloads = Vec::with_capacity(record.data.len());
        for &chip in &record.targets {
            for &addr in &record.addrs {
                let payload = Payload { chip, addr };
                regmap.by_payload.entry(payload).or_default().push_back(seq);
                payloads.push(payload);
            }
        }
        regmap.by_record.insert(seq, payloads);
    }
    {
        let mut history = shared.history.lock().expect("BUG: history lock poisoned");
        history.records.insert(seq, record);
        history.order.push_back(seq);
    }
}

fn remove_payload_entries(shared: &Shared, seq: u64) {
    let mut regmap = shared.regmap.lock().expect("BUG: regmap lock poisoned");
    if let Some(payloads) = regmap.by_record.remove(&seq) {
        for payload in payloads {
            let emptied = match regmap.by_payload.get_mut(&payload) {
                Some(queue) => {
                    queue.retain(|&s| s != seq);
                    queue.is_empty()
                }
                None => false,
            };
            if emptied {
                regmap.by_payload.remove(&payload);
            }
        }
    }
}

fn complete_record(shared: &Shared, mut record: ReadRecord, status: i32) {
    remove_payload_entries(shared, record.seq);
    if let Some(done_tx) = record.done_tx.take() {
        let data = std::mem::take(&mut record.data);
        let _ = done_tx.send(ReadOutcome { status, data });
    }
}

fn dispatch_cfg(shared: &Shared, resp: aura::ResponseCfg) {
    let payload = Payload {
        chip: resp.id,
        addr: resp.addr,
    };
    // oldest pending record for this pair wins
    let seq = {
        let regmap = shared.regmap.lock().expect("BUG: regmap lock poisoned");
        regmap
            .by_payload
            .get(&payload)
            .and_then(|queue| queue.front().copied())
    };
    let seq = match seq {
        Some(seq) => seq,
        // response for a record that already completed or timed out
        None => return,
    };

    let finished = {
        let mut history = shared.history.lock().expect("BUG: history lock poisoned");
        let record = match history.records.get_mut(&seq) {
            Some(record) => record,
            None => return,
        };
        let asic_idx = record
            .targets
            .iter()
            .position(|&t| t == resp.id)
            .unwrap_or(0);
        let addr_idx = record
            .addrs
            .iter()
            .position(|&a| a == resp.addr)
            .unwrap_or(0);
        record.data[asic_idx * record.addrs.len() + addr_idx] = i64::from(resp.data);
        if record.response_time.is_none() {
            record.response_time = Some(Instant::now());
        }
        record.resps += 1;
        if record.resps == record.targets.len() * record.addrs.len() {
            let record = history
                .records
                .remove(&seq)
                .expect("BUG: record vanished under the history lock");
            history.order.retain(|&s| s != seq);
            Some(record)
        } else {
            None
        }
    };

    if let Some(record) = finished {
        complete_record(shared, record, 0);
        shared
            .activity
            .lock()
            .expect("BUG: activity lock poisoned")
            .alive_time = Instant::now();
    }
}

fn reader_thread(mut port: Box<dyn Wire>, shared: Arc<Shared>, mut deframer: Deframer) {
    let board = shared.board;
    let mut buf = [0u8; 1024];
    let mut last_iteration = Instant::now();
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }
        {
            let now = Instant::now();
            let mut activity = shared.activity.lock().expect("BUG: activity lock poisoned");
            if now.duration_since(last_iteration) > BLACKOUT_THRESHOLD {
                activity.blackout_time = last_iteration;
                activity.blackout_duration = now.duration_since(last_iteration);
            }
            activity.read_time = now;
        }
        last_iteration = Instant::now();

        match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                for frame in deframer.feed(&buf[..n]) {
                    match frame {
                        Frame::Cfg(bytes) => match check_cfg_resp(bytes, board) {
                            Some(resp) => dispatch_cfg(&shared, resp),
                            None => {
                                shared.crc_err_cfg.fetch_add(1, Ordering::Relaxed);
                            }
                        },
                        Frame::Hit(bytes) => match check_hit_resp(bytes, board) {
                            Ok(Some(hit)) => shared
                                .hits
                                .lock()
                                .expect("BUG: hit queue lock poisoned")
                                .push_back(hit),
                            Ok(None) => {} // stale seq-0 hit
                            Err(()) => {
                                shared.crc_err_hit.fetch_add(1, Ordering::Relaxed);
                            }
                        },
                    }
                }
            }
            Err(ref e) if is_would_block(e) => continue,
            Err(e) => {
                // transient device errors never kill the reader
                error!("B{}: serial read error: {}", board, e);
                continue;
            }
        }
    }
    info!("B{}: terminating response reader", board);
}

fn writer_thread(
    mut port: Box<dyn Wire>,
    shared: Arc<Shared>,
    hi_rx: mpsc::Receiver<Request>,
    cmd_rx: mpsc::Receiver<Request>,
) {
    let board = shared.board;
    let mut seq: u64 = 0;
    loop {
        // high-priority requests (hit fetches, job loads) preempt queued
        // command traffic between frames
        let request = match hi_rx.try_recv() {
            Ok(request) => request,
            Err(mpsc::TryRecvError::Empty) => {
                match cmd_rx.recv_timeout(Duration::from_millis(1)) {
                    Ok(request) => request,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if shared.shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        continue;
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            Err(mpsc::TryRecvError::Disconnected) => break,
        };

        match request {
            Request::Shutdown => break,
            Request::SetBaud(baud) => {
                if let Err(e) = port.set_baud(baud) {
                    error!("B{}: host baud change to {} failed: {}", board, baud, e);
                }
            }
            Request::Load { frame } => {
                let _ = write_with_retry(&mut port, &frame, board);
                debug!("B{}: issued load0", board);
            }
            Request::ReturnHit { chip } => {
                let _ = write_idle(&mut port, aura::IDLE_BYTES, board);
                let frame = aura::pack_cmd_cfg(chip, aura::CMD_RETURN_HIT, 0, 0);
                let _ = write_with_retry(&mut port, &frame, board);
                // leave enough idle time for the 92-byte reply
                let _ = write_idle(&mut port, aura::RSP_LEN_HIT, board);
            }
            Request::Write {
                targets,
                addrs,
                data,
                broadcast,
            } => {
                if targets.is_empty() {
                    if !broadcast {
                        error!("B{}: write without targets must be broadcast", board);
                        continue;
                    }
                    for (i, &addr) in addrs.iter().enumerate() {
                        let frame = aura::pack_cmd_cfg(
                            0,
                            aura::CMD_WRITE | aura::CMD_BROADCAST,
                            addr,
                            data[i] as u32,
                        );
                        let _ = write_with_retry(&mut port, &frame, board);
                    }
                } else {
                    for (i, &target) in targets.iter().enumerate() {
                        for (j, &addr) in addrs.iter().enumerate() {
                            let frame = aura::pack_cmd_cfg(
                                target,
                                aura::CMD_WRITE,
                                addr,
                                data[i * addrs.len() + j] as u32,
                            );
                            let _ = write_with_retry(&mut port, &frame, board);
                        }
                    }
                }
            }
            Request::Read {
                targets,
                addrs,
                cmd,
                done_tx,
            } => {
                if targets.is_empty() || addrs.is_empty() {
                    let _ = done_tx.send(ReadOutcome {
                        status: -1,
                        data: Vec::new(),
                    });
                    continue;
                }
                seq += 1;
                register_read(&shared, seq, targets.clone(), addrs.clone(), done_tx);
                for &target in &targets {
                    for &addr in &addrs {
                        let _ = write_idle(&mut port, aura::IDLE_BYTES, board);
                        let frame = aura::pack_cmd_cfg(target, cmd, addr, 0);
                        let _ = write_with_retry(&mut port, &frame, board);
                    }
                }
            }
        }
    }
    info!("B{}: terminating command writer", board);
}

enum ReapDecision {
    Keep,
    Expire,
}

fn reaper_thread(shared: Arc<Shared>) {
    let board = shared.board;
    loop {
        thread::sleep(REAPER_PERIOD);
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }
        let now = Instant::now();
        let (blackout_time, blackout_end, read_time, alive_time) = {
            let activity = shared.activity.lock().expect("BUG: activity lock poisoned");
            (
                activity.blackout_time,
                activity.blackout_time + activity.blackout_duration,
                activity.read_time,
                activity.alive_time,
            )
        };

        let mut expired = Vec::new();
        {
            let mut history = shared.history.lock().expect("BUG: history lock poisoned");
            if history.order.len() > PENDING_BACKLOG_WARN {
                warn!("B{}: pending read backlog {}", board, history.order.len());
            }
            let order: Vec<u64> = history.order.iter().copied().collect();
            let mut keep = VecDeque::with_capacity(order.len());
            for seq in order {
                let decision = {
                    let record = match history.records.get_mut(&seq) {
                        Some(record) => record,
                        None => continue,
                    };
                    let age = now.saturating_duration_since(record.request_time);
                    if age < READ_TIMEOUT {
                        ReapDecision::Keep
                    } else if age >= READ_MAX_TIMEOUT {
                        // even a blacked-out reader cannot excuse this one
                        ReapDecision::Expire
                    } else if record.request_time < blackout_time {
                        // submitted before the reader blackout; restart its clock
                        record.request_time = blackout_end;
                        ReapDecision::Keep
                    } else if now.saturating_duration_since(read_time) > ACTIVITY_MAX_TIMEOUT {
                        // reader is descheduled, nothing could have arrived
                        ReapDecision::Keep
                    } else if now.saturating_duration_since(read_time) < ACTIVITY_MIN_TIMEOUT {
                        // reader is actively pulling bytes, expect the reply
                        ReapDecision::Keep
                    } else {
                        ReapDecision::Expire
                    }
                };
                match decision {
                    ReapDecision::Keep => keep.push_back(seq),
                    ReapDecision::Expire => {
                        let record = history
                            .records
                            .remove(&seq)
                            .expect("BUG: record vanished under the history lock");
                        error!(
                            "B{}: read seq {} timed out, {}/{} responses, targets {:?} addrs {:?}, \
                             last complete {:?} ago, last read {:?} ago",
                            board,
                            seq,
                            record.resps,
                            record.targets.len() * record.addrs.len(),
                            record.targets,
                            record.addrs,
                            now.saturating_duration_since(alive_time),
                            now.saturating_duration_since(read_time)
                        );
                        expired.push(record);
                    }
                }
            }
            history.order = keep;
        }

        for record in expired {
            complete_record(&shared, record, 1);
        }
    }
    // flush whatever is still pending so no caller stays suspended
    let leftovers: Vec<ReadRecord> = {
        let mut history = shared.history.lock().expect("BUG: history lock poisoned");
        history.order.clear();
        history.records.drain().map(|(_, record)| record).collect()
    };
    for record in leftovers {
        complete_record(&shared, record, 1);
    }
    info!("B{}: terminating timeout reaper", board);
}

#[cfg(test)]
mod test {
    use super::*;

    fn cfg_frame(id: u8, addr: u8, data: u32) -> [u8; aura::RSP_LEN_CFG] {
        aura::pack_resp_cfg(id, aura::CMD_READ, addr, data)
    }

    fn hit_frame(id: u8, seq: u8) -> [u8; aura::RSP_LEN_HIT] {
        let result = [0u8; 80];
        aura::pack_resp_hit(id, aura::CMD_LOAD0 | aura::CMD_RETURN_HIT, 32, seq, &result)
    }

    #[test]
    fn test_deframer_whole_cfg_frame() {
        let mut deframer = Deframer::new(1);
        let frames = deframer.feed(&cfg_frame(3, aura::SUMMARY, 0x55));
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Cfg(bytes) => assert_eq!(bytes.len(), aura::RSP_LEN_CFG),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_deframer_garbage_prefix_resync() {
        let mut deframer = Deframer::new(1);
        let mut stream = vec![0u8, 0xff, 0x13, 0x00, 0x00];
        stream.extend_from_slice(&cfg_frame(3, aura::SUMMARY, 0x55));
        let frames = deframer.feed(&stream);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Cfg(bytes) => {
                let resp = check_cfg_resp(bytes.clone(), 1).expect("frame dropped");
                assert_eq!(resp.id, 3);
                assert_eq!(resp.data, 0x55);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_deframer_split_across_reads() {
        let mut deframer = Deframer::new(1);
        let frame = cfg_frame(7, aura::TEMPERATURE, 0x1234);
        assert!(deframer.feed(&frame[..5]).is_empty());
        assert!(deframer.feed(&frame[5..10]).is_empty());
        let frames = deframer.feed(&frame[10..]);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_deframer_back_to_back_frames() {
        let mut deframer = Deframer::new(1);
        let mut stream = Vec::new();
        stream.extend_from_slice(&cfg_frame(1, aura::SUMMARY, 1));
        stream.extend_from_slice(&hit_frame(2, 9));
        stream.extend_from_slice(&cfg_frame(3, aura::SUMMARY, 3));
        let frames = deframer.feed(&stream);
        assert_eq!(frames.len(), 3);
        assert!(matches!(frames[0], Frame::Cfg(_)));
        assert!(matches!(frames[1], Frame::Hit(_)));
        assert!(matches!(frames[2], Frame::Cfg(_)));
    }

    #[test]
    fn test_deframer_discards_runaway_garbage() {
        let mut deframer = Deframer::new(1);
        assert!(deframer.feed(&vec![0xaau8; 2000]).is_empty());
        assert!(deframer.acc.len() <= 3);
        // and still locks on to a later frame
        let frames = deframer.feed(&cfg_frame(5, aura::VOLTAGE, 42));
        assert_eq!(frames.len(), 1);
    }

    /// One magic byte dropped: the deframer reconstructs the leading magic
    /// and the frame passes CRC afterwards.
    #[test]
    fn test_deframer_magic_byte_loss_recovery() {
        let mut deframer = Deframer::new(1);
        let frame = cfg_frame(3, aura::SUMMARY, 0x77);
        let mut lossy = frame.to_vec();
        lossy.remove(2); // drop one magic byte, 15 bytes remain
        let frames = deframer.feed(&lossy);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Cfg(bytes) => {
                assert_eq!(bytes.len(), aura::RSP_LEN_CFG);
                let resp = check_cfg_resp(bytes.clone(), 1).expect("recovery failed CRC");
                assert_eq!(resp.id, 3);
                assert_eq!(resp.data, 0x77);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    /// A frame that lost its final byte right before the next magic keeps
    /// the stream aligned: the short frame is dropped, the next survives.
    #[test]
    fn test_deframer_boundary_byte_loss() {
        let mut deframer = Deframer::new(1);
        let first = cfg_frame(1, aura::SUMMARY, 0x11);
        let second = cfg_frame(2, aura::SUMMARY, 0x22);
        let mut stream = first[..aura::RSP_LEN_CFG - 1].to_vec();
        stream.extend_from_slice(&second);
        let frames = deframer.feed(&stream);
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            Frame::Cfg(bytes) => {
                assert_eq!(bytes.len(), aura::RSP_LEN_CFG - 1);
                // the truncated frame cannot be reconstructed, only dropped
                assert!(check_cfg_resp(bytes.clone(), 1).is_none());
            }
            other => panic!("unexpected frame {:?}", other),
        }
        match &frames[1] {
            Frame::Cfg(bytes) => {
                let resp = check_cfg_resp(bytes.clone(), 1).expect("second frame dropped");
                assert_eq!(resp.id, 2);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    /// A 15-byte fragment missing its command byte is reconstructed and
    /// passes CRC.
    #[test]
    fn test_cfg_resp_cmd_byte_recovery() {
        let frame = cfg_frame(9, aura::PLL_FREQ, 0xabcd);
        let mut lossy = frame.to_vec();
        lossy.remove(5); // drop the command byte
        let resp = check_cfg_resp(lossy, 1).expect("recovery failed");
        assert_eq!(resp.id, 9);
        assert_eq!(resp.cmd, aura::CMD_READ);
        assert_eq!(resp.addr, aura::PLL_FREQ);
        assert_eq!(resp.data, 0xabcd);
    }

    /// Same for the spare byte
    #[test]
    fn test_cfg_resp_spare_byte_recovery() {
        let frame = cfg_frame(9, aura::PLL_FREQ, 0xabcd);
        let mut lossy = frame.to_vec();
        lossy.remove(6); // drop the spare byte
        let resp = check_cfg_resp(lossy, 1).expect("recovery failed");
        assert_eq!(resp.id, 9);
        assert_eq!(resp.spare, 0);
        assert_eq!(resp.data, 0xabcd);
    }

    #[test]
    fn test_cfg_resp_rejects_bad_crc() {
        let mut frame = cfg_frame(9, aura::PLL_FREQ, 0xabcd).to_vec();
        frame[8] ^= 0x01;
        assert!(check_cfg_resp(frame, 1).is_none());
    }

    /// Hit frames with sequence 0 are stale pre-first-job hits and are
    /// dropped even though their CRC is fine.
    #[test]
    fn test_hit_seq0_filtered() {
        let frame = hit_frame(4, 0);
        assert!(aura::frame_crc_ok(&frame));
        assert_eq!(check_hit_resp(frame.to_vec(), 1), Ok(None));
        let frame = hit_frame(4, 1);
        let hit = check_hit_resp(frame.to_vec(), 1)
            .expect("validation failed")
            .expect("hit dropped");
        assert_eq!(hit.seq, 1);
    }

    #[test]
    fn test_reg_read_timeout_floor() {
        // fast baud and a single response still waits at least 1 ms
        assert_eq!(reg_read_timeout(3_000_000, 0), Duration::from_micros(5320));
        assert!(reg_read_timeout(300_000_000, 0) >= Duration::from_millis(1));
    }
}
