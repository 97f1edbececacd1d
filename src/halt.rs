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

//! This module provides a way to
//!   * spawn tasks in "termination context"
//!   * terminate that context
//!   * wait for "termination" in normal context
//!
//! Termination context means that task is run `select`-ed on termination
//! condition, and when that condition is signaled, select returns and the
//! task is dropped. Long-running loops that must clean up instead poll
//! `is_halted` at their cancellation points.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;

/// Sender of `Halt` condition
#[derive(Clone)]
pub struct Sender {
    inner: Arc<watch::Sender<bool>>,
}

impl Sender {
    /// Broadcast `Halt` condition and give receivers a moment to wind down
    pub async fn do_stop(&self) {
        let _ = self.inner.send(true);
        sleep(Duration::from_secs(2)).await;
    }
}

/// Receiver of `Halt` condition
#[derive(Clone)]
pub struct Receiver {
    inner: watch::Receiver<bool>,
}

impl Receiver {
    /// Non-blocking check usable from loops that cannot await
    pub fn is_halted(&self) -> bool {
        *self.inner.borrow()
    }

    /// Wait for `Halt` to be broadcasted
    pub async fn wait_for_halt(&mut self) {
        if *self.inner.borrow() {
            return;
        }
        while self.inner.changed().await.is_ok() {
            if *self.inner.borrow() {
                return;
            }
        }
        // sender dropped, nobody can stop us anymore; treat as halt
    }

    /// Spawn a new task that is dropped when `Halt` is received
    pub fn spawn<F>(&self, f: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut receiver = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = f => {}
                _ = receiver.wait_for_halt() => {}
            }
        });
    }
}

pub fn make_pair() -> (Sender, Receiver) {
    let (tx, rx) = watch::channel(false);
    (
        Sender {
            inner: Arc::new(tx),
        },
        Receiver { inner: rx },
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_halt_is_observed() {
        let (tx, rx) = make_pair();
        assert!(!rx.is_halted());
        let _ = tx.inner.send(true);
        assert!(rx.is_halted());
        let mut rx = rx;
        rx.wait_for_halt().await;
    }

    #[tokio::test]
    async fn test_spawned_task_is_dropped() {
        let (tx, rx) = make_pair();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        rx.spawn(async move {
            // would run forever without the halt
            let _keep = done_tx;
            loop {
                sleep(Duration::from_millis(10)).await;
            }
        });
        let _ = tx.inner.send(true);
        // the task drop releases the oneshot sender
        assert!(done_rx.await.is_err());
    }
}
