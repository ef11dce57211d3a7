// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod bit_vec;
pub mod chunked_queue;
pub mod config;
pub mod mem_watcher;
pub mod options;
pub mod progress;
pub mod stats;

/// Cooperative cancellation flag shared by all long-running loops.
///
/// Every worklist (summary-edge closure, tabulation, slicing) polls the token
/// at each dequeue and unwinds cleanly when it is set, contributing whatever
/// partial result it has produced so far. The CLI layer wires a wall-clock
/// timer to the token; library code never installs signal handlers.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    #[inline]
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Arms a timer thread that cancels the token after `secs` seconds.
    /// The thread exits early if the token is cancelled by someone else.
    pub fn cancel_after_secs(&self, secs: u64) {
        let token = self.clone();
        std::thread::spawn(move || {
            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(secs);
            while std::time::Instant::now() < deadline {
                if token.is_cancelled() {
                    return;
                }
                std::thread::sleep(std::time::Duration::from_millis(200));
            }
            token.cancel();
        });
    }
}
