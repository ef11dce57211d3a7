// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! A single-line terminal progress bar for long-running phases.

use std::io::Write;

const BAR_WIDTH: usize = 40;

pub struct ProgressBar {
    title: String,
    enabled: bool,
    last_ticks: usize,
}

impl ProgressBar {
    pub fn new(title: &str) -> Self {
        ProgressBar {
            title: title.to_string(),
            enabled: true,
            last_ticks: usize::MAX,
        }
    }

    /// A bar that swallows all updates; used when stdout is not a terminal
    /// or the caller runs quiet.
    pub fn disabled(title: &str) -> Self {
        ProgressBar {
            title: title.to_string(),
            enabled: false,
            last_ticks: usize::MAX,
        }
    }

    /// Renders `fraction` (clamped to [0, 1]) if it moved by at least one tick.
    pub fn show_progress(&mut self, fraction: f32) {
        if !self.enabled {
            return;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        let ticks = (fraction * BAR_WIDTH as f32) as usize;
        if ticks == self.last_ticks {
            return;
        }
        self.last_ticks = ticks;
        let mut out = std::io::stdout();
        let _ = write!(
            out,
            "\r{} [{}{}] {:3.0}%",
            self.title,
            "#".repeat(ticks),
            "-".repeat(BAR_WIDTH - ticks),
            fraction * 100.0
        );
        let _ = out.flush();
    }

    pub fn finish(&mut self) {
        if !self.enabled {
            return;
        }
        self.show_progress(1.0);
        println!();
    }
}
