// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Memory usage monitoring. Currently only supported on Linux.

use std::fs::File;
use std::io::{Error, ErrorKind, Read, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use libc::pid_t;
use log::error;
use nom::bytes::streaming::tag;
use nom::character::complete::digit1;
use nom::combinator::map_res;
use nom::multi::count;
use nom::sequence::{terminated, tuple};
use nom::IResult;

/// Memory usage information processed from `/proc/[pid]/statm`.
///
/// All values are in units of pages.
///
/// See `man 5 proc` and `Linux/fs/proc/array.c`.
#[derive(Debug, Default, PartialEq, Eq, Hash)]
pub struct Statm {
    /// Total virtual memory size.
    pub size: usize,
    /// Resident non-swapped memory.
    pub resident: usize,
    /// Shared memory.
    pub share: usize,
    /// Resident executable memory.
    pub text: usize,
    /// Resident data and stack memory.
    pub data: usize,
}

/// Samples resident memory on a background thread and tracks the peak seen
/// between `start` and `stop`.
pub struct MemoryWatcher {
    init_resident: usize,
    max_resident: Arc<AtomicUsize>,
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Default for MemoryWatcher {
    fn default() -> Self {
        MemoryWatcher {
            init_resident: 0,
            max_resident: Arc::new(AtomicUsize::new(0)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }
}

impl MemoryWatcher {
    pub fn new() -> Self {
        match statm_self() {
            Ok(statm) => MemoryWatcher {
                init_resident: statm.resident,
                ..Default::default()
            },
            Err(_) => {
                error!("Unable to parse the statm file");
                MemoryWatcher::default()
            }
        }
    }

    pub fn start(&mut self) {
        let max_resident = self.max_resident.clone();
        let stop_flag = self.stop_flag.clone();
        self.handle = Some(thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                if let Ok(statm) = statm_self() {
                    max_resident.fetch_max(statm.resident, Ordering::Relaxed);
                }
                thread::sleep(std::time::Duration::from_millis(100));
            }
        }));
    }

    /// Stops the sampler and reports the peak.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let max_rss = self.max_resident.load(Ordering::Relaxed);
        println!(
            "Used Memory Before Analysis: {} MB",
            rss_in_megabytes(self.init_resident)
        );
        println!("Max Memory in Analysis: {} MB", rss_in_megabytes(max_rss));
    }

    /// Peak resident memory observed so far, in megabytes.
    pub fn peak_megabytes(&self) -> usize {
        rss_in_megabytes(self.max_resident.load(Ordering::Relaxed))
    }
}

#[allow(unused)]
fn rss_in_kilobytes(rss_pages: usize) -> usize {
    rss_pages * 4
}

fn rss_in_megabytes(rss_pages: usize) -> usize {
    rss_pages * 4 / 1024
}

/// Transforms a `nom` parse result into an io result.
/// The parser must completely consume the input.
fn map_result<T>(result: IResult<&str, T>) -> Result<T> {
    match result {
        IResult::Ok((remaining, val)) => {
            if remaining.is_empty() {
                Result::Ok(val)
            } else {
                Result::Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("unable to parse whole input, remaining: {:?}", remaining),
                ))
            }
        }
        IResult::Err(err) => Result::Err(Error::new(
            ErrorKind::InvalidInput,
            format!("unable to parse input: {:?}", err),
        )),
    }
}

fn parse_usize(input: &str) -> IResult<&str, usize> {
    map_res(digit1, |s: &str| s.parse::<usize>())(input)
}

/// Parses the statm file format.
///
/// The columns in the statm file include: size resident shared text lib data dt
fn parse_statm(input: &str) -> IResult<&str, Statm> {
    tuple((count(terminated(parse_usize, tag(" ")), 6), parse_usize))(input).map(
        |(next_input, res)| {
            let statm = Statm {
                size: res.0[0],
                resident: res.0[1],
                share: res.0[2],
                text: res.0[3],
                data: res.0[5],
            };
            (next_input, statm)
        },
    )
}

fn statm_file(file: &mut File) -> Result<Statm> {
    let mut buf = String::new();
    file.read_to_string(&mut buf)?;
    map_result(parse_statm(buf.trim()))
}

/// Returns memory status information for the process with the provided pid.
pub fn statm(pid: pid_t) -> Result<Statm> {
    statm_file(&mut File::open(format!("/proc/{}/statm", pid))?)
}

/// Returns memory status information for the current process.
pub fn statm_self() -> Result<Statm> {
    statm_file(&mut File::open("/proc/self/statm")?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statm_line_parses() {
        let statm = map_result(parse_statm("1717 233 189 28 0 179 0")).unwrap();
        assert_eq!(statm.size, 1717);
        assert_eq!(statm.resident, 233);
        assert_eq!(statm.share, 189);
        assert_eq!(statm.text, 28);
        assert_eq!(statm.data, 179);
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        assert!(map_result(parse_statm("1 2 3 4 5 6 7 extra")).is_err());
    }
}
