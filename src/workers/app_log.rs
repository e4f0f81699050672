// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! The application-log thread.
//!
//! Drains every thread's log channel in turn and appends the messages
//! to the application log file, each prefixed with an RFC 3339 Nano
//! timestamp and ` - ` and terminated by a newline. A whole batch goes
//! to the file in a single vectored write. If the file cannot be
//! opened, opening is retried every five seconds and messages are
//! counted as dropped in the meantime. A message with the fatal flag
//! set exits the process once written.

use std::fs::{File, OpenOptions};
use std::io::{IoSlice, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use log::error;

use crate::channel::LogReceiver;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::util::rfc3339_nano;

/// How long to wait before retrying a failed open of the log file.
const OPEN_RETRY: Duration = Duration::from_secs(5);

/// How long to sleep when a full round collected no messages.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

pub struct AppLogWorker {
    pub cfg: Arc<Config>,
    pub channels: Vec<LogReceiver>,
    pub metrics: Arc<Metrics>,
    pub shutdown: Arc<AtomicBool>,
}

impl AppLogWorker {
    pub fn run(self) {
        let path = self.cfg.app_log_file();
        let mut file: Option<File> = None;
        let mut next_open_attempt = Instant::now();

        while !self.shutdown.load(Ordering::Relaxed) {
            if file.is_none() && Instant::now() >= next_open_attempt {
                match OpenOptions::new().create(true).append(true).open(&path) {
                    Ok(f) => file = Some(f),
                    Err(e) => {
                        error!("failed to open application log {}: {}", path.display(), e);
                        self.metrics.app.app_log_open_error.inc();
                        next_open_attempt = Instant::now() + OPEN_RETRY;
                    }
                }
            }

            // One message per channel per round keeps any single
            // thread from starving the others.
            let mut messages = Vec::new();
            for channel in &self.channels {
                if let Some(msg) = channel.try_recv() {
                    messages.push(msg);
                }
            }
            if messages.is_empty() {
                std::thread::sleep(IDLE_SLEEP);
                continue;
            }

            let stamp = format!("{} - ", rfc3339_nano(SystemTime::now()));
            let mut fatal = false;
            for msg in &messages {
                if msg.fatal {
                    fatal = true;
                    eprintln!("{}", msg.text);
                }
            }

            match &mut file {
                Some(f) => {
                    let mut slices = Vec::with_capacity(messages.len() * 3);
                    for msg in &messages {
                        slices.push(IoSlice::new(stamp.as_bytes()));
                        slices.push(IoSlice::new(msg.text.as_bytes()));
                        slices.push(IoSlice::new(b"\n"));
                    }
                    let total: usize = slices.iter().map(|s| s.len()).sum();
                    match write_all_vectored(f, &slices, total) {
                        Ok(()) => (),
                        Err(e) => {
                            error!("failed to write application log: {}", e);
                            self.metrics.app.app_log_write_error.add(messages.len() as u64);
                            // Close and retry the open next round.
                            file = None;
                            next_open_attempt = Instant::now();
                        }
                    }
                }
                None => {
                    self.metrics.app.app_log_write_error.add(messages.len() as u64);
                }
            }

            if fatal {
                std::process::exit(1);
            }
        }
    }
}

/// Writes the whole batch, following up on short vectored writes with
/// a plain write of the remainder.
fn write_all_vectored(file: &mut File, slices: &[IoSlice], total: usize) -> std::io::Result<()> {
    let written = file.write_vectored(slices)?;
    if written == total {
        return Ok(());
    }
    // A short vectored write: flatten the tail and write it out.
    let mut flat = Vec::with_capacity(total);
    for slice in slices {
        flat.extend_from_slice(slice);
    }
    file.write_all(&flat[written..])
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{log_channel, LogMsg};

    #[test]
    fn writes_timestamped_lines_and_stops_on_shutdown() {
        let dir = std::env::temp_dir().join("quiver-app-log-test");
        std::fs::create_dir_all(&dir).unwrap();
        let mut cfg = Config::default();
        cfg.app_log_path = dir.clone();
        cfg.app_log_name = format!("app-{}.log", std::process::id());
        let path = cfg.app_log_file();
        let _ = std::fs::remove_file(&path);

        let (tx, rx) = log_channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = AppLogWorker {
            cfg: Arc::new(cfg),
            channels: vec![rx],
            metrics: Arc::new(Metrics::new()),
            shutdown: shutdown.clone(),
        };
        tx.send(LogMsg::new("listener started", false)).unwrap();

        let handle = std::thread::spawn(move || worker.run());
        std::thread::sleep(Duration::from_millis(100));
        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains(" - listener started\n"));
        // The timestamp prefix parses back as RFC 3339.
        let stamp = contents.split(" - ").next().unwrap();
        assert!(stamp.ends_with('Z') && stamp.contains('T'));
        let _ = std::fs::remove_file(&path);
    }
}
