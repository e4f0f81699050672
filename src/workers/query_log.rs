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

//! The query-log thread.
//!
//! Round-robin over the shards: send a flip request, wait (with a
//! short cooperative sleep) for the shard to reply with its filled
//! buffer, write that buffer to the current query log file, and hand
//! the drained buffer back with the next flip. The shard side of the
//! protocol is in the vectorloop's channel stage; the writer never
//! sees a buffer the shard has not surrendered.
//!
//! Files are named with a creation timestamp and rotated once the
//! bytes written to the current file pass the configured threshold.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::error;

use crate::channel::{assign_msg_id, ControlEndpoint, ControlMsg, ControlOp, LogMsg, LogSender};
use crate::config::Config;
use crate::metrics::Metrics;
use crate::util::filename_timestamp;

/// The cooperative sleep while waiting for a shard's flip reply.
const REPLY_WAIT: Duration = Duration::from_micros(10);

/// How long to sleep when a full round wrote nothing.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// How long to wait before retrying a failed open.
const OPEN_RETRY: Duration = Duration::from_secs(1);

pub struct QueryLogWorker {
    pub cfg: Arc<Config>,
    pub channels: Vec<ControlEndpoint>,
    pub app_log: LogSender,
    pub metrics: Arc<Metrics>,
    pub shutdown: Arc<AtomicBool>,
}

impl QueryLogWorker {
    pub fn run(self) {
        let mut msg_id = 0u64;
        let mut file: Option<File> = None;
        let mut file_size = 0u64;

        // Buffers drained last round, returned to their shards with
        // the next flip request.
        let mut drained: Vec<Option<Vec<u8>>> = (0..self.channels.len()).map(|_| None).collect();

        while !self.shutdown.load(Ordering::Relaxed) {
            if file.is_none() {
                match self.open_file() {
                    Ok(f) => {
                        file = Some(f);
                        file_size = 0;
                    }
                    Err(e) => {
                        self.report_open_error(&e);
                        std::thread::sleep(OPEN_RETRY);
                        continue;
                    }
                }
            }

            let mut written_this_round = 0u64;
            for (shard, channel) in self.channels.iter().enumerate() {
                let mut msg = ControlMsg::new(assign_msg_id(&mut msg_id), ControlOp::QueryLogFlip);
                msg.buf = drained[shard].take();
                if channel.send(msg).is_err() {
                    // The previous transaction has not completed; try
                    // this shard again next round.
                    continue;
                }

                // Wait for the shard to flip and surrender its filled
                // buffer.
                let mut reply = None;
                while !self.shutdown.load(Ordering::Relaxed) {
                    if let Some(r) = channel.try_recv() {
                        reply = Some(r);
                        break;
                    }
                    std::thread::sleep(REPLY_WAIT);
                }
                let Some(mut reply) = reply else { return };
                let buf = reply.buf.take().unwrap_or_default();

                if !buf.is_empty() {
                    if let Some(f) = &mut file {
                        match f.write_all(&buf) {
                            Ok(()) => {
                                file_size += buf.len() as u64;
                                written_this_round += buf.len() as u64;
                            }
                            Err(e) => {
                                error!("failed to write query log: {}", e);
                                file = None;
                            }
                        }
                    }
                }

                // The buffer goes back to the shard, empty, next
                // round.
                let mut returned = buf;
                returned.clear();
                drained[shard] = Some(returned);

                if file.is_some() && file_size >= self.cfg.query_log_rotate_size {
                    // Rotate: a fresh timestamped file is opened at
                    // the top of the next round.
                    file = None;
                }
                if file.is_none() {
                    break;
                }
            }

            if written_this_round == 0 {
                std::thread::sleep(IDLE_SLEEP);
            }
        }
    }

    fn open_file(&self) -> std::io::Result<File> {
        let name = format!(
            "{}_{}",
            self.cfg.query_log_base_name,
            filename_timestamp(SystemTime::now())
        );
        let path = self.cfg.query_log_path.join(name);
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn report_open_error(&self, e: &std::io::Error) {
        self.metrics.app.query_log_open_error.inc();
        let text = format!(
            "failed to open query log in {}: {}",
            self.cfg.query_log_path.display(),
            e
        );
        error!("{}", text);
        if self.app_log.send(LogMsg::new(text, false)).is_err() {
            self.metrics.app.app_log_write_error.inc();
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{control_channel, log_channel};

    /// Plays the shard side of the flip protocol once, then checks the
    /// buffer lands on disk and comes back drained.
    #[test]
    fn flip_protocol_persists_the_surrendered_buffer() {
        let dir = std::env::temp_dir().join(format!("quiver-query-log-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut cfg = Config::default();
        cfg.query_log_path = dir.clone();
        cfg.query_log_base_name = "test_query_log".to_owned();

        let (worker_end, shard_end) = control_channel();
        let (app_tx, _app_rx) = log_channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = QueryLogWorker {
            cfg: Arc::new(cfg),
            channels: vec![worker_end],
            app_log: app_tx,
            metrics: Arc::new(Metrics::new()),
            shutdown: shutdown.clone(),
        };
        let handle = std::thread::spawn(move || worker.run());

        // Shard side: answer flips; surrender one filled buffer, then
        // empties.
        let mut surrendered = false;
        let mut got_buffer_back = false;
        for _ in 0..500 {
            if let Some(mut msg) = shard_end.try_recv() {
                assert_eq!(msg.op, ControlOp::QueryLogFlip);
                if msg.buf.is_some() {
                    got_buffer_back = true;
                    assert!(msg.buf.as_ref().unwrap().is_empty());
                }
                let filled = if surrendered {
                    Vec::new()
                } else {
                    surrendered = true;
                    b"{\"q_name\":\"www.example.com.\"}\n".to_vec()
                };
                msg.buf = Some(filled);
                msg.ok = true;
                shard_end.send(msg).unwrap();
                if got_buffer_back {
                    break;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();
        assert!(surrendered);
        assert!(got_buffer_back, "the drained buffer must come back to the shard");

        // Exactly one timestamped file with our line in it.
        let mut found = false;
        for entry in std::fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            let contents = std::fs::read_to_string(&path).unwrap();
            if contents.contains("www.example.com.") {
                found = true;
            }
            let _ = std::fs::remove_file(path);
        }
        assert!(found);
        let _ = std::fs::remove_dir(&dir);
    }
}
