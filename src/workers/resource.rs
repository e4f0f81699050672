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

//! The resource thread.
//!
//! Holds the canonical list of loadable resources. Each is polled on
//! its own schedule: when the file's modification time changes, the
//! new contents are loaded into a fresh artifact and its pointer is
//! broadcast to every shard over the control channels. The thread then
//! waits for every shard to acknowledge the swap (polling with a
//! one-microsecond sleep) before dropping its reference to the
//! previous artifact. A shard that fails to acknowledge within ten
//! seconds means the no-blocking contract of the vectorloop is broken
//! somewhere, which is reported as fatal.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use log::error;

use crate::channel::{assign_msg_id, ControlEndpoint, ControlMsg, ControlOp, LogMsg, LogSender};
use crate::config::Config;
use crate::metrics::Metrics;
use crate::resolver::Resource;

/// The cooperative sleep between acknowledgment polls.
const ACK_POLL: Duration = Duration::from_micros(1);

/// How long the full acknowledgment barrier may take before the
/// process is considered wedged.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// The sleep bound while waiting for the next scheduled check, kept
/// short so shutdown is noticed promptly.
const SCHEDULE_SLEEP: Duration = Duration::from_millis(100);

struct TrackedResource {
    name: String,
    path: PathBuf,
    update_freq: Duration,
    next_check: Instant,
    last_modified: Option<SystemTime>,

    /// The artifact currently published to the shards. Kept so that
    /// the previous one is freed only after a completed barrier.
    current: Option<Arc<Resource>>,
}

pub struct ResourceWorker {
    pub cfg: Arc<Config>,
    pub channels: Vec<ControlEndpoint>,
    pub app_log: LogSender,
    pub metrics: Arc<Metrics>,
    pub shutdown: Arc<AtomicBool>,
}

impl ResourceWorker {
    pub fn run(self) {
        let mut msg_id = 0u64;
        let mut resources = vec![TrackedResource {
            name: self.cfg.resource_name.clone(),
            path: self.cfg.resource_filepath.clone(),
            update_freq: Duration::from_secs(self.cfg.resource_update_freq),
            next_check: Instant::now(),
            last_modified: None,
            current: None,
        }];

        while !self.shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();
            let due = resources.iter_mut().find(|r| r.next_check <= now);
            let Some(resource) = due else {
                let soonest = resources
                    .iter()
                    .map(|r| r.next_check)
                    .min()
                    .unwrap_or(now + SCHEDULE_SLEEP);
                let wait = soonest.saturating_duration_since(now).min(SCHEDULE_SLEEP);
                std::thread::sleep(wait);
                continue;
            };
            resource.next_check = now + resource.update_freq;

            // Has the file changed since the last load?
            let modified = match fs::metadata(&resource.path).and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    self.report_reload_error(resource, &e);
                    continue;
                }
            };
            if resource.last_modified == Some(modified) {
                continue;
            }

            // Load the new artifact into fresh memory.
            let data = match fs::read(&resource.path) {
                Ok(data) => data,
                Err(e) => {
                    self.report_reload_error(resource, &e);
                    continue;
                }
            };
            resource.last_modified = Some(modified);
            let artifact = Arc::new(Resource {
                name: resource.name.clone(),
                data: data.into_boxed_slice(),
            });

            // Broadcast the pointer to every shard.
            for channel in &self.channels {
                let mut msg = ControlMsg::new(assign_msg_id(&mut msg_id), ControlOp::SetResource);
                msg.resource = Some(artifact.clone());
                if channel.send(msg).is_err() {
                    self.report_fatal(format!(
                        "resource channel full while publishing \"{}\"",
                        resource.name
                    ));
                }
            }

            // The barrier: every shard must acknowledge before the old
            // artifact may be freed.
            if self.await_acknowledgments(resource) {
                resource.current = Some(artifact);
            }
        }
    }

    /// Polls every channel for acknowledgments. Returns whether the
    /// barrier completed.
    fn await_acknowledgments(&self, resource: &TrackedResource) -> bool {
        let deadline = Instant::now() + ACK_TIMEOUT;
        let mut acked = vec![false; self.channels.len()];
        let mut remaining = self.channels.len();

        while remaining > 0 {
            for (i, channel) in self.channels.iter().enumerate() {
                if !acked[i] {
                    if let Some(_reply) = channel.try_recv() {
                        acked[i] = true;
                        remaining -= 1;
                    }
                }
            }
            if remaining == 0 {
                break;
            }
            if self.shutdown.load(Ordering::Relaxed) {
                return false;
            }
            if Instant::now() > deadline {
                // A shard loop iteration taking this long means it is
                // blocked, which must never happen.
                self.report_fatal(format!(
                    "resource update for \"{}\" timed out waiting for shard acknowledgments",
                    resource.name
                ));
                return false;
            }
            std::thread::sleep(ACK_POLL);
        }
        true
    }

    fn report_reload_error(&self, resource: &TrackedResource, e: &std::io::Error) {
        self.metrics.app.resource_reload_error.inc();
        let text = format!(
            "failed to reload resource \"{}\" from {}: {}",
            resource.name,
            resource.path.display(),
            e
        );
        error!("{}", text);
        if self.app_log.send(LogMsg::new(text, false)).is_err() {
            self.metrics.app.app_log_write_error.inc();
        }
    }

    fn report_fatal(&self, text: String) {
        error!("{}", text);
        if self.app_log.send(LogMsg::new(text, true)).is_err() {
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
    use std::io::Write;

    #[test]
    fn publishes_a_changed_file_and_waits_for_acknowledgment() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("quiver-resource-test-{}", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"records v1").unwrap();
        drop(f);

        let mut cfg = Config::default();
        cfg.resource_filepath = path.clone();
        cfg.resource_update_freq = 1;

        let (worker_end, shard_end) = control_channel();
        let (app_tx, _app_rx) = log_channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(Metrics::new());
        let worker = ResourceWorker {
            cfg: Arc::new(cfg),
            channels: vec![worker_end],
            app_log: app_tx,
            metrics: metrics.clone(),
            shutdown: shutdown.clone(),
        };
        let handle = std::thread::spawn(move || worker.run());

        // Play the shard: adopt the artifact and acknowledge.
        let mut received = None;
        for _ in 0..500 {
            if let Some(mut msg) = shard_end.try_recv() {
                assert_eq!(msg.op, ControlOp::SetResource);
                received = msg.resource.take();
                msg.ok = true;
                shard_end.send(msg).unwrap();
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        let artifact = received.expect("no resource was published");
        assert_eq!(&*artifact.data, b"records v1");
        assert_eq!(metrics.app.resource_reload_error.get(), 0);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn counts_reload_errors_for_missing_files() {
        let mut cfg = Config::default();
        cfg.resource_filepath = PathBuf::from("/nonexistent/quiver-missing-resource");
        cfg.resource_update_freq = 1;

        let (worker_end, _shard_end) = control_channel();
        let (app_tx, _app_rx) = log_channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(Metrics::new());
        let worker = ResourceWorker {
            cfg: Arc::new(cfg),
            channels: vec![worker_end],
            app_log: app_tx,
            metrics: metrics.clone(),
            shutdown: shutdown.clone(),
        };
        let handle = std::thread::spawn(move || worker.run());
        for _ in 0..100 {
            if metrics.app.resource_reload_error.get() > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();
        assert!(metrics.app.resource_reload_error.get() >= 1);
    }
}
