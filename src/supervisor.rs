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

//! Process supervision.
//!
//! [`start`] wires the whole server together: it creates the shared
//! metrics, one control-channel pair per shard for the resource and
//! query-log threads, one log channel per thread, and then spawns the
//! shard threads (pinned to CPUs when configured) and the three
//! support threads. The returned [`Supervisor`] shuts everything down
//! cooperatively through a shared flag and joins the threads.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::info;

use crate::channel::{control_channel, log_channel};
use crate::config::Config;
use crate::metrics::Metrics;
use crate::resolver::Resolver;
use crate::vectorloop::Vectorloop;
use crate::workers::{app_log::AppLogWorker, query_log::QueryLogWorker, resource::ResourceWorker};

/// A handle over all running server threads.
pub struct Supervisor {
    shutdown: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
    handles: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Requests a cooperative shutdown of every thread.
    pub fn shut_down(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Waits for every thread to exit.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

/// Starts the server: `process_thread_count` shard threads plus the
/// application-log, resource, and query-log threads.
pub fn start(cfg: Config, resolver: Arc<dyn Resolver>) -> io::Result<Supervisor> {
    let cfg = Arc::new(cfg);
    let metrics = Arc::new(Metrics::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    let shard_count = cfg.process_thread_count;
    let mut handles = Vec::with_capacity(shard_count + 3);
    let mut resource_channels = Vec::with_capacity(shard_count);
    let mut query_log_channels = Vec::with_capacity(shard_count);
    let mut log_receivers = Vec::with_capacity(shard_count + 2);

    // One shard per processing thread, each with its own channels.
    for id in 0..shard_count {
        let (resource_worker_end, resource_shard_end) = control_channel();
        let (query_log_worker_end, query_log_shard_end) = control_channel();
        let (log_tx, log_rx) = log_channel();
        resource_channels.push(resource_worker_end);
        query_log_channels.push(query_log_worker_end);
        log_receivers.push(log_rx);

        let vectorloop = Vectorloop::new(
            id,
            cfg.clone(),
            metrics.clone(),
            resolver.clone(),
            resource_shard_end,
            query_log_shard_end,
            log_tx,
            shutdown.clone(),
        )?;
        let handle = std::thread::Builder::new()
            .name(format!("vectorloop-{}", id))
            .spawn(move || vectorloop.run())?;
        handles.push(handle);
    }
    info!("started {} shard thread(s)", shard_count);

    // The resource and query-log threads log through the same
    // application-log machinery as the shards.
    let (resource_log_tx, resource_log_rx) = log_channel();
    let (query_log_log_tx, query_log_log_rx) = log_channel();
    log_receivers.push(resource_log_rx);
    log_receivers.push(query_log_log_rx);

    let app_log_worker = AppLogWorker {
        cfg: cfg.clone(),
        channels: log_receivers,
        metrics: metrics.clone(),
        shutdown: shutdown.clone(),
    };
    handles.push(
        std::thread::Builder::new()
            .name("app-log".to_owned())
            .spawn(move || app_log_worker.run())?,
    );

    let resource_worker = ResourceWorker {
        cfg: cfg.clone(),
        channels: resource_channels,
        app_log: resource_log_tx,
        metrics: metrics.clone(),
        shutdown: shutdown.clone(),
    };
    handles.push(
        std::thread::Builder::new()
            .name("resource".to_owned())
            .spawn(move || resource_worker.run())?,
    );

    let query_log_worker = QueryLogWorker {
        cfg,
        channels: query_log_channels,
        app_log: query_log_log_tx,
        metrics: metrics.clone(),
        shutdown: shutdown.clone(),
    };
    handles.push(
        std::thread::Builder::new()
            .name("query-log".to_owned())
            .spawn(move || query_log_worker.run())?,
    );

    Ok(Supervisor {
        shutdown,
        metrics,
        handles,
    })
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StaticResolver;
    use std::net::UdpSocket;
    use std::time::Duration;

    const WWW_EXAMPLE_COM: &[u8] =
        b"\x1f\xf9\x01\x20\x00\x01\x00\x00\x00\x00\x00\x00\
          \x03www\x07example\x03com\x00\x00\x01\x00\x01";

    #[test]
    fn starts_serves_and_shuts_down() {
        let dir = std::env::temp_dir().join(format!("quiver-supervisor-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut cfg = Config::default();
        cfg.udp_listener_port = 36960;
        cfg.tcp_listener_port = 36960;
        cfg.process_thread_count = 2;
        cfg.app_log_path = dir.clone();
        cfg.query_log_path = dir.clone();
        cfg.resource_filepath = dir.join("resource1.txt");
        std::fs::write(&cfg.resource_filepath, b"records").unwrap();

        let supervisor = start(cfg, Arc::new(StaticResolver::new())).unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.connect("127.0.0.1:36960").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        client.send(WWW_EXAMPLE_COM).unwrap();
        let mut buf = [0u8; 4096];
        let n = client.recv(&mut buf).expect("no response from the server");
        assert_eq!(&buf[..2], &WWW_EXAMPLE_COM[..2]);
        assert_eq!(n, 118);

        // The query-log stage runs right after the send; give it a
        // moment to report the counters.
        for _ in 0..100 {
            if supervisor.metrics().udp.queries.get() == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(supervisor.metrics().udp.queries.get(), 1);
        assert_eq!(supervisor.metrics().dns.queries_rcode_noerror.get(), 1);

        supervisor.shut_down();
        supervisor.join();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
