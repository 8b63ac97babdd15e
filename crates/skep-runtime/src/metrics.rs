//! Per-worker counters published over a bounded channel to a collector
//! thread that logs aggregate totals on an interval.

use std::ops::AddAssign;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct NetStats {
    pub bytes_recv: u64,
    pub bytes_sent: u64,
    pub accepts: u64,
    pub connects: u64,
    pub closes: u64,
}

impl AddAssign for NetStats {
    fn add_assign(&mut self, rhs: Self) {
        self.bytes_recv += rhs.bytes_recv;
        self.bytes_sent += rhs.bytes_sent;
        self.accepts += rhs.accepts;
        self.connects += rhs.connects;
        self.closes += rhs.closes;
    }
}

/// Snapshot of one worker's activity since its last publication.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct WorkerStats {
    pub worker_id: u8,
    pub messages: u64,
    pub dispatch_errors: u64,
    pub timers_fired: u64,
    pub services: u64,
    pub cpu_ns: u64,
    pub net: NetStats,
}

impl AddAssign for WorkerStats {
    fn add_assign(&mut self, rhs: Self) {
        self.messages += rhs.messages;
        self.dispatch_errors += rhs.dispatch_errors;
        self.timers_fired += rhs.timers_fired;
        self.services = rhs.services;
        self.cpu_ns += rhs.cpu_ns;
        self.net += rhs.net;
    }
}

/// Collector that runs in its own thread until every worker sender is gone.
pub struct StatsCollector {
    channel: Receiver<WorkerStats>,
    totals: Vec<WorkerStats>,
    report_interval: Duration,
}

impl StatsCollector {
    pub fn new(channel: Receiver<WorkerStats>, num_workers: usize, report_interval: Duration) -> Self {
        let totals = (1..=num_workers)
            .map(|id| WorkerStats {
                worker_id: id as u8,
                ..WorkerStats::default()
            })
            .collect();
        Self {
            channel,
            totals,
            report_interval,
        }
    }

    pub fn run(mut self) {
        let mut last_report = std::time::Instant::now();

        loop {
            match self.channel.recv_timeout(Duration::from_millis(500)) {
                Ok(stats) => {
                    let slot = stats.worker_id as usize - 1;
                    if let Some(total) = self.totals.get_mut(slot) {
                        *total += stats;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if last_report.elapsed() >= self.report_interval {
                self.report();
                last_report = std::time::Instant::now();
            }
        }

        self.report();
        info!("stats collector shutting down");
    }

    fn report(&self) {
        let mut sum = WorkerStats::default();
        let mut services = 0;
        for total in &self.totals {
            sum += *total;
            services += total.services;
        }
        info!(
            "services={} messages={} dispatch_errors={} timers={} cpu_ms={} rx_bytes={} tx_bytes={}",
            services,
            sum.messages,
            sum.dispatch_errors,
            sum.timers_fired,
            sum.cpu_ns / 1_000_000,
            sum.net.bytes_recv,
            sum.net.bytes_sent,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_accumulate() {
        let mut a = WorkerStats {
            worker_id: 1,
            messages: 5,
            services: 2,
            ..WorkerStats::default()
        };
        let b = WorkerStats {
            worker_id: 1,
            messages: 3,
            services: 4,
            net: NetStats {
                bytes_recv: 100,
                ..NetStats::default()
            },
            ..WorkerStats::default()
        };
        a += b;
        assert_eq!(a.messages, 8);
        // Service count is a gauge, not a counter.
        assert_eq!(a.services, 4);
        assert_eq!(a.net.bytes_recv, 100);
    }
}
