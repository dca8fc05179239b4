//! Interface traffic statistics sampled on every heartbeat tick.
//!
//! The manager polls them with `get-device-stats`; each poll drains the
//! updates gathered since the previous one.

use std::{
    collections::{BTreeMap, VecDeque},
    path::PathBuf,
    sync::{Mutex, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use tokio::time::Instant;

/// Query draining the collected statistics.
pub const GET_DEVICE_STATS: &str = "get-device-stats";

const PROC_NET_DEV: &str = "/proc/net/dev";

/// Updates kept while the manager does not poll.
const MAX_UPDATES: usize = 120;

/// Traffic counters of one interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub rx_bytes: u64,
    pub rx_pkts: u64,
    pub tx_bytes: u64,
    pub tx_pkts: u64,
}

impl Counters {
    /// Growth since `prev`; a counter reset counts as zero.
    #[must_use]
    pub const fn since(&self, prev: &Self) -> Self {
        Self {
            rx_bytes: self.rx_bytes.saturating_sub(prev.rx_bytes),
            rx_pkts: self.rx_pkts.saturating_sub(prev.rx_pkts),
            tx_bytes: self.tx_bytes.saturating_sub(prev.tx_bytes),
            tx_pkts: self.tx_pkts.saturating_sub(prev.tx_pkts),
        }
    }
}

/// One sample: per-interface traffic over `period` seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsUpdate {
    /// 1 when the counters could be read.
    pub ok: u8,
    pub stats: BTreeMap<String, Counters>,
    pub period: f64,
    /// Seconds since the Unix epoch.
    pub utc: f64,
}

struct Sample {
    at: Instant,
    counters: BTreeMap<String, Counters>,
}

#[derive(Default)]
struct StatsState {
    last: Option<Sample>,
    updates: VecDeque<StatsUpdate>,
}

/// Collects interface counters from a `/proc/net/dev` style file.
pub struct DeviceStats {
    path: PathBuf,
    state: Mutex<StatsState>,
}

impl Default for DeviceStats {
    fn default() -> Self {
        Self::new(PROC_NET_DEV)
    }
}

impl DeviceStats {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(StatsState::default()),
        }
    }

    /// Read the counters and record the traffic since the last sample.
    pub async fn update(&self) {
        let utc = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0.0, |d| d.as_secs_f64());
        let read = tokio::fs::read_to_string(&self.path).await;
        let now = Instant::now();

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let update = match read {
            Ok(text) => {
                let counters = parse_net_dev(&text);
                let (stats, period) = state.last.as_ref().map_or_else(
                    || (BTreeMap::new(), 0.0),
                    |prev| {
                        let deltas = counters
                            .iter()
                            .filter_map(|(name, current)| {
                                prev.counters
                                    .get(name)
                                    .map(|before| (name.clone(), current.since(before)))
                            })
                            .collect();
                        (deltas, now.duration_since(prev.at).as_secs_f64())
                    },
                );
                state.last = Some(Sample { at: now, counters });
                StatsUpdate {
                    ok: 1,
                    stats,
                    period,
                    utc,
                }
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Cannot read interface counters");
                StatsUpdate {
                    ok: 0,
                    stats: BTreeMap::new(),
                    period: 0.0,
                    utc,
                }
            }
        };

        if state.updates.len() == MAX_UPDATES {
            state.updates.pop_front();
        }
        state.updates.push_back(update);
    }

    /// Updates collected since the previous call, oldest first.
    pub fn drain(&self) -> Vec<StatsUpdate> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .updates
            .drain(..)
            .collect()
    }
}

/// Parse `/proc/net/dev`: two header lines, then `name: rx... tx...`.
fn parse_net_dev(text: &str) -> BTreeMap<String, Counters> {
    text.lines()
        .skip(2)
        .filter_map(|line| {
            let (name, fields) = line.split_once(':')?;
            let fields: Vec<u64> = fields
                .split_whitespace()
                .map(str::parse)
                .collect::<Result<_, _>>()
                .ok()?;
            if fields.len() < 10 {
                return None;
            }
            Some((
                name.trim().to_string(),
                Counters {
                    rx_bytes: fields[0],
                    rx_pkts: fields[1],
                    tx_bytes: fields[8],
                    tx_pkts: fields[9],
                },
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net_dev(eth0_rx: u64, eth0_tx: u64) -> String {
        format!(
            "Inter-|   Receive                                                |  Transmit\n \
             face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n    \
             lo:     100       1    0    0    0     0          0         0      100       1    0    0    0     0       0          0\n  \
             eth0: {eth0_rx}      10    0    0    0     0          0         0 {eth0_tx}       5    0    0    0     0       0          0\n"
        )
    }

    #[test]
    fn test_parse_net_dev() {
        let counters = parse_net_dev(&net_dev(2000, 1000));
        assert_eq!(counters.len(), 2);
        assert_eq!(
            counters["eth0"],
            Counters {
                rx_bytes: 2000,
                rx_pkts: 10,
                tx_bytes: 1000,
                tx_pkts: 5,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_report_traffic_since_previous_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net_dev");
        let stats = DeviceStats::new(&path);

        std::fs::write(&path, net_dev(2000, 1000)).unwrap();
        stats.update().await;
        tokio::time::advance(std::time::Duration::from_secs(30)).await;
        std::fs::write(&path, net_dev(5000, 1500)).unwrap();
        stats.update().await;

        let updates = stats.drain();
        assert_eq!(updates.len(), 2);
        assert!(updates[0].stats.is_empty());
        assert_eq!(updates[1].ok, 1);
        assert_eq!(updates[1].stats["eth0"].rx_bytes, 3000);
        assert_eq!(updates[1].stats["eth0"].tx_bytes, 500);
        assert_eq!(updates[1].stats["lo"], Counters::default());
        assert!((updates[1].period - 30.0).abs() < 1.0);

        assert!(stats.drain().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_counters_reported_not_ok() {
        let stats = DeviceStats::new("/nonexistent/net_dev");
        stats.update().await;
        let updates = stats.drain();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].ok, 0);
    }
}
