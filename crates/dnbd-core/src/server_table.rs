//! Server table and weighted selector (§4.4). Grounded in the fixed-size
//! slot array pattern `shred-ingest/src/source_metrics.rs` uses for its
//! per-source atomics, but the per-server fields here aren't update-in-place
//! independent counters — `recompute_weights` reads across the whole table
//! to normalise weights — so the table is a `Mutex<[Option<ServerRecord>; N]>`
//! (§4.4: "server-table mutex: guards state transitions and SRTT updates")
//! rather than one atomic per field.

use std::sync::Mutex;

use rand::Rng;

/// Maximum number of replica servers a table can track (§3: "typically 8").
pub const SERVERS_MAX: usize = 8;

const WEIGHT_NORMAL: u32 = 255;
const WEIGHT_FACTOR: u64 = 1 << 20;
const SRTT_BETA: u64 = 990;
const SRTT_BETA_BASE: u64 = 1000;
/// Fixed-point scale applied to raw RTT samples before folding into `srtt`
/// (§4.4: "the sample is shifted into the SRTT's fixed-point scale").
pub const SRTT_SHIFT: u32 = 10;
/// Timer shift applied to `asrtt` when deriving the retransmit period (§4.5).
pub const TIMEOUT_SHIFT: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ServerState {
    Inactive,
    Active,
    Stalled,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ServerRecord {
    pub state: ServerState,
    /// Fixed-point SRTT, scale `1 << SRTT_SHIFT`.
    pub srtt: u64,
    pub weight: u32,
    pub last_rx: u64,
    pub last_tx: u64,
}

impl ServerRecord {
    fn inactive() -> Self {
        ServerRecord { state: ServerState::Inactive, srtt: 0, weight: 0, last_rx: 0, last_tx: 0 }
    }
}

/// Result of `set_serverid` (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetServerOutcome {
    Activated,
    Reactivated,
    /// The slot was already ACTIVE; the caller treats this as benign
    /// during handshake (a retried INIT reply from an already-registered
    /// server).
    AlreadyActive,
}

pub struct TimeoutBounds {
    pub min: u64,
    pub max: u64,
    pub stalled: u64,
}

struct Inner {
    servers: [ServerRecord; SERVERS_MAX],
    asrtt: u64,
}

/// Fixed-size table of replica servers plus the weighted random selector.
pub struct ServerTable {
    inner: Mutex<Inner>,
    bounds: TimeoutBounds,
}

impl ServerTable {
    pub fn new(bounds: TimeoutBounds) -> Self {
        ServerTable {
            inner: Mutex::new(Inner { servers: [ServerRecord::inactive(); SERVERS_MAX], asrtt: bounds.min }),
            bounds,
        }
    }

    /// §4.4 `set_serverid`. `id` is 1-based; out-of-range is an error.
    pub fn set_serverid(&self, id: u16, now: u64) -> anyhow::Result<SetServerOutcome> {
        let idx = Self::index(id)?;
        let mut inner = self.inner.lock().unwrap();
        let rec = &mut inner.servers[idx];
        match rec.state {
            ServerState::Inactive => {
                *rec = ServerRecord {
                    state: ServerState::Active,
                    srtt: self.bounds.min << SRTT_SHIFT,
                    weight: 0,
                    last_rx: now,
                    last_tx: now,
                };
                Ok(SetServerOutcome::Activated)
            }
            ServerState::Stalled => {
                rec.state = ServerState::Active;
                Ok(SetServerOutcome::Reactivated)
            }
            ServerState::Active => Ok(SetServerOutcome::AlreadyActive),
        }
    }

    /// §4.4 `next_server`: weighted random pick over ACTIVE servers' current
    /// weights using one byte of uniform randomness. Returns 0 ("any
    /// server") if no server is selected.
    pub fn next_server(&self) -> u16 {
        let inner = self.inner.lock().unwrap();
        let draw: u8 = rand::thread_rng().gen();
        let mut cumulative: u32 = 0;
        for (i, rec) in inner.servers.iter().enumerate() {
            if rec.state != ServerState::Active {
                continue;
            }
            cumulative += rec.weight;
            if cumulative > draw as u32 {
                return (i + 1) as u16;
            }
        }
        0
    }

    /// §4.4 `rtt_update`: clamp the raw sample, fold into the per-server
    /// SRTT via the exact fixed-point EWMA, and refresh `last_rx`.
    pub fn rtt_update(&self, id: u16, sample: u64, now: u64) {
        let Ok(idx) = Self::index(id) else { return };
        let mut inner = self.inner.lock().unwrap();
        let rec = &mut inner.servers[idx];
        if rec.state == ServerState::Inactive {
            return;
        }
        let clamped = sample.clamp(self.bounds.min, self.bounds.max);
        rec.srtt = (SRTT_BETA * rec.srtt + (SRTT_BETA_BASE - SRTT_BETA) * (clamped << SRTT_SHIFT)) / SRTT_BETA_BASE;
        rec.last_rx = now;
    }

    pub fn mark_sent(&self, id: u16, now: u64) {
        let Ok(idx) = Self::index(id) else { return };
        let mut inner = self.inner.lock().unwrap();
        inner.servers[idx].last_tx = now;
    }

    /// §4.4 `recompute_weights`, invoked periodically by the heartbeat loop.
    pub fn recompute_weights(&self, now: u64) {
        let mut inner = self.inner.lock().unwrap();

        for rec in inner.servers.iter_mut() {
            if rec.state == ServerState::Active && rec.last_tx > rec.last_rx + self.bounds.stalled {
                tracing::info!(srtt = rec.srtt, "server stalled, demoting");
                rec.state = ServerState::Stalled;
            }
        }

        let mut total_weight_term: u64 = 0;
        let mut total_srtt: u64 = 0;
        let mut count: u32 = 0;
        for rec in inner.servers.iter() {
            if rec.state != ServerState::Active {
                continue;
            }
            let s = rec.srtt.max(1);
            total_weight_term += WEIGHT_FACTOR / s;
            total_srtt += s;
            count += 1;
        }

        for rec in inner.servers.iter_mut() {
            if rec.state != ServerState::Active {
                continue;
            }
            let s = rec.srtt.max(1) as u64;
            let w = if total_weight_term > 0 {
                (WEIGHT_NORMAL as u64 * WEIGHT_FACTOR / (s * total_weight_term)) as u32
            } else {
                0
            };
            rec.weight = if w > 0 { w } else { WEIGHT_NORMAL / count.max(1) };
        }

        inner.asrtt = if count > 0 { total_srtt / count as u64 } else { self.bounds.min };
    }

    pub fn asrtt(&self) -> u64 {
        self.inner.lock().unwrap().asrtt
    }

    /// Retransmit period in ticks: `clamp(asrtt >> SRTT_SHIFT, min, max)` (§4.5).
    pub fn retransmit_diff(&self) -> u64 {
        (self.asrtt() >> SRTT_SHIFT).clamp(self.bounds.min, self.bounds.max)
    }

    pub fn snapshot(&self) -> Vec<(u16, ServerRecord)> {
        let inner = self.inner.lock().unwrap();
        inner
            .servers
            .iter()
            .enumerate()
            .filter(|(_, r)| r.state != ServerState::Inactive)
            .map(|(i, r)| ((i + 1) as u16, *r))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().servers.iter().filter(|r| r.state == ServerState::Active).count()
    }

    fn index(id: u16) -> anyhow::Result<usize> {
        if id == 0 || id as usize > SERVERS_MAX {
            anyhow::bail!("server id {id} out of range (1..={SERVERS_MAX})");
        }
        Ok((id - 1) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> TimeoutBounds {
        TimeoutBounds { min: 10, max: 250, stalled: 5000 }
    }

    #[test]
    fn set_serverid_out_of_range_errors() {
        let table = ServerTable::new(bounds());
        assert!(table.set_serverid(0, 0).is_err());
        assert!(table.set_serverid(9, 0).is_err());
    }

    #[test]
    fn set_serverid_transitions() {
        let table = ServerTable::new(bounds());
        assert_eq!(table.set_serverid(1, 0).unwrap(), SetServerOutcome::Activated);
        assert_eq!(table.set_serverid(1, 0).unwrap(), SetServerOutcome::AlreadyActive);
    }

    #[test]
    fn next_server_zero_when_all_weights_zero() {
        let table = ServerTable::new(bounds());
        table.set_serverid(1, 0).unwrap();
        assert_eq!(table.next_server(), 0);
    }

    #[test]
    fn recompute_weights_sums_to_at_most_normal() {
        let table = ServerTable::new(bounds());
        table.set_serverid(1, 0).unwrap();
        table.set_serverid(2, 0).unwrap();
        table.rtt_update(1, 20, 0);
        table.rtt_update(2, 80, 0);
        table.recompute_weights(0);
        let sum: u32 = table.snapshot().iter().map(|(_, r)| r.weight).sum();
        assert!(sum <= WEIGHT_NORMAL + 2, "sum {sum} should be close to {WEIGHT_NORMAL}");

        let lower_rtt_weight = table.snapshot().iter().find(|(id, _)| *id == 1).unwrap().1.weight;
        let higher_rtt_weight = table.snapshot().iter().find(|(id, _)| *id == 2).unwrap().1.weight;
        assert!(lower_rtt_weight > higher_rtt_weight, "lower SRTT should win a larger weight");
    }

    #[test]
    fn stall_detection_demotes_and_excludes_from_selection() {
        let table = ServerTable::new(bounds());
        table.set_serverid(1, 0).unwrap();
        table.mark_sent(1, 10_000);
        // last_rx stayed at construction time (0); last_tx far exceeds it.
        table.recompute_weights(10_000);
        assert_eq!(table.snapshot()[0].1.state, ServerState::Stalled);
        assert_eq!(table.next_server(), 0);
    }

    #[test]
    fn reactivation_after_stall() {
        let table = ServerTable::new(bounds());
        table.set_serverid(1, 0).unwrap();
        table.mark_sent(1, 10_000);
        table.recompute_weights(10_000);
        assert_eq!(table.set_serverid(1, 10_001).unwrap(), SetServerOutcome::Reactivated);
    }
}
