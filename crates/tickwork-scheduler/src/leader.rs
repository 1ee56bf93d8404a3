use std::time::Duration;

use chrono::{DateTime, Utc};
use tickwork_core::config::LeaseConfig;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::{error::SchedulerError, lease::LeaseStore};

/// Leadership as seen by this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    Follower,
    Candidate,
    /// Holds the lease; every dispatch write must carry `fencing_token`.
    Leader { fencing_token: i64 },
    Stopped,
}

impl LeaderState {
    pub fn fencing_token(&self) -> Option<i64> {
        match self {
            LeaderState::Leader { fencing_token } => Some(*fencing_token),
            _ => None,
        }
    }
}

impl std::fmt::Display for LeaderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaderState::Follower => write!(f, "follower"),
            LeaderState::Candidate => write!(f, "candidate"),
            LeaderState::Leader { fencing_token } => write!(f, "leader(term {fencing_token})"),
            LeaderState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Lease timings, usually taken from [`LeaseConfig`].
#[derive(Debug, Clone, Copy)]
pub struct LeaderTimings {
    pub ttl: chrono::Duration,
    pub renew_interval: Duration,
    pub retry_interval: Duration,
    pub max_renew_failures: u32,
}

impl From<&LeaseConfig> for LeaderTimings {
    fn from(cfg: &LeaseConfig) -> Self {
        Self {
            // a lease longer than a day is never useful
            ttl: chrono::Duration::seconds(cfg.ttl_secs.min(86_400) as i64),
            renew_interval: Duration::from_secs(cfg.renew_interval_secs),
            retry_interval: Duration::from_secs(cfg.retry_interval_secs),
            max_renew_failures: cfg.max_renew_failures,
        }
    }
}

/// Elects at most one dispatching node through the durable lease.
///
/// The current [`LeaderState`] is published on a watch channel. The
/// dispatch loop reports a `StaleLeader` rejection through the step-down
/// channel, which drops this node to `Follower` without waiting for the
/// next renewal.
pub struct LeaderCoordinator {
    leases: LeaseStore,
    holder: String,
    timings: LeaderTimings,
    state_tx: watch::Sender<LeaderState>,
    step_down_tx: mpsc::Sender<i64>,
    step_down_rx: mpsc::Receiver<i64>,
    renew_failures: u32,
}

impl LeaderCoordinator {
    pub fn new(leases: LeaseStore, holder: impl Into<String>, timings: LeaderTimings) -> Self {
        let (state_tx, _) = watch::channel(LeaderState::Follower);
        let (step_down_tx, step_down_rx) = mpsc::channel(8);
        Self {
            leases,
            holder: holder.into(),
            timings,
            state_tx,
            step_down_tx,
            step_down_rx,
            renew_failures: 0,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.state_tx.subscribe()
    }

    /// Sender for step-down requests. The value is the fencing token of the
    /// term that was found stale.
    pub fn step_down_sender(&self) -> mpsc::Sender<i64> {
        self.step_down_tx.clone()
    }

    pub fn state(&self) -> LeaderState {
        *self.state_tx.borrow()
    }

    /// Drive the state machine until `shutdown` flips to `true`, then
    /// release the lease (if held) and publish `Stopped`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(holder = %self.holder, lease = %self.leases.name(), "leader coordinator started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let wait = self.step(Utc::now());
            let mut stale = None;
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                token = self.step_down_rx.recv() => stale = token,
                res = shutdown.changed() => if res.is_err() { break; },
            }
            if let Some(token) = stale {
                self.step_down(token);
            }
        }
        self.stop(Utc::now());
    }

    /// One pass of the state machine at `now`. Returns how long to wait
    /// before the next pass.
    pub fn step(&mut self, now: DateTime<Utc>) -> Duration {
        match self.state() {
            LeaderState::Leader { fencing_token } => self.renew(fencing_token, now),
            LeaderState::Follower | LeaderState::Candidate => self.campaign(now),
            LeaderState::Stopped => self.timings.retry_interval,
        }
    }

    fn campaign(&mut self, now: DateTime<Utc>) -> Duration {
        self.publish(LeaderState::Candidate);
        match self.leases.try_acquire(&self.holder, now, self.timings.ttl) {
            Ok(Some(fencing_token)) => {
                self.renew_failures = 0;
                self.publish(LeaderState::Leader { fencing_token });
                info!(fencing_token, "became leader");
                self.timings.renew_interval
            }
            Ok(None) => {
                self.publish(LeaderState::Follower);
                self.timings.retry_interval
            }
            Err(e) => {
                warn!(error = %e, "lease acquisition failed");
                self.publish(LeaderState::Follower);
                self.timings.retry_interval
            }
        }
    }

    fn renew(&mut self, fencing_token: i64, now: DateTime<Utc>) -> Duration {
        match self.leases.renew(&self.holder, fencing_token, now, self.timings.ttl) {
            Ok(()) => {
                self.renew_failures = 0;
                self.timings.renew_interval
            }
            Err(SchedulerError::LeaseLost { .. }) => {
                warn!(fencing_token, "lease lost, stepping down");
                self.publish(LeaderState::Follower);
                self.timings.retry_interval
            }
            Err(e) => {
                self.renew_failures += 1;
                warn!(error = %e, failures = self.renew_failures, "lease renewal failed");
                if self.renew_failures >= self.timings.max_renew_failures {
                    warn!(fencing_token, "too many renewal failures, stepping down");
                    self.renew_failures = 0;
                    self.publish(LeaderState::Follower);
                    return self.timings.retry_interval;
                }
                self.timings.renew_interval
            }
        }
    }

    /// Drop to follower if `stale_token` is still our term.
    pub fn step_down(&mut self, stale_token: i64) {
        if self.state().fencing_token() == Some(stale_token) {
            warn!(fencing_token = stale_token, "stale leader detected, stepping down");
            self.publish(LeaderState::Follower);
        } else {
            debug!(fencing_token = stale_token, "ignoring step-down for an old term");
        }
    }

    /// Release the lease if we hold it and publish `Stopped`.
    pub fn stop(&mut self, now: DateTime<Utc>) {
        if let Some(token) = self.state().fencing_token() {
            if let Err(e) = self.leases.release(&self.holder, token, now) {
                warn!(error = %e, "failed to release lease on shutdown");
            }
        }
        self.publish(LeaderState::Stopped);
        info!(holder = %self.holder, "leader coordinator stopped");
    }

    fn publish(&self, state: LeaderState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}
