use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use arbflow_helpers::{redis::StreamsClient, time::Clock};
use rand::Rng;
use tokio::sync::{broadcast, mpsc::UnboundedSender, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::{
    consts::{ALERT_LEADER_ACQUIRED, ALERT_LEADER_DEMOTION, LEADER_LOCK_KEY},
    types::{Alert, AlertSeverity},
};

/// Configuration for leader election across coordinator replicas.
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    /// TTL of the leadership lease in milliseconds; converted to
    /// whole seconds (rounded up) for the broker.
    pub lock_ttl_ms: u64,
    /// The base interval between lease heartbeats.
    pub heartbeat_interval_ms: u64,
    /// Uniform jitter added to each heartbeat interval so replicas
    /// do not contend in lockstep.
    pub jitter_range_ms: u64,
    /// Consecutive failed renewals before the leader demotes itself.
    pub max_heartbeat_failures: u32,
    /// Whether this replica participates in election at all.
    pub can_become_leader: bool,
    /// Standby replicas refuse to acquire until explicitly activated.
    pub standby: bool,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        LeaderElectionConfig {
            lock_ttl_ms: 30_000,
            heartbeat_interval_ms: 10_000,
            jitter_range_ms: 1_000,
            max_heartbeat_failures: 3,
            can_become_leader: true,
            standby: false,
        }
    }
}

#[derive(Debug, Default)]
struct LeaderState {
    is_leader: bool,
    heartbeat_failures: u32,
    activating: bool,
}

/// Redis-backed leader election with an owner-qualified lease.
///
/// One replica holds the lock key with its instance ID as the value;
/// only the owner can renew or release. Leadership changes are
/// published on a watch channel so the router and HTTP surface read
/// the current state without touching election internals.
pub struct LeaderElection {
    client: Arc<dyn StreamsClient>,
    clock: Arc<dyn Clock + Send + Sync>,
    config: LeaderElectionConfig,
    instance_id: String,
    state: Mutex<LeaderState>,
    // Serializes standby activation so concurrent calls observe
    // a single attempt and a single result.
    activation: Mutex<()>,
    leadership_tx: watch::Sender<bool>,
    alert_tx: UnboundedSender<Alert>,
    stopped: AtomicBool,
}

impl LeaderElection {
    pub fn new(
        client: Arc<dyn StreamsClient>,
        clock: Arc<dyn Clock + Send + Sync>,
        config: LeaderElectionConfig,
        instance_id: String,
        alert_tx: UnboundedSender<Alert>,
    ) -> Self {
        let (leadership_tx, _) = watch::channel(false);
        LeaderElection {
            client,
            clock,
            config,
            instance_id,
            state: Mutex::new(LeaderState::default()),
            activation: Mutex::new(()),
            leadership_tx,
            alert_tx,
            stopped: AtomicBool::new(false),
        }
    }

    /// A receiver that observes leadership transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.leadership_tx.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        *self.leadership_tx.borrow()
    }

    fn lock_ttl_seconds(&self) -> u64 {
        self.config.lock_ttl_ms.div_ceil(1_000)
    }

    /// Runs the heartbeat loop until a shutdown signal arrives.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            let jitter_ms = if self.config.jitter_range_ms > 0 {
                rand::thread_rng().gen_range(0..self.config.jitter_range_ms)
            } else {
                0
            };
            let wait = Duration::from_millis(self.config.heartbeat_interval_ms + jitter_ms);

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping leader election heartbeat");
                    break;
                }
                _ = tokio::time::sleep(wait) => {
                    self.run_heartbeat().await;
                }
            }
        }
    }

    /// Executes one heartbeat: renew when leading, otherwise attempt
    /// acquisition when this replica is allowed to lead.
    pub async fn run_heartbeat(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let mut state = self.state.lock().await;
        if state.is_leader {
            self.renew(&mut state).await;
        } else if self.config.can_become_leader && (!self.config.standby || state.activating) {
            self.try_acquire(&mut state).await;
        }
    }

    async fn renew(&self, state: &mut LeaderState) {
        let renewed = match self
            .client
            .renew_lock_if_owner(LEADER_LOCK_KEY, &self.instance_id, self.lock_ttl_seconds())
            .await
        {
            Ok(renewed) => renewed,
            Err(err) => {
                warn!("leadership lease renewal failed: {err}");
                false
            }
        };

        if renewed {
            state.heartbeat_failures = 0;
            return;
        }

        state.heartbeat_failures += 1;
        warn!(
            failures = state.heartbeat_failures,
            max = self.config.max_heartbeat_failures,
            "failed to renew leadership lease"
        );

        if state.heartbeat_failures >= self.config.max_heartbeat_failures {
            state.is_leader = false;
            state.heartbeat_failures = 0;
            let alert = Alert::new(
                ALERT_LEADER_DEMOTION,
                AlertSeverity::Critical,
                format!(
                    "instance {} lost the leadership lease after repeated renewal failures",
                    self.instance_id
                ),
                self.clock.now_ms(),
            );
            let _ = self.alert_tx.send(alert);
            let _ = self.leadership_tx.send(false);
        }
    }

    async fn try_acquire(&self, state: &mut LeaderState) {
        let acquired = match self
            .client
            .set_nx(LEADER_LOCK_KEY, &self.instance_id, self.lock_ttl_seconds())
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                // The key may already hold our own instance ID from a
                // previous run of this process; an owner-qualified
                // renewal covers that restart case.
                match self
                    .client
                    .renew_lock_if_owner(
                        LEADER_LOCK_KEY,
                        &self.instance_id,
                        self.lock_ttl_seconds(),
                    )
                    .await
                {
                    Ok(renewed) => renewed,
                    Err(err) => {
                        warn!("leadership ownership check failed: {err}");
                        false
                    }
                }
            }
            Err(err) => {
                warn!("leadership acquisition failed: {err}");
                false
            }
        };

        if acquired {
            state.is_leader = true;
            state.heartbeat_failures = 0;
            info!(instance_id = %self.instance_id, "acquired leadership lease");
            let alert = Alert::new(
                ALERT_LEADER_ACQUIRED,
                AlertSeverity::Info,
                format!("instance {} acquired the leadership lease", self.instance_id),
                self.clock.now_ms(),
            );
            let _ = self.alert_tx.send(alert);
            let _ = self.leadership_tx.send(true);
        } else {
            debug!("leadership lease is held by another instance");
        }
    }

    /// Allows a standby replica to start competing for leadership and
    /// makes one immediate acquisition attempt. Concurrent calls are
    /// serialized and observe the same result.
    pub async fn activate_standby(&self) -> bool {
        let _guard = self.activation.lock().await;

        let mut state = self.state.lock().await;
        if state.activating {
            return state.is_leader;
        }
        state.activating = true;
        info!("standby instance activating, attempting to acquire leadership");

        self.try_acquire(&mut state).await;
        state.is_leader
    }

    /// Releases the lease if owned and notifies the listener when
    /// leadership is given up. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut state = self.state.lock().await;
        match self
            .client
            .release_lock_if_owner(LEADER_LOCK_KEY, &self.instance_id)
            .await
        {
            Ok(released) => {
                debug!(released, "released leadership lease on stop");
            }
            Err(err) => {
                error!("failed to release leadership lease on stop: {err}");
            }
        }

        if state.is_leader {
            state.is_leader = false;
            let _ = self.leadership_tx.send(false);
        }
    }
}
