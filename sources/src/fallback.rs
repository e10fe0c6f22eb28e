//! Source Failover
//!
//! Three tip sources in priority order: shared memory, relay, pool. Each is
//! a small state machine:
//!
//! ```text
//! DISABLED -> CONNECTING -> CONNECTED -> DEGRADED -> FAILED
//! ```
//!
//! The active source is the highest-priority connected one. Missing N
//! heartbeat ticks degrades a source and demotes to the next; a demoted
//! higher-priority source must stay healthy for K seconds before it is
//! promoted back, and K exceeds the demotion hysteresis so the manager does
//! not flap. Tip hashes seen recently are suppressed, so no duplicate tip
//! crosses a transition.

use log::{info, warn};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use quaxis_core::{Hash256, SourceKind, TipEvent};

/// Per-source state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Not configured
    Disabled,

    /// Waiting for first data
    Connecting,

    /// Delivering data within the grace window
    Connected,

    /// Missed heartbeats; demoted
    Degraded,

    /// Given up (stays failed until data arrives again)
    Failed,
}

/// Failover tuning.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Consecutive missed ticks before a source degrades
    pub heartbeat_misses: u32,

    /// How long a higher-priority source must stay healthy before failback
    pub failback_after: Duration,

    /// Ticks after degradation before a source is marked failed
    pub fail_after_misses: u32,

    /// Recent tip hashes remembered for duplicate suppression
    pub dedup_window: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        FallbackConfig {
            heartbeat_misses: 3,
            failback_after: Duration::from_secs(30),
            fail_after_misses: 30,
            dedup_window: 64,
        }
    }
}

/// Snapshot of one source for the telemetry surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceStatus {
    /// Which source
    pub kind: SourceKind,

    /// Current state
    pub state: SourceState,

    /// Ticks since data was last seen
    pub missed: u32,
}

struct SourceSlot {
    kind: SourceKind,
    state: SourceState,
    missed: u32,
    data_this_tick: bool,
    healthy_since: Option<Instant>,
}

/// The failover manager. Driven synchronously by the coordinator: `on_event`
/// for every tip any source produces, `tick` at the heartbeat interval.
pub struct FallbackManager {
    config: FallbackConfig,
    sources: Vec<SourceSlot>,
    active: usize,
    recent: VecDeque<Hash256>,
    duplicates_suppressed: u64,
}

impl FallbackManager {
    /// Create a manager over sources in priority order (index 0 highest).
    pub fn new(config: FallbackConfig, kinds: Vec<(SourceKind, bool)>) -> Self {
        let sources = kinds
            .into_iter()
            .map(|(kind, enabled)| SourceSlot {
                kind,
                state: if enabled {
                    SourceState::Connecting
                } else {
                    SourceState::Disabled
                },
                missed: 0,
                data_this_tick: false,
                healthy_since: None,
            })
            .collect::<Vec<_>>();

        let active = sources
            .iter()
            .position(|s| s.state != SourceState::Disabled)
            .unwrap_or(0);

        FallbackManager {
            config,
            sources,
            active,
            recent: VecDeque::new(),
            duplicates_suppressed: 0,
        }
    }

    /// Record a tip from a source. Returns `true` when the event should be
    /// forwarded to the template cache: the source is the active one and the
    /// tip hash has not been seen recently.
    pub fn on_event(&mut self, kind: SourceKind, event: &TipEvent) -> bool {
        let index = match self.sources.iter().position(|s| s.kind == kind) {
            Some(index) => index,
            None => return false,
        };

        {
            let slot = &mut self.sources[index];
            if slot.state == SourceState::Disabled {
                return false;
            }
            slot.data_this_tick = true;
            slot.missed = 0;
            if slot.state != SourceState::Connected {
                info!("source {} connected", slot.kind);
                slot.state = SourceState::Connected;
                slot.healthy_since = Some(Instant::now());
            }
        }

        if index != self.active {
            // A standby source observed the tip; only the active source
            // feeds the pipeline.
            return false;
        }

        if self.recent.contains(&event.prev_hash) {
            self.duplicates_suppressed += 1;
            return false;
        }
        if self.recent.len() == self.config.dedup_window {
            self.recent.pop_front();
        }
        self.recent.push_back(event.prev_hash);
        true
    }

    /// Advance heartbeat accounting. Call at a fixed interval; handles
    /// demotion of a silent active source and failback to a recovered
    /// higher-priority one.
    pub fn tick(&mut self) {
        for slot in &mut self.sources {
            if slot.state == SourceState::Disabled {
                continue;
            }
            if slot.data_this_tick {
                slot.data_this_tick = false;
                continue;
            }

            slot.missed += 1;
            if slot.state == SourceState::Connected && slot.missed >= self.config.heartbeat_misses {
                warn!("source {} degraded after {} missed heartbeats", slot.kind, slot.missed);
                slot.state = SourceState::Degraded;
                slot.healthy_since = None;
            } else if slot.state == SourceState::Degraded
                && slot.missed >= self.config.fail_after_misses
            {
                warn!("source {} failed", slot.kind);
                slot.state = SourceState::Failed;
            }
        }

        // Demote away from a degraded active source.
        if self.sources[self.active].state != SourceState::Connected {
            if let Some(next) = self
                .sources
                .iter()
                .position(|s| s.state == SourceState::Connected)
                .or_else(|| {
                    self.sources
                        .iter()
                        .position(|s| s.state == SourceState::Connecting)
                })
            {
                if next != self.active {
                    info!(
                        "failover: {} -> {}",
                        self.sources[self.active].kind, self.sources[next].kind
                    );
                    self.active = next;
                }
            }
        }

        // Failback: a higher-priority source that has stayed healthy long
        // enough takes over again.
        for index in 0..self.active {
            let slot = &self.sources[index];
            if slot.state == SourceState::Connected {
                if let Some(since) = slot.healthy_since {
                    if since.elapsed() >= self.config.failback_after {
                        info!(
                            "failback: {} -> {}",
                            self.sources[self.active].kind, slot.kind
                        );
                        self.active = index;
                        break;
                    }
                }
            }
        }
    }

    /// The currently active source.
    pub fn active_kind(&self) -> SourceKind {
        self.sources[self.active].kind
    }

    /// True when no enabled source is delivering data.
    pub fn all_sources_down(&self) -> bool {
        self.sources.iter().all(|s| {
            matches!(
                s.state,
                SourceState::Disabled | SourceState::Degraded | SourceState::Failed
            )
        })
    }

    /// Per-source status for telemetry.
    pub fn statuses(&self) -> Vec<SourceStatus> {
        self.sources
            .iter()
            .map(|s| SourceStatus {
                kind: s.kind,
                state: s.state,
                missed: s.missed,
            })
            .collect()
    }

    /// Duplicate tips suppressed so far.
    pub fn duplicates_suppressed(&self) -> u64 {
        self.duplicates_suppressed
    }
}
