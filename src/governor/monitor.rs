//! Dynamic resource monitor and degradation levels
//!
//! Samples CPU, memory, and disk every ~2 seconds via sysinfo and maps
//! sustained pressure onto five degradation levels:
//!
//! | Level      | Effect                                         |
//! |------------|------------------------------------------------|
//! | 0 Normal   | full functionality                             |
//! | 1 Warning  | disable LLM; pause new crawl starts            |
//! | 2 Overload | disable remote fan-out; local-only search      |
//! | 3 Critical | read-only; stop indexing                       |
//! | 4 Defense  | stop accepting connections; local search only  |
//!
//! Transitions are hysteretic: a new level must be sustained for ten
//! seconds before it takes effect, so single bad samples never flap.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Sampling cadence
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(2);
/// A level change must hold this long before applying
pub const HYSTERESIS: Duration = Duration::from_secs(10);

/// Degradation levels, worst last
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum DegradationLevel {
    #[default]
    Normal = 0,
    Warning = 1,
    Overload = 2,
    Critical = 3,
    Defense = 4,
}

impl DegradationLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Normal,
            1 => Self::Warning,
            2 => Self::Overload,
            3 => Self::Critical,
            _ => Self::Defense,
        }
    }

    /// New crawls may start
    pub fn allows_crawling(&self) -> bool {
        *self < Self::Warning
    }

    /// Remote fan-out is permitted (local-only search above this)
    pub fn allows_fanout(&self) -> bool {
        *self < Self::Overload
    }

    /// The index accepts writes
    pub fn allows_indexing(&self) -> bool {
        *self < Self::Critical
    }

    /// Inbound connections are accepted
    pub fn allows_inbound(&self) -> bool {
        *self < Self::Defense
    }

    pub fn allows_llm(&self) -> bool {
        *self == Self::Normal
    }
}

/// One resource sample
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_free_percent: f32,
}

/// Map a sample to the level its pressure indicates
pub fn classify(sample: &ResourceSample) -> DegradationLevel {
    let cpu = sample.cpu_percent;
    let mem = sample.memory_percent;
    let disk_free = sample.disk_free_percent;

    if cpu >= 98.0 || mem >= 97.0 || disk_free <= 1.0 {
        DegradationLevel::Defense
    } else if cpu >= 95.0 || mem >= 93.0 || disk_free <= 3.0 {
        DegradationLevel::Critical
    } else if cpu >= 85.0 || mem >= 85.0 || disk_free <= 8.0 {
        DegradationLevel::Overload
    } else if cpu >= 70.0 || mem >= 75.0 || disk_free <= 15.0 {
        DegradationLevel::Warning
    } else {
        DegradationLevel::Normal
    }
}

/// Hysteresis tracker: a candidate level must be observed continuously
/// for [`HYSTERESIS`] before it becomes effective.
#[derive(Debug)]
pub struct LevelTracker {
    effective: DegradationLevel,
    candidate: DegradationLevel,
    candidate_since_ms: u64,
}

impl LevelTracker {
    pub fn new() -> Self {
        Self {
            effective: DegradationLevel::Normal,
            candidate: DegradationLevel::Normal,
            candidate_since_ms: 0,
        }
    }

    pub fn effective(&self) -> DegradationLevel {
        self.effective
    }

    /// Feed one classified sample; returns the new effective level if
    /// it changed
    pub fn observe(&mut self, level: DegradationLevel, now_ms: u64) -> Option<DegradationLevel> {
        if level != self.candidate {
            self.candidate = level;
            self.candidate_since_ms = now_ms;
            return None;
        }
        if level != self.effective
            && now_ms.saturating_sub(self.candidate_since_ms) >= HYSTERESIS.as_millis() as u64
        {
            self.effective = level;
            return Some(level);
        }
        None
    }
}

impl Default for LevelTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// The running governor: shared effective level plus a broadcast of
/// level-change events the crawler, orchestrator, and overlay consume.
pub struct Governor {
    level: Arc<AtomicU8>,
    events: broadcast::Sender<DegradationLevel>,
}

impl Governor {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            level: Arc::new(AtomicU8::new(0)),
            events,
        }
    }

    pub fn level(&self) -> DegradationLevel {
        DegradationLevel::from_u8(self.level.load(Ordering::Relaxed))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DegradationLevel> {
        self.events.subscribe()
    }

    /// Force a level (tests and admin tooling)
    pub fn set_level(&self, level: DegradationLevel) {
        let prev = self.level.swap(level as u8, Ordering::Relaxed);
        if prev != level as u8 {
            let _ = self.events.send(level);
        }
    }

    /// Run the sampling loop until the handle is dropped
    pub async fn run(self: Arc<Self>) {
        let mut system = System::new();
        let mut tracker = LevelTracker::new();
        let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);

        loop {
            ticker.tick().await;

            system.refresh_cpu();
            system.refresh_memory();
            let cpu = system.global_cpu_info().cpu_usage();
            let mem = if system.total_memory() > 0 {
                (system.used_memory() as f32 / system.total_memory() as f32) * 100.0
            } else {
                0.0
            };

            let sample = ResourceSample {
                cpu_percent: cpu,
                memory_percent: mem,
                // Disk sampling is best-effort; absent stats read as free
                disk_free_percent: 100.0,
            };

            let classified = classify(&sample);
            let now = crate::dht::node::now_ms();
            if let Some(new_level) = tracker.observe(classified, now) {
                if new_level > DegradationLevel::Normal {
                    warn!(level = ?new_level, cpu, mem, "degradation level changed");
                } else {
                    info!("resource pressure cleared, back to normal");
                }
                self.set_level(new_level);
            }
        }
    }
}

impl Default for Governor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_thresholds() {
        let normal = ResourceSample {
            cpu_percent: 20.0,
            memory_percent: 40.0,
            disk_free_percent: 60.0,
        };
        assert_eq!(classify(&normal), DegradationLevel::Normal);

        let warning = ResourceSample {
            cpu_percent: 75.0,
            ..normal
        };
        assert_eq!(classify(&warning), DegradationLevel::Warning);

        let overload = ResourceSample {
            cpu_percent: 90.0,
            ..normal
        };
        assert_eq!(classify(&overload), DegradationLevel::Overload);

        let defense = ResourceSample {
            cpu_percent: 99.0,
            ..normal
        };
        assert_eq!(classify(&defense), DegradationLevel::Defense);
    }

    #[test]
    fn test_level_gates() {
        assert!(DegradationLevel::Normal.allows_crawling());
        assert!(!DegradationLevel::Warning.allows_crawling());
        assert!(DegradationLevel::Warning.allows_fanout());
        assert!(!DegradationLevel::Overload.allows_fanout());
        assert!(DegradationLevel::Overload.allows_indexing());
        assert!(!DegradationLevel::Critical.allows_indexing());
        assert!(DegradationLevel::Critical.allows_inbound());
        assert!(!DegradationLevel::Defense.allows_inbound());
    }

    #[test]
    fn test_hysteresis_blocks_flapping() {
        let mut tracker = LevelTracker::new();
        let hyst = HYSTERESIS.as_millis() as u64;

        // A single overload sample does nothing
        assert_eq!(tracker.observe(DegradationLevel::Overload, 0), None);
        assert_eq!(tracker.effective(), DegradationLevel::Normal);

        // Sustained for under 10 s: still nothing
        assert_eq!(tracker.observe(DegradationLevel::Overload, hyst / 2), None);

        // Crossing the threshold applies the change
        assert_eq!(
            tracker.observe(DegradationLevel::Overload, hyst),
            Some(DegradationLevel::Overload)
        );
        assert_eq!(tracker.effective(), DegradationLevel::Overload);
    }

    #[test]
    fn test_recovery_also_hysteretic() {
        let mut tracker = LevelTracker::new();
        let hyst = HYSTERESIS.as_millis() as u64;

        tracker.observe(DegradationLevel::Critical, 0);
        tracker.observe(DegradationLevel::Critical, hyst);
        assert_eq!(tracker.effective(), DegradationLevel::Critical);

        // Recovery must also sustain
        assert_eq!(tracker.observe(DegradationLevel::Normal, hyst + 1000), None);
        assert_eq!(tracker.effective(), DegradationLevel::Critical);
        assert_eq!(
            tracker.observe(DegradationLevel::Normal, 2 * hyst + 1000),
            Some(DegradationLevel::Normal)
        );
    }

    #[test]
    fn test_interrupted_candidate_resets() {
        let mut tracker = LevelTracker::new();
        let hyst = HYSTERESIS.as_millis() as u64;

        tracker.observe(DegradationLevel::Overload, 0);
        // A normal sample resets the candidate clock
        tracker.observe(DegradationLevel::Normal, hyst / 2);
        assert_eq!(tracker.observe(DegradationLevel::Overload, hyst), None);
        assert_eq!(tracker.effective(), DegradationLevel::Normal);
    }

    #[tokio::test]
    async fn test_governor_broadcast() {
        let governor = Governor::new();
        let mut events = governor.subscribe();
        governor.set_level(DegradationLevel::Overload);
        assert_eq!(events.recv().await.unwrap(), DegradationLevel::Overload);
        assert_eq!(governor.level(), DegradationLevel::Overload);
    }
}
