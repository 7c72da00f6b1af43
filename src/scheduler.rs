//! Virtual-time frame scheduler.
//!
//! Two clocks are kept: the host clock advances by whatever the caller feeds
//! to [`FrameScheduler::advance_to`], the simulated clock advances by the host
//! delta multiplied by the speed factor. Delays are requested in simulated
//! milliseconds and converted to a host deadline when armed, so a speed change
//! only affects timers armed after it. Host time is kept in fractional
//! microseconds so sub-microsecond delays at high speed keep their length.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};

/// Largest jitter fraction accepted by the scheduler (±50 %).
pub const MAX_JITTER: f64 = 0.5;
/// Fastest supported speed factor. Beyond this a 1 ms cycle shrinks below
/// the resolution of the host clock over long sessions.
pub const MAX_SPEED: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    Inactive,
    Scheduled { next_fire_us: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchedulerStats {
    pub total_armed: u64,
    pub total_fired: u64,
    pub total_cancelled: u64,
    pub currently_pending: usize,
}

#[derive(Debug)]
struct Timer<K> {
    deadline_us: f64,
    sequence: u64,
    kind: K,
}

// Ordered by deadline, then by arming order so equal deadlines fire FIFO.
impl<K> PartialEq for Timer<K> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_us == other.deadline_us && self.sequence == other.sequence
    }
}

impl<K> Eq for Timer<K> {}

impl<K> PartialOrd for Timer<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Timer<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline_us
            .total_cmp(&other.deadline_us)
            .then(self.sequence.cmp(&other.sequence))
    }
}

#[derive(Debug)]
pub struct FrameScheduler<K> {
    timers: BinaryHeap<Reverse<Timer<K>>>,
    schedules: BTreeMap<u32, ScheduleState>,
    host_time_us: f64,
    sim_time_ms: f64,
    speed: f64,
    jitter: f64,
    sequence: u64,
    stats: SchedulerStats,
}

impl<K> FrameScheduler<K> {
    /// `jitter` is a fraction of the cycle time, clamped to ±[`MAX_JITTER`].
    pub fn new(jitter: f64) -> Self {
        Self {
            timers: BinaryHeap::new(),
            schedules: BTreeMap::new(),
            host_time_us: 0.0,
            sim_time_ms: 0.0,
            speed: 1.0,
            jitter: jitter.clamp(0.0, MAX_JITTER),
            sequence: 0,
            stats: SchedulerStats::default(),
        }
    }

    /// Rewind both clocks and drop every pending timer.
    pub fn reset(&mut self, speed: f64) {
        self.cancel_all();
        self.host_time_us = 0.0;
        self.sim_time_ms = 0.0;
        self.speed = speed;
    }

    pub fn set_speed(&mut self, speed: f64) {
        debug_assert!(speed > 0.0, "speed factor {} must be positive", speed);
        self.speed = speed;
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn host_time_us(&self) -> f64 {
        self.host_time_us
    }

    /// Simulated milliseconds since the last reset.
    pub fn now_ms(&self) -> f64 {
        self.sim_time_ms
    }

    /// Move the host clock forward to `host_us`; earlier times are ignored.
    pub fn advance_to(&mut self, host_us: f64) {
        if host_us > self.host_time_us {
            let delta = host_us - self.host_time_us;
            self.sim_time_ms += delta * self.speed / 1000.0;
            self.host_time_us = host_us;
        }
    }

    /// Arm a one-shot timer `delay_ms` simulated milliseconds from now.
    /// Returns the host deadline.
    pub fn arm(&mut self, delay_ms: f64, kind: K) -> f64 {
        let delay_us = if delay_ms.is_finite() {
            delay_ms.max(0.0) * 1000.0 / self.speed
        } else {
            0.0
        };
        let deadline_us = self.host_time_us + delay_us;
        self.sequence += 1;
        self.timers.push(Reverse(Timer {
            deadline_us,
            sequence: self.sequence,
            kind,
        }));
        self.stats.total_armed += 1;
        deadline_us
    }

    /// Make a message known to the scheduler without arming it.
    pub fn register(&mut self, message_id: u32) {
        self.schedules.entry(message_id).or_insert(ScheduleState::Inactive);
    }

    /// Arm the next transmission of a periodic message with jitter applied.
    /// Returns false for a zero cycle time.
    pub fn schedule_message<R: Rng>(&mut self, message_id: u32, cycle_ms: u64, rng: &mut R, kind: K) -> bool {
        if cycle_ms == 0 {
            return false;
        }
        let factor = if self.jitter > 0.0 {
            1.0 + rng.gen_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };
        let next_fire_us = self.arm(cycle_ms as f64 * factor, kind).round() as u64;
        self.schedules
            .insert(message_id, ScheduleState::Scheduled { next_fire_us });
        true
    }

    /// Pop the earliest timer due at or before `until_us`, advancing the
    /// clocks to its deadline.
    pub fn pop_due(&mut self, until_us: f64) -> Option<K> {
        let due = matches!(self.timers.peek(), Some(Reverse(t)) if t.deadline_us <= until_us);
        if !due {
            return None;
        }
        let Reverse(timer) = self.timers.pop()?;
        self.advance_to(timer.deadline_us);
        self.stats.total_fired += 1;
        Some(timer.kind)
    }

    /// Drop every pending timer; returns how many were cancelled.
    pub fn cancel_all(&mut self) -> usize {
        let cancelled = self.timers.len();
        self.timers.clear();
        for state in self.schedules.values_mut() {
            *state = ScheduleState::Inactive;
        }
        self.stats.total_cancelled += cancelled as u64;
        cancelled
    }

    pub fn next_deadline_us(&self) -> Option<f64> {
        self.timers.peek().map(|Reverse(t)| t.deadline_us)
    }

    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    pub fn schedule_state(&self, message_id: u32) -> Option<ScheduleState> {
        self.schedules.get(&message_id).copied()
    }

    /// Messages with a transmission currently armed, in identifier order.
    pub fn scheduled_ids(&self) -> Vec<u32> {
        self.schedules
            .iter()
            .filter(|(_, state)| matches!(state, ScheduleState::Scheduled { .. }))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Get scheduler statistics
    pub fn get_stats(&self) -> SchedulerStats {
        SchedulerStats {
            currently_pending: self.timers.len(),
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let mut scheduler: FrameScheduler<&str> = FrameScheduler::new(0.0);
        scheduler.arm(30.0, "late");
        scheduler.arm(10.0, "early");
        scheduler.arm(10.0, "early-second");

        assert_eq!(scheduler.pop_due(5_000.0), None);
        assert_eq!(scheduler.pop_due(50_000.0), Some("early"));
        assert_eq!(scheduler.pop_due(50_000.0), Some("early-second"));
        assert_eq!(scheduler.now_ms(), 10.0);
        assert_eq!(scheduler.pop_due(50_000.0), Some("late"));
        assert_eq!(scheduler.pop_due(50_000.0), None);
        assert_eq!(scheduler.get_stats().total_fired, 3);
    }

    #[test]
    fn test_speed_scales_host_deadline() {
        let mut scheduler: FrameScheduler<u8> = FrameScheduler::new(0.0);
        scheduler.set_speed(10.0);
        let deadline = scheduler.arm(1000.0, 1);
        assert_eq!(deadline, 100_000.0);

        assert_eq!(scheduler.pop_due(100_000.0), Some(1));
        assert_eq!(scheduler.host_time_us(), 100_000.0);
        assert!((scheduler.now_ms() - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut scheduler: FrameScheduler<u32> = FrameScheduler::new(0.1);
        for _ in 0..200 {
            scheduler.reset(1.0);
            assert!(scheduler.schedule_message(0x100, 100, &mut rng, 0x100));
            let deadline = scheduler.next_deadline_us().unwrap();
            assert!((90_000.0..=110_000.0).contains(&deadline), "deadline {}", deadline);
        }
    }

    #[test]
    fn test_zero_cycle_is_not_scheduled() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut scheduler: FrameScheduler<u32> = FrameScheduler::new(0.1);
        scheduler.register(0x200);
        assert!(!scheduler.schedule_message(0x200, 0, &mut rng, 0x200));
        assert_eq!(scheduler.schedule_state(0x200), Some(ScheduleState::Inactive));
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_cancel_all_deactivates_schedules() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut scheduler: FrameScheduler<u32> = FrameScheduler::new(0.0);
        scheduler.schedule_message(0x100, 10, &mut rng, 0x100);
        scheduler.schedule_message(0x101, 20, &mut rng, 0x101);
        assert_eq!(scheduler.scheduled_ids(), vec![0x100, 0x101]);

        assert_eq!(scheduler.cancel_all(), 2);
        assert!(scheduler.scheduled_ids().is_empty());
        assert_eq!(scheduler.pop_due(f64::MAX), None);
        assert_eq!(scheduler.get_stats().total_cancelled, 2);
    }

    #[test]
    fn test_clock_never_moves_backwards() {
        let mut scheduler: FrameScheduler<u8> = FrameScheduler::new(0.0);
        scheduler.advance_to(5_000.0);
        scheduler.advance_to(1_000.0);
        assert_eq!(scheduler.host_time_us(), 5_000.0);
        assert_eq!(scheduler.now_ms(), 5.0);
    }

    #[test]
    fn test_sub_microsecond_cycles_keep_their_length() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut scheduler: FrameScheduler<u32> = FrameScheduler::new(0.0);
        scheduler.set_speed(MAX_SPEED);
        scheduler.schedule_message(0x100, 1, &mut rng, 0x100);

        let mut fired = 0;
        while scheduler.pop_due(100.0).is_some() {
            fired += 1;
            scheduler.schedule_message(0x100, 1, &mut rng, 0x100);
        }
        // One cycle per simulated millisecond; the last deadline may round
        // just past the window.
        assert!((99_999..=100_000).contains(&fired), "fired {}", fired);
        assert!((scheduler.now_ms() - 100_000.0).abs() <= 1.0 + 1e-6);
    }
}
