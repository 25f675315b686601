// Metro subsystem: recurring sample-accurate tick sources. The audio
// callback advances every enabled metro by one sample per tick and posts
// a metro event when a countdown reaches zero, then reloads it. The
// control loop owns configuration.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

use crate::fabric::event::MetroEvent;
use crate::fabric::ring::Producer;

pub const NUM_METROS: usize = 8;

/// Infinite repeat.
pub const FOREVER: i32 = -1;

struct Metro {
    enabled: AtomicBool,
    interval_samples: AtomicU32,
    countdown: AtomicU32,
    /// Events left to fire; −1 = infinite.
    remaining: AtomicI32,
    /// 1-based stage index carried in the event.
    stage: AtomicI32,
}

impl Metro {
    fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            interval_samples: AtomicU32::new(1),
            countdown: AtomicU32::new(1),
            remaining: AtomicI32::new(FOREVER),
            stage: AtomicI32::new(1),
        }
    }
}

pub struct MetroBank {
    metros: [Metro; NUM_METROS],
    sample_rate: u32,
}

impl MetroBank {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            metros: std::array::from_fn(|_| Metro::new()),
            sample_rate,
        }
    }

    fn interval_samples(&self, interval_s: f32) -> u32 {
        ((interval_s * self.sample_rate as f32).round() as u32).max(1)
    }

    /// Start (or restart) a metro. `count` is the number of events to
    /// fire, −1 for infinite.
    pub fn start(&self, id: usize, interval_s: f32, count: i32) {
        let m = &self.metros[id];
        let interval = self.interval_samples(interval_s);
        m.enabled.store(false, Ordering::Relaxed);
        m.interval_samples.store(interval, Ordering::Relaxed);
        m.countdown.store(interval, Ordering::Relaxed);
        m.remaining.store(count, Ordering::Relaxed);
        m.stage.store(1, Ordering::Relaxed);
        m.enabled.store(true, Ordering::Release);
    }

    pub fn stop(&self, id: usize) {
        self.metros[id].enabled.store(false, Ordering::Relaxed);
    }

    pub fn stop_all(&self) {
        for m in &self.metros {
            m.enabled.store(false, Ordering::Relaxed);
        }
    }

    pub fn running(&self, id: usize) -> bool {
        self.metros[id].enabled.load(Ordering::Relaxed)
    }

    /// New interval takes effect at the next reload.
    pub fn set_interval(&self, id: usize, interval_s: f32) {
        self.metros[id]
            .interval_samples
            .store(self.interval_samples(interval_s), Ordering::Relaxed);
    }

    pub fn set_count(&self, id: usize, stages: i32) {
        self.metros[id].remaining.store(stages, Ordering::Relaxed);
    }

    /// Audio-domain tick: advance all enabled metros by one sample.
    pub fn tick(&self, metro_tx: &Producer<MetroEvent>) {
        for (id, m) in self.metros.iter().enumerate() {
            if !m.enabled.load(Ordering::Acquire) {
                continue;
            }
            let c = m.countdown.load(Ordering::Relaxed);
            if c > 1 {
                m.countdown.store(c - 1, Ordering::Relaxed);
                continue;
            }
            // Fired: post, advance stage, reload.
            let stage = m.stage.load(Ordering::Relaxed);
            let _ = metro_tx.post(MetroEvent {
                id: id as u8,
                stage,
            });
            m.stage.store(stage + 1, Ordering::Relaxed);
            m.countdown
                .store(m.interval_samples.load(Ordering::Relaxed), Ordering::Relaxed);
            let rem = m.remaining.load(Ordering::Relaxed);
            if rem > 0 {
                m.remaining.store(rem - 1, Ordering::Relaxed);
                if rem == 1 {
                    m.enabled.store(false, Ordering::Relaxed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::ring;

    #[test]
    fn fires_exactly_count_events_with_exact_spacing() {
        let bank = MetroBank::new(8_000);
        let (tx, rx) = ring::channel(32);
        bank.start(1, 0.1, 10);

        let mut fire_samples = Vec::new();
        for sample in 0u64..10_000 {
            bank.tick(&tx);
            while let Some(ev) = rx.get() {
                assert_eq!(ev.id, 1);
                fire_samples.push((sample, ev.stage));
            }
        }
        assert_eq!(fire_samples.len(), 10, "exactly ten events");
        assert!(!bank.running(1), "metro disables itself after the last");
        for (i, (sample, stage)) in fire_samples.iter().enumerate() {
            // 0.1 s at 8 kHz = 800 samples, first fire after one full
            // interval, zero jitter against the sample counter.
            assert_eq!(*sample, 800 * (i as u64 + 1) - 1);
            assert_eq!(*stage, i as i32 + 1);
        }
    }

    #[test]
    fn infinite_metro_keeps_firing_until_stopped() {
        let bank = MetroBank::new(8_000);
        let (tx, rx) = ring::channel(32);
        bank.start(0, 0.001, FOREVER);
        for _ in 0..64 {
            bank.tick(&tx);
        }
        assert_eq!(rx.drain(), 8);
        bank.stop(0);
        for _ in 0..64 {
            bank.tick(&tx);
        }
        assert_eq!(rx.drain(), 0);
    }

    #[test]
    fn interval_change_applies_at_reload() {
        let bank = MetroBank::new(8_000);
        let (tx, rx) = ring::channel(32);
        bank.start(2, 0.001, FOREVER); // 8 samples
        bank.set_interval(2, 0.002); // 16 samples, after next fire
        let mut fires = Vec::new();
        for sample in 0u64..48 {
            bank.tick(&tx);
            if rx.get().is_some() {
                fires.push(sample);
            }
        }
        assert_eq!(fires, vec![7, 23, 39]);
    }

    #[test]
    fn stop_all_silences_every_metro() {
        let bank = MetroBank::new(8_000);
        let (tx, rx) = ring::channel(64);
        for id in 0..NUM_METROS {
            bank.start(id, 0.001, FOREVER);
        }
        bank.stop_all();
        for _ in 0..32 {
            bank.tick(&tx);
        }
        assert_eq!(rx.drain(), 0);
    }
}
