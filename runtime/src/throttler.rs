// Copyright 2024 autortfm contributors
// SPDX-License-Identifier: Apache-2.0

//! Adaptive limiter for memory-validation hashing.
//!
//! Validation rehashes every logged write at each open/closed transition,
//! which is by far the most expensive thing this runtime does. The
//! throttler keeps a probability in [0,1] per call site of actually
//! performing the hash, and periodically steers those probabilities so the
//! measured fraction of wall-clock time spent hashing converges on a
//! configured target. This is best-effort sampling, not a hard bound: a
//! pathological single-call-site burst can transiently overshoot.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Per-second convergence rate for damped probability increases.
const CONVERGENCE_PER_SECOND: f64 = 0.15;

/// Overshoot factor beyond which the cut is applied instantly and
/// uniformly instead of smoothed, to stop long hash stalls.
const INSTANT_CUT_FACTOR: f64 = 2.0;

#[derive(Debug, Clone, Copy, Default)]
struct CallSite {
    probability: f64,
    hash_time: Duration,
    bytes: u64,
    records: u64,
    lifetime_hashes: u64,
}

/// Throttles validation hashing per call site of the open transition.
///
/// Call sites are keyed by the caller location identity (the stable Rust
/// stand-in for the return address of the open call).
pub struct OpenHashThrottler {
    sites: HashMap<usize, CallSite>,
    /// Seed probability for call sites not seen before. Tracks the lowest
    /// probability of any active site so new sites start conservatively
    /// throttled instead of getting a free pass.
    default_probability: f64,
    target_fraction: f64,
    rng: SmallRng,
    stats_elapsed: Duration,
    stats_period: Duration,
}

impl OpenHashThrottler {
    pub fn new(target_fraction: f64, stats_period: Duration) -> Self {
        Self {
            sites: HashMap::new(),
            default_probability: 1.0,
            target_fraction,
            rng: SmallRng::from_entropy(),
            stats_elapsed: Duration::ZERO,
            stats_period,
        }
    }

    pub fn set_target_fraction(&mut self, target: f64) {
        self.target_fraction = target.clamp(0.0, 1.0);
    }

    /// The current hash probability for `site`, lazily initializing unseen
    /// sites from the shared default.
    pub fn hash_probability_for(&mut self, site: usize) -> f64 {
        let default = self.default_probability;
        self.sites
            .entry(site)
            .or_insert_with(|| CallSite {
                probability: default,
                ..CallSite::default()
            })
            .probability
    }

    /// Weighted coin flip deciding whether the next transition at `site`
    /// hashes. The draw is the product of two uniforms, so low
    /// probabilities strongly prefer skipping the hash while high ones
    /// almost always take it.
    pub fn should_hash_for(&mut self, site: usize) -> bool {
        let p = self.hash_probability_for(site);
        if p >= 1.0 {
            return true;
        }
        let draw: f64 = self.rng.gen::<f64>() * self.rng.gen::<f64>();
        draw < p * p
    }

    /// Attributes one performed hash to `site`.
    pub fn on_hash(&mut self, start: Instant, end: Instant, site: usize, bytes: u64, records: u64) {
        let default = self.default_probability;
        let entry = self.sites.entry(site).or_insert_with(|| CallSite {
            probability: default,
            ..CallSite::default()
        });
        entry.hash_time += end.duration_since(start);
        entry.bytes += bytes;
        entry.records += records;
        entry.lifetime_hashes += 1;
    }

    /// Periodic (time-sliced) adjustment pass over `dt` of wall-clock time.
    ///
    /// A site that spent at least [`INSTANT_CUT_FACTOR`] times the target
    /// budget gets a multiplicative cut applied immediately and uniformly;
    /// otherwise probabilities are steered toward the budget with
    /// reductions applied immediately and increases damped at
    /// [`CONVERGENCE_PER_SECOND`].
    pub fn update(&mut self, dt: Duration) {
        if dt.is_zero() {
            return;
        }
        let dt_secs = dt.as_secs_f64();
        let total_hash: Duration = self.sites.values().map(|s| s.hash_time).sum();
        let total_fraction = total_hash.as_secs_f64() / dt_secs;

        if total_fraction >= INSTANT_CUT_FACTOR * self.target_fraction && total_fraction > 0.0 {
            let gain = self.target_fraction / total_fraction;
            for site in self.sites.values_mut() {
                site.probability = (site.probability * gain).clamp(0.0, 1.0);
            }
        } else {
            let blend = (CONVERGENCE_PER_SECOND * dt_secs).min(1.0);
            for site in self.sites.values_mut() {
                let fraction = site.hash_time.as_secs_f64() / dt_secs;
                let desired = if fraction > self.target_fraction {
                    (site.probability * self.target_fraction / fraction).clamp(0.0, 1.0)
                } else {
                    1.0
                };
                if desired < site.probability {
                    site.probability = desired;
                } else {
                    site.probability += (desired - site.probability) * blend;
                }
            }
        }

        self.default_probability = self
            .sites
            .values()
            .map(|s| s.probability)
            .fold(1.0, f64::min);

        for site in self.sites.values_mut() {
            site.hash_time = Duration::ZERO;
            site.bytes = 0;
            site.records = 0;
        }

        self.stats_elapsed += dt;
        if self.stats_elapsed >= self.stats_period {
            self.flush_statistics();
            self.stats_elapsed = Duration::ZERO;
        }
    }

    fn flush_statistics(&self) {
        if self.sites.is_empty() {
            return;
        }
        log::debug!(
            "open-hash throttler: {} site(s), default probability {:.4}",
            self.sites.len(),
            self.default_probability
        );
        for (addr, site) in &self.sites {
            log::debug!(
                "  site {:#x}: probability {:.4}, {} lifetime hash(es)",
                addr,
                site.probability,
                site.lifetime_hashes
            );
        }
    }

    pub fn reset(&mut self) {
        self.sites.clear();
        self.default_probability = 1.0;
        self.stats_elapsed = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITE: usize = 0x4000_1000;

    #[test]
    fn test_unseen_site_seeds_from_lowest_active_probability() {
        let mut t = OpenHashThrottler::new(0.10, Duration::from_secs(3600));
        assert_eq!(t.hash_probability_for(SITE), 1.0);

        // drive the first site's probability down
        let dt = Duration::from_millis(100);
        for _ in 0..50 {
            let now = Instant::now();
            t.on_hash(now, now + Duration::from_millis(80), SITE, 1024, 4);
            t.update(dt);
        }
        let throttled = t.hash_probability_for(SITE);
        assert!(throttled < 1.0);

        // a brand-new site must not get a free pass
        let seeded = t.hash_probability_for(SITE + 8);
        assert!((seeded - throttled).abs() < 1e-9);
    }

    #[test]
    fn test_overshoot_reduces_probability_monotonically() {
        let mut t = OpenHashThrottler::new(0.10, Duration::from_secs(3600));
        let dt = Duration::from_millis(100);
        let mut last = t.hash_probability_for(SITE);
        for _ in 0..30 {
            let now = Instant::now();
            // 50% of wall time hashing, way over a 10% budget
            t.on_hash(now, now + Duration::from_millis(50), SITE, 4096, 16);
            t.update(dt);
            let p = t.hash_probability_for(SITE);
            assert!(p <= last + 1e-12, "probability must not rise under overshoot");
            last = p;
        }
        assert!(last < 0.5);
    }

    #[test]
    fn test_idle_workload_recovers_probability() {
        let mut t = OpenHashThrottler::new(0.10, Duration::from_secs(3600));
        let dt = Duration::from_millis(100);
        for _ in 0..30 {
            let now = Instant::now();
            t.on_hash(now, now + Duration::from_millis(50), SITE, 4096, 16);
            t.update(dt);
        }
        let throttled = t.hash_probability_for(SITE);

        let mut last = throttled;
        for _ in 0..200 {
            t.update(dt);
            let p = t.hash_probability_for(SITE);
            assert!(p + 1e-12 >= last, "probability must not fall when idle");
            last = p;
        }
        assert!(last > throttled);
        assert!(last > 0.9, "long idle stretch should recover toward 1.0");
    }

    #[test]
    fn test_should_hash_tracks_probability() {
        let mut t = OpenHashThrottler::new(0.10, Duration::from_secs(3600));
        // fresh site at probability 1.0 always hashes
        for _ in 0..100 {
            assert!(t.should_hash_for(SITE));
        }
    }
}
