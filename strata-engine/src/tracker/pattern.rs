//! Decaying frequency and co-occurrence statistics
//!
//! Weights decay exponentially with a fixed half-life and are stored together
//! with the instant they were last brought up to date, so decay is applied
//! lazily when a weight is touched or read.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Accesses kept for co-occurrence matching
const RECENT_LIMIT: usize = 64;

/// Share of a bound retained after an eviction pass
const RETAIN_RATIO: f64 = 0.9;

#[derive(Debug, Clone, Copy)]
struct Decayed {
    weight: f64,
    updated: Instant,
}

impl Decayed {
    fn new(now: Instant) -> Self {
        Self {
            weight: 0.0,
            updated: now,
        }
    }

    fn value_at(&self, now: Instant, half_life: f64) -> f64 {
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        self.weight * 0.5f64.powf(elapsed / half_life)
    }

    fn bump(&mut self, now: Instant, half_life: f64) {
        self.weight = self.value_at(now, half_life) + 1.0;
        self.updated = now;
    }
}

/// A key likely to be accessed next
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub key: String,
    /// Decayed pair weight over decayed source frequency, capped at 1
    pub confidence: f64,
}

pub struct PatternTable {
    half_life: f64,
    window: Duration,
    max_pairs: usize,
    max_keys: usize,
    keys: HashMap<String, Decayed>,
    pairs: HashMap<(String, String), Decayed>,
    /// source key -> targets with a pair entry
    outgoing: HashMap<String, HashSet<String>>,
    recent: VecDeque<(String, Instant)>,
}

impl PatternTable {
    pub fn new(half_life: Duration, window: Duration, max_pairs: usize, max_keys: usize) -> Self {
        Self {
            half_life: half_life.as_secs_f64().max(f64::EPSILON),
            window,
            max_pairs: max_pairs.max(1),
            max_keys: max_keys.max(1),
            keys: HashMap::new(),
            pairs: HashMap::new(),
            outgoing: HashMap::new(),
            recent: VecDeque::new(),
        }
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    /// Decayed access frequency of `key`
    pub fn frequency(&self, key: &str, now: Instant) -> f64 {
        self.keys
            .get(key)
            .map_or(0.0, |d| d.value_at(now, self.half_life))
    }

    /// Record an access to `key` at `at`
    pub fn record(&mut self, key: &str, at: Instant) {
        let half_life = self.half_life;
        self.keys
            .entry(key.to_string())
            .or_insert_with(|| Decayed::new(at))
            .bump(at, half_life);

        while let Some((_, seen)) = self.recent.front() {
            if at.saturating_duration_since(*seen) > self.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }

        let sources: HashSet<String> = self
            .recent
            .iter()
            .filter(|(prev, _)| prev != key)
            .map(|(prev, _)| prev.clone())
            .collect();
        for source in sources {
            self.outgoing
                .entry(source.clone())
                .or_default()
                .insert(key.to_string());
            self.pairs
                .entry((source, key.to_string()))
                .or_insert_with(|| Decayed::new(at))
                .bump(at, half_life);
        }

        self.recent.push_back((key.to_string(), at));
        if self.recent.len() > RECENT_LIMIT {
            self.recent.pop_front();
        }

        if self.pairs.len() > self.max_pairs {
            self.evict_pairs(at);
        }
        if self.keys.len() > self.max_keys {
            self.evict_keys(at);
        }
    }

    /// Drop everything learned about `key`
    pub fn forget(&mut self, key: &str) {
        self.keys.remove(key);
        self.recent.retain(|(k, _)| k != key);
        if let Some(targets) = self.outgoing.remove(key) {
            for target in targets {
                self.pairs.remove(&(key.to_string(), target));
            }
        }
        self.pairs.retain(|(_, target), _| target != key);
        for targets in self.outgoing.values_mut() {
            targets.remove(key);
        }
        self.outgoing.retain(|_, targets| !targets.is_empty());
    }

    /// Ranked predictions following an access to `key`
    pub fn predict(
        &self,
        key: &str,
        limit: usize,
        min_confidence: f64,
        now: Instant,
    ) -> Vec<Prediction> {
        let source = self.frequency(key, now);
        if source <= 0.0 || limit == 0 {
            return Vec::new();
        }
        let Some(targets) = self.outgoing.get(key) else {
            return Vec::new();
        };

        let mut predictions: Vec<Prediction> = targets
            .iter()
            .filter_map(|target| {
                let pair = self.pairs.get(&(key.to_string(), target.clone()))?;
                let confidence = (pair.value_at(now, self.half_life) / source).min(1.0);
                (confidence >= min_confidence).then(|| Prediction {
                    key: target.clone(),
                    confidence,
                })
            })
            .collect();

        predictions.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.key.cmp(&b.key))
        });
        predictions.truncate(limit);
        predictions
    }

    /// Evict the least-correlated pairs down to the retained share of the bound
    fn evict_pairs(&mut self, now: Instant) {
        let keep = ((self.max_pairs as f64 * RETAIN_RATIO) as usize).max(1);
        let mut ranked: Vec<((String, String), f64)> = self
            .pairs
            .iter()
            .map(|(pair, d)| (pair.clone(), d.value_at(now, self.half_life)))
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
        let excess = ranked.len().saturating_sub(keep);
        for ((source, target), _) in ranked.into_iter().take(excess) {
            self.pairs.remove(&(source.clone(), target.clone()));
            if let Some(targets) = self.outgoing.get_mut(&source) {
                targets.remove(&target);
                if targets.is_empty() {
                    self.outgoing.remove(&source);
                }
            }
        }
    }

    /// Evict the coldest keys together with their outgoing pairs
    fn evict_keys(&mut self, now: Instant) {
        let keep = ((self.max_keys as f64 * RETAIN_RATIO) as usize).max(1);
        let mut ranked: Vec<(String, f64)> = self
            .keys
            .iter()
            .map(|(key, d)| (key.clone(), d.value_at(now, self.half_life)))
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
        let excess = ranked.len().saturating_sub(keep);
        for (key, _) in ranked.into_iter().take(excess) {
            self.keys.remove(&key);
            if let Some(targets) = self.outgoing.remove(&key) {
                for target in targets {
                    self.pairs.remove(&(key.clone(), target));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PatternTable {
        PatternTable::new(
            Duration::from_secs(60),
            Duration::from_secs(2),
            1_000,
            1_000,
        )
    }

    #[test]
    fn test_frequency_decays_by_half_life() {
        let mut table = table();
        let t0 = Instant::now();
        table.record("a", t0);
        table.record("a", t0);
        assert!((table.frequency("a", t0) - 2.0).abs() < 1e-9);

        let later = t0 + Duration::from_secs(60);
        assert!((table.frequency("a", later) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cooccurrence_within_window_only() {
        let mut table = table();
        let t0 = Instant::now();
        table.record("user:1", t0);
        table.record("profile:1", t0 + Duration::from_millis(100));
        table.record("far", t0 + Duration::from_secs(10));

        let now = t0 + Duration::from_secs(10);
        let predictions = table.predict("user:1", 5, 0.0, now);
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].key, "profile:1");
        assert!(table.predict("profile:1", 5, 0.0, now).is_empty());
    }

    #[test]
    fn test_predictions_ranked_and_filtered() {
        let mut table = table();
        let mut t = Instant::now();
        for i in 0..4 {
            table.record("a", t);
            table.record("b", t + Duration::from_millis(10));
            if i == 0 {
                table.record("c", t + Duration::from_millis(20));
            }
            t += Duration::from_secs(5);
        }

        let predictions = table.predict("a", 5, 0.0, t);
        assert_eq!(predictions[0].key, "b");
        assert!(predictions[0].confidence > predictions[1].confidence);

        let confident = table.predict("a", 5, 0.5, t);
        assert_eq!(confident.len(), 1);
        assert_eq!(table.predict("a", 0, 0.0, t), Vec::new());
    }

    #[test]
    fn test_pair_bound_evicts_weakest() {
        let mut table = PatternTable::new(
            Duration::from_secs(60),
            Duration::from_secs(60),
            10,
            1_000,
        );
        let t0 = Instant::now();
        // strong pair
        for i in 0..5 {
            let t = t0 + Duration::from_millis(i * 100);
            table.record("hot", t);
            table.record("next", t + Duration::from_millis(1));
        }
        for i in 0..30u64 {
            table.record(&format!("noise{}", i), t0 + Duration::from_millis(1_000 + i));
        }

        assert!(table.pair_count() <= 10);
        let now = t0 + Duration::from_secs(2);
        assert_eq!(table.predict("hot", 1, 0.0, now)[0].key, "next");
    }

    #[test]
    fn test_forget_removes_pairs() {
        let mut table = table();
        let t0 = Instant::now();
        table.record("a", t0);
        table.record("b", t0);
        table.forget("b");
        assert!(table.predict("a", 5, 0.0, t0).is_empty());
        assert_eq!(table.frequency("b", t0), 0.0);
    }
}
