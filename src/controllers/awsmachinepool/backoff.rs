use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

const INITIAL: Duration = Duration::from_secs(5);
const MAX: Duration = Duration::from_secs(5 * 60);

/// Per-object exponential requeue delays for failed reconciles
pub struct Backoff<K> {
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Hash + Eq> Default for Backoff<K> {
    fn default() -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Hash + Eq> Backoff<K> {
    /// Records a failure of `key` and returns how long to wait before retrying it.
    pub fn next(&self, key: K) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let attempt = failures.entry(key).or_insert(0);
        let delay = INITIAL
            .checked_mul(2u32.saturating_pow(*attempt))
            .map_or(MAX, |d| d.min(MAX));
        *attempt = attempt.saturating_add(1);
        delay
    }

    pub fn reset(&self, key: &K) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Forgets every key for which `keep` is false, eg objects that were deleted while failing.
    pub fn retain(&self, mut keep: impl FnMut(&K) -> bool) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|key, _| keep(key));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.failures.lock().unwrap().len()
    }
}
