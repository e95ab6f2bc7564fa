//! Edge-triggered low-content alerting: one alert when a destination drops
//! below the threshold, none while it stays there, re-armed on recovery.
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Default)]
pub struct LowContentMonitor {
    warned: HashSet<String>,
}

impl LowContentMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare per-destination totals against the threshold. Returns the
    /// destinations that just crossed below it (and should be alerted);
    /// destinations that recovered are silently re-armed.
    pub fn check(
        &mut self,
        counts: &BTreeMap<String, usize>,
        threshold: usize,
    ) -> Vec<(String, usize)> {
        let mut newly_low = Vec::new();
        for (dest, &count) in counts {
            if count < threshold {
                if self.warned.insert(dest.clone()) {
                    newly_low.push((dest.clone(), count));
                }
            } else {
                self.warned.remove(dest);
            }
        }
        // Destinations that disappeared from the counts re-arm as well.
        self.warned.retain(|dest| counts.contains_key(dest));
        newly_low
    }
}
