//! Token budgets — deterministic accounting for admission and congestion.
//!
//! Each agent holds a deficit bucket refilled at its current rate (a share
//! of the global tokens-per-minute budget); tools share one bucket. Rates
//! adapt: additive increase on successful backend calls, multiplicative
//! decrease on throttling signals. All arithmetic happens inline in the
//! pump loop; nothing here suspends.

use std::collections::HashMap;
use std::time::Duration;

/// Tokens/min added back per successful call.
const ADDITIVE_STEP: f64 = 500.0;
/// Rate floor after repeated throttling.
const MIN_RATE: f64 = 1_000.0;
/// Fraction of the global budget reserved for the tool bucket.
const TOOL_SHARE: f64 = 0.25;

/// Bucket key for all tool traffic.
pub const TOOL_BUCKET: &str = "";

#[derive(Debug, Clone)]
struct Bucket {
    /// Configured share of the global budget (weight).
    share: f64,
    /// Current refill rate, tokens/min.
    rate: f64,
    /// Spendable tokens right now.
    deficit: f64,
}

impl Bucket {
    fn new(share: f64, global_rate: f64) -> Self {
        let rate = (share * global_rate).max(MIN_RATE);
        Self {
            share,
            rate,
            // Start with one full minute of burst.
            deficit: rate,
        }
    }

    fn refill(&mut self, elapsed: Duration) {
        let gained = self.rate * elapsed.as_secs_f64() / 60.0;
        // Burst cap: one minute of rate.
        self.deficit = (self.deficit + gained).min(self.rate);
    }
}

/// The pump's budget ledger.
#[derive(Debug)]
pub struct BudgetBook {
    global_rate: f64,
    global_deficit: f64,
    buckets: HashMap<String, Bucket>,
}

impl BudgetBook {
    pub fn new(tokens_per_minute: f64) -> Self {
        let mut buckets = HashMap::new();
        buckets.insert(
            TOOL_BUCKET.to_string(),
            Bucket::new(TOOL_SHARE, tokens_per_minute),
        );
        Self {
            global_rate: tokens_per_minute,
            global_deficit: tokens_per_minute,
            buckets,
        }
    }

    /// Register an agent bucket with its configured share.
    pub fn add_agent(&mut self, name: &str, share: f64) {
        self.buckets
            .insert(name.to_string(), Bucket::new(share, self.global_rate));
    }

    pub fn remove_agent(&mut self, name: &str) {
        if name != TOOL_BUCKET {
            self.buckets.remove(name);
        }
    }

    /// Periodic refill from the pump tick.
    pub fn refill(&mut self, elapsed: Duration) {
        let gained = self.global_rate * elapsed.as_secs_f64() / 60.0;
        self.global_deficit = (self.global_deficit + gained).min(self.global_rate);
        for bucket in self.buckets.values_mut() {
            bucket.refill(elapsed);
        }
    }

    /// Whether a message of `cost` tokens fits the bucket and the global
    /// budget right now.
    pub fn can_admit(&self, bucket: &str, cost: u32) -> bool {
        let cost = cost as f64;
        if cost > self.global_deficit {
            return false;
        }
        self.buckets
            .get(bucket)
            .map(|b| cost <= b.deficit)
            .unwrap_or(false)
    }

    /// Deduct an admitted message's cost.
    pub fn admit(&mut self, bucket: &str, cost: u32) -> bool {
        if !self.can_admit(bucket, cost) {
            return false;
        }
        let cost = cost as f64;
        self.global_deficit -= cost;
        if let Some(b) = self.buckets.get_mut(bucket) {
            b.deficit -= cost;
        }
        true
    }

    /// Additive increase after a successful backend call.
    pub fn on_success(&mut self, bucket: &str) {
        if let Some(b) = self.buckets.get_mut(bucket) {
            let cap = (b.share * self.global_rate).max(MIN_RATE) * 2.0;
            b.rate = (b.rate + ADDITIVE_STEP).min(cap);
        }
    }

    /// Multiplicative decrease on a throttling signal. The offender's cost
    /// is refunded so the message can be requeued.
    pub fn on_throttle(&mut self, bucket: &str, refund: u32) {
        self.global_deficit = (self.global_deficit + refund as f64).min(self.global_rate);
        if let Some(b) = self.buckets.get_mut(bucket) {
            b.rate = (b.rate / 2.0).max(MIN_RATE);
            b.deficit = (b.deficit + refund as f64).min(b.rate);
        }
    }

    pub fn rate_of(&self, bucket: &str) -> Option<f64> {
        self.buckets.get(bucket).map(|b| b.rate)
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.buckets.contains_key(bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_deducts_both_ledgers() {
        let mut book = BudgetBook::new(60_000.0);
        book.add_agent("researcher", 0.5);

        assert!(book.admit("researcher", 10_000));
        // 30k share minus 10k spent.
        assert!(book.can_admit("researcher", 20_000));
        assert!(!book.can_admit("researcher", 21_000));
    }

    #[test]
    fn global_budget_binds_all_buckets() {
        let mut book = BudgetBook::new(10_000.0);
        book.add_agent("a", 1.0);
        book.add_agent("b", 1.0);

        assert!(book.admit("a", 9_000));
        // b's own bucket could afford it, the global one can't.
        assert!(!book.can_admit("b", 5_000));
    }

    #[test]
    fn refill_is_rate_proportional_and_capped() {
        let mut book = BudgetBook::new(60_000.0);
        book.add_agent("a", 0.5);
        assert!(book.admit("a", 30_000));
        assert!(!book.can_admit("a", 1_000));

        // Half a minute at 30k/min restores 15k.
        book.refill(Duration::from_secs(30));
        assert!(book.can_admit("a", 15_000));
        assert!(!book.can_admit("a", 16_000));

        // Refilling forever never exceeds one minute of burst.
        for _ in 0..100 {
            book.refill(Duration::from_secs(60));
        }
        assert!(book.can_admit("a", 30_000));
        assert!(!book.can_admit("a", 31_000));
    }

    #[test]
    fn throttle_halves_rate_success_recovers() {
        let mut book = BudgetBook::new(60_000.0);
        book.add_agent("a", 0.5);
        let before = book.rate_of("a").unwrap();

        book.on_throttle("a", 0);
        assert_eq!(book.rate_of("a").unwrap(), before / 2.0);

        book.on_success("a");
        assert_eq!(book.rate_of("a").unwrap(), before / 2.0 + 500.0);
    }

    #[test]
    fn throttle_refunds_cost() {
        let mut book = BudgetBook::new(60_000.0);
        book.add_agent("a", 0.5);
        assert!(book.admit("a", 30_000));
        assert!(!book.can_admit("a", 1_000));

        book.on_throttle("a", 30_000);
        // Refund capped by the new halved rate.
        assert!(book.can_admit("a", 15_000));
    }

    #[test]
    fn rate_never_drops_below_floor() {
        let mut book = BudgetBook::new(60_000.0);
        book.add_agent("a", 0.1);
        for _ in 0..20 {
            book.on_throttle("a", 0);
        }
        assert_eq!(book.rate_of("a").unwrap(), 1_000.0);
    }

    #[test]
    fn tool_bucket_always_present() {
        let book = BudgetBook::new(60_000.0);
        assert!(book.has_bucket(TOOL_BUCKET));
        assert!(book.can_admit(TOOL_BUCKET, 1_000));
    }

    #[test]
    fn unknown_bucket_never_admits() {
        let book = BudgetBook::new(60_000.0);
        assert!(!book.can_admit("ghost", 1));
    }
}
