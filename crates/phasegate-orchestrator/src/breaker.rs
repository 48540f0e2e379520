//! Cost circuit breaker
//!
//! Converts reported token usage into spend against a workflow's
//! [`BudgetLedger`], raising each warning threshold once and tripping to
//! `Suspended` when the budget is exhausted.
//!
//! # States
//!
//! - **Closed**: spend below every threshold, dispatch allowed
//! - **Warning**: at least one threshold crossed, dispatch still allowed
//! - **Suspended**: budget exhausted, no new dispatch until reset
//!
//! # Example
//!
//! ```
//! use phasegate_core::{BudgetLedger, BreakerState, PhasegateConfig};
//! use phasegate_orchestrator::{BreakerEvent, CostBreaker};
//!
//! let breaker = CostBreaker::new(PhasegateConfig::default().pricing);
//! let mut ledger = BudgetLedger::new(1.0);
//!
//! // 100k sonnet output tokens: $1.50 against a $1.00 budget
//! let events = breaker.record_spend(&mut ledger, "sonnet", 0, 100_000);
//! assert!(matches!(events.last(), Some(BreakerEvent::Break { .. })));
//! assert_eq!(ledger.breaker_state, BreakerState::Suspended);
//! ```

use phasegate_core::{BreakerState, BudgetLedger, TierPrice};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Events raised by a single spend
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerEvent {
    /// A threshold was crossed for the first time
    Warning {
        threshold: f64,
        spent_usd: f64,
        budget_usd: f64,
    },
    /// The budget is exhausted; the workflow is now suspended
    Break { spent_usd: f64, budget_usd: f64 },
}

/// Tier price table plus the spend accounting rules
#[derive(Debug, Clone)]
pub struct CostBreaker {
    prices: BTreeMap<String, TierPrice>,
}

impl CostBreaker {
    pub fn new(prices: BTreeMap<String, TierPrice>) -> Self {
        Self { prices }
    }

    /// Price for a tier; unknown tiers are charged at the most expensive known rate
    pub fn price_for(&self, tier: &str) -> TierPrice {
        if let Some(price) = self.prices.get(tier) {
            return *price;
        }

        let fallback = self
            .prices
            .values()
            .copied()
            .max_by(|a, b| {
                (a.input_per_million + a.output_per_million)
                    .total_cmp(&(b.input_per_million + b.output_per_million))
            })
            .unwrap_or(TierPrice::new(0.0, 0.0));
        warn!(
            tier,
            input_per_million = fallback.input_per_million,
            output_per_million = fallback.output_per_million,
            "Unknown worker tier, charging the most expensive rate"
        );
        fallback
    }

    pub fn cost(&self, tier: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        self.price_for(tier).cost(input_tokens, output_tokens)
    }

    /// Charge token usage to the ledger and return the events it caused
    pub fn record_spend(
        &self,
        ledger: &mut BudgetLedger,
        tier: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Vec<BreakerEvent> {
        let cost = self.cost(tier, input_tokens, output_tokens);
        debug!(tier, input_tokens, output_tokens, cost, "Recording spend");
        record_cost(ledger, cost)
    }

    /// Close the breaker so dispatch can resume.
    ///
    /// Spend and emitted warnings are kept; the next spend that is still over
    /// budget trips it again.
    pub fn reset(&self, ledger: &mut BudgetLedger) {
        info!(
            spent_usd = ledger.spent_usd,
            budget_usd = ledger.budget_usd,
            "Breaker reset"
        );
        ledger.breaker_state = BreakerState::Closed;
    }
}

/// Apply a USD amount to the ledger
pub fn record_cost(ledger: &mut BudgetLedger, cost_usd: f64) -> Vec<BreakerEvent> {
    ledger.spent_usd += cost_usd.max(0.0);
    let fraction = ledger.fraction();
    let mut events = Vec::new();

    let thresholds = ledger.thresholds.clone();
    for threshold in thresholds {
        if fraction >= threshold && !ledger.warning_emitted(threshold) {
            ledger.warnings_emitted.push(threshold);
            warn!(
                threshold,
                spent_usd = ledger.spent_usd,
                budget_usd = ledger.budget_usd,
                "Budget threshold crossed"
            );
            events.push(BreakerEvent::Warning {
                threshold,
                spent_usd: ledger.spent_usd,
                budget_usd: ledger.budget_usd,
            });
        }
    }

    if !events.is_empty() && ledger.breaker_state == BreakerState::Closed {
        ledger.breaker_state = BreakerState::Warning;
    }

    if fraction >= 1.0 && ledger.breaker_state != BreakerState::Suspended {
        ledger.breaker_state = BreakerState::Suspended;
        warn!(
            spent_usd = ledger.spent_usd,
            budget_usd = ledger.budget_usd,
            "Budget exhausted, breaker tripped"
        );
        events.push(BreakerEvent::Break {
            spent_usd: ledger.spent_usd,
            budget_usd: ledger.budget_usd,
        });
    }

    events
}
