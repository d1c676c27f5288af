//! Value conservation over many pseudo-random stake sequences.
//!
//! Sequences come from a fixed-seed generator so failures reproduce.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;

use peerwager::engine::RoundView;
use peerwager::types::{Amount, OutcomeCategory, RoundId, WagerError};

use crate::recording_gateway::Harness;

/// Small linear congruential generator; good enough to vary inputs.
struct Lcg(u64);

impl Lcg {
    fn next_u64(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next_u64() % n
    }
}

/// A stake's matched amount may grow as counterparties arrive but never
/// shrinks.
fn assert_shares_never_shrink(view: &RoundView, previous: &mut HashMap<String, Amount>) {
    for stake in &view.stakes {
        let before = previous.get(&stake.participant).copied().unwrap_or(0);
        assert!(
            stake.matched >= before,
            "{} matched dropped from {before} to {}",
            stake.participant,
            stake.matched
        );
        previous.insert(stake.participant.clone(), stake.matched);
    }
}

fn assert_pools_consistent(view: &RoundView) {
    for category in OutcomeCategory::ALL {
        let pool = view.pool(category).unwrap();
        let complement = view.pool(category.complement()).unwrap();
        assert_eq!(pool.matched, complement.matched, "{category} vs complement");
        assert!(pool.matched <= pool.staked);
        // Every new stake tops the pair up to the smaller side.
        assert_eq!(pool.matched, pool.staked.min(complement.staked));

        let apportioned: Amount = view
            .stakes
            .iter()
            .filter(|s| s.category == category)
            .map(|s| s.matched)
            .sum();
        assert_eq!(apportioned, pool.matched, "{category} apportionment drift");
    }
}

async fn run_round(seed: u64, fee_rate: Decimal) {
    let h = Harness::new(fee_rate);
    let mut rng = Lcg(seed);
    let round: RoundId = h.open_round().await;

    let participants = 2 + rng.below(30) as usize;
    let mut shares = HashMap::new();
    for i in 0..participants {
        let category = OutcomeCategory::ALL[rng.below(4) as usize];
        let whale = rng.below(5) == 0;
        let amount = 1 + rng.below(if whale { 100_000 } else { 97 });
        h.engine
            .place_stake(round, &format!("p{i}"), category, amount)
            .await
            .unwrap();
        let view = h.engine.round_view(round).await.unwrap();
        assert_pools_consistent(&view);
        assert_shares_never_shrink(&view, &mut shares);
    }

    let total_staked = h.engine.round_view(round).await.unwrap().round.total_staked;
    let outcome = rng.below(100) as u32;
    h.resolve(round, outcome).await;

    let mut paid: Amount = 0;
    let mut fees: Amount = 0;
    for i in 0..participants {
        let receipt = h.engine.settle(round, &format!("p{i}")).await.unwrap();
        paid += receipt.settlement.total();
        fees += receipt.settlement.fee;
    }

    assert_eq!(
        paid + fees,
        total_staked,
        "seed {seed}: paid {paid} + fees {fees} != staked {total_staked}"
    );
    assert_eq!(h.gateway.total_transferred(), paid);

    let statement = h.engine.round_statement(round).await.unwrap();
    assert!(statement.is_balanced(), "seed {seed}: {statement:?}");
    assert_eq!(statement.claimed, participants);
    assert_eq!(h.engine.round_view(round).await.unwrap().fees_collected, fees);
}

#[tokio::test]
async fn payouts_fees_and_refunds_sum_to_total_staked() {
    for seed in 1..=40 {
        run_round(seed, dec!(0.02)).await;
    }
}

#[tokio::test]
async fn conservation_holds_for_awkward_fee_rates() {
    for (seed, rate) in [(7, dec!(0)), (11, dec!(0.0333)), (13, dec!(0.5)), (17, dec!(0.999))] {
        run_round(seed, rate).await;
    }
}

#[tokio::test]
async fn late_stakes_never_reduce_earlier_matches() {
    let h = Harness::new(dec!(0.02));
    let round = h.open_round().await;
    let mut shares = HashMap::new();
    let sequence = [
        ("a", OutcomeCategory::Even, 10),
        ("x", OutcomeCategory::Odd, 10),
        ("b", OutcomeCategory::Even, 10),
        ("c", OutcomeCategory::Even, 100),
        ("y", OutcomeCategory::Odd, 1),
        ("z", OutcomeCategory::Odd, 500),
    ];
    for (who, category, amount) in sequence {
        h.engine.place_stake(round, who, category, amount).await.unwrap();
        let view = h.engine.round_view(round).await.unwrap();
        assert_pools_consistent(&view);
        assert_shares_never_shrink(&view, &mut shares);
    }

    let view = h.engine.round_view(round).await.unwrap();
    assert_eq!(view.stake("a").unwrap().matched, 10);
    // z fills the EVEN side completely.
    assert_eq!(view.pool(OutcomeCategory::Even).unwrap().matched, 120);
    assert_eq!(view.stake("b").unwrap().matched, 10);
    assert_eq!(view.stake("c").unwrap().matched, 100);
}

#[tokio::test]
async fn one_sided_round_refunds_everything() {
    let h = Harness::new(dec!(0.05));
    let round = h.open_round().await;
    for (i, amount) in [5u64, 17, 3].into_iter().enumerate() {
        h.engine
            .place_stake(round, &format!("even{i}"), OutcomeCategory::Even, amount)
            .await
            .unwrap();
    }
    h.resolve(round, 2).await;

    for i in 0..3 {
        let s = h.engine.settle(round, &format!("even{i}")).await.unwrap().settlement;
        assert_eq!(s.payout, 0);
        assert_eq!(s.fee, 0);
    }
    assert_eq!(h.gateway.total_transferred(), 25);
}

#[tokio::test]
async fn settle_before_resolution_is_rejected_without_mutation() {
    let h = Harness::new(dec!(0.02));
    let round = h.open_round().await;
    h.engine.place_stake(round, "p1", OutcomeCategory::Odd, 8).await.unwrap();

    assert_eq!(
        h.engine.settle(round, "p1").await,
        Err(WagerError::RoundNotFinalizedOrCancelled(round))
    );
    let view = h.engine.round_view(round).await.unwrap();
    assert!(!view.stake("p1").unwrap().claimed);
    assert_eq!(view.claims_settled, 0);
    assert!(h.gateway.transfers().is_empty());
}
