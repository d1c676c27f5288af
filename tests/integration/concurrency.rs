//! Concurrent placement and settlement across tasks.

use futures::future::join_all;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::Arc;

use peerwager::types::{Amount, OutcomeCategory, WagerError};

use crate::recording_gateway::Harness;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_stakes_on_opposite_sides_lose_nothing() {
    let h = Harness::new(dec!(0.02));
    let round = h.open_round().await;

    let tasks = (0..64u64).map(|i| {
        let engine = Arc::clone(&h.engine);
        let category = if i % 2 == 0 { OutcomeCategory::Even } else { OutcomeCategory::Odd };
        tokio::spawn(async move {
            engine
                .place_stake(round, &format!("p{i}"), category, 1 + i * 3)
                .await
        })
    });
    for result in join_all(tasks).await {
        result.unwrap().unwrap();
    }

    let view = h.engine.round_view(round).await.unwrap();
    let even = view.pool(OutcomeCategory::Even).unwrap();
    let odd = view.pool(OutcomeCategory::Odd).unwrap();
    let even_total: Amount = (0..64u64).filter(|i| i % 2 == 0).map(|i| 1 + i * 3).sum();
    let odd_total: Amount = (0..64u64).filter(|i| i % 2 == 1).map(|i| 1 + i * 3).sum();

    assert_eq!(even.staked, even_total);
    assert_eq!(odd.staked, odd_total);
    assert_eq!(even.matched, odd.matched);
    assert_eq!(even.matched, even_total.min(odd_total));
    assert_eq!(view.stakes.len(), 64);
    assert_eq!(
        view.stakes.iter().map(|s| s.matched).sum::<Amount>(),
        even.matched + odd.matched
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_participant_racing_twice_gets_one_stake() {
    let h = Harness::new(dec!(0.02));
    let round = h.open_round().await;

    let tasks = (0..8).map(|_| {
        let engine = Arc::clone(&h.engine);
        tokio::spawn(async move { engine.place_stake(round, "eager", OutcomeCategory::High, 10).await })
    });
    let results: Vec<_> = join_all(tasks).await.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, WagerError::DuplicateStake { .. })));
    assert_eq!(h.engine.round_view(round).await.unwrap().round.total_staked, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_settles_transfer_each_claim_once() {
    let h = Harness::new(dec!(0.02));
    let round = h.open_round().await;
    for i in 0..20u64 {
        let category = if i < 10 { OutcomeCategory::Low } else { OutcomeCategory::High };
        h.engine
            .place_stake(round, &format!("p{i}"), category, 10 + i)
            .await
            .unwrap();
    }
    h.resolve(round, 12).await;

    // Every participant settles three times at once.
    let tasks = (0..20u64).flat_map(|i| {
        let engine = Arc::clone(&h.engine);
        (0..3).map(move |_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.settle(round, &format!("p{i}")).await })
        })
    });
    let results: Vec<_> = join_all(tasks).await.into_iter().map(|r| r.unwrap()).collect();

    let settled: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(settled.len(), 20);
    let failures = results.iter().filter(|r| matches!(r, Err(WagerError::AlreadyClaimed { .. })));
    assert_eq!(failures.count(), 40);

    let transfers = h.gateway.transfers();
    let recipients: HashSet<_> = transfers.iter().map(|t| t.participant.clone()).collect();
    assert_eq!(recipients.len(), transfers.len());

    let statement = h.engine.round_statement(round).await.unwrap();
    assert!(statement.is_balanced());
    assert_eq!(statement.claimed, 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rounds_progress_independently() {
    let h = Harness::new(dec!(0.02));
    let rounds = join_all((0..5).map(|_| h.open_round())).await;

    let tasks = rounds.iter().flat_map(|&round| {
        let engine = Arc::clone(&h.engine);
        [("a", OutcomeCategory::Even, 7u64), ("b", OutcomeCategory::Odd, 3)]
            .into_iter()
            .map(move |(who, category, amount)| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move { engine.place_stake(round, who, category, amount).await })
            })
    });
    for result in join_all(tasks).await {
        result.unwrap().unwrap();
    }

    for round in rounds {
        let view = h.engine.round_view(round).await.unwrap();
        assert_eq!(view.round.total_staked, 10);
        assert_eq!(view.round.total_matched, 6);
    }
}
