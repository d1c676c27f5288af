//! End-to-end lifecycle scenarios driven through the public `Engine` API.

use chrono::Duration;
use rust_decimal_macros::dec;
use tokio_test::{assert_err, assert_ok};

use peerwager::engine::lifecycle::Resolution;
use peerwager::engine::TransferStatus;
use peerwager::types::{EngineEvent, OutcomeCategory, RoundState, Settlement, WagerError};

use crate::recording_gateway::{Harness, SOURCES};

#[tokio::test]
async fn two_to_one_stakes_odd_wins() {
    let h = Harness::new(dec!(0.02));
    let round = h.open_round().await;

    assert_ok!(h.engine.place_stake(round, "p1", OutcomeCategory::Even, 2).await);
    assert_ok!(h.engine.place_stake(round, "p2", OutcomeCategory::Odd, 1).await);

    let view = h.engine.round_view(round).await.unwrap();
    assert_eq!(view.pool(OutcomeCategory::Even).unwrap().matched, 1);
    assert_eq!(view.pool(OutcomeCategory::Odd).unwrap().matched, 1);
    assert_eq!(view.stake("p1").unwrap().matched, 1);
    assert_eq!(view.stake("p1").unwrap().unmatched(), 1);

    h.resolve(round, 7).await;

    let p2 = h.engine.settle(round, "p2").await.unwrap();
    // gross = 1 + floor(1 * 1 / 1) = 2; fee = floor(2 * 0.02) = 0
    assert_eq!(p2.settlement, Settlement { payout: 2, fee: 0, refund: 0, won: true });

    let p1 = h.engine.settle(round, "p1").await.unwrap();
    assert_eq!(p1.settlement, Settlement { payout: 0, fee: 0, refund: 1, won: false });
    assert!(matches!(p1.transfer, TransferStatus::Completed(ref r) if r.amount == 1));

    assert_eq!(h.gateway.total_transferred(), 3);
    assert!(h.engine.round_statement(round).await.unwrap().is_balanced());
}

#[tokio::test]
async fn two_of_three_reports_agree() {
    let h = Harness::new(dec!(0.02));
    let round = h.open_round().await;
    h.clock.set(h.resolution_time());

    assert_eq!(h.engine.submit_report(round, SOURCES[0], 7).await, Ok(None));
    assert_eq!(h.engine.submit_report(round, SOURCES[1], 9).await, Ok(None));
    let result = h.engine.submit_report(round, SOURCES[2], 7).await.unwrap().unwrap();
    assert_eq!(result.value, 7);
    assert_eq!(result.sources, vec![SOURCES[0].to_string(), SOURCES[2].to_string()]);

    let view = h.engine.round_view(round).await.unwrap();
    assert_eq!(view.round.state, RoundState::Finalized);
    assert_eq!(view.round.outcome, Some(7));
    assert_eq!(view.reports.len(), 3);
}

#[tokio::test]
async fn late_report_after_quorum_is_rejected() {
    let h = Harness::new(dec!(0.02));
    let round = h.open_round().await;
    h.resolve(round, 7).await;

    assert_eq!(
        h.engine.submit_report(round, SOURCES[2], 9).await,
        Err(WagerError::RoundAlreadyFinalized(round))
    );
    assert_eq!(h.engine.round_view(round).await.unwrap().round.outcome, Some(7));
}

#[tokio::test]
async fn disagreement_past_dispute_window_cancels_and_refunds() {
    let h = Harness::new(dec!(0.02));
    let mut events = h.engine.subscribe();
    let round = h.open_round().await;
    h.engine.place_stake(round, "p1", OutcomeCategory::Even, 40).await.unwrap();
    h.engine.place_stake(round, "p2", OutcomeCategory::Odd, 25).await.unwrap();
    h.engine.place_stake(round, "p3", OutcomeCategory::High, 13).await.unwrap();

    h.clock.set(h.resolution_time());
    h.engine.submit_report(round, SOURCES[0], 7).await.unwrap();
    h.engine.submit_report(round, SOURCES[1], 9).await.unwrap();

    h.clock.advance(h.dispute_window() - Duration::seconds(1));
    let waiting = h.engine.finalize_or_cancel(round).await.unwrap();
    assert_eq!(waiting.resolution, Resolution::AwaitingOutcome);

    h.clock.advance(Duration::seconds(1));
    let step = h.engine.finalize_or_cancel(round).await.unwrap();
    assert_eq!(step.resolution, Resolution::Cancelled);

    // Calling again changes nothing.
    let again = h.engine.finalize_or_cancel(round).await.unwrap();
    assert_eq!(again.resolution, Resolution::AlreadyResolved(RoundState::Cancelled));

    for (who, staked) in [("p1", 40), ("p2", 25), ("p3", 13)] {
        let receipt = h.engine.settle(round, who).await.unwrap();
        assert_eq!(receipt.settlement.payout, 0);
        assert_eq!(receipt.settlement.refund, staked);
    }
    assert_eq!(h.gateway.total_transferred(), 78);

    let mut cancelled = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, EngineEvent::RoundCancelled { .. }) {
            cancelled += 1;
        }
    }
    assert_eq!(cancelled, 1);
}

#[tokio::test]
async fn stake_after_lock_time_is_rejected() {
    let h = Harness::new(dec!(0.02));
    let round = h.open_round().await;
    h.engine.place_stake(round, "p1", OutcomeCategory::Low, 30).await.unwrap();
    let before = h.engine.round_view(round).await.unwrap();

    h.clock.set(h.lock_time());
    assert_eq!(
        h.engine.place_stake(round, "p2", OutcomeCategory::High, 30).await,
        Err(WagerError::PastLockTime(round))
    );

    let after = h.engine.round_view(round).await.unwrap();
    assert_eq!(after.pools, before.pools);
    assert_eq!(after.stakes, before.stakes);

    // Once locked by the scheduler the round reports itself as closed.
    assert_eq!(h.engine.lock_round(round).await, Ok(true));
    assert_eq!(
        h.engine.place_stake(round, "p2", OutcomeCategory::High, 30).await,
        Err(WagerError::RoundNotOpen(round))
    );
}

#[tokio::test]
async fn racing_settles_pay_once() {
    let h = Harness::new(dec!(0.02));
    let round = h.open_round().await;
    h.engine.place_stake(round, "winner", OutcomeCategory::High, 50).await.unwrap();
    h.engine.place_stake(round, "loser", OutcomeCategory::Low, 50).await.unwrap();
    h.resolve(round, 80).await;

    let (a, b) = tokio::join!(
        h.engine.settle(round, "winner"),
        h.engine.settle(round, "winner")
    );
    let (ok, err) = match (a, b) {
        (Ok(ok), Err(err)) | (Err(err), Ok(ok)) => (ok, err),
        other => panic!("expected exactly one success, got {other:?}"),
    };
    assert_eq!(ok.settlement.payout, 98);
    assert_eq!(ok.settlement.fee, 2);
    assert_eq!(
        err,
        WagerError::AlreadyClaimed { round, participant: "winner".into() }
    );
    assert_eq!(h.gateway.transfers_to("winner").len(), 1);
}

#[tokio::test]
async fn dispute_then_fresh_consensus() {
    let h = Harness::new(dec!(0.02));
    let round = h.open_round().await;
    h.engine.place_stake(round, "e", OutcomeCategory::Even, 10).await.unwrap();
    h.engine.place_stake(round, "o", OutcomeCategory::Odd, 10).await.unwrap();
    h.resolve(round, 4).await;

    h.clock.advance(Duration::minutes(10));
    assert_ok!(h.engine.dispute_outcome(round, "operator").await);
    assert_err!(h.engine.settle(round, "e").await);

    h.engine.submit_report(round, SOURCES[1], 5).await.unwrap();
    let result = h.engine.submit_report(round, SOURCES[2], 5).await.unwrap().unwrap();
    assert_eq!(result.value, 5);

    let o = h.engine.settle(round, "o").await.unwrap();
    assert!(o.settlement.won);
    assert_eq!(o.settlement.total(), 20);
}

#[tokio::test]
async fn failed_transfer_does_not_reopen_claim() {
    let h = Harness::new(dec!(0.02));
    let round = h.open_round().await;
    h.engine.place_stake(round, "p1", OutcomeCategory::Even, 10).await.unwrap();
    h.engine.cancel_round(round, "draw postponed").await.unwrap();

    h.gateway.set_error("ledger unavailable");
    let receipt = h.engine.settle(round, "p1").await.unwrap();
    assert_eq!(receipt.transfer, TransferStatus::Failed("ledger unavailable".into()));
    assert!(h.gateway.transfers().is_empty());

    assert!(matches!(
        h.engine.settle(round, "p1").await,
        Err(WagerError::AlreadyClaimed { .. })
    ));
}
