mod common;

use common::*;
use txsync_core::{Category, ResourceKey, TimeRange, TransactionFilter};
use txsync_engine::{EngineOptions, RemoteError, Severity};
use txsync_persistence::{RangeTracker, TransactionStore};

#[tokio::test]
async fn later_window_only_fetches_the_uncovered_tail() {
    let explorer = FakeExplorer::new(2);
    explorer.add_transactions([tx(1, 1100), tx(2, 1300), tx(3, 1800)]);
    let h = harness(explorer);

    let report = h.engine.sync_address(ACCOUNT, 1000, 2000).await.unwrap();
    assert!(report.is_complete());
    let base = report.category(Category::BaseTx).unwrap();
    assert_eq!(base.batches_committed, 2);
    assert_eq!(base.records_stored, 3);
    assert_eq!(
        coverage(&*h.store, Category::BaseTx),
        vec![TimeRange::new(1000, 2000)]
    );

    // Watermark follows each stored batch before the window is closed.
    let base_ops: Vec<StoreOp> = h
        .store
        .ops()
        .into_iter()
        .filter(|op| match op {
            StoreOp::Commit(c, ..) | StoreOp::MarkCovered(c, _) => *c == Category::BaseTx,
            StoreOp::PutTransactions(..) => false,
        })
        .collect();
    assert_eq!(
        base_ops,
        vec![
            StoreOp::Commit(
                Category::BaseTx,
                vec![hash(1), hash(2)],
                Some(TimeRange::new(1000, 1300))
            ),
            StoreOp::Commit(
                Category::BaseTx,
                vec![hash(3)],
                Some(TimeRange::new(1000, 1800))
            ),
            StoreOp::MarkCovered(Category::BaseTx, TimeRange::new(1000, 2000)),
        ]
    );

    h.explorer.clear_calls();
    h.engine.sync_address(ACCOUNT, 1500, 2500).await.unwrap();
    let base_calls: Vec<_> = h
        .explorer
        .range_calls()
        .into_iter()
        .filter(|(c, _)| *c == Category::BaseTx)
        .collect();
    assert_eq!(
        base_calls,
        vec![(Category::BaseTx, TimeRange::new(2001, 2500))]
    );
    assert_eq!(
        coverage(&*h.store, Category::BaseTx),
        vec![TimeRange::new(1000, 2500)]
    );
}

#[tokio::test]
async fn repeated_sync_issues_no_fetches() {
    let explorer = FakeExplorer::new(10);
    explorer.add_transactions([tx(1, 1100)]);
    explorer.add_internal([internal(1, 0, 1100)]);
    let h = harness(explorer);

    h.engine.sync_address(ACCOUNT, 1000, 2000).await.unwrap();
    h.explorer.clear_calls();

    let report = h.engine.sync_address(ACCOUNT, 1000, 2000).await.unwrap();
    assert!(h.explorer.calls().is_empty());
    assert!(report.categories.iter().all(|c| c.gaps_found == 0));
    assert_eq!(report.records_stored(), 0);
}

#[tokio::test]
async fn empty_window_is_still_covered() {
    let h = harness(FakeExplorer::new(10));

    let report = h.engine.sync_address(ACCOUNT, 1000, 2000).await.unwrap();
    assert!(report.is_complete());
    for category in Category::ALL {
        assert_eq!(
            coverage(&*h.store, category),
            vec![TimeRange::new(1000, 2000)]
        );
    }
    assert!(!h
        .store
        .ops()
        .iter()
        .any(|op| matches!(op, StoreOp::Commit(..))));
}

#[tokio::test]
async fn inverted_window_does_nothing() {
    let h = harness(FakeExplorer::new(10));

    let report = h.engine.sync_address(ACCOUNT, 2000, 1000).await.unwrap();
    assert!(report.categories.is_empty());
    assert!(h.explorer.calls().is_empty());
    assert!(h.store.ops().is_empty());
}

#[tokio::test]
async fn failed_page_keeps_the_last_stored_watermark() {
    let explorer = FakeExplorer::new(2);
    explorer.add_transactions([tx(1, 1100), tx(2, 1300), tx(3, 1800), tx(4, 2500)]);
    explorer.fail_after_pages(Category::BaseTx, 1);
    let h = harness(explorer);

    let report = h.engine.sync_address(ACCOUNT, 1000, 5000).await.unwrap();
    let base = report.category(Category::BaseTx).unwrap();
    let failure = base.failure.as_ref().unwrap();
    assert_eq!(failure.window, TimeRange::new(1000, 5000));
    assert!(matches!(failure.error, RemoteError::Unavailable(_)));
    assert_eq!(base.gaps_completed, 0);

    let key = ResourceKey::new(Category::BaseTx, ACCOUNT);
    assert_eq!(
        h.store.coverage(&key).unwrap(),
        vec![TimeRange::new(1000, 1300)]
    );
    assert_eq!(
        h.store.gaps(&key, 1000, 5000).unwrap(),
        vec![TimeRange::new(1301, 5000)]
    );
    assert!(h.store.has_transaction(&hash(2)).unwrap());
    assert!(!h.store.has_transaction(&hash(3)).unwrap());

    // The other categories are independent of the failed one.
    assert!(report.category(Category::InternalTx).unwrap().is_complete());
    assert_eq!(
        coverage(&*h.store, Category::TokenTx),
        vec![TimeRange::new(1000, 5000)]
    );

    let messages = h.sink.drain();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].severity, Severity::Error);
    assert!(messages[0].text.contains(&ACCOUNT.to_string()));
    assert!(messages[0].text.contains("[1000, 5000]"));

    h.explorer.heal();
    h.explorer.clear_calls();
    let report = h.engine.sync_address(ACCOUNT, 1000, 5000).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(
        h.explorer.range_calls(),
        vec![(Category::BaseTx, TimeRange::new(1301, 5000))]
    );
    assert_eq!(
        h.store.coverage(&key).unwrap(),
        vec![TimeRange::new(1000, 5000)]
    );
    assert!(h.store.has_transaction(&hash(4)).unwrap());
}

#[tokio::test]
async fn failure_skips_later_gaps_of_the_category() {
    let explorer = FakeExplorer::new(10);
    explorer.add_transactions([tx(1, 1100), tx(2, 3500)]);
    explorer.fail_after_pages(Category::BaseTx, 0);
    let h = harness(explorer);
    h.store
        .mark_covered(
            &ResourceKey::new(Category::BaseTx, ACCOUNT),
            TimeRange::new(2000, 3000),
        )
        .unwrap();

    let report = h.engine.sync_address(ACCOUNT, 1000, 4000).await.unwrap();
    let base = report.category(Category::BaseTx).unwrap();
    assert_eq!(base.gaps_found, 2);
    assert_eq!(base.failure.as_ref().unwrap().window, TimeRange::new(1000, 1999));

    let base_calls: Vec<_> = h
        .explorer
        .range_calls()
        .into_iter()
        .filter(|(c, _)| *c == Category::BaseTx)
        .collect();
    assert_eq!(base_calls.len(), 1, "second gap must not be requested");
    assert_eq!(
        coverage(&*h.store, Category::BaseTx),
        vec![TimeRange::new(2000, 3000)]
    );
}

#[tokio::test]
async fn query_syncs_tracked_accounts_then_reads() {
    let explorer = FakeExplorer::new(10);
    explorer.add_transactions([tx(1, 1100), tx(2, 1300), tx(3, 1800)]);
    let options = EngineOptions {
        tracked_accounts: vec![ACCOUNT],
    };
    let h = harness_with(explorer, options);

    let filter = TransactionFilter::default()
        .with_range(Some(1000), Some(2000))
        .with_limit(2, 0);
    let (page, total) = h.engine.query(&filter, false).await.unwrap();
    assert_eq!(total, 3);
    assert_eq!(
        page.iter().map(|t| t.hash).collect::<Vec<_>>(),
        vec![hash(1), hash(2)]
    );
    assert_eq!(
        coverage(&*h.store, Category::BaseTx),
        vec![TimeRange::new(1000, 2000)]
    );

    h.explorer.clear_calls();
    let (_, total) = h.engine.query(&filter, false).await.unwrap();
    assert_eq!(total, 3);
    assert!(h.explorer.calls().is_empty());
}

#[tokio::test]
async fn cache_only_query_never_touches_the_remote() {
    let explorer = FakeExplorer::new(10);
    explorer.add_transactions([tx(1, 1100)]);
    let h = harness(explorer);

    let filter = TransactionFilter::for_addresses(vec![ACCOUNT]).with_range(Some(0), Some(2000));
    let (page, total) = h.engine.query(&filter, true).await.unwrap();
    assert!(page.is_empty());
    assert_eq!(total, 0);
    assert!(h.explorer.calls().is_empty());

    let (page, _) = h.engine.query(&filter, false).await.unwrap();
    assert_eq!(page.len(), 1);
}
