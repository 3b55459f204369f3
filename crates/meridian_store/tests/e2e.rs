//! End-to-end scenarios driven through the client API against in-process
//! clusters.

mod common;

use common::{key_for_partition, TestCluster, E2E_TIMEOUT};
use meridian_engine::txn::{make_transaction, Transaction, TransactionStatus};
use meridian_engine::types::Metadata;
use tokio::time::timeout;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_home_read_returns_preloaded_values() {
    let cluster = TestCluster::start(1, 1, &[("A", "valA", 0, 0), ("B", "valB", 0, 1)]).await;
    let mut client = cluster.client(0, 0).await;

    let txn = make_transaction(&["A", "B"], &[] as &[&str], "");
    let result = timeout(E2E_TIMEOUT, client.execute(txn))
        .await
        .expect("txn timed out")
        .expect("client error");

    assert_eq!(result.status, TransactionStatus::Committed);
    assert_eq!(result.read_set.get("A").map(String::as_str), Some("valA"));
    assert_eq!(result.read_set.get("B").map(String::as_str), Some("valB"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequential_writes_are_visible() {
    let cluster = TestCluster::start(1, 1, &[("A", "valA", 0, 0)]).await;
    let mut client = cluster.client(0, 0).await;

    let write = make_transaction(&["A"], &["A"], "SET A newA");
    let result = timeout(E2E_TIMEOUT, client.execute(write))
        .await
        .expect("txn timed out")
        .expect("client error");
    assert_eq!(result.status, TransactionStatus::Committed);

    let read = make_transaction(&["A"], &[] as &[&str], "");
    let result = timeout(E2E_TIMEOUT, client.execute(read))
        .await
        .expect("txn timed out")
        .expect("client error");
    assert_eq!(result.status, TransactionStatus::Committed);
    assert_eq!(result.read_set.get("A").map(String::as_str), Some("newA"));
}

// Writing a fresh store and reading the values back yields exactly the
// assigned values.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_then_read_round_trip() {
    let cluster = TestCluster::start(1, 1, &[]).await;
    let mut client = cluster.client(0, 0).await;

    let write = make_transaction(&[] as &[&str], &["X", "Y"], "SET X foo SET Y bar");
    let result = timeout(E2E_TIMEOUT, client.execute(write))
        .await
        .expect("txn timed out")
        .expect("client error");
    assert_eq!(result.status, TransactionStatus::Committed);

    let read = make_transaction(&["X", "Y"], &[] as &[&str], "");
    let result = timeout(E2E_TIMEOUT, client.execute(read))
        .await
        .expect("txn timed out")
        .expect("client error");
    assert_eq!(result.read_set.get("X").map(String::as_str), Some("foo"));
    assert_eq!(result.read_set.get("Y").map(String::as_str), Some("bar"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_home_read_across_regions() {
    let cluster = TestCluster::start(2, 1, &[("A", "valA", 0, 0), ("C", "valC", 1, 0)]).await;
    let mut client = cluster.client(0, 0).await;

    let txn = make_transaction(&["A", "C"], &[] as &[&str], "");
    let result = timeout(E2E_TIMEOUT, client.execute(txn))
        .await
        .expect("txn timed out")
        .expect("client error");

    assert_eq!(result.status, TransactionStatus::Committed);
    assert_eq!(result.read_set.get("A").map(String::as_str), Some("valA"));
    assert_eq!(result.read_set.get("C").map(String::as_str), Some("valC"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_partition_txn_exchanges_remote_reads() {
    let key0 = key_for_partition(2, 0, "p0k");
    let key1 = key_for_partition(2, 1, "p1k");
    let cluster = TestCluster::start(
        1,
        2,
        &[(key0.as_str(), "v0", 0, 0), (key1.as_str(), "v1", 0, 0)],
    )
    .await;
    let mut client = cluster.client(0, 0).await;

    // Copy a value across the partition boundary.
    let txn = make_transaction(
        &[key0.as_str(), key1.as_str()],
        &[key1.as_str()],
        &format!("COPY {key0} {key1}"),
    );
    let result = timeout(E2E_TIMEOUT, client.execute(txn))
        .await
        .expect("txn timed out")
        .expect("client error");
    assert_eq!(result.status, TransactionStatus::Committed);

    let read = make_transaction(&[key1.as_str()], &[] as &[&str], "");
    let result = timeout(E2E_TIMEOUT, client.execute(read))
        .await
        .expect("txn timed out")
        .expect("client error");
    assert_eq!(result.read_set.get(&key1).map(String::as_str), Some("v0"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_txn_is_rejected_immediately() {
    let cluster = TestCluster::start(1, 1, &[]).await;
    let mut client = cluster.client(0, 0).await;

    let result = timeout(E2E_TIMEOUT, client.execute(Transaction::default()))
        .await
        .expect("txn timed out")
        .expect("client error");
    assert_eq!(result.status, TransactionStatus::Aborted);
    assert!(result.abort_reason.contains("no keys"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn user_abort_rolls_back_nothing() {
    let cluster = TestCluster::start(1, 1, &[("A", "valA", 0, 0)]).await;
    let mut client = cluster.client(0, 0).await;

    let txn = make_transaction(&[] as &[&str], &["A"], "SET A clobbered ABORT A");
    let result = timeout(E2E_TIMEOUT, client.execute(txn))
        .await
        .expect("txn timed out")
        .expect("client error");
    assert_eq!(result.status, TransactionStatus::Aborted);

    let read = make_transaction(&["A"], &[] as &[&str], "");
    let result = timeout(E2E_TIMEOUT, client.execute(read))
        .await
        .expect("txn timed out")
        .expect("client error");
    assert_eq!(result.read_set.get("A").map(String::as_str), Some("valA"));
}

// A transaction that observed a mastership counter behind storage aborts
// deterministically.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_counter_aborts() {
    let cluster = TestCluster::start(1, 1, &[("A", "valA", 0, 2)]).await;
    let mut client = cluster.client(0, 0).await;

    let mut txn = make_transaction(&["A"], &[] as &[&str], "");
    txn.master_metadata.insert("A".into(), Metadata::new(0, 1));
    let result = timeout(E2E_TIMEOUT, client.execute(txn))
        .await
        .expect("txn timed out")
        .expect("client error");
    assert_eq!(result.status, TransactionStatus::Aborted);
    assert!(result.abort_reason.contains("stale"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stats_report_pipeline_state() {
    let cluster = TestCluster::start(1, 1, &[("A", "valA", 0, 0)]).await;
    let mut client = cluster.client(0, 0).await;

    let txn = make_transaction(&["A"], &[] as &[&str], "");
    timeout(E2E_TIMEOUT, client.execute(txn))
        .await
        .expect("txn timed out")
        .expect("client error");

    let json = timeout(
        E2E_TIMEOUT,
        client.stats(meridian_engine::messages::StatsModule::Server, 1),
    )
    .await
    .expect("stats timed out")
    .expect("client error");
    let stats: serde_json::Value = serde_json::from_str(&json).expect("stats json");
    assert!(stats["txn_id_counter"].as_u64().unwrap() >= 1);

    let json = timeout(
        E2E_TIMEOUT,
        client.stats(meridian_engine::messages::StatsModule::Scheduler, 1),
    )
    .await
    .expect("stats timed out")
    .expect("client error");
    let stats: serde_json::Value = serde_json::from_str(&json).expect("stats json");
    assert!(stats["lock_manager"]["num_locked_keys"].is_number());
}
