//! Master dispatch loop against an in-memory namespace and fake servants.


use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use servant_cluster::coordination::{MemoryNamespace, Namespace, Role};
use servant_cluster::error::Result;
use servant_cluster::master::{
    conservative_average, AuthoritativeTickets, ConservativeAverageDispatch, CurrentDispatch,
    Master, NewDispatch, ServantDirectory,
};
use servant_cluster::tickets::Ticket;
use test_harness::*;

struct MasterFixture {
    namespace: Arc<MemoryNamespace>,
    servants: Arc<FakeServants>,
    source: Arc<AuthoritativeTickets>,
    election: Arc<ManualElection>,
    master: Arc<Master>,
}

impl MasterFixture {
    fn new(interval: Duration) -> Self {
        let namespace = Arc::new(MemoryNamespace::new());
        let servants = FakeServants::new();
        let source = Arc::new(AuthoritativeTickets::default());
        let election = ManualElection::new();
        let master = Arc::new(Master::new(
            election.clone(),
            ServantDirectory::new(namespace.clone(), PREFIX),
            servants.clone(),
            Arc::new(ConservativeAverageDispatch::new(source.clone())),
            interval,
        ));
        Self {
            namespace,
            servants,
            source,
            election,
            master,
        }
    }

    fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let master = self.master.clone();
        tokio::spawn(async move {
            master.run(shutdown).await.expect("master run");
        })
    }
}

#[tokio::test]
async fn rebalances_five_tickets_over_two_servants() {
    let fixture = MasterFixture::new(Duration::from_secs(60));
    fixture.source.replace(numbered_tickets(5));
    fixture.servants.hold("10.0.0.2:1", numbered_tickets(5));
    register_servant(&fixture.namespace, "10.0.0.1:1", Duration::from_secs(30)).await;
    register_servant(&fixture.namespace, "10.0.0.2:1", Duration::from_secs(30)).await;

    let report = fixture.master.loop_once().await.unwrap();

    let a = fixture.servants.held("10.0.0.1:1").len();
    let b = fixture.servants.held("10.0.0.2:1").len();
    assert!(a == 2 || a == 3, "first servant got {}", a);
    assert_eq!(a + b, 5);
    assert_eq!(report.servants.len(), 2);

    // B only ever gives tickets away
    for id in fixture.servants.held_ids("10.0.0.2:1") {
        assert!(numbered_tickets(5).contains(&id));
    }

    let second = fixture.master.loop_once().await.unwrap();
    assert!(second.pushed.is_empty(), "stable assignment is not re-pushed");
    assert_eq!(second.unchanged.len(), 2);
}

#[tokio::test]
async fn deleted_ticket_disappears_from_servants() {
    let fixture = MasterFixture::new(Duration::from_secs(60));
    fixture.source.replace(ticket_set(&["a", "b", "c"]));
    register_servant(&fixture.namespace, "s1:1", Duration::from_secs(30)).await;
    register_servant(&fixture.namespace, "s2:1", Duration::from_secs(30)).await;

    fixture.master.loop_once().await.unwrap();
    assert!(fixture.source.remove("b"));
    fixture.master.loop_once().await.unwrap();

    let mut all = fixture.servants.held_ids("s1:1");
    all.extend(fixture.servants.held_ids("s2:1"));
    all.sort();
    assert_eq!(all, vec!["a".to_string(), "c".to_string()]);
}

#[tokio::test]
async fn added_ticket_reaches_a_servant() {
    let fixture = MasterFixture::new(Duration::from_secs(60));
    fixture.source.replace(ticket_set(&["a"]));
    register_servant(&fixture.namespace, "s1:1", Duration::from_secs(30)).await;

    fixture.master.loop_once().await.unwrap();
    fixture
        .source
        .insert(Ticket::ephemeral("b", b"once".to_vec()));
    fixture.master.loop_once().await.unwrap();

    assert_eq!(fixture.servants.held_ids("s1:1"), vec!["a", "b"]);
}

#[tokio::test]
async fn expired_servant_tickets_move_to_survivors() {
    let fixture = MasterFixture::new(Duration::from_secs(60));
    fixture.source.replace(numbered_tickets(6));
    let lease = register_servant(&fixture.namespace, "s1:1", Duration::from_secs(30)).await;
    register_servant(&fixture.namespace, "s2:1", Duration::from_secs(30)).await;
    register_servant(&fixture.namespace, "s3:1", Duration::from_secs(30)).await;

    fixture.master.loop_once().await.unwrap();
    assert_eq!(fixture.servants.held("s1:1").len(), 2);

    fixture.namespace.revoke_lease(lease).await.unwrap();
    fixture.servants.clear_pushes();
    let report = fixture.master.loop_once().await.unwrap();

    assert_eq!(report.servants, vec!["s2:1".to_string(), "s3:1".to_string()]);
    assert!(!fixture.servants.pushes().contains(&"s1:1".to_string()));
    assert_eq!(fixture.servants.held("s2:1").len(), 3);
    assert_eq!(fixture.servants.held("s3:1").len(), 3);
}

#[tokio::test]
async fn unreachable_servant_is_retried_next_cycle() {
    let fixture = MasterFixture::new(Duration::from_secs(60));
    fixture.source.replace(numbered_tickets(4));
    register_servant(&fixture.namespace, "s1:1", Duration::from_secs(30)).await;

    fixture.servants.set_unreachable("s1:1", true);
    assert!(fixture.master.loop_once().await.is_err());
    assert!(fixture.servants.held("s1:1").is_empty());

    fixture.servants.set_unreachable("s1:1", false);
    let report = fixture.master.loop_once().await.unwrap();
    assert_eq!(report.pushed, vec!["s1:1".to_string()]);
    assert_eq!(fixture.servants.held("s1:1").len(), 4);
}

#[tokio::test]
async fn dispatches_only_while_leader() {
    let fixture = MasterFixture::new(Duration::from_millis(50));
    fixture.source.replace(numbered_tickets(2));
    register_servant(&fixture.namespace, "s1:1", Duration::from_secs(30)).await;

    let shutdown = CancellationToken::new();
    let task = fixture.spawn(shutdown.clone());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(fixture.master.last_report().is_none(), "candidate must not dispatch");
    assert!(fixture.servants.pushes().is_empty());

    fixture.election.set_role(Role::Leader);
    let servants = fixture.servants.clone();
    assert_eventually(
        || {
            let servants = servants.clone();
            async move { servants.held("s1:1").len() == 2 }
        },
        Duration::from_secs(2),
        "leader should dispatch",
    )
    .await;

    fixture.election.set_role(Role::Candidate);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let reported = fixture.master.last_report().map(|r| r.finished_at);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(
        fixture.master.last_report().map(|r| r.finished_at),
        reported,
        "candidate must not run cycles"
    );

    shutdown.cancel();
    task.await.unwrap();
    assert_eq!(fixture.master.role(), Role::Candidate);
}

#[tokio::test]
async fn membership_change_triggers_a_cycle() {
    // Interval far beyond the test so only watch events can drive cycles
    let fixture = MasterFixture::new(Duration::from_secs(3600));
    fixture.source.replace(numbered_tickets(4));
    register_servant(&fixture.namespace, "s1:1", Duration::from_secs(30)).await;

    let shutdown = CancellationToken::new();
    fixture.election.set_role(Role::Leader);
    let task = fixture.spawn(shutdown.clone());

    let servants = fixture.servants.clone();
    assert_eventually(
        || {
            let servants = servants.clone();
            async move { servants.held("s1:1").len() == 4 }
        },
        Duration::from_secs(2),
        "initial cycle should run on election",
    )
    .await;

    register_servant(&fixture.namespace, "s2:1", Duration::from_secs(30)).await;
    let servants = fixture.servants.clone();
    assert_eventually(
        || {
            let servants = servants.clone();
            async move { servants.held("s1:1").len() == 2 && servants.held("s2:1").len() == 2 }
        },
        Duration::from_secs(2),
        "new servant should receive half the tickets",
    )
    .await;

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn watch_events_outside_servant_subtree_are_ignored() {
    let fixture = MasterFixture::new(Duration::from_secs(3600));
    register_servant(&fixture.namespace, "s1:1", Duration::from_secs(30)).await;

    let shutdown = CancellationToken::new();
    fixture.election.set_role(Role::Leader);
    let task = fixture.spawn(shutdown.clone());

    let master = fixture.master.clone();
    assert_eventually(
        || {
            let master = master.clone();
            async move { master.last_report().is_some() }
        },
        Duration::from_secs(2),
        "initial cycle should run",
    )
    .await;
    let first = fixture.master.last_report().map(|r| r.finished_at);

    fixture
        .namespace
        .put(&format!("{}/unrelated", PREFIX), "x", None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fixture.master.last_report().map(|r| r.finished_at), first);

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn membership_backlog_runs_a_single_cycle() {
    let namespace = Arc::new(MemoryNamespace::new());
    let servants = FakeServants::new();
    let election = ManualElection::new();
    let cycles = Arc::new(AtomicUsize::new(0));
    let policy = {
        let cycles = cycles.clone();
        let tickets = numbered_tickets(10);
        move |current: &CurrentDispatch| -> Result<NewDispatch> {
            cycles.fetch_add(1, Ordering::SeqCst);
            Ok(conservative_average(&tickets, current))
        }
    };
    let master = Arc::new(Master::new(
        election.clone(),
        ServantDirectory::new(namespace.clone(), PREFIX),
        servants.clone(),
        Arc::new(policy),
        Duration::from_secs(3600),
    ));

    let shutdown = CancellationToken::new();
    let task = {
        let master = master.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { master.run(shutdown).await.expect("master run") })
    };
    // Let the master subscribe before membership changes pile up
    tokio::time::sleep(Duration::from_millis(100)).await;
    for i in 0..5 {
        let address = format!("s{}:1", i);
        register_servant(&namespace, &address, Duration::from_secs(30)).await;
    }
    assert_eq!(cycles.load(Ordering::SeqCst), 0);

    election.set_role(Role::Leader);
    let counter = cycles.clone();
    assert_eventually(
        || {
            let counter = counter.clone();
            async move { counter.load(Ordering::SeqCst) >= 1 }
        },
        Duration::from_secs(2),
        "leader should dispatch",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(cycles.load(Ordering::SeqCst), 1, "queued events must coalesce");
    assert_eq!(servants.held("s0:1").len(), 2);

    shutdown.cancel();
    task.await.unwrap();
}
