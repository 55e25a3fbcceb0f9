mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{
    eventually, start_tcp, tcp_config, within, Behaviour, MockBackend, FAILOVER, PRIMARY,
};
use tokio::net::TcpListener;
use wirebetween_common::UpstreamOptions;
use wirebetween_metrics::{new_registry, ClusterMetrics};
use wirebetween_proxy::{ProxyError, ProxySupervisor, UpstreamRole};
use wirebetween_resilience::{ResilienceMetrics, RestartPolicy};

fn with_failover(label: &str) -> wirebetween_common::ProxyConfig {
    let mut config = tcp_config(label);
    config.failover = Some(UpstreamOptions::new(FAILOVER));
    config
}

fn resilient(
    config: wirebetween_common::ProxyConfig,
    backend: &Arc<MockBackend>,
    policy: RestartPolicy,
) -> (ProxySupervisor, ResilienceMetrics) {
    let resilience = ResilienceMetrics::new(new_registry()).unwrap();
    let cluster = config.cluster().to_owned();
    let supervisor = ProxySupervisor::builder(
        config,
        backend.clone(),
        ClusterMetrics::detached(&cluster).unwrap(),
    )
    .restart_policy(policy)
    .resilience_metrics(resilience.clone())
    .build();
    (supervisor, resilience)
}

#[tokio::test]
async fn primary_failure_never_contacts_failover_or_listens() {
    wirebetween_logging::init();
    let backend = Arc::new(MockBackend::new(Behaviour::Echo).failing(PRIMARY));
    let supervisor = ProxySupervisor::new(
        with_failover("ledger"),
        backend.clone(),
        ClusterMetrics::detached("ledger").unwrap(),
    );
    let bound = supervisor.watch_address();

    let err = supervisor.run().await.expect_err("primary is unreachable");
    assert!(matches!(
        err,
        ProxyError::UpstreamConnect {
            role: UpstreamRole::Primary,
            ..
        }
    ));
    assert_eq!(backend.contacted(), vec![PRIMARY.to_owned()]);
    assert!(!bound.has_changed().unwrap());
    assert!(supervisor.local_addr().is_none());
}

#[tokio::test]
async fn failover_failure_releases_the_primary() {
    wirebetween_logging::init();
    let backend = Arc::new(MockBackend::new(Behaviour::Echo).failing(FAILOVER));
    let supervisor = ProxySupervisor::new(
        with_failover("ledger"),
        backend.clone(),
        ClusterMetrics::detached("ledger").unwrap(),
    );

    let err = supervisor.run().await.expect_err("failover is unreachable");
    assert!(matches!(
        err,
        ProxyError::UpstreamConnect {
            role: UpstreamRole::Failover,
            ..
        }
    ));
    assert_eq!(backend.contacted(), vec![PRIMARY.to_owned(), FAILOVER.to_owned()]);
    assert_eq!(backend.closes_for(PRIMARY), 1);
}

#[tokio::test]
async fn bind_failure_is_fatal_and_not_restarted() {
    wirebetween_logging::init();
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = tcp_config("busy");
    config.address = taken.local_addr().unwrap().to_string();
    let backend = Arc::new(MockBackend::new(Behaviour::Echo));
    let (supervisor, resilience) = resilient(config, &backend, RestartPolicy::default());

    let err = supervisor.run().await.expect_err("address in use");
    match err {
        ProxyError::Bind { source, .. } => {
            assert_eq!(source.kind(), std::io::ErrorKind::AddrInUse)
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(backend.contacted().len(), 1);
    assert_eq!(backend.closes_for(PRIMARY), 1);
    assert_eq!(resilience.crashes("busy"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crashes_are_restarted_after_a_backoff() {
    wirebetween_logging::init();
    let backend = Arc::new(MockBackend::new(Behaviour::Echo).panicking(3));
    let backoff = Duration::from_millis(20);
    let (supervisor, resilience) = resilient(
        tcp_config("flaky"),
        &backend,
        RestartPolicy::new(backoff, None),
    );

    let started = Instant::now();
    let (running, _address) = start_tcp(&supervisor).await;
    assert!(started.elapsed() >= backoff * 3);
    assert_eq!(backend.contacted().len(), 4);
    assert_eq!(resilience.crashes("flaky"), 3);
    assert_eq!(resilience.restarts("flaky"), 3);

    supervisor.request_shutdown();
    within("run to return", running).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crashed_attempt_closes_the_upstreams_it_opened() {
    wirebetween_logging::init();
    let backend = Arc::new(MockBackend::new(Behaviour::Echo).panicking_at(FAILOVER));
    let (supervisor, resilience) = resilient(
        with_failover("relay"),
        &backend,
        RestartPolicy::new(Duration::from_millis(10), None),
    );

    let (running, _address) = start_tcp(&supervisor).await;
    assert_eq!(resilience.crashes("relay"), 1);
    assert_eq!(
        backend.contacted(),
        vec![PRIMARY.to_owned(), FAILOVER.to_owned(), PRIMARY.to_owned(), FAILOVER.to_owned()]
    );
    assert_eq!(backend.close_counts(PRIMARY), vec![1, 0]);

    supervisor.request_shutdown();
    within("run to return", running).await.unwrap().unwrap();
    assert_eq!(backend.close_counts(PRIMARY), vec![1, 1]);
    assert_eq!(backend.close_counts(FAILOVER), vec![1]);
}

#[tokio::test]
async fn restart_budget_bounds_crash_loops() {
    wirebetween_logging::init();
    let backend = Arc::new(MockBackend::new(Behaviour::Echo).panicking(10));
    let (supervisor, resilience) = resilient(
        tcp_config("doomed"),
        &backend,
        RestartPolicy::new(Duration::from_millis(1), Some(2)),
    );

    let err = supervisor.run().await.expect_err("budget exhausted");
    assert!(matches!(err, ProxyError::RestartsExhausted { attempts: 3 }));
    assert_eq!(resilience.crashes("doomed"), 3);
    assert_eq!(resilience.restarts("doomed"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_during_backoff_ends_supervision() {
    wirebetween_logging::init();
    let backend = Arc::new(MockBackend::new(Behaviour::Echo).panicking(1));
    let (supervisor, resilience) = resilient(
        tcp_config("stopping"),
        &backend,
        RestartPolicy::new(Duration::from_secs(30), None),
    );

    let runner = supervisor.clone();
    let running = tokio::spawn(async move { runner.run().await });
    eventually("first crash", || resilience.crashes("stopping") == 1).await;

    supervisor.request_shutdown();
    within("run to return", running).await.unwrap().unwrap();
    assert_eq!(resilience.restarts("stopping"), 0);
    assert_eq!(backend.contacted().len(), 1);
}
