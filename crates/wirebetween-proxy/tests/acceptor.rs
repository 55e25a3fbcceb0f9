mod common;

use std::sync::Arc;

use common::{
    mock_upstreams, tcp_config, within, Behaviour, FlakyAccept, MockBackend, PanickingAccept,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use wirebetween_metrics::ClusterMetrics;
use wirebetween_proxy::{Accept, BoundAddress, ConnectionAcceptor, ShutdownSignal};

fn build_acceptor(
    label: &str,
    backend: &Arc<MockBackend>,
    metrics: &ClusterMetrics,
    signal: &ShutdownSignal,
) -> ConnectionAcceptor {
    ConnectionAcceptor::new(
        Arc::new(tcp_config(label)),
        backend.clone(),
        metrics.clone(),
        signal.clone(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_accept_error_is_counted_and_serving_continues() {
    wirebetween_logging::init();
    let backend = Arc::new(MockBackend::new(Behaviour::Echo));
    let metrics = ClusterMetrics::detached("emfile").unwrap();
    let signal = ShutdownSignal::new();
    let acceptor = build_acceptor("emfile", &backend, &metrics, &signal);

    let source = FlakyAccept::bind(1).await;
    let address = source.local_addr().unwrap().tcp().unwrap();
    let running = tokio::spawn(async move { acceptor.listen_on(source, mock_upstreams()).await });

    let mut client = TcpStream::connect(address).await.unwrap();
    client.write_all(b"still here").await.unwrap();
    let mut reply = [0u8; 10];
    within("echo", client.read_exact(&mut reply)).await.unwrap();
    assert_eq!(&reply, b"still here");
    assert_eq!(metrics.accept_errors(), 1);
    assert_eq!(backend.handled(), 1);
    drop(client);

    signal.request_graceful();
    within("drain", running).await.unwrap();
    assert_eq!(metrics.accept_errors(), 1);
    assert_eq!(metrics.connections().value(), 0);
}

#[tokio::test]
async fn panic_while_accepting_withdraws_the_published_address() {
    wirebetween_logging::init();
    let backend = Arc::new(MockBackend::new(Behaviour::Echo));
    let metrics = ClusterMetrics::detached("unwind").unwrap();
    let signal = ShutdownSignal::new();
    let (publisher, bound) = watch::channel(None);
    let publisher = Arc::new(publisher);
    let acceptor = build_acceptor("unwind", &backend, &metrics, &signal)
        .with_address_publisher(publisher.clone());

    let address = BoundAddress::Tcp("127.0.0.1:9".parse().unwrap());
    let source = PanickingAccept(address);
    let outcome =
        tokio::spawn(async move { acceptor.listen_on(source, mock_upstreams()).await }).await;

    assert!(outcome.unwrap_err().is_panic());
    assert!(bound.has_changed().unwrap());
    assert_eq!(*bound.borrow(), None);
}
