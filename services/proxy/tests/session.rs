
use std::sync::Arc;
use std::time::Duration;

use harness::{
    spawn_hangup_backend, PingPongBackend, ProxyHandle, SilentBackend, TcpEchoBackend,
    EVENT_TIMEOUT,
};
use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use certgate_proxy::auth::{AllowList, AuthorizationPolicy, Decision};
use certgate_proxy::events::ProxyEvent;
use certgate_proxy::tls::CertificateInfo;

fn serial_is(expected: &'static str) -> Arc<dyn AuthorizationPolicy> {
    Arc::new(move |chain: &[CertificateDer<'_>]| -> Decision {
        chain
            .first()
            .and_then(|leaf| CertificateInfo::from_der(leaf.as_ref()).ok())
            .map(|info| info.serial == expected)
            .unwrap_or(false)
            .into()
    })
}

#[tokio::test]
async fn authorized_client_reaches_backend() {
    let backend = PingPongBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(backend.endpoint(), serial_is("42"), None).await;

    let mut client = proxy.connect("alice", 42).await.unwrap();
    client.write_all(b"PING\n").await.unwrap();

    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"PONG\n");
    assert_eq!(backend.received(), b"PING\n");

    let incoming = proxy
        .sink
        .wait_for(|e| matches!(e, ProxyEvent::Incoming { .. }))
        .await;
    let ProxyEvent::Incoming { peer } = incoming else {
        unreachable!()
    };
    assert_eq!(peer, client.get_ref().0.local_addr().unwrap());
    assert_eq!(proxy.generation.in_flight(), 1);
}

#[tokio::test]
async fn large_payload_is_relayed_in_order() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(backend.endpoint(), serial_is("7"), None).await;

    let client = proxy.connect("bulk", 7).await.unwrap();
    let (mut rd, mut wr) = tokio::io::split(client);

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let writer = tokio::spawn(async move {
        wr.write_all(&payload).await.unwrap();
        wr
    });

    let mut echoed = vec![0u8; expected.len()];
    rd.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, expected);
    drop(writer.await.unwrap());
}

#[tokio::test]
async fn client_hangup_closes_both_pipes() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let policy = Arc::new(AllowList::new().common_name("alice"));
    let proxy = ProxyHandle::spawn(backend.endpoint(), policy, None).await;

    let mut client = proxy.connect("alice", 3).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    client.shutdown().await.unwrap();
    drop(client);

    let closed = proxy
        .sink
        .wait_for_n(2, |e| matches!(e, ProxyEvent::PipeClosed { .. }))
        .await;
    let total: u64 = closed
        .iter()
        .map(|e| match e {
            ProxyEvent::PipeClosed { bytes, .. } => *bytes,
            _ => 0,
        })
        .sum();
    assert_eq!(total, 10);

    tokio::time::timeout(EVENT_TIMEOUT, proxy.generation.wait_drained())
        .await
        .unwrap();
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn client_hangup_drains_session_with_silent_backend() {
    let backend = SilentBackend::spawn().await.unwrap();
    let policy = Arc::new(AllowList::new().common_name("alice"));
    let proxy = ProxyHandle::spawn(backend.endpoint(), policy, None).await;

    let mut client = proxy.connect("alice", 4).await.unwrap();
    client.write_all(b"last words").await.unwrap();
    proxy
        .sink
        .wait_for_n(2, |e| matches!(e, ProxyEvent::PipeOpened { .. }))
        .await;

    client.shutdown().await.unwrap();
    drop(client);

    // The backend never answers and never closes its end.
    tokio::time::timeout(EVENT_TIMEOUT, proxy.generation.wait_drained())
        .await
        .unwrap();
    assert_eq!(proxy.generation.in_flight(), 0);
    assert_eq!(
        proxy
            .sink
            .count(|e| matches!(e, ProxyEvent::PipeClosed { .. })),
        2
    );
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while backend.received().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(backend.received(), b"last words");
}

#[tokio::test]
async fn backend_hangup_drains_session_with_silent_client() {
    let backend = spawn_hangup_backend().await.unwrap();
    let policy = Arc::new(AllowList::new().common_name("alice"));
    let proxy = ProxyHandle::spawn(backend, policy, None).await;

    // The client never writes and keeps its end open.
    let mut client = proxy.connect("alice", 5).await.unwrap();

    proxy
        .sink
        .wait_for_n(2, |e| matches!(e, ProxyEvent::PipeClosed { .. }))
        .await;
    tokio::time::timeout(EVENT_TIMEOUT, proxy.generation.wait_drained())
        .await
        .unwrap();
    assert_eq!(proxy.generation.in_flight(), 0);

    let mut buf = Vec::new();
    client.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf, b"bye\n");
}
