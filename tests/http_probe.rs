use proxy_prober::proxy::{Endpoint, HttpProbe, Probe, ProbeError, ProxyKind};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Minimal HTTP proxy that answers one request with `status` and hands the
/// raw request back to the test
async fn fake_proxy(status: &'static str) -> (SocketAddr, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
            status
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();
        let _ = tx.send(String::from_utf8_lossy(&request).into_owned());
    });

    (addr, rx)
}

fn endpoint(kind: ProxyKind, addr: SocketAddr) -> Endpoint {
    Endpoint::new(kind, &addr.ip().to_string(), u32::from(addr.port()))
}

#[tokio::test]
async fn success_through_http_proxy() {
    let (addr, request) = fake_proxy("200 OK").await;
    let probe = HttpProbe::with_user_agent("prober-test/1.0".to_string());

    let result = probe
        .probe(
            "http://example.com/ip",
            &endpoint(ProxyKind::Http, addr),
            Duration::from_secs(5),
        )
        .await;
    assert!(result.is_ok(), "unexpected failure: {:?}", result);

    let request = request.await.unwrap().to_lowercase();
    assert!(request.starts_with("get http://example.com/ip"));
    assert!(request.contains("user-agent: prober-test/1.0"));
}

#[tokio::test]
async fn unknown_kind_is_probed_as_http_proxy() {
    let (addr, _request) = fake_proxy("200 OK").await;
    let result = HttpProbe::new()
        .probe(
            "http://example.com/",
            &endpoint(ProxyKind::from_tag("squid"), addr),
            Duration::from_secs(5),
        )
        .await;
    assert!(result.is_ok(), "unexpected failure: {:?}", result);
}

// A proxy that answers with anything but 200 is reported as a retryable
// connect failure carrying the status code.
#[tokio::test]
async fn non_200_is_a_connect_failure() {
    let (addr, _request) = fake_proxy("403 Forbidden").await;
    let result = HttpProbe::new()
        .probe(
            "http://example.com/",
            &endpoint(ProxyKind::Http, addr),
            Duration::from_secs(5),
        )
        .await;

    let err = result.unwrap_err();
    assert_eq!(err, ProbeError::Connect("Response code:403".to_string()));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn silent_proxy_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
    });

    let result = HttpProbe::new()
        .probe(
            "http://example.com/",
            &endpoint(ProxyKind::Http, addr),
            Duration::from_millis(300),
        )
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, ProbeError::Timeout(_)), "got {:?}", err);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn refused_connection_is_retryable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = HttpProbe::new()
        .probe(
            "http://example.com/",
            &endpoint(ProxyKind::Http, addr),
            Duration::from_secs(5),
        )
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, ProbeError::Connect(_)), "got {:?}", err);
}

#[tokio::test]
async fn terminal_failures_do_not_touch_the_network() {
    let probe = HttpProbe::new();
    let ep = Endpoint::new(ProxyKind::Http, "127.0.0.1", 9);

    let err = probe
        .probe("no scheme here", &ep, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ProbeError::MalformedTarget(_)));
    assert!(err.is_terminal());

    let direct = Endpoint::new(ProxyKind::Direct, "127.0.0.1", 9);
    let err = probe
        .probe("http://example.com/", &direct, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ProbeError::InvalidSettings(_)));

    let wide = Endpoint::new(ProxyKind::Socks, "127.0.0.1", 65536);
    let err = probe
        .probe("http://example.com/", &wide, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ProbeError::InvalidSettings(_)));
}
