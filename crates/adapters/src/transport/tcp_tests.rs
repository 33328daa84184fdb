// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

struct Echo;

#[async_trait]
impl FrameHandler for Echo {
    async fn handle(&self, frame: Bytes) -> Result<Bytes, String> {
        if frame.as_ref() == b"fail" {
            return Err("refused".to_string());
        }
        let mut out = b"echo:".to_vec();
        out.extend_from_slice(&frame);
        Ok(Bytes::from(out))
    }
}

async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_frames(listener, Arc::new(Echo)));
    addr
}

#[tokio::test]
async fn call_roundtrips_frames_on_one_connection() {
    let addr = start_echo().await;
    let transport = TcpTransport::new(
        HashMap::from([("b".to_string(), addr)]),
        Duration::from_secs(5),
    );

    for i in 0..3 {
        let reply = transport
            .call("b", Bytes::from(format!("ping-{}", i)))
            .await
            .unwrap();
        assert_eq!(reply, Bytes::from(format!("echo:ping-{}", i)));
    }
}

#[tokio::test]
async fn handler_error_is_remote() {
    let addr = start_echo().await;
    let transport = TcpTransport::new(
        HashMap::from([("b".to_string(), addr)]),
        Duration::from_secs(5),
    );

    let err = transport
        .call("b", Bytes::from_static(b"fail"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Remote(_, ref msg) if msg == "refused"));

    // connection stays usable
    assert!(transport.call("b", Bytes::from_static(b"ok")).await.is_ok());
}

#[tokio::test]
async fn unknown_peer_rejected() {
    let transport = TcpTransport::new(HashMap::new(), Duration::from_secs(1));
    let err = transport.call("nobody", Bytes::new()).await.unwrap_err();
    assert!(matches!(err, TransportError::UnknownPeer(_)));
}

#[tokio::test]
async fn closed_port_is_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = TcpTransport::new(
        HashMap::from([("b".to_string(), addr)]),
        Duration::from_secs(5),
    );
    let err = transport.call("b", Bytes::new()).await.unwrap_err();
    assert!(matches!(err, TransportError::Unreachable(..)));
    assert!(err.class().is_retryable());
}
