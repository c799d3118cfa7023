//! End-to-end handshake through the bundled TCP front-end.

mod common;

use std::{sync::Arc, time::Duration};

use amqpgate::{
    TableRouter,
    codec::{self, Performative, ProtocolHeader},
    server::AmqpServer,
    transport::RouteId,
};
use common::open_frame;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

async fn read_frame(client: &mut TcpStream) -> codec::Frame {
    let mut header = [0u8; 8];
    timeout(IO_TIMEOUT, client.read_exact(&mut header))
        .await
        .expect("frame header timeout")
        .expect("frame header read");
    let size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let mut frame = header.to_vec();
    frame.resize(size, 0);
    timeout(IO_TIMEOUT, client.read_exact(&mut frame[8..]))
        .await
        .expect("frame body timeout")
        .expect("frame body read");
    let (frame, consumed) = codec::parse_frame(&frame)
        .expect("well-formed frame")
        .expect("complete frame");
    assert_eq!(consumed, size);
    frame
}

#[tokio::test]
async fn tcp_client_completes_the_open_handshake() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
    let addr = listener.local_addr().expect("listener address");

    let (server, app) = AmqpServer::new(
        common::test_config(),
        Arc::new(TableRouter::wildcard(RouteId(100))),
        RouteId(1),
    );
    let shutdown = CancellationToken::new();
    let server_task = tokio::spawn(server.run(listener, shutdown.clone()));

    let mut client = TcpStream::connect(addr).await.expect("connect");
    client
        .write_all(&ProtocolHeader::AMQP_1_0.to_bytes())
        .await
        .expect("write header");

    let mut echo = [0u8; 8];
    timeout(IO_TIMEOUT, client.read_exact(&mut echo))
        .await
        .expect("header echo timeout")
        .expect("header echo read");
    assert_eq!(echo, ProtocolHeader::AMQP_1_0.to_bytes());

    client
        .write_all(&open_frame("tcp-client", Some(256)))
        .await
        .expect("write open");

    let frame = read_frame(&mut client).await;
    let Performative::Open(open) = frame.performative else {
        panic!("expected OPEN reply, got {frame:?}");
    };
    assert_eq!(open.container_id, common::test_config().container_id);
    assert_eq!(open.max_frame_size, Some(common::test_config().max_frame_size));

    drop(client);
    shutdown.cancel();
    timeout(IO_TIMEOUT, server_task)
        .await
        .expect("server shutdown timeout")
        .expect("server task join")
        .expect("server run result");
    drop(app);
}
