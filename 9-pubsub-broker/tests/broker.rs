use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use pubsub_broker::{
    broker::Broker,
    config::BrokerConfig,
    connection::Topic,
    handshake::HandshakeLimits,
    registry::{Registry, RoleCounts},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};

const IO_TIMEOUT: Duration = Duration::from_secs(2);
const PUBLISHER_FRAME: &[u8] = br#"{"ClientType": "PUBLISHER"}"#;
const SUBSCRIBER_FRAME: &[u8] = br#"{"ClientType": "SUBSCRIBER"}"#;

struct TestBroker {
    addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
}

impl TestBroker {
    async fn start() -> Result<Self> {
        let config = BrokerConfig {
            handshake: HandshakeLimits {
                timeout: Duration::from_millis(300),
                ..HandshakeLimits::default()
            },
            write_timeout: Duration::from_millis(500),
            ..BrokerConfig::default()
        };

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let broker = Broker::new(listener, config);
        let addr = broker.local_addr()?;
        let registry = broker.registry();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = broker.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            registry,
            shutdown: Some(shutdown_tx),
            server,
        })
    }

    async fn wait_for_counts(&self, expected: RoleCounts) -> Result<()> {
        let topic = Topic::default();
        let poll = async {
            while self.registry.counts(&topic).await != expected {
                sleep(Duration::from_millis(10)).await;
            }
        };
        timeout(IO_TIMEOUT, poll)
            .await
            .map_err(|_| anyhow!("registry never reached {expected:?}"))
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = self.server.await;
    }
}

async fn connect_as(addr: SocketAddr, frame: &[u8]) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
    let stream = TcpStream::connect(addr).await?;
    let (mut reader, mut writer) = stream.into_split();
    writer.write_all(frame).await?;

    let mut reply = [0u8; 2];
    timeout(IO_TIMEOUT, reader.read_exact(&mut reply)).await??;
    assert_eq!(&reply, b"OK");

    Ok((reader, writer))
}

async fn read_exactly(reader: &mut OwnedReadHalf, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    timeout(IO_TIMEOUT, reader.read_exact(&mut buf)).await??;
    Ok(buf)
}

/// Reads until the broker closes the stream and returns everything received.
async fn read_until_closed(reader: &mut OwnedReadHalf) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    timeout(IO_TIMEOUT, reader.read_to_end(&mut buf)).await??;
    Ok(buf)
}

#[tokio::test]
async fn publisher_bytes_reach_subscriber() -> Result<()> {
    let broker = TestBroker::start().await?;

    let (_p_reader, mut p_writer) = connect_as(broker.addr, PUBLISHER_FRAME).await?;
    let (mut s_reader, _s_writer) = connect_as(broker.addr, SUBSCRIBER_FRAME).await?;

    p_writer.write_all(b"2024-01-01 00:00:00").await?;

    let received = read_exactly(&mut s_reader, 19).await?;
    assert_eq!(received, b"2024-01-01 00:00:00");

    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn handshake_admits_under_declared_role() -> Result<()> {
    let broker = TestBroker::start().await?;

    let _publisher = connect_as(broker.addr, PUBLISHER_FRAME).await?;
    let _subscriber = connect_as(broker.addr, br#"{"ClientType":"SUBSCRIBER"}"#).await?;

    broker
        .wait_for_counts(RoleCounts {
            publishers: 1,
            subscribers: 1,
        })
        .await?;

    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn bogus_client_type_is_closed_without_ok() -> Result<()> {
    let broker = TestBroker::start().await?;

    let frames: [&[u8]; 3] = [
        br#"{"ClientType":"BOGUS"}"#,
        br#"{"Client":"PUBLISHER"}"#,
        b"not json at all",
    ];
    for frame in frames {
        let mut stream = TcpStream::connect(broker.addr).await?;
        stream.write_all(frame).await?;
        let (mut reader, _writer) = stream.into_split();

        let received = read_until_closed(&mut reader).await?;
        assert!(received.is_empty(), "unexpected reply {received:?}");
    }

    assert_eq!(broker.registry.counts(&Topic::default()).await, RoleCounts::default());
    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn silent_client_is_closed_after_handshake_timeout() -> Result<()> {
    let broker = TestBroker::start().await?;

    let stream = TcpStream::connect(broker.addr).await?;
    let (mut reader, _writer) = stream.into_split();

    let received = read_until_closed(&mut reader).await?;
    assert!(received.is_empty());

    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn chunks_arrive_in_order_for_every_subscriber() -> Result<()> {
    let broker = TestBroker::start().await?;

    let (_p_reader, mut p_writer) = connect_as(broker.addr, PUBLISHER_FRAME).await?;
    let (mut first, _first_writer) = connect_as(broker.addr, SUBSCRIBER_FRAME).await?;
    let (mut second, _second_writer) = connect_as(broker.addr, SUBSCRIBER_FRAME).await?;

    let mut expected = Vec::new();
    for i in 0..50 {
        let chunk = format!("chunk-{i};");
        p_writer.write_all(chunk.as_bytes()).await?;
        expected.extend_from_slice(chunk.as_bytes());
    }

    assert_eq!(read_exactly(&mut first, expected.len()).await?, expected);
    assert_eq!(read_exactly(&mut second, expected.len()).await?, expected);

    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn data_sent_with_handshake_is_forwarded() -> Result<()> {
    let broker = TestBroker::start().await?;
    let (mut s_reader, _s_writer) = connect_as(broker.addr, SUBSCRIBER_FRAME).await?;

    let mut frame = PUBLISHER_FRAME.to_vec();
    frame.extend_from_slice(b"eager");
    let (_p_reader, _p_writer) = connect_as(broker.addr, &frame).await?;

    assert_eq!(read_exactly(&mut s_reader, 5).await?, b"eager");

    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn subscriber_disconnect_does_not_affect_others() -> Result<()> {
    let broker = TestBroker::start().await?;

    let (_p_reader, mut p_writer) = connect_as(broker.addr, PUBLISHER_FRAME).await?;
    let (leaving_reader, leaving_writer) = connect_as(broker.addr, SUBSCRIBER_FRAME).await?;
    let (mut staying, _staying_writer) = connect_as(broker.addr, SUBSCRIBER_FRAME).await?;

    p_writer.write_all(b"before;").await?;
    assert_eq!(read_exactly(&mut staying, 7).await?, b"before;");

    drop(leaving_reader);
    drop(leaving_writer);
    broker
        .wait_for_counts(RoleCounts {
            publishers: 1,
            subscribers: 1,
        })
        .await?;

    p_writer.write_all(b"after;").await?;
    assert_eq!(read_exactly(&mut staying, 6).await?, b"after;");

    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn publisher_close_leaves_other_connections_open() -> Result<()> {
    let broker = TestBroker::start().await?;

    let (leaving_reader, mut leaving_writer) = connect_as(broker.addr, PUBLISHER_FRAME).await?;
    let (_p_reader, mut p_writer) = connect_as(broker.addr, PUBLISHER_FRAME).await?;
    let (mut s_reader, _s_writer) = connect_as(broker.addr, SUBSCRIBER_FRAME).await?;

    leaving_writer.shutdown().await?;
    drop(leaving_writer);
    drop(leaving_reader);
    broker
        .wait_for_counts(RoleCounts {
            publishers: 1,
            subscribers: 1,
        })
        .await?;

    p_writer.write_all(b"still here").await?;
    assert_eq!(read_exactly(&mut s_reader, 10).await?, b"still here");

    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_publishers_keep_their_streams_intact() -> Result<()> {
    let broker = TestBroker::start().await?;

    let (_a_reader, mut a_writer) = connect_as(broker.addr, PUBLISHER_FRAME).await?;
    let (_b_reader, mut b_writer) = connect_as(broker.addr, PUBLISHER_FRAME).await?;
    let (mut s_reader, _s_writer) = connect_as(broker.addr, SUBSCRIBER_FRAME).await?;

    let lower: Vec<u8> = (0..400).map(|i| b'a' + (i % 26) as u8).collect();
    let upper: Vec<u8> = (0..400).map(|i| b'A' + (i % 26) as u8).collect();

    let send_lower = {
        let lower = lower.clone();
        async move {
            for chunk in lower.chunks(10) {
                a_writer.write_all(chunk).await?;
            }
            Ok::<_, std::io::Error>(a_writer)
        }
    };
    let send_upper = {
        let upper = upper.clone();
        async move {
            for chunk in upper.chunks(10) {
                b_writer.write_all(chunk).await?;
            }
            Ok::<_, std::io::Error>(b_writer)
        }
    };
    let (a_writer, b_writer) = tokio::try_join!(send_lower, send_upper)?;

    let received = read_exactly(&mut s_reader, lower.len() + upper.len()).await?;
    let from_a: Vec<u8> = received.iter().copied().filter(u8::is_ascii_lowercase).collect();
    let from_b: Vec<u8> = received.iter().copied().filter(u8::is_ascii_uppercase).collect();
    assert_eq!(from_a, lower);
    assert_eq!(from_b, upper);

    drop((a_writer, b_writer));
    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_closes_admitted_connections() -> Result<()> {
    let broker = TestBroker::start().await?;
    let (mut s_reader, _s_writer) = connect_as(broker.addr, SUBSCRIBER_FRAME).await?;
    let registry = Arc::clone(&broker.registry);

    broker.stop().await;

    let received = read_until_closed(&mut s_reader).await?;
    assert!(received.is_empty());
    assert_eq!(registry.counts(&Topic::default()).await, RoleCounts::default());
    Ok(())
}

#[tokio::test]
async fn handshake_finishing_after_shutdown_gets_no_ok() -> Result<()> {
    let broker = TestBroker::start().await?;
    let registry = Arc::clone(&broker.registry);

    let stream = TcpStream::connect(broker.addr).await?;
    let (mut reader, mut writer) = stream.into_split();
    // Give the accept loop time to pick the socket up before stopping.
    sleep(Duration::from_millis(50)).await;
    broker.stop().await;

    // The write may fail if the socket was reset; either way no OK may follow.
    let _ = writer.write_all(SUBSCRIBER_FRAME).await;
    let mut received = Vec::new();
    if let Ok(read) = timeout(IO_TIMEOUT, reader.read_to_end(&mut received)).await? {
        assert_eq!(read, 0, "unexpected reply {received:?}");
    }
    assert!(received.is_empty());

    sleep(Duration::from_millis(50)).await;
    assert_eq!(registry.counts(&Topic::default()).await, RoleCounts::default());
    Ok(())
}

#[tokio::test]
async fn injected_registry_sees_admissions() -> Result<()> {
    let registry = Arc::new(Registry::new());
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let broker = Broker::with_registry(listener, BrokerConfig::default(), Arc::clone(&registry));
    let addr = broker.local_addr()?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        let _ = broker.run_until(shutdown).await;
    });

    let _subscriber = connect_as(addr, SUBSCRIBER_FRAME).await?;
    assert_eq!(
        registry.counts(&Topic::default()).await,
        RoleCounts {
            publishers: 0,
            subscribers: 1,
        }
    );

    let _ = shutdown_tx.send(());
    let _ = server.await;
    assert_eq!(registry.counts(&Topic::default()).await, RoleCounts::default());
    Ok(())
}
