use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use chrono::Local;
use tokio::{
    io::{self, AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    time::{MissedTickBehavior, interval},
};
use tracing::{info, warn};

use crate::{
    cli::{PublishArgs, SubscribeArgs},
    handshake::{Role, await_ack, send_handshake},
};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const RECV_BUFFER_SIZE: usize = 1024;

/// Publishes the current local time every `interval_ms` until Ctrl-C, a
/// failed write, or `count` messages.
pub async fn publish(args: PublishArgs) -> Result<()> {
    let (_reader, mut writer) = connect(args.server, Role::Publisher).await?;

    let mut ticker = interval(Duration::from_millis(args.interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sent = 0u64;

    loop {
        if args.count.is_some_and(|count| sent >= count) {
            break;
        }

        select! {
            _ = ticker.tick() => {
                let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
                writer
                    .write_all(timestamp.as_bytes())
                    .await
                    .context("failed to send data")?;
                sent += 1;
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }

    shutdown_connection(&mut writer).await;
    Ok(())
}

/// Prints every chunk the broker forwards, one line per read, until the
/// broker closes the stream or Ctrl-C.
pub async fn subscribe(args: SubscribeArgs) -> Result<()> {
    let (mut reader, mut writer) = connect(args.server, Role::Subscriber).await?;
    let mut buffer = [0u8; RECV_BUFFER_SIZE];

    loop {
        select! {
            read = reader.read(&mut buffer) => {
                let read = read.context("failed to receive data")?;
                if read == 0 {
                    info!("broker closed the connection");
                    break;
                }
                write_stdout(&String::from_utf8_lossy(&buffer[..read])).await?;
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }

    shutdown_connection(&mut writer).await;
    Ok(())
}

async fn connect(server: SocketAddr, role: Role) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
    let stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("failed to connect to {server}"))?;
    let (mut reader, mut writer) = stream.into_split();

    send_handshake(&mut writer, role)
        .await
        .context("failed to send handshake")?;
    await_ack(&mut reader).await.context("handshake rejected")?;

    info!("connected to {server} as {role}");
    Ok((reader, writer))
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown connection cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
