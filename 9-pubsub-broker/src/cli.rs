use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

pub const DEFAULT_ADDR: &str = "127.0.0.1:9999";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the broker, fanning publisher bytes out to every subscriber.
    Broker(BrokerArgs),
    /// Connect as a publisher and stream the current timestamp.
    Publish(PublishArgs),
    /// Connect as a subscriber and print whatever the broker forwards.
    Subscribe(SubscribeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Socket address the broker should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = DEFAULT_ADDR)]
    pub listen: SocketAddr,

    /// How long a new connection may take to send its handshake frame.
    #[arg(long, default_value_t = 5000)]
    pub handshake_timeout_ms: u64,

    /// How long a single write to a subscriber may block before it is dropped.
    #[arg(long, default_value_t = 5000)]
    pub write_timeout_ms: u64,

    /// Upper bound on the size of a handshake frame.
    #[arg(long, default_value_t = 1024)]
    pub max_handshake_bytes: usize,
}

#[derive(Args, Debug, Clone)]
pub struct PublishArgs {
    /// Address of the broker to connect to.
    #[arg(long, default_value = DEFAULT_ADDR)]
    pub server: SocketAddr,

    /// Delay between two timestamps.
    #[arg(long, default_value_t = 2000)]
    pub interval_ms: u64,

    /// Stop after this many messages instead of running until Ctrl-C.
    #[arg(long)]
    pub count: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct SubscribeArgs {
    /// Address of the broker to connect to.
    #[arg(long, default_value = DEFAULT_ADDR)]
    pub server: SocketAddr,
}
