use std::{net::SocketAddr, time::Duration};

use clap::Parser;

use crate::{
    error::ConfigError,
    message::DEFAULT_MAX_FRAME_LEN,
    relay::{DEFAULT_BODY_TIMEOUT, DEFAULT_CHUNK_SIZE},
    server::{DEFAULT_OUTBOUND_QUEUE, RelayConfig},
};

/// Relay hub for named peers exchanging messages and files over TCP.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address to listen on. Use port 0 for an ephemeral port.
    #[arg(long, env = "RELAY_HUB_LISTEN", default_value = "0.0.0.0:9009")]
    pub listen: SocketAddr,

    /// Largest chunk, in bytes, copied per step while relaying a file body.
    #[arg(long, env = "RELAY_HUB_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Frames queued for a slow client before further frames to it are dropped.
    #[arg(long, env = "RELAY_HUB_OUTBOUND_QUEUE", default_value_t = DEFAULT_OUTBOUND_QUEUE)]
    pub outbound_queue: usize,

    /// Longest control line, in bytes, accepted from a client.
    #[arg(long, env = "RELAY_HUB_MAX_FRAME_LEN", default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_len: usize,

    /// Seconds a file body may go without new bytes before the sender is dropped.
    #[arg(
        long,
        env = "RELAY_HUB_BODY_TIMEOUT_SECS",
        default_value_t = DEFAULT_BODY_TIMEOUT.as_secs()
    )]
    pub body_timeout_secs: u64,
}

impl TryFrom<&Cli> for RelayConfig {
    type Error = ConfigError;

    fn try_from(cli: &Cli) -> Result<Self, Self::Error> {
        let non_zero = |value: usize, field: &'static str| {
            if value == 0 {
                Err(ConfigError::Zero { field })
            } else {
                Ok(value)
            }
        };

        Ok(RelayConfig {
            chunk_size: non_zero(cli.chunk_size, "chunk-size")?,
            outbound_queue: non_zero(cli.outbound_queue, "outbound-queue")?,
            max_frame_len: non_zero(cli.max_frame_len, "max-frame-len")?,
            body_timeout: match cli.body_timeout_secs {
                0 => {
                    return Err(ConfigError::Zero {
                        field: "body-timeout-secs",
                    });
                }
                secs => Duration::from_secs(secs),
            },
        })
    }
}
