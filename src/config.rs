//! Startup configuration.
//!
//! The command-line surface mirrors the operator's mental model:
//! exactly one of --send / --receive, plus addressing and audio
//! format options. RTCP always uses port+1 on both sides.

use clap::Parser;

use crate::error::ConfigError;

/// Operating role of this node. Exactly one per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Read audio locally and transmit it to the remote node
    Send,
    /// Receive audio from the remote node and play it locally
    Receive,
}

/// Parsed startup options. Immutable after parse.
#[derive(Parser, Debug, Clone)]
#[command(name = "audio-link", about = "stream audio from one network node to another")]
pub struct Config {
    /// Enable sending audio to the remote node
    #[arg(short = 's', long)]
    pub send: bool,

    /// Enable receiving audio from the remote node
    #[arg(short = 'c', long)]
    pub receive: bool,

    /// Amount of ms to buffer in the jitterbuffers
    #[arg(short = 'l', long, default_value_t = 200)]
    pub latency: u32,

    /// Address (IPv4 / IPv6) to send packets to
    #[arg(short = 'a', long, default_value = "")]
    pub remote_address: String,

    /// Port to send RTP packets (and RTCP in port+1)
    #[arg(short = 'p', long, default_value_t = 5000)]
    pub remote_port: u16,

    /// Local address (IPv4 / IPv6) to bind to
    #[arg(short = 'b', long, default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Port to bind to
    #[arg(short = 't', long, default_value_t = 5000)]
    pub bind_port: u16,

    /// Audio sample rate
    #[arg(short = 'r', long, default_value_t = 48000)]
    pub bitrate: u32,

    /// Number of audio channels
    #[arg(short = 'n', long, default_value_t = 2)]
    pub channels: u16,

    /// The name of the audio client
    #[arg(short = 'j', long)]
    pub client_name: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            send: false,
            receive: false,
            latency: 200,
            remote_address: String::new(),
            remote_port: 5000,
            bind_address: "0.0.0.0".to_string(),
            bind_port: 5000,
            bitrate: 48000,
            channels: 2,
            client_name: None,
        }
    }
}

impl Config {
    /// Resolve the operating role from the mode flags.
    ///
    /// Both or neither flag set is a configuration error and no
    /// topology is built.
    pub fn role(&self) -> Result<Role, ConfigError> {
        match (self.send, self.receive) {
            (true, false) => Ok(Role::Send),
            (false, true) => Ok(Role::Receive),
            _ => Err(ConfigError::RoleConflict),
        }
    }
}
