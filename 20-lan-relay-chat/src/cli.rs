use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use clap::{Args, Parser, Subcommand};

use crate::{
    DEFAULT_FILE_PORT, DEFAULT_MESSAGE_PORT, frame::DEFAULT_MAX_FRAME_LEN, server::ServerConfig,
    session::SessionConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server on the message and file channels.
    Server(ServerArgs),
    /// Log in to a server and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// UDP address for chat packets. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub message_addr: SocketAddr,

    /// TCP address for file transfers. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:8081")]
    pub file_addr: SocketAddr,

    /// Largest file frame accepted from a client, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_bytes: usize,

    /// Stop waiting for open file connections after this many seconds.
    #[arg(long)]
    pub drain_timeout_secs: Option<u64>,
}

impl ServerArgs {
    pub fn config(&self) -> ServerConfig {
        ServerConfig {
            message_addr: self.message_addr,
            file_addr: self.file_addr,
            max_frame_len: self.max_frame_bytes,
            drain_timeout: self.drain_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name announced to the other participants.
    #[arg(long)]
    pub name: String,

    /// Address of the chat server.
    #[arg(long, default_value = "127.0.0.1")]
    pub server_ip: IpAddr,

    #[arg(long, default_value_t = DEFAULT_MESSAGE_PORT)]
    pub message_port: u16,

    #[arg(long, default_value_t = DEFAULT_FILE_PORT)]
    pub file_port: u16,

    /// Directory where received files are saved. Files are only announced
    /// when unset.
    #[arg(long)]
    pub download_dir: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_bytes: usize,
}

impl ClientArgs {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            name: self.name.clone(),
            message_server: SocketAddr::new(self.server_ip, self.message_port),
            file_server: SocketAddr::new(self.server_ip, self.file_port),
            max_frame_len: self.max_frame_bytes,
        }
    }
}
