//! LAN chat with a datagram message channel and a stream file channel.
//!
//! Text messages travel as small binary packets over UDP; the server keeps a
//! roster of logged-in clients and re-broadcasts every packet to the others.
//! Whole files travel over a separate TCP connection per client and are
//! relayed frame-by-frame to every other connected client.
//!
//! - [`packet`] is the binary wire format of the message channel.
//! - [`frame`] interprets the length-delimited frames of the file channel.
//! - [`roster`] tracks logged-in participants by message-channel address.
//! - [`broadcast`] is the server's datagram loop: roster updates and fan-out.
//! - [`relay`] accepts file connections and relays frames between them.
//! - [`server`] runs both engines and drains file connections on shutdown.
//! - [`session`] is the client coordinator for both channels.
//! - [`cli`] and [`client`] are the command-line surface and terminal UI.
//!
//! Login and file connections are tied together by the [`packet::SessionId`]
//! the server hands back in its Welcome packet; the client echoes it in an
//! attach frame on the file channel.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod frame;
pub mod packet;
pub mod relay;
pub mod roster;
pub mod server;
pub mod session;

pub const DEFAULT_MESSAGE_PORT: u16 = 8080;
pub const DEFAULT_FILE_PORT: u16 = 8081;
