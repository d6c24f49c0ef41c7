/*!
 * Single-flight Redis command channel
 *
 * One command at a time per connection: the command line is written, the reply
 * is drained by a resumable RESP decoder and every scalar is handed to a sink.
 */

pub mod error;
pub mod config;
pub mod resp;
pub mod channel;
pub mod client;

pub use channel::Connection;
pub use client::{connect, connect_tls, RedisUri, TcpConnection, TlsConnection};
pub use config::Config;
pub use error::{ChannelError, Result};
pub use resp::{format_command, ReplyKind};
