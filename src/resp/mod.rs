/**
 * RESP - Redis Serialisation Protocol (client side subset)
 * https://redis.io/docs/reference/protocol-spec/
 */

pub mod token;
pub mod reply;
pub mod decoder;
pub mod format;

pub use decoder::{DecodeState, DecodeStep, ReplyDecoder};
pub use format::format_command;
pub use reply::ReplyKind;
pub use token::RESPToken;
