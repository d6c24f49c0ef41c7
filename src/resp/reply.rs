/**
 * Shape of a fully drained reply.
 * Payloads never live here: every scalar goes through the sink as it is decoded.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Status,
    Integer,
    Bulk,
    Null,
    Array(usize)
}
