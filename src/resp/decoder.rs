use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use super::{reply::ReplyKind, token::RESPToken};
use crate::error::{ChannelError, Result};

// A header line longer than this without a terminator is not a reply header
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

const CRLF: &[u8] = b"\r\n";
const CRLF_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    AwaitLine,
    ReadBulk,
    Done,
    Failed
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStep {
    /** Not enough bytes buffered yet; resume once more arrive */
    Suspended,
    Done(ReplyKind)
}

/**
 * Resumable decoder for exactly one reply.
 *
 * The decoder never touches the transport: the caller appends whatever bytes
 * arrived to `input` and calls `resume` again. Consumed bytes are split off
 * `input`, a partially received bulk payload is kept in the accumulator, so
 * nothing is lost between turns.
 */
#[derive(Debug)]
pub struct ReplyDecoder {
    state: DecodeState,
    kind: Option<ReplyKind>,
    pending_elements: usize,
    expected_bulk_length: usize,
    accumulated: BytesMut,
    last_line: String,
    overflowed: bool,
}

impl Default for ReplyDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::AwaitLine,
            kind: None,
            pending_elements: 0,
            expected_bulk_length: 0,
            accumulated: BytesMut::new(),
            last_line: String::new(),
            overflowed: false,
        }
    }

    /**
     * Forgets everything about the previous reply
     */
    pub fn reset(&mut self) {
        self.state = DecodeState::AwaitLine;
        self.kind = None;
        self.pending_elements = 0;
        self.expected_bulk_length = 0;
        self.accumulated.clear();
        self.last_line.clear();
        self.overflowed = false;
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    pub fn last_line(&self) -> &str {
        &self.last_line
    }

    /**
     * True when decoding failed somewhere past the first header line, so the rest
     * of the reply may still be on its way and the stream is no longer at a
     * reply boundary
     */
    pub fn framing_lost(&self) -> bool {
        self.state == DecodeState::Failed && (self.kind.is_some() || self.overflowed)
    }

    /**
     * Drives the state machine as far as the buffered bytes allow.
     * `sink` is called once per decoded scalar, in wire order.
     */
    pub fn resume<F: FnMut(Bytes)>(&mut self, input: &mut BytesMut, sink: &mut F) -> Result<DecodeStep> {
        loop {
            match self.state {
                DecodeState::AwaitLine => {
                    let line = match take_line(input) {
                        Some(line) => line,
                        None if input.len() > MAX_LINE_LENGTH => {
                            self.overflowed = true;
                            return self.fail(ChannelError::Protocol(format!(
                                "reply header exceeds {} bytes without terminator", MAX_LINE_LENGTH
                            )))
                        },
                        None => return Ok(DecodeStep::Suspended),
                    };
                    self.last_line = line;

                    if let Err(err) = self.dispatch(sink) {
                        return self.fail(err)
                    }
                },
                DecodeState::ReadBulk => {
                    let missing = self.expected_bulk_length - self.accumulated.len();
                    let available = missing.min(input.len());
                    self.accumulated.extend_from_slice(&input[..available]);
                    input.advance(available);

                    if self.accumulated.len() < self.expected_bulk_length {
                        trace!(
                            received = self.accumulated.len(),
                            expected = self.expected_bulk_length,
                            "bulk payload incomplete"
                        );
                        return Ok(DecodeStep::Suspended)
                    }

                    if !self.accumulated.ends_with(CRLF) {
                        return self.fail(ChannelError::Protocol(format!(
                            "bulk payload not terminated by CRLF after '{}'", self.last_line
                        )))
                    }

                    let payload = self.accumulated
                        .split_to(self.expected_bulk_length - CRLF_LEN)
                        .freeze();
                    self.accumulated.clear();

                    sink(payload);
                    self.element_done();
                },
                DecodeState::Done => {
                    return Ok(DecodeStep::Done(self.kind.unwrap_or(ReplyKind::Status)))
                },
                DecodeState::Failed => {
                    return Err(ChannelError::Protocol(self.last_line.clone()))
                },
            }
        }
    }

    fn dispatch<F: FnMut(Bytes)>(&mut self, sink: &mut F) -> Result<()> {
        let token = RESPToken::from_line(&self.last_line)?;
        let in_array = matches!(self.kind, Some(ReplyKind::Array(_)));
        trace!(line = %self.last_line, in_array, "reply header");

        match token {
            RESPToken::Error(_) => {
                return Err(ChannelError::Protocol(self.last_line.clone()))
            },
            RESPToken::BulkHeader(size) => {
                if !in_array {
                    self.kind = Some(ReplyKind::Bulk);
                    self.pending_elements = 1;
                }
                self.expected_bulk_length = size + CRLF_LEN;
                self.accumulated.clear();
                self.accumulated.reserve(self.expected_bulk_length.min(MAX_LINE_LENGTH));
                self.state = DecodeState::ReadBulk;
            },
            RESPToken::Integer(text) => {
                sink(Bytes::from(text));
                if in_array {
                    self.element_done()
                } else {
                    self.finish(ReplyKind::Integer)
                }
            },
            RESPToken::SimpleString(_) | RESPToken::Null if in_array => self.element_done(),
            RESPToken::ArraySize(_) | RESPToken::NullArray if in_array => {
                return Err(ChannelError::Protocol(
                    format!("nested arrays are not supported: {}", self.last_line)
                ))
            },
            RESPToken::SimpleString(_) => self.finish(ReplyKind::Status),
            RESPToken::Null | RESPToken::NullArray => self.finish(ReplyKind::Null),
            RESPToken::ArraySize(0) => self.finish(ReplyKind::Array(0)),
            RESPToken::ArraySize(size) => {
                self.kind = Some(ReplyKind::Array(size));
                self.pending_elements = size;
                self.state = DecodeState::AwaitLine;
            },
        }
        Ok(())
    }

    fn element_done(&mut self) {
        self.pending_elements = self.pending_elements.saturating_sub(1);
        self.state = if self.pending_elements > 0 {
            DecodeState::AwaitLine
        } else {
            DecodeState::Done
        };
    }

    fn finish(&mut self, kind: ReplyKind) {
        self.kind = Some(kind);
        self.state = DecodeState::Done;
    }

    fn fail(&mut self, err: ChannelError) -> Result<DecodeStep> {
        self.state = DecodeState::Failed;
        Err(err)
    }
}

/**
 * Splits one `\n` terminated line off the front of `input`, dropping the terminator
 * and a preceding `\r`
 */
fn take_line(input: &mut BytesMut) -> Option<String> {
    let end = input.iter().position(|b| *b == b'\n')?;
    let line = input.split_to(end + 1);
    let text = &line[..end];
    let text = text.strip_suffix(&b"\r"[..]).unwrap_or(text);

    Some(String::from_utf8_lossy(text).into_owned())
}
