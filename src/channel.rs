use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{Mutex, MutexGuard},
    task::JoinHandle,
    time::{timeout, Instant},
};
use tracing::{debug, error, trace, warn};

use crate::{
    config::Config,
    error::{ChannelError, Result},
    resp::{DecodeStep, ReplyDecoder, ReplyKind},
};

/**
 * Command channel over one transport.
 *
 * Handles are cheap to clone and all refer to the same transport. The transport
 * lives inside a session behind an async mutex: whoever holds the session guard
 * owns the wire, so at most one command is ever in flight. Other callers wait on
 * the mutex instead of spinning. The transport is dropped with the last handle.
 *
 * The wire must sit on a reply boundary whenever the guard is released. A reply
 * that cannot be drained completely (deadline passed, rejected past its first
 * header line, caller dropped the future) closes the connection, so its late
 * bytes are never read as the reply to a later command.
 */
pub struct Connection<T> {
    inner: Arc<Shared<T>>,
}

struct Shared<T> {
    session: Mutex<Session<T>>,
    open: AtomicBool,
    last_command_time: parking_lot::Mutex<Option<Instant>>,
    config: Config,
}

struct Session<T> {
    stream: T,
    read_buf: BytesMut,
    decoder: ReplyDecoder,
    /** Set while a command is being written or its reply drained; still set on the next acquire means the holder was dropped mid-frame */
    in_flight: bool,
    /** Replies owed to commands written with `send` */
    unread_replies: usize,
}

impl<T> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("open", &self.inner.open.load(Ordering::SeqCst))
            .field("locked", &self.inner.session.try_lock().is_err())
            .finish()
    }
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: T, config: Config) -> Self {
        let session = Session {
            stream,
            read_buf: BytesMut::with_capacity(config.read_buffer_capacity),
            decoder: ReplyDecoder::new(),
            in_flight: false,
            unread_replies: 0,
        };

        Self {
            inner: Arc::new(Shared {
                session: Mutex::new(session),
                open: AtomicBool::new(true),
                last_command_time: parking_lot::Mutex::new(None),
                config,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        !self.inner.open.load(Ordering::SeqCst)
    }

    /** True while a command holds the wire */
    pub fn is_locked(&self) -> bool {
        self.inner.session.try_lock().is_err()
    }

    pub fn is_available(&self) -> bool {
        !self.is_closed() && !self.is_locked()
    }

    /** When the most recent command finished writing */
    pub fn last_command_time(&self) -> Option<Instant> {
        *self.inner.last_command_time.lock()
    }

    /**
     * Sends `command` and drains its reply, calling `sink` once per decoded scalar.
     *
     * An error reply leaves the connection open. A timeout, a reply rejected
     * part way through, or a vanished peer closes it.
     */
    pub async fn exec<F: FnMut(Bytes)>(&self, command: &str, mut sink: F) -> Result<ReplyKind> {
        self.check_ready(command)?;
        let mut session = self.acquire().await?;
        self.skip_unread(&mut session).await?;
        self.write_command(&mut session, command).await?;

        self.finish_reply(&mut session, command_name(command), &mut sink).await
    }

    /**
     * Buffered form of `exec`: every sink value, in wire order
     */
    pub async fn exec_collect(&self, command: &str) -> Result<Vec<Bytes>> {
        let mut values = vec![];
        self.exec(command, |value| values.push(value)).await?;

        Ok(values)
    }

    /**
     * Writes `command` without waiting for a reply. Still waits for the wire.
     * The reply is drained and dropped before the next command that reads one.
     */
    pub async fn send(&self, command: &str) -> Result<()> {
        self.check_ready(command)?;
        let mut session = self.acquire().await?;

        self.write_command(&mut session, command).await?;
        session.in_flight = false;
        session.unread_replies += 1;
        Ok(())
    }

    /**
     * Writes `command` and returns whatever a single read yields, undecoded.
     * Unless those bytes are exactly one complete reply the connection is closed,
     * since the rest of the reply may still be on its way.
     */
    pub async fn raw(&self, command: &str) -> Result<Bytes> {
        self.check_ready(command)?;
        let mut session = self.acquire().await?;
        self.skip_unread(&mut session).await?;
        self.write_command(&mut session, command).await?;

        let deadline = self.inner.config.reply_timeout;
        let Session { stream, read_buf, decoder, in_flight, .. } = &mut *session;

        let bytes = match timeout(deadline, stream.read_buf(read_buf)).await {
            Ok(Ok(0)) => return Err(self.mark_closed("peer closed the connection")),
            Ok(Ok(_)) => read_buf.split().freeze(),
            Ok(Err(err)) => return Err(self.mark_closed(&err.to_string())),
            Err(_) => {
                self.mark_closed("no raw reply before deadline");
                return Err(ChannelError::Timeout(deadline))
            },
        };

        decoder.reset();
        let mut rest = BytesMut::from(&bytes[..]);
        match decoder.resume(&mut rest, &mut |_: Bytes| {}) {
            Ok(DecodeStep::Done(_)) if rest.is_empty() => *in_flight = false,
            Err(_) if !decoder.framing_lost() && rest.is_empty() => *in_flight = false,
            _ => {
                self.mark_closed("raw read ended off a reply boundary");
            },
        }
        Ok(bytes)
    }

    /**
     * Marks the connection closed and shuts the transport down.
     * Waits for an in-flight command to finish first.
     */
    pub async fn close(&self) {
        if !self.inner.open.swap(false, Ordering::SeqCst) {
            return
        }

        let mut session = self.inner.session.lock().await;
        if let Err(err) = session.stream.shutdown().await {
            debug!(%err, "transport shutdown failed");
        }
        debug!("connection closed");
    }

    fn check_ready(&self, command: &str) -> Result<()> {
        if command.trim().is_empty() {
            return Err(ChannelError::Precondition("command is empty"))
        }
        if self.is_closed() {
            return Err(ChannelError::ConnectionClosed)
        }
        Ok(())
    }

    async fn acquire(&self) -> Result<MutexGuard<'_, Session<T>>> {
        if self.is_locked() {
            trace!("waiting for in-flight command");
        }
        let session = self.inner.session.lock().await;

        if session.in_flight {
            warn!("previous command was abandoned mid-reply");
            return Err(self.mark_closed("previous command abandoned mid-reply"))
        }
        // The connection may have died while we waited
        if self.is_closed() {
            return Err(ChannelError::ConnectionClosed)
        }
        Ok(session)
    }

    /**
     * Drains and drops the replies owed to earlier `send` calls
     */
    async fn skip_unread(&self, session: &mut Session<T>) -> Result<()> {
        while session.unread_replies > 0 {
            session.in_flight = true;
            match self.finish_reply(session, "unread reply", &mut |_: Bytes| {}).await {
                Ok(_) => {},
                Err(err) if err.is_protocol() && !self.is_closed() => {
                    debug!(%err, "dropped error reply of sent command")
                },
                Err(err) => {
                    session.unread_replies = 0;
                    return Err(err)
                },
            }
            session.unread_replies -= 1;
        }
        Ok(())
    }

    async fn write_command(&self, session: &mut Session<T>, command: &str) -> Result<()> {
        if !session.read_buf.is_empty() {
            warn!(bytes = session.read_buf.len(), "discarding unsolicited bytes");
            session.read_buf.clear();
        }

        let mut line = BytesMut::with_capacity(command.len() + 2);
        line.extend_from_slice(command.as_bytes());
        if !command.ends_with('\n') {
            line.extend_from_slice(b"\r\n");
        }

        debug!(command = command_name(command), "sending command");
        session.in_flight = true;
        if let Err(err) = session.write_all(&line).await {
            return Err(self.mark_closed(&err.to_string()))
        }

        *self.inner.last_command_time.lock() = Some(Instant::now());
        Ok(())
    }

    /**
     * Drains one reply under the reply deadline and decides whether the wire is
     * still usable afterwards
     */
    async fn finish_reply<F: FnMut(Bytes)>(&self, session: &mut Session<T>, name: &str, sink: &mut F) -> Result<ReplyKind> {
        let deadline = self.inner.config.reply_timeout;
        let result = match timeout(deadline, self.drain_reply(session, sink)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(command = name, ?deadline, "no reply before deadline");
                self.mark_closed("reply deadline passed mid-reply");
                Err(ChannelError::Timeout(deadline))
            }
        };

        if let Err(ChannelError::Protocol(line)) = &result {
            error!(command = name, %line, "reply rejected");
            if session.decoder.framing_lost() {
                self.mark_closed("reply rejected mid-frame");
            }
        }

        session.in_flight = false;
        result
    }

    async fn drain_reply<F: FnMut(Bytes)>(&self, session: &mut Session<T>, sink: &mut F) -> Result<ReplyKind> {
        let Session { stream, read_buf, decoder, .. } = session;
        decoder.reset();

        loop {
            if let DecodeStep::Done(kind) = decoder.resume(read_buf, sink)? {
                debug!(?kind, "reply drained");
                return Ok(kind)
            }

            match stream.read_buf(read_buf).await {
                Ok(0) => return Err(self.mark_closed("peer closed the connection")),
                Ok(read) => trace!(read, state = ?decoder.state(), "resuming decode"),
                Err(err) => return Err(self.mark_closed(&err.to_string())),
            }
        }
    }

    fn mark_closed(&self, reason: &str) -> ChannelError {
        if self.inner.open.swap(false, Ordering::SeqCst) {
            debug!(reason, "connection gone");
        }
        ChannelError::ConnectionClosed
    }
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /**
     * Runs `exec` on the runtime and returns straight away
     */
    pub fn exec_detached<F>(&self, command: impl Into<String>, sink: F) -> JoinHandle<Result<ReplyKind>>
    where
        F: FnMut(Bytes) + Send + 'static,
    {
        let connection = self.clone();
        let command = command.into();

        tokio::spawn(async move { connection.exec(&command, sink).await })
    }
}

impl<T: AsyncWrite + Unpin> Session<T> {
    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }
}

/** Only the command name is logged so credentials never reach the logs */
fn command_name(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use once_cell::sync::Lazy;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    use crate::resp::RESPToken;

    static TRACING: Lazy<()> = Lazy::new(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });

    type Server = BufReader<DuplexStream>;

    fn connection() -> (Connection<DuplexStream>, Server) {
        Lazy::force(&TRACING);
        let (client, server) = duplex(4096);
        (Connection::new(client, Config::default()), BufReader::new(server))
    }

    async fn reply(server: &mut Server, wire: &str) {
        server.get_mut().write_all(wire.as_bytes()).await.unwrap();
    }

    async fn next_command(server: &mut Server) -> String {
        let mut line = String::new();
        server.read_line(&mut line).await.unwrap();
        line
    }

    fn bulk(value: &str) -> String {
        format!("{}{}\r\n", RESPToken::BulkHeader(value.len()).to_string(), value)
    }

    #[tokio::test]
    async fn should_get_bulk_string() {
        let (conn, mut server) = connection();
        reply(&mut server, "$3\r\nbar\r\n").await;

        let values = conn.exec_collect("GET foo").await.unwrap();

        assert_eq!(vec![Bytes::from_static(b"bar")], values);
        assert_eq!("GET foo\r\n", next_command(&mut server).await);
        assert!(!conn.is_locked());
    }

    #[tokio::test]
    async fn should_increment_integer() {
        let (conn, mut server) = connection();
        reply(&mut server, ":42\r\n").await;

        let mut received = vec![];
        let kind = conn.exec("INCR x", |value| received.push(value)).await.unwrap();

        assert_eq!(ReplyKind::Integer, kind);
        assert_eq!(vec![Bytes::from_static(b"42")], received);
        assert!(conn.is_available());
    }

    #[tokio::test]
    async fn should_stream_array_elements_in_order() {
        let (conn, mut server) = connection();
        reply(&mut server, "*2\r\n$1\r\na\r\n$1\r\nb\r\n").await;

        let mut received = vec![];
        let kind = conn.exec("LRANGE x 0 -1", |value| received.push(value)).await.unwrap();

        assert_eq!(ReplyKind::Array(2), kind);
        assert_eq!(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")], received);
    }

    #[tokio::test]
    async fn should_not_call_sink_for_missing_key() {
        let (conn, mut server) = connection();
        reply(&mut server, "$-1\r\n").await;

        let mut calls = 0;
        let kind = conn.exec("GET missing", |_| calls += 1).await.unwrap();

        assert_eq!(ReplyKind::Null, kind);
        assert_eq!(0, calls);
    }

    #[tokio::test]
    async fn should_keep_connection_after_error_reply() {
        let (conn, mut server) = connection();
        reply(&mut server, "-ERR unknown command 'FOO'\r\n").await;

        let err = conn.exec_collect("FOO").await.unwrap_err();
        match err {
            ChannelError::Protocol(line) => assert_eq!("-ERR unknown command 'FOO'", line),
            other => panic!("expected protocol error, got {:?}", other),
        }
        assert!(!conn.is_closed());
        assert!(!conn.is_locked());

        reply(&mut server, "+PONG\r\n").await;
        assert_eq!(ReplyKind::Status, conn.exec("PING", |_| {}).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn should_resume_across_partial_reads() {
        let (conn, mut server) = connection();

        let responder = tokio::spawn(async move {
            assert_eq!("LRANGE l 0 1\r\n", next_command(&mut server).await);
            for chunk in ["*2\r\n$5\r\nhel", "lo\r\n$5", "\r\nworld", "\r\n"] {
                reply(&mut server, chunk).await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            server
        });

        let values = conn.exec_collect("LRANGE l 0 1").await.unwrap();
        responder.await.unwrap();

        assert_eq!(vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world")], values);
    }

    #[tokio::test(start_paused = true)]
    async fn should_time_out_close_and_release_lock() {
        let (conn, _server) = connection();

        let mut calls = 0;
        let err = conn.exec("BLPOP q 0", |_| calls += 1).await.unwrap_err();

        assert!(matches!(err, ChannelError::Timeout(deadline) if deadline == Duration::from_secs(1)));
        assert_eq!(0, calls);
        assert!(!conn.is_locked());
        assert!(conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn should_never_hand_late_reply_to_next_command() {
        let (conn, mut server) = connection();

        let err = conn.exec_collect("GET a").await.unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));

        reply(&mut server, "$5\r\nvalA!\r\n").await;
        reply(&mut server, "$4\r\nvalB\r\n").await;

        assert!(matches!(conn.exec_collect("GET b").await, Err(ChannelError::ConnectionClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn should_close_when_reply_is_rejected_mid_frame() {
        let (conn, mut server) = connection();
        reply(&mut server, "*2\r\n*1\r\n").await;

        match conn.exec_collect("LRANGE nested 0 -1").await {
            Err(ChannelError::Protocol(message)) => assert!(message.contains("nested")),
            other => panic!("expected protocol error, got {:?}", other),
        }
        assert!(conn.is_closed());
        assert!(!conn.is_locked());

        reply(&mut server, "$1\r\na\r\n:7\r\n").await;
        assert!(matches!(conn.exec_collect("LLEN nested").await, Err(ChannelError::ConnectionClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn should_close_when_exec_is_dropped_mid_reply() {
        let (conn, mut server) = connection();

        let pending = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.exec_collect("GET big").await })
        };
        assert_eq!("GET big\r\n", next_command(&mut server).await);
        reply(&mut server, "$10\r\nhalf").await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());

        reply(&mut server, "-data\r\n:1\r\n").await;
        assert!(matches!(conn.exec_collect("EXISTS k").await, Err(ChannelError::ConnectionClosed)));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn should_drop_reply_of_sent_command_before_next_exec() {
        let (conn, mut server) = connection();

        conn.send("SET k v").await.unwrap();
        conn.send("SET broken").await.unwrap();

        let responder = tokio::spawn(async move {
            let mut received = vec![next_command(&mut server).await, next_command(&mut server).await];
            reply(&mut server, "+OK\r\n").await;
            reply(&mut server, "-ERR wrong number of arguments for 'set' command\r\n").await;

            received.push(next_command(&mut server).await);
            reply(&mut server, "$1\r\nv\r\n").await;
            (received, server)
        });

        let values = conn.exec_collect("GET k").await.unwrap();
        let (received, _server) = responder.await.unwrap();

        assert_eq!(vec![Bytes::from_static(b"v")], values);
        assert_eq!(vec!["SET k v\r\n", "SET broken\r\n", "GET k\r\n"], received);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn should_report_connection_gone_when_peer_closes() {
        let (conn, mut server) = connection();
        reply(&mut server, "$10\r\npart").await;

        let reader = tokio::spawn(async move {
            next_command(&mut server).await;
            drop(server);
        });

        let mut calls = 0;
        let err = conn.exec("GET k", |_| calls += 1).await.unwrap_err();
        reader.await.unwrap();

        assert!(matches!(err, ChannelError::ConnectionClosed));
        assert_eq!(0, calls);
        assert!(conn.is_closed());
        assert!(!conn.is_locked());
        assert!(matches!(conn.exec_collect("PING").await, Err(ChannelError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn should_reject_empty_command() {
        let (conn, _server) = connection();

        let err = conn.exec("  ", |_| {}).await.unwrap_err();

        assert!(matches!(err, ChannelError::Precondition(_)));
        assert!(conn.last_command_time().is_none());
    }

    #[tokio::test]
    async fn should_send_without_decoding() {
        let (conn, mut server) = connection();

        conn.send("PUBLISH news hello").await.unwrap();

        assert_eq!("PUBLISH news hello\r\n", next_command(&mut server).await);
        assert!(conn.last_command_time().is_some());
        assert!(!conn.is_locked());
    }

    #[tokio::test]
    async fn should_not_double_terminate_command() {
        let (conn, mut server) = connection();

        conn.send("PING\n").await.unwrap();
        conn.send("PING\r\n").await.unwrap();

        assert_eq!("PING\n", next_command(&mut server).await);
        assert_eq!("PING\r\n", next_command(&mut server).await);
    }

    #[tokio::test]
    async fn should_return_raw_bytes() {
        let (conn, mut server) = connection();
        reply(&mut server, "+PONG\r\n").await;

        let bytes = conn.raw("PING").await.unwrap();

        assert_eq!(Bytes::from_static(b"+PONG\r\n"), bytes);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn should_close_after_raw_read_of_partial_reply() {
        let (conn, mut server) = connection();
        reply(&mut server, "$10\r\nhal").await;

        let bytes = conn.raw("GET big").await.unwrap();

        assert_eq!(Bytes::from_static(b"$10\r\nhal"), bytes);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn should_show_state_in_debug_output() {
        let (conn, _server) = connection();

        assert_eq!("Connection { open: true, locked: false }", format!("{:?}", conn));
        conn.close().await;
        assert_eq!("Connection { open: false, locked: false }", format!("{:?}", conn));
    }

    #[tokio::test(start_paused = true)]
    async fn should_serialise_concurrent_commands() {
        let (conn, mut server) = connection();

        let first = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.exec_collect("GET a").await })
        };
        assert_eq!("GET a\r\n", next_command(&mut server).await);

        let second = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.exec_collect("GET b").await })
        };

        // Second command must not reach the wire while the first is in flight
        let mut early = String::new();
        let waited = tokio::time::timeout(Duration::from_millis(100), server.read_line(&mut early)).await;
        assert!(waited.is_err());
        assert!(conn.is_locked());

        reply(&mut server, &bulk("1")).await;
        assert_eq!("GET b\r\n", next_command(&mut server).await);
        reply(&mut server, &bulk("2")).await;

        assert_eq!(vec![Bytes::from_static(b"1")], first.await.unwrap().unwrap());
        assert_eq!(vec![Bytes::from_static(b"2")], second.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn should_run_detached_exec() {
        let (conn, mut server) = connection();
        reply(&mut server, "*0\r\n").await;

        let handle = conn.exec_detached("SMEMBERS empty", |_| panic!("no elements expected"));

        assert_eq!(ReplyKind::Array(0), handle.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn should_refuse_commands_after_close() {
        let (conn, _server) = connection();

        conn.close().await;
        conn.close().await;

        assert!(conn.is_closed());
        assert!(!conn.is_available());
        assert!(matches!(conn.send("PING").await, Err(ChannelError::ConnectionClosed)));
    }
}
