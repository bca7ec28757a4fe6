// Client-side stream adapter: a connection-shaped object whose reads and
// writes are single request/reply exchanges over the bus.
use bytes::Bytes;
use culvert_bus::{Bus, BusError, Headers, Message};
use culvert_wire::{
    ADDR_HEADER, CONN_TOKEN_HEADER, ConnToken, ERR_HEADER, Endpoint, NETWORK_HEADER, Op,
    READ_DEADLINE_HEADER, READ_SIZE_HEADER, WRITE_DEADLINE_HEADER, encode_deadline,
    operation_subject, parse_write_count,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::debug;

mod io;

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("generate connection token: {0}")]
    Token(#[source] culvert_wire::Error),
    #[error("bus request: {0}")]
    Bus(#[from] BusError),
    #[error("remote: {0}")]
    Remote(String),
    #[error("message too long")]
    MessageTooLong,
    #[error("parse write count: {0}")]
    InvalidWriteCount(#[source] culvert_wire::Error),
    #[error("stream closed")]
    Closed,
}

impl From<StreamError> for std::io::Error {
    fn from(err: StreamError) -> std::io::Error {
        use std::io::ErrorKind;
        let kind = match &err {
            StreamError::Bus(BusError::Timeout(_)) => ErrorKind::TimedOut,
            StreamError::Bus(_) => ErrorKind::ConnectionReset,
            StreamError::Remote(_) => ErrorKind::Other,
            StreamError::MessageTooLong | StreamError::InvalidWriteCount(_) => {
                ErrorKind::InvalidData
            }
            StreamError::Closed => ErrorKind::NotConnected,
            StreamError::Token(_) => ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

// Bound on how long a best-effort CLOSE round trip may block.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection-shaped stream tunneled over the bus.
///
/// Every operation is one request/reply against the proxy listening on the
/// shared subject prefix; the per-stream identity token routes all of them to
/// the same pooled connection on the far side. Deadlines are local state,
/// serialized into the next operation's headers.
///
/// Concurrent reads (or concurrent writes) from multiple callers are not
/// serialized; callers that need ordering must not share one stream.
pub struct BusStream {
    inner: Arc<StreamInner>,
    read_in_flight: Option<io::ReadInFlight>,
    write_in_flight: Option<io::WriteInFlight>,
    shutdown_in_flight: Option<io::ShutdownInFlight>,
}

pub(crate) struct StreamInner {
    bus: Arc<dyn Bus>,
    subject: String,
    endpoint: Endpoint,
    token: ConnToken,
    read_deadline: Mutex<Option<SystemTime>>,
    write_deadline: Mutex<Option<SystemTime>>,
    closed: AtomicBool,
}

impl BusStream {
    /// Build a stream to `endpoint` tunneled through the proxy on `subject`.
    /// Generates the stream's identity token; construction fails only if the
    /// OS randomness source does.
    pub fn new(bus: Arc<dyn Bus>, subject: impl Into<String>, endpoint: Endpoint) -> Result<Self> {
        let token = ConnToken::generate().map_err(StreamError::Token)?;
        Ok(Self {
            inner: Arc::new(StreamInner {
                bus,
                subject: subject.into(),
                endpoint,
                token,
                read_deadline: Mutex::new(None),
                write_deadline: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
            read_in_flight: None,
            write_in_flight: None,
            shutdown_in_flight: None,
        })
    }

    /// Read up to `buf.len()` bytes. A zero-length reply with no error is a
    /// legitimate zero-byte read.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let payload = self.inner.read_op(buf.len()).await?;
        buf[..payload.len()].copy_from_slice(&payload);
        Ok(payload.len())
    }

    /// Write `buf`, returning the count the proxy reports written.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.inner.write_op(Bytes::copy_from_slice(buf)).await
    }

    /// Release the proxy's pooled stream. Idempotent and bounded: the CLOSE
    /// round trip is capped at a fixed timeout, and a bus delivery failure is
    /// logged rather than returned (the send is best-effort). A failure
    /// reported by the proxy itself is returned. Later operations on this
    /// stream fail with [`StreamError::Closed`].
    pub async fn close(&self) -> Result<()> {
        self.inner.close_op().await
    }

    /// Set both deadlines. `None` means "no deadline". Takes effect on the
    /// next operation.
    pub fn set_deadline(&self, deadline: Option<SystemTime>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn set_read_deadline(&self, deadline: Option<SystemTime>) {
        *self.inner.read_deadline.lock().expect("deadline lock") = deadline;
    }

    pub fn set_write_deadline(&self, deadline: Option<SystemTime>) {
        *self.inner.write_deadline.lock().expect("deadline lock") = deadline;
    }

    pub fn remote_addr(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    // The local side of the tunnel has no address of its own.
    pub fn local_addr(&self) -> Option<Endpoint> {
        None
    }

    pub fn token(&self) -> &ConnToken {
        &self.inner.token
    }
}

impl StreamInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        Ok(())
    }

    fn op_headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers.insert(NETWORK_HEADER, self.endpoint.family().as_str());
        headers.insert(ADDR_HEADER, self.endpoint.addr());
        headers.insert(CONN_TOKEN_HEADER, self.token.as_str());
        headers
    }

    fn read_deadline(&self) -> Option<SystemTime> {
        *self.read_deadline.lock().expect("deadline lock")
    }

    fn write_deadline(&self) -> Option<SystemTime> {
        *self.write_deadline.lock().expect("deadline lock")
    }

    pub(crate) async fn read_op(&self, len: usize) -> Result<Bytes> {
        self.ensure_open()?;
        let deadline = self.read_deadline();
        let mut msg = Message::new(operation_subject(&self.subject, Op::Read));
        msg.headers = self.op_headers();
        msg.headers.insert(READ_SIZE_HEADER, len.to_string());
        msg.headers
            .insert(READ_DEADLINE_HEADER, encode_deadline(deadline));
        let reply = self.bus.request(msg, remaining(deadline)).await?;
        check_err_header(&reply)?;
        if reply.payload.len() > len {
            return Err(StreamError::MessageTooLong);
        }
        Ok(reply.payload)
    }

    pub(crate) async fn write_op(&self, body: Bytes) -> Result<usize> {
        self.ensure_open()?;
        let deadline = self.write_deadline();
        let mut msg = Message::new(operation_subject(&self.subject, Op::Write));
        msg.headers = self.op_headers();
        msg.headers
            .insert(WRITE_DEADLINE_HEADER, encode_deadline(deadline));
        msg.payload = body;
        let reply = self.bus.request(msg, remaining(deadline)).await?;
        check_err_header(&reply)?;
        parse_write_count(&reply.payload).map_err(StreamError::InvalidWriteCount)
    }

    pub(crate) async fn close_op(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut msg = Message::new(operation_subject(&self.subject, Op::Close));
        msg.headers = self.op_headers();
        match self.bus.request(msg, Some(CLOSE_TIMEOUT)).await {
            Ok(reply) => check_err_header(&reply),
            Err(err) => {
                debug!(token = %self.token, error = %err, "close delivery failed");
                Ok(())
            }
        }
    }
}

fn check_err_header(reply: &Message) -> Result<()> {
    match reply.headers.get(ERR_HEADER) {
        Some(err) if !err.is_empty() => Err(StreamError::Remote(err.to_string())),
        _ => Ok(()),
    }
}

// Positive remainder until the deadline; `None` defers to the bus's default
// request timeout.
fn remaining(deadline: Option<SystemTime>) -> Option<Duration> {
    deadline.map(|at| {
        at.duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use culvert_bus::{BusConfig, InProcessBus};
    use culvert_wire::{Family, encode_write_count};
    use std::time::Instant;

    fn endpoint() -> Endpoint {
        Endpoint::new(Family::Tcp, "127.0.0.1:7000").expect("endpoint")
    }

    fn bus() -> Arc<InProcessBus> {
        Arc::new(InProcessBus::new(BusConfig::default()))
    }

    // Serve `subject`, producing each reply from the request via `f`, and
    // keep a copy of every request for assertions.
    async fn serve(
        bus: &Arc<InProcessBus>,
        subject: &str,
        f: impl Fn(&Message) -> (Headers, Bytes) + Send + 'static,
    ) -> Arc<Mutex<Vec<Message>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&seen);
        let mut sub = bus.subscribe(subject).await.expect("subscribe");
        let bus = Arc::clone(bus);
        tokio::spawn(async move {
            while let Some(msg) = sub.recv().await {
                let (headers, payload) = f(&msg);
                captured.lock().expect("seen lock").push(msg.clone());
                if let Some(reply_subject) = msg.reply {
                    let mut reply = Message::new(reply_subject);
                    reply.headers = headers;
                    reply.payload = payload;
                    let _ = bus.publish(reply).await;
                }
            }
        });
        seen
    }

    fn ok_reply(payload: Bytes) -> (Headers, Bytes) {
        (Headers::new(), payload)
    }

    fn err_reply(message: &str) -> (Headers, Bytes) {
        let mut headers = Headers::new();
        headers.insert(ERR_HEADER, message);
        (headers, Bytes::new())
    }

    #[tokio::test]
    async fn read_copies_the_reply_into_the_buffer() {
        let bus = bus();
        let seen = serve(&bus, "px.read", |_| {
            ok_reply(Bytes::from_static(b"abc"))
        })
        .await;
        let stream = BusStream::new(bus, "px", endpoint()).expect("stream");
        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).await.expect("read");
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], b"abc");

        let requests = seen.lock().expect("seen lock");
        let request = &requests[0];
        assert_eq!(request.headers.get(READ_SIZE_HEADER), Some("8"));
        assert_eq!(request.headers.get(NETWORK_HEADER), Some("tcp"));
        assert_eq!(request.headers.get(ADDR_HEADER), Some("127.0.0.1:7000"));
        assert_eq!(
            request.headers.get(CONN_TOKEN_HEADER),
            Some(stream.token().as_str())
        );
        assert_eq!(request.headers.get(READ_DEADLINE_HEADER), Some(""));
    }

    #[tokio::test]
    async fn zero_length_read_succeeds() {
        let bus = bus();
        serve(&bus, "px.read", |_| ok_reply(Bytes::new())).await;
        let stream = BusStream::new(bus, "px", endpoint()).expect("stream");
        let mut buf = [0u8; 0];
        assert_eq!(stream.read(&mut buf).await.expect("read"), 0);
    }

    #[tokio::test]
    async fn oversized_reply_is_a_protocol_error() {
        let bus = bus();
        serve(&bus, "px.read", |_| {
            ok_reply(Bytes::from_static(b"0123456789"))
        })
        .await;
        let stream = BusStream::new(bus, "px", endpoint()).expect("stream");
        let mut buf = [0u8; 4];
        let err = stream.read(&mut buf).await.expect_err("too long");
        assert!(matches!(err, StreamError::MessageTooLong));
        assert_eq!(err.to_string(), "message too long");
        // No bytes are delivered.
        assert_eq!(buf, [0u8; 4]);
    }

    #[tokio::test]
    async fn remote_error_header_is_propagated() {
        let bus = bus();
        serve(&bus, "px.read", |_| err_reply("dial tcp!127.0.0.1:1: refused")).await;
        let stream = BusStream::new(bus, "px", endpoint()).expect("stream");
        let mut buf = [0u8; 4];
        let err = stream.read(&mut buf).await.expect_err("remote");
        assert!(matches!(err, StreamError::Remote(ref s) if s.contains("dial")));
    }

    #[tokio::test]
    async fn write_parses_the_reported_count() {
        let bus = bus();
        let seen = serve(&bus, "px.write", |msg| {
            ok_reply(encode_write_count(msg.payload.len()))
        })
        .await;
        let stream = BusStream::new(bus, "px", endpoint()).expect("stream");
        assert_eq!(stream.write(b"PING\r\n").await.expect("write"), 6);

        let requests = seen.lock().expect("seen lock");
        assert_eq!(requests[0].payload, Bytes::from_static(b"PING\r\n"));
        assert_eq!(requests[0].headers.get(WRITE_DEADLINE_HEADER), Some(""));
    }

    #[tokio::test]
    async fn unparseable_write_count_is_a_protocol_error() {
        let bus = bus();
        serve(&bus, "px.write", |_| {
            ok_reply(Bytes::from_static(b"not-a-number"))
        })
        .await;
        let stream = BusStream::new(bus, "px", endpoint()).expect("stream");
        let err = stream.write(b"x").await.expect_err("bad count");
        assert!(matches!(err, StreamError::InvalidWriteCount(_)));
    }

    #[tokio::test]
    async fn write_failure_returns_remote_error() {
        let bus = bus();
        serve(&bus, "px.write", |_| err_reply("write: broken pipe")).await;
        let stream = BusStream::new(bus, "px", endpoint()).expect("stream");
        let err = stream.write(b"x").await.expect_err("remote");
        assert!(matches!(err, StreamError::Remote(ref s) if s.contains("broken pipe")));
    }

    #[tokio::test]
    async fn deadlines_are_serialized_into_headers() {
        let bus = bus();
        let seen = serve(&bus, "px.read", |_| ok_reply(Bytes::new())).await;
        let stream = BusStream::new(bus, "px", endpoint()).expect("stream");
        let at = SystemTime::now() + Duration::from_secs(5);
        stream.set_read_deadline(Some(at));
        let mut buf = [0u8; 1];
        stream.read(&mut buf).await.expect("read");

        let requests = seen.lock().expect("seen lock");
        assert_eq!(
            requests[0].headers.get(READ_DEADLINE_HEADER),
            Some(encode_deadline(Some(at)).as_str())
        );
    }

    #[tokio::test]
    async fn past_read_deadline_fails_fast_with_a_timeout() {
        let bus = bus();
        // Subscribed but silent: the request can only end by timing out.
        let _silent = bus.subscribe("px.read").await.expect("subscribe");

        let stream =
            BusStream::new(Arc::clone(&bus) as Arc<dyn Bus>, "px", endpoint()).expect("stream");
        stream.set_read_deadline(Some(SystemTime::now() - Duration::from_secs(1)));
        let started = Instant::now();
        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).await.expect_err("timeout");
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(matches!(err, StreamError::Bus(BusError::Timeout(_))));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_gates_operations() {
        let bus = bus();
        let seen = serve(&bus, "px.close", |_| ok_reply(Bytes::new())).await;
        let stream = BusStream::new(bus, "px", endpoint()).expect("stream");
        stream.close().await.expect("close");
        stream.close().await.expect("second close");
        // Only one CLOSE went out.
        assert_eq!(seen.lock().expect("seen lock").len(), 1);

        let err = stream.write(b"x").await.expect_err("closed");
        assert!(matches!(err, StreamError::Closed));
        let mut buf = [0u8; 1];
        let err = stream.read(&mut buf).await.expect_err("closed");
        assert!(matches!(err, StreamError::Closed));
    }

    #[tokio::test]
    async fn close_without_a_proxy_is_still_ok() {
        let bus = bus();
        let stream = BusStream::new(bus, "px", endpoint()).expect("stream");
        // Nothing subscribed on px.close: delivery fails, close stays best-effort.
        stream.close().await.expect("close");
        assert!(matches!(
            stream.write(b"x").await,
            Err(StreamError::Closed)
        ));
    }

    #[tokio::test]
    async fn close_reports_a_remote_failure() {
        let bus = bus();
        serve(&bus, "px.close", |_| err_reply("close: already gone")).await;
        let stream = BusStream::new(bus, "px", endpoint()).expect("stream");
        let err = stream.close().await.expect_err("remote close failure");
        assert!(matches!(err, StreamError::Remote(_)));
    }

    #[tokio::test]
    async fn streams_carry_distinct_tokens() {
        let bus = bus();
        let a = BusStream::new(Arc::clone(&bus) as Arc<dyn Bus>, "px", endpoint())
            .expect("stream a");
        let b = BusStream::new(bus, "px", endpoint()).expect("stream b");
        assert_ne!(a.token(), b.token());
    }

    #[tokio::test]
    async fn addresses_reflect_the_configured_endpoint() {
        let bus = bus();
        let stream = BusStream::new(bus, "px", endpoint()).expect("stream");
        assert_eq!(stream.remote_addr(), &endpoint());
        assert!(stream.local_addr().is_none());
    }
}
