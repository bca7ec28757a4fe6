// Server-side proxy: terminates bus operations against real outbound
// streams. Subscribes to the three operation subjects, serves each message on
// its own task, and always replies; the err header carries any failure.
use bytes::Bytes;
use culvert_bus::{Bus, BusError, Headers, Message, Subscription};
use culvert_pool::{PoolError, PooledStream, StreamPool};
use culvert_wire::{
    ADDR_HEADER, CONN_TOKEN_HEADER, ERR_HEADER, Endpoint, NETWORK_HEADER, Op,
    READ_DEADLINE_HEADER, READ_SIZE_HEADER, WRITE_DEADLINE_HEADER, WRITE_FAILURE_BODY,
    decode_deadline, encode_write_count, operation_subject,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

mod config;
pub use config::ProxyConfig;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("subscribe {subject}: {source}")]
    Subscribe {
        subject: String,
        #[source]
        source: BusError,
    },
    #[error("close pool: {0}")]
    Pool(#[from] PoolError),
}

// Failures on the handler path; rendered into the reply's err header.
#[derive(thiserror::Error, Debug)]
enum HandlerError {
    #[error("missing header: {0}")]
    MissingHeader(&'static str),
    #[error("parse read size: {0:?}")]
    ReadSize(String),
    #[error("read size {requested} exceeds limit {limit}")]
    ReadSizeLimit { requested: usize, limit: usize },
    #[error(transparent)]
    Wire(#[from] culvert_wire::Error),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Proxy for tunnel operations arriving over the bus.
///
/// ```no_run
/// use culvert_bus::Bus;
/// use culvert_proxy::Proxy;
/// use std::sync::Arc;
///
/// async fn serve(bus: Arc<dyn Bus>) -> culvert_proxy::Result<()> {
///     let handle = Proxy::new(bus, "px").start().await?;
///     // ... run until shutdown ...
///     handle.shutdown().await
/// }
/// ```
pub struct Proxy {
    bus: Arc<dyn Bus>,
    subject: String,
    pool: Arc<StreamPool>,
    owns_pool: bool,
    config: ProxyConfig,
}

impl Proxy {
    /// Proxy with its own pool using the standard outbound dial. The pool is
    /// closed when the proxy shuts down.
    pub fn new(bus: Arc<dyn Bus>, subject: impl Into<String>) -> Self {
        Self {
            bus,
            subject: subject.into(),
            pool: Arc::new(StreamPool::new()),
            owns_pool: true,
            config: ProxyConfig::default(),
        }
    }

    /// Proxy over an injected pool. The caller keeps ownership; shutdown
    /// leaves the pool's streams alone.
    pub fn with_pool(bus: Arc<dyn Bus>, subject: impl Into<String>, pool: Arc<StreamPool>) -> Self {
        Self {
            bus,
            subject: subject.into(),
            pool,
            owns_pool: false,
            config: ProxyConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ProxyConfig) -> Self {
        self.config = config;
        self
    }

    /// Subscribe to the three operation subjects and begin serving.
    pub async fn start(self) -> Result<ProxyHandle> {
        let shared = Arc::new(ProxyShared {
            bus: self.bus,
            pool: Arc::clone(&self.pool),
            config: self.config,
        });
        let mut tasks = Vec::with_capacity(3);
        for op in [Op::Read, Op::Write, Op::Close] {
            let subject = operation_subject(&self.subject, op);
            let sub = shared
                .bus
                .subscribe(&subject)
                .await
                .map_err(|source| ProxyError::Subscribe {
                    subject: subject.clone(),
                    source,
                })?;
            debug!(subject = %subject, "proxy subscribed");
            tasks.push(tokio::spawn(dispatch(Arc::clone(&shared), sub, op)));
        }
        Ok(ProxyHandle {
            tasks,
            pool: self.owns_pool.then_some(self.pool),
        })
    }
}

/// Running proxy. Dropping it tears the subscriptions down; `shutdown` also
/// closes the pool when the proxy owns it.
pub struct ProxyHandle {
    tasks: Vec<JoinHandle<()>>,
    pool: Option<Arc<StreamPool>>,
}

impl ProxyHandle {
    pub async fn shutdown(mut self) -> Result<()> {
        for task in &self.tasks {
            task.abort();
        }
        self.tasks.clear();
        if let Some(pool) = self.pool.take() {
            pool.close_all().await?;
        }
        Ok(())
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct ProxyShared {
    bus: Arc<dyn Bus>,
    pool: Arc<StreamPool>,
    config: ProxyConfig,
}

// Messages on one subject, each served on its own task. The bus delivers to
// this loop in parallel with the other two subjects.
async fn dispatch(shared: Arc<ProxyShared>, mut sub: Subscription, op: Op) {
    while let Some(msg) = sub.recv().await {
        let shared = Arc::clone(&shared);
        tokio::spawn(handle(shared, msg, op));
    }
}

async fn handle(shared: Arc<ProxyShared>, msg: Message, op: Op) {
    let op_name = match op {
        Op::Read => "read",
        Op::Write => "write",
        Op::Close => "close",
    };
    metrics::counter!("culvert_proxy_ops_total", "op" => op_name).increment(1);
    let result = match op {
        Op::Read => read_handler(&shared, &msg).await,
        Op::Write => write_handler(&shared, &msg).await,
        Op::Close => close_handler(&shared, &msg).await,
    };
    let (headers, payload) = match result {
        Ok(payload) => (Headers::new(), payload),
        Err(err) => {
            metrics::counter!("culvert_proxy_op_errors_total", "op" => op_name).increment(1);
            debug!(op = op_name, error = %err, "operation failed");
            let mut headers = Headers::new();
            headers.insert(ERR_HEADER, err.to_string());
            (headers, failure_body(op))
        }
    };
    // Every request gets exactly one reply; a caller must never hang on a
    // reply we failed to send.
    let Some(reply_subject) = msg.reply else {
        debug!(op = op_name, "request carried no reply subject");
        return;
    };
    let mut reply = Message::new(reply_subject);
    reply.headers = headers;
    reply.payload = payload;
    if let Err(err) = shared.bus.publish(reply).await {
        warn!(op = op_name, error = %err, "send reply");
    }
}

// Failure bodies keep the success shape so clients can length-parse without
// ambiguity: empty for READ/CLOSE, a parseable zero for WRITE.
fn failure_body(op: Op) -> Bytes {
    match op {
        Op::Read | Op::Close => Bytes::new(),
        Op::Write => Bytes::from_static(WRITE_FAILURE_BODY),
    }
}

// Common prologue: endpoint headers plus identity token resolve to a pooled
// stream, dialing on first use.
async fn pooled_stream(
    shared: &ProxyShared,
    msg: &Message,
) -> std::result::Result<PooledStream, HandlerError> {
    let network = header(msg, NETWORK_HEADER)?;
    let addr = header(msg, ADDR_HEADER)?;
    let token = header(msg, CONN_TOKEN_HEADER)?;
    let endpoint = Endpoint::from_parts(network, addr)?;
    Ok(shared.pool.get(&endpoint, token).await?)
}

fn header<'m>(msg: &'m Message, key: &'static str) -> std::result::Result<&'m str, HandlerError> {
    match msg.headers.get(key) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(HandlerError::MissingHeader(key)),
    }
}

async fn read_handler(
    shared: &ProxyShared,
    msg: &Message,
) -> std::result::Result<Bytes, HandlerError> {
    let stream = pooled_stream(shared, msg).await?;
    let size_text = header(msg, READ_SIZE_HEADER)?;
    let size: usize = size_text
        .parse()
        .map_err(|_| HandlerError::ReadSize(size_text.to_string()))?;
    if size > shared.config.max_read_size {
        return Err(HandlerError::ReadSizeLimit {
            requested: size,
            limit: shared.config.max_read_size,
        });
    }
    let deadline = decode_deadline(msg.headers.get(READ_DEADLINE_HEADER).unwrap_or(""));
    let mut buf = vec![0u8; size];
    let n = stream.read(&mut buf, deadline).await?;
    buf.truncate(n);
    metrics::histogram!("culvert_proxy_read_bytes").record(n as f64);
    Ok(Bytes::from(buf))
}

async fn write_handler(
    shared: &ProxyShared,
    msg: &Message,
) -> std::result::Result<Bytes, HandlerError> {
    let stream = pooled_stream(shared, msg).await?;
    let deadline = decode_deadline(msg.headers.get(WRITE_DEADLINE_HEADER).unwrap_or(""));
    let n = stream.write(&msg.payload, deadline).await?;
    metrics::histogram!("culvert_proxy_write_bytes").record(n as f64);
    Ok(encode_write_count(n))
}

async fn close_handler(
    shared: &ProxyShared,
    msg: &Message,
) -> std::result::Result<Bytes, HandlerError> {
    let stream = pooled_stream(shared, msg).await?;
    stream.close().await?;
    Ok(Bytes::new())
}
