// Keyed pool of live outbound byte streams backing the proxy's operations.
// One live stream per (endpoint, identity-token) key: concurrent logical
// streams to the same target never interleave bytes on one connection.
use culvert_wire::{Endpoint, Family};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, lookup_host};
use tokio::sync::{OnceCell, watch};
use tracing::debug;

pub mod trace;

pub type Result<T> = std::result::Result<T, PoolError>;

#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("dial {endpoint}: {source}")]
    Dial {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
    #[error("stream closed")]
    Closed,
    #[error("{op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{op} deadline exceeded")]
    DeadlineExceeded { op: &'static str },
    #[error("{} of {attempted} pooled streams failed to close", .failures.len())]
    CloseAll {
        attempted: usize,
        failures: Vec<PoolError>,
    },
}

/// Byte stream a dial function can hand to the pool.
pub trait PoolIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PoolIo for T {}

pub type BoxedStream = Box<dyn PoolIo>;

/// Pluggable dialer: (endpoint) -> live stream. Tests and logging wrappers
/// inject themselves here.
pub type DialFn = Arc<dyn Fn(Endpoint) -> BoxFuture<'static, io::Result<BoxedStream>> + Send + Sync>;

/// Standard outbound TCP dial honoring the endpoint's address family.
pub fn default_dial() -> DialFn {
    Arc::new(|endpoint| {
        Box::pin(async move {
            let addr = resolve(&endpoint).await?;
            let stream = TcpStream::connect(addr).await?;
            Ok(Box::new(stream) as BoxedStream)
        })
    })
}

async fn resolve(endpoint: &Endpoint) -> io::Result<std::net::SocketAddr> {
    let mut addrs = lookup_host(endpoint.addr()).await?;
    addrs
        .find(|addr| match endpoint.family() {
            Family::Tcp => true,
            Family::Tcp4 => addr.is_ipv4(),
            Family::Tcp6 => addr.is_ipv6(),
        })
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no usable address for {endpoint}"),
            )
        })
}

/// Key for one pooled stream: the endpoint rendering plus the per-stream
/// identity token.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct PoolKey {
    endpoint: String,
    token: String,
}

impl PoolKey {
    pub fn new(endpoint: &Endpoint, token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            token: token.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

struct Entry {
    key: PoolKey,
    // Independent halves so one read and one write can proceed concurrently.
    reader: tokio::sync::Mutex<Option<ReadHalf<BoxedStream>>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedStream>>>,
    // Flipped once on close; in-flight reads and writes bail out with Closed
    // instead of holding their half across the teardown.
    shutdown: watch::Sender<bool>,
    // Backreference for delete-on-close; the pool outlives its entries.
    pool: Weak<PoolInner>,
}

type Slot = Arc<OnceCell<Arc<Entry>>>;

struct PoolInner {
    // The lock only guards the map; dials run outside it so a slow dial does
    // not serialize unrelated pool operations.
    slots: Mutex<HashMap<PoolKey, Slot>>,
    dial: DialFn,
}

impl PoolInner {
    fn delete(&self, key: &PoolKey, entry: &Arc<Entry>) {
        let mut slots = self.slots.lock().expect("pool lock");
        let matches = slots
            .get(key)
            .and_then(|slot| slot.get())
            .map(|current| Arc::ptr_eq(current, entry))
            .unwrap_or(false);
        if matches {
            slots.remove(key);
        }
    }
}

/// Keyed cache of live outbound streams.
///
/// ```no_run
/// use culvert_pool::StreamPool;
/// use culvert_wire::{Endpoint, Family};
///
/// async fn first_read(pool: &StreamPool) -> culvert_pool::Result<usize> {
///     let endpoint = Endpoint::new(Family::Tcp, "127.0.0.1:6379").expect("endpoint");
///     let stream = pool.get(&endpoint, "A1B2").await?;
///     let mut buf = [0u8; 64];
///     stream.read(&mut buf, None).await
/// }
/// ```
pub struct StreamPool {
    inner: Arc<PoolInner>,
}

impl StreamPool {
    pub fn new() -> Self {
        Self::with_dial(default_dial())
    }

    pub fn with_dial(dial: DialFn) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                slots: Mutex::new(HashMap::new()),
                dial,
            }),
        }
    }

    /// Stream for the key, dialing on first use. Concurrent gets for one key
    /// share a single dial; gets for distinct keys dial in parallel.
    pub async fn get(&self, endpoint: &Endpoint, token: &str) -> Result<PooledStream> {
        let key = PoolKey::new(endpoint, token);
        // Phase one: reserve the slot under the map lock.
        let slot: Slot = {
            let mut slots = self.inner.slots.lock().expect("pool lock");
            Arc::clone(slots.entry(key.clone()).or_default())
        };
        // Phase two: dial outside the lock; the cell admits one initializer.
        let init = slot.get_or_try_init(|| async {
            debug!(%endpoint, token, "dialing target");
            let stream = (self.inner.dial)(endpoint.clone()).await.map_err(|source| {
                PoolError::Dial {
                    endpoint: endpoint.clone(),
                    source,
                }
            })?;
            let (reader, writer) = tokio::io::split(stream);
            let (shutdown, _) = watch::channel(false);
            Ok(Arc::new(Entry {
                key: key.clone(),
                reader: tokio::sync::Mutex::new(Some(reader)),
                writer: tokio::sync::Mutex::new(Some(writer)),
                shutdown,
                pool: Arc::downgrade(&self.inner),
            }))
        });
        match init.await {
            Ok(entry) => Ok(PooledStream {
                entry: Arc::clone(entry),
            }),
            Err(err) => {
                // Evict the failed placeholder so the next get retries.
                let mut slots = self.inner.slots.lock().expect("pool lock");
                let stale = slots
                    .get(&key)
                    .map(|current| Arc::ptr_eq(current, &slot) && current.get().is_none())
                    .unwrap_or(false);
                if stale {
                    slots.remove(&key);
                }
                Err(err)
            }
        }
    }

    /// Close every pooled stream. All entries are visited; failures are
    /// accumulated rather than short-circuiting.
    pub async fn close_all(&self) -> Result<()> {
        let entries: Vec<Arc<Entry>> = {
            let mut slots = self.inner.slots.lock().expect("pool lock");
            slots
                .drain()
                .filter_map(|(_, slot)| slot.get().cloned())
                .collect()
        };
        let attempted = entries.len();
        let mut failures = Vec::new();
        for entry in entries {
            if let Err(err) = close_entry(&entry).await {
                failures.push(err);
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(PoolError::CloseAll {
                attempted,
                failures,
            })
        }
    }

    /// Number of live pooled streams.
    pub fn len(&self) -> usize {
        let slots = self.inner.slots.lock().expect("pool lock");
        slots.values().filter(|slot| slot.get().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &PoolKey) -> bool {
        let slots = self.inner.slots.lock().expect("pool lock");
        slots
            .get(key)
            .map(|slot| slot.get().is_some())
            .unwrap_or(false)
    }
}

impl Default for StreamPool {
    fn default() -> Self {
        Self::new()
    }
}

// Remove the pool entry first, then close the raw stream: a get racing the
// close either finds the live entry or dials fresh, never a dead handout.
async fn close_entry(entry: &Arc<Entry>) -> Result<()> {
    if let Some(pool) = entry.pool.upgrade() {
        pool.delete(&entry.key, entry);
    }
    // Wake in-flight reads and writes so they fail with Closed and release
    // their halves instead of stalling the teardown. send_replace stores the
    // flag even when no operation is currently subscribed.
    entry.shutdown.send_replace(true);
    let shutdown = {
        let mut writer = entry.writer.lock().await;
        match writer.take() {
            Some(mut half) => half.shutdown().await,
            None => return Err(PoolError::Closed),
        }
    };
    // Drop the read half as well so the descriptor is fully released.
    entry.reader.lock().await.take();
    shutdown.map_err(|source| PoolError::Io {
        op: "close",
        source,
    })
}

/// Handle to a pooled stream. Reads and writes take an optional absolute
/// deadline; closing releases the pool slot before the underlying stream is
/// torn down.
pub struct PooledStream {
    entry: Arc<Entry>,
}

impl std::fmt::Debug for PooledStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledStream")
            .field("key", &self.entry.key)
            .finish()
    }
}

impl PooledStream {
    pub fn key(&self) -> &PoolKey {
        &self.entry.key
    }

    /// Single read into `buf`, bounded by `deadline` when present. A short
    /// read is not an error; zero-length buffers complete immediately. A
    /// racing close fails the read with [`PoolError::Closed`].
    pub async fn read(&self, buf: &mut [u8], deadline: Option<SystemTime>) -> Result<usize> {
        let mut closed = self.entry.shutdown.subscribe();
        let mut guard = self.entry.reader.lock().await;
        let reader = guard.as_mut().ok_or(PoolError::Closed)?;
        tokio::select! {
            result = with_deadline("read", deadline, reader.read(buf)) => result,
            _ = closed.wait_for(|closed| *closed) => Err(PoolError::Closed),
        }
    }

    /// Write all of `buf`, bounded by `deadline` when present. Returns the
    /// count written, which equals `buf.len()` on success. A racing close
    /// fails the write with [`PoolError::Closed`].
    pub async fn write(&self, buf: &[u8], deadline: Option<SystemTime>) -> Result<usize> {
        let mut closed = self.entry.shutdown.subscribe();
        let mut guard = self.entry.writer.lock().await;
        let writer = guard.as_mut().ok_or(PoolError::Closed)?;
        tokio::select! {
            result = with_deadline("write", deadline, async {
                writer.write_all(buf).await.map(|_| buf.len())
            }) => result,
            _ = closed.wait_for(|closed| *closed) => Err(PoolError::Closed),
        }
    }

    /// Close the stream and release its pool slot.
    pub async fn close(&self) -> Result<()> {
        close_entry(&self.entry).await
    }
}

async fn with_deadline<T>(
    op: &'static str,
    deadline: Option<SystemTime>,
    fut: impl Future<Output = io::Result<T>>,
) -> Result<T> {
    let wrap_io = |source| PoolError::Io { op, source };
    match deadline {
        None => fut.await.map_err(wrap_io),
        Some(at) => {
            let wait = at
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO);
            match tokio::time::timeout(wait, fut).await {
                Ok(result) => result.map_err(wrap_io),
                Err(_) => Err(PoolError::DeadlineExceeded { op }),
            }
        }
    }
}
