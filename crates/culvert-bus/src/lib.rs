// Subject-routed request/reply seam the tunnel operates over.
// The proxy subscribes to operation subjects; the stream adapter publishes
// requests and waits on per-request reply inboxes.
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

pub type Result<T> = std::result::Result<T, BusError>;

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("no responders on subject {0}")]
    NoResponders(String),
    #[error("bus closed")]
    Closed,
}

/// Per-message string headers. Keys are case-sensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A bus message: subject, headers, payload, and the reply subject a
/// responder should publish to.
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub headers: Headers,
    pub payload: Bytes,
    pub reply: Option<String>,
}

impl Message {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            headers: Headers::new(),
            payload: Bytes::new(),
            reply: None,
        }
    }
}

/// Live subscription to one subject. Dropping it unsubscribes.
pub struct Subscription {
    subject: String,
    rx: mpsc::Receiver<Message>,
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    // Bus implementations hand the receiving half plus an unsubscribe hook.
    pub fn new(
        subject: impl Into<String>,
        rx: mpsc::Receiver<Message>,
        unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            subject: subject.into(),
            rx,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message on the subject; `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

/// Messaging fabric contract: subject subscription, fire-and-forget publish,
/// and synchronous request/reply with a caller-supplied timeout.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish `msg` with a fresh reply inbox and await exactly one reply.
    /// `timeout` of `None` uses the bus's default request timeout. Fails fast
    /// with `NoResponders` when nothing is subscribed to the subject.
    async fn request(&self, msg: Message, timeout: Option<Duration>) -> Result<Message>;

    async fn publish(&self, msg: Message) -> Result<()>;

    async fn subscribe(&self, subject: &str) -> Result<Subscription>;
}

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_QUEUE_DEPTH: usize = 1024;
const INBOX_PREFIX: &str = "_INBOX.";

#[derive(Debug, Clone)]
pub struct BusConfig {
    // Applied when a request carries no explicit timeout.
    pub default_request_timeout: Duration,
    // Bound on each subscription's delivery queue.
    pub subscription_queue_depth: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_request_timeout: DEFAULT_REQUEST_TIMEOUT,
            subscription_queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl BusConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_u64_env("CULVERT_BUS_REQUEST_TIMEOUT_MS") {
            config.default_request_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_usize_env("CULVERT_BUS_QUEUE_DEPTH") {
            config.subscription_queue_depth = value;
        }
        config
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Message>,
}

/// In-process bus: subject-routed fan-out with unique reply inboxes. Used by
/// tests, demos, and single-process agents; production deployments swap in a
/// real bus client behind the same trait.
///
/// ```
/// use bytes::Bytes;
/// use culvert_bus::{Bus, BusConfig, InProcessBus, Message};
/// use std::sync::Arc;
///
/// let bus = Arc::new(InProcessBus::new(BusConfig::default()));
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let mut sub = bus.subscribe("updates").await.expect("subscribe");
///     let mut msg = Message::new("updates");
///     msg.payload = Bytes::from_static(b"payload");
///     bus.publish(msg).await.expect("publish");
///     let received = sub.recv().await.expect("recv");
///     assert_eq!(received.payload, Bytes::from_static(b"payload"));
/// });
/// ```
pub struct InProcessBus {
    // Map of subject -> live subscribers; short critical sections only.
    subjects: Arc<Mutex<HashMap<String, Vec<Subscriber>>>>,
    next_id: AtomicU64,
    config: BusConfig,
}

impl InProcessBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            subjects: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    // Deliver to every current subscriber of the subject and report how many
    // queues accepted the message. Full or closed queues drop the delivery,
    // the same contract a lagging broadcast receiver gets.
    fn fanout(&self, msg: &Message) -> usize {
        let senders: Vec<mpsc::Sender<Message>> = {
            let guard = self.subjects.lock().expect("subjects lock");
            match guard.get(&msg.subject) {
                Some(subscribers) => subscribers.iter().map(|s| s.tx.clone()).collect(),
                None => Vec::new(),
            }
        };
        let mut delivered = 0;
        for tx in senders {
            match tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => debug!(subject = %msg.subject, error = %err, "dropped delivery"),
            }
        }
        delivered
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

#[async_trait]
impl Bus for InProcessBus {
    async fn request(&self, mut msg: Message, timeout: Option<Duration>) -> Result<Message> {
        let wait = timeout.unwrap_or(self.config.default_request_timeout);
        let inbox = format!(
            "{INBOX_PREFIX}{}",
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );
        let mut reply_sub = self.subscribe(&inbox).await?;
        msg.reply = Some(inbox);
        if self.fanout(&msg) == 0 {
            return Err(BusError::NoResponders(msg.subject));
        }
        match tokio::time::timeout(wait, reply_sub.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout(wait)),
        }
    }

    async fn publish(&self, msg: Message) -> Result<()> {
        self.fanout(&msg);
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(self.config.subscription_queue_depth);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut guard = self.subjects.lock().expect("subjects lock");
            guard
                .entry(subject.to_string())
                .or_default()
                .push(Subscriber { id, tx });
        }
        let subjects = Arc::clone(&self.subjects);
        let owned = subject.to_string();
        let unsubscribe_subject = owned.clone();
        Ok(Subscription::new(owned, rx, move || {
            let mut guard = subjects.lock().expect("subjects lock");
            if let Some(subscribers) = guard.get_mut(&unsubscribe_subject) {
                subscribers.retain(|s| s.id != id);
                if subscribers.is_empty() {
                    guard.remove(&unsubscribe_subject);
                }
            }
        }))
    }
}
