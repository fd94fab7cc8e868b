//! Guest - one live connection between two daemons
//!
//! Inbound packets are dispatched to local handlers registered with `on`,
//! strictly in arrival order. Outbound packets go through `send`, which
//! returns once the write is flushed. The two never mix: `on` is local,
//! `send` is remote.

use dae_core::{decode_stream, encode, DaeError, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, warn};

/// Raised for every decoded inbound packet with its raw text
pub const PACKET_EVENT: &str = "packet";

pub(crate) const READ_BUFFER: usize = 64 * 1024;

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Handler = Arc<dyn Fn(Guest, Vec<Value>) -> HandlerFuture + Send + Sync>;

/// Duplex wrapper around one TCP connection
#[derive(Clone)]
pub struct Guest {
    inner: Arc<GuestInner>,
}

struct GuestInner {
    peer_addr: SocketAddr,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader: StdMutex<Option<OwnedReadHalf>>,
    listeners: StdMutex<HashMap<String, Vec<Handler>>>,
    /// One-shot waiters, removed as soon as they fire
    waiters: StdMutex<HashMap<String, Vec<oneshot::Sender<Vec<Value>>>>>,
    closed: watch::Sender<bool>,
}

impl Guest {
    /// Wrap an accepted socket. Nothing is read until `start` is called,
    /// so handlers can be installed first.
    pub fn wrap(stream: TcpStream) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let (closed, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(GuestInner {
                peer_addr,
                writer: Mutex::new(Some(writer)),
                reader: StdMutex::new(Some(reader)),
                listeners: StdMutex::new(HashMap::new()),
                waiters: StdMutex::new(HashMap::new()),
                closed,
            }),
        })
    }

    /// Actively open a connection and start reading from it
    pub async fn connect<A: ToSocketAddrs>(addr: A, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| DaeError::Timeout)??;

        let guest = Self::wrap(stream)?;
        debug!(peer = %guest.peer_addr(), "Guest connected");
        guest.start();
        Ok(guest)
    }

    /// Spawn the reader task. Calling it twice is a no-op.
    pub fn start(&self) {
        let reader = lock(&self.inner.reader).take();
        if let Some(reader) = reader {
            tokio::spawn(self.clone().read_loop(reader));
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Register a local handler for inbound packets named `name`.
    /// The handler receives the packet's arguments.
    pub fn on<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Guest, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |guest: Guest, args: Vec<Value>| -> HandlerFuture {
            Box::pin(handler(guest, args))
        });
        lock(&self.inner.listeners)
            .entry(name.to_string())
            .or_default()
            .push(handler);
    }

    /// Arguments of the next inbound packet named `name`.
    /// The receiver errors if the connection closes first.
    /// Runs after the `on` handlers for the same packet.
    pub fn once(&self, name: &str) -> oneshot::Receiver<Vec<Value>> {
        let (tx, rx) = oneshot::channel();

        let mut waiters = lock(&self.inner.waiters);
        // Receivers dropped without a reply, e.g. after a timeout
        waiters.retain(|_, pending| {
            pending.retain(|tx| !tx.is_closed());
            !pending.is_empty()
        });
        waiters.entry(name.to_string()).or_default().push(tx);

        rx
    }

    /// Live handler count per packet name, pending `once` waiters included
    pub fn listener_counts(&self) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> = lock(&self.inner.listeners)
            .iter()
            .map(|(name, handlers)| (name.clone(), handlers.len()))
            .collect();

        for (name, pending) in lock(&self.inner.waiters).iter() {
            let live = pending.iter().filter(|tx| !tx.is_closed()).count();
            if live > 0 {
                *counts.entry(name.clone()).or_default() += live;
            }
        }
        counts
    }

    /// Send one packet to the remote side and flush it
    pub async fn send(&self, name: &str, args: Vec<Value>) -> Result<()> {
        let bytes = encode(name, &args)?;
        let mut writer = self.inner.writer.lock().await;
        let writer = writer.as_mut().ok_or(DaeError::ConnectionClosed)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Flush pending writes and half-close the connection
    pub async fn end(&self) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        if let Some(mut writer) = writer.take() {
            writer.flush().await?;
            writer.shutdown().await?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves once the remote side stopped sending
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn read_loop(self, mut reader: OwnedReadHalf) {
        let mut buf = vec![0u8; READ_BUFFER];

        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!(peer = %self.peer_addr(), "Guest disconnected");
                    break;
                }
                Ok(n) => {
                    let packets = decode_stream(&buf[..n]);
                    if packets.is_empty() {
                        debug!(peer = %self.peer_addr(), bytes = n, "Dropping malformed packet");
                    }
                    for packet in packets {
                        self.dispatch(PACKET_EVENT, vec![Value::String(packet.to_string())])
                            .await;
                        self.dispatch(&packet.name, packet.data).await;
                    }
                }
                Err(e) => {
                    warn!(peer = %self.peer_addr(), "Guest socket error: {}", e);
                    break;
                }
            }
        }

        // Dropping the senders wakes up every pending `once`
        lock(&self.inner.listeners).clear();
        lock(&self.inner.waiters).clear();
        self.inner.closed.send_replace(true);
    }

    async fn dispatch(&self, name: &str, args: Vec<Value>) {
        let handlers = lock(&self.inner.listeners)
            .get(name)
            .cloned()
            .unwrap_or_default();

        for handler in handlers {
            handler(self.clone(), args.clone()).await;
        }

        let waiters = lock(&self.inner.waiters).remove(name).unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(args.clone());
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
