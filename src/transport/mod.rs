//! Message transports.
//!
//! A transport moves encoded bytes between peers and feeds every decoded
//! inbound message to the dispatcher; it knows nothing about gossip
//! semantics. Like the codecs, the implementation is picked by name from a
//! registry at engine start.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use dashmap::DashMap;
use tokio::net::UdpSocket;

use crate::gossip::dispatcher::MessageDispatcher;
use crate::membership::types::Endpoint;
use crate::protocol::ProtocolCodec;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait Transport: Send + Sync {
    /// Starts receiving and dispatching inbound messages.
    fn start_endpoint(&self) -> BoxFuture<'_, Result<()>>;

    /// Sends one encoded message to the peer endpoint.
    fn send<'a>(&'a self, endpoint: &'a Endpoint, bytes: Vec<u8>) -> BoxFuture<'a, Result<()>>;

    /// Stops the receive loop. Inbound messages in flight are dropped.
    fn shutdown(&self) -> BoxFuture<'_, ()>;
}

const MAX_DATAGRAM_BYTES: usize = 65536;

/// Datagram transport: one socket, one receive loop.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    dispatcher: Arc<MessageDispatcher>,
    codec: Arc<dyn ProtocolCodec>,
    running: AtomicBool,
    receive_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl UdpTransport {
    /// Binds the local endpoint. Fails fast when the port is taken.
    pub async fn bind(
        endpoint: &Endpoint,
        dispatcher: Arc<MessageDispatcher>,
        codec: Arc<dyn ProtocolCodec>,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(endpoint.socket_addr()).await?;
        tracing::info!("Gossip endpoint bound on {}", endpoint.socket_addr());
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            dispatcher,
            codec,
            running: AtomicBool::new(false),
            receive_task: Mutex::new(None),
        }))
    }

    async fn receive_loop(
        socket: Arc<UdpSocket>,
        dispatcher: Arc<MessageDispatcher>,
        codec: Arc<dyn ProtocolCodec>,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, src)) => match codec.decode(&buf[..len]) {
                    Ok(message) => dispatcher.dispatch(message),
                    Err(e) => {
                        tracing::warn!("Undecodable datagram from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive datagram: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}

impl Transport for UdpTransport {
    fn start_endpoint(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.running.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            let handle = tokio::spawn(Self::receive_loop(
                self.socket.clone(),
                self.dispatcher.clone(),
                self.codec.clone(),
            ));
            *self.receive_task.lock().expect("receive task lock poisoned") = Some(handle);
            Ok(())
        })
    }

    fn send<'a>(&'a self, endpoint: &'a Endpoint, bytes: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.socket
                .send_to(&bytes, endpoint.socket_addr())
                .await
                .map_err(|e| anyhow::anyhow!("send to {} failed: {}", endpoint, e))?;
            Ok(())
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.running.store(false, Ordering::SeqCst);
            if let Some(handle) = self
                .receive_task
                .lock()
                .expect("receive task lock poisoned")
                .take()
            {
                handle.abort();
            }
        })
    }
}

/// Context a transport factory needs to construct an instance.
pub struct TransportContext {
    pub bind: Endpoint,
    pub dispatcher: Arc<MessageDispatcher>,
    pub codec: Arc<dyn ProtocolCodec>,
}

type TransportFactory =
    Arc<dyn Fn(TransportContext) -> BoxFuture<'static, Result<Arc<dyn Transport>>> + Send + Sync>;

/// Name -> transport factory map.
pub struct TransportRegistry {
    factories: DashMap<String, TransportFactory>,
}

impl TransportRegistry {
    pub fn with_defaults() -> Self {
        let registry = Self {
            factories: DashMap::new(),
        };
        registry.register(
            "udp",
            |ctx: TransportContext| -> BoxFuture<'static, Result<Arc<dyn Transport>>> {
                Box::pin(async move {
                    let transport: Arc<dyn Transport> =
                        UdpTransport::bind(&ctx.bind, ctx.dispatcher, ctx.codec).await?;
                    Ok(transport)
                })
            },
        );
        registry
    }

    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn(TransportContext) -> BoxFuture<'static, Result<Arc<dyn Transport>>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub async fn build(&self, name: &str, ctx: TransportContext) -> Result<Arc<dyn Transport>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown transport: {}", name))?
            .value()
            .clone();
        factory(ctx).await
    }
}
