//! `seda:` bounded in-memory queue between routes.
//!
//! Producers enqueue a copy of the exchange. InOnly producers continue
//! immediately; InOut producers suspend until the consuming route has
//! processed the copy and take its final message as the reply. The consumer
//! drains the queue with a [`WorkerPool`].

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use switchyard_core::exchange::properties;
use switchyard_core::{Exchange, ExchangePattern, Outcome, Processor, RouteError};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use super::{apply_options, Component, ComponentContext, Consumer, Endpoint, EndpointUri};
use crate::configurer::PropertyConfigurer;
use crate::error::EndpointError;
use crate::routing::RouteHandle;
use crate::service::worker::{BackgroundRunnable, WorkerPool};

/// A queued exchange, with a reply channel for InOut producers.
pub struct SedaItem {
    exchange: Exchange,
    reply: Option<oneshot::Sender<Exchange>>,
}

#[derive(Debug, Clone)]
struct SedaOptions {
    size: usize,
    concurrent_consumers: usize,
    block_when_full: bool,
}

fn positive_usize(v: i64) -> Result<usize, String> {
    usize::try_from(v)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| format!("must be positive, got {v}"))
}

fn options_configurer(ctx: &ComponentContext) -> PropertyConfigurer<SedaOptions> {
    PropertyConfigurer::<SedaOptions>::new(Arc::clone(&ctx.converters))
        .checked_option::<i64>(
            "size",
            |o, v| {
                o.size = positive_usize(v)?;
                Ok(())
            },
            |o| i64::try_from(o.size).unwrap_or(i64::MAX),
        )
        .checked_option::<i64>(
            "concurrentConsumers",
            |o, v| {
                o.concurrent_consumers = positive_usize(v)?;
                Ok(())
            },
            |o| i64::try_from(o.concurrent_consumers).unwrap_or(i64::MAX),
        )
        .option::<bool>(
            "blockWhenFull",
            |o, v| o.block_when_full = v,
            |o| o.block_when_full,
        )
}

/// One named queue, shared by every endpoint URI with the same path.
struct SedaQueue {
    name: String,
    capacity: usize,
    sender: mpsc::Sender<SedaItem>,
    /// Parked here while no consumer is running.
    receiver: parking_lot::Mutex<Option<mpsc::Receiver<SedaItem>>>,
    claimed: AtomicBool,
}

impl SedaQueue {
    fn depth(&self) -> usize {
        self.capacity.saturating_sub(self.sender.capacity())
    }
}

#[derive(Default)]
pub struct SedaComponent {
    queues: DashMap<String, Arc<SedaQueue>>,
}

impl SedaComponent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Component for SedaComponent {
    fn scheme(&self) -> &str {
        "seda"
    }

    fn create_endpoint(
        &self,
        uri: &EndpointUri,
        ctx: &ComponentContext,
    ) -> Result<Arc<dyn Endpoint>, EndpointError> {
        let mut options = SedaOptions {
            size: ctx.config.seda_default_capacity.max(1),
            concurrent_consumers: 1,
            block_when_full: false,
        };
        apply_options(uri, &options_configurer(ctx), &mut options)?;

        // The first endpoint to name a queue fixes its capacity.
        let queue = Arc::clone(
            self.queues
                .entry(uri.path().to_string())
                .or_insert_with(|| {
                    let (sender, receiver) = mpsc::channel(options.size);
                    Arc::new(SedaQueue {
                        name: uri.path().to_string(),
                        capacity: options.size,
                        sender,
                        receiver: parking_lot::Mutex::new(Some(receiver)),
                        claimed: AtomicBool::new(false),
                    })
                })
                .value(),
        );

        Ok(Arc::new(SedaEndpoint {
            uri: uri.to_string(),
            queue,
            options,
            tick_interval: ctx.config.worker_tick_interval,
        }))
    }
}

pub struct SedaEndpoint {
    uri: String,
    queue: Arc<SedaQueue>,
    options: SedaOptions,
    tick_interval: Duration,
}

impl SedaEndpoint {
    /// Number of exchanges waiting in the queue.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.queue.depth()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.queue.capacity
    }
}

impl Endpoint for SedaEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> Result<Arc<dyn Processor>, EndpointError> {
        Ok(Arc::new(SedaProducer {
            uri: self.uri.clone(),
            sender: self.queue.sender.clone(),
            block_when_full: self.options.block_when_full,
        }))
    }

    fn create_consumer(&self, route: RouteHandle) -> Result<Arc<dyn Consumer>, EndpointError> {
        if self.queue.claimed.swap(true, Ordering::SeqCst) {
            return Err(EndpointError::ConsumerExists {
                uri: self.uri.clone(),
            });
        }
        Ok(Arc::new(SedaConsumer {
            queue: Arc::clone(&self.queue),
            route,
            workers: self.options.concurrent_consumers,
            tick_interval: self.tick_interval,
            pool: Mutex::new(None),
        }))
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

struct SedaProducer {
    uri: String,
    sender: mpsc::Sender<SedaItem>,
    block_when_full: bool,
}

impl SedaProducer {
    fn failed(&self, mut exchange: Exchange, message: &str) -> Outcome {
        exchange.set_exception(RouteError::processing(&self.uri, message));
        Outcome::Complete(exchange)
    }
}

impl Processor for SedaProducer {
    fn label(&self) -> &str {
        &self.uri
    }

    fn process(&self, mut exchange: Exchange) -> Outcome {
        exchange.set_property(properties::TO_ENDPOINT, self.uri.as_str());
        let (reply_tx, reply_rx) = match exchange.pattern() {
            ExchangePattern::InOnly => (None, None),
            ExchangePattern::InOut => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            }
        };
        let item = SedaItem {
            exchange: exchange.copy(),
            reply: reply_tx,
        };

        let blocked = match self.sender.try_send(item) {
            Ok(()) => None,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return self.failed(exchange, "queue is closed");
            }
            Err(mpsc::error::TrySendError::Full(item)) => {
                if !self.block_when_full {
                    return self.failed(exchange, "queue is full");
                }
                Some(item)
            }
        };

        if blocked.is_none() && reply_rx.is_none() {
            return Outcome::Complete(exchange);
        }

        let uri = self.uri.clone();
        let sender = self.sender.clone();
        Outcome::Pending(Box::pin(async move {
            if let Some(item) = blocked {
                debug!(uri = %uri, "queue full, waiting for capacity");
                if sender.send(item).await.is_err() {
                    exchange.set_exception(RouteError::processing(&uri, "queue is closed"));
                    return exchange;
                }
            }
            let Some(reply_rx) = reply_rx else {
                return exchange;
            };
            let token = exchange.context().cancellation.clone();
            tokio::select! {
                reply = reply_rx => match reply {
                    Ok(reply) => {
                        exchange.set_message(reply.message().clone());
                        if let Some(error) = reply.exception() {
                            exchange.set_exception(error.clone());
                        }
                    }
                    Err(_) => exchange.set_exception(RouteError::processing(
                        &uri,
                        "consumer stopped before replying",
                    )),
                },
                () = token.cancelled() => {
                    exchange.set_exception(RouteError::cancelled("cancelled while awaiting reply"));
                }
            }
            exchange
        }))
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

struct SedaRunnable {
    route: RouteHandle,
    queue: Arc<SedaQueue>,
}

#[async_trait]
impl BackgroundRunnable for SedaRunnable {
    type Task = SedaItem;

    async fn run(&mut self, item: SedaItem) {
        let done = self.route.run(item.exchange).await;
        if let Some(reply) = item.reply {
            // The producer may have been cancelled; the reply is then moot.
            let _ = reply.send(done);
        }
    }

    async fn on_tick(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let depth = self.queue.depth() as f64;
        metrics::gauge!("switchyard_seda_queue_depth", "queue" => self.queue.name.clone()).set(depth);
    }
}

struct SedaConsumer {
    queue: Arc<SedaQueue>,
    route: RouteHandle,
    workers: usize,
    tick_interval: Duration,
    pool: Mutex<Option<WorkerPool<SedaRunnable>>>,
}

#[async_trait]
impl Consumer for SedaConsumer {
    async fn start(&self) -> anyhow::Result<()> {
        let mut pool = self.pool.lock().await;
        if pool.is_some() {
            return Ok(());
        }
        let receiver = self
            .queue
            .receiver
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("seda:{} is already being consumed", self.queue.name))?;
        let route = Arc::clone(&self.route);
        let queue = Arc::clone(&self.queue);
        *pool = Some(WorkerPool::spawn(
            receiver,
            self.workers,
            self.tick_interval,
            |_| SedaRunnable {
                route: Arc::clone(&route),
                queue: Arc::clone(&queue),
            },
        ));
        debug!(queue = %self.queue.name, workers = self.workers, route = self.route.id(), "seda consumer started");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let Some(pool) = self.pool.lock().await.take() else {
            return Ok(());
        };
        if let Some(receiver) = pool.stop().await {
            *self.queue.receiver.lock() = Some(receiver);
        }
        debug!(queue = %self.queue.name, "seda consumer stopped");
        Ok(())
    }
}
