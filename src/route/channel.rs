use crate::exchange::{Exchange, ExchangeError, Message};
use crate::processor::{AsyncCallback, Executable};
use crate::route::{Consumer, ConsumerStatus, EndpointFactory, Route, RouteError};
use dashmap::DashMap;
use fnv::FnvBuildHasher;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

/// Consumer feeding a route from a bounded in-memory channel.
///
/// Each received message becomes a new exchange. While suspended the
/// consumer stops receiving, so messages stay in the channel and producers
/// see it fill up.
pub struct ChannelConsumer {
    name: String,
    route: Route,
    receiver: Mutex<Option<mpsc::Receiver<Message>>>,
    status: watch::Sender<ConsumerStatus>,
    runtime: Handle,
}

impl ChannelConsumer {
    /// Creates the consumer and attaches it to `route`.
    pub fn new(
        name: impl Into<String>,
        route: Route,
        receiver: mpsc::Receiver<Message>,
        runtime: Handle,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(ConsumerStatus::Stopped);
        let consumer = Arc::new(Self {
            name: name.into(),
            route,
            receiver: Mutex::new(Some(receiver)),
            status,
            runtime,
        });
        let attached: Arc<dyn Consumer> = consumer.clone();
        consumer.route.set_consumer(&attached);
        consumer
    }

    fn transition(&self, from: ConsumerStatus, to: ConsumerStatus) {
        let changed = self.status.send_if_modified(|status| {
            if *status == from {
                *status = to;
                true
            } else {
                false
            }
        });
        if changed {
            log::debug!("Consumer '{}' is now {:?}", self.name, to);
        }
    }
}

impl Consumer for ChannelConsumer {
    fn start(&self) -> Result<(), RouteError> {
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| RouteError::consumer_start(&self.name, "The consumer was already started"))?;
        self.status.send_replace(ConsumerStatus::Started);
        let status = self.status.subscribe();
        let name = self.name.clone();
        let route = self.route.clone();
        self.runtime.spawn(consume(name, route, receiver, status));
        log::debug!("Consumer '{}' started for route '{}'", self.name, self.route.id());
        Ok(())
    }

    fn stop(&self) {
        self.status.send_replace(ConsumerStatus::Stopped);
    }

    fn suspend(&self) {
        self.transition(ConsumerStatus::Started, ConsumerStatus::Suspended);
    }

    fn resume(&self) {
        self.transition(ConsumerStatus::Suspended, ConsumerStatus::Started);
    }

    fn status(&self) -> ConsumerStatus {
        *self.status.borrow()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

async fn consume(
    name: String,
    route: Route,
    mut receiver: mpsc::Receiver<Message>,
    mut status: watch::Receiver<ConsumerStatus>,
) {
    loop {
        let current = *status.borrow_and_update();
        match current {
            ConsumerStatus::Stopped => break,
            ConsumerStatus::Suspended => {
                if status.changed().await.is_err() {
                    break;
                }
                continue;
            }
            ConsumerStatus::Started => {}
        }
        tokio::select! {
            biased;
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            message = receiver.recv() => match message {
                Some(message) => {
                    route.dispatch(Exchange::with_message(message), AsyncCallback::new(|_, _| {}));
                }
                None => {
                    log::debug!("Channel of consumer '{}' closed", name);
                    break;
                }
            }
        }
    }
    log::debug!("Consumer '{}' stopped", name);
}

/// Endpoint factory for named in-memory channels.
///
/// `create_consumer("orders", ..)` opens the channel `orders`;
/// `create_producer("orders")` returns a step that sends the input message of
/// each exchange into it.
pub struct ChannelEndpointFactory {
    capacity: usize,
    runtime: Handle,
    channels: DashMap<String, mpsc::Sender<Message>, FnvBuildHasher>,
}

impl ChannelEndpointFactory {
    pub fn new(capacity: usize, runtime: Handle) -> Self {
        Self {
            capacity: capacity.max(1),
            runtime,
            channels: DashMap::with_hasher(FnvBuildHasher::default()),
        }
    }

    /// Sender of an open channel, for feeding it from outside a route.
    pub fn sender(&self, descriptor: &str) -> Option<mpsc::Sender<Message>> {
        self.channels.get(descriptor).map(|sender| sender.clone())
    }
}

impl EndpointFactory for ChannelEndpointFactory {
    fn create_consumer(&self, descriptor: &str, route: &Route) -> Result<Arc<dyn Consumer>, RouteError> {
        if descriptor.trim().is_empty() {
            return Err(RouteError::invalid_endpoint(descriptor, "Channel name is empty"));
        }
        if self.channels.contains_key(descriptor) {
            return Err(RouteError::invalid_endpoint(descriptor, "Channel already has a consumer"));
        }
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.channels.insert(descriptor.to_string(), sender);
        let consumer = ChannelConsumer::new(descriptor, route.clone(), receiver, self.runtime.clone());
        Ok(consumer)
    }

    fn create_producer(&self, descriptor: &str) -> Result<Executable, RouteError> {
        let sender = self
            .sender(descriptor)
            .ok_or_else(|| RouteError::invalid_endpoint(descriptor, "No consumer is open on the channel"))?;
        let name = format!("channel:{}", descriptor);
        Ok(Executable::from_fn(name.clone(), move |exchange: &mut Exchange| {
            sender
                .try_send(exchange.input().clone())
                .map_err(|e| ExchangeError::processing(&name, e.to_string()))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn wait_for(counter: &AtomicUsize, expected: usize) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn counting_route(counter: Arc<AtomicUsize>) -> Route {
        Route::builder("channel-route")
            .step(Executable::from_fn("count", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .build()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_consumer_feeds_route() {
        let counter = Arc::new(AtomicUsize::new(0));
        let route = counting_route(counter.clone());
        let (sender, receiver) = mpsc::channel(8);
        let consumer = ChannelConsumer::new("c", route.clone(), receiver, Handle::current());
        consumer.start().unwrap();
        assert!(route.consumer().is_some());
        for i in 0..3 {
            sender.send(Message::new(i)).await.unwrap();
        }
        wait_for(&counter, 3).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(matches!(consumer.start(), Err(RouteError::ConsumerStart { .. })));
        consumer.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_suspended_consumer_leaves_messages_in_channel() {
        let counter = Arc::new(AtomicUsize::new(0));
        let route = counting_route(counter.clone());
        let (sender, receiver) = mpsc::channel(8);
        let consumer = ChannelConsumer::new("c", route, receiver, Handle::current());
        consumer.start().unwrap();
        consumer.suspend();
        assert_eq!(consumer.status(), ConsumerStatus::Suspended);
        tokio::time::sleep(Duration::from_millis(20)).await;

        sender.send(Message::new(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        consumer.resume();
        wait_for(&counter, 1).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        consumer.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_endpoint_factory_connects_producer_and_consumer() {
        let counter = Arc::new(AtomicUsize::new(0));
        let route = counting_route(counter.clone());
        let factory = ChannelEndpointFactory::new(4, Handle::current());
        assert!(factory.create_producer("orders").is_err());

        let consumer = factory.create_consumer("orders", &route).unwrap();
        assert!(factory.create_consumer("orders", &route).is_err());
        consumer.start().unwrap();

        let producer = factory.create_producer("orders").unwrap();
        let exchange = producer.process(Exchange::with_body("order-1")).unwrap();
        assert!(!exchange.is_failed());
        wait_for(&counter, 1).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        consumer.stop();
    }
}
