/// Notification router
///
/// Every event enters through one bounded FIFO and is classified by a
/// single dispatcher loop:
/// 1. topic `orders` with targets: one order session per target id
/// 2. any other topic with targets: matching user sessions on that topic
/// 3. no targets: every session on the topic
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::models::{NotificationEvent, ORDERS_TOPIC};
use crate::websocket::ConnectionRegistry;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotifierError {
    #[error("notification router is not running")]
    Closed,
}

/// Work item accepted by the router loop
#[derive(Debug, Clone)]
pub enum RouterCommand {
    Event(NotificationEvent),
    /// Gracefully close the session watching an order, after anything queued before it
    CloseOrder(String),
}

/// Cloneable submission side of the router
#[derive(Clone)]
pub struct NotifierHandle {
    tx: mpsc::Sender<RouterCommand>,
}

impl NotifierHandle {
    /// Queues an event; waits while the intake is full.
    pub async fn trigger(&self, event: NotificationEvent) -> Result<(), NotifierError> {
        self.tx
            .send(RouterCommand::Event(event))
            .await
            .map_err(|_| NotifierError::Closed)
    }

    pub async fn close_order(&self, order_id: impl Into<String>) -> Result<(), NotifierError> {
        self.tx
            .send(RouterCommand::CloseOrder(order_id.into()))
            .await
            .map_err(|_| NotifierError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct NotificationManager {
    registry: ConnectionRegistry,
    rx: mpsc::Receiver<RouterCommand>,
}

impl NotificationManager {
    pub fn new(registry: ConnectionRegistry, capacity: usize) -> (Self, NotifierHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { registry, rx }, NotifierHandle { tx })
    }

    /// Runs the dispatcher until the stop signal fires or every handle is dropped.
    /// Events still queued at stop time are discarded.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Notification router started");

        if *shutdown.borrow() {
            return;
        }

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }

        self.rx.close();
        info!("Notification router stopped");
    }

    #[cfg(test)]
    pub(crate) fn intake(&mut self) -> &mut mpsc::Receiver<RouterCommand> {
        &mut self.rx
    }

    fn handle(&self, command: RouterCommand) {
        match command {
            RouterCommand::Event(event) => {
                self.process_event(&event);
            }
            RouterCommand::CloseOrder(order_id) => {
                if self.registry.close_order_connection(&order_id) {
                    info!(order_id = %order_id, "Closed order session after completion");
                }
            }
        }
    }

    /// Routes one event and returns how many connections accepted it.
    pub fn process_event(&self, event: &NotificationEvent) -> usize {
        let kind = event.kind.as_str();

        let delivered = if event.topic == ORDERS_TOPIC && !event.target_ids.is_empty() {
            event
                .target_ids
                .iter()
                .filter(|order_id| self.registry.dispatch_to_order(order_id, kind, &event.payload))
                .count()
        } else if !event.target_ids.is_empty() {
            self.registry
                .dispatch_to_users(&event.target_ids, &event.topic, kind, &event.payload)
        } else {
            self.registry
                .dispatch_to_topic(&event.topic, kind, &event.payload)
        };

        if delivered == 0 {
            debug!(kind, topic = %event.topic, targets = ?event.target_ids, "Event had no live recipients");
        } else {
            debug!(kind, topic = %event.topic, delivered, "Event dispatched");
        }
        delivered
    }
}
