use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::update::UpdateStatus;

const DEFAULT_QUEUE: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    Download,
    Install,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdateEvent {
    StatusChanged {
        id: String,
        status: UpdateStatus,
    },
    ProgressChanged {
        id: String,
        kind: ProgressKind,
        value: u32,
    },
    UpdateRemoved {
        id: String,
    },
    CatalogRefreshed {
        new_updates: usize,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventCategory {
    Status,
    Progress,
    Removed,
    Catalog,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Status => "status",
            EventCategory::Progress => "progress",
            EventCategory::Removed => "removed",
            EventCategory::Catalog => "catalog",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "status" => Some(EventCategory::Status),
            "progress" => Some(EventCategory::Progress),
            "removed" => Some(EventCategory::Removed),
            "catalog" => Some(EventCategory::Catalog),
            _ => None,
        }
    }
}

impl UpdateEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            UpdateEvent::StatusChanged { .. } => EventCategory::Status,
            UpdateEvent::ProgressChanged { .. } => EventCategory::Progress,
            UpdateEvent::UpdateRemoved { .. } => EventCategory::Removed,
            UpdateEvent::CatalogRefreshed { .. } => EventCategory::Catalog,
        }
    }

    pub fn update_id(&self) -> Option<&str> {
        match self {
            UpdateEvent::StatusChanged { id, .. }
            | UpdateEvent::ProgressChanged { id, .. }
            | UpdateEvent::UpdateRemoved { id } => Some(id),
            UpdateEvent::CatalogRefreshed { .. } => None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub enum EventFilter {
    #[default]
    All,
    Update(String),
    Categories(Vec<EventCategory>),
}

impl EventFilter {
    fn matches(&self, event: &UpdateEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Update(id) => event.update_id() == Some(id.as_str()),
            EventFilter::Categories(categories) => categories.contains(&event.category()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiving end of a subscription. Events arrive in publish order.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::Receiver<UpdateEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<UpdateEvent> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<UpdateEvent> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> ReceiverStream<UpdateEvent> {
        ReceiverStream::new(self.rx)
    }
}

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::Sender<UpdateEvent>,
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    entries: HashMap<SubscriptionId, Subscriber>,
}

/// In-process fan-out. Each subscriber owns a bounded queue; a full queue
/// drops the event for that subscriber only, so `publish` never waits.
#[derive(Clone, Default)]
pub struct Notifier {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.subscribe_with_capacity(filter, DEFAULT_QUEUE)
    }

    pub fn subscribe_with_capacity(&self, filter: EventFilter, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut subs = self.lock();
        let id = SubscriptionId(subs.next_id);
        subs.next_id += 1;
        subs.entries.insert(id, Subscriber { filter, tx });
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.lock().entries.remove(&subscription.id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn publish(&self, event: UpdateEvent) {
        let mut subs = self.lock();
        subs.entries.retain(|id, sub| {
            if !sub.filter.matches(&event) {
                return !sub.tx.is_closed();
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!("Subscriber {:?} is lagging, dropped {:?}", id, event.category());
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Subscriber {:?} went away", id);
                    false
                }
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
