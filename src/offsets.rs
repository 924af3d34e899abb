//! # Offset Store
//!
//! Persists `subscriber → last acknowledged position` for one topic. Records
//! live in the topic's uncapped `<topic>_subscribers` collection and are never
//! evicted.
//!
//! Acknowledgments are upserts keyed by subscriber name, so different
//! subscribers never conflict. A stored offset never moves backwards: the
//! store keeps the larger of the old and new positions, which makes repeated
//! or out-of-order acknowledgments harmless.

use crate::actor::StoreHandle;
use crate::error::Result;
use crate::types::{Position, SubscriberName, TopicName};

/// Offset records of one topic's durable subscribers.
#[derive(Debug, Clone)]
pub struct OffsetStore {
    store: StoreHandle,
    collection: String,
}

impl OffsetStore {
    pub fn new(store: StoreHandle, topic: &TopicName) -> Self {
        Self {
            store,
            collection: topic.offsets_collection(),
        }
    }

    /// Last acknowledged position of `subscriber`, if it ever acknowledged.
    pub async fn get(&self, subscriber: &SubscriberName) -> Result<Option<Position>> {
        self.store.get_offset(&self.collection, subscriber).await
    }

    /// Records that `subscriber` processed everything up to `position`.
    ///
    /// Returns the offset now stored, which is `position` unless a larger one
    /// was already recorded.
    pub async fn acknowledge(&self, subscriber: &SubscriberName, position: Position) -> Result<Position> {
        let stored = self.store.acknowledge(&self.collection, subscriber, position).await?;
        tracing::trace!(
            collection = %self.collection,
            subscriber = %subscriber,
            position = %position,
            stored = %stored,
            "acknowledged"
        );
        Ok(stored)
    }
}
