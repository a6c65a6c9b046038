//! Sharded storage of live events.

use std::{hash::BuildHasher as _, num::NonZeroUsize, sync::Arc};

use hashbrown::{DefaultHashBuilder, HashMap};
use parking_lot::RwLock;

use crate::{
    event::{Event, Merge},
    Error,
};

type Shard = RwLock<HashMap<String, Arc<Event>>>;

/// A registry of events, keyed by metric key.
///
/// `Registry` is optimized for reads. Keys are spread over a number of independently locked shards, and the shard lock
/// is only held long enough to look up or insert an event: merging an update into an event happens under that event's
/// own lock, so producers updating unrelated keys never serialize on each other.
///
/// ## Eviction
///
/// Events are kept forever unless [`Registry::evict_idle`] is called. An evicted event is retired under its own lock
/// before it is removed from its shard, and a producer that raced the eviction will see the retirement and record its
/// update into a fresh event instead, so eviction never loses updates.
pub(crate) struct Registry {
    shards: Vec<Shard>,
    shard_mask: usize,
    hasher: DefaultHashBuilder,
}

impl Registry {
    /// Creates a new `Registry`.
    pub fn new() -> Self {
        let parallelism = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
        let shard_count = parallelism.next_power_of_two();
        let shard_mask = shard_count - 1;
        let shards = (0..shard_count).map(|_| RwLock::new(HashMap::new())).collect();

        Self { shards, shard_mask, hasher: DefaultHashBuilder::default() }
    }

    fn shard(&self, key: &str) -> &Shard {
        let hash = self.hasher.hash_one(key) as usize;
        &self.shards[hash & self.shard_mask]
    }

    /// Records the given event.
    ///
    /// If no event exists for the key yet, the given event becomes the live event for that key. Otherwise, it is merged
    /// into the existing event.
    ///
    /// # Errors
    ///
    /// If an event already exists for the key with a different metric type, [`Error::TypeConflict`] is returned and the
    /// existing event is left untouched.
    pub fn record(&self, event: Event) -> Result<(), Error> {
        let (key, mut payload) = event.into_parts();
        let shard = self.shard(&key);

        loop {
            let existing = shard.read().get(key.as_str()).map(Arc::clone);
            let handle = match existing {
                Some(handle) => handle,
                None => {
                    let mut events = shard.write();
                    match events.get(key.as_str()) {
                        Some(handle) => Arc::clone(handle),
                        None => {
                            let event = Arc::new(Event::from_parts(key.clone(), payload));
                            events.insert(key, event);
                            return Ok(());
                        }
                    }
                }
            };

            match handle.merge(payload)? {
                Merge::Applied => return Ok(()),
                Merge::Retired(returned) => {
                    // The event was evicted between our lookup and our merge, so go around again and pick up (or
                    // create) its replacement.
                    payload = returned;
                }
            }
        }
    }

    /// Gets the live event for the given key, if one exists.
    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<Arc<Event>> {
        self.shard(key).read().get(key).map(Arc::clone)
    }

    /// Gets handles to every live event.
    ///
    /// Shards are visited one at a time, so an event registered while this is running may or may not be observed.
    pub fn get_event_handles(&self) -> Vec<Arc<Event>> {
        let mut handles = Vec::new();
        for shard in &self.shards {
            handles.extend(shard.read().values().map(Arc::clone));
        }

        handles
    }

    /// Returns the number of live events.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    /// Removes every event that has been idle for at least `max_idle_intervals` flushes.
    ///
    /// Returns the number of events removed.
    pub fn evict_idle(&self, max_idle_intervals: u32) -> usize {
        let mut evicted = 0;
        for shard in &self.shards {
            shard.write().retain(|_, event| {
                let retired = event.try_retire(max_idle_intervals);
                evicted += usize::from(retired);
                !retired
            });
        }

        evicted
    }

    /// Removes all events.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().clear();
        }
    }
}
