//! # IDs
//! Strokes, nodes and devices are referred to by process-unique ids. `UniqueId<T>` is namespaced by
//! the marker type `T`, so a `UniqueId<Node>` can never be compared against a `UniqueId<Stroke>`,
//! even if they happen to carry the same number.
//!
//! Ids are handed out from one counter per namespace, starting at 1. They are not meant to be
//! persisted.

use std::sync::atomic::{AtomicU64, Ordering};

// Next free value, per namespace. Namespaces are created lazily on first use.
static COUNTERS: parking_lot::RwLock<Option<hashbrown::HashMap<std::any::TypeId, AtomicU64>>> =
    parking_lot::const_rwlock(None);

/// Id unique within this run of the program.
pub struct UniqueId<T: std::any::Any> {
    id: std::num::NonZeroU64,
    // `fn() -> T` keeps the id `Send + Sync` regardless of `T`.
    _namespace: std::marker::PhantomData<fn() -> T>,
}

impl<T: std::any::Any> UniqueId<T> {
    /// Allocate a fresh id in `T`'s namespace.
    #[must_use]
    pub fn new() -> Self {
        let ty = std::any::TypeId::of::<T>();
        let value = {
            let read = COUNTERS.upgradable_read();
            if let Some(counter) = read.as_ref().and_then(|map| map.get(&ty)) {
                counter.fetch_add(1, Ordering::Relaxed)
            } else {
                let mut write = parking_lot::RwLockUpgradableReadGuard::upgrade(read);
                let counter = write
                    .get_or_insert_with(hashbrown::HashMap::new)
                    .entry(ty)
                    .or_insert_with(|| AtomicU64::new(1));
                counter.fetch_add(1, Ordering::Relaxed)
            }
        };
        let Some(id) = std::num::NonZeroU64::new(value) else {
            // The counter wrapped. Every id from here on could collide.
            log::error!("{} id space exhausted, aborting", std::any::type_name::<T>());
            log::logger().flush();
            std::process::abort();
        };
        Self {
            id,
            _namespace: std::marker::PhantomData,
        }
    }
    /// Raw numeric value. Ids from different namespaces may share a value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.id.get()
    }
}

impl<T: std::any::Any> Default for UniqueId<T> {
    fn default() -> Self {
        Self::new()
    }
}
impl<T: std::any::Any> Clone for UniqueId<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: std::any::Any> Copy for UniqueId<T> {}
impl<T: std::any::Any> PartialEq for UniqueId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl<T: std::any::Any> Eq for UniqueId<T> {}
impl<T: std::any::Any> PartialOrd for UniqueId<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T: std::any::Any> Ord for UniqueId<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}
impl<T: std::any::Any> std::hash::Hash for UniqueId<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
impl<T: std::any::Any> std::fmt::Display for UniqueId<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = std::any::type_name::<T>();
        let short = name.rsplit("::").next().unwrap_or(name);
        write!(f, "{short}#{}", self.id)
    }
}
impl<T: std::any::Any> std::fmt::Debug for UniqueId<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod test {
    use super::UniqueId;
    // Every test uses its own namespace, as the counters are process-global.

    #[test]
    fn first_id_is_one() {
        struct Namespace;
        let id = UniqueId::<Namespace>::new();
        assert_eq!(id.get(), 1);
        assert_eq!(UniqueId::<Namespace>::new().get(), 2);
    }
    #[test]
    fn ids_unique_across_threads() {
        struct Namespace;
        let handles: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    (0..256)
                        .map(|_| UniqueId::<Namespace>::new())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<_> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        all.sort_unstable();
        let before = all.len();
        all.dedup();
        assert_eq!(before, all.len(), "had duplicate ids");
    }
    #[test]
    fn display_names_namespace() {
        struct Widget;
        let id = UniqueId::<Widget>::new();
        assert_eq!(id.to_string(), format!("Widget#{}", id.get()));
    }
}
