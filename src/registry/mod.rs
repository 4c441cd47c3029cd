//! Registry of installed containers with pinned, lazily decoded values.
//!
//! # Slots
//! Every registered container occupies a slot in an append-only array.  A
//! slot's index is its permanent handle: slots are never removed or
//! reordered, only marked [`SlotStatus::Stale`] by [`Registry::remove`] and
//! overwritten in place by a later [`Registry::add`] once nobody holds them.
//! Reuse always picks the lowest reusable index, so handles are not issued
//! in insertion order.
//!
//! # Pinning
//! [`Registry::acquire`] returns a [`Lock`] that counts towards the slot's
//! `lock_count` until dropped.  The decoded value is built on the first
//! acquire of an active slot and cached in the slot.  A stale slot keeps
//! its value for as long as its count is above zero; the drop that brings
//! it to zero evicts the value.  A lock taken before `remove` therefore
//! keeps seeing the same value after it.
//!
//! # Locking
//! One mutex guards the slot array and the counts and is only held for
//! bookkeeping.  Header loading in `add` and value construction in
//! `acquire` run without it.  Construction pins the slot first, so the slot
//! cannot be reused underneath it; if two threads build the same value, the
//! one that relocks second drops its copy and takes the cached one.
//!
//! # File lifecycle
//! [`Registry::delete`] and [`Registry::update`] change the files behind a
//! container.  While the container is held the change is recorded on the
//! stale slot as a [`PendingFileOp`] and the release that frees the slot
//! runs it through the loader, so a reader never loses its files.  These
//! operations run under the mutex, which keeps a second release or add
//! from seeing the slot halfway through.

mod slot;

pub use slot::{ContainerInfo, LoadedHeader, PendingFileOp, SlotId, SlotStatus};

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use slot::Slot;

/// Capability that reads container metadata and builds decoded values.
pub trait ContainerLoader<V>: Send + Sync {
    /// Read just enough of the container to describe it.
    fn load_info(&self, name: &str) -> Result<LoadedHeader>;

    /// Open the container and build its decoded value.
    fn create_value(&self, name: &str, info: &ContainerInfo) -> Result<V>;

    /// Delete every file of `name`, staged replacement included.
    fn delete_files(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    /// Move the staged replacement of `name` over the installed file.
    fn replace_with_ready(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

/// Result of [`Registry::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The replacement is in place and registered at this slot.
    Installed(SlotId),
    /// The installed copy at this slot is still held.  The replacement is
    /// installed when its last lock is dropped.
    Deferred(SlotId),
}

pub struct Registry<V> {
    loader: Box<dyn ContainerLoader<V>>,
    slots:  Mutex<Vec<Slot<V>>>,
}

impl<V> fmt::Debug for Registry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("slots", &self.slots.lock().len())
            .finish()
    }
}

impl<V> Registry<V> {
    pub fn new<L: ContainerLoader<V> + 'static>(loader: L) -> Self {
        Self::with_loader(Box::new(loader))
    }

    pub fn with_loader(loader: Box<dyn ContainerLoader<V>>) -> Self {
        Self { loader, slots: Mutex::new(Vec::new()) }
    }

    // ── Registration ─────────────────────────────────────────────────────────

    /// Register the container `name` and return its slot.
    ///
    /// An already active `name` returns its existing slot untouched.  When
    /// the header cannot be loaded the error is returned and no slot changes.
    pub fn add(&self, name: &str) -> Result<SlotId> {
        if let Some(id) = self.find(name) {
            return Ok(id);
        }

        let loaded = self.loader.load_info(name)?;

        let mut slots = self.slots.lock();
        if let Some(existing) = slots.iter().find(|s| s.info.is_active() && s.info.name == name) {
            return Ok(existing.info.id);
        }

        let (id, evicted) = match slots.iter().position(|s| s.info.is_reusable()) {
            Some(index) => {
                let slot = &mut slots[index];
                let id = SlotId::new(index as u32, slot.info.id.generation().wrapping_add(1));
                let evicted = slot.value.take();
                slot.info = ContainerInfo::new(id, name, loaded);
                (id, evicted)
            }
            None => {
                let id = SlotId::new(slots.len() as u32, 0);
                slots.push(Slot { info: ContainerInfo::new(id, name, loaded), value: None });
                (id, None)
            }
        };
        drop(slots);
        drop(evicted);

        log::debug!("Registered '{name}' at {id}");
        Ok(id)
    }

    /// Mark the active container `name` stale.
    ///
    /// Its value is evicted now when nobody holds it, otherwise when the
    /// last lock is dropped.  Returns `false` when no active slot has `name`.
    pub fn remove(&self, name: &str) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.iter_mut().find(|s| s.info.is_active() && s.info.name == name) else {
            return false;
        };
        slot.info.status = SlotStatus::Stale;
        let id = slot.info.id;
        let held = slot.info.lock_count;
        let evicted = if held == 0 { slot.value.take() } else { None };
        drop(slots);
        drop(evicted);

        log::debug!("Removed '{name}' at {id} ({held} locks outstanding)");
        true
    }

    /// Mark every active container stale.
    pub fn remove_all(&self) {
        let mut evicted = Vec::new();
        {
            let mut slots = self.slots.lock();
            for slot in slots.iter_mut().filter(|s| s.info.is_active()) {
                slot.info.status = SlotStatus::Stale;
                if slot.info.lock_count == 0 {
                    evicted.extend(slot.value.take());
                }
            }
        }
        log::debug!("Removed all containers, {} values evicted", evicted.len());
    }

    // ── File lifecycle ───────────────────────────────────────────────────────

    /// Deregister `name` and delete its files.
    ///
    /// The files of a held container are deleted when its last lock is
    /// dropped.  A replacement still waiting on a held slot is cancelled.
    /// Returns `Ok(false)` when `name` is neither active nor waiting.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let mut slots = self.slots.lock();
        let mut found = false;
        let mut delete_now = false;
        let mut evicted = Vec::new();
        for slot in slots
            .iter_mut()
            .filter(|s| s.info.name == name && (s.info.is_active() || s.info.pending.is_some()))
        {
            found = true;
            slot.info.status = SlotStatus::Stale;
            if slot.info.lock_count > 0 {
                slot.info.pending = Some(PendingFileOp::Delete);
                log::debug!("Delete of '{name}' deferred, {} locks on {}", slot.info.lock_count, slot.info.id);
            } else {
                evicted.extend(slot.value.take());
                delete_now = true;
            }
        }
        if !found {
            return Ok(false);
        }
        drop(evicted);
        if delete_now {
            self.loader.delete_files(name)?;
            log::debug!("Deleted files of '{name}'");
        }
        Ok(true)
    }

    /// Swap the staged replacement of `name` in and register it.
    ///
    /// An unregistered `name` is replaced and added at once.  A registered
    /// one is marked stale; if nobody holds it the swap happens now,
    /// otherwise the release of its last lock performs it.  A failed swap
    /// leaves an unheld registration untouched.
    pub fn update(&self, name: &str) -> Result<UpdateOutcome> {
        {
            let mut slots = self.slots.lock();
            if let Some(waiting) = slots
                .iter()
                .find(|s| s.info.name == name && s.info.pending == Some(PendingFileOp::Replace))
            {
                return Ok(UpdateOutcome::Deferred(waiting.info.id));
            }

            let active = slots.iter().position(|s| s.info.is_active() && s.info.name == name);
            if let Some(index) = active {
                let slot = &mut slots[index];
                if slot.info.lock_count > 0 {
                    slot.info.status = SlotStatus::Stale;
                    slot.info.pending = Some(PendingFileOp::Replace);
                    log::debug!("Update of '{name}' deferred, {} locks on {}", slot.info.lock_count, slot.info.id);
                    return Ok(UpdateOutcome::Deferred(slot.info.id));
                }
            }

            self.loader.replace_with_ready(name)?;
            if let Some(index) = active {
                let slot = &mut slots[index];
                slot.info.status = SlotStatus::Stale;
                drop(slot.value.take());
            }
        }

        let id = self.add(name)?;
        log::debug!("Updated '{name}' at {id}");
        Ok(UpdateOutcome::Installed(id))
    }

    fn run_file_op(&self, op: PendingFileOp, name: &str) -> bool {
        let result = match op {
            PendingFileOp::Delete  => self.loader.delete_files(name),
            PendingFileOp::Replace => self.loader.replace_with_ready(name),
        };
        match result {
            Ok(()) => {
                log::debug!("{op:?} of '{name}' done");
                true
            }
            Err(e) => {
                log::warn!("{op:?} of '{name}' failed: {e}");
                false
            }
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    /// Slot of the active container `name`.
    pub fn find(&self, name: &str) -> Option<SlotId> {
        self.slots
            .lock()
            .iter()
            .find(|s| s.info.is_active() && s.info.name == name)
            .map(|s| s.info.id)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Metadata of `id`, unless its slot has since been reused.
    pub fn info(&self, id: SlotId) -> Option<ContainerInfo> {
        self.slots
            .lock()
            .get(id.index())
            .filter(|s| s.info.id == id)
            .map(|s| s.info.clone())
    }

    /// `id` still names an active container.
    pub fn is_current(&self, id: SlotId) -> bool {
        self.info(id).is_some_and(|i| i.is_active())
    }

    /// Copy of every slot's metadata, active and stale, in handle order.
    pub fn info_snapshot(&self) -> Vec<ContainerInfo> {
        self.slots.lock().iter().map(|s| s.info.clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.info.is_active()).count()
    }

    /// Number of slots ever issued.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    // ── Pinning ──────────────────────────────────────────────────────────────

    /// Pin slot `id` and return a lock over its value.
    ///
    /// The count is raised even for stale slots; such locks carry no value.
    /// An id whose slot has been reused pins the slot but carries no value
    /// either.  A failed construction is logged and also yields an empty
    /// lock; the next acquire tries again.
    pub fn acquire(&self, id: SlotId) -> Lock<'_, V> {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(id.index()) else {
            log::debug!("Acquire of unknown slot {id}");
            return Lock { registry: self, id, pinned: false, value: None };
        };
        slot.info.lock_count += 1;

        if slot.info.id != id || !slot.info.is_active() {
            return Lock { registry: self, id, pinned: true, value: None };
        }
        if let Some(value) = &slot.value {
            return Lock { registry: self, id, pinned: true, value: Some(value.clone()) };
        }

        let info = slot.info.clone();
        drop(slots);

        let built = match self.loader.create_value(&info.name, &info) {
            Ok(value) => Arc::new(value),
            Err(e) => {
                log::warn!("Cannot open '{}' at {id}: {e}", info.name);
                return Lock { registry: self, id, pinned: true, value: None };
            }
        };

        let mut slots = self.slots.lock();
        let slot = &mut slots[id.index()];
        let (value, loser) = match &slot.value {
            Some(cached) => (cached.clone(), Some(built)),
            None => {
                slot.value = Some(built.clone());
                (built, None)
            }
        };
        drop(slots);
        if loser.is_some() {
            log::trace!("Discarding duplicate value for '{}'", info.name);
        }

        Lock { registry: self, id, pinned: true, value: Some(value) }
    }

    /// [`acquire`](Self::acquire) the active container `name`.
    pub fn acquire_by_name(&self, name: &str) -> Option<Lock<'_, V>> {
        self.find(name).map(|id| self.acquire(id))
    }

    fn release(&self, index: usize) {
        let mut reinstall = None;
        {
            let mut slots = self.slots.lock();
            let slot = &mut slots[index];
            debug_assert!(slot.info.lock_count > 0, "slot #{index} released more often than acquired");
            slot.info.lock_count = slot.info.lock_count.saturating_sub(1);
            if slot.info.status != SlotStatus::Stale || slot.info.lock_count > 0 {
                return;
            }

            // Value first: its files must be closed before they change.
            if slot.value.take().is_some() {
                log::debug!("Evicted value of stale slot #{index}");
            }
            if let Some(op) = slot.info.pending {
                let name = slot.info.name.clone();
                let done = self.run_file_op(op, &name);
                slot.info.pending = None;
                if done && op == PendingFileOp::Replace {
                    reinstall = Some(name);
                }
            }
        }

        if let Some(name) = reinstall {
            match self.add(&name) {
                Ok(id) => log::debug!("Updated '{name}' at {id}"),
                Err(e) => log::warn!("Cannot register updated '{name}': {e}"),
            }
        }
    }

    // ── Cache control ────────────────────────────────────────────────────────

    /// Drop cached values nobody holds; active ones are rebuilt on demand.
    pub fn clear_cache(&self) {
        let mut evicted = Vec::new();
        {
            let mut slots = self.slots.lock();
            for slot in slots.iter_mut().filter(|s| s.info.lock_count == 0) {
                evicted.extend(slot.value.take());
            }
        }
        log::debug!("Cleared {} cached values", evicted.len());
    }

    /// Drop every cached value regardless of outstanding locks.
    ///
    /// Meant for process teardown once callers have released their locks.
    /// A lock still held keeps its own reference to the value, but the slot
    /// no longer caches it and its eviction bookkeeping is skipped.
    pub fn shutdown(&self) {
        let mut evicted = Vec::new();
        {
            let mut slots = self.slots.lock();
            for slot in slots.iter_mut() {
                if slot.info.lock_count > 0 {
                    log::warn!(
                        "Shutdown with {} locks outstanding on '{}'",
                        slot.info.lock_count,
                        slot.info.name
                    );
                }
                evicted.extend(slot.value.take());
            }
        }
        log::debug!("Shutdown evicted {} values", evicted.len());
    }

    #[cfg(test)]
    fn has_cached_value(&self, index: usize) -> bool {
        self.slots.lock()[index].value.is_some()
    }
}

// ── Lock ─────────────────────────────────────────────────────────────────────

/// Scoped pin on a registry slot.
pub struct Lock<'a, V> {
    registry: &'a Registry<V>,
    id:       SlotId,
    pinned:   bool,
    value:    Option<Arc<V>>,
}

impl<V> Lock<'_, V> {
    pub fn id(&self) -> SlotId {
        self.id
    }

    /// The decoded value, when the slot was active at acquisition and the
    /// value could be built.
    pub fn value(&self) -> Option<&V> {
        self.value.as_deref()
    }

    pub fn value_arc(&self) -> Option<Arc<V>> {
        self.value.clone()
    }

    pub fn is_valid(&self) -> bool {
        self.value.is_some()
    }
}

impl<V> fmt::Debug for Lock<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("id", &self.id)
            .field("pinned", &self.pinned)
            .field("has_value", &self.value.is_some())
            .finish()
    }
}

impl<V> Drop for Lock<'_, V> {
    fn drop(&mut self) {
        self.value = None;
        if self.pinned {
            self.registry.release(self.id.index());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorKind};
    use crate::header::{DataHeader, Rect};
    use crate::version::ContainerVersion;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts live values so tests can spot leaks and early evictions.
    struct TestValue {
        name: String,
        live: Arc<AtomicUsize>,
    }

    impl Drop for TestValue {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Max scale is the leading digit of the name; names starting with
    /// "bad" have no header and names starting with "broken" cannot be opened.
    /// File operations are recorded in `ops`; replacing a name starting
    /// with "stuck" fails.
    #[derive(Default)]
    struct TestLoader {
        live:    Arc<AtomicUsize>,
        created: Arc<AtomicUsize>,
        ops:     Arc<Mutex<Vec<String>>>,
    }

    impl ContainerLoader<TestValue> for TestLoader {
        fn load_info(&self, name: &str) -> Result<LoadedHeader> {
            if name.starts_with("bad") {
                return Err(Error::open("container", "bad magic"));
            }
            let n = name.bytes().next().map_or(0, |b| b.wrapping_sub(b'0'));
            Ok(LoadedHeader {
                version: ContainerVersion::LEGACY,
                header:  DataHeader { bounds: Rect::new(0.0, 0.0, 1.0, 1.0), min_scale: 0, max_scale: n },
            })
        }

        fn create_value(&self, name: &str, _: &ContainerInfo) -> Result<TestValue> {
            if name.starts_with("broken") {
                return Err(Error::Decode("truncated".into()));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(TestValue { name: name.to_owned(), live: self.live.clone() })
        }

        fn delete_files(&self, name: &str) -> Result<()> {
            self.ops.lock().push(format!("delete {name}"));
            Ok(())
        }

        fn replace_with_ready(&self, name: &str) -> Result<()> {
            if name.starts_with("stuck") {
                return Err(Error::Read(std::io::ErrorKind::NotFound.into()));
            }
            self.ops.lock().push(format!("replace {name}"));
            Ok(())
        }
    }

    fn registry() -> (Registry<TestValue>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let loader = TestLoader::default();
        let live = loader.live.clone();
        let created = loader.created.clone();
        (Registry::new(loader), live, created)
    }

    fn registry_with_ops() -> (Registry<TestValue>, Arc<AtomicUsize>, Arc<Mutex<Vec<String>>>) {
        let loader = TestLoader::default();
        let live = loader.live.clone();
        let ops = loader.ops.clone();
        (Registry::new(loader), live, ops)
    }

    fn summary(r: &Registry<TestValue>) -> Vec<(bool, u8)> {
        r.info_snapshot().iter().map(|i| (i.is_active(), i.max_scale)).collect()
    }

    #[test]
    fn smoke_reuse_and_deferred_eviction() {
        let (r, _, _) = registry();
        let ids: Vec<SlotId> = ["0", "1", "2"].iter().map(|n| r.add(n).unwrap()).collect();
        assert!(r.remove("1"));
        assert_eq!(summary(&r), [(true, 0), (false, 1), (true, 2)]);
        {
            let lock0 = r.acquire(ids[0]);
            let lock1 = r.acquire(ids[1]);
            assert!(lock0.value().is_some());
            assert!(lock1.value().is_none());
        }

        let id3 = r.add("3").unwrap();
        assert_eq!(id3.index(), 1);
        assert_eq!(summary(&r), [(true, 0), (true, 3), (true, 2)]);

        {
            let lock = r.acquire(id3);
            assert!(lock.value().is_some());
            assert!(r.remove("3"));
            let id4 = r.add("4").unwrap();
            assert_eq!(id4.index(), 3);
        }
        assert_eq!(summary(&r), [(true, 0), (false, 3), (true, 2), (true, 4)]);

        let id5 = r.add("5").unwrap();
        assert_eq!(id5.index(), 1);
        assert_eq!(summary(&r), [(true, 0), (true, 5), (true, 2), (true, 4)]);
    }

    #[test]
    fn lock_outlives_remove_with_same_value() {
        let (r, live, _) = registry();
        let id = r.add("7").unwrap();
        let lock = r.acquire(id);
        let before = lock.value_arc().unwrap();

        assert!(r.remove("7"));
        assert_eq!(r.info(id).unwrap().status, SlotStatus::Stale);
        assert!(r.has_cached_value(id.index()));
        assert!(Arc::ptr_eq(&before, &lock.value_arc().unwrap()));
        assert_eq!(lock.value().unwrap().name, "7");

        // a fresh lock on the stale slot sees nothing
        assert!(r.acquire(id).value().is_none());

        drop(before);
        drop(lock);
        assert!(!r.has_cached_value(id.index()));
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert_eq!(r.info(id).unwrap().lock_count, 0);
    }

    #[test]
    fn remove_without_locks_evicts_at_once() {
        let (r, live, _) = registry();
        let id = r.add("1").unwrap();
        drop(r.acquire(id));
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert!(r.remove("1"));
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert!(!r.remove("1"));
    }

    #[test]
    fn value_is_cached_between_locks() {
        let (r, _, created) = registry();
        let id = r.add("1").unwrap();
        for _ in 0..3 {
            assert!(r.acquire(id).is_valid());
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);

        r.clear_cache();
        assert!(r.acquire(id).is_valid());
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_header_leaves_no_trace() {
        let (r, _, _) = registry();
        r.add("1").unwrap();
        let err = r.add("bad-file").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Open);
        assert_eq!(r.len(), 1);
        assert!(!r.is_loaded("bad-file"));
    }

    #[test]
    fn failed_construction_gives_empty_lock() {
        let (r, _, _) = registry();
        let id = r.add("broken").unwrap();
        let lock = r.acquire(id);
        assert!(lock.value().is_none());
        assert_eq!(r.info(id).unwrap().lock_count, 1);
        assert!(r.is_current(id));
        drop(lock);
        assert_eq!(r.info(id).unwrap().lock_count, 0);
    }

    #[test]
    fn adding_active_name_returns_same_slot() {
        let (r, _, _) = registry();
        let a = r.add("3").unwrap();
        let b = r.add("3").unwrap();
        assert_eq!(a, b);
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn reused_slot_rejects_old_id() {
        let (r, _, _) = registry();
        let old = r.add("1").unwrap();
        r.remove("1");
        let new = r.add("2").unwrap();
        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert!(r.info(old).is_none());
        assert!(!r.is_current(old));

        let lock = r.acquire(old);
        assert!(lock.value().is_none());
        assert_eq!(r.info(new).unwrap().lock_count, 1);
        drop(lock);
        assert_eq!(r.info(new).unwrap().lock_count, 0);
        assert!(r.acquire(new).is_valid());
    }

    #[test]
    fn unknown_slot_is_harmless() {
        let (r, _, _) = registry();
        let lock = r.acquire(SlotId::new(42, 0));
        assert!(lock.value().is_none());
        drop(lock);
        assert!(r.is_empty());
    }

    #[test]
    fn active_count_tracks_adds_minus_removes() {
        let (r, _, _) = registry();
        for n in ["0", "1", "2", "3", "4"] {
            r.add(n).unwrap();
        }
        r.remove("1");
        r.remove("3");
        r.add("5").unwrap();
        r.remove("9");
        assert_eq!(r.active_count(), 4);
        assert_eq!(r.len(), 5);

        r.remove_all();
        assert_eq!(r.active_count(), 0);
        assert!(r.find("0").is_none());
    }

    #[test]
    fn shutdown_drops_everything() {
        let (r, live, _) = registry();
        let a = r.add("1").unwrap();
        let b = r.add("2").unwrap();
        drop(r.acquire(a));
        drop(r.acquire(b));
        assert_eq!(live.load(Ordering::SeqCst), 2);
        r.shutdown();
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn shutdown_keeps_held_values_valid() {
        let (r, live, _) = registry();
        let id = r.add("4").unwrap();
        let lock = r.acquire(id);
        r.shutdown();

        assert!(!r.has_cached_value(id.index()));
        assert_eq!(lock.value().unwrap().name, "4");
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert_eq!(r.info(id).unwrap().lock_count, 1);

        drop(lock);
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert_eq!(r.info(id).unwrap().lock_count, 0);
    }

    #[test]
    fn delete_waits_for_last_lock() {
        let (r, live, ops) = registry_with_ops();
        let id = r.add("2").unwrap();
        let first = r.acquire(id);
        let second = r.acquire(id);

        assert!(r.delete("2").unwrap());
        let info = r.info(id).unwrap();
        assert_eq!(info.status, SlotStatus::Stale);
        assert_eq!(info.pending, Some(PendingFileOp::Delete));
        assert!(!r.is_loaded("2"));

        drop(first);
        assert!(ops.lock().is_empty());
        assert_eq!(second.value().unwrap().name, "2");

        // The slot cannot be reused while its files are still owed.
        let other = r.add("3").unwrap();
        assert_ne!(other.index(), id.index());

        drop(second);
        assert_eq!(*ops.lock(), ["delete 2"]);
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert_eq!(r.info(id).unwrap().pending, None);
        assert_eq!(r.add("5").unwrap().index(), id.index());
    }

    #[test]
    fn delete_without_locks_runs_at_once() {
        let (r, _, ops) = registry_with_ops();
        r.add("1").unwrap();
        assert!(r.delete("1").unwrap());
        assert_eq!(*ops.lock(), ["delete 1"]);
        assert!(!r.delete("1").unwrap());
        assert!(!r.delete("never-added").unwrap());
        assert_eq!(ops.lock().len(), 1);
    }

    #[test]
    fn update_of_held_container_is_deferred() {
        let (r, _, ops) = registry_with_ops();
        let old = r.add("6").unwrap();
        let lock = r.acquire(old);

        assert_eq!(r.update("6").unwrap(), UpdateOutcome::Deferred(old));
        assert_eq!(r.update("6").unwrap(), UpdateOutcome::Deferred(old));
        assert_eq!(r.info(old).unwrap().pending, Some(PendingFileOp::Replace));
        assert!(r.find("6").is_none());
        assert!(ops.lock().is_empty());
        assert_eq!(lock.value().unwrap().name, "6");

        drop(lock);
        assert_eq!(*ops.lock(), ["replace 6"]);
        let new = r.find("6").unwrap();
        assert_eq!(new.index(), old.index());
        assert_ne!(new, old);
        assert!(r.acquire(new).is_valid());
    }

    #[test]
    fn update_without_locks_installs_at_once() {
        let (r, live, ops) = registry_with_ops();
        assert!(matches!(r.update("7").unwrap(), UpdateOutcome::Installed(_)));

        let old = r.find("7").unwrap();
        drop(r.acquire(old));
        assert_eq!(live.load(Ordering::SeqCst), 1);
        let UpdateOutcome::Installed(new) = r.update("7").unwrap() else {
            panic!("update of an unheld container was deferred");
        };
        assert_ne!(new, old);
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert_eq!(*ops.lock(), ["replace 7", "replace 7"]);
        assert_eq!(r.active_count(), 1);
    }

    #[test]
    fn failed_update_keeps_registration() {
        let (r, _, _) = registry_with_ops();
        let id = r.add("stuck").unwrap();
        assert_eq!(r.update("stuck").unwrap_err().kind(), ErrorKind::Read);
        assert!(r.is_current(id));
        assert!(r.acquire(id).is_valid());
    }

    #[test]
    fn delete_cancels_waiting_update() {
        let (r, _, ops) = registry_with_ops();
        let id = r.add("8").unwrap();
        let lock = r.acquire(id);
        assert_eq!(r.update("8").unwrap(), UpdateOutcome::Deferred(id));
        assert!(r.delete("8").unwrap());
        assert_eq!(r.info(id).unwrap().pending, Some(PendingFileOp::Delete));

        drop(lock);
        assert_eq!(*ops.lock(), ["delete 8"]);
        assert!(r.find("8").is_none());
    }

    #[test]
    fn concurrent_pins_survive_remove_and_add() {
        let (r, live, _) = registry();
        let r = &r;
        r.add("1").unwrap();

        std::thread::scope(|scope| {
            for _ in 0..6 {
                scope.spawn(move || {
                    for _ in 0..500 {
                        let Some(id) = r.find("1") else { continue };
                        let lock = r.acquire(id);
                        if let Some(v) = lock.value() {
                            assert_eq!(v.name, "1");
                            assert!(r.has_cached_value(id.index()), "value evicted while held");
                        }
                    }
                });
            }
            scope.spawn(move || {
                for _ in 0..200 {
                    r.remove("1");
                    r.add("1").unwrap();
                }
            });
        });

        let snapshot = r.info_snapshot();
        assert_eq!(snapshot.iter().filter(|i| i.is_active()).count(), 1);
        let mut cached = 0;
        for info in &snapshot {
            assert_eq!(info.lock_count, 0);
            let has = r.has_cached_value(info.id.index());
            if !info.is_active() {
                assert!(!has, "stale slot {} kept its value", info.id);
            }
            cached += usize::from(has);
        }
        assert_eq!(live.load(Ordering::SeqCst), cached);
    }
}
