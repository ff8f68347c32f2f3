//! In-memory document hub
//!
//! One [`DocEntry`] per open notebook document: the live Y.Doc, its
//! awareness state, the fan-out channel to connected sockets, the dirty
//! flag and the two timers (debounced save, cleanup-after-empty).
//!
//! Lifecycle invariants:
//! - a doc entry is created exactly once per key, even under concurrent
//!   first connects (map insertion is atomic; hydration is singleflighted),
//! - if `dirty` is set, a save timer is armed or a flush is in progress,
//! - an entry is destroyed only after the last socket is gone, the cleanup
//!   delay has elapsed and a durable flush has committed.

use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;
use yrs::sync::{Awareness, Message, SyncMessage};
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Subscription, Transact, Update};
use yrs::updates::decoder::Decode;

use notehub_core::error::{Error, Result};
use notehub_core::PostgresStore;

use crate::metrics::RelayMetrics;

/// Next connection id; shared across sync and tunnel endpoints.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Identity of one document: the unique `(user, project, path)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocKey {
    pub user_id: Uuid,
    pub project: String,
    pub doc_path: String,
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.project, self.doc_path)
    }
}

/// A frame fanned out to every socket on a document except its origin.
#[derive(Debug, Clone)]
pub struct DocFrame {
    /// Origin tag of the socket the frame came from; `None` for
    /// server-originated frames (hydration, awareness retirement).
    pub origin: Option<yrs::Origin>,
    pub data: Vec<u8>,
}

/// Live state of one open document.
pub struct DocEntry {
    pub key: DocKey,
    doc: Doc,
    awareness: RwLock<Awareness>,
    frames: broadcast::Sender<DocFrame>,
    /// conn id -> awareness client ids announced over that socket
    conns: StdMutex<HashMap<u64, HashSet<u64>>>,
    dirty: AtomicBool,
    /// Set while the entry is being torn down; registrations bounce off it.
    defunct: AtomicBool,
    hydrated: tokio::sync::OnceCell<()>,
    save_task: StdMutex<Option<JoinHandle<()>>>,
    cleanup_task: StdMutex<Option<JoinHandle<()>>>,
    _update_sub: Subscription,
}

impl DocEntry {
    /// Build the entry and hook the doc's update observer. Synchronous on
    /// purpose: map insertion must not await, or two first-connects race.
    fn new(key: DocKey, hub: &Arc<DocHub>) -> Arc<Self> {
        let doc = Doc::new();
        let (frames, _) = broadcast::channel(256);

        Arc::new_cyclic(|weak: &Weak<DocEntry>| {
            let observer_entry = weak.clone();
            let observer_hub = Arc::downgrade(hub);
            let observer_tx = frames.clone();

            let update_sub = doc
                .observe_update_v1(move |txn, event| {
                    // Fan the update out to every peer except the origin socket.
                    let origin = txn.origin().cloned();
                    let frame = Message::Sync(SyncMessage::Update(event.update.clone())).encode_v1();
                    let _ = observer_tx.send(DocFrame { origin, data: frame });

                    // Mark dirty and (re)arm the debounced save.
                    if let (Some(entry), Some(hub)) =
                        (observer_entry.upgrade(), observer_hub.upgrade())
                    {
                        entry.dirty.store(true, Ordering::SeqCst);
                        entry.schedule_save(&hub);
                    }
                })
                .expect("fresh doc accepts observers");

            DocEntry {
                key,
                awareness: RwLock::new(Awareness::new(doc.clone())),
                doc,
                frames,
                conns: StdMutex::new(HashMap::new()),
                dirty: AtomicBool::new(false),
                defunct: AtomicBool::new(false),
                hydrated: tokio::sync::OnceCell::new(),
                save_task: StdMutex::new(None),
                cleanup_task: StdMutex::new(None),
                _update_sub: update_sub,
            }
        })
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn awareness(&self) -> &RwLock<Awareness> {
        &self.awareness
    }

    pub fn broadcast(&self, frame: DocFrame) {
        let _ = self.frames.send(frame);
    }

    /// Load persisted state into the doc exactly once across all connects.
    pub async fn ensure_hydrated(&self, store: &PostgresStore, metrics: &RelayMetrics) -> Result<()> {
        self.hydrated
            .get_or_try_init(|| async {
                let persisted = store
                    .load_document(&self.key.user_id, &self.key.project, &self.key.doc_path)
                    .await?;
                if let Some((Some(state), _)) = persisted {
                    let update = Update::decode_v1(&state)
                        .map_err(|e| Error::Internal(format!("corrupt stored yjs state: {e}")))?;
                    let mut txn = self.doc.transact_mut();
                    txn.apply_update(update)
                        .map_err(|e| Error::Internal(format!("stored state rejected: {e}")))?;
                }
                RelayMetrics::incr(&metrics.docs_loaded);
                Ok::<(), Error>(())
            })
            .await?;
        Ok(())
    }

    /// Register a socket. `None` means the entry is being torn down and the
    /// caller must re-fetch from the hub.
    pub fn register(&self, conn_id: u64) -> Option<broadcast::Receiver<DocFrame>> {
        let mut conns = self.conns.lock().expect("conns lock");
        if self.defunct.load(Ordering::SeqCst) {
            return None;
        }
        if let Some(handle) = self.cleanup_task.lock().expect("cleanup lock").take() {
            handle.abort();
        }
        conns.insert(conn_id, HashSet::new());
        Some(self.frames.subscribe())
    }

    /// Remember which awareness client ids a socket announced, so they can
    /// be retired when it goes away.
    pub fn track_awareness_clients(&self, conn_id: u64, client_ids: impl IntoIterator<Item = u64>) {
        let mut conns = self.conns.lock().expect("conns lock");
        if let Some(set) = conns.get_mut(&conn_id) {
            set.extend(client_ids);
        }
    }

    /// Drop a socket; retire its awareness state and arm cleanup when it was
    /// the last one.
    pub async fn unregister(self: &Arc<Self>, conn_id: u64, hub: &Arc<DocHub>) {
        let (client_ids, now_empty) = {
            let mut conns = self.conns.lock().expect("conns lock");
            let ids = conns.remove(&conn_id).unwrap_or_default();
            (ids, conns.is_empty())
        };

        if !client_ids.is_empty() {
            let awareness = self.awareness.write().await;
            for id in &client_ids {
                awareness.remove_state(*id);
            }
            // Tell remaining peers those clients are gone.
            if let Ok(update) = awareness.update_with_clients(client_ids.iter().copied()) {
                let frame = Message::Awareness(update).encode_v1();
                let _ = self.frames.send(DocFrame {
                    origin: Some(conn_origin(conn_id)),
                    data: frame,
                });
            }
        }

        if now_empty {
            self.arm_cleanup(hub);
        }
    }

    fn arm_cleanup(self: &Arc<Self>, hub: &Arc<DocHub>) {
        let entry = Arc::downgrade(self);
        let hub = Arc::downgrade(hub);
        let delay = hub.upgrade().map(|h| h.cleanup_delay).unwrap_or_default();

        let mut guard = self.cleanup_task.lock().expect("cleanup lock");
        if let Some(old) = guard.take() {
            old.abort();
        }
        *guard = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let (Some(entry), Some(hub)) = (entry.upgrade(), hub.upgrade()) {
                hub.try_evict(&entry.key).await;
            }
        }));
    }

    /// (Re)arm the debounced save.
    fn schedule_save(self: &Arc<Self>, hub: &Arc<DocHub>) {
        let entry = self.clone();
        let hub = hub.clone();
        let debounce = hub.save_debounce;

        let mut guard = self.save_task.lock().expect("save lock");
        if let Some(old) = guard.take() {
            old.abort();
        }
        *guard = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            entry.flush(&hub.store, &hub.metrics).await;
        }));
    }

    /// Persist the current doc state if dirty. Failure re-arms `dirty` so
    /// the next update or the cleanup pass retries.
    pub async fn flush(&self, store: &PostgresStore, metrics: &RelayMetrics) {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return;
        }

        let text_ref = self.doc.get_or_insert_text("content");
        let (state, text) = {
            let txn = self.doc.transact();
            (
                txn.encode_state_as_update_v1(&StateVector::default()),
                text_ref.get_string(&txn),
            )
        };

        match store
            .save_document(&self.key.user_id, &self.key.project, &self.key.doc_path, &state, &text)
            .await
        {
            Ok(()) => {
                RelayMetrics::incr(&metrics.docs_saved);
                tracing::debug!(doc = %self.key, bytes = state.len(), "document saved");
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                RelayMetrics::incr(&metrics.save_errors);
                RelayMetrics::incr(&metrics.errors);
                tracing::error!(doc = %self.key, error = %e, "document save failed");
            }
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }
}

/// Origin tag for updates applied on behalf of one socket. Peers filter
/// broadcast frames by comparing against their own tag.
pub fn conn_origin(conn_id: u64) -> yrs::Origin {
    yrs::Origin::from(format!("conn:{conn_id}").as_str())
}

/// The multi-tenant document registry.
pub struct DocHub {
    docs: DashMap<DocKey, Arc<DocEntry>>,
    pub(crate) store: PostgresStore,
    pub(crate) metrics: Arc<RelayMetrics>,
    save_debounce: Duration,
    cleanup_delay: Duration,
}

impl DocHub {
    pub fn new(
        store: PostgresStore,
        metrics: Arc<RelayMetrics>,
        save_debounce: Duration,
        cleanup_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            docs: DashMap::new(),
            store,
            metrics,
            save_debounce,
            cleanup_delay,
        })
    }

    /// Fetch or create the entry for a key. The bool is true when this call
    /// created it (first connect), which triggers a tunnel bridge request.
    pub fn get_or_create(self: &Arc<Self>, key: &DocKey) -> (Arc<DocEntry>, bool) {
        if let Some(existing) = self.docs.get(key) {
            return (existing.clone(), false);
        }
        match self.docs.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => (occupied.get().clone(), false),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let entry = DocEntry::new(key.clone(), self);
                vacant.insert(entry.clone());
                tracing::debug!(doc = %key, "document entry created");
                (entry, true)
            }
        }
    }

    pub fn get(&self, key: &DocKey) -> Option<Arc<DocEntry>> {
        self.docs.get(key).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Cleanup-timer target: evict the entry if it is still empty, flushing
    /// dirty state first.
    pub async fn try_evict(self: &Arc<Self>, key: &DocKey) {
        let Some(entry) = self.get(key) else { return };

        {
            let conns = entry.conns.lock().expect("conns lock");
            if !conns.is_empty() {
                return;
            }
            entry.defunct.store(true, Ordering::SeqCst);
        }

        entry.flush(&self.store, &self.metrics).await;
        if entry.is_dirty() {
            // Flush failed; keep the entry and retry after another delay
            // rather than dropping unsaved edits.
            entry.defunct.store(false, Ordering::SeqCst);
            entry.arm_cleanup(self);
            return;
        }
        self.docs.remove(key);
        tracing::debug!(doc = %key, "document entry evicted");
    }

    /// Shutdown path: flush every dirty doc and drop the registry.
    pub async fn flush_all(&self) {
        let entries: Vec<Arc<DocEntry>> =
            self.docs.iter().map(|kv| kv.value().clone()).collect();
        for entry in entries {
            entry.flush(&self.store, &self.metrics).await;
        }
    }

    /// Text materialization of an in-memory doc, if loaded.
    pub fn live_content(&self, key: &DocKey) -> Option<String> {
        let entry = self.get(key)?;
        let text_ref = entry.doc.get_or_insert_text("content");
        let txn = entry.doc.transact();
        Some(text_ref.get_string(&txn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::Text;

    fn test_key() -> DocKey {
        DocKey {
            user_id: Uuid::new_v4(),
            project: "Scratch".to_string(),
            doc_path: "notes/today.md".to_string(),
        }
    }

    /// Hub against an unreachable database: creation and eviction logic is
    /// exercised in-memory; any flush that reaches the store fails.
    fn test_hub() -> Arc<DocHub> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(100))
            .connect_lazy("postgres://127.0.0.1:1/notehub_test")
            .expect("lazy pool");
        DocHub::new(
            PostgresStore::from_pool(pool, 200),
            Arc::new(RelayMetrics::default()),
            Duration::from_millis(50),
            Duration::from_millis(200),
        )
    }

    fn edit(entry: &DocEntry, text: &str) {
        let text_ref = entry.doc().get_or_insert_text("content");
        let mut txn = entry.doc().transact_mut();
        let len = yrs::Text::len(&text_ref, &txn);
        text_ref.insert(&mut txn, len, text);
    }

    #[tokio::test]
    async fn first_connect_creates_exactly_once() {
        let hub = test_hub();
        let key = test_key();

        let (a, created_a) = hub.get_or_create(&key);
        let (b, created_b) = hub.get_or_create(&key);
        assert!(created_a);
        assert!(!created_b);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(hub.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_doc_is_evicted_after_cleanup_delay() {
        let hub = test_hub();
        let key = test_key();

        let (entry, _) = hub.get_or_create(&key);
        let _rx = entry.register(1).expect("register");
        entry.unregister(1, &hub).await;
        assert!(hub.get(&key).is_some());

        tokio::time::sleep(Duration::from_millis(250)).await;
        tokio::task::yield_now().await;
        assert!(hub.get(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_cancels_cleanup() {
        let hub = test_hub();
        let key = test_key();

        let (entry, _) = hub.get_or_create(&key);
        let _rx = entry.register(1).expect("register");
        entry.unregister(1, &hub).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let _rx2 = entry.register(2).expect("reconnect");

        tokio::time::sleep(Duration::from_millis(400)).await;
        tokio::task::yield_now().await;
        // The reconnect aborted the timer; the doc must still be resident.
        assert!(hub.get(&key).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_keeps_doc_dirty_and_resident() {
        let hub = test_hub();
        let key = test_key();

        let (entry, _) = hub.get_or_create(&key);
        let _rx = entry.register(1).expect("register");
        edit(&entry, "unsaved");
        assert!(entry.is_dirty());

        entry.flush(&hub.store, &hub.metrics).await;
        assert!(entry.is_dirty(), "save failure must re-arm dirty");
        assert!(hub.metrics.snapshot().save_errors >= 1);

        // Eviction refuses to drop unsaved edits.
        entry.unregister(1, &hub).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        tokio::task::yield_now().await;
        assert!(hub.get(&key).is_some());
    }

    #[tokio::test]
    async fn edits_mark_dirty_and_broadcast() {
        let hub = test_hub();
        let key = test_key();

        let (entry, _) = hub.get_or_create(&key);
        let mut rx = entry.register(7).expect("register");
        edit(&entry, "hello");

        assert!(entry.is_dirty());
        let frame = rx.try_recv().expect("update frame fanned out");
        assert!(!frame.data.is_empty());
        assert_eq!(hub.live_content(&key).as_deref(), Some("hello"));
    }

    #[test]
    fn conn_origins_are_distinct_and_stable() {
        assert_eq!(conn_origin(42), conn_origin(42));
        assert_ne!(conn_origin(42), conn_origin(43));
        assert_ne!(conn_origin(42), yrs::Origin::from("editor"));
    }

    #[test]
    fn doc_key_display_is_slash_joined() {
        let key = test_key();
        let shown = key.to_string();
        assert!(shown.ends_with("/Scratch/notes/today.md"));
    }

    #[test]
    fn update_observer_emits_frames_with_origin() {
        let doc = Doc::new();
        let (tx, mut rx) = broadcast::channel::<DocFrame>(8);
        let tx2 = tx.clone();
        let _sub = doc
            .observe_update_v1(move |txn, event| {
                let origin = txn.origin().cloned();
                let _ = tx2.send(DocFrame {
                    origin,
                    data: event.update.clone(),
                });
            })
            .unwrap();

        let text = doc.get_or_insert_text("content");
        {
            let mut txn = doc.transact_mut_with(conn_origin(7));
            text.insert(&mut txn, 0, "hello");
        }

        let frame = rx.try_recv().expect("frame broadcast");
        assert_eq!(frame.origin, Some(conn_origin(7)));
        assert!(!frame.data.is_empty());
    }

    #[test]
    fn state_encoding_round_trips_text() {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("content");
        {
            let mut txn = doc.transact_mut();
            text.insert(&mut txn, 0, "Hello world");
        }
        let state = {
            let txn = doc.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };

        let restored = Doc::new();
        let restored_text = restored.get_or_insert_text("content");
        {
            let mut txn = restored.transact_mut();
            txn.apply_update(Update::decode_v1(&state).unwrap()).unwrap();
        }
        let txn = restored.transact();
        assert_eq!(restored_text.get_string(&txn), "Hello world");
    }
}
