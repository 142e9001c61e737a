// hub/src/streams.rs
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// Identifies one `open_conversation` call among however many have raced
/// for the same `agent_id`, so a superseded stream's own cleanup can tell
/// it no longer owns the `agent_id` entry it's about to touch (spec §4.4
/// scenario 5: a second stream opening for an id that already has one
/// open must supersede it cleanly, not have the first stream's teardown
/// run afterwards and tear the second one down instead).
pub type StreamId = u64;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a fresh id for a newly opened stream. Monotonic and unique
/// per process; never reused, so a stale id can never collide with a
/// later stream's id.
pub fn next_stream_id() -> StreamId {
    NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed)
}

/// The one piece of process-wide mutable state the Stream Server owns: a
/// map from `agent_id` to the id and cancellation handle of that agent's
/// active stream (spec §9). Entries are handles, not references to the
/// stream object itself, so the stream's lifetime is bounded by the handle
/// rather than by anything this map holds onto.
///
/// Mutated under a read/write lock; lookups and inserts/removals all take
/// the appropriate side of it (spec §5).
#[derive(Default)]
pub struct ActiveStreams {
    streams: RwLock<HashMap<String, (StreamId, CancellationToken)>>,
}

impl ActiveStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `token` under `id` as the cancellation handle for
    /// `agent_id`'s stream, replacing whatever handle was previously
    /// registered for the same id. Returns the previous token, if any, so
    /// the caller can explicitly cancel it and supersede that stream.
    pub fn insert(
        &self,
        agent_id: &str,
        id: StreamId,
        token: CancellationToken,
    ) -> Option<CancellationToken> {
        self.streams
            .write()
            .insert(agent_id.to_owned(), (id, token))
            .map(|(_, token)| token)
    }

    /// Removes the entry for `agent_id` only if it is still owned by
    /// `id`, i.e. no later stream has since superseded it. Returns `true`
    /// if the entry was removed. A superseded stream's teardown calls this
    /// and gets back `false`, so it knows not to touch an entry that now
    /// belongs to whatever stream replaced it.
    pub fn remove_if_current(&self, agent_id: &str, id: StreamId) -> bool {
        let mut guard = self.streams.write();
        if guard.get(agent_id).map(|(current, _)| *current) == Some(id) {
            guard.remove(agent_id);
            true
        } else {
            false
        }
    }

    pub fn cancel(&self, agent_id: &str) -> bool {
        if let Some((_, token)) = self.streams.read().get(agent_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancels every active stream. Used during graceful shutdown.
    pub fn cancel_all(&self) {
        for (_, token) in self.streams.read().values() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_replaces_and_returns_previous_handle() {
        let streams = ActiveStreams::new();
        let first = CancellationToken::new();
        let second = CancellationToken::new();

        assert!(streams.insert("a1", 1, first.clone()).is_none());
        let replaced = streams.insert("a1", 2, second).unwrap();
        assert!(!replaced.is_cancelled());
        assert_eq!(streams.len(), 1);
    }

    #[test]
    fn cancel_cancels_the_registered_token() {
        let streams = ActiveStreams::new();
        let token = CancellationToken::new();
        streams.insert("a1", 1, token.clone());
        assert!(streams.cancel("a1"));
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_unknown_agent_is_a_noop() {
        let streams = ActiveStreams::new();
        assert!(!streams.cancel("missing"));
    }

    #[test]
    fn remove_if_current_rejects_a_superseded_id() {
        let streams = ActiveStreams::new();
        streams.insert("a1", 1, CancellationToken::new());
        streams.insert("a1", 2, CancellationToken::new());

        // The first stream's (stale) id no longer owns the entry.
        assert!(!streams.remove_if_current("a1", 1));
        assert_eq!(streams.len(), 1);

        // The second stream's id still does.
        assert!(streams.remove_if_current("a1", 2));
        assert!(streams.is_empty());
    }
}
