use std::{collections::HashSet, sync::Arc};

use rand::Rng;

use crate::{
    config::{SLOT_COUNT, SLOT_PROBE_ATTEMPTS},
    SandhiveError, SandhiveResult,
};

use super::{KvStore, Slot};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Reserves and releases per-node network slots.
///
/// Ownership of a slot is the KV key `{node_short_id}/{idx}` holding the sandbox id. Keys are only
/// ever written with compare-and-set, so at most one sandbox owns a slot at a time.
#[derive(Clone)]
pub struct SlotAllocator {
    kv: Arc<dyn KvStore>,
    node_short_id: String,
    slot_count: u32,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SlotAllocator {
    /// Creates an allocator over the full slot range of a node.
    pub fn new(kv: Arc<dyn KvStore>, node_short_id: impl Into<String>) -> Self {
        Self::with_slot_count(kv, node_short_id, SLOT_COUNT)
    }

    /// Creates an allocator that only hands out indices below `slot_count`.
    pub fn with_slot_count(
        kv: Arc<dyn KvStore>,
        node_short_id: impl Into<String>,
        slot_count: u32,
    ) -> Self {
        Self {
            kv,
            node_short_id: node_short_id.into(),
            slot_count: slot_count.clamp(1, SLOT_COUNT),
        }
    }

    /// The node id prefix of every key this allocator writes.
    pub fn node_short_id(&self) -> &str {
        &self.node_short_id
    }

    /// Reserves a free slot for `sandbox_id`.
    ///
    /// Tries a handful of random indices first, then scans the key space in order.
    pub async fn reserve(&self, sandbox_id: &str) -> SandhiveResult<Slot> {
        for _ in 0..SLOT_PROBE_ATTEMPTS {
            let idx = rand::rng().random_range(0..self.slot_count);
            if self.try_claim(idx, sandbox_id).await? {
                tracing::debug!(sandbox_id, slot_idx = idx, "reserved slot by probe");
                return Slot::new(&self.node_short_id, idx, sandbox_id);
            }
        }

        let prefix = format!("{}/", self.node_short_id);
        let taken: HashSet<u32> = self
            .kv
            .list_keys(&prefix)
            .await?
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix)?.parse().ok())
            .collect();

        for idx in (0..self.slot_count).filter(|idx| !taken.contains(idx)) {
            if self.try_claim(idx, sandbox_id).await? {
                tracing::debug!(sandbox_id, slot_idx = idx, "reserved slot by scan");
                return Slot::new(&self.node_short_id, idx, sandbox_id);
            }
        }

        Err(SandhiveError::SlotExhausted {
            node_short_id: self.node_short_id.clone(),
        })
    }

    /// Releases a slot if it is still owned by its sandbox.
    pub async fn release(&self, slot: &Slot) -> SandhiveResult<()> {
        self.release_idx(*slot.get_idx(), slot.get_sandbox_id())
            .await
    }

    /// Releases slot `idx` if its key still holds `sandbox_id`.
    ///
    /// A missing key or one holding another id counts as already released.
    pub async fn release_idx(&self, idx: u32, sandbox_id: &str) -> SandhiveResult<()> {
        let key = Slot::key_for(&self.node_short_id, idx);
        let entry = match self.kv.get(&key).await? {
            Some(entry) if entry.value == sandbox_id => entry,
            Some(entry) => {
                tracing::debug!(key = %key, owner = %entry.value, "slot owned by another sandbox");
                return Ok(());
            }
            None => {
                tracing::debug!(key = %key, "slot already released");
                return Ok(());
            }
        };

        if !self.kv.delete_cas(&key, entry.modify_index).await? {
            let err = SandhiveError::SlotRaceLost { key };
            tracing::warn!(sandbox_id, "{err}; assuming the slot was reassigned");
        }

        Ok(())
    }

    async fn try_claim(&self, idx: u32, sandbox_id: &str) -> SandhiveResult<bool> {
        let key = Slot::key_for(&self.node_short_id, idx);
        match self.kv.create_cas(&key, sandbox_id).await {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(e) => tracing::warn!(key = %key, "slot create failed, re-reading: {e}"),
        }

        // The create may have landed even though its response was lost.
        Ok(matches!(self.kv.get(&key).await?, Some(entry) if entry.value == sandbox_id))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
