//! Protocol state owned by one replica.

use std::collections::{BTreeMap, HashMap, HashSet};

use mesh_core::PeerId;

use crate::execution::ExecutionResponse;
use crate::message::{Commit, MessageId, PrePrepare, Prepare, PrepareInfo, Request, ViewChange};

/// Everything known about one `(view, sequence)` slot.
#[derive(Clone, Debug, Default)]
pub struct SlotRecord {
    pub preprepare: Option<PrePrepare>,
    pub prepares: BTreeMap<PeerId, Prepare>,
    pub commits: BTreeMap<PeerId, Commit>,
}

impl SlotRecord {
    pub fn digest(&self) -> Option<&str> { self.preprepare.as_ref().map(|pp| pp.digest.as_str()) }

    pub fn prepare_count(&self, digest: &str) -> usize { self.prepares.values().filter(|p| p.digest == digest).count() }

    pub fn commit_count(&self, digest: &str) -> usize { self.commits.values().filter(|c| c.digest == digest).count() }
}

#[derive(Debug)]
pub struct ReplicaState {
    pub view: u64,
    pub active_view: bool,
    /// Last view this replica operated in normally.
    pub last_active_view: u64,
    /// Highest sequence number assigned or accepted.
    pub sequence: u64,
    pub last_executed: u64,
    /// Known requests by digest.
    pub requests: HashMap<String, Request>,
    /// Digests accepted for ordering but not yet executed.
    pub pending: HashMap<String, Request>,
    pub slots: HashMap<MessageId, SlotRecord>,
    pub view_changes: BTreeMap<u64, BTreeMap<PeerId, ViewChange>>,
    /// Cached responses by request id.
    pub executions: HashMap<String, ExecutionResponse>,
}

impl Default for ReplicaState {
    fn default() -> Self {
        Self {
            view: 0,
            active_view: true,
            last_active_view: 0,
            sequence: 0,
            last_executed: 0,
            requests: HashMap::new(),
            pending: HashMap::new(),
            slots: HashMap::new(),
            view_changes: BTreeMap::new(),
            executions: HashMap::new(),
        }
    }
}

impl ReplicaState {
    pub fn slot(&self, id: &MessageId) -> Option<&SlotRecord> { self.slots.get(id) }

    pub fn slot_mut(&mut self, id: MessageId) -> &mut SlotRecord { self.slots.entry(id).or_default() }

    pub fn preprepare(&self, id: &MessageId) -> Option<&PrePrepare> { self.slots.get(id).and_then(|s| s.preprepare.as_ref()) }

    /// Sequence already holding `digest` in `view`, if any.
    pub fn sequence_of(&self, view: u64, digest: &str) -> Option<u64> {
        self.slots
            .iter()
            .filter(|(id, _)| id.view == view)
            .find(|(_, slot)| slot.digest() == Some(digest))
            .map(|(id, _)| id.sequence)
    }

    pub fn activate(&mut self, view: u64) {
        self.view = view;
        self.active_view = true;
        self.last_active_view = view;
    }

    /// Forget pending requests that `keep` does not list. Returns how many were dropped.
    pub fn retain_pending<'a>(&mut self, keep: impl IntoIterator<Item = &'a str>) -> usize {
        let keep: HashSet<&str> = keep.into_iter().collect();
        let before = self.pending.len();
        self.pending.retain(|digest, _| keep.contains(digest.as_str()));
        before - self.pending.len()
    }

    pub fn is_executed(&self, request: &Request) -> bool { self.executions.contains_key(&request.id) }

    pub fn record_view_change(&mut self, from: PeerId, msg: ViewChange) -> bool {
        let received = self.view_changes.entry(msg.view).or_default();
        if received.contains_key(&from) {
            return false;
        }
        received.insert(from, msg);
        true
    }

    pub fn view_change_count(&self, view: u64) -> usize { self.view_changes.get(&view).map_or(0, BTreeMap::len) }

    /// Slots with a pre-prepare and a prepare certificate, in slot order.
    pub fn certificates(&self, quorum: usize) -> Vec<PrepareInfo> {
        let mut out: Vec<PrepareInfo> = self
            .slots
            .iter()
            .filter_map(|(id, slot)| {
                let pp = slot.preprepare.as_ref()?;
                if pp.is_null() || !self.requests.contains_key(&pp.digest) || slot.prepare_count(&pp.digest) < quorum {
                    return None;
                }
                let prepares = slot.prepares.iter().filter(|(_, p)| p.digest == pp.digest).map(|(k, p)| (*k, p.clone())).collect();
                Some(PrepareInfo { view: id.view, sequence: id.sequence, digest: pp.digest.clone(), preprepare: pp.clone(), prepares })
            })
            .collect();
        out.sort_by_key(|info| (info.view, info.sequence));
        out
    }
}
