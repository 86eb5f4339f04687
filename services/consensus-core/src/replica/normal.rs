//! Normal-case ordering: pre-prepare, prepare and commit.

use mesh_core::PeerId;
use tracing::{debug, info, warn};

use super::Replica;
use crate::crypto::{request_digest, sign, verify_signature};
use crate::error::{ConsensusError, Result};
use crate::message::{Commit, Message, MessageId, PrePrepare, Prepare, Request, NULL_DIGEST};

impl Replica {
    pub(crate) async fn send_pre_prepare(&mut self, request: Request, digest: String) -> Result<()> {
        let view = self.state.view;
        if let Some(existing) = self.state.sequence_of(view, &digest) {
            return Err(ConsensusError::ConflictingPrePrepare { view, digest, existing, proposed: self.state.sequence + 1 });
        }
        let sequence = self.state.sequence + 1;
        self.check_window(sequence)?;
        self.timer.start(false);
        self.state.sequence = sequence;
        let mut msg = PrePrepare { view, sequence, digest: digest.clone(), request: request.clone(), signature: String::new() };
        sign(&mut msg, &self.key)?;
        self.state.requests.insert(digest.clone(), request.clone());
        self.state.pending.insert(digest.clone(), request);
        self.state.slot_mut(msg.id()).preprepare = Some(msg.clone());
        info!(view, sequence, digest = %digest, "pre_prepare_sent");
        self.messaging.broadcast(&Message::PrePrepare(msg)).await
    }

    pub(crate) async fn process_pre_prepare(&mut self, from: PeerId, msg: PrePrepare) -> Result<()> {
        let expected = self.params.primary_for(msg.view);
        if expected == self.id {
            debug!(view = msg.view, sequence = msg.sequence, "pre_prepare_ignored_by_primary");
            return Ok(());
        }
        if !self.state.active_view {
            return Err(ConsensusError::ViewChangeInProgress);
        }
        if from != expected {
            warn!(view = msg.view, from = %from.short(), expected = %expected.short(), "pre_prepare_from_non_primary");
            return Ok(());
        }
        if msg.view != self.state.view {
            return Err(ConsensusError::ViewMismatch { current: self.state.view, message: msg.view });
        }
        verify_signature(&msg, &from)?;
        self.check_window(msg.sequence)?;
        if !msg.is_null() {
            let computed = request_digest(&msg.request)?;
            if computed != msg.digest {
                return Err(ConsensusError::DigestMismatch { claimed: msg.digest, computed });
            }
        }
        let id = msg.id();
        if let Some(existing) = self.state.preprepare(&id) {
            if existing.digest != msg.digest {
                warn!(slot = %id, accepted = %existing.digest, proposed = %msg.digest, "conflicting_pre_prepare_dropped");
            } else {
                debug!(slot = %id, "duplicate_pre_prepare");
            }
            return Ok(());
        }
        let digest = msg.digest.clone();
        if !msg.is_null() {
            self.state.requests.insert(digest.clone(), msg.request.clone());
            if !self.state.is_executed(&msg.request) {
                self.state.pending.insert(digest.clone(), msg.request.clone());
                self.timer.start(false);
            }
        }
        self.state.sequence = self.state.sequence.max(msg.sequence);
        self.state.slot_mut(id).preprepare = Some(msg.clone());
        info!(slot = %id, digest = %digest, "pre_prepare_accepted");
        if self.pre_prepared(id, &digest) {
            self.send_prepare(&msg).await
        } else {
            Ok(())
        }
    }

    pub(crate) fn pre_prepared(&self, id: MessageId, digest: &str) -> bool {
        let known = digest == NULL_DIGEST || self.state.requests.contains_key(digest);
        known && self.state.preprepare(&id).is_some_and(|pp| pp.digest == digest)
    }

    async fn send_prepare(&mut self, pp: &PrePrepare) -> Result<()> {
        let id = pp.id();
        let mut prepare = Prepare { view: pp.view, sequence: pp.sequence, digest: pp.digest.clone(), signature: String::new() };
        sign(&mut prepare, &self.key)?;
        self.state.slot_mut(id).prepares.insert(self.id, prepare.clone());
        debug!(slot = %id, "prepare_sent");
        let sent = self.messaging.broadcast(&Message::Prepare(prepare)).await;
        let next = self.maybe_send_commit(id, &pp.digest).await;
        sent.and(next)
    }

    pub(crate) async fn process_prepare(&mut self, from: PeerId, msg: Prepare) -> Result<()> {
        if from == self.params.primary_for(msg.view) {
            warn!(view = msg.view, sequence = msg.sequence, "prepare_from_primary_dropped");
            return Ok(());
        }
        if msg.view != self.state.view {
            return Err(ConsensusError::ViewMismatch { current: self.state.view, message: msg.view });
        }
        verify_signature(&msg, &from)?;
        let id = MessageId::new(msg.view, msg.sequence);
        let digest = msg.digest.clone();
        let slot = self.state.slot_mut(id);
        if slot.prepares.contains_key(&from) {
            debug!(slot = %id, from = %from.short(), "duplicate_prepare");
            return Ok(());
        }
        slot.prepares.insert(from, msg);
        self.maybe_send_commit(id, &digest).await
    }

    /// Prepare certificate: pre-prepared plus 2f matching prepares. The
    /// primary's pre-prepare is the implicit extra vote.
    pub(crate) fn prepared(&self, id: MessageId, digest: &str) -> bool {
        self.pre_prepared(id, digest)
            && self.state.slot(&id).is_some_and(|s| s.prepare_count(digest) >= self.params.prepare_quorum())
    }

    async fn maybe_send_commit(&mut self, id: MessageId, digest: &str) -> Result<()> {
        if !self.prepared(id, digest) {
            return Ok(());
        }
        if self.state.slot(&id).is_some_and(|s| s.commits.contains_key(&self.id)) {
            return Ok(());
        }
        let mut commit = Commit { view: id.view, sequence: id.sequence, digest: digest.to_string(), signature: String::new() };
        sign(&mut commit, &self.key)?;
        self.state.slot_mut(id).commits.insert(self.id, commit.clone());
        info!(slot = %id, digest = %digest, "prepared");
        let sent = self.messaging.broadcast(&Message::Commit(commit)).await;
        let next = if self.committed(id, digest) { self.execute(id, digest).await } else { Ok(()) };
        sent.and(next)
    }

    pub(crate) async fn process_commit(&mut self, from: PeerId, msg: Commit) -> Result<()> {
        if msg.view != self.state.view {
            return Err(ConsensusError::ViewMismatch { current: self.state.view, message: msg.view });
        }
        verify_signature(&msg, &from)?;
        let id = MessageId::new(msg.view, msg.sequence);
        let digest = msg.digest.clone();
        let slot = self.state.slot_mut(id);
        if slot.commits.contains_key(&from) {
            debug!(slot = %id, from = %from.short(), "duplicate_commit");
            return Ok(());
        }
        slot.commits.insert(from, msg);
        if self.committed(id, &digest) {
            self.execute(id, &digest).await
        } else {
            Ok(())
        }
    }

    /// Prepared plus 2f+1 matching commits, own commit included.
    pub(crate) fn committed(&self, id: MessageId, digest: &str) -> bool {
        self.prepared(id, digest)
            && self.state.slot(&id).is_some_and(|s| s.commit_count(digest) >= self.params.commit_quorum())
    }
}
