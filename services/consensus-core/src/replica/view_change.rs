//! View change: suspect the primary, collect evidence, install the next view.

use std::collections::BTreeMap;

use mesh_core::PeerId;
use tracing::{debug, info, warn};

use super::Replica;
use crate::crypto::{request_digest, sign, verify_signature};
use crate::error::{ConsensusError, Result};
use crate::message::{Message, NewView, PrePrepare, PrepareInfo, Request, ViewChange, NULL_DIGEST};

/// Proposals a new primary must issue for `view` given the collected view
/// changes: every sequence up to the highest certified one, using the
/// certificate from the highest view, with null requests filling the holes.
/// Returned unsigned.
pub(crate) fn proposals_for(view: u64, messages: &BTreeMap<PeerId, ViewChange>) -> Vec<PrePrepare> {
    let mut best: BTreeMap<u64, &PrepareInfo> = BTreeMap::new();
    for info in messages.values().flat_map(|vc| vc.prepares.iter()) {
        match best.get(&info.sequence) {
            Some(current) if current.view >= info.view => {}
            _ => {
                best.insert(info.sequence, info);
            }
        }
    }
    let max = best.keys().next_back().copied().unwrap_or(0);
    (0..=max)
        .map(|sequence| match best.get(&sequence) {
            Some(info) => PrePrepare {
                view,
                sequence,
                digest: info.digest.clone(),
                request: info.preprepare.request.clone(),
                signature: String::new(),
            },
            None => PrePrepare { view, sequence, digest: NULL_DIGEST.to_string(), request: Request::null(), signature: String::new() },
        })
        .collect()
}

impl Replica {
    /// Abandon the current view and ask the cluster to move to `new_view`.
    pub(crate) async fn start_view_change(&mut self, new_view: u64) -> Result<()> {
        self.timer.stop();
        self.state.view = new_view;
        self.state.active_view = false;
        let prepares = self.prepare_set();
        let mut msg = ViewChange { view: new_view, prepares, signature: String::new() };
        sign(&mut msg, &self.key)?;
        self.state.record_view_change(self.id, msg.clone());
        warn!(
            replica = %self.id.short(),
            view = new_view,
            next_primary = %self.params.primary_for(new_view).short(),
            certificates = msg.prepares.len(),
            "view_change_started"
        );
        self.arm_view_change_timer(new_view);
        let sent = self.messaging.broadcast(&Message::ViewChange(msg)).await;
        let next = self.try_start_new_view(new_view).await;
        sent.and(next)
    }

    /// Prepare certificates this replica holds, in slot order.
    pub(crate) fn prepare_set(&self) -> Vec<PrepareInfo> { self.state.certificates(self.params.prepare_quorum()) }

    /// Lowest view whose view changes are still of interest. A replica that is
    /// still changing views keeps listening to every view above the last one it
    /// ran normally, so it can fall back to where its peers are.
    fn oldest_open_view(&self) -> u64 {
        if self.state.active_view {
            self.state.view
        } else {
            self.state.last_active_view + 1
        }
    }

    pub(crate) async fn process_view_change(&mut self, from: PeerId, msg: ViewChange) -> Result<()> {
        if msg.view < self.oldest_open_view() {
            debug!(view = msg.view, current = self.state.view, from = %from.short(), "stale_view_change");
            return Ok(());
        }
        verify_signature(&msg, &from)?;
        self.validate_view_change(&msg)?;
        let view = msg.view;
        if !self.state.record_view_change(from, msg) {
            debug!(view, from = %from.short(), "duplicate_view_change");
            return Ok(());
        }
        let received = self.state.view_change_count(view);
        info!(view, from = %from.short(), received, "view_change_received");
        if view != self.state.view && received > self.params.f() {
            if view > self.state.view {
                info!(view, current = self.state.view, "joining_view_change");
            } else {
                info!(view, current = self.state.view, "rejoining_view_change");
            }
            return self.start_view_change(view).await;
        }
        self.arm_view_change_timer(view);
        self.try_start_new_view(view).await
    }

    /// Escalation timer: once 2f+1 replicas want `view`, a missing NewView
    /// moves this replica on to the next one.
    fn arm_view_change_timer(&mut self, view: u64) {
        if view == self.state.view && !self.state.active_view && self.view_change_ready(view) {
            self.timer.start(false);
        }
    }

    /// Check the prepare evidence carried by a view change.
    fn validate_view_change(&self, msg: &ViewChange) -> Result<()> {
        for info in &msg.prepares {
            let pp = &info.preprepare;
            if pp.view != info.view || pp.sequence != info.sequence || pp.digest != info.digest {
                return Err(ConsensusError::InvalidViewChange(format!("certificate {}/{} disagrees with its pre-prepare", info.view, info.sequence)));
            }
            if info.view >= msg.view {
                return Err(ConsensusError::InvalidViewChange(format!("certificate from view {} in view change to {}", info.view, msg.view)));
            }
            self.check_window(info.sequence).map_err(|e| ConsensusError::InvalidViewChange(e.to_string()))?;
            let primary = self.params.primary_for(info.view);
            verify_signature(pp, &primary)
                .map_err(|e| ConsensusError::InvalidViewChange(format!("pre-prepare {}/{}: {e}", info.view, info.sequence)))?;
            if !pp.is_null() {
                let computed = request_digest(&pp.request)?;
                if computed != info.digest {
                    return Err(ConsensusError::InvalidViewChange(format!("digest of {}/{} does not match its request", info.view, info.sequence)));
                }
            }
            let valid = info
                .prepares
                .iter()
                .filter(|(peer, p)| {
                    **peer != primary
                        && self.params.contains(peer)
                        && p.view == info.view
                        && p.sequence == info.sequence
                        && p.digest == info.digest
                        && verify_signature(*p, peer).is_ok()
                })
                .count();
            if valid < self.params.prepare_quorum() {
                return Err(ConsensusError::InvalidViewChange(format!(
                    "certificate {}/{} has {valid} valid prepares, need {}",
                    info.view,
                    info.sequence,
                    self.params.prepare_quorum()
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn view_change_ready(&self, view: u64) -> bool {
        self.state.view_change_count(view) >= self.params.commit_quorum()
    }

    async fn try_start_new_view(&mut self, view: u64) -> Result<()> {
        if view != self.state.view
            || self.state.active_view
            || self.params.primary_for(view) != self.id
            || !self.view_change_ready(view)
        {
            return Ok(());
        }
        self.start_new_view(view).await
    }

    /// Install `view` as its primary and announce it.
    pub(crate) async fn start_new_view(&mut self, view: u64) -> Result<()> {
        if !self.view_change_ready(view) {
            return Err(ConsensusError::ViewChangeNotReady(view));
        }
        let messages = self.state.view_changes.get(&view).cloned().unwrap_or_default();
        let mut preprepares = proposals_for(view, &messages);
        for pp in &mut preprepares {
            sign(pp, &self.key)?;
        }
        let mut msg = NewView { view, messages, preprepares, signature: String::new() };
        sign(&mut msg, &self.key)?;

        self.timer.stop();
        self.adopt_proposals(&msg.preprepares);
        self.state.activate(view);
        if !self.state.pending.is_empty() {
            self.timer.start(false);
        }
        info!(view, proposals = msg.preprepares.len(), pending = self.state.pending.len(), "new_view_started");
        self.messaging.broadcast(&Message::NewView(msg)).await
    }

    /// Requests the new view does not re-propose are no longer ordered here;
    /// their clients resubmit them.
    fn drop_unproposed(&mut self, preprepares: &[PrePrepare]) {
        let dropped = self.state.retain_pending(preprepares.iter().filter(|pp| !pp.is_null()).map(|pp| pp.digest.as_str()));
        if dropped > 0 {
            info!(view = self.state.view, dropped, "pending_requests_dropped");
        }
    }

    fn adopt_proposals(&mut self, preprepares: &[PrePrepare]) {
        self.drop_unproposed(preprepares);
        for pp in preprepares {
            if !pp.is_null() {
                self.state.requests.insert(pp.digest.clone(), pp.request.clone());
                if !self.state.is_executed(&pp.request) {
                    self.state.pending.insert(pp.digest.clone(), pp.request.clone());
                }
            }
            self.state.slot_mut(pp.id()).preprepare = Some(pp.clone());
        }
        self.state.sequence = preprepares.last().map_or(0, |pp| pp.sequence);
    }

    pub(crate) async fn process_new_view(&mut self, from: PeerId, msg: NewView) -> Result<()> {
        if self.state.active_view {
            return Err(ConsensusError::ActiveViewAlready);
        }
        if msg.view < self.oldest_open_view() {
            debug!(view = msg.view, current = self.state.view, "stale_new_view");
            return Ok(());
        }
        let expected = self.params.primary_for(msg.view);
        if from != expected {
            return Err(ConsensusError::WrongPrimary { view: msg.view, expected, got: from });
        }
        verify_signature(&msg, &from)?;
        if msg.messages.len() < self.params.commit_quorum() {
            return Err(ConsensusError::InsufficientViewChangeQuorum { have: msg.messages.len(), need: self.params.commit_quorum() });
        }
        for (peer, vc) in &msg.messages {
            if vc.view != msg.view {
                return Err(ConsensusError::ViewChangeViewMismatch { expected: msg.view, got: vc.view });
            }
            if !self.params.contains(peer) {
                return Err(ConsensusError::UnknownReplica(*peer));
            }
            verify_signature(vc, peer).map_err(|e| ConsensusError::InvalidNewView(format!("view change from {}: {e}", peer.short())))?;
            self.validate_view_change(vc)?;
        }
        for (want, pp) in (0u64..).zip(&msg.preprepares) {
            if pp.sequence != want {
                return Err(ConsensusError::SequenceGap { expected: want, got: pp.sequence });
            }
        }
        let recomputed = proposals_for(msg.view, &msg.messages);
        let matches = recomputed.len() == msg.preprepares.len()
            && recomputed.iter().zip(&msg.preprepares).all(|(want, got)| {
                want.view == got.view && want.sequence == got.sequence && want.digest == got.digest && want.request == got.request
            });
        if !matches {
            return Err(ConsensusError::InvalidNewView("pre-prepares do not follow from the view change evidence".into()));
        }

        self.timer.stop();
        self.drop_unproposed(&msg.preprepares);
        self.state.activate(msg.view);
        self.state.sequence = msg.preprepares.last().map_or(0, |pp| pp.sequence);
        info!(view = msg.view, primary = %from.short(), proposals = msg.preprepares.len(), "new_view_accepted");
        for pp in msg.preprepares {
            let slot = pp.id();
            if let Err(err) = self.process_pre_prepare(from, pp).await {
                warn!(slot = %slot, error = %err, "new_view_pre_prepare_failed");
            }
        }
        if !self.state.pending.is_empty() {
            self.timer.start(false);
        }
        Ok(())
    }
}
