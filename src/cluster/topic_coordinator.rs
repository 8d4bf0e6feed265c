//! Per-partition leadership aggregate.
//!
//! A [`TopicCoordinator`] holds the replication view, the current leader
//! session and whether local data is loaded. It is used in two places:
//!
//! - inside a leadership backend, where [`promote`](TopicCoordinator::promote)
//!   and [`clear_leader`](TopicCoordinator::clear_leader) are the only mutations;
//! - on each node, where [`apply_leader_session`](TopicCoordinator::apply_leader_session)
//!   adopts backend-confirmed or peer-propagated sessions subject to fencing.
//!
//! # State machine
//!
//! ```text
//!   Unleased ──promote / apply(own session)──▶ Leading
//!      ▲                                          │
//!      │                                   begin_release
//!      │                                          ▼
//!      └──────────── finish_release ────────── Releasing
//! ```

use std::fmt;

use super::error::{CoordError, CoordResult};
use crate::types::{
    Epoch, NodeIdentity, TopicLeaderSession, TopicPartitionMetaInfo, session_token,
};

/// Leadership state of a partition from the holder's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeadershipState {
    /// No leader held locally.
    #[default]
    Unleased,
    /// This coordinator's node holds the leader session.
    Leading,
    /// Leadership give-up in progress.
    Releasing,
}

impl LeadershipState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadershipState::Unleased => "unleased",
            LeadershipState::Leading => "leading",
            LeadershipState::Releasing => "releasing",
        }
    }
}

impl fmt::Display for LeadershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replication and leadership state of one (topic, partition).
#[derive(Debug, Clone, Default)]
pub struct TopicCoordinator {
    topic_info: TopicPartitionMetaInfo,
    leader_session: TopicLeaderSession,
    local_data_loaded: bool,
    state: LeadershipState,
}

impl TopicCoordinator {
    pub fn new(topic: &str, partition: i32) -> Self {
        Self {
            topic_info: TopicPartitionMetaInfo::new(topic, partition),
            ..Default::default()
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic_info.name
    }

    pub fn partition(&self) -> i32 {
        self.topic_info.partition
    }

    pub fn topic_info(&self) -> &TopicPartitionMetaInfo {
        &self.topic_info
    }

    pub fn leader_session(&self) -> &TopicLeaderSession {
        &self.leader_session
    }

    pub fn state(&self) -> LeadershipState {
        self.state
    }

    pub fn local_data_loaded(&self) -> bool {
        self.local_data_loaded
    }

    pub fn mark_local_data_loaded(&mut self) {
        self.local_data_loaded = true;
    }

    pub fn has_leader(&self) -> bool {
        self.leader_session.has_leader()
    }

    /// Leading and caught up, so safe to advertise as the serving leader.
    pub fn is_servable_leader(&self) -> bool {
        self.state == LeadershipState::Leading && self.local_data_loaded
    }

    // ========================================================================
    // Backend-side transitions
    // ========================================================================

    /// Make `node` the leader, bumping both epochs.
    ///
    /// Fails with `LeaderAlreadyExists` if a leader is live.
    pub fn promote(&mut self, node: &NodeIdentity) -> CoordResult<TopicLeaderSession> {
        if let Some(current) = self.leader_session.leader_id() {
            return Err(CoordError::LeaderAlreadyExists {
                topic: self.topic_info.name.clone(),
                partition: self.topic_info.partition,
                leader: current.to_string(),
            });
        }

        let leader_epoch = self.leader_session.leader_epoch.next();
        self.leader_session = TopicLeaderSession::new(node.clone(), leader_epoch);
        self.topic_info.join_isr(node.id());
        self.topic_info.leader = node.id().to_string();
        self.topic_info.epoch = self.topic_info.epoch.next();
        self.local_data_loaded = true;
        self.state = LeadershipState::Leading;

        Ok(self.leader_session.clone())
    }

    /// Drop the current leader, keeping epochs so the next promotion is newer.
    pub fn clear_leader(&mut self) {
        self.leader_session.leader_node = None;
        self.leader_session.session.clear();
        self.topic_info.leader.clear();
        self.state = LeadershipState::Unleased;
    }

    // ========================================================================
    // Node-side transitions
    // ========================================================================

    /// Adopt a leader session confirmed by the backend or propagated by the leader.
    ///
    /// Rejects sessions that are internally inconsistent, sessions whose
    /// epoch is older than the current one, and sessions with the current
    /// epoch but a different token. Re-applying the current session is a
    /// no-op apart from refreshing `topic_info`.
    pub fn apply_leader_session(
        &mut self,
        topic_info: TopicPartitionMetaInfo,
        session: TopicLeaderSession,
        local_id: &str,
    ) -> CoordResult<()> {
        self.check_consistent(&topic_info, &session)?;
        self.check_not_stale(&session)?;

        if topic_info.epoch >= self.topic_info.epoch {
            self.topic_info = topic_info;
        }

        self.state = if session.leader_id() == Some(local_id) {
            LeadershipState::Leading
        } else {
            LeadershipState::Unleased
        };
        self.leader_session = session;
        Ok(())
    }

    /// Take a newer replication view from the backend without touching the session.
    pub fn refresh_topic_info(&mut self, topic_info: TopicPartitionMetaInfo) {
        if topic_info.epoch >= self.topic_info.epoch {
            self.topic_info = topic_info;
        }
    }

    /// Verify a leader-scoped token against the current session.
    pub fn check_session(&self, token: &str) -> CoordResult<()> {
        if !self.leader_session.has_leader() || self.leader_session.session != token {
            return Err(CoordError::SessionMismatch {
                topic: self.topic_info.name.clone(),
                partition: self.topic_info.partition,
                expected: self.leader_session.session.clone(),
                received: token.to_string(),
            });
        }
        Ok(())
    }

    /// Leading → Releasing.
    pub fn begin_release(&mut self) -> CoordResult<()> {
        if self.state != LeadershipState::Leading {
            return Err(self.invalid_transition(LeadershipState::Releasing));
        }
        self.state = LeadershipState::Releasing;
        Ok(())
    }

    /// Releasing → Unleased, clearing the local leader record.
    pub fn finish_release(&mut self) -> CoordResult<()> {
        if self.state != LeadershipState::Releasing {
            return Err(self.invalid_transition(LeadershipState::Unleased));
        }
        self.clear_leader();
        Ok(())
    }

    /// Abort a release that the backend refused, returning to Leading.
    pub fn abort_release(&mut self) {
        if self.state == LeadershipState::Releasing {
            self.state = LeadershipState::Leading;
        }
    }

    /// The token must be derived from the leader id and epoch, and the
    /// accompanying view must name the same leader with it in the ISR.
    fn check_consistent(
        &self,
        topic_info: &TopicPartitionMetaInfo,
        session: &TopicLeaderSession,
    ) -> CoordResult<()> {
        let Some(leader_id) = session.leader_id() else {
            if session.session.is_empty() {
                return Ok(());
            }
            return Err(CoordError::SessionMismatch {
                topic: self.topic_info.name.clone(),
                partition: self.topic_info.partition,
                expected: String::new(),
                received: session.session.clone(),
            });
        };

        let expected = session_token(leader_id, session.leader_epoch);
        if session.session != expected {
            return Err(CoordError::SessionMismatch {
                topic: self.topic_info.name.clone(),
                partition: self.topic_info.partition,
                expected,
                received: session.session.clone(),
            });
        }

        if topic_info.leader != leader_id || !topic_info.is_in_isr(leader_id) {
            return Err(CoordError::InvalidNode(format!(
                "leader {} of {}/{} does not match view (leader {:?}, isr {:?})",
                leader_id, topic_info.name, topic_info.partition, topic_info.leader, topic_info.isr
            )));
        }
        Ok(())
    }

    fn check_not_stale(&self, session: &TopicLeaderSession) -> CoordResult<()> {
        let current = self.leader_session.leader_epoch;
        let received = session.leader_epoch;

        if received < current {
            return Err(CoordError::StaleEpoch {
                topic: self.topic_info.name.clone(),
                partition: self.topic_info.partition,
                current,
                received,
            });
        }

        // Same epoch must mean same session. A cleared session keeps its
        // epoch but has no leader, so any leader at that epoch is foreign.
        if received == current
            && current > Epoch::ZERO
            && self.leader_session.has_leader()
            && !self.leader_session.is_same(session)
        {
            return Err(CoordError::SessionMismatch {
                topic: self.topic_info.name.clone(),
                partition: self.topic_info.partition,
                expected: self.leader_session.session.clone(),
                received: session.session.clone(),
            });
        }
        Ok(())
    }

    fn invalid_transition(&self, to: LeadershipState) -> CoordError {
        CoordError::InvalidTransition {
            topic: self.topic_info.name.clone(),
            partition: self.topic_info.partition,
            from: self.state.as_str(),
            to: to.as_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(port: u16) -> NodeIdentity {
        NodeIdentity::new("127.0.0.1", port, "")
    }

    #[test]
    fn test_first_promotion_sets_epoch_one() {
        let mut tc = TopicCoordinator::new("orders", 0);
        let n1 = node(1);

        let session = tc.promote(&n1).unwrap();

        assert_eq!(session.leader_epoch, Epoch(1));
        assert_eq!(session.session, format!("{}1", n1.id()));
        assert_eq!(tc.topic_info().epoch, Epoch(1));
        assert_eq!(tc.topic_info().leader, n1.id());
        assert!(tc.topic_info().is_in_isr(n1.id()));
        assert!(tc.local_data_loaded());
        assert_eq!(tc.state(), LeadershipState::Leading);
    }

    #[test]
    fn test_promote_with_live_leader_fails_and_keeps_incumbent() {
        let mut tc = TopicCoordinator::new("orders", 0);
        let n1 = node(1);
        let n2 = node(2);
        tc.promote(&n1).unwrap();

        let err = tc.promote(&n2).unwrap_err();

        assert!(err.is_contention());
        assert_eq!(tc.leader_session().leader_id(), Some(n1.id()));
        assert_eq!(tc.topic_info().epoch, Epoch(1));
    }

    #[test]
    fn test_clear_then_promote_increases_epochs() {
        let mut tc = TopicCoordinator::new("orders", 0);
        let n1 = node(1);
        let n2 = node(2);

        tc.promote(&n1).unwrap();
        tc.clear_leader();
        assert!(!tc.has_leader());
        assert!(tc.topic_info().leader.is_empty());
        assert_eq!(tc.state(), LeadershipState::Unleased);

        let session = tc.promote(&n2).unwrap();
        assert_eq!(session.leader_epoch, Epoch(2));
        assert_eq!(tc.topic_info().epoch, Epoch(2));
        assert_eq!(tc.topic_info().isr.len(), 2);
        assert!(tc.topic_info().is_in_isr(tc.topic_info().leader.as_str()));
    }

    /// Replication view naming `leader` at `epoch`, as the backend reports it.
    fn view(leader: &NodeIdentity, epoch: u64) -> TopicPartitionMetaInfo {
        TopicPartitionMetaInfo {
            leader: leader.id().to_string(),
            isr: vec![leader.id().to_string()],
            epoch: Epoch(epoch),
            ..TopicPartitionMetaInfo::new("orders", 0)
        }
    }

    #[test]
    fn test_apply_rejects_older_epoch() {
        let n1 = node(1);
        let mut tc = TopicCoordinator::new("orders", 0);
        tc.apply_leader_session(view(&n1, 3), TopicLeaderSession::new(n1.clone(), Epoch(3)), "me")
            .unwrap();

        let err = tc
            .apply_leader_session(view(&n1, 2), TopicLeaderSession::new(n1, Epoch(2)), "me")
            .unwrap_err();

        assert!(matches!(err, CoordError::StaleEpoch { .. }));
        assert_eq!(tc.leader_session().leader_epoch, Epoch(3));
    }

    #[test]
    fn test_apply_rejects_foreign_session_with_same_epoch() {
        let mut tc = TopicCoordinator::new("orders", 0);
        tc.apply_leader_session(view(&node(1), 4), TopicLeaderSession::new(node(1), Epoch(4)), "me")
            .unwrap();

        let err = tc
            .apply_leader_session(view(&node(2), 4), TopicLeaderSession::new(node(2), Epoch(4)), "me")
            .unwrap_err();

        assert!(matches!(err, CoordError::SessionMismatch { .. }));
    }

    #[test]
    fn test_apply_rejects_token_not_derived_from_leader_and_epoch() {
        let n1 = node(1);
        let mut tc = TopicCoordinator::new("orders", 0);
        let forged = TopicLeaderSession {
            session: "forged".to_string(),
            ..TopicLeaderSession::new(n1.clone(), Epoch(1))
        };

        let err = tc.apply_leader_session(view(&n1, 1), forged, "me").unwrap_err();

        assert!(matches!(err, CoordError::SessionMismatch { .. }));
        assert!(!tc.has_leader());
        assert!(tc.check_session("forged").is_err());
    }

    #[test]
    fn test_apply_rejects_view_that_disagrees_with_session() {
        let n1 = node(1);
        let mut tc = TopicCoordinator::new("orders", 0);
        let session = TopicLeaderSession::new(n1.clone(), Epoch(1));

        let other_leader = TopicPartitionMetaInfo {
            leader: "someone-else".to_string(),
            ..view(&n1, 1)
        };
        let err = tc
            .apply_leader_session(other_leader, session.clone(), "me")
            .unwrap_err();
        assert!(matches!(err, CoordError::InvalidNode(_)));

        let empty_isr = TopicPartitionMetaInfo {
            isr: Vec::new(),
            ..view(&n1, 1)
        };
        let err = tc.apply_leader_session(empty_isr, session, "me").unwrap_err();
        assert!(matches!(err, CoordError::InvalidNode(_)));

        assert!(!tc.has_leader());
        assert!(tc.topic_info().isr.is_empty());
    }

    #[test]
    fn test_apply_same_session_is_idempotent() {
        let n1 = node(1);
        let mut tc = TopicCoordinator::new("orders", 0);
        let session = TopicLeaderSession::new(n1.clone(), Epoch(1));

        tc.apply_leader_session(view(&n1, 1), session.clone(), n1.id())
            .unwrap();
        tc.apply_leader_session(view(&n1, 1), session, n1.id()).unwrap();

        assert_eq!(tc.state(), LeadershipState::Leading);
    }

    #[test]
    fn test_apply_sets_state_by_local_identity() {
        let n1 = node(1);
        let mut tc = TopicCoordinator::new("orders", 0);
        tc.apply_leader_session(view(&n1, 1), TopicLeaderSession::new(n1, Epoch(1)), "someone-else")
            .unwrap();

        assert_eq!(tc.state(), LeadershipState::Unleased);
        assert!(tc.has_leader());
    }

    #[test]
    fn test_release_transitions() {
        let n1 = node(1);
        let mut tc = TopicCoordinator::new("orders", 0);
        assert!(tc.begin_release().is_err());

        tc.promote(&n1).unwrap();
        tc.begin_release().unwrap();
        assert_eq!(tc.state(), LeadershipState::Releasing);
        tc.finish_release().unwrap();
        assert_eq!(tc.state(), LeadershipState::Unleased);
        assert!(!tc.has_leader());
        assert!(tc.finish_release().is_err());
    }

    #[test]
    fn test_abort_release_returns_to_leading() {
        let mut tc = TopicCoordinator::new("orders", 0);
        tc.promote(&node(1)).unwrap();
        tc.begin_release().unwrap();
        tc.abort_release();
        assert_eq!(tc.state(), LeadershipState::Leading);
    }

    #[test]
    fn test_servable_requires_loaded_data() {
        let n1 = node(1);
        let mut tc = TopicCoordinator::new("orders", 0);
        tc.apply_leader_session(view(&n1, 1), TopicLeaderSession::new(n1.clone(), Epoch(1)), n1.id())
            .unwrap();

        assert_eq!(tc.state(), LeadershipState::Leading);
        assert!(!tc.is_servable_leader());

        tc.mark_local_data_loaded();
        assert!(tc.is_servable_leader());
    }

    #[test]
    fn test_refresh_ignores_older_view() {
        let mut tc = TopicCoordinator::new("orders", 0);
        let newer = TopicPartitionMetaInfo {
            leader: "n2".to_string(),
            isr: vec!["n2".to_string()],
            epoch: Epoch(2),
            ..TopicPartitionMetaInfo::new("orders", 0)
        };
        tc.refresh_topic_info(newer.clone());
        assert_eq!(tc.topic_info(), &newer);

        tc.refresh_topic_info(TopicPartitionMetaInfo {
            epoch: Epoch(1),
            ..TopicPartitionMetaInfo::new("orders", 0)
        });
        assert_eq!(tc.topic_info().epoch, Epoch(2));
        assert!(!tc.has_leader());
    }

    #[test]
    fn test_check_session_token() {
        let n1 = node(1);
        let mut tc = TopicCoordinator::new("orders", 0);
        let session = tc.promote(&n1).unwrap();

        assert!(tc.check_session(&session.session).is_ok());
        assert!(tc.check_session("stale-token").is_err());

        tc.clear_leader();
        assert!(tc.check_session(&session.session).is_err());
    }
}
