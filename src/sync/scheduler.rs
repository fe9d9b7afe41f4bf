//! Deferred delivery. At most one schedule is pending at a time; the remote
//! service owns the actual dispatch once the schedule is submitted.

use chrono::{DateTime, Utc};

use crate::api::models::{ConversationId, LocalId, User};
use crate::error::{ChatError, Result};
use crate::sync::timeline::{PendingMessage, PendingState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSchedule {
    pub local_id: LocalId,
    pub conversation_id: ConversationId,
    /// Draft text at scheduling time. The send action may replace it.
    pub body: String,
    pub scheduled_for: DateTime<Utc>,
}

impl PendingSchedule {
    /// The timeline placeholder shown until the schedule is submitted.
    pub fn placeholder(&self, sender: &User, now: DateTime<Utc>) -> PendingMessage {
        PendingMessage {
            local_id: self.local_id,
            conversation_id: self.conversation_id.clone(),
            sender: sender.clone(),
            content: self.body.clone(),
            created_at: now,
            scheduled_for: Some(self.scheduled_for),
            state: PendingState::Queued,
        }
    }
}

#[derive(Debug, Default)]
pub struct SchedulerQueue {
    pending: Option<PendingSchedule>,
}

impl SchedulerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> Option<&PendingSchedule> {
        self.pending.as_ref()
    }

    /// Accept a delivery instant strictly after `now`. A rejected request
    /// leaves the queue untouched. On success the displaced schedule, if any,
    /// is returned so its placeholder can be removed.
    pub fn schedule(
        &mut self,
        conversation_id: ConversationId,
        body: impl Into<String>,
        when: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(PendingSchedule, Option<PendingSchedule>)> {
        if when <= now {
            return Err(ChatError::ScheduleInPast {
                requested: when,
                now,
            });
        }
        let schedule = PendingSchedule {
            local_id: LocalId::new(),
            conversation_id,
            body: body.into(),
            scheduled_for: when,
        };
        let displaced = self.pending.replace(schedule.clone());
        if let Some(old) = &displaced {
            log::debug!("schedule {} replaced by {}", old.local_id, schedule.local_id);
        }
        Ok((schedule, displaced))
    }

    /// Consume the pending schedule for submission. `body` overrides the
    /// stored draft unless blank; a blank result leaves the schedule in place.
    pub fn materialize(&mut self, body: &str) -> Result<Option<PendingSchedule>> {
        let Some(pending) = self.pending.as_ref() else {
            return Ok(None);
        };
        if body.trim().is_empty() && pending.body.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let mut schedule = self.pending.take();
        if let Some(schedule) = schedule.as_mut() {
            if !body.trim().is_empty() {
                schedule.body = body.to_string();
            }
        }
        Ok(schedule)
    }

    pub fn cancel(&mut self) -> Option<PendingSchedule> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn past_or_present_instant_is_rejected() {
        let mut queue = SchedulerQueue::new();
        let now = Utc::now();
        for when in [now, now - Duration::minutes(5)] {
            let err = queue.schedule("c1".into(), "hi", when, now).unwrap_err();
            assert!(matches!(err, ChatError::ScheduleInPast { .. }));
        }
        assert!(queue.pending().is_none());
    }

    #[test]
    fn materialize_consumes_once() {
        let mut queue = SchedulerQueue::new();
        let now = Utc::now();
        let when = now + Duration::hours(1);
        let (schedule, displaced) = queue.schedule("c1".into(), "draft", when, now).unwrap();
        assert!(displaced.is_none());

        let taken = queue.materialize("final text").unwrap().unwrap();
        assert_eq!(taken.local_id, schedule.local_id);
        assert_eq!(taken.body, "final text");
        assert_eq!(taken.scheduled_for, when);
        assert!(queue.materialize("again").unwrap().is_none());
    }

    #[test]
    fn blank_body_keeps_draft() {
        let mut queue = SchedulerQueue::new();
        let now = Utc::now();
        queue
            .schedule("c1".into(), "draft", now + Duration::minutes(1), now)
            .unwrap();
        assert_eq!(queue.materialize("  ").unwrap().unwrap().body, "draft");
    }

    #[test]
    fn blank_draft_and_body_is_an_error() {
        let mut queue = SchedulerQueue::new();
        let now = Utc::now();
        queue
            .schedule("c1".into(), "", now + Duration::minutes(1), now)
            .unwrap();
        assert!(matches!(queue.materialize(""), Err(ChatError::EmptyMessage)));
        assert!(queue.pending().is_some());
    }

    #[test]
    fn rescheduling_returns_displaced() {
        let mut queue = SchedulerQueue::new();
        let now = Utc::now();
        let (first, _) = queue
            .schedule("c1".into(), "a", now + Duration::minutes(1), now)
            .unwrap();
        let (second, displaced) = queue
            .schedule("c1".into(), "b", now + Duration::minutes(2), now)
            .unwrap();
        assert_eq!(displaced.map(|s| s.local_id), Some(first.local_id));
        assert_eq!(queue.cancel().map(|s| s.local_id), Some(second.local_id));
        assert!(queue.pending().is_none());
    }

    #[test]
    fn placeholder_is_queued_and_scheduled() {
        let mut queue = SchedulerQueue::new();
        let now = Utc::now();
        let (schedule, _) = queue
            .schedule("c1".into(), "later", now + Duration::days(1), now)
            .unwrap();
        let placeholder = schedule.placeholder(&crate::sync::testing::user("u1"), now);
        assert_eq!(placeholder.state, PendingState::Queued);
        assert!(placeholder.is_scheduled());
        assert_eq!(placeholder.local_id, schedule.local_id);
    }
}
