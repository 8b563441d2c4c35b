use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::{
    config::Config,
    models::{
        BreachType, Escalation, EscalationKey, Priority, SlaInput, SlaResult, Thread, ThreadStatus,
    },
};

/// Response-time budgets per priority tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaBudgets {
    pub urgent: Duration,
    pub high: Duration,
    pub medium: Duration,
    pub low: Duration,
}

impl Default for SlaBudgets {
    fn default() -> Self {
        Self {
            urgent: Duration::minutes(15),
            high: Duration::minutes(60),
            medium: Duration::minutes(240),
            low: Duration::minutes(1440),
        }
    }
}

impl SlaBudgets {
    pub fn from_config(config: &Config) -> Self {
        Self {
            urgent: Duration::minutes(config.sla_budget_minutes(Priority::Urgent)),
            high: Duration::minutes(config.sla_budget_minutes(Priority::High)),
            medium: Duration::minutes(config.sla_budget_minutes(Priority::Medium)),
            low: Duration::minutes(config.sla_budget_minutes(Priority::Low)),
        }
    }

    pub fn budget(&self, priority: Priority) -> Duration {
        match priority {
            Priority::Urgent => self.urgent,
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }
}

/// SLA engine: deadlines, first-response tracking and breach detection
#[derive(Debug, Clone, Default)]
pub struct SlaService {
    budgets: SlaBudgets,
}

impl SlaService {
    pub fn new(budgets: SlaBudgets) -> Self {
        Self { budgets }
    }

    /// Compute the next response deadline and whether it is breached.
    ///
    /// Only `open` threads with an unanswered customer message are tracked.
    pub fn compute_sla(&self, input: &SlaInput) -> SlaResult {
        if input.ticket_status != ThreadStatus::Open {
            return SlaResult::not_tracked();
        }

        let Some(last_customer) = input.last_customer_message_at else {
            return SlaResult::not_tracked();
        };

        if input
            .last_agent_reply_at
            .is_some_and(|reply| reply >= last_customer)
        {
            return SlaResult::not_tracked();
        }

        let due_at = last_customer + self.budgets.budget(input.priority);
        let breached = input.now > due_at;
        let breach_type = if input.last_agent_reply_at.is_none() {
            BreachType::FirstResponse
        } else {
            BreachType::NextResponse
        };

        SlaResult {
            next_response_due_at: Some(due_at),
            breached,
            breach_type: breached.then_some(breach_type),
        }
    }

    pub fn compute_for_thread(&self, thread: &Thread, now: DateTime<Utc>) -> SlaResult {
        self.compute_sla(&sla_input(thread, now))
    }

    /// Escalations for every breached thread, deduplicated by key
    pub fn detect_breaches(&self, threads: &[Thread], now: DateTime<Utc>) -> Vec<Escalation> {
        let mut seen: HashSet<EscalationKey> = HashSet::new();
        let mut escalations = Vec::new();

        for thread in threads {
            let result = self.compute_for_thread(thread, now);
            let (Some(due_at), Some(breach_type)) = (result.next_response_due_at, result.breach_type)
            else {
                continue;
            };

            let escalation = Escalation {
                id: Uuid::new_v4(),
                workspace_id: thread.workspace_id,
                thread_id: thread.id,
                breach_type,
                due_at,
                detected_at: now,
            };

            if seen.insert(escalation.key()) {
                escalations.push(escalation);
            }
        }

        escalations
    }
}

pub fn sla_input(thread: &Thread, now: DateTime<Utc>) -> SlaInput {
    SlaInput {
        priority: thread.priority,
        ticket_status: thread.status,
        last_customer_message_at: thread.last_customer_message_at,
        last_agent_reply_at: thread.last_agent_reply_at,
        now,
    }
}

/// True iff `first_response_at` is unset and a customer message exists.
/// Guards the monotonic invariant on `Thread::first_response_at`.
pub fn should_set_first_response_at(thread: &Thread) -> bool {
    thread.first_response_at.is_none() && thread.last_customer_message_at.is_some()
}

/// Idempotent: once `current` is set it is returned unchanged, never
/// advanced or rewound.
pub fn compute_first_response_at(
    current: Option<DateTime<Utc>>,
    candidate: DateTime<Utc>,
) -> DateTime<Utc> {
    current.unwrap_or(candidate)
}

pub fn escalation_key(conversation_id: Uuid, breach_type: BreachType, due_at: DateTime<Utc>) -> EscalationKey {
    EscalationKey {
        conversation_id,
        breach_type,
        due_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Channel;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn input(priority: Priority, last_customer: Option<DateTime<Utc>>, now: DateTime<Utc>) -> SlaInput {
        SlaInput {
            priority,
            ticket_status: ThreadStatus::Open,
            last_customer_message_at: last_customer,
            last_agent_reply_at: None,
            now,
        }
    }

    fn thread_with(last_customer: Option<DateTime<Utc>>) -> Thread {
        let mut thread = Thread::new(Uuid::new_v4(), Channel::Whatsapp, "1555", "phone");
        thread.last_customer_message_at = last_customer;
        thread
    }

    #[test]
    fn test_due_at_is_last_message_plus_budget() {
        let sla = SlaService::default();
        let result = sla.compute_sla(&input(Priority::High, Some(t(0)), t(10)));
        assert_eq!(result.next_response_due_at, Some(t(60)));
        assert!(!result.breached);
        assert_eq!(result.breach_type, None);
    }

    #[test]
    fn test_urgent_budget_is_shorter_than_low() {
        let sla = SlaService::default();
        let urgent = sla.compute_sla(&input(Priority::Urgent, Some(t(0)), t(0)));
        let low = sla.compute_sla(&input(Priority::Low, Some(t(0)), t(0)));
        assert!(urgent.next_response_due_at < low.next_response_due_at);
    }

    #[test]
    fn test_breach_type_first_vs_next_response() {
        let sla = SlaService::default();
        let first = sla.compute_sla(&input(Priority::Urgent, Some(t(0)), t(30)));
        assert!(first.breached);
        assert_eq!(first.breach_type, Some(BreachType::FirstResponse));

        let mut next = input(Priority::Urgent, Some(t(10)), t(40));
        next.last_agent_reply_at = Some(t(5));
        let next = sla.compute_sla(&next);
        assert!(next.breached);
        assert_eq!(next.breach_type, Some(BreachType::NextResponse));
    }

    #[test]
    fn test_answered_or_closed_threads_are_not_tracked() {
        let sla = SlaService::default();
        let mut answered = input(Priority::Urgent, Some(t(0)), t(100));
        answered.last_agent_reply_at = Some(t(1));
        assert_eq!(sla.compute_sla(&answered), SlaResult::not_tracked());

        let mut solved = input(Priority::Urgent, Some(t(0)), t(100));
        solved.ticket_status = ThreadStatus::Solved;
        assert_eq!(sla.compute_sla(&solved), SlaResult::not_tracked());

        assert_eq!(
            sla.compute_sla(&input(Priority::Urgent, None, t(100))),
            SlaResult::not_tracked()
        );
    }

    #[test]
    fn test_should_set_first_response_at() {
        assert!(!should_set_first_response_at(&thread_with(None)));
        assert!(should_set_first_response_at(&thread_with(Some(t(0)))));

        let mut already = thread_with(Some(t(0)));
        already.first_response_at = Some(t(0));
        assert!(!should_set_first_response_at(&already));
    }

    #[test]
    fn test_compute_first_response_at_is_idempotent() {
        let first = compute_first_response_at(None, t(3));
        let second = compute_first_response_at(Some(first), t(9));
        let third = compute_first_response_at(Some(second), t(-9));
        assert_eq!(first, t(3));
        assert_eq!(second, first);
        assert_eq!(third, first);
    }

    #[test]
    fn test_escalation_key_set_dedups_repeated_runs() {
        let sla = SlaService::default();
        let mut thread = thread_with(Some(t(0)));
        thread.priority = Priority::Urgent;

        let mut keys = HashSet::new();
        for _ in 0..2 {
            for escalation in sla.detect_breaches(std::slice::from_ref(&thread), t(45)) {
                keys.insert(escalation.key());
            }
        }
        assert_eq!(keys.len(), 1);
        assert!(keys.contains(&escalation_key(thread.id, BreachType::FirstResponse, t(15))));
    }

    #[test]
    fn test_detect_breaches_ignores_duplicated_threads_in_one_run() {
        let sla = SlaService::default();
        let mut thread = thread_with(Some(t(0)));
        thread.priority = Priority::Urgent;
        let escalations = sla.detect_breaches(&[thread.clone(), thread], t(45));
        assert_eq!(escalations.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_first_response_never_moves_once_set(a in -10_000i64..10_000, b in -10_000i64..10_000) {
            let first = compute_first_response_at(None, t(a));
            prop_assert_eq!(compute_first_response_at(Some(first), t(b)), first);
            prop_assert_eq!(compute_first_response_at(Some(first), first), first);
        }
    }
}
