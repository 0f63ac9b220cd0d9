#![allow(clippy::unwrap_used, clippy::expect_used, clippy::missing_panics_doc)]

//! Property tests for conversation reconciliation.
//!
//! Random interleavings of optimistic sends, confirmations, failures,
//! pushes, polled pages and older pages must never:
//! 1. leave two entries with the same id;
//! 2. change anything when the same polled page is merged twice;
//! 3. move an outgoing message's status backwards or out of `Failed`.
//!
//! The read watermark must never decrease, whatever order receipts
//! complete in.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use matchsync::chat::MessageStatus;
use matchsync::chat::read::ReadTracker;
use matchsync::chat::reconcile::{Conversation, SendOutcome};
use matchsync_proto::gateway::IncomingMessage;
use matchsync_proto::message::{DeliveryStatus, HistoryMessage, MessageId, UserId};
use proptest::prelude::*;

const ME: UserId = UserId::new(1);
const THEM: UserId = UserId::new(2);
const CONTENTS: [&str; 3] = ["hi", "hey", " hi "];

#[derive(Debug, Clone)]
enum Op {
    Send(usize),
    Confirm { nth: usize, real: i64 },
    Fail(usize),
    Push { id: i64, from_me: bool, content: usize },
    Poll(Vec<Entry>),
    Older(Vec<Entry>),
    Wait(i64),
}

#[derive(Debug, Clone)]
struct Entry {
    id: i64,
    is_sent: bool,
    content: usize,
    status: Option<DeliveryStatus>,
    is_read: bool,
}

fn arb_status() -> impl Strategy<Value = Option<DeliveryStatus>> {
    prop_oneof![
        Just(None),
        Just(Some(DeliveryStatus::Sent)),
        Just(Some(DeliveryStatus::Delivered)),
        Just(Some(DeliveryStatus::Read)),
        Just(Some(DeliveryStatus::Failed)),
        Just(Some(DeliveryStatus::Unknown)),
    ]
}

fn arb_entry() -> impl Strategy<Value = Entry> {
    (1..40i64, any::<bool>(), 0..CONTENTS.len(), arb_status(), any::<bool>()).prop_map(
        |(id, is_sent, content, status, is_read)| Entry {
            id,
            is_sent,
            content,
            status,
            is_read,
        },
    )
}

/// A page with unique ids, as the backend returns them.
fn arb_page() -> impl Strategy<Value = Vec<Entry>> {
    prop::collection::vec(arb_entry(), 0..6).prop_map(|mut entries| {
        let mut seen = HashSet::new();
        entries.retain(|e| seen.insert(e.id));
        entries.sort_by(|a, b| b.id.cmp(&a.id));
        entries
    })
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..CONTENTS.len()).prop_map(Op::Send),
        (0..4usize, 1..40i64).prop_map(|(nth, real)| Op::Confirm { nth, real }),
        (0..4usize).prop_map(Op::Fail),
        (1..40i64, any::<bool>(), 0..CONTENTS.len())
            .prop_map(|(id, from_me, content)| Op::Push { id, from_me, content }),
        arb_page().prop_map(Op::Poll),
        arb_page().prop_map(Op::Older),
        (1..15i64).prop_map(Op::Wait),
    ]
}

fn to_history(page: &[Entry]) -> Vec<HistoryMessage> {
    page.iter()
        .map(|e| HistoryMessage {
            id: MessageId::new(e.id),
            content: CONTENTS[e.content].to_string(),
            is_sent: e.is_sent,
            status: e.status,
            is_read: e.is_read,
            read_at: None,
        })
        .collect()
}

fn base() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// Applies `ops` one by one, calling `check` with the conversation before
/// and after each step.
fn run(ops: &[Op], mut check: impl FnMut(&Conversation, &Conversation)) -> Conversation {
    let mut conv = Conversation::new(ME, THEM, Duration::from_secs(10));
    let mut placeholders = Vec::new();
    let mut now = base();

    for op in ops {
        let before = conv.clone();
        match op {
            Op::Send(content) => placeholders.push(conv.insert_optimistic(CONTENTS[*content], now)),
            Op::Confirm { nth, real } => {
                if let Some(&p) = placeholders.get(*nth) {
                    conv.apply_send_result(p, SendOutcome::Confirmed(MessageId::new(*real)));
                }
            }
            Op::Fail(nth) => {
                if let Some(&p) = placeholders.get(*nth) {
                    conv.apply_send_result(p, SendOutcome::Failed);
                }
            }
            Op::Push {
                id,
                from_me,
                content,
            } => {
                let (sender_id, receiver_id) = if *from_me { (ME, THEM) } else { (THEM, ME) };
                conv.apply_incoming(
                    &IncomingMessage {
                        message_id: MessageId::new(*id),
                        sender_id,
                        receiver_id,
                        content: CONTENTS[*content].to_string(),
                        timestamp: None,
                    },
                    now,
                );
            }
            Op::Poll(page) => {
                conv.merge_snapshot(&to_history(page), now);
            }
            Op::Older(page) => {
                conv.prepend_older(&to_history(page), now);
            }
            Op::Wait(secs) => now += chrono::TimeDelta::seconds(*secs),
        }
        check(&before, &conv);
    }
    conv
}

fn outgoing_statuses(conv: &Conversation) -> HashMap<MessageId, MessageStatus> {
    conv.messages()
        .iter()
        .filter(|m| m.is_outgoing())
        .map(|m| (m.id, m.status))
        .collect()
}

fn status_step_allowed(before: MessageStatus, after: MessageStatus) -> bool {
    before == after || before.can_advance_to(after)
}

proptest! {
    #[test]
    fn ids_stay_unique(ops in prop::collection::vec(arb_op(), 0..40)) {
        let conv = run(&ops, |_, _| {});
        let mut seen = HashSet::new();
        for m in conv.messages() {
            prop_assert!(seen.insert(m.id), "duplicate id {}", m.id);
        }
    }

    #[test]
    fn merging_a_page_twice_is_a_no_op(
        ops in prop::collection::vec(arb_op(), 0..30),
        page in arb_page(),
    ) {
        let mut conv = run(&ops, |_, _| {});
        let page = to_history(&page);
        let now = base() + chrono::TimeDelta::seconds(600);

        conv.merge_snapshot(&page, now);
        let once = conv.messages().to_vec();
        let appended = conv.merge_snapshot(&page, now);

        prop_assert_eq!(appended, 0);
        prop_assert_eq!(conv.messages(), once.as_slice());
    }

    #[test]
    fn outgoing_status_never_moves_backwards(ops in prop::collection::vec(arb_op(), 0..40)) {
        let mut violations = Vec::new();
        run(&ops, |before, after| {
            let after = outgoing_statuses(after);
            for (id, old) in outgoing_statuses(before) {
                if let Some(&new) = after.get(&id) {
                    if !status_step_allowed(old, new) {
                        violations.push((id, old, new));
                    }
                }
            }
        });
        prop_assert!(violations.is_empty(), "backwards steps: {violations:?}");
    }

    #[test]
    fn read_watermark_never_decreases(
        receipts in prop::collection::vec((1..100i64, any::<bool>()), 0..30),
    ) {
        let mut tracker = ReadTracker::new();
        let mut high = None;
        for (id, accepted) in receipts {
            let watermark = MessageId::new(id);
            tracker.complete(watermark, accepted);
            prop_assert!(tracker.watermark() >= high);
            high = tracker.watermark();
        }
    }

    #[test]
    fn read_pass_only_offers_new_watermarks(
        page in arb_page(),
        acknowledged in 0..40i64,
    ) {
        let mut conv = Conversation::new(ME, THEM, Duration::from_secs(10));
        conv.merge_snapshot(&to_history(&page), base());
        let mut tracker = ReadTracker::new();
        tracker.complete(MessageId::new(acknowledged), true);

        if let Some(candidate) = tracker.begin(&conv) {
            prop_assert!(candidate > MessageId::new(acknowledged));
            prop_assert_eq!(Some(candidate), conv.highest_unread_incoming());
        }
    }
}
