//! Answers, delegation, and the single-completion guarantee.

use warden::broker::{Answer, Broker, BrokerError, ChannelId, Filter, InstanceState};
use warden::wire::{self, Verdict};

use crate::support::{ask, verdict, Completions, Recorder, Seen};

const UID: u32 = 100;
const RULE: u32 = 7;

fn two_sessions(broker: &mut Broker) -> [(warden::broker::SessionId, ChannelId); 2] {
    let a = ChannelId(1);
    let b = ChannelId(2);
    let s1 = broker.open_session(UID, a);
    let s2 = broker.open_session(UID, b);
    for s in [s1, s2] {
        broker
            .register(s, Filter::new(UID, RULE, 0))
            .expect("own uid registration");
    }
    [(s1, a), (s2, b)]
}

#[test]
fn first_answer_wins_and_late_answers_are_duplicates() {
    let mut broker = Broker::default();
    let mut tx = Recorder::default();
    let done = Completions::default();
    let [(s1, a), (s2, b)] = two_sessions(&mut broker);

    let head = broker
        .create_head(ask(5, UID, RULE, 3), Some(done.callback()))
        .expect("head");
    assert_eq!(broker.dispatch_all(&mut tx, head).expect("dispatch"), 2);
    assert_eq!(broker.live_count(head), Some(2));

    let first = broker
        .answer(&mut tx, s1, 5, Verdict::ALLOW, false)
        .expect("first answer");
    assert_eq!(first, Answer::Decided);

    assert_eq!(
        tx.results(a),
        vec![Seen {
            token: 5,
            you: true,
            uid: UID,
            verdict: Verdict::ALLOW
        }]
    );
    assert_eq!(
        tx.results(b),
        vec![Seen {
            token: 5,
            you: false,
            uid: UID,
            verdict: Verdict::ALLOW
        }]
    );

    let late = broker
        .answer(&mut tx, s2, 5, verdict(5), false)
        .expect("late answer");
    assert_eq!(late, Answer::Duplicate);

    assert_eq!(done.outcomes(), vec![(Verdict::ALLOW, Some(UID), 2)]);
    assert_eq!(broker.head_count(), 0);
    assert_eq!(broker.instance_count(), 0);
    assert_eq!(tx.results(b).len(), 1);
}

#[test]
fn delegated_verdict_can_be_overruled() {
    let mut broker = Broker::default();
    let mut tx = Recorder::default();
    let done = Completions::default();
    let [(s1, a), (s2, b)] = two_sessions(&mut broker);

    let head = broker
        .create_head(ask(9, UID, RULE, 1), Some(done.callback()))
        .expect("head");
    broker.dispatch_all(&mut tx, head).expect("dispatch");

    let out = broker
        .answer(&mut tx, s1, 9, verdict(3), true)
        .expect("delegate");
    assert_eq!(out, Answer::Delegated);
    assert_eq!(broker.live_count(head), Some(1));
    assert_eq!(broker.recorded_verdict(head), Some(verdict(3)));
    assert_eq!(
        broker.instance_state(s1, 9),
        Some(InstanceState::VerdictGiven)
    );
    assert!(tx.results(a).is_empty());

    let out = broker
        .answer(&mut tx, s2, 9, verdict(4), false)
        .expect("final answer");
    assert_eq!(out, Answer::Decided);
    assert!(tx.results(b)[0].you);
    assert_eq!(tx.results(a)[0].verdict, verdict(4));
    assert!(!tx.results(a)[0].you);
    assert_eq!(done.len(), 1);
}

#[test]
fn last_delegation_decides_and_overwrites() {
    let mut broker = Broker::default();
    let mut tx = Recorder::default();
    let done = Completions::default();
    let [(s1, a), (s2, b)] = two_sessions(&mut broker);

    let head = broker
        .create_head(ask(11, UID, RULE, 1), Some(done.callback()))
        .expect("head");
    broker.dispatch_all(&mut tx, head).expect("dispatch");

    assert_eq!(
        broker
            .answer(&mut tx, s1, 11, verdict(2), true)
            .expect("delegate"),
        Answer::Delegated
    );
    assert_eq!(
        broker
            .answer(&mut tx, s2, 11, verdict(6), true)
            .expect("delegate"),
        Answer::Decided
    );

    assert_eq!(done.outcomes(), vec![(verdict(6), Some(UID), 2)]);
    assert!(!tx.results(a)[0].you);
    assert!(tx.results(b)[0].you);
}

#[test]
fn redelegating_replaces_the_tentative_verdict() {
    let mut broker = Broker::default();
    let mut tx = Recorder::default();
    let done = Completions::default();
    let [(s1, a), (s2, b)] = two_sessions(&mut broker);

    let head = broker
        .create_head(ask(12, UID, RULE, 1), Some(done.callback()))
        .expect("head");
    broker.dispatch_all(&mut tx, head).expect("dispatch");
    assert_eq!(
        broker
            .answer(&mut tx, s1, 12, verdict(3), true)
            .expect("delegate"),
        Answer::Delegated
    );
    assert_eq!(
        broker
            .answer(&mut tx, s1, 12, verdict(8), true)
            .expect("delegate again"),
        Answer::Delegated
    );
    assert_eq!(broker.recorded_verdict(head), Some(verdict(8)));
    assert_eq!(broker.live_count(head), Some(1));
    assert_eq!(broker.instance_state(s1, 12), Some(InstanceState::VerdictGiven));
    assert_eq!(done.len(), 0);

    // The other session still holds the last live instance.
    assert_eq!(
        broker
            .answer(&mut tx, s2, 12, verdict(8), true)
            .expect("last delegate"),
        Answer::Decided
    );
    assert_eq!(done.outcomes(), vec![(verdict(8), Some(UID), 2)]);
    assert_eq!(tx.results(a).len(), 1);
    assert_eq!(tx.results(b).len(), 1);
}

#[test]
fn delegating_session_can_settle_its_own_verdict() {
    let mut broker = Broker::default();
    let mut tx = Recorder::default();
    let done = Completions::default();
    let [(s1, a), (_, b)] = two_sessions(&mut broker);

    let head = broker
        .create_head(ask(13, UID, RULE, 1), Some(done.callback()))
        .expect("head");
    broker.dispatch_all(&mut tx, head).expect("dispatch");
    broker
        .answer(&mut tx, s1, 13, verdict(1), true)
        .expect("delegate");

    assert_eq!(
        broker
            .answer(&mut tx, s1, 13, Verdict::ALLOW, false)
            .expect("final answer"),
        Answer::Decided
    );
    assert_eq!(done.outcomes(), vec![(Verdict::ALLOW, Some(UID), 2)]);
    assert!(tx.results(a)[0].you);
    assert!(!tx.results(b)[0].you);
    assert_eq!(broker.instance_count(), 0);

    // Anything further from either side is a late echo.
    assert_eq!(
        broker
            .answer(&mut tx, s1, 13, verdict(0), false)
            .expect("late"),
        Answer::Duplicate
    );
}

#[test]
fn unknown_token_is_an_error() {
    let mut broker = Broker::default();
    let mut tx = Recorder::default();
    let [(s1, _), _] = two_sessions(&mut broker);

    let err = broker
        .answer(&mut tx, s1, 404, Verdict::ALLOW, false)
        .expect_err("unknown token");
    assert!(matches!(err, BrokerError::UnknownToken(404)));
    assert_eq!(err.errno(), -wire::ENOENT);
    assert!(tx.sent.is_empty());
}

#[test]
fn k_instances_yield_one_completion() {
    const K: u32 = 5;
    let mut broker = Broker::default();
    let mut tx = Recorder::default();
    let done = Completions::default();

    let sessions: Vec<_> = (1..=K)
        .map(|n| {
            let s = broker.open_session(0, ChannelId(u64::from(n)));
            broker.register(s, Filter::default()).expect("wildcard");
            s
        })
        .collect();

    let head = broker
        .create_head(ask(77, 1000, 3, 2), Some(done.callback()))
        .expect("head");
    assert_eq!(broker.dispatch_all(&mut tx, head).expect("dispatch"), 5);
    assert_eq!(broker.instance_count(), 5);

    let outcomes: Vec<Answer> = sessions
        .iter()
        .map(|s| {
            broker
                .answer(&mut tx, *s, 77, verdict(2), false)
                .expect("answer")
        })
        .collect();

    assert_eq!(outcomes[0], Answer::Decided);
    assert!(outcomes[1..].iter().all(|o| *o == Answer::Duplicate));
    assert_eq!(done.outcomes(), vec![(verdict(2), Some(0), 5)]);
    assert_eq!(broker.instance_count(), 0);

    let you: usize = (1..=K)
        .map(|n| {
            tx.results(ChannelId(u64::from(n)))
                .iter()
                .filter(|r| r.you)
                .count()
        })
        .sum();
    assert_eq!(you, 1);
}

#[test]
fn settled_token_can_be_reused_for_a_new_event() {
    let mut broker = Broker::default();
    let mut tx = Recorder::default();
    let [(s1, _), (s2, _)] = two_sessions(&mut broker);

    let first = broker.create_head(ask(3, UID, RULE, 1), None).expect("head");
    broker.dispatch_all(&mut tx, first).expect("dispatch");
    broker
        .answer(&mut tx, s1, 3, Verdict::ALLOW, false)
        .expect("decide");
    assert_eq!(broker.instance_state(s2, 3), None);

    let second = broker.create_head(ask(3, UID, RULE, 1), None).expect("head");
    broker.dispatch_all(&mut tx, second).expect("dispatch");
    assert_eq!(broker.instance_state(s2, 3), Some(InstanceState::Pending));
    assert_eq!(
        broker
            .answer(&mut tx, s2, 3, verdict(8), false)
            .expect("fresh answer"),
        Answer::Decided
    );
}
