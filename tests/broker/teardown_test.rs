//! Session teardown resolves what it leaves behind.

use warden::broker::{Answer, Broker, BrokerError, ChannelId, Filter};
use warden::wire::{self, Verdict};

use crate::support::{ask, verdict, Completions, Recorder};

#[test]
fn last_session_leaving_resolves_with_no_decision() {
    let mut broker = Broker::default();
    let mut tx = Recorder::default();
    let done = Completions::default();
    let s = broker.open_session(0, ChannelId(1));
    broker.register(s, Filter::default()).expect("wildcard");

    let head = broker
        .create_head(ask(1, 1, 1, 1), Some(done.callback()))
        .expect("head");
    broker.dispatch_all(&mut tx, head).expect("dispatch");

    let report = broker.teardown(&mut tx, s).expect("teardown");
    assert_eq!(report.registrations, 1);
    assert_eq!(report.drained, 1);
    assert_eq!(report.resolved, 1);

    assert_eq!(done.outcomes(), vec![(Verdict::NO_DECISION, None, 0)]);
    assert_eq!(broker.head_count(), 0);
    assert_eq!(broker.instance_count(), 0);
    assert_eq!(broker.session_count(), 0);
}

#[test]
fn remaining_session_still_decides() {
    let mut broker = Broker::default();
    let mut tx = Recorder::default();
    let done = Completions::default();
    let leaving = broker.open_session(0, ChannelId(1));
    let staying = broker.open_session(0, ChannelId(2));
    for s in [leaving, staying] {
        broker.register(s, Filter::default()).expect("wildcard");
    }

    let head = broker
        .create_head(ask(2, 1, 1, 1), Some(done.callback()))
        .expect("head");
    broker.dispatch_all(&mut tx, head).expect("dispatch");

    let report = broker.teardown(&mut tx, leaving).expect("teardown");
    assert_eq!(report.resolved, 0);
    assert_eq!(broker.live_count(head), Some(1));
    assert_eq!(broker.recorded_verdict(head), None);
    assert_eq!(done.len(), 0);

    broker
        .answer(&mut tx, staying, 2, verdict(4), false)
        .expect("answer");
    assert_eq!(done.outcomes(), vec![(verdict(4), Some(0), 1)]);
}

#[test]
fn delegated_verdict_survives_the_last_teardown() {
    let mut broker = Broker::default();
    let mut tx = Recorder::default();
    let done = Completions::default();
    let a = broker.open_session(0, ChannelId(1));
    let b = broker.open_session(0, ChannelId(2));
    for s in [a, b] {
        broker.register(s, Filter::default()).expect("wildcard");
    }

    let head = broker
        .create_head(ask(3, 1, 1, 1), Some(done.callback()))
        .expect("head");
    broker.dispatch_all(&mut tx, head).expect("dispatch");
    assert_eq!(
        broker
            .answer(&mut tx, a, 3, verdict(9), true)
            .expect("delegate"),
        Answer::Delegated
    );

    let report = broker.teardown(&mut tx, b).expect("teardown");
    assert_eq!(report.resolved, 1);
    assert_eq!(done.outcomes(), vec![(verdict(9), Some(0), 1)]);

    // The delegating session still learns the outcome.
    let seen = tx.results(ChannelId(1));
    assert_eq!(seen.len(), 1);
    assert!(seen[0].you);
    assert_eq!(seen[0].verdict, verdict(9));
}

#[test]
fn every_pending_instance_is_drained() {
    let mut broker = Broker::default();
    let mut tx = Recorder::default();
    let done = Completions::default();
    let leaving = broker.open_session(0, ChannelId(1));
    let staying = broker.open_session(0, ChannelId(2));
    broker.register(leaving, Filter::default()).expect("wildcard");
    broker
        .register(staying, Filter::new(0, 1, 0))
        .expect("rule 1");

    // Rule 1 heads are shared; the rule 2 head only reaches `leaving`.
    let mut heads = Vec::new();
    for (token, rule) in [(21, 1), (22, 2), (23, 1)] {
        let head = broker
            .create_head(ask(token, 100, rule, 1), Some(done.callback()))
            .expect("head");
        broker.dispatch_all(&mut tx, head).expect("dispatch");
        heads.push(head);
    }
    assert_eq!(broker.instance_count(), 5);

    let report = broker.teardown(&mut tx, leaving).expect("teardown");
    assert_eq!(report.drained, 3);
    assert_eq!(report.resolved, 1);
    assert_eq!(done.outcomes(), vec![(Verdict::NO_DECISION, None, 0)]);
    assert_eq!(broker.instance_count(), 2);
    assert_eq!(broker.head_count(), 2);
    assert_eq!(broker.live_count(heads[0]), Some(1));
    assert_eq!(broker.live_count(heads[1]), None);
    assert_eq!(broker.live_count(heads[2]), Some(1));

    broker
        .answer(&mut tx, staying, 21, Verdict::ALLOW, false)
        .expect("answer");
    broker
        .answer(&mut tx, staying, 23, verdict(5), false)
        .expect("answer");
    assert_eq!(
        done.outcomes(),
        vec![
            (Verdict::NO_DECISION, None, 0),
            (Verdict::ALLOW, Some(0), 1),
            (verdict(5), Some(0), 1),
        ]
    );
    assert_eq!(broker.instance_count(), 0);
    assert_eq!(broker.head_count(), 0);
}

#[test]
fn teardown_twice_is_an_error_without_side_effects() {
    let mut broker = Broker::default();
    let mut tx = Recorder::default();
    let s = broker.open_session(0, ChannelId(1));
    broker.teardown(&mut tx, s).expect("first teardown");

    let err = broker.teardown(&mut tx, s).expect_err("second teardown");
    assert!(matches!(err, BrokerError::UnknownSession(_)));
    assert_eq!(err.errno(), -wire::ENOENT);
    assert!(tx.sent.is_empty());
}

#[test]
fn lost_session_is_reaped_by_teardown() {
    let mut broker = Broker::default();
    let mut tx = Recorder::default();
    let done = Completions::default();
    let decider = broker.open_session(0, ChannelId(1));
    let gone = broker.open_session(0, ChannelId(2));
    for s in [decider, gone] {
        broker.register(s, Filter::default()).expect("wildcard");
    }

    let head = broker
        .create_head(ask(4, 1, 1, 1), Some(done.callback()))
        .expect("head");
    broker.dispatch_all(&mut tx, head).expect("dispatch");

    // The peer vanishes before the result goes out.
    tx.closed.insert(ChannelId(2));
    broker
        .answer(&mut tx, decider, 4, Verdict::ALLOW, false)
        .expect("answer");
    assert_eq!(done.outcomes(), vec![(Verdict::ALLOW, Some(0), 1)]);

    let lost = broker.take_lost_sessions();
    assert_eq!(lost, vec![gone]);
    for s in lost {
        let report = broker.teardown(&mut tx, s).expect("reap");
        assert_eq!(report.drained, 0);
    }
    assert!(broker.take_lost_sessions().is_empty());
    assert_eq!(broker.session_count(), 1);
}
