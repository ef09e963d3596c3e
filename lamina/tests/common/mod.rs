//! Shared harness for the integration tests: simulation builders, outcome
//! awaiting, and the log-replay checks the external consistency checker
//! would run.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_broadcast::Receiver;
use itertools::Itertools;
use lamina::{SimHandle, Topology};
use lamina_types::{
    Direction, Event, Hops, Key, NodeId, OpResult, Options, QueryId, RequestKind, SeqNo,
    SnapshotRecord, Value,
};
use tokio::time::timeout;

/// Long enough that only a genuine hang trips it; with the paused clock it
/// costs nothing.
const WAIT: Duration = Duration::from_secs(120);

/// Two L1s, two L2s per L1, two clients per L2.
pub fn default_topology() -> Topology {
    Topology {
        l1_count: 2,
        l2_per_l1: 2,
        clients_per_l2: 2,
    }
}

/// The database everyone starts from: `{1: 10, 2: 20, ..., 8: 80}`.
pub fn default_store() -> BTreeMap<Key, Value> {
    (1..=8).map(|k| (k, k * 10)).collect()
}

pub fn sim() -> SimHandle {
    sim_with(|_| {})
}

pub fn sim_with(tweak: impl FnOnce(&mut Options)) -> SimHandle {
    lamina_utils::test_utils::setup_test();
    let mut opt = Options::default();
    tweak(&mut opt);
    SimHandle::spawn(default_topology(), opt, default_store()).expect("topology is valid")
}

/// Wait for the next terminal outcome reported by `client`.
pub async fn outcome_for(rx: &mut Receiver<Event>, client: NodeId) -> (QueryId, OpResult) {
    timeout(WAIT, async {
        loop {
            match rx.recv().await.expect("event stream ended") {
                Event::ClientOutcome {
                    client: c,
                    qid,
                    result,
                    ..
                } if c == client => return (qid, result),
                _ => {},
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no outcome from {client}"))
}

/// Wait for the first event matching `pred`, discarding everything else.
pub async fn await_event(rx: &mut Receiver<Event>, pred: impl Fn(&Event) -> bool) -> Event {
    timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event never arrived")
}

/// Collect the next `n` client outcomes, in whatever order they land.
pub async fn collect_outcomes(
    rx: &mut Receiver<Event>,
    n: usize,
) -> Vec<(NodeId, QueryId, OpResult)> {
    timeout(WAIT, async {
        let mut outcomes = Vec::new();
        while outcomes.len() < n {
            if let Event::ClientOutcome {
                client,
                qid,
                result,
                ..
            } = rx.recv().await.expect("event stream ended")
            {
                outcomes.push((client, qid, result));
            }
        }
        outcomes
    })
    .await
    .expect("not enough client outcomes arrived")
}

/// Collect snapshot records until every participant of the round reported.
pub async fn collect_snapshot(
    rx: &mut Receiver<Event>,
    participants: usize,
) -> Vec<SnapshotRecord> {
    timeout(WAIT, async {
        let mut records = Vec::new();
        while records.len() < participants {
            if let Event::Snapshot(record) = rx.recv().await.expect("event stream ended") {
                records.push(record);
            }
        }
        records
    })
    .await
    .expect("snapshot round never completed")
}

/// Probe every node and assert all protocol maps have drained.
pub async fn assert_quiescent(handle: &SimHandle, rx: &mut Receiver<Event>) {
    handle.probe_all();
    let mut seen = HashSet::new();
    let total = handle.topology.all_nodes().len();
    timeout(WAIT, async {
        while seen.len() < total {
            if let Event::Quiescence {
                node,
                pending,
                locked,
                sessions,
                timers,
            } = rx.recv().await.expect("event stream ended")
            {
                assert_eq!(
                    (pending, locked, sessions, timers),
                    (0, 0, 0, 0),
                    "{node} is not quiescent",
                );
                seen.insert(node);
            }
        }
    })
    .await
    .expect("not every node answered the probe");
}

/// P1: for each (client, key), successful outcomes observe nondecreasing
/// sequence numbers — and no node ever reported a violation outright.
pub fn check_monotonic_reads(records: &[Event]) {
    assert!(
        !records
            .iter()
            .any(|e| matches!(e, Event::MonotonicViolation { .. })),
        "a client reported a monotonic-read violation",
    );
    let mut last: HashMap<(NodeId, Key), SeqNo> = HashMap::new();
    for event in records {
        if let Event::ClientOutcome {
            client,
            key,
            result: Ok(success),
            ..
        } = event
        {
            let prior = last.entry((*client, *key)).or_insert(0);
            assert!(
                success.seqno >= *prior,
                "{client} observed seqno {} after {} for key {key}",
                success.seqno,
                prior,
            );
            *prior = success.seqno;
        }
    }
}

/// P5: the sequence numbers the database stamps on successful writes — the
/// plain-write response fan-outs and the critical-write commit fan-outs — are
/// strictly increasing per key. Failure responses carry no key and
/// lock/abort messages carry no seqno, so requiring both filters them out.
pub fn check_db_seqnos_strictly_increase(records: &[Event]) {
    let mut per_key: HashMap<Key, Vec<SeqNo>> = HashMap::new();
    for event in records {
        if let Event::Data(data) = event {
            if data.actor == NodeId::database()
                && data.direction == Direction::Sent
                && data.kind.is_write()
            {
                if let (Some(key), Some(seqno)) = (data.key, data.seqno) {
                    per_key.entry(key).or_default().push(seqno);
                }
            }
        }
    }
    for (key, seqnos) in per_key {
        // The fan-out emits one copy per L1; collapse those before checking.
        let distinct: Vec<_> = seqnos.iter().copied().dedup().collect();
        assert!(
            distinct.windows(2).all(|w| w[0] < w[1]),
            "seqnos for key {key} are not strictly increasing: {distinct:?}",
        );
    }
}

/// P6: the hop records of a query id form one nested chain. The longest
/// route logged for a qid is the request's full climb toward the database;
/// every other logged route — each forwarding step, the walked-back
/// responses, the critical-write outcome — must be a prefix of it.
pub fn check_hop_consistency(records: &[Event]) {
    let mut routes: HashMap<QueryId, Hops> = HashMap::new();
    for event in records {
        if let Event::Data(data) = event {
            let longest = routes
                .entry(data.qid)
                .or_insert_with(|| data.hops.clone());
            if data.hops.len() > longest.len() {
                *longest = data.hops.clone();
            }
        }
    }
    for event in records {
        if let Event::Data(data) = event {
            let route = &routes[&data.qid];
            assert!(
                data.hops.is_prefix_of(route),
                "{} {:?} hops {:?} diverge from the request route {:?}",
                data.qid,
                data.kind,
                data.hops,
                route,
            );
        }
    }
}

/// P8: between crashing and recovering, a node sends nothing.
pub fn check_silent_while_crashed(records: &[Event], node: NodeId) {
    let mut down = false;
    for event in records {
        match event {
            Event::Crashed { node: n } if *n == node => down = true,
            Event::Recovered { node: n } if *n == node => down = false,
            Event::Data(data) if down => {
                assert_ne!(
                    (data.actor, data.direction),
                    (node, Direction::Sent),
                    "{node} sent while crashed: {data:?}",
                );
            },
            _ => {},
        }
    }
}

/// Merge one snapshot round: captured states plus in-transit messages,
/// keeping the highest seqno seen per key.
pub fn merge_snapshot(records: &[SnapshotRecord]) -> BTreeMap<Key, (SeqNo, Value)> {
    let mut merged: BTreeMap<Key, (SeqNo, Value)> = BTreeMap::new();
    let mut consider = |key: Key, seqno: SeqNo, value: Value| {
        let entry = merged.entry(key).or_insert((seqno, value));
        if seqno >= entry.0 {
            *entry = (seqno, value);
        }
    };
    for record in records {
        for (key, value) in &record.store {
            let seqno = record.seqno.get(key).copied().unwrap_or(0);
            consider(*key, seqno, *value);
        }
        for (key, value) in &record.data_in_transit {
            let seqno = record.seqno_in_transit.get(key).copied().unwrap_or(0);
            consider(*key, seqno, *value);
        }
    }
    merged
}

/// Convenience for the tests that drive a single client.
pub async fn perform_and_await(
    handle: &SimHandle,
    rx: &mut Receiver<Event>,
    client: NodeId,
    kind: RequestKind,
    key: Key,
    value: Option<Value>,
) -> OpResult {
    handle.perform(client, kind, key, value);
    outcome_for(rx, client).await.1
}
