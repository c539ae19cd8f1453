use std::collections::HashSet;

use kubedoor::model::{ControlRecord, FIXED_VALUE};
use kubedoor::scheduler::Scheduler;

// ══════════════════════════════════════════════════════════════════
// C4 scheduler integration tests (no cluster required)
//
// Exercises the coordinator-side half of the rebalance pipeline:
// governed workloads on a source node → candidate selection sorted by
// the requested resource → excluding anything already pinned to the
// target via its `{namespace}.{deployment} = FIXED_VALUE` node label.
// The cluster-mutating half (`labeled_scale`/`rebalance_node`) needs a
// live `kube::Client` and is exercised by the admission/agent tests
// instead.
// ══════════════════════════════════════════════════════════════════

fn label_key(namespace: &str, deployment: &str) -> String {
    format!("{namespace}.{deployment}")
}

fn record(namespace: &str, deployment: &str, cpu: i64, mem: i64) -> ControlRecord {
    ControlRecord {
        env: "c1".into(),
        namespace: namespace.into(),
        deployment: deployment.into(),
        pod_count: 2,
        pod_count_ai: -1,
        pod_count_manual: -1,
        request_cpu_m: cpu,
        request_mem_mb: mem,
        limit_cpu_m: cpu * 2,
        limit_mem_mb: mem * 2,
        scheduler: true,
        updated_at: 0,
    }
}

#[test]
fn balance_node_picks_the_heaviest_cpu_workloads_not_already_pinned_to_the_target() {
    let records = vec![
        record("ns1", "api", 800, 512),
        record("ns1", "worker", 1600, 1024),
        record("ns1", "cache", 400, 2048),
    ];

    // "cache" is already labeled onto the target node per a live node
    // label read, so it must never be offered as a rebalance candidate
    // even though it would otherwise win on memory.
    let mut target_labels = HashSet::new();
    target_labels.insert(label_key("ns1", "cache"));

    let top = Scheduler::select_rebalance_candidates(&records, true, &target_labels, 2);
    let names: Vec<&str> = top.iter().map(|r| r.deployment.as_str()).collect();
    assert_eq!(names, vec!["worker", "api"]);
}

#[test]
fn balance_node_falls_back_to_memory_ranking_when_by_cpu_is_false() {
    let records = vec![record("ns1", "api", 800, 512), record("ns1", "cache", 400, 2048)];
    let top = Scheduler::select_rebalance_candidates(&records, false, &HashSet::new(), 5);
    assert_eq!(top[0].deployment, "cache");
    assert_eq!(top[1].deployment, "api");
}

#[test]
fn an_empty_source_node_produces_no_rebalance_candidates() {
    let records: Vec<ControlRecord> = Vec::new();
    let top = Scheduler::select_rebalance_candidates(&records, true, &HashSet::new(), 5);
    assert!(top.is_empty());
}

#[test]
fn top_n_truncates_even_when_every_candidate_is_eligible() {
    let records = vec![
        record("ns1", "a", 100, 100),
        record("ns1", "b", 200, 100),
        record("ns1", "c", 300, 100),
    ];
    let top = Scheduler::select_rebalance_candidates(&records, true, &HashSet::new(), 1);
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].deployment, "c");
}

#[test]
fn the_fixed_value_sentinel_is_what_a_real_node_label_read_would_compare_against() {
    // Guards the scheduler's label-key scheme staying in sync with the
    // sentinel the admission engine also checks for.
    assert_eq!(FIXED_VALUE, "true");
}
