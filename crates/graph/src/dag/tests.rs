use cogwheel_core::{NodeType, TaskNode};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::*;

fn node(graph: &mut DependencyGraph) -> TaskId {
    graph
        .add_node(GraphNode::question(PayloadId::from("p"), 1.0))
        .unwrap()
}

fn run(graph: &mut DependencyGraph, id: &TaskId) {
    graph.mark_scheduled(id).unwrap();
    graph.mark_running(id).unwrap();
}

fn complete(graph: &mut DependencyGraph, id: &TaskId) -> Settled {
    run(graph, id);
    graph.mark_complete(id, PayloadId::new(format!("out-{id}"))).unwrap()
}

fn ready_set(graph: &DependencyGraph) -> BTreeSet<TaskId> {
    graph.get_ready_nodes().into_iter().collect()
}

/// Every ready node has settled dependencies and every pending node with
/// settled dependencies is ready.
fn assert_readiness_consistent(graph: &DependencyGraph) {
    for n in graph.nodes() {
        let id = n.id();
        let expected = n.status() == TaskStatus::Pending
            && n.task.dependency_ids.iter().all(|dep| {
                let s = graph.status(dep).unwrap();
                match graph.edge(dep, &id).unwrap().edge_type {
                    EdgeType::BestEffort => s.is_terminal(),
                    _ => s == TaskStatus::CompletedSuccess,
                }
            });
        assert_eq!(graph.is_ready(&id), expected, "readiness of {id}");
    }
}

#[test]
fn rejects_cycle_and_keeps_edges() {
    let mut g = DependencyGraph::default();
    let (a, b, c) = (node(&mut g), node(&mut g), node(&mut g));
    g.add_edge(a, b, EdgeType::Requires, 1.0).unwrap();
    g.add_edge(b, c, EdgeType::Requires, 1.0).unwrap();

    let err = g.add_edge(c, a, EdgeType::Requires, 1.0).unwrap_err();
    assert_eq!(err, GraphError::CycleDetected { from: c, to: a });
    assert_eq!(g.edge_count(), 2);
    assert!(g.edge(&c, &a).is_none());
    assert!(g.get(&a).unwrap().task.dependency_ids.is_empty());
    assert!(g.get(&c).unwrap().task.dependent_ids.is_empty());
    assert_eq!(g.topological_order(), vec![a, b, c]);
}

#[test]
fn self_edge_is_a_cycle() {
    let mut g = DependencyGraph::default();
    let a = node(&mut g);
    assert!(matches!(
        g.add_edge(a, a, EdgeType::BestEffort, 1.0),
        Err(GraphError::CycleDetected { .. })
    ));
}

#[test]
fn diamond_readiness() {
    let mut g = DependencyGraph::default();
    let (a, b, c, d) = (node(&mut g), node(&mut g), node(&mut g), node(&mut g));
    g.add_edge(a, b, EdgeType::Requires, 1.0).unwrap();
    g.add_edge(a, c, EdgeType::Requires, 1.0).unwrap();
    g.add_edge(b, d, EdgeType::Requires, 1.0).unwrap();
    g.add_edge(c, d, EdgeType::Requires, 1.0).unwrap();
    assert_eq!(g.get_ready_nodes(), vec![a]);

    let settled = complete(&mut g, &a);
    assert_eq!(settled.ready.iter().copied().collect::<BTreeSet<_>>(), BTreeSet::from([b, c]));
    assert_eq!(ready_set(&g), BTreeSet::from([b, c]));

    complete(&mut g, &b);
    assert!(!g.is_ready(&d));
    let settled = complete(&mut g, &c);
    assert_eq!(settled.ready, vec![d]);
    assert_eq!(g.get_ready_nodes(), vec![d]);
    assert_readiness_consistent(&g);
}

#[test]
fn unknown_ids_are_rejected() {
    let mut g = DependencyGraph::default();
    let a = node(&mut g);
    let ghost = TaskId::new();
    assert_eq!(
        g.add_edge(a, ghost, EdgeType::Requires, 1.0),
        Err(GraphError::DependencyNotFound(ghost))
    );

    let mut orphan = GraphNode::question(PayloadId::from("p"), 1.0);
    orphan.task.dependency_ids.insert(ghost);
    assert_eq!(g.add_node(orphan), Err(GraphError::DependencyNotFound(ghost)));
    assert_eq!(g.len(), 1);
}

#[test]
fn add_node_wires_listed_dependencies() {
    let mut g = DependencyGraph::default();
    let a = node(&mut g);
    let mut task = TaskNode::new(PayloadId::from("p"), 2.0);
    task.dependency_ids.insert(a);
    let b = g.add_node(GraphNode::new(NodeType::Hypothesis, task)).unwrap();

    assert_eq!(g.edge(&a, &b).unwrap().edge_type, EdgeType::Requires);
    assert!(g.get(&a).unwrap().task.dependent_ids.contains(&b));
    assert!(!g.is_ready(&b));
    complete(&mut g, &a);
    assert!(g.is_ready(&b));
}

#[test]
fn failure_propagates_transitively() {
    let mut g = DependencyGraph::default();
    let (a, b, c, side) = (node(&mut g), node(&mut g), node(&mut g), node(&mut g));
    g.add_edge(a, b, EdgeType::Requires, 1.0).unwrap();
    g.add_edge(b, c, EdgeType::Requires, 1.0).unwrap();
    g.add_edge(a, side, EdgeType::BestEffort, 1.0).unwrap();

    run(&mut g, &a);
    let settled = g.mark_failed(&a, "boom").unwrap();
    assert_eq!(settled.failed, vec![b, c]);
    assert_eq!(settled.ready, vec![side]);
    assert_eq!(g.status(&b), Some(TaskStatus::CompletedFailure));
    assert_eq!(g.status(&c), Some(TaskStatus::CompletedFailure));
    assert_eq!(g.get(&a).unwrap().task.error.as_deref(), Some("boom"));
    assert!(g.get(&c).unwrap().task.error.is_some());
    assert_readiness_consistent(&g);
}

#[test]
fn cancel_fails_required_dependents() {
    let mut g = DependencyGraph::default();
    let (a, b) = (node(&mut g), node(&mut g));
    g.add_edge(a, b, EdgeType::Requires, 1.0).unwrap();

    let settled = g.mark_canceled(&a).unwrap();
    assert_eq!(g.status(&a), Some(TaskStatus::Canceled));
    assert_eq!(settled.failed, vec![b]);
    assert!(g.get_ready_nodes().is_empty());

    assert!(matches!(
        g.mark_canceled(&a),
        Err(GraphError::InvalidTransition { .. })
    ));
}

#[test]
fn edge_to_already_failed_dependency_fails_target() {
    let mut g = DependencyGraph::default();
    let (a, b) = (node(&mut g), node(&mut g));
    g.mark_failed(&a, "nope").unwrap();

    g.add_edge(a, b, EdgeType::Requires, 1.0).unwrap();
    assert_eq!(g.status(&b), Some(TaskStatus::CompletedFailure));
}

#[test]
fn dependency_on_running_task_is_rejected() {
    let mut g = DependencyGraph::default();
    let (a, b) = (node(&mut g), node(&mut g));
    run(&mut g, &b);
    assert!(matches!(
        g.add_edge(a, b, EdgeType::Requires, 1.0),
        Err(GraphError::NotPending { .. })
    ));
    // Structural edges carry no scheduling constraint.
    g.add_edge(a, b, EdgeType::Derives, 1.0).unwrap();
    assert!(g.get(&a).unwrap().child_ids.contains(&b));
}

#[test]
fn scheduling_requires_readiness() {
    let mut g = DependencyGraph::default();
    let (a, b) = (node(&mut g), node(&mut g));
    g.add_edge(a, b, EdgeType::Requires, 1.0).unwrap();
    assert_eq!(g.mark_scheduled(&b), Err(GraphError::NotReady(b)));
    assert!(matches!(
        g.mark_running(&a),
        Err(GraphError::InvalidTransition { .. })
    ));
}

#[test]
fn reset_returns_task_to_ready_set() {
    let mut g = DependencyGraph::default();
    let a = node(&mut g);
    run(&mut g, &a);
    g.set_owner(&a, Some(PeerId::from("remote")));
    assert!(!g.is_ready(&a));

    assert!(g.reset_to_pending(&a).unwrap());
    assert_eq!(g.status(&a), Some(TaskStatus::Pending));
    assert!(g.get(&a).unwrap().task.owner_peer_id.is_none());
    assert!(g.is_ready(&a));
}

#[test]
fn structural_and_dependency_edges_checked_separately() {
    let mut g = DependencyGraph::default();
    let (parent, child) = (node(&mut g), node(&mut g));
    g.add_edge(parent, child, EdgeType::Derives, 1.0).unwrap();
    g.add_edge(child, parent, EdgeType::BestEffort, 1.0).unwrap();
    assert!(matches!(
        g.add_edge(child, parent, EdgeType::Derives, 1.0),
        Err(GraphError::DuplicateEdge { .. })
    ));

    let grandchild = node(&mut g);
    g.add_edge(child, grandchild, EdgeType::Derives, 1.0).unwrap();
    assert!(matches!(
        g.add_edge(grandchild, parent, EdgeType::Derives, 1.0),
        Err(GraphError::CycleDetected { .. })
    ));
}

#[test]
fn best_effort_inputs_follow_fallback() {
    let substitute = PayloadId::from("default-answer");
    let mut g = DependencyGraph::new(FallbackPolicy::Proceed);
    let (ok, bad, target) = (node(&mut g), node(&mut g), node(&mut g));
    g.add_edge(ok, target, EdgeType::Requires, 1.0).unwrap();
    g.add_edge(bad, target, EdgeType::BestEffort, 1.0).unwrap();

    complete(&mut g, &ok);
    g.mark_failed(&bad, "flaky").unwrap();
    assert!(g.is_ready(&target));

    let inputs: HashMap<TaskId, DependencyInput> = g.inputs(&target).unwrap().into_iter().collect();
    assert_eq!(inputs[&ok], DependencyInput::Ready(PayloadId::new(format!("out-{ok}"))));
    assert_eq!(inputs[&bad], DependencyInput::Missing);


    let mut g2 = DependencyGraph::new(FallbackPolicy::Substitute(substitute.clone()));
    let (bad, target) = (node(&mut g2), node(&mut g2));
    g2.add_edge(bad, target, EdgeType::BestEffort, 1.0).unwrap();
    g2.mark_canceled(&bad).unwrap();
    assert_eq!(
        g2.inputs(&target).unwrap(),
        vec![(bad, DependencyInput::Substituted(substitute.clone()))]
    );
}

#[test]
fn node_fallback_overrides_graph_default() {
    let substitute = PayloadId::from("stand-in");
    let mut g = DependencyGraph::new(FallbackPolicy::Proceed);
    let bad = node(&mut g);
    let mut custom = GraphNode::question(PayloadId::from("p"), 1.0);
    custom.fallback = Some(FallbackPolicy::Substitute(substitute.clone()));
    let target = g.add_node(custom).unwrap();
    g.add_edge(bad, target, EdgeType::BestEffort, 1.0).unwrap();

    g.mark_failed(&bad, "down").unwrap();
    assert_eq!(
        g.inputs(&target).unwrap(),
        vec![(bad, DependencyInput::Substituted(substitute))]
    );
}

#[test]
fn garbage_collection_respects_retention_and_dependents() {
    let mut g = DependencyGraph::default();
    let (a, b, c) = (node(&mut g), node(&mut g), node(&mut g));
    g.add_edge(a, b, EdgeType::Requires, 1.0).unwrap();
    complete(&mut g, &a);

    let later = Utc::now() + chrono::Duration::seconds(120);
    // `a` is old enough but `b` still needs it.
    assert!(g.collect_garbage(later, Duration::from_secs(60)).is_empty());

    complete(&mut g, &b);
    // Too recent.
    assert!(g.collect_garbage(Utc::now(), Duration::from_secs(60)).is_empty());

    let removed: BTreeSet<TaskId> = g
        .collect_garbage(later, Duration::from_secs(60))
        .into_iter()
        .collect();
    assert_eq!(removed, BTreeSet::from([a, b]));
    assert_eq!(g.len(), 1);
    assert!(g.contains(&c));
    assert_eq!(g.edge_count(), 0);
}

#[test]
fn random_edges_never_form_a_cycle() {
    let mut g = DependencyGraph::default();
    let ids: Vec<TaskId> = (0..12).map(|_| node(&mut g)).collect();
    let mut rng = StdRng::seed_from_u64(42);
    let mut accepted = 0;

    for _ in 0..200 {
        let from = ids[rng.gen_range(0..ids.len())];
        let to = ids[rng.gen_range(0..ids.len())];

        match g.add_edge(from, to, EdgeType::Requires, 1.0) {
            Ok(()) => accepted += 1,
            Err(GraphError::CycleDetected { .. }) | Err(GraphError::DuplicateEdge { .. }) => {}
            Err(e) => panic!("unexpected error {e}"),
        }
        // Panics if the dependency edges ever contain a cycle.
        assert_eq!(g.topological_order().len(), ids.len());
    }
    assert!(accepted > 0);
    assert_eq!(g.edge_count(), accepted);
    assert_readiness_consistent(&g);
}

#[test]
fn completed_dependency_count() {
    let mut g = DependencyGraph::default();
    let (a, b, c) = (node(&mut g), node(&mut g), node(&mut g));
    g.add_edge(a, c, EdgeType::Requires, 1.0).unwrap();
    g.add_edge(b, c, EdgeType::Requires, 1.0).unwrap();
    assert_eq!(g.completed_dependencies(&c), 0);
    complete(&mut g, &a);
    assert_eq!(g.completed_dependencies(&c), 1);
}
