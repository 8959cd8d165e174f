use approx::assert_relative_eq;
use proptest::prelude::*;
use tracing::Span;
use syst_variation_engine::aggregation::{
    copy, merge, merge_in_order, Cutflow, CutflowStage, NamedResult, ResultTree, MERGE_TOLERANCE,
};
use syst_variation_engine::common::SystError;
use syst_variation_engine::engine::{BookRequest, ExecutionEngine, MemoryFrame, ROOT};
use syst_variation_engine::histogram::{Axis, Histogram};

fn hist(fills: &[(f64, f64)]) -> Histogram {
    let mut h = Histogram::new(vec![Axis::new(4, 0.0, 4.0)]).unwrap();
    for &(x, w) in fills {
        h.fill(&[x], w);
    }
    h
}

fn tree(fills: &[(f64, f64)], stages: &[(&str, f64, f64)]) -> ResultTree {
    let mut t = ResultTree::new("ttbar");
    t.push("NOSYS", "SR", NamedResult::histogram("m_NOSYS", hist(fills)));
    t.push("JES_UP", "SR", NamedResult::histogram("m_NOSYS", hist(fills)));
    t.cutflows.push(NamedResult::cutflow("main", Cutflow::new(
        stages.iter().map(|&(l, w, w2)| CutflowStage::new(l, w, w2)).collect(),
    )));
    t
}

fn merged(first: &ResultTree, rest: &[&ResultTree]) -> ResultTree {
    let mut acc = first.clone();
    for t in rest {
        merge(&mut acc, t).unwrap();
    }
    acc
}

#[test]
fn cutflows_add_stage_by_stage() {
    let a = tree(&[], &[("Initial", 100.0, 100.0), ("SelA", 40.0, 40.0)]);
    let b = tree(&[], &[("Initial", 50.0, 50.0), ("SelA", 10.0, 10.0)]);
    let sum = merged(&a, &[&b]);
    let c = sum.cutflow("main").unwrap();
    assert_eq!(c.stages, vec![
        CutflowStage::new("Initial", 150.0, 150.0),
        CutflowStage::new("SelA", 50.0, 50.0),
    ]);
}

#[test]
fn shape_mismatch_leaves_accumulator_untouched() {
    let mut acc = tree(&[(0.5, 1.0)], &[("Initial", 1.0, 1.0)]);
    let before = acc.clone();

    let mut extra_stage = tree(&[(0.5, 1.0)], &[("Initial", 1.0, 1.0), ("SelA", 1.0, 1.0)]);
    assert!(matches!(merge(&mut acc, &extra_stage), Err(SystError::ShapeMismatch(_))));
    assert_eq!(acc, before);

    extra_stage = tree(&[(0.5, 1.0)], &[("Initial", 1.0, 1.0)]);
    extra_stage.push("JER", "SR", NamedResult::histogram("m_NOSYS", hist(&[])));
    assert!(merge(&mut acc, &extra_stage).is_err());
    assert_eq!(acc, before);
}

#[test]
fn copied_tree_outlives_its_engine() {
    let mut frame = MemoryFrame::new(Span::none())
        .with_column("m_NOSYS", vec![0.5, 1.5, 2.5]).unwrap()
        .with_column("w", vec![1.0, 2.0, 3.0]).unwrap();
    let handle = frame.book(ROOT, BookRequest::Histogram {
        axes:    vec![Axis::new(4, 0.0, 4.0)],
        columns: vec!["m_NOSYS".into()],
        weight:  "w".into(),
    }).unwrap();
    let mut pending = ResultTree::new("ttbar");
    pending.push("NOSYS", "SR", NamedResult::pending_histogram("m_NOSYS", handle));

    let copied = copy(&pending, &mut frame).unwrap();
    drop(frame);
    assert!(copied.is_materialized());
    assert_relative_eq!(copied.histogram("NOSYS", "SR", "m_NOSYS").unwrap().integral(), 6.0);
}

#[test]
fn merge_in_order_of_nothing_is_none() {
    assert!(merge_in_order(Vec::<ResultTree>::new(), &Span::none()).unwrap().is_none());
}

proptest! {
    #[test]
    fn merge_is_associative_within_tolerance(
        a in prop::collection::vec((0.0f64..4.0, 1e-6f64..1e6), 0..20),
        b in prop::collection::vec((0.0f64..4.0, 1e-6f64..1e6), 0..20),
        c in prop::collection::vec((0.0f64..4.0, 1e-6f64..1e6), 0..20),
    ) {
        let flow = [("Initial", 1.0, 1.0)];
        let (ta, tb, tc) = (tree(&a, &flow), tree(&b, &flow), tree(&c, &flow));

        let left  = merged(&merged(&ta, &[&tb]), &[&tc]);
        let right = merged(&ta, &[&merged(&tb, &[&tc])]);

        let hl = left.histogram("NOSYS", "SR", "m_NOSYS").unwrap();
        let hr = right.histogram("NOSYS", "SR", "m_NOSYS").unwrap();
        for (x, y) in hl.contents.iter().zip(&hr.contents) {
            assert_relative_eq!(*x, *y, max_relative = MERGE_TOLERANCE, epsilon = 1e-300);
        }
        prop_assert_eq!(hl.entries, hr.entries);

        let ordered = merge_in_order(vec![ta, tb, tc], &Span::none()).unwrap().unwrap();
        prop_assert_eq!(&ordered, &left);
    }
}
