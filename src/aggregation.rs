//! ResultAggregationTree：分区结果的层级容器与合并
//!
//! ```text
//!   ResultTree(sample)
//!     ├─ VariationResults(NOSYS)
//!     │    ├─ RegionResults(SR) ── [ jet_pt_NOSYS, met_NOSYS, jet_pt_vs_met ... ]
//!     │    └─ RegionResults(CR) ── [ ... ]
//!     ├─ VariationResults(JET_PT_UP) ...
//!     └─ cutflows ── [ Cutflow(main) ]
//! ```
//!
//! 每个结果要么是 Pending（引擎句柄），要么是 Materialized（自有值，
//! 与引擎无关）。`copy` 之后分区的引擎即可丢弃；合并只接受完全物化的树。

use tracing::{debug, Span};
use crate::common::{NodeId, Result, SystError};
use crate::config::CutflowConfig;
use crate::engine::{BookRequest, ExecutionEngine, ResultHandle, ResultValue};
use crate::histogram::Histogram;

/// 合并结合律的相对容差
pub const MERGE_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq)]
pub enum Lazy<H, T> {
    Pending(H),
    Materialized(T),
}

impl<H, T> Lazy<H, T> {
    pub fn is_materialized(&self) -> bool {
        matches!(self, Self::Materialized(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Materialized(v) => Some(v),
            Self::Pending(_)      => None,
        }
    }
}

// ── Cutflow ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CutflowStage {
    pub label:              String,
    pub sum_weight:         f64,
    pub sum_weight_squared: f64,
}

impl CutflowStage {
    pub fn new(label: &str, sum_weight: f64, sum_weight_squared: f64) -> Self {
        Self { label: label.into(), sum_weight, sum_weight_squared }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cutflow {
    pub stages: Vec<CutflowStage>,
}

impl Cutflow {
    pub fn new(stages: Vec<CutflowStage>) -> Self {
        Self { stages }
    }

    /// 按阶段下标逐项相加，保留自身的标签
    pub fn add(&mut self, other: &Cutflow) -> Result<()> {
        if self.stages.len() != other.stages.len() {
            return Err(SystError::ShapeMismatch(format!(
                "cutflow has {} stages vs {}", self.stages.len(), other.stages.len())));
        }
        for (a, b) in self.stages.iter_mut().zip(&other.stages) {
            a.sum_weight         += b.sum_weight;
            a.sum_weight_squared += b.sum_weight_squared;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingStage {
    pub label:       String,
    pub sum:         ResultHandle,
    pub sum_squared: ResultHandle,
}

// ── 树结构 ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Histogram(Lazy<ResultHandle, Histogram>),
    Cutflow(Lazy<Vec<PendingStage>, Cutflow>),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Histogram(_) => "histogram",
            Self::Cutflow(_)   => "cutflow",
        }
    }

    pub fn is_materialized(&self) -> bool {
        match self {
            Self::Histogram(l) => l.is_materialized(),
            Self::Cutflow(l)   => l.is_materialized(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedResult {
    pub name:    String,
    pub payload: Payload,
}

impl NamedResult {
    pub fn pending_histogram(name: &str, handle: ResultHandle) -> Self {
        Self { name: name.into(), payload: Payload::Histogram(Lazy::Pending(handle)) }
    }

    pub fn histogram(name: &str, h: Histogram) -> Self {
        Self { name: name.into(), payload: Payload::Histogram(Lazy::Materialized(h)) }
    }

    pub fn cutflow(name: &str, c: Cutflow) -> Self {
        Self { name: name.into(), payload: Payload::Cutflow(Lazy::Materialized(c)) }
    }

    pub fn as_histogram(&self) -> Option<&Histogram> {
        match &self.payload {
            Payload::Histogram(l) => l.value(),
            Payload::Cutflow(_)   => None,
        }
    }

    pub fn as_cutflow(&self) -> Option<&Cutflow> {
        match &self.payload {
            Payload::Cutflow(l)   => l.value(),
            Payload::Histogram(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionResults {
    pub name:    String,
    pub results: Vec<NamedResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariationResults {
    pub name:    String,
    pub regions: Vec<RegionResults>,
}

impl VariationResults {
    pub fn region_mut(&mut self, region: &str) -> &mut RegionResults {
        match self.regions.iter().position(|r| r.name == region) {
            Some(i) => &mut self.regions[i],
            None => {
                self.regions.push(RegionResults { name: region.into(), results: vec![] });
                let last = self.regions.len() - 1;
                &mut self.regions[last]
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultTree {
    pub sample:     String,
    pub variations: Vec<VariationResults>,
    pub cutflows:   Vec<NamedResult>,
}

impl ResultTree {
    pub fn new(sample: &str) -> Self {
        Self { sample: sample.into(), variations: vec![], cutflows: vec![] }
    }

    /// 取变化节点，不存在时按插入顺序追加
    pub fn variation_mut(&mut self, variation: &str) -> &mut VariationResults {
        match self.variations.iter().position(|v| v.name == variation) {
            Some(i) => &mut self.variations[i],
            None => {
                self.variations.push(VariationResults { name: variation.into(), regions: vec![] });
                let last = self.variations.len() - 1;
                &mut self.variations[last]
            }
        }
    }

    pub fn push(&mut self, variation: &str, region: &str, result: NamedResult) {
        self.variation_mut(variation).region_mut(region).results.push(result);
    }

    pub fn find(&self, variation: &str, region: &str, name: &str) -> Option<&NamedResult> {
        self.variations.iter()
            .find(|v| v.name == variation)?
            .regions.iter()
            .find(|r| r.name == region)?
            .results.iter()
            .find(|r| r.name == name)
    }

    pub fn histogram(&self, variation: &str, region: &str, name: &str) -> Option<&Histogram> {
        self.find(variation, region, name)?.as_histogram()
    }

    pub fn cutflow(&self, name: &str) -> Option<&Cutflow> {
        self.cutflows.iter().find(|c| c.name == name)?.as_cutflow()
    }

    fn results(&self) -> impl Iterator<Item = &NamedResult> {
        self.variations.iter()
            .flat_map(|v| v.regions.iter())
            .flat_map(|r| r.results.iter())
            .chain(self.cutflows.iter())
    }

    fn results_mut(&mut self) -> impl Iterator<Item = &mut NamedResult> {
        self.variations.iter_mut()
            .flat_map(|v| v.regions.iter_mut())
            .flat_map(|r| r.results.iter_mut())
            .chain(self.cutflows.iter_mut())
    }

    pub fn result_count(&self) -> usize {
        self.results().count()
    }

    pub fn is_materialized(&self) -> bool {
        self.results().all(|r| r.payload.is_materialized())
    }

    /// 第一个未物化结果的名称
    pub fn first_pending(&self) -> Option<&str> {
        self.results().find(|r| !r.payload.is_materialized()).map(|r| r.name.as_str())
    }
}

// ── 物化 ──────────────────────────────────────────────────────────────────────

fn scalar<E: ExecutionEngine>(engine: &mut E, handle: ResultHandle) -> Result<f64> {
    match engine.materialize(handle)? {
        ResultValue::Scalar(x) => Ok(x),
        ResultValue::Histogram(_) => Err(SystError::Engine(
            format!("result {} is a histogram, expected a scalar", handle.0))),
    }
}

fn materialize_payload<E: ExecutionEngine>(payload: &Payload, engine: &mut E) -> Result<Payload> {
    Ok(match payload {
        Payload::Histogram(Lazy::Pending(handle)) => match engine.materialize(*handle)? {
            ResultValue::Histogram(h) => Payload::Histogram(Lazy::Materialized(h)),
            ResultValue::Scalar(_) => {
                return Err(SystError::Engine(
                    format!("result {} is a scalar, expected a histogram", handle.0)));
            }
        },
        Payload::Cutflow(Lazy::Pending(stages)) => {
            let mut out = Vec::with_capacity(stages.len());
            for stage in stages {
                out.push(CutflowStage {
                    label:              stage.label.clone(),
                    sum_weight:         scalar(engine, stage.sum)?,
                    sum_weight_squared: scalar(engine, stage.sum_squared)?,
                });
            }
            Payload::Cutflow(Lazy::Materialized(Cutflow::new(out)))
        }
        done => done.clone(),
    })
}

/// 深拷贝并物化所有 Pending 结果；返回的树与引擎无关
pub fn copy<E: ExecutionEngine>(tree: &ResultTree, engine: &mut E) -> Result<ResultTree> {
    let mut out = ResultTree::new(&tree.sample);
    for v in &tree.variations {
        let mut regions = Vec::with_capacity(v.regions.len());
        for r in &v.regions {
            let mut results = Vec::with_capacity(r.results.len());
            for res in &r.results {
                results.push(NamedResult {
                    name:    res.name.clone(),
                    payload: materialize_payload(&res.payload, engine)?,
                });
            }
            regions.push(RegionResults { name: r.name.clone(), results });
        }
        out.variations.push(VariationResults { name: v.name.clone(), regions });
    }
    for c in &tree.cutflows {
        out.cutflows.push(NamedResult {
            name:    c.name.clone(),
            payload: materialize_payload(&c.payload, engine)?,
        });
    }
    Ok(out)
}

/// 触发引擎的一次执行，并就地物化
pub fn execute<E: ExecutionEngine>(tree: &mut ResultTree, engine: &mut E) -> Result<()> {
    engine.execute()?;
    for result in tree.results_mut() {
        result.payload = materialize_payload(&result.payload, engine)?;
    }
    Ok(())
}

// ── 合并 ──────────────────────────────────────────────────────────────────────

fn check_names(what: &str, a: &str, b: &str) -> Result<()> {
    if a != b {
        return Err(SystError::ShapeMismatch(format!("{what} {a} vs {b}")));
    }
    Ok(())
}

fn check_len(what: &str, owner: &str, a: usize, b: usize) -> Result<()> {
    if a != b {
        return Err(SystError::ShapeMismatch(format!("{what} count of {owner}: {a} vs {b}")));
    }
    Ok(())
}

fn check_result(a: &NamedResult, b: &NamedResult) -> Result<()> {
    check_names("result", &a.name, &b.name)?;
    match (&a.payload, &b.payload) {
        (Payload::Histogram(x), Payload::Histogram(y)) => match (x.value(), y.value()) {
            (Some(hx), Some(hy)) if hx.same_binning(hy) => Ok(()),
            (Some(_), Some(_)) => Err(SystError::ShapeMismatch(
                format!("histogram {} has different axes", a.name))),
            _ => Err(SystError::NotMaterialized(a.name.clone())),
        },
        (Payload::Cutflow(x), Payload::Cutflow(y)) => match (x.value(), y.value()) {
            (Some(cx), Some(cy)) => check_len("stage", &a.name, cx.stages.len(), cy.stages.len()),
            _ => Err(SystError::NotMaterialized(a.name.clone())),
        },
        (pa, pb) => Err(SystError::ShapeMismatch(
            format!("result {} is a {} vs a {}", a.name, pa.kind(), pb.kind()))),
    }
}

fn check_shape(acc: &ResultTree, incoming: &ResultTree) -> Result<()> {
    check_len("variation", &acc.sample, acc.variations.len(), incoming.variations.len())?;
    for (va, vb) in acc.variations.iter().zip(&incoming.variations) {
        check_names("variation", &va.name, &vb.name)?;
        check_len("region", &va.name, va.regions.len(), vb.regions.len())?;
        for (ra, rb) in va.regions.iter().zip(&vb.regions) {
            check_names("region", &ra.name, &rb.name)?;
            check_len("result", &ra.name, ra.results.len(), rb.results.len())?;
            for (a, b) in ra.results.iter().zip(&rb.results) {
                check_result(a, b)?;
            }
        }
    }
    check_len("cutflow", &acc.sample, acc.cutflows.len(), incoming.cutflows.len())?;
    for (a, b) in acc.cutflows.iter().zip(&incoming.cutflows) {
        check_result(a, b)?;
    }
    Ok(())
}

fn add_payload(acc: &mut Payload, incoming: &Payload) -> Result<()> {
    match (acc, incoming) {
        (Payload::Histogram(Lazy::Materialized(a)), Payload::Histogram(Lazy::Materialized(b))) => {
            a.add(b)
        }
        (Payload::Cutflow(Lazy::Materialized(a)), Payload::Cutflow(Lazy::Materialized(b))) => {
            a.add(b)
        }
        (a, _) => Err(SystError::NotMaterialized(a.kind().into())),
    }
}

/// 把 `incoming` 加到 `acc` 上；先完整校验形状，校验失败时 `acc` 不变
pub fn merge(acc: &mut ResultTree, incoming: &ResultTree) -> Result<()> {
    check_shape(acc, incoming)?;
    let pairs = acc.results_mut().zip(incoming.results());
    for (a, b) in pairs {
        add_payload(&mut a.payload, &b.payload)?;
    }
    Ok(())
}

/// 按给定顺序左折叠合并；该顺序即为可观察的合并顺序
pub fn merge_in_order<I>(trees: I, span: &Span) -> Result<Option<ResultTree>>
where
    I: IntoIterator<Item = ResultTree>,
{
    let _guard = span.enter();
    let mut iter = trees.into_iter();
    let Some(mut acc) = iter.next() else {
        return Ok(None);
    };
    let mut merged = 1usize;
    for tree in iter {
        merge(&mut acc, &tree)?;
        merged += 1;
    }
    debug!(sample = %acc.sample, partitions = merged, "partitions merged");
    Ok(Some(acc))
}

// ── Cutflow 预约 ──────────────────────────────────────────────────────────────

/// 在 `base` 上预约一个 cutflow
///
/// 第 0 阶段 "Initial" 为 `weight` 及其平方的无条件总和；
/// 样本有选择后缀时追加 "SuffixSelection" 阶段；之后每个阶段累积施加下一个选择。
pub fn book_cutflow<E: ExecutionEngine>(
    engine:           &mut E,
    base:             NodeId,
    weight:           &str,
    config:           &CutflowConfig,
    selection_suffix: Option<&str>,
) -> Result<NamedResult> {
    let book_stage = |engine: &mut E, node: NodeId, label: &str| -> Result<PendingStage> {
        Ok(PendingStage {
            label:       label.into(),
            sum:         engine.book(node, BookRequest::Sum { column: weight.into() })?,
            sum_squared: engine.book(node, BookRequest::SumSquares { column: weight.into() })?,
        })
    };

    let mut stages = vec![book_stage(&mut *engine, base, "Initial")?];
    let mut node = base;
    if let Some(suffix) = selection_suffix.filter(|s| !s.is_empty()) {
        node = engine.filter(node, suffix)?;
        stages.push(book_stage(&mut *engine, node, "SuffixSelection")?);
    }
    for sel in &config.selections {
        node = engine.filter(node, &sel.selection)?;
        stages.push(book_stage(&mut *engine, node, sel.title.as_str())?);
    }
    Ok(NamedResult { name: config.name.clone(), payload: Payload::Cutflow(Lazy::Pending(stages)) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MemoryFrame, ROOT};
    use crate::histogram::Axis;

    fn cutflow(stages: &[(&str, f64, f64)]) -> Cutflow {
        Cutflow::new(stages.iter().map(|&(l, w, w2)| CutflowStage::new(l, w, w2)).collect())
    }

    fn hist(values: &[f64]) -> Histogram {
        let mut h = Histogram::new(vec![Axis::new(2, 0.0, 2.0)]).unwrap();
        for &x in values {
            h.fill(&[x], 1.0);
        }
        h
    }

    fn tree(values: &[f64], flow: &[(&str, f64, f64)]) -> ResultTree {
        let mut t = ResultTree::new("ttbar");
        t.push("NOSYS", "SR", NamedResult::histogram("x", hist(values)));
        t.push("SYS_A", "SR", NamedResult::histogram("x", hist(values)));
        t.cutflows.push(NamedResult::cutflow("main", cutflow(flow)));
        t
    }

    #[test]
    fn merge_adds_cutflows_and_keeps_labels() {
        let mut a = tree(&[0.5], &[("Initial", 100.0, 100.0), ("SelA", 40.0, 40.0)]);
        let b = tree(&[1.5], &[("Initial", 50.0, 50.0), ("Renamed", 10.0, 10.0)]);
        merge(&mut a, &b).unwrap();
        assert_eq!(
            a.cutflow("main").unwrap(),
            &cutflow(&[("Initial", 150.0, 150.0), ("SelA", 50.0, 50.0)]),
        );
        let h = a.histogram("SYS_A", "SR", "x").unwrap();
        assert_eq!(h.content(&[1]), Some(1.0));
        assert_eq!(h.content(&[2]), Some(1.0));
    }

    #[test]
    fn merge_rejects_shape_mismatch_without_side_effects() {
        let mut a = tree(&[0.5], &[("Initial", 1.0, 1.0)]);
        let before = a.clone();

        let mut b = tree(&[0.5], &[("Initial", 1.0, 1.0)]);
        b.variations.swap(0, 1);
        assert!(matches!(merge(&mut a, &b), Err(SystError::ShapeMismatch(_))));

        let c = tree(&[0.5], &[("Initial", 1.0, 1.0), ("More", 1.0, 1.0)]);
        assert!(matches!(merge(&mut a, &c), Err(SystError::ShapeMismatch(_))));

        let mut d = tree(&[0.5], &[("Initial", 1.0, 1.0)]);
        d.push("NOSYS", "SR", NamedResult::histogram("y", hist(&[])));
        assert!(matches!(merge(&mut a, &d), Err(SystError::ShapeMismatch(_))));

        let mut e = tree(&[0.5], &[("Initial", 1.0, 1.0)]);
        e.variations[0].regions[0].results[0] = NamedResult::cutflow("x", cutflow(&[]));
        assert!(matches!(merge(&mut a, &e), Err(SystError::ShapeMismatch(_))));

        assert_eq!(a, before);
    }

    #[test]
    fn merge_requires_materialized_trees() {
        let mut a = tree(&[0.5], &[]);
        let mut b = tree(&[0.5], &[]);
        b.variations[0].regions[0].results[0] = NamedResult::pending_histogram("x", ResultHandle(0));
        assert!(!b.is_materialized());
        assert_eq!(b.first_pending(), Some("x"));
        assert!(matches!(merge(&mut a, &b), Err(SystError::NotMaterialized(_))));
    }

    #[test]
    fn merge_in_order_folds_left() {
        let trees = vec![tree(&[0.5], &[]), tree(&[0.5], &[]), tree(&[1.5], &[])];
        let merged = merge_in_order(trees, &Span::none()).unwrap().unwrap();
        let h = merged.histogram("NOSYS", "SR", "x").unwrap();
        assert_eq!(h.content(&[1]), Some(2.0));
        assert_eq!(h.entries, 3);
        assert!(merge_in_order(Vec::new(), &Span::none()).unwrap().is_none());
    }

    #[test]
    fn copy_outlives_engine() {
        let mut frame = MemoryFrame::new(Span::none())
            .with_column("weight_total_NOSYS", vec![1.0, 2.0, 3.0]).unwrap()
            .with_column("x", vec![0.5, 1.5, 1.5]).unwrap();
        let config = CutflowConfig::new("main").with_stage("x > 1", "HighX");
        let flow = book_cutflow(&mut frame, ROOT, "weight_total_NOSYS", &config, Some("x < 100"))
            .unwrap();
        let handle = frame.book(ROOT, BookRequest::Histogram {
            axes: vec![Axis::new(2, 0.0, 2.0)], columns: vec!["x".into()],
            weight: "weight_total_NOSYS".into(),
        }).unwrap();

        let mut pending = ResultTree::new("ttbar");
        pending.push("NOSYS", "SR", NamedResult::pending_histogram("x", handle));
        pending.cutflows.push(flow);

        let owned = copy(&pending, &mut frame).unwrap();
        drop(frame);

        assert!(owned.is_materialized());
        assert_eq!(owned.histogram("NOSYS", "SR", "x").unwrap().content(&[2]), Some(5.0));
        assert_eq!(
            owned.cutflow("main").unwrap(),
            &cutflow(&[("Initial", 6.0, 14.0), ("SuffixSelection", 6.0, 14.0), ("HighX", 5.0, 13.0)]),
        );
    }

    #[test]
    fn execute_materializes_in_place_with_one_run() {
        let mut frame = MemoryFrame::new(Span::none())
            .with_column("w", vec![1.0, 1.0]).unwrap();
        let config = CutflowConfig::new("c").with_stage("w > 0", "All");
        let mut t = ResultTree::new("s");
        t.cutflows.push(book_cutflow(&mut frame, ROOT, "w", &config, None).unwrap());
        execute(&mut t, &mut frame).unwrap();
        assert!(t.is_materialized());
        assert_eq!(frame.run_count(), 1);
        assert_eq!(t.cutflow("c").unwrap().stages.len(), 2);
    }
}
