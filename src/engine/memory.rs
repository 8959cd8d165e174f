//! MemoryFrame：内存中的参考执行引擎
//!
//! 列全部为 `f64`。每次 define / redefine 追加一个新的列版本，
//! 依赖在登记时解析到当时的版本，因此版本序列天然是拓扑序：
//!
//! ```text
//!   versions: [ pt(input) | eta(input) | e = f(pt, eta) | pt' = g(pt) | ... ]
//!   current:  { "pt" → 3, "eta" → 1, "e" → 2 }
//! ```
//!
//! `redefine` 的依赖中出现自身名字时引用的是被替换前的版本。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, Span};
use crate::common::{HandleId, NodeId, Result, SystError};
use crate::histogram::Histogram;
use super::expr::Expression;
use super::{BookRequest, ExecutionEngine, ResultHandle, ResultValue, Transform};

enum Compute {
    Input(Vec<f64>),
    Closure(Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>),
    Expression(Expression),
}

struct ColumnVersion {
    name:    String,
    compute: Compute,
    /// 依赖的列版本下标
    inputs:  Vec<usize>,
}

struct FilterNode {
    parent:    Option<NodeId>,
    predicate: Option<(Expression, Vec<usize>)>,
}

enum Booking {
    Sum        { node: NodeId, column: usize },
    SumSquares { node: NodeId, column: usize },
    Histogram  { node: NodeId, template: Histogram, columns: Vec<usize>, weight: usize },
}

pub struct MemoryFrame {
    versions:  Vec<ColumnVersion>,
    current:   BTreeMap<String, usize>,
    nodes:     Vec<FilterNode>,
    bookings:  Vec<Booking>,
    results:   HashMap<HandleId, ResultValue>,
    events:    usize,
    runs:      usize,
    listed:    Vec<String>,
    span:      Span,
}

impl MemoryFrame {
    pub fn new(span: Span) -> Self {
        Self {
            versions: vec![],
            current:  BTreeMap::new(),
            nodes:    vec![FilterNode { parent: None, predicate: None }],
            bookings: vec![],
            results:  HashMap::new(),
            events:   0,
            runs:     0,
            listed:   vec![],
            span,
        }
    }

    /// 追加一个输入列；所有输入列长度必须一致
    pub fn with_column(mut self, name: &str, values: Vec<f64>) -> Result<Self> {
        if self.current.contains_key(name) {
            return Err(SystError::ColumnExists(name.into()));
        }
        if !self.versions.is_empty() && values.len() != self.events {
            return Err(SystError::Engine(format!(
                "column {name} has {} values, frame has {} events", values.len(), self.events)));
        }
        self.events = values.len();
        self.push_version(name, Compute::Input(values), vec![]);
        Ok(self)
    }

    /// 分区元数据中列出的变化名
    pub fn with_listed_variations(mut self, names: &[&str]) -> Self {
        self.listed = names.iter().map(|n| n.to_string()).collect();
        self
    }

    fn push_version(&mut self, name: &str, compute: Compute, inputs: Vec<usize>) {
        self.current.insert(name.to_string(), self.versions.len());
        self.versions.push(ColumnVersion { name: name.into(), compute, inputs });
    }

    fn resolve(&self, name: &str) -> Result<usize> {
        self.current.get(name).copied().ok_or_else(|| SystError::ColumnNotFound(name.into()))
    }

    fn resolve_all(&self, names: &[String]) -> Result<Vec<usize>> {
        names.iter().map(|n| self.resolve(n)).collect()
    }

    fn compile(&self, transform: Transform, dependencies: &[String]) -> Result<(Compute, Vec<usize>)> {
        match transform {
            Transform::Expression(text) => {
                let expr   = Expression::parse(&text)?;
                let inputs = self.resolve_all(&expr.variables)?;
                Ok((Compute::Expression(expr), inputs))
            }
            Transform::Closure(f) => {
                let inputs = self.resolve_all(dependencies)?;
                Ok((Compute::Closure(f), inputs))
            }
        }
    }

    fn invalidate(&mut self) {
        self.results.clear();
    }

    // ── 执行 ──────────────────────────────────────────────────────────────────

    fn evaluate_columns(&self) -> Vec<Vec<f64>> {
        let mut values: Vec<Vec<f64>> = Vec::with_capacity(self.versions.len());
        for version in &self.versions {
            let column = match &version.compute {
                Compute::Input(v) => v.clone(),
                Compute::Closure(f) => (0..self.events)
                    .map(|e| {
                        let args: Vec<f64> = version.inputs.iter().map(|&i| values[i][e]).collect();
                        f(&args)
                    })
                    .collect(),
                Compute::Expression(expr) => (0..self.events)
                    .map(|e| {
                        let args: Vec<f64> = version.inputs.iter().map(|&i| values[i][e]).collect();
                        expr.eval(&args)
                    })
                    .collect(),
            };
            values.push(column);
        }
        values
    }

    fn evaluate_masks(&self, values: &[Vec<f64>]) -> Vec<Vec<bool>> {
        let mut masks: Vec<Vec<bool>> = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let parent = node.parent.map(|p| masks[p].clone());
            let mask = (0..self.events)
                .map(|e| {
                    let inherited = parent.as_ref().map(|m| m[e]).unwrap_or(true);
                    inherited && match &node.predicate {
                        None => true,
                        Some((expr, inputs)) => {
                            let args: Vec<f64> = inputs.iter().map(|&i| values[i][e]).collect();
                            expr.eval(&args) != 0.0
                        }
                    }
                })
                .collect();
            masks.push(mask);
        }
        masks
    }
}

impl ExecutionEngine for MemoryFrame {
    fn list_columns(&self) -> BTreeSet<String> {
        self.current.keys().cloned().collect()
    }

    fn has_column(&self, name: &str) -> bool {
        self.current.contains_key(name)
    }

    fn event_count(&self) -> usize { self.events }

    fn define(&mut self, name: &str, transform: Transform, dependencies: &[String]) -> Result<()> {
        if self.current.contains_key(name) {
            return Err(SystError::ColumnExists(name.into()));
        }
        let (compute, inputs) = self.compile(transform, dependencies)?;
        self.push_version(name, compute, inputs);
        self.invalidate();
        Ok(())
    }

    fn redefine(&mut self, name: &str, transform: Transform, dependencies: &[String]) -> Result<()> {
        if !self.current.contains_key(name) {
            return Err(SystError::ColumnNotFound(name.into()));
        }
        let (compute, inputs) = self.compile(transform, dependencies)?;
        self.push_version(name, compute, inputs);
        self.invalidate();
        Ok(())
    }

    fn filter(&mut self, parent: NodeId, predicate: &str) -> Result<NodeId> {
        if parent >= self.nodes.len() {
            return Err(SystError::Engine(format!("unknown node {parent}")));
        }
        let expr   = Expression::parse(predicate)?;
        let inputs = self.resolve_all(&expr.variables)?;
        self.nodes.push(FilterNode { parent: Some(parent), predicate: Some((expr, inputs)) });
        Ok(self.nodes.len() - 1)
    }

    fn book(&mut self, node: NodeId, request: BookRequest) -> Result<ResultHandle> {
        if node >= self.nodes.len() {
            return Err(SystError::Engine(format!("unknown node {node}")));
        }
        let booking = match request {
            BookRequest::Sum { column } => Booking::Sum { node, column: self.resolve(&column)? },
            BookRequest::SumSquares { column } => {
                Booking::SumSquares { node, column: self.resolve(&column)? }
            }
            BookRequest::Histogram { axes, columns, weight } => {
                if axes.len() != columns.len() {
                    return Err(SystError::Engine(format!(
                        "{} axes for {} columns", axes.len(), columns.len())));
                }
                Booking::Histogram {
                    node,
                    template: Histogram::new(axes)?,
                    columns:  self.resolve_all(&columns)?,
                    weight:   self.resolve(&weight)?,
                }
            }
        };
        self.bookings.push(booking);
        Ok(ResultHandle(self.bookings.len() - 1))
    }

    fn execute(&mut self) -> Result<()> {
        let _guard = self.span.enter();
        let values = self.evaluate_columns();
        let masks  = self.evaluate_masks(&values);

        let mut results = HashMap::with_capacity(self.bookings.len());
        for (id, booking) in self.bookings.iter().enumerate() {
            let value = match booking {
                Booking::Sum { node, column } => ResultValue::Scalar(
                    (0..self.events).filter(|&e| masks[*node][e]).map(|e| values[*column][e]).sum(),
                ),
                Booking::SumSquares { node, column } => ResultValue::Scalar(
                    (0..self.events)
                        .filter(|&e| masks[*node][e])
                        .map(|e| values[*column][e] * values[*column][e])
                        .sum(),
                ),
                Booking::Histogram { node, template, columns, weight } => {
                    let mut h = template.clone();
                    for e in (0..self.events).filter(|&e| masks[*node][e]) {
                        let coords: Vec<f64> = columns.iter().map(|&c| values[c][e]).collect();
                        h.fill(&coords, values[*weight][e]);
                    }
                    ResultValue::Histogram(h)
                }
            };
            results.insert(id, value);
        }
        self.results = results;
        self.runs += 1;
        debug!(run = self.runs, bookings = self.bookings.len(), events = self.events, "frame executed");
        Ok(())
    }

    fn materialize(&mut self, handle: ResultHandle) -> Result<ResultValue> {
        if handle.0 >= self.bookings.len() {
            return Err(SystError::Engine(format!("unknown result handle {}", handle.0)));
        }
        if !self.results.contains_key(&handle.0) {
            self.execute()?;
        }
        self.results.get(&handle.0)
            .cloned()
            .ok_or_else(|| SystError::Engine(format!("result {} missing after execution", handle.0)))
    }

    fn run_count(&self) -> usize { self.runs }

    fn listed_variations(&self) -> Vec<String> {
        self.listed.clone()
    }
}

impl std::fmt::Debug for MemoryFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryFrame")
            .field("events", &self.events)
            .field("versions", &self.versions.iter().map(|v| v.name.as_str()).collect::<Vec<_>>())
            .field("nodes", &self.nodes.len())
            .field("bookings", &self.bookings.len())
            .field("runs", &self.runs)
            .finish()
    }
}
