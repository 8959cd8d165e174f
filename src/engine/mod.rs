//! 惰性列式执行引擎的接口
//!
//! 构图阶段只登记 define / filter / book，`execute` 时一次性完成计算。
//! 生产引擎不在本 crate 范围内；[`memory::MemoryFrame`] 是一个可完整
//! 运行的小型参考实现。

pub mod expr;
pub mod memory;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use crate::common::{HandleId, NodeId, Result};
use crate::histogram::{Axis, Histogram};

pub use memory::MemoryFrame;

/// 根节点（未经任何筛选的全部事件）
pub const ROOT: NodeId = 0;

/// 列的计算方式：原生闭包（按依赖顺序接收取值）或文本表达式
#[derive(Clone)]
pub enum Transform {
    Closure(Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>),
    Expression(String),
}

impl Transform {
    pub fn closure<F>(f: F) -> Self
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
    {
        Self::Closure(Arc::new(f))
    }

    pub fn expression(text: &str) -> Self {
        Self::Expression(text.into())
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closure(_)       => write!(f, "Closure(..)"),
            Self::Expression(text) => write!(f, "Expression({text:?})"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum BookRequest {
    /// 某列在节点上的总和
    Sum { column: String },
    /// 某列平方在节点上的总和
    SumSquares { column: String },
    /// 1-3 维直方图，`columns` 与 `axes` 一一对应
    Histogram { axes: Vec<Axis>, columns: Vec<String>, weight: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResultHandle(pub HandleId);

#[derive(Debug, Clone, PartialEq)]
pub enum ResultValue {
    Scalar(f64),
    Histogram(Histogram),
}

pub trait ExecutionEngine {
    /// 当前可用的全部列名（输入列与已定义列）
    fn list_columns(&self) -> BTreeSet<String>;

    fn has_column(&self, name: &str) -> bool {
        self.list_columns().contains(name)
    }

    fn event_count(&self) -> usize;

    fn define(&mut self, name: &str, transform: Transform, dependencies: &[String]) -> Result<()>;

    fn redefine(&mut self, name: &str, transform: Transform, dependencies: &[String]) -> Result<()>;

    fn filter(&mut self, parent: NodeId, predicate: &str) -> Result<NodeId>;

    fn book(&mut self, node: NodeId, request: BookRequest) -> Result<ResultHandle>;

    /// 执行一次完整的计算
    fn execute(&mut self) -> Result<()>;

    /// 取回结果；尚未执行时先执行
    fn materialize(&mut self, handle: ResultHandle) -> Result<ResultValue>;

    /// 已执行的次数
    fn run_count(&self) -> usize;

    /// 分区元数据中列出的变化名（自动发现用）
    fn listed_variations(&self) -> Vec<String> {
        Vec::new()
    }
}
