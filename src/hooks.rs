//! 用户自定义列的回调表
//!
//! 四个具名槽位，各自可选：
//!
//! | 槽位          | 调用时机                                      |
//! |---------------|-----------------------------------------------|
//! | define_reco   | 登记表建好、权重列之前（或之后，见配置）      |
//! | define_truth  | truth 树的列登记之前                          |
//! | define_region | 每个区域第一次被筛选之后、预约直方图之前      |
//! | define_ntuple | 决定 ntuple 输出列之前                        |

use crate::builder::ColumnGraphBuilder;
use crate::common::{NodeId, Result};
use crate::config::SampleConfig;
use crate::engine::{ExecutionEngine, ROOT};

/// 回调收到的上下文
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub sample:    &'a SampleConfig,
    /// 分区标识
    pub partition: &'a str,
    pub region:    Option<&'a str>,
    /// truth 树名
    pub tree:      Option<&'a str>,
    /// 回调所在的筛选节点
    pub node:      NodeId,
}

impl<'a> HookContext<'a> {
    pub fn new(sample: &'a SampleConfig, partition: &'a str) -> Self {
        Self { sample, partition, region: None, tree: None, node: ROOT }
    }

    pub fn in_region(mut self, region: &'a str, node: NodeId) -> Self {
        self.region = Some(region);
        self.node   = node;
        self
    }

    pub fn in_tree(mut self, tree: &'a str) -> Self {
        self.tree = Some(tree);
        self
    }
}

pub type Hook<E> =
    Box<dyn Fn(&mut ColumnGraphBuilder<E>, &HookContext<'_>) -> Result<()> + Send + Sync>;

pub struct DefinitionHooks<E: ExecutionEngine> {
    define_reco:   Option<Hook<E>>,
    define_truth:  Option<Hook<E>>,
    define_region: Option<Hook<E>>,
    define_ntuple: Option<Hook<E>>,
}

impl<E: ExecutionEngine> Default for DefinitionHooks<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: ExecutionEngine> DefinitionHooks<E> {
    pub fn new() -> Self {
        Self { define_reco: None, define_truth: None, define_region: None, define_ntuple: None }
    }

    pub fn with_reco<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ColumnGraphBuilder<E>, &HookContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.define_reco = Some(Box::new(f)); self
    }

    pub fn with_truth<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ColumnGraphBuilder<E>, &HookContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.define_truth = Some(Box::new(f)); self
    }

    pub fn with_region<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ColumnGraphBuilder<E>, &HookContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.define_region = Some(Box::new(f)); self
    }

    pub fn with_ntuple<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ColumnGraphBuilder<E>, &HookContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.define_ntuple = Some(Box::new(f)); self
    }

    // 未设置的槽位为空操作

    pub fn reco(&self, builder: &mut ColumnGraphBuilder<E>, ctx: &HookContext<'_>) -> Result<()> {
        Self::call(&self.define_reco, builder, ctx)
    }

    pub fn truth(&self, builder: &mut ColumnGraphBuilder<E>, ctx: &HookContext<'_>) -> Result<()> {
        Self::call(&self.define_truth, builder, ctx)
    }

    pub fn region(&self, builder: &mut ColumnGraphBuilder<E>, ctx: &HookContext<'_>) -> Result<()> {
        Self::call(&self.define_region, builder, ctx)
    }

    pub fn ntuple(&self, builder: &mut ColumnGraphBuilder<E>, ctx: &HookContext<'_>) -> Result<()> {
        Self::call(&self.define_ntuple, builder, ctx)
    }

    fn call(
        slot:    &Option<Hook<E>>,
        builder: &mut ColumnGraphBuilder<E>,
        ctx:     &HookContext<'_>,
    ) -> Result<()> {
        match slot {
            Some(hook) => hook(builder, ctx),
            None       => Ok(()),
        }
    }
}
