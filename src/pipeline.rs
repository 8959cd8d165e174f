//! 顶层样本处理协调器
//!
//! ```text
//!   partitions ──► [ registry → defines/hooks → weights → cutflows → book ]
//!                                                       │  copy（执行一次）
//!                                                       ▼
//!                  ResultTree(p0), ResultTree(p1), ... ──► merge_in_order ──► 最终结果
//! ```
//!
//! 每个分区独立构图；分区可以并行处理到 copy 为止，最终合并总是由
//! 单一所有者按输入顺序完成。

use std::collections::BTreeSet;
use rayon::prelude::*;
use tracing::{debug, info, info_span, warn, Span};
use crate::aggregation::{self, book_cutflow, NamedResult, ResultTree};
use crate::builder::{ColumnGraphBuilder, Normalisation};
use crate::common::{nominal_weight_column, NodeId, Result};
use crate::config::{ProcessConfig, RegionConfig, SampleConfig, VariableConfig};
use crate::engine::{BookRequest, ExecutionEngine, ROOT};
use crate::hooks::{DefinitionHooks, HookContext};
use crate::registry::{AffectedColumnRegistry, RegistryOptions};
use crate::variation::{Variation, VariationCatalog};

/// ntuple 输出计划
#[derive(Debug, Clone, PartialEq)]
pub struct NtuplePlan {
    pub columns:   Vec<String>,
    /// 名义预筛选与各变化预筛选取或；无预筛选时为 None
    pub selection: Option<String>,
}

pub struct SampleProcessor<'a, E: ExecutionEngine> {
    config: &'a ProcessConfig,
    hooks:  &'a DefinitionHooks<E>,
    span:   Span,
}

impl<'a, E: ExecutionEngine> SampleProcessor<'a, E> {
    pub fn new(config: &'a ProcessConfig, hooks: &'a DefinitionHooks<E>, span: Span) -> Self {
        Self { config, hooks, span }
    }

    fn registry_options(&self) -> RegistryOptions {
        RegistryOptions::default()
            .with_match_mode(self.config.options.match_mode)
            .with_suffix_policy(self.config.options.suffix_policy)
    }

    /// 配置中的变化，加上（启用时）代表性分区元数据列出的变化
    pub fn prepare_catalog(&self, sample: &SampleConfig, representative: &E) -> Result<VariationCatalog> {
        let span = info_span!(parent: &self.span, "catalog", sample = %sample.name);
        let mut catalog = VariationCatalog::from_config(sample, span);
        if sample.automatic_variations && !sample.nominal_only {
            catalog.discover(&representative.listed_variations(), sample)?;
        }
        let _guard = self.span.enter();
        info!(sample = %sample.name, variations = catalog.len(), "variation catalog ready");
        Ok(catalog)
    }

    /// 建登记表并完成样本级的列定义（配置 define、reco 回调、权重列）
    pub fn build_graph(
        &self,
        sample:    &SampleConfig,
        catalog:   &VariationCatalog,
        partition: &str,
        engine:    E,
    ) -> Result<ColumnGraphBuilder<E>> {
        let span = info_span!(parent: &self.span, "partition", sample = %sample.name, partition);
        let registry = AffectedColumnRegistry::build(
            engine.list_columns(),
            &catalog.names(),
            self.registry_options(),
            span.clone(),
        )?;
        let mut builder = ColumnGraphBuilder::new(registry, engine, span);
        let ctx = HookContext::new(sample, partition);

        // 1. 配置 define 与 reco 回调，顺序可配置
        if self.config.options.defines_after_hooks {
            self.hooks.reco(&mut builder, &ctx)?;
            apply_defines(&mut builder, sample)?;
        } else {
            apply_defines(&mut builder, sample)?;
            self.hooks.reco(&mut builder, &ctx)?;
        }

        // 2. 每个变化的总权重列
        builder.add_weight_columns(&sample.weight, &Normalisation::from_sample(sample), catalog)?;
        Ok(builder)
    }

    /// 处理一个分区；没有事件的分区不贡献结果
    pub fn process_partition(
        &self,
        sample:    &SampleConfig,
        catalog:   &VariationCatalog,
        partition: &str,
        engine:    E,
    ) -> Result<Option<ResultTree>> {
        if engine.event_count() == 0 {
            let _guard = self.span.enter();
            warn!(sample = %sample.name, partition, "partition has no events, skipping");
            return Ok(None);
        }
        let mut builder = self.build_graph(sample, catalog, partition, engine)?;
        let mut pending = ResultTree::new(&sample.name);

        // 1. cutflow
        let weight = nominal_weight_column();
        for cutflow in &sample.cutflows {
            let result = book_cutflow(
                builder.engine_mut(), ROOT, &weight, cutflow, sample.selection_suffix.as_deref(),
            )?;
            pending.cutflows.push(result);
        }

        // 2. 变化 × 区域
        let regions = self.config.regions_for(sample);
        let mut hooked: BTreeSet<String> = BTreeSet::new();
        for variation in catalog.iter() {
            pending.variation_mut(&variation.name);
            for region in regions.iter().filter(|r| variation.applies_to(&r.name)) {
                let selection = builder.variation_selection(
                    &sample.full_selection(&region.selection), &variation.name,
                )?;
                let node = builder.engine_mut().filter(ROOT, &selection)?;
                if hooked.insert(region.name.clone()) {
                    let ctx = HookContext::new(sample, partition).in_region(&region.name, node);
                    self.hooks.region(&mut builder, &ctx)?;
                }
                let results = book_region(&mut builder, sample, variation, region, node)?;
                pending.variation_mut(&variation.name).region_mut(&region.name).results.extend(results);
            }
        }

        // 3. 执行一次并拷出，引擎随 builder 一起释放
        let (_, mut engine) = builder.into_parts();
        let tree = aggregation::copy(&pending, &mut engine)?;
        let _guard = self.span.enter();
        debug!(
            sample = %sample.name, partition,
            results = tree.result_count(), runs = engine.run_count(),
            "partition processed",
        );
        Ok(Some(tree))
    }

    /// 顺序处理所有分区，按输入顺序合并
    pub fn process_sample<I>(&self, sample_name: &str, partitions: I) -> Result<Option<ResultTree>>
    where
        I: IntoIterator<Item = (String, E)>,
    {
        let sample = self.config.sample(sample_name)?;
        let mut partitions = partitions.into_iter().peekable();
        let Some((_, representative)) = partitions.peek() else {
            return Ok(None);
        };
        let catalog = self.prepare_catalog(sample, representative)?;

        let mut trees = Vec::new();
        for (id, engine) in partitions {
            if let Some(tree) = self.process_partition(sample, &catalog, &id, engine)? {
                trees.push(tree);
            }
        }
        aggregation::merge_in_order(trees, &self.span)
    }

    /// 在 rayon 线程池上并行构图与拷出，收集后按输入顺序合并
    pub fn process_sample_parallel<F>(
        &self,
        sample_name: &str,
        partitions:  &[String],
        factory:     F,
    ) -> Result<Option<ResultTree>>
    where
        F: Fn(&str) -> Result<E> + Send + Sync,
        Self: Sync,
    {
        let sample = self.config.sample(sample_name)?;
        let Some(first) = partitions.first() else {
            return Ok(None);
        };
        let catalog = self.prepare_catalog(sample, &factory(first)?)?;

        let results: Vec<Result<Option<ResultTree>>> = partitions
            .par_iter()
            .map(|id| {
                let engine = factory(id)?;
                self.process_partition(sample, &catalog, id, engine)
            })
            .collect();

        let mut trees = Vec::with_capacity(results.len());
        for result in results {
            if let Some(tree) = result? {
                trees.push(tree);
            }
        }
        aggregation::merge_in_order(trees, &self.span)
    }

    /// ntuple 输出的列与预筛选
    pub fn ntuple_columns(
        &self,
        sample:    &SampleConfig,
        catalog:   &VariationCatalog,
        partition: &str,
        engine:    E,
    ) -> Result<(NtuplePlan, ColumnGraphBuilder<E>)> {
        let mut builder = self.build_graph(sample, catalog, partition, engine)?;
        self.hooks.ntuple(&mut builder, &HookContext::new(sample, partition))?;

        let all: Vec<String> = builder.engine().list_columns().into_iter().collect();
        let columns = if sample.nominal_only {
            let mut variations = builder.engine().listed_variations();
            variations.extend(catalog.names());
            builder.registry().nominal_columns_among(&all, &variations)
        } else {
            all
        };
        let selection = match sample.ntuple_selection.as_deref().filter(|s| !s.is_empty()) {
            Some(sel) => Some(builder.or_selection(sel, catalog)?),
            None      => None,
        };
        Ok((NtuplePlan { columns, selection }, builder))
    }

    /// 把 truth 树的带标记列登记为仅名义，再调用 truth 回调
    pub fn define_truth(
        &self,
        builder:       &mut ColumnGraphBuilder<E>,
        sample:        &SampleConfig,
        partition:     &str,
        tree:          &str,
        truth_columns: &[String],
    ) -> Result<()> {
        builder.registry_mut().add_truth_nominal(tree, truth_columns)?;
        let ctx = HookContext::new(sample, partition).in_tree(tree);
        self.hooks.truth(builder, &ctx)
    }
}

fn apply_defines<E: ExecutionEngine>(builder: &mut ColumnGraphBuilder<E>, sample: &SampleConfig) -> Result<()> {
    for define in &sample.defines {
        builder.string_define(&define.name, &define.formula)?;
    }
    Ok(())
}

fn histogram_request<E: ExecutionEngine>(
    builder:   &ColumnGraphBuilder<E>,
    variation: &Variation,
    variables: &[&VariableConfig],
) -> Result<BookRequest> {
    let mut columns = Vec::with_capacity(variables.len());
    for v in variables {
        columns.push(builder.variation_selection(&v.definition, &variation.name)?);
    }
    Ok(BookRequest::Histogram {
        axes:   variables.iter().map(|v| v.axis).collect(),
        columns,
        weight: builder.weight_column(&variation.name),
    })
}

/// 一个 (变化, 区域) 下的 1D / 2D / 3D 直方图
///
/// 仅名义变量在非名义变化下跳过；涉及被跳过变量的组合一并跳过。
fn book_region<E: ExecutionEngine>(
    builder:   &mut ColumnGraphBuilder<E>,
    sample:    &SampleConfig,
    variation: &Variation,
    region:    &RegionConfig,
    node:      NodeId,
) -> Result<Vec<NamedResult>> {
    let mut results = Vec::new();
    for v in region.variables.iter().filter(|v| is_booked(sample, variation, v)) {
        let request = histogram_request(builder, variation, &[v])?;
        let handle  = builder.engine_mut().book(node, request)?;
        results.push(NamedResult::pending_histogram(&v.name, handle));
    }
    for (x, y) in &region.combinations_2d {
        let (Some(vx), Some(vy)) = (
            lookup(sample, variation, region, x)?,
            lookup(sample, variation, region, y)?,
        ) else { continue };
        let request = histogram_request(builder, variation, &[vx, vy])?;
        let handle  = builder.engine_mut().book(node, request)?;
        results.push(NamedResult::pending_histogram(&format!("{x}_vs_{y}"), handle));
    }
    for (x, y, z) in &region.combinations_3d {
        let (Some(vx), Some(vy), Some(vz)) = (
            lookup(sample, variation, region, x)?,
            lookup(sample, variation, region, y)?,
            lookup(sample, variation, region, z)?,
        ) else { continue };
        let request = histogram_request(builder, variation, &[vx, vy, vz])?;
        let handle  = builder.engine_mut().book(node, request)?;
        results.push(NamedResult::pending_histogram(&format!("{x}_vs_{y}_vs_{z}"), handle));
    }
    Ok(results)
}

fn is_booked(sample: &SampleConfig, variation: &Variation, v: &VariableConfig) -> bool {
    sample.uses_variable(&v.name) && (variation.is_nominal || !v.nominal_only)
}

fn lookup<'r>(
    sample:    &SampleConfig,
    variation: &Variation,
    region:    &'r RegionConfig,
    name:      &str,
) -> Result<Option<&'r VariableConfig>> {
    let v = region.variable(name)?;
    Ok(is_booked(sample, variation, v).then_some(v))
}
