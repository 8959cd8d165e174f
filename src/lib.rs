//! # syst-variation-engine
//!
//! 系统变化（systematic variation）在列计算图中的传播与分区结果聚合：
//! - **registry**：哪些变化影响哪些带 `NOSYS` 标记的量（双向关系）
//! - **builder**：定义名义量时自动派生每个受影响变化的副本
//! - **aggregation**：分区结果树的拷出、物化与按序合并
//!
//! ## 整体架构
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       SampleProcessor                         │
//! │   ┌──────────────────┐      ┌────────────────────────────┐    │
//! │   │ VariationCatalog │      │       ProcessConfig        │    │
//! │   │ (配置 + 自动发现)  │      │  regions / samples / opts  │    │
//! │   └────────┬─────────┘      └─────────────┬──────────────┘    │
//! │            │                              │                   │
//! │   AffectedColumnRegistry ◄── list_columns() ── ExecutionEngine│
//! │   (BipartiteRelation)                         (MemoryFrame)   │
//! │            │                                      ▲           │
//! │   ColumnGraphBuilder ── define / filter / book ───┘           │
//! │     ├─ DefinitionHooks (reco / truth / region / ntuple)       │
//! │     └─ 权重列、变化选择条件                                   │
//! │            │                                                  │
//! │   ResultTree (Pending) ── copy ──► ResultTree (Materialized)  │
//! │            │                                                  │
//! │   merge_in_order ──► write_tree ──► KeyedStore ──► 容器字节   │
//! │                                     (LZ4 + CRC32)             │
//! └──────────────────────────────────────────────────────────────┘
//! ```

// ── 传播层 ────────────────────────────────────────────────────────────────────
pub mod common;
pub mod relation;
pub mod variation;
pub mod registry;
pub mod builder;
pub mod hooks;

// ── 执行与结果 ────────────────────────────────────────────────────────────────
pub mod engine;
pub mod histogram;
pub mod aggregation;

// ── 编排与输出 ────────────────────────────────────────────────────────────────
pub mod config;
pub mod pipeline;
pub mod partition;
pub mod sink;
pub mod logging;

pub use common::{Result, SystError, NOMINAL};
pub use engine::{ExecutionEngine, MemoryFrame, Transform};
pub use registry::AffectedColumnRegistry;
pub use builder::ColumnGraphBuilder;
pub use aggregation::ResultTree;
pub use pipeline::SampleProcessor;
