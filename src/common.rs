//! 全局基础类型与错误定义

use serde::Deserialize;
use thiserror::Error;

// ── 名称约定 ──────────────────────────────────────────────────────────────────

/// 名义标记：凡是需要按系统变化传播的列名都必须包含它
pub const NOMINAL: &str = "NOSYS";

/// 每个变化的总权重列前缀，`weight_total_<变化名>`
pub const WEIGHT_PREFIX: &str = "weight_total_";

pub type VariationName = String;
pub type RegionId      = String;
pub type NodeId        = usize;
pub type HandleId      = usize;

/// 名义总权重列 `weight_total_NOSYS`
pub fn nominal_weight_column() -> String {
    format!("{WEIGHT_PREFIX}{NOMINAL}")
}

pub fn has_marker(name: &str) -> bool {
    name.contains(NOMINAL)
}

/// 把名称中的名义标记整体替换为变化名
pub fn marker_to(name: &str, variation: &str) -> String {
    name.replace(NOMINAL, variation)
}

/// 仅替换末尾的一次 `suffix`；不以其结尾时返回 None
pub fn replace_trailing(name: &str, suffix: &str, to: &str) -> Option<String> {
    let stem = name.strip_suffix(suffix)?;
    let mut out = String::with_capacity(stem.len() + to.len());
    out.push_str(stem);
    out.push_str(to);
    Some(out)
}

/// 去掉名义标记，得到写出时使用的名称（`jet_pt_NOSYS` → `jet_pt`）
pub fn strip_marker(name: &str) -> String {
    name.replace(&format!("_{NOMINAL}"), "").replace(NOMINAL, "")
}

// ── 枚举 ──────────────────────────────────────────────────────────────────────

/// 在自由文本（表达式、选择条件）中定位已登记列名的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum MatchMode {
    /// 任意子串匹配（与历史行为一致）
    #[default]
    Substring,
    /// 匹配两侧不得紧邻标识符字符 `[A-Za-z0-9_.]`
    TokenBoundary,
}

/// 同一列名同时以两个变化名结尾时的处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum SuffixPolicy {
    /// 直接报错 AmbiguousSuffix
    #[default]
    Reject,
    /// 由最长的变化名认领，其余忽略
    LongestMatch,
}

// ── 错误 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SystError {
    #[error("name does not contain \"NOSYS\": {0}")]
    MissingMarker(String),
    #[error("quantity not registered: {0}")]
    UnknownQuantity(String),
    #[error("variation not registered: {0}")]
    UnknownVariation(String),
    #[error("column {column} ends with both {first} and {second}")]
    AmbiguousSuffix { column: String, first: String, second: String },
    #[error("registry inconsistent: {0}")]
    Inconsistent(String),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("result not materialized: {0}")]
    NotMaterialized(String),
    #[error("column already defined: {0}")]
    ColumnExists(String),
    #[error("column not found: {0}")]
    ColumnNotFound(String),
    #[error("engine error: {0}")]
    Engine(String),
    #[error("expression error: {0}")]
    Expression(String),
    #[error("sum of weights missing for key: {0}")]
    MissingSumWeights(String),
    #[error("invalid job split: {0}")]
    InvalidJobSplit(String),
    #[error("incomplete job outputs: {0}")]
    IncompleteJobOutputs(String),
    #[error("invalid exclusion pattern: {0}")]
    InvalidPattern(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("sink error: {0}")]
    Sink(String),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("compression error: {0}")]
    Compression(String),
}

pub type Result<T> = std::result::Result<T, SystError>;
