//! AffectedColumnRegistry：变化 ↔ 名义列 的双向登记表
//!
//! ```text
//!   variation_affects      V ─────► { x_NOSYS, y_NOSYS, ... }
//!   quantity_affected_by   x_NOSYS ─► { NOSYS, JET_PT_UP, ... }
//! ```
//!
//! 初始状态由一个代表性分区的列目录按命名约定推导：列名以变化名结尾，
//! 则该列"属于"这个变化，其名义形式把末尾的变化名替换为 `NOSYS`。
//! 之后每定义一个新列都通过 [`AffectedColumnRegistry::register_new`]
//! 或 [`AffectedColumnRegistry::update`] 登记，从而在构图过程中传递依赖。

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace, warn, Span};
use crate::common::{
    has_marker, marker_to, replace_trailing, MatchMode, Result, SuffixPolicy, SystError, NOMINAL,
};
use crate::relation::BipartiteRelation;

#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryOptions {
    pub match_mode:    MatchMode,
    pub suffix_policy: SuffixPolicy,
}

impl RegistryOptions {
    pub fn with_match_mode(mut self, mode: MatchMode) -> Self {
        self.match_mode = mode; self
    }
    pub fn with_suffix_policy(mut self, policy: SuffixPolicy) -> Self {
        self.suffix_policy = policy; self
    }
}

#[derive(Debug, Clone)]
pub struct AffectedColumnRegistry {
    /// 左：变化名，右：名义列名
    relation:   BipartiteRelation<String, String>,
    /// 已知的全部列名（名义的与具体变化的）
    known:      BTreeSet<String>,
    /// 目录中的变化名，用于判断列是否为名义列
    variations: Vec<String>,
    options:    RegistryOptions,
    span:       Span,
}

impl AffectedColumnRegistry {
    /// 空登记表，只声明给定的变化
    pub fn new(variations: &[String], options: RegistryOptions, span: Span) -> Self {
        let mut relation = BipartiteRelation::new();
        for v in variations {
            relation.declare_left(v.clone());
        }
        Self {
            relation,
            known:      BTreeSet::new(),
            variations: variations.to_vec(),
            options,
            span,
        }
    }

    /// 由列目录与变化目录构建
    pub fn build<I, S>(
        columns:    I,
        variations: &[String],
        options:    RegistryOptions,
        span:       Span,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut registry = Self::new(variations, options, span);
        let columns: Vec<String> = columns.into_iter().map(|c| c.as_ref().to_string()).collect();

        let claims = registry.claim_suffixes(&columns)?;
        for (column, variation) in claims {
            if let Some(nominal) = replace_trailing(&column, &variation, NOMINAL) {
                registry.relation.link(variation, nominal);
            }
        }
        registry.known.extend(columns);

        {
            let _guard = registry.span.enter();
            debug!(
                columns    = registry.known.len(),
                variations = registry.variations.len(),
                edges      = registry.relation.edge_count(),
                "registry built",
            );
            registry.trace_maps();
        }
        Ok(registry)
    }

    /// 冲突检测：一个列名同时以两个变化名结尾
    fn claim_suffixes(&self, columns: &[String]) -> Result<Vec<(String, String)>> {
        let _guard = self.span.enter();
        let mut claims = Vec::new();
        for column in columns {
            let mut owners: Vec<&String> = self.variations.iter()
                .filter(|v| !v.is_empty() && column.ends_with(v.as_str()))
                .collect();
            owners.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
            owners.dedup();

            match owners.as_slice() {
                [] => {}
                [only] => claims.push((column.clone(), (*only).clone())),
                [first, second, ..] => match self.options.suffix_policy {
                    SuffixPolicy::Reject => {
                        return Err(SystError::AmbiguousSuffix {
                            column: column.clone(),
                            first:  (*first).clone(),
                            second: (*second).clone(),
                        });
                    }
                    SuffixPolicy::LongestMatch => {
                        warn!(
                            column = %column, claimed_by = %first, ignored = %second,
                            "column ends with several variation names, longest wins",
                        );
                        claims.push((column.clone(), (*first).clone()));
                    }
                },
            }
        }
        Ok(claims)
    }

    // ── 替换 ──────────────────────────────────────────────────────────────────

    /// 把 `text` 中受 `variation` 影响的已登记名义列替换为对应的变化列
    ///
    /// 较长的名字先替换，避免短名字破坏包含它的长名字。
    pub fn substitute(&self, text: &str, variation: &str) -> Result<String> {
        let affected = self.relation.rights_of(&variation.to_string())
            .ok_or_else(|| SystError::UnknownVariation(variation.into()))?;

        let mut names: Vec<&String> = affected.iter().collect();
        names.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        let mut result = text.to_string();
        for name in names {
            let replacement = marker_to(name, variation);
            result = replace_matches(&result, name, &replacement, self.options.match_mode);
        }
        Ok(result)
    }

    pub fn substitute_all(&self, texts: &[String], variation: &str) -> Result<Vec<String>> {
        texts.iter().map(|t| self.substitute(t, variation)).collect()
    }

    /// 依赖集合的有效变化：各带标记依赖所受影响变化的并集
    pub fn effective_variations(&self, dependencies: &[String]) -> Result<BTreeSet<String>> {
        let mut result = BTreeSet::new();
        for dep in dependencies.iter().filter(|d| has_marker(d)) {
            let by = self.relation.lefts_of(dep)
                .ok_or_else(|| SystError::UnknownQuantity(dep.clone()))?;
            result.extend(by.iter().cloned());
        }
        Ok(result)
    }

    /// 文本中出现的已登记名义列（启发式依赖发现）
    pub fn substrings_present(&self, text: &str) -> Vec<String> {
        let mut found: Vec<String> = self.relation.right_keys()
            .filter(|name| !find_matches(text, name, self.options.match_mode).is_empty())
            .cloned()
            .collect();
        found.sort();
        found
    }

    // ── 登记 ──────────────────────────────────────────────────────────────────

    /// 登记新定义的名义列及其有效变化
    ///
    /// 已知或已有登记项时为空操作，不与已有集合取并集。
    pub fn register_new(&mut self, name: &str, variations: &BTreeSet<String>) -> Result<()> {
        if !has_marker(name) {
            return Err(SystError::MissingMarker(name.into()));
        }
        let _guard = self.span.enter();
        if self.known.contains(name) || self.relation.contains_right(&name.to_string()) {
            debug!(column = %name, "column already registered, not registering");
            return Ok(());
        }
        self.require_declared(variations)?;

        self.relation.declare_right(name.to_string());
        for v in variations {
            self.relation.link(v.clone(), name.to_string());
        }
        self.known.insert(name.to_string());
        for v in variations {
            let concrete = marker_to(name, v);
            if concrete != name {
                self.known.insert(concrete);
            }
        }
        trace!(column = %name, variations = variations.len(), "registered");
        Ok(())
    }

    /// 用新的有效变化集合覆盖已知列的登记；未知时等同于 register_new
    pub fn update(&mut self, name: &str, variations: &BTreeSet<String>) -> Result<()> {
        if !self.known.contains(name) {
            let _guard = self.span.enter();
            debug!(column = %name, "column not known yet, registering");
            drop(_guard);
            return self.register_new(name, variations);
        }
        if !has_marker(name) {
            return Err(SystError::MissingMarker(name.into()));
        }
        self.require_declared(variations)?;

        let _guard = self.span.enter();
        let (removed, added) = self.relation.replace_right(&name.to_string(), variations);
        for v in &removed {
            debug!(column = %name, variation = %v, "variation no longer affects column");
        }
        for v in &added {
            debug!(column = %name, variation = %v, "variation now affects column");
            let concrete = marker_to(name, v);
            if concrete != name {
                self.known.insert(concrete);
            }
        }
        Ok(())
    }

    /// 单独登记一对 (列, 变化)，缺失的一侧自动声明
    pub fn add_single(&mut self, name: &str, variation: &str) -> Result<()> {
        if !has_marker(name) {
            return Err(SystError::MissingMarker(name.into()));
        }
        self.relation.link(variation.to_string(), name.to_string());
        self.known.insert(name.to_string());
        Ok(())
    }

    pub fn add_known(&mut self, name: &str) {
        self.known.insert(name.to_string());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.known.contains(name)
    }

    /// truth 树上的带标记列按仅名义登记：`tree.name` 总是登记，
    /// 裸名 `name` 仅在 reco 侧不存在时登记。已有登记项保持不变。
    pub fn add_truth_nominal(&mut self, tree: &str, names: &[String]) -> Result<()> {
        let nominal = NOMINAL.to_string();
        if !self.relation.contains_left(&nominal) {
            return Err(SystError::UnknownVariation(nominal));
        }
        for name in names.iter().filter(|n| has_marker(n)) {
            let qualified = format!("{tree}.{name}");
            if !self.relation.contains_right(&qualified) {
                self.relation.link(nominal.clone(), qualified);
            }
            if !self.known.contains(name) && !self.relation.contains_right(name) {
                self.relation.link(nominal.clone(), name.clone());
            }
        }
        Ok(())
    }

    // ── 查询 ──────────────────────────────────────────────────────────────────

    /// 带标记，或不含任何变化名的列视为名义列
    pub fn is_nominal_column(&self, name: &str) -> bool {
        is_nominal_among(name, &self.variations)
    }

    pub fn nominal_columns(&self, names: &[String]) -> Vec<String> {
        names.iter().filter(|n| self.is_nominal_column(n)).cloned().collect()
    }

    /// 同 `nominal_columns`，但按给定的变化名判断
    ///
    /// 仅名义样本的目录里只有 `NOSYS`，需要用分区元数据列出的全部变化名来识别变化列。
    pub fn nominal_columns_among(&self, names: &[String], variations: &[String]) -> Vec<String> {
        names.iter().filter(|n| is_nominal_among(n, variations)).cloned().collect()
    }

    pub fn affects(&self, variation: &str) -> Option<&BTreeSet<String>> {
        self.relation.rights_of(&variation.to_string())
    }

    pub fn affected_by(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.relation.lefts_of(&name.to_string())
    }

    pub fn known(&self) -> &BTreeSet<String> { &self.known }
    pub fn variations(&self) -> &[String] { &self.variations }
    pub fn options(&self) -> RegistryOptions { self.options }
    pub fn span(&self) -> &Span { &self.span }

    pub fn check_consistency(&self) -> Result<()> {
        self.relation.check_invariant().map_err(SystError::Inconsistent)
    }

    /// 按变化分组的完整映射（有序，供调试与测试）
    pub fn snapshot(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.relation.left_keys()
            .map(|v| (v.clone(), self.affects(v).cloned().unwrap_or_default()))
            .collect()
    }

    fn require_declared(&self, variations: &BTreeSet<String>) -> Result<()> {
        match variations.iter().find(|v| !self.relation.contains_left(v)) {
            Some(v) => Err(SystError::UnknownVariation(v.clone())),
            None    => Ok(()),
        }
    }

    fn trace_maps(&self) {
        for (v, names) in self.snapshot() {
            trace!(variation = %v, affects = ?names, "variation map");
        }
    }
}

fn is_nominal_among(name: &str, variations: &[String]) -> bool {
    if has_marker(name) {
        return true;
    }
    !variations.iter().any(|v| !v.is_empty() && name.contains(v.as_str()))
}

// ── 文本匹配 ──────────────────────────────────────────────────────────────────

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'.'
}

/// `needle` 在 `text` 中的起始位置（按模式过滤，互不重叠）
fn find_matches(text: &str, needle: &str, mode: MatchMode) -> Vec<usize> {
    if needle.is_empty() {
        return vec![];
    }
    let bytes = text.as_bytes();
    text.match_indices(needle)
        .map(|(i, _)| i)
        .filter(|&i| match mode {
            MatchMode::Substring => true,
            MatchMode::TokenBoundary => {
                let end = i + needle.len();
                let left_ok  = i == 0 || !is_ident_byte(bytes[i - 1]);
                let right_ok = end == bytes.len() || !is_ident_byte(bytes[end]);
                left_ok && right_ok
            }
        })
        .collect()
}

fn replace_matches(text: &str, needle: &str, to: &str, mode: MatchMode) -> String {
    let positions = find_matches(text, needle, mode);
    if positions.is_empty() {
        return text.to_string();
    }
    let mut out  = String::with_capacity(text.len());
    let mut last = 0usize;
    for start in positions {
        out.push_str(&text[last..start]);
        out.push_str(to);
        last = start + needle.len();
    }
    out.push_str(&text[last..]);
    out
}
