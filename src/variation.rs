//! 系统变化目录
//!
//! 每个逻辑样本一份，样本初始化时由配置与自动发现共同构建，之后只读。
//! 名义变化 `NOSYS` 总是存在且排在第一位。

use std::collections::{BTreeSet, HashMap};
use regex::Regex;
use tracing::{debug, Span};
use crate::common::{RegionId, Result, SystError, NOMINAL};
use crate::config::SampleConfig;

// ── Variation ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Variation {
    pub name:          String,
    pub is_nominal:    bool,
    /// sum-of-weights 表中的键
    pub weight_key:    String,
    pub weight_suffix: Option<String>,
    /// 适用区域；空集合表示所有区域
    pub regions:       BTreeSet<RegionId>,
}

impl Variation {
    pub fn new(name: &str, weight_key: &str) -> Self {
        Self {
            name:          name.into(),
            is_nominal:    name == NOMINAL,
            weight_key:    weight_key.into(),
            weight_suffix: None,
            regions:       BTreeSet::new(),
        }
    }

    pub fn nominal() -> Self {
        Self::new(NOMINAL, NOMINAL)
    }

    pub fn with_weight_suffix(mut self, suffix: &str) -> Self {
        self.weight_suffix = Some(suffix.into());
        self
    }

    pub fn with_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<RegionId>,
    {
        self.regions = regions.into_iter().map(Into::into).collect();
        self
    }

    pub fn applies_to(&self, region: &str) -> bool {
        self.regions.is_empty() || self.regions.contains(region)
    }
}

// ── VariationCatalog ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct VariationCatalog {
    variations: Vec<Variation>,
    by_name:    HashMap<String, usize>,
    span:       Span,
}

impl VariationCatalog {
    /// 仅含名义变化的目录
    pub fn new(span: Span) -> Self {
        let mut catalog = Self { variations: vec![], by_name: HashMap::new(), span };
        catalog.insert(Variation::nominal());
        catalog
    }

    /// 按配置构建；`nominal_only` 时只保留名义变化
    pub fn from_config(sample: &SampleConfig, span: Span) -> Self {
        let mut catalog = Self::new(span);
        if let Some(nominal) = catalog.variations.first_mut() {
            nominal.weight_key = sample.nominal_weight_key.clone();
        }
        if sample.nominal_only {
            return catalog;
        }
        for cfg in &sample.variations {
            if cfg.name == NOMINAL {
                if let Some(nominal) = catalog.variations.first_mut() {
                    nominal.weight_suffix = cfg.weight_suffix.clone();
                }
                continue;
            }
            let key = cfg.weight_key.clone()
                .unwrap_or_else(|| sample.nominal_weight_key.clone());
            let mut v = Variation::new(&cfg.name, &key);
            v.weight_suffix = cfg.weight_suffix.clone();
            if let Some(regions) = &cfg.regions {
                v = v.with_regions(regions.iter().cloned());
            }
            catalog.insert(v);
        }
        catalog
    }

    /// 插入变化；同名时保留先插入者，返回是否插入
    pub fn insert(&mut self, v: Variation) -> bool {
        if self.by_name.contains_key(&v.name) {
            return false;
        }
        self.by_name.insert(v.name.clone(), self.variations.len());
        self.variations.push(v);
        true
    }

    /// 从分区元数据里列出的变化名自动补充目录
    ///
    /// 跳过名义变化、被排除模式整串匹配的名字以及已存在的名字。
    /// 若 sum-of-weights 表中存在同名条目则以其为权重键，否则回落到名义键。
    pub fn discover(&mut self, listed: &[String], sample: &SampleConfig) -> Result<usize> {
        let span = self.span.clone();
        let _guard = span.enter();
        let excludes = compile_patterns(&sample.exclude_automatic)?;
        let mut added = 0usize;
        for name in listed {
            if name == NOMINAL || self.contains(name) {
                continue;
            }
            if excludes.iter().any(|re| re.is_match(name)) {
                debug!(variation = %name, "excluded from automatic variations");
                continue;
            }
            let key = if sample.sum_weights.contains_key(name) {
                name.as_str()
            } else {
                sample.nominal_weight_key.as_str()
            };
            if self.insert(Variation::new(name, key)) {
                added += 1;
            }
        }
        debug!(added, total = self.len(), "automatic variations discovered");
        Ok(added)
    }

    pub fn get(&self, name: &str) -> Option<&Variation> {
        self.by_name.get(name).map(|&i| &self.variations[i])
    }

    pub fn require(&self, name: &str) -> Result<&Variation> {
        self.get(name).ok_or_else(|| SystError::UnknownVariation(name.into()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variation> {
        self.variations.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.variations.iter().map(|v| v.name.clone()).collect()
    }

    pub fn len(&self) -> usize { self.variations.len() }
    pub fn is_empty(&self) -> bool { self.variations.is_empty() }

    pub fn span(&self) -> &Span { &self.span }
}

/// 排除模式按整串匹配编译
fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns.iter()
        .map(|p| {
            let anchored = format!("^(?:{p})$");
            Regex::new(&anchored).map_err(|e| SystError::InvalidPattern(format!("{p}: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VariationConfig;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn nominal_is_always_first() {
        let sample = SampleConfig::new("ttbar")
            .with_variation(VariationConfig::new("JET_PT_UP"))
            .with_variation(VariationConfig::new(NOMINAL).with_weight_suffix("k"));
        let catalog = VariationCatalog::from_config(&sample, Span::none());
        assert_eq!(catalog.names(), names(&["NOSYS", "JET_PT_UP"]));
        let nominal = catalog.require(NOMINAL).unwrap();
        assert!(nominal.is_nominal);
        assert_eq!(nominal.weight_suffix.as_deref(), Some("k"));
    }

    #[test]
    fn nominal_only_drops_configured_variations() {
        let sample = SampleConfig::new("data")
            .with_variation(VariationConfig::new("JET_PT_UP"))
            .nominal_only();
        let catalog = VariationCatalog::from_config(&sample, Span::none());
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn discover_applies_exclusions_and_weight_keys() {
        let sample = SampleConfig::new("ttbar")
            .with_sum_weights("NOSYS", 10.0)
            .with_sum_weights("GEN_MUR_UP", 12.0)
            .excluding("EG_.*");
        let mut catalog = VariationCatalog::from_config(&sample, Span::none());
        let listed = names(&["NOSYS", "GEN_MUR_UP", "JET_PT_UP", "EG_RES_UP", "JET_PT_UP"]);
        let added = catalog.discover(&listed, &sample).unwrap();
        assert_eq!(added, 2);
        assert_eq!(catalog.require("GEN_MUR_UP").unwrap().weight_key, "GEN_MUR_UP");
        assert_eq!(catalog.require("JET_PT_UP").unwrap().weight_key, "NOSYS");
        assert!(!catalog.contains("EG_RES_UP"));
    }

    #[test]
    fn bad_exclusion_pattern_is_reported() {
        let sample = SampleConfig::new("s").excluding("(");
        let mut catalog = VariationCatalog::new(Span::none());
        let err = catalog.discover(&names(&["A"]), &sample).unwrap_err();
        assert!(matches!(err, SystError::InvalidPattern(_)));
    }

    #[test]
    fn region_scope() {
        let v = Variation::new("SYS", NOMINAL).with_regions(["SR"]);
        assert!(v.applies_to("SR"));
        assert!(!v.applies_to("CR"));
        assert!(Variation::nominal().applies_to("CR"));
    }
}
