//! 处理配置
//!
//! 配置文件的格式不在本 crate 范围内；这里只定义类型化的配置结构，
//! 既可以用 `with_*` 方法在代码里拼装，也可以从 JSON 反序列化。

use std::collections::BTreeMap;
use serde::Deserialize;
use crate::histogram::Axis;
use crate::common::{MatchMode, Result, SuffixPolicy, SystError, NOMINAL};
use crate::partition::JobSplit;

// ── 变化 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct VariationConfig {
    pub name:          String,
    /// sum-of-weights 键；缺省时使用样本的名义键
    #[serde(default)]
    pub weight_key:    Option<String>,
    /// 额外乘到总权重上的表达式
    #[serde(default)]
    pub weight_suffix: Option<String>,
    /// 适用的区域；缺省表示全部区域
    #[serde(default)]
    pub regions:       Option<Vec<String>>,
}

impl VariationConfig {
    pub fn new(name: &str) -> Self {
        Self { name: name.into(), weight_key: None, weight_suffix: None, regions: None }
    }

    pub fn with_weight_key(mut self, key: &str) -> Self {
        self.weight_key = Some(key.into()); self
    }
    pub fn with_weight_suffix(mut self, suffix: &str) -> Self {
        self.weight_suffix = Some(suffix.into()); self
    }
    pub fn with_regions(mut self, regions: &[&str]) -> Self {
        self.regions = Some(regions.iter().map(|r| r.to_string()).collect()); self
    }
}

// ── 区域 / 变量 ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct VariableConfig {
    pub name:         String,
    /// 被填充的列（名义形式）
    pub definition:   String,
    pub axis:         Axis,
    #[serde(default)]
    pub nominal_only: bool,
}

impl VariableConfig {
    pub fn new(name: &str, definition: &str, axis: Axis) -> Self {
        Self { name: name.into(), definition: definition.into(), axis, nominal_only: false }
    }
    pub fn nominal_only(mut self) -> Self {
        self.nominal_only = true; self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegionConfig {
    pub name:            String,
    pub selection:       String,
    #[serde(default)]
    pub variables:       Vec<VariableConfig>,
    #[serde(default)]
    pub combinations_2d: Vec<(String, String)>,
    #[serde(default)]
    pub combinations_3d: Vec<(String, String, String)>,
}

impl RegionConfig {
    pub fn new(name: &str, selection: &str) -> Self {
        Self {
            name: name.into(), selection: selection.into(),
            variables: vec![], combinations_2d: vec![], combinations_3d: vec![],
        }
    }

    pub fn with_variable(mut self, v: VariableConfig) -> Self {
        self.variables.push(v); self
    }
    pub fn with_2d(mut self, x: &str, y: &str) -> Self {
        self.combinations_2d.push((x.into(), y.into())); self
    }
    pub fn with_3d(mut self, x: &str, y: &str, z: &str) -> Self {
        self.combinations_3d.push((x.into(), y.into(), z.into())); self
    }

    pub fn variable(&self, name: &str) -> Result<&VariableConfig> {
        self.variables.iter()
            .find(|v| v.name == name)
            .ok_or_else(|| SystError::Config(
                format!("region {} has no variable {name}", self.name)))
    }
}

// ── 样本 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CutflowSelection {
    pub selection: String,
    pub title:     String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CutflowConfig {
    pub name:       String,
    pub selections: Vec<CutflowSelection>,
}

impl CutflowConfig {
    pub fn new(name: &str) -> Self {
        Self { name: name.into(), selections: vec![] }
    }
    pub fn with_stage(mut self, selection: &str, title: &str) -> Self {
        self.selections.push(CutflowSelection { selection: selection.into(), title: title.into() });
        self
    }
}

/// 以字符串表达式新增的列
#[derive(Debug, Clone, Deserialize)]
pub struct DefineConfig {
    pub name:    String,
    pub formula: String,
}

fn default_weight() -> String { "1".into() }
fn default_nominal_key() -> String { NOMINAL.into() }
fn default_one() -> f64 { 1.0 }

#[derive(Debug, Clone, Deserialize)]
pub struct SampleConfig {
    pub name:                 String,
    /// 名义事件权重表达式
    #[serde(default = "default_weight")]
    pub weight:               String,
    #[serde(default)]
    pub selection_suffix:     Option<String>,
    #[serde(default)]
    pub is_data:              bool,
    #[serde(default = "default_one")]
    pub luminosity:           f64,
    #[serde(default = "default_one")]
    pub cross_section:        f64,
    #[serde(default = "default_nominal_key")]
    pub nominal_weight_key:   String,
    /// weight_key → sum of weights
    #[serde(default)]
    pub sum_weights:          BTreeMap<String, f64>,
    /// 使用的区域名；为空表示全部区域
    #[serde(default)]
    pub regions:              Vec<String>,
    /// 允许填充的变量名；None 表示全部
    #[serde(default)]
    pub variables:            Option<Vec<String>>,
    #[serde(default)]
    pub variations:           Vec<VariationConfig>,
    #[serde(default)]
    pub automatic_variations: bool,
    #[serde(default)]
    pub nominal_only:         bool,
    /// 自动发现时排除的变化名（正则，整串匹配）
    #[serde(default)]
    pub exclude_automatic:    Vec<String>,
    #[serde(default)]
    pub defines:              Vec<DefineConfig>,
    #[serde(default)]
    pub cutflows:             Vec<CutflowConfig>,
    /// ntuple 输出的名义预筛选
    #[serde(default)]
    pub ntuple_selection:     Option<String>,
}

impl SampleConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            weight: default_weight(),
            selection_suffix: None,
            is_data: false,
            luminosity: 1.0,
            cross_section: 1.0,
            nominal_weight_key: default_nominal_key(),
            sum_weights: BTreeMap::new(),
            regions: vec![],
            variables: None,
            variations: vec![],
            automatic_variations: false,
            nominal_only: false,
            exclude_automatic: vec![],
            defines: vec![],
            cutflows: vec![],
            ntuple_selection: None,
        }
    }

    pub fn with_weight(mut self, weight: &str) -> Self {
        self.weight = weight.into(); self
    }
    pub fn with_selection_suffix(mut self, suffix: &str) -> Self {
        self.selection_suffix = Some(suffix.into()); self
    }
    pub fn with_normalisation(mut self, luminosity: f64, cross_section: f64) -> Self {
        self.luminosity = luminosity;
        self.cross_section = cross_section;
        self
    }
    pub fn with_sum_weights(mut self, key: &str, value: f64) -> Self {
        self.sum_weights.insert(key.into(), value); self
    }
    pub fn with_variation(mut self, v: VariationConfig) -> Self {
        self.variations.push(v); self
    }
    pub fn with_define(mut self, name: &str, formula: &str) -> Self {
        self.defines.push(DefineConfig { name: name.into(), formula: formula.into() });
        self
    }
    pub fn with_cutflow(mut self, c: CutflowConfig) -> Self {
        self.cutflows.push(c); self
    }
    pub fn with_ntuple_selection(mut self, selection: &str) -> Self {
        self.ntuple_selection = Some(selection.into()); self
    }
    pub fn with_variables(mut self, names: &[&str]) -> Self {
        self.variables = Some(names.iter().map(|n| n.to_string()).collect()); self
    }
    pub fn automatic(mut self) -> Self {
        self.automatic_variations = true; self
    }
    pub fn excluding(mut self, pattern: &str) -> Self {
        self.exclude_automatic.push(pattern.into()); self
    }
    pub fn data(mut self) -> Self {
        self.is_data = true; self
    }
    pub fn nominal_only(mut self) -> Self {
        self.nominal_only = true; self
    }

    /// 区域是否被本样本使用
    pub fn uses_region(&self, region: &str) -> bool {
        self.regions.is_empty() || self.regions.iter().any(|r| r == region)
    }

    pub fn uses_variable(&self, variable: &str) -> bool {
        self.variables.as_ref()
            .map(|vs| vs.iter().any(|v| v == variable))
            .unwrap_or(true)
    }

    /// 名义选择条件加上样本后缀：`(sel) && (suffix)`
    pub fn full_selection(&self, selection: &str) -> String {
        match &self.selection_suffix {
            Some(suffix) if !suffix.is_empty() => format!("({selection}) && ({suffix})"),
            _ => selection.to_string(),
        }
    }
}

// ── 运行选项 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunOptions {
    /// 写出时每个区域单独一个子目录
    #[serde(default)]
    pub region_subfolders:   bool,
    /// 配置里的 define 放在用户 hook 之后执行
    #[serde(default)]
    pub defines_after_hooks: bool,
    #[serde(default)]
    pub match_mode:          MatchMode,
    #[serde(default)]
    pub suffix_policy:       SuffixPolicy,
    #[serde(default)]
    pub job_split:           Option<JobSplit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    pub regions: Vec<RegionConfig>,
    pub samples: Vec<SampleConfig>,
    #[serde(default)]
    pub options: RunOptions,
}

impl ProcessConfig {
    pub fn new(regions: Vec<RegionConfig>, samples: Vec<SampleConfig>) -> Self {
        Self { regions, samples, options: RunOptions::default() }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options; self
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| SystError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 引用的区域与变量组合必须存在
    pub fn validate(&self) -> Result<()> {
        for sample in &self.samples {
            for r in &sample.regions {
                if !self.regions.iter().any(|reg| &reg.name == r) {
                    return Err(SystError::Config(
                        format!("sample {} uses unknown region {r}", sample.name)));
                }
            }
        }
        for region in &self.regions {
            for v in &region.variables {
                v.axis.validate()?;
            }
            for (x, y) in &region.combinations_2d {
                region.variable(x)?;
                region.variable(y)?;
            }
            for (x, y, z) in &region.combinations_3d {
                region.variable(x)?;
                region.variable(y)?;
                region.variable(z)?;
            }
        }
        if let Some(split) = &self.options.job_split {
            split.validate()?;
        }
        Ok(())
    }

    pub fn sample(&self, name: &str) -> Result<&SampleConfig> {
        self.samples.iter()
            .find(|s| s.name == name)
            .ok_or_else(|| SystError::Config(format!("unknown sample {name}")))
    }

    /// 某个样本实际使用的区域（按配置顺序）
    pub fn regions_for(&self, sample: &SampleConfig) -> Vec<RegionConfig> {
        self.regions.iter()
            .filter(|r| sample.uses_region(&r.name))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "regions": [
            { "name": "SR", "selection": "njet_NOSYS >= 4",
              "variables": [
                  { "name": "jet_pt", "definition": "jet_pt_NOSYS",
                    "axis": { "nbins": 10, "min": 0.0, "max": 500.0 } },
                  { "name": "met", "definition": "met_NOSYS",
                    "axis": { "nbins": 5, "min": 0.0, "max": 250.0 }, "nominal_only": true }
              ],
              "combinations_2d": [["jet_pt", "met"]] }
        ],
        "samples": [
            { "name": "ttbar", "weight": "weight_mc_NOSYS",
              "sum_weights": { "NOSYS": 1000.0 },
              "variations": [ { "name": "JET_PT_UP" } ],
              "exclude_automatic": ["^EG_.*"] }
        ],
        "options": { "region_subfolders": true, "match_mode": "TokenBoundary" }
    }"#;

    #[test]
    fn parses_json_with_defaults() {
        let cfg = ProcessConfig::from_json(CONFIG).unwrap();
        let sample = cfg.sample("ttbar").unwrap();
        assert_eq!(sample.nominal_weight_key, "NOSYS");
        assert_eq!(sample.luminosity, 1.0);
        assert!(sample.uses_region("SR"));
        assert_eq!(cfg.regions_for(sample).len(), 1);
        assert!(cfg.options.region_subfolders);
        assert_eq!(cfg.options.match_mode, MatchMode::TokenBoundary);
        assert_eq!(cfg.options.suffix_policy, SuffixPolicy::Reject);
        assert!(cfg.regions[0].variables[1].nominal_only);
    }

    #[test]
    fn rejects_unknown_region_reference() {
        let text = CONFIG.replace(r#""name": "ttbar","#, r#""name": "ttbar", "regions": ["CR"],"#);
        assert!(matches!(ProcessConfig::from_json(&text), Err(SystError::Config(_))));
    }

    #[test]
    fn full_selection_appends_suffix() {
        let s = SampleConfig::new("s").with_selection_suffix("flag == 1");
        assert_eq!(s.full_selection("x > 1"), "(x > 1) && (flag == 1)");
        assert_eq!(SampleConfig::new("t").full_selection("x > 1"), "x > 1");
    }
}
