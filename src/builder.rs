//! ColumnGraphBuilder：按登记表把名义定义展开为逐变化的副本
//!
//! ```text
//!   define("jet_e_NOSYS", f, [jet_pt_NOSYS, jet_eta])
//!        │
//!        ├─ effective = { NOSYS, JET_PT_UP }
//!        ├─ engine.define(jet_e_NOSYS,     f, [jet_pt_NOSYS,     jet_eta])
//!        ├─ engine.define(jet_e_JET_PT_UP, f, [jet_pt_JET_PT_UP, jet_eta])
//!        └─ registry.register_new(jet_e_NOSYS, effective)
//! ```
//!
//! 只构图不执行。

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn, Span};
use crate::common::{
    has_marker, marker_to, nominal_weight_column, Result, SystError, NOMINAL, WEIGHT_PREFIX,
};
use crate::config::SampleConfig;
use crate::engine::{ExecutionEngine, Transform};
use crate::registry::AffectedColumnRegistry;
use crate::variation::VariationCatalog;

/// 权重归一化参数
#[derive(Debug, Clone)]
pub struct Normalisation {
    pub is_data:       bool,
    pub luminosity:    f64,
    pub cross_section: f64,
    pub sum_weights:   BTreeMap<String, f64>,
}

impl Normalisation {
    pub fn data() -> Self {
        Self { is_data: true, luminosity: 1.0, cross_section: 1.0, sum_weights: BTreeMap::new() }
    }

    pub fn from_sample(sample: &SampleConfig) -> Self {
        Self {
            is_data:       sample.is_data,
            luminosity:    sample.luminosity,
            cross_section: sample.cross_section,
            sum_weights:   sample.sum_weights.clone(),
        }
    }

    /// `lumi * xsec / sumw[key]`；数据恒为 1
    pub fn factor(&self, weight_key: &str) -> Result<f64> {
        if self.is_data {
            return Ok(1.0);
        }
        let sumw = self.sum_weights.get(weight_key)
            .copied()
            .ok_or_else(|| SystError::MissingSumWeights(weight_key.into()))?;
        Ok(self.luminosity * self.cross_section / sumw)
    }
}

pub struct ColumnGraphBuilder<E: ExecutionEngine> {
    registry: AffectedColumnRegistry,
    engine:   E,
    span:     Span,
}

impl<E: ExecutionEngine> ColumnGraphBuilder<E> {
    pub fn new(registry: AffectedColumnRegistry, engine: E, span: Span) -> Self {
        Self { registry, engine, span }
    }

    pub fn registry(&self) -> &AffectedColumnRegistry { &self.registry }
    pub fn registry_mut(&mut self) -> &mut AffectedColumnRegistry { &mut self.registry }
    pub fn engine(&self) -> &E { &self.engine }
    pub fn engine_mut(&mut self) -> &mut E { &mut self.engine }

    pub fn into_parts(self) -> (AffectedColumnRegistry, E) {
        (self.registry, self.engine)
    }

    // ── 闭包定义 ──────────────────────────────────────────────────────────────

    /// 定义名义列以及所有有效变化下的副本，返回实际定义的列名
    pub fn define(
        &mut self,
        name:         &str,
        transform:    Transform,
        dependencies: &[String],
    ) -> Result<Vec<String>> {
        if !has_marker(name) {
            return Err(SystError::MissingMarker(name.into()));
        }
        let effective = self.registry.effective_variations(dependencies)?;
        let _guard = self.span.enter();

        self.engine.define(name, transform.clone(), dependencies)?;
        let mut defined = vec![name.to_string()];
        for v in effective.iter().filter(|v| v.as_str() != NOMINAL) {
            let variant = marker_to(name, v);
            let deps    = self.registry.substitute_all(dependencies, v)?;
            self.engine.define(&variant, transform.clone(), &deps)?;
            defined.push(variant);
        }
        self.registry.register_new(name, &effective)?;
        debug!(column = %name, variants = defined.len() - 1, "defined");
        Ok(defined)
    }

    /// 替换已有列的定义；引擎中没有该列时等同于 define
    pub fn redefine(
        &mut self,
        name:         &str,
        transform:    Transform,
        dependencies: &[String],
    ) -> Result<Vec<String>> {
        if !self.engine.has_column(name) {
            return self.define(name, transform, dependencies);
        }
        if !has_marker(name) {
            return Err(SystError::MissingMarker(name.into()));
        }
        let effective = self.registry.effective_variations(dependencies)?;
        let _guard = self.span.enter();

        self.engine.redefine(name, transform.clone(), dependencies)?;
        let mut defined = vec![name.to_string()];
        for v in effective.iter().filter(|v| v.as_str() != NOMINAL) {
            let variant = marker_to(name, v);
            let deps    = self.registry.substitute_all(dependencies, v)?;
            if self.engine.has_column(&variant) {
                self.engine.redefine(&variant, transform.clone(), &deps)?;
            } else {
                self.engine.define(&variant, transform.clone(), &deps)?;
            }
            defined.push(variant);
        }
        self.registry.update(name, &effective)?;
        debug!(column = %name, variants = defined.len() - 1, "redefined");
        Ok(defined)
    }

    /// 任一依赖未登记或引擎中不存在时只告警，不定义任何列
    pub fn define_if_available(
        &mut self,
        name:         &str,
        transform:    Transform,
        dependencies: &[String],
    ) -> Result<Vec<String>> {
        let missing = dependencies.iter().find(|d| {
            let registered = self.registry.contains(d) || self.registry.affected_by(d).is_some();
            !registered || !self.engine.has_column(d)
        });
        if let Some(dep) = missing {
            let _guard = self.span.enter();
            warn!(column = %name, dependency = %dep, "dependency not available, column not defined");
            return Ok(vec![]);
        }
        self.define(name, transform, dependencies)
    }

    // ── 字符串表达式定义 ──────────────────────────────────────────────────────

    /// 以表达式定义；依赖由表达式中出现的已登记列名推断
    pub fn string_define(&mut self, name: &str, expression: &str) -> Result<Vec<String>> {
        if !has_marker(name) {
            return Err(SystError::MissingMarker(name.into()));
        }
        let dependencies = self.registry.substrings_present(expression);
        let effective    = self.registry.effective_variations(&dependencies)?;
        let _guard = self.span.enter();

        self.engine.define(name, Transform::expression(expression), &dependencies)?;
        let mut defined = vec![name.to_string()];
        for v in effective.iter().filter(|v| v.as_str() != NOMINAL) {
            let variant = marker_to(name, v);
            let expr    = self.registry.substitute(expression, v)?;
            let deps    = self.registry.substitute_all(&dependencies, v)?;
            self.engine.define(&variant, Transform::expression(&expr), &deps)?;
            defined.push(variant);
        }
        self.registry.register_new(name, &effective)?;
        debug!(column = %name, expression, variants = defined.len() - 1, "string defined");
        Ok(defined)
    }

    pub fn string_redefine(&mut self, name: &str, expression: &str) -> Result<Vec<String>> {
        if !self.engine.has_column(name) {
            return self.string_define(name, expression);
        }
        if !has_marker(name) {
            return Err(SystError::MissingMarker(name.into()));
        }
        let dependencies = self.registry.substrings_present(expression);
        let effective    = self.registry.effective_variations(&dependencies)?;
        let _guard = self.span.enter();

        self.engine.redefine(name, Transform::expression(expression), &dependencies)?;
        let mut defined = vec![name.to_string()];
        for v in effective.iter().filter(|v| v.as_str() != NOMINAL) {
            let variant = marker_to(name, v);
            let expr    = Transform::expression(&self.registry.substitute(expression, v)?);
            let deps    = self.registry.substitute_all(&dependencies, v)?;
            if self.engine.has_column(&variant) {
                self.engine.redefine(&variant, expr, &deps)?;
            } else {
                self.engine.define(&variant, expr, &deps)?;
            }
            defined.push(variant);
        }
        self.registry.update(name, &effective)?;
        debug!(column = %name, expression, variants = defined.len() - 1, "string redefined");
        Ok(defined)
    }

    // ── 选择条件与权重 ────────────────────────────────────────────────────────

    pub fn variation_selection(&self, selection: &str, variation: &str) -> Result<String> {
        self.registry.substitute(selection, variation)
    }

    /// 变化的总权重列；该变化没有独立权重列时使用名义权重列
    pub fn weight_column(&self, variation: &str) -> String {
        let column = format!("{WEIGHT_PREFIX}{variation}");
        if self.registry.contains(&column) {
            column
        } else {
            nominal_weight_column()
        }
    }

    /// 为目录中每个变化定义 `weight_total_<变化>`
    ///
    /// 公式为 `(权重表达式)*(归一化因子)`，变化带权重后缀时再整体乘上后缀。
    /// 非名义变化的公式与名义公式逐字相同时不建列，由名义权重列代替。
    pub fn add_weight_columns(
        &mut self,
        weight:        &str,
        normalisation: &Normalisation,
        catalog:       &VariationCatalog,
    ) -> Result<Vec<String>> {
        let nominal         = catalog.require(NOMINAL)?;
        let nominal_column  = nominal_weight_column();
        let nominal_formula = weight_formula(
            &self.registry.substitute(weight, NOMINAL)?,
            normalisation.factor(&nominal.weight_key)?,
            nominal.weight_suffix.as_deref().filter(|s| !s.is_empty()),
        );

        let mut defined = Vec::new();
        for v in catalog.iter() {
            let substituted = self.registry.substitute(weight, &v.name)?;
            let suffix      = v.weight_suffix.as_deref().filter(|s| !s.is_empty());
            let formula     = weight_formula(&substituted, normalisation.factor(&v.weight_key)?, suffix);
            let _guard = self.span.enter();
            if !v.is_nominal && formula == nominal_formula {
                debug!(variation = %v.name, "weight identical to nominal, no column");
                continue;
            }
            let column = format!("{WEIGHT_PREFIX}{}", v.name);
            if self.engine.has_column(&column) {
                debug!(column = %column, "weight column already present");
                continue;
            }
            self.engine.define(&column, Transform::expression(&formula), &[])?;
            self.registry.add_known(&column);
            self.registry.add_single(&nominal_column, &v.name)?;
            debug!(column = %column, formula = %formula, "weight column defined");
            defined.push(column);
        }
        Ok(defined)
    }

    /// 名义选择与所有不同的变化选择取或（ntuple 预筛选）
    pub fn or_selection(&self, selection: &str, catalog: &VariationCatalog) -> Result<String> {
        let mut seen  = BTreeSet::new();
        let mut parts = Vec::new();
        for v in catalog.iter() {
            let sel = self.registry.substitute(selection, &v.name)?;
            if seen.insert(sel.clone()) {
                parts.push(sel);
            }
        }
        Ok(match parts.len() {
            0 | 1 => selection.to_string(),
            _ => parts.iter().map(|p| format!("({p})")).collect::<Vec<_>>().join(" || "),
        })
    }
}

fn weight_formula(weight: &str, factor: f64, suffix: Option<&str>) -> String {
    let formula = format!("({weight})*({factor})");
    match suffix {
        Some(suffix) => format!("({formula})*({suffix})"),
        None         => formula,
    }
}
