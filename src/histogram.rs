//! 直方图与等宽坐标轴

use serde::Deserialize;
use crate::common::{Result, SystError};

/// 等宽坐标轴，`nbins` 个区间覆盖 `[min, max)`
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Axis {
    pub nbins: usize,
    pub min:   f64,
    pub max:   f64,
}

impl Axis {
    pub fn new(nbins: usize, min: f64, max: f64) -> Self {
        Self { nbins, min, max }
    }

    pub fn validate(&self) -> Result<()> {
        if self.nbins == 0 || !(self.max > self.min) {
            return Err(SystError::Config(format!(
                "invalid axis ({}, {}, {})", self.nbins, self.min, self.max)));
        }
        Ok(())
    }

    /// 含溢出区间的总 bin 数
    pub fn len_with_flow(&self) -> usize { self.nbins + 2 }

    /// 0 为下溢，1..=nbins 为正常区间，nbins+1 为上溢；NaN 记入下溢
    pub fn locate(&self, x: f64) -> usize {
        if x.is_nan() || x < self.min {
            return 0;
        }
        if x >= self.max {
            return self.nbins + 1;
        }
        let width = (self.max - self.min) / self.nbins as f64;
        let bin = ((x - self.min) / width) as usize;
        bin.min(self.nbins - 1) + 1
    }
}

/// 含溢出区间的总 bin 数；溢出 usize 时报错
pub fn total_bins(axes: &[Axis]) -> Result<usize> {
    axes.iter().try_fold(1usize, |acc, a| {
        a.nbins.checked_add(2)
            .and_then(|n| acc.checked_mul(n))
            .ok_or_else(|| SystError::Config(format!("binning {axes:?} overflows")))
    })
}

// ── Histogram ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    pub axes:     Vec<Axis>,
    /// 行主序，第一根轴变化最快，含溢出区间
    pub contents: Vec<f64>,
    /// 每个 bin 的权重平方和
    pub sumw2:    Vec<f64>,
    pub entries:  u64,
}

impl Histogram {
    /// 1 到 3 根轴
    pub fn new(axes: Vec<Axis>) -> Result<Self> {
        if axes.is_empty() || axes.len() > 3 {
            return Err(SystError::Config(format!("histogram needs 1-3 axes, got {}", axes.len())));
        }
        for axis in &axes {
            axis.validate()?;
        }
        let size = total_bins(&axes)?;
        Ok(Self { axes, contents: vec![0.0; size], sumw2: vec![0.0; size], entries: 0 })
    }

    pub fn dimension(&self) -> usize { self.axes.len() }

    /// 各轴 bin 号 → 线性下标
    pub fn linear_index(&self, bins: &[usize]) -> Option<usize> {
        if bins.len() != self.axes.len() {
            return None;
        }
        let mut index  = 0usize;
        let mut stride = 1usize;
        for (axis, &b) in self.axes.iter().zip(bins) {
            if b >= axis.len_with_flow() {
                return None;
            }
            index  += b * stride;
            stride *= axis.len_with_flow();
        }
        Some(index)
    }

    pub fn fill(&mut self, coords: &[f64], weight: f64) {
        let bins: Vec<usize> = self.axes.iter().zip(coords).map(|(a, &x)| a.locate(x)).collect();
        if let Some(i) = self.linear_index(&bins) {
            self.contents[i] += weight;
            self.sumw2[i]    += weight * weight;
            self.entries     += 1;
        }
    }

    pub fn content(&self, bins: &[usize]) -> Option<f64> {
        self.linear_index(bins).map(|i| self.contents[i])
    }

    pub fn error_squared(&self, bins: &[usize]) -> Option<f64> {
        self.linear_index(bins).map(|i| self.sumw2[i])
    }

    /// 全部 bin（含溢出）之和
    pub fn integral(&self) -> f64 {
        self.contents.iter().sum()
    }

    pub fn same_binning(&self, other: &Histogram) -> bool {
        self.axes == other.axes && self.contents.len() == other.contents.len()
    }

    /// 逐 bin 相加内容与权重平方和
    pub fn add(&mut self, other: &Histogram) -> Result<()> {
        if !self.same_binning(other) {
            return Err(SystError::ShapeMismatch(format!(
                "histogram axes {:?} vs {:?}", self.axes, other.axes)));
        }
        for (a, b) in self.contents.iter_mut().zip(&other.contents) {
            *a += b;
        }
        for (a, b) in self.sumw2.iter_mut().zip(&other.sumw2) {
            *a += b;
        }
        self.entries += other.entries;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_handles_flow_bins() {
        let axis = Axis::new(4, 0.0, 4.0);
        assert_eq!(axis.locate(-1.0), 0);
        assert_eq!(axis.locate(0.0), 1);
        assert_eq!(axis.locate(3.999), 4);
        assert_eq!(axis.locate(4.0), 5);
        assert_eq!(axis.locate(f64::NAN), 0);
    }

    #[test]
    fn fill_2d_and_add() {
        let mut h = Histogram::new(vec![Axis::new(2, 0.0, 2.0), Axis::new(3, 0.0, 3.0)]).unwrap();
        h.fill(&[0.5, 2.5], 2.0);
        h.fill(&[0.5, 2.5], 1.0);
        assert_eq!(h.content(&[1, 3]), Some(3.0));
        assert_eq!(h.error_squared(&[1, 3]), Some(5.0));

        let other = h.clone();
        h.add(&other).unwrap();
        assert_eq!(h.content(&[1, 3]), Some(6.0));
        assert_eq!(h.entries, 4);
    }

    #[test]
    fn add_rejects_different_axes() {
        let mut a = Histogram::new(vec![Axis::new(2, 0.0, 2.0)]).unwrap();
        let b = Histogram::new(vec![Axis::new(3, 0.0, 2.0)]).unwrap();
        assert!(matches!(a.add(&b), Err(SystError::ShapeMismatch(_))));
    }

    #[test]
    fn rejects_bad_axes() {
        let huge = Axis::new(usize::MAX / 2, 0.0, 1.0);
        assert!(matches!(Histogram::new(vec![huge, huge]), Err(SystError::Config(_))));
        assert!(Histogram::new(vec![]).is_err());
        assert!(Histogram::new(vec![Axis::new(0, 0.0, 1.0)]).is_err());
        assert!(Histogram::new(vec![Axis::new(1, 1.0, 1.0)]).is_err());
    }
}
