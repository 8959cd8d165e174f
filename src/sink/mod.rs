//! 输出：按目录分层的键值存储
//!
//! ```text
//!   ""                 Cutflow_<name> ...
//!   NOSYS/             <量名去掉 _NOSYS>_<区域> ...
//!   JES_UP/            ...
//!   NOSYS/SR/          （region_subfolders 时）
//! ```
//!
//! 同一键的对象在 `merge_store` 时相加，对应作业输出的合并。

pub mod codec;
pub mod compression;

use std::collections::BTreeMap;
use tracing::{debug, warn, Span};
use crate::aggregation::{Cutflow, Payload, ResultTree};
use crate::common::{strip_marker, Result, SystError};
use crate::histogram::Histogram;

pub use compression::Codec;

#[derive(Debug, Clone, PartialEq)]
pub enum StoredObject {
    Histogram(Histogram),
    Cutflow(Cutflow),
}

impl StoredObject {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Histogram(_) => "histogram",
            Self::Cutflow(_)   => "cutflow",
        }
    }

    fn add(&mut self, other: &StoredObject) -> Result<()> {
        match (self, other) {
            (Self::Histogram(a), Self::Histogram(b)) => a.add(b),
            (Self::Cutflow(a), Self::Cutflow(b))     => a.add(b),
            (a, b) => Err(SystError::ShapeMismatch(format!(
                "cannot add {} to {}", b.kind(), a.kind()))),
        }
    }
}

/// 写出选项
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// 每个区域单独一层子目录
    pub region_subfolders: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyedStore {
    /// (目录, 对象名) → 对象
    entries: BTreeMap<(String, String), StoredObject>,
}

impl KeyedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入对象；同一键已存在时报错
    pub fn put(&mut self, dir: &str, name: &str, object: StoredObject) -> Result<()> {
        let key = (dir.to_string(), name.to_string());
        if self.entries.contains_key(&key) {
            return Err(SystError::Sink(format!("duplicate key {dir}/{name}")));
        }
        self.entries.insert(key, object);
        Ok(())
    }

    pub fn get(&self, dir: &str, name: &str) -> Option<&StoredObject> {
        self.entries.get(&(dir.to_string(), name.to_string()))
    }

    pub fn histogram(&self, dir: &str, name: &str) -> Option<&Histogram> {
        match self.get(dir, name)? {
            StoredObject::Histogram(h) => Some(h),
            StoredObject::Cutflow(_)   => None,
        }
    }

    pub fn cutflow(&self, name: &str) -> Option<&Cutflow> {
        match self.get("", name)? {
            StoredObject::Cutflow(c)   => Some(c),
            StoredObject::Histogram(_) => None,
        }
    }

    /// 全部非空目录，有序
    pub fn directories(&self) -> Vec<&str> {
        let mut dirs: Vec<&str> = self.entries.keys().map(|(d, _)| d.as_str()).collect();
        dirs.dedup();
        dirs
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &StoredObject)> {
        self.entries.iter().map(|((d, n), o)| (d.as_str(), n.as_str(), o))
    }

    pub fn encode(&self, codec: Codec) -> Result<Vec<u8>> {
        codec::encode(self, codec)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        codec::decode(data)
    }
}

/// 把另一个存储并入 `acc`：同键相加，新键插入
///
/// 任何一个同键对象形状不符时 `acc` 保持不变。
pub fn merge_store(acc: &mut KeyedStore, other: &KeyedStore) -> Result<()> {
    for (key, object) in &other.entries {
        if let Some(existing) = acc.entries.get(key) {
            let mut trial = existing.clone();
            trial.add(object)?;
        }
    }
    for (key, object) in &other.entries {
        match acc.entries.get_mut(key) {
            Some(existing) => existing.add(object)?,
            None           => { acc.entries.insert(key.clone(), object.clone()); }
        }
    }
    Ok(())
}

/// 把物化后的结果树写入存储
///
/// 没有任何区域的变化跳过并记 WARN；含 Pending 结果时报 `NotMaterialized`。
pub fn write_tree(
    tree:    &ResultTree,
    store:   &mut KeyedStore,
    options: WriteOptions,
    span:    &Span,
) -> Result<usize> {
    let _guard = span.enter();
    if let Some(pending) = tree.first_pending() {
        return Err(SystError::NotMaterialized(pending.to_string()));
    }

    let mut written = 0;
    for cutflow in &tree.cutflows {
        if let Payload::Cutflow(lazy) = &cutflow.payload {
            if let Some(c) = lazy.value() {
                store.put("", &format!("Cutflow_{}", cutflow.name), StoredObject::Cutflow(c.clone()))?;
                written += 1;
            }
        }
    }

    for variation in &tree.variations {
        if variation.regions.is_empty() {
            warn!(sample = %tree.sample, variation = %variation.name, "variation has no regions, not written");
            continue;
        }
        for region in &variation.regions {
            let dir = if options.region_subfolders {
                format!("{}/{}", variation.name, region.name)
            } else {
                variation.name.clone()
            };
            for result in &region.results {
                let Some(h) = result.as_histogram() else { continue };
                let name = format!("{}_{}", strip_marker(&result.name), region.name);
                store.put(&dir, &name, StoredObject::Histogram(h.clone()))?;
                written += 1;
            }
        }
    }
    debug!(sample = %tree.sample, objects = written, "tree written");
    Ok(written)
}
