//! 双向二部关系（左 ↔ 右）
//!
//! 两个方向各一张邻接表，所有修改都经由本类型完成，保证：
//!
//! ```text
//!   r ∈ left[l]  ⇔  l ∈ right[r]
//! ```
//!
//! 键可以对应空集合：声明过但暂无关联的一侧同样是可观察状态
//! （例如不影响任何列的变化、不受任何变化影响的列）。

use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::hash::Hash;

pub trait RelationKey: Clone + Eq + Hash + Ord + Debug {}
impl<T: Clone + Eq + Hash + Ord + Debug> RelationKey for T {}

#[derive(Debug, Clone)]
pub struct BipartiteRelation<L: RelationKey, R: RelationKey> {
    // l → { r, ... }
    left:  HashMap<L, BTreeSet<R>>,
    // r → { l, ... }
    right: HashMap<R, BTreeSet<L>>,
}

impl<L: RelationKey, R: RelationKey> Default for BipartiteRelation<L, R> {
    fn default() -> Self {
        Self { left: HashMap::new(), right: HashMap::new() }
    }
}

impl<L: RelationKey, R: RelationKey> BipartiteRelation<L, R> {
    pub fn new() -> Self { Self::default() }

    // ── 声明 ──────────────────────────────────────────────────────────────────

    pub fn declare_left(&mut self, l: L) {
        self.left.entry(l).or_default();
    }

    pub fn declare_right(&mut self, r: R) {
        self.right.entry(r).or_default();
    }

    // ── 增删边 ────────────────────────────────────────────────────────────────

    /// 建立一条边，两端不存在时自动声明；返回是否为新边
    pub fn link(&mut self, l: L, r: R) -> bool {
        let fresh = self.left.entry(l.clone()).or_default().insert(r.clone());
        self.right.entry(r).or_default().insert(l);
        fresh
    }

    /// 删除一条边，两端的键保留（可能变为空集合）
    pub fn unlink(&mut self, l: &L, r: &R) -> bool {
        let removed = self.left.get_mut(l).map(|rs| rs.remove(r)).unwrap_or(false);
        if let Some(ls) = self.right.get_mut(r) {
            ls.remove(l);
        }
        removed
    }

    /// 用 `lefts` 整体覆盖 `r` 的邻接集合，返回 (移除的, 新增的)
    pub fn replace_right(
        &mut self,
        r:     &R,
        lefts: &BTreeSet<L>,
    ) -> (Vec<L>, Vec<L>) {
        let current = self.right.get(r).cloned().unwrap_or_default();
        let removed: Vec<L> = current.difference(lefts).cloned().collect();
        let added:   Vec<L> = lefts.difference(&current).cloned().collect();

        for l in &removed {
            self.unlink(l, r);
        }
        for l in &added {
            self.link(l.clone(), r.clone());
        }
        self.declare_right(r.clone());
        (removed, added)
    }

    // ── 查询 ──────────────────────────────────────────────────────────────────

    pub fn rights_of(&self, l: &L) -> Option<&BTreeSet<R>> { self.left.get(l) }
    pub fn lefts_of(&self, r: &R)  -> Option<&BTreeSet<L>> { self.right.get(r) }

    pub fn contains_left(&self, l: &L)  -> bool { self.left.contains_key(l) }
    pub fn contains_right(&self, r: &R) -> bool { self.right.contains_key(r) }

    pub fn linked(&self, l: &L, r: &R) -> bool {
        self.left.get(l).map(|rs| rs.contains(r)).unwrap_or(false)
    }

    pub fn left_keys(&self)  -> impl Iterator<Item = &L> { self.left.keys() }
    pub fn right_keys(&self) -> impl Iterator<Item = &R> { self.right.keys() }

    pub fn edge_count(&self) -> usize {
        self.left.values().map(|rs| rs.len()).sum()
    }

    /// 校验两个方向完全一致；返回第一处不一致的描述
    pub fn check_invariant(&self) -> std::result::Result<(), String> {
        for (l, rs) in &self.left {
            for r in rs {
                let back = self.right.get(r).map(|ls| ls.contains(l)).unwrap_or(false);
                if !back {
                    return Err(format!("{l:?} → {r:?} has no reverse edge"));
                }
            }
        }
        for (r, ls) in &self.right {
            for l in ls {
                let fwd = self.left.get(l).map(|rs| rs.contains(r)).unwrap_or(false);
                if !fwd {
                    return Err(format!("{r:?} → {l:?} has no forward edge"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Rel = BipartiteRelation<String, String>;

    fn s(x: &str) -> String { x.to_string() }

    #[test]
    fn link_and_unlink_keep_both_sides() {
        let mut rel = Rel::new();
        assert!(rel.link(s("SYS_A"), s("x_NOSYS")));
        assert!(!rel.link(s("SYS_A"), s("x_NOSYS")));
        rel.link(s("SYS_B"), s("x_NOSYS"));
        assert_eq!(rel.edge_count(), 2);
        assert_eq!(rel.lefts_of(&s("x_NOSYS")).map(|l| l.len()), Some(2));

        assert!(rel.unlink(&s("SYS_A"), &s("x_NOSYS")));
        assert!(!rel.linked(&s("SYS_A"), &s("x_NOSYS")));
        // 键仍然存在，只是集合为空
        assert!(rel.rights_of(&s("SYS_A")).map(|r| r.is_empty()).unwrap_or(false));
        rel.check_invariant().unwrap();
    }

    #[test]
    fn replace_right_reports_symmetric_difference() {
        let mut rel = Rel::new();
        rel.link(s("NOSYS"), s("x_NOSYS"));
        rel.link(s("SYS_A"), s("x_NOSYS"));

        let want: BTreeSet<String> = [s("NOSYS"), s("SYS_B")].into_iter().collect();
        let (removed, added) = rel.replace_right(&s("x_NOSYS"), &want);
        assert_eq!(removed, vec![s("SYS_A")]);
        assert_eq!(added, vec![s("SYS_B")]);
        assert_eq!(rel.lefts_of(&s("x_NOSYS")), Some(&want));
        rel.check_invariant().unwrap();
    }

    #[test]
    fn replace_right_with_empty_set_declares_key() {
        let mut rel = Rel::new();
        rel.replace_right(&s("y_NOSYS"), &BTreeSet::new());
        assert!(rel.contains_right(&s("y_NOSYS")));
        assert_eq!(rel.edge_count(), 0);
    }
}
