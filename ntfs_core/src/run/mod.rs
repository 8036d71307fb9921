//! runs 树：一个属性的 VCN → LCN 映射
//!
//! 对应 ntfs3 的 `run.c`。按 VCN 排序的有序 extent 数组，
//! 二分查找；相邻且连续的 extent 在插入时合并。稀疏段用
//! `SPARSE_LCN` 占位。

mod io;
mod pack;

pub use pack::run_get_highest_vcn;

use crate::consts::{CLST, SPARSE_LCN};
use alloc::vec::Vec;

/// 一段连续映射：`len` 个簇，从 `vcn` 映射到 `lcn`
///
/// `lcn == SPARSE_LCN` 表示空洞。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtfsRun {
    pub vcn: CLST,
    pub lcn: CLST,
    pub len: CLST,
}

impl NtfsRun {
    #[inline]
    pub fn is_sparse(&self) -> bool {
        self.lcn == SPARSE_LCN
    }

    #[inline]
    fn vcn_end(&self) -> CLST {
        self.vcn + self.len
    }
}

/// VCN 有序、不重叠的 extent 集合
///
/// 对应 ntfs3 的 `struct runs_tree`。
#[derive(Debug, Default, Clone)]
pub struct RunsTree {
    runs: Vec<NtfsRun>,
}

impl RunsTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn count(&self) -> usize {
        self.runs.len()
    }

    /// 二分定位 `vcn`：`Ok(i)` 命中第 i 个 extent，
    /// `Err(i)` 未命中，i 是插入点
    pub fn lookup(&self, vcn: CLST) -> core::result::Result<usize, usize> {
        self.runs.binary_search_by(|r| {
            if vcn < r.vcn {
                core::cmp::Ordering::Greater
            } else if vcn >= r.vcn_end() {
                core::cmp::Ordering::Less
            } else {
                core::cmp::Ordering::Equal
            }
        })
    }

    /// 查找包含 `vcn` 的映射
    ///
    /// 返回 `(lcn, len, index)`：`lcn` 是 `vcn` 对应的簇号
    /// （稀疏段返回 `SPARSE_LCN`），`len` 是从 `vcn` 起仍然
    /// 连续的簇数。对应 `run_lookup_entry()`。
    pub fn lookup_entry(&self, vcn: CLST) -> Option<(CLST, CLST, usize)> {
        let idx = self.lookup(vcn).ok()?;
        let r = &self.runs[idx];
        let off = vcn - r.vcn;
        let lcn = if r.is_sparse() {
            SPARSE_LCN
        } else {
            r.lcn + off
        };
        Some((lcn, r.len - off, idx))
    }

    /// 按下标取 extent，对应 `run_get_entry()`
    pub fn get_entry(&self, index: usize) -> Option<NtfsRun> {
        self.runs.get(index).copied()
    }

    /// 插入映射 `(vcn, lcn, len)`
    ///
    /// 与既有 extent 重叠的部分被替换（替换中段时旧 extent 被
    /// 分裂）；与左右邻接且 LCN 连续（或同为稀疏）时合并。
    /// 重复插入同一映射是幂等的。对应 `run_add_entry()`。
    pub fn add(&mut self, vcn: CLST, lcn: CLST, len: CLST) {
        if len == 0 {
            return;
        }
        debug_assert!(lcn == SPARSE_LCN || lcn.checked_add(len).is_some());

        // 先挖掉与 [vcn, vcn+len) 重叠的部分
        self.punch(vcn, len);

        let idx = match self.lookup(vcn) {
            Ok(_) => unreachable!("range was punched out"),
            Err(i) => i,
        };
        self.runs.insert(idx, NtfsRun { vcn, lcn, len });

        // 与右邻合并
        if idx + 1 < self.runs.len() && Self::mergeable(&self.runs[idx], &self.runs[idx + 1]) {
            self.runs[idx].len += self.runs[idx + 1].len;
            self.runs.remove(idx + 1);
        }
        // 与左邻合并
        if idx > 0 && Self::mergeable(&self.runs[idx - 1], &self.runs[idx]) {
            self.runs[idx - 1].len += self.runs[idx].len;
            self.runs.remove(idx);
        }
    }

    fn mergeable(left: &NtfsRun, right: &NtfsRun) -> bool {
        if left.vcn_end() != right.vcn {
            return false;
        }
        if left.is_sparse() {
            right.is_sparse()
        } else {
            !right.is_sparse() && left.lcn + left.len == right.lcn
        }
    }

    /// 把 [vcn, vcn+len) 从树中挖掉，必要时分裂跨界 extent
    fn punch(&mut self, vcn: CLST, len: CLST) {
        let end = vcn + len;
        let mut i = match self.lookup(vcn) {
            Ok(i) => i,
            Err(i) => i,
        };

        while i < self.runs.len() {
            let r = self.runs[i];
            if r.vcn >= end {
                break;
            }
            if r.vcn_end() <= vcn {
                i += 1;
                continue;
            }

            let head = vcn.saturating_sub(r.vcn);
            let tail = r.vcn_end().saturating_sub(end);

            match (head > 0, tail > 0) {
                (false, false) => {
                    // 整段被覆盖
                    self.runs.remove(i);
                }
                (true, false) => {
                    self.runs[i].len = head;
                    i += 1;
                }
                (false, true) => {
                    let r = &mut self.runs[i];
                    r.vcn = end;
                    if !r.is_sparse() {
                        r.lcn += r.len - tail;
                    }
                    r.len = tail;
                    break;
                }
                (true, true) => {
                    // 中段替换：分裂成左右两段
                    self.runs[i].len = head;
                    let right = NtfsRun {
                        vcn: end,
                        lcn: if r.is_sparse() {
                            SPARSE_LCN
                        } else {
                            r.lcn + (end - r.vcn)
                        },
                        len: tail,
                    };
                    self.runs.insert(i + 1, right);
                    break;
                }
            }
        }
    }

    /// 丢弃 VCN ≥ `vcn` 的映射，跨界 extent 被截断
    ///
    /// 对应 `run_truncate()`。
    pub fn truncate(&mut self, vcn: CLST) {
        let idx = match self.lookup(vcn) {
            Ok(i) => {
                let r = &mut self.runs[i];
                if r.vcn < vcn {
                    r.len = vcn - r.vcn;
                    i + 1
                } else {
                    i
                }
            }
            Err(i) => i,
        };
        self.runs.truncate(idx);
    }

    /// 丢弃 VCN < `vcn` 的映射，跨界 extent 头部被截掉
    ///
    /// 对应 `run_truncate_head()`。
    pub fn truncate_head(&mut self, vcn: CLST) {
        let idx = match self.lookup(vcn) {
            Ok(i) => {
                let r = &mut self.runs[i];
                if r.vcn < vcn {
                    let cut = vcn - r.vcn;
                    if !r.is_sparse() {
                        r.lcn += cut;
                    }
                    r.vcn = vcn;
                    r.len -= cut;
                }
                i
            }
            Err(i) => i,
        };
        self.runs.drain(..idx);
    }

    /// `[svcn, evcn]` 是否全部有映射（稀疏段也算有映射）
    ///
    /// 对应 `run_is_mapped_full()`。
    pub fn is_mapped_full(&self, svcn: CLST, evcn: CLST) -> bool {
        let mut next = svcn;
        let mut idx = match self.lookup(svcn) {
            Ok(i) => i,
            Err(_) => return false,
        };
        while let Some(r) = self.runs.get(idx) {
            if r.vcn > next {
                return false;
            }
            if r.vcn_end() > evcn {
                return true;
            }
            next = r.vcn_end();
            idx += 1;
        }
        false
    }

    /// 已映射的最大 VCN + 1（空树返回 0）
    pub fn max_vcn_end(&self) -> CLST {
        self.runs.last().map_or(0, |r| r.vcn_end())
    }

    /// 遍历所有 extent
    pub fn iter(&self) -> impl Iterator<Item = &NtfsRun> {
        self.runs.iter()
    }

    /// 清空
    pub fn clear(&mut self) {
        self.runs.clear();
    }

    /// 与既有映射冲突即返回 true（重叠且映射不同）
    ///
    /// `unpack` 用它拒绝"同一 VCN 解出不同映射"的编码。
    pub(crate) fn mapping_conflicts(&self, vcn: CLST, lcn: CLST, len: CLST) -> bool {
        let end = vcn + len;
        let mut i = match self.lookup(vcn) {
            Ok(i) => i,
            Err(i) => i,
        };
        while let Some(r) = self.runs.get(i) {
            if r.vcn >= end {
                return false;
            }
            if r.vcn_end() > vcn {
                // 重叠区间的映射必须一致
                let both_sparse = r.is_sparse() && lcn == SPARSE_LCN;
                let same_linear = !r.is_sparse()
                    && lcn != SPARSE_LCN
                    && (r.lcn as i64 - r.vcn as i64) == (lcn as i64 - vcn as i64);
                if !both_sparse && !same_linear {
                    return true;
                }
            }
            i += 1;
        }
        false
    }
}
