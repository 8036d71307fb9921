//! 空闲 extent 索引
//!
//! 位图之上的加速结构：当前全部最大零位段的集合，按 `start`
//! 和 `(count, start)` 两种序各存一份。段数超过上限后退化为
//! "已激活但不完整"（-1），查找方退回线性扫描。
//! 对应 ntfs3 `wnd_bitmap` 里的 start_tree / count_tree。

use alloc::collections::{BTreeMap, BTreeSet};

/// 索引里最多保留的段数，超过即转入 stale 状态
const NTFS_MAX_WND_EXTENTS: usize = 32;

/// 索引状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// 未激活，查找走线性路径
    Inactive,
    /// 激活且完整：所有空闲段都在索引中
    Current,
    /// 激活但碎片过多，只保留最大的若干段
    Stale,
}

#[derive(Debug)]
pub(crate) struct ExtentIndex {
    /// start → len
    start_tree: BTreeMap<usize, usize>,
    /// (len, start)
    count_tree: BTreeSet<(usize, usize)>,
    state: IndexState,
    /// 索引中最小段长（stale 时的淘汰阈值）
    extent_min: usize,
    /// 最大空闲段长的上估
    extent_max: usize,
}

impl ExtentIndex {
    pub fn new() -> Self {
        Self {
            start_tree: BTreeMap::new(),
            count_tree: BTreeSet::new(),
            state: IndexState::Inactive,
            extent_min: 0,
            extent_max: 0,
        }
    }

    pub fn state(&self) -> IndexState {
        self.state
    }

    pub fn extent_max(&self) -> usize {
        self.extent_max
    }

    /// 重建开始：清空并进入 Current
    pub fn activate(&mut self) {
        self.start_tree.clear();
        self.count_tree.clear();
        self.state = IndexState::Current;
        self.extent_min = 0;
        self.extent_max = 0;
    }

    fn insert_raw(&mut self, start: usize, len: usize) {
        if self.count_tree.len() >= NTFS_MAX_WND_EXTENTS {
            self.state = IndexState::Stale;
            if len <= self.extent_min {
                // 比现存最小的还小，不值得收
                if len > self.extent_max {
                    self.extent_max = len;
                }
                return;
            }
            // 淘汰最小段
            if let Some(&(min_len, min_start)) = self.count_tree.first() {
                self.count_tree.remove(&(min_len, min_start));
                self.start_tree.remove(&min_start);
            }
        }
        self.start_tree.insert(start, len);
        self.count_tree.insert((len, start));
        self.extent_min = self.count_tree.first().map_or(0, |&(l, _)| l);
        if len > self.extent_max {
            self.extent_max = len;
        }
    }

    fn remove_raw(&mut self, start: usize, len: usize) {
        self.start_tree.remove(&start);
        self.count_tree.remove(&(len, start));
        self.extent_min = self.count_tree.first().map_or(0, |&(l, _)| l);
    }

    /// 一段位变为 0：并入索引，与左右邻接段合并
    pub fn add(&mut self, start: usize, len: usize) {
        if self.state == IndexState::Inactive || len == 0 {
            return;
        }

        let mut new_start = start;
        let mut new_end = start + len;

        // 左邻：最后一个 start ≤ new_start 的段
        if let Some((&ls, &ll)) = self.start_tree.range(..=new_start).next_back() {
            if ls + ll >= new_start {
                new_start = ls;
                new_end = new_end.max(ls + ll);
                self.remove_raw(ls, ll);
            }
        }
        // 右侧所有与 [new_start, new_end] 相接或重叠的段
        while let Some((&rs, &rl)) = self.start_tree.range(new_start..=new_end).next() {
            new_end = new_end.max(rs + rl);
            self.remove_raw(rs, rl);
        }

        self.insert_raw(new_start, new_end - new_start);
    }

    /// 一段位变为 1：从索引中挖掉，剩余两侧重新入索引
    pub fn remove(&mut self, start: usize, len: usize) {
        if self.state == IndexState::Inactive || len == 0 {
            return;
        }
        let end = start + len;

        // 收集所有重叠段（Current 状态下恰好一段完整包含）
        let mut overlaps: alloc::vec::Vec<(usize, usize)> = alloc::vec::Vec::new();
        if let Some((&ls, &ll)) = self.start_tree.range(..start).next_back() {
            if ls + ll > start {
                overlaps.push((ls, ll));
            }
        }
        for (&s, &l) in self.start_tree.range(start..end) {
            overlaps.push((s, l));
        }

        for (s, l) in overlaps {
            self.remove_raw(s, l);
            if s < start {
                self.insert_raw(s, start - s);
            }
            if s + l > end {
                self.insert_raw(end, s + l - end);
            }
        }
    }

    /// 最佳适配：`len ≥ to_alloc` 的段里先找 `start ≥ hint` 的
    /// 最小 `(len, start)`，没有再放开 hint 约束
    pub fn best_fit(&self, to_alloc: usize, hint: usize) -> Option<(usize, usize)> {
        let mut fallback = None;
        for &(len, start) in self.count_tree.range((to_alloc, 0)..) {
            if start >= hint {
                return Some((start, len));
            }
            if fallback.is_none() {
                fallback = Some((start, len));
            }
        }
        fallback
    }

    /// 最大空闲段
    pub fn largest(&self) -> Option<(usize, usize)> {
        self.count_tree.last().map(|&(len, start)| (start, len))
    }

    /// 按 `(len, start)` 升序遍历 `len ≥ to_alloc` 的段
    pub fn candidates(&self, to_alloc: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.count_tree
            .range((to_alloc, 0)..)
            .map(|&(len, start)| (start, len))
    }

    /// 遍历（测试与一致性检查用）
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.start_tree.iter().map(|(&s, &l)| (s, l))
    }
}
