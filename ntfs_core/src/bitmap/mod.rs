//! 窗口化位图
//!
//! 对应 ntfs3 的 `ubitmap.c`。一条长位串（卷位图或 MFT 位图）
//! 按固定窗口切分，每窗口缓存一个空闲位计数；窗口内容不驻留
//! 内存，按需经背靠属性的 runs 树读写。其上维护一个空闲 extent
//! 索引（见 [`extents`]）加速查找。
//!
//! 不变式：
//! - `total_zeroes == sum(free_bits[w])`
//! - 索引中的每个 extent 只覆盖 0 位
//! - zone 只与空闲区间相交（由分配器保证）

mod extents;

pub use extents::IndexState;

use crate::block::{BlockDev, BlockDevice, DeviceLock};
use crate::consts::{BITMAP_FIND_FULL, BITMAP_FIND_MARK_AS_USED};
use crate::error::Result;
use crate::run::RunsTree;
use alloc::vec;
use alloc::vec::Vec;
use extents::ExtentIndex;
use log::warn;

/// 窗口大小：8 · page_size 位
const WINDOW_BYTES: usize = 4096;
const WINDOW_BITS: usize = WINDOW_BYTES * 8;

/// 窗口化位图
///
/// 背靠一个非常驻属性（`$Bitmap::$DATA` 或 `$MFT::$BITMAP`）。
pub struct WndBitmap {
    run: RunsTree,
    cluster_bits: u8,

    nbits: usize,
    nwnd: usize,
    /// 末窗口的有效位数
    bits_last: usize,

    /// 每窗口空闲位计数
    free_bits: Vec<u16>,
    total_zeroes: usize,

    /// 软保留区 [zone_bit, zone_end)
    zone_bit: usize,
    zone_end: usize,

    extents: ExtentIndex,
}

#[inline]
fn test_bit(buf: &[u8], bit: usize) -> bool {
    buf[bit >> 3] & (1 << (bit & 7)) != 0
}

#[inline]
fn change_bit(buf: &mut [u8], bit: usize, set: bool) {
    if set {
        buf[bit >> 3] |= 1 << (bit & 7);
    } else {
        buf[bit >> 3] &= !(1 << (bit & 7));
    }
}

impl WndBitmap {
    /// 绑定背靠属性并整体扫描一遍
    ///
    /// 扫描建立每窗口空闲计数、`total_zeroes` 和空闲 extent
    /// 索引；窗口内容本身不缓存。对应 `wnd_init()` + 重扫。
    pub fn init<D: BlockDevice, L: DeviceLock>(
        bdev: &mut BlockDev<D, L>,
        run: RunsTree,
        cluster_bits: u8,
        nbits: usize,
    ) -> Result<Self> {
        let nwnd = nbits.div_ceil(WINDOW_BITS).max(1);
        let bits_last = if nbits == 0 {
            0
        } else {
            nbits - (nwnd - 1) * WINDOW_BITS
        };

        let mut wnd = Self {
            run,
            cluster_bits,
            nbits,
            nwnd,
            bits_last,
            free_bits: Vec::new(),
            total_zeroes: 0,
            zone_bit: 0,
            zone_end: 0,
            extents: ExtentIndex::new(),
        };
        wnd.rescan(bdev)?;
        Ok(wnd)
    }

    fn window_bits(&self, w: usize) -> usize {
        if w + 1 == self.nwnd {
            self.bits_last
        } else {
            WINDOW_BITS
        }
    }

    fn read_window<D: BlockDevice, L: DeviceLock>(
        &self,
        bdev: &mut BlockDev<D, L>,
        w: usize,
    ) -> Result<Vec<u8>> {
        let bytes = self.window_bits(w).div_ceil(8);
        let mut buf = vec![0u8; bytes];
        if bytes > 0 {
            self.run
                .read_vbo(bdev, self.cluster_bits, (w * WINDOW_BYTES) as u64, &mut buf)?;
        }
        Ok(buf)
    }

    fn write_window<D: BlockDevice, L: DeviceLock>(
        &self,
        bdev: &mut BlockDev<D, L>,
        w: usize,
        buf: &[u8],
    ) -> Result<()> {
        self.run
            .write_vbo(bdev, self.cluster_bits, (w * WINDOW_BYTES) as u64, buf, false)
    }

    /// 全量重扫：重建计数与索引
    pub fn rescan<D: BlockDevice, L: DeviceLock>(
        &mut self,
        bdev: &mut BlockDev<D, L>,
    ) -> Result<()> {
        self.free_bits.clear();
        self.total_zeroes = 0;
        self.extents.activate();

        // 跨窗口的零位段
        let mut cur: Option<(usize, usize)> = None;

        for w in 0..self.nwnd {
            let wbits = self.window_bits(w);
            let buf = self.read_window(bdev, w)?;
            let base = w * WINDOW_BITS;
            let mut zeros = 0usize;

            let mut bit = 0usize;
            while bit < wbits {
                // 整字节快进
                if bit & 7 == 0 && wbits - bit >= 8 {
                    let byte = buf[bit >> 3];
                    if byte == 0xFF {
                        if let Some((s, l)) = cur.take() {
                            self.extents.add(s, l);
                        }
                        bit += 8;
                        continue;
                    }
                    if byte == 0 {
                        zeros += 8;
                        cur = match cur {
                            Some((s, l)) => Some((s, l + 8)),
                            None => Some((base + bit, 8)),
                        };
                        bit += 8;
                        continue;
                    }
                }
                if test_bit(&buf, bit) {
                    if let Some((s, l)) = cur.take() {
                        self.extents.add(s, l);
                    }
                } else {
                    zeros += 1;
                    cur = match cur {
                        Some((s, l)) => Some((s, l + 1)),
                        None => Some((base + bit, 1)),
                    };
                }
                bit += 1;
            }

            self.free_bits.push(zeros as u16);
            self.total_zeroes += zeros;
        }
        if let Some((s, l)) = cur {
            self.extents.add(s, l);
        }
        Ok(())
    }

    pub fn zeroes(&self) -> usize {
        self.total_zeroes
    }

    pub fn nbits(&self) -> usize {
        self.nbits
    }

    pub fn index_state(&self) -> IndexState {
        self.extents.state()
    }

    pub fn zone_bit(&self) -> usize {
        self.zone_bit
    }

    pub fn zone_end(&self) -> usize {
        self.zone_end
    }

    pub fn zone_len(&self) -> usize {
        self.zone_end - self.zone_bit
    }

    /// 设置软保留区；旧 zone 的位不被触碰
    ///
    /// 对应 `wnd_zone_set()`。
    pub fn zone_set(&mut self, bit: usize, len: usize) {
        self.zone_bit = bit;
        self.zone_end = bit + len;
    }

    /// 把 `[bit, bit+n)` 置 1
    ///
    /// 目标位已是 1 时记一条软一致性警告，操作照常落盘。
    /// 对应 `wnd_set_used()`。
    pub fn set_used<D: BlockDevice, L: DeviceLock>(
        &mut self,
        bdev: &mut BlockDev<D, L>,
        bit: usize,
        n: usize,
    ) -> Result<()> {
        self.change_bits(bdev, bit, n, true)?;
        self.extents.remove(bit, n);
        Ok(())
    }

    /// 把 `[bit, bit+n)` 置 0，并与相邻空闲段合并
    ///
    /// 对应 `wnd_set_free()`。
    pub fn set_free<D: BlockDevice, L: DeviceLock>(
        &mut self,
        bdev: &mut BlockDev<D, L>,
        bit: usize,
        n: usize,
    ) -> Result<()> {
        self.change_bits(bdev, bit, n, false)?;
        self.extents.add(bit, n);
        Ok(())
    }

    fn change_bits<D: BlockDevice, L: DeviceLock>(
        &mut self,
        bdev: &mut BlockDev<D, L>,
        bit: usize,
        n: usize,
        set: bool,
    ) -> Result<()> {
        debug_assert!(bit + n <= self.nbits);

        let mut done = 0usize;
        let mut unexpected = 0usize;

        while done < n {
            let abs = bit + done;
            let w = abs / WINDOW_BITS;
            let in_w = abs % WINDOW_BITS;
            let chunk = (n - done).min(self.window_bits(w) - in_w);

            let mut buf = self.read_window(bdev, w)?;
            let mut flipped = 0usize;
            for i in 0..chunk {
                if test_bit(&buf, in_w + i) != set {
                    change_bit(&mut buf, in_w + i, set);
                    flipped += 1;
                } else {
                    unexpected += 1;
                }
            }
            self.write_window(bdev, w, &buf)?;

            if set {
                self.free_bits[w] -= flipped as u16;
                self.total_zeroes -= flipped;
            } else {
                self.free_bits[w] += flipped as u16;
                self.total_zeroes += flipped;
            }
            done += chunk;
        }

        if unexpected != 0 {
            warn!(
                "wnd_bitmap: {} of {} bits at {} already {}",
                unexpected,
                n,
                bit,
                if set { "used" } else { "free" }
            );
        }
        Ok(())
    }

    /// `[bit, bit+n)` 是否全 0
    pub fn is_free<D: BlockDevice, L: DeviceLock>(
        &self,
        bdev: &mut BlockDev<D, L>,
        bit: usize,
        n: usize,
    ) -> Result<bool> {
        self.check_bits(bdev, bit, n, false)
    }

    /// `[bit, bit+n)` 是否全 1
    pub fn is_used<D: BlockDevice, L: DeviceLock>(
        &self,
        bdev: &mut BlockDev<D, L>,
        bit: usize,
        n: usize,
    ) -> Result<bool> {
        self.check_bits(bdev, bit, n, true)
    }

    fn check_bits<D: BlockDevice, L: DeviceLock>(
        &self,
        bdev: &mut BlockDev<D, L>,
        bit: usize,
        n: usize,
        expect: bool,
    ) -> Result<bool> {
        if bit + n > self.nbits {
            return Ok(false);
        }
        let mut done = 0usize;
        while done < n {
            let abs = bit + done;
            let w = abs / WINDOW_BITS;
            let in_w = abs % WINDOW_BITS;
            let chunk = (n - done).min(self.window_bits(w) - in_w);

            let buf = self.read_window(bdev, w)?;
            for i in 0..chunk {
                if test_bit(&buf, in_w + i) != expect {
                    return Ok(false);
                }
            }
            done += chunk;
        }
        Ok(true)
    }

    /// 查找空闲位段，分配器的核心入口
    ///
    /// 返回 `(bit, actual_len)`；`Ok(None)` 表示没有满足条件的
    /// 空间。缺省模式下找不到 `to_alloc` 连续位时返回当前最长
    /// 的空闲段；`BITMAP_FIND_FULL` 则只接受完整长度。zone 的
    /// 处理：hint 落在 zone 内的调用方（MFT 路径）允许使用
    /// zone，否则 zone 视同已用。对应 `wnd_find()`。
    pub fn find<D: BlockDevice, L: DeviceLock>(
        &mut self,
        bdev: &mut BlockDev<D, L>,
        to_alloc: usize,
        hint: usize,
        flags: u32,
    ) -> Result<Option<(usize, usize)>> {
        if to_alloc == 0 || self.total_zeroes == 0 {
            return Ok(None);
        }
        let hint = if hint >= self.nbits { 0 } else { hint };
        let allow_zone = self.zone_len() > 0 && hint >= self.zone_bit && hint < self.zone_end;

        let found = if self.extents.state() == IndexState::Current {
            self.find_by_index(to_alloc, hint, allow_zone, flags)
        } else {
            self.find_linear(bdev, to_alloc, hint, allow_zone, flags)?
        };

        if let Some((bit, len)) = found {
            if flags & BITMAP_FIND_MARK_AS_USED != 0 {
                self.set_used(bdev, bit, len)?;
            }
            return Ok(Some((bit, len)));
        }
        Ok(None)
    }

    /// 对候选段做 zone 裁剪，按起点升序给出可用子段（至多两段）
    fn zone_pieces(&self, start: usize, len: usize, allow_zone: bool) -> alloc::vec::Vec<(usize, usize)> {
        if allow_zone || self.zone_len() == 0 {
            return alloc::vec![(start, len)];
        }
        let end = start + len;
        let mut pieces = alloc::vec::Vec::with_capacity(2);
        if start < self.zone_bit {
            pieces.push((start, end.min(self.zone_bit) - start));
        }
        if end > self.zone_end {
            let s = start.max(self.zone_end);
            pieces.push((s, end - s));
        }
        pieces
    }

    fn find_by_index(
        &self,
        to_alloc: usize,
        hint: usize,
        allow_zone: bool,
        flags: u32,
    ) -> Option<(usize, usize)> {
        // 两趟：先限定 start ≥ hint，再放开
        for pass in 0..2 {
            for (start, len) in self.extents.candidates(to_alloc) {
                let (s0, l0) = if pass == 0 {
                    if start + len <= hint {
                        continue;
                    }
                    let from = start.max(hint);
                    (from, start + len - from)
                } else {
                    (start, len)
                };
                for (ps, pl) in self.zone_pieces(s0, l0, allow_zone) {
                    if pl >= to_alloc {
                        return Some((ps, to_alloc));
                    }
                }
            }
        }

        if flags & BITMAP_FIND_FULL != 0 {
            return None;
        }

        // 退而求其次：全部段裁剪后的最大子段
        let mut best: Option<(usize, usize)> = None;
        for (start, len) in self.extents.iter() {
            for piece in self.zone_pieces(start, len, allow_zone) {
                Self::fold_best(&mut best, Some(piece));
            }
        }
        best.map(|(s, l)| (s, l.min(to_alloc)))
    }

    fn find_linear<D: BlockDevice, L: DeviceLock>(
        &self,
        bdev: &mut BlockDev<D, L>,
        to_alloc: usize,
        hint: usize,
        allow_zone: bool,
        flags: u32,
    ) -> Result<Option<(usize, usize)>> {
        // 两段扫描：[hint, nbits) 再 [0, hint)
        let ranges = [(hint, self.nbits), (0, hint)];
        let mut best: Option<(usize, usize)> = None;

        for &(from, to) in &ranges {
            if from >= to {
                continue;
            }
            let mut cur: Option<(usize, usize)> = None;
            let w_first = from / WINDOW_BITS;
            let w_last = (to - 1) / WINDOW_BITS;

            for w in w_first..=w_last {
                // 满窗口直接跳过，当前段在窗口边界断开
                if self.free_bits[w] == 0 {
                    Self::fold_best(&mut best, cur.take());
                    continue;
                }
                let buf = self.read_window(bdev, w)?;
                let base = w * WINDOW_BITS;
                let lo = from.max(base) - base;
                let hi = to.min(base + self.window_bits(w)) - base;

                let mut bit = lo;
                while bit < hi {
                    let abs = base + bit;
                    let in_zone =
                        !allow_zone && abs >= self.zone_bit && abs < self.zone_end;

                    if in_zone || test_bit(&buf, bit) {
                        Self::fold_best(&mut best, cur.take());
                        if in_zone {
                            // 跨过整个 zone
                            bit = (self.zone_end - base).min(hi);
                            continue;
                        }
                        bit += 1;
                        continue;
                    }

                    cur = match cur {
                        Some((s, l)) => Some((s, l + 1)),
                        None => Some((abs, 1)),
                    };
                    if cur.unwrap().1 == to_alloc {
                        return Ok(Some((cur.unwrap().0, to_alloc)));
                    }
                    bit += 1;
                }
            }
            Self::fold_best(&mut best, cur.take());
        }

        if flags & BITMAP_FIND_FULL != 0 {
            return Ok(None);
        }
        Ok(best)
    }

    /// 长度优先、起点次之地保留更优段
    fn fold_best(best: &mut Option<(usize, usize)>, cand: Option<(usize, usize)>) {
        if let Some((s, l)) = cand {
            match *best {
                Some((bs, bl)) if bl > l || (bl == l && bs <= s) => {}
                _ => *best = Some((s, l)),
            }
        }
    }

    /// 扩展位图，新增位全部空闲
    ///
    /// 调用前背靠属性必须已覆盖新尺寸。对应 `wnd_extend()`。
    pub fn extend<D: BlockDevice, L: DeviceLock>(
        &mut self,
        bdev: &mut BlockDev<D, L>,
        new_bits: usize,
    ) -> Result<()> {
        if new_bits <= self.nbits {
            return Ok(());
        }
        let old_bits = self.nbits;
        let added = new_bits - old_bits;

        // 清掉边界字节中旧尾部之后的位
        if old_bits % 8 != 0 {
            let byte_off = (old_bits / 8) as u64;
            let mut b = [0u8; 1];
            self.run.read_vbo(bdev, self.cluster_bits, byte_off, &mut b)?;
            b[0] &= (1u8 << (old_bits % 8)) - 1;
            self.run
                .write_vbo(bdev, self.cluster_bits, byte_off, &b, false)?;
        }
        // 新增整字节清零
        let first_new_byte = old_bits.div_ceil(8) as u64;
        let last_byte = new_bits.div_ceil(8) as u64;
        if last_byte > first_new_byte {
            self.run
                .zero_vbo(bdev, self.cluster_bits, first_new_byte, last_byte - first_new_byte)?;
        }

        self.nbits = new_bits;
        self.nwnd = new_bits.div_ceil(WINDOW_BITS).max(1);
        self.bits_last = new_bits - (self.nwnd - 1) * WINDOW_BITS;

        // 末尾旧窗口的空闲计数补上新增位
        let old_last_w = if old_bits == 0 { 0 } else { (old_bits - 1) / WINDOW_BITS };
        while self.free_bits.len() < self.nwnd {
            self.free_bits.push(0);
        }
        for w in old_last_w..self.nwnd {
            let w_start = w * WINDOW_BITS;
            let w_end = w_start + self.window_bits(w);
            let new_in_w = w_end.min(new_bits).saturating_sub(w_start.max(old_bits));
            self.free_bits[w] += new_in_w as u16;
        }
        self.total_zeroes += added;
        self.extents.add(old_bits, added);
        Ok(())
    }

    /// 更换背靠 runs（属性被搬移或扩展后）
    pub fn set_run(&mut self, run: RunsTree) {
        self.run = run;
    }

    /// 背靠 runs 的只读访问
    pub fn run(&self) -> &RunsTree {
        &self.run
    }
}
