//! B+ 树索引引擎
//!
//! 对应 ntfs3 的 `index.c`。根节点是常驻的 $INDEX_ROOT；下层
//! 节点是 $INDEX_ALLOCATION 里定长、带 fixup 的 INDX 块，由
//! 同名 $BITMAP 跟踪占用。项内的子树指针（sub_vbn）按项存在，
//! 一个节点里可以混着有子树和没子树的项。
//!
//! 不变式：节点内按键有序；位图与在用块集合一致；叶与内部
//! 节点由项上的标志区分。

mod cmp;

pub use cmp::{cmp_keys, fname_of};

use crate::block::{BlockDevice, DeviceLock};
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::fixup;
use crate::fs::Ntfs;
use crate::inode::NtfsInode;
use crate::run::RunsTree;
use crate::types::*;
use alloc::vec;
use alloc::vec::Vec;
use log::warn;

// $INDEX_ROOT 头
const IR_TYPE: usize = 0x00;
const IR_RULE: usize = 0x04;
const IR_BLOCK_SIZE: usize = 0x08;
const IR_BLOCK_CLST: usize = 0x0C;
const IR_HDR: usize = 0x10;

// INDEX_HDR（相对）
const IH_DE_OFF: usize = 0x00;
const IH_USED: usize = 0x04;
const IH_TOTAL: usize = 0x08;
const IH_FLAGS: usize = 0x0C;
const SIZEOF_INDEX_HDR: usize = 0x10;

/// 节点有下层块
const IH_FLAG_SUBNODES: u8 = 1;

// INDX 块
const IB_VBN: usize = 0x10;
const IB_HDR: usize = 0x18;

// NTFS_DE
const DE_REF: usize = 0x00;
const DE_SIZE: usize = 0x08;
const DE_KEY_SIZE: usize = 0x0A;
const DE_FLAGS: usize = 0x0C;
const DE_KEY: usize = 0x10;

const DE_FLAG_SUB: u16 = 1;
const DE_FLAG_LAST: u16 = 2;

// ===== 项访问 =====

fn de_size(buf: &[u8], off: usize) -> usize {
    get_u16(buf, off + DE_SIZE) as usize
}

fn de_key_size(buf: &[u8], off: usize) -> usize {
    get_u16(buf, off + DE_KEY_SIZE) as usize
}

fn de_flags(buf: &[u8], off: usize) -> u16 {
    get_u16(buf, off + DE_FLAGS)
}

fn de_is_last(buf: &[u8], off: usize) -> bool {
    de_flags(buf, off) & DE_FLAG_LAST != 0
}

fn de_has_sub(buf: &[u8], off: usize) -> bool {
    de_flags(buf, off) & DE_FLAG_SUB != 0
}

fn de_key(buf: &[u8], off: usize) -> &[u8] {
    &buf[off + DE_KEY..off + DE_KEY + de_key_size(buf, off)]
}

fn de_sub_vbn(buf: &[u8], off: usize) -> u64 {
    let size = de_size(buf, off);
    get_u64(buf, off + size - 8)
}

fn de_ref(buf: &[u8], off: usize) -> u64 {
    get_u64(buf, off + DE_REF)
}

/// 组装一个目录 / 视图项
pub fn build_de(ref_: u64, key: &[u8], sub_vbn: Option<u64>, last: bool) -> Vec<u8> {
    let base = quad_align(DE_KEY + key.len());
    let size = base + if sub_vbn.is_some() { 8 } else { 0 };
    let mut de = vec![0u8; size];
    put_u64(&mut de, DE_REF, ref_);
    put_u16(&mut de, DE_SIZE, size as u16);
    put_u16(&mut de, DE_KEY_SIZE, key.len() as u16);
    let mut flags = 0u16;
    if last {
        flags |= DE_FLAG_LAST;
    }
    if sub_vbn.is_some() {
        flags |= DE_FLAG_SUB;
    }
    put_u16(&mut de, DE_FLAGS, flags);
    de[DE_KEY..DE_KEY + key.len()].copy_from_slice(key);
    if let Some(vbn) = sub_vbn {
        put_u64(&mut de, size - 8, vbn);
    }
    de
}

/// 视图项（$SII/$SDH 等）：负载跟在键后面，首 8 字节是
/// (data_off, data_size) 描述符而不是 MFT_REF
pub fn build_de_view(key: &[u8], data: &[u8], last: bool) -> Vec<u8> {
    let data_off = dword_align(DE_KEY + key.len());
    let size = quad_align(data_off + data.len());
    let mut de = vec![0u8; size];
    put_u16(&mut de, 0x00, data_off as u16);
    put_u16(&mut de, 0x02, data.len() as u16);
    put_u16(&mut de, DE_SIZE, size as u16);
    put_u16(&mut de, DE_KEY_SIZE, key.len() as u16);
    put_u16(&mut de, DE_FLAGS, if last { DE_FLAG_LAST } else { 0 });
    de[DE_KEY..DE_KEY + key.len()].copy_from_slice(key);
    de[data_off..data_off + data.len()].copy_from_slice(data);
    de
}

/// 视图项的负载
fn de_data(buf: &[u8], off: usize) -> &[u8] {
    let data_off = get_u16(buf, off) as usize;
    let data_size = get_u16(buf, off + 2) as usize;
    let size = de_size(buf, off);
    if data_off + data_size > size {
        return &[];
    }
    &buf[off + data_off..off + data_off + data_size]
}

/// 原样复制一个项，只增删 sub_vbn 指针
///
/// 不经过重建，项内的视图负载得以保留。
fn de_adjust_sub(entry: &[u8], sub: Option<u64>) -> Vec<u8> {
    let has = get_u16(entry, DE_FLAGS) & DE_FLAG_SUB != 0;
    match (has, sub) {
        (true, Some(vbn)) => {
            let mut de = entry.to_vec();
            let size = de.len();
            put_u64(&mut de, size - 8, vbn);
            de
        }
        (true, None) => {
            let mut de = entry[..entry.len() - 8].to_vec();
            let size = de.len();
            put_u16(&mut de, DE_SIZE, size as u16);
            let f = get_u16(&de, DE_FLAGS) & !DE_FLAG_SUB;
            put_u16(&mut de, DE_FLAGS, f);
            de
        }
        (false, Some(vbn)) => {
            let mut de = entry.to_vec();
            de.extend_from_slice(&vbn.to_le_bytes());
            let size = de.len();
            put_u16(&mut de, DE_SIZE, size as u16);
            let f = get_u16(&de, DE_FLAGS) | DE_FLAG_SUB;
            put_u16(&mut de, DE_FLAGS, f);
            de
        }
        (false, None) => entry.to_vec(),
    }
}

fn de_with_sub(buf: &[u8], off: usize, sub: Option<u64>) -> Vec<u8> {
    let size = de_size(buf, off);
    de_adjust_sub(&buf[off..off + size], sub)
}

/// 项快照
#[derive(Debug, Clone)]
pub struct DeEntry {
    pub ref_: u64,
    pub key: Vec<u8>,
    /// 视图索引的负载（目录索引恒空）
    pub data: Vec<u8>,
}

fn snapshot(rule: u32, buf: &[u8], off: usize) -> DeEntry {
    let is_view = rule != NTFS_COLLATION_TYPE_FILENAME;
    DeEntry {
        ref_: de_ref(buf, off),
        key: de_key(buf, off).to_vec(),
        data: if is_view {
            de_data(buf, off).to_vec()
        } else {
            Vec::new()
        },
    }
}

// ===== 节点 =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeId {
    Root,
    Block(u64),
}

/// 内存中的一个索引节点（根或 INDX 块）
pub struct IndexNode {
    id: NodeId,
    buf: Vec<u8>,
    hdr: usize,
}

impl IndexNode {
    fn used(&self) -> usize {
        get_u32(&self.buf, self.hdr + IH_USED) as usize
    }

    fn set_used(&mut self, v: usize) {
        put_u32(&mut self.buf, self.hdr + IH_USED, v as u32);
    }

    fn total(&self) -> usize {
        get_u32(&self.buf, self.hdr + IH_TOTAL) as usize
    }

    fn de_off(&self) -> usize {
        get_u32(&self.buf, self.hdr + IH_DE_OFF) as usize
    }

    fn first_off(&self) -> usize {
        self.hdr + self.de_off()
    }

    fn end_off(&self) -> usize {
        self.hdr + self.used()
    }

    fn has_subnodes(&self) -> bool {
        self.buf[self.hdr + IH_FLAGS] & IH_FLAG_SUBNODES != 0
    }

    fn set_subnodes(&mut self, v: bool) {
        if v {
            self.buf[self.hdr + IH_FLAGS] |= IH_FLAG_SUBNODES;
        } else {
            self.buf[self.hdr + IH_FLAGS] &= !IH_FLAG_SUBNODES;
        }
    }

    /// 所有项的偏移（含 LAST），损坏时截断
    fn entry_offs(&self) -> Vec<usize> {
        let mut v = Vec::new();
        let mut off = self.first_off();
        let end = self.end_off();
        loop {
            if off + DE_KEY > end {
                warn!("index node without last entry");
                break;
            }
            let size = de_size(&self.buf, off);
            if size < DE_KEY || off + size > end {
                warn!("index entry overruns node");
                break;
            }
            v.push(off);
            if de_is_last(&self.buf, off) {
                break;
            }
            off += size;
        }
        v
    }

    /// 在 `off` 前插入项字节；块节点装不下返回 false
    fn insert_at(&mut self, off: usize, de: &[u8]) -> bool {
        let used = self.used();
        match self.id {
            NodeId::Root => {
                self.buf.splice(off..off, de.iter().copied());
                self.set_used(used + de.len());
                let t = self.total();
                put_u32(&mut self.buf, self.hdr + IH_TOTAL, (t + de.len()) as u32);
                true
            }
            NodeId::Block(_) => {
                if used + de.len() > self.total() {
                    return false;
                }
                let end = self.end_off();
                self.buf.copy_within(off..end, off + de.len());
                self.buf[off..off + de.len()].copy_from_slice(de);
                self.set_used(used + de.len());
                true
            }
        }
    }

    /// 摘除 `off` 处的项
    fn remove_at(&mut self, off: usize) {
        let size = de_size(&self.buf, off);
        let used = self.used();
        match self.id {
            NodeId::Root => {
                self.buf.drain(off..off + size);
                self.set_used(used - size);
                let t = self.total();
                put_u32(&mut self.buf, self.hdr + IH_TOTAL, (t - size) as u32);
            }
            NodeId::Block(_) => {
                let end = self.end_off();
                self.buf.copy_within(off + size..end, off);
                self.set_used(used - size);
            }
        }
    }

    /// 非 LAST 项个数
    fn count(&self) -> usize {
        self.entry_offs()
            .iter()
            .filter(|&&o| !de_is_last(&self.buf, o))
            .count()
    }
}

// ===== 下降游标 =====

/// 下降游标：从根到当前位置的 (节点, 项偏移) 栈
///
/// 对应 ntfs3 的 `struct ntfs_fnd`。
pub struct Finder {
    pub path: Vec<(IndexNode, usize)>,
}

impl Finder {
    fn new() -> Self {
        Self { path: Vec::new() }
    }

    pub fn level(&self) -> usize {
        self.path.len()
    }
}

// ===== 索引本体 =====

/// 一棵打开的 NTFS 索引
///
/// 对应 ntfs3 的 `struct ntfs_index`。运行时缓存
/// $INDEX_ALLOCATION 的 runs；$BITMAP 小，按需整读整写。
pub struct NtfsIndex {
    pub name: Vec<u16>,
    pub rule: u32,
    block_size: u32,
    /// 每块折多少个 vbn 单位
    block_clst: u8,
    pub alloc_run: RunsTree,
    pub changed: bool,
}

impl NtfsIndex {
    /// 打开既有索引（$I30、$SII、……）
    ///
    /// 对应 `indx_init()` + `indx_get_root()`。
    pub fn open<D: BlockDevice, L: DeviceLock>(
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
        name: &[u16],
    ) -> Result<Self> {
        let h = ni
            .find_attr(fs, ATTR_ROOT, name, None)?
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "no index root"))?;
        let payload = ni.attr_view(h).resident_data()?;
        if payload.len() < IR_HDR + SIZEOF_INDEX_HDR {
            return Err(Error::new(ErrorKind::Corrupted, "index root too short"));
        }
        let rule = get_u32(payload, IR_RULE);
        let block_size = get_u32(payload, IR_BLOCK_SIZE);
        let block_clst = payload[IR_BLOCK_CLST];
        if !is_power_of2(block_size as u64) || block_size < 256 || block_clst == 0 {
            return Err(Error::new(ErrorKind::Corrupted, "bad index block geometry"));
        }

        let mut idx = Self {
            name: name.to_vec(),
            rule,
            block_size,
            block_clst,
            alloc_run: RunsTree::new(),
            changed: false,
        };
        if let Some(h) = ni.find_attr(fs, ATTR_ALLOC, name, None)? {
            ni.attr_view(h).load_runs(&mut idx.alloc_run)?;
        }
        Ok(idx)
    }

    /// 新建一棵空索引（根是空叶）
    pub fn create<D: BlockDevice, L: DeviceLock>(
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
        name: &[u16],
        type_: u32,
        rule: u32,
    ) -> Result<Self> {
        let block_size = fs.index_size;
        let block_clst = if block_size >= fs.cluster_size {
            (block_size / fs.cluster_size) as u8
        } else {
            (block_size / fs.sector_size) as u8
        };

        let last = build_de(0, &[], None, true);
        let mut payload = vec![0u8; IR_HDR + SIZEOF_INDEX_HDR];
        put_u32(&mut payload, IR_TYPE, type_);
        put_u32(&mut payload, IR_RULE, rule);
        put_u32(&mut payload, IR_BLOCK_SIZE, block_size);
        payload[IR_BLOCK_CLST] = block_clst;
        put_u32(&mut payload, IR_HDR + IH_DE_OFF, SIZEOF_INDEX_HDR as u32);
        put_u32(
            &mut payload,
            IR_HDR + IH_USED,
            (SIZEOF_INDEX_HDR + last.len()) as u32,
        );
        put_u32(
            &mut payload,
            IR_HDR + IH_TOTAL,
            (SIZEOF_INDEX_HDR + last.len()) as u32,
        );
        payload.extend_from_slice(&last);

        let h = ni.insert_resident(fs, payload.len(), ATTR_ROOT, name)?;
        let rec = ni.record_mut(h.rno).unwrap();
        rec.set_resident_data(h.off, &payload)?;

        Ok(Self {
            name: name.to_vec(),
            rule,
            block_size,
            block_clst,
            alloc_run: RunsTree::new(),
            changed: false,
        })
    }

    // ===== 节点 I/O =====

    fn read_root<D: BlockDevice, L: DeviceLock>(
        &self,
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
    ) -> Result<IndexNode> {
        let h = ni
            .find_attr(fs, ATTR_ROOT, &self.name.clone(), None)?
            .ok_or_else(|| Error::new(ErrorKind::Corrupted, "index root vanished"))?;
        Ok(IndexNode {
            id: NodeId::Root,
            buf: ni.attr_view(h).resident_data()?.to_vec(),
            hdr: IR_HDR,
        })
    }

    /// 根写回：常驻属性原地伸缩
    fn write_root<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
        node: &IndexNode,
    ) -> Result<()> {
        debug_assert_eq!(node.id, NodeId::Root);
        let h = ni
            .find_attr(fs, ATTR_ROOT, &self.name.clone(), None)?
            .ok_or_else(|| Error::new(ErrorKind::Corrupted, "index root vanished"))?;
        let attr = ni.attr_view(h);
        let name_len = attr.name_len();
        let data_off = quad_align(crate::record::SIZEOF_RESIDENT + name_len * 2);
        let new_asize = quad_align(data_off + node.buf.len());
        let old_asize = attr.size();

        let rec = ni.record_mut(h.rno).unwrap();
        rec.resize_attr(h.off, new_asize as isize - old_asize as isize)?;
        let buf = rec.attr_mut(h.off);
        put_u32(buf, 0x10, node.buf.len() as u32);
        buf[data_off..data_off + node.buf.len()].copy_from_slice(&node.buf);
        self.changed = true;
        Ok(())
    }

    fn vbn_to_vbo(&self, vbn: u64) -> u64 {
        (vbn / self.block_clst as u64) * self.block_size as u64
    }

    /// 读一个 INDX 块
    ///
    /// 对应 `indx_read()`。
    fn read_block<D: BlockDevice, L: DeviceLock>(
        &self,
        fs: &mut Ntfs<D, L>,
        vbn: u64,
    ) -> Result<IndexNode> {
        let mut buf = vec![0u8; self.block_size as usize];
        self.alloc_run
            .read_vbo(&mut fs.bdev, fs.cluster_bits, self.vbn_to_vbo(vbn), &mut buf)?;
        if buf[0..4] != NTFS_INDX_SIGNATURE {
            fs.set_state(crate::fs::NtfsState::Error).ok();
            return Err(Error::new(ErrorKind::Corrupted, "bad INDX signature"));
        }
        fixup::fix_post_read(&mut buf, fs.sector_size as usize, false)?;
        if get_u64(&buf, IB_VBN) != vbn {
            fs.set_state(crate::fs::NtfsState::Error).ok();
            return Err(Error::new(ErrorKind::Corrupted, "INDX block vbn mismatch"));
        }
        Ok(IndexNode {
            id: NodeId::Block(vbn),
            buf,
            hdr: IB_HDR,
        })
    }

    fn write_block<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        node: &mut IndexNode,
    ) -> Result<()> {
        let NodeId::Block(vbn) = node.id else {
            return Err(Error::new(ErrorKind::InvalidInput, "not a block node"));
        };
        if !fixup::fix_pre_write(&mut node.buf, fs.sector_size as usize) {
            return Err(Error::new(ErrorKind::Corrupted, "INDX fixup header broken"));
        }
        let res = self.alloc_run.write_vbo(
            &mut fs.bdev,
            fs.cluster_bits,
            self.vbn_to_vbo(vbn),
            &node.buf,
            false,
        );
        fixup::fix_post_read(&mut node.buf, fs.sector_size as usize, true)?;
        self.changed = true;
        res
    }

    /// 组装一个空 INDX 块
    fn new_block(&self, fs_sector: usize, vbn: u64) -> IndexNode {
        let bs = self.block_size as usize;
        let usa_count = bs / fs_sector + 1;
        let usa_off = 0x28usize;
        let de_off = quad_align(usa_off + usa_count * 2 - IB_HDR);
        let last = build_de(0, &[], None, true);

        let mut buf = vec![0u8; bs];
        buf[0..4].copy_from_slice(&NTFS_INDX_SIGNATURE);
        put_u16(&mut buf, 4, usa_off as u16);
        put_u16(&mut buf, 6, usa_count as u16);
        put_u64(&mut buf, IB_VBN, vbn);
        put_u32(&mut buf, IB_HDR + IH_DE_OFF, de_off as u32);
        put_u32(&mut buf, IB_HDR + IH_USED, (de_off + last.len()) as u32);
        put_u32(&mut buf, IB_HDR + IH_TOTAL, (bs - IB_HDR) as u32);
        buf[IB_HDR + de_off..IB_HDR + de_off + last.len()].copy_from_slice(&last);

        IndexNode {
            id: NodeId::Block(vbn),
            buf,
            hdr: IB_HDR,
        }
    }

    // ===== $BITMAP 维护 =====

    fn bitmap_bytes<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
    ) -> Result<Vec<u8>> {
        let name = self.name.clone();
        let Some(h) = ni.find_attr(fs, ATTR_BITMAP, &name, None)? else {
            return Ok(Vec::new());
        };
        let attr = ni.attr_view(h);
        if attr.is_nonresident() {
            let mut run = RunsTree::new();
            attr.load_runs(&mut run)?;
            let mut buf = vec![0u8; attr.data_size() as usize];
            run.read_vbo(&mut fs.bdev, fs.cluster_bits, 0, &mut buf)?;
            Ok(buf)
        } else {
            Ok(attr.resident_data()?.to_vec())
        }
    }

    fn write_bitmap<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
        bytes: &[u8],
    ) -> Result<()> {
        let name = self.name.clone();
        let h = ni
            .find_attr(fs, ATTR_BITMAP, &name, None)?
            .ok_or_else(|| Error::new(ErrorKind::Corrupted, "index bitmap vanished"))?;
        let attr = ni.attr_view(h);
        if attr.is_nonresident() {
            let mut run = RunsTree::new();
            attr.load_runs(&mut run)?;
            run.write_vbo(&mut fs.bdev, fs.cluster_bits, 0, bytes, false)
        } else {
            let rec = ni.record_mut(h.rno).unwrap();
            rec.set_resident_data(h.off, bytes)
        }
    }

    /// 占一个空闲块，必要时扩 $INDEX_ALLOCATION / $BITMAP
    ///
    /// 对应 `indx_add_allocate()`。
    fn add_allocate<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
    ) -> Result<u64> {
        let name = self.name.clone();

        // 首个块：建 $BITMAP + $INDEX_ALLOCATION
        if ni.find_attr(fs, ATTR_BITMAP, &name, None)?.is_none() {
            let h = ni.insert_resident(fs, 8, ATTR_BITMAP, &name)?;
            let rec = ni.record_mut(h.rno).unwrap();
            rec.set_resident_data(h.off, &[0u8; 8])?;
            let empty = RunsTree::new();
            ni.insert_nonresident(fs, ATTR_ALLOC, &name, &empty, 0, 0, 0)?;
        }

        let alloc_size = match ni.find_attr(fs, ATTR_ALLOC, &name, None)? {
            Some(h) => ni.attr_view(h).data_size(),
            None => 0,
        };
        let blocks = (alloc_size / self.block_size as u64) as usize;
        let mut bmp = self.bitmap_bytes(fs, ni)?;

        let bit = (0..blocks).find(|&i| bmp[i / 8] & (1 << (i % 8)) == 0);
        let bit = match bit {
            Some(b) => b,
            None => {
                // 扩一个块
                let mut run = core::mem::take(&mut self.alloc_run);
                let res = ni.attr_set_size(
                    fs,
                    ATTR_ALLOC,
                    &name,
                    &mut run,
                    (blocks as u64 + 1) * self.block_size as u64,
                );
                self.alloc_run = run;
                res?;
                // 位图覆盖不了就扩 8 字节
                if blocks / 8 >= bmp.len() {
                    let mut lrun = RunsTree::new();
                    ni.attr_set_size(
                        fs,
                        ATTR_BITMAP,
                        &name,
                        &mut lrun,
                        bmp.len() as u64 + 8,
                    )?;
                    bmp.resize(bmp.len() + 8, 0);
                }
                blocks
            }
        };

        bmp[bit / 8] |= 1 << (bit % 8);
        self.write_bitmap(fs, ni, &bmp)?;
        Ok((bit as u64) * self.block_clst as u64)
    }

    /// 归还一个块
    ///
    /// 对应 `indx_mark_free()`。
    fn mark_free<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
        vbn: u64,
    ) -> Result<()> {
        let bit = (vbn / self.block_clst as u64) as usize;
        let mut bmp = self.bitmap_bytes(fs, ni)?;
        if bit / 8 < bmp.len() {
            bmp[bit / 8] &= !(1 << (bit % 8));
            self.write_bitmap(fs, ni, &bmp)?;
        }
        Ok(())
    }

    /// 在用块的 vbn 列表（测试与 find_raw 用）
    pub fn used_blocks<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
    ) -> Result<Vec<u64>> {
        let bmp = self.bitmap_bytes(fs, ni)?;
        Ok((0..bmp.len() * 8)
            .filter(|&i| bmp[i / 8] & (1 << (i % 8)) != 0)
            .map(|i| (i as u64) * self.block_clst as u64)
            .collect())
    }

    // ===== 查找 =====

    /// 从根下降到 `key`
    ///
    /// 返回 `(fnd, exact)`；`fnd` 栈顶是命中项或插入点。
    /// 对应 `indx_find()`。
    pub fn find<D: BlockDevice, L: DeviceLock>(
        &self,
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
        key: &[u8],
    ) -> Result<(Finder, bool)> {
        let mut fnd = Finder::new();
        let mut node = self.read_root(fs, ni)?;

        for _ in 0..MAX_INDEX_DEPTH {
            let mut descend: Option<(usize, Option<u64>)> = None;
            for off in node.entry_offs() {
                if de_is_last(&node.buf, off) {
                    let sub = de_has_sub(&node.buf, off).then(|| de_sub_vbn(&node.buf, off));
                    descend = Some((off, sub));
                    break;
                }
                match cmp_keys(self.rule, &fs.upcase, key, de_key(&node.buf, off)) {
                    core::cmp::Ordering::Equal => {
                        fnd.path.push((node, off));
                        return Ok((fnd, true));
                    }
                    core::cmp::Ordering::Less => {
                        let sub = de_has_sub(&node.buf, off).then(|| de_sub_vbn(&node.buf, off));
                        descend = Some((off, sub));
                        break;
                    }
                    core::cmp::Ordering::Greater => {}
                }
            }
            let (off, sub) = descend
                .ok_or_else(|| Error::new(ErrorKind::Corrupted, "index node without last"))?;
            match sub {
                Some(vbn) => {
                    let child = self.read_block(fs, vbn)?;
                    fnd.path.push((node, off));
                    node = child;
                }
                None => {
                    fnd.path.push((node, off));
                    return Ok((fnd, false));
                }
            }
        }
        Err(Error::new(ErrorKind::Corrupted, "index too deep"))
    }

    /// 精确查找并取快照
    pub fn lookup<D: BlockDevice, L: DeviceLock>(
        &self,
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
        key: &[u8],
    ) -> Result<Option<DeEntry>> {
        let (fnd, exact) = self.find(fs, ni, key)?;
        if !exact {
            return Ok(None);
        }
        let (node, off) = fnd.path.last().unwrap();
        Ok(Some(snapshot(self.rule, &node.buf, *off)))
    }

    // ===== 插入 =====

    /// 插入一个项
    ///
    /// 节点满则分裂：新块接走下半区，中位项带着指针上浮；根
    /// 溢出时根内容整体下沉到新块，树高 +1。键已存在返回
    /// `exists`。对应 `indx_insert_entry()`。
    pub fn insert_entry<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
        ref_: u64,
        key: &[u8],
    ) -> Result<()> {
        fs.assert_writable()?;
        fs.mark_dirty_for_write()?;

        let de = build_de(ref_, key, None, false);
        self.insert_de(fs, ni, de, key)
    }

    /// 插入一个视图项（键 + 负载）
    pub fn insert_view<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
        key: &[u8],
        data: &[u8],
    ) -> Result<()> {
        fs.assert_writable()?;
        fs.mark_dirty_for_write()?;
        let de = build_de_view(key, data, false);
        self.insert_de(fs, ni, de, key)
    }

    fn insert_de<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
        de: Vec<u8>,
        key: &[u8],
    ) -> Result<()> {
        let (fnd, exact) = self.find(fs, ni, key)?;
        if exact {
            return Err(Error::from_kind(ErrorKind::Exists));
        }
        let mut path = fnd.path;
        let level = path.len() - 1;
        self.insert_at_level(fs, ni, &mut path, level, de)
    }

    /// 在 `path[level]` 的插入点放入 `de`，处理分裂与上浮
    fn insert_at_level<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
        path: &mut Vec<(IndexNode, usize)>,
        level: usize,
        de: Vec<u8>,
    ) -> Result<()> {
        let (node, off) = &mut path[level];
        let at = *off;

        if node.insert_at(at, &de) {
            match node.id {
                NodeId::Root => {
                    let root = core::mem::replace(
                        node,
                        IndexNode {
                            id: NodeId::Root,
                            buf: Vec::new(),
                            hdr: IR_HDR,
                        },
                    );
                    match self.write_root(fs, ni, &root) {
                        Ok(()) => return Ok(()),
                        Err(e) if e.kind() == ErrorKind::NoRoom => {
                            // 根装不进记录：整体下沉
                            return self.demote_root(fs, ni, root);
                        }
                        Err(e) => return Err(e),
                    }
                }
                NodeId::Block(_) => {
                    let mut node = core::mem::replace(
                        node,
                        IndexNode {
                            id: NodeId::Root,
                            buf: Vec::new(),
                            hdr: IR_HDR,
                        },
                    );
                    return self.write_block(fs, &mut node);
                }
            }
        }

        // 块满：分裂
        self.split_block(fs, ni, path, level, de)
    }

    /// 根整体下沉到一个新块，根只剩带指针的 LAST 项
    fn demote_root<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
        root: IndexNode,
    ) -> Result<()> {
        let vbn = self.add_allocate(fs, ni)?;
        let mut block = self.new_block(fs.sector_size as usize, vbn);

        // 根的全部项（含 LAST）搬进新块
        let mut insert_pos = block.first_off();
        let offs = root.entry_offs();
        // 先摘掉新块自带的 LAST
        block.remove_at(insert_pos);
        let mut any_sub = false;
        for off in offs {
            let size = de_size(&root.buf, off);
            any_sub |= de_has_sub(&root.buf, off);
            if !block.insert_at(insert_pos, &root.buf[off..off + size]) {
                return Err(Error::new(ErrorKind::Corrupted, "root does not fit a block"));
            }
            insert_pos += size;
        }
        block.set_subnodes(any_sub);
        self.write_block(fs, &mut block)?;

        let last = build_de(0, &[], Some(vbn), true);
        let mut new_root = IndexNode {
            id: NodeId::Root,
            buf: root.buf[..IR_HDR + SIZEOF_INDEX_HDR].to_vec(),
            hdr: IR_HDR,
        };
        put_u32(
            &mut new_root.buf,
            IR_HDR + IH_USED,
            (SIZEOF_INDEX_HDR + last.len()) as u32,
        );
        put_u32(
            &mut new_root.buf,
            IR_HDR + IH_TOTAL,
            (SIZEOF_INDEX_HDR + last.len()) as u32,
        );
        put_u32(&mut new_root.buf, IR_HDR + IH_DE_OFF, SIZEOF_INDEX_HDR as u32);
        new_root.buf.truncate(IR_HDR + SIZEOF_INDEX_HDR);
        new_root.buf.extend_from_slice(&last);
        new_root.set_subnodes(true);
        self.write_root(fs, ni, &new_root)
    }

    /// 分裂 `path[level]` 的块：左半区进新块，中位项上浮
    fn split_block<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
        path: &mut Vec<(IndexNode, usize)>,
        level: usize,
        de: Vec<u8>,
    ) -> Result<()> {
        let (node, at) = {
            let (n, off) = &path[level];
            (n, *off)
        };

        // 排好序的全部项（新项就位），LAST 单独留着
        let mut entries: Vec<Vec<u8>> = Vec::new();
        let mut last_bytes: Vec<u8> = Vec::new();
        for off in node.entry_offs() {
            let size = de_size(&node.buf, off);
            if off == at {
                entries.push(de.clone());
            }
            if de_is_last(&node.buf, off) {
                last_bytes = node.buf[off..off + size].to_vec();
            } else {
                entries.push(node.buf[off..off + size].to_vec());
            }
        }
        if entries.len() < 2 {
            return Err(Error::new(ErrorKind::Corrupted, "cannot split tiny node"));
        }

        let mid = entries.len() / 2;
        let median = entries[mid].clone();

        // 新块拿左半区；中位项原有的子树成为新块 LAST 的子树
        let new_vbn = self.add_allocate(fs, ni)?;
        let mut left = self.new_block(fs.sector_size as usize, new_vbn);
        let m_sub = de_has_sub(&median, 0).then(|| de_sub_vbn(&median, 0));
        {
            let first = left.first_off();
            left.remove_at(first);
            let mut pos = first;
            for e in &entries[..mid] {
                if !left.insert_at(pos, e) {
                    return Err(Error::new(ErrorKind::Corrupted, "split half too big"));
                }
                pos += e.len();
            }
            let new_last = build_de(0, &[], m_sub, true);
            if !left.insert_at(pos, &new_last) {
                return Err(Error::new(ErrorKind::Corrupted, "split half too big"));
            }
            if entries[..mid].iter().any(|e| de_has_sub(e, 0)) || m_sub.is_some() {
                left.set_subnodes(true);
            }
        }
        self.write_block(fs, &mut left)?;

        // 旧块保留右半区 + 原 LAST
        {
            let (node, _) = &mut path[level];
            let NodeId::Block(vbn) = node.id else {
                return Err(Error::new(ErrorKind::Corrupted, "split root as block"));
            };
            let mut right = self.new_block(fs.sector_size as usize, vbn);
            let first = right.first_off();
            right.remove_at(first);
            let mut pos = first;
            for e in &entries[mid + 1..] {
                if !right.insert_at(pos, e) {
                    return Err(Error::new(ErrorKind::Corrupted, "split half too big"));
                }
                pos += e.len();
            }
            if !right.insert_at(pos, &last_bytes) {
                return Err(Error::new(ErrorKind::Corrupted, "split half too big"));
            }
            if entries[mid + 1..].iter().any(|e| de_has_sub(e, 0)) || de_has_sub(&last_bytes, 0) {
                right.set_subnodes(true);
            }
            self.write_block(fs, &mut right)?;
        }

        // 中位项带新块指针上浮（整项复制，视图负载保留）
        let promoted = de_adjust_sub(&median, Some(new_vbn));

        if level == 0 {
            // 上面没有了：根自身在 path[0]
            return Err(Error::new(ErrorKind::Corrupted, "block split at root level"));
        }
        let parent_level = level - 1;
        // 父节点此刻仍未被改动；其 HAS_SUBNODES 必然已置位
        path.truncate(level);
        self.insert_at_level(fs, ni, path, parent_level, promoted)
    }

    // ===== 删除 =====

    /// 删除一个键
    ///
    /// 内部项先与中序前驱换位（前驱自己的子树重新挂回原节点
    /// 的 LAST）；掏空的叶和空链立即归还位图并摘掉父项的指针。
    /// 对应 `indx_delete_entry()`。
    pub fn delete_entry<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
        key: &[u8],
    ) -> Result<()> {
        fs.assert_writable()?;
        fs.mark_dirty_for_write()?;

        let (fnd, exact) = self.find(fs, ni, key)?;
        if !exact {
            return Err(Error::from_kind(ErrorKind::NotFound));
        }
        let mut path = fnd.path;
        let level = path.len() - 1;
        let (node, off) = &path[level];
        let at = *off;

        if !de_has_sub(&node.buf, at) {
            // 叶内直接摘
            let (node, _) = &mut path[level];
            node.remove_at(at);
            self.flush_node(fs, ni, path, level)?;
            return Ok(());
        }

        // 内部项：中序前驱 = 子树里最大的键。沿 LAST 链下行，
        // 前驱在链上最深的、还有普通项的那个节点里。
        let sub = de_sub_vbn(&node.buf, at);
        let mut down: Vec<IndexNode> = Vec::new();
        let mut cur = self.read_block(fs, sub)?;
        loop {
            let offs = cur.entry_offs();
            let last_off = *offs
                .last()
                .ok_or_else(|| Error::new(ErrorKind::Corrupted, "empty index node"))?;
            let next = de_has_sub(&cur.buf, last_off).then(|| de_sub_vbn(&cur.buf, last_off));
            down.push(cur);
            match next {
                Some(vbn) => cur = self.read_block(fs, vbn)?,
                None => break,
            }
        }

        let pidx = down.iter().rposition(|n| n.count() > 0);
        let Some(pi) = pidx else {
            // 整棵子树是空节点链：摘掉指针、整链归还，然后按
            // 叶项重删一次
            let stripped = de_with_sub(&node.buf, at, None);
            let (node, _) = &mut path[level];
            node.remove_at(at);
            node.insert_at(at, &stripped);
            self.flush_node(fs, ni, path, level)?;
            self.reclaim_chain(fs, ni, down)?;
            return self.delete_entry(fs, ni, key);
        };

        // 前驱 = p 节点里 LAST 之前的最后一个普通项
        let pnode_offs = down[pi].entry_offs();
        let pred_off = pnode_offs[pnode_offs.len() - 2];
        let pred = {
            let size = de_size(&down[pi].buf, pred_off);
            down[pi].buf[pred_off..pred_off + size].to_vec()
        };
        let pred_sub = de_has_sub(&pred, 0).then(|| de_sub_vbn(&pred, 0));

        // 从 p 节点摘掉前驱；前驱自己的子树改挂到 p 节点的
        // LAST 上，原先挂在 LAST 上的空链归还
        {
            let down_len = down.len();
            let pnode = &mut down[pi];
            pnode.remove_at(pred_off);
            if pred_sub.is_some() || pi + 1 < down_len {
                // 摘除后 LAST 正好落在 pred_off
                let new_last = de_with_sub(&pnode.buf, pred_off, pred_sub);
                pnode.remove_at(pred_off);
                pnode.insert_at(pred_off, &new_last);
                let any_sub = pnode
                    .entry_offs()
                    .iter()
                    .any(|&o| de_has_sub(&pnode.buf, o));
                pnode.set_subnodes(any_sub);
            }
            let mut n = core::mem::replace(
                pnode,
                IndexNode {
                    id: NodeId::Root,
                    buf: Vec::new(),
                    hdr: IR_HDR,
                },
            );
            self.write_block(fs, &mut n)?;
            down[pi] = n;
        }
        // 空链归还
        let tail: Vec<IndexNode> = down.drain(pi + 1..).collect();
        self.reclaim_chain(fs, ni, tail)?;

        // 被删项换成前驱（vbn 换成被删项的子树，整项复制）
        let replacement = de_adjust_sub(&pred, Some(sub));
        {
            let (node, _) = &mut path[level];
            node.remove_at(at);
        }
        self.insert_at_level(fs, ni, &mut path, level, replacement)?;

        // p 节点即使掏空也先留着：replacement 的指针还指向链头，
        // 彻底空掉的链由下一次经过它的删除统一归还
        Ok(())
    }

    /// 写回 `path[level]`，随后做空块回收检查
    fn flush_node<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
        mut path: Vec<(IndexNode, usize)>,
        level: usize,
    ) -> Result<()> {
        let empty = {
            let (node, _) = &path[level];
            matches!(node.id, NodeId::Block(_))
                && node.count() == 0
                && !de_has_sub(&node.buf, node.entry_offs()[0])
        };

        if !empty {
            let (node, _) = &mut path[level];
            match node.id {
                NodeId::Root => {
                    let root = core::mem::replace(
                        node,
                        IndexNode {
                            id: NodeId::Root,
                            buf: Vec::new(),
                            hdr: IR_HDR,
                        },
                    );
                    return self.write_root(fs, ni, &root);
                }
                NodeId::Block(_) => {
                    let mut n = core::mem::replace(
                        node,
                        IndexNode {
                            id: NodeId::Root,
                            buf: Vec::new(),
                            hdr: IR_HDR,
                        },
                    );
                    self.write_block(fs, &mut n)?;
                    let keep = path[level].1;
                    path[level] = (n, keep);
                    return Ok(());
                }
            }
        }

        // 空块：归还并摘掉父项的指针
        let (node, _) = path.remove(level);
        let NodeId::Block(vbn) = node.id else {
            unreachable!()
        };
        self.mark_free(fs, ni, vbn)?;

        let parent_level = level - 1;
        let (parent, poff) = &mut path[parent_level];
        let stripped = de_with_sub(&parent.buf, *poff, None);
        let p_at = *poff;
        parent.remove_at(p_at);
        parent.insert_at(p_at, &stripped);
        // 父节点可能不再有任何子树
        let any_sub = parent
            .entry_offs()
            .iter()
            .any(|&o| de_has_sub(&parent.buf, o));
        if !any_sub {
            parent.set_subnodes(false);
        }
        self.flush_node(fs, ni, path, parent_level)
    }

    /// 归还一串（空的）下降节点
    fn reclaim_chain<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
        chain: Vec<IndexNode>,
    ) -> Result<()> {
        for node in chain {
            if let NodeId::Block(vbn) = node.id {
                self.mark_free(fs, ni, vbn)?;
            }
        }
        Ok(())
    }

    // ===== 遍历 =====

    /// 按键序收集全部项
    ///
    /// 对应 `indx_find_sort()` 的全量扫描形态。
    pub fn iter_sorted<D: BlockDevice, L: DeviceLock>(
        &self,
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
    ) -> Result<Vec<DeEntry>> {
        let root = self.read_root(fs, ni)?;
        let mut out = Vec::new();
        self.collect_in_order(fs, &root, &mut out, 0)?;
        Ok(out)
    }

    fn collect_in_order<D: BlockDevice, L: DeviceLock>(
        &self,
        fs: &mut Ntfs<D, L>,
        node: &IndexNode,
        out: &mut Vec<DeEntry>,
        depth: usize,
    ) -> Result<()> {
        if depth > MAX_INDEX_DEPTH {
            return Err(Error::new(ErrorKind::Corrupted, "index too deep"));
        }
        for off in node.entry_offs() {
            if de_has_sub(&node.buf, off) {
                let child = self.read_block(fs, de_sub_vbn(&node.buf, off))?;
                self.collect_in_order(fs, &child, out, depth + 1)?;
            }
            if !de_is_last(&node.buf, off) {
                out.push(snapshot(self.rule, &node.buf, off));
            }
        }
        Ok(())
    }

    /// 按块上磁盘序收集（readdir 位置语义）
    ///
    /// 对应 `indx_find_raw()`。
    pub fn iter_raw<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
    ) -> Result<Vec<DeEntry>> {
        let mut out = Vec::new();
        let root = self.read_root(fs, ni)?;
        for off in root.entry_offs() {
            if !de_is_last(&root.buf, off) {
                out.push(snapshot(self.rule, &root.buf, off));
            }
        }
        for vbn in self.used_blocks(fs, ni)? {
            let node = self.read_block(fs, vbn)?;
            for off in node.entry_offs() {
                if !de_is_last(&node.buf, off) {
                    out.push(snapshot(self.rule, &node.buf, off));
                }
            }
        }
        Ok(out)
    }

    /// 目录是否为空
    pub fn is_empty<D: BlockDevice, L: DeviceLock>(
        &self,
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
    ) -> Result<bool> {
        Ok(self.iter_sorted(fs, ni)?.is_empty())
    }

    /// 结构自检：键序 + 位图与可达块集合一致
    ///
    /// fsck 路径和测试用。
    pub fn verify<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
    ) -> Result<bool> {
        // 键序
        let entries = self.iter_sorted(fs, ni)?;
        for w in entries.windows(2) {
            if cmp_keys(self.rule, &fs.upcase, &w[0].key, &w[1].key)
                != core::cmp::Ordering::Less
            {
                warn!("index entries out of order");
                return Ok(false);
            }
        }

        // 可达块集合
        let mut reached = Vec::new();
        let root = self.read_root(fs, ni)?;
        self.collect_blocks(fs, &root, &mut reached, 0)?;
        reached.sort_unstable();

        let mut used = self.used_blocks(fs, ni)?;
        used.sort_unstable();
        if reached != used {
            warn!("index bitmap disagrees with reachable blocks");
            return Ok(false);
        }
        Ok(true)
    }

    fn collect_blocks<D: BlockDevice, L: DeviceLock>(
        &self,
        fs: &mut Ntfs<D, L>,
        node: &IndexNode,
        out: &mut Vec<u64>,
        depth: usize,
    ) -> Result<()> {
        if depth > MAX_INDEX_DEPTH {
            return Err(Error::new(ErrorKind::Corrupted, "index too deep"));
        }
        for off in node.entry_offs() {
            if de_has_sub(&node.buf, off) {
                let vbn = de_sub_vbn(&node.buf, off);
                out.push(vbn);
                let child = self.read_block(fs, vbn)?;
                self.collect_blocks(fs, &child, out, depth + 1)?;
            }
        }
        Ok(())
    }

    /// 刷新目录项里的冗余元数据
    ///
    /// 文件尺寸 / 时间变化后，父目录 $I30 项内嵌的 dup 信息
    /// 要跟着改。对应 `indx_update_dup()`。
    pub fn update_dup<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ni: &mut NtfsInode,
        fname: &FileName,
        dup: &DupInfo,
    ) -> Result<()> {
        fs.assert_writable()?;
        fs.mark_dirty_for_write()?;

        let key = fname.to_bytes();
        let (mut fnd, exact) = self.find(fs, ni, &key)?;
        if !exact {
            return Err(Error::from_kind(ErrorKind::NotFound));
        }
        let level = fnd.path.len() - 1;
        let (node, off) = &mut fnd.path[level];
        let key_off = *off + DE_KEY;

        let mut updated = fname.clone();
        updated.dup = *dup;
        updated.write_dup(&mut node.buf[key_off..]);

        self.flush_node(fs, ni, fnd.path, level)
    }
}
