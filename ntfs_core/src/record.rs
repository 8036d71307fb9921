//! MFT 记录引擎
//!
//! 对应 ntfs3 的 `record.c`。一条定长记录（通常 1024 字节）的
//! 内存镜像：头部 + 以 `ATTR_END` 结尾的属性流。所有属性访问
//! 都走带界检查的偏移视图，记录内属性按（类型、名字、id）的
//! 规范序排列。

use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::fixup;
use crate::run::RunsTree;
use crate::types::*;
use alloc::vec;
use alloc::vec::Vec;

// 记录头偏移
const MR_SIGN: usize = 0x00;
const MR_FIXUP_OFF: usize = 0x04;
const MR_FIXUP_NUM: usize = 0x06;
const MR_SEQ: usize = 0x10;
const MR_HARD_LINKS: usize = 0x12;
const MR_ATTR_OFF: usize = 0x14;
const MR_FLAGS: usize = 0x16;
const MR_USED: usize = 0x18;
const MR_TOTAL: usize = 0x1C;
const MR_PARENT_REF: usize = 0x20;
const MR_NEXT_ATTR_ID: usize = 0x28;
const MR_RECORD_NUM: usize = 0x2C;

/// 记录在用
pub const RECORD_FLAG_IN_USE: u16 = 0x0001;
/// 记录是目录
pub const RECORD_FLAG_DIR: u16 = 0x0002;

// 属性头偏移
const AH_TYPE: usize = 0x00;
const AH_SIZE: usize = 0x04;
const AH_NON_RES: usize = 0x08;
const AH_NAME_LEN: usize = 0x09;
const AH_NAME_OFF: usize = 0x0A;
const AH_FLAGS: usize = 0x0C;
const AH_ID: usize = 0x0E;
// 常驻
const AH_RES_DATA_SIZE: usize = 0x10;
const AH_RES_DATA_OFF: usize = 0x14;
// 非常驻
const AH_NRES_SVCN: usize = 0x10;
const AH_NRES_EVCN: usize = 0x18;
const AH_NRES_RUN_OFF: usize = 0x20;
const AH_NRES_ALLOC_SIZE: usize = 0x28;
const AH_NRES_DATA_SIZE: usize = 0x30;
const AH_NRES_VALID_SIZE: usize = 0x38;
const AH_NRES_TOTAL_SIZE: usize = 0x40;

/// 常驻属性头大小
pub const SIZEOF_RESIDENT: usize = 0x18;
/// 非常驻属性头大小（无 total_size 字段）
pub const SIZEOF_NONRESIDENT: usize = 0x40;
/// 非常驻属性头大小（带 total_size，压缩/稀疏流）
pub const SIZEOF_NONRESIDENT_EX: usize = 0x48;

/// 属性标志
pub const ATTR_FLAG_COMPRESSED: u16 = 0x0001;
pub const ATTR_FLAG_ENCRYPTED: u16 = 0x4000;
pub const ATTR_FLAG_SPARSED: u16 = 0x8000;

/// 属性只读视图：记录缓冲内 `[off, off+size)` 的切片
#[derive(Clone, Copy)]
pub struct Attr<'a> {
    buf: &'a [u8],
}

impl<'a> Attr<'a> {
    pub fn type_(&self) -> u32 {
        get_u32(self.buf, AH_TYPE)
    }

    pub fn size(&self) -> usize {
        get_u32(self.buf, AH_SIZE) as usize
    }

    pub fn is_nonresident(&self) -> bool {
        self.buf[AH_NON_RES] != 0
    }

    pub fn name_len(&self) -> usize {
        self.buf[AH_NAME_LEN] as usize
    }

    pub fn name(&self) -> Vec<u16> {
        let off = get_u16(self.buf, AH_NAME_OFF) as usize;
        get_utf16(self.buf, off, self.name_len())
    }

    pub fn flags(&self) -> u16 {
        get_u16(self.buf, AH_FLAGS)
    }

    pub fn id(&self) -> u16 {
        get_u16(self.buf, AH_ID)
    }

    pub fn is_sparsed(&self) -> bool {
        self.flags() & ATTR_FLAG_SPARSED != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.flags() & ATTR_FLAG_COMPRESSED != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags() & ATTR_FLAG_ENCRYPTED != 0
    }

    // ----- 常驻 -----

    pub fn res_data_size(&self) -> u32 {
        debug_assert!(!self.is_nonresident());
        get_u32(self.buf, AH_RES_DATA_SIZE)
    }

    /// 常驻负载，带界检查
    pub fn resident_data(&self) -> Result<&'a [u8]> {
        let off = get_u16(self.buf, AH_RES_DATA_OFF) as usize;
        let size = self.res_data_size() as usize;
        if self.is_nonresident() || off + size > self.buf.len() {
            return Err(Error::new(ErrorKind::Corrupted, "bad resident data bounds"));
        }
        Ok(&self.buf[off..off + size])
    }

    // ----- 非常驻 -----

    pub fn svcn(&self) -> CLST {
        get_u64(self.buf, AH_NRES_SVCN) as CLST
    }

    pub fn evcn(&self) -> CLST {
        get_u64(self.buf, AH_NRES_EVCN) as CLST
    }

    pub fn alloc_size(&self) -> u64 {
        get_u64(self.buf, AH_NRES_ALLOC_SIZE)
    }

    pub fn data_size(&self) -> u64 {
        if self.is_nonresident() {
            get_u64(self.buf, AH_NRES_DATA_SIZE)
        } else {
            self.res_data_size() as u64
        }
    }

    pub fn valid_size(&self) -> u64 {
        get_u64(self.buf, AH_NRES_VALID_SIZE)
    }

    /// 打包 runs 区
    pub fn run_buf(&self) -> Result<&'a [u8]> {
        let off = get_u16(self.buf, AH_NRES_RUN_OFF) as usize;
        if !self.is_nonresident() || off > self.buf.len() {
            return Err(Error::new(ErrorKind::Corrupted, "bad run buffer bounds"));
        }
        Ok(&self.buf[off..])
    }

    /// 把本分片的 runs 解进树
    pub fn load_runs(&self, run: &mut RunsTree) -> Result<()> {
        let svcn = self.svcn();
        let evcn = self.evcn();
        // 空属性（evcn == svcn - 1）没有 runs 可解
        if evcn == svcn.wrapping_sub(1) {
            return Ok(());
        }
        run.unpack(self.run_buf()?, svcn, evcn)
    }
}

/// 一条 MFT 记录的内存镜像
///
/// 对应 ntfs3 的 `struct mft_inode`。
pub struct MftRecord {
    pub rno: CLST,
    buf: Vec<u8>,
    sector_size: usize,
    pub dirty: bool,
}

impl MftRecord {
    /// 从盘上镜像构造：撤销 fixup 并做完整性校验
    ///
    /// 对应 `mi_read()` 的解码部分。`rno` 必须与记录自述一致。
    pub fn from_bytes(rno: CLST, mut buf: Vec<u8>, sector_size: usize) -> Result<Self> {
        let bad = |m| Error::new(ErrorKind::Corrupted, m);

        if buf.len() < 0x38 || buf.len() % sector_size != 0 {
            return Err(bad("bad record size"));
        }
        if buf[MR_SIGN..MR_SIGN + 4] != NTFS_FILE_SIGNATURE {
            return Err(bad("bad FILE signature"));
        }
        fixup::fix_post_read(&mut buf, sector_size, false)?;

        let total = get_u32(&buf, MR_TOTAL) as usize;
        let used = get_u32(&buf, MR_USED) as usize;
        let attr_off = get_u16(&buf, MR_ATTR_OFF) as usize;
        if total != buf.len() || used > total || attr_off >= used || attr_off % 8 != 0 {
            return Err(bad("bad record header sizes"));
        }

        // 3.1 布局带自述记录号
        let fo = get_u16(&buf, MR_FIXUP_OFF) as usize;
        if fo >= MR_RECORD_NUM + 4 && get_u32(&buf, MR_RECORD_NUM) != rno {
            return Err(bad("record number mismatch"));
        }

        Ok(Self {
            rno,
            buf,
            sector_size,
            dirty: false,
        })
    }

    /// 创建一条空白有效记录
    ///
    /// `seq` 传上一代序列号，内部自增并处理 0 → 1 回绕。
    /// 对应 `mi_format_new()`。
    pub fn format_new(
        rno: CLST,
        record_size: usize,
        sector_size: usize,
        seq: u16,
        flags: u16,
    ) -> Self {
        let mut buf = vec![0u8; record_size];
        let usa_count = record_size / sector_size + 1;
        let usa_off = MR_RECORD_NUM + 4;
        let attr_off = quad_align(usa_off + usa_count * 2);

        let mut new_seq = seq.wrapping_add(1);
        if new_seq == 0 {
            new_seq = 1;
        }

        buf[MR_SIGN..MR_SIGN + 4].copy_from_slice(&NTFS_FILE_SIGNATURE);
        put_u16(&mut buf, MR_FIXUP_OFF, usa_off as u16);
        put_u16(&mut buf, MR_FIXUP_NUM, usa_count as u16);
        put_u16(&mut buf, MR_SEQ, new_seq);
        put_u16(&mut buf, MR_ATTR_OFF, attr_off as u16);
        put_u16(&mut buf, MR_FLAGS, flags | RECORD_FLAG_IN_USE);
        put_u32(&mut buf, MR_USED, (attr_off + 8) as u32);
        put_u32(&mut buf, MR_TOTAL, record_size as u32);
        put_u32(&mut buf, MR_RECORD_NUM, rno);
        put_u32(&mut buf, attr_off, ATTR_END);

        Self {
            rno,
            buf,
            sector_size,
            dirty: true,
        }
    }

    /// 生成写盘镜像：套上 fixup
    ///
    /// 序列号递增保留在内存镜像里，因此连续两次 `write_image`
    /// 产生不同的 USN。对应 `mi_write()` 的编码部分。
    pub fn write_image(&mut self) -> Result<Vec<u8>> {
        if !fixup::fix_pre_write(&mut self.buf, self.sector_size) {
            return Err(Error::new(ErrorKind::Corrupted, "record fixup header broken"));
        }
        let image = self.buf.clone();
        // 内存镜像立即还原成解码形态
        fixup::fix_post_read(&mut self.buf, self.sector_size, true)?;
        Ok(image)
    }

    // ----- 头部字段 -----

    pub fn seq(&self) -> u16 {
        get_u16(&self.buf, MR_SEQ)
    }

    pub fn flags(&self) -> u16 {
        get_u16(&self.buf, MR_FLAGS)
    }

    pub fn set_flags(&mut self, flags: u16) {
        put_u16(&mut self.buf, MR_FLAGS, flags);
        self.dirty = true;
    }

    pub fn is_in_use(&self) -> bool {
        self.flags() & RECORD_FLAG_IN_USE != 0
    }

    pub fn is_dir(&self) -> bool {
        self.flags() & RECORD_FLAG_DIR != 0
    }

    pub fn hard_links(&self) -> u16 {
        get_u16(&self.buf, MR_HARD_LINKS)
    }

    pub fn set_hard_links(&mut self, n: u16) {
        put_u16(&mut self.buf, MR_HARD_LINKS, n);
        self.dirty = true;
    }

    pub fn used(&self) -> usize {
        get_u32(&self.buf, MR_USED) as usize
    }

    pub fn total(&self) -> usize {
        get_u32(&self.buf, MR_TOTAL) as usize
    }

    /// 子记录回指基记录的引用
    pub fn parent_ref(&self) -> Result<MftRef> {
        MftRef::from_u64(get_u64(&self.buf, MR_PARENT_REF))
    }

    pub fn set_parent_ref(&mut self, r: MftRef) {
        put_u64(&mut self.buf, MR_PARENT_REF, r.to_u64());
        self.dirty = true;
    }

    /// `(rno, seq)` 是否指向本记录
    ///
    /// 对应 `mi_is_ref()`。
    pub fn is_ref(&self, r: &MftRef) -> bool {
        r.rno == self.rno && r.seq == self.seq()
    }

    pub fn to_ref(&self) -> MftRef {
        MftRef::new(self.rno, self.seq())
    }

    /// 释放：清在用标志并递增序列号，旧引用随之失效
    ///
    /// 对应 `mi_mark_free()`。
    pub fn mark_free(&mut self) {
        let mut seq = self.seq().wrapping_add(1);
        if seq == 0 {
            seq = 1;
        }
        put_u16(&mut self.buf, MR_SEQ, seq);
        let f = self.flags() & !RECORD_FLAG_IN_USE;
        put_u16(&mut self.buf, MR_FLAGS, f);
        self.dirty = true;
    }

    // ----- 属性流 -----

    fn attr_off(&self) -> usize {
        get_u16(&self.buf, MR_ATTR_OFF) as usize
    }

    /// 枚举属性：`prev` 传 None 取第一个
    ///
    /// 走到 `ATTR_END` 或发现可检损坏即停。对应 `mi_enum_attr()`。
    pub fn enum_attr(&self, prev: Option<usize>) -> Option<usize> {
        let off = match prev {
            None => self.attr_off(),
            Some(p) => {
                let size = get_u32(&self.buf, p + AH_SIZE) as usize;
                p + size
            }
        };

        if off + 8 > self.used() {
            return None;
        }
        let ty = get_u32(&self.buf, off + AH_TYPE);
        if ty == ATTR_END {
            return None;
        }
        let size = get_u32(&self.buf, off + AH_SIZE) as usize;
        if size < SIZEOF_RESIDENT || size % 8 != 0 || off + size > self.used() {
            return None;
        }
        Some(off)
    }

    /// 取偏移处的属性视图
    pub fn attr(&self, off: usize) -> Attr<'_> {
        let size = get_u32(&self.buf, off + AH_SIZE) as usize;
        Attr {
            buf: &self.buf[off..off + size],
        }
    }

    /// 属性体的可变切片
    pub fn attr_mut(&mut self, off: usize) -> &mut [u8] {
        let size = get_u32(&self.buf, off + AH_SIZE) as usize;
        self.dirty = true;
        &mut self.buf[off..off + size]
    }

    /// 线性查找
    ///
    /// `id` 为 None 时任意 id 均可。对应 `mi_find_attr()`。
    pub fn find_attr(
        &self,
        prev: Option<usize>,
        ty: u32,
        name: &[u16],
        id: Option<u16>,
    ) -> Option<usize> {
        let mut cur = prev;
        loop {
            cur = self.enum_attr(cur);
            let off = cur?;
            let attr = self.attr(off);
            if attr.type_() != ty {
                continue;
            }
            if attr.name() != name {
                continue;
            }
            if let Some(want) = id {
                if attr.id() != want {
                    continue;
                }
            }
            return Some(off);
        }
    }

    /// 记录还能塞下多少字节属性
    pub fn free_space(&self) -> usize {
        self.total() - self.used()
    }

    /// 按规范序（类型、名字、id）插入一个 `asize` 字节的属性
    ///
    /// 头部字段除 type/size/name_len/name_off/id 外全部清零，
    /// 负载由调用者填。对应 `mi_insert_attr()`。
    pub fn insert_attr(
        &mut self,
        ty: u32,
        name: &[u16],
        asize: usize,
        name_off: usize,
    ) -> Result<usize> {
        debug_assert_eq!(asize % 8, 0);
        if asize > self.free_space() {
            return Err(Error::from_kind(ErrorKind::NoRoom));
        }

        // 找插入点并顺手分配 id
        let mut ins = None;
        let mut next_id: u16 = 0;
        let mut cur = None;
        loop {
            cur = self.enum_attr(cur);
            let Some(off) = cur else { break };
            let attr = self.attr(off);
            if attr.id() >= next_id {
                next_id = attr.id() + 1;
            }
            if ins.is_none() {
                let order = attr
                    .type_()
                    .cmp(&ty)
                    .then_with(|| attr.name().cmp(&name.to_vec()));
                if order == core::cmp::Ordering::Greater {
                    ins = Some(off);
                }
            }
        }
        // 没有更大的属性就插在 ATTR_END 前
        let ins = ins.unwrap_or_else(|| self.end_off());

        let used = self.used();
        self.buf.copy_within(ins..used, ins + asize);
        self.buf[ins..ins + asize].fill(0);

        put_u32(&mut self.buf, ins + AH_TYPE, ty);
        put_u32(&mut self.buf, ins + AH_SIZE, asize as u32);
        self.buf[ins + AH_NAME_LEN] = name.len() as u8;
        put_u16(&mut self.buf, ins + AH_NAME_OFF, name_off as u16);
        put_u16(&mut self.buf, ins + AH_ID, next_id);
        put_utf16(&mut self.buf, ins + name_off, name);

        put_u32(&mut self.buf, MR_USED, (used + asize) as u32);
        put_u16(&mut self.buf, MR_NEXT_ATTR_ID, next_id + 1);
        self.dirty = true;
        Ok(ins)
    }

    /// ATTR_END 所在偏移
    fn end_off(&self) -> usize {
        let mut off = self.attr_off();
        loop {
            if off + 8 > self.used() {
                return off;
            }
            if get_u32(&self.buf, off + AH_TYPE) == ATTR_END {
                return off;
            }
            let size = get_u32(&self.buf, off + AH_SIZE) as usize;
            if size < 8 || size % 8 != 0 {
                return off;
            }
            off += size;
        }
    }

    /// 移除属性并压实记录
    ///
    /// 对应 `mi_remove_attr()`。
    pub fn remove_attr(&mut self, off: usize) {
        let size = get_u32(&self.buf, off + AH_SIZE) as usize;
        let used = self.used();
        self.buf.copy_within(off + size..used, off);
        self.buf[used - size..used].fill(0);
        put_u32(&mut self.buf, MR_USED, (used - size) as u32);
        self.dirty = true;
    }

    /// 原地伸缩属性，后续属性随之平移
    ///
    /// `delta` 必须保持 8 字节对齐。对应 `mi_resize_attr()`。
    pub fn resize_attr(&mut self, off: usize, delta: isize) -> Result<()> {
        debug_assert_eq!(delta.rem_euclid(8), 0);
        let size = get_u32(&self.buf, off + AH_SIZE) as usize;
        let used = self.used();
        let new_size = size.checked_add_signed(delta).ok_or_else(|| {
            Error::new(ErrorKind::InvalidInput, "attribute shrunk below zero")
        })?;
        if new_size < SIZEOF_RESIDENT {
            return Err(Error::new(ErrorKind::InvalidInput, "attribute too small"));
        }

        if delta > 0 {
            if delta as usize > self.free_space() {
                return Err(Error::from_kind(ErrorKind::NoRoom));
            }
            self.buf.copy_within(off + size..used, off + new_size);
            self.buf[off + size..off + new_size].fill(0);
        } else if delta < 0 {
            self.buf.copy_within(off + size..used, off + new_size);
            let new_used = used.checked_add_signed(delta).unwrap();
            self.buf[new_used..used].fill(0);
        }

        put_u32(&mut self.buf, off + AH_SIZE, new_size as u32);
        put_u32(&mut self.buf, MR_USED, used.checked_add_signed(delta).unwrap() as u32);
        self.dirty = true;
        Ok(())
    }

    /// 把 `len` 个 VCN 的映射编码进非常驻属性尾部
    ///
    /// 属性按需伸缩；记录装不下全部时返回实际编码的 VCN 数，
    /// 调用者用更高的 `svcn` 另起分片。对应 `mi_pack_runs()`。
    pub fn pack_runs(&mut self, off: usize, run: &RunsTree, len: CLST) -> Result<CLST> {
        let attr = self.attr(off);
        debug_assert!(attr.is_nonresident());
        let svcn = attr.svcn();
        let run_off = get_u16(&self.buf[off..], AH_NRES_RUN_OFF) as usize;
        let cur_size = attr.size();

        // 可用上限：现有尾部 + 记录剩余空间
        let max_tail = cur_size - run_off + (self.free_space() & !7);
        if max_tail == 0 {
            return Err(Error::from_kind(ErrorKind::NoRoom));
        }
        let mut tmp = vec![0u8; max_tail];
        let (bytes, packed) = run.pack(svcn, len, &mut tmp)?;
        if packed == 0 {
            return Err(Error::from_kind(ErrorKind::NoRoom));
        }

        let new_size = quad_align(run_off + bytes);
        self.resize_attr(off, new_size as isize - cur_size as isize)?;

        let dst = self.attr_mut(off);
        dst[run_off..run_off + bytes].copy_from_slice(&tmp[..bytes]);
        for b in dst[run_off + bytes..].iter_mut() {
            *b = 0;
        }
        put_u64(dst, AH_NRES_EVCN, (svcn + packed - 1) as u64);
        Ok(packed)
    }

    /// 设置非常驻属性的大小字段
    pub fn set_nres_sizes(&mut self, off: usize, alloc: u64, data: u64, valid: u64) {
        let buf = self.attr_mut(off);
        put_u64(buf, AH_NRES_ALLOC_SIZE, alloc);
        put_u64(buf, AH_NRES_DATA_SIZE, data);
        put_u64(buf, AH_NRES_VALID_SIZE, valid);
    }

    /// 覆盖常驻属性负载（长度必须一致）
    pub fn set_resident_data(&mut self, off: usize, data: &[u8]) -> Result<()> {
        let buf = self.attr_mut(off);
        let doff = get_u16(buf, AH_RES_DATA_OFF) as usize;
        let dsize = get_u32(buf, AH_RES_DATA_SIZE) as usize;
        if data.len() != dsize || doff + dsize > buf.len() {
            return Err(Error::new(ErrorKind::InvalidInput, "resident size mismatch"));
        }
        buf[doff..doff + dsize].copy_from_slice(data);
        Ok(())
    }

    /// 整幅镜像（fs 层计算镜像拷贝等场景用）
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// 组装一个常驻属性体（插入后用 `attr_mut` 写回）
///
/// 返回 `(总大小, name_off)`；`insert_attr` 后调用者再填
/// non_res / data 字段。
pub fn resident_layout(name_len: usize, data_size: usize) -> (usize, usize) {
    let name_off = SIZEOF_RESIDENT;
    let data_off = quad_align(name_off + name_len * 2);
    (quad_align(data_off + data_size), name_off)
}

/// 常驻属性插入后补齐头部
pub fn init_resident(rec: &mut MftRecord, off: usize, data: &[u8]) {
    let name_len = rec.attr(off).name_len();
    let data_off = quad_align(SIZEOF_RESIDENT + name_len * 2);
    let buf = rec.attr_mut(off);
    buf[AH_NON_RES] = 0;
    put_u32(buf, AH_RES_DATA_SIZE, data.len() as u32);
    put_u16(buf, AH_RES_DATA_OFF, data_off as u16);
    buf[data_off..data_off + data.len()].copy_from_slice(data);
}

/// 非常驻属性插入后补齐头部（runs 由 `pack_runs` 填）
pub fn init_nonresident(rec: &mut MftRecord, off: usize, svcn: CLST, flags: u16) {
    let name_len = rec.attr(off).name_len();
    let run_off = quad_align(SIZEOF_NONRESIDENT + name_len * 2);
    let buf = rec.attr_mut(off);
    buf[AH_NON_RES] = 1;
    put_u16(buf, AH_FLAGS, flags);
    put_u64(buf, AH_NRES_SVCN, svcn as u64);
    put_u64(buf, AH_NRES_EVCN, svcn.wrapping_sub(1) as u64);
    put_u16(buf, AH_NRES_RUN_OFF, run_off as u16);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upcase::str_to_utf16;

    fn new_rec() -> MftRecord {
        MftRecord::format_new(42, 1024, 512, 0, 0)
    }

    #[test]
    fn test_format_new_valid() {
        let mut rec = new_rec();
        assert_eq!(rec.seq(), 1);
        assert!(rec.is_in_use());
        assert!(rec.enum_attr(None).is_none());

        // 写盘镜像可以再读回来
        let image = rec.write_image().unwrap();
        let back = MftRecord::from_bytes(42, image, 512).unwrap();
        assert_eq!(back.seq(), 1);
        assert_eq!(back.used(), rec.used());
    }

    #[test]
    fn test_from_bytes_rejects_wrong_rno() {
        let mut rec = new_rec();
        let image = rec.write_image().unwrap();
        assert!(MftRecord::from_bytes(43, image, 512).is_err());
    }

    #[test]
    fn test_seq_wraps_to_one() {
        let rec = MftRecord::format_new(1, 1024, 512, u16::MAX, 0);
        assert_eq!(rec.seq(), 1);
    }

    #[test]
    fn test_insert_canonical_order() {
        let mut rec = new_rec();
        let (asize, name_off) = resident_layout(0, 8);

        rec.insert_attr(ATTR_DATA, &[], asize, name_off).unwrap();
        rec.insert_attr(ATTR_STD, &[], asize, name_off).unwrap();
        let name = str_to_utf16("alpha");
        let (asize_n, name_off_n) = resident_layout(name.len(), 8);
        rec.insert_attr(ATTR_DATA, &name, asize_n, name_off_n).unwrap();

        // 枚举顺序：$STD < $DATA"" < $DATA"alpha"
        let o1 = rec.enum_attr(None).unwrap();
        let o2 = rec.enum_attr(Some(o1)).unwrap();
        let o3 = rec.enum_attr(Some(o2)).unwrap();
        assert_eq!(rec.attr(o1).type_(), ATTR_STD);
        assert_eq!(rec.attr(o2).type_(), ATTR_DATA);
        assert_eq!(rec.attr(o2).name_len(), 0);
        assert_eq!(rec.attr(o3).type_(), ATTR_DATA);
        assert_eq!(rec.attr(o3).name(), name);
        assert!(rec.enum_attr(Some(o3)).is_none());

        // id 互异
        assert_ne!(rec.attr(o1).id(), rec.attr(o2).id());
        assert_ne!(rec.attr(o2).id(), rec.attr(o3).id());
    }

    #[test]
    fn test_no_room() {
        let mut rec = new_rec();
        // 填到接近满
        let (asize, name_off) = resident_layout(0, 900);
        rec.insert_attr(ATTR_DATA, &[], asize, name_off).unwrap();
        let (asize2, name_off2) = resident_layout(0, 16);
        let err = rec
            .insert_attr(ATTR_BITMAP, &[], asize2, name_off2)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoRoom);
    }

    #[test]
    fn test_resident_data_round_trip() {
        let mut rec = new_rec();
        let payload = [7u8; 24];
        let (asize, name_off) = resident_layout(0, payload.len());
        let off = rec.insert_attr(ATTR_DATA, &[], asize, name_off).unwrap();
        init_resident(&mut rec, off, &payload);

        let attr = rec.attr(off);
        assert!(!attr.is_nonresident());
        assert_eq!(attr.resident_data().unwrap(), &payload);
    }

    #[test]
    fn test_resize_and_remove() {
        let mut rec = new_rec();
        let (asize, name_off) = resident_layout(0, 8);
        let o1 = rec.insert_attr(ATTR_STD, &[], asize, name_off).unwrap();
        init_resident(&mut rec, o1, &[1u8; 8]);
        let o2 = rec.insert_attr(ATTR_DATA, &[], asize, name_off).unwrap();
        init_resident(&mut rec, o2, &[2u8; 8]);

        let used = rec.used();
        rec.resize_attr(o1, 16).unwrap();
        assert_eq!(rec.used(), used + 16);
        // 后续属性平移后仍完好
        let o2 = rec.find_attr(None, ATTR_DATA, &[], None).unwrap();
        assert_eq!(rec.attr(o2).resident_data().unwrap(), &[2u8; 8]);

        rec.resize_attr(o1, -16).unwrap();
        assert_eq!(rec.used(), used);

        let o1 = rec.find_attr(None, ATTR_STD, &[], None).unwrap();
        rec.remove_attr(o1);
        assert!(rec.find_attr(None, ATTR_STD, &[], None).is_none());
        let o2 = rec.find_attr(None, ATTR_DATA, &[], None).unwrap();
        assert_eq!(rec.attr(o2).resident_data().unwrap(), &[2u8; 8]);
    }

    #[test]
    fn test_pack_runs_and_load() {
        let mut rec = new_rec();
        let mut run = RunsTree::new();
        run.add(0, 1000, 8);
        run.add(8, SPARSE_LCN, 4);
        run.add(12, 2000, 4);

        let (asize, name_off) = (quad_align(SIZEOF_NONRESIDENT), SIZEOF_NONRESIDENT);
        let off = rec.insert_attr(ATTR_DATA, &[], asize, name_off).unwrap();
        init_nonresident(&mut rec, off, 0, 0);
        let packed = rec.pack_runs(off, &run, 16).unwrap();
        assert_eq!(packed, 16);

        let attr = rec.attr(off);
        assert_eq!(attr.evcn(), 15);
        let mut back = RunsTree::new();
        attr.load_runs(&mut back).unwrap();
        assert_eq!(back.lookup_entry(0).map(|(l, _, _)| l), Some(1000));
        assert_eq!(back.lookup_entry(9).map(|(l, _, _)| l), Some(SPARSE_LCN));
        assert_eq!(back.lookup_entry(12).map(|(l, _, _)| l), Some(2000));
    }

    #[test]
    fn test_mark_free_invalidates_ref() {
        let mut rec = new_rec();
        let r = rec.to_ref();
        assert!(rec.is_ref(&r));
        rec.mark_free();
        assert!(!rec.is_ref(&r));
        assert!(!rec.is_in_use());
    }
}
