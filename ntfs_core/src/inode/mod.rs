//! inode 门面
//!
//! 对应 ntfs3 的 `frecord.c`。一个 inode = 基记录 + 按记录号
//! 有序的子记录集 + 解码后的 $ATTRIBUTE_LIST + $DATA runs
//! 缓存。所有跨记录的属性定位都从这里走。
//!
//! 在核不变式：
//! 1. 一旦存在 $ATTRIBUTE_LIST，除它自身外每个属性在列表中
//!    恰好登记一次；
//! 2. 列表项引用的子记录按需装载，但必须能解析；
//! 3. inode 存活期间基记录常驻内存。

mod attr;

use crate::attrlist::AttrList;
use crate::block::{BlockDevice, DeviceLock};
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::fs::Ntfs;
use crate::record::{
    init_nonresident, init_resident, resident_layout, Attr, MftRecord, SIZEOF_NONRESIDENT,
};
use crate::run::RunsTree;
use crate::types::{MftRef, StdInfo};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use bitflags::bitflags;
use log::warn;

bitflags! {
    /// inode 运行时标志
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NiFlags: u32 {
        const DIR = 0x0000_0001;
        const RESIDENT = 0x0000_0002;
        /// 尺寸 / EA 变化后父目录的 dup 信息待刷新
        const UPDATE_PARENT = 0x0000_0004;
        /// inode 带 EA
        const EA = 0x0000_2000;
    }
}

/// 指向某条记录里某个属性的句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrHandle {
    pub rno: CLST,
    pub off: usize,
}

/// 在核 inode
///
/// 对应 ntfs3 的 `struct ntfs_inode`。
pub struct NtfsInode {
    pub base: MftRecord,
    /// 子记录，按 rno 有序（mi_tree）
    pub subrecords: BTreeMap<CLST, MftRecord>,
    pub attr_list: Option<AttrList>,

    /// $STANDARD_INFORMATION 缓存
    pub std: StdInfo,
    pub std_dirty: bool,

    /// $DATA runs 缓存（文件）
    pub run: RunsTree,
    /// 有效数据长度
    pub i_valid: u64,

    pub ni_flags: NiFlags,
}

impl NtfsInode {
    /// 装载 inode：读基记录、解码 $ATTRIBUTE_LIST、缓存标准
    /// 信息
    pub fn load<D: BlockDevice, L: DeviceLock>(
        fs: &mut Ntfs<D, L>,
        rno: CLST,
    ) -> Result<Self> {
        let base = fs.read_record(rno)?;
        if !base.is_in_use() {
            return Err(Error::new(ErrorKind::NotFound, "record is not in use"));
        }

        let mut ni = Self {
            subrecords: BTreeMap::new(),
            attr_list: None,
            std: StdInfo::default(),
            std_dirty: false,
            run: RunsTree::new(),
            i_valid: 0,
            ni_flags: if base.is_dir() {
                NiFlags::DIR
            } else {
                NiFlags::empty()
            },
            base,
        };

        // $ATTRIBUTE_LIST
        if let Some(off) = ni.base.find_attr(None, ATTR_LIST, &[], None) {
            let attr = ni.base.attr(off);
            let payload = if attr.is_nonresident() {
                let mut lrun = RunsTree::new();
                attr.load_runs(&mut lrun)?;
                let mut buf = alloc::vec![0u8; attr.data_size() as usize];
                lrun.read_vbo(&mut fs.bdev, fs.cluster_bits, 0, &mut buf)?;
                buf
            } else {
                attr.resident_data()?.to_vec()
            };
            ni.attr_list = Some(AttrList::from_bytes(payload)?);
        }

        // $STANDARD_INFORMATION 永远在基记录
        let std_off = ni
            .base
            .find_attr(None, ATTR_STD, &[], None)
            .ok_or_else(|| Error::new(ErrorKind::Corrupted, "inode without std info"))?;
        ni.std = StdInfo::from_bytes(ni.base.attr(std_off).resident_data()?)?;

        if ni.base.find_attr(None, ATTR_EA, &[], None).is_some()
            || ni
                .attr_list
                .as_ref()
                .is_some_and(|l| l.find_ex(ATTR_EA, &[], None).is_some())
        {
            ni.ni_flags |= NiFlags::EA;
        }

        Ok(ni)
    }

    pub fn rno(&self) -> CLST {
        self.base.rno
    }

    pub fn is_dir(&self) -> bool {
        self.ni_flags.contains(NiFlags::DIR)
    }

    /// 取记录（基或子）
    pub fn record(&self, rno: CLST) -> Option<&MftRecord> {
        if rno == self.base.rno {
            Some(&self.base)
        } else {
            self.subrecords.get(&rno)
        }
    }

    pub fn record_mut(&mut self, rno: CLST) -> Option<&mut MftRecord> {
        if rno == self.base.rno {
            Some(&mut self.base)
        } else {
            self.subrecords.get_mut(&rno)
        }
    }

    /// 句柄处的属性视图
    pub fn attr_view(&self, h: AttrHandle) -> Attr<'_> {
        self.record(h.rno).expect("stale attr handle").attr(h.off)
    }

    /// 确保子记录已装载并校验回指
    ///
    /// 对应 `ni_load_mi()`。
    pub fn load_mi<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        r: MftRef,
    ) -> Result<()> {
        if r.rno == self.base.rno || self.subrecords.contains_key(&r.rno) {
            return Ok(());
        }
        let rec = fs.read_record(r.rno)?;
        if rec.seq() != r.seq {
            fs.set_state(crate::fs::NtfsState::Error).ok();
            return Err(Error::new(ErrorKind::Corrupted, "subrecord sequence mismatch"));
        }
        match rec.parent_ref() {
            Ok(p) if self.base.is_ref(&p) => {}
            _ => {
                fs.set_state(crate::fs::NtfsState::Error).ok();
                return Err(Error::new(ErrorKind::Corrupted, "subrecord parent mismatch"));
            }
        }
        self.subrecords.insert(r.rno, rec);
        Ok(())
    }

    /// 跨记录查找属性
    ///
    /// 无 $ATTRIBUTE_LIST 时退化为基记录查找；有列表时按列表
    /// 解析，`vcn` 用来挑覆盖该 VCN 的非常驻分片。
    /// 对应 `ni_find_attr()`。
    pub fn find_attr<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ty: u32,
        name: &[u16],
        vcn: Option<CLST>,
    ) -> Result<Option<AttrHandle>> {
        let Some(list) = &self.attr_list else {
            return Ok(self
                .base
                .find_attr(None, ty, name, None)
                .map(|off| AttrHandle {
                    rno: self.base.rno,
                    off,
                }));
        };

        let Some(le_off) = list.find_ex(ty, name, vcn) else {
            return Ok(None);
        };
        let e = list.entry(le_off);
        let r = e.ref_()?;
        let id = e.id();
        self.load_mi(fs, r)?;

        let rec = self.record(r.rno).unwrap();
        match rec.find_attr(None, ty, name, Some(id)) {
            Some(off) => Ok(Some(AttrHandle { rno: r.rno, off })),
            None => {
                fs.set_state(crate::fs::NtfsState::Error).ok();
                Err(Error::new(
                    ErrorKind::Corrupted,
                    "attr_list entry does not resolve",
                ))
            }
        }
    }

    /// 全属性枚举（类型优先），跨所有分片
    ///
    /// 对应 `ni_enum_attr_ex()`。
    pub fn enum_attr<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        prev: Option<AttrHandle>,
    ) -> Result<Option<AttrHandle>> {
        if self.attr_list.is_none() {
            let prev_off = prev.map(|h| h.off);
            return Ok(self.base.enum_attr(prev_off).map(|off| AttrHandle {
                rno: self.base.rno,
                off,
            }));
        }

        // 列表序即类型优先序；prev 转回其列表位置再取下一项
        let list = self.attr_list.as_ref().unwrap();
        let mut cur = None;
        let mut found_prev = prev.is_none();
        let mut targets = Vec::new();
        while let Some(off) = list.enumerate(cur) {
            cur = Some(off);
            let e = list.entry(off);
            targets.push((e.type_(), e.name(), e.vcn(), e.ref_()?, e.id()));
        }

        for (ty, name, _vcn, r, id) in targets {
            self.load_mi(fs, r)?;
            let rec = self.record(r.rno).unwrap();
            let Some(off) = rec.find_attr(None, ty, &name, Some(id)) else {
                continue;
            };
            let h = AttrHandle { rno: r.rno, off };
            if found_prev {
                return Ok(Some(h));
            }
            if Some(h) == prev {
                found_prev = true;
            }
        }
        Ok(None)
    }

    // ===== 属性插入 =====

    /// 插入常驻属性
    ///
    /// 基记录装不下时依次尝试既有子记录、新建子记录；首次
    /// 溢出会先建 $ATTRIBUTE_LIST。对应 `ni_insert_resident()`。
    pub fn insert_resident<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        data_size: usize,
        ty: u32,
        name: &[u16],
    ) -> Result<AttrHandle> {
        let (asize, name_off) = resident_layout(name.len(), data_size);
        let zeros = alloc::vec![0u8; data_size];

        // 先试基记录
        match self.base.insert_attr(ty, name, asize, name_off) {
            Ok(off) => {
                init_resident(&mut self.base, off, &zeros);
                let h = AttrHandle {
                    rno: self.base.rno,
                    off,
                };
                self.register_attr(h, ty, name, 0)?;
                return Ok(h);
            }
            Err(e) if e.kind() == ErrorKind::NoRoom => {}
            Err(e) => return Err(e),
        }

        if self.attr_list.is_none() {
            self.create_attr_list(fs)?;
            // 搬空后的基记录再试一次
            if let Ok(off) = self.base.insert_attr(ty, name, asize, name_off) {
                init_resident(&mut self.base, off, &zeros);
                let h = AttrHandle {
                    rno: self.base.rno,
                    off,
                };
                self.register_attr(h, ty, name, 0)?;
                return Ok(h);
            }
        }

        // 既有子记录
        let rnos: Vec<CLST> = self.subrecords.keys().copied().collect();
        for rno in rnos {
            let rec = self.subrecords.get_mut(&rno).unwrap();
            if let Ok(off) = rec.insert_attr(ty, name, asize, name_off) {
                init_resident(rec, off, &zeros);
                let h = AttrHandle { rno, off };
                self.register_attr(h, ty, name, 0)?;
                return Ok(h);
            }
        }

        // 新子记录
        let rno = self.expand_list(fs)?;
        let rec = self.subrecords.get_mut(&rno).unwrap();
        let off = rec.insert_attr(ty, name, asize, name_off)?;
        init_resident(rec, off, &zeros);
        let h = AttrHandle { rno, off };
        self.register_attr(h, ty, name, 0)?;
        Ok(h)
    }

    /// 插入非常驻属性并打包 runs
    ///
    /// 一条记录装不下时按严格递增的 svcn 边界切分片。
    /// 对应 `ni_insert_nonresident()`。
    pub fn insert_nonresident<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ty: u32,
        name: &[u16],
        run: &RunsTree,
        svcn: CLST,
        len: CLST,
        flags: u16,
    ) -> Result<AttrHandle> {
        let asize = quad_align(SIZEOF_NONRESIDENT + name.len() * 2) + 8;
        let name_off = SIZEOF_NONRESIDENT;

        let mut cur_svcn = svcn;
        // Some(rno)：分片被强制落到这条（新开的）记录
        let mut host: Option<CLST> = None;

        loop {
            let forced = host.is_some();
            let h = match host.take() {
                Some(rno) => {
                    let rec = self.subrecords.get_mut(&rno).unwrap();
                    let off = rec.insert_attr(ty, name, asize, name_off)?;
                    AttrHandle { rno, off }
                }
                None => self.place_fragment(fs, ty, name, asize, name_off)?,
            };
            let rec = self.record_mut(h.rno).unwrap();
            init_nonresident(rec, h.off, cur_svcn, flags);

            if len == 0 {
                // 空流：单分片，无 runs
                self.register_attr(h, ty, name, cur_svcn)?;
                return Ok(h);
            }

            let rec = self.record_mut(h.rno).unwrap();
            let packed = match rec.pack_runs(h.off, run, len - (cur_svcn - svcn)) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::NoRoom && !forced => {
                    // 这条记录太挤，换一条全新的子记录重来
                    let rec = self.record_mut(h.rno).unwrap();
                    rec.remove_attr(h.off);
                    if self.attr_list.is_none() {
                        self.create_attr_list(fs)?;
                    }
                    host = Some(self.expand_list(fs)?);
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.register_attr(h, ty, name, cur_svcn)?;
            cur_svcn += packed;
            if cur_svcn >= svcn + len {
                break;
            }
            // 还有剩余 VCN：需要列表与新分片
            if self.attr_list.is_none() {
                self.create_attr_list(fs)?;
            }
            host = Some(self.expand_list(fs)?);
        }

        // 中途建表可能把首分片搬了家，句柄重新解析一次
        self.find_attr(fs, ty, name, Some(svcn))?
            .ok_or_else(|| Error::new(ErrorKind::Corrupted, "first fragment vanished"))
    }

    /// 为一个分片找落点：基记录 → 既有子记录 → 新子记录
    fn place_fragment<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ty: u32,
        name: &[u16],
        asize: usize,
        name_off: usize,
    ) -> Result<AttrHandle> {
        match self.base.insert_attr(ty, name, asize, name_off) {
            Ok(off) => {
                return Ok(AttrHandle {
                    rno: self.base.rno,
                    off,
                })
            }
            Err(e) if e.kind() == ErrorKind::NoRoom => {}
            Err(e) => return Err(e),
        }

        if self.attr_list.is_none() {
            self.create_attr_list(fs)?;
            if let Ok(off) = self.base.insert_attr(ty, name, asize, name_off) {
                return Ok(AttrHandle {
                    rno: self.base.rno,
                    off,
                });
            }
        }

        let rnos: Vec<CLST> = self.subrecords.keys().copied().collect();
        for rno in rnos {
            let rec = self.subrecords.get_mut(&rno).unwrap();
            if let Ok(off) = rec.insert_attr(ty, name, asize, name_off) {
                return Ok(AttrHandle { rno, off });
            }
        }

        let rno = self.expand_list(fs)?;
        let rec = self.subrecords.get_mut(&rno).unwrap();
        let off = rec.insert_attr(ty, name, asize, name_off)?;
        Ok(AttrHandle { rno, off })
    }

    /// 属性放进记录后在列表登记
    fn register_attr(&mut self, h: AttrHandle, ty: u32, name: &[u16], svcn: CLST) -> Result<()> {
        if ty == ATTR_LIST {
            return Ok(());
        }
        let id = self.record(h.rno).unwrap().attr(h.off).id();
        let r = self.record(h.rno).unwrap().to_ref();
        if let Some(list) = &mut self.attr_list {
            list.add(ty, name, svcn, id, r)?;
        }
        Ok(())
    }

    // ===== $ATTRIBUTE_LIST 生命周期 =====

    /// 建表：把基记录里除 $STANDARD_INFORMATION 外的属性搬进
    /// 新子记录，基记录装上 $ATTRIBUTE_LIST
    ///
    /// 对应 `ni_create_attr_list()`。
    pub fn create_attr_list<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
    ) -> Result<()> {
        debug_assert!(self.attr_list.is_none());
        let mut list = AttrList::new();
        let base_ref = self.base.to_ref();

        // 新子记录
        let mut sub = fs.new_record(true, 0)?;
        sub.set_parent_ref(base_ref);
        let sub_rno = sub.rno;

        // 搬家：收集待搬属性的偏移（倒序删除防位移）
        let mut moves: Vec<usize> = Vec::new();
        let mut cur = None;
        loop {
            cur = self.base.enum_attr(cur);
            let Some(off) = cur else { break };
            if self.base.attr(off).type_() != ATTR_STD {
                moves.push(off);
            }
        }

        for &off in &moves {
            let attr = self.base.attr(off);
            let (ty, name, id) = (attr.type_(), attr.name(), attr.id());
            let svcn = if attr.is_nonresident() { attr.svcn() } else { 0 };
            let bytes = {
                let size = attr.size();
                let rec_bytes = self.base.as_bytes();
                rec_bytes[off..off + size].to_vec()
            };

            let name_off = if bytes.len() > 0x0A {
                u16::from_le_bytes([bytes[0x0A], bytes[0x0B]]) as usize
            } else {
                0
            };
            let new_off = sub.insert_attr(ty, &name, bytes.len(), name_off)?;
            // 原字节整体覆盖，保留原 id
            let dst = sub.attr_mut(new_off);
            dst.copy_from_slice(&bytes);
            list.add(ty, &name, svcn, id, sub.to_ref())?;
        }
        // $STD 留在基记录，但同样登记
        let std_off = self
            .base
            .find_attr(None, ATTR_STD, &[], None)
            .ok_or_else(|| Error::new(ErrorKind::Corrupted, "no std info"))?;
        list.add(ATTR_STD, &[], 0, self.base.attr(std_off).id(), base_ref)?;

        // 倒序摘除已搬属性
        for &off in moves.iter().rev() {
            self.base.remove_attr(off);
        }

        fs.write_record(&mut sub, false)?;
        self.subrecords.insert(sub_rno, sub);
        self.attr_list = Some(list);
        self.attr_list.as_mut().unwrap().dirty = true;

        // 基记录装 $ATTRIBUTE_LIST 本体
        self.update_attr_list(fs)?;
        Ok(())
    }

    /// 追加一个空子记录并挂进 inode
    ///
    /// 对应 `ni_expand_list()` 的扩容部分。
    pub fn expand_list<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
    ) -> Result<CLST> {
        if self.attr_list.is_none() {
            self.create_attr_list(fs)?;
        }
        let mut sub = fs.new_record(true, 0)?;
        sub.set_parent_ref(self.base.to_ref());
        let rno = sub.rno;
        fs.write_record(&mut sub, false)?;
        self.subrecords.insert(rno, sub);
        Ok(rno)
    }

    /// 把内存中的列表写回 $ATTRIBUTE_LIST 属性
    ///
    /// 小则常驻，大则非常驻。对应 `al_update()`。
    pub fn update_attr_list<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
    ) -> Result<()> {
        let Some(list) = &self.attr_list else {
            return Ok(());
        };
        let payload = list.bytes().to_vec();

        // 现有列表属性先摘掉（runs 一并释放）
        if let Some(off) = self.base.find_attr(None, ATTR_LIST, &[], None) {
            let attr = self.base.attr(off);
            if attr.is_nonresident() {
                let mut lrun = RunsTree::new();
                attr.load_runs(&mut lrun)?;
                fs.run_deallocate(&lrun, false)?;
            }
            self.base.remove_attr(off);
        }

        let (asize, name_off) = resident_layout(0, payload.len());
        if asize <= self.base.free_space() {
            let off = self.base.insert_attr(ATTR_LIST, &[], asize, name_off)?;
            init_resident(&mut self.base, off, &payload);
        } else {
            // 非常驻列表
            let clusters = fs.bytes_to_cluster(payload.len() as u64).max(1);
            let (lcn, got) = fs.look_for_free_space(0, clusters, crate::fs::AllocateOpt::Def)?;
            if got < clusters {
                fs.mark_as_free_ex(lcn, got, false)?;
                return Err(Error::from_kind(ErrorKind::NoSpace));
            }
            let mut lrun = RunsTree::new();
            lrun.add(0, lcn, clusters);
            lrun.write_vbo(&mut fs.bdev, fs.cluster_bits, 0, &payload, false)?;

            let asize = quad_align(SIZEOF_NONRESIDENT) + 16;
            let off = self
                .base
                .insert_attr(ATTR_LIST, &[], asize, SIZEOF_NONRESIDENT)?;
            init_nonresident(&mut self.base, off, 0, 0);
            self.base.pack_runs(off, &lrun, clusters)?;
            let off = self
                .base
                .find_attr(None, ATTR_LIST, &[], None)
                .expect("just inserted");
            self.base.set_nres_sizes(
                off,
                (clusters as u64) << fs.cluster_bits,
                payload.len() as u64,
                payload.len() as u64,
            );
        }
        if let Some(list) = &mut self.attr_list {
            list.dirty = false;
        }
        Ok(())
    }

    // ===== 属性删除 =====

    /// 删除属性（所有同名分片），子记录清空后随手释放
    ///
    /// 对应 `ni_remove_attr()`。
    pub fn remove_attr<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ty: u32,
        name: &[u16],
    ) -> Result<()> {
        if self.attr_list.is_none() {
            let mut removed = false;
            while let Some(off) = self.base.find_attr(None, ty, name, None) {
                self.base.remove_attr(off);
                removed = true;
            }
            return if removed {
                Ok(())
            } else {
                Err(Error::from_kind(ErrorKind::NotFound))
            };
        }

        // 列表驱动：收集该 (ty, name) 的全部登记
        let entries: Vec<(CLST, u16, MftRef)> = {
            let list = self.attr_list.as_ref().unwrap();
            let mut v = Vec::new();
            let mut cur = None;
            while let Some(off) = list.enumerate(cur) {
                cur = Some(off);
                let e = list.entry(off);
                if e.type_() == ty && e.name() == name {
                    v.push((e.vcn(), e.id(), e.ref_()?));
                }
            }
            v
        };
        if entries.is_empty() {
            return Err(Error::from_kind(ErrorKind::NotFound));
        }

        for (vcn, id, r) in entries {
            self.load_mi(fs, r)?;
            let rec = self.record_mut(r.rno).unwrap();
            if let Some(off) = rec.find_attr(None, ty, name, Some(id)) {
                rec.remove_attr(off);
            }
            self.attr_list
                .as_mut()
                .unwrap()
                .delete(ty, name, vcn, Some(r));
            self.free_subrecord_if_empty(fs, r.rno)?;
        }
        self.update_attr_list(fs)?;
        Ok(())
    }

    /// 子记录不再承载任何属性时归还记录号
    fn free_subrecord_if_empty<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        rno: CLST,
    ) -> Result<()> {
        if rno == self.base.rno {
            return Ok(());
        }
        let Some(rec) = self.subrecords.get(&rno) else {
            return Ok(());
        };
        if rec.enum_attr(None).is_some() {
            return Ok(());
        }
        let mut rec = self.subrecords.remove(&rno).unwrap();
        rec.mark_free();
        fs.write_record(&mut rec, false)?;
        fs.mark_rec_free(rno)?;
        Ok(())
    }

    /// 整个 inode 连带所有空间一起删除
    ///
    /// 对应 `ni_delete_all()`。
    pub fn delete_all<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
    ) -> Result<()> {
        // 先释放所有非常驻空间
        let mut handles = Vec::new();
        let mut prev = None;
        loop {
            prev = self.enum_attr(fs, prev)?;
            let Some(h) = prev else { break };
            handles.push(h);
        }
        for h in handles {
            let attr = self.attr_view(h);
            if attr.is_nonresident() {
                let mut run = RunsTree::new();
                if attr.load_runs(&mut run).is_ok() {
                    fs.run_deallocate(&run, true)?;
                }
            }
        }
        // $ATTRIBUTE_LIST 本体的空间
        if let Some(off) = self.base.find_attr(None, ATTR_LIST, &[], None) {
            let attr = self.base.attr(off);
            if attr.is_nonresident() {
                let mut run = RunsTree::new();
                if attr.load_runs(&mut run).is_ok() {
                    fs.run_deallocate(&run, false)?;
                }
            }
        }

        // 释放子记录与基记录
        let rnos: Vec<CLST> = self.subrecords.keys().copied().collect();
        for rno in rnos {
            let mut rec = self.subrecords.remove(&rno).unwrap();
            rec.mark_free();
            fs.write_record(&mut rec, false)?;
            fs.mark_rec_free(rno)?;
        }
        self.base.mark_free();
        let rno = self.base.rno;
        fs.write_record(&mut self.base, false)?;
        fs.mark_rec_free(rno)?;
        self.attr_list = None;
        self.run.clear();
        Ok(())
    }

    // ===== 回写 =====

    /// 同步标准信息、重打包脏列表、落盘所有脏记录
    ///
    /// 对应 `ni_write_inode()`。
    pub fn write_inode<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        sync: bool,
    ) -> Result<()> {
        if self.std_dirty {
            let off = self
                .base
                .find_attr(None, ATTR_STD, &[], None)
                .ok_or_else(|| Error::new(ErrorKind::Corrupted, "no std info"))?;
            let cur_len = self.base.attr(off).res_data_size() as usize;
            let v5 = cur_len >= crate::types::SIZEOF_STD_INFO5;
            self.base.set_resident_data(off, &self.std.to_bytes(v5))?;
            self.std_dirty = false;
        }

        if self.attr_list.as_ref().is_some_and(|l| l.dirty) {
            self.update_attr_list(fs)?;
        }

        let rnos: Vec<CLST> = self.subrecords.keys().copied().collect();
        for rno in rnos {
            let rec = self.subrecords.get_mut(&rno).unwrap();
            if rec.dirty {
                let mut rec = self.subrecords.remove(&rno).unwrap();
                fs.write_record(&mut rec, sync)?;
                self.subrecords.insert(rno, rec);
            }
        }
        if self.base.dirty {
            fs.write_record(&mut self.base, sync)?;
        }
        Ok(())
    }

    /// 校验不变式 1：列表登记集合与实际子记录属性集合一致
    ///
    /// 对应 `al_verify()`，测试与 fsck 路径使用。
    pub fn verify_attr_list<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
    ) -> Result<bool> {
        let Some(list) = &self.attr_list else {
            return Ok(true);
        };
        let mut expected: Vec<(u32, Vec<u16>, CLST, CLST, u16)> = Vec::new();
        let mut cur = None;
        while let Some(off) = list.enumerate(cur) {
            cur = Some(off);
            let e = list.entry(off);
            expected.push((e.type_(), e.name(), e.vcn(), e.ref_()?.rno, e.id()));
        }

        for (ty, name, _vcn, rno, id) in &expected {
            if *rno != self.base.rno && !self.subrecords.contains_key(rno) {
                let rec = fs.read_record(*rno)?;
                self.subrecords.insert(*rno, rec);
            }
            let rec = self.record(*rno).unwrap();
            if rec.find_attr(None, *ty, name, Some(*id)).is_none() {
                warn!("attr_list entry (0x{ty:x}) not found in record {rno}");
                return Ok(false);
            }
        }

        // 反向：子记录中的每个属性都要有登记
        for (rno, rec) in self
            .subrecords
            .iter()
            .map(|(r, rec)| (*r, rec))
            .chain(core::iter::once((self.base.rno, &self.base)))
        {
            let mut cur = None;
            loop {
                cur = rec.enum_attr(cur);
                let Some(off) = cur else { break };
                let attr = rec.attr(off);
                if attr.type_() == ATTR_LIST {
                    continue;
                }
                let hit = expected.iter().any(|(ty, name, _, erno, id)| {
                    *ty == attr.type_() && *name == attr.name() && *erno == rno && *id == attr.id()
                });
                if !hit {
                    warn!(
                        "attr 0x{:x} in record {} missing from attr_list",
                        attr.type_(),
                        rno
                    );
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}
