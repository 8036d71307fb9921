//! 属性尺寸管理
//!
//! 对应 ntfs3 的 `attrib.c`：`attr_set_size()` /
//! `attr_data_get_block()` / `attr_load_runs()` 及常驻 ↔
//! 非常驻转换。`no-room` 在这里被内部消化，调用者只会看到
//! `no-space` 或成功。

use super::{AttrHandle, NtfsInode};
use crate::block::{BlockDevice, DeviceLock};
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::fs::{AllocateOpt, Ntfs};
use crate::record::SIZEOF_RESIDENT;
use crate::run::RunsTree;
use alloc::vec::Vec;

impl NtfsInode {
    /// 把 (ty, name) 的所有分片 runs 并进 `run`
    ///
    /// 对应 `attr_load_runs()`。
    pub fn load_all_runs<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ty: u32,
        name: &[u16],
        run: &mut RunsTree,
    ) -> Result<()> {
        if self.attr_list.is_none() {
            if let Some(off) = self.base.find_attr(None, ty, name, None) {
                self.base.attr(off).load_runs(run)?;
            }
            return Ok(());
        }

        let entries: Vec<(CLST, crate::types::MftRef, u16)> = {
            let list = self.attr_list.as_ref().unwrap();
            let mut v = Vec::new();
            let mut cur = None;
            while let Some(off) = list.enumerate(cur) {
                cur = Some(off);
                let e = list.entry(off);
                if e.type_() == ty && e.name() == name {
                    v.push((e.vcn(), e.ref_()?, e.id()));
                }
            }
            v
        };
        for (_vcn, r, id) in entries {
            self.load_mi(fs, r)?;
            let rec = self.record(r.rno).unwrap();
            if let Some(off) = rec.find_attr(None, ty, name, Some(id)) {
                rec.attr(off).load_runs(run)?;
            }
        }
        Ok(())
    }

    /// 确保 `vcn` 所在分片的 runs 已装载进 `run`
    ///
    /// 对应 `attr_load_runs_vcn()`。
    pub fn load_runs_vcn<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ty: u32,
        name: &[u16],
        run: &mut RunsTree,
        vcn: CLST,
    ) -> Result<()> {
        let h = self
            .find_attr(fs, ty, name, Some(vcn))?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;
        self.attr_view(h).load_runs(run)
    }

    /// 调整属性大小，处理常驻 ↔ 非常驻两个方向的转换
    ///
    /// `run` 是该流的 runs 缓存，转换与增长都会更新它。
    /// 对应 `attr_set_size()`。
    pub fn attr_set_size<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ty: u32,
        name: &[u16],
        run: &mut RunsTree,
        new_size: u64,
    ) -> Result<()> {
        fs.assert_writable()?;
        fs.mark_dirty_for_write()?;

        let h = self
            .find_attr(fs, ty, name, None)?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;
        let attr = self.attr_view(h);

        if !attr.is_nonresident() {
            self.resident_set_size(fs, h, ty, name, run, new_size)
        } else {
            self.nonresident_set_size(fs, ty, name, run, new_size)
        }
    }

    fn resident_set_size<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        h: AttrHandle,
        ty: u32,
        name: &[u16],
        run: &mut RunsTree,
        new_size: u64,
    ) -> Result<()> {
        let attr = self.attr_view(h);
        let name_len = attr.name_len();
        let data_off = quad_align(SIZEOF_RESIDENT + name_len * 2);
        let old_asize = attr.size();

        if new_size <= fs.max_bytes_per_attr as u64 {
            let new_asize = quad_align(data_off + new_size as usize);
            let delta = new_asize as isize - old_asize as isize;
            let rec = self.record_mut(h.rno).unwrap();
            match rec.resize_attr(h.off, delta) {
                Ok(()) => {
                    let buf = rec.attr_mut(h.off);
                    crate::types::put_u32(buf, 0x10, new_size as u32);
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::NoRoom => {}
                Err(e) => return Err(e),
            }
        }

        // 常驻 → 非常驻
        let data = self.attr_view(h).resident_data()?.to_vec();
        let clusters = fs.bytes_to_cluster(new_size.max(data.len() as u64)).max(1);

        run.clear();
        let mut done: CLST = 0;
        let mut hint: CLST = 0;
        while done < clusters {
            let (lcn, got) = match fs.look_for_free_space(hint, clusters - done, AllocateOpt::Def) {
                Ok(x) => x,
                Err(e) => {
                    fs.run_deallocate(run, false)?;
                    run.clear();
                    return Err(e);
                }
            };
            run.add(done, lcn, got);
            done += got;
            hint = lcn + got;
        }
        // 旧数据搬到簇上，尾部清零
        run.zero_vbo(&mut fs.bdev, fs.cluster_bits, 0, (clusters as u64) << fs.cluster_bits)?;
        run.write_vbo(&mut fs.bdev, fs.cluster_bits, 0, &data, false)?;

        // 摘掉常驻体，换上非常驻分片
        let rec = self.record_mut(h.rno).unwrap();
        rec.remove_attr(h.off);
        if let Some(list) = &mut self.attr_list {
            list.delete(ty, name, 0, None);
        }
        let first = self.insert_nonresident(fs, ty, name, run, 0, clusters, 0)?;
        let rec = self.record_mut(first.rno).unwrap();
        rec.set_nres_sizes(
            first.off,
            (clusters as u64) << fs.cluster_bits,
            new_size,
            data.len() as u64,
        );
        Ok(())
    }

    fn nonresident_set_size<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ty: u32,
        name: &[u16],
        run: &mut RunsTree,
        new_size: u64,
    ) -> Result<()> {
        self.load_all_runs(fs, ty, name, run)?;

        let h = self
            .find_attr(fs, ty, name, None)?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;
        let attr = self.attr_view(h);
        let flags = attr.flags();
        let sparsed = attr.is_sparsed();
        let old_valid = attr.valid_size();
        let old_data = attr.data_size();

        let old_clusters = run.max_vcn_end();
        let new_clusters = fs.bytes_to_cluster(new_size);

        // 收缩回常驻：只对收缩中的无名 $DATA 做，$SDS、
        // $INDEX_ALLOCATION 这类必须保持非常驻的流不碰
        if new_size < old_data
            && new_size <= fs.attr_size_tr as u64
            && ty == ATTR_DATA
            && name.is_empty()
            && !sparsed
            && !attr.is_compressed()
            && new_size <= fs.max_bytes_per_attr as u64
        {
            return self.make_resident(fs, ty, name, run, new_size, old_data);
        }

        if new_clusters > old_clusters {
            // 增长
            if sparsed && !fs.options.prealloc {
                run.add(old_clusters, SPARSE_LCN, new_clusters - old_clusters);
            } else {
                let mut done = old_clusters;
                let mut hint = run
                    .lookup_entry(old_clusters.saturating_sub(1))
                    .map(|(lcn, _, _)| if lcn == SPARSE_LCN { 0 } else { lcn + 1 })
                    .unwrap_or(0);
                while done < new_clusters {
                    let (lcn, got) =
                        match fs.look_for_free_space(hint, new_clusters - done, AllocateOpt::Def) {
                            Ok(x) => x,
                            Err(e) => {
                                // 回滚本次新增
                                for r in run.iter().filter(|r| r.vcn >= old_clusters) {
                                    if !r.is_sparse() {
                                        fs.mark_as_free_ex(r.lcn, r.len, false)?;
                                    }
                                }
                                run.truncate(old_clusters);
                                return Err(e);
                            }
                        };
                    run.add(done, lcn, got);
                    done += got;
                    hint = lcn + got;
                }
            }
        } else if new_clusters < old_clusters {
            // 截断
            let freed: Vec<(CLST, CLST)> = run
                .iter()
                .filter(|r| !r.is_sparse() && r.vcn + r.len > new_clusters)
                .map(|r| {
                    let from = r.vcn.max(new_clusters);
                    (r.lcn + (from - r.vcn), r.vcn + r.len - from)
                })
                .collect();
            for (lcn, len) in freed {
                fs.mark_as_free_ex(lcn, len, true)?;
            }
            run.truncate(new_clusters);
        }

        let valid = old_valid.min(new_size);
        self.rebuild_nonresident(
            fs,
            ty,
            name,
            run,
            new_clusters,
            (new_clusters as u64) << fs.cluster_bits,
            new_size,
            valid,
            flags,
        )
    }

    /// 非常驻 → 常驻
    fn make_resident<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ty: u32,
        name: &[u16],
        run: &mut RunsTree,
        new_size: u64,
        old_data: u64,
    ) -> Result<()> {
        let keep = new_size.min(old_data) as usize;
        let mut data = alloc::vec![0u8; new_size as usize];
        if keep > 0 {
            run.read_vbo(&mut fs.bdev, fs.cluster_bits, 0, &mut data[..keep])?;
        }

        self.remove_fragments(fs, ty, name)?;
        fs.run_deallocate(run, true)?;
        run.clear();

        let h = self.insert_resident(fs, data.len(), ty, name)?;
        let rec = self.record_mut(h.rno).unwrap();
        rec.set_resident_data(h.off, &data)?;
        Ok(())
    }

    /// 摘掉 (ty, name) 的全部分片（不动簇）
    fn remove_fragments<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ty: u32,
        name: &[u16],
    ) -> Result<()> {
        if self.attr_list.is_none() {
            while let Some(off) = self.base.find_attr(None, ty, name, None) {
                self.base.remove_attr(off);
            }
            return Ok(());
        }

        let entries: Vec<(CLST, u16, crate::types::MftRef)> = {
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
        for (vcn, id, r) in entries {
            self.load_mi(fs, r)?;
            let rec = self.record_mut(r.rno).unwrap();
            if let Some(off) = rec.find_attr(None, ty, name, Some(id)) {
                rec.remove_attr(off);
            }
            self.attr_list.as_mut().unwrap().delete(ty, name, vcn, Some(r));
            self.free_subrecord_if_empty(fs, r.rno)?;
        }
        Ok(())
    }

    /// 重建 (ty, name) 的非常驻分片并写入大小字段
    #[allow(clippy::too_many_arguments)]
    fn rebuild_nonresident<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ty: u32,
        name: &[u16],
        run: &RunsTree,
        total_len: CLST,
        alloc_size: u64,
        data_size: u64,
        valid_size: u64,
        flags: u16,
    ) -> Result<()> {
        self.remove_fragments(fs, ty, name)?;
        let first = self.insert_nonresident(fs, ty, name, run, 0, total_len, flags)?;
        let rec = self.record_mut(first.rno).unwrap();
        rec.set_nres_sizes(first.off, alloc_size, data_size, valid_size);
        Ok(())
    }

    /// 常驻 / 非常驻一视同仁地读流
    ///
    /// 对应 `inode_read_data()` 一类的辅助。
    pub fn read_stream<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ty: u32,
        name: &[u16],
        run: &mut RunsTree,
        vbo: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let h = self
            .find_attr(fs, ty, name, None)?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;
        let attr = self.attr_view(h);
        if attr.is_nonresident() {
            if run.is_empty() {
                self.load_all_runs(fs, ty, name, run)?;
            }
            run.read_vbo(&mut fs.bdev, fs.cluster_bits, vbo, buf)
        } else {
            let data = attr.resident_data()?;
            let off = vbo as usize;
            if off + buf.len() > data.len() {
                return Err(Error::new(ErrorKind::InvalidInput, "read past resident data"));
            }
            buf.copy_from_slice(&data[off..off + buf.len()]);
            Ok(())
        }
    }

    /// 常驻 / 非常驻一视同仁地写流（范围必须已在尺寸内）
    ///
    /// 对应 `inode_write_data()`。
    pub fn write_stream<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ty: u32,
        name: &[u16],
        run: &mut RunsTree,
        vbo: u64,
        data: &[u8],
    ) -> Result<()> {
        let h = self
            .find_attr(fs, ty, name, None)?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;
        let attr = self.attr_view(h);
        if attr.is_nonresident() {
            if run.is_empty() {
                self.load_all_runs(fs, ty, name, run)?;
            }
            run.write_vbo(&mut fs.bdev, fs.cluster_bits, vbo, data, false)
        } else {
            let mut cur = attr.resident_data()?.to_vec();
            let off = vbo as usize;
            if off + data.len() > cur.len() {
                return Err(Error::new(ErrorKind::InvalidInput, "write past resident data"));
            }
            cur[off..off + data.len()].copy_from_slice(data);
            let rec = self.record_mut(h.rno).unwrap();
            rec.set_resident_data(h.off, &cur)
        }
    }

    /// 给 `[vcn, vcn+clen)` 保证有实簇
    ///
    /// 已映射时直接返回；空洞或未映射时分配并更新属性。
    /// 返回 `(lcn, len, 是否新分配)`。对应 `attr_data_get_block()`。
    pub fn data_get_block<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        ty: u32,
        name: &[u16],
        run: &mut RunsTree,
        vcn: CLST,
        clen: CLST,
    ) -> Result<(CLST, CLST, bool)> {
        if run.is_empty() {
            self.load_all_runs(fs, ty, name, run)?;
        }
        if let Some((lcn, len, _)) = run.lookup_entry(vcn) {
            if lcn != SPARSE_LCN {
                return Ok((lcn, len.min(clen), false));
            }
        }

        fs.assert_writable()?;
        fs.mark_dirty_for_write()?;

        let hint = vcn
            .checked_sub(1)
            .and_then(|v| run.lookup_entry(v))
            .map(|(lcn, _, _)| if lcn == SPARSE_LCN { 0 } else { lcn + 1 })
            .unwrap_or(0);
        let (lcn, got) = fs.look_for_free_space(hint, clen, AllocateOpt::Def)?;
        run.add(vcn, lcn, got);

        // 覆盖范围或尺寸变化需要重新打包
        let h = self
            .find_attr(fs, ty, name, None)?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;
        let attr = self.attr_view(h);
        let flags = attr.flags();
        let data_size = attr.data_size();
        let valid = attr.valid_size();
        let total = run.max_vcn_end();
        self.rebuild_nonresident(
            fs,
            ty,
            name,
            run,
            total,
            (total as u64) << fs.cluster_bits,
            data_size,
            valid,
            flags,
        )?;
        Ok((lcn, got, true))
    }
}
