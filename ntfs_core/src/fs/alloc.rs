//! 簇与 MFT 记录分配
//!
//! 对应 ntfs3 `fsntfs.c` 的 `ntfs_look_for_free_space()` /
//! `ntfs_look_free_mft()` / `ntfs_mark_rec_free()` /
//! `mark_as_free_ex()` / `ntfs_refresh_zone()`。
//!
//! 锁序：簇位图先于 MFT 位图。

use super::{Ntfs, NtfsFlags};
use crate::block::{BlockDevice, DeviceLock};
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::record::MftRecord;
use log::{debug, warn};

/// 分配意图
///
/// 对应 `enum ALLOCATE_OPT`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocateOpt {
    /// 普通数据：避开 MFT zone
    Def,
    /// MFT 扩展：优先 zone
    Mft,
}

impl<D: BlockDevice, L: DeviceLock> Ntfs<D, L> {
    /// 分配一段簇
    ///
    /// 返回 `(lcn, len)`，`len` 可能小于请求值。失败前做一次
    /// zone 回收重试，之后才浮出 `no-space`。
    pub fn look_for_free_space(
        &mut self,
        hint: CLST,
        len: CLST,
        opt: AllocateOpt,
    ) -> Result<(CLST, CLST)> {
        self.assert_writable()?;
        if len == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "zero-length allocation"));
        }

        if opt == AllocateOpt::Mft {
            if self.used.bitmap.zone_len() == 0 {
                self.refresh_zone()?;
            }
            let zone_hint = self.used.bitmap.zone_bit();
            if let Some((lcn, alen)) = self.used.bitmap.find(
                &mut self.bdev,
                len as usize,
                zone_hint,
                BITMAP_FIND_MARK_AS_USED,
            )? {
                return Ok((lcn as CLST, alen as CLST));
            }
            // zone 耗尽：作废重建后按普通路径走
            self.used.bitmap.zone_set(0, 0);
            self.refresh_zone()?;
        }

        let hint = if hint != 0 { hint } else { self.used.next_free_lcn };
        if let Some((lcn, alen)) = self.used.bitmap.find(
            &mut self.bdev,
            len as usize,
            hint as usize,
            BITMAP_FIND_MARK_AS_USED,
        )? {
            self.used.next_free_lcn = (lcn + alen) as CLST;
            return Ok((lcn as CLST, alen as CLST));
        }

        // 一次 zone 回收重试
        if self.used.bitmap.zone_len() != 0 {
            debug!("ntfs: reclaiming mft zone for data allocation");
            self.used.bitmap.zone_set(0, 0);
            if let Some((lcn, alen)) = self.used.bitmap.find(
                &mut self.bdev,
                len as usize,
                hint as usize,
                BITMAP_FIND_MARK_AS_USED,
            )? {
                self.used.next_free_lcn = (lcn + alen) as CLST;
                return Ok((lcn as CLST, alen as CLST));
            }
        }
        Err(Error::from_kind(ErrorKind::NoSpace))
    }

    /// 释放一段簇
    ///
    /// `trim` 且挂载带 `discard` 时按丢弃粒度下发 TRIM。
    /// 对应 `mark_as_free_ex()`。
    pub fn mark_as_free_ex(&mut self, lcn: CLST, len: CLST, trim: bool) -> Result<()> {
        self.used
            .bitmap
            .set_free(&mut self.bdev, lcn as usize, len as usize)?;
        if lcn < self.used.next_free_lcn {
            self.used.next_free_lcn = lcn;
        }

        if trim && self.options.discard && !self.flags.contains(NtfsFlags::NODISCARD) {
            let gran = self.bdev.device().discard_granularity() as u64;
            let start = ((lcn as u64) << self.cluster_bits).next_multiple_of(gran.max(1));
            let end = ((lcn as u64 + len as u64) << self.cluster_bits) / gran.max(1) * gran.max(1);
            if end > start {
                self.bdev.device_mut().discard(start, end - start)?;
            }
        }
        Ok(())
    }

    /// 释放 runs 树覆盖的全部实簇
    ///
    /// 对应 `run_deallocate()`。
    pub fn run_deallocate(&mut self, run: &crate::run::RunsTree, trim: bool) -> Result<()> {
        for r in run.iter() {
            if !r.is_sparse() {
                self.mark_as_free_ex(r.lcn, r.len, trim)?;
            }
        }
        Ok(())
    }

    /// 重算 MFT zone
    ///
    /// zone 紧跟 $MFT 数据之后，长度取卷的 1/8 与实际可用空间
    /// 的较小者，但不低于最小值。对应 `ntfs_refresh_zone()`。
    pub fn refresh_zone(&mut self) -> Result<()> {
        if self.used.bitmap.zone_len() != 0 {
            return Ok(());
        }

        let end_vcn = self.mft.run.max_vcn_end();
        let lcn_after = match end_vcn
            .checked_sub(1)
            .and_then(|v| self.mft.run.lookup_entry(v))
        {
            Some((lcn, _, _)) if lcn != SPARSE_LCN => lcn + 1,
            _ => 0,
        };

        let nbits = self.used.bitmap.nbits();
        let want = (nbits / 8).max(NTFS_MIN_MFT_ZONE as usize);
        // 紧跟 MFT 之后找一段空闲做 zone
        let zone = self
            .used
            .bitmap
            .find(&mut self.bdev, want, lcn_after as usize, 0)?;
        match zone {
            Some((bit, len)) => {
                debug!("ntfs: mft zone set to [{}, {})", bit, bit + len);
                self.used.bitmap.zone_set(bit, len);
            }
            None => {
                self.used.bitmap.zone_set(0, 0);
            }
        }
        Ok(())
    }

    /// 分配一个空闲 MFT 记录号
    ///
    /// 顺序：位图扫描 →（耗尽时）按块扩展 $MFT → 特权调用者
    /// 动用保留池。`privileged` 只给属性表扩展这类内部操作传
    /// true，用来卡住递归分配的深度。对应 `ntfs_look_free_mft()`。
    pub fn look_free_mft(&mut self, privileged: bool) -> Result<CLST> {
        self.assert_writable()?;

        if self.mft.next_free < MFT_REC_FREE {
            self.mft.next_free = MFT_REC_FREE;
        }

        // (1) 位图扫描
        if let Some((bit, _)) = self.mft.bitmap.find(
            &mut self.bdev,
            1,
            self.mft.next_free as usize,
            BITMAP_FIND_MARK_AS_USED | BITMAP_FIND_FULL,
        )? {
            let rno = bit as CLST;
            self.mft.next_free = rno + 1;
            self.note_mft_high_water(rno)?;
            return Ok(rno);
        }

        // (2) 扩 $MFT::$DATA 一个分配步长
        match self.extend_mft() {
            Ok(()) => {
                if let Some((bit, _)) = self.mft.bitmap.find(
                    &mut self.bdev,
                    1,
                    self.mft.next_free as usize,
                    BITMAP_FIND_MARK_AS_USED | BITMAP_FIND_FULL,
                )? {
                    let rno = bit as CLST;
                    self.mft.next_free = rno + 1;
                    self.note_mft_high_water(rno)?;
                    return Ok(rno);
                }
            }
            Err(e) if e.kind() == ErrorKind::NoSpace => {}
            Err(e) => return Err(e),
        }

        // (3) 保留池
        if privileged {
            for i in 0..MFT_RESERVED_BITS {
                if self.mft.reserved_bitmap & (1 << i) == 0 {
                    self.mft.reserved_bitmap |= 1 << i;
                    let rno = MFT_REC_FREE - MFT_RESERVED_BITS as CLST + i as CLST;
                    warn!("ntfs: handing out reserved mft record {rno}");
                    return Ok(rno);
                }
            }
        }
        Err(Error::from_kind(ErrorKind::NoSpace))
    }

    /// 新分配的记录落在旧高水位之上时，把中间一段清零，
    /// 避免读到上一世代的记录残骸
    ///
    /// 对应 `ntfs_clear_mft_tail()`。
    fn note_mft_high_water(&mut self, rno: CLST) -> Result<()> {
        if rno < self.mft.used {
            return Ok(());
        }
        let from = (self.mft.used as u64) << self.record_bits;
        let to = ((rno + 1) as u64) << self.record_bits;
        self.mft
            .run
            .zero_vbo(&mut self.bdev, self.cluster_bits, from, to - from)?;
        self.mft.used = rno + 1;
        Ok(())
    }

    /// 归还一个 MFT 记录号
    ///
    /// 记录体不清零，下次分配时由 `format_new` 整体覆盖。
    /// 对应 `ntfs_mark_rec_free()`。
    pub fn mark_rec_free(&mut self, rno: CLST) -> Result<()> {
        let reserved_base = MFT_REC_FREE - MFT_RESERVED_BITS as CLST;
        if rno >= reserved_base && rno < MFT_REC_FREE {
            self.mft.reserved_bitmap &= !(1 << (rno - reserved_base));
            return Ok(());
        }
        if rno < MFT_REC_FREE {
            warn!("ntfs: refusing to free meta record {rno}");
            return Ok(());
        }
        self.mft
            .bitmap
            .set_free(&mut self.bdev, rno as usize, 1)?;
        if rno < self.mft.next_free {
            self.mft.next_free = rno;
        }
        Ok(())
    }

    /// 给 $MFT::$DATA 增加一个分配步长的记录
    ///
    /// 簇从 zone 优先拿；新 runs 重新打包进记录 0，位图随之
    /// 扩展。新簇整体清零。
    fn extend_mft(&mut self) -> Result<()> {
        let step_bytes = (MFT_INCREASE_STEP as u64) << self.record_bits;
        let old_clusters = self.mft.run.max_vcn_end();
        let add_clusters = self.bytes_to_cluster(step_bytes).max(1);

        let (lcn, got) = self.look_for_free_space(0, add_clusters, AllocateOpt::Mft)?;
        self.mft.run.add(old_clusters, lcn, got);

        // 新簇清零（等价于 clear_mft_tail 对增量区的要求）
        let res = self.extend_mft_commit(old_clusters, lcn, got);
        if res.is_err() {
            // 回滚
            self.mft.run.truncate(old_clusters);
            self.mark_as_free_ex(lcn, got, false)?;
        }
        res
    }

    fn extend_mft_commit(&mut self, old_clusters: CLST, _lcn: CLST, got: CLST) -> Result<()> {
        self.mft.run.zero_vbo(
            &mut self.bdev,
            self.cluster_bits,
            (old_clusters as u64) << self.cluster_bits,
            (got as u64) << self.cluster_bits,
        )?;

        let new_bytes = ((old_clusters + got) as u64) << self.cluster_bits;
        let new_records = (new_bytes >> self.record_bits) as usize;

        // 回写记录 0 的 $DATA runs 和大小
        let mut rec0 = self.read_record(MFT_REC_MFT)?;
        let off = rec0
            .find_attr(None, ATTR_DATA, &[], None)
            .ok_or_else(|| Error::new(ErrorKind::Corrupted, "$MFT lost its data"))?;
        let total = self.mft.run.max_vcn_end();
        let packed = rec0.pack_runs(off, &self.mft.run, total)?;
        if packed != total {
            // 记录 0 装不下 $MFT 自身的 runs：体量远超本实现的
            // 设计点，按空间不足上报
            return Err(Error::from_kind(ErrorKind::NoSpace));
        }
        rec0.set_nres_sizes(off, new_bytes, new_bytes, new_bytes);

        // $MFT::$BITMAP 覆盖不了新记录数时先扩它
        let bits_needed = bitmap_size(new_records);
        let boff = rec0
            .find_attr(None, ATTR_BITMAP, &[], None)
            .ok_or_else(|| Error::new(ErrorKind::Corrupted, "$MFT lost its bitmap"))?;
        let mut balloc = rec0.attr(boff).alloc_size();
        if balloc < bits_needed as u64 {
            let (blcn, bgot) = self.look_for_free_space(0, 1, AllocateOpt::Mft)?;
            let mut brun = self.mft.bitmap.run().clone();
            let bvcn = brun.max_vcn_end();
            brun.add(bvcn, blcn, bgot);
            brun.zero_vbo(
                &mut self.bdev,
                self.cluster_bits,
                (bvcn as u64) << self.cluster_bits,
                (bgot as u64) << self.cluster_bits,
            )?;
            let btotal = brun.max_vcn_end();
            let packed = rec0.pack_runs(boff, &brun, btotal)?;
            if packed != btotal {
                return Err(Error::from_kind(ErrorKind::NoSpace));
            }
            balloc = (btotal as u64) << self.cluster_bits;
            self.mft.bitmap.set_run(brun);
        }
        let boff = rec0
            .find_attr(None, ATTR_BITMAP, &[], None)
            .ok_or_else(|| Error::new(ErrorKind::Corrupted, "$MFT lost its bitmap"))?;
        rec0.set_nres_sizes(boff, balloc, bits_needed as u64, bits_needed as u64);

        self.write_record(&mut rec0, true)?;
        self.mft.bitmap.extend(&mut self.bdev, new_records)?;
        debug!("ntfs: mft extended to {} records", new_records);
        Ok(())
    }

    /// 创建一条新格式化的记录并写盘
    ///
    /// 组合 `look_free_mft` + `mi_format_new`。
    pub fn new_record(&mut self, privileged: bool, flags: u16) -> Result<MftRecord> {
        let rno = self.look_free_mft(privileged)?;
        // 只捞上一世代的序列号，不做完整解码（空槽是全零）
        let mut seqb = [0u8; 2];
        self.mft
            .run
            .read_vbo(
                &mut self.bdev,
                self.cluster_bits,
                ((rno as u64) << self.record_bits) + 0x10,
                &mut seqb,
            )
            .ok();
        let prev_seq = u16::from_le_bytes(seqb);
        let mut rec = MftRecord::format_new(
            rno,
            self.record_size as usize,
            self.sector_size as usize,
            prev_seq,
            flags,
        );
        self.write_record(&mut rec, false)?;
        Ok(rec)
    }
}
