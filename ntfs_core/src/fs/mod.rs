//! 卷级状态与挂载
//!
//! 对应 ntfs3 的 `struct ntfs_sb_info` + `fsntfs.c` / `super.c`
//! 的核心部分。`Ntfs` 拥有块设备、两张位图（簇、MFT）、upcase
//! 表和卷状态机；inode / 索引层通过它做一切分配与记录 I/O。
//!
//! 锁序（外层调用方约定）：inode 元数据锁 → 簇位图 → MFT
//! 位图 → 共享索引（$SII/$SDH 等）→ 块缓冲。两个 inode 之间
//! 按记录号排序。

mod alloc;

pub use alloc::AllocateOpt;

use crate::bitmap::WndBitmap;
use crate::block::{BlockDev, BlockDevice, DeviceLock};
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::options::MountOptions;
use crate::record::MftRecord;
use crate::run::RunsTree;
use crate::types::*;
use ::alloc::vec;
use ::alloc::vec::Vec;
use bitflags::bitflags;
use log::{debug, error, warn};

bitflags! {
    /// 卷运行时标志
    #[derive(Debug, Clone, Copy)]
    pub struct NtfsFlags: u32 {
        /// 设备不支持 discard 或粒度为 0
        const NODISCARD = 0x0000_0001;
        /// 第一批 MFT 记录改过，$MftMirr 需要刷新
        const MFTMIRR = 0x0000_1000;
        /// $LogFile 尚未重放，拒绝一切写入
        const NEED_REPLAY = 0x0400_0000;
    }
}

/// 卷状态机：clean → dirty →（检出损坏）error
///
/// 对应 `enum NTFS_DIRTY_FLAGS`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NtfsState {
    Clean,
    Dirty,
    Error,
}

/// MFT 子系统
///
/// 对应 `ntfs_sb_info.mft`。
pub struct MftSubsys {
    /// $MFT::$DATA 的 runs
    pub run: RunsTree,
    /// $MFT::$BITMAP
    pub bitmap: WndBitmap,
    /// 下一次从这里开始找空闲记录
    pub next_free: CLST,
    /// 已清零区的高水位（记录数）
    pub used: CLST,
    /// $MftMirr 覆盖的记录数
    pub recs_mirr: CLST,
    /// 保留池位图（记录 MFT_REC_RESERVED..MFT_REC_FREE）
    pub reserved_bitmap: u8,
}

/// 簇分配子系统
///
/// 对应 `ntfs_sb_info.used`。
pub struct UsedSubsys {
    /// $Bitmap::$DATA
    pub bitmap: WndBitmap,
    pub next_free_lcn: CLST,
}

/// 卷元数据
pub struct VolumeMeta {
    pub size: u64,
    pub blocks: u64,
    pub ser_num: u64,
    pub major_ver: u8,
    pub minor_ver: u8,
    pub flags: u16,
    pub label: Vec<u16>,
    pub real_dirty: bool,
}

/// 在核 NTFS 卷
pub struct Ntfs<D, L: DeviceLock = crate::block::NoLock> {
    pub bdev: BlockDev<D, L>,

    // 几何参数，挂载时定死
    pub sector_size: u32,
    pub sector_bits: u8,
    pub cluster_size: u32,
    pub cluster_bits: u8,
    pub record_size: u32,
    pub record_bits: u8,
    pub index_size: u32,
    pub maxbytes: u64,

    /// 记录内单个属性的大小上限
    pub max_bytes_per_attr: u32,
    /// 非常驻回转常驻的阈值
    pub attr_size_tr: u32,

    pub flags: NtfsFlags,
    pub state: NtfsState,
    pub options: MountOptions,

    pub upcase: Vec<u16>,
    pub bad_clusters: CLST,

    pub mft: MftSubsys,
    pub used: UsedSubsys,
    pub volume: VolumeMeta,
}

impl<D: BlockDevice, L: DeviceLock> Ntfs<D, L> {
    /// 挂载：解析启动扇区，自举 $MFT，装载两张位图、$Volume
    /// 与 $UpCase，检查脏标志
    ///
    /// 卷带脏标志时置 `NEED_REPLAY` 阻塞所有写入，外部重放
    /// $LogFile 后调 [`Ntfs::replay_done`]；不带 `force` 且设备
    /// 可写时这会在第一次写入时浮出 `replay-needed`。
    pub fn mount(mut bdev: BlockDev<D, L>, options: MountOptions) -> Result<Self> {
        // ---- 启动扇区 ----
        let mut boot_buf = vec![0u8; 512];
        bdev.read_bytes(0, &mut boot_buf)?;
        let boot = NtfsBoot::parse(&boot_buf)?;

        let cluster_bits = boot.cluster_size.trailing_zeros() as u8;
        let record_bits = boot.record_size.trailing_zeros() as u8;
        let sector_bits = boot.sector_size.trailing_zeros() as u8;

        let total_clusters = boot.total_sectors >> (cluster_bits - sector_bits);
        if total_clusters > u32::MAX as u64 {
            return Err(Error::new(ErrorKind::Unsupported, "volume needs 64-bit clusters"));
        }
        let total_clusters = total_clusters as CLST;

        // ---- 自举 $MFT（记录 0）----
        let mft_lbo = boot.mft_lcn << cluster_bits;
        let mut rec0_buf = vec![0u8; boot.record_size as usize];
        bdev.read_bytes(mft_lbo, &mut rec0_buf)?;
        let rec0 = MftRecord::from_bytes(MFT_REC_MFT, rec0_buf, boot.sector_size as usize)?;

        let mut mft_run = RunsTree::new();
        let mut mft_bitmap_run = RunsTree::new();
        let mut mft_data_size = 0u64;
        let mut mft_bitmap_bits = 0usize;

        let mut off = None;
        loop {
            off = rec0.enum_attr(off);
            let Some(o) = off else { break };
            let attr = rec0.attr(o);
            match attr.type_() {
                ATTR_DATA if attr.name_len() == 0 => {
                    attr.load_runs(&mut mft_run)?;
                    mft_data_size = attr.data_size();
                }
                ATTR_BITMAP if attr.name_len() == 0 => {
                    if !attr.is_nonresident() {
                        return Err(Error::new(ErrorKind::Unsupported, "resident $MFT bitmap"));
                    }
                    attr.load_runs(&mut mft_bitmap_run)?;
                    mft_bitmap_bits = (mft_data_size >> record_bits) as usize;
                }
                _ => {}
            }
        }
        if mft_run.is_empty() || mft_data_size == 0 {
            return Err(Error::new(ErrorKind::Corrupted, "$MFT has no data"));
        }
        if mft_bitmap_bits == 0 {
            mft_bitmap_bits = (mft_data_size >> record_bits) as usize;
        }

        let mft_bitmap = WndBitmap::init(&mut bdev, mft_bitmap_run, cluster_bits, mft_bitmap_bits)?;

        // ---- $Bitmap（记录 6）----
        let read_rec = |bdev: &mut BlockDev<D, L>, rno: CLST| -> Result<MftRecord> {
            let mut buf = vec![0u8; boot.record_size as usize];
            mft_run.read_vbo(bdev, cluster_bits, (rno as u64) << record_bits, &mut buf)?;
            MftRecord::from_bytes(rno, buf, boot.sector_size as usize)
        };

        let rec_bitmap = read_rec(&mut bdev, MFT_REC_BITMAP)?;
        let mut vol_bitmap_run = RunsTree::new();
        let o = rec_bitmap
            .find_attr(None, ATTR_DATA, &[], None)
            .ok_or_else(|| Error::new(ErrorKind::Corrupted, "$Bitmap has no data"))?;
        let attr = rec_bitmap.attr(o);
        if !attr.is_nonresident() {
            return Err(Error::new(ErrorKind::Unsupported, "resident volume bitmap"));
        }
        attr.load_runs(&mut vol_bitmap_run)?;
        if (attr.data_size() as usize) < bitmap_size(total_clusters as usize) {
            return Err(Error::new(ErrorKind::Corrupted, "volume bitmap too small"));
        }
        let vol_bitmap =
            WndBitmap::init(&mut bdev, vol_bitmap_run, cluster_bits, total_clusters as usize)?;

        // ---- $Volume（记录 3）----
        let rec_vol = read_rec(&mut bdev, MFT_REC_VOL)?;
        let mut volume = VolumeMeta {
            size: boot.total_sectors << sector_bits,
            blocks: boot.total_sectors,
            ser_num: boot.serial_num,
            major_ver: 0,
            minor_ver: 0,
            flags: 0,
            label: Vec::new(),
            real_dirty: false,
        };
        if let Some(o) = rec_vol.find_attr(None, ATTR_VOL_INFO, &[], None) {
            let info = VolumeInfo::from_bytes(rec_vol.attr(o).resident_data()?)?;
            volume.major_ver = info.major_ver;
            volume.minor_ver = info.minor_ver;
            volume.flags = info.flags;
            volume.real_dirty = info.flags & VOLUME_FLAG_DIRTY != 0;
        }
        if let Some(o) = rec_vol.find_attr(None, ATTR_LABEL, &[], None) {
            let data = rec_vol.attr(o).resident_data()?;
            volume.label = get_utf16(data, 0, data.len() / 2);
        }

        // ---- $UpCase（记录 10）----
        let upcase = match Self::load_upcase(&mut bdev, &read_rec, cluster_bits) {
            Ok(tbl) => tbl,
            Err(e) => {
                warn!("ntfs: cannot load $UpCase ({e}), using builtin table");
                crate::upcase::generate_default_upcase()
            }
        };

        // ---- $BadClus（记录 8）----
        let bad_clusters = Self::count_bad_clusters(&read_rec, &mut bdev).unwrap_or(0);
        if bad_clusters != 0 {
            warn!("ntfs: volume has {bad_clusters} bad clusters");
        }

        let mut flags = NtfsFlags::empty();
        if volume.real_dirty {
            warn!("ntfs: volume is dirty, $LogFile replay required before writing");
            flags |= NtfsFlags::NEED_REPLAY;
        }
        if options.discard && bdev.device().discard_granularity() == 0 {
            flags |= NtfsFlags::NODISCARD;
        }

        let record_size = boot.record_size;
        let mut fs = Self {
            sector_size: boot.sector_size,
            sector_bits,
            cluster_size: boot.cluster_size,
            cluster_bits,
            record_size,
            record_bits,
            index_size: boot.index_size,
            maxbytes: (total_clusters as u64) << cluster_bits,
            max_bytes_per_attr: record_size
                - 0x38
                - crate::record::SIZEOF_RESIDENT as u32
                - 8,
            attr_size_tr: ATTR_SIZE_TR,
            flags,
            state: if volume.real_dirty {
                NtfsState::Dirty
            } else {
                NtfsState::Clean
            },
            options,
            upcase,
            bad_clusters,
            mft: MftSubsys {
                run: mft_run,
                bitmap: mft_bitmap,
                next_free: MFT_REC_FREE,
                used: mft_bitmap_bits as CLST,
                recs_mirr: ((boot.cluster_size / record_size).max(1) as CLST).min(4),
                reserved_bitmap: 0,
            },
            used: UsedSubsys {
                bitmap: vol_bitmap,
                next_free_lcn: 0,
            },
            volume,
            bdev,
        };
        fs.refresh_zone()?;
        debug!(
            "ntfs: mounted, {} clusters of {} bytes, record {} bytes",
            total_clusters, fs.cluster_size, fs.record_size
        );
        Ok(fs)
    }

    fn load_upcase(
        bdev: &mut BlockDev<D, L>,
        read_rec: &impl Fn(&mut BlockDev<D, L>, CLST) -> Result<MftRecord>,
        cluster_bits: u8,
    ) -> Result<Vec<u16>> {
        let rec = read_rec(bdev, MFT_REC_UPCASE)?;
        let o = rec
            .find_attr(None, ATTR_DATA, &[], None)
            .ok_or_else(|| Error::new(ErrorKind::Corrupted, "$UpCase has no data"))?;
        let attr = rec.attr(o);
        if attr.data_size() != (crate::upcase::UPCASE_LEN * 2) as u64 {
            return Err(Error::new(ErrorKind::Corrupted, "$UpCase has odd size"));
        }
        let mut bytes = vec![0u8; crate::upcase::UPCASE_LEN * 2];
        if attr.is_nonresident() {
            let mut run = RunsTree::new();
            attr.load_runs(&mut run)?;
            run.read_vbo(bdev, cluster_bits, 0, &mut bytes)?;
        } else {
            bytes.copy_from_slice(attr.resident_data()?);
        }
        Ok(bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect())
    }

    fn count_bad_clusters(
        read_rec: &impl Fn(&mut BlockDev<D, L>, CLST) -> Result<MftRecord>,
        bdev: &mut BlockDev<D, L>,
    ) -> Result<CLST> {
        let rec = read_rec(bdev, MFT_REC_BADCLUST)?;
        let bad_name = crate::upcase::str_to_utf16("$Bad");
        let Some(o) = rec.find_attr(None, ATTR_DATA, &bad_name, None) else {
            return Ok(0);
        };
        let attr = rec.attr(o);
        if !attr.is_nonresident() {
            return Ok(0);
        }
        let mut run = RunsTree::new();
        attr.load_runs(&mut run)?;
        Ok(run.iter().filter(|r| !r.is_sparse()).map(|r| r.len).sum())
    }

    // ===== 写入门禁 =====

    /// 所有变更路径的共同前置检查
    pub fn assert_writable(&self) -> Result<()> {
        if self.flags.contains(NtfsFlags::NEED_REPLAY) {
            return Err(Error::from_kind(ErrorKind::ReplayNeeded));
        }
        if self.bdev.device().is_read_only() {
            return Err(Error::new(ErrorKind::Io, "device is read-only"));
        }
        Ok(())
    }

    /// 外部 $LogFile 重放完成后放行写入
    pub fn replay_done(&mut self) {
        self.flags.remove(NtfsFlags::NEED_REPLAY);
    }

    // ===== 记录 I/O =====

    /// 读一条 MFT 记录
    ///
    /// 对应 `mi_get()` + `mi_read()`。
    pub fn read_record(&mut self, rno: CLST) -> Result<MftRecord> {
        if rno as usize >= self.mft.bitmap.nbits() {
            return Err(Error::new(ErrorKind::InvalidInput, "record number out of range"));
        }
        let mut buf = vec![0u8; self.record_size as usize];
        self.mft.run.read_vbo(
            &mut self.bdev,
            self.cluster_bits,
            (rno as u64) << self.record_bits,
            &mut buf,
        )?;
        let rec = MftRecord::from_bytes(rno, buf, self.sector_size as usize);
        if rec.is_err() {
            self.set_state(NtfsState::Error).ok();
        }
        rec
    }

    /// 写一条 MFT 记录
    ///
    /// 前几条记录写过后置 MFTMIRR 标志，由 `update_mftmirr`
    /// 同步镜像。对应 `mi_write()`。
    pub fn write_record(&mut self, rec: &mut MftRecord, sync: bool) -> Result<()> {
        self.assert_writable()?;
        let image = rec.write_image()?;
        self.mft.run.write_vbo(
            &mut self.bdev,
            self.cluster_bits,
            (rec.rno as u64) << self.record_bits,
            &image,
            sync,
        )?;
        rec.dirty = false;
        if rec.rno < self.mft.recs_mirr {
            self.flags |= NtfsFlags::MFTMIRR;
            if sync {
                self.update_mftmirr(true)?;
            }
        }
        Ok(())
    }

    /// 把前 `recs_mirr` 条记录原样拷进 $MftMirr
    ///
    /// 对应 `ntfs_update_mftmirr()`。
    pub fn update_mftmirr(&mut self, wait: bool) -> Result<()> {
        if !self.flags.contains(NtfsFlags::MFTMIRR) {
            return Ok(());
        }
        // $MFTMirr 的数据永远连续放在 boot 指明的 LCN 上
        let rec_mirr = self.read_record(MFT_REC_MIRR)?;
        let o = rec_mirr
            .find_attr(None, ATTR_DATA, &[], None)
            .ok_or_else(|| Error::new(ErrorKind::Corrupted, "$MFTMirr has no data"))?;
        let mut mirr_run = RunsTree::new();
        let attr = rec_mirr.attr(o);
        if attr.is_nonresident() {
            attr.load_runs(&mut mirr_run)?;
        } else {
            return Err(Error::new(ErrorKind::Corrupted, "resident $MFTMirr data"));
        }

        // 不越过镜像文件本身的大小
        let mirr_recs = (attr.data_size() >> self.record_bits).min(self.mft.recs_mirr as u64);
        let bytes = (mirr_recs as usize) << self.record_bits;
        let mut buf = vec![0u8; bytes];
        self.mft
            .run
            .read_vbo(&mut self.bdev, self.cluster_bits, 0, &mut buf)?;
        mirr_run.write_vbo(&mut self.bdev, self.cluster_bits, 0, &buf, wait)?;
        self.flags.remove(NtfsFlags::MFTMIRR);
        Ok(())
    }

    // ===== 卷状态机 =====

    /// clean → dirty → error；error 粘滞，clean 只在干净卸载
    /// 时恢复
    ///
    /// 对应 `ntfs_set_state()`。
    pub fn set_state(&mut self, new: NtfsState) -> Result<()> {
        match (self.state, new) {
            (NtfsState::Error, NtfsState::Error) => return Ok(()),
            (NtfsState::Error, _) if !self.options.force => {
                // error 粘滞
                return Ok(());
            }
            _ => {}
        }
        if new == NtfsState::Error {
            error!("ntfs: volume marked with error state");
        }
        self.state = new;

        // 落盘 $Volume 的脏标志
        let dirty_bit = new != NtfsState::Clean;
        if self.bdev.device().is_read_only() || self.flags.contains(NtfsFlags::NEED_REPLAY) {
            return Ok(());
        }
        let mut rec = self.read_record(MFT_REC_VOL)?;
        if let Some(o) = rec.find_attr(None, ATTR_VOL_INFO, &[], None) {
            let mut info = VolumeInfo::from_bytes(rec.attr(o).resident_data()?)?;
            let had = info.flags & VOLUME_FLAG_DIRTY != 0;
            if had != dirty_bit {
                if dirty_bit {
                    info.flags |= VOLUME_FLAG_DIRTY;
                } else {
                    info.flags &= !VOLUME_FLAG_DIRTY;
                }
                rec.set_resident_data(o, &info.to_bytes())?;
                self.write_record(&mut rec, true)?;
                self.volume.flags = info.flags;
                self.volume.real_dirty = dirty_bit;
            }
        }
        Ok(())
    }

    /// 第一次成功变更前调用：clean → dirty
    pub fn mark_dirty_for_write(&mut self) -> Result<()> {
        if self.state == NtfsState::Clean {
            self.set_state(NtfsState::Dirty)?;
        }
        Ok(())
    }

    /// 干净卸载：刷镜像、清脏标志、落盘
    pub fn unmount(&mut self) -> Result<()> {
        if self.state != NtfsState::Error && !self.flags.contains(NtfsFlags::NEED_REPLAY) {
            self.update_mftmirr(true)?;
            self.set_state(NtfsState::Clean)?;
        }
        self.bdev.flush()
    }

    // ===== 小工具 =====

    /// 字节数向上取整到簇
    pub fn bytes_to_cluster(&self, bytes: u64) -> CLST {
        ((bytes + self.cluster_size as u64 - 1) >> self.cluster_bits) as CLST
    }

    /// 簇对齐
    pub fn up_cluster(&self, bytes: u64) -> u64 {
        (bytes + self.cluster_size as u64 - 1) & !(self.cluster_size as u64 - 1)
    }

    /// 记录号是否元文件
    pub fn is_meta_record(&self, rno: CLST) -> bool {
        rno < MFT_REC_FREE
    }

    /// 拆出底层设备（卸载后重挂载用）
    pub fn into_device(self) -> D {
        self.bdev.into_device()
    }
}
