//! 集成测试公共设施：内存块设备 + 最小卷格式化
//!
//! 格式化器用 crate 自己的记录 / runs / 位图机制摆出一个合法
//! 的小 NTFS 卷（16 MiB，4K 簇，1K 记录），供 mount 起步。

// 各测试二进制只用到这里的一部分
#![allow(dead_code)]

use ntfs_core::consts::*;
use ntfs_core::record::{init_nonresident, init_resident, resident_layout, MftRecord};
use ntfs_core::run::RunsTree;
use ntfs_core::types::{put_u16, put_u32, put_u64, StdInfo, VolumeInfo};
use ntfs_core::upcase::{generate_default_upcase, str_to_utf16, UPCASE_LEN};
use ntfs_core::{BlockDev, BlockDevice, Result};

pub const SECTOR: u32 = 512;
pub const CLUSTER: u32 = 4096;
pub const RECORD: u32 = 1024;

/// 卷大小：16 MiB = 4096 簇
pub const TOTAL_SECTORS: u64 = 32 * 1024;
pub const TOTAL_CLUSTERS: u32 = (TOTAL_SECTORS as u32) / (CLUSTER / SECTOR);

// 固定布局
const LCN_MFT_BMP: u64 = 2;
const LCN_VOL_BMP: u64 = 3;
const LCN_MFT: u64 = 4;
const MFT_CLUSTERS: u32 = 8; // 32 条记录
const LCN_MIRR: u64 = 12;
const LCN_UPCASE: u64 = 13;
const UPCASE_CLUSTERS: u32 = 32;
const FIRST_FREE_LCN: u64 = LCN_UPCASE + UPCASE_CLUSTERS as u64;

/// 内存块设备
pub struct MemDevice {
    pub data: Vec<u8>,
    pub discards: Vec<(u64, u64)>,
}

impl MemDevice {
    pub fn new(sectors: u64) -> Self {
        Self {
            data: vec![0u8; (sectors * SECTOR as u64) as usize],
            discards: Vec::new(),
        }
    }
}

impl BlockDevice for MemDevice {
    fn sector_size(&self) -> u32 {
        SECTOR
    }

    fn total_sectors(&self) -> u64 {
        self.data.len() as u64 / SECTOR as u64
    }

    fn read_sectors(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<()> {
        let off = (lba * SECTOR as u64) as usize;
        let len = (count * SECTOR) as usize;
        buf[..len].copy_from_slice(&self.data[off..off + len]);
        Ok(())
    }

    fn write_sectors(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<()> {
        let off = (lba * SECTOR as u64) as usize;
        let len = (count * SECTOR) as usize;
        self.data[off..off + len].copy_from_slice(&buf[..len]);
        Ok(())
    }

    fn discard(&mut self, lbo: u64, bytes: u64) -> Result<()> {
        self.discards.push((lbo, bytes));
        Ok(())
    }

    fn discard_granularity(&self) -> u32 {
        CLUSTER
    }
}

fn new_rec(rno: CLST, flags: u16) -> MftRecord {
    let mut rec = MftRecord::format_new(rno, RECORD as usize, SECTOR as usize, 0, flags);
    // 每条记录都有 v5 标准信息
    let std = StdInfo::default().to_bytes(true);
    add_resident(&mut rec, ATTR_STD, &[], &std);
    rec
}

fn add_resident(rec: &mut MftRecord, ty: u32, name: &[u16], data: &[u8]) {
    let (asize, name_off) = resident_layout(name.len(), data.len());
    let off = rec.insert_attr(ty, name, asize, name_off).unwrap();
    init_resident(rec, off, data);
}

fn add_nonres(
    rec: &mut MftRecord,
    ty: u32,
    name: &[u16],
    run: &RunsTree,
    len: CLST,
    alloc: u64,
    data: u64,
) {
    let asize = quad_align(0x40 + name.len() * 2) + 8;
    let off = rec.insert_attr(ty, name, asize, 0x40).unwrap();
    init_nonresident(rec, off, 0, 0);
    if len > 0 {
        rec.pack_runs(off, run, len).unwrap();
    }
    let off = rec.find_attr(None, ty, name, None).unwrap();
    rec.set_nres_sizes(off, alloc, data, data);
}

/// 稀疏的非常驻属性（$BadClus::$Bad）
fn add_nonres_sparse(rec: &mut MftRecord, ty: u32, name: &[u16], clusters: CLST, data: u64) {
    let mut run = RunsTree::new();
    run.add(0, SPARSE_LCN, clusters);
    let asize = quad_align(0x40 + name.len() * 2) + 8;
    let off = rec.insert_attr(ty, name, asize, 0x40).unwrap();
    init_nonresident(rec, off, 0, ntfs_core::record::ATTR_FLAG_SPARSED);
    rec.pack_runs(off, &run, clusters).unwrap();
    let off = rec.find_attr(None, ty, name, None).unwrap();
    rec.set_nres_sizes(off, (clusters as u64) * CLUSTER as u64, data, data);
}

/// 空 $INDEX_ROOT 负载
fn empty_index_root(type_: u32, rule: u32) -> Vec<u8> {
    // LAST 项：size 0x10，flags = 2
    let mut payload = vec![0u8; 0x10 + 0x10 + 0x10];
    put_u32(&mut payload, 0x00, type_);
    put_u32(&mut payload, 0x04, rule);
    put_u32(&mut payload, 0x08, CLUSTER); // index_block_size
    payload[0x0C] = 1; // 每块 1 簇
    put_u32(&mut payload, 0x10, 0x10); // hdr.de_off
    put_u32(&mut payload, 0x14, 0x20); // hdr.used
    put_u32(&mut payload, 0x18, 0x20); // hdr.total
    put_u16(&mut payload, 0x20 + 0x08, 0x10); // last.size
    put_u16(&mut payload, 0x20 + 0x0C, 2); // last.flags = LAST
    payload
}

fn boot_sector() -> [u8; 512] {
    let mut b = [0u8; 512];
    b[3..11].copy_from_slice(b"NTFS    ");
    put_u16(&mut b, 0x0B, SECTOR as u16);
    b[0x0D] = (CLUSTER / SECTOR) as u8;
    put_u64(&mut b, 0x28, TOTAL_SECTORS);
    put_u64(&mut b, 0x30, LCN_MFT);
    put_u64(&mut b, 0x38, LCN_MIRR);
    b[0x40] = (-10i8) as u8; // 2^10 = 1024 字节记录
    b[0x44] = 1; // 1 簇索引块
    put_u64(&mut b, 0x48, 0x3141_5926_5358_9793);
    b[510] = 0x55;
    b[511] = 0xAA;
    b
}

/// 摆出一个可挂载的最小卷
pub fn format_volume() -> BlockDev<MemDevice> {
    let mut bdev = BlockDev::new(MemDevice::new(TOTAL_SECTORS));

    // 启动扇区
    bdev.write_bytes(0, &boot_sector(), false).unwrap();

    let mut mft_run = RunsTree::new();
    mft_run.add(0, LCN_MFT as CLST, MFT_CLUSTERS);

    let write_rec = |bdev: &mut BlockDev<MemDevice>, rec: &mut MftRecord| {
        let image = rec.write_image().unwrap();
        let lbo = LCN_MFT * CLUSTER as u64 + (rec.rno as u64) * RECORD as u64;
        bdev.write_bytes(lbo, &image, false).unwrap();
        image
    };

    // --- 记录 0：$MFT ---
    let mut rec = new_rec(MFT_REC_MFT, 0);
    add_nonres(
        &mut rec,
        ATTR_DATA,
        &[],
        &mft_run,
        MFT_CLUSTERS,
        (MFT_CLUSTERS * CLUSTER) as u64,
        (MFT_CLUSTERS * CLUSTER) as u64,
    );
    let mut bmp_run = RunsTree::new();
    bmp_run.add(0, LCN_MFT_BMP as CLST, 1);
    add_nonres(&mut rec, ATTR_BITMAP, &[], &bmp_run, 1, CLUSTER as u64, 8);
    let img0 = write_rec(&mut bdev, &mut rec);

    // --- 记录 1：$MFTMirr ---
    let mut rec = new_rec(MFT_REC_MIRR, 0);
    let mut mirr_run = RunsTree::new();
    mirr_run.add(0, LCN_MIRR as CLST, 1);
    add_nonres(&mut rec, ATTR_DATA, &[], &mirr_run, 1, CLUSTER as u64, CLUSTER as u64);
    let img1 = write_rec(&mut bdev, &mut rec);

    // --- 记录 2：$LogFile ---
    let mut rec = new_rec(MFT_REC_LOG, 0);
    add_resident(&mut rec, ATTR_DATA, &[], &[]);
    let img2 = write_rec(&mut bdev, &mut rec);

    // --- 记录 3：$Volume ---
    let mut rec = new_rec(MFT_REC_VOL, 0);
    let label: Vec<u8> = str_to_utf16("TESTVOL")
        .iter()
        .flat_map(|c| c.to_le_bytes())
        .collect();
    add_resident(&mut rec, ATTR_LABEL, &[], &label);
    let info = VolumeInfo {
        major_ver: 3,
        minor_ver: 1,
        flags: 0,
    };
    add_resident(&mut rec, ATTR_VOL_INFO, &[], &info.to_bytes());
    let img3 = write_rec(&mut bdev, &mut rec);

    // --- 记录 4：$AttrDef ---
    let mut rec = new_rec(MFT_REC_ATTR, 0);
    add_resident(&mut rec, ATTR_DATA, &[], &[]);
    write_rec(&mut bdev, &mut rec);

    // --- 记录 5：根目录 ---
    let mut rec = new_rec(MFT_REC_ROOT, ntfs_core::record::RECORD_FLAG_DIR);
    add_resident(
        &mut rec,
        ATTR_ROOT,
        I30_NAME,
        &empty_index_root(ATTR_NAME, NTFS_COLLATION_TYPE_FILENAME),
    );
    write_rec(&mut bdev, &mut rec);

    // --- 记录 6：$Bitmap ---
    let mut rec = new_rec(MFT_REC_BITMAP, 0);
    let mut vol_bmp_run = RunsTree::new();
    vol_bmp_run.add(0, LCN_VOL_BMP as CLST, 1);
    add_nonres(
        &mut rec,
        ATTR_DATA,
        &[],
        &vol_bmp_run,
        1,
        CLUSTER as u64,
        bitmap_size(TOTAL_CLUSTERS as usize) as u64,
    );
    write_rec(&mut bdev, &mut rec);

    // --- 记录 7：$Boot ---
    let mut rec = new_rec(MFT_REC_BOOT, 0);
    let mut boot_run = RunsTree::new();
    boot_run.add(0, 0, 1);
    add_nonres(&mut rec, ATTR_DATA, &[], &boot_run, 1, CLUSTER as u64, 512);
    write_rec(&mut bdev, &mut rec);

    // --- 记录 8：$BadClus ---
    let mut rec = new_rec(MFT_REC_BADCLUST, 0);
    add_resident(&mut rec, ATTR_DATA, &[], &[]);
    add_nonres_sparse(
        &mut rec,
        ATTR_DATA,
        &str_to_utf16("$Bad"),
        TOTAL_CLUSTERS,
        TOTAL_SECTORS * SECTOR as u64,
    );
    write_rec(&mut bdev, &mut rec);

    // --- 记录 9：$Secure ---
    let mut rec = new_rec(MFT_REC_SECURE, 0);
    add_resident(
        &mut rec,
        ATTR_ROOT,
        SII_NAME,
        &empty_index_root(0, NTFS_COLLATION_TYPE_UINT),
    );
    add_resident(
        &mut rec,
        ATTR_ROOT,
        SDH_NAME,
        &empty_index_root(0, NTFS_COLLATION_TYPE_SECURITY_HASH),
    );
    add_resident(&mut rec, ATTR_DATA, SDS_NAME, &[]);
    write_rec(&mut bdev, &mut rec);

    // --- 记录 10：$UpCase ---
    let mut rec = new_rec(MFT_REC_UPCASE, 0);
    let mut up_run = RunsTree::new();
    up_run.add(0, LCN_UPCASE as CLST, UPCASE_CLUSTERS);
    add_nonres(
        &mut rec,
        ATTR_DATA,
        &[],
        &up_run,
        UPCASE_CLUSTERS,
        (UPCASE_CLUSTERS * CLUSTER) as u64,
        (UPCASE_LEN * 2) as u64,
    );
    write_rec(&mut bdev, &mut rec);

    // --- 记录 11：$Extend ---
    let mut rec = new_rec(MFT_REC_EXTEND, ntfs_core::record::RECORD_FLAG_DIR);
    write_rec(&mut bdev, &mut rec);

    // --- 记录 12..23：保留 ---
    for rno in 12..MFT_REC_FREE {
        let mut rec = new_rec(rno, 0);
        write_rec(&mut bdev, &mut rec);
    }

    // $UpCase 表内容
    let up_bytes: Vec<u8> = generate_default_upcase()
        .iter()
        .flat_map(|c| c.to_le_bytes())
        .collect();
    bdev.write_bytes(LCN_UPCASE * CLUSTER as u64, &up_bytes, false)
        .unwrap();

    // MFT 位图：前 24 条在用
    let mut mft_bmp = [0u8; 8];
    for bit in 0..MFT_REC_FREE as usize {
        mft_bmp[bit / 8] |= 1 << (bit % 8);
    }
    bdev.write_bytes(LCN_MFT_BMP * CLUSTER as u64, &mft_bmp, false)
        .unwrap();

    // 卷位图：[0, FIRST_FREE_LCN) 在用
    let mut vol_bmp = vec![0u8; bitmap_size(TOTAL_CLUSTERS as usize)];
    for lcn in 0..FIRST_FREE_LCN as usize {
        vol_bmp[lcn / 8] |= 1 << (lcn % 8);
    }
    bdev.write_bytes(LCN_VOL_BMP * CLUSTER as u64, &vol_bmp, false)
        .unwrap();

    // $MftMirr：前 4 条记录的原样拷贝
    for (i, img) in [&img0, &img1, &img2, &img3].iter().enumerate() {
        bdev.write_bytes(LCN_MIRR * CLUSTER as u64 + (i as u64) * RECORD as u64, img, false)
            .unwrap();
    }

    bdev
}

/// 新建一个普通文件记录（$STD + $FILE_NAME + 空 $DATA）
pub fn make_file_record<D: BlockDevice, L: ntfs_core::DeviceLock>(
    fs: &mut ntfs_core::Ntfs<D, L>,
    parent: ntfs_core::MftRef,
    name: &str,
) -> (ntfs_core::MftRef, ntfs_core::types::FileName) {
    let mut rec = fs.new_record(false, 0).unwrap();
    let std = StdInfo::default().to_bytes(true);
    add_resident(&mut rec, ATTR_STD, &[], &std);

    let fname = ntfs_core::types::FileName {
        home: parent,
        name: str_to_utf16(name),
        name_type: FILE_NAME_POSIX,
        ..Default::default()
    };
    add_resident(&mut rec, ATTR_NAME, &[], &fname.to_bytes());
    add_resident(&mut rec, ATTR_DATA, &[], &[]);
    rec.set_hard_links(1);
    fs.write_record(&mut rec, false).unwrap();

    (rec.to_ref(), fname)
}
