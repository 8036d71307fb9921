//! 集成测试：挂载、卷状态机、分配器

mod common;

use common::*;
use ntfs_core::consts::*;
use ntfs_core::{AllocateOpt, ErrorKind, MountOptions, Ntfs, NtfsState};

#[test]
fn test_mount_geometry() {
    let bdev = format_volume();
    let fs = Ntfs::mount(bdev, MountOptions::default()).expect("mount failed");

    assert_eq!(fs.cluster_size, CLUSTER);
    assert_eq!(fs.record_size, RECORD);
    assert_eq!(fs.sector_size, SECTOR);
    assert_eq!(fs.index_size, CLUSTER);
    assert_eq!(fs.state, NtfsState::Clean);
    assert_eq!(fs.volume.major_ver, 3);
    assert_eq!(fs.used.bitmap.nbits(), TOTAL_CLUSTERS as usize);
    assert_eq!(fs.mft.bitmap.nbits(), 32);
    // 标签
    let label: String = char::decode_utf16(fs.volume.label.iter().copied())
        .map(|c| c.unwrap())
        .collect();
    assert_eq!(label, "TESTVOL");
    println!("✅ mount ok: {} clusters", fs.used.bitmap.nbits());
}

#[test]
fn test_cluster_alloc_respects_zone() {
    let bdev = format_volume();
    let mut fs = Ntfs::mount(bdev, MountOptions::default()).unwrap();

    let zb = fs.used.bitmap.zone_bit();
    let ze = fs.used.bitmap.zone_end();
    assert!(ze > zb, "mount must establish an mft zone");

    // 普通分配避开 zone
    let (lcn, len) = fs.look_for_free_space(0, 16, AllocateOpt::Def).unwrap();
    assert_eq!(len, 16);
    assert!((lcn as usize) >= ze || (lcn as usize + 16) <= zb);

    // MFT 分配落进 zone
    let (mlcn, mlen) = fs.look_for_free_space(0, 4, AllocateOpt::Mft).unwrap();
    assert!(mlen >= 1);
    assert!((mlcn as usize) >= zb && (mlcn as usize) < ze);

    // 释放后可再次分配到同一位置
    fs.mark_as_free_ex(lcn, len, false).unwrap();
    let (lcn2, _) = fs.look_for_free_space(lcn, 16, AllocateOpt::Def).unwrap();
    assert_eq!(lcn2, lcn);
}

#[test]
fn test_no_space_after_zone_reclaim() {
    let bdev = format_volume();
    let mut fs = Ntfs::mount(bdev, MountOptions::default()).unwrap();

    // 吃光全部空闲簇（zone 回收后也没有），最后应报 no-space
    loop {
        match fs.look_for_free_space(0, 4096, AllocateOpt::Def) {
            Ok(_) => continue,
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::NoSpace);
                break;
            }
        }
    }
    assert_eq!(fs.used.bitmap.zeroes(), 0);
}

#[test]
fn test_discard_on_free() {
    let bdev = format_volume();
    let mut opts = MountOptions::default();
    opts.discard = true;
    let mut fs = Ntfs::mount(bdev, opts).unwrap();

    let (lcn, len) = fs.look_for_free_space(0, 8, AllocateOpt::Def).unwrap();
    fs.mark_as_free_ex(lcn, len, true).unwrap();
    assert!(
        !fs.bdev.device().discards.is_empty(),
        "trim must reach the device"
    );
}

#[test]
fn test_mft_record_alloc_and_free() {
    let bdev = format_volume();
    let mut fs = Ntfs::mount(bdev, MountOptions::default()).unwrap();

    let rec = fs.new_record(false, 0).unwrap();
    let rno = rec.rno;
    assert!(rno >= MFT_REC_FREE);
    assert!(fs
        .mft
        .bitmap
        .is_used(&mut fs.bdev, rno as usize, 1)
        .unwrap());

    // 读回并校验序列号配对
    let back = fs.read_record(rno).unwrap();
    assert!(back.is_in_use());
    assert!(back.is_ref(&rec.to_ref()));

    fs.mark_rec_free(rno).unwrap();
    assert!(fs
        .mft
        .bitmap
        .is_free(&mut fs.bdev, rno as usize, 1)
        .unwrap());
    println!("✅ record {rno} allocated and freed");
}

#[test]
fn test_mft_extends_when_exhausted() {
    let bdev = format_volume();
    let mut fs = Ntfs::mount(bdev, MountOptions::default()).unwrap();

    let before = fs.mft.bitmap.nbits();
    // 初始只有 8 个空槽（24..32），多要几个必然触发 $MFT 扩展
    let mut rnos = Vec::new();
    for _ in 0..12 {
        rnos.push(fs.new_record(false, 0).unwrap().rno);
    }
    assert!(fs.mft.bitmap.nbits() > before, "mft must have grown");

    // 扩展出来的记录都能读回
    for rno in rnos {
        assert!(fs.read_record(rno).unwrap().is_in_use());
    }
    // 记录 0 里的 $DATA 尺寸也长了
    let rec0 = fs.read_record(MFT_REC_MFT).unwrap();
    let off = rec0.find_attr(None, ATTR_DATA, &[], None).unwrap();
    assert_eq!(
        rec0.attr(off).data_size(),
        (fs.mft.bitmap.nbits() as u64) * RECORD as u64
    );
}

#[test]
fn test_reserved_pool() {
    let bdev = format_volume();
    let mut fs = Ntfs::mount(bdev, MountOptions::default()).unwrap();

    // 堵死常规路径：MFT 位图占满 + 卷上不再有空簇
    let nbits = fs.mft.bitmap.nbits();
    fs.mft.bitmap.set_used(&mut fs.bdev, 24, nbits - 24).unwrap();
    while fs.look_for_free_space(0, 1, AllocateOpt::Def).is_ok() {}

    // 普通调用者拿不到
    let err = fs.look_free_mft(false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoSpace);

    // 特权调用者从保留池拿
    let rno = fs.look_free_mft(true).unwrap();
    assert!(rno >= MFT_REC_FREE - 8 && rno < MFT_REC_FREE);

    // 归还回池
    fs.mark_rec_free(rno).unwrap();
    let again = fs.look_free_mft(true).unwrap();
    assert_eq!(again, rno);
}

#[test]
fn test_dirty_volume_blocks_writers_until_replay() {
    let bdev = format_volume();
    let mut fs = Ntfs::mount(bdev, MountOptions::default()).unwrap();

    // 弄脏并卸载（不清标志，模拟崩溃）
    fs.set_state(NtfsState::Dirty).unwrap();
    fs.bdev.flush().unwrap();
    let bdev = ntfs_core::BlockDev::new(fs.into_device());

    let mut fs = Ntfs::mount(bdev, MountOptions::default()).unwrap();
    assert!(fs.flags.contains(ntfs_core::NtfsFlags::NEED_REPLAY));
    assert_eq!(fs.state, NtfsState::Dirty);

    // 写路径全部挡住
    let err = fs.look_for_free_space(0, 1, AllocateOpt::Def).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReplayNeeded);
    let err = fs.look_free_mft(false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReplayNeeded);

    // 外部重放完成后放行
    fs.replay_done();
    assert!(fs.look_for_free_space(0, 1, AllocateOpt::Def).is_ok());
    println!("✅ replay gate works");
}

#[test]
fn test_clean_unmount_round_trip() {
    let bdev = format_volume();
    let mut fs = Ntfs::mount(bdev, MountOptions::default()).unwrap();

    // 变更把卷弄脏
    fs.mark_dirty_for_write().unwrap();
    assert_eq!(fs.state, NtfsState::Dirty);

    // 干净卸载恢复 clean
    fs.unmount().unwrap();
    let bdev = ntfs_core::BlockDev::new(fs.into_device());
    let fs = Ntfs::mount(bdev, MountOptions::default()).unwrap();
    assert_eq!(fs.state, NtfsState::Clean);
    assert!(!fs.flags.contains(ntfs_core::NtfsFlags::NEED_REPLAY));
}

#[test]
fn test_mftmirr_kept_in_sync() {
    let bdev = format_volume();
    let mut fs = Ntfs::mount(bdev, MountOptions::default()).unwrap();

    // 改 $Volume（记录 3，镜像覆盖范围内）并刷镜像
    fs.set_state(NtfsState::Dirty).unwrap();
    fs.update_mftmirr(true).unwrap();

    // 镜像与 MFT 前 4 条逐字节一致
    let mut main = vec![0u8; 4 * RECORD as usize];
    let mut mirr = vec![0u8; 4 * RECORD as usize];
    fs.bdev.read_bytes(4 * CLUSTER as u64, &mut main).unwrap();
    fs.bdev
        .read_bytes(12 * CLUSTER as u64, &mut mirr)
        .unwrap();
    assert_eq!(main, mirr);
    println!("✅ $MftMirr in sync");
}

#[test]
fn test_error_state_is_sticky() {
    let bdev = format_volume();
    let mut fs = Ntfs::mount(bdev, MountOptions::default()).unwrap();

    fs.set_state(NtfsState::Error).unwrap();
    assert_eq!(fs.state, NtfsState::Error);
    // 不带 force 时 error 粘滞
    fs.set_state(NtfsState::Clean).unwrap();
    assert_eq!(fs.state, NtfsState::Error);
}
