//! 集成测试：记录 / 属性引擎与 inode 门面

mod common;

use common::*;
use ntfs_core::consts::*;
use ntfs_core::inode::NtfsInode;
use ntfs_core::run::RunsTree;
use ntfs_core::upcase::str_to_utf16;
use ntfs_core::{ErrorKind, MountOptions, Ntfs};

fn mount() -> Ntfs<MemDevice> {
    Ntfs::mount(format_volume(), MountOptions::default()).unwrap()
}

fn new_file(fs: &mut Ntfs<MemDevice>) -> NtfsInode {
    let root_ref = ntfs_core::MftRef::new(MFT_REC_ROOT, 0);
    let (r, _) = make_file_record(fs, root_ref, "testfile");
    NtfsInode::load(fs, r.rno).unwrap()
}

#[test]
fn test_insert_resident_until_overflow() {
    let mut fs = mount();
    let mut ni = new_file(&mut fs);

    // 基记录装满后必须自动建 $ATTRIBUTE_LIST 并继续成功
    for i in 0..8u32 {
        let name = str_to_utf16(&format!("s{i}"));
        let h = ni
            .insert_resident(&mut fs, 200, ATTR_LOGGED_UTILITY_STREAM, &name)
            .unwrap();
        let rec = ni.record_mut(h.rno).unwrap();
        rec.set_resident_data(h.off, &[i as u8; 200]).unwrap();
    }
    assert!(ni.attr_list.is_some(), "overflow must create an attr list");
    assert!(!ni.subrecords.is_empty());

    // 不变式：列表登记集合 == 子记录实际属性集合
    assert!(ni.verify_attr_list(&mut fs).unwrap());

    // 每个属性都能按名找回，内容完好
    for i in 0..8u32 {
        let name = str_to_utf16(&format!("s{i}"));
        let h = ni
            .find_attr(&mut fs, ATTR_LOGGED_UTILITY_STREAM, &name, None)
            .unwrap()
            .expect("attr must resolve through the list");
        assert_eq!(ni.attr_view(h).resident_data().unwrap(), &[i as u8; 200]);
    }

    // 落盘再装载，一切仍在
    ni.write_inode(&mut fs, true).unwrap();
    let mut again = NtfsInode::load(&mut fs, ni.rno()).unwrap();
    assert!(again.attr_list.is_some());
    assert!(again.verify_attr_list(&mut fs).unwrap());
    println!("✅ attr list overflow handled");
}

#[test]
fn test_remove_attr_frees_empty_subrecord() {
    let mut fs = mount();
    let mut ni = new_file(&mut fs);

    for i in 0..8u32 {
        let name = str_to_utf16(&format!("s{i}"));
        ni.insert_resident(&mut fs, 200, ATTR_LOGGED_UTILITY_STREAM, &name)
            .unwrap();
    }
    let subrecords_before = ni.subrecords.len();
    assert!(subrecords_before > 0);

    for i in 0..8u32 {
        let name = str_to_utf16(&format!("s{i}"));
        ni.remove_attr(&mut fs, ATTR_LOGGED_UTILITY_STREAM, &name)
            .unwrap();
    }
    // 清空后子记录归还
    assert!(ni.subrecords.len() < subrecords_before);
    assert!(ni.verify_attr_list(&mut fs).unwrap());
}

#[test]
fn test_resident_to_nonresident_and_back() {
    let mut fs = mount();
    let mut ni = new_file(&mut fs);
    let mut run = RunsTree::new();

    // 写一段认得出来的内容
    let payload: Vec<u8> = (0..256u32).map(|i| (i % 251) as u8).collect();
    ni.attr_set_size(&mut fs, ATTR_DATA, &[], &mut run, 256)
        .unwrap();
    ni.write_stream(&mut fs, ATTR_DATA, &[], &mut run, 0, &payload)
        .unwrap();

    // 压过记录预算 → 必然转非常驻
    let big = fs.max_bytes_per_attr as u64 * 3;
    ni.attr_set_size(&mut fs, ATTR_DATA, &[], &mut run, big)
        .unwrap();
    let h = ni.find_attr(&mut fs, ATTR_DATA, &[], None).unwrap().unwrap();
    let attr = ni.attr_view(h);
    assert!(attr.is_nonresident());
    assert_eq!(attr.data_size(), big);
    assert_eq!(attr.alloc_size() % CLUSTER as u64, 0);

    // 旧内容原样搬过去了，尾部读出为零
    let mut back = vec![0u8; 256];
    ni.read_stream(&mut fs, ATTR_DATA, &[], &mut run, 0, &mut back)
        .unwrap();
    assert_eq!(back, payload);
    let mut tail = vec![0xAAu8; 64];
    ni.read_stream(&mut fs, ATTR_DATA, &[], &mut run, big - 64, &mut tail)
        .unwrap();
    assert!(tail.iter().all(|&b| b == 0));

    // 缩回阈值之下 → 转回常驻，内容保留
    run.clear();
    ni.attr_set_size(&mut fs, ATTR_DATA, &[], &mut run, 100)
        .unwrap();
    let h = ni.find_attr(&mut fs, ATTR_DATA, &[], None).unwrap().unwrap();
    assert!(!ni.attr_view(h).is_nonresident());
    assert_eq!(ni.attr_view(h).resident_data().unwrap(), &payload[..100]);
    println!("✅ resident <-> nonresident conversions");
}

#[test]
fn test_truncate_frees_clusters() {
    let mut fs = mount();
    let mut ni = new_file(&mut fs);
    let mut run = RunsTree::new();

    let free_before = fs.used.bitmap.zeroes();
    ni.attr_set_size(&mut fs, ATTR_DATA, &[], &mut run, 64 * 1024)
        .unwrap();
    let after_grow = fs.used.bitmap.zeroes();
    assert_eq!(free_before - after_grow, 16); // 64K = 16 簇

    // 截到 4K：还回 15 簇（保持非常驻需要的名字/类型条件不满足回转）
    let named = str_to_utf16("blob");
    ni.insert_resident(&mut fs, 0, ATTR_DATA, &named).unwrap();
    let mut nrun = RunsTree::new();
    ni.attr_set_size(&mut fs, ATTR_DATA, &named, &mut nrun, 64 * 1024)
        .unwrap();
    ni.attr_set_size(&mut fs, ATTR_DATA, &named, &mut nrun, 4096)
        .unwrap();
    let h = ni
        .find_attr(&mut fs, ATTR_DATA, &named, None)
        .unwrap()
        .unwrap();
    assert!(ni.attr_view(h).is_nonresident());
    assert_eq!(ni.attr_view(h).data_size(), 4096);
    assert_eq!(nrun.max_vcn_end(), 1);
}

#[test]
fn test_sparse_hole_reads_zero() {
    let mut fs = mount();
    let mut ni = new_file(&mut fs);

    // 8 簇的洞
    let mut run = RunsTree::new();
    run.add(0, SPARSE_LCN, 8);
    let name = str_to_utf16("sparse");
    ni.insert_nonresident(
        &mut fs,
        ATTR_DATA,
        &name,
        &run,
        0,
        8,
        ntfs_core::record::ATTR_FLAG_SPARSED,
    )
    .unwrap();
    let h = ni
        .find_attr(&mut fs, ATTR_DATA, &name, None)
        .unwrap()
        .unwrap();
    let size = 8 * CLUSTER as u64;
    {
        let rec = ni.record_mut(h.rno).unwrap();
        rec.set_nres_sizes(h.off, size, size, size);
    }

    let mut buf = vec![0xFFu8; size as usize];
    let mut srun = RunsTree::new();
    ni.read_stream(&mut fs, ATTR_DATA, &name, &mut srun, 0, &mut buf)
        .unwrap();
    assert!(buf.iter().all(|&b| b == 0), "hole must read as zeros");
    println!("✅ sparse hole reads {} zero bytes", size);
}

#[test]
fn test_data_get_block_allocates_once() {
    let mut fs = mount();
    let mut ni = new_file(&mut fs);
    let mut run = RunsTree::new();

    // 先把流撑成非常驻的 4 簇
    ni.attr_set_size(&mut fs, ATTR_DATA, &[], &mut run, 4 * CLUSTER as u64)
        .unwrap();

    let (lcn, len, new) = ni
        .data_get_block(&mut fs, ATTR_DATA, &[], &mut run, 1, 2)
        .unwrap();
    assert!(!new, "grown stream is already backed");
    assert!(len >= 1);

    // 同一位置再问一次：拿到同样的映射
    let (lcn2, _, new2) = ni
        .data_get_block(&mut fs, ATTR_DATA, &[], &mut run, 1, 1)
        .unwrap();
    assert!(!new2);
    assert_eq!(lcn, lcn2);
}

#[test]
fn test_delete_all_returns_space() {
    let mut fs = mount();
    let mut ni = new_file(&mut fs);
    let mut run = RunsTree::new();

    let free0 = fs.used.bitmap.zeroes();
    let rno = ni.rno();
    ni.attr_set_size(&mut fs, ATTR_DATA, &[], &mut run, 128 * 1024)
        .unwrap();
    assert!(fs.used.bitmap.zeroes() < free0);

    ni.delete_all(&mut fs).unwrap();
    assert_eq!(fs.used.bitmap.zeroes(), free0);
    assert!(fs.mft.bitmap.is_free(&mut fs.bdev, rno as usize, 1).unwrap());
    // 记录读回：已不在用
    assert!(NtfsInode::load(&mut fs, rno).is_err());
}

#[test]
fn test_corrupted_subrecord_marks_volume() {
    let mut fs = mount();
    let mut ni = new_file(&mut fs);

    for i in 0..8u32 {
        let name = str_to_utf16(&format!("s{i}"));
        ni.insert_resident(&mut fs, 200, ATTR_LOGGED_UTILITY_STREAM, &name)
            .unwrap();
    }
    ni.write_inode(&mut fs, true).unwrap();
    let sub_rno = *ni.subrecords.keys().next().unwrap();

    // 把子记录的序列号改坏（绕过引擎直写）
    let lbo = 4 * CLUSTER as u64 + sub_rno as u64 * RECORD as u64 + 0x10;
    fs.bdev.write_bytes(lbo, &0xDEADu16.to_le_bytes(), false).unwrap();

    let mut again = NtfsInode::load(&mut fs, ni.rno()).unwrap();
    let name = str_to_utf16("s0");
    let err = again
        .find_attr(&mut fs, ATTR_LOGGED_UTILITY_STREAM, &name, None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corrupted);
    assert_eq!(fs.state, ntfs_core::NtfsState::Error);
    println!("✅ stale subrecord detected, volume marked");
}
