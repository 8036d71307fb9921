//! 集成测试：B+ 树索引引擎（$I30 目录）

mod common;

use common::*;
use ntfs_core::consts::*;
use ntfs_core::index::NtfsIndex;
use ntfs_core::inode::NtfsInode;
use ntfs_core::types::{DupInfo, FileAttr, FileName, MftRef};
use ntfs_core::upcase::str_to_utf16;
use ntfs_core::{ErrorKind, MountOptions, Ntfs};

fn mount() -> Ntfs<MemDevice> {
    Ntfs::mount(format_volume(), MountOptions::default()).unwrap()
}

fn open_root(fs: &mut Ntfs<MemDevice>) -> (NtfsInode, NtfsIndex) {
    let mut ni = NtfsInode::load(fs, MFT_REC_ROOT).unwrap();
    let idx = NtfsIndex::open(fs, &mut ni, I30_NAME).unwrap();
    (ni, idx)
}

fn name_key(parent: MftRef, name: &str) -> Vec<u8> {
    FileName {
        home: parent,
        name: str_to_utf16(name),
        name_type: FILE_NAME_POSIX,
        ..Default::default()
    }
    .to_bytes()
}

/// 决定性伪随机名字
fn rand_names(n: usize) -> Vec<String> {
    let mut state = 0x6C07_8965u32;
    let mut rnd = move || {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        state
    };
    (0..n)
        .map(|i| {
            let len = 3 + (rnd() % 40) as usize;
            let mut s = String::new();
            for _ in 0..len {
                let c = match rnd() % 38 {
                    0..=25 => (b'a' + (rnd() % 26) as u8) as char,
                    26..=35 => (b'0' + (rnd() % 10) as u8) as char,
                    36 => '_',
                    _ => char::from_u32(0x4E00 + rnd() % 0x100).unwrap(),
                };
                s.push(c);
            }
            format!("{s}-{i}")
        })
        .collect()
}

#[test]
fn test_insert_lookup_small() {
    let mut fs = mount();
    let (mut ni, mut idx) = open_root(&mut fs);
    let parent = MftRef::new(MFT_REC_ROOT, 0);

    for (i, name) in ["alpha", "beta", "Gamma", "delta"].iter().enumerate() {
        idx.insert_entry(&mut fs, &mut ni, 100 + i as u64, &name_key(parent, name))
            .unwrap();
    }
    // 大小写折叠命中
    let hit = idx
        .lookup(&mut fs, &mut ni, &name_key(parent, "GAMMA"))
        .unwrap()
        .expect("case-insensitive lookup");
    assert_eq!(hit.ref_, 102);

    // 重名拒绝
    let err = idx
        .insert_entry(&mut fs, &mut ni, 7, &name_key(parent, "ALPHA"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Exists);

    // 排序遍历
    let names: Vec<String> = idx
        .iter_sorted(&mut fs, &mut ni)
        .unwrap()
        .iter()
        .map(|e| {
            String::from_utf16(&ntfs_core::index::fname_of(&e.key)).unwrap()
        })
        .collect();
    assert_eq!(names, ["alpha", "beta", "delta", "Gamma"]);
    assert!(idx.verify(&mut fs, &mut ni).unwrap());
}

#[test]
fn test_directory_1024_files() {
    let mut fs = mount();
    let (mut ni, mut idx) = open_root(&mut fs);
    let parent = MftRef::new(MFT_REC_ROOT, 0);

    let names = rand_names(1024);
    for (i, name) in names.iter().enumerate() {
        let key = name_key(parent, name);
        idx.insert_entry(&mut fs, &mut ni, i as u64 + 64, &key).unwrap();
        // 刚插入的必须立刻可精确命中
        let hit = idx.lookup(&mut fs, &mut ni, &key).unwrap();
        assert_eq!(hit.expect("just inserted").ref_, i as u64 + 64, "{name}");
    }

    // 全量回查
    for (i, name) in names.iter().enumerate() {
        let hit = idx
            .lookup(&mut fs, &mut ni, &name_key(parent, name))
            .unwrap()
            .expect("must stay findable");
        assert_eq!(hit.ref_, i as u64 + 64);
    }

    // 键序、项数、位图与在用块一致
    let sorted = idx.iter_sorted(&mut fs, &mut ni).unwrap();
    assert_eq!(sorted.len(), 1024);
    assert!(idx.verify(&mut fs, &mut ni).unwrap());

    // 磁盘序遍历也要数齐
    let raw = idx.iter_raw(&mut fs, &mut ni).unwrap();
    assert_eq!(raw.len(), 1024);

    ni.write_inode(&mut fs, true).unwrap();
    println!(
        "✅ 1024 entries over {} index blocks",
        idx.used_blocks(&mut fs, &mut ni).unwrap().len()
    );
}

#[test]
fn test_find_stable_across_unrelated_insert() {
    let mut fs = mount();
    let (mut ni, mut idx) = open_root(&mut fs);
    let parent = MftRef::new(MFT_REC_ROOT, 0);

    for name in rand_names(300) {
        let key = name_key(parent, &name);
        idx.insert_entry(&mut fs, &mut ni, 1, &key).unwrap();
    }
    let probe = name_key(parent, "probe-entry");
    idx.insert_entry(&mut fs, &mut ni, 0x55AA, &probe).unwrap();

    let before = idx.lookup(&mut fs, &mut ni, &probe).unwrap().unwrap();
    // 无关插入（会触发分裂）不影响既有键的命中
    for name in ["zzz-1", "aaa-1", "mmm-1"] {
        idx.insert_entry(&mut fs, &mut ni, 2, &name_key(parent, name))
            .unwrap();
        let after = idx.lookup(&mut fs, &mut ni, &probe).unwrap().unwrap();
        assert_eq!(after.ref_, before.ref_);
    }
}

#[test]
fn test_random_insert_delete_invariants() {
    let mut fs = mount();
    let (mut ni, mut idx) = open_root(&mut fs);
    let parent = MftRef::new(MFT_REC_ROOT, 0);

    let names = rand_names(400);
    for (i, name) in names.iter().enumerate() {
        idx.insert_entry(&mut fs, &mut ni, i as u64, &name_key(parent, name))
            .unwrap();
    }

    // 隔一个删一个
    for name in names.iter().step_by(2) {
        idx.delete_entry(&mut fs, &mut ni, &name_key(parent, name))
            .unwrap();
    }
    assert!(idx.verify(&mut fs, &mut ni).unwrap());

    // 留下的还在，删掉的不在
    for (i, name) in names.iter().enumerate() {
        let hit = idx
            .lookup(&mut fs, &mut ni, &name_key(parent, name))
            .unwrap();
        if i % 2 == 0 {
            assert!(hit.is_none(), "{name} should be gone");
        } else {
            assert_eq!(hit.unwrap().ref_, i as u64);
        }
    }

    // 再删光
    for (i, name) in names.iter().enumerate() {
        if i % 2 == 1 {
            idx.delete_entry(&mut fs, &mut ni, &name_key(parent, name))
                .unwrap();
        }
    }
    assert!(idx.is_empty(&mut fs, &mut ni).unwrap());
    assert!(idx.verify(&mut fs, &mut ni).unwrap());

    // 删不存在的键
    let err = idx
        .delete_entry(&mut fs, &mut ni, &name_key(parent, "ghost"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    println!("✅ random insert/delete keeps invariants");
}

#[test]
fn test_update_dup() {
    let mut fs = mount();
    let (mut ni, mut idx) = open_root(&mut fs);
    let parent = MftRef::new(MFT_REC_ROOT, 0);

    let fname = FileName {
        home: parent,
        name: str_to_utf16("sized.bin"),
        name_type: FILE_NAME_POSIX,
        ..Default::default()
    };
    idx.insert_entry(&mut fs, &mut ni, 77, &fname.to_bytes())
        .unwrap();

    // 文件长大后刷新目录里的冗余字段
    let dup = DupInfo {
        data_size: 12345,
        alloc_size: 16384,
        fa: FileAttr::ARCHIVE,
        ..Default::default()
    };
    idx.update_dup(&mut fs, &mut ni, &fname, &dup).unwrap();

    let hit = idx
        .lookup(&mut fs, &mut ni, &fname.to_bytes())
        .unwrap()
        .unwrap();
    let back = FileName::from_bytes(&hit.key).unwrap();
    assert_eq!(back.dup.data_size, 12345);
    assert_eq!(back.dup.alloc_size, 16384);
    assert_eq!(back.dup.fa, FileAttr::ARCHIVE);
}

#[test]
fn test_persisted_tree_survives_remount() {
    let mut fs = mount();
    let parent = MftRef::new(MFT_REC_ROOT, 0);
    let names = rand_names(200);
    {
        let (mut ni, mut idx) = open_root(&mut fs);
        for (i, name) in names.iter().enumerate() {
            idx.insert_entry(&mut fs, &mut ni, i as u64, &name_key(parent, name))
                .unwrap();
        }
        ni.write_inode(&mut fs, true).unwrap();
    }
    fs.unmount().unwrap();

    let bdev = ntfs_core::BlockDev::new(fs.into_device());
    let mut fs = Ntfs::mount(bdev, MountOptions::default()).unwrap();
    let (mut ni, mut idx) = open_root(&mut fs);
    for (i, name) in names.iter().enumerate() {
        let hit = idx
            .lookup(&mut fs, &mut ni, &name_key(parent, name))
            .unwrap()
            .expect("entry must survive remount");
        assert_eq!(hit.ref_, i as u64);
    }
    assert!(idx.verify(&mut fs, &mut ni).unwrap());
    println!("✅ directory survives remount");
}
