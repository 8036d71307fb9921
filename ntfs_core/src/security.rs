//! $Secure：共享安全描述符存储
//!
//! 对应 ntfs3 `fsntfs.c` 的 `ntfs_security_init()` /
//! `ntfs_insert_security()` / `ntfs_get_security_by_id()`。
//! $Secure 的 $SDS 数据流存放描述符本体；$SII（security_id →
//! 位置）和 $SDH（hash+id → 位置）两棵索引指向它。相同描述符
//! 经 $SDH 去重，同一个 security_id 可以被任意多文件的
//! $STANDARD_INFORMATION 引用。
//!
//! 共享索引有独立锁类（见 fs 模块的锁序说明）。

use crate::block::{BlockDevice, DeviceLock};
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::fs::Ntfs;
use crate::index::NtfsIndex;
use crate::inode::NtfsInode;
use crate::run::RunsTree;
use crate::types::{get_u32, get_u64, put_u32, put_u64};
use alloc::vec::Vec;
use log::debug;

/// SECURITY_HDR：$SDS 里每条描述符的头，也是两棵索引的负载
///
/// 布局：hash u32, id u32, off u64, size u32（20 字节）。
pub const SIZEOF_SECURITY_HDR: usize = 20;

/// 缺省安全描述符（Everyone 完全控制），格式化和测试用
pub const DEFAULT_SECURITY: &[u8] = &[
    0x01, 0x00, 0x04, 0x80, 0x30, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x14, 0x00, 0x00, 0x00, 0x02, 0x00, 0x1C, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x14, 0x00, 0xFF, 0x01, 0x1F, 0x00, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00,
    0x00, 0x00, 0x00, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x12, 0x00, 0x00, 0x00,
    0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x12, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00,
];

/// 打开的 $Secure 状态
///
/// 对应 `ntfs_sb_info.security`。
pub struct NtfsSecurity {
    pub ni: NtfsInode,
    pub index_sii: NtfsIndex,
    pub index_sdh: NtfsIndex,
    pub next_id: u32,
    pub next_off: u64,
    pub def_security_id: u32,
    sds_run: RunsTree,
    sds_size: u64,
}

/// 描述符散列
///
/// 对应 `security_hash()`：逐 32 位字 ROL3 累加。
pub fn security_hash(sd: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    let mut chunks = sd.chunks_exact(4);
    for c in &mut chunks {
        let v = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
        hash = hash.rotate_left(3).wrapping_add(v);
    }
    let rem = chunks.remainder();
    if !rem.is_empty() {
        let mut last = [0u8; 4];
        last[..rem.len()].copy_from_slice(rem);
        hash = hash
            .rotate_left(3)
            .wrapping_add(u32::from_le_bytes(last));
    }
    hash
}

fn pack_hdr(hash: u32, id: u32, off: u64, size: u32) -> [u8; SIZEOF_SECURITY_HDR] {
    let mut h = [0u8; SIZEOF_SECURITY_HDR];
    put_u32(&mut h, 0, hash);
    put_u32(&mut h, 4, id);
    put_u64(&mut h, 8, off);
    put_u32(&mut h, 16, size);
    h
}

impl NtfsSecurity {
    /// 装载 $Secure（记录 9）：两棵索引 + $SDS 流
    ///
    /// 对应 `ntfs_security_init()`。
    pub fn init<D: BlockDevice, L: DeviceLock>(fs: &mut Ntfs<D, L>) -> Result<Self> {
        let mut ni = NtfsInode::load(fs, MFT_REC_SECURE)?;
        let index_sii = NtfsIndex::open(fs, &mut ni, SII_NAME)?;
        let index_sdh = NtfsIndex::open(fs, &mut ni, SDH_NAME)?;

        let mut sds_run = RunsTree::new();
        let sds_name: Vec<u16> = SDS_NAME.to_vec();
        ni.load_all_runs(fs, ATTR_DATA, &sds_name, &mut sds_run)?;
        let sds_size = match ni.find_attr(fs, ATTR_DATA, &sds_name, None)? {
            Some(h) => ni.attr_view(h).data_size(),
            None => 0,
        };

        // next_id = 现存最大 id + 1
        let mut next_id = SECURITY_ID_FIRST;
        for e in index_sii.iter_sorted(fs, &mut ni)? {
            if e.key.len() >= 4 {
                next_id = next_id.max(get_u32(&e.key, 0) + 1);
            }
        }
        let next_off = (sds_size + SECURITY_ALIGN - 1) & !(SECURITY_ALIGN - 1);

        debug!("ntfs: $Secure loaded, next_id={next_id}, sds={sds_size} bytes");
        Ok(Self {
            ni,
            index_sii,
            index_sdh,
            next_id,
            next_off,
            def_security_id: SECURITY_ID_INVALID,
            sds_run,
            sds_size,
        })
    }

    /// 按 security_id 取描述符
    ///
    /// 对应 `ntfs_get_security_by_id()`。
    pub fn get_security_by_id<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        security_id: u32,
    ) -> Result<Vec<u8>> {
        let key = security_id.to_le_bytes();
        let e = self
            .index_sii
            .lookup(fs, &mut self.ni, &key)?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;
        if e.data.len() < SIZEOF_SECURITY_HDR {
            return Err(Error::new(ErrorKind::Corrupted, "short $SII payload"));
        }
        let off = get_u64(&e.data, 8);
        let size = get_u32(&e.data, 16) as usize;
        if size < SIZEOF_SECURITY_HDR || off + size as u64 > self.sds_size {
            return Err(Error::new(ErrorKind::Corrupted, "$SII points outside $SDS"));
        }

        let mut sd = alloc::vec![0u8; size - SIZEOF_SECURITY_HDR];
        let sds_name: Vec<u16> = SDS_NAME.to_vec();
        let mut run = core::mem::take(&mut self.sds_run);
        let res = self.ni.read_stream(
            fs,
            ATTR_DATA,
            &sds_name,
            &mut run,
            off + SIZEOF_SECURITY_HDR as u64,
            &mut sd,
        );
        self.sds_run = run;
        res?;
        Ok(sd)
    }

    /// 插入（或去重命中）一个描述符，返回 `(security_id, 是否新建)`
    ///
    /// 返回的 id 盖进文件的 `$STANDARD_INFORMATION.security_id`。
    /// 对应 `ntfs_insert_security()`。
    pub fn insert_security<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        sd: &[u8],
    ) -> Result<(u32, bool)> {
        if sd.is_empty() || sd.len() as u64 > self.sds_run_capacity_limit() {
            return Err(Error::from_kind(ErrorKind::TooLarge));
        }
        fs.assert_writable()?;

        let hash = security_hash(sd);

        // $SDH 去重：同 hash 的候选逐个比对字节
        for e in self.index_sdh.iter_sorted(fs, &mut self.ni)? {
            if e.key.len() < 8 || get_u32(&e.key, 0) != hash {
                continue;
            }
            if e.data.len() < SIZEOF_SECURITY_HDR {
                continue;
            }
            let off = get_u64(&e.data, 8);
            let size = get_u32(&e.data, 16) as usize;
            if size != sd.len() + SIZEOF_SECURITY_HDR || off + size as u64 > self.sds_size {
                continue;
            }
            let mut existing = alloc::vec![0u8; sd.len()];
            let sds_name: Vec<u16> = SDS_NAME.to_vec();
            let mut run = core::mem::take(&mut self.sds_run);
            let res = self.ni.read_stream(
                fs,
                ATTR_DATA,
                &sds_name,
                &mut run,
                off + SIZEOF_SECURITY_HDR as u64,
                &mut existing,
            );
            self.sds_run = run;
            res?;
            if existing == sd {
                return Ok((get_u32(&e.key, 4), false));
            }
        }

        fs.mark_dirty_for_write()?;

        // 追加到 $SDS
        let id = self.next_id;
        let off = self.next_off;
        let entry_size = (SIZEOF_SECURITY_HDR + sd.len()) as u32;
        let new_end = off + ((entry_size as u64 + SECURITY_ALIGN - 1) & !(SECURITY_ALIGN - 1));

        let sds_name: Vec<u16> = SDS_NAME.to_vec();
        let mut run = core::mem::take(&mut self.sds_run);
        let res = self
            .ni
            .attr_set_size(fs, ATTR_DATA, &sds_name, &mut run, new_end);
        self.sds_run = run;
        res?;
        self.sds_size = new_end;

        let hdr = pack_hdr(hash, id, off, entry_size);
        let mut entry = alloc::vec![0u8; entry_size as usize];
        entry[..SIZEOF_SECURITY_HDR].copy_from_slice(&hdr);
        entry[SIZEOF_SECURITY_HDR..].copy_from_slice(sd);
        let mut run = core::mem::take(&mut self.sds_run);
        let res = self
            .ni
            .write_stream(fs, ATTR_DATA, &sds_name, &mut run, off, &entry);
        self.sds_run = run;
        res?;

        // 双索引登记
        let sii_key = id.to_le_bytes();
        self.index_sii
            .insert_view(fs, &mut self.ni, &sii_key, &hdr)?;
        let mut sdh_key = [0u8; 8];
        sdh_key[..4].copy_from_slice(&hash.to_le_bytes());
        sdh_key[4..].copy_from_slice(&id.to_le_bytes());
        self.index_sdh
            .insert_view(fs, &mut self.ni, &sdh_key, &hdr)?;

        self.next_id = id + 1;
        self.next_off = new_end;
        self.ni.write_inode(fs, false)?;
        Ok((id, true))
    }

    /// 确保缺省描述符已入库
    pub fn default_security_id<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
    ) -> Result<u32> {
        if self.def_security_id != SECURITY_ID_INVALID {
            return Ok(self.def_security_id);
        }
        let (id, _) = self.insert_security(fs, DEFAULT_SECURITY)?;
        self.def_security_id = id;
        Ok(id)
    }

    fn sds_run_capacity_limit(&self) -> u64 {
        // 单条描述符的合理上限（64K 足够任何 ACL）
        0x10000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_stable_and_sensitive() {
        let h1 = security_hash(DEFAULT_SECURITY);
        let h2 = security_hash(DEFAULT_SECURITY);
        assert_eq!(h1, h2);

        let mut tweaked = DEFAULT_SECURITY.to_vec();
        tweaked[8] ^= 1;
        assert_ne!(security_hash(&tweaked), h1);
    }

    #[test]
    fn test_hash_rol3() {
        // 两个字：h = rol3(rol3(0)+1)+2 = rol3(1)+2 = 8+2
        let bytes = [1u8, 0, 0, 0, 2, 0, 0, 0];
        assert_eq!(security_hash(&bytes), 10);
    }

    #[test]
    fn test_pack_hdr_layout() {
        let h = pack_hdr(0xAABB, 0x105, 0x4000, 96);
        assert_eq!(get_u32(&h, 0), 0xAABB);
        assert_eq!(get_u32(&h, 4), 0x105);
        assert_eq!(get_u64(&h, 8), 0x4000);
        assert_eq!(get_u32(&h, 16), 96);
    }
}
