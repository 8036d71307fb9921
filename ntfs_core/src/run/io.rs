//! 经 runs 树寻址的字节 I/O
//!
//! 对应 ntfs3 的 `ntfs_read_run_nb()` / `ntfs_sb_write_run()`：
//! 把属性内的 VBO 翻译成卷上的 LBO 再走块层。稀疏段读出全零，
//! 写入稀疏段是调用者的错误（必须先分配）。

use super::RunsTree;
use crate::block::{BlockDev, BlockDevice, DeviceLock};
use crate::consts::CLST;
use crate::error::{Error, ErrorKind, Result};

impl RunsTree {
    /// VBO → (LBO, 连续字节数)；稀疏段返回 `None` 作为 LBO
    pub fn vbo_to_lbo(&self, cluster_bits: u8, vbo: u64) -> Result<(Option<u64>, u64)> {
        let vcn = (vbo >> cluster_bits) as CLST;
        let (lcn, clen, _) = self
            .lookup_entry(vcn)
            .ok_or_else(|| Error::new(ErrorKind::Corrupted, "vbo is not mapped"))?;

        let off = vbo & ((1u64 << cluster_bits) - 1);
        let avail = ((clen as u64) << cluster_bits) - off;

        if lcn == crate::consts::SPARSE_LCN {
            Ok((None, avail))
        } else {
            Ok((Some(((lcn as u64) << cluster_bits) + off), avail))
        }
    }

    /// 从属性内偏移 `vbo` 读 `buf.len()` 字节
    pub fn read_vbo<D: BlockDevice, L: DeviceLock>(
        &self,
        bdev: &mut BlockDev<D, L>,
        cluster_bits: u8,
        vbo: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let (lbo, avail) = self.vbo_to_lbo(cluster_bits, vbo + done as u64)?;
            let n = (buf.len() - done).min(avail as usize);
            match lbo {
                Some(lbo) => bdev.read_bytes(lbo, &mut buf[done..done + n])?,
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
        Ok(())
    }

    /// 向属性内偏移 `vbo` 写 `buf`
    pub fn write_vbo<D: BlockDevice, L: DeviceLock>(
        &self,
        bdev: &mut BlockDev<D, L>,
        cluster_bits: u8,
        vbo: u64,
        buf: &[u8],
        sync: bool,
    ) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let (lbo, avail) = self.vbo_to_lbo(cluster_bits, vbo + done as u64)?;
            let n = (buf.len() - done).min(avail as usize);
            let lbo = lbo.ok_or_else(|| {
                Error::new(ErrorKind::InvalidInput, "write into a sparse extent")
            })?;
            bdev.write_bytes(lbo, &buf[done..done + n], sync)?;
            done += n;
        }
        Ok(())
    }

    /// 把属性内 `[vbo, vbo+bytes)` 清零（跳过稀疏段）
    pub fn zero_vbo<D: BlockDevice, L: DeviceLock>(
        &self,
        bdev: &mut BlockDev<D, L>,
        cluster_bits: u8,
        vbo: u64,
        bytes: u64,
    ) -> Result<()> {
        let mut done = 0u64;
        while done < bytes {
            let (lbo, avail) = self.vbo_to_lbo(cluster_bits, vbo + done)?;
            let n = (bytes - done).min(avail);
            if let Some(lbo) = lbo {
                bdev.zero_bytes(lbo, n)?;
            }
            done += n;
        }
        Ok(())
    }
}
