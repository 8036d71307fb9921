//! runs 的 NTFS 变长编码
//!
//! 对应 ntfs3 的 `run_pack()` / `run_unpack()`。每段的首字节：
//! 低 nibble = 长度字段的字节数，高 nibble = LCN 增量字段的
//! 字节数（0 表示稀疏段，无增量字段）；随后是小端长度和小端
//! 有符号增量（相对上一段实簇的 LCN）。0x00 结束。

use super::RunsTree;
use crate::consts::{CLST, SPARSE_LCN};
use crate::error::{Error, ErrorKind, Result};

/// 有符号值的最小编码字节数
fn size_of_i64(v: i64) -> usize {
    let mut n = 1;
    while n < 8 {
        let shifted = (v << (64 - n * 8)) >> (64 - n * 8);
        if shifted == v {
            break;
        }
        n += 1;
    }
    n
}

/// 读取 `n` 字节小端有符号值
fn read_i64(buf: &[u8], n: usize) -> i64 {
    let mut v: i64 = 0;
    for (i, &b) in buf[..n].iter().enumerate() {
        v |= (b as i64) << (i * 8);
    }
    // 符号扩展
    if n < 8 {
        v = (v << (64 - n * 8)) >> (64 - n * 8);
    }
    v
}

impl RunsTree {
    /// 把从 `svcn` 起 `len` 个 VCN 的映射编码进 `buf`
    ///
    /// 返回 `(写入字节数, 实际编码的 VCN 数)`。缓冲区装不下时
    /// 合法地部分编码；调用者据此决定是否另起一个更高 `svcn`
    /// 的属性分片。写入的内容总是以 0x00 终结。
    pub fn pack(&self, svcn: CLST, len: CLST, buf: &mut [u8]) -> Result<(usize, CLST)> {
        if buf.is_empty() {
            return Err(Error::new(ErrorKind::InvalidInput, "empty run buffer"));
        }

        let evcn1 = svcn as u64 + len as u64;
        let (_, _, mut idx) = self
            .lookup_entry(svcn)
            .ok_or_else(|| Error::new(ErrorKind::Corrupted, "svcn is not mapped"))?;

        let mut out = 0usize;
        let mut packed: CLST = 0;
        let mut prev_lcn: i64 = 0;
        let mut next_vcn = svcn;

        while let Some(r) = self.get_entry(idx) {
            if (r.vcn as u64) >= evcn1 || r.vcn > next_vcn {
                break;
            }

            // 首段可能要从中间截起
            let head = next_vcn - r.vcn;
            let seg_len = ((r.len - head) as u64).min(evcn1 - next_vcn as u64) as i64;

            let (lcn_bytes, delta) = if r.is_sparse() {
                (0usize, 0i64)
            } else {
                let lcn = (r.lcn + head) as i64;
                let d = lcn - prev_lcn;
                (size_of_i64(d), d)
            };
            let len_bytes = size_of_i64(seg_len);

            // +1 给终结符留位
            if out + 1 + len_bytes + lcn_bytes + 1 > buf.len() {
                break;
            }

            buf[out] = (len_bytes | (lcn_bytes << 4)) as u8;
            out += 1;
            buf[out..out + len_bytes].copy_from_slice(&seg_len.to_le_bytes()[..len_bytes]);
            out += len_bytes;
            if lcn_bytes != 0 {
                buf[out..out + lcn_bytes].copy_from_slice(&delta.to_le_bytes()[..lcn_bytes]);
                out += lcn_bytes;
                prev_lcn += delta;
            }

            packed += seg_len as CLST;
            next_vcn += seg_len as CLST;
            if next_vcn as u64 >= evcn1 {
                break;
            }
            idx += 1;
        }

        buf[out] = 0;
        out += 1;
        Ok((out, packed))
    }

    /// 把编码解进树，覆盖 `[svcn, evcn]`
    ///
    /// 解出的映射越过 `evcn + 1`、与既有映射冲突、或编码本身
    /// 畸形时失败；成功后 `[svcn, evcn]` 必然全部有映射。
    /// 对应 `run_unpack()`。
    pub fn unpack(&mut self, buf: &[u8], svcn: CLST, evcn: CLST) -> Result<()> {
        // 先整体解一遍，全部校验过了再落到树里
        let decoded = decode_all(buf, svcn, evcn)?;

        // decode_all 保证不越过 evcn + 1 且段间无缝，这里只需
        // 确认没有提前结束
        if decoded.last().map(|&(v, _, l)| v as u64 + l as u64) < Some(evcn as u64 + 1) {
            return Err(Error::new(ErrorKind::Corrupted, "run stream ends early"));
        }

        for &(vcn, lcn, len) in &decoded {
            if self.mapping_conflicts(vcn, lcn, len) {
                return Err(Error::new(
                    ErrorKind::Corrupted,
                    "run conflicts with existing mapping",
                ));
            }
        }
        for &(vcn, lcn, len) in &decoded {
            self.add(vcn, lcn, len);
        }
        Ok(())
    }
}

/// 解码整条流，返回 `(vcn, lcn, len)` 列表
fn decode_all(buf: &[u8], svcn: CLST, evcn: CLST) -> Result<alloc::vec::Vec<(CLST, CLST, CLST)>> {
    let bad = || Error::new(ErrorKind::Corrupted, "malformed run stream");

    let mut out = alloc::vec::Vec::new();
    let mut off = 0usize;
    let mut vcn = svcn as u64;
    let mut prev_lcn: i64 = 0;
    let evcn1 = evcn as u64 + 1;

    loop {
        let hdr = *buf.get(off).ok_or_else(bad)? as usize;
        if hdr == 0 {
            break;
        }
        off += 1;

        let len_bytes = hdr & 0x0F;
        let lcn_bytes = hdr >> 4;
        if len_bytes == 0 || len_bytes > 8 || lcn_bytes > 8 {
            return Err(bad());
        }
        if off + len_bytes + lcn_bytes > buf.len() {
            return Err(bad());
        }

        let len = read_i64(&buf[off..], len_bytes);
        off += len_bytes;
        if len <= 0 || len > CLST::MAX as i64 {
            return Err(bad());
        }

        let lcn = if lcn_bytes == 0 {
            SPARSE_LCN
        } else {
            let delta = read_i64(&buf[off..], lcn_bytes);
            off += lcn_bytes;
            prev_lcn += delta;
            if prev_lcn < 0 || prev_lcn >= SPARSE_LCN as i64 {
                return Err(bad());
            }
            prev_lcn as CLST
        };

        if vcn + len as u64 > evcn1 {
            return Err(Error::new(ErrorKind::Corrupted, "run extends past evcn"));
        }
        out.push((vcn as CLST, lcn, len as CLST));
        vcn += len as u64;
    }

    Ok(out)
}

/// 不建树，直接扫描编码求最高 VCN
///
/// 对应 `run_get_highest_vcn()`，加载高度碎片化的
/// $ATTRIBUTE_LIST 分片时用。
pub fn run_get_highest_vcn(vcn: CLST, buf: &[u8]) -> Result<u64> {
    let bad = || Error::new(ErrorKind::Corrupted, "malformed run stream");

    let mut off = 0usize;
    let mut total: u64 = 0;

    loop {
        let hdr = *buf.get(off).ok_or_else(bad)? as usize;
        if hdr == 0 {
            break;
        }
        let len_bytes = hdr & 0x0F;
        let lcn_bytes = hdr >> 4;
        if len_bytes == 0 || len_bytes > 8 || lcn_bytes > 8 {
            return Err(bad());
        }
        if off + 1 + len_bytes + lcn_bytes > buf.len() {
            return Err(bad());
        }
        let len = read_i64(&buf[off + 1..], len_bytes);
        if len <= 0 {
            return Err(bad());
        }
        total += len as u64;
        off += 1 + len_bytes + lcn_bytes;
    }

    Ok(vcn as u64 + total - 1)
}
