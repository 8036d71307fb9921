//! EA 存储与 xattr 命名空间
//!
//! 对应 ntfs3 的 `xattr.c`。EA = 两个属性：常驻的
//! $EA_INFORMATION（总量头）和 $EA（EA_FULL 记录串，DWORD
//! 对齐）。总量上限 `MAX_EA_DATA_SIZE`。
//!
//! 边界上认识的命名空间：`system.dos_attrib`、
//! `system.ntfs_attrib`、`user.DOSATTRIB`、`system.ntfs_security`
//! 与 POSIX ACL 两项；其余名字原样进 EA 存储。

use crate::block::{BlockDevice, DeviceLock};
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::fs::Ntfs;
use crate::inode::{NiFlags, NtfsInode};
use crate::run::RunsTree;
use crate::types::{get_u16, get_u32, put_u16, put_u32};
use alloc::string::String;
use alloc::vec::Vec;

pub const SYSTEM_DOS_ATTRIB: &str = "system.dos_attrib";
pub const SYSTEM_NTFS_ATTRIB: &str = "system.ntfs_attrib";
pub const SYSTEM_NTFS_SECURITY: &str = "system.ntfs_security";
pub const USER_DOSATTRIB: &str = "user.DOSATTRIB";
pub const POSIX_ACL_ACCESS: &str = "system.posix_acl_access";
pub const POSIX_ACL_DEFAULT: &str = "system.posix_acl_default";

/// set_ea 的语义开关（XATTR_CREATE / XATTR_REPLACE）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EaSet {
    /// 存在则替换，不存在则创建
    Any,
    /// 已存在时失败
    Create,
    /// 不存在时失败；配合空值即删除
    Replace,
}

// EA_INFO 字段
const EI_SIZE_PACK: usize = 0x00;
const EI_COUNT: usize = 0x02;
const EI_SIZE: usize = 0x04;
pub const SIZEOF_EA_INFO: usize = 8;

// EA_FULL 字段
const EA_SIZE: usize = 0x00;
const EA_FLAGS: usize = 0x04;
const EA_NAME_LEN: usize = 0x05;
const EA_ELENGTH: usize = 0x06;
const EA_NAME: usize = 0x08;

/// 需要 EA 感知的应用才能打开（EA_INFO.count 统计它们）
pub const FILE_NEED_EA: u8 = 0x80;

fn unpacked_ea_size(buf: &[u8], off: usize) -> usize {
    let size = get_u32(buf, off + EA_SIZE) as usize;
    if size != 0 {
        size
    } else {
        dword_align(EA_NAME + 1 + buf[off + EA_NAME_LEN] as usize
            + get_u16(buf, off + EA_ELENGTH) as usize)
    }
}

fn packed_ea_size(buf: &[u8], off: usize) -> usize {
    EA_NAME + 1 - EA_FLAGS + buf[off + EA_NAME_LEN] as usize
        + get_u16(buf, off + EA_ELENGTH) as usize
}

/// 在 EA 串里找名字，返回偏移
fn find_ea(ea_all: &[u8], bytes: usize, name: &[u8]) -> Option<usize> {
    let mut off = 0;
    while off < bytes {
        let next = off + unpacked_ea_size(ea_all, off);
        if next > bytes {
            return None;
        }
        let nlen = ea_all[off + EA_NAME_LEN] as usize;
        if nlen == name.len() && &ea_all[off + EA_NAME..off + EA_NAME + nlen] == name {
            return Some(off);
        }
        if next <= off {
            return None;
        }
        off = next;
    }
    None
}

impl NtfsInode {
    /// 读出整个 EA 串与头
    ///
    /// 对应 `ntfs_read_ea()`。没有 EA 返回空。
    fn read_ea<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        add_bytes: usize,
    ) -> Result<Option<(Vec<u8>, [u8; SIZEOF_EA_INFO])>> {
        let Some(hi) = self.find_attr(fs, ATTR_EA_INFO, &[], None)? else {
            return Ok(None);
        };
        let Some(he) = self.find_attr(fs, ATTR_EA, &[], None)? else {
            return Ok(None);
        };

        let data = self.attr_view(hi).resident_data()?;
        if data.len() < SIZEOF_EA_INFO {
            return Err(Error::new(ErrorKind::Corrupted, "short ea info"));
        }
        let mut info = [0u8; SIZEOF_EA_INFO];
        info.copy_from_slice(&data[..SIZEOF_EA_INFO]);

        let size = get_u32(&info, EI_SIZE) as usize;
        if size as u64 > MAX_EA_DATA_SIZE as u64
            || (size + add_bytes) as u64 > MAX_EA_DATA_SIZE as u64
        {
            return Err(Error::new(ErrorKind::Corrupted, "ea size over limit"));
        }

        let mut buf = alloc::vec![0u8; size + add_bytes];
        let attr = self.attr_view(he);
        if attr.is_nonresident() {
            let mut run = RunsTree::new();
            attr.load_runs(&mut run)?;
            run.read_vbo(&mut fs.bdev, fs.cluster_bits, 0, &mut buf[..size])?;
        } else {
            buf[..size].copy_from_slice(&attr.resident_data()?[..size]);
        }
        Ok(Some((buf, info)))
    }

    /// 读一个 EA 的值
    ///
    /// 对应 `ntfs_get_ea()`。
    pub fn get_ea<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        name: &str,
    ) -> Result<Vec<u8>> {
        if name.len() > 255 {
            return Err(Error::from_kind(ErrorKind::NameTooLong));
        }
        let Some((ea_all, info)) = self.read_ea(fs, 0)? else {
            return Err(Error::from_kind(ErrorKind::NotFound));
        };
        let size = get_u32(&info, EI_SIZE) as usize;
        let off = find_ea(&ea_all, size, name.as_bytes())
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;

        let nlen = ea_all[off + EA_NAME_LEN] as usize;
        let vlen = get_u16(&ea_all, off + EA_ELENGTH) as usize;
        let vstart = off + EA_NAME + nlen + 1;
        Ok(ea_all[vstart..vstart + vlen].to_vec())
    }

    /// 枚举所有 EA 名字
    ///
    /// 对应 `ntfs_listxattr_hlp()`。
    pub fn list_ea<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
    ) -> Result<Vec<String>> {
        let Some((ea_all, info)) = self.read_ea(fs, 0)? else {
            return Ok(Vec::new());
        };
        let size = get_u32(&info, EI_SIZE) as usize;
        let mut names = Vec::new();
        let mut off = 0;
        while off < size {
            let nlen = ea_all[off + EA_NAME_LEN] as usize;
            let name = &ea_all[off + EA_NAME..off + EA_NAME + nlen];
            names.push(String::from_utf8_lossy(name).into_owned());
            let next = off + unpacked_ea_size(&ea_all, off);
            if next <= off {
                break;
            }
            off = next;
        }
        Ok(names)
    }

    /// 写 / 删一个 EA
    ///
    /// `Replace` + 空值即删除；串空后连 $EA_INFORMATION / $EA
    /// 一起摘掉。`size_pack` 变化时置 `UPDATE_PARENT`，父目录
    /// 的 dup 信息由上层刷新。对应 `ntfs_set_ea()`。
    pub fn set_ea<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        name: &str,
        value: &[u8],
        mode: EaSet,
    ) -> Result<()> {
        fs.assert_writable()?;
        fs.mark_dirty_for_write()?;

        let name_b = name.as_bytes();
        if name_b.len() > 255 {
            return Err(Error::from_kind(ErrorKind::NameTooLong));
        }
        let delete = mode == EaSet::Replace && value.is_empty();
        let add = dword_align(EA_NAME + 1 + name_b.len() + value.len());

        let had_info;
        let (mut ea_all, mut info) = match self.read_ea(fs, add)? {
            Some(x) => {
                had_info = true;
                x
            }
            None => {
                had_info = false;
                (alloc::vec![0u8; add], [0u8; SIZEOF_EA_INFO])
            }
        };
        let mut size = get_u32(&info, EI_SIZE) as usize;
        let old_pack = get_u16(&info, EI_SIZE_PACK);

        match find_ea(&ea_all, size, name_b) {
            Some(off) => {
                if mode == EaSet::Create {
                    return Err(Error::from_kind(ErrorKind::Exists));
                }
                // 摘掉现有项
                if ea_all[off + EA_FLAGS] & FILE_NEED_EA != 0 {
                    let c = get_u16(&info, EI_COUNT);
                    put_u16(&mut info, EI_COUNT, c.wrapping_sub(1));
                }
                let ea_sz = unpacked_ea_size(&ea_all, off);
                let pack = get_u16(&info, EI_SIZE_PACK);
                put_u16(
                    &mut info,
                    EI_SIZE_PACK,
                    pack.wrapping_sub(packed_ea_size(&ea_all, off) as u16),
                );
                ea_all.copy_within(off + ea_sz..size + add, off);
                size -= ea_sz;
            }
            None => {
                if mode == EaSet::Replace {
                    return Err(Error::from_kind(ErrorKind::NotFound));
                }
            }
        }

        if !delete {
            // 追加新项
            if (size + add) as u64 > MAX_EA_DATA_SIZE as u64 {
                return Err(Error::from_kind(ErrorKind::TooLarge));
            }
            let off = size;
            ea_all.resize(size + add, 0);
            ea_all[off..off + add].fill(0);
            put_u32(&mut ea_all, off + EA_SIZE, add as u32);
            ea_all[off + EA_FLAGS] = 0;
            ea_all[off + EA_NAME_LEN] = name_b.len() as u8;
            put_u16(&mut ea_all, off + EA_ELENGTH, value.len() as u16);
            ea_all[off + EA_NAME..off + EA_NAME + name_b.len()].copy_from_slice(name_b);
            ea_all[off + EA_NAME + name_b.len()] = 0;
            let vstart = off + EA_NAME + name_b.len() + 1;
            ea_all[vstart..vstart + value.len()].copy_from_slice(value);

            let pack = get_u16(&info, EI_SIZE_PACK);
            put_u16(
                &mut info,
                EI_SIZE_PACK,
                pack.wrapping_add(packed_ea_size(&ea_all, off) as u16),
            );
            size += add;
        }
        put_u32(&mut info, EI_SIZE, size as u32);

        // ---- 落盘 ----
        if size == 0 {
            if had_info {
                self.remove_attr(fs, ATTR_EA_INFO, &[])?;
                self.remove_attr(fs, ATTR_EA, &[])?;
                self.update_attr_list(fs)?;
            }
            self.ni_flags.remove(NiFlags::EA);
        } else {
            if !had_info {
                let h = self.insert_resident(fs, SIZEOF_EA_INFO, ATTR_EA_INFO, &[])?;
                let rec = self.record_mut(h.rno).unwrap();
                rec.set_resident_data(h.off, &[0u8; SIZEOF_EA_INFO])?;
                self.insert_resident(fs, 0, ATTR_EA, &[])?;
            }

            // $EA 撑到新尺寸再写负载
            let mut ea_run = RunsTree::new();
            self.attr_set_size(fs, ATTR_EA, &[], &mut ea_run, size as u64)?;

            let he = self
                .find_attr(fs, ATTR_EA, &[], None)?
                .ok_or_else(|| Error::new(ErrorKind::Corrupted, "ea attr vanished"))?;
            let attr = self.attr_view(he);
            if attr.is_nonresident() {
                let mut run = RunsTree::new();
                attr.load_runs(&mut run)?;
                run.write_vbo(&mut fs.bdev, fs.cluster_bits, 0, &ea_all[..size], false)?;
            } else {
                let rec = self.record_mut(he.rno).unwrap();
                rec.set_resident_data(he.off, &ea_all[..size])?;
            }

            let hi = self
                .find_attr(fs, ATTR_EA_INFO, &[], None)?
                .ok_or_else(|| Error::new(ErrorKind::Corrupted, "ea info vanished"))?;
            let rec = self.record_mut(hi.rno).unwrap();
            rec.set_resident_data(hi.off, &info)?;
            self.ni_flags.insert(NiFlags::EA);
        }

        if get_u16(&info, EI_SIZE_PACK) != old_pack {
            self.ni_flags.insert(NiFlags::UPDATE_PARENT);
        }
        Ok(())
    }

    // ===== 命名空间边界 =====

    /// 按名字读 xattr，分发到各命名空间
    pub fn getxattr<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        name: &str,
    ) -> Result<Vec<u8>> {
        match name {
            SYSTEM_DOS_ATTRIB => Ok(alloc::vec![self.std.fa.bits() as u8]),
            SYSTEM_NTFS_ATTRIB => Ok(self.std.fa.bits().to_le_bytes().to_vec()),
            USER_DOSATTRIB => {
                // "0x%x" + NUL，与参考驱动的字符串形态一致
                let mut s = alloc::format!("0x{:x}", self.std.fa.bits()).into_bytes();
                s.push(0);
                Ok(s)
            }
            _ => self.get_ea(fs, name),
        }
    }

    /// 按名字写 xattr
    ///
    /// `system.ntfs_security` 需要 $Secure 上下文，走
    /// [`crate::security::NtfsSecurity`]；这里处理其余空间。
    pub fn setxattr<D: BlockDevice, L: DeviceLock>(
        &mut self,
        fs: &mut Ntfs<D, L>,
        name: &str,
        value: &[u8],
        mode: EaSet,
    ) -> Result<()> {
        match name {
            SYSTEM_DOS_ATTRIB => {
                if value.len() != 1 {
                    return Err(Error::new(ErrorKind::InvalidInput, "dos_attrib takes 1 byte"));
                }
                let keep = self.std.fa.bits() & !0xFF;
                self.std.fa =
                    crate::types::FileAttr::from_bits_retain(keep | value[0] as u32);
                self.std_dirty = true;
                Ok(())
            }
            SYSTEM_NTFS_ATTRIB => {
                if value.len() != 4 {
                    return Err(Error::new(ErrorKind::InvalidInput, "ntfs_attrib takes 4 bytes"));
                }
                let v = u32::from_le_bytes([value[0], value[1], value[2], value[3]]);
                self.std.fa = crate::types::FileAttr::from_bits_retain(v);
                self.std_dirty = true;
                Ok(())
            }
            _ => self.set_ea(fs, name, value, mode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_ea_walks_entries() {
        // 两个手工拼的 EA 项
        let mut buf = alloc::vec![0u8; 64];
        let e1 = dword_align(EA_NAME + 1 + 3 + 2); // "abc" -> 2 字节
        put_u32(&mut buf, EA_SIZE, e1 as u32);
        buf[EA_NAME_LEN] = 3;
        put_u16(&mut buf, EA_ELENGTH, 2);
        buf[EA_NAME..EA_NAME + 3].copy_from_slice(b"abc");

        let o2 = e1;
        let e2 = dword_align(EA_NAME + 1 + 2 + 1);
        put_u32(&mut buf, o2 + EA_SIZE, e2 as u32);
        buf[o2 + EA_NAME_LEN] = 2;
        put_u16(&mut buf, o2 + EA_ELENGTH, 1);
        buf[o2 + EA_NAME..o2 + EA_NAME + 2].copy_from_slice(b"xy");

        let total = e1 + e2;
        assert_eq!(find_ea(&buf, total, b"abc"), Some(0));
        assert_eq!(find_ea(&buf, total, b"xy"), Some(o2));
        assert_eq!(find_ea(&buf, total, b"zz"), None);
    }

    #[test]
    fn test_packed_unpacked_sizes() {
        let mut buf = alloc::vec![0u8; 32];
        buf[EA_NAME_LEN] = 4;
        put_u16(&mut buf, EA_ELENGTH, 6);
        // size 字段为 0 时按字段算
        assert_eq!(unpacked_ea_size(&buf, 0), dword_align(8 + 1 + 4 + 6));
        assert_eq!(packed_ea_size(&buf, 0), 5 + 4 + 6);
    }
}
