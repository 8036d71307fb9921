//! $ATTRIBUTE_LIST 维护
//!
//! 对应 ntfs3 的 `attrlist.c`。基记录放不下全部属性时，每个
//! 属性（分片）在列表里登记一条 `(类型, 名字, svcn, MFT_REF,
//! id)`，列表按（类型、名字、svcn）有序。本模块只管内存中的
//! 列表缓冲，装载与回写由 inode 层完成。

use crate::consts::{quad_align, ATTR_STD, CLST};
use crate::error::{Error, ErrorKind, Result};
use crate::types::{get_u16, get_u32, get_u64, get_utf16, put_u16, put_u32, put_u64, put_utf16, MftRef};
use alloc::vec::Vec;

const ALE_TYPE: usize = 0x00;
const ALE_SIZE: usize = 0x04;
const ALE_NAME_LEN: usize = 0x06;
const ALE_NAME_OFF: usize = 0x07;
const ALE_VCN: usize = 0x08;
const ALE_REF: usize = 0x10;
const ALE_ID: usize = 0x18;
const ALE_NAME: usize = 0x1A;

/// 列表项视图
///
/// 对应 ntfs3 的 `struct ATTR_LIST_ENTRY`。
#[derive(Clone, Copy)]
pub struct AleView<'a> {
    buf: &'a [u8],
}

impl<'a> AleView<'a> {
    pub fn type_(&self) -> u32 {
        get_u32(self.buf, ALE_TYPE)
    }

    pub fn size(&self) -> usize {
        get_u16(self.buf, ALE_SIZE) as usize
    }

    pub fn name(&self) -> Vec<u16> {
        let off = self.buf[ALE_NAME_OFF] as usize;
        get_utf16(self.buf, off, self.buf[ALE_NAME_LEN] as usize)
    }

    pub fn vcn(&self) -> CLST {
        get_u64(self.buf, ALE_VCN) as CLST
    }

    pub fn ref_(&self) -> Result<MftRef> {
        MftRef::from_u64(get_u64(self.buf, ALE_REF))
    }

    pub fn id(&self) -> u16 {
        get_u16(self.buf, ALE_ID)
    }
}

/// 解码后的 $ATTRIBUTE_LIST
pub struct AttrList {
    buf: Vec<u8>,
    pub dirty: bool,
}

impl AttrList {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            dirty: false,
        }
    }

    /// 从属性负载装载并校验
    pub fn from_bytes(buf: Vec<u8>) -> Result<Self> {
        let list = Self { buf, dirty: false };
        // 走一遍确认所有项边界自洽
        let mut off = 0;
        while off < list.buf.len() {
            off = list.entry_end(off)?;
        }
        Ok(list)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn entry_end(&self, off: usize) -> Result<usize> {
        let bad = || Error::new(ErrorKind::Corrupted, "bad attr_list entry");
        if off + ALE_NAME > self.buf.len() {
            return Err(bad());
        }
        let size = get_u16(&self.buf, off + ALE_SIZE) as usize;
        let name_len = self.buf[off + ALE_NAME_LEN] as usize;
        if size < ALE_NAME + name_len * 2 || size % 8 != 0 || off + size > self.buf.len() {
            return Err(bad());
        }
        Ok(off + size)
    }

    /// 枚举：`prev` 传 None 取第一项，返回项偏移
    ///
    /// 对应 `al_enumerate()`。
    pub fn enumerate(&self, prev: Option<usize>) -> Option<usize> {
        let off = match prev {
            None => 0,
            Some(p) => p + get_u16(&self.buf, p + ALE_SIZE) as usize,
        };
        if off + ALE_NAME > self.buf.len() {
            return None;
        }
        Some(off)
    }

    pub fn entry(&self, off: usize) -> AleView<'_> {
        let size = get_u16(&self.buf, off + ALE_SIZE) as usize;
        AleView {
            buf: &self.buf[off..off + size],
        }
    }

    /// 按（类型、名字、vcn）查找
    ///
    /// `vcn` 给定时返回覆盖该 VCN 的分片：同名同类型项里
    /// `entry.vcn ≤ vcn` 的最后一项。对应 `al_find_ex()`。
    pub fn find_ex(&self, ty: u32, name: &[u16], vcn: Option<CLST>) -> Option<usize> {
        let mut found = None;
        let mut cur = None;
        while let Some(off) = self.enumerate(cur) {
            cur = Some(off);
            let e = self.entry(off);
            if e.type_() != ty || e.name() != name {
                if found.is_some() {
                    break;
                }
                continue;
            }
            match vcn {
                None => return Some(off),
                Some(v) => {
                    if e.vcn() <= v {
                        found = Some(off);
                    } else {
                        break;
                    }
                }
            }
        }
        found
    }

    /// 插入一条登记，保持（类型、名字、svcn）有序
    ///
    /// 对应 `al_add_le()`。
    pub fn add(
        &mut self,
        ty: u32,
        name: &[u16],
        svcn: CLST,
        id: u16,
        ref_: MftRef,
    ) -> Result<usize> {
        let name_len = name.len();
        let size = quad_align(ALE_NAME + name_len * 2);

        // 定插入点
        let mut ins = self.buf.len();
        let mut cur = None;
        while let Some(off) = self.enumerate(cur) {
            cur = Some(off);
            let e = self.entry(off);
            let order = e
                .type_()
                .cmp(&ty)
                .then_with(|| e.name().cmp(&name.to_vec()))
                .then_with(|| e.vcn().cmp(&svcn));
            if order == core::cmp::Ordering::Greater {
                ins = off;
                break;
            }
        }

        let mut entry = alloc::vec![0u8; size];
        put_u32(&mut entry, ALE_TYPE, ty);
        put_u16(&mut entry, ALE_SIZE, size as u16);
        entry[ALE_NAME_LEN] = name_len as u8;
        entry[ALE_NAME_OFF] = ALE_NAME as u8;
        put_u64(&mut entry, ALE_VCN, svcn as u64);
        put_u64(&mut entry, ALE_REF, ref_.to_u64());
        put_u16(&mut entry, ALE_ID, id);
        put_utf16(&mut entry, ALE_NAME, name);

        self.buf.splice(ins..ins, entry);
        self.dirty = true;
        Ok(ins)
    }

    /// 删除一项
    ///
    /// 对应 `al_remove_le()`。
    pub fn remove(&mut self, off: usize) {
        let size = get_u16(&self.buf, off + ALE_SIZE) as usize;
        self.buf.drain(off..off + size);
        self.dirty = true;
    }

    /// 按（类型、名字、vcn、ref）删除，找不到返回 false
    ///
    /// 对应 `al_delete_le()`。
    pub fn delete(&mut self, ty: u32, name: &[u16], vcn: CLST, ref_: Option<MftRef>) -> bool {
        let mut cur = None;
        while let Some(off) = self.enumerate(cur) {
            cur = Some(off);
            let e = self.entry(off);
            if e.type_() != ty || e.name() != name || e.vcn() != vcn {
                continue;
            }
            if let Some(r) = ref_ {
                match e.ref_() {
                    Ok(er) if er == r => {}
                    _ => continue,
                }
            }
            self.remove(off);
            return true;
        }
        false
    }

    /// 列表里除 $STANDARD_INFORMATION 外的项数
    pub fn count_nonstd(&self) -> usize {
        let mut n = 0;
        let mut cur = None;
        while let Some(off) = self.enumerate(cur) {
            cur = Some(off);
            if self.entry(off).type_() != ATTR_STD {
                n += 1;
            }
        }
        n
    }
}

impl Default for AttrList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{ATTR_DATA, ATTR_NAME};
    use crate::upcase::str_to_utf16;

    #[test]
    fn test_add_sorted_and_find() {
        let mut al = AttrList::new();
        let r = MftRef::new(30, 1);
        al.add(ATTR_DATA, &[], 100, 3, r).unwrap();
        al.add(ATTR_STD, &[], 0, 0, r).unwrap();
        al.add(ATTR_DATA, &[], 0, 2, r).unwrap();
        al.add(ATTR_NAME, &[], 0, 1, r).unwrap();

        // 枚举顺序：STD < NAME < DATA@0 < DATA@100
        let types: Vec<(u32, CLST)> = {
            let mut v = Vec::new();
            let mut cur = None;
            while let Some(off) = al.enumerate(cur) {
                cur = Some(off);
                let e = al.entry(off);
                v.push((e.type_(), e.vcn()));
            }
            v
        };
        assert_eq!(
            types,
            [(ATTR_STD, 0), (ATTR_NAME, 0), (ATTR_DATA, 0), (ATTR_DATA, 100)]
        );

        // vcn 定位分片
        let off = al.find_ex(ATTR_DATA, &[], Some(50)).unwrap();
        assert_eq!(al.entry(off).vcn(), 0);
        let off = al.find_ex(ATTR_DATA, &[], Some(100)).unwrap();
        assert_eq!(al.entry(off).vcn(), 100);
        let off = al.find_ex(ATTR_DATA, &[], None).unwrap();
        assert_eq!(al.entry(off).vcn(), 0);
        assert!(al.find_ex(0x90, &[], None).is_none());
    }

    #[test]
    fn test_named_entries() {
        let mut al = AttrList::new();
        let r = MftRef::new(30, 1);
        let name = str_to_utf16("$I30");
        al.add(0x90, &name, 0, 0, r).unwrap();
        al.add(0xA0, &name, 0, 1, r).unwrap();

        let off = al.find_ex(0x90, &name, None).unwrap();
        assert_eq!(al.entry(off).name(), name);
        assert!(al.find_ex(0x90, &[], None).is_none());
    }

    #[test]
    fn test_delete_and_round_trip() {
        let mut al = AttrList::new();
        let r1 = MftRef::new(30, 1);
        let r2 = MftRef::new(31, 1);
        al.add(ATTR_DATA, &[], 0, 2, r1).unwrap();
        al.add(ATTR_DATA, &[], 64, 5, r2).unwrap();

        // ref 不匹配时不删
        assert!(!al.delete(ATTR_DATA, &[], 64, Some(r1)));
        assert!(al.delete(ATTR_DATA, &[], 64, Some(r2)));
        assert!(al.find_ex(ATTR_DATA, &[], Some(64)).is_some()); // 回落到 vcn 0 分片

        // 序列化后再装载一致
        let bytes = al.bytes().to_vec();
        let back = AttrList::from_bytes(bytes).unwrap();
        assert_eq!(back.size(), al.size());
        let off = back.find_ex(ATTR_DATA, &[], None).unwrap();
        assert_eq!(back.entry(off).ref_().unwrap(), r1);
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(AttrList::from_bytes(alloc::vec![1, 2, 3]).is_err());
        let mut good = AttrList::new();
        good.add(ATTR_DATA, &[], 0, 0, MftRef::new(5, 1)).unwrap();
        let mut bytes = good.bytes().to_vec();
        // 把 size 改坏
        bytes[ALE_SIZE] = 0xFF;
        assert!(AttrList::from_bytes(bytes).is_err());
    }
}
