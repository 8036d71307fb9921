//! 错误类型定义

use core::fmt;

/// NTFS 操作错误的分类
///
/// 与 POSIX errno 大致对应，但 `NoRoom` 是 NTFS 特有的：
/// 表示"MFT 记录内放不下"，由上层通过创建 `$ATTRIBUTE_LIST`
/// 或分裂属性来恢复，不会浮出到最终调用者。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 属性 / 索引项 / inode 不存在
    NotFound,
    /// 创建冲突（目标已存在）
    Exists,
    /// 簇或 MFT 记录分配失败
    NoSpace,
    /// MFT 记录内空间不足（内部恢复，见 `ni_create_attr_list`）
    NoRoom,
    /// 卷上的结构损坏（fixup、签名、属性越界、序列号不符）
    Corrupted,
    /// 底层块设备 I/O 错误
    Io,
    /// 超出大小限制（EA 总量、maxbytes 等）
    TooLarge,
    /// 名字超过 255 个 UTF-16 单元
    NameTooLong,
    /// 删除非空目录
    NotEmpty,
    /// 卷不支持该功能（加密流、64 位簇号等）
    Unsupported,
    /// 卷需要先重放 $LogFile 才允许写
    ReplayNeeded,
    /// 调用参数非法
    InvalidInput,
}

/// NTFS 错误类型
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<&'static str>,
}

impl Error {
    /// 创建带说明的错误
    pub fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self {
            kind,
            message: Some(message),
        }
    }

    /// 创建不带说明的错误
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    /// 错误分类
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// 附加说明
    pub fn message(&self) -> Option<&'static str> {
        self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message {
            Some(msg) => write!(f, "ntfs error {:?}: {}", self.kind, msg),
            None => write!(f, "ntfs error {:?}", self.kind),
        }
    }
}

/// NTFS Result 类型
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::new(ErrorKind::NoRoom, "record full");
        assert_eq!(e.kind(), ErrorKind::NoRoom);
        assert!(e.message().is_some());

        let e = Error::from_kind(ErrorKind::NoSpace);
        assert_eq!(e.kind(), ErrorKind::NoSpace);
        assert!(e.message().is_none());
    }
}
