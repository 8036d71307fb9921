//! 挂载选项
//!
//! 对应 ntfs3 的 `struct mount_options`。全部缺省关闭；
//! 字符串解析属于外层适配层，这里只有语义载体。

/// 挂载选项
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// 文件权限反掩码
    pub fmask_inv: Option<u16>,
    /// 目录权限反掩码
    pub dmask_inv: Option<u16>,
    /// 系统文件视为不可变
    pub sys_immutable: bool,
    /// 释放时下发 TRIM
    pub discard: bool,
    /// 缺省创建稀疏文件
    pub sparse: bool,
    /// 元文件按名字暴露
    pub showmeta: bool,
    /// 隐藏带 HIDDEN 属性的文件
    pub nohidden: bool,
    /// 脏卷也读写挂载
    pub force: bool,
    /// 绕过 POSIX 权限检查
    pub no_acs_rules: bool,
    /// 增长写入时预分配
    pub prealloc: bool,
}

impl MountOptions {
    /// `umask=` 同时设置两个反掩码
    pub fn set_umask(&mut self, umask: u16) {
        self.fmask_inv = Some(!umask);
        self.dmask_inv = Some(!umask);
    }
}
