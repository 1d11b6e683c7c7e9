//! 内核常量定义

/// 物理页大小
pub const PGSIZE: usize = 4096;

/// 最大 CPU（硬件线程）数
pub const NCPU: usize = 8;

/// 释放页帧时填充的垃圾字节，用于暴露悬垂引用
pub const FREE_JUNK: u8 = 1;

/// 分配页帧时填充的垃圾字节，用于暴露未初始化读取
pub const ALLOC_JUNK: u8 = 5;

pub mod fs {
    /// 磁盘块大小
    pub const BSIZE: usize = 1024;

    /// 单次文件系统操作最多写入的块数
    pub const MAXOPBLOCKS: usize = 10;

    /// 块缓存中缓冲区的个数
    pub const NBUF: usize = MAXOPBLOCKS * 3;

    /// 块缓存的哈希桶个数
    pub const NBUCKET: usize = 13;
}
