//! 设备驱动接入层
//!
//! 块缓存只依赖一个同步的块设备读写操作，具体驱动（如 virtio 磁盘）
//! 由内核实现 [`BlockDevice`] 后传给 [`Bcache::new`](crate::fs::Bcache::new)。

use crate::fs::BufData;

#[cfg(test)]
pub(crate) mod ramdisk;

/// 同步块设备。
pub trait BlockDevice: Sync {
    /// 读写设备 `dev` 上的第 `blockno` 块。
    ///
    /// `writing == false` 时用磁盘内容填充 `data`，否则将 `data` 写入磁盘。
    /// 调用者持有该缓冲区的睡眠锁，驱动可以在 I/O 完成前让当前进程睡眠；
    /// 调用返回即表示 I/O 已完成。
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool);
}
