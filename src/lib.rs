//! 多核内核的两个共享资源管理器：
//!
//! - [`Kmem`]：按 CPU 划分空闲链表的物理页分配器，本地链表为空时从其他 CPU 窃取；
//! - [`Bcache`]：按块号散列到固定个数哈希桶的块缓存，未命中时由一把驱逐锁串行化。
//!
//! 二者都依赖下层通过 [`register_hart`] 提供的 CPU 编号、中断开关与睡眠/唤醒。

#![cfg_attr(not(test), no_std)]
#![warn(rust_2018_idioms)]

pub mod consts;
pub mod driver;
pub mod fs;
pub mod mm;
pub mod process;
pub mod sleeplock;
pub mod spinlock;

pub use driver::BlockDevice;
pub use fs::{Bcache, Buf, BufData};
pub use mm::Kmem;
pub use process::{register_hart, Hart};
