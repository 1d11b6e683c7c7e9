//! 文件系统模块
//!
//! 只包含块缓存层；日志、inode 与目录层建立在它之上，由内核的其他部分提供。

mod bio;

pub use bio::{Bcache, Buf, BufData, NODEV};
