//! 内存管理模块

pub use kalloc::Kmem;

pub mod kalloc;
