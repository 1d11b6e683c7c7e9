//! 内存中的块设备，供单元测试使用。初始内容全为零，并统计读写次数。

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use super::BlockDevice;
use crate::consts::fs::BSIZE;
use crate::fs::BufData;

pub(crate) struct RamDisk {
    blocks: Mutex<HashMap<(u32, u32), [u8; BSIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    pub(crate) fn new() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub(crate) fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// 直接读取磁盘上的块内容，绕过缓存。
    pub(crate) fn block(&self, dev: u32, blockno: u32) -> [u8; BSIZE] {
        self.blocks
            .lock()
            .unwrap()
            .get(&(dev, blockno))
            .copied()
            .unwrap_or([0; BSIZE])
    }

    /// 直接改写磁盘上的块内容，绕过缓存。
    pub(crate) fn set_block(&self, dev: u32, blockno: u32, content: [u8; BSIZE]) {
        self.blocks.lock().unwrap().insert((dev, blockno), content);
    }
}

impl BlockDevice for RamDisk {
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool) {
        // 模拟 I/O 期间让出处理器
        thread::yield_now();
        if writing {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.set_block(dev, blockno, **data);
        } else {
            self.reads.fetch_add(1, Ordering::SeqCst);
            **data = self.block(dev, blockno);
        }
    }
}
