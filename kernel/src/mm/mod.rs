//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 内存管理模块
//!
//! 三个子系统装配在一个 [`MemoryContext`] 里：
//! - [`buddy_allocator::PhysicalAllocator`]：伙伴系统物理页分配
//! - [`slab::KernelHeap`]：slab 缓存与 kmalloc
//! - [`pagecache::PageCache`]：文件页缓存
//!
//! 外加 [`pcp::PcpSet`] 每 CPU 页缓存和 [`meminfo::MemoryInfo`]
//! 统计汇总。没有全局单例：上下文由启动代码构造并持有，
//! 宿主机测试可以并行建多个实例。

pub mod buddy_allocator;
pub mod meminfo;
pub mod page;
pub mod page_desc;
pub mod pagecache;
pub mod pcp;
pub mod slab;

pub use buddy_allocator::{
    AllocFlags, BuddyStats, PhysicalAllocator, ZoneKind, ZoneStats, GFP_DMA, GFP_HIGHMEM,
    GFP_KERNEL,
};
pub use meminfo::MemoryInfo;
pub use page::{PhysAddr, PhysFrame, PhysFrameNr, PhysMemory, VirtAddr, PAGE_SIZE};
pub use page_desc::{Page, PageFlag, PageFlags, PageType};
pub use pagecache::{
    AddressSpaceOps, CachedPageInfo, EntryFlags, MapFlags, PageCache, PageCacheStats, PageRef,
    VnodeId, VnodeIo,
};
pub use pcp::{MigrateType, PcpSet, PcpStats};
pub use slab::{CacheId, KernelHeap, SlabCacheStats, MAX_SLAB_OBJECT};

use alloc::sync::Arc;

use crate::errno::Errno;

/// 内存管理层错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// 物理内存耗尽
    OutOfMemory,
    /// 参数非法（指针、大小、对齐等）
    InvalidArgument,
    /// order 超出范围或与分配记录不符
    InvalidOrder,
    /// 重复释放
    DoubleFree,
    /// 请求的页不在缓存或映射中
    NotPresent,
    /// 资源忙（等待 LOCKED 页超时等）
    Busy,
    /// 后备存储 I/O 失败
    StorageIo,
}

impl MmError {
    /// 映射为系统调用错误码
    pub const fn errno(self) -> Errno {
        match self {
            MmError::OutOfMemory => Errno::OutOfMemory,
            MmError::InvalidArgument => Errno::InvalidArgument,
            MmError::InvalidOrder => Errno::InvalidArgument,
            MmError::DoubleFree => Errno::InvalidArgument,
            MmError::NotPresent => Errno::NoSuchFileOrDirectory,
            MmError::Busy => Errno::DeviceOrResourceBusy,
            MmError::StorageIo => Errno::IOError,
        }
    }
}

/// 内存管理上下文
///
/// 启动路径：用 bootloader 报告的范围构造 [`page::PhysMemory`]，
/// 注入 VFS 的 [`VnodeIo`] 实现，得到一个完整的内存管理栈。
pub struct MemoryContext {
    pub phys: Arc<PhysicalAllocator>,
    pub heap: KernelHeap,
    pub pcp: PcpSet,
    pub page_cache: PageCache,
}

impl MemoryContext {
    pub fn new(mem: PhysMemory, io: Arc<dyn VnodeIo>) -> Result<Self, MmError> {
        let phys = Arc::new(PhysicalAllocator::new(mem)?);
        let heap = KernelHeap::new(phys.clone())?;
        let pcp = PcpSet::new(phys.clone());
        let page_cache = PageCache::new(phys.clone(), io);
        log::info!(
            "{} mm: context ready, {} usable frames",
            crate::config::KERNEL_NAME,
            phys.usable_frames()
        );
        Ok(Self {
            phys,
            heap,
            pcp,
            page_cache,
        })
    }

    /// 汇总当前内存使用统计
    pub fn meminfo(&self) -> MemoryInfo {
        MemoryInfo::collect(&self.phys, &self.heap, &self.pcp, &self.page_cache)
    }

    /// 内存紧张时的轻量回收：先收缩 slab，再驱逐干净缓存页
    ///
    /// 返回归还伙伴系统的页数。
    pub fn reclaim(&self, target: usize) -> Result<usize, MmError> {
        let mut released = self.heap.shrink_all()?;
        if released < target {
            released += self.page_cache.evict_some(target - released);
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;
    use alloc::vec::Vec;
    use spin::Mutex;

    struct NullStore {
        pages: Mutex<BTreeMap<(u64, usize), Vec<u8>>>,
    }

    impl NullStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                pages: Mutex::new(BTreeMap::new()),
            })
        }
    }

    impl VnodeIo for NullStore {
        fn read_page(&self, vnode: VnodeId, index: usize, buf: &mut [u8]) -> Result<(), MmError> {
            match self.pages.lock().get(&(vnode.0, index)) {
                Some(data) => buf.copy_from_slice(data),
                None => buf.fill(0),
            }
            Ok(())
        }

        fn write_page(&self, vnode: VnodeId, index: usize, buf: &[u8]) -> Result<(), MmError> {
            self.pages.lock().insert((vnode.0, index), buf.to_vec());
            Ok(())
        }
    }

    fn ctx() -> MemoryContext {
        let mem = PhysMemory::new_owned(0x10_0000, 16 * 1024 * 1024).expect("arena");
        MemoryContext::new(mem, NullStore::new()).expect("context")
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(MmError::OutOfMemory.errno(), Errno::OutOfMemory);
        assert_eq!(MmError::InvalidOrder.errno(), Errno::InvalidArgument);
        assert_eq!(MmError::NotPresent.errno(), Errno::NoSuchFileOrDirectory);
        assert_eq!(MmError::Busy.errno(), Errno::DeviceOrResourceBusy);
        assert_eq!(MmError::StorageIo.errno(), Errno::IOError);
    }

    #[test]
    fn test_subsystems_share_one_arena() {
        let ctx = ctx();
        let baseline = ctx.phys.free_frames();

        let frame = ctx.phys.alloc_pages(3, GFP_KERNEL).unwrap();
        let obj = ctx.heap.kmalloc(512).unwrap();
        let page = ctx.page_cache.get(VnodeId(1), 0).unwrap();

        let info = ctx.meminfo();
        assert!(info.mem_free < baseline * PAGE_SIZE);
        assert_eq!(info.cache_entries, 1);
        assert_eq!(info.slab_pages, 1);

        drop(page);
        ctx.heap.kfree(obj).unwrap();
        ctx.phys.free_pages(frame, 3).unwrap();

        ctx.page_cache.evict_some(usize::MAX);
        ctx.heap.shrink_all().unwrap();
        assert_eq!(ctx.phys.free_frames(), baseline);
    }

    #[test]
    fn test_reclaim_releases_cache_and_slab() {
        let ctx = ctx();
        let baseline = ctx.phys.free_frames();

        // 占一些 slab 页和缓存页后全部放手
        let mut ptrs = Vec::new();
        for _ in 0..50 {
            ptrs.push(ctx.heap.kmalloc(256).unwrap());
        }
        for ptr in ptrs {
            ctx.heap.kfree(ptr).unwrap();
        }
        for index in 0..8 {
            ctx.page_cache.get(VnodeId(9), index).unwrap();
        }

        let released = ctx.reclaim(usize::MAX).unwrap();
        assert!(released >= 8);
        assert_eq!(ctx.phys.free_frames(), baseline);
    }

    #[test]
    fn test_dirty_pages_survive_reclaim() {
        let ctx = ctx();
        ctx.page_cache.get(VnodeId(3), 0).unwrap().write(0, b"keep");

        ctx.reclaim(usize::MAX).unwrap();
        let info = ctx.page_cache.debug_lookup(VnodeId(3), 0).expect("kept");
        assert!(info.flags.contains(EntryFlags::DIRTY));

        ctx.page_cache.flush_vnode(VnodeId(3)).unwrap();
        ctx.reclaim(usize::MAX).unwrap();
        assert!(ctx.page_cache.debug_lookup(VnodeId(3), 0).is_none());
    }

    #[test]
    fn test_pcp_pages_reported_in_meminfo() {
        let ctx = ctx();
        let frame = ctx.pcp.alloc_page(0, MigrateType::Unmovable).unwrap();
        let info = ctx.meminfo();
        assert!(info.pcp_pages[0] > 0);
        ctx.pcp.free_page(0, frame, MigrateType::Unmovable).unwrap();
        ctx.pcp.drain_all().unwrap();
        assert_eq!(ctx.meminfo().pcp_pages[0], 0);
    }
}
