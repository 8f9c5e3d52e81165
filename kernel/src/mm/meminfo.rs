//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 内核内存统计
//!
//! 提供类似 /proc/meminfo 的内存统计功能，汇总一个
//! [`super::MemoryContext`] 里各子系统的使用情况。
//!
//! # 统计内容
//! - 物理内存与各 zone 使用（伙伴系统）
//! - Slab 分配器使用
//! - Per-CPU 页缓存
//! - 页缓存条目

use crate::config::MAX_CPUS;

use super::buddy_allocator::PhysicalAllocator;
use super::page::PAGE_SIZE;
use super::pagecache::PageCache;
use super::pcp::PcpSet;
use super::slab::KernelHeap;

/// 内存统计信息（类似 /proc/meminfo）
#[derive(Debug, Clone, Copy)]
pub struct MemoryInfo {
    // ========== 物理内存 ==========
    /// 总物理内存（字节）
    pub mem_total: usize,
    /// 空闲物理内存（字节）
    pub mem_free: usize,
    /// 已使用物理内存（字节）
    pub mem_used: usize,
    /// 保留内存（描述符数组等，字节）
    pub mem_reserved: usize,

    // ========== Slab 分配器 ==========
    /// Slab 占用页数
    pub slab_pages: usize,
    /// Slab 分配次数
    pub slab_allocs: usize,
    /// Slab 释放次数
    pub slab_frees: usize,

    // ========== Per-CPU 页缓存 ==========
    /// 各 CPU 缓存的页数
    pub pcp_pages: [usize; MAX_CPUS],

    // ========== 页缓存 ==========
    /// 缓存条目数
    pub cache_entries: usize,
    /// 脏页数
    pub cache_dirty: usize,
    /// 被引用的条目数
    pub cache_pinned: usize,
}

impl MemoryInfo {
    /// 汇总各子系统的统计快照
    pub fn collect(
        phys: &PhysicalAllocator,
        heap: &KernelHeap,
        pcp: &PcpSet,
        page_cache: &PageCache,
    ) -> Self {
        let free_frames = phys.free_frames();
        let total_frames = phys.total_frames();
        let reserved_frames = phys.reserved_frames();

        let slab = heap.stats();
        let slab_pages = slab.iter().map(|c| c.pages()).sum();
        let slab_allocs = slab.iter().map(|c| c.alloc_count).sum();
        let slab_frees = slab.iter().map(|c| c.free_count).sum();

        let mut pcp_pages = [0; MAX_CPUS];
        for (i, cpu) in pcp.stats().cpus.iter().take(MAX_CPUS).enumerate() {
            pcp_pages[i] = cpu.total();
        }

        let cache = page_cache.stats();

        Self {
            mem_total: total_frames * PAGE_SIZE,
            mem_free: free_frames * PAGE_SIZE,
            mem_used: (total_frames - reserved_frames - free_frames) * PAGE_SIZE,
            mem_reserved: reserved_frames * PAGE_SIZE,
            slab_pages,
            slab_allocs,
            slab_frees,
            pcp_pages,
            cache_entries: cache.entries,
            cache_dirty: cache.dirty,
            cache_pinned: cache.pinned,
        }
    }

    /// 格式化为人类可读字符串
    pub fn format(&self) -> MemoryInfoFormatter<'_> {
        MemoryInfoFormatter { info: self }
    }

    /// 内存是否紧张（空闲低于 5%，OOM 预警）
    pub fn is_memory_low(&self) -> bool {
        self.mem_total > 0 && self.mem_free * 100 / self.mem_total < 5
    }

    /// 是否应该触发 OOM 处理（空闲低于 1%）
    pub fn should_trigger_oom(&self) -> bool {
        self.mem_total > 0 && self.mem_free * 100 / self.mem_total < 1
    }
}

/// 内存信息格式化器
pub struct MemoryInfoFormatter<'a> {
    info: &'a MemoryInfo,
}

impl core::fmt::Display for MemoryInfoFormatter<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "Memory Info:")?;
        writeln!(f, "  MemTotal:       {:>10} kB", self.info.mem_total / 1024)?;
        writeln!(f, "  MemFree:        {:>10} kB", self.info.mem_free / 1024)?;
        writeln!(f, "  MemUsed:        {:>10} kB", self.info.mem_used / 1024)?;
        writeln!(f, "  MemReserved:    {:>10} kB", self.info.mem_reserved / 1024)?;
        writeln!(f)?;
        writeln!(f, "  SlabPages:      {:>10}", self.info.slab_pages)?;
        writeln!(f, "  SlabAllocs:     {:>10}", self.info.slab_allocs)?;
        writeln!(f, "  SlabFrees:      {:>10}", self.info.slab_frees)?;
        writeln!(f)?;
        write!(f, "  PcpPages:      ")?;
        for (i, pages) in self.info.pcp_pages.iter().enumerate() {
            write!(f, " CPU{}={}", i, pages)?;
        }
        writeln!(f)?;
        writeln!(f)?;
        writeln!(f, "  CacheEntries:   {:>10}", self.info.cache_entries)?;
        writeln!(f, "  CacheDirty:     {:>10}", self.info.cache_dirty)?;
        writeln!(f, "  CachePinned:    {:>10}", self.info.cache_pinned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MemoryInfo {
        MemoryInfo {
            mem_total: 16 * 1024 * 1024,
            mem_free: 8 * 1024 * 1024,
            mem_used: 7 * 1024 * 1024,
            mem_reserved: 1024 * 1024,
            slab_pages: 3,
            slab_allocs: 10,
            slab_frees: 4,
            pcp_pages: [0; MAX_CPUS],
            cache_entries: 5,
            cache_dirty: 2,
            cache_pinned: 1,
        }
    }

    #[test]
    fn test_low_memory_thresholds() {
        let mut info = sample();
        assert!(!info.is_memory_low());
        assert!(!info.should_trigger_oom());

        info.mem_free = info.mem_total / 25; // 4%
        assert!(info.is_memory_low());
        assert!(!info.should_trigger_oom());

        info.mem_free = 0;
        assert!(info.should_trigger_oom());
    }

    #[test]
    fn test_formatter_mentions_fields() {
        let info = sample();
        let text = alloc::format!("{}", info.format());
        assert!(text.contains("MemTotal"));
        assert!(text.contains("SlabPages"));
        assert!(text.contains("CacheEntries"));
        assert!(text.contains("CPU0=0"));
    }
}
