//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! Per-CPU Pages (PCP) - 每 CPU 页缓存
//!
//! 减少全局页分配器的锁竞争，提高多核性能。
//!
//! # 设计
//! - 每个 CPU 维护独立的 order-0 页缓存，按迁移类型分链
//! - 分配时优先从本地缓存取页，空了就从伙伴系统批量补充
//! - 释放进本地缓存，超过高水位时批量归还伙伴系统
//! - 缓存中的页标记为 PcpCached，重复释放一眼可辨
//!
//! # 迁移类型 (MigrateType)
//! - Unmovable: 不可移动（内核使用的页）
//! - Movable: 可移动（用户空间页，可迁移）
//! - Reclaimable: 可回收（可被换出）

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::config::{MAX_CPUS, PCP_BATCH, PCP_HIGH, PCP_LOW};

use super::buddy_allocator::{AllocFlags, PhysicalAllocator, GFP_HIGHMEM, GFP_KERNEL};
use super::page::{PhysFrame, PhysFrameNr};
use super::page_desc::{PageType, FRAME_NIL};
use super::MmError;

/// 迁移类型数量
pub const MIGRATE_TYPES: usize = 3;

/// 迁移类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum MigrateType {
    /// 不可移动
    Unmovable = 0,
    /// 可移动
    Movable = 1,
    /// 可回收
    Reclaimable = 2,
}

impl MigrateType {
    /// 补充时使用的分配标志
    fn alloc_flags(self) -> AllocFlags {
        match self {
            MigrateType::Movable => GFP_HIGHMEM,
            _ => GFP_KERNEL,
        }
    }
}

/// 单个 CPU 的本地页缓存
struct PerCpuPages {
    /// 每种迁移类型的页链表头（帧索引，FRAME_NIL 表示空）
    lists: [PhysFrameNr; MIGRATE_TYPES],
    /// 每种迁移类型的页数
    counts: [usize; MIGRATE_TYPES],
}

impl PerCpuPages {
    const fn new() -> Self {
        Self {
            lists: [FRAME_NIL; MIGRATE_TYPES],
            counts: [0; MIGRATE_TYPES],
        }
    }
}

/// 单个 CPU 的缓存统计
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuPcpStats {
    pub counts: [usize; MIGRATE_TYPES],
}

impl CpuPcpStats {
    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }
}

/// 全体 CPU 的缓存统计
#[derive(Debug, Clone)]
pub struct PcpStats {
    pub cpus: Vec<CpuPcpStats>,
}

impl PcpStats {
    /// 缓存中的总页数
    pub fn cached_pages(&self) -> usize {
        self.cpus.iter().map(|c| c.total()).sum()
    }
}

/// 全体 CPU 的页缓存
///
/// 每个 CPU 槽有独立的锁；调用者以当前 CPU 编号索引，
/// 正常路径上不同 CPU 互不竞争。
pub struct PcpSet {
    phys: Arc<PhysicalAllocator>,
    cpus: Vec<Mutex<PerCpuPages>>,
}

impl PcpSet {
    pub fn new(phys: Arc<PhysicalAllocator>) -> Self {
        let mut cpus = Vec::with_capacity(MAX_CPUS);
        for _ in 0..MAX_CPUS {
            cpus.push(Mutex::new(PerCpuPages::new()));
        }
        Self { phys, cpus }
    }

    /// 从指定 CPU 的缓存分配一个 order-0 页
    ///
    /// 缓存为空时从伙伴系统批量补充 PCP_BATCH 页。
    pub fn alloc_page(&self, cpu: usize, migratetype: MigrateType) -> Result<PhysFrame, MmError> {
        let slot = self.cpus.get(cpu).ok_or(MmError::InvalidArgument)?;
        let mut pcp = slot.lock();
        let mt = migratetype as usize;

        if pcp.counts[mt] == 0 {
            self.refill(&mut pcp, migratetype)?;
        }

        let idx = pcp.lists[mt];
        debug_assert!(idx != FRAME_NIL);
        let page = self.phys.frame(idx);
        pcp.lists[mt] = page.next_free();
        pcp.counts[mt] -= 1;
        page.set_next_free(FRAME_NIL);
        page.set_page_type(PageType::Normal);
        Ok(PhysFrame::new(idx))
    }

    /// 释放一个 order-0 页到指定 CPU 的缓存
    ///
    /// 超过高水位时批量归还伙伴系统，缓存保留至低水位。
    pub fn free_page(
        &self,
        cpu: usize,
        frame: PhysFrame,
        migratetype: MigrateType,
    ) -> Result<(), MmError> {
        let slot = self.cpus.get(cpu).ok_or(MmError::InvalidArgument)?;
        let page = self.phys.frame_desc(frame);

        match page.page_type() {
            // 已在某个缓存里或已归还伙伴系统
            PageType::PcpCached | PageType::Buddy | PageType::Free => {
                return Err(MmError::DoubleFree)
            }
            PageType::Normal => {}
            _ => return Err(MmError::InvalidArgument),
        }
        if page.order() != 0 || page.refcount() != 1 {
            return Err(MmError::InvalidArgument);
        }

        let mut pcp = slot.lock();
        let mt = migratetype as usize;
        page.set_page_type(PageType::PcpCached);
        page.set_next_free(pcp.lists[mt]);
        pcp.lists[mt] = frame.number;
        pcp.counts[mt] += 1;

        if pcp.counts[mt] >= PCP_HIGH {
            self.drain(&mut pcp, migratetype, PCP_LOW)?;
        }
        Ok(())
    }

    /// 清空所有 CPU 的缓存，归还伙伴系统
    pub fn drain_all(&self) -> Result<(), MmError> {
        for slot in &self.cpus {
            let mut pcp = slot.lock();
            for mt in [
                MigrateType::Unmovable,
                MigrateType::Movable,
                MigrateType::Reclaimable,
            ] {
                self.drain(&mut pcp, mt, 0)?;
            }
        }
        Ok(())
    }

    /// 从伙伴系统补充一批页
    fn refill(&self, pcp: &mut PerCpuPages, migratetype: MigrateType) -> Result<(), MmError> {
        let mt = migratetype as usize;
        let flags = migratetype.alloc_flags();
        let mut got = 0;
        let mut last_err = MmError::OutOfMemory;

        for _ in 0..PCP_BATCH {
            match self.phys.alloc_pages(0, flags) {
                Ok(frame) => {
                    let page = self.phys.frame_desc(frame);
                    page.set_page_type(PageType::PcpCached);
                    page.set_next_free(pcp.lists[mt]);
                    pcp.lists[mt] = frame.number;
                    pcp.counts[mt] += 1;
                    got += 1;
                }
                Err(e) => {
                    last_err = e;
                    break;
                }
            }
        }

        if got == 0 {
            Err(last_err)
        } else {
            Ok(())
        }
    }

    /// 归还缓存页直到数量降至 `keep`
    fn drain(
        &self,
        pcp: &mut PerCpuPages,
        migratetype: MigrateType,
        keep: usize,
    ) -> Result<(), MmError> {
        let mt = migratetype as usize;
        while pcp.counts[mt] > keep {
            let idx = pcp.lists[mt];
            debug_assert!(idx != FRAME_NIL);
            let page = self.phys.frame(idx);
            pcp.lists[mt] = page.next_free();
            pcp.counts[mt] -= 1;
            page.set_next_free(FRAME_NIL);
            self.phys.free_pages(PhysFrame::new(idx), 0)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> PcpStats {
        let cpus = self
            .cpus
            .iter()
            .map(|slot| CpuPcpStats {
                counts: slot.lock().counts,
            })
            .collect();
        PcpStats { cpus }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::page::PhysMemory;

    fn mk() -> (Arc<PhysicalAllocator>, PcpSet) {
        let mem = PhysMemory::new_owned(0x10_0000, 8 * 1024 * 1024).expect("arena");
        let phys = Arc::new(PhysicalAllocator::new(mem).expect("init"));
        let pcp = PcpSet::new(phys.clone());
        (phys, pcp)
    }

    #[test]
    fn test_alloc_refills_batch() {
        let (phys, pcp) = mk();
        let before = phys.free_frames();

        let frame = pcp.alloc_page(0, MigrateType::Unmovable).expect("alloc");
        assert_eq!(phys.frame_desc(frame).page_type(), PageType::Normal);

        // 一次补充 PCP_BATCH 页，取走一页后剩余留在缓存
        let stats = pcp.stats();
        assert_eq!(stats.cpus[0].counts[0], PCP_BATCH - 1);
        assert_eq!(phys.free_frames(), before - PCP_BATCH);

        pcp.free_page(0, frame, MigrateType::Unmovable).expect("free");
        assert_eq!(pcp.stats().cpus[0].counts[0], PCP_BATCH);
    }

    #[test]
    fn test_cached_page_reused_lifo() {
        let (_phys, pcp) = mk();
        let frame = pcp.alloc_page(0, MigrateType::Unmovable).unwrap();
        pcp.free_page(0, frame, MigrateType::Unmovable).unwrap();
        let again = pcp.alloc_page(0, MigrateType::Unmovable).unwrap();
        assert_eq!(again, frame);
    }

    #[test]
    fn test_drain_on_high_watermark() {
        let (phys, pcp) = mk();

        // 直接从伙伴系统拿一批页，全部塞进一个 CPU 槽
        let mut frames = Vec::new();
        for _ in 0..PCP_HIGH {
            frames.push(phys.alloc_pages(0, GFP_KERNEL).unwrap());
        }
        for frame in frames {
            pcp.free_page(1, frame, MigrateType::Unmovable).unwrap();
        }

        // 达到高水位后归还至低水位
        let stats = pcp.stats();
        assert_eq!(stats.cpus[1].counts[0], PCP_LOW);
    }

    #[test]
    fn test_double_free_into_cache_detected() {
        let (_phys, pcp) = mk();
        let frame = pcp.alloc_page(0, MigrateType::Unmovable).unwrap();
        pcp.free_page(0, frame, MigrateType::Unmovable).unwrap();
        assert_eq!(
            pcp.free_page(0, frame, MigrateType::Unmovable),
            Err(MmError::DoubleFree)
        );
    }

    #[test]
    fn test_free_buddy_page_rejected() {
        let (phys, pcp) = mk();
        let frame = phys.alloc_pages(0, GFP_KERNEL).unwrap();
        phys.free_pages(frame, 0).unwrap();
        // 已经还给伙伴系统的页不能再进 PCP
        assert_eq!(
            pcp.free_page(0, frame, MigrateType::Unmovable),
            Err(MmError::DoubleFree)
        );
    }

    #[test]
    fn test_multi_page_block_rejected() {
        let (phys, pcp) = mk();
        let frame = phys.alloc_pages(1, GFP_KERNEL).unwrap();
        assert_eq!(
            pcp.free_page(0, frame, MigrateType::Unmovable),
            Err(MmError::InvalidArgument)
        );
        phys.free_pages(frame, 1).unwrap();
    }

    #[test]
    fn test_invalid_cpu_rejected() {
        let (_phys, pcp) = mk();
        assert_eq!(
            pcp.alloc_page(MAX_CPUS, MigrateType::Unmovable).unwrap_err(),
            MmError::InvalidArgument
        );
    }

    #[test]
    fn test_drain_all_conserves_frames() {
        let (phys, pcp) = mk();
        let before = phys.free_frames();

        let mut held = Vec::new();
        for cpu in 0..MAX_CPUS {
            for mt in [MigrateType::Unmovable, MigrateType::Movable] {
                held.push((cpu, pcp.alloc_page(cpu, mt).unwrap(), mt));
            }
        }
        for (cpu, frame, mt) in held {
            pcp.free_page(cpu, frame, mt).unwrap();
        }

        pcp.drain_all().unwrap();
        assert_eq!(pcp.stats().cached_pages(), 0);
        assert_eq!(phys.free_frames(), before);
    }
}
