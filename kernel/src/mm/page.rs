//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 页帧与物理内存范围
//!
//! `PhysMemory` 描述一段内核可直接访问（恒等映射或直映射窗口）的
//! 物理内存。启动代码用 `from_raw` 把 bootloader 报告的范围交给
//! 分配器；宿主机测试用 `new_owned` 申请一块缓冲区并赋予一个
//! 模拟的物理基址。

use core::ptr::NonNull;

pub use crate::config::{PAGE_SHIFT, PAGE_SIZE};

pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// 物理帧号：管理范围内的帧索引（0 起）
pub type PhysFrameNr = usize;

pub type VirtPageNr = usize;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(pub usize);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(pub usize);

impl PhysAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }

    pub fn is_aligned(&self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    pub fn floor(&self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    pub fn ceil(&self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }
}

impl VirtAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }

    pub fn is_aligned(&self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    pub fn floor(&self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    pub fn ceil(&self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    pub fn page_number(&self) -> VirtPageNr {
        self.0 / PAGE_SIZE
    }
}

/// 物理页帧句柄
///
/// `number` 是管理范围内的帧索引；对应的物理地址由持有
/// `PhysMemory` 的分配器换算。
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PhysFrame {
    pub number: PhysFrameNr,
}

impl PhysFrame {
    pub const fn new(number: PhysFrameNr) -> Self {
        Self { number }
    }
}

/// 一段连续的、内核可直接访问的物理内存
pub struct PhysMemory {
    /// 内核视角的访问基址
    base: NonNull<u8>,
    /// 报告给外界的物理基址（页对齐）
    phys_base: PhysAddr,
    /// 范围大小（页对齐，字节）
    size: usize,
    /// 是否由本结构负责释放（仅宿主机测试路径）
    owned: bool,
}

unsafe impl Send for PhysMemory {}
unsafe impl Sync for PhysMemory {}

impl PhysMemory {
    /// 接管一段启动代码报告的物理内存
    ///
    /// # Safety
    /// 调用者必须保证 `[base, base + size)` 已映射、可读写，且在
    /// 本结构存活期间不被其它子系统使用。`base` 与 `size` 必须页对齐。
    pub unsafe fn from_raw(base: *mut u8, size: usize) -> Option<Self> {
        if base.is_null() || base as usize & PAGE_MASK != 0 {
            return None;
        }
        if size == 0 || size & PAGE_MASK != 0 {
            return None;
        }
        Some(Self {
            base: NonNull::new_unchecked(base),
            phys_base: PhysAddr::new(base as usize),
            size,
            owned: false,
        })
    }

    /// 申请一块宿主内存作为模拟物理内存（测试 / 仿真路径）
    ///
    /// `phys_base` 是这段内存对外呈现的物理基址，与实际缓冲区
    /// 地址无关，用于确定 zone 划分和调试输出。
    pub fn new_owned(phys_base: usize, size: usize) -> Option<Self> {
        if phys_base & PAGE_MASK != 0 || size == 0 || size & PAGE_MASK != 0 {
            return None;
        }
        let layout = core::alloc::Layout::from_size_align(size, PAGE_SIZE).ok()?;
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let base = NonNull::new(ptr)?;
        Some(Self {
            base,
            phys_base: PhysAddr::new(phys_base),
            size,
            owned: true,
        })
    }

    /// 范围大小（字节）
    pub fn size(&self) -> usize {
        self.size
    }

    /// 范围内的总帧数
    pub fn total_frames(&self) -> usize {
        self.size / PAGE_SIZE
    }

    /// 对外呈现的物理基址
    pub fn phys_base(&self) -> PhysAddr {
        self.phys_base
    }

    /// 帧索引对应的物理地址
    pub fn phys_of(&self, frame: PhysFrameNr) -> PhysAddr {
        PhysAddr::new(self.phys_base.0 + frame * PAGE_SIZE)
    }

    /// 帧索引对应的内核访问指针
    pub fn frame_ptr(&self, frame: PhysFrameNr) -> *mut u8 {
        debug_assert!(frame < self.total_frames());
        unsafe { self.base.as_ptr().add(frame * PAGE_SIZE) }
    }

    /// 内核指针反查帧索引（指针不在范围内时返回 None）
    pub fn frame_index_of(&self, ptr: *const u8) -> Option<PhysFrameNr> {
        let addr = ptr as usize;
        let base = self.base.as_ptr() as usize;
        if addr < base || addr >= base + self.size {
            return None;
        }
        Some((addr - base) / PAGE_SIZE)
    }
}

impl Drop for PhysMemory {
    fn drop(&mut self) {
        if self.owned {
            // layout 必须与 new_owned 中的一致
            let layout =
                core::alloc::Layout::from_size_align(self.size, PAGE_SIZE).expect("bad layout");
            unsafe { alloc::alloc::dealloc(self.base.as_ptr(), layout) };
        }
    }
}
