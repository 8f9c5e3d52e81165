//! Lumen 内核配置（自动生成）
//!
//! 此文件由 build.rs 根据 Kernel.toml 自动生成，请勿手动修改

// ============================================================
// 基本信息
// ============================================================

/// 内核名称
pub const KERNEL_NAME: &str = "Lumen";

/// 内核版本
pub const KERNEL_VERSION: &str = "0.1.0";

// ============================================================
// 内存配置
// ============================================================

/// 页大小位移
pub const PAGE_SHIFT: usize = 12;

/// 页大小（字节）
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// 伙伴系统最大 order（块大小为 2^order 页，order 取值 0..MAX_ORDER）
pub const MAX_ORDER: usize = 11;

/// 最大 CPU 数
pub const MAX_CPUS: usize = 4;

/// DMA 区上界（物理地址，字节）
pub const ZONE_DMA_LIMIT: usize = 16777216;

/// 高端内存起始（物理地址，字节）
pub const ZONE_HIGHMEM_START: usize = 939524096;

// ============================================================
// 页缓存配置
// ============================================================

/// 页缓存哈希桶数量
pub const PAGE_CACHE_BUCKETS: usize = 256;

/// 等待 LOCKED 页的自旋上限
pub const LOCKED_WAIT_SPINS: usize = 10000;

// ============================================================
// Per-CPU 页缓存配置
// ============================================================

/// PCP 高水位（超过时批量归还）
pub const PCP_HIGH: usize = 64;

/// PCP 低水位（归还时保留的页数）
pub const PCP_LOW: usize = 16;

/// PCP 批量操作数量
pub const PCP_BATCH: usize = 16;
