//! Lumen 内核构建脚本
//!
//! 这个脚本在编译前运行，负责：
//! 1. 解析 Kernel.toml 配置文件
//! 2. 生成配置代码 (src/config.rs)

use std::env;
use std::fs;
use std::path::PathBuf;

/// 读取配置中的整数项，缺失时使用默认值
fn get_usize(config: &toml::Value, section: &str, key: &str, default: usize) -> usize {
    config
        .get(section)
        .and_then(|s| s.get(key))
        .and_then(|v| v.as_integer())
        .map(|v| v as usize)
        .unwrap_or(default)
}

/// 读取配置中的字符串项，缺失时使用默认值
fn get_str<'a>(config: &'a toml::Value, section: &str, key: &str, default: &'a str) -> &'a str {
    config
        .get(section)
        .and_then(|s| s.get(key))
        .and_then(|v| v.as_str())
        .unwrap_or(default)
}

fn main() {
    println!("cargo:rerun-if-changed=../Kernel.toml");
    println!("cargo:rerun-if-changed=build.rs");

    // 读取 Kernel.toml；缺失时使用内置默认值
    let config_content = fs::read_to_string("../Kernel.toml").unwrap_or_default();
    let config: toml::Value = toml::from_str(&config_content)
        .unwrap_or(toml::Value::Table(toml::map::Map::new()));

    if let Some(general) = config.get("general") {
        if let Some(name) = general.get("name").and_then(|v| v.as_str()) {
            println!("cargo:rustc-env=CARGO_KERNEL_NAME={}", name);
        }
    }

    generate_config_code(&config);
}

fn generate_config_code(config: &toml::Value) {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());

    let kernel_name = get_str(config, "general", "name", "Lumen");
    let kernel_version = get_str(config, "general", "version", "0.1.0");

    let page_shift = get_usize(config, "memory", "page_shift", 12);
    let max_order = get_usize(config, "memory", "max_order", 11);
    let max_cpus = get_usize(config, "memory", "max_cpus", 4);
    let dma_limit = get_usize(config, "memory", "dma_limit", 16 * 1024 * 1024);
    let highmem_start = get_usize(config, "memory", "highmem_start", 896 * 1024 * 1024);

    let hash_buckets = get_usize(config, "pagecache", "hash_buckets", 256);
    let locked_wait_spins = get_usize(config, "pagecache", "locked_wait_spins", 10000);

    let pcp_high = get_usize(config, "pcp", "high", 64);
    let pcp_low = get_usize(config, "pcp", "low", 16);
    let pcp_batch = get_usize(config, "pcp", "batch", 16);

    let config_code = format!(
        r#"//! Lumen 内核配置（自动生成）
//!
//! 此文件由 build.rs 根据 Kernel.toml 自动生成，请勿手动修改

// ============================================================
// 基本信息
// ============================================================

/// 内核名称
pub const KERNEL_NAME: &str = "{kernel_name}";

/// 内核版本
pub const KERNEL_VERSION: &str = "{kernel_version}";

// ============================================================
// 内存配置
// ============================================================

/// 页大小位移
pub const PAGE_SHIFT: usize = {page_shift};

/// 页大小（字节）
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// 伙伴系统最大 order（块大小为 2^order 页，order 取值 0..MAX_ORDER）
pub const MAX_ORDER: usize = {max_order};

/// 最大 CPU 数
pub const MAX_CPUS: usize = {max_cpus};

/// DMA 区上界（物理地址，字节）
pub const ZONE_DMA_LIMIT: usize = {dma_limit};

/// 高端内存起始（物理地址，字节）
pub const ZONE_HIGHMEM_START: usize = {highmem_start};

// ============================================================
// 页缓存配置
// ============================================================

/// 页缓存哈希桶数量
pub const PAGE_CACHE_BUCKETS: usize = {hash_buckets};

/// 等待 LOCKED 页的自旋上限
pub const LOCKED_WAIT_SPINS: usize = {locked_wait_spins};

// ============================================================
// Per-CPU 页缓存配置
// ============================================================

/// PCP 高水位（超过时批量归还）
pub const PCP_HIGH: usize = {pcp_high};

/// PCP 低水位（归还时保留的页数）
pub const PCP_LOW: usize = {pcp_low};

/// PCP 批量操作数量
pub const PCP_BATCH: usize = {pcp_batch};
"#
    );

    // 仅在内容变化时重写，避免无谓的重新编译
    let config_file = manifest_dir.join("src").join("config.rs");
    let existing = fs::read_to_string(&config_file).unwrap_or_default();
    if existing != config_code {
        fs::write(&config_file, &config_code).expect("无法写入 src/config.rs");
    }
}
