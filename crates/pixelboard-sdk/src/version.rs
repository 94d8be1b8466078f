//! SDK 版本与运行时元信息
//!
//! - SDK Version → Cargo.toml
//! - Migration Version → migrations/ 文件（文件即版本，由 refinery 管理）

/// SDK semver，来自 Cargo.toml
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// git commit（由 vergen 在 build.rs 中生成）
pub const GIT_SHA: &str = env!("VERGEN_GIT_SHA");

/// build time（由 vergen 在 build.rs 中生成）
pub const BUILD_TIME: &str = env!("VERGEN_BUILD_TIMESTAMP");

/// 当前 SDK 支持的最高本地库 migration 版本。
/// build.rs 扫描 migrations/ 生成；打开本地库时若库版本更高则拒绝（防降级后 schema 不兼容）。
pub const SDK_DB_VERSION: i64 = parse_db_version(env!("SDK_DB_VERSION"));

const fn parse_db_version(s: &str) -> i64 {
    let b = s.as_bytes();
    let mut v = 0i64;
    let mut i = 0usize;
    while i < b.len() {
        if b[i] >= b'0' && b[i] <= b'9' {
            v = v * 10 + (b[i] - b'0') as i64;
        }
        i += 1;
    }
    v
}

/// 单行版本描述，用于启动日志
pub fn version_string() -> String {
    format!(
        "pixelboard-sdk {} (git {}, built {}, db v{})",
        SDK_VERSION, GIT_SHA, BUILD_TIME, SDK_DB_VERSION
    )
}
