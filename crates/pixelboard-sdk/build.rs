//! 编译期元信息：GIT_SHA、BUILD_TIMESTAMP（vergen），
//! 以及 SDK_DB_VERSION（migrations/ 下 V{version}__*.sql 的最大版本号）

use std::env;
use std::fs;
use std::path::Path;
use vergen::EmitBuilder;

fn main() {
    let _ = EmitBuilder::builder()
        .build_timestamp()
        .git_sha(false)
        .emit();

    let manifest_dir = env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR");
    let migrations_dir = Path::new(&manifest_dir).join("migrations");
    let max_version = scan_max_migration_version(&migrations_dir);

    println!("cargo:rustc-env=SDK_DB_VERSION={}", max_version);
    println!("cargo:rerun-if-changed=migrations/");
}

/// refinery 文件名格式: V{version}__{name}.sql
fn scan_max_migration_version(dir: &Path) -> i64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_str()?;
            let rest = name.strip_prefix('V')?.strip_suffix(".sql")?;
            rest.split("__").next()?.parse::<i64>().ok()
        })
        .max()
        .unwrap_or(0)
}
