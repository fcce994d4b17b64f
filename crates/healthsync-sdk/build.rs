//! 编译期元信息：
//! - vergen 生成 VERGEN_GIT_SHA / VERGEN_BUILD_TIMESTAMP（供 version.rs 使用）
//! - 扫描 migrations/ 下的 V{version}__*.sql，把最大版本号注入
//!   HEALTHSYNC_DB_VERSION（队列库 downgrade 护栏的编译期上限）

use std::env;
use std::fs;
use std::path::Path;
use vergen::EmitBuilder;

/// refinery 命名约定 V{version}__{name}.sql 中提取 {version}
fn migration_version(file_name: &str) -> Option<i64> {
    let stem = file_name.strip_prefix('V')?.strip_suffix(".sql")?;
    let (version, _) = stem.split_once("__")?;
    version.parse().ok()
}

fn main() {
    // 不在 git 仓库里构建时 vergen 会退化为占位默认值，不阻塞编译
    let _ = EmitBuilder::builder()
        .build_timestamp()
        .git_sha(false)
        .emit();

    let manifest_dir = env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR");
    let migrations_dir = Path::new(&manifest_dir).join("migrations");

    let max_version = fs::read_dir(&migrations_dir)
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|e| e.file_name().to_str().and_then(migration_version))
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);

    println!("cargo:rustc-env=HEALTHSYNC_DB_VERSION={}", max_version);
    println!("cargo:rerun-if-changed=migrations/");
}
