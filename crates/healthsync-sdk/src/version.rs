//! SDK 版本与构建元信息
//!
//! 版本号的三个权威源，互不重复手写：
//! - SDK semver → Cargo.toml
//! - 队列库 schema 版本 → migrations/ 文件名（refinery 管理，build.rs 扫描）
//! - git / 构建时间 → vergen 在编译期注入

/// SDK semver，与 Cargo.toml 保持同步（禁止手写）
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 构建所在 git commit；不在 git 仓库中构建时为 vergen 的占位默认值
pub const GIT_SHA: &str = env!("VERGEN_GIT_SHA");

/// 构建时间戳（UTC, RFC 3339）
pub const BUILD_TIME: &str = env!("VERGEN_BUILD_TIMESTAMP");

/// 本构建支持的最高队列库 migration 版本。
///
/// build.rs 在编译期扫描 migrations/ 下的 V{version}__*.sql 取最大值，
/// 打开队列库时用作 downgrade 护栏：库里的版本比这还新就直接拒开，
/// 防旧版 SDK 改写新 schema。
pub const SDK_DB_VERSION: i64 = parse_decimal(env!("HEALTHSYNC_DB_VERSION").as_bytes());

/// 编译期十进制解析（build.rs 只会注入纯数字）
const fn parse_decimal(bytes: &[u8]) -> i64 {
    let mut value = 0i64;
    let mut idx = 0;
    while idx < bytes.len() {
        let digit = bytes[idx];
        if digit.is_ascii_digit() {
            value = value * 10 + (digit - b'0') as i64;
        }
        idx += 1;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_version_matches_shipped_migrations() {
        // migrations/ 目前只有 V1
        assert_eq!(SDK_DB_VERSION, 1);
    }

    #[test]
    fn semver_comes_from_cargo() {
        assert!(!SDK_VERSION.is_empty());
        assert_eq!(SDK_VERSION, env!("CARGO_PKG_VERSION"));
    }
}
