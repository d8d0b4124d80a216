//! 本地目录打包
//!
//! 遵循 `.gitignore`、`.deployignore` 以及常见的构建产物目录

use flate2::write::GzEncoder;
use flate2::Compression;
use ignore::WalkBuilder;
use std::fs::File;
use std::io;
use std::path::Path;

/// 总是排除的目录与文件
pub const DEFAULT_IGNORES: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "__pycache__",
    ".venv",
    ".DS_Store",
];

/// 部署专用的忽略文件
pub const DEPLOY_IGNORE_FILE: &str = ".deployignore";

/// 打包结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSummary {
    pub files: usize,
    pub bytes: u64,
}

/// 将 `root` 打包为 tar.gz 写入 `dest`
///
/// 同步实现，调用方放在 `spawn_blocking` 中执行
pub fn package_directory(root: &Path, dest: &Path) -> io::Result<PackageSummary> {
    if !root.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a directory", root.display()),
        ));
    }

    let encoder = GzEncoder::new(File::create(dest)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(true)
        .git_global(false)
        .git_exclude(false)
        .require_git(false)
        .parents(false)
        .add_custom_ignore_filename(DEPLOY_IGNORE_FILE)
        .filter_entry(|entry| {
            entry
                .file_name()
                .to_str()
                .map_or(true, |name| !DEFAULT_IGNORES.contains(&name))
        })
        .build();

    let mut summary = PackageSummary { files: 0, bytes: 0 };
    for entry in walker {
        let entry = entry.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let path = entry.path();
        let relative = match path.strip_prefix(root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };

        let Some(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            builder.append_dir(relative, path)?;
        } else {
            builder.append_path_with_name(path, relative)?;
            summary.files += 1;
            if file_type.is_file() {
                summary.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
    }

    builder.into_inner()?.finish()?;
    Ok(summary)
}
