//! 本地 SSH 密钥发现与生成

use russh_keys::key::KeyPair;
use russh_keys::PublicKeyBase64;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::domain::profile::{GeneratedKey, LocalKey};
use crate::error::KeyGenerationError;

/// 默认生成的密钥文件名
const DEFAULT_KEY_NAME: &str = "id_ed25519";

/// `~/.ssh`
pub fn default_ssh_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ssh"))
}

/// 枚举 `dir` 下存在对应私钥的 `*.pub` 公钥
///
/// 只读取公钥文件，私钥内容不会被读取
pub async fn detect_local_keys(dir: &Path) -> Vec<LocalKey> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "SSH directory not readable");
            return Vec::new();
        }
    };

    let mut keys = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let public_key_path = entry.path();
        if public_key_path.extension().and_then(|e| e.to_str()) != Some("pub") {
            continue;
        }
        let path = public_key_path.with_extension("");
        if !fs::try_exists(&path).await.unwrap_or(false) {
            continue;
        }

        let key_type = match fs::read_to_string(&public_key_path).await {
            Ok(content) => content.split_whitespace().next().unwrap_or_default().to_string(),
            Err(_) => continue,
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        keys.push(LocalKey {
            name,
            path,
            public_key_path,
            key_type,
        });
    }

    keys.sort_by(|a, b| a.name.cmp(&b.name));
    keys
}

/// 生成 Ed25519 密钥对
///
/// 私钥写入 `path`（默认 `<ssh_dir>/id_ed25519`，权限 0600），公钥写入同名 `.pub`。
/// 目标已存在时除非 `force` 否则拒绝
pub async fn generate_key_pair(
    ssh_dir: Option<&Path>,
    comment: &str,
    path: Option<PathBuf>,
    force: bool,
) -> Result<GeneratedKey, KeyGenerationError> {
    let private_key_path = match path {
        Some(path) => path,
        None => ssh_dir
            .ok_or(KeyGenerationError::NoSshDirectory)?
            .join(DEFAULT_KEY_NAME),
    };
    let public_key_path = public_path(&private_key_path);

    if let Some(parent) = private_key_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !fs::try_exists(parent).await.unwrap_or(false) {
            fs::create_dir_all(parent).await?;
            set_mode(parent, 0o700).await?;
        }
    }

    let key_pair = KeyPair::generate_ed25519()
        .ok_or_else(|| KeyGenerationError::Encoding("ed25519 generation failed".to_string()))?;
    let public_key = key_pair
        .clone_public_key()
        .map_err(|e| KeyGenerationError::Encoding(e.to_string()))?;

    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key_pair, &mut pem)
        .map_err(|e| KeyGenerationError::Encoding(e.to_string()))?;

    let comment = comment.trim();
    let authorized_line = if comment.is_empty() {
        format!("{} {}", public_key.name(), public_key.public_key_base64())
    } else {
        format!("{} {} {}", public_key.name(), public_key.public_key_base64(), comment)
    };

    write_key_file(&private_key_path, &pem, 0o600, force).await?;
    let public_line = format!("{}\n", authorized_line);
    if let Err(e) = write_key_file(&public_key_path, public_line.as_bytes(), 0o644, force).await {
        if !force {
            let _ = fs::remove_file(&private_key_path).await;
        }
        return Err(e);
    }

    info!(path = %private_key_path.display(), "Generated ed25519 key pair");

    Ok(GeneratedKey {
        private_key_path,
        public_key: authorized_line,
    })
}

fn public_path(private_key_path: &Path) -> PathBuf {
    let mut name = private_key_path.as_os_str().to_owned();
    name.push(".pub");
    PathBuf::from(name)
}

/// 写入密钥文件，创建时即带权限
///
/// `overwrite` 为 false 时以 create_new 打开，目标已存在即失败
async fn write_key_file(
    path: &Path,
    content: &[u8],
    mode: u32,
    overwrite: bool,
) -> Result<(), KeyGenerationError> {
    let mut options = fs::OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    #[cfg(unix)]
    options.mode(mode);

    let mut file = match options.open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(KeyGenerationError::AlreadyExists(path.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    file.write_all(content).await?;
    file.flush().await?;
    // force 覆盖已有文件时收紧权限
    set_mode(path, mode).await?;
    Ok(())
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
