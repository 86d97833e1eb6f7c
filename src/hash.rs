use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use fast_rsync::{Signature, SignatureOptions};
use walkdir::WalkDir;

use crate::filters::SyncFilters;

const SIGNATURE_BLOCK_SIZE: u32 = 4096;
const SIGNATURE_CRYPTO_HASH_SIZE: u32 = 8;
const READ_BUF_SIZE: usize = 64 * 1024;

/// One observed file: its content hash, size, mtime, and rolling-checksum
/// signature, ready to be upserted into the metadata store.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub relative_path: String,
    pub hash: String,
    pub size_bytes: u64,
    pub mtime_ns: i128,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ScanError {
    pub path: PathBuf,
    pub cause: String,
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scan error at {}: {}", self.path.display(), self.cause)
    }
}

impl std::error::Error for ScanError {}

/// Reads `abs_path` in full and computes its content hash and delta signature.
pub fn hash_file(abs_path: &Path) -> Result<(String, u64, i128, Vec<u8>), ScanError> {
    let data = std::fs::read(abs_path).map_err(|e| ScanError {
        path: abs_path.to_path_buf(),
        cause: e.to_string(),
    })?;
    let meta = std::fs::metadata(abs_path).map_err(|e| ScanError {
        path: abs_path.to_path_buf(),
        cause: e.to_string(),
    })?;
    let mtime_ns = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i128)
        .unwrap_or(0);

    let hash = compute_md5_hex_streaming(abs_path).map_err(|e| ScanError {
        path: abs_path.to_path_buf(),
        cause: e.to_string(),
    })?;
    let signature = compute_signature(&data);

    Ok((hash, data.len() as u64, mtime_ns, signature))
}

fn compute_md5_hex_streaming(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

pub fn compute_signature(data: &[u8]) -> Vec<u8> {
    let sig = Signature::calculate(
        data,
        SignatureOptions {
            block_size: SIGNATURE_BLOCK_SIZE,
            crypto_hash_size: SIGNATURE_CRYPTO_HASH_SIZE,
        },
    );
    sig.into_serialized()
}

/// Returns true for files the hasher must never surface: symlinks, device
/// files, and well-known OS/editor artifacts.
fn is_hidden_artifact(file_name: &str) -> bool {
    file_name == ".DS_Store" || file_name.starts_with("Icon") || file_name.ends_with('~')
}

/// Walks `root` (a datasite root or any subtree) yielding one record per
/// regular file not excluded by `filters`. Unreadable files produce a
/// `ScanError` in the stream rather than aborting the whole walk.
pub fn scan_tree<'a>(
    root: &'a Path,
    filters: &'a SyncFilters,
) -> impl Iterator<Item = Result<FileRecord, ScanError>> + 'a {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(move |entry| {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => return None,
            };
            let file_type = entry.file_type();
            if file_type.is_dir() || file_type.is_symlink() {
                return None;
            }
            if !file_type.is_file() {
                return None;
            }
            let file_name = entry.file_name().to_string_lossy();
            if is_hidden_artifact(&file_name) {
                return None;
            }
            let abs_path = entry.path();
            let rel_path = abs_path.strip_prefix(root).unwrap_or(abs_path);
            if filters.ignore.should_ignore_rel(rel_path, false) {
                return None;
            }
            let rel_str = rel_path.to_string_lossy().replace('\\', "/");

            Some(match hash_file(abs_path) {
                Ok((hash, size_bytes, mtime_ns, signature)) => Ok(FileRecord {
                    relative_path: rel_str,
                    hash,
                    size_bytes,
                    mtime_ns,
                    signature,
                }),
                Err(e) => Err(e),
            })
        })
}
