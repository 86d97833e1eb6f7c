use fast_rsync::{Signature, SignatureOptions};

use crate::errors::SyncError;

const SIGNATURE_BLOCK_SIZE: u32 = 4096;
const SIGNATURE_CRYPTO_HASH_SIZE: u32 = 8;

/// Computes the rolling-checksum signature of `data`, serialized for
/// storage and for transmission to a peer that holds an older version.
pub fn signature(data: &[u8]) -> Vec<u8> {
    Signature::calculate(
        data,
        SignatureOptions {
            block_size: SIGNATURE_BLOCK_SIZE,
            crypto_hash_size: SIGNATURE_CRYPTO_HASH_SIZE,
        },
    )
    .into_serialized()
}

/// Produces a patch that, applied to any byte string whose signature
/// equals `sig_bytes`, reconstructs `data`.
pub fn diff(sig_bytes: &[u8], data: &[u8]) -> Result<Vec<u8>, SyncError> {
    let sig = Signature::deserialize(sig_bytes.to_vec()).map_err(|e| SyncError::PatchCorrupt {
        path: String::new(),
        reason: format!("invalid signature: {e}"),
    })?;
    let indexed = sig.index();
    let mut out = Vec::new();
    fast_rsync::diff(&indexed, data, &mut out).map_err(|e| SyncError::PatchCorrupt {
        path: String::new(),
        reason: format!("diff failed: {e}"),
    })?;
    Ok(out)
}

/// Reconstructs the target bytes by applying `patch` to `base`. Fails with
/// `PatchCorrupt` if the patch references blocks not present in `base`.
pub fn apply(base: &[u8], patch: &[u8]) -> Result<Vec<u8>, SyncError> {
    let mut out = Vec::new();
    fast_rsync::apply(base, patch, &mut out).map_err(|e| SyncError::PatchCorrupt {
        path: String::new(),
        reason: e.to_string(),
    })?;
    Ok(out)
}

/// Whether a computed patch is worth sending over a full upload, per the
/// `len(patch) >= len(data)` rule.
pub fn prefer_full_upload(patch_len: usize, data_len: usize) -> bool {
    patch_len >= data_len
}
