//! Cache keys for decision memoization.

use sha2::{Digest, Sha256};

use rasp_core::types::CheckParameter;

/// Derives `<check type>:<sha256 of salient fields>`.
///
/// Only the fields that identify the operation contribute; the stack and
/// derived values do not, so the same command from two call sites shares
/// one key. The type prefix keeps different check types apart even when
/// their field values coincide.
pub fn derive_key(param: &CheckParameter) -> String {
    let mut hasher = Sha256::new();
    for (name, value) in param.kind.salient_fields() {
        hasher.update(name.as_bytes());
        hasher.update([0x1f]);
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value.as_bytes());
        hasher.update([0x1e]);
    }
    let digest = hex::encode(hasher.finalize());
    format!("{}:{}", param.check_type(), digest)
}
