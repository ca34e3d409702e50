//! Detached signing via the external `gpg` binary.
//!
//! The store does not implement a signature scheme of its own; it shells out
//! to gpg for signing and treats verification as the remote's concern.
//! Extra arguments are taken from `GPGARGS` (used by tests to point at a
//! scratch keyring).

use crate::StoreError;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

/// Produce a detached binary signature for `data` with the given key.
pub fn sign_detached(
    data: &[u8],
    key_id: &str,
    homedir: Option<&Path>,
) -> Result<Vec<u8>, StoreError> {
    let mut cmd = Command::new("gpg");
    if let Ok(extra) = std::env::var("GPGARGS") {
        for arg in extra.split_whitespace() {
            cmd.arg(arg);
        }
    }
    if let Some(dir) = homedir {
        cmd.arg("--homedir").arg(dir);
    }
    cmd.args(["--batch", "--detach-sign", "--local-user", key_id, "--output", "-"]);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| StoreError::SignFailed(format!("failed to spawn gpg: {e}")))?;
    child
        .stdin
        .take()
        .ok_or_else(|| StoreError::SignFailed("gpg stdin unavailable".to_owned()))?
        .write_all(data)
        .map_err(|e| StoreError::SignFailed(format!("failed to write to gpg: {e}")))?;
    let output = child
        .wait_with_output()
        .map_err(|e| StoreError::SignFailed(format!("gpg did not finish: {e}")))?;
    if !output.status.success() {
        return Err(StoreError::SignFailed(format!(
            "gpg exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output.stdout)
}
