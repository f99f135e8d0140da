//! Authentication resolution for SSH sessions.
//!
//! Candidates are resolved once per host and tried in priority order:
//! explicit identity file, host-specific identity from the SSH config map,
//! a running agent, default keys at standard locations, and finally an
//! explicit password.

use std::path::{Path, PathBuf};

use russh_keys::key::KeyPair;
use tracing::debug;

use crate::error::SessionError;

/// Caller-supplied authentication inputs.
#[derive(Debug, Clone, Default)]
pub struct AuthOptions {
    /// Explicit identity file; highest priority.
    pub identity_file: Option<PathBuf>,
    /// Passphrase for encrypted identity files.
    pub passphrase: Option<String>,
    /// Explicit password; lowest priority.
    pub password: Option<String>,
}

/// One authentication method to attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthCandidate {
    IdentityFile(PathBuf),
    Agent,
    Password(String),
}

/// Resolves the ordered candidate list for one host.
///
/// `override_identity` is the identity from the matched SSH config block,
/// slotted between the explicit option and the agent.
pub fn resolve_candidates(
    opts: &AuthOptions,
    override_identity: Option<&Path>,
) -> Vec<AuthCandidate> {
    let mut candidates = Vec::new();

    if let Some(path) = &opts.identity_file {
        candidates.push(AuthCandidate::IdentityFile(path.clone()));
    }
    if let Some(path) = override_identity {
        let path = path.to_path_buf();
        if !candidates.contains(&AuthCandidate::IdentityFile(path.clone())) {
            candidates.push(AuthCandidate::IdentityFile(path));
        }
    }
    if std::env::var_os("SSH_AUTH_SOCK").is_some() {
        candidates.push(AuthCandidate::Agent);
    }
    for path in default_key_paths() {
        if path.exists() {
            let candidate = AuthCandidate::IdentityFile(path);
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }
    }
    if let Some(password) = &opts.password {
        candidates.push(AuthCandidate::Password(password.clone()));
    }

    debug!(count = candidates.len(), "Resolved auth candidates");
    candidates
}

/// Standard key locations under the user's home directory.
pub fn default_key_paths() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    let ssh_dir = home.join(".ssh");
    ["id_ed25519", "id_rsa", "id_ecdsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .collect()
}

/// Rejects private keys readable by group or world.
pub fn check_key_permissions(path: &Path) -> Result<(), SessionError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let meta = std::fs::metadata(path).map_err(SessionError::Io)?;
        if meta.permissions().mode() & 0o077 != 0 {
            return Err(SessionError::KeyPermissions(path.to_path_buf()));
        }
    }
    Ok(())
}

/// Loads a private key after checking its permissions.
pub fn load_key(path: &Path, passphrase: Option<&str>) -> Result<KeyPair, SessionError> {
    check_key_permissions(path)?;
    russh_keys::load_secret_key(path, passphrase)
        .map_err(|err| SessionError::Exec(format!("failed to load key {}: {err}", path.display())))
}
