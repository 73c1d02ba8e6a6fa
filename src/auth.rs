use scrypt::{
    password_hash::{PasswordHash, PasswordVerifier},
    Scrypt
};
use tracing::warn;

use crate::{
    client::Permission,
    config::{Account, ServerSettings}
};

/// Checks a password against the stored `0$`/`1$` prefixed credential.
///
/// Scrypt is deliberately slow, so verification runs on the blocking
/// pool instead of stalling the connection tasks.
async fn verify_password(pass: &str, stored: &str) -> bool {
    let pass   = pass.to_owned();
    let stored = stored.to_owned();

    let ret = tokio::task::spawn_blocking(move || {
        if stored.len() < 2 {
            return false;
        }
        match stored.split_at(2) {
            ("1$", hash) => match PasswordHash::new(hash) {
                Ok(parsed) => Scrypt.verify_password(pass.as_bytes(), &parsed).is_ok(),
                Err(e) => {
                    warn!("Stored password hash became unparsable: {}", e);
                    false
                }
            },
            // Plaintext creds only exist before startup hashing, which
            // configs built straight from a string skip
            ("0$", rawpass) => rawpass == pass,
            _ => false
        }
    }).await;

    ret.unwrap_or(false)
}

/// Resolves the permission a request holds on a mountpoint.
///
/// Source and meta accounts carry their permission only on mounts they
/// were granted (`*` grants all); admins hold it everywhere. Failed or
/// missing authentication degrades to [`Permission::None`] rather than
/// erroring, callers compare against the level they need.
pub async fn authenticate(config: &ServerSettings, auth: Option<&(String, String)>,
                          req_mount: &str) -> Permission {
    let Some((user, pass)) = auth else {
        return Permission::None;
    };
    if user.is_empty() || pass.is_empty() {
        return Permission::None;
    }

    let Some(account) = config.account.get(user) else {
        return Permission::None;
    };

    let (stored, perm) = match account {
        Account::Admin { pass } => (pass, Permission::Admin),
        Account::Source { pass, mount } => {
            if !mount.iter().any(|m| m.path.eq("*") || m.path.eq(req_mount)) {
                return Permission::None;
            }
            (pass, Permission::Source)
        },
        Account::Meta { pass, mount } => {
            if !mount.iter().any(|m| m.path.eq("*") || m.path.eq(req_mount)) {
                return Permission::None;
            }
            (pass, Permission::Meta)
        }
    };

    if verify_password(pass, stored).await {
        perm
    } else {
        Permission::None
    }
}
