//! Impersonation gate: resolving a credential descriptor to an OS identity
//! and scoping privileged work to it
//!
//! Every handler that touches guest-OS-protected resources acquires an
//! [`ImpersonationGuard`] first. The guard restores the prior security
//! context and releases the identity exactly once when it goes out of scope,
//! so release symmetry holds on success and on every failure branch alike.
//!
//! The effective uid/gid is process-wide state, and the runtime dispatches
//! connections concurrently. The gate therefore serializes impersonated
//! sections: acquiring a guard takes a gate-wide lock that is held until the
//! guard drops, so no handler ever runs inside another request's security
//! context.

pub mod unix;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use guestops_shared::wire::CredentialBlock;
use guestops_shared::{credential_type, OpError, OpResult};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// A decoded credential descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Act as root / the privileged system identity
    PrivilegedSystem,
    /// Act as the owner of the interactive console session
    SessionOwner,
    /// Named user that must match the account the agent itself runs as
    NamedCurrentUser { name: String, secret: String },
    /// Named user authenticated with a secret
    NamePassword { name: String, secret: String },
    /// Anything newer than this agent understands
    Unknown(u32),
}

impl Credential {
    /// Decode the credential block appended to a request envelope
    pub fn parse(block: &CredentialBlock<'_>) -> OpResult<Self> {
        match block.kind {
            credential_type::PRIVILEGED_SYSTEM => Ok(Self::PrivilegedSystem),
            credential_type::SESSION_OWNER => Ok(Self::SessionOwner),
            credential_type::NAMED_CURRENT_USER => {
                let (name, secret) = deobfuscate(block.blob)?;
                Ok(Self::NamedCurrentUser { name, secret })
            }
            credential_type::NAME_PASSWORD => {
                let (name, secret) = split_name_secret(block.blob)?;
                Ok(Self::NamePassword { name, secret })
            }
            credential_type::NAME_PASSWORD_OBFUSCATED => {
                let (name, secret) = deobfuscate(block.blob)?;
                Ok(Self::NamePassword { name, secret })
            }
            other => Ok(Self::Unknown(other)),
        }
    }
}

/// Split a `name NUL secret NUL` payload
fn split_name_secret(bytes: &[u8]) -> OpResult<(String, String)> {
    let mut parts = bytes.split(|&b| b == 0);
    let name = parts.next().ok_or(OpError::MalformedMessage)?;
    let secret = parts.next().ok_or(OpError::MalformedMessage)?;
    // the trailing terminator leaves exactly one empty tail element
    if parts.next() != Some(&[][..]) || parts.next().is_some() {
        return Err(OpError::MalformedMessage);
    }
    let name = std::str::from_utf8(name).map_err(|_| OpError::MalformedMessage)?;
    let secret = std::str::from_utf8(secret).map_err(|_| OpError::MalformedMessage)?;
    Ok((name.to_string(), secret.to_string()))
}

/// Undo the wire obfuscation of a name+secret payload
pub fn deobfuscate(blob: &[u8]) -> OpResult<(String, String)> {
    let raw = BASE64.decode(blob).map_err(|_| OpError::MalformedMessage)?;
    split_name_secret(&raw)
}

/// Obfuscate a name+secret pair. The agent only decodes; this exists for
/// host-side tooling and tests.
pub fn obfuscate(name: &str, secret: &str) -> Vec<u8> {
    let mut raw = Vec::with_capacity(name.len() + secret.len() + 2);
    raw.extend_from_slice(name.as_bytes());
    raw.push(0);
    raw.extend_from_slice(secret.as_bytes());
    raw.push(0);
    BASE64.encode(raw).into_bytes()
}

/// A live authenticated OS identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsIdentity {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
}

/// Result of credential resolution.
///
/// `NoSwitch` means the agent already runs as the right principal and no
/// context switch happened; `Owned` holds a live identity that must be
/// restored and released exactly once.
#[derive(Debug, PartialEq, Eq)]
pub enum UserToken {
    NoSwitch,
    Owned(OsIdentity),
}

/// Seam to the OS identity store and context-switching machinery.
///
/// The production implementation is [`unix::UnixIdentityProvider`]; tests
/// substitute a counting mock.
pub trait IdentityProvider: Send + Sync {
    /// Account name the agent process currently runs as
    fn current_username(&self) -> OpResult<String>;
    /// Validate a name+secret pair against the identity store
    fn authenticate(&self, name: &str, secret: &str) -> OpResult<OsIdentity>;
    /// Switch the OS security context to the given identity
    fn switch_to(&self, identity: &OsIdentity) -> OpResult<()>;
    /// Restore the context saved at agent startup
    fn restore(&self) -> OpResult<()>;
    /// Close the identity's OS resources
    fn release(&self, identity: &OsIdentity);
}

/// Policy and plumbing for credential resolution
pub struct ImpersonationGate {
    provider: Arc<dyn IdentityProvider>,
    runs_privileged: bool,
    allow_console_user_ops: bool,
    reject_empty_secret: bool,
    /// Held by every guard; at most one impersonated section at a time
    section: Arc<Mutex<()>>,
}

impl ImpersonationGate {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        runs_privileged: bool,
        allow_console_user_ops: bool,
    ) -> Self {
        Self {
            provider,
            runs_privileged,
            allow_console_user_ops,
            // Windows forbids interactive logon with an empty password even
            // where a console session would allow it.
            reject_empty_secret: cfg!(windows),
            section: Arc::new(Mutex::new(())),
        }
    }

    /// Override the empty-secret policy (tests exercise the Windows rule on
    /// any platform)
    pub fn with_empty_secret_policy(mut self, reject: bool) -> Self {
        self.reject_empty_secret = reject;
        self
    }

    /// Resolve a credential to a scoped identity token.
    ///
    /// Resolution rules, in priority order:
    /// 1. The privileged system identity is honored only if this process
    ///    itself runs privileged.
    /// 2. The session owner is honored if console-user operations are
    ///    policy-enabled, or if this process is unprivileged anyway.
    /// 3. A named-current-user credential must match the account actually
    ///    running this process; no secret check happens here because the
    ///    host validated it by other means.
    /// 4. A name+secret credential is authenticated against the identity
    ///    store and the context is switched to it.
    /// 5. Any other kind is unsupported.
    ///
    /// Waits for any other impersonated section to finish first; the
    /// returned guard keeps the section exclusive until it drops.
    pub async fn impersonate(&self, credential: &Credential) -> OpResult<ImpersonationGuard<'_>> {
        let section = Arc::clone(&self.section).lock_owned().await;
        match credential {
            Credential::PrivilegedSystem => {
                if self.runs_privileged {
                    Ok(self.no_switch(section))
                } else {
                    Err(OpError::PermissionDenied)
                }
            }
            Credential::SessionOwner => {
                if self.allow_console_user_ops || !self.runs_privileged {
                    Ok(self.no_switch(section))
                } else {
                    Err(OpError::PermissionDenied)
                }
            }
            Credential::NamedCurrentUser { name, .. } => {
                if self.runs_privileged {
                    // only the per-session agent may take this path
                    return Err(OpError::PermissionDenied);
                }
                let current = self.provider.current_username()?;
                if names_match(name, &current) {
                    Ok(self.no_switch(section))
                } else {
                    debug!(requested = %name, "current-user credential does not match");
                    Err(OpError::PermissionDenied)
                }
            }
            Credential::NamePassword { name, secret } => {
                if self.reject_empty_secret && secret.is_empty() {
                    return Err(OpError::EmptyPasswordNotAllowed);
                }
                let identity = self.provider.authenticate(name, secret)?;
                if let Err(err) = self.provider.switch_to(&identity) {
                    // the identity was acquired, so it still must be released
                    self.provider.release(&identity);
                    return Err(err);
                }
                debug!(user = %identity.username, "impersonation active");
                Ok(ImpersonationGuard {
                    gate: self,
                    token: UserToken::Owned(identity),
                    _section: section,
                })
            }
            Credential::Unknown(kind) => {
                warn!(kind, "unsupported credential kind");
                Err(OpError::NotSupported)
            }
        }
    }

    fn no_switch(&self, section: OwnedMutexGuard<()>) -> ImpersonationGuard<'_> {
        ImpersonationGuard {
            gate: self,
            token: UserToken::NoSwitch,
            _section: section,
        }
    }
}

/// Compare a requested account name against the current one, accepting
/// domain-qualified spellings of the same account
fn names_match(requested: &str, current: &str) -> bool {
    if requested == current {
        return true;
    }
    if let Some((_, account)) = requested.rsplit_once('\\') {
        return account == current;
    }
    if let Some((account, _)) = requested.split_once('@') {
        return account == current;
    }
    false
}

/// Scoped impersonation. Dropping the guard restores the prior security
/// context, releases the identity and reopens the gate for the next
/// impersonated section; the `NoSwitch` token makes the first two no-ops.
pub struct ImpersonationGuard<'a> {
    gate: &'a ImpersonationGate,
    token: UserToken,
    _section: OwnedMutexGuard<()>,
}

impl ImpersonationGuard<'_> {
    pub fn token(&self) -> &UserToken {
        &self.token
    }

    /// Account name work performed under this guard is attributed to
    pub fn username(&self) -> OpResult<String> {
        match &self.token {
            UserToken::NoSwitch => self.gate.provider.current_username(),
            UserToken::Owned(identity) => Ok(identity.username.clone()),
        }
    }
}

impl Drop for ImpersonationGuard<'_> {
    fn drop(&mut self) {
        if let UserToken::Owned(identity) = &self.token {
            if let Err(err) = self.gate.provider.restore() {
                warn!(error = %err, "failed to restore security context");
            }
            self.gate.provider.release(identity);
        }
    }
}
