use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use periscope_protocol::{AuthConfig, UserEntry};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Length of the token signing secret in bytes.
pub const SECRET_LEN: usize = 64;

/// Issuer/audience used when the host name cannot be read.
const FALLBACK_IDENTITY: &str = "periscope";

/// PAM service consulted by the system authenticator.
const PAM_SERVICE: &str = "periscope";

/// JWT claims carried by every bearer token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (username)
    pub sub: String,
    /// Issued by the system authenticator
    pub sys: bool,
    pub iss: String,
    pub aud: Vec<String>,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Not valid before (Unix timestamp)
    pub nbf: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("invalid audience")]
    InvalidAudience,
    #[error("token is expired")]
    TokenExpired,
    #[error("token is not valid yet")]
    TokenNotYetValid,
    #[error("token was issued for a different identity")]
    IdentityMismatch,
    #[error("failed to sign token: {0}")]
    Signing(String),
}

/// Process-lifetime token signing key.
pub struct HmacSecret([u8; SECRET_LEN]);

impl HmacSecret {
    #[cfg(test)]
    pub fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; SECRET_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Read the secret from `path`, creating it with owner-only permissions
    /// on first use. An existing file must hold exactly [`SECRET_LEN`] bytes.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.as_os_str().is_empty() {
            anyhow::bail!("Secret file path cannot be empty");
        }

        if !path.exists() {
            tracing::info!("Secret file {} does not exist, creating a new secret", path.display());
            let secret = Self::generate();
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(path)
                .with_context(|| format!("Failed to create secret file {}", path.display()))?;
            file.write_all(&secret.0)
                .with_context(|| format!("Failed to write secret file {}", path.display()))?;
            return Ok(secret);
        }

        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read secret file {}", path.display()))?;
        let bytes: [u8; SECRET_LEN] = data.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "Secret file {} must be {SECRET_LEN} bytes, found {}",
                path.display(),
                data.len()
            )
        })?;
        tracing::info!("Loaded token secret from {}", path.display());
        Ok(Self(bytes))
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for HmacSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HmacSecret([REDACTED])")
    }
}

/// Source of OS identity and password verification for system logins.
pub trait PasswordChecker: Send + Sync {
    /// Name of the OS user running this process.
    fn current_user(&self) -> Option<String>;
    /// Blocking. Call from `spawn_blocking`.
    fn check_password(&self, username: &str, password: &str) -> bool;
}

/// Verifies passwords through Linux PAM.
pub struct PamPasswordChecker {
    service: String,
}

impl PamPasswordChecker {
    pub fn new() -> Self {
        Self {
            service: PAM_SERVICE.to_string(),
        }
    }
}

impl Default for PamPasswordChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl PasswordChecker for PamPasswordChecker {
    fn current_user(&self) -> Option<String> {
        nix::unistd::User::from_uid(nix::unistd::getuid())
            .ok()
            .flatten()
            .map(|user| user.name)
    }

    fn check_password(&self, username: &str, password: &str) -> bool {
        let mut client = match pam::Client::with_password(&self.service) {
            Ok(client) => client,
            Err(e) => {
                tracing::error!("PAM init failed: {e}");
                return false;
            }
        };
        client
            .conversation_mut()
            .set_credentials(username, password);
        match client.authenticate() {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(username, "PAM authentication failed: {e}");
                false
            }
        }
    }
}

enum Flavor {
    /// Fixed user list from the config file
    Static(HashMap<String, String>),
    /// Only the OS user running the server, verified by a [`PasswordChecker`]
    System(Box<dyn PasswordChecker>),
}

/// Issues and verifies bearer tokens. Constructed once at startup and shared
/// by the login endpoint and every session.
pub struct Authenticator {
    flavor: Flavor,
    encoding: EncodingKey,
    decoding: DecodingKey,
    identity: String,
    validity: Duration,
}

impl Authenticator {
    pub fn new_static(users: &[UserEntry], secret: &HmacSecret, validity: Duration) -> Self {
        let users = users
            .iter()
            .map(|u| (u.username.clone(), u.password.clone()))
            .collect();
        Self::with_flavor(Flavor::Static(users), secret, validity)
    }

    pub fn new_system(
        checker: Box<dyn PasswordChecker>,
        secret: &HmacSecret,
        validity: Duration,
    ) -> Self {
        Self::with_flavor(Flavor::System(checker), secret, validity)
    }

    pub fn from_config(config: &AuthConfig, secret: &HmacSecret) -> Self {
        let validity = Duration::from_secs(config.token_validity_hours.saturating_mul(3600));
        if config.use_system_auth {
            Self::new_system(Box::new(PamPasswordChecker::new()), secret, validity)
        } else {
            Self::new_static(&config.users, secret, validity)
        }
    }

    fn with_flavor(flavor: Flavor, secret: &HmacSecret, validity: Duration) -> Self {
        Self {
            flavor,
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            identity: host_identity(),
            validity,
        }
    }

    /// Override the issuer/audience identity (defaults to the host name).
    #[cfg(test)]
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_system(&self) -> bool {
        matches!(self.flavor, Flavor::System(_))
    }

    /// Check credentials and mint a token. Blocking for the system flavor.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<String, AuthError> {
        self.authenticate_at(username, password, unix_now())
    }

    pub fn authenticate_at(
        &self,
        username: &str,
        password: &str,
        now: u64,
    ) -> Result<String, AuthError> {
        let system = match &self.flavor {
            Flavor::Static(users) => {
                let ok = users
                    .get(username)
                    .is_some_and(|p| constant_time_eq(p.as_bytes(), password.as_bytes()));
                if !ok {
                    return Err(AuthError::InvalidCredentials);
                }
                false
            }
            Flavor::System(checker) => {
                if checker.current_user().as_deref() != Some(username) {
                    return Err(AuthError::InvalidCredentials);
                }
                if !checker.check_password(username, password) {
                    return Err(AuthError::InvalidCredentials);
                }
                true
            }
        };
        self.issue(username, system, now)
    }

    fn issue(&self, username: &str, system: bool, now: u64) -> Result<String, AuthError> {
        let claims = Claims {
            sub: username.to_string(),
            sys: system,
            iss: self.identity.clone(),
            aud: vec![self.identity.clone()],
            iat: now,
            nbf: now,
            exp: now.saturating_add(self.validity.as_secs()),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }

    /// Verify a bearer token and return its subject.
    pub fn validate_token(&self, token: &str) -> Result<String, AuthError> {
        self.validate_token_at(token, unix_now())
    }

    /// Signature and algorithm, then audience, then authenticator flavor,
    /// then the validity window `[nbf, exp)` against `now`.
    pub fn validate_token_at(&self, token: &str, now: u64) -> Result<String, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.set_audience(&[self.identity.as_str()]);

        let claims = jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidAudience => AuthError::InvalidAudience,
                _ => AuthError::InvalidToken(e.to_string()),
            })?
            .claims;

        if claims.sys != self.is_system() {
            return Err(AuthError::IdentityMismatch);
        }
        if now < claims.nbf {
            return Err(AuthError::TokenNotYetValid);
        }
        if now >= claims.exp {
            return Err(AuthError::TokenExpired);
        }
        if let Flavor::System(checker) = &self.flavor
            && checker.current_user().as_deref() != Some(claims.sub.as_str())
        {
            return Err(AuthError::IdentityMismatch);
        }
        Ok(claims.sub)
    }
}

fn host_identity() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| FALLBACK_IDENTITY.to_string())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
