use serde::{Deserialize, Serialize};

/// Longest token lifetime `validate` accepts.
pub const MAX_TOKEN_VALIDITY_HOURS: u64 = 24 * 365;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeriscopeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Listen port (HTTPS unless TLS is disabled)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to web client static files
    #[serde(default = "default_web_root")]
    pub web_root: String,
    /// Maximum concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Certificate chain (PEM). Generated self-signed if missing.
    #[serde(default = "default_cert_file")]
    pub cert_file: String,
    /// Private key (PEM). Generated alongside the certificate if missing.
    #[serde(default = "default_key_file")]
    pub key_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Authenticate the OS user running the server through PAM instead of
    /// the static user list.
    #[serde(default)]
    pub use_system_auth: bool,
    /// 64-byte token signing secret, created on first start
    #[serde(default = "default_hmac_key")]
    pub hmac_key: String,
    #[serde(default = "default_token_validity_hours")]
    pub token_validity_hours: u64,
    /// Static user list, used when `use_system_auth` is false
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

/// A static login. Password is redacted in Debug output.
#[derive(Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for UserEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserEntry")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Target bitrate in kbps
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// Target framerate
    #[serde(default = "default_framerate")]
    pub framerate: u32,
    /// Force a specific encoder: "nvh264enc", "vah264enc", "x264enc"
    pub encoder: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Enable audio streaming
    #[serde(default)]
    pub enabled: bool,
    /// Opus bitrate in kbps
    #[serde(default = "default_audio_bitrate")]
    pub bitrate: u32,
}

/// ICE/TURN server configuration for WebRTC NAT traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs (default: Google's public STUN servers)
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN server URLs (e.g., "turn:turn.example.com:3478")
    #[serde(default)]
    pub turn_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
    /// Upper bound on ICE candidate gathering while building an offer
    #[serde(default = "default_gather_timeout")]
    pub gather_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Reject WebSocket upgrades whose Origin does not match the Host
    #[serde(default = "default_true")]
    pub check_origin: bool,
    /// Extra origins accepted by the check, e.g. "https://desk.example.com"
    #[serde(default)]
    pub additional_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Device backend. Only "test-pattern" ships with the server.
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            web_root: default_web_root(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cert_file: default_cert_file(),
            key_file: default_key_file(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            use_system_auth: false,
            hmac_key: default_hmac_key(),
            token_validity_hours: default_token_validity_hours(),
            users: Vec::new(),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            bitrate: default_bitrate(),
            framerate: default_framerate(),
            encoder: None,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bitrate: default_audio_bitrate(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
            gather_timeout_secs: default_gather_timeout(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            check_origin: true,
            additional_origins: Vec::new(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            width: default_width(),
            height: default_height(),
        }
    }
}

impl PeriscopeConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }
        if self.server.max_sessions == 0 {
            issues.push("ERROR: server.max_sessions must be >= 1.".to_string());
        }

        if self.tls.enabled && (self.tls.cert_file.is_empty() || self.tls.key_file.is_empty()) {
            issues.push(
                "ERROR: tls.cert_file and tls.key_file must be set when TLS is enabled."
                    .to_string(),
            );
        }
        if !self.tls.enabled {
            issues.push(
                "WARNING: TLS is disabled. Tokens and passwords will cross the network in clear text."
                    .to_string(),
            );
        }

        // --- Auth ---
        if self.auth.hmac_key.is_empty() {
            issues.push("ERROR: auth.hmac_key must name a file for the signing secret.".to_string());
        }
        if self.auth.token_validity_hours == 0 {
            issues.push("ERROR: auth.token_validity_hours must be >= 1.".to_string());
        } else if self.auth.token_validity_hours > MAX_TOKEN_VALIDITY_HOURS {
            issues.push(format!(
                "ERROR: auth.token_validity_hours must be <= {MAX_TOKEN_VALIDITY_HOURS} (one year), got {}.",
                self.auth.token_validity_hours
            ));
        }
        if !self.auth.use_system_auth && self.auth.users.is_empty() {
            issues.push(
                "WARNING: auth.users is empty and system auth is off. Nobody can log in."
                    .to_string(),
            );
        }
        for user in &self.auth.users {
            if !valid_username(&user.username) {
                issues.push(format!(
                    "ERROR: auth.users entry '{}' is not a valid username \
                     (only a-z, 0-9, _, -, . are allowed, max 32 chars).",
                    user.username
                ));
            }
            if user.password.is_empty() {
                issues.push(format!(
                    "ERROR: auth.users entry '{}' has an empty password.",
                    user.username
                ));
            }
        }

        // --- Video ---
        if self.video.bitrate == 0 {
            issues.push("ERROR: video.bitrate must be > 0 kbps.".to_string());
        } else if self.video.bitrate > 100_000 {
            issues.push(format!(
                "WARNING: video.bitrate is {} kbps ({} Mbps), which is unusually high. \
                 Typical values: 2000-20000 kbps.",
                self.video.bitrate,
                self.video.bitrate / 1000
            ));
        }
        if self.video.framerate == 0 || self.video.framerate > 240 {
            issues.push(format!(
                "ERROR: video.framerate must be between 1 and 240, got {}.",
                self.video.framerate
            ));
        }

        // --- Audio ---
        if self.audio.enabled && !(6..=510).contains(&self.audio.bitrate) {
            issues.push(format!(
                "ERROR: audio.bitrate must be between 6 and 510 kbps, got {}.",
                self.audio.bitrate
            ));
        }

        // --- ICE ---
        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302",
                    url
                ));
            }
        }
        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{}' must start with 'turn:' or 'turns:'. \
                     Example: turn:turn.example.com:3478",
                    url
                ));
            }
        }
        if !self.ice.turn_urls.is_empty()
            && (self.ice.turn_username.is_none() || self.ice.turn_credential.is_none())
        {
            issues.push(
                "WARNING: turn_urls is set without turn_username/turn_credential. \
                 Most TURN servers require credentials."
                    .to_string(),
            );
        }
        if self.ice.gather_timeout_secs == 0 {
            issues.push("ERROR: ice.gather_timeout_secs must be >= 1.".to_string());
        }

        // --- Security ---
        for origin in &self.security.additional_origins {
            if !origin.starts_with("http://") && !origin.starts_with("https://") {
                issues.push(format!(
                    "WARNING: additional_origins entry '{}' has no http(s) scheme and will never match.",
                    origin
                ));
            }
        }

        // --- Capture ---
        if self.capture.width < 16 || self.capture.height < 16 {
            issues.push(format!(
                "ERROR: capture geometry must be at least 16x16, got {}x{}.",
                self.capture.width, self.capture.height
            ));
        }
        if self.capture.width % 2 != 0 || self.capture.height % 2 != 0 {
            issues.push(format!(
                "ERROR: capture geometry must have even dimensions for H.264, got {}x{}.",
                self.capture.width, self.capture.height
            ));
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

/// Usernames accepted by the login endpoint and the static user list.
pub fn valid_username(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 32
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8443
}
fn default_web_root() -> String {
    "web".to_string()
}
fn default_max_sessions() -> usize {
    4
}
fn default_true() -> bool {
    true
}
fn default_cert_file() -> String {
    "./cert.pem".to_string()
}
fn default_key_file() -> String {
    "./key.pem".to_string()
}
fn default_hmac_key() -> String {
    "./hmac.key".to_string()
}
fn default_token_validity_hours() -> u64 {
    24
}
fn default_bitrate() -> u32 {
    8000
}
fn default_framerate() -> u32 {
    30
}
fn default_audio_bitrate() -> u32 {
    128
}
fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}
fn default_gather_timeout() -> u64 {
    10
}
fn default_backend() -> String {
    "test-pattern".to_string()
}
fn default_width() -> u32 {
    1280
}
fn default_height() -> u32 {
    720
}
