//! WS-Security UsernameToken generation and validation.
//!
//! Digest = base64(SHA-1(nonce ‖ created ‖ password)) where `created` is the
//! exact string carried on the wire.

use crate::config::{PasswordType, SecurityConfig};
use crate::envelope::{SOAP_ENV_NS, WSSE_NS, WSU_NS};
use crate::error::{SecurityError, SoapError};
use crate::xml::Element;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest, Sha1};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// `EncodingType` of `wsse:Nonce`.
pub const BASE64_BINARY_URI: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary";

/// Format of generated `wsu:Created` values.
pub const CREATED_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Nonce size in bytes.
pub const NONCE_LEN: usize = 16;

/// A WS-Security UsernameToken.
#[derive(Clone, PartialEq, Eq)]
pub struct UsernameToken {
    pub username: String,
    /// Digest (base64) or plain password, depending on `password_type`
    pub password: String,
    pub password_type: PasswordType,
    /// Raw nonce bytes
    pub nonce: Option<Vec<u8>>,
    /// `wsu:Created` exactly as transmitted
    pub created: Option<String>,
}

impl fmt::Debug for UsernameToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsernameToken")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("password_type", &self.password_type)
            .field("nonce", &self.nonce.as_ref().map(|n| BASE64.encode(n)))
            .field("created", &self.created)
            .finish()
    }
}

impl UsernameToken {
    fn to_element(&self) -> Element {
        let mut token = Element::new(WSSE_NS, "UsernameToken")
            .with_child(Element::new(WSSE_NS, "Username").with_text(self.username.as_str()))
            .with_child(
                Element::new(WSSE_NS, "Password")
                    .with_attribute("Type", self.password_type.uri())
                    .with_text(self.password.as_str()),
            );
        if let Some(ref nonce) = self.nonce {
            token.children.push(
                Element::new(WSSE_NS, "Nonce")
                    .with_attribute("EncodingType", BASE64_BINARY_URI)
                    .with_text(BASE64.encode(nonce)),
            );
        }
        if let Some(ref created) = self.created {
            token
                .children
                .push(Element::new(WSU_NS, "Created").with_text(created.as_str()));
        }
        token
    }

    fn from_element(element: &Element) -> Result<Self, SoapError> {
        // Username and PasswordText are compared byte for byte
        let username = element
            .child(WSSE_NS, "Username")
            .map(|u| u.text.clone())
            .unwrap_or_default();

        let password_element = element.child(WSSE_NS, "Password");
        // An absent Type means PasswordText per the token profile
        let password_type = match password_element.and_then(|p| p.attribute("Type")) {
            None => PasswordType::PasswordText,
            Some(uri) => PasswordType::from_uri(uri).ok_or_else(|| {
                SoapError::Parse(format!("unknown password type '{}'", uri))
            })?,
        };
        let password = password_element
            .map(|p| match password_type {
                PasswordType::PasswordText => p.text.clone(),
                PasswordType::PasswordDigest => p.text_trimmed().to_string(),
            })
            .unwrap_or_default();

        let nonce = match element.child(WSSE_NS, "Nonce") {
            Some(n) => Some(
                BASE64
                    .decode(n.text_trimmed())
                    .map_err(|e| SoapError::Parse(format!("invalid Nonce encoding: {}", e)))?,
            ),
            None => None,
        };

        // Some firmware puts Created in the wsse namespace
        let created = element
            .child(WSU_NS, "Created")
            .or_else(|| element.child_by_local_name("Created"))
            .map(|c| c.text_trimmed().to_string());

        Ok(Self {
            username,
            password,
            password_type,
            nonce,
            created,
        })
    }
}

/// The `wsse:Security` header block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Security {
    pub must_understand: bool,
    pub username_token: Option<UsernameToken>,
}

impl Security {
    pub(crate) fn to_element(&self) -> Element {
        let mut security = Element::new(WSSE_NS, "Security");
        if self.must_understand {
            security = security.with_ns_attribute(SOAP_ENV_NS, "mustUnderstand", "1");
        }
        if let Some(ref token) = self.username_token {
            security.children.push(token.to_element());
        }
        security
    }

    pub(crate) fn from_element(element: &Element) -> Result<Self, SoapError> {
        let must_understand = matches!(
            element.ns_attribute(SOAP_ENV_NS, "mustUnderstand"),
            Some("1") | Some("true")
        );
        let username_token = element
            .child(WSSE_NS, "UsernameToken")
            .map(UsernameToken::from_element)
            .transpose()?;
        Ok(Self {
            must_understand,
            username_token,
        })
    }
}

/// base64(SHA-1(nonce ‖ created ‖ password)).
pub fn password_digest(nonce: &[u8], created: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(created.as_bytes());
    hasher.update(password.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The local system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// System clock shifted by a fixed offset, used to stamp tokens in a
/// device's notion of time.
#[derive(Debug, Clone, Copy)]
pub struct OffsetClock {
    offset: chrono::Duration,
}

impl OffsetClock {
    pub fn new(offset: chrono::Duration) -> Self {
        Self { offset }
    }

    /// Offset that aligns the local clock with a device reporting `device_now`.
    pub fn from_device_time(device_now: DateTime<Utc>) -> Self {
        Self::new(device_now - Utc::now())
    }

    pub fn offset(&self) -> chrono::Duration {
        self.offset
    }
}

impl Clock for OffsetClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.offset
    }
}

/// Password lookup for incoming tokens.
pub trait CredentialStore: Send + Sync {
    fn password(&self, username: &str) -> Option<String>;
}

impl CredentialStore for HashMap<String, String> {
    fn password(&self, username: &str) -> Option<String> {
        self.get(username).cloned()
    }
}

/// Builds outgoing Security headers. A fresh nonce and timestamp per call.
#[derive(Clone)]
pub struct SecurityHeaderFactory {
    clock: Arc<dyn Clock>,
}

impl Default for SecurityHeaderFactory {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl SecurityHeaderFactory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Digest token with a random nonce, stamped with the current time.
    pub fn generate(&self, username: &str, password: &str) -> Security {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let created = self.clock.now().format(CREATED_FORMAT).to_string();
        Self::generate_with(username, password, &nonce, &created)
    }

    /// Digest token from explicit inputs.
    pub fn generate_with(username: &str, password: &str, nonce: &[u8], created: &str) -> Security {
        Security {
            must_understand: true,
            username_token: Some(UsernameToken {
                username: username.to_string(),
                password: password_digest(nonce, created, password),
                password_type: PasswordType::PasswordDigest,
                nonce: Some(nonce.to_vec()),
                created: Some(created.to_string()),
            }),
        }
    }

    /// PasswordText token. The password travels in clear.
    pub fn generate_text(&self, username: &str, password: &str) -> Security {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        Security {
            must_understand: true,
            username_token: Some(UsernameToken {
                username: username.to_string(),
                password: password.to_string(),
                password_type: PasswordType::PasswordText,
                nonce: Some(nonce.to_vec()),
                created: Some(self.clock.now().format(CREATED_FORMAT).to_string()),
            }),
        }
    }
}

type ReplayKey = (Vec<u8>, String);

#[derive(Default)]
struct ReplayEntries {
    seen: HashSet<ReplayKey>,
    by_age: BTreeSet<(DateTime<Utc>, ReplayKey)>,
}

impl ReplayEntries {
    /// Pop entries created before `horizon`, oldest first.
    fn evict(&mut self, horizon: DateTime<Utc>) {
        while self
            .by_age
            .first()
            .is_some_and(|(created, _)| *created < horizon)
        {
            if let Some((_, key)) = self.by_age.pop_first() {
                self.seen.remove(&key);
            }
        }
    }
}

/// Seen (nonce, created) pairs. Entries leave only once their `created`
/// falls behind `now - window`.
pub struct ReplayCache {
    window: chrono::Duration,
    entries: Mutex<ReplayEntries>,
}

impl ReplayCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window: chrono_duration(window),
            entries: Mutex::new(ReplayEntries::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().seen.is_empty()
    }

    /// Drop entries older than the window.
    pub fn sweep(&self, now: DateTime<Utc>) {
        self.entries.lock().evict(now - self.window);
    }

    /// Reject a seen pair, otherwise run `verify` and record the pair if it
    /// passes. The lock is held throughout.
    pub fn check_and_record<F>(
        &self,
        nonce: &[u8],
        created: &str,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
        verify: F,
    ) -> Result<(), SecurityError>
    where
        F: FnOnce() -> Result<(), SecurityError>,
    {
        let mut entries = self.entries.lock();
        entries.evict(now - self.window);

        let key = (nonce.to_vec(), created.to_string());
        if entries.seen.contains(&key) {
            return Err(SecurityError::ReplayedNonce);
        }

        verify()?;
        entries.by_age.insert((created_at, key.clone()));
        entries.seen.insert(key);
        Ok(())
    }
}

/// Validate a digest token. Returns the authenticated username.
pub fn validate(
    security: Option<&Security>,
    credentials: &dyn CredentialStore,
    now: DateTime<Utc>,
    skew: Duration,
    cache: &ReplayCache,
) -> Result<String, SecurityError> {
    validate_token(
        security,
        credentials,
        now,
        skew,
        cache,
        &[PasswordType::PasswordDigest],
    )
}

fn validate_token(
    security: Option<&Security>,
    credentials: &dyn CredentialStore,
    now: DateTime<Utc>,
    skew: Duration,
    cache: &ReplayCache,
    allowed: &[PasswordType],
) -> Result<String, SecurityError> {
    let token = security
        .and_then(|s| s.username_token.as_ref())
        .ok_or(SecurityError::MissingCredentials)?;
    let created = token
        .created
        .as_deref()
        .ok_or(SecurityError::MissingCredentials)?;
    if token.password_type == PasswordType::PasswordDigest && token.nonce.is_none() {
        return Err(SecurityError::MissingCredentials);
    }

    if !allowed.contains(&token.password_type) {
        return Err(SecurityError::UnsupportedPasswordType);
    }

    let created_at = parse_created(created).ok_or(SecurityError::StaleTimestamp)?;
    let skew = chrono_duration(skew);
    if created_at < now - skew || created_at > now + skew {
        return Err(SecurityError::StaleTimestamp);
    }

    let verify = || verify_password(token, created, credentials);
    match token.nonce {
        Some(ref nonce) => cache.check_and_record(nonce, created, created_at, now, verify)?,
        // Text tokens without a nonce cannot be tracked
        None => verify()?,
    }

    Ok(token.username.clone())
}

fn verify_password(
    token: &UsernameToken,
    created: &str,
    credentials: &dyn CredentialStore,
) -> Result<(), SecurityError> {
    let password = credentials
        .password(&token.username)
        .ok_or(SecurityError::DigestMismatch)?;

    let expected = match token.password_type {
        PasswordType::PasswordDigest => {
            let nonce = token.nonce.as_deref().unwrap_or_default();
            password_digest(nonce, created, &password)
        }
        PasswordType::PasswordText => password,
    };

    if constant_time_eq(expected.as_bytes(), token.password.as_bytes()) {
        Ok(())
    } else {
        Err(SecurityError::DigestMismatch)
    }
}

fn parse_created(created: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(created)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::seconds(d.as_secs().min(u32::MAX as u64) as i64)
}

/// Server-side token validation bound to a credential store, clock and
/// replay cache.
pub struct SecurityValidator {
    credentials: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    skew: Duration,
    allowed: Vec<PasswordType>,
    cache: ReplayCache,
}

impl SecurityValidator {
    pub fn new(credentials: Arc<dyn CredentialStore>, config: &SecurityConfig) -> Self {
        let skew = config.max_clock_skew();
        Self {
            credentials,
            clock: Arc::new(SystemClock),
            skew,
            allowed: config.allowed_password_types.clone(),
            cache: ReplayCache::new(skew),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn replay_cache(&self) -> &ReplayCache {
        &self.cache
    }

    /// Validate the Security header of one request.
    pub fn validate(&self, security: Option<&Security>) -> Result<String, SecurityError> {
        let result = validate_token(
            security,
            self.credentials.as_ref(),
            self.clock.now(),
            self.skew,
            &self.cache,
            &self.allowed,
        );

        match result {
            Ok(ref username) => debug!(username = %username, "UsernameToken accepted"),
            Err(ref e) => {
                let username = security
                    .and_then(|s| s.username_token.as_ref())
                    .map(|t| t.username.as_str())
                    .unwrap_or("");
                warn!(
                    username = %username,
                    error = e.as_str(),
                    "UsernameToken rejected"
                );
            }
        }
        result
    }
}
