//! Encrypted connection-token format.
//!
//! Wire form: URL-safe base64 of the UTF-8 JSON envelope
//! `{"iv": "<base64>", "value": "<base64>"}` where `value` is the
//! AES-256-CBC ciphertext of the PKCS#7-padded UTF-8 JSON payload
//! `{"connection": {"type": ..., "settings": {...}}}`.

use std::collections::HashMap;
use std::fmt;

use aes::cipher::{
    block_padding::{NoPadding, Pkcs7},
    BlockDecryptMut, BlockEncryptMut, KeyIvInit,
};
use base64::{
    engine::general_purpose::STANDARD as BASE64,
    engine::general_purpose::URL_SAFE as URL_SAFE_BASE64, Engine as _,
};
use rand::RngCore;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::{CryptConfig, TOKEN_CYPHER};
use crate::error::GatewayError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block size; also the required IV length.
pub const BLOCK_SIZE: usize = 16;

/// AES-256 key length.
pub const KEY_SIZE: usize = 32;

/// Token decryption/validation failure.
///
/// Exactly one kind per validation stage, so a rejected token tells the
/// operator which stage failed without revealing anything to the browser
/// beyond the kind name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// Outer base64 or envelope JSON is not well-formed.
    #[error("malformed token envelope")]
    MalformedToken,

    /// IV length is not one cipher block.
    #[error("invalid initialization vector")]
    InvalidIv,

    /// Ciphertext is empty or not block-aligned.
    #[error("invalid ciphertext")]
    InvalidCiphertext,

    /// The cipher itself rejected the input.
    #[error("token decryption failed")]
    DecryptFailed,

    /// The decrypted plaintext does not end in valid PKCS#7 padding.
    #[error("invalid plaintext padding")]
    InvalidPadding,

    /// Plaintext is not UTF-8 JSON.
    #[error("malformed token payload")]
    MalformedPayload,

    /// Payload JSON does not satisfy the connection-settings schema.
    #[error("invalid connection settings: {field}: {reason}")]
    InvalidSettings { field: String, reason: String },
}

impl TokenError {
    /// Stable kind name; the only token detail ever sent to the browser.
    pub fn kind_name(&self) -> &'static str {
        match self {
            TokenError::MalformedToken => "MalformedToken",
            TokenError::InvalidIv => "InvalidIV",
            TokenError::InvalidCiphertext => "InvalidCiphertext",
            TokenError::DecryptFailed => "DecryptFailed",
            TokenError::InvalidPadding => "InvalidPadding",
            TokenError::MalformedPayload => "MalformedPayload",
            TokenError::InvalidSettings { .. } => "InvalidSettings",
        }
    }
}

fn invalid(field: &str, reason: &str) -> TokenError {
    TokenError::InvalidSettings {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Remote-desktop protocol named by the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Rdp,
    Vnc,
    Ssh,
    Telnet,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Rdp => "rdp",
            ProtocolKind::Vnc => "vnc",
            ProtocolKind::Ssh => "ssh",
            ProtocolKind::Telnet => "telnet",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rdp" => Some(ProtocolKind::Rdp),
            "vnc" => Some(ProtocolKind::Vnc),
            "ssh" => Some(ProtocolKind::Ssh),
            "telnet" => Some(ProtocolKind::Telnet),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decrypted token payload.
///
/// Immutable once decrypted; destroyed with the session. Fields the schema
/// does not know are preserved verbatim so `encrypt` round-trips them.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    /// Protocol guacd should speak to the target.
    pub protocol: ProtocolKind,

    /// Connection parameters forwarded (positionally) during the handshake.
    pub settings: HashMap<String, String>,

    /// Existing guacd connection id to join instead of opening a new one.
    pub join: Option<String>,

    /// `GUAC_*` handshake overrides (`GUAC_WIDTH`, `GUAC_AUDIO`, ...).
    /// Values are strings or arrays of strings.
    handshake: Map<String, Value>,

    /// Unknown `connection.*` fields, preserved verbatim.
    connection_extra: Map<String, Value>,

    /// Unknown top-level payload fields, preserved verbatim.
    extra: Map<String, Value>,
}

impl ConnectionSettings {
    pub fn new(protocol: ProtocolKind, settings: HashMap<String, String>) -> Self {
        Self {
            protocol,
            settings,
            join: None,
            handshake: Map::new(),
            connection_extra: Map::new(),
            extra: Map::new(),
        }
    }

    pub fn with_join(mut self, connection_id: impl Into<String>) -> Self {
        self.join = Some(connection_id.into());
        self
    }

    /// Set a `GUAC_*` handshake override to a string value.
    pub fn with_guac_override(mut self, key: &str, value: &str) -> Self {
        self.handshake
            .insert(key.to_string(), Value::String(value.to_string()));
        self
    }

    /// Set a `GUAC_*` handshake override to a list value (mimetypes).
    pub fn with_guac_override_list(mut self, key: &str, values: &[&str]) -> Self {
        self.handshake.insert(
            key.to_string(),
            Value::Array(values.iter().map(|v| Value::String(v.to_string())).collect()),
        );
        self
    }

    /// Connection parameter by exact name.
    pub fn setting(&self, name: &str) -> Option<&str> {
        self.settings.get(name).map(String::as_str)
    }

    /// String-valued `GUAC_*` override.
    pub fn guac_override(&self, key: &str) -> Option<&str> {
        self.handshake.get(key).and_then(Value::as_str)
    }

    /// List-valued `GUAC_*` override.
    pub fn guac_override_list(&self, key: &str) -> Option<Vec<String>> {
        self.handshake.get(key).and_then(|v| match v {
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
            ),
            Value::String(s) => Some(vec![s.clone()]),
            _ => None,
        })
    }

    /// Validate a decrypted payload against the settings schema.
    fn from_payload(payload: Value) -> Result<Self, TokenError> {
        let mut root = match payload {
            Value::Object(map) => map,
            _ => return Err(invalid("$", "payload must be a JSON object")),
        };

        let connection = root
            .remove("connection")
            .ok_or_else(|| invalid("connection", "missing required object"))?;
        let mut connection = match connection {
            Value::Object(map) => map,
            _ => return Err(invalid("connection", "must be an object")),
        };

        let protocol = match connection.remove("type") {
            Some(Value::String(s)) => ProtocolKind::parse(&s).ok_or_else(|| {
                invalid(
                    "connection.type",
                    "must be one of rdp, vnc, ssh, telnet",
                )
            })?,
            Some(_) => return Err(invalid("connection.type", "must be a string")),
            None => return Err(invalid("connection.type", "missing required field")),
        };

        let settings = match connection.remove("settings") {
            Some(Value::Object(map)) => {
                let mut out = HashMap::with_capacity(map.len());
                for (name, value) in map {
                    match value {
                        Value::String(s) => {
                            out.insert(name, s);
                        }
                        _ => {
                            return Err(invalid(
                                &format!("connection.settings.{name}"),
                                "must be a string",
                            ))
                        }
                    }
                }
                out
            }
            Some(_) => return Err(invalid("connection.settings", "must be an object")),
            None => return Err(invalid("connection.settings", "missing required field")),
        };

        let join = match connection.remove("join") {
            None => None,
            Some(Value::String(s)) => Some(s),
            Some(_) => return Err(invalid("connection.join", "must be a string")),
        };

        let handshake = match connection.remove("handshake") {
            None => Map::new(),
            Some(Value::Object(map)) => {
                for (key, value) in &map {
                    let ok = match value {
                        Value::String(_) => true,
                        Value::Array(items) => items.iter().all(Value::is_string),
                        _ => false,
                    };
                    if !ok {
                        return Err(invalid(
                            &format!("connection.handshake.{key}"),
                            "must be a string or an array of strings",
                        ));
                    }
                }
                map
            }
            Some(_) => return Err(invalid("connection.handshake", "must be an object")),
        };

        Ok(Self {
            protocol,
            settings,
            join,
            handshake,
            connection_extra: connection,
            extra: root,
        })
    }

    /// Reassemble the payload JSON, inverse of [`from_payload`].
    fn to_payload(&self) -> Value {
        let mut connection = Map::new();
        connection.insert(
            "type".to_string(),
            Value::String(self.protocol.as_str().to_string()),
        );
        let settings: Map<String, Value> = self
            .settings
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        connection.insert("settings".to_string(), Value::Object(settings));
        if let Some(join) = &self.join {
            connection.insert("join".to_string(), Value::String(join.clone()));
        }
        if !self.handshake.is_empty() {
            connection.insert("handshake".to_string(), Value::Object(self.handshake.clone()));
        }
        for (key, value) in &self.connection_extra {
            connection.insert(key.clone(), value.clone());
        }

        let mut root = Map::new();
        root.insert("connection".to_string(), Value::Object(connection));
        for (key, value) in &self.extra {
            root.insert(key.clone(), value.clone());
        }
        Value::Object(root)
    }
}

/// AES-256-CBC token cipher. Holds only the key; safe for concurrent use.
pub struct TokenCipher {
    key: [u8; KEY_SIZE],
}

impl TokenCipher {
    /// Build from configuration, rejecting unsupported cyphers and keys of
    /// the wrong length.
    pub fn new(config: &CryptConfig) -> Result<Self, GatewayError> {
        if config.cypher != TOKEN_CYPHER {
            return Err(GatewayError::Config(format!(
                "Unsupported cypher '{}'",
                config.cypher
            )));
        }
        let key: [u8; KEY_SIZE] = config
            .key
            .as_bytes()
            .try_into()
            .map_err(|_| GatewayError::Config("crypt.key must be exactly 32 bytes".into()))?;
        Ok(Self { key })
    }

    pub fn from_key(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Decrypt and validate a connection token.
    pub fn decrypt(&self, token: &str) -> Result<ConnectionSettings, TokenError> {
        let raw = URL_SAFE_BASE64
            .decode(token)
            .map_err(|_| TokenError::MalformedToken)?;
        if raw.is_empty() {
            return Err(TokenError::MalformedToken);
        }

        let (iv, ciphertext) = parse_envelope(&raw)?;
        if iv.len() != BLOCK_SIZE {
            return Err(TokenError::InvalidIv);
        }
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(TokenError::InvalidCiphertext);
        }

        let iv: [u8; BLOCK_SIZE] = iv.as_slice().try_into().map_err(|_| TokenError::InvalidIv)?;
        let plaintext = Aes256CbcDec::new(&self.key.into(), &iv.into())
            .decrypt_padded_vec_mut::<NoPadding>(&ciphertext)
            .map_err(|_| TokenError::DecryptFailed)?;
        let plaintext = strip_pkcs7(&plaintext)?;

        let payload: Value =
            serde_json::from_slice(plaintext).map_err(|_| TokenError::MalformedPayload)?;
        ConnectionSettings::from_payload(payload)
    }

    /// Encrypt connection settings into a token, for tooling symmetry with
    /// [`decrypt`](Self::decrypt). A fresh random IV is drawn per token.
    pub fn encrypt(&self, settings: &ConnectionSettings) -> Result<String, TokenError> {
        let payload =
            serde_json::to_vec(&settings.to_payload()).map_err(|_| TokenError::MalformedPayload)?;

        let mut iv = [0u8; BLOCK_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(&payload);

        let envelope = serde_json::json!({
            "iv": BASE64.encode(iv),
            "value": BASE64.encode(&ciphertext),
        });
        let envelope = serde_json::to_vec(&envelope).map_err(|_| TokenError::MalformedPayload)?;
        Ok(URL_SAFE_BASE64.encode(envelope))
    }
}

/// Extract `(iv, value)` from the envelope JSON, enforcing exactly those
/// two fields, both base64 strings.
fn parse_envelope(raw: &[u8]) -> Result<(Vec<u8>, Vec<u8>), TokenError> {
    let envelope: Value = serde_json::from_slice(raw).map_err(|_| TokenError::MalformedToken)?;
    let obj = envelope.as_object().ok_or(TokenError::MalformedToken)?;
    if obj.len() != 2 {
        return Err(TokenError::MalformedToken);
    }
    let iv = obj
        .get("iv")
        .and_then(Value::as_str)
        .ok_or(TokenError::MalformedToken)?;
    let value = obj
        .get("value")
        .and_then(Value::as_str)
        .ok_or(TokenError::MalformedToken)?;
    let iv = BASE64.decode(iv).map_err(|_| TokenError::MalformedToken)?;
    let value = BASE64.decode(value).map_err(|_| TokenError::MalformedToken)?;
    Ok((iv, value))
}

/// Validate and strip PKCS#7 padding: last byte N in [1..=16], last N bytes
/// all equal to N.
fn strip_pkcs7(buf: &[u8]) -> Result<&[u8], TokenError> {
    let last = *buf.last().ok_or(TokenError::InvalidPadding)?;
    let n = last as usize;
    if n == 0 || n > BLOCK_SIZE || n > buf.len() {
        return Err(TokenError::InvalidPadding);
    }
    if buf[buf.len() - n..].iter().any(|&b| b != last) {
        return Err(TokenError::InvalidPadding);
    }
    Ok(&buf[..buf.len() - n])
}
