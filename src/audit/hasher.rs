//! Chain Hasher
//!
//! Canonicalizes an entry together with its predecessor's hash and seals it with
//! HMAC-SHA256 under the entry's pinned secret version.
//!
//! Canonical encodings are tried in the fixed order of [`ENCODING_STRATEGIES`]
//! (newest first). An entry that records its encoding is only ever checked against
//! that encoding; the ordered fallback applies to rows that predate the column.

use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::audit::entry::AuditEntry;
use crate::audit::secrets::{Secret, SecretStore};
use crate::error::{LedgerError, LedgerResult};

type HmacSha256 = Hmac<Sha256>;

const V2_DOMAIN_TAG: &[u8] = b"audit-ledger/v2";
const V1_ABSENT: &str = "\\0";

/// Canonical payload encodings known to this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum EncodingVersion {
    /// Escaped `|`-delimited text, written by earlier deployments.
    V1,
    /// Length-prefixed binary fields.
    V2,
    /// A stored version this build cannot interpret.
    Unknown(i64),
}

/// Used for every new append.
pub const CURRENT_ENCODING: EncodingVersion = EncodingVersion::V2;

/// Fallback order for entries without a recorded encoding.
pub const ENCODING_STRATEGIES: [EncodingVersion; 2] = [EncodingVersion::V2, EncodingVersion::V1];

impl EncodingVersion {
    pub fn from_stored(value: i64) -> Self {
        match value {
            1 => Self::V1,
            2 => Self::V2,
            other => Self::Unknown(other),
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
            Self::Unknown(v) => *v,
        }
    }

    pub fn label(&self) -> String {
        format!("v{}", self.as_i64())
    }
}

impl From<i64> for EncodingVersion {
    fn from(value: i64) -> Self {
        Self::from_stored(value)
    }
}

impl From<EncodingVersion> for i64 {
    fn from(value: EncodingVersion) -> Self {
        value.as_i64()
    }
}

impl std::fmt::Display for EncodingVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// The hashed fields of an entry, borrowed from wherever they live.
#[derive(Debug, Clone, Copy)]
pub struct EntryFields<'a> {
    pub actor_id: &'a str,
    pub action: &'a str,
    pub resource_type: &'a str,
    pub resource_id: Option<&'a str>,
    pub metadata: &'a Value,
    pub timestamp: DateTime<Utc>,
}

impl<'a> From<&'a AuditEntry> for EntryFields<'a> {
    fn from(entry: &'a AuditEntry) -> Self {
        Self {
            actor_id: &entry.actor_id,
            action: &entry.action,
            resource_type: &entry.resource_type,
            resource_id: entry.resource_id.as_deref(),
            metadata: &entry.metadata,
            timestamp: entry.timestamp,
        }
    }
}

/// Outcome of recomputing one entry's hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashCheck {
    Match {
        encoding: EncodingVersion,
        /// True when the encoding was found by the fallback search.
        via_fallback: bool,
    },
    Mismatch {
        expected: String,
        actual: String,
    },
    UnknownEncoding(i64),
}

/// Build the canonical payload bytes for `encoding`.
pub fn canonical_payload(
    encoding: EncodingVersion,
    prev_hash: &str,
    fields: &EntryFields<'_>,
) -> LedgerResult<Vec<u8>> {
    match encoding {
        EncodingVersion::V2 => Ok(payload_v2(prev_hash, fields)),
        EncodingVersion::V1 => Ok(payload_v1(prev_hash, fields)),
        EncodingVersion::Unknown(v) => Err(LedgerError::Validation(format!(
            "unknown canonical encoding version {}",
            v
        ))),
    }
}

fn push_field(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn push_optional(buf: &mut Vec<u8>, bytes: Option<&[u8]>) {
    match bytes {
        Some(bytes) => {
            buf.push(1);
            push_field(buf, bytes);
        }
        None => buf.push(0),
    }
}

fn payload_v2(prev_hash: &str, fields: &EntryFields<'_>) -> Vec<u8> {
    let metadata = canonical_json(fields.metadata);
    let mut buf = Vec::with_capacity(128 + metadata.len());
    buf.extend_from_slice(V2_DOMAIN_TAG);
    push_field(&mut buf, prev_hash.as_bytes());
    push_field(&mut buf, fields.actor_id.as_bytes());
    push_field(&mut buf, fields.action.as_bytes());
    push_field(&mut buf, fields.resource_type.as_bytes());
    push_optional(&mut buf, fields.resource_id.map(str::as_bytes));
    push_field(&mut buf, metadata.as_bytes());
    push_field(&mut buf, &fields.timestamp.timestamp_micros().to_be_bytes());
    buf
}

fn escape_v1(value: &str) -> String {
    value.replace('\\', "\\\\").replace('|', "\\|")
}

fn payload_v1(prev_hash: &str, fields: &EntryFields<'_>) -> Vec<u8> {
    let resource_id = fields
        .resource_id
        .map(escape_v1)
        .unwrap_or_else(|| V1_ABSENT.to_string());
    [
        escape_v1(prev_hash),
        escape_v1(fields.actor_id),
        escape_v1(fields.action),
        escape_v1(fields.resource_type),
        resource_id,
        escape_v1(&canonical_json(fields.metadata)),
        fields
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Micros, true),
    ]
    .join("|")
    .into_bytes()
}

/// JSON with object keys sorted at every depth and no insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// HMAC-SHA256 over `payload`, hex encoded.
pub(crate) fn seal(secret: &Secret, payload: &[u8]) -> LedgerResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.expose())
        .map_err(|e| LedgerError::Secret(format!("invalid HMAC key: {}", e)))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn hashes_equal(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Computes and checks entry hashes. Secrets are always resolved by the pinned version.
#[derive(Clone)]
pub struct ChainHasher {
    secrets: SecretStore,
}

impl ChainHasher {
    pub fn new(secrets: SecretStore) -> Self {
        Self { secrets }
    }

    pub fn secrets(&self) -> &SecretStore {
        &self.secrets
    }

    /// Hash of an entry under `secret_version` and `encoding`, chained to `prev_hash`.
    pub async fn compute(
        &self,
        prev_hash: &str,
        fields: &EntryFields<'_>,
        secret_version: i64,
        encoding: EncodingVersion,
    ) -> LedgerResult<String> {
        let secret = self.secrets.get(Some(secret_version)).await?;
        self.compute_with(&secret, prev_hash, fields, encoding)
    }

    pub(crate) fn compute_with(
        &self,
        secret: &Secret,
        prev_hash: &str,
        fields: &EntryFields<'_>,
        encoding: EncodingVersion,
    ) -> LedgerResult<String> {
        seal(secret, &canonical_payload(encoding, prev_hash, fields)?)
    }

    /// Recompute `entry.hash` from its stored fields.
    ///
    /// Secret failures are returned as `Err(LedgerError::Secret)`; everything else is a
    /// [`HashCheck`] value.
    pub async fn check_entry(&self, entry: &AuditEntry) -> LedgerResult<HashCheck> {
        let secret = self.secrets.get(Some(entry.secret_version)).await?;
        let fields = EntryFields::from(entry);

        let (candidates, via_fallback): (Vec<EncodingVersion>, bool) = match entry.encoding_version {
            Some(EncodingVersion::Unknown(v)) => return Ok(HashCheck::UnknownEncoding(v)),
            Some(encoding) => (vec![encoding], false),
            None => (ENCODING_STRATEGIES.to_vec(), true),
        };

        let mut first_actual = None;
        for encoding in candidates {
            let actual = self.compute_with(&secret, &entry.prev_hash, &fields, encoding)?;
            if hashes_equal(&actual, &entry.hash) {
                return Ok(HashCheck::Match {
                    encoding,
                    via_fallback,
                });
            }
            first_actual.get_or_insert(actual);
        }

        Ok(HashCheck::Mismatch {
            expected: entry.hash.clone(),
            actual: first_actual.unwrap_or_default(),
        })
    }
}
