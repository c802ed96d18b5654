//! AWS request signing
//!
//! Signature Version 4 for the multipart and download calls, and the legacy
//! `AWS key:signature` header form for single PUTs of small artifacts.

use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha1::Sha1;
use sha2::{Digest, Sha256};

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Every signed request carries exactly these headers
pub const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

/// Characters left as-is by AWS URI encoding
const URI_UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub fn amz_date(ts: &DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%SZ").to_string()
}

pub fn date_stamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y%m%d").to_string()
}

pub fn uri_encode(value: &str) -> String {
    utf8_percent_encode(value, URI_UNRESERVED).to_string()
}

pub fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Canonical request for the fixed signed-header set
///
/// `query` must already be in canonical form (sorted, encoded, `key=` for
/// valueless parameters).
pub fn canonical_request(
    method: &str,
    path: &str,
    query: &str,
    host: &str,
    payload_hash: &str,
    ts: &DateTime<Utc>,
) -> String {
    format!(
        "{method}\n{path}\n{query}\nhost:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{date}\n\n{SIGNED_HEADERS}\n{payload_hash}",
        date = amz_date(ts),
    )
}

#[derive(Debug, Clone)]
pub struct SigV4Signer {
    access_key: String,
    secret_key: String,
    region: String,
    service: String,
}

impl SigV4Signer {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        region: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            region: region.into(),
            service: service.into(),
        }
    }

    fn scope(&self, ts: &DateTime<Utc>) -> String {
        format!(
            "{}/{}/{}/aws4_request",
            date_stamp(ts),
            self.region,
            self.service
        )
    }

    /// date -> region -> service -> "aws4_request"
    pub fn signing_key(&self, ts: &DateTime<Utc>) -> Vec<u8> {
        let k_date = hmac_sha256(
            format!("AWS4{}", self.secret_key).as_bytes(),
            date_stamp(ts).as_bytes(),
        );
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        hmac_sha256(&k_service, b"aws4_request")
    }

    pub fn string_to_sign(&self, ts: &DateTime<Utc>, canonical_request: &str) -> String {
        format!(
            "{ALGORITHM}\n{}\n{}\n{}",
            amz_date(ts),
            self.scope(ts),
            hex_sha256(canonical_request.as_bytes())
        )
    }

    pub fn signature(&self, ts: &DateTime<Utc>, canonical_request: &str) -> String {
        let key = self.signing_key(ts);
        hex::encode(hmac_sha256(
            &key,
            self.string_to_sign(ts, canonical_request).as_bytes(),
        ))
    }

    /// Value of the `Authorization` header
    pub fn authorization(&self, ts: &DateTime<Utc>, canonical_request: &str) -> String {
        format!(
            "{ALGORITHM} Credential={}/{},SignedHeaders={SIGNED_HEADERS},Signature={}",
            self.access_key,
            self.scope(ts),
            self.signature(ts, canonical_request)
        )
    }
}

/// Legacy header auth: base64(HMAC-SHA1(secret, string-to-sign))
pub fn legacy_authorization(access_key: &str, secret_key: &str, string_to_sign: &str) -> String {
    let mut mac =
        Hmac::<Sha1>::new_from_slice(secret_key.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(string_to_sign.as_bytes());
    let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
    format!("AWS {}:{}", access_key, signature)
}
