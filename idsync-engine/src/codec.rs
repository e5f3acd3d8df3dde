//! Wire format for the identity service.
//!
//! Builds sync and opt-out URLs and decodes sync responses. Everything here
//! is pure: no state, no I/O.
//!
//! Query values are percent-encoded exactly once. Characters that are legal
//! in a query (`@`, `:`, `/`, ...) stay literal so org ids such as
//! `testOrg@AdobeOrg` are sent as-is, and a `%` already present in a value is
//! encoded as `%25` rather than passed through.

use crate::error::CodecError;
use idsync_types::{AD_ID_TYPE, CustomIdentity, IdentityRecord, PrimaryId, Timestamp};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use std::collections::BTreeMap;
use url::Url;

/// Path of the sync endpoint.
pub const SYNC_PATH: &str = "/id";
/// Path of the opt-out endpoint.
pub const OPT_OUT_PATH: &str = "/demoptout.jpg";
/// Separator between the fields of `d_cid_ic` and `d_cid` values.
pub const CID_DELIMITER: char = '\u{1}';
/// External id namespace carrying the push token.
pub const PUSH_DPID: &str = "20920";

/// Query parameter names.
pub mod keys {
    pub const ORG_ID: &str = "d_orgid";
    pub const PRIMARY_ID: &str = "d_mid";
    pub const BLOB: &str = "d_blob";
    pub const LOCATION_HINT: &str = "dcs_region";
    pub const CUSTOM_ID: &str = "d_cid_ic";
    pub const EXTERNAL_ID: &str = "d_cid";
    pub const DEVICE_CONSENT: &str = "device_consent";
    pub const CONSENT_INTEGRATION_CODE: &str = "d_consent_ic";
    pub const VISITOR_PAYLOAD: &str = "adobe_mc";
    pub const ANALYTICS_VISITOR_ID: &str = "adobe_aa_vid";
}

/// Encoded in query values: everything except unreserved characters and
/// the sub-delimiters a query may carry literally. `&`, `=`, `+`, `#`, `%`
/// and `'` are always encoded.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'@')
    .remove(b':')
    .remove(b'/')
    .remove(b'!')
    .remove(b'$')
    .remove(b'(')
    .remove(b')')
    .remove(b'*')
    .remove(b',')
    .remove(b';');

/// Accumulates `name=value` pairs with single-pass encoding.
struct QueryBuilder {
    query: String,
}

impl QueryBuilder {
    fn new() -> Self {
        Self { query: String::new() }
    }

    fn push(&mut self, name: &str, value: &str) -> &mut Self {
        if !self.query.is_empty() {
            self.query.push('&');
        }
        self.query.push_str(name);
        self.query.push('=');
        self.query.extend(utf8_percent_encode(value, QUERY_VALUE));
        self
    }

    fn into_url(self, server: &str, path: &str) -> Result<Url, CodecError> {
        Ok(Url::parse(&format!("https://{server}{path}?{}", self.query))?)
    }
}

/// Value of a `d_cid_ic` parameter: `type 0x01 identifier 0x01 auth`.
///
/// An absent identifier leaves its segment empty between the delimiters.
fn custom_id_value(identity: &CustomIdentity) -> String {
    format!(
        "{}{CID_DELIMITER}{}{CID_DELIMITER}{}",
        identity.id_type,
        identity.identifier_str(),
        identity.authentication_state.code()
    )
}

/// Builds the identity sync URL for `record`.
///
/// Parameter order: fixed header, org id, primary id, blob, location hint,
/// one `d_cid_ic` per custom identity, one `d_cid` per external id (sorted by
/// key), then the consent flag when requested.
pub fn build_sync_url(
    server: &str,
    org_id: &str,
    record: &IdentityRecord,
    external_ids: &BTreeMap<String, String>,
    include_consent_flag: bool,
) -> Result<Url, CodecError> {
    let mut query = QueryBuilder::new();
    query
        .push("d_rtbd", "json")
        .push("d_ver", "2")
        .push(keys::ORG_ID, org_id);

    if let Some(primary_id) = &record.primary_id {
        query.push(keys::PRIMARY_ID, primary_id.as_str());
    }
    if let Some(blob) = &record.blob {
        query.push(keys::BLOB, blob);
    }
    if let Some(hint) = &record.location_hint {
        query.push(keys::LOCATION_HINT, hint);
    }
    for identity in &record.custom_identities {
        query.push(keys::CUSTOM_ID, &custom_id_value(identity));
    }
    for (namespace, value) in external_ids {
        query.push(keys::EXTERNAL_ID, &format!("{namespace}{CID_DELIMITER}{value}"));
    }

    if include_consent_flag {
        let has_ad_id = record.advertising_id.as_deref().is_some_and(|ad| !ad.is_empty());
        query.push(keys::DEVICE_CONSENT, if has_ad_id { "1" } else { "0" });
        if !has_ad_id {
            query.push(keys::CONSENT_INTEGRATION_CODE, AD_ID_TYPE);
        }
    }

    query.into_url(server, SYNC_PATH)
}

/// Builds the one-shot opt-out URL.
pub fn build_opt_out_url(
    server: &str,
    org_id: &str,
    primary_id: &PrimaryId,
) -> Result<Url, CodecError> {
    let mut query = QueryBuilder::new();
    query
        .push(keys::ORG_ID, org_id)
        .push(keys::PRIMARY_ID, primary_id.as_str());
    query.into_url(server, OPT_OUT_PATH)
}

/// Decoded sync response. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncResponse {
    pub primary_id: Option<String>,
    pub blob: Option<String>,
    pub location_hint: Option<String>,
    pub ttl_seconds: Option<u64>,
    pub error_message: Option<String>,
    pub opt_out_namespaces: Vec<String>,
}

#[derive(Deserialize)]
struct RawSyncResponse {
    #[serde(default)]
    d_mid: Option<String>,
    #[serde(default)]
    d_blob: Option<String>,
    #[serde(default)]
    dcs_region: Option<serde_json::Value>,
    #[serde(default)]
    id_sync_ttl: Option<serde_json::Number>,
    #[serde(default)]
    error_msg: Option<String>,
    #[serde(default)]
    d_optout: Option<Vec<String>>,
}

/// Parses a sync response body. Unknown keys are ignored.
///
/// A body that is not a JSON object of the expected shape fails with
/// [`CodecError::DecodeFailed`]; no partial result is returned.
pub fn parse_sync_response(bytes: &[u8]) -> Result<SyncResponse, CodecError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| CodecError::DecodeFailed(e.to_string()))?;
    if !value.is_object() {
        return Err(CodecError::DecodeFailed(format!(
            "expected a JSON object, got {value}"
        )));
    }
    let raw: RawSyncResponse =
        serde_json::from_value(value).map_err(|e| CodecError::DecodeFailed(e.to_string()))?;

    let location_hint = match raw.dcs_region {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(other) => {
            return Err(CodecError::DecodeFailed(format!(
                "dcs_region must be a number, got {other}"
            )));
        }
    };

    Ok(SyncResponse {
        primary_id: raw.d_mid,
        blob: raw.d_blob,
        location_hint,
        ttl_seconds: raw.id_sync_ttl.as_ref().and_then(whole_seconds),
        error_message: raw.error_msg,
        opt_out_namespaces: raw.d_optout.unwrap_or_default(),
    })
}

/// Whole seconds of a TTL. Negative, non-finite or out-of-range values are
/// treated as absent.
fn whole_seconds(ttl: &serde_json::Number) -> Option<u64> {
    if let Some(secs) = ttl.as_u64() {
        return Some(secs);
    }
    ttl.as_f64()
        .filter(|secs| secs.is_finite() && *secs >= 0.0 && *secs < u64::MAX as f64)
        .map(|secs| secs.trunc() as u64)
}

/// Inputs for the visitor payload appended to outbound URLs.
#[derive(Debug, Clone, Default)]
pub struct VisitorInfo<'a> {
    pub primary_id: Option<&'a PrimaryId>,
    pub org_id: Option<&'a str>,
    pub analytics_id: Option<&'a str>,
    pub visitor_id: Option<&'a str>,
}

/// Builds `adobe_mc=<TS|MCMID|MCAID|MCORGID>` plus `adobe_aa_vid` when a
/// visitor id is known. Both values are URL-encoded.
#[must_use]
pub fn visitor_id_payload(info: &VisitorInfo<'_>, now: Timestamp) -> String {
    let mut fields: Vec<String> = vec![format!("TS={}", now.as_secs())];
    let mut push = |key: &str, value: Option<&str>| {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            fields.push(format!("{key}={value}"));
        }
    };
    push("MCMID", info.primary_id.map(PrimaryId::as_str));
    push("MCAID", info.analytics_id);
    push("MCORGID", info.org_id);

    let mut payload = format!(
        "{}={}",
        keys::VISITOR_PAYLOAD,
        urlencoding::encode(&fields.join("|"))
    );
    if let Some(vid) = info.visitor_id.filter(|v| !v.is_empty()) {
        payload.push('&');
        payload.push_str(keys::ANALYTICS_VISITOR_ID);
        payload.push('=');
        payload.push_str(&urlencoding::encode(vid));
    }
    payload
}

/// Inserts `payload` into `base_url` as query parameters, ahead of any
/// fragment. An empty base URL is returned unchanged.
#[must_use]
pub fn append_visitor_info(base_url: &str, payload: &str) -> String {
    if base_url.is_empty() {
        return String::new();
    }

    let query = base_url.find('?');
    let anchor = base_url.find('#').filter(|&i| i > 0);
    let insert_at = anchor.unwrap_or(base_url.len());
    let query_after_anchor = matches!((anchor, query), (Some(a), Some(q)) if a < q);

    let separator = match query {
        _ if query_after_anchor => "?",
        None => "?",
        Some(q) if q > 0 && q != base_url.len() - 1 => "&",
        Some(_) => "",
    };

    let mut out = String::with_capacity(base_url.len() + payload.len() + 1);
    out.push_str(&base_url[..insert_at]);
    out.push_str(separator);
    out.push_str(payload);
    out.push_str(&base_url[insert_at..]);
    out
}
