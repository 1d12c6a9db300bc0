//! Shared authentication plumbing: cached bearer tokens, Netscape cookie
//! jars for refresh-token flows, and encrypted playback-token decryption.

use std::fs;
use std::path::Path;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::config::{load_profile, save_profile, AuthCache, Profile};
use crate::service::{ServiceError, ServiceResult};

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Returns the cached bearer token from `profile.yaml` when it has not
/// expired yet.
pub fn cached_bearer(profile_path: &Path, now: DateTime<Utc>) -> Option<String> {
    let profile = load_profile(profile_path).ok().flatten()?;
    let cache = profile.auth_cache?;
    if cache.expired(now) {
        return None;
    }
    Some(cache.token)
}

/// Writes a freshly exchanged bearer token back into the profile, keeping
/// stored credentials intact. Failures only warn; the run already holds the
/// token in memory.
pub fn store_bearer(
    profile_path: &Path,
    token: &str,
    lifetime_seconds: i64,
    refresh: Option<String>,
) {
    let mut profile = load_profile(profile_path)
        .ok()
        .flatten()
        .unwrap_or_else(Profile::default);
    profile.auth_cache = Some(AuthCache {
        token: token.to_string(),
        expiry: Utc::now() + Duration::seconds(lifetime_seconds),
        refresh,
    });
    if let Err(err) = save_profile(profile_path, &profile) {
        warn!(error = %err, "failed to persist auth cache");
    }
}

pub fn stored_credentials(profile_path: &Path) -> Option<(String, String)> {
    let profile = load_profile(profile_path).ok().flatten()?;
    Some((profile.username?, profile.password?))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetscapeCookie {
    pub domain: String,
    pub include_subdomains: bool,
    pub path: String,
    pub secure: bool,
    pub expiry: Option<i64>,
    pub name: String,
    pub value: String,
}

/// Parses a Netscape-format cookie jar. `#HttpOnly_` prefixed lines are
/// cookies, everything else starting with `#` is a comment.
pub fn parse_netscape_jar(text: &str) -> Vec<NetscapeCookie> {
    let mut cookies = Vec::new();
    for raw in text.lines() {
        let line = raw.strip_prefix("#HttpOnly_").unwrap_or(raw);
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 7 {
            continue;
        }
        cookies.push(NetscapeCookie {
            domain: fields[0].to_string(),
            include_subdomains: fields[1].eq_ignore_ascii_case("TRUE"),
            path: fields[2].to_string(),
            secure: fields[3].eq_ignore_ascii_case("TRUE"),
            expiry: match fields[4].parse::<i64>() {
                Ok(0) => None,
                Ok(value) => Some(value),
                Err(_) => None,
            },
            name: fields[5].to_string(),
            value: fields[6].to_string(),
        });
    }
    cookies
}

/// Extracts a named cookie from a jar on disk, rejecting the run when the
/// cookie is missing or already expired.
pub fn refresh_token_from_jar(
    path: &Path,
    cookie_name: &str,
    now: DateTime<Utc>,
) -> ServiceResult<String> {
    let text = fs::read_to_string(path).map_err(|source| ServiceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let cookie = parse_netscape_jar(&text)
        .into_iter()
        .find(|cookie| cookie.name == cookie_name)
        .ok_or_else(|| {
            ServiceError::AuthExpired(format!(
                "no {cookie_name} cookie in {}",
                path.display()
            ))
        })?;
    if let Some(expiry) = cookie.expiry {
        if expiry <= now.timestamp() {
            return Err(ServiceError::AuthExpired(format!(
                "{cookie_name} cookie expired, refresh the exported jar"
            )));
        }
    }
    Ok(cookie.value)
}

/// Decrypts an opaque playback token: AES-CBC with a service-fixed key/IV,
/// PKCS#7 padding, and two trailing bytes of service noise stripped.
pub fn decrypt_playback_token(key: &[u8], iv: &[u8], token_b64: &str) -> ServiceResult<String> {
    let data = BASE64
        .decode(token_b64.trim())
        .map_err(|err| ServiceError::InvalidToken(err.to_string()))?;
    let mut buffer = data;
    let plain: &[u8] = match key.len() {
        16 => Aes128CbcDec::new_from_slices(key, iv)
            .map_err(|err| ServiceError::InvalidToken(err.to_string()))?
            .decrypt_padded_mut::<Pkcs7>(&mut buffer)
            .map_err(|err| ServiceError::InvalidToken(err.to_string()))?,
        32 => Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|err| ServiceError::InvalidToken(err.to_string()))?
            .decrypt_padded_mut::<Pkcs7>(&mut buffer)
            .map_err(|err| ServiceError::InvalidToken(err.to_string()))?,
        other => {
            return Err(ServiceError::InvalidToken(format!(
                "unsupported key length {other}"
            )))
        }
    };
    let cut = plain.len().saturating_sub(2);
    let text = std::str::from_utf8(&plain[..cut])
        .map_err(|err| ServiceError::InvalidToken(err.to_string()))?;
    Ok(text.to_string())
}

/// Splits a decrypted `license_api|bearer` pair.
pub fn split_token_pair(decrypted: &str) -> ServiceResult<(String, String)> {
    let mut parts = decrypted.splitn(2, '|');
    match (parts.next(), parts.next()) {
        (Some(api), Some(bearer)) if !api.is_empty() && !bearer.is_empty() => {
            Ok((api.to_string(), bearer.to_string()))
        }
        _ => Err(ServiceError::InvalidToken(
            "expected license_api|bearer pair".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncryptMut;

    type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

    const JAR: &str = "# Netscape HTTP Cookie File\n\
# This is a generated file! Do not edit.\n\
\n\
.example.com\tTRUE\t/\tFALSE\t4102444800\trefresh_token\tr-abc123\n\
#HttpOnly_.example.com\tTRUE\t/\tTRUE\t4102444800\tsession\ts-xyz\n\
.example.com\tTRUE\t/\tFALSE\t100\tstale\told\n";

    #[test]
    fn parses_jar_including_httponly_rows() {
        let cookies = parse_netscape_jar(JAR);
        assert_eq!(cookies.len(), 3);
        assert_eq!(cookies[0].name, "refresh_token");
        assert_eq!(cookies[1].name, "session");
        assert!(cookies[1].secure);
    }

    #[test]
    fn refresh_token_expiry_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.txt");
        fs::write(&path, JAR).unwrap();

        let token = refresh_token_from_jar(&path, "refresh_token", Utc::now()).unwrap();
        assert_eq!(token, "r-abc123");

        let err = refresh_token_from_jar(&path, "stale", Utc::now()).unwrap_err();
        assert!(matches!(err, ServiceError::AuthExpired(_)));

        let err = refresh_token_from_jar(&path, "absent", Utc::now()).unwrap_err();
        assert!(matches!(err, ServiceError::AuthExpired(_)));
    }

    #[test]
    fn playback_token_round_trip() {
        let key = b"0123456789abcdef";
        let iv = b"fedcba9876543210";
        // Two bytes of trailing noise ahead of the PKCS#7 padding, as the
        // services emit.
        let plain = b"https://lic.example.com/wv|bearer-token-value##";
        let mut buffer = plain.to_vec();
        let padded_len = (buffer.len() / 16 + 1) * 16;
        buffer.resize(padded_len, 0);
        let encrypted = Aes128CbcEnc::new_from_slices(key, iv)
            .unwrap()
            .encrypt_padded_mut::<Pkcs7>(&mut buffer, plain.len())
            .unwrap()
            .to_vec();
        let token = BASE64.encode(encrypted);

        let decrypted = decrypt_playback_token(key, iv, &token).unwrap();
        assert_eq!(decrypted, "https://lic.example.com/wv|bearer-token-value");
        let (api, bearer) = split_token_pair(&decrypted).unwrap();
        assert_eq!(api, "https://lic.example.com/wv");
        assert_eq!(bearer, "bearer-token-value");
    }

    #[test]
    fn bearer_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.yaml");
        assert_eq!(cached_bearer(&path, Utc::now()), None);

        store_bearer(&path, "tok-1", 3600, None);
        assert_eq!(cached_bearer(&path, Utc::now()).as_deref(), Some("tok-1"));

        store_bearer(&path, "tok-2", -10, None);
        assert_eq!(cached_bearer(&path, Utc::now()), None);
    }
}
