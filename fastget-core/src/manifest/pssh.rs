use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use super::{ManifestError, ManifestResult};

/// Fixed GUID identifying the Widevine DRM system inside a PSSH box.
pub const WIDEVINE_SYSTEM_ID: [u8; 16] = [
    0xed, 0xef, 0x8b, 0xa9, 0x79, 0xd6, 0x4a, 0xce, 0xa3, 0xc8, 0x27, 0xdc, 0xd5, 0x1d, 0x21,
    0xed,
];

/// Builds a version-0 Widevine PSSH box around a bare key id and returns it
/// base64-encoded. Used when a manifest advertises `cenc:default_KID` but no
/// `cenc:pssh` element.
pub fn pssh_from_kid(kid: &str) -> ManifestResult<String> {
    let cleaned: String = kid.trim().chars().filter(|c| *c != '-').collect();
    let bytes =
        hex::decode(&cleaned).map_err(|_| ManifestError::InvalidKid(kid.to_string()))?;
    if bytes.len() != 16 {
        return Err(ManifestError::InvalidKid(kid.to_string()));
    }
    let mut boxed = Vec::with_capacity(50);
    boxed.extend_from_slice(&[0x00, 0x00, 0x00, 0x32]);
    boxed.extend_from_slice(b"pssh");
    boxed.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    boxed.extend_from_slice(&WIDEVINE_SYSTEM_ID);
    boxed.extend_from_slice(&[0x00, 0x00, 0x00, 0x12]);
    boxed.extend_from_slice(&[0x12, 0x10]);
    boxed.extend_from_slice(&bytes);
    Ok(BASE64.encode(boxed))
}

/// Extracts the Widevine PSSH box from an `init.mp4` segment prefix. The box
/// size lives 9 bytes before the last system-id occurrence (the low byte of
/// the 32-bit box length), and the box itself starts 12 bytes before it.
pub fn pssh_from_init(data: &[u8]) -> Option<String> {
    let offset = data
        .windows(WIDEVINE_SYSTEM_ID.len())
        .rposition(|window| window == WIDEVINE_SYSTEM_ID)?;
    if offset < 12 {
        return None;
    }
    let size = data[offset - 9] as usize;
    if size == 0 {
        return None;
    }
    let start = offset - 12;
    let end = start.checked_add(size)?;
    if end > data.len() {
        return None;
    }
    Some(BASE64.encode(&data[start..end]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KID: &str = "12345678901234567890123456789012";

    #[test]
    fn pssh_from_kid_box_layout() {
        let encoded = pssh_from_kid(KID).unwrap();
        let decoded = BASE64.decode(encoded).unwrap();
        assert_eq!(decoded.len(), 50);
        assert_eq!(&decoded[4..8], b"pssh");
        assert_eq!(&decoded[12..28], &WIDEVINE_SYSTEM_ID);
        assert_eq!(&decoded[34..], hex::decode(KID).unwrap().as_slice());
    }

    #[test]
    fn pssh_from_kid_strips_hyphens() {
        let hyphenated = "12345678-9012-3456-7890-123456789012";
        assert_eq!(pssh_from_kid(hyphenated).unwrap(), pssh_from_kid(KID).unwrap());
    }

    #[test]
    fn pssh_from_kid_rejects_short_kid() {
        assert!(pssh_from_kid("abcd").is_err());
        assert!(pssh_from_kid("zz345678901234567890123456789012").is_err());
    }

    #[test]
    fn pssh_from_init_extracts_last_box() {
        let boxed = BASE64
            .decode(pssh_from_kid(KID).unwrap())
            .unwrap();
        let mut segment = vec![0u8; 64];
        segment.extend_from_slice(&boxed);
        segment.extend_from_slice(&[0u8; 16]);
        let extracted = pssh_from_init(&segment).unwrap();
        assert_eq!(BASE64.decode(extracted).unwrap(), boxed);
    }

    #[test]
    fn pssh_from_init_without_widevine_box() {
        assert_eq!(pssh_from_init(&[0u8; 128]), None);
    }
}
