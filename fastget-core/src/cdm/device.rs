//! Widevine device files.
//!
//! A `.wvd` file is a small container bundling the device private key and
//! client identification blob. When only the raw `.pem`/`.bin` pair is
//! present the device is synthesized once and persisted for later runs.

use std::fs;
use std::path::{Path, PathBuf};

use super::{CdmError, CdmResult};

const WVD_MAGIC: &[u8; 3] = b"WVD";
const WVD_VERSION: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Chrome,
    Android,
}

impl DeviceType {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => DeviceType::Chrome,
            _ => DeviceType::Android,
        }
    }

    fn as_raw(self) -> u8 {
        match self {
            DeviceType::Chrome => 1,
            DeviceType::Android => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WidevineDevice {
    pub device_type: DeviceType,
    pub security_level: u8,
    pub private_key: Vec<u8>,
    pub client_id: Vec<u8>,
}

impl WidevineDevice {
    pub fn from_wvd(bytes: &[u8]) -> CdmResult<Self> {
        if bytes.len() < 9 || &bytes[0..3] != WVD_MAGIC {
            return Err(CdmError::InvalidDevice("bad magic".to_string()));
        }
        if bytes[3] != WVD_VERSION {
            return Err(CdmError::InvalidDevice(format!(
                "unsupported wvd version {}",
                bytes[3]
            )));
        }
        let device_type = DeviceType::from_raw(bytes[4]);
        let security_level = bytes[5];
        // bytes[6] carries flags, currently unused.
        let mut cursor = 7usize;
        let private_key = read_block(bytes, &mut cursor)?;
        let client_id = read_block(bytes, &mut cursor)?;
        Ok(Self {
            device_type,
            security_level,
            private_key,
            client_id,
        })
    }

    pub fn to_wvd(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(7 + 4 + self.private_key.len() + self.client_id.len());
        out.extend_from_slice(WVD_MAGIC);
        out.push(WVD_VERSION);
        out.push(self.device_type.as_raw());
        out.push(self.security_level);
        out.push(0);
        out.extend_from_slice(&(self.private_key.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.private_key);
        out.extend_from_slice(&(self.client_id.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.client_id);
        out
    }

    /// Loads the first `.wvd` under `dir`. Without one, synthesizes a device
    /// from a paired `.pem` private key and `.bin` client id blob and
    /// persists it as `device.wvd` for reuse. Raises *cdm-unavailable* when
    /// neither is possible.
    pub fn load_or_synthesize(dir: &Path) -> CdmResult<(Self, PathBuf)> {
        if let Some(path) = find_by_extension(dir, "wvd") {
            let bytes = fs::read(&path).map_err(|source| CdmError::Io {
                path: path.clone(),
                source,
            })?;
            let device = Self::from_wvd(&bytes)?;
            return Ok((device, path));
        }

        let pem = find_by_extension(dir, "pem");
        let bin = find_by_extension(dir, "bin");
        let (pem, bin) = match (pem, bin) {
            (Some(pem), Some(bin)) => (pem, bin),
            _ => {
                return Err(CdmError::Unavailable {
                    dir: dir.to_path_buf(),
                    detail: "no .wvd device file and no .pem/.bin pair to synthesize one"
                        .to_string(),
                })
            }
        };
        let private_key = fs::read(&pem).map_err(|source| CdmError::Io {
            path: pem.clone(),
            source,
        })?;
        let client_id = fs::read(&bin).map_err(|source| CdmError::Io {
            path: bin.clone(),
            source,
        })?;
        let device = Self {
            device_type: DeviceType::Android,
            security_level: 3,
            private_key,
            client_id,
        };
        let path = dir.join("device.wvd");
        fs::write(&path, device.to_wvd()).map_err(|source| CdmError::Io {
            path: path.clone(),
            source,
        })?;
        Ok((device, path))
    }
}

fn read_block(bytes: &[u8], cursor: &mut usize) -> CdmResult<Vec<u8>> {
    let header_end = cursor
        .checked_add(2)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| CdmError::InvalidDevice("truncated block header".to_string()))?;
    let len = u16::from_be_bytes([bytes[*cursor], bytes[*cursor + 1]]) as usize;
    let end = header_end
        .checked_add(len)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| CdmError::InvalidDevice("truncated block body".to_string()))?;
    let block = bytes[header_end..end].to_vec();
    *cursor = end;
    Ok(block)
}

fn find_by_extension(dir: &Path, extension: &str) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .map(|ext| ext.eq_ignore_ascii_case(extension))
                .unwrap_or(false)
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wvd_round_trip() {
        let device = WidevineDevice {
            device_type: DeviceType::Android,
            security_level: 3,
            private_key: b"private-key-material".to_vec(),
            client_id: b"client-id-blob".to_vec(),
        };
        let parsed = WidevineDevice::from_wvd(&device.to_wvd()).unwrap();
        assert_eq!(parsed.device_type, DeviceType::Android);
        assert_eq!(parsed.security_level, 3);
        assert_eq!(parsed.private_key, device.private_key);
        assert_eq!(parsed.client_id, device.client_id);
    }

    #[test]
    fn rejects_foreign_files() {
        assert!(WidevineDevice::from_wvd(b"not a device").is_err());
        assert!(WidevineDevice::from_wvd(b"WVD\x09\x02\x03\x00").is_err());
    }

    #[test]
    fn synthesizes_and_persists_from_pair() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("device_private_key.pem"), b"pem bytes").unwrap();
        fs::write(dir.path().join("device_client_id_blob.bin"), b"bin bytes").unwrap();

        let (device, path) = WidevineDevice::load_or_synthesize(dir.path()).unwrap();
        assert_eq!(device.private_key, b"pem bytes");
        assert_eq!(device.client_id, b"bin bytes");
        assert!(path.ends_with("device.wvd"));

        // Second call loads the persisted file back identically.
        let (reloaded, reloaded_path) = WidevineDevice::load_or_synthesize(dir.path()).unwrap();
        assert_eq!(reloaded.private_key, device.private_key);
        assert_eq!(reloaded.client_id, device.client_id);
        assert_eq!(reloaded_path, path);
    }

    #[test]
    fn missing_device_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = WidevineDevice::load_or_synthesize(dir.path()).unwrap_err();
        assert!(matches!(err, CdmError::Unavailable { .. }));
    }
}
