/*!
Disk-backed pixel storage.

Persisted channel images let a session drop its pixel buffers under memory
pressure and reload them on demand. [`DirectoryStore`] writes each channel as
raw little-endian ARGB words next to a small JSON header.
*/

use crate::error::{Result, SharedError};
use crate::session::PixelBuffer;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Pixel format tag written into every header
const PIXEL_FORMAT: &str = "argb32le";

/// Storage backend for channel images
pub trait PixelStore: Send + Sync {
    /// Store `buffer` for channel slot `slot` of the session identified by `key`.
    /// Returns the name to load it back with.
    fn save(&self, key: &str, slot: usize, channel: u8, buffer: &PixelBuffer) -> Result<String>;

    /// Load a buffer previously returned by [`PixelStore::save`]
    fn load(&self, name: &str) -> Result<PixelBuffer>;
}

/// Header stored alongside the raw pixel data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredImageHeader {
    pub width: usize,
    pub height: usize,
    pub slot: usize,
    pub channel: u8,
    pub format: String,
}

/// Stores images as `<name>.argb` + `<name>.json` files in one directory
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Open (and create if needed) a store rooted at `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pixel_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.argb", name))
    }

    fn header_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.json", name))
    }

    /// Read only the header of a stored image
    pub fn header(&self, name: &str) -> Result<StoredImageHeader> {
        let content = std::fs::read(self.header_path(name))?;
        Ok(serde_json::from_slice(&content)?)
    }
}

impl PixelStore for DirectoryStore {
    fn save(&self, key: &str, slot: usize, channel: u8, buffer: &PixelBuffer) -> Result<String> {
        let name = format!("{}_ch{}", key, slot);

        let header = StoredImageHeader {
            width: buffer.width(),
            height: buffer.height(),
            slot,
            channel,
            format: PIXEL_FORMAT.to_string(),
        };
        std::fs::write(self.header_path(&name), serde_json::to_vec_pretty(&header)?)?;

        let bytes: Vec<u8> = buffer
            .pixels()
            .iter()
            .flat_map(|pixel| pixel.to_le_bytes())
            .collect();
        std::fs::write(self.pixel_path(&name), bytes)?;

        debug!("Stored {} ({}x{})", name, buffer.width(), buffer.height());
        Ok(name)
    }

    fn load(&self, name: &str) -> Result<PixelBuffer> {
        let header = self.header(name)?;
        if header.format != PIXEL_FORMAT {
            return Err(SharedError::invalid_stored_image(format!(
                "{} has unsupported pixel format {}",
                name, header.format
            )));
        }

        let bytes = std::fs::read(self.pixel_path(name))?;
        if bytes.len() % 4 != 0 {
            return Err(SharedError::invalid_stored_image(format!(
                "{} holds {} bytes, not a whole number of pixels",
                name,
                bytes.len()
            )));
        }

        let pixels = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        PixelBuffer::from_pixels(header.width, header.height, pixels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::new(dir.path().join("images")).unwrap();

        let mut buffer = PixelBuffer::new(2, 2);
        buffer.write_row(0, &[0xFF01_0203, 0xFFFF_FFFF]).unwrap();
        buffer.write_row(1, &[0x1234_5678, 0]).unwrap();

        let name = store.save("0000002A", 1, 3, &buffer).unwrap();
        assert_eq!(name, "0000002A_ch1");

        let header = store.header(&name).unwrap();
        assert_eq!(header.channel, 3);
        assert_eq!(header.slot, 1);
        assert_eq!((header.width, header.height), (2, 2));

        assert_eq!(store.load(&name).unwrap(), buffer);
    }

    #[test]
    fn test_load_missing_image() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::new(dir.path()).unwrap();
        assert!(matches!(store.load("nope"), Err(SharedError::Io(_))));
    }

    #[test]
    fn test_truncated_pixels_rejected() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::new(dir.path()).unwrap();
        let name = store.save("frame", 0, 0, &PixelBuffer::new(2, 1)).unwrap();

        std::fs::write(dir.path().join(format!("{}.argb", name)), [0u8; 6]).unwrap();
        assert!(matches!(
            store.load(&name),
            Err(SharedError::InvalidStoredImage(_))
        ));
    }

    #[test]
    fn test_oversized_header_rejected() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::new(dir.path()).unwrap();
        let name = store.save("frame", 0, 0, &PixelBuffer::new(2, 1)).unwrap();

        let header = format!(
            r#"{{"width": {}, "height": 2, "slot": 0, "channel": 0, "format": "{}"}}"#,
            usize::MAX,
            PIXEL_FORMAT
        );
        std::fs::write(dir.path().join(format!("{}.json", name)), header).unwrap();
        assert!(matches!(
            store.load(&name),
            Err(SharedError::InvalidStoredImage(_))
        ));
    }
}
