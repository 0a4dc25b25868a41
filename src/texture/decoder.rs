use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::error::DecodeError;

/// Tightly packed RGBA8 pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl DecodedImage {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, DecodeError> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || pixels.len() != expected {
            return Err(DecodeError::InvalidDimensions {
                width,
                height,
                len: pixels.len(),
            });
        }

        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn solid_color(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let pixel_count = width as usize * height as usize;
        let mut pixels = Vec::with_capacity(pixel_count * 4);
        for _ in 0..pixel_count {
            pixels.extend_from_slice(&rgba);
        }
        Self {
            width,
            height,
            pixels,
        }
    }
}

/// Turns a resource key into pixels.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, key: &str) -> Result<DecodedImage, DecodeError>;
}

impl<F> ImageDecoder for F
where
    F: Fn(&str) -> Result<DecodedImage, DecodeError> + Send + Sync,
{
    fn decode(&self, key: &str) -> Result<DecodedImage, DecodeError> {
        self(key)
    }
}

/// Decodes image files from disk, optionally relative to a root directory.
#[derive(Debug, Clone, Default)]
pub struct FileDecoder {
    root: Option<PathBuf>,
}

impl FileDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, key: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(key),
            None => PathBuf::from(key),
        }
    }
}

impl ImageDecoder for FileDecoder {
    fn decode(&self, key: &str) -> Result<DecodedImage, DecodeError> {
        let path = self.resolve(key);
        if !path.is_file() {
            return Err(DecodeError::NotFound(path.display().to_string()));
        }
        let rgba = image::open(&path)?.to_rgba8();
        let (width, height) = rgba.dimensions();
        DecodedImage::new(width, height, rgba.into_raw())
    }
}

/// In-memory images keyed by name; counts decode calls.
#[derive(Debug, Default)]
pub struct MemoryDecoder {
    images: RwLock<HashMap<String, DecodedImage>>,
    decodes: AtomicUsize,
}

impl MemoryDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, image: DecodedImage) {
        self.images.write().insert(key.into(), image);
    }

    pub fn with_image(self, key: impl Into<String>, image: DecodedImage) -> Self {
        self.insert(key, image);
        self
    }

    /// Number of decode attempts, successful or not.
    pub fn decode_count(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }
}

impl ImageDecoder for MemoryDecoder {
    fn decode(&self, key: &str) -> Result<DecodedImage, DecodeError> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        self.images
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| DecodeError::NotFound(key.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_pixel_data() {
        let result = DecodedImage::new(2, 2, vec![0; 15]);
        assert!(matches!(
            result,
            Err(DecodeError::InvalidDimensions { len: 15, .. })
        ));
        assert!(DecodedImage::new(0, 4, Vec::new()).is_err());
    }

    #[test]
    fn solid_color_fills_every_texel() {
        let image = DecodedImage::solid_color(3, 2, [255, 255, 0, 255]);
        assert_eq!(image.pixels.len(), 24);
        assert!(image.pixels.chunks(4).all(|p| p == [255, 255, 0, 255]));
    }

    #[test]
    fn missing_file_is_not_found() {
        let decoder = FileDecoder::with_root(std::env::temp_dir());
        let err = decoder.decode("frameloom-definitely-missing.png").unwrap_err();
        assert!(matches!(err, DecodeError::NotFound(_)));
    }

    #[test]
    fn decodes_png_from_disk() {
        let dir = std::env::temp_dir().join(format!("frameloom-decoder-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("checker.png");
        image::RgbaImage::from_pixel(4, 3, image::Rgba([10, 20, 30, 255]))
            .save(&path)
            .unwrap();

        let decoded = FileDecoder::with_root(&dir).decode("checker.png").unwrap();
        assert_eq!((decoded.width, decoded.height), (4, 3));
        assert_eq!(&decoded.pixels[..4], &[10, 20, 30, 255]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn memory_decoder_counts_attempts() {
        let decoder =
            MemoryDecoder::new().with_image("a", DecodedImage::solid_color(1, 1, [0; 4]));
        assert!(decoder.decode("a").is_ok());
        assert!(decoder.decode("b").is_err());
        assert_eq!(decoder.decode_count(), 2);
    }

    #[test]
    fn closures_are_decoders() {
        let decoder = |key: &str| -> Result<DecodedImage, DecodeError> {
            Err(DecodeError::NotFound(key.to_owned()))
        };
        assert!(decoder.decode("x").is_err());
    }
}
