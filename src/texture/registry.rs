use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
#[cfg(feature = "parallel")]
use rayon::prelude::*;

use super::{DecodedImage, DescriptorArray, ImageDecoder};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::gpu::{DescriptorHandle, RenderBackend};

/// Shader-visible index into the bindless texture array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureSlot(u32);

impl TextureSlot {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for TextureSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "texture {}", self.0)
    }
}

/// Append-only mapping from resource keys to texture slots.
///
/// Organic slots are handed out in `[0, capacity - 1)`. The last slot is the
/// placeholder sentinel returned for keys that fail to decode; every slot that
/// has no texture of its own also points at the placeholder, so any index a
/// shader reads is well-defined.
///
/// Lookups of known keys only take a shared lock. Loads of different keys run
/// in parallel and meet only at the slot counter and the map insert; loads of
/// the same key are funnelled through a per-key gate so the image is decoded
/// and uploaded once.
pub struct TextureRegistry<B: RenderBackend> {
    backend: Arc<B>,
    decoder: Arc<dyn ImageDecoder>,
    next_slot: AtomicU32,
    lookup: RwLock<HashMap<String, TextureSlot>>,
    load_gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    textures: Box<[OnceLock<B::Texture>]>,
    placeholder: Option<B::Texture>,
    descriptors: DescriptorArray,
    generation: AtomicU64,
    capacity: usize,
}

impl<B: RenderBackend> TextureRegistry<B> {
    /// Uploads the placeholder image and points every descriptor at it.
    pub fn new(
        backend: Arc<B>,
        decoder: Arc<dyn ImageDecoder>,
        config: &EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let capacity = config.textures_max;

        let image = DecodedImage::solid_color(
            config.placeholder_extent,
            config.placeholder_extent,
            config.placeholder_color,
        );
        let placeholder = backend.upload_texture(&image)?;
        let descriptors = DescriptorArray::new(capacity, backend.texture_descriptor(&placeholder));

        log::info!(
            "Texture registry created: {} slots, placeholder at slot {}",
            capacity,
            capacity - 1
        );

        Ok(Self {
            backend,
            decoder,
            next_slot: AtomicU32::new(0),
            lookup: RwLock::new(HashMap::new()),
            load_gates: Mutex::new(HashMap::new()),
            textures: (0..capacity - 1).map(|_| OnceLock::new()).collect(),
            placeholder: Some(placeholder),
            descriptors,
            generation: AtomicU64::new(0),
            capacity,
        })
    }

    /// Returns the slot of `key`, decoding and uploading it on first use.
    ///
    /// Keys that fail to decode resolve to [`Self::placeholder_slot`] without
    /// consuming a slot. Running out of slots is fatal.
    pub fn register_or_get(&self, key: &str) -> Result<TextureSlot> {
        if let Some(slot) = self.lookup(key) {
            return Ok(slot);
        }

        let gate = self
            .load_gates
            .lock()
            .entry(key.to_owned())
            .or_default()
            .clone();
        let _loading = gate.lock();

        // Another caller may have finished loading while we waited on the gate.
        if let Some(slot) = self.lookup(key) {
            return Ok(slot);
        }

        let result = self.load(key);
        self.load_gates.lock().remove(key);
        result
    }

    fn load(&self, key: &str) -> Result<TextureSlot> {
        let image = match self.decoder.decode(key) {
            Ok(image) => image,
            Err(e) => {
                log::warn!("Texture `{key}` failed to decode ({e}); using placeholder");
                return Ok(self.placeholder_slot());
            }
        };

        let slot = self.next_slot.fetch_add(1, Ordering::SeqCst) as usize;
        if slot >= self.capacity - 1 {
            log::error!(
                "Texture `{key}` needs slot {slot} but only {} slots are configured",
                self.capacity
            );
            return Err(EngineError::TextureCapacityExceeded {
                slot,
                capacity: self.capacity,
            });
        }

        let texture = self.backend.upload_texture(&image)?;
        let handle = self.backend.texture_descriptor(&texture);
        if let Err(duplicate) = self.textures[slot].set(texture) {
            debug_assert!(false, "slot {slot} assigned twice");
            self.backend.destroy_texture(duplicate);
        }

        // The descriptor is in place before the key becomes visible.
        self.descriptors.set(slot, handle);
        let slot = TextureSlot(slot as u32);
        self.lookup.write().insert(key.to_owned(), slot);
        self.generation.fetch_add(1, Ordering::Release);

        log::debug!(
            "Texture `{key}` ({}x{}) registered at {slot}",
            image.width,
            image.height
        );
        Ok(slot)
    }

    /// Registers many keys, in parallel when the `parallel` feature is on.
    /// Results are in input order; slot numbers follow completion order.
    pub fn register_batch<K>(&self, keys: &[K]) -> Result<Vec<TextureSlot>>
    where
        K: AsRef<str> + Sync,
    {
        #[cfg(feature = "parallel")]
        {
            keys.par_iter()
                .map(|key| self.register_or_get(key.as_ref()))
                .collect()
        }
        #[cfg(not(feature = "parallel"))]
        {
            keys.iter()
                .map(|key| self.register_or_get(key.as_ref()))
                .collect()
        }
    }

    pub fn lookup(&self, key: &str) -> Option<TextureSlot> {
        self.lookup.read().get(key).copied()
    }

    /// Number of organic slots handed out.
    pub fn len(&self) -> usize {
        (self.next_slot.load(Ordering::SeqCst) as usize).min(self.capacity - 1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn placeholder_slot(&self) -> TextureSlot {
        TextureSlot((self.capacity - 1) as u32)
    }

    pub fn texture(&self, slot: TextureSlot) -> Option<&B::Texture> {
        let index = slot.0 as usize;
        if index == self.capacity - 1 {
            return self.placeholder.as_ref();
        }
        self.textures.get(index).and_then(OnceLock::get)
    }

    /// Bumped after every successful registration.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn descriptors(&self) -> &DescriptorArray {
        &self.descriptors
    }

    pub fn snapshot_descriptors(&self, out: &mut Vec<DescriptorHandle>) {
        self.descriptors.snapshot_into(out);
    }
}

impl<B: RenderBackend> Drop for TextureRegistry<B> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.wait_idle() {
            log::warn!("wait_idle failed before texture teardown: {e}");
        }
        let mut destroyed = 0;
        for cell in self.textures.iter_mut() {
            if let Some(texture) = cell.take() {
                self.backend.destroy_texture(texture);
                destroyed += 1;
            }
        }
        if let Some(placeholder) = self.placeholder.take() {
            self.backend.destroy_texture(placeholder);
        }
        log::debug!("Texture registry destroyed ({destroyed} textures)");
    }
}
