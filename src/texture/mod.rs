//! Bindless texture registry and the decoders that feed it.

pub mod decoder;
pub mod descriptors;
pub mod registry;

pub use decoder::{DecodedImage, FileDecoder, ImageDecoder, MemoryDecoder};
pub use descriptors::DescriptorArray;
pub use registry::{TextureRegistry, TextureSlot};
