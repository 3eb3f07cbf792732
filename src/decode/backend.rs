use anyhow::Result;

/// Pixels produced by a decoder backend: packed RGB8, row-major.
#[derive(Clone, Debug)]
pub struct RawImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// JPEG decoder backend trait.
///
/// Backends are shared by every decode worker, so `decode` takes `&self` and
/// must not keep per-frame state. A returned error means "this backend could
/// not decode the bytes"; the worker then tries the next backend in its chain.
pub trait DecoderBackend: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Decode a complete JPEG into RGB8 pixels.
    fn decode(&self, bytes: &[u8]) -> Result<RawImage>;
}
