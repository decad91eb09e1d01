//! Level-of-detail cache
//!
//! Keeps a low-resolution UI buffer and the full-resolution buffer per
//! image and picks what the executor renders from: the UI buffer, a
//! zoom crop of the high-res buffer, or an upscaled crop of the UI buffer
//! when the high-res copy has been evicted.
//!
//! Population is serialized per image id: concurrent requests for the same
//! id wait on one load, other ids load independently.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use colorforge::lod::{LevelOfDetailCache, InMemorySource, ZoomRect};
//!
//! let source = Arc::new(InMemorySource::new());
//! source.insert("img", linear_buffer);
//! let lod = LevelOfDetailCache::new(source, 1600);
//! lod.set_zoom(&"img".into(), Some(ZoomRect::new(0.25, 0.25, 0.5, 0.5)));
//! let input = lod.resolve_blocking(&"img".into(), RenderTier::Ui)?;
//! ```

use crate::buffer::{fit_long_edge, ColorSpace, Extent, ImageBuffer};
use crate::error::{ForgeError, Result};
use crate::params::{ImageId, RenderTier, SourceInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tracing::{debug, warn};

// ============================================================================
// Sources
// ============================================================================

/// Supplies full-resolution linear buffers (the RAW decoder's output).
pub trait SourceProvider: Send + Sync {
    fn load(&self, id: &ImageId) -> Result<ImageBuffer>;
}

/// Sources held in memory, e.g. decoded by the caller.
#[derive(Default)]
pub struct InMemorySource {
    images: RwLock<HashMap<ImageId, ImageBuffer>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<ImageId>, image: ImageBuffer) {
        let mut images = self.images.write().unwrap_or_else(|e| e.into_inner());
        images.insert(id.into(), image);
    }

    pub fn remove(&self, id: &ImageId) -> Option<ImageBuffer> {
        let mut images = self.images.write().unwrap_or_else(|e| e.into_inner());
        images.remove(id)
    }
}

impl SourceProvider for InMemorySource {
    fn load(&self, id: &ImageId) -> Result<ImageBuffer> {
        let images = self.images.read().unwrap_or_else(|e| e.into_inner());
        images
            .get(id)
            .cloned()
            .ok_or_else(|| ForgeError::ImageNotFound(id.to_string()))
    }
}

/// Sources read from 8/16-bit image files and linearized.
#[derive(Default)]
pub struct FileSource {
    paths: RwLock<HashMap<ImageId, PathBuf>>,
}

impl FileSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<ImageId>, path: impl Into<PathBuf>) {
        let mut paths = self.paths.write().unwrap_or_else(|e| e.into_inner());
        paths.insert(id.into(), path.into());
    }
}

impl SourceProvider for FileSource {
    fn load(&self, id: &ImageId) -> Result<ImageBuffer> {
        let path = {
            let paths = self.paths.read().unwrap_or_else(|e| e.into_inner());
            paths
                .get(id)
                .cloned()
                .ok_or_else(|| ForgeError::ImageNotFound(id.to_string()))?
        };
        if !path.exists() {
            return Err(ForgeError::ImageNotFound(path.display().to_string()));
        }
        let img = image::open(&path)?;
        ImageBuffer::from_dynamic(&img)
    }
}

// ============================================================================
// Zoom and resolution
// ============================================================================

/// Viewport rectangle in normalized frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoomRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl ZoomRect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Pixel rectangle on a frame, clamped to its bounds.
    pub fn to_extent(&self, frame_width: u32, frame_height: u32) -> Extent {
        let (fw, fh) = (frame_width as f32, frame_height as f32);
        let x0 = (self.x.clamp(0.0, 1.0) * fw).floor() as u32;
        let y0 = (self.y.clamp(0.0, 1.0) * fh).floor() as u32;
        let x1 = ((self.x + self.width).clamp(0.0, 1.0) * fw).ceil() as u32;
        let y1 = ((self.y + self.height).clamp(0.0, 1.0) * fh).ceil() as u32;
        let x0 = x0.min(frame_width.saturating_sub(1));
        let y0 = y0.min(frame_height.saturating_sub(1));
        Extent::new(x0, y0, x1.max(x0 + 1) - x0, y1.max(y0 + 1) - y0)
    }
}

/// Which buffer the cache handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LodKind {
    /// Low-resolution UI buffer
    Ui,
    /// Zoom crop of the high-res buffer
    ZoomedHighRes,
    /// Zoom crop of the UI buffer, upscaled
    ZoomedUpscaled,
    /// Full-resolution buffer
    Full,
    /// Flat stand-in while the source loads
    Placeholder,
}

#[derive(Debug, Clone)]
pub struct ResolvedInput {
    pub buffer: ImageBuffer,
    pub kind: LodKind,
}

impl ResolvedInput {
    pub fn is_placeholder(&self) -> bool {
        self.kind == LodKind::Placeholder
    }
}

struct LodEntry {
    ui: ImageBuffer,
    high_res: RwLock<Option<ImageBuffer>>,
}

#[derive(Default)]
struct Slot {
    entry: OnceLock<Arc<LodEntry>>,
    writer: Mutex<()>,
    loading: AtomicBool,
}

/// Load the source and fill the slot, once. Callers racing on the same
/// slot block on its writer lock and reuse the first result.
fn populate(provider: &dyn SourceProvider, ui_long_edge: u32, slot: &Slot, id: &ImageId) -> Result<Arc<LodEntry>> {
    if let Some(entry) = slot.entry.get() {
        return Ok(entry.clone());
    }
    let _writer = slot.writer.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(entry) = slot.entry.get() {
        return Ok(entry.clone());
    }

    let full = provider.load(id)?;
    let ui = if full.extent().long_edge() > ui_long_edge {
        full.resize_long_edge(ui_long_edge)
    } else {
        full.clone()
    };
    debug!(
        "Cached {}: UI {}x{}, high-res {}x{}",
        id,
        ui.width(),
        ui.height(),
        full.width(),
        full.height()
    );
    let entry = Arc::new(LodEntry {
        ui,
        high_res: RwLock::new(Some(full)),
    });
    Ok(slot.entry.get_or_init(|| entry).clone())
}

// ============================================================================
// Cache
// ============================================================================

pub struct LevelOfDetailCache {
    provider: Arc<dyn SourceProvider>,
    ui_long_edge: u32,
    slots: Mutex<HashMap<ImageId, Arc<Slot>>>,
    zoom: RwLock<HashMap<ImageId, ZoomRect>>,
}

impl LevelOfDetailCache {
    pub fn new(provider: Arc<dyn SourceProvider>, ui_long_edge: u32) -> Self {
        Self {
            provider,
            ui_long_edge: ui_long_edge.max(1),
            slots: Mutex::new(HashMap::new()),
            zoom: RwLock::new(HashMap::new()),
        }
    }

    fn slot(&self, id: &ImageId) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(id.clone()).or_default().clone()
    }

    /// Set or clear the viewport zoom for an image.
    pub fn set_zoom(&self, id: &ImageId, rect: Option<ZoomRect>) {
        let mut zoom = self.zoom.write().unwrap_or_else(|e| e.into_inner());
        match rect {
            Some(rect) => {
                zoom.insert(id.clone(), rect);
            }
            None => {
                zoom.remove(id);
            }
        }
    }

    pub fn zoom(&self, id: &ImageId) -> Option<ZoomRect> {
        let zoom = self.zoom.read().unwrap_or_else(|e| e.into_inner());
        zoom.get(id).copied()
    }

    pub fn is_ready(&self, id: &ImageId) -> bool {
        self.slot(id).entry.get().is_some()
    }

    /// Drop the high-res buffer; zoomed renders upscale the UI buffer until
    /// the next full load.
    pub fn evict_high_res(&self, id: &ImageId) {
        if let Some(entry) = self.slot(id).entry.get() {
            let mut high_res = entry.high_res.write().unwrap_or_else(|e| e.into_inner());
            *high_res = None;
        }
    }

    /// Forget everything cached for an image.
    pub fn invalidate(&self, id: &ImageId) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(id);
    }

    /// Resolve the input buffer, loading the source first if needed.
    pub fn resolve_blocking(&self, id: &ImageId, tier: RenderTier) -> Result<ResolvedInput> {
        let slot = self.slot(id);
        let entry = populate(self.provider.as_ref(), self.ui_long_edge, &slot, id)?;
        self.select(id, &entry, tier)
    }

    /// Resolve without waiting on a first load.
    ///
    /// When nothing is cached yet, the load starts in the background and a
    /// flat placeholder sized from `source` is returned.
    pub fn resolve(&self, id: &ImageId, source: &SourceInfo, tier: RenderTier) -> Result<ResolvedInput> {
        let slot = self.slot(id);
        if let Some(entry) = slot.entry.get() {
            return self.select(id, entry, tier);
        }

        if !slot.loading.swap(true, Ordering::AcqRel) {
            let provider = self.provider.clone();
            let ui_long_edge = self.ui_long_edge;
            let id = id.clone();
            let slot = slot.clone();
            std::thread::spawn(move || {
                if let Err(e) = populate(provider.as_ref(), ui_long_edge, &slot, &id) {
                    warn!("⚠️ Background load of {} failed: {}", id, e);
                }
                slot.loading.store(false, Ordering::Release);
            });
        }

        let (w, h) = fit_long_edge(source.native_width.max(1), source.native_height.max(1), self.ui_long_edge);
        debug!("Serving placeholder for {} while it loads", id);
        Ok(ResolvedInput {
            buffer: ImageBuffer::filled(w, h, ColorSpace::Linear, [0.18; 3]),
            kind: LodKind::Placeholder,
        })
    }

    fn select(&self, id: &ImageId, entry: &LodEntry, tier: RenderTier) -> Result<ResolvedInput> {
        let high_res = entry.high_res.read().unwrap_or_else(|e| e.into_inner()).clone();

        match tier {
            RenderTier::HighRes | RenderTier::Export => {
                let full = match high_res {
                    Some(full) => full,
                    None => self.provider.load(id)?,
                };
                Ok(ResolvedInput {
                    buffer: full,
                    kind: LodKind::Full,
                })
            }
            RenderTier::Ui => {
                let Some(rect) = self.zoom(id) else {
                    return Ok(ResolvedInput {
                        buffer: entry.ui.clone(),
                        kind: LodKind::Ui,
                    });
                };
                match high_res {
                    Some(full) => {
                        let frame = full.frame();
                        Ok(ResolvedInput {
                            buffer: full.crop(rect.to_extent(frame.width, frame.height)),
                            kind: LodKind::ZoomedHighRes,
                        })
                    }
                    None => {
                        let frame = entry.ui.frame();
                        let crop = entry.ui.crop(rect.to_extent(frame.width, frame.height));
                        Ok(ResolvedInput {
                            buffer: crop.resize_long_edge(self.ui_long_edge),
                            kind: LodKind::ZoomedUpscaled,
                        })
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingSource {
        inner: InMemorySource,
        loads: AtomicUsize,
    }

    impl SourceProvider for CountingSource {
        fn load(&self, id: &ImageId) -> Result<ImageBuffer> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            self.inner.load(id)
        }
    }

    fn gradient(width: u32, height: u32) -> ImageBuffer {
        ImageBuffer::from_fn(width, height, ColorSpace::Linear, |x, y| [x as f32 / width as f32, y as f32 / height as f32, 0.2])
    }

    fn counting(id: &str, image: ImageBuffer) -> Arc<CountingSource> {
        let inner = InMemorySource::new();
        inner.insert(id, image);
        Arc::new(CountingSource {
            inner,
            loads: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_ui_buffer_is_downscaled() {
        let source = counting("a", gradient(400, 200));
        let lod = LevelOfDetailCache::new(source, 100);
        let resolved = lod.resolve_blocking(&"a".into(), RenderTier::Ui).unwrap();
        assert_eq!(resolved.kind, LodKind::Ui);
        assert_eq!((resolved.buffer.width(), resolved.buffer.height()), (100, 50));

        let full = lod.resolve_blocking(&"a".into(), RenderTier::HighRes).unwrap();
        assert_eq!(full.kind, LodKind::Full);
        assert_eq!(full.buffer.width(), 400);
    }

    #[test]
    fn test_zoom_crops_high_res_and_clamps() {
        let source = counting("a", gradient(400, 200));
        let lod = LevelOfDetailCache::new(source, 100);
        let id = ImageId::from("a");
        lod.set_zoom(&id, Some(ZoomRect::new(0.75, 0.5, 0.5, 0.5)));

        let resolved = lod.resolve_blocking(&id, RenderTier::Ui).unwrap();
        assert_eq!(resolved.kind, LodKind::ZoomedHighRes);
        assert_eq!(resolved.buffer.extent(), Extent::new(300, 100, 100, 100));
        assert_eq!(resolved.buffer.frame().width, 400);

        lod.set_zoom(&id, None);
        assert_eq!(lod.resolve_blocking(&id, RenderTier::Ui).unwrap().kind, LodKind::Ui);
    }

    #[test]
    fn test_zoom_without_high_res_upscales_ui() {
        let source = counting("a", gradient(400, 200));
        let lod = LevelOfDetailCache::new(source, 100);
        let id = ImageId::from("a");
        lod.resolve_blocking(&id, RenderTier::Ui).unwrap();
        lod.evict_high_res(&id);
        lod.set_zoom(&id, Some(ZoomRect::new(0.0, 0.0, 0.5, 0.5)));

        let resolved = lod.resolve_blocking(&id, RenderTier::Ui).unwrap();
        assert_eq!(resolved.kind, LodKind::ZoomedUpscaled);
        assert_eq!(resolved.buffer.extent().long_edge(), 100);
    }

    #[test]
    fn test_concurrent_first_touch_loads_once() {
        let source = counting("a", gradient(64, 64));
        let lod = Arc::new(LevelOfDetailCache::new(source.clone(), 32));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lod = lod.clone();
                std::thread::spawn(move || lod.resolve_blocking(&"a".into(), RenderTier::Ui).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_first_touch_serves_placeholder() {
        let source = counting("a", gradient(300, 100));
        let lod = LevelOfDetailCache::new(source, 60);
        let id = ImageId::from("a");
        let info = SourceInfo::with_native_size(300, 100);

        let first = lod.resolve(&id, &info, RenderTier::Ui).unwrap();
        assert!(first.is_placeholder());
        assert_eq!((first.buffer.width(), first.buffer.height()), (60, 20));

        for _ in 0..200 {
            if lod.is_ready(&id) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let ready = lod.resolve(&id, &info, RenderTier::Ui).unwrap();
        assert_eq!(ready.kind, LodKind::Ui);
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let lod = LevelOfDetailCache::new(Arc::new(InMemorySource::new()), 100);
        assert!(matches!(
            lod.resolve_blocking(&"nope".into(), RenderTier::Ui),
            Err(ForgeError::ImageNotFound(_))
        ));
        assert!(!lod.is_ready(&"nope".into()));
    }
}
