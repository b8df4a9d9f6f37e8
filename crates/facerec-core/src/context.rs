//! Owning handle around a [`Value`] tree.
//!
//! A [`Context`] is what callers build, hand to processing blocks and read
//! results from. It can be released explicitly; after that every operation
//! fails with [`Error::AlreadyReleased`]. Dropping it releases it implicitly.

use crate::error::{Error, Result};
use crate::frame::{self, PixelFormat};
use crate::value::Value;
use std::path::Path;

#[derive(Debug, PartialEq)]
pub struct Context {
    root: Option<Value>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Value> for Context {
    fn from(value: Value) -> Self {
        Self { root: Some(value) }
    }
}

impl Context {
    /// Empty object container.
    pub fn new() -> Self {
        Self::from(Value::Object(Vec::new()))
    }

    /// Decode a JPEG/PNG/BMP/WEBP buffer into `{"image": {...}}`.
    pub fn from_encoded_image(bytes: &[u8]) -> Result<Self> {
        let decoded = image::load_from_memory(bytes).map_err(|e| Error::Decode(e.to_string()))?;
        let rgb = decoded.to_rgb8();
        let (width, height) = rgb.dimensions();
        tracing::debug!(width, height, "image decoded");
        Self::with_image(rgb.into_raw(), width, height)
    }

    /// Wrap a raw frame, converting it to upright RGB.
    ///
    /// `base_angle` is the clockwise rotation (0, 90, 180 or 270) that brings
    /// the frame upright.
    pub fn from_frame(
        data: &[u8],
        width: i32,
        height: i32,
        format: PixelFormat,
        base_angle: i32,
    ) -> Result<Self> {
        let (rgb, w, h) = frame::raw_frame_to_rgb(data, width, height, format, base_angle)?;
        Self::with_image(rgb, w, h)
    }

    fn with_image(rgb: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let mut ctx = Self::new();
        ctx.root_mut()?.insert("image", frame::image_value(rgb, width, height))?;
        Ok(ctx)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let parsed: serde_json::Value =
            serde_json::from_str(json).map_err(|e| Error::Config(format!("malformed JSON: {e}")))?;
        Ok(Self::from(Value::from(parsed)))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    pub fn root(&self) -> Result<&Value> {
        self.root.as_ref().ok_or(Error::AlreadyReleased("context"))
    }

    pub fn root_mut(&mut self) -> Result<&mut Value> {
        self.root.as_mut().ok_or(Error::AlreadyReleased("context"))
    }

    /// Take the tree out of the context, leaving it released.
    pub fn into_value(mut self) -> Result<Value> {
        self.root.take().ok_or(Error::AlreadyReleased("context"))
    }

    pub fn get_or_insert_by_key(&mut self, key: &str) -> Result<&mut Value> {
        self.root_mut()?.get_or_insert_by_key(key)
    }

    pub fn get_by_key(&self, key: &str) -> Result<&Value> {
        self.root()?.get_by_key(key)
    }

    /// First call frees the tree; any later call fails.
    pub fn release(&mut self) -> Result<()> {
        match self.root.take() {
            Some(_) => Ok(()),
            None => Err(Error::AlreadyReleased("context")),
        }
    }

    pub fn is_released(&self) -> bool {
        self.root.is_none()
    }

    /// Independent deep copy. Template index references are shared, not copied.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self::from(self.root()?.clone()))
    }

    /// Replace this tree with a deep copy of `other`.
    pub fn copy_from(&mut self, other: &Context) -> Result<()> {
        let source = other.root()?.clone();
        *self.root_mut()? = source;
        Ok(())
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(self.root()?.to_json())
    }

    pub fn serialize_to_json(&self) -> Result<String> {
        Ok(self.root()?.serialize_to_json())
    }

    pub fn save_to_json_file(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.to_json()?)
            .map_err(|e| Error::Processing(format!("JSON encoding failed: {e}")))?;
        std::fs::write(path, text)?;
        Ok(())
    }
}
