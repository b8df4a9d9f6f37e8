//! Raw pixel buffers: format conversion, rotation and the `image` field layout.
//!
//! Every image stored in a [`Value`] tree uses the same layout:
//! `{"blob": <binary RGB8>, "dtype": "uint8_t", "format": "NDARRAY", "shape": [h, w, 3]}`.

use crate::error::{Error, Result};
use crate::value::Value;

const IMAGE_DTYPE: &str = "uint8_t";
const IMAGE_FORMAT: &str = "NDARRAY";
const RGB_CHANNELS: usize = 3;

/// Pixel layout of a raw frame buffer.
///
/// Discriminants match the integer codes accepted by [`PixelFormat::from_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 3 bytes per pixel, B G R.
    Bgr = 0,
    /// 3 bytes per pixel, R G B.
    Rgb = 1,
    /// 4 bytes per pixel, B G R A.
    Bgra8888 = 2,
    /// Y plane followed by interleaved V/U at quarter resolution.
    YuvNv21 = 3,
    /// Y plane followed by interleaved U/V at quarter resolution.
    YuvNv12 = 4,
    /// Planar I420: Y plane, U plane, V plane.
    Yuv420 = 5,
}

impl PixelFormat {
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(Self::Bgr),
            1 => Ok(Self::Rgb),
            2 => Ok(Self::Bgra8888),
            3 => Ok(Self::YuvNv21),
            4 => Ok(Self::YuvNv12),
            5 => Ok(Self::Yuv420),
            other => Err(Error::InvalidDimensions(format!("unknown pixel format code {other}"))),
        }
    }

    fn is_yuv(self) -> bool {
        matches!(self, Self::YuvNv21 | Self::YuvNv12 | Self::Yuv420)
    }

    /// Number of bytes a `width` x `height` frame occupies in this format.
    pub fn frame_len(self, width: usize, height: usize) -> usize {
        match self {
            Self::Bgr | Self::Rgb => width * height * 3,
            Self::Bgra8888 => width * height * 4,
            Self::YuvNv21 | Self::YuvNv12 | Self::Yuv420 => width * height * 3 / 2,
        }
    }
}

/// Borrowed view of an interleaved RGB8 image.
#[derive(Debug, Clone, Copy)]
pub struct ImageRef<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
}

impl<'a> ImageRef<'a> {
    /// Read the `image` field layout. Missing or malformed fields are
    /// reported as processing errors since stages are the only readers.
    pub fn from_image_value(image: &'a Value) -> Result<Self> {
        let missing = |field: &str| Error::Processing(format!("image.{field} is missing or malformed"));

        let format = image.get_by_key("format").and_then(Value::get_string).map_err(|_| missing("format"))?;
        if format != IMAGE_FORMAT {
            return Err(Error::Processing(format!("unsupported image format {format:?}, expected {IMAGE_FORMAT}")));
        }
        let dtype = image.get_by_key("dtype").and_then(Value::get_string).map_err(|_| missing("dtype"))?;
        if dtype != IMAGE_DTYPE {
            return Err(Error::Processing(format!("unsupported image dtype {dtype:?}, expected {IMAGE_DTYPE}")));
        }

        let shape = image.get_by_key("shape").map_err(|_| missing("shape"))?;
        let dims: Vec<i64> = (0..shape.len().map_err(|_| missing("shape"))?)
            .map(|i| shape.get_by_index(i).ok().and_then(Value::as_i64).ok_or_else(|| missing("shape")))
            .collect::<Result<_>>()?;
        let &[height, width, channels] = &dims[..] else {
            return Err(missing("shape"));
        };
        if height <= 0 || width <= 0 || channels != RGB_CHANNELS as i64 {
            return Err(Error::Processing(format!("unsupported image shape {dims:?}")));
        }

        let too_large = || Error::Processing(format!("image shape {dims:?} is too large"));
        let (width, height) = match (u32::try_from(width), u32::try_from(height)) {
            (Ok(w), Ok(h)) => (w, h),
            _ => return Err(too_large()),
        };
        let expected = (height as usize)
            .checked_mul(width as usize)
            .and_then(|n| n.checked_mul(RGB_CHANNELS))
            .ok_or_else(too_large)?;

        let data = image.get_by_key("blob").and_then(Value::get_binary).map_err(|_| missing("blob"))?;
        if data.len() != expected {
            return Err(Error::Processing(format!(
                "image blob holds {} bytes, shape requires {expected}",
                data.len()
            )));
        }

        Ok(Self { data, width, height })
    }

    /// Read `ctx["image"]`.
    pub fn from_context_root(root: &'a Value) -> Result<Self> {
        let image = root
            .get_by_key("image")
            .map_err(|_| Error::Processing("input context has no image".into()))?;
        Self::from_image_value(image)
    }

    /// RGB triple at (x, y). Coordinates are clamped to the image.
    pub fn pixel(&self, x: i64, y: i64) -> [u8; 3] {
        let x = x.clamp(0, self.width as i64 - 1) as usize;
        let y = y.clamp(0, self.height as i64 - 1) as usize;
        let off = (y * self.width as usize + x) * RGB_CHANNELS;
        [self.data[off], self.data[off + 1], self.data[off + 2]]
    }

    /// BT.601 luma of every pixel.
    pub fn to_grayscale(&self) -> Vec<u8> {
        self.data
            .chunks_exact(RGB_CHANNELS)
            .map(|p| luma(p[0], p[1], p[2]))
            .collect()
    }

    /// Copy out the sub-rectangle `[x0, x0+w) x [y0, y0+h)`, clamped to the image.
    pub fn crop(&self, x0: u32, y0: u32, w: u32, h: u32) -> (Vec<u8>, u32, u32) {
        let x0 = x0.min(self.width.saturating_sub(1));
        let y0 = y0.min(self.height.saturating_sub(1));
        let w = w.min(self.width - x0).max(1);
        let h = h.min(self.height - y0).max(1);

        let stride = self.width as usize * RGB_CHANNELS;
        let mut out = Vec::with_capacity(w as usize * h as usize * RGB_CHANNELS);
        for y in y0..y0 + h {
            let start = y as usize * stride + x0 as usize * RGB_CHANNELS;
            out.extend_from_slice(&self.data[start..start + w as usize * RGB_CHANNELS]);
        }
        (out, w, h)
    }
}

/// Build the `image` field for an RGB8 buffer.
pub fn image_value(rgb: Vec<u8>, width: u32, height: u32) -> Value {
    Value::Object(vec![
        ("blob".to_string(), Value::Binary(rgb)),
        ("dtype".to_string(), Value::String(IMAGE_DTYPE.to_string())),
        ("format".to_string(), Value::String(IMAGE_FORMAT.to_string())),
        (
            "shape".to_string(),
            Value::Array(vec![
                Value::Int(height as i64),
                Value::Int(width as i64),
                Value::Int(RGB_CHANNELS as i64),
            ]),
        ),
    ])
}

/// Validate a raw frame and convert it to upright RGB8.
///
/// `base_angle` is the clockwise rotation, in degrees, that brings the frame upright.
pub fn raw_frame_to_rgb(
    data: &[u8],
    width: i32,
    height: i32,
    format: PixelFormat,
    base_angle: i32,
) -> Result<(Vec<u8>, u32, u32)> {
    if width <= 0 || height <= 0 {
        return Err(Error::InvalidDimensions(format!("{width}x{height}: width and height must be positive")));
    }
    let (w, h) = (width as usize, height as usize);
    if format.is_yuv() && (w % 2 != 0 || h % 2 != 0) {
        return Err(Error::InvalidDimensions(format!("{format:?} requires even dimensions, got {w}x{h}")));
    }
    let expected = format.frame_len(w, h);
    if data.len() != expected {
        return Err(Error::InvalidDimensions(format!(
            "{format:?} {w}x{h} requires {expected} bytes, got {}",
            data.len()
        )));
    }

    let rgb = match format {
        PixelFormat::Rgb => data.to_vec(),
        PixelFormat::Bgr => data.chunks_exact(3).flat_map(|p| [p[2], p[1], p[0]]).collect(),
        PixelFormat::Bgra8888 => data.chunks_exact(4).flat_map(|p| [p[2], p[1], p[0]]).collect(),
        PixelFormat::YuvNv12 | PixelFormat::YuvNv21 | PixelFormat::Yuv420 => yuv_to_rgb(data, w, h, format),
    };

    rotate_rgb(rgb, width as u32, height as u32, base_angle)
}

/// Convert a 4:2:0 YUV frame (semi-planar or planar) to RGB8 with BT.601 coefficients.
fn yuv_to_rgb(data: &[u8], w: usize, h: usize, format: PixelFormat) -> Vec<u8> {
    let y_plane = &data[..w * h];
    let chroma = &data[w * h..];
    let quarter = (w / 2) * (h / 2);

    let mut rgb = Vec::with_capacity(w * h * 3);
    for y in 0..h {
        for x in 0..w {
            let ci = (y / 2) * (w / 2) + x / 2;
            let (u, v) = match format {
                PixelFormat::YuvNv12 => (chroma[ci * 2], chroma[ci * 2 + 1]),
                PixelFormat::YuvNv21 => (chroma[ci * 2 + 1], chroma[ci * 2]),
                _ => (chroma[ci], chroma[quarter + ci]),
            };
            let yy = y_plane[y * w + x] as f32;
            let u = u as f32 - 128.0;
            let v = v as f32 - 128.0;
            rgb.push((yy + 1.402 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((yy - 0.344_136 * u - 0.714_136 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((yy + 1.772 * u).round().clamp(0.0, 255.0) as u8);
        }
    }
    rgb
}

/// Rotate an RGB8 buffer clockwise by a multiple of 90 degrees.
pub fn rotate_rgb(rgb: Vec<u8>, width: u32, height: u32, angle: i32) -> Result<(Vec<u8>, u32, u32)> {
    let turns = match angle.rem_euclid(360) {
        0 => 0,
        90 => 1,
        180 => 2,
        270 => 3,
        _ => return Err(Error::InvalidDimensions(format!("unsupported base angle {angle}"))),
    };
    if turns == 0 {
        return Ok((rgb, width, height));
    }

    let (w, h) = (width as usize, height as usize);
    let (out_w, out_h) = if turns == 2 { (w, h) } else { (h, w) };
    let mut out = vec![0u8; rgb.len()];
    for y in 0..h {
        for x in 0..w {
            let (ox, oy) = match turns {
                1 => (h - 1 - y, x),
                2 => (w - 1 - x, h - 1 - y),
                _ => (y, w - 1 - x),
            };
            let src = (y * w + x) * 3;
            let dst = (oy * out_w + ox) * 3;
            out[dst..dst + 3].copy_from_slice(&rgb[src..src + 3]);
        }
    }
    Ok((out, out_w as u32, out_h as u32))
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32).round().clamp(0.0, 255.0) as u8
}

/// Average pixel brightness (0.0–255.0).
pub fn avg_brightness(gray: &[u8]) -> f32 {
    if gray.is_empty() {
        return 0.0;
    }
    gray.iter().map(|&b| b as f32).sum::<f32>() / gray.len() as f32
}

/// Variance of the 4-neighbour Laplacian, a cheap focus measure.
pub fn laplacian_variance(gray: &[u8], width: usize, height: usize) -> f32 {
    if width < 3 || height < 3 || gray.len() < width * height {
        return 0.0;
    }
    let mut values = Vec::with_capacity((width - 2) * (height - 2));
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let c = gray[y * width + x] as f32;
            let lap = gray[(y - 1) * width + x] as f32
                + gray[(y + 1) * width + x] as f32
                + gray[y * width + x - 1] as f32
                + gray[y * width + x + 1] as f32
                - 4.0 * c;
            values.push(lap);
        }
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bgr_to_rgb() {
        let bgr = vec![10, 20, 30, 40, 50, 60];
        let (rgb, w, h) = raw_frame_to_rgb(&bgr, 2, 1, PixelFormat::Bgr, 0).unwrap();
        assert_eq!((w, h), (2, 1));
        assert_eq!(rgb, vec![30, 20, 10, 60, 50, 40]);
    }

    #[test]
    fn test_bgra_drops_alpha() {
        let bgra = vec![1, 2, 3, 255];
        let (rgb, _, _) = raw_frame_to_rgb(&bgra, 1, 1, PixelFormat::Bgra8888, 0).unwrap();
        assert_eq!(rgb, vec![3, 2, 1]);
    }

    #[test]
    fn test_nv12_gray_stays_gray() {
        // Y=100 everywhere, neutral chroma → R=G=B=100
        let mut nv12 = vec![100u8; 4 * 2];
        nv12.extend(vec![128u8; 4]);
        let (rgb, w, h) = raw_frame_to_rgb(&nv12, 4, 2, PixelFormat::YuvNv12, 0).unwrap();
        assert_eq!((w, h), (4, 2));
        assert!(rgb.iter().all(|&p| p == 100));
    }

    #[test]
    fn test_nv21_swaps_chroma_order() {
        // 2x2 frame, one chroma pair. NV12 reads (U, V), NV21 reads (V, U).
        let mut frame = vec![128u8; 4];
        frame.extend([200u8, 60u8]);
        let (nv12, _, _) = raw_frame_to_rgb(&frame, 2, 2, PixelFormat::YuvNv12, 0).unwrap();
        let (nv21, _, _) = raw_frame_to_rgb(&frame, 2, 2, PixelFormat::YuvNv21, 0).unwrap();
        // R depends only on V, B only on U: swapping the pair swaps which one is strong
        assert!(nv12[2] > nv12[0]);
        assert!(nv21[0] > nv21[2]);
    }

    #[test]
    fn test_non_positive_dimensions_rejected() {
        let err = raw_frame_to_rgb(&[], 0, 10, PixelFormat::Rgb, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidDimensions(_)));
        let err = raw_frame_to_rgb(&[], 10, -1, PixelFormat::Rgb, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidDimensions(_)));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let err = raw_frame_to_rgb(&[0u8; 5], 2, 1, PixelFormat::Rgb, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidDimensions(_)));
    }

    #[test]
    fn test_odd_yuv_dimensions_rejected() {
        let err = raw_frame_to_rgb(&[0u8; 9], 3, 2, PixelFormat::YuvNv12, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidDimensions(_)));
    }

    #[test]
    fn test_rotate_90_clockwise() {
        // 2x1 image [A, B] rotated 90° cw → 1x2 image [A; B]
        let rgb = vec![1, 1, 1, 2, 2, 2];
        let (out, w, h) = rotate_rgb(rgb, 2, 1, 90).unwrap();
        assert_eq!((w, h), (1, 2));
        assert_eq!(out, vec![1, 1, 1, 2, 2, 2]);
    }

    #[test]
    fn test_rotate_270_clockwise() {
        let rgb = vec![1, 1, 1, 2, 2, 2];
        let (out, w, h) = rotate_rgb(rgb, 2, 1, 270).unwrap();
        assert_eq!((w, h), (1, 2));
        assert_eq!(out, vec![2, 2, 2, 1, 1, 1]);
    }

    #[test]
    fn test_rotate_180() {
        let rgb = vec![1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4, 4];
        let (out, w, h) = rotate_rgb(rgb, 2, 2, 180).unwrap();
        assert_eq!((w, h), (2, 2));
        assert_eq!(out, vec![4, 4, 4, 3, 3, 3, 2, 2, 2, 1, 1, 1]);
    }

    #[test]
    fn test_rotate_rejects_odd_angles() {
        assert!(matches!(rotate_rgb(vec![0; 3], 1, 1, 45), Err(Error::InvalidDimensions(_))));
    }

    #[test]
    fn test_image_value_roundtrip() {
        let value = image_value(vec![5u8; 2 * 3 * 3], 3, 2);
        let image = ImageRef::from_image_value(&value).unwrap();
        assert_eq!((image.width, image.height), (3, 2));
        assert_eq!(image.pixel(2, 1), [5, 5, 5]);
    }

    #[test]
    fn test_image_value_blob_mismatch() {
        let mut value = image_value(vec![5u8; 18], 3, 2);
        *value.get_or_insert_by_key("blob").unwrap() = Value::Binary(vec![0u8; 4]);
        assert!(matches!(ImageRef::from_image_value(&value), Err(Error::Processing(_))));
    }

    #[test]
    fn test_image_value_oversized_shape() {
        for shape in [[4_611_686_018_427_387_904, 4, 3], [i64::MAX, i64::MAX, 3], [1, 1 << 33, 3]] {
            let mut value = image_value(vec![0u8; 12], 2, 2);
            *value.get_or_insert_by_key("shape").unwrap() = Value::Array(shape.iter().map(|&d| Value::Int(d)).collect());
            let err = ImageRef::from_image_value(&value).unwrap_err();
            assert!(matches!(err, Error::Processing(ref m) if m.contains("too large")), "{shape:?}: {err}");
        }
    }

    #[test]
    fn test_crop_clamps_to_image() {
        let value = image_value((0..4 * 4 * 3).map(|i| i as u8).collect(), 4, 4);
        let image = ImageRef::from_image_value(&value).unwrap();
        let (data, w, h) = image.crop(2, 2, 10, 10);
        assert_eq!((w, h), (2, 2));
        assert_eq!(data.len(), 2 * 2 * 3);
        assert_eq!(&data[..3], &image.pixel(2, 2));
    }

    #[test]
    fn test_avg_brightness() {
        assert_eq!(avg_brightness(&[]), 0.0);
        assert!((avg_brightness(&[0, 255]) - 127.5).abs() < 1e-4);
    }

    #[test]
    fn test_laplacian_flat_is_zero() {
        let gray = vec![80u8; 16 * 16];
        assert_eq!(laplacian_variance(&gray, 16, 16), 0.0);
    }

    #[test]
    fn test_laplacian_checkerboard_is_sharp() {
        let gray: Vec<u8> = (0..16 * 16).map(|i| if (i / 16 + i % 16) % 2 == 0 { 0 } else { 255 }).collect();
        assert!(laplacian_variance(&gray, 16, 16) > 1000.0);
    }
}
