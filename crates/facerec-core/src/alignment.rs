//! Face alignment via 4-DOF similarity transform.
//!
//! Warps an RGB face to the canonical 112x112 ArcFace position using the five
//! InsightFace reference landmarks.

use crate::detector::bilinear_rgb;
use crate::frame::ImageRef;

/// ArcFace reference landmarks for a 112x112 output.
pub(crate) const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: usize = 112;

/// Scale + rotation + translation:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl SimilarityTransform {
    pub const IDENTITY: Self = Self { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 };

    /// Least-squares fit mapping `src` onto `dst`.
    ///
    /// Solved in closed form on centred points. Falls back to identity when
    /// every source point coincides.
    pub fn estimate(src: &[(f32, f32)], dst: &[(f32, f32)]) -> Self {
        let n = src.len().min(dst.len());
        if n == 0 {
            return Self::IDENTITY;
        }
        let mean = |pts: &[(f32, f32)]| {
            let (sx, sy) = pts[..n].iter().fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
            (sx / n as f32, sy / n as f32)
        };
        let (msx, msy) = mean(src);
        let (mdx, mdy) = mean(dst);

        let (mut dot, mut cross, mut norm) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst).take(n) {
            let (sx, sy, dx, dy) = (sx - msx, sy - msy, dx - mdx, dy - mdy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            norm += sx * sx + sy * sy;
        }
        if norm < 1e-12 {
            return Self::IDENTITY;
        }

        let a = dot / norm;
        let b = cross / norm;
        Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        }
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (self.a * x - self.b * y + self.tx, self.b * x + self.a * y + self.ty)
    }

    /// Map a destination point back to the source. `None` for a degenerate transform.
    pub fn invert(&self, (x, y): (f32, f32)) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (dx, dy) = (x - self.tx, y - self.ty);
        Some(((self.a * dx + self.b * dy) / det, (-self.b * dx + self.a * dy) / det))
    }
}

/// Warp `image` through `transform` into an `out_size` x `out_size` RGB8 crop.
///
/// Bilinear sampling; pixels mapping outside the source are black.
pub fn warp_affine(image: &ImageRef<'_>, transform: &SimilarityTransform, out_size: usize) -> Vec<u8> {
    let mut output = vec![0u8; out_size * out_size * 3];
    let (w, h) = (image.width as f32, image.height as f32);

    for oy in 0..out_size {
        for ox in 0..out_size {
            let Some((sx, sy)) = transform.invert((ox as f32, oy as f32)) else {
                return output;
            };
            if sx < -1.0 || sy < -1.0 || sx > w || sy > h {
                continue;
            }
            let rgb = bilinear_rgb(image, sx, sy);
            let off = (oy * out_size + ox) * 3;
            for (c, value) in rgb.iter().enumerate() {
                output[off + c] = value.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    output
}

/// Align a detected face to a canonical 112x112 RGB crop from its five landmarks.
pub fn align_face(image: &ImageRef<'_>, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    let transform = SimilarityTransform::estimate(landmarks, &REFERENCE_LANDMARKS_112);
    warp_affine(image, &transform, ALIGNED_SIZE)
}
