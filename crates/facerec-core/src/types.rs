/// Bounding box for a detected face in source pixel coordinates, with optional landmarks.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// `[x1, y1, x2, y2]` scaled into `[0, 1]` by the image size.
    pub fn normalized(&self, image_width: u32, image_height: u32) -> [f64; 4] {
        let w = image_width.max(1) as f64;
        let h = image_height.max(1) as f64;
        [
            (self.x as f64 / w).clamp(0.0, 1.0),
            (self.y as f64 / h).clamp(0.0, 1.0),
            ((self.x + self.width) as f64 / w).clamp(0.0, 1.0),
            ((self.y + self.height) as f64 / h).clamp(0.0, 1.0),
        ]
    }

    /// Inverse of [`normalized`](Self::normalized). Landmarks are not carried.
    pub fn from_normalized(bbox: [f64; 4], image_width: u32, image_height: u32, confidence: f32) -> Self {
        let w = image_width as f64;
        let h = image_height as f64;
        Self {
            x: (bbox[0] * w) as f32,
            y: (bbox[1] * h) as f32,
            width: ((bbox[2] - bbox[0]) * w) as f32,
            height: ((bbox[3] - bbox[1]) * h) as f32,
            confidence,
            landmarks: None,
        }
    }
}

/// Face embedding vector (512-dimensional for the bundled ArcFace models).
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

/// Comparison outcome shared by search and verification.
///
/// `score` is the cosine similarity clamped to `[0, 1]`; `distance` is
/// `1 - similarity` and therefore lies in `[0, 2]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub similarity: f32,
    pub score: f32,
    pub distance: f32,
}

impl Similarity {
    pub fn between(a: &Embedding, b: &Embedding) -> Self {
        let similarity = a.similarity(b);
        Self {
            similarity,
            score: similarity.clamp(0.0, 1.0),
            distance: 1.0 - similarity,
        }
    }
}

/// One ranked candidate returned by an index search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub uuid: String,
    /// Position of the entry at search time.
    pub index: usize,
    pub score: f32,
    pub distance: f32,
}
