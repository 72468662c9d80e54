//! Feature extraction: raw image bytes to binary descriptors.
//!
//! The default [`BriefExtractor`] detects FAST-9 corners on a greyscale copy of
//! the image and describes each with a 256-pair BRIEF test over a smoothed
//! 31x31 patch, producing descriptors comparable by Hamming distance.

use image::imageops::{self, FilterType};
use image::{GrayImage, ImageFormat};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::ExtractionConfig;
use crate::error::Result;
use crate::types::{Descriptor, ImageData, DESCRIPTOR_BITS, DESCRIPTOR_BYTES};

/// Turns one image into descriptors. An image too plain to yield keypoints
/// produces an empty vector; undecodable bytes produce an error.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, image: &ImageData) -> Result<Vec<Descriptor>>;
}

const PATCH_HALF: i32 = 15;
const MARGIN: i32 = PATCH_HALF + 1;
const FAST_ARC: usize = 9;
const BLUR_SIGMA: f32 = 1.2;
const PATTERN_SEED: u64 = 0x4252_4945_4600_0001;

/// Bresenham circle of radius 3 around the candidate pixel.
const CIRCLE: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keypoint {
    pub x: u32,
    pub y: u32,
    pub score: u32,
}

pub struct BriefExtractor {
    max_features: usize,
    threshold: i16,
    max_dimension: u32,
    pattern: Vec<((i32, i32), (i32, i32))>,
}

impl BriefExtractor {
    pub fn new(config: &ExtractionConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let point = |rng: &mut StdRng| {
            (
                rng.gen_range(-PATCH_HALF..=PATCH_HALF),
                rng.gen_range(-PATCH_HALF..=PATCH_HALF),
            )
        };
        let pattern = (0..DESCRIPTOR_BITS)
            .map(|_| (point(&mut rng), point(&mut rng)))
            .collect();

        Self {
            max_features: config.max_features,
            threshold: i16::from(config.fast_threshold),
            max_dimension: config.max_dimension,
            pattern,
        }
    }

    /// Decode to greyscale, downscaling so the longest side fits `max_dimension`.
    pub fn decode(&self, image: &ImageData) -> Result<GrayImage> {
        let decoded = match ImageFormat::from_extension(image.extension.trim_start_matches('.')) {
            Some(format) => image::load_from_memory_with_format(&image.data, format)
                .or_else(|_| image::load_from_memory(&image.data))?,
            None => image::load_from_memory(&image.data)?,
        };
        let gray = decoded.to_luma8();

        let (w, h) = gray.dimensions();
        let longest = w.max(h);
        if longest <= self.max_dimension {
            return Ok(gray);
        }
        let scale = self.max_dimension as f32 / longest as f32;
        let nw = ((w as f32 * scale).round() as u32).max(1);
        let nh = ((h as f32 * scale).round() as u32).max(1);
        Ok(imageops::resize(&gray, nw, nh, FilterType::Triangle))
    }

    /// FAST-9 corners with 3x3 non-maximum suppression, strongest first.
    pub fn detect(&self, gray: &GrayImage) -> Vec<Keypoint> {
        let (w, h) = gray.dimensions();
        let (w, h) = (w as i32, h as i32);
        if w <= 2 * MARGIN || h <= 2 * MARGIN {
            return Vec::new();
        }

        let cols = w as usize;
        let mut scores = vec![0u32; cols * h as usize];
        for y in MARGIN..h - MARGIN {
            for x in MARGIN..w - MARGIN {
                scores[y as usize * cols + x as usize] = self.corner_score(gray, x, y);
            }
        }

        let mut keypoints = Vec::new();
        for y in MARGIN..h - MARGIN {
            for x in MARGIN..w - MARGIN {
                let at = y as usize * cols + x as usize;
                let score = scores[at];
                if score == 0 {
                    continue;
                }
                let mut is_max = true;
                'nms: for dy in -1..=1 {
                    for dx in -1..=1 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let other = scores[(y + dy) as usize * cols + (x + dx) as usize];
                        let earlier = dy < 0 || (dy == 0 && dx < 0);
                        if other > score || (other == score && earlier) {
                            is_max = false;
                            break 'nms;
                        }
                    }
                }
                if is_max {
                    keypoints.push(Keypoint {
                        x: x as u32,
                        y: y as u32,
                        score,
                    });
                }
            }
        }

        keypoints.sort_by(|a, b| b.score.cmp(&a.score));
        keypoints.truncate(self.max_features);
        keypoints
    }

    /// Sum of the circle's excess contrast when it holds a contiguous arc of at
    /// least nine uniformly brighter or darker pixels, else zero.
    fn corner_score(&self, gray: &GrayImage, x: i32, y: i32) -> u32 {
        let center = i16::from(pixel(gray, x, y));
        let t = self.threshold;

        let mut diffs = [0i16; 16];
        for (i, (dx, dy)) in CIRCLE.iter().enumerate() {
            diffs[i] = i16::from(pixel(gray, x + dx, y + dy)) - center;
        }

        let has_arc = |bright: bool| {
            let mut run = 0usize;
            for i in 0..CIRCLE.len() * 2 {
                let d = diffs[i % CIRCLE.len()];
                let hit = if bright { d > t } else { d < -t };
                if hit {
                    run += 1;
                    if run >= FAST_ARC {
                        return true;
                    }
                } else {
                    run = 0;
                }
            }
            false
        };

        if !has_arc(true) && !has_arc(false) {
            return 0;
        }
        diffs
            .iter()
            .map(|d| (d.abs() - t).max(0) as u32)
            .sum()
    }

    /// BRIEF bit tests around each keypoint on a smoothed copy of the image.
    pub fn describe(&self, gray: &GrayImage, keypoints: &[Keypoint]) -> Vec<Descriptor> {
        let smoothed = imageops::blur(gray, BLUR_SIGMA);
        keypoints
            .iter()
            .map(|kp| {
                let (x, y) = (kp.x as i32, kp.y as i32);
                let mut bytes = [0u8; DESCRIPTOR_BYTES];
                for (bit, ((ax, ay), (bx, by))) in self.pattern.iter().enumerate() {
                    let a = pixel(&smoothed, x + ax, y + ay);
                    let b = pixel(&smoothed, x + bx, y + by);
                    if a < b {
                        bytes[bit / 8] |= 1 << (bit % 8);
                    }
                }
                Descriptor(bytes)
            })
            .collect()
    }
}

impl FeatureExtractor for BriefExtractor {
    fn extract(&self, image: &ImageData) -> Result<Vec<Descriptor>> {
        let gray = self.decode(image)?;
        let keypoints = self.detect(&gray);
        let descriptors = self.describe(&gray, &keypoints);
        debug!(
            width = gray.width(),
            height = gray.height(),
            descriptors = descriptors.len(),
            "extracted descriptors"
        );
        Ok(descriptors)
    }
}

#[inline]
fn pixel(gray: &GrayImage, x: i32, y: i32) -> u8 {
    let x = x.clamp(0, gray.width() as i32 - 1) as u32;
    let y = y.clamp(0, gray.height() as i32 - 1) as u32;
    gray.get_pixel(x, y).0[0]
}
