use std::io::Cursor;
use std::path::Path;

use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use metashop::types::ImageData;

/// Random blocky texture: `block`-pixel cells of random grey in [30, 220].
/// Different seeds give visually unrelated images full of corners.
pub fn textured(size: u32, block: u32, seed: u64) -> GrayImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let cells = size.div_ceil(block);
    let levels: Vec<u8> = (0..cells * cells).map(|_| rng.gen_range(30..=220)).collect();
    GrayImage::from_fn(size, size, |x, y| {
        Luma([levels[((y / block) * cells + x / block) as usize]])
    })
}

/// Every pixel shifted by `delta` (no clipping for `textured` images).
pub fn brightened(image: &GrayImage, delta: u8) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        Luma([image.get_pixel(x, y).0[0].saturating_add(delta)])
    })
}

pub fn flat(size: u32, level: u8) -> GrayImage {
    GrayImage::from_pixel(size, size, Luma([level]))
}

pub fn png_bytes(image: &GrayImage) -> Vec<u8> {
    let mut data = Vec::new();
    DynamicImage::ImageLuma8(image.clone())
        .write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
        .unwrap();
    data
}

pub fn png(image: &GrayImage) -> ImageData {
    ImageData::new(png_bytes(image), "png")
}

pub fn write_png(path: &Path, image: &GrayImage) {
    std::fs::write(path, png_bytes(image)).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_textured_is_deterministic() {
        assert_eq!(textured(64, 8, 1), textured(64, 8, 1));
        assert_ne!(textured(64, 8, 1), textured(64, 8, 2));
    }

    #[test]
    fn test_png_decodes() {
        let decoded = image::load_from_memory(&png_bytes(&flat(16, 9))).unwrap();
        assert_eq!(decoded.width(), 16);
    }
}
