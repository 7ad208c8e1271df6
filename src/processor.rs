//! Pure, deterministic screenshot compression.
//!
//! Raw capture bytes go through a fixed transform chain: decode to 24-bit
//! color, force-fit to 854x480 with Lanczos3, quantize to a 128-color
//! palette with dithering disabled, expand back to RGB, then encode as a
//! progressive JPEG at quality 70 with chroma subsampling off so map labels
//! stay legible. Every parameter is fixed; the same input bytes always yield
//! byte-identical output.

use image::imageops::{self, FilterType};
use image::RgbImage;
use jpeg_encoder::{ColorType, Encoder, SamplingFactor};

use crate::{CompressedArtifact, PipelineError};

/// Output resolution. The source is force-fit; aspect ratio is not preserved.
pub const OUTPUT_WIDTH: u32 = 854;
pub const OUTPUT_HEIGHT: u32 = 480;

/// Palette size for the quantization pass.
pub const PALETTE_SIZE: usize = 128;

/// Fixed JPEG quality.
pub const JPEG_QUALITY: u8 = 70;

// Sample factor 1 feeds every pixel to the quantizer; slower but
// deterministic regardless of image size.
const QUANT_SAMPLE_FACTOR: i32 = 1;

/// Compress raw capture bytes into the final artifact.
///
/// No I/O, no state. Malformed input fails this one target's processing,
/// not the run.
pub fn compress(raw: &[u8]) -> Result<CompressedArtifact, PipelineError> {
    let decoded = image::load_from_memory(raw)
        .map_err(|e| PipelineError::Compression(format!("decode: {e}")))?;

    // Alpha is discarded here; captures are opaque anyway.
    let rgb = decoded.to_rgb8();
    let resized = imageops::resize(&rgb, OUTPUT_WIDTH, OUTPUT_HEIGHT, FilterType::Lanczos3);
    let quantized = quantize(&resized);

    let mut bytes = Vec::new();
    let mut encoder = Encoder::new(&mut bytes, JPEG_QUALITY);
    encoder.set_progressive(true);
    encoder.set_sampling_factor(SamplingFactor::F_1_1);
    encoder
        .encode(
            &quantized,
            OUTPUT_WIDTH as u16,
            OUTPUT_HEIGHT as u16,
            ColorType::Rgb,
        )
        .map_err(|e| PipelineError::Compression(format!("encode: {e}")))?;

    Ok(CompressedArtifact {
        bytes,
        width: OUTPUT_WIDTH,
        height: OUTPUT_HEIGHT,
    })
}

/// Reduce to a 128-color palette and expand back to full 24-bit RGB.
/// No dithering: output must be reproducible, not visually optimal.
fn quantize(img: &RgbImage) -> Vec<u8> {
    let pixel_count = (img.width() * img.height()) as usize;

    let mut rgba = Vec::with_capacity(pixel_count * 4);
    for pixel in img.pixels() {
        rgba.extend_from_slice(&[pixel[0], pixel[1], pixel[2], 255]);
    }

    let quantizer = color_quant::NeuQuant::new(QUANT_SAMPLE_FACTOR, PALETTE_SIZE, &rgba);
    let palette = quantizer.color_map_rgb();

    let mut out = Vec::with_capacity(pixel_count * 3);
    for pixel in rgba.chunks_exact(4) {
        let index = quantizer.index_of(pixel);
        out.extend_from_slice(&palette[index * 3..index * 3 + 3]);
    }
    out
}
