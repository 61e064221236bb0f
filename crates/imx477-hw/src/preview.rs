//! Demosaiced preview: full-colour, downsized view of a Bayer region.

use crate::frame::{BayerFrame, FrameError, Rgb16Image};
use bayer::{BayerDepth, Demosaic, RasterDepth, RasterMut};
use image::imageops::{self, FilterType};
use std::io::Cursor;

/// Default shrink factor per axis.
pub const PREVIEW_DOWNSCALE: u32 = 4;

/// Lift samples of `bit_depth` bits to the top of a 16-bit word.
fn widen(sample: u16, bit_depth: u8) -> u16 {
    let shift = 16u32.saturating_sub(bit_depth as u32);
    ((sample as u32) << shift).min(u16::MAX as u32) as u16
}

/// Bilinear demosaic at full resolution, 16 bits per channel.
pub fn demosaic(frame: &BayerFrame) -> Result<Rgb16Image, FrameError> {
    if frame.width < 2 || frame.height < 2 {
        return Err(FrameError::RegionTooSmall {
            width: frame.width,
            height: frame.height,
        });
    }
    let width = frame.width as usize;
    let height = frame.height as usize;

    let bayer_bytes: Vec<u8> = frame
        .data
        .iter()
        .flat_map(|&v| widen(v, frame.bit_depth).to_le_bytes())
        .collect();
    let mut output_buf = vec![0u8; width * height * 3 * 2];

    {
        let mut raster = RasterMut::new(width, height, RasterDepth::Depth16, &mut output_buf);
        let mut cursor = Cursor::new(&bayer_bytes[..]);
        bayer::run_demosaic(
            &mut cursor,
            BayerDepth::Depth16LE,
            frame.pattern.to_bayer_cfa(),
            Demosaic::Linear,
            &mut raster,
        )
        .map_err(|e| FrameError::Demosaic(format!("{e:?}")))?;
    }

    // The raster holds native-endian u16 values.
    let rgb: Vec<u16> = output_buf
        .chunks_exact(2)
        .map(|b| u16::from_ne_bytes([b[0], b[1]]))
        .collect();
    let actual = rgb.len();
    Rgb16Image::from_raw(frame.width, frame.height, rgb).ok_or(FrameError::InvalidLength {
        expected: width * height * 3,
        actual,
    })
}

/// Demosaic, then shrink by `downscale` in each axis with a bilinear filter.
pub fn preview(frame: &BayerFrame, downscale: u32) -> Result<Rgb16Image, FrameError> {
    let rgb = demosaic(frame)?;
    if downscale <= 1 {
        return Ok(rgb);
    }
    let out_w = (rgb.width() / downscale).max(1);
    let out_h = (rgb.height() / downscale).max(1);
    tracing::trace!(
        from_w = rgb.width(),
        from_h = rgb.height(),
        out_w,
        out_h,
        "resizing preview"
    );
    Ok(imageops::resize(&rgb, out_w, out_h, FilterType::Triangle))
}
