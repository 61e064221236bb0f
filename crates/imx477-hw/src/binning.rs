//! Spatial binning and 12-bit to 16-bit scaling of Bayer data.

use crate::controls::MonobinMode;
use crate::frame::{BayerFrame, Channel, FrameError, Gray16Image};

/// Multiplier taking summed 12-bit samples into the 16-bit output range.
pub const DEPTH_CONV: i64 = 4;

/// Bit depth `DEPTH_CONV` and black levels are expressed at.
pub const REFERENCE_BIT_DEPTH: u8 = 12;

/// Per-sample pedestal, in 12-bit ADU, removed before scaling.
/// Four samples of a 2x2 sum give a 3200 offset in output units.
pub const DEFAULT_BLACK_LEVEL: u16 = 200;

pub const DEFAULT_BIN_FACTOR: u32 = 2;

/// Knobs for turning raw mosaics into 16-bit output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingParams {
    /// Per-sample pedestal in 12-bit ADU; rescaled for other bit depths.
    pub black_level: u16,
    pub bin_factor: u32,
    /// Preview output is `1 / preview_downscale` of the region in each axis.
    pub preview_downscale: u32,
}

impl Default for ProcessingParams {
    fn default() -> Self {
        Self {
            black_level: DEFAULT_BLACK_LEVEL,
            bin_factor: DEFAULT_BIN_FACTOR,
            preview_downscale: crate::preview::PREVIEW_DOWNSCALE,
        }
    }
}

/// Block sums plus how many raw samples went into each one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sums {
    pub data: Vec<u32>,
    pub width: u32,
    pub height: u32,
    pub samples: u32,
}

/// Sum `factor x factor` blocks. Rows and columns that don't fill a whole
/// block are dropped.
pub fn bin2d<T: Copy + Into<u32>>(
    data: &[T],
    width: u32,
    height: u32,
    factor: u32,
) -> Result<Sums, FrameError> {
    let samples = match factor.checked_mul(factor) {
        Some(n) if n > 0 => n,
        _ => return Err(FrameError::InvalidBinFactor),
    };
    let expected = width as usize * height as usize;
    if data.len() != expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: data.len(),
        });
    }

    let k = factor as usize;
    let w = width as usize;
    let out_w = w / k;
    let out_h = height as usize / k;
    let mut out = vec![0u32; out_w * out_h];

    for (by, out_row) in out.chunks_exact_mut(out_w.max(1)).take(out_h).enumerate() {
        for row in by * k..by * k + k {
            let src = &data[row * w..row * w + out_w * k];
            for (bx, acc) in out_row.iter_mut().enumerate() {
                *acc = src[bx * k..bx * k + k]
                    .iter()
                    .fold(*acc, |sum, &v| sum.saturating_add(v.into()));
            }
        }
    }

    Ok(Sums {
        data: out,
        width: out_w as u32,
        height: out_h as u32,
        samples,
    })
}

impl Sums {
    /// Bin already-summed data again.
    pub fn rebin(&self, factor: u32) -> Result<Sums, FrameError> {
        let mut binned = bin2d(&self.data, self.width, self.height, factor)?;
        binned.samples = binned
            .samples
            .checked_mul(self.samples)
            .ok_or(FrameError::InvalidBinFactor)?;
        Ok(binned)
    }

    /// Scale every sum of `bit_depth`-bit samples into the 16-bit range.
    pub fn to_16bit(&self, black_level: u16, bit_depth: u8) -> Vec<u16> {
        self.data
            .iter()
            .map(|&sum| scale_to_16bit(sum, self.samples, black_level, bit_depth))
            .collect()
    }
}

/// Output multiplier for samples of `bit_depth` bits. Shallower samples are
/// lifted to where 12-bit samples would sit.
pub fn depth_conv(bit_depth: u8) -> i64 {
    DEPTH_CONV << REFERENCE_BIT_DEPTH.saturating_sub(bit_depth)
}

/// A 12-bit black level expressed in `bit_depth`-bit ADU.
pub fn black_level_at(black_level: u16, bit_depth: u8) -> i64 {
    let bl = black_level as i64;
    if bit_depth >= REFERENCE_BIT_DEPTH {
        bl << (bit_depth.min(16) - REFERENCE_BIT_DEPTH)
    } else {
        bl >> (REFERENCE_BIT_DEPTH - bit_depth)
    }
}

/// `(sum - samples * black_level) * DEPTH_CONV` at 12 bits, with both the
/// pedestal and the multiplier adjusted for other depths. Clamped to
/// `0..=65535`.
#[inline]
pub fn scale_to_16bit(sum: u32, samples: u32, black_level: u16, bit_depth: u8) -> u16 {
    let pedestal = samples as i64 * black_level_at(black_level, bit_depth);
    let v = (sum as i64 - pedestal) * depth_conv(bit_depth);
    v.clamp(0, u16::MAX as i64) as u16
}

/// Element-wise sum of every plane carrying `channel`.
fn channel_sums(frame: &BayerFrame, channel: Channel) -> Sums {
    let planes = frame.channel_planes(channel);
    let (width, height) = planes
        .first()
        .map(|p| (p.width, p.height))
        .unwrap_or((0, 0));
    let mut data = vec![0u32; width as usize * height as usize];
    for plane in &planes {
        for (acc, &v) in data.iter_mut().zip(&plane.data) {
            *acc += v as u32;
        }
    }
    Sums {
        data,
        width,
        height,
        samples: planes.len() as u32,
    }
}

/// Produce the 16-bit mono output for a monobin capture.
///
/// `Rgb` sums whole mosaic blocks. The single-layer modes pull out one
/// colour (both green sites for `Green`) and, when `bin` is set, bin that
/// layer by the same factor.
pub fn monobin(
    frame: &BayerFrame,
    mode: MonobinMode,
    bin: bool,
    params: &ProcessingParams,
) -> Result<Gray16Image, FrameError> {
    let sums = match mode.channel() {
        None => bin2d(&frame.data, frame.width, frame.height, params.bin_factor)?,
        Some(channel) => {
            let layer = channel_sums(frame, channel);
            if bin {
                layer.rebin(params.bin_factor)?
            } else {
                layer
            }
        }
    };

    if sums.width == 0 || sums.height == 0 {
        return Err(FrameError::RegionTooSmall {
            width: frame.width,
            height: frame.height,
        });
    }

    let pixels = sums.to_16bit(params.black_level, frame.bit_depth);
    let actual = pixels.len();
    Gray16Image::from_raw(sums.width, sums.height, pixels).ok_or(FrameError::InvalidLength {
        expected: sums.width as usize * sums.height as usize,
        actual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CfaPattern;

    fn frame(data: Vec<u16>, w: u32, h: u32) -> BayerFrame {
        BayerFrame::new(data, w, h, CfaPattern::Rggb, 12).unwrap()
    }

    #[test]
    fn test_bin2d_sums_blocks() {
        #[rustfmt::skip]
        let data: Vec<u16> = vec![
            1, 2, 3, 4,
            5, 6, 7, 8,
            9, 10, 11, 12,
            13, 14, 15, 16,
        ];
        let sums = bin2d(&data, 4, 4, 2).unwrap();
        assert_eq!((sums.width, sums.height, sums.samples), (2, 2, 4));
        assert_eq!(sums.data, vec![14, 22, 46, 54]);
    }

    #[test]
    fn test_bin2d_drops_partial_blocks() {
        let data = vec![1u16; 5 * 3];
        let sums = bin2d(&data, 5, 3, 2).unwrap();
        assert_eq!((sums.width, sums.height), (2, 1));
        assert_eq!(sums.data, vec![4, 4]);
    }

    #[test]
    fn test_bin2d_factor_three() {
        let data = vec![2u16; 36];
        let sums = bin2d(&data, 6, 6, 3).unwrap();
        assert_eq!(sums.data, vec![18; 4]);
        assert_eq!(sums.samples, 9);
    }

    #[test]
    fn test_bin2d_rejects_zero_factor() {
        assert!(matches!(
            bin2d(&[0u16; 4], 2, 2, 0),
            Err(FrameError::InvalidBinFactor)
        ));
    }

    #[test]
    fn test_bin2d_smaller_than_block() {
        let sums = bin2d(&[7u16], 1, 1, 2).unwrap();
        assert!(sums.data.is_empty());
        assert_eq!((sums.width, sums.height), (0, 0));
    }

    #[test]
    fn test_scale_matches_pedestal_formula() {
        // four samples of 1000: 4000 * 4 - 3200
        assert_eq!(scale_to_16bit(4000, 4, 200, 12), 12800);
        // single sample: 1000 * 4 - 800
        assert_eq!(scale_to_16bit(1000, 1, 200, 12), 3200);
    }

    #[test]
    fn test_scale_clamps() {
        assert_eq!(scale_to_16bit(100, 1, 200, 12), 0);
        assert_eq!(scale_to_16bit(4 * 4095 + 4095, 4, 0, 12), u16::MAX);
    }

    #[test]
    fn test_scale_ten_bit() {
        assert_eq!(depth_conv(10), 16);
        assert_eq!(black_level_at(200, 10), 50);
        // 250 ADU at 10 bits is 1000 ADU at 12 bits
        assert_eq!(scale_to_16bit(250, 1, 200, 10), 3200);
        assert_eq!(scale_to_16bit(1000, 4, 200, 10), 12800);
    }

    #[test]
    fn test_monobin_ten_bit_full_scale() {
        let f = BayerFrame::new(vec![1023; 16], 4, 4, CfaPattern::Rggb, 10).unwrap();
        let params = ProcessingParams {
            black_level: 0,
            ..Default::default()
        };
        let mono = monobin(&f, MonobinMode::Rgb, false, &params).unwrap();
        assert!(mono.pixels().all(|p| p.0[0] == 65472));

        // single layers land where the same light would at 12 bits
        let red = monobin(&f, MonobinMode::Red, false, &params).unwrap();
        assert_eq!(red.get_pixel(0, 0).0[0], 1023 * 16);
    }

    #[test]
    fn test_bin_factor_overflow_rejected() {
        assert!(matches!(
            bin2d(&[0u16; 4], 2, 2, 70_000),
            Err(FrameError::InvalidBinFactor)
        ));
        let sums = Sums {
            data: vec![0; 4],
            width: 2,
            height: 2,
            samples: u32::MAX,
        };
        assert!(matches!(sums.rebin(2), Err(FrameError::InvalidBinFactor)));
    }

    #[test]
    fn test_monobin_rgb_full_scale() {
        let f = frame(vec![4095; 16], 4, 4);
        let params = ProcessingParams {
            black_level: 0,
            ..Default::default()
        };
        let img = monobin(&f, MonobinMode::Rgb, false, &params).unwrap();
        assert_eq!(img.dimensions(), (2, 2));
        assert!(img.pixels().all(|p| p.0[0] == 65520));
    }

    #[test]
    fn test_monobin_layers() {
        // R=1000, G=500/600, B=300 across a 4x4 RGGB mosaic
        let data = (0..4u32)
            .flat_map(|y| {
                (0..4u32).map(move |x| match (y % 2, x % 2) {
                    (0, 0) => 1000,
                    (0, 1) => 500,
                    (1, 0) => 600,
                    _ => 300,
                })
            })
            .collect();
        let f = frame(data, 4, 4);
        let params = ProcessingParams::default();

        let red = monobin(&f, MonobinMode::Red, false, &params).unwrap();
        assert_eq!(red.dimensions(), (2, 2));
        assert_eq!(red.get_pixel(0, 0).0[0], (1000 - 200) * 4);

        let green = monobin(&f, MonobinMode::Green, false, &params).unwrap();
        assert_eq!(green.get_pixel(1, 1).0[0], (1100 - 400) * 4);

        let blue = monobin(&f, MonobinMode::Blue, false, &params).unwrap();
        assert_eq!(blue.get_pixel(1, 0).0[0], (300 - 200) * 4);

        let mono = monobin(&f, MonobinMode::Rgb, false, &params).unwrap();
        assert_eq!(mono.get_pixel(0, 0).0[0], (2400 - 800) * 4);
    }

    #[test]
    fn test_monobin_layer_with_bin() {
        let f = frame(vec![300; 64], 8, 8);
        let params = ProcessingParams::default();
        let red = monobin(&f, MonobinMode::Red, true, &params).unwrap();
        assert_eq!(red.dimensions(), (2, 2));
        assert_eq!(red.get_pixel(0, 0).0[0], (1200 - 800) * 4);
    }

    #[test]
    fn test_monobin_follows_shifted_pattern() {
        // Same mosaic cropped from an odd row: red now sits at (0, 1).
        let mut f = frame(vec![0; 16], 4, 4);
        f.pattern = CfaPattern::Gbrg;
        f.data[4] = 1200;
        let params = ProcessingParams {
            black_level: 0,
            ..Default::default()
        };
        let red = monobin(&f, MonobinMode::Red, false, &params).unwrap();
        assert_eq!(red.get_pixel(0, 0).0[0], 4800);
    }

    #[test]
    fn test_monobin_region_too_small() {
        let f = frame(vec![0; 3], 3, 1);
        let result = monobin(&f, MonobinMode::Rgb, false, &ProcessingParams::default());
        assert!(matches!(result, Err(FrameError::RegionTooSmall { .. })));
    }
}
