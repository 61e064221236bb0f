//! Frame types: raw Bayer mosaic, colour-site planes, processed output.

use image::{DynamicImage, ImageBuffer, Luma, Rgb};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// 16-bit single-channel output image.
pub type Gray16Image = ImageBuffer<Luma<u16>, Vec<u16>>;
/// 16-bit RGB output image.
pub type Rgb16Image = ImageBuffer<Rgb<u16>, Vec<u16>>;

/// Colour channel sampled at one mosaic site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Red,
    Green,
    Blue,
}

/// 2x2 colour filter layout, named by the top-left, top-right,
/// bottom-left, bottom-right sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CfaPattern {
    #[default]
    Rggb,
    Bggr,
    Grbg,
    Gbrg,
}

impl CfaPattern {
    fn sites(self) -> [Channel; 4] {
        use Channel::*;
        match self {
            Self::Rggb => [Red, Green, Green, Blue],
            Self::Bggr => [Blue, Green, Green, Red],
            Self::Grbg => [Green, Red, Blue, Green],
            Self::Gbrg => [Green, Blue, Red, Green],
        }
    }

    /// Channel sampled at pixel `(x, y)`.
    pub fn channel_at(self, x: u32, y: u32) -> Channel {
        self.sites()[((y % 2) * 2 + (x % 2)) as usize]
    }

    /// Pattern seen by a window whose origin is moved by `(dx, dy)`.
    pub fn shifted(self, dx: u32, dy: u32) -> Self {
        match (dx % 2, dy % 2) {
            (0, 0) => self,
            (1, 0) => match self {
                Self::Rggb => Self::Grbg,
                Self::Grbg => Self::Rggb,
                Self::Bggr => Self::Gbrg,
                Self::Gbrg => Self::Bggr,
            },
            (0, _) => match self {
                Self::Rggb => Self::Gbrg,
                Self::Gbrg => Self::Rggb,
                Self::Bggr => Self::Grbg,
                Self::Grbg => Self::Bggr,
            },
            _ => self.shifted(1, 0).shifted(0, 1),
        }
    }

    /// `(row parity, column parity)` of every site carrying `channel`.
    pub fn sites_of(self, channel: Channel) -> Vec<(u32, u32)> {
        self.sites()
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c == channel)
            .map(|(i, _)| ((i / 2) as u32, (i % 2) as u32))
            .collect()
    }

    pub(crate) fn to_bayer_cfa(self) -> bayer::CFA {
        match self {
            Self::Rggb => bayer::CFA::RGGB,
            Self::Bggr => bayer::CFA::BGGR,
            Self::Grbg => bayer::CFA::GRBG,
            Self::Gbrg => bayer::CFA::GBRG,
        }
    }
}

/// Per-channel peak sample values of the last inspected frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaxAdu {
    pub r: u16,
    pub g: u16,
    pub b: u16,
}

/// One colour-site plane pulled out of a mosaic (half size in each axis).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    pub data: Vec<u16>,
    pub width: u32,
    pub height: u32,
}

/// A raw sensor frame: one sample per pixel, laid out as a Bayer mosaic.
#[derive(Debug, Clone)]
pub struct BayerFrame {
    /// Row-major samples (width * height), right-aligned in 16 bits.
    pub data: Vec<u16>,
    pub width: u32,
    pub height: u32,
    pub pattern: CfaPattern,
    pub bit_depth: u8,
    pub timestamp: Instant,
    pub sequence: u32,
}

impl BayerFrame {
    pub fn new(
        data: Vec<u16>,
        width: u32,
        height: u32,
        pattern: CfaPattern,
        bit_depth: u8,
    ) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            pattern,
            bit_depth,
            timestamp: Instant::now(),
            sequence: 0,
        })
    }

    /// Unpack a raw buffer of little-endian 16-bit samples with an arbitrary
    /// row stride (in bytes).
    pub fn from_le_bytes(
        buf: &[u8],
        width: u32,
        height: u32,
        stride: usize,
        pattern: CfaPattern,
        bit_depth: u8,
    ) -> Result<Self, FrameError> {
        let row_bytes = width as usize * 2;
        let stride = stride.max(row_bytes);
        let needed = match height as usize {
            0 => 0,
            h => stride * (h - 1) + row_bytes,
        };
        if buf.len() < needed {
            return Err(FrameError::InvalidLength {
                expected: needed,
                actual: buf.len(),
            });
        }

        let mut data = Vec::with_capacity(width as usize * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            data.extend(
                buf[start..start + row_bytes]
                    .chunks_exact(2)
                    .map(|b| u16::from_le_bytes([b[0], b[1]])),
            );
        }
        Self::new(data, width, height, pattern, bit_depth)
    }

    #[inline]
    pub fn sample(&self, x: u32, y: u32) -> u16 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy out a window. Out-of-range bounds are clamped, so the result may
    /// be smaller than requested (or empty). The pattern follows the origin.
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> BayerFrame {
        let x0 = x.min(self.width);
        let y0 = y.min(self.height);
        let x1 = x.saturating_add(width).min(self.width);
        let y1 = y.saturating_add(height).min(self.height);
        let w = x1 - x0;
        let h = y1 - y0;

        let mut data = Vec::with_capacity(w as usize * h as usize);
        for row in y0..y1 {
            let start = row as usize * self.width as usize;
            data.extend_from_slice(&self.data[start + x0 as usize..start + x1 as usize]);
        }

        BayerFrame {
            data,
            width: w,
            height: h,
            pattern: self.pattern.shifted(x0, y0),
            bit_depth: self.bit_depth,
            timestamp: self.timestamp,
            sequence: self.sequence,
        }
    }

    /// Rows `y..y + height` across the full width.
    pub fn crop_rows(&self, y: u32, height: u32) -> BayerFrame {
        self.crop(0, y, self.width, height)
    }

    /// Samples at `(row_parity, col_parity)` sites. Odd trailing rows and
    /// columns are dropped so every plane of a frame has the same size.
    pub fn plane(&self, row_parity: u32, col_parity: u32) -> Plane {
        let pw = self.width / 2;
        let ph = self.height / 2;
        let mut data = Vec::with_capacity(pw as usize * ph as usize);
        for py in 0..ph {
            let y = py * 2 + row_parity % 2;
            for px in 0..pw {
                data.push(self.sample(px * 2 + col_parity % 2, y));
            }
        }
        Plane {
            data,
            width: pw,
            height: ph,
        }
    }

    /// Every plane carrying `channel` (two for green, one otherwise).
    pub fn channel_planes(&self, channel: Channel) -> Vec<Plane> {
        self.pattern
            .sites_of(channel)
            .into_iter()
            .map(|(r, c)| self.plane(r, c))
            .collect()
    }

    /// Peak value per channel; green covers both green sites. Unlike the
    /// planes, trailing odd rows and columns are included.
    pub fn max_adu(&self) -> MaxAdu {
        let mut adu = MaxAdu::default();
        if self.width == 0 {
            return adu;
        }
        for (y, row) in self.data.chunks_exact(self.width as usize).enumerate() {
            for (x, &v) in row.iter().enumerate() {
                let peak = match self.pattern.channel_at(x as u32, y as u32) {
                    Channel::Red => &mut adu.r,
                    Channel::Green => &mut adu.g,
                    Channel::Blue => &mut adu.b,
                };
                *peak = (*peak).max(v);
            }
        }
        adu
    }
}

/// A processed frame handed back to the caller.
#[derive(Debug, Clone)]
pub struct Frame {
    /// `ImageLuma16` for binned output, `ImageRgb16` for preview.
    pub image: DynamicImage,
    pub timestamp: Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_mono(&self) -> bool {
        matches!(self.image, DynamicImage::ImageLuma16(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("region {width}x{height} too small for processing")]
    RegionTooSmall { width: u32, height: u32 },
    #[error("bin factor must be at least 1 and its square must fit in u32")]
    InvalidBinFactor,
    #[error("demosaic failed: {0}")]
    Demosaic(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 4x4 mosaic whose samples encode their own position: 10*y + x.
    fn indexed_frame() -> BayerFrame {
        let data = (0..4u16)
            .flat_map(|y| (0..4u16).map(move |x| y * 10 + x))
            .collect();
        BayerFrame::new(data, 4, 4, CfaPattern::Rggb, 12).unwrap()
    }

    #[test]
    fn test_new_rejects_wrong_length() {
        let result = BayerFrame::new(vec![0; 7], 4, 2, CfaPattern::Rggb, 12);
        assert!(matches!(
            result,
            Err(FrameError::InvalidLength { expected: 8, actual: 7 })
        ));
    }

    #[test]
    fn test_from_le_bytes_with_padding() {
        // 2x2 frame, rows padded to 6 bytes
        let buf = [1, 0, 2, 0, 0xff, 0xff, 3, 0, 0x00, 0x10, 0xff, 0xff];
        let f = BayerFrame::from_le_bytes(&buf, 2, 2, 6, CfaPattern::Rggb, 12).unwrap();
        assert_eq!(f.data, vec![1, 2, 3, 4096]);
    }

    #[test]
    fn test_from_le_bytes_short_buffer() {
        let buf = [0u8; 6];
        assert!(BayerFrame::from_le_bytes(&buf, 2, 2, 4, CfaPattern::Rggb, 12).is_err());
    }

    #[test]
    fn test_channel_at_rggb() {
        let p = CfaPattern::Rggb;
        assert_eq!(p.channel_at(0, 0), Channel::Red);
        assert_eq!(p.channel_at(1, 0), Channel::Green);
        assert_eq!(p.channel_at(0, 1), Channel::Green);
        assert_eq!(p.channel_at(1, 1), Channel::Blue);
        assert_eq!(p.channel_at(3, 5), Channel::Blue);
    }

    #[test]
    fn test_shifted_matches_channel_lookup() {
        for p in [
            CfaPattern::Rggb,
            CfaPattern::Bggr,
            CfaPattern::Grbg,
            CfaPattern::Gbrg,
        ] {
            for dy in 0..2 {
                for dx in 0..2 {
                    let s = p.shifted(dx, dy);
                    for y in 0..2 {
                        for x in 0..2 {
                            assert_eq!(s.channel_at(x, y), p.channel_at(x + dx, y + dy));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_plane_parity() {
        let f = indexed_frame();
        assert_eq!(f.plane(0, 0).data, vec![0, 2, 20, 22]);
        assert_eq!(f.plane(0, 1).data, vec![1, 3, 21, 23]);
        assert_eq!(f.plane(1, 0).data, vec![10, 12, 30, 32]);
        assert_eq!(f.plane(1, 1).data, vec![11, 13, 31, 33]);
    }

    #[test]
    fn test_plane_drops_odd_edge() {
        let data = (0..15).collect();
        let f = BayerFrame::new(data, 5, 3, CfaPattern::Rggb, 12).unwrap();
        let p = f.plane(1, 1);
        assert_eq!((p.width, p.height), (2, 1));
        assert_eq!(p.data, vec![6, 8]);
    }

    #[test]
    fn test_crop_odd_row_shifts_pattern() {
        let f = indexed_frame();
        let c = f.crop_rows(1, 2);
        assert_eq!((c.width, c.height), (4, 2));
        assert_eq!(c.pattern, CfaPattern::Gbrg);
        assert_eq!(c.data[..4], [10, 11, 12, 13]);
        // red sites of the crop are still the uncropped red sites
        assert_eq!(c.channel_planes(Channel::Red)[0].data, vec![20, 22]);
    }

    #[test]
    fn test_crop_clamps_to_bounds() {
        let f = indexed_frame();
        let c = f.crop(2, 3, 10, 10);
        assert_eq!((c.width, c.height), (2, 1));
        assert_eq!(c.data, vec![32, 33]);

        let empty = f.crop(0, 8, 4, 2);
        assert!(empty.is_empty());
        assert_eq!(empty.height, 0);
    }

    #[test]
    fn test_max_adu_per_channel() {
        let f = indexed_frame();
        let adu = f.max_adu();
        assert_eq!(adu, MaxAdu { r: 22, g: 32, b: 33 });
    }

    #[test]
    fn test_max_adu_includes_odd_edges() {
        let f = BayerFrame::new(vec![10, 20, 4000, 5, 6, 7], 3, 2, CfaPattern::Rggb, 12).unwrap();
        assert_eq!(f.max_adu(), MaxAdu { r: 4000, g: 20, b: 6 });

        // odd height: the last row holds the brightest green and red
        let f = BayerFrame::new(vec![1, 2, 3, 4, 900, 800], 2, 3, CfaPattern::Rggb, 12).unwrap();
        assert_eq!(f.max_adu(), MaxAdu { r: 900, g: 800, b: 4 });
    }

    #[test]
    fn test_max_adu_empty_frame() {
        let f = BayerFrame::new(vec![], 0, 0, CfaPattern::Rggb, 12).unwrap();
        assert_eq!(f.max_adu(), MaxAdu::default());
    }
}
