use crate::frame::{DecodedFrame, Rgb};

/// Pixel bounds `[x0, x1) × [y0, y1)` of the sampled region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl Region {
    /// Square of side `size` centered on the frame, clamped to its bounds.
    ///
    /// The region spans `size / 2` pixels either side of the center pixel and
    /// always covers at least the center pixel itself.
    pub fn centered(width: u32, height: u32, size: u32) -> Self {
        let half = size / 2;
        let (cx, cy) = (width / 2, height / 2);
        let x0 = cx.saturating_sub(half);
        let y0 = cy.saturating_sub(half);
        let mut x1 = (cx + half).min(width);
        let mut y1 = (cy + half).min(height);
        if x1 <= x0 {
            x1 = (x0 + 1).min(width);
        }
        if y1 <= y0 {
            y1 = (y0 + 1).min(height);
        }
        Self { x0, y0, x1, y1 }
    }

    pub fn area(&self) -> u64 {
        u64::from(self.x1 - self.x0) * u64::from(self.y1 - self.y0)
    }
}

/// Mean color over `region`, each channel truncated to u8.
pub fn region_mean(frame: &DecodedFrame, region: Region) -> Option<Rgb> {
    let area = region.area();
    if area == 0 {
        return None;
    }
    let width = frame.width() as usize;
    let pixels = frame.pixels();
    let mut sums = [0u64; 3];
    for y in region.y0..region.y1 {
        let row = (y as usize * width + region.x0 as usize) * 3;
        let end = (y as usize * width + region.x1 as usize) * 3;
        for px in pixels.get(row..end)?.chunks_exact(3) {
            sums[0] += u64::from(px[0]);
            sums[1] += u64::from(px[1]);
            sums[2] += u64::from(px[2]);
        }
    }
    Some(Rgb::new(
        (sums[0] / area) as u8,
        (sums[1] / area) as u8,
        (sums[2] / area) as u8,
    ))
}

/// Mean color of the centered square of side `size`.
pub fn center_mean(frame: &DecodedFrame, size: u32) -> Option<Rgb> {
    region_mean(frame, Region::centered(frame.width(), frame.height(), size))
}
