use crate::window::{Geometry, Point};

/// Maps grid window coordinates to instance cells.
///
/// The grid is drawn on the overlay canvas, which is letterboxed inside the
/// grid window when their aspect ratios differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridGeometry {
    pub columns: u32,
    pub rows: u32,
    /// Area of the window covered by the grid, window-relative.
    pub area: Geometry,
    count: usize,
}

impl GridGeometry {
    pub fn new(
        count: usize,
        columns: Option<u32>,
        window: Geometry,
        canvas: Option<(u32, u32)>,
    ) -> Self {
        let count_u32 = u32::try_from(count.max(1)).unwrap_or(u32::MAX);
        let columns = columns
            .filter(|&c| c > 0)
            .unwrap_or_else(|| (count_u32 as f64).sqrt().ceil() as u32)
            .max(1);
        let rows = count_u32.div_ceil(columns);
        Self {
            columns,
            rows,
            area: letterbox(window.width, window.height, canvas),
            count,
        }
    }

    /// Cell under `point`, if it lands on an instance.
    pub fn cell_at(&self, point: Point) -> Option<usize> {
        let x = i64::from(point.x) - i64::from(self.area.x);
        let y = i64::from(point.y) - i64::from(self.area.y);
        let (w, h) = (i64::from(self.area.width), i64::from(self.area.height));
        if x < 0 || y < 0 || x >= w || y >= h {
            return None;
        }
        let col = x * i64::from(self.columns) / w;
        let row = y * i64::from(self.rows) / h;
        let id = usize::try_from(row * i64::from(self.columns) + col).ok()?;
        (id < self.count).then_some(id)
    }
}

fn letterbox(width: u32, height: u32, canvas: Option<(u32, u32)>) -> Geometry {
    let full = Geometry::sized(width, height);
    let Some((cw, ch)) = canvas else {
        return full;
    };
    if cw == 0 || ch == 0 || width == 0 || height == 0 {
        return full;
    }
    let (w, h, cw, ch) = (
        u64::from(width),
        u64::from(height),
        u64::from(cw),
        u64::from(ch),
    );
    // Scale the canvas to the largest size that fits, keeping its aspect.
    let (inner_w, inner_h) = if w * ch <= h * cw {
        (w, w * ch / cw)
    } else {
        (h * cw / ch, h)
    };
    Geometry {
        x: ((w - inner_w) / 2) as i32,
        y: ((h - inner_h) / 2) as i32,
        width: inner_w as u32,
        height: inner_h as u32,
    }
}
