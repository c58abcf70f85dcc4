//! Cropping of unpainted borders

use serde::{Deserialize, Serialize};

/// Rectangle in canvas pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Top,
    Bottom,
    Left,
    Right,
}

impl Edge {
    pub const ALL: [Edge; 4] = [Edge::Top, Edge::Bottom, Edge::Left, Edge::Right];
}

/// Smallest rectangle holding every painted pixel
pub fn painted_bounds(painted: &[bool], width: usize, height: usize) -> Option<CropRect> {
    let (mut x0, mut y0, mut x1, mut y1) = (usize::MAX, usize::MAX, 0, 0);
    for y in 0..height {
        let row = &painted[y * width..(y + 1) * width];
        let (Some(first), Some(last)) = (row.iter().position(|&p| p), row.iter().rposition(|&p| p))
        else {
            continue;
        };
        x0 = x0.min(first);
        x1 = x1.max(last);
        y0 = y0.min(y);
        y1 = y1.max(y);
    }
    if x0 == usize::MAX {
        return None;
    }
    Some(CropRect {
        x: x0,
        y: y0,
        width: x1 - x0 + 1,
        height: y1 - y0 + 1,
    })
}

/// Share of unpainted pixels along one edge of `rect`
pub fn edge_unpainted_fraction(painted: &[bool], stride: usize, rect: &CropRect, edge: Edge) -> f32 {
    let (count, unpainted) = match edge {
        Edge::Top | Edge::Bottom => {
            let y = if edge == Edge::Top {
                rect.y
            } else {
                rect.y + rect.height - 1
            };
            let row = &painted[y * stride + rect.x..y * stride + rect.x + rect.width];
            (rect.width, row.iter().filter(|&&p| !p).count())
        }
        Edge::Left | Edge::Right => {
            let x = if edge == Edge::Left {
                rect.x
            } else {
                rect.x + rect.width - 1
            };
            let unpainted = (rect.y..rect.y + rect.height)
                .filter(|&y| !painted[y * stride + x])
                .count();
            (rect.height, unpainted)
        }
    };
    unpainted as f32 / count.max(1) as f32
}

/// Shrink the painted bounds, worst edge first, until no edge has more than
/// `max_unpainted` of its pixels unpainted
pub fn crop_to_painted(
    painted: &[bool],
    width: usize,
    height: usize,
    max_unpainted: f32,
) -> Option<CropRect> {
    let mut rect = painted_bounds(painted, width, height)?;

    loop {
        let shrinkable = |edge: Edge| match edge {
            Edge::Top | Edge::Bottom => rect.height > 1,
            Edge::Left | Edge::Right => rect.width > 1,
        };
        let worst = Edge::ALL
            .iter()
            .map(|&edge| (edge, edge_unpainted_fraction(painted, width, &rect, edge)))
            .filter(|&(edge, fraction)| fraction > max_unpainted && shrinkable(edge))
            .fold(None, |best: Option<(Edge, f32)>, item| match best {
                Some(b) if b.1 >= item.1 => Some(b),
                _ => Some(item),
            });

        let Some((edge, _)) = worst else {
            return Some(rect);
        };

        match edge {
            Edge::Top => {
                rect.y += 1;
                rect.height -= 1;
            }
            Edge::Bottom => rect.height -= 1,
            Edge::Left => {
                rect.x += 1;
                rect.width -= 1;
            }
            Edge::Right => rect.width -= 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(width: usize, height: usize, f: impl Fn(usize, usize) -> bool) -> Vec<bool> {
        (0..width * height).map(|i| f(i % width, i / width)).collect()
    }

    #[test]
    fn test_bounds_of_empty_mask() {
        assert_eq!(painted_bounds(&[false; 12], 4, 3), None);
    }

    #[test]
    fn test_full_mask_keeps_everything() {
        let painted = vec![true; 20 * 10];
        let rect = crop_to_painted(&painted, 20, 10, 0.0).unwrap();
        assert_eq!(
            rect,
            CropRect {
                x: 0,
                y: 0,
                width: 20,
                height: 10
            }
        );
    }

    #[test]
    fn test_staggered_frames_are_cropped_clean() {
        // two 10x8 frames, second placed 6 right and 2 down
        let painted = mask(16, 10, |x, y| {
            (x < 10 && y < 8) || ((6..16).contains(&x) && (2..10).contains(&y))
        });
        let rect = crop_to_painted(&painted, 16, 10, 0.0).unwrap();
        for edge in Edge::ALL {
            assert_eq!(edge_unpainted_fraction(&painted, 16, &rect, edge), 0.0);
        }
        assert!(rect.width >= 10 && rect.height >= 6);
    }

    #[test]
    fn test_tolerance_allows_some_black() {
        let painted = mask(10, 10, |x, y| !(x == 0 && y == 0));
        let rect = crop_to_painted(&painted, 10, 10, 0.2).unwrap();
        assert_eq!(rect.width, 10);
        assert_eq!(rect.height, 10);
    }
}
