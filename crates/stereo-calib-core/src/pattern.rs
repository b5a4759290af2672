use crate::CoreError;
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

/// Planar checkerboard described by its interior corner grid.
///
/// `cols` corners per row, `rows` rows, `square_size` edge length in the unit
/// the translations should come out in.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatternSpec {
    pub rows: usize,
    pub cols: usize,
    pub square_size: f64,
}

impl Default for PatternSpec {
    fn default() -> Self {
        Self {
            rows: 6,
            cols: 9,
            square_size: 30.0,
        }
    }
}

impl PatternSpec {
    pub fn new(rows: usize, cols: usize, square_size: f64) -> Self {
        Self {
            rows,
            cols,
            square_size,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.rows < 2
            || self.cols < 2
            || !self.square_size.is_finite()
            || self.square_size <= 0.0
        {
            return Err(CoreError::InvalidPattern {
                rows: self.rows,
                cols: self.cols,
                square_size: self.square_size,
            });
        }
        Ok(())
    }

    #[inline]
    pub fn point_count(&self) -> usize {
        self.rows * self.cols
    }

    /// Board-frame corner positions `(col * L, row * L, 0)`, column index fastest.
    pub fn object_points(&self) -> Vec<Point3<f64>> {
        self.object_points_2d()
            .into_iter()
            .map(|p| Point3::new(p.x, p.y, 0.0))
            .collect()
    }

    /// Same ordering as [`PatternSpec::object_points`], dropping `z = 0`.
    pub fn object_points_2d(&self) -> Vec<Point2<f64>> {
        let mut pts = Vec::with_capacity(self.point_count());
        for r in 0..self.rows {
            for c in 0..self.cols {
                pts.push(Point2::new(
                    c as f64 * self.square_size,
                    r as f64 * self.square_size,
                ));
            }
        }
        pts
    }

    /// Board extent `(width, height)` spanned by the corners.
    pub fn extent(&self) -> (f64, f64) {
        (
            (self.cols.saturating_sub(1)) as f64 * self.square_size,
            (self.rows.saturating_sub(1)) as f64 * self.square_size,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_points_are_row_major_with_columns_fastest() {
        let p = PatternSpec::new(2, 3, 0.5);
        let pts = p.object_points();
        assert_eq!(pts.len(), 6);
        assert_eq!(pts[0], Point3::new(0.0, 0.0, 0.0));
        assert_eq!(pts[1], Point3::new(0.5, 0.0, 0.0));
        assert_eq!(pts[3], Point3::new(0.0, 0.5, 0.0));
        assert_eq!(pts[5], Point3::new(1.0, 0.5, 0.0));
    }

    #[test]
    fn validate_rejects_degenerate_boards() {
        assert!(PatternSpec::default().validate().is_ok());
        assert!(PatternSpec::new(1, 9, 30.0).validate().is_err());
        assert!(PatternSpec::new(6, 9, 0.0).validate().is_err());
        assert!(PatternSpec::new(6, 9, f64::INFINITY).validate().is_err());
    }

    #[test]
    fn default_matches_nine_by_six_board() {
        let p = PatternSpec::default();
        assert_eq!(p.point_count(), 54);
        assert_eq!(p.extent(), (240.0, 150.0));
    }

    #[test]
    fn deserializes_from_json() {
        let p: PatternSpec =
            serde_json::from_str(r#"{"rows": 6, "cols": 9, "square_size": 0.03}"#).unwrap();
        assert_eq!(p, PatternSpec::new(6, 9, 0.03));
    }
}
