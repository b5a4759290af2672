//! Observation data model and the corner-detector seam.

use crate::{CoreError, GrayImageView, PatternSpec};
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

/// Camera side of a stereo rig.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Left => f.write_str("left"),
            Side::Right => f.write_str("right"),
        }
    }
}

/// Outcome of running a corner detector on one image.
///
/// Serialized as the ordered corner list, or `null` when nothing was found.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "Option<Vec<Point2<f64>>>",
    into = "Option<Vec<Point2<f64>>>"
)]
pub enum Detection {
    /// Corners in [`PatternSpec::object_points`] order.
    Found(Vec<Point2<f64>>),
    NotFound,
}

impl Detection {
    pub fn is_found(&self) -> bool {
        matches!(self, Detection::Found(_))
    }

    pub fn points(&self) -> Option<&[Point2<f64>]> {
        match self {
            Detection::Found(pts) => Some(pts),
            Detection::NotFound => None,
        }
    }
}

impl From<Option<Vec<Point2<f64>>>> for Detection {
    fn from(value: Option<Vec<Point2<f64>>>) -> Self {
        value.map_or(Detection::NotFound, Detection::Found)
    }
}

impl From<Detection> for Option<Vec<Point2<f64>>> {
    fn from(value: Detection) -> Self {
        match value {
            Detection::Found(pts) => Some(pts),
            Detection::NotFound => None,
        }
    }
}

/// Raw detections of one synchronized frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FramePair {
    pub left: Detection,
    pub right: Detection,
}

/// Why a frame did not become a [`ViewSample`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrameRejection {
    NotFound { side: Side },
    PointCount {
        side: Side,
        expected: usize,
        got: usize,
    },
}

impl std::fmt::Display for FrameRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameRejection::NotFound { side } => write!(f, "no corners found in {side} image"),
            FrameRejection::PointCount {
                side,
                expected,
                got,
            } => write!(f, "{side} image has {got} corners, expected {expected}"),
        }
    }
}

impl FramePair {
    pub fn new(left: Detection, right: Detection) -> Self {
        Self { left, right }
    }

    /// Pair both detections with the pattern's object points.
    pub fn to_sample(&self, pattern: &PatternSpec) -> Result<ViewSample, FrameRejection> {
        let expected = pattern.point_count();
        let check = |side: Side, det: &Detection| -> Result<Vec<Point2<f64>>, FrameRejection> {
            let pts = det.points().ok_or(FrameRejection::NotFound { side })?;
            if pts.len() != expected {
                return Err(FrameRejection::PointCount {
                    side,
                    expected,
                    got: pts.len(),
                });
            }
            Ok(pts.to_vec())
        };
        let left = check(Side::Left, &self.left)?;
        let right = check(Side::Right, &self.right)?;
        Ok(ViewSample {
            object_points: pattern.object_points(),
            left,
            right,
        })
    }
}

/// Object points plus both cameras' observations of one frame.
///
/// All three lists always have the same length.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ViewSampleParts")]
pub struct ViewSample {
    object_points: Vec<Point3<f64>>,
    left: Vec<Point2<f64>>,
    right: Vec<Point2<f64>>,
}

#[derive(Deserialize)]
struct ViewSampleParts {
    object_points: Vec<Point3<f64>>,
    left: Vec<Point2<f64>>,
    right: Vec<Point2<f64>>,
}

impl TryFrom<ViewSampleParts> for ViewSample {
    type Error = CoreError;

    fn try_from(parts: ViewSampleParts) -> Result<Self, CoreError> {
        Self::new(parts.object_points, parts.left, parts.right)
    }
}

impl ViewSample {
    pub fn new(
        object_points: Vec<Point3<f64>>,
        left: Vec<Point2<f64>>,
        right: Vec<Point2<f64>>,
    ) -> Result<Self, CoreError> {
        let expected = object_points.len();
        for got in [left.len(), right.len()] {
            if got != expected {
                return Err(CoreError::PointCountMismatch { expected, got });
            }
        }
        Ok(Self {
            object_points,
            left,
            right,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.object_points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.object_points.is_empty()
    }

    pub fn object_points(&self) -> &[Point3<f64>] {
        &self.object_points
    }

    pub fn left(&self) -> &[Point2<f64>] {
        &self.left
    }

    pub fn right(&self) -> &[Point2<f64>] {
        &self.right
    }

    /// Replace one camera's observations, keeping the point count.
    pub fn with_observations(
        mut self,
        side: Side,
        points: Vec<Point2<f64>>,
    ) -> Result<Self, CoreError> {
        if points.len() != self.len() {
            return Err(CoreError::PointCountMismatch {
                expected: self.len(),
                got: points.len(),
            });
        }
        match side {
            Side::Left => self.left = points,
            Side::Right => self.right = points,
        }
        Ok(self)
    }

    pub fn observations(&self, side: Side) -> &[Point2<f64>] {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    /// Board-plane coordinates of the object points (`z` dropped).
    pub fn object_xy(&self) -> Vec<Point2<f64>> {
        self.object_points
            .iter()
            .map(|p| Point2::new(p.x, p.y))
            .collect()
    }
}

/// Split frames into usable samples and rejected frame indices.
pub fn collect_samples(
    pattern: &PatternSpec,
    frames: &[FramePair],
) -> (Vec<ViewSample>, Vec<(usize, FrameRejection)>) {
    let mut samples = Vec::with_capacity(frames.len());
    let mut rejected = Vec::new();
    for (idx, frame) in frames.iter().enumerate() {
        match frame.to_sample(pattern) {
            Ok(sample) => samples.push(sample),
            Err(reason) => {
                log::warn!("dropping frame {idx}: {reason}");
                rejected.push((idx, reason));
            }
        }
    }
    (samples, rejected)
}

/// Checkerboard corner detector collaborator.
///
/// Implementations return corners in [`PatternSpec::object_points`] order,
/// already refined to sub-pixel accuracy.
pub trait CornerDetector {
    fn detect(&self, image: &GrayImageView<'_>, pattern: &PatternSpec) -> Detection;
}

/// Run a detector over synchronized image pairs.
pub fn detect_frames<'a, D, I>(detector: &D, pattern: &PatternSpec, pairs: I) -> Vec<FramePair>
where
    D: CornerDetector + ?Sized,
    I: IntoIterator<Item = (GrayImageView<'a>, GrayImageView<'a>)>,
{
    pairs
        .into_iter()
        .map(|(left, right)| FramePair {
            left: detector.detect(&left, pattern),
            right: detector.detect(&right, pattern),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GrayImage;

    fn pattern() -> PatternSpec {
        PatternSpec::new(2, 3, 1.0)
    }

    fn corners(n: usize) -> Vec<Point2<f64>> {
        (0..n).map(|i| Point2::new(i as f64, 2.0 * i as f64)).collect()
    }

    /// Finds corners only in images whose first pixel is non-zero.
    struct FirstPixelDetector;

    impl CornerDetector for FirstPixelDetector {
        fn detect(&self, image: &GrayImageView<'_>, pattern: &PatternSpec) -> Detection {
            if image.data.first().copied().unwrap_or(0) > 0 {
                Detection::Found(corners(pattern.point_count()))
            } else {
                Detection::NotFound
            }
        }
    }

    #[test]
    fn frame_with_both_detections_becomes_sample() {
        let frame = FramePair::new(
            Detection::Found(corners(6)),
            Detection::Found(corners(6)),
        );
        let sample = frame.to_sample(&pattern()).expect("usable");
        assert_eq!(sample.len(), 6);
        assert_eq!(sample.object_points, pattern().object_points());
    }

    #[test]
    fn missing_or_short_detections_are_rejected() {
        let p = pattern();
        let frame = FramePair::new(Detection::Found(corners(6)), Detection::NotFound);
        assert_eq!(
            frame.to_sample(&p),
            Err(FrameRejection::NotFound { side: Side::Right })
        );

        let frame = FramePair::new(Detection::Found(corners(5)), Detection::Found(corners(6)));
        assert_eq!(
            frame.to_sample(&p),
            Err(FrameRejection::PointCount {
                side: Side::Left,
                expected: 6,
                got: 5
            })
        );
    }

    #[test]
    fn collect_samples_reports_dropped_indices() {
        let frames = vec![
            FramePair::new(Detection::Found(corners(6)), Detection::Found(corners(6))),
            FramePair::new(Detection::NotFound, Detection::Found(corners(6))),
            FramePair::new(Detection::Found(corners(6)), Detection::Found(corners(6))),
        ];
        let (samples, rejected) = collect_samples(&pattern(), &frames);
        assert_eq!(samples.len(), 2);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].0, 1);
    }

    #[test]
    fn detect_frames_maps_each_side() {
        let lit = GrayImage::from_fn(4, 4, |_, _| 200);
        let dark = GrayImage::zeros(4, 4);
        let frames = detect_frames(
            &FirstPixelDetector,
            &pattern(),
            [(lit.view(), lit.view()), (lit.view(), dark.view())],
        );
        assert_eq!(frames.len(), 2);
        assert!(frames[0].left.is_found() && frames[0].right.is_found());
        assert!(!frames[1].right.is_found());
    }

    #[test]
    fn detection_serializes_as_optional_point_list() {
        let frame = FramePair::new(
            Detection::Found(vec![Point2::new(1.5, 2.0)]),
            Detection::NotFound,
        );
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"left":[[1.5,2.0]],"right":null}"#);
        let back: FramePair = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn view_sample_new_checks_counts() {
        let obj = pattern().object_points();
        assert!(ViewSample::new(obj.clone(), corners(6), corners(6)).is_ok());
        assert_eq!(
            ViewSample::new(obj, corners(6), corners(4)),
            Err(CoreError::PointCountMismatch {
                expected: 6,
                got: 4
            })
        );
    }

    #[test]
    fn replacing_observations_keeps_counts_equal() {
        let sample = ViewSample::new(pattern().object_points(), corners(6), corners(6)).unwrap();
        let moved = sample
            .clone()
            .with_observations(Side::Right, corners(6).into_iter().rev().collect())
            .unwrap();
        assert_eq!(moved.left(), sample.left());
        assert_eq!(moved.right()[0], corners(6)[5]);
        assert_eq!(
            sample.with_observations(Side::Left, corners(7)),
            Err(CoreError::PointCountMismatch {
                expected: 6,
                got: 7
            })
        );
    }

    #[test]
    fn deserializing_mismatched_sample_fails() {
        let sample = ViewSample::new(pattern().object_points(), corners(6), corners(6)).unwrap();
        let json = serde_json::to_string(&sample).unwrap();
        let back: ViewSample = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample);

        let short = r#"{"object_points":[[0.0,0.0,0.0],[1.0,0.0,0.0]],"left":[[1.0,2.0]],"right":[[1.0,2.0],[3.0,4.0]]}"#;
        let err = serde_json::from_str::<ViewSample>(short).unwrap_err();
        assert!(err.to_string().contains("view has 1 points"), "{err}");
    }
}
