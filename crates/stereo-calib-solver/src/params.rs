//! Mapping between camera intrinsics and optimizer parameter columns.

use nalgebra::{DVector, SMatrix};
use serde::{Deserialize, Serialize};
use stereo_calib_core::{CameraIntrinsics, NUM_INTRINSIC_PARAMS};

pub(crate) const INTRINSIC_NAMES: [&str; NUM_INTRINSIC_PARAMS] =
    ["fx", "fy", "cx", "cy", "k1", "k2", "p1", "p2", "k3"];

const FX: usize = 0;
const FY: usize = 1;
const CX: usize = 2;
const CY: usize = 3;
const K1: usize = 4;
const K2: usize = 5;
const P1: usize = 6;
const P2: usize = 7;
const K3: usize = 8;

/// Which intrinsic parameters stay at their initial value.
///
/// Fixed parameters are left out of the parameter vector entirely.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntrinsicsFlags {
    pub fix_principal_point: bool,
    /// Keep `fx / fy` at its initial value; `fy` stays free.
    pub fix_aspect_ratio: bool,
    pub fix_focal_length: bool,
    pub fix_k1: bool,
    pub fix_k2: bool,
    pub fix_k3: bool,
    /// Force `p1 = p2 = 0`.
    pub zero_tangent_dist: bool,
}

impl IntrinsicsFlags {
    /// Everything fixed.
    pub fn all_fixed() -> Self {
        Self {
            fix_principal_point: true,
            fix_aspect_ratio: false,
            fix_focal_length: true,
            fix_k1: true,
            fix_k2: true,
            fix_k3: true,
            zero_tangent_dist: true,
        }
    }

    /// Number of free scalar parameters these flags leave.
    pub fn free_count(&self) -> usize {
        let focal = if self.fix_focal_length {
            0
        } else if self.fix_aspect_ratio {
            1
        } else {
            2
        };
        let pp = if self.fix_principal_point { 0 } else { 2 };
        let tangential = if self.zero_tangent_dist { 0 } else { 2 };
        let radial = [self.fix_k1, self.fix_k2, self.fix_k3]
            .iter()
            .filter(|f| !**f)
            .count();
        focal + pp + tangential + radial
    }

    /// Apply value constraints implied by the flags (currently only
    /// zeroing the tangential coefficients).
    pub fn constrain(&self, intr: &CameraIntrinsics) -> CameraIntrinsics {
        let mut out = *intr;
        if self.zero_tangent_dist {
            out.distortion.p1 = 0.0;
            out.distortion.p2 = 0.0;
        }
        out
    }
}

/// Where an intrinsic parameter lives in the increment vector.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Slot {
    Fixed,
    /// `value += scale * delta[col]`.
    Free { col: usize, scale: f64 },
}

/// Column assignment for one camera's nine intrinsic parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct IntrinsicsLayout {
    pub slots: [Slot; NUM_INTRINSIC_PARAMS],
}

impl IntrinsicsLayout {
    pub fn fixed() -> Self {
        Self {
            slots: [Slot::Fixed; NUM_INTRINSIC_PARAMS],
        }
    }

    /// Allocate columns starting at `*next_col` for the parameters `flags`
    /// leaves free, advancing `*next_col`.
    pub fn allocate(flags: &IntrinsicsFlags, initial: &CameraIntrinsics, next_col: &mut usize) -> Self {
        let mut layout = Self::fixed();
        let mut take = |layout: &mut Self, idx: usize| {
            layout.slots[idx] = Slot::Free {
                col: *next_col,
                scale: 1.0,
            };
            *next_col += 1;
        };

        if !flags.fix_focal_length {
            if flags.fix_aspect_ratio {
                take(&mut layout, FY);
                if let Slot::Free { col, .. } = layout.slots[FY] {
                    layout.slots[FX] = Slot::Free {
                        col,
                        scale: initial.fx / initial.fy,
                    };
                }
            } else {
                take(&mut layout, FX);
                take(&mut layout, FY);
            }
        }
        if !flags.fix_principal_point {
            take(&mut layout, CX);
            take(&mut layout, CY);
        }
        if !flags.fix_k1 {
            take(&mut layout, K1);
        }
        if !flags.fix_k2 {
            take(&mut layout, K2);
        }
        if !flags.zero_tangent_dist {
            take(&mut layout, P1);
            take(&mut layout, P2);
        }
        if !flags.fix_k3 {
            take(&mut layout, K3);
        }
        layout
    }

    /// Share `other`'s focal-length columns (same-focal-length stereo).
    pub fn share_focal_with(&mut self, other: &IntrinsicsLayout) {
        self.slots[FX] = other.slots[FX];
        self.slots[FY] = other.slots[FY];
    }

    pub fn apply(&self, intr: &CameraIntrinsics, delta: &DVector<f64>) -> CameraIntrinsics {
        let mut p = intr.to_params();
        for (value, slot) in p.iter_mut().zip(&self.slots) {
            if let Slot::Free { col, scale } = slot {
                *value += scale * delta[*col];
            }
        }
        CameraIntrinsics::from_params(&p)
    }

    /// Accumulate `d_pixel / d_intrinsics` into the Jacobian row pair at `row`.
    pub fn scatter(
        &self,
        jac: &mut nalgebra::DMatrix<f64>,
        row: usize,
        d_intrinsics: &SMatrix<f64, 2, NUM_INTRINSIC_PARAMS>,
    ) {
        for (k, slot) in self.slots.iter().enumerate() {
            if let Slot::Free { col, scale } = slot {
                jac[(row, *col)] += scale * d_intrinsics[(0, k)];
                jac[(row + 1, *col)] += scale * d_intrinsics[(1, k)];
            }
        }
    }

    /// Label for column `col`, if this layout owns it.
    pub fn label(&self, col: usize) -> Option<&'static str> {
        self.slots.iter().enumerate().find_map(|(k, slot)| match slot {
            Slot::Free { col: c, scale } if *c == col && *scale == 1.0 => Some(INTRINSIC_NAMES[k]),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stereo_calib_core::Distortion;

    fn camera() -> CameraIntrinsics {
        CameraIntrinsics::new(600.0, 500.0, 320.0, 240.0).with_distortion(Distortion {
            k1: -0.1,
            k2: 0.01,
            p1: 1e-3,
            p2: -1e-3,
            k3: 0.0,
        })
    }

    #[test]
    fn default_flags_free_all_nine() {
        let mut next = 3;
        let layout = IntrinsicsLayout::allocate(&IntrinsicsFlags::default(), &camera(), &mut next);
        assert_eq!(next, 12);
        assert_eq!(IntrinsicsFlags::default().free_count(), 9);
        assert_eq!(layout.label(3), Some("fx"));
        assert_eq!(layout.label(11), Some("k3"));
    }

    #[test]
    fn aspect_lock_moves_fx_with_fy() {
        let flags = IntrinsicsFlags {
            fix_aspect_ratio: true,
            ..Default::default()
        };
        let mut next = 0;
        let layout = IntrinsicsLayout::allocate(&flags, &camera(), &mut next);
        assert_eq!(next, flags.free_count());

        let mut delta = DVector::zeros(next);
        delta[0] = 10.0;
        let moved = layout.apply(&camera(), &delta);
        assert!((moved.fy - 510.0).abs() < 1e-12);
        assert!((moved.fx / moved.fy - 1.2).abs() < 1e-12);
    }

    #[test]
    fn fixed_parameters_keep_values() {
        let flags = IntrinsicsFlags {
            fix_principal_point: true,
            fix_k3: true,
            zero_tangent_dist: true,
            ..Default::default()
        };
        let mut next = 0;
        let layout = IntrinsicsLayout::allocate(&flags, &camera(), &mut next);
        assert_eq!(next, 4);
        let delta = DVector::from_element(next, 1.0);
        let constrained = flags.constrain(&camera());
        let moved = layout.apply(&constrained, &delta);
        assert_eq!(moved.cx, 320.0);
        assert_eq!(moved.cy, 240.0);
        assert_eq!(moved.distortion.p1, 0.0);
        assert_eq!(moved.distortion.k3, 0.0);
        assert_eq!(moved.fx, 601.0);
    }

    #[test]
    fn all_fixed_allocates_nothing() {
        let mut next = 7;
        let layout = IntrinsicsLayout::allocate(&IntrinsicsFlags::all_fixed(), &camera(), &mut next);
        assert_eq!(next, 7);
        assert_eq!(layout, IntrinsicsLayout::fixed());
    }
}
