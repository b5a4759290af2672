//! Stereo rectification for a calibrated two-camera rig.
//!
//! [`stereo_rectify`] turns the relative pose of the rig into rectifying
//! rotations and projections; [`init_undistort_rectify_map`] expands one side
//! of that into a dense lookup table that [`remap_gray`] (or any external
//! renderer) can sample.
//!
//! ```
//! use stereo_calib_core::synthetic::StereoRig;
//! use stereo_calib_rectify::{init_undistort_rectify_map, stereo_rectify, RectifyOptions};
//!
//! let rig = StereoRig::reference();
//! let rect = stereo_rectify(
//!     &rig.left,
//!     &rig.right,
//!     &rig.relative.rotation,
//!     &rig.relative.translation,
//!     rig.image_size,
//!     &RectifyOptions::default(),
//! )?;
//! let map = init_undistort_rectify_map(&rig.left, &rect.r1, &rect.p1, rig.image_size)?;
//! assert_eq!(map.len(), 640 * 480);
//! # Ok::<(), stereo_calib_rectify::RectifyError>(())
//! ```

mod error;
mod rectify;
mod remap;

pub use error::RectifyError;
pub use rectify::{
    rectify_pixel, stereo_rectify, PixelRect, PrincipalPointAlignment, RectificationTransform,
    RectifyOptions,
};
pub use remap::{init_undistort_rectify_map, remap_gray, RemapTable};
