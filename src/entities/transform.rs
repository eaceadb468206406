//! Host-to-destination change of basis for instance transforms.
//!
//! Host space is right-handed Z-up, destination space is left-handed Y-up.
//! The conversion brackets the host matrix with fixed factors:
//!
//! ```text
//! out = Rx(-90) * S * world * Rx(-90) * Rz(180) * S      S = scale(-1, 1, 1)
//! ```
//!
//! Only evaluated instance matrices go through here; nothing else is converted.

use glam::{Mat4, Vec3};
use std::f32::consts::{FRAC_PI_2, PI};

/// Mirror of the X axis used on both sides of the conversion.
const MIRROR_X: Vec3 = Vec3::new(-1.0, 1.0, 1.0);

/// Left factor: `Rx(-90) * S`.
#[inline]
fn left_basis() -> Mat4 {
    Mat4::from_rotation_x(-FRAC_PI_2) * Mat4::from_scale(MIRROR_X)
}

/// Right factor: `Rx(-90) * Rz(180) * S`.
#[inline]
fn right_basis() -> Mat4 {
    Mat4::from_rotation_x(-FRAC_PI_2) * Mat4::from_rotation_z(PI) * Mat4::from_scale(MIRROR_X)
}

/// Convert a host world matrix into the destination convention.
pub fn host_to_destination(world: Mat4) -> Mat4 {
    left_basis() * world * right_basis()
}

/// Split a converted matrix into translation, rotation and scale.
pub fn decompose(m: Mat4) -> (Vec3, glam::Quat, Vec3) {
    let (scale, rotation, translation) = m.to_scale_rotation_translation();
    (translation, rotation, scale)
}
