//! Portal to portal transforms.
//!
//! Every portal faces its local +Z axis. Going through a portal maps the source frame
//! onto the destination frame mirrored by half a turn around the up axis, so that
//! entering the front of one portal means leaving through the front of the other.

use std::f32::consts::PI;

use bevy::{math::Vec4Swizzles, prelude::*};

/// Half turn around the portal up axis.
pub fn mirror_rotation() -> Quat {
    Quat::from_rotation_y(PI)
}

/// `to.local_to_world * mirror * from.world_to_local`
pub fn portal_to_portal_matrix(from: &Transform, to: &Transform) -> Mat4 {
    to.compute_matrix() * Mat4::from_quat(mirror_rotation()) * from.compute_matrix().inverse()
}

/// Rotation part of [`portal_to_portal_matrix`]: `to.rotation * mirror * from.rotation^-1`.
///
/// This is not the `to.rotation * from.rotation^-1 * mirror` ordering. The two only agree
/// for portals standing upright (rotated around the world up axis only), where the mirror
/// commutes with both rotations. For tilted portals only this ordering matches the
/// rotation of [`portal_to_portal_matrix`].
pub fn portal_to_portal_rotation(from: &Transform, to: &Transform) -> Quat {
    (to.rotation * mirror_rotation() * from.rotation.inverse()).normalize()
}

/// Precomputed mapping from one portal of a pair to the other.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PortalToPortal {
    pub matrix: Mat4,
    pub rotation: Quat,
}

impl PortalToPortal {
    pub fn between(from: &Transform, to: &Transform) -> Self {
        PortalToPortal {
            matrix: portal_to_portal_matrix(from, to),
            rotation: portal_to_portal_rotation(from, to),
        }
    }

    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.matrix.transform_point3(point)
    }

    /// Directions and velocities only follow the rotation, portal scale does not stretch them.
    pub fn transform_direction(&self, direction: Vec3) -> Vec3 {
        self.rotation.mul_vec3(direction)
    }

    /// Map a whole pose through the portal. Scale is carried over untouched.
    pub fn transform_pose(&self, pose: &Transform) -> Transform {
        Transform {
            translation: self.transform_point(pose.translation),
            rotation: (self.rotation * pose.rotation).normalize(),
            scale: pose.scale,
        }
    }
}

/// Unit normal of the portal surface, pointing out of its front face.
pub fn portal_normal(portal: &Transform) -> Vec3 {
    portal.rotation.mul_vec3(Vec3::Z)
}

/// Position of `point` expressed in the portal local frame.
pub fn to_portal_local(portal: &Transform, point: Vec3) -> Vec3 {
    portal.compute_matrix().inverse().transform_point3(point)
}

/// World plane of the portal surface, in homogeneous form `(n, -n.p)`, with its normal
/// pointing out of the front face. Points in front of the portal give a positive distance.
pub fn portal_front_plane(portal: &Transform) -> Vec4 {
    let normal = portal_normal(portal);
    Vec4::from((normal, -normal.dot(portal.translation)))
}

/// World plane of the portal surface oriented so that `viewer` is on its negative side.
/// Used to cut everything between a virtual camera placed behind an exit portal and that
/// portal.
pub fn portal_clip_plane(portal: &Transform, viewer: Vec3) -> Vec4 {
    let plane = portal_front_plane(portal);
    if plane_distance(plane, viewer) > 0. {
        -plane
    } else {
        plane
    }
}

pub fn plane_distance(plane: Vec4, point: Vec3) -> f32 {
    plane.xyz().dot(point) + plane.w
}

/// Express a world space plane in the view space of a camera placed at `camera`.
///
/// Planes transform with the inverse transpose of the point transform. The view matrix
/// is the inverse of the camera matrix, so this boils down to the transpose of the camera
/// matrix. The result is normalized so that its xyz part has unit length.
pub fn plane_to_view_space(camera: &Transform, plane: Vec4) -> Vec4 {
    let plane = camera.compute_matrix().transpose() * plane;
    let len = plane.xyz().length();
    if len > f32::EPSILON {
        plane / len
    } else {
        plane
    }
}

#[cfg(test)]
mod tests {
    use std::f32::consts::FRAC_PI_2;

    use super::*;

    fn portal_a() -> Transform {
        Transform::from_xyz(1., 2., 3.).with_rotation(Quat::from_rotation_y(0.3))
    }

    fn portal_b() -> Transform {
        Transform::from_xyz(-5., 0.5, 8.)
            .with_rotation(Quat::from_euler(EulerRot::YXZ, 2.1, 0.4, 0.))
    }

    #[test]
    fn round_trip_is_identity() {
        let a_to_b = portal_to_portal_matrix(&portal_a(), &portal_b());
        let b_to_a = portal_to_portal_matrix(&portal_b(), &portal_a());
        for point in [
            Vec3::ZERO,
            Vec3::new(1., 2., 3.),
            Vec3::new(-7., 0.25, 12.),
            Vec3::new(100., -40., 3.5),
        ] {
            let back = b_to_a.transform_point3(a_to_b.transform_point3(point));
            assert!(back.abs_diff_eq(point, 1e-3), "{point} came back as {back}");
        }
        let rot = portal_to_portal_rotation(&portal_b(), &portal_a())
            * portal_to_portal_rotation(&portal_a(), &portal_b());
        assert!(rot.abs_diff_eq(Quat::IDENTITY, 1e-5) || rot.abs_diff_eq(-Quat::IDENTITY, 1e-5));
    }

    #[test]
    fn front_of_source_maps_behind_destination() {
        let a = Transform::IDENTITY;
        let b = Transform::from_xyz(10., 0., 0.);
        let p2p = PortalToPortal::between(&a, &b);
        // Mirrored: x and z flip sign in the destination frame.
        let mapped = p2p.transform_point(Vec3::new(1., 1., 2.));
        assert!(mapped.abs_diff_eq(Vec3::new(9., 1., -2.), 1e-5));
        // Crossing the source plane exits through the destination front.
        let crossed = to_portal_local(&b, p2p.transform_point(Vec3::new(0., 0., -0.1)));
        assert!(crossed.z > 0.);
    }

    #[test]
    fn rotation_matches_matrix() {
        let p2p = PortalToPortal::between(&portal_a(), &portal_b());
        let dir = Vec3::new(0.3, -0.2, 1.).normalize();
        let via_matrix = p2p.matrix.transform_vector3(dir);
        assert!(p2p.transform_direction(dir).abs_diff_eq(via_matrix, 1e-5));
    }

    #[test]
    fn upright_portals_commute_with_mirror() {
        let a = Transform::from_xyz(3., 0., 1.).with_rotation(Quat::from_rotation_y(1.2));
        let b = Transform::from_xyz(-2., 1., 4.).with_rotation(Quat::from_rotation_y(-0.7));
        let literal = (b.rotation * a.rotation.inverse() * mirror_rotation()).normalize();
        let rot = portal_to_portal_rotation(&a, &b);
        assert!(rot.abs_diff_eq(literal, 1e-5) || rot.abs_diff_eq(-literal, 1e-5));
    }

    #[test]
    fn tilted_source_keeps_the_mirror_between_frames() {
        let (tilted, upright) = (portal_b(), portal_a());
        let trailing_mirror =
            (upright.rotation * tilted.rotation.inverse() * mirror_rotation()).normalize();
        let rot = portal_to_portal_rotation(&tilted, &upright);
        assert!(!rot.abs_diff_eq(trailing_mirror, 1e-3) && !rot.abs_diff_eq(-trailing_mirror, 1e-3));

        let dir = Vec3::new(-0.4, 0.6, 0.2).normalize();
        let via_matrix = portal_to_portal_matrix(&tilted, &upright).transform_vector3(dir);
        assert!(rot.mul_vec3(dir).abs_diff_eq(via_matrix, 1e-4));
    }

    #[test]
    fn clip_plane_faces_away_from_viewer() {
        let portal = Transform::from_xyz(0., 0., 5.).with_rotation(Quat::from_rotation_y(FRAC_PI_2));
        let behind = portal.translation - portal_normal(&portal) * 3.;
        let plane = portal_clip_plane(&portal, behind);
        assert!(plane_distance(plane, behind) < 0.);
        let in_front = portal.translation + portal_normal(&portal) * 3.;
        assert!(plane_distance(plane, in_front) > 0.);
        assert!(plane_distance(plane, portal.translation).abs() < 1e-5);
    }

    #[test]
    fn view_space_plane_keeps_point_distances() {
        let camera = Transform::from_xyz(2., 1., 7.).looking_at(Vec3::ZERO, Vec3::Y);
        let portal = Transform::from_xyz(0., 0., 1.);
        let world_plane = portal_front_plane(&portal);
        let view_plane = plane_to_view_space(&camera, world_plane);
        let point = Vec3::new(0.5, -1., 4.);
        let view_point = camera.compute_matrix().inverse().transform_point3(point);
        assert!((plane_distance(world_plane, point) - plane_distance(view_plane, view_point)).abs() < 1e-4);
    }
}
