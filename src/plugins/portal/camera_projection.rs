use std::f32::consts::FRAC_PI_4;

use bevy::{prelude::*, render::camera::CameraProjection};

use super::camera_rig::PerspectiveLens;

/// Maps forward [0, 1] depth onto the reversed depth range the 3D pipeline expects.
fn reverse_depth() -> Mat4 {
    Mat4::from_cols(
        Vec4::X,
        Vec4::Y,
        Vec4::new(0., 0., -1., 0.),
        Vec4::new(0., 0., 1., 1.),
    )
}

/// Camera projection which allows for an oblique near clipping plane, used for rendering portal virtual cameras.
#[derive(Debug, Component, Clone, Reflect)]
#[reflect(Component)]
pub struct PortalCameraProjection {
    pub fov: f32,
    pub aspect_ratio: f32,
    pub near: f32,
    pub far: f32,
    /// View space plane replacing the near plane. Only used while the camera is on its
    /// negative side.
    #[reflect(ignore)]
    pub clip_plane: Vec4,
}

impl Default for PortalCameraProjection {
    fn default() -> Self {
        PortalCameraProjection {
            fov: FRAC_PI_4,
            aspect_ratio: 16. / 9.,
            near: 0.1,
            far: 1000.,
            clip_plane: Vec4::from((Vec3::NEG_Z, -0.1)),
        }
    }
}

impl PortalCameraProjection {
    /// Copy the lens of the viewing camera so both perspectives match.
    pub fn sync_lens(&mut self, lens: &PerspectiveLens) {
        self.fov = lens.fov;
        self.aspect_ratio = lens.aspect_ratio;
        self.near = lens.near;
        self.far = lens.far;
    }

    fn forward_projection(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov, self.aspect_ratio, self.near, self.far)
    }
}

/// Replace the near plane of a [0, 1] depth projection with `clip_plane`, keeping the far
/// plane through the far corners of the frustum.
///
/// Math taken from https://www.terathon.com/lengyel/Lengyel-Oblique.pdf
pub fn oblique_near_plane(proj_mat: Mat4, clip_plane: Vec4) -> Mat4 {
    let proj_mat_inv = proj_mat.inverse();
    let c = clip_plane;
    let m4 = proj_mat.row(3);
    let qp = Vec4::new(c.x.signum(), c.y.signum(), 1., 1.);
    let q = proj_mat_inv * qp;
    let denom = c.dot(q);
    if denom.abs() < 1e-6 {
        return proj_mat;
    }
    let a = m4.dot(q) / denom;
    let new_m3 = a * c;

    let mut oblique_proj_mat = proj_mat;
    oblique_proj_mat.x_axis.z = new_m3.x;
    oblique_proj_mat.y_axis.z = new_m3.y;
    oblique_proj_mat.z_axis.z = new_m3.z;
    oblique_proj_mat.w_axis.z = new_m3.w;
    oblique_proj_mat
}

impl CameraProjection for PortalCameraProjection {
    fn get_projection_matrix(&self) -> Mat4 {
        let proj_mat = self.forward_projection();
        // A camera in front of the plane would clip away everything it looks at.
        if self.clip_plane.w < -f32::EPSILON {
            reverse_depth() * oblique_near_plane(proj_mat, self.clip_plane)
        } else {
            reverse_depth() * proj_mat
        }
    }

    // The aspect ratio follows the viewing camera lens, not the render target.
    fn update(&mut self, _width: f32, _height: f32) {}

    fn far(&self) -> f32 {
        self.far
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ndc_depth(proj: Mat4, view_point: Vec3) -> f32 {
        let clip = proj * view_point.extend(1.);
        clip.z / clip.w
    }

    #[test]
    fn geometry_before_the_clip_plane_is_cut() {
        let projection = PortalCameraProjection {
            clip_plane: Vec4::new(0., 0., -1., -2.),
            ..default()
        };
        let proj = projection.get_projection_matrix();
        let beyond = ndc_depth(proj, Vec3::new(0., 0., -5.));
        assert!(beyond > 0. && beyond < 1., "depth {beyond}");
        let between = ndc_depth(proj, Vec3::new(0., 0., -1.));
        assert!(between > 1., "depth {between}");
    }

    #[test]
    fn depth_is_reversed() {
        let projection = PortalCameraProjection {
            clip_plane: Vec4::new(0., 0., -1., -0.5),
            ..default()
        };
        let proj = projection.get_projection_matrix();
        let near = ndc_depth(proj, Vec3::new(0., 0., -2.));
        let far = ndc_depth(proj, Vec3::new(0., 0., -50.));
        assert!(near > far);
    }

    #[test]
    fn camera_in_front_of_plane_keeps_regular_near() {
        let projection = PortalCameraProjection {
            clip_plane: Vec4::new(0., 0., 1., 3.),
            ..default()
        };
        let proj = projection.get_projection_matrix();
        let depth = ndc_depth(proj, Vec3::new(0., 0., -1.));
        assert!(depth > 0. && depth < 1.);
    }
}
