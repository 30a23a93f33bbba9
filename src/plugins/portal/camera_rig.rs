//! Placement of the virtual cameras looking through the portals.
//!
//! Every portal owns one camera per recursion level. The level 1 camera sits behind the
//! linked portal with the same relative pose the viewer has to this portal, level 2 is the
//! level 1 camera moved through the portal pair once more, and so on until the depth budget
//! is spent or the portal can't be seen anymore.
//!
//! The portal surface is drawn once per level on its own render layer: the viewer sees the
//! surface of layer `PORTALS_RENDER_LAYER`, which samples the level 1 texture, the level 1
//! camera sees the surface of the next layer, which samples the level 2 texture, etc.

use std::f32::consts::FRAC_PI_4;

use bevy::{
    prelude::*,
    render::{
        camera::{Projection, RenderTarget},
        render_resource::{
            Extent3d, TextureDescriptor, TextureDimension, TextureFormat, TextureUsages,
        },
        view::RenderLayers,
    },
    utils::HashMap,
};

use super::{
    camera_projection::PortalCameraProjection,
    geometry::{plane_distance, portal_clip_plane, to_portal_local, PortalToPortal},
    material::{ClosedPortalMaterial, OpenPortalMaterial},
    registry::PortalPairRegistry,
    render_plan::{PlannedView, PortalRenderBackend, PortalRenderPlan},
    settings::PortalSettings,
    Portal, PortalResources, PORTALS_RENDER_LAYER,
};

/// Perspective parameters shared between the viewer and the portal cameras.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerspectiveLens {
    pub fov: f32,
    pub aspect_ratio: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for PerspectiveLens {
    fn default() -> Self {
        PerspectiveLens {
            fov: FRAC_PI_4,
            aspect_ratio: 16. / 9.,
            near: 0.1,
            far: 1000.,
        }
    }
}

impl From<&PerspectiveProjection> for PerspectiveLens {
    fn from(p: &PerspectiveProjection) -> Self {
        PerspectiveLens {
            fov: p.fov,
            aspect_ratio: p.aspect_ratio,
            near: p.near,
            far: p.far,
        }
    }
}

impl PerspectiveLens {
    pub fn view_projection(&self, camera: &Transform) -> Mat4 {
        Mat4::perspective_rh(self.fov, self.aspect_ratio, self.near, self.far)
            * camera.compute_matrix().inverse()
    }
}

/// One virtual camera pose of a portal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewLevel {
    pub depth: u32,
    pub camera: Transform,
    /// World space plane of the exit portal.
    pub clip_plane: Vec4,
}

/// A virtual camera rendering the view through `portal` at recursion level `depth`.
#[derive(Debug, Clone, Copy, Component)]
pub struct PortalCamera {
    pub portal: Entity,
    pub depth: u32,
}

/// Copy of a portal surface seen by the cameras of one recursion level.
#[derive(Debug, Clone, Component)]
pub struct PortalSurface {
    pub portal: Entity,
    pub depth: u32,
    /// Material showing the next level, `None` on the deepest surface.
    pub open: Option<Handle<OpenPortalMaterial>>,
}

/// Planes of a [0, 1] depth view projection frustum, pointing inwards.
fn frustum_planes(view_projection: Mat4) -> [Vec4; 6] {
    let (r0, r1, r2, r3) = (
        view_projection.row(0),
        view_projection.row(1),
        view_projection.row(2),
        view_projection.row(3),
    );
    [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2].map(|p| p / p.truncate().length())
}

/// Whether a camera could see any of the portal quad: the camera is on the portal's front
/// side and the portal's bounding sphere touches its frustum.
pub fn portal_visible(
    camera: &Transform,
    lens: &PerspectiveLens,
    portal: &Transform,
    half_extents: Vec2,
) -> bool {
    if to_portal_local(portal, camera.translation).z <= 0. {
        return false;
    }
    let radius = (half_extents * portal.scale.truncate()).length();
    frustum_planes(lens.view_projection(camera))
        .iter()
        .all(|&plane| plane_distance(plane, portal.translation) >= -radius)
}

/// Virtual camera poses for the view through `source`, which comes out of `exit`.
///
/// Level 1 is always produced. Each further level moves the previous level's camera through
/// the pair again, as long as that camera can still see `source`.
pub fn view_chain(
    viewer: &Transform,
    lens: &PerspectiveLens,
    source: &Transform,
    half_extents: Vec2,
    exit: &Transform,
    max_depth: u32,
) -> Vec<ViewLevel> {
    let to_exit = PortalToPortal::between(source, exit);
    let mut levels = Vec::with_capacity(max_depth as usize);
    let mut eye = *viewer;
    for depth in 1..=max_depth {
        if depth > 1 && !portal_visible(&eye, lens, source, half_extents) {
            break;
        }
        eye = to_exit.transform_pose(&eye);
        levels.push(ViewLevel {
            depth,
            camera: eye,
            clip_plane: portal_clip_plane(exit, eye.translation),
        });
    }
    levels
}

pub(super) fn portal_render_target(images: &mut Assets<Image>, size: [u32; 2]) -> Handle<Image> {
    let tex_size = Extent3d {
        width: size[0],
        height: size[1],
        ..default()
    };
    let mut image = Image {
        texture_descriptor: TextureDescriptor {
            label: Some("portal_render_target"),
            size: tex_size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: TextureFormat::Bgra8UnormSrgb,
            usage: TextureUsages::TEXTURE_BINDING
                | TextureUsages::COPY_DST
                | TextureUsages::RENDER_ATTACHMENT,
        },
        ..default()
    };
    image.resize(tex_size);
    images.add(image)
}

/// Spawn the cameras and per level surfaces of new portals.
pub(super) fn create_portal_views(
    mut commands: Commands,
    settings: Res<PortalSettings>,
    resources: Res<PortalResources>,
    mut images: ResMut<Assets<Image>>,
    mut open_materials: ResMut<Assets<OpenPortalMaterial>>,
    mut portals: Query<(Entity, &mut Portal), Added<Portal>>,
) {
    let max_depth = settings.max_recursion_depth;
    for (entity, mut portal) in &mut portals {
        let targets: Vec<_> = (0..max_depth)
            .map(|_| portal_render_target(&mut images, settings.render_target_size))
            .collect();

        for (level, target) in targets.iter().enumerate() {
            let depth = level as u32 + 1;
            let camera = commands
                .spawn(Camera3dBundle {
                    camera: Camera {
                        target: RenderTarget::Image(target.clone()),
                        is_active: false,
                        // Reassigned every frame from the render plan.
                        priority: -1 - depth as isize,
                        ..default()
                    },
                    ..default()
                })
                .insert((
                    PortalCameraProjection::default(),
                    PortalCamera {
                        portal: entity,
                        depth,
                    },
                    RenderLayers::layer(0).with(PORTALS_RENDER_LAYER + depth as u8),
                    Name::from(format!("Portal camera {}", depth)),
                ))
                .remove::<Projection>()
                .id();
            portal.cameras.push(camera);
        }

        commands.entity(entity).with_children(|parent| {
            for depth in 0..=max_depth {
                let open = targets.get(depth as usize).map(|target| {
                    open_materials.add(OpenPortalMaterial {
                        texture: target.clone(),
                    })
                });
                parent.spawn((
                    MaterialMeshBundle::<ClosedPortalMaterial> {
                        mesh: resources.mesh.clone(),
                        material: resources.closed_materials[0].clone(),
                        ..default()
                    },
                    RenderLayers::layer(PORTALS_RENDER_LAYER + depth as u8),
                    PortalSurface {
                        portal: entity,
                        depth,
                        open,
                    },
                ));
            }
        });
        debug!("Created {} portal cameras for {:?}", max_depth, entity);
    }
}

/// Despawn the cameras of portals which went away.
pub(super) fn despawn_orphan_cameras(
    mut commands: Commands,
    cameras: Query<(Entity, &PortalCamera)>,
    portals: Query<(), With<Portal>>,
) {
    for (entity, camera) in &cameras {
        if !portals.contains(camera.portal) {
            debug!("Despawning portal camera {:?}", entity);
            commands.entity(entity).despawn_recursive();
        }
    }
}

/// Turns draw order into camera priorities, the first drawn view getting the lowest one.
#[derive(Debug, Default)]
struct CameraPriorities {
    open_levels: Vec<(Entity, u32)>,
    draws: Vec<(Entity, u32)>,
}

impl PortalRenderBackend for CameraPriorities {
    fn enter(&mut self, view: &PlannedView) {
        self.open_levels.push((view.portal, view.depth));
    }

    fn draw(&mut self, view: &PlannedView) {
        self.draws.push((view.portal, view.depth));
    }

    fn exit(&mut self, view: &PlannedView) {
        let closed = self.open_levels.pop();
        debug_assert_eq!(closed, Some((view.portal, view.depth)));
    }
}

impl CameraPriorities {
    fn into_priorities(self) -> HashMap<(Entity, u32), isize> {
        debug_assert!(self.open_levels.is_empty());
        let count = self.draws.len() as isize;
        self.draws
            .into_iter()
            .enumerate()
            .map(|(order, key)| (key, order as isize - count))
            .collect()
    }
}

/// Place the portal cameras for this frame. Runs after transform propagation, so the
/// camera global transforms are written directly.
pub(super) fn sync_portal_cameras(
    settings: Res<PortalSettings>,
    registry: Res<PortalPairRegistry>,
    mut plan: ResMut<PortalRenderPlan>,
    viewers: Query<(&GlobalTransform, &Projection), Without<PortalCamera>>,
    portals: Query<(Entity, &GlobalTransform, &Portal), Without<PortalCamera>>,
    mut cameras: Query<(
        &PortalCamera,
        &mut Camera,
        &mut Transform,
        &mut GlobalTransform,
        &mut PortalCameraProjection,
    )>,
) {
    plan.clear();

    let viewer = registry.active_camera().and_then(|e| viewers.get(e).ok());
    if let Some((viewer_global, projection)) = viewer {
        let lens = match projection {
            Projection::Perspective(p) => PerspectiveLens::from(p),
            Projection::Orthographic(_) => PerspectiveLens::default(),
        };
        let viewer = viewer_global.compute_transform();
        let placements: HashMap<Entity, Transform> = portals
            .iter()
            .map(|(e, global, _)| (e, global.compute_transform()))
            .collect();

        for (entity, global, portal) in &portals {
            let exit = match registry
                .other_portal(entity)
                .and_then(|other| placements.get(&other))
            {
                Some(exit) => exit,
                None => continue,
            };
            let max_depth = settings.max_recursion_depth.min(portal.cameras.len() as u32);
            let chain = view_chain(
                &viewer,
                &lens,
                &global.compute_transform(),
                portal.half_extents,
                exit,
                max_depth,
            );
            plan.push_chain(
                chain
                    .into_iter()
                    .map(|level| PlannedView {
                        portal: entity,
                        depth: level.depth,
                        camera: level.camera,
                        lens,
                        clip_plane: level.clip_plane,
                    })
                    .collect(),
            );
        }
    }

    let mut backend = CameraPriorities::default();
    plan.issue(&mut backend);
    let priorities = backend.into_priorities();

    for (portal_camera, mut camera, mut transform, mut global, mut projection) in &mut cameras {
        let key = (portal_camera.portal, portal_camera.depth);
        match (plan.find(key.0, key.1), priorities.get(&key)) {
            (Some(view), Some(&priority)) => {
                *transform = view.camera;
                *global = GlobalTransform::from(view.camera);
                projection.sync_lens(&view.lens);
                projection.clip_plane = view.view_clip_plane();
                camera.priority = priority;
                camera.is_active = true;
            }
            _ => {
                if camera.is_active {
                    camera.is_active = false;
                }
            }
        }
    }
}
