use bevy::{
    prelude::*,
    render::{
        camera::{CameraProjectionPlugin, CameraUpdateSystem},
        view::{update_frusta, VisibilitySystems},
    },
    transform::TransformSystem,
};
use bevy_rapier3d::prelude::*;

mod camera_projection;
mod camera_rig;
mod error;
mod geometry;
mod material;
mod overlap;
mod registry;
mod render_plan;
mod settings;
mod teleport;

pub use camera_projection::PortalCameraProjection;
pub use camera_rig::{PerspectiveLens, PortalCamera, PortalSurface};
pub use error::PortalError;
pub use geometry::PortalToPortal;
pub use material::{ClosedPortalMaterial, OpenPortalMaterial, SlicedMaterial};
pub use overlap::{PortalOverlapEvent, PortalOverlaps};
pub use registry::{PortalPairId, PortalPairRegistry};
pub use render_plan::{PlannedView, PortalRenderBackend, PortalRenderPlan};
pub use settings::{PortalSettings, SETTINGS_PATH};
pub use teleport::{PortalTeleport, PortalTeleportEvent, Replica, SliceClip, TeleportPose};

use super::physics::*;

/// Render layer of the portal surfaces seen by the viewing camera. Surfaces seen by the
/// portal cameras of depth `n` are on layer `PORTALS_RENDER_LAYER + n`.
pub const PORTALS_RENDER_LAYER: u8 = 1;

/// Pairing, overlap tracking and teleportation. Doesn't need a renderer.
#[derive(Debug)]
pub struct PortalCorePlugin;

/// Everything in [`PortalCorePlugin`], plus the portal cameras and surfaces.
#[derive(Debug)]
pub struct PortalPlugin;

#[derive(Debug, StageLabel)]
pub enum PortalStage {
    /// After the physics step: overlap sets are brought up to date.
    Overlap,
    /// Once overlaps are settled: objects are moved through portals.
    Late,
}

#[derive(Debug, SystemLabel)]
pub enum PortalLabels {
    Registry,
    ResolveCamera,
    TrackOverlaps,
    Teleport,
    CreateViews,
    SyncCameras,
}

#[derive(Debug, Resource)]
pub struct PortalResources {
    pub mesh: Handle<Mesh>,
    /// Closed surface colors, by index in the pair.
    pub closed_materials: [Handle<ClosedPortalMaterial>; 2],
}

#[derive(Debug, Component, Clone)]
pub struct Portal {
    pub pair: PortalPairId,
    pub half_extents: Vec2,
    /// Cameras rendering the view through this portal, by increasing depth.
    cameras: Vec<Entity>,
}

impl Portal {
    pub fn new(pair: PortalPairId) -> Self {
        Portal {
            pair,
            half_extents: Vec2::ONE,
            cameras: Vec::new(),
        }
    }

    pub fn cameras(&self) -> &[Entity] {
        &self.cameras
    }
}

#[derive(Bundle)]
pub struct PortalBundle {
    #[bundle]
    pub spatial: SpatialBundle,
    pub portal: Portal,
    pub overlaps: PortalOverlaps,
    pub collider: Collider,
    pub sensor: Sensor,
    pub active_events: ActiveEvents,
    pub collision_groups: CollisionGroups,
    pub name: Name,
}

impl PortalBundle {
    pub fn new(pair: PortalPairId, transform: Transform, settings: &PortalSettings) -> Self {
        let half_extents = settings.half_extents();
        PortalBundle {
            spatial: SpatialBundle::from_transform(transform),
            portal: Portal {
                half_extents,
                ..Portal::new(pair)
            },
            overlaps: PortalOverlaps::default(),
            collider: Collider::cuboid(half_extents.x, half_extents.y, settings.trigger_half_depth),
            sensor: Sensor,
            active_events: ActiveEvents::COLLISION_EVENTS,
            collision_groups: CollisionGroups::new(PORTAL_GROUP, settings.overlap_groups()),
            name: Name::from(format!("Portal {}", pair.0)),
        }
    }
}

impl Plugin for PortalCorePlugin {
    fn build(&self, app: &mut App) {
        if !app.world.contains_resource::<PortalSettings>() {
            app.insert_resource(PortalSettings::load_or_default(SETTINGS_PATH));
        }

        app.init_resource::<PortalPairRegistry>()
            .add_event::<CollisionEvent>()
            .add_event::<PortalOverlapEvent>()
            .add_event::<PortalTeleportEvent>()
            .add_stage_before(
                CoreStage::PostUpdate,
                PortalStage::Overlap,
                SystemStage::parallel(),
            )
            .add_stage_after(
                PortalStage::Overlap,
                PortalStage::Late,
                SystemStage::single_threaded(),
            )
            .add_system_set(
                SystemSet::new()
                    .label(PortalLabels::Registry)
                    .with_system(registry::unregister_portals.before(registry::register_portals))
                    .with_system(registry::register_portals),
            )
            .add_system(
                registry::resolve_active_camera
                    .label(PortalLabels::ResolveCamera)
                    .after(PortalLabels::Registry),
            )
            .add_system(teleport::validate_teleportables)
            .add_system_to_stage(
                PortalStage::Overlap,
                overlap::track_portal_overlaps.label(PortalLabels::TrackOverlaps),
            )
            .add_system_to_stage(
                PortalStage::Overlap,
                teleport::handle_portal_exits.after(PortalLabels::TrackOverlaps),
            )
            .add_system_to_stage(
                PortalStage::Overlap,
                teleport::open_wall_passage.after(PortalLabels::TrackOverlaps),
            )
            .add_system_to_stage(
                PortalStage::Late,
                teleport::teleport_objects.label(PortalLabels::Teleport),
            )
            .add_system_to_stage(
                PortalStage::Late,
                teleport::despawn_orphan_replicas.after(PortalLabels::Teleport),
            );
    }
}

impl Plugin for PortalPlugin {
    fn build(&self, app: &mut App) {
        app.add_plugin(PortalCorePlugin)
            .add_plugin(MaterialPlugin::<OpenPortalMaterial>::default())
            .add_plugin(MaterialPlugin::<ClosedPortalMaterial>::default())
            .add_plugin(MaterialPlugin::<SlicedMaterial>::default())
            .add_plugin(CameraProjectionPlugin::<PortalCameraProjection>::default())
            .register_type::<OpenPortalMaterial>()
            .register_type::<ClosedPortalMaterial>()
            .register_type::<SlicedMaterial>()
            .register_type::<PortalCameraProjection>()
            .init_resource::<PortalRenderPlan>()
            .add_startup_system(load_portal_assets)
            .add_system(
                camera_rig::create_portal_views
                    .label(PortalLabels::CreateViews)
                    .after(PortalLabels::Registry),
            )
            .add_system(material::update_portal_surfaces.after(PortalLabels::CreateViews))
            .add_system(camera_rig::despawn_orphan_cameras)
            .add_system_to_stage(CoreStage::PostUpdate, material::update_slice_clips)
            .add_system_to_stage(
                CoreStage::PostUpdate,
                camera_rig::sync_portal_cameras
                    .label(PortalLabels::SyncCameras)
                    .after(TransformSystem::TransformPropagate)
                    .before(CameraUpdateSystem),
            )
            .add_system_to_stage(
                CoreStage::PostUpdate,
                update_frusta::<PortalCameraProjection>
                    .after(PortalLabels::SyncCameras)
                    .after(CameraUpdateSystem)
                    .before(VisibilitySystems::CheckVisibility),
            );
    }
}

/// Load the assets required to render the portals.
fn load_portal_assets(
    mut commands: Commands,
    settings: Res<PortalSettings>,
    mut meshes: ResMut<Assets<Mesh>>,
    mut materials: ResMut<Assets<ClosedPortalMaterial>>,
) {
    let portal_mesh = meshes.add(
        shape::Quad {
            size: settings.half_extents() * 2.,
            flip: false,
        }
        .into(),
    );
    let closed_materials = [Color::ORANGE, Color::MIDNIGHT_BLUE]
        .map(|color| materials.add(ClosedPortalMaterial::from(color)));

    commands.insert_resource(PortalResources {
        mesh: portal_mesh,
        closed_materials,
    });
}
