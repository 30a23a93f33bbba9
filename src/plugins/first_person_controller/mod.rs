//! This module contains the first person controller plugin.
//!
//! TODO features:
//!
//! * Additional controls:
//!   * Jumping
//!   * Crouching
//! * Climbing slopes and stairs
//! * A player body mesh, so the player gets a replica when walking through portals

use bevy::{
    prelude::*,
    reflect::FromReflect,
    render::camera::Projection,
};
use bevy_rapier3d::prelude::*;
use euclid::Angle;
use iyes_loopless::prelude::*;
use leafwing_input_manager::prelude::*;

use crate::plugins::{
    game::GameState,
    input::default_input_map,
    physics::*,
    portal::{PortalLabels, PortalStage, PortalTeleport, PortalTeleportEvent},
};

use super::input::Actions;

#[derive(Debug)]
/// First person controller plugin, which registers the required systems to use the first person
/// controller also provided by this module.
pub struct FirstPersonControllerPlugin;

impl Plugin for FirstPersonControllerPlugin {
    fn build(&self, app: &mut App) {
        app.add_system(spawn_controller.label(FirstPersonLabels::SpawnControllers))
            .add_system(
                process_controller_inputs
                    .run_in_state(GameState::InGame)
                    .label(FirstPersonLabels::ProcessInputs),
            )
            .add_system_to_stage(
                PortalStage::Late,
                reorient_on_teleport
                    .label(FirstPersonLabels::Reorient)
                    .after(PortalLabels::Teleport),
            );
    }
}

#[derive(Debug, SystemLabel)]
/// Labels for the first person controller systems.
pub enum FirstPersonLabels {
    SpawnControllers,
    ProcessInputs,
    Reorient,
}

#[derive(Debug, Component)]
/// First person controller component.
pub struct FirstPersonController {
    pub theta: Angle<f32>,
    pub phi: Angle<f32>,
    pub camera_anchor: Entity
}

#[derive(Debug, Default, Component, Reflect, FromReflect)]
#[reflect(Component)]
/// Marker trait for first person cameras
pub struct FirstPersonCamera;

#[derive(Debug, Component, Default, Reflect, FromReflect)]
#[reflect(Component)]
pub struct FirstPersonControllerSpawner { }

#[derive(Debug, Bundle, Default)]
pub struct FirstPersonControllerBundle {
    #[bundle]
    pub spatial: SpatialBundle,
    pub spawner: FirstPersonControllerSpawner,
}

fn spawn_controller(
    mut commands: Commands,
    spawners_query: Query<(&FirstPersonControllerSpawner, Entity)>,
) {
    for (_spawner, id) in &spawners_query {
        const PLAYER_HEIGHT: f32 = 1.8;
        const PLAYER_RADIUS: f32 = 0.4;
        const EYE_HEIGHT: f32 = 1.25;
        const CAMERA_OFFSET: Vec3 = Vec3::new(0., EYE_HEIGHT - PLAYER_HEIGHT / 2., 0.);

        let player_root = commands
            .entity(id)
            .insert(InputManagerBundle {
                action_state: ActionState::default(),
                input_map: default_input_map(),
            })
            .insert((
                RigidBody::Dynamic,
                Collider::capsule_y(PLAYER_HEIGHT / 2. - PLAYER_RADIUS, PLAYER_RADIUS),
                LockedAxes::ROTATION_LOCKED_X | LockedAxes::ROTATION_LOCKED_Z,
                Velocity::default(),
                Ccd::enabled(),
                Name::from("Player"),
                CollisionGroups::new(PLAYER_GROUP, ALL_GROUPS),
                PortalTeleport::default(),
            ))
            .id();

        let camera_anchor = commands
            .spawn(SpatialBundle::from(Transform::from_translation(
                CAMERA_OFFSET,
            )))
            .insert(Name::from("Camera anchor"))
            .id();

        let camera = commands
            .spawn(Camera3dBundle {
                projection: Projection::Perspective(PerspectiveProjection {
                    fov: std::f32::consts::FRAC_PI_3,
                    aspect_ratio: 16. / 9.,
                    near: 0.05,
                    far: 1000.,
                }),
                ..default()
            })
            .insert((Name::from("Player camera"), FirstPersonCamera))
            .id();

        commands.entity(camera_anchor).push_children(&[camera]);

        commands
            .entity(player_root)
            .add_child(camera_anchor)
            .insert(FirstPersonController {
                theta: Angle::zero(),
                phi: Angle::zero(),
                camera_anchor,
            });

        commands.entity(id).remove::<FirstPersonControllerSpawner>();
    }
}

const PLAYER_SPEED: f32 = 3.;
const MOUSE_SENSITIVITY: f32 = 0.004;
const MOUSE_ANGVEL_MULTIPLIER: f32 = -75.;
const SPRINT_MULTIPLIER: f32 = 2.;

fn process_controller_inputs(
    mut player_query: Query<(
        &ActionState<Actions>,
        &mut FirstPersonController,
        &mut Velocity,
        &Transform,
    )>,
    mut camera_query: Query<&mut Transform, Without<FirstPersonController>>,
) {
    for (input_state, mut controller, mut velocity, transform) in &mut player_query {
        let mut new_velocities = Vec3::ZERO;

        // Process movement on the forward axis
        let forward = transform.forward();
        match (
            input_state.pressed(Actions::Forward),
            input_state.pressed(Actions::Backwards),
            input_state.pressed(Actions::Sprint),
        ) {
            (true, false, sprint) => {
                let k = if sprint { SPRINT_MULTIPLIER } else { 1. };
                new_velocities.x = PLAYER_SPEED * k * forward.x;
                new_velocities.z = PLAYER_SPEED * k * forward.z;
            }
            (false, true, sprint) => {
                let k = if sprint { SPRINT_MULTIPLIER } else { 1. };
                new_velocities.x = -PLAYER_SPEED * k * forward.x;
                new_velocities.z = -PLAYER_SPEED * k * forward.z;
            }
            _ => {}
        }

        // Process movement on the lateral axis
        let left = transform.left();
        match (
            input_state.pressed(Actions::StrafeLeft),
            input_state.pressed(Actions::StrafeRight),
            input_state.pressed(Actions::Sprint),
        ) {
            (true, false, sprint) => {
                let k = if sprint { SPRINT_MULTIPLIER } else { 1. };
                new_velocities.x += PLAYER_SPEED * k * left.x;
                new_velocities.z += PLAYER_SPEED * k * left.z;
            }
            (false, true, sprint) => {
                let k = if sprint { SPRINT_MULTIPLIER } else { 1. };
                new_velocities.x += -PLAYER_SPEED * k * left.x;
                new_velocities.z += -PLAYER_SPEED * k * left.z;
            }
            _ => {}
        }

        // Leave the vertical velocity to gravity.
        new_velocities.y = velocity.linvel.y;
        velocity.linvel = new_velocities;

        // Process mouse movement. We handle the rotation components separately:
        // * Rotation around the vertical axis (e.g. aiming left or right) is applied to the
        //   player root node.
        // * Rotation around the horizontal axis (e.g. aiming up or down) is applied directly to
        //   the perspective camera in order to keep the vertical orientation neutral on the root
        //   node.
        if let Some(mouse_movement) = input_state.axis_pair(Actions::Aim) {
            controller.theta += Angle::radians(mouse_movement.x()) * MOUSE_SENSITIVITY;
            controller.phi += Angle::radians(mouse_movement.y() * MOUSE_SENSITIVITY);
            controller.phi.radians = controller
                .phi
                .radians
                .clamp(-std::f32::consts::FRAC_PI_2, std::f32::consts::FRAC_PI_2);

            let v_rotation = Quat::from_axis_angle(Vec3::X, -controller.phi.radians);
            velocity.angvel.y = mouse_movement.x() * MOUSE_SENSITIVITY * MOUSE_ANGVEL_MULTIPLIER;

            if let Ok(mut camera_transform) = camera_query.get_mut(controller.camera_anchor) {
                camera_transform.rotation = v_rotation;
            }
        } else {
            velocity.angvel.y = 0.;
        }
    }
}

/// Upright body rotation and camera pitch for looking along `look`. When looking straight up
/// or down the body yaw can't be derived from `look`, `fallback_forward` is used instead.
pub fn upright_look(look: Vec3, fallback_forward: Vec3) -> (Quat, f32) {
    let look = look.normalize_or_zero();
    let horizontal = Vec3::new(look.x, 0., look.z);
    let fallback = Vec3::new(fallback_forward.x, 0., fallback_forward.z);
    let heading = if horizontal.length() > 0.001 {
        horizontal
    } else if fallback.length() > 0.001 {
        fallback
    } else {
        Vec3::NEG_Z
    };
    let yaw = Transform::IDENTITY.looking_at(heading, Vec3::Y).rotation;
    let pitch = look.y.clamp(-1., 1.).asin();
    (yaw, pitch)
}

/// Going through portals which aren't facing each other horizontally leaves the player
/// tilted. Put it back upright, keeping the direction it looks at.
fn reorient_on_teleport(
    mut teleports: EventReader<PortalTeleportEvent>,
    mut player_query: Query<(&mut Transform, &mut FirstPersonController)>,
    mut camera_query: Query<&mut Transform, Without<FirstPersonController>>,
) {
    for event in teleports.iter() {
        let (mut transform, mut controller) = match player_query.get_mut(event.entity) {
            Ok(player) => player,
            Err(_) => continue,
        };
        if transform.up().abs_diff_eq(Vec3::Y, 0.001) {
            continue;
        }

        let anchor_rotation = camera_query
            .get(controller.camera_anchor)
            .map(|t| t.rotation)
            .unwrap_or_default();
        let look = (transform.rotation * anchor_rotation).mul_vec3(Vec3::NEG_Z);
        let (yaw, pitch) = upright_look(look, event.teleported.direction);
        transform.rotation = yaw;
        controller.phi = Angle::radians(
            (-pitch).clamp(-std::f32::consts::FRAC_PI_2, std::f32::consts::FRAC_PI_2),
        );
        if let Ok(mut camera_transform) = camera_query.get_mut(controller.camera_anchor) {
            camera_transform.rotation = Quat::from_axis_angle(Vec3::X, -controller.phi.radians);
        }
        debug!("Reoriented player {:?} after teleport", event.entity);
    }
}

#[cfg(test)]
mod tests {
    use std::f32::consts::FRAC_PI_4;

    use super::*;

    #[test]
    fn upright_look_splits_yaw_and_pitch() {
        let (yaw, pitch) = upright_look(Vec3::new(1., 1., 0.), Vec3::NEG_Z);
        assert!((pitch - FRAC_PI_4).abs() < 1e-5);
        assert!(yaw.mul_vec3(Vec3::NEG_Z).abs_diff_eq(Vec3::X, 1e-5));
        assert!(yaw.mul_vec3(Vec3::Y).abs_diff_eq(Vec3::Y, 1e-5));
        // Camera pitch and body yaw recompose the original look direction.
        let look = (yaw * Quat::from_axis_angle(Vec3::X, pitch)).mul_vec3(Vec3::NEG_Z);
        assert!(look.abs_diff_eq(Vec3::new(1., 1., 0.).normalize(), 1e-5));
    }

    #[test]
    fn looking_straight_up_keeps_the_fallback_heading() {
        let (yaw, pitch) = upright_look(Vec3::Y, Vec3::Z);
        assert!((pitch - std::f32::consts::FRAC_PI_2).abs() < 1e-3);
        assert!(yaw.mul_vec3(Vec3::NEG_Z).abs_diff_eq(Vec3::Z, 1e-5));
    }
}
