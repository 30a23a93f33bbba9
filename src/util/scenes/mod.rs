use std::f32::consts::FRAC_PI_2;

use bevy::prelude::*;
use bevy_rapier3d::prelude::*;

use crate::plugins::{
    physics::*,
    portal::{PortalBundle, PortalPairId, PortalSettings, PortalTeleport, SlicedMaterial},
};

/// Setup a test room in a square flate arena format of specified size.
/// 5 cubes for the walls and floor, with physics colliders.
pub fn make_test_arena(
    commands: &mut Commands,
    meshes: &mut ResMut<Assets<Mesh>>,
    materials: &mut ResMut<Assets<StandardMaterial>>,
    length: f32,
    height: f32,
) {
    const WALL_THICKNESS: f32 = 1.;

    let walls_materials = [
        materials.add(StandardMaterial::from(Color::RED)),
        materials.add(StandardMaterial::from(Color::GREEN)),
        materials.add(StandardMaterial::from(Color::BLUE)),
        materials.add(StandardMaterial::from(Color::ANTIQUE_WHITE)),
    ];
    let ground_material = materials.add(StandardMaterial::from(Color::DARK_GRAY));

    let half_len = length / 2.;
    let wall_mesh = meshes.add(
        shape::Box {
            min_x: -half_len,
            max_x: half_len,
            min_y: -height / 2.,
            max_y: height / 2.,
            min_z: -WALL_THICKNESS / 2.,
            max_z: WALL_THICKNESS / 2.,
        }
        .into(),
    );
    let ground_mesh = meshes.add(
        shape::Box {
            min_x: -half_len * 1.1,
            max_x: half_len * 1.1,
            min_y: -WALL_THICKNESS / 2.,
            max_y: WALL_THICKNESS / 2.,
            min_z: -half_len * 1.1,
            max_z: half_len * 1.1,
        }
        .into(),
    );

    let mut ground = commands.spawn(PbrBundle {
        mesh: ground_mesh.clone(),
        material: ground_material.clone(),
        transform: Transform::from_xyz(0., -WALL_THICKNESS / 2., 0.),
        ..default()
    });
    ground.insert((
        Name::from("Ground"),
        RigidBody::Fixed,
        Collider::cuboid(half_len * 1.1, WALL_THICKNESS / 2., half_len * 1.1),
        CollisionGroups::new(GROUND_GROUP, ALL_GROUPS),
    ));

    ground.with_children(|parent| {
        for (i, mat) in walls_materials.into_iter().enumerate() {
            let mut transform =
                Transform::from_xyz(0., height / 2., -(half_len + WALL_THICKNESS / 2.));
            transform.rotate_around(
                Vec3::new(0., height / 2., 0.),
                Quat::from_axis_angle(Vec3::Y, i as f32 * FRAC_PI_2),
            );
            parent
                .spawn(PbrBundle {
                    mesh: wall_mesh.clone(),
                    material: mat,
                    transform,
                    ..default()
                })
                .insert((
                    Name::from(format!("Wall_{}", i)),
                    RigidBody::Fixed,
                    Collider::cuboid(half_len, height / 2., WALL_THICKNESS / 2.),
                    CollisionGroups::new(WALLS_GROUP, ALL_GROUPS),
                ));
        }
        parent
            .spawn(PbrBundle {
                mesh: ground_mesh,
                material: ground_material,
                transform: Transform::from_translation(Vec3::Y * height),
                ..default()
            })
            .insert((
                Name::from("Ceiling"),
                RigidBody::Fixed,
                Collider::cuboid(half_len * 1.1, WALL_THICKNESS / 2., half_len * 1.1),
                CollisionGroups::new(GROUND_GROUP, ALL_GROUPS),
            ));
    });
}

/// Two linked portals on adjacent walls of an arena made by [`make_test_arena`].
pub fn make_portal_pair(commands: &mut Commands, settings: &PortalSettings, length: f32) {
    // Keep the surfaces off the walls to prevent Z fighting.
    const WALL_OFFSET: f32 = 0.01;
    let inner = length / 2. - WALL_OFFSET;
    let height = settings.half_extents().y + 0.05;

    let placements = [
        Transform::from_xyz(-4., height, -inner),
        Transform::from_xyz(inner, height, 3.).with_rotation(Quat::from_rotation_y(-FRAC_PI_2)),
    ];
    for transform in placements {
        commands.spawn(PortalBundle::new(PortalPairId(0), transform, settings));
    }
}

/// A few boxes to push through the portals. Their meshes live on a child entity, which the
/// replicas are copied from.
pub fn make_props(
    commands: &mut Commands,
    meshes: &mut ResMut<Assets<Mesh>>,
    materials: &mut ResMut<Assets<SlicedMaterial>>,
) {
    const HALF_SIZE: f32 = 0.25;

    let mesh = meshes.add(shape::Cube { size: HALF_SIZE * 2. }.into());
    let colors = [Color::GOLD, Color::TEAL, Color::CRIMSON];
    for (i, color) in colors.into_iter().enumerate() {
        let visual = commands
            .spawn(MaterialMeshBundle::<SlicedMaterial> {
                mesh: mesh.clone(),
                material: materials.add(SlicedMaterial::from(color)),
                ..default()
            })
            .insert(Name::from("Prop visual"))
            .id();
        commands
            .spawn(SpatialBundle::from_transform(Transform::from_xyz(
                -4. + i as f32 * 1.5,
                HALF_SIZE + 0.5,
                -5.,
            )))
            .insert((
                Name::from(format!("Prop_{}", i)),
                RigidBody::Dynamic,
                Collider::cuboid(HALF_SIZE, HALF_SIZE, HALF_SIZE),
                Velocity::default(),
                Ccd::enabled(),
                CollisionGroups::new(PROPS_GROUP, ALL_GROUPS),
                PortalTeleport::with_visual(visual),
            ))
            .add_child(visual);
    }
}
