use std::f32::consts::*;

use crate::{
    plugins::*,
    util::scenes::{make_portal_pair, make_props, make_test_arena},
};

use bevy::{log::LogPlugin, prelude::*};
use bevy_rapier3d::prelude::*;
use iyes_loopless::prelude::*;

#[derive(Debug)]
/// Main game plugin, responsible for loading the other game plugins and bootstrapping the game.
pub struct GamePlugin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GameState {
    Loading,
    InGame,
}

impl Plugin for GamePlugin {
    fn build(&self, app: &mut App) {
        app.add_plugins(
            DefaultPlugins
                .set(WindowPlugin {
                    window: WindowDescriptor {
                        title: "Lost Portals".to_string(),
                        width: 1280.,
                        height: 720.,
                        ..default()
                    },
                    ..default()
                })
                .set(LogPlugin {
                    level: bevy::log::Level::INFO,
                    filter: "wgpu=error,lost_portals=debug".to_string(),
                }),
        );

        #[cfg(feature = "devel")]
        {
            app.add_plugins(dev_plugins::DeveloperPlugins);
        }

        app.add_loopless_state(GameState::Loading);
        app.add_plugin(RapierPhysicsPlugin::<NoUserData>::default());
        app.add_plugin(physics::PhysicsPlugin);
        app.add_plugin(input::InputPlugin);
        app.add_plugin(portal::PortalPlugin);
        app.add_plugin(first_person_controller::FirstPersonControllerPlugin);

        app.add_enter_system(GameState::Loading, setup_level);
    }
}

/// Spawn the demo level and start playing.
fn setup_level(
    mut commands: Commands,
    settings: Res<portal::PortalSettings>,
    mut meshes: ResMut<Assets<Mesh>>,
    mut materials: ResMut<Assets<StandardMaterial>>,
    mut sliced_materials: ResMut<Assets<portal::SlicedMaterial>>,
) {
    const ARENA_LENGTH: f32 = 20.;
    const ARENA_HEIGHT: f32 = 4.;

    make_test_arena(&mut commands, &mut meshes, &mut materials, ARENA_LENGTH, ARENA_HEIGHT);
    make_portal_pair(&mut commands, &settings, ARENA_LENGTH);
    make_props(&mut commands, &mut meshes, &mut sliced_materials);

    // Light
    commands.spawn(DirectionalLightBundle {
        directional_light: DirectionalLight {
            color: Color::ANTIQUE_WHITE,
            illuminance: 20_000.,
            shadows_enabled: true,
            ..default()
        },
        transform: Transform {
            translation: Vec3::Y * 5.,
            rotation: Quat::from_euler(EulerRot::YXZ, FRAC_PI_4, -FRAC_PI_4, 0.),
            scale: Vec3::ONE,
        },
        ..default()
    });

    commands.spawn(first_person_controller::FirstPersonControllerBundle {
        spatial: SpatialBundle::from_transform(Transform::from_xyz(0., 1., 4.)),
        ..default()
    });

    info!("Level ready");
    commands.insert_resource(NextState(GameState::InGame));
}
