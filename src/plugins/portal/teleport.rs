//! Moving objects through portals.
//!
//! While an object overlaps a portal trigger it is either still in front of the portal
//! plane, in which case a replica of its visual is shown coming out of the linked portal,
//! or it went past the plane, in which case the object itself is relocated.

use bevy::{prelude::*, utils::HashSet};
use bevy_rapier3d::prelude::*;

use crate::plugins::physics::WALLS_GROUP;

use super::{
    error::PortalError,
    geometry::{portal_front_plane, to_portal_local, PortalToPortal},
    material::SlicedMaterial,
    overlap::{PortalOverlapEvent, PortalOverlaps},
    registry::PortalPairRegistry,
    settings::PortalSettings,
};

/// Marks an object which can go through portals.
#[derive(Debug, Component, Clone, Default)]
pub struct PortalTeleport {
    /// Entity carrying the mesh and material the replicas are copied from.
    pub visual: Option<Entity>,
    replicas: ReplicaSlots,
    replicas_disabled: bool,
    /// Portal the object last came through. It is ignored until it reports the object
    /// leaving its trigger.
    disarmed: Option<Entity>,
    /// Portals the object was seen in front of since it entered their trigger. Only those
    /// can relocate it.
    armed: Vec<Entity>,
    /// Portal triggers currently touched, and the collision filter to restore once none are.
    touching: Vec<Entity>,
    saved_filters: Option<Group>,
}

impl PortalTeleport {
    pub fn with_visual(visual: Entity) -> Self {
        PortalTeleport {
            visual: Some(visual),
            ..default()
        }
    }

    pub fn replica_for(&self, portal: Entity) -> Option<Entity> {
        self.replicas.replica_for(portal)
    }

    pub fn replicas_disabled(&self) -> bool {
        self.replicas_disabled
    }

    pub fn disarmed(&self) -> Option<Entity> {
        self.disarmed
    }

    pub fn is_armed(&self, portal: Entity) -> bool {
        self.armed.contains(&portal)
    }
}

/// Visual copy of a tracked object shown on the far side of a portal.
#[derive(Debug, Component, Clone, Copy)]
pub struct Replica {
    pub source: Entity,
    pub portal: Entity,
}

/// Plane cutting the parts of a mesh which are on its negative side, `None` when nothing
/// is cut. Applied by visuals using a [`SlicedMaterial`].
#[derive(Debug, Component, Clone, Copy, Default, PartialEq)]
pub struct SliceClip {
    pub plane: Option<Vec4>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaSlot {
    pub portal: Entity,
    pub replica: Entity,
}

/// Replica to use for a portal, as found by [`ReplicaSlots::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAcquire {
    /// Replica already bound to the portal, or an idle one now rebound to it.
    Replica(Entity),
    /// No replica yet, a new one has to be spawned and stored at this index.
    Empty(usize),
    Exhausted,
}

/// The replicas of one object, keyed by portal. An object straddles at most the two
/// portals of a pair at once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaSlots {
    slots: [Option<ReplicaSlot>; 2],
}

impl ReplicaSlots {
    pub fn replica_for(&self, portal: Entity) -> Option<Entity> {
        self.slots
            .iter()
            .flatten()
            .find(|s| s.portal == portal)
            .map(|s| s.replica)
    }

    pub fn acquire(&mut self, portal: Entity, is_idle: impl Fn(Entity) -> bool) -> SlotAcquire {
        if let Some(replica) = self.replica_for(portal) {
            return SlotAcquire::Replica(replica);
        }
        if let Some(index) = self.slots.iter().position(Option::is_none) {
            return SlotAcquire::Empty(index);
        }
        for slot in self.slots.iter_mut().flatten() {
            if is_idle(slot.replica) {
                slot.portal = portal;
                return SlotAcquire::Replica(slot.replica);
            }
        }
        SlotAcquire::Exhausted
    }

    pub fn fill(&mut self, index: usize, slot: ReplicaSlot) {
        self.slots[index] = Some(slot);
    }

    pub fn replicas(&self) -> impl Iterator<Item = Entity> + '_ {
        self.slots.iter().flatten().map(|s| s.replica)
    }
}

/// Which side of the portal plane an object is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossingSide {
    Front,
    Crossed,
}

impl CrossingSide {
    /// Objects exactly on the threshold have crossed.
    pub fn classify(local_z: f32, threshold: f32) -> Self {
        if local_z > threshold {
            CrossingSide::Front
        } else {
            CrossingSide::Crossed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TeleportPose {
    pub position: Vec3,
    pub direction: Vec3,
}

impl From<&Transform> for TeleportPose {
    fn from(t: &Transform) -> Self {
        TeleportPose {
            position: t.translation,
            direction: t.forward(),
        }
    }
}

/// Sent once every time an object is relocated through a portal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PortalTeleportEvent {
    pub entity: Entity,
    pub source: Entity,
    pub destination: Entity,
    /// Rotation applied to the object and its velocities.
    pub rotation: Quat,
    pub original: TeleportPose,
    pub teleported: TeleportPose,
}

/// Move an object pose and velocity through a portal pair, returning the poses before and
/// after.
pub fn relocate(
    to_exit: &PortalToPortal,
    transform: &mut Transform,
    velocity: Option<&mut Velocity>,
) -> (TeleportPose, TeleportPose) {
    let original = TeleportPose::from(&*transform);
    *transform = to_exit.transform_pose(transform);
    if let Some(velocity) = velocity {
        velocity.linvel = to_exit.transform_direction(velocity.linvel);
        velocity.angvel = to_exit.transform_direction(velocity.angvel);
    }
    (original, TeleportPose::from(&*transform))
}

/// Check the visual roots of new teleportable objects. A broken configuration only
/// disables the replicas of that object.
pub(super) fn validate_teleportables(
    mut commands: Commands,
    mut added: Query<(Entity, &mut PortalTeleport), Added<PortalTeleport>>,
    visuals: Query<
        (),
        (
            With<Handle<Mesh>>,
            Or<(With<Handle<StandardMaterial>>, With<Handle<SlicedMaterial>>)>,
        ),
    >,
) {
    for (entity, mut teleport) in &mut added {
        let error = match teleport.visual {
            None => {
                debug!("{:?} has no visual root, it won't get replicas", entity);
                teleport.replicas_disabled = true;
                continue;
            }
            Some(visual) if visual == entity => PortalError::VisualIsObject(entity),
            Some(visual) if !visuals.contains(visual) => PortalError::VisualWithoutMesh(visual),
            Some(visual) => {
                commands.entity(visual).insert(SliceClip::default());
                continue;
            }
        };
        error!("{}", error);
        teleport.replicas_disabled = true;
    }
}

/// Hide the replica of objects leaving a portal, and re-arm the portal they came through.
/// Works from the event alone, the owner is no longer in the portal's overlap set.
pub(super) fn handle_portal_exits(
    mut overlap_events: EventReader<PortalOverlapEvent>,
    mut objects: Query<&mut PortalTeleport>,
    mut replicas: Query<(&mut Visibility, &mut SliceClip), With<Replica>>,
    mut clips: Query<&mut SliceClip, Without<Replica>>,
) {
    for event in overlap_events.iter() {
        let (portal, owner) = match *event {
            PortalOverlapEvent::Exit { portal, owner } => (portal, owner),
            PortalOverlapEvent::Enter { .. } => continue,
        };
        let mut teleport = match objects.get_mut(owner) {
            Ok(teleport) => teleport,
            Err(_) => continue,
        };
        if teleport.disarmed == Some(portal) {
            teleport.disarmed = None;
        }
        teleport.armed.retain(|&p| p != portal);
        if let Some(replica) = teleport.replica_for(portal) {
            if let Ok((mut visibility, mut clip)) = replicas.get_mut(replica) {
                visibility.is_visible = false;
                clip.plane = None;
            }
            if let Some(mut clip) = teleport.visual.and_then(|v| clips.get_mut(v).ok()) {
                clip.plane = None;
            }
        }
    }
}

/// Let objects touching a portal trigger pass through walls, so they can go through the
/// surface the portal is placed on.
pub(super) fn open_wall_passage(
    mut overlap_events: EventReader<PortalOverlapEvent>,
    mut objects: Query<(&mut PortalTeleport, &mut CollisionGroups)>,
) {
    for event in overlap_events.iter() {
        match *event {
            PortalOverlapEvent::Enter { portal, owner } => {
                if let Ok((mut teleport, mut groups)) = objects.get_mut(owner) {
                    if teleport.touching.is_empty() {
                        teleport.saved_filters = Some(groups.filters);
                        groups.filters.remove(WALLS_GROUP);
                        debug!("{:?} can pass walls", owner);
                    }
                    if !teleport.touching.contains(&portal) {
                        teleport.touching.push(portal);
                    }
                }
            }
            PortalOverlapEvent::Exit { portal, owner } => {
                if let Ok((mut teleport, mut groups)) = objects.get_mut(owner) {
                    teleport.touching.retain(|&p| p != portal);
                    if teleport.touching.is_empty() {
                        if let Some(filters) = teleport.saved_filters.take() {
                            groups.filters = filters;
                            debug!("{:?} collides with walls again", owner);
                        }
                    }
                }
            }
        }
    }
}

/// Update the replicas of the objects in front of a portal, and relocate those which went
/// through. Runs once the overlap sets of the step are settled.
pub(super) fn teleport_objects(
    mut commands: Commands,
    settings: Res<PortalSettings>,
    registry: Res<PortalPairRegistry>,
    portals: Query<(Entity, &GlobalTransform, &PortalOverlaps)>,
    mut objects: Query<
        (&mut Transform, &mut PortalTeleport, Option<&mut Velocity>),
        Without<Replica>,
    >,
    mut replicas: Query<
        (&mut Replica, &mut Transform, &mut Visibility, &mut SliceClip),
        Without<PortalTeleport>,
    >,
    mut clips: Query<&mut SliceClip, Without<Replica>>,
    globals: Query<&GlobalTransform>,
    visuals: Query<(
        &Handle<Mesh>,
        Option<&Handle<SlicedMaterial>>,
        Option<&Handle<StandardMaterial>>,
    )>,
    mut teleports: EventWriter<PortalTeleportEvent>,
) {
    let threshold = settings.crossing_threshold;
    let mut teleported = HashSet::new();

    for (source, source_global, overlaps) in &portals {
        if !overlaps.is_touching() {
            continue;
        }
        let destination = match registry.other_portal(source) {
            Some(destination) => destination,
            None => continue,
        };
        let destination_global = match portals.get(destination) {
            Ok((_, global, _)) => global,
            Err(_) => continue,
        };
        let source_t = source_global.compute_transform();
        let destination_t = destination_global.compute_transform();
        let to_exit = PortalToPortal::between(&source_t, &destination_t);

        for owner in overlaps.owners() {
            if teleported.contains(&owner) {
                continue;
            }
            let (mut transform, mut teleport, velocity) = match objects.get_mut(owner) {
                Ok(object) => object,
                Err(_) => continue,
            };
            if teleport.disarmed == Some(source) {
                continue;
            }

            let local = to_portal_local(&source_t, transform.translation);
            match CrossingSide::classify(local.z, threshold) {
                CrossingSide::Front => {
                    if !teleport.is_armed(source) {
                        teleport.armed.push(source);
                    }
                    if teleport.replicas_disabled {
                        continue;
                    }
                    let visual = match teleport.visual {
                        Some(visual) => visual,
                        None => continue,
                    };
                    // Pose of the visual relative to its object, as of the last propagation.
                    let offset = match (globals.get(owner), globals.get(visual)) {
                        (Ok(object), Ok(visual)) => Transform::from_matrix(
                            object.compute_matrix().inverse() * visual.compute_matrix(),
                        ),
                        _ => Transform::IDENTITY,
                    };
                    let pose = to_exit.transform_pose(&transform) * offset;
                    let replica_clip = Some(portal_front_plane(&destination_t));

                    let acquired = teleport.replicas.acquire(source, |replica| {
                        replicas
                            .get(replica)
                            .map(|(_, _, visibility, _)| !visibility.is_visible)
                            .unwrap_or(false)
                    });
                    match acquired {
                        SlotAcquire::Replica(replica) => {
                            if let Ok((mut r, mut r_transform, mut visibility, mut clip)) =
                                replicas.get_mut(replica)
                            {
                                r.portal = source;
                                *r_transform = pose;
                                visibility.is_visible = true;
                                clip.plane = replica_clip;
                            }
                        }
                        SlotAcquire::Empty(index) => {
                            let (mesh, sliced, standard) = match visuals.get(visual) {
                                Ok((mesh, sliced, standard))
                                    if sliced.is_some() || standard.is_some() =>
                                {
                                    (mesh, sliced, standard)
                                }
                                _ => {
                                    error!("{}", PortalError::VisualWithoutMesh(visual));
                                    teleport.replicas_disabled = true;
                                    continue;
                                }
                            };
                            let mut replica = commands.spawn((
                                mesh.clone(),
                                SpatialBundle::from_transform(pose),
                                Replica {
                                    source: owner,
                                    portal: source,
                                },
                                SliceClip {
                                    plane: replica_clip,
                                },
                                Name::from("Replica"),
                            ));
                            if let Some(material) = sliced {
                                replica.insert(material.clone());
                            } else if let Some(material) = standard {
                                replica.insert(material.clone());
                            }
                            let replica = replica.id();
                            teleport.replicas.fill(
                                index,
                                ReplicaSlot {
                                    portal: source,
                                    replica,
                                },
                            );
                            info!("Spawned replica {:?} of {:?} for portal {:?}", replica, owner, source);
                        }
                        SlotAcquire::Exhausted => {
                            warn!("{}", PortalError::ReplicaSlotsExhausted(owner));
                            continue;
                        }
                    }
                    if let Ok(mut clip) = clips.get_mut(visual) {
                        clip.plane = Some(portal_front_plane(&source_t));
                    }
                }
                // Entered from behind, or landed behind the exit: the object has to show
                // up in front of this portal first.
                CrossingSide::Crossed if !teleport.is_armed(source) => {}
                CrossingSide::Crossed => {
                    let (original, teleported_pose) =
                        relocate(&to_exit, &mut transform, velocity.map(|v| v.into_inner()));
                    teleport.disarmed = Some(source);
                    teleport.armed.retain(|&p| p != source);

                    if let Some(replica) = teleport.replica_for(source) {
                        if let Ok((_, _, mut visibility, mut clip)) = replicas.get_mut(replica) {
                            visibility.is_visible = false;
                            clip.plane = None;
                        }
                    }
                    if let Some(mut clip) = teleport.visual.and_then(|v| clips.get_mut(v).ok()) {
                        clip.plane = None;
                    }

                    teleported.insert(owner);
                    info!(
                        "Teleported {:?} from portal {:?} to {:?}, now at {}",
                        owner, source, destination, teleported_pose.position
                    );
                    teleports.send(PortalTeleportEvent {
                        entity: owner,
                        source,
                        destination,
                        rotation: to_exit.rotation,
                        original,
                        teleported: teleported_pose,
                    });
                }
            }
        }
    }
}

/// Replicas live as long as the object they copy.
pub(super) fn despawn_orphan_replicas(
    mut commands: Commands,
    replicas: Query<(Entity, &Replica)>,
    objects: Query<(), With<PortalTeleport>>,
) {
    for (entity, replica) in &replicas {
        if !objects.contains(replica.source) {
            debug!("Despawning replica {:?} of {:?}", entity, replica.source);
            commands.entity(entity).despawn_recursive();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::f32::consts::{FRAC_PI_2, PI};

    use super::*;
    use bevy_rapier3d::rapier::geometry::CollisionEventFlags;
    use crate::plugins::{
        physics::PROPS_GROUP,
        portal::{registry::PortalPairId, Portal, PortalCorePlugin},
    };

    #[test]
    fn threshold_is_inclusive_for_crossing() {
        assert_eq!(CrossingSide::classify(0.01, 0.), CrossingSide::Front);
        assert_eq!(CrossingSide::classify(0., 0.), CrossingSide::Crossed);
        assert_eq!(CrossingSide::classify(-0.1, 0.), CrossingSide::Crossed);
        assert_eq!(CrossingSide::classify(0.5, 0.5), CrossingSide::Crossed);
        assert_eq!(CrossingSide::classify(0.6, 0.5), CrossingSide::Front);
    }

    #[test]
    fn slots_rebind_idle_replicas() {
        let (a, b, c) = (Entity::from_raw(1), Entity::from_raw(2), Entity::from_raw(3));
        let (r0, r1) = (Entity::from_raw(10), Entity::from_raw(11));
        let mut slots = ReplicaSlots::default();

        assert_eq!(slots.acquire(a, |_| false), SlotAcquire::Empty(0));
        slots.fill(0, ReplicaSlot { portal: a, replica: r0 });
        assert_eq!(slots.acquire(a, |_| false), SlotAcquire::Replica(r0));
        assert_eq!(slots.acquire(b, |_| false), SlotAcquire::Empty(1));
        slots.fill(1, ReplicaSlot { portal: b, replica: r1 });

        assert_eq!(slots.acquire(c, |_| false), SlotAcquire::Exhausted);
        assert_eq!(slots.acquire(c, |r| r == r1), SlotAcquire::Replica(r1));
        assert_eq!(slots.replica_for(c), Some(r1));
        assert_eq!(slots.replica_for(b), None);
        assert_eq!(slots.replicas().count(), 2);
    }

    #[test]
    fn velocities_follow_the_portal_rotation() {
        let a = Transform::IDENTITY;
        let b = Transform::from_xyz(5., 0., 0.).with_rotation(Quat::from_rotation_y(FRAC_PI_2));
        let to_exit = PortalToPortal::between(&a, &b);
        let mut transform = Transform::from_xyz(0., 1., -0.1);
        let mut velocity = Velocity {
            linvel: Vec3::NEG_Z * 2.,
            angvel: Vec3::Y,
        };
        let (original, teleported) = relocate(&to_exit, &mut transform, Some(&mut velocity));

        assert!(original.position.abs_diff_eq(Vec3::new(0., 1., -0.1), 1e-5));
        assert!(teleported.position.abs_diff_eq(Vec3::new(5.1, 1., 0.), 1e-5));
        // Moving into A means moving out of B's front face.
        assert!(velocity.linvel.abs_diff_eq(Vec3::X * 2., 1e-5));
        assert!(velocity.angvel.abs_diff_eq(Vec3::Y, 1e-5));
        assert!(teleported.direction.abs_diff_eq(Vec3::X, 1e-5));
    }

    #[derive(Default, Resource)]
    struct Teleports(Vec<PortalTeleportEvent>);

    fn record(mut events: EventReader<PortalTeleportEvent>, mut seen: ResMut<Teleports>) {
        seen.0.extend(events.iter().copied());
    }

    struct Scene {
        app: App,
        portal_a: Entity,
        portal_b: Entity,
        object: Entity,
    }

    /// Portal A at the origin facing +Z, portal B behind it at z = -10 facing -Z, so that
    /// going through A moves objects 10 units down the -Z axis.
    fn scene() -> Scene {
        scene_with(
            PortalSettings::default(),
            Transform::from_xyz(0., 0., -10.).with_rotation(Quat::from_rotation_y(PI)),
        )
    }

    fn scene_with(settings: PortalSettings, b: Transform) -> Scene {
        let mut app = App::new();
        app.insert_resource(settings)
            .add_plugin(PortalCorePlugin)
            .init_resource::<Teleports>()
            .add_system_to_stage(CoreStage::Last, record);

        let a = Transform::IDENTITY;
        let portal_a = app
            .world
            .spawn((Portal::new(PortalPairId(0)), PortalOverlaps::default(), a, GlobalTransform::from(a)))
            .id();
        let portal_b = app
            .world
            .spawn((Portal::new(PortalPairId(0)), PortalOverlaps::default(), b, GlobalTransform::from(b)))
            .id();

        let start = Transform::from_xyz(0., 0., 2.);
        let visual = app
            .world
            .spawn((
                Transform::IDENTITY,
                GlobalTransform::from(start),
                Handle::<Mesh>::default(),
                Handle::<StandardMaterial>::default(),
            ))
            .id();
        let object = app
            .world
            .spawn((
                RigidBody::Dynamic,
                start,
                GlobalTransform::from(start),
                Velocity::default(),
                CollisionGroups::new(PROPS_GROUP, Group::ALL),
                PortalTeleport::with_visual(visual),
            ))
            .id();
        app.world.entity_mut(object).push_children(&[visual]);

        Scene {
            app,
            portal_a,
            portal_b,
            object,
        }
    }

    impl Scene {
        fn collide(&mut self, started: bool) {
            self.collide_with(self.portal_a, started);
        }

        fn collide_with(&mut self, portal: Entity, started: bool) {
            let event = if started {
                CollisionEvent::Started(portal, self.object, CollisionEventFlags::SENSOR)
            } else {
                CollisionEvent::Stopped(portal, self.object, CollisionEventFlags::SENSOR)
            };
            self.app.world.resource_mut::<Events<CollisionEvent>>().send(event);
        }

        fn move_object(&mut self, z: f32) {
            self.app.world.get_mut::<Transform>(self.object).unwrap().translation.z = z;
        }

        fn object_z(&self) -> f32 {
            self.app.world.get::<Transform>(self.object).unwrap().translation.z
        }

        fn replica(&mut self) -> Option<(Transform, bool)> {
            let mut query = self.app.world.query::<(&Replica, &Transform, &Visibility)>();
            query
                .iter(&self.app.world)
                .find(|(r, _, _)| r.portal == self.portal_a)
                .map(|(_, t, v)| (*t, v.is_visible))
        }

        fn teleports(&self) -> usize {
            self.app.world.resource::<Teleports>().0.len()
        }

        fn last_teleport(&self) -> Option<PortalTeleportEvent> {
            self.app.world.resource::<Teleports>().0.last().copied()
        }
    }

    #[test]
    fn replica_shows_before_crossing() {
        let mut scene = scene();
        scene.collide(true);
        scene.app.update();

        let (replica, visible) = scene.replica().expect("replica spawned");
        assert!(visible);
        assert!(replica.translation.abs_diff_eq(Vec3::new(0., 0., -8.), 1e-4));
        assert!((scene.object_z() - 2.).abs() < 1e-6);
        assert_eq!(scene.teleports(), 0);
    }

    #[test]
    fn crossing_teleports_exactly_once() {
        let mut scene = scene();
        scene.collide(true);
        scene.app.update();

        scene.move_object(-0.1);
        scene.app.update();
        assert_eq!(scene.teleports(), 1);
        assert!((scene.object_z() + 10.1).abs() < 1e-4);
        let (_, visible) = scene.replica().unwrap();
        assert!(!visible);

        let event = scene.app.world.resource::<Teleports>().0[0];
        assert_eq!(event.entity, scene.object);
        assert_eq!(event.source, scene.portal_a);
        assert!(event.original.position.abs_diff_eq(Vec3::new(0., 0., -0.1), 1e-5));

        // The object is now behind A again, but A hasn't reported it leaving yet.
        scene.app.update();
        assert_eq!(scene.teleports(), 1);
        assert_eq!(
            scene.app.world.get::<PortalTeleport>(scene.object).unwrap().disarmed(),
            Some(scene.portal_a)
        );

        scene.collide(false);
        scene.app.update();
        assert_eq!(scene.app.world.get::<PortalTeleport>(scene.object).unwrap().disarmed(), None);
    }

    #[test]
    fn backing_away_hides_the_replica() {
        let mut scene = scene();
        scene.collide(true);
        scene.app.update();
        assert!(scene.replica().unwrap().1);

        scene.collide(false);
        scene.app.update();
        let (_, visible) = scene.replica().unwrap();
        assert!(!visible);
        assert!((scene.object_z() - 2.).abs() < 1e-6);
        assert_eq!(scene.teleports(), 0);
    }

    #[test]
    fn walls_are_passable_inside_a_trigger() {
        let mut scene = scene();
        scene.collide(true);
        scene.app.update();
        let filters = scene.app.world.get::<CollisionGroups>(scene.object).unwrap().filters;
        assert!(!filters.intersects(WALLS_GROUP));

        scene.collide(false);
        scene.app.update();
        let filters = scene.app.world.get::<CollisionGroups>(scene.object).unwrap().filters;
        assert_eq!(filters, Group::ALL);
    }

    #[test]
    fn visual_aliasing_the_object_disables_replicas() {
        let mut scene = scene();
        let object = scene.object;
        scene.app.world.entity_mut(object).insert(PortalTeleport::with_visual(object));
        scene.collide(true);
        scene.app.update();
        assert!(scene.app.world.get::<PortalTeleport>(object).unwrap().replicas_disabled());
        assert!(scene.replica().is_none());
    }

    #[test]
    fn positive_threshold_lands_without_bouncing() {
        let settings = PortalSettings {
            crossing_threshold: 0.5,
            ..default()
        };
        let mut scene = scene_with(
            settings,
            Transform::from_xyz(0., 0., -10.).with_rotation(Quat::from_rotation_y(PI)),
        );
        let (portal_a, portal_b) = (scene.portal_a, scene.portal_b);
        scene.collide(true);
        scene.app.update();

        // Past the threshold but still in front of the plane. B sees it at local z = -0.3,
        // also below the threshold.
        scene.move_object(0.3);
        scene.app.update();
        assert_eq!(scene.teleports(), 1);
        assert!((scene.object_z() + 9.7).abs() < 1e-4);

        scene.collide_with(portal_a, false);
        scene.collide_with(portal_b, true);
        for _ in 0..4 {
            scene.app.update();
        }
        assert_eq!(scene.teleports(), 1);
        assert!((scene.object_z() + 9.7).abs() < 1e-4);

        // Walking out of B and back in goes through B as usual.
        scene.move_object(-11.);
        scene.app.update();
        assert_eq!(scene.teleports(), 1);
        scene.move_object(-10.3);
        scene.app.update();
        assert_eq!(scene.teleports(), 2);
        assert_eq!(scene.last_teleport().map(|e| e.source), Some(portal_b));
        assert!((scene.object_z() + 0.3).abs() < 1e-4);
    }

    #[test]
    fn entering_from_behind_does_not_teleport() {
        let mut scene = scene();
        scene.move_object(-0.3);
        scene.collide(true);
        scene.app.update();
        scene.app.update();
        assert_eq!(scene.teleports(), 0);
        assert!((scene.object_z() + 0.3).abs() < 1e-6);
    }

    #[test]
    fn one_teleport_per_step_between_back_to_back_portals() {
        // B shares A's plane and faces the other way, so going through either portal leaves
        // objects where they are.
        let settings = PortalSettings {
            crossing_threshold: -0.2,
            ..default()
        };
        let mut scene = scene_with(settings, Transform::from_rotation(Quat::from_rotation_y(PI)));
        let (portal_a, portal_b) = (scene.portal_a, scene.portal_b);
        scene.move_object(0.);
        scene.collide_with(portal_a, true);
        scene.collide_with(portal_b, true);
        scene.app.update();
        {
            let teleport = scene.app.world.get::<PortalTeleport>(scene.object).unwrap();
            assert!(teleport.is_armed(portal_a) && teleport.is_armed(portal_b));
        }
        assert_eq!(scene.teleports(), 0);

        // Now the object is past the threshold of both portals at once.
        scene.app.world.resource_mut::<PortalSettings>().crossing_threshold = 0.5;
        scene.app.update();
        assert_eq!(scene.teleports(), 1);
        let event = scene.last_teleport().unwrap();
        assert!(event.source == portal_a || event.source == portal_b);
        assert_eq!(
            scene.app.world.get::<PortalTeleport>(scene.object).unwrap().disarmed(),
            Some(event.source)
        );
        assert!(scene.object_z().abs() < 1e-4);
    }

    #[test]
    fn replica_copies_the_sliced_material() {
        let mut scene = scene();
        let visual = scene.app.world.get::<PortalTeleport>(scene.object).unwrap().visual.unwrap();
        let mut visual = scene.app.world.entity_mut(visual);
        visual.remove::<Handle<StandardMaterial>>();
        visual.insert(Handle::<SlicedMaterial>::default());
        scene.collide(true);
        scene.app.update();

        let mut replicas = scene.app.world.query_filtered::<&SliceClip, (
            With<Replica>,
            With<Handle<SlicedMaterial>>,
            Without<Handle<StandardMaterial>>,
        )>();
        let clips: Vec<_> = replicas.iter(&scene.app.world).copied().collect();
        assert_eq!(clips.len(), 1);
        // The replica is cut by the plane of the portal it comes out of.
        let exit = Transform::from_xyz(0., 0., -10.).with_rotation(Quat::from_rotation_y(PI));
        let plane = clips[0].plane.unwrap();
        assert!(plane.abs_diff_eq(portal_front_plane(&exit), 1e-5));
    }
}
