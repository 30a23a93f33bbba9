//! Portal trigger bookkeeping.
//!
//! Rapier reports sensor contacts per collider. Objects are usually made of several
//! colliders hanging off one rigid body, so the portals track the set of colliders
//! touching their trigger and derive from it the set of distinct owners. Enter and exit
//! notifications are raised once per owner.

use bevy::{prelude::*, utils::HashMap};
use bevy_rapier3d::prelude::*;

use super::settings::PortalSettings;

/// Colliders touching one portal trigger, and the owners they belong to.
#[derive(Debug, Default, Clone, Component)]
pub struct PortalOverlaps {
    colliders: HashMap<Entity, Entity>,
    owners: HashMap<Entity, usize>,
}

impl PortalOverlaps {
    pub fn is_touching(&self) -> bool {
        !self.colliders.is_empty()
    }

    pub fn contains(&self, owner: Entity) -> bool {
        self.owners.contains_key(&owner)
    }

    pub fn contains_collider(&self, collider: Entity) -> bool {
        self.colliders.contains_key(&collider)
    }

    pub fn owners(&self) -> impl Iterator<Item = Entity> + '_ {
        self.owners.keys().copied()
    }

    pub fn colliders(&self) -> impl Iterator<Item = Entity> + '_ {
        self.colliders.keys().copied()
    }

    /// Record a collider entering the trigger. Returns the owner if it wasn't touching yet.
    pub fn begin(&mut self, collider: Entity, owner: Entity) -> Option<Entity> {
        if self.colliders.contains_key(&collider) {
            return None;
        }
        self.colliders.insert(collider, owner);
        let count = self.owners.entry(owner).or_insert(0);
        *count += 1;
        (*count == 1).then_some(owner)
    }

    /// Record a collider leaving the trigger. When it was the last collider of its owner,
    /// `on_exit` runs before the owner is dropped from the set, so it still sees the
    /// owner as touching. Only the closure gets that view: by the time anything reads the
    /// set again the owner is gone.
    pub fn end(&mut self, collider: Entity, on_exit: impl FnOnce(&Self, Entity)) {
        let owner = match self.colliders.get(&collider) {
            Some(owner) => *owner,
            None => return,
        };
        if self.owners.get(&owner).copied() == Some(1) {
            on_exit(self, owner);
            self.owners.remove(&owner);
        } else if let Some(count) = self.owners.get_mut(&owner) {
            *count -= 1;
        }
        self.colliders.remove(&collider);
    }
}

/// Owner level trigger notifications. Readers of `Exit` find the owner already removed
/// from the portal's [`PortalOverlaps`], so they take the owner from the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalOverlapEvent {
    Enter { portal: Entity, owner: Entity },
    Exit { portal: Entity, owner: Entity },
}

/// Owner of a collider: the closest rigid body up its hierarchy, or the collider itself.
fn collider_owner(
    collider: Entity,
    bodies: &Query<(), With<RigidBody>>,
    parents: &Query<&Parent>,
) -> Entity {
    let mut current = collider;
    loop {
        if bodies.contains(current) {
            return current;
        }
        match parents.get(current) {
            Ok(parent) => current = parent.get(),
            Err(_) => return collider,
        }
    }
}

pub(super) fn track_portal_overlaps(
    settings: Res<PortalSettings>,
    mut collisions: EventReader<CollisionEvent>,
    mut portals: Query<&mut PortalOverlaps>,
    groups: Query<&CollisionGroups>,
    bodies: Query<(), With<RigidBody>>,
    parents: Query<&Parent>,
    mut overlap_events: EventWriter<PortalOverlapEvent>,
) {
    let filter = settings.overlap_groups();
    for collision in collisions.iter() {
        let (collider_a, collider_b, started) = match collision {
            CollisionEvent::Started(a, b, _) => (*a, *b, true),
            CollisionEvent::Stopped(a, b, _) => (*a, *b, false),
        };
        // Two touching portal triggers aren't of interest.
        let (portal, collider) = match (portals.contains(collider_a), portals.contains(collider_b)) {
            (true, false) => (collider_a, collider_b),
            (false, true) => (collider_b, collider_a),
            _ => continue,
        };
        let mut overlaps = match portals.get_mut(portal) {
            Ok(overlaps) => overlaps,
            Err(_) => continue,
        };

        if started {
            // Colliders without explicit groups are members of every group.
            let memberships = groups.get(collider).map(|g| g.memberships).unwrap_or(Group::ALL);
            if !memberships.intersects(filter) {
                continue;
            }
            let owner = collider_owner(collider, &bodies, &parents);
            if let Some(owner) = overlaps.begin(collider, owner) {
                debug!("{:?} entered portal {:?}", owner, portal);
                overlap_events.send(PortalOverlapEvent::Enter { portal, owner });
            }
        } else {
            // Filtered colliders never made it into the set, so there is nothing to test
            // here. The collider may also be gone already.
            overlaps.end(collider, |_, owner| {
                debug!("{:?} left portal {:?}", owner, portal);
                overlap_events.send(PortalOverlapEvent::Exit { portal, owner });
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy_rapier3d::rapier::geometry::CollisionEventFlags;

    #[test]
    fn one_enter_and_exit_per_owner() {
        let owner = Entity::from_raw(10);
        let colliders = [Entity::from_raw(1), Entity::from_raw(2), Entity::from_raw(3)];
        let mut overlaps = PortalOverlaps::default();

        let entered: Vec<_> = colliders.iter().filter_map(|&c| overlaps.begin(c, owner)).collect();
        assert_eq!(entered, vec![owner]);

        let mut exits = 0;
        overlaps.end(colliders[0], |_, _| exits += 1);
        overlaps.end(colliders[1], |_, _| exits += 1);
        assert_eq!(exits, 0);
        assert!(overlaps.contains(owner));

        overlaps.end(colliders[2], |set, o| {
            assert_eq!(o, owner);
            assert!(set.contains(o), "owner must still be listed during its exit");
            exits += 1;
        });
        assert_eq!(exits, 1);
        assert!(!overlaps.contains(owner));
        assert!(!overlaps.is_touching());
    }

    #[test]
    fn unknown_collider_exit_is_ignored() {
        let mut overlaps = PortalOverlaps::default();
        overlaps.begin(Entity::from_raw(1), Entity::from_raw(5));
        overlaps.end(Entity::from_raw(2), |_, _| panic!("no exit expected"));
        assert!(overlaps.contains(Entity::from_raw(5)));
    }

    #[test]
    fn duplicate_begin_is_counted_once() {
        let owner = Entity::from_raw(5);
        let collider = Entity::from_raw(1);
        let mut overlaps = PortalOverlaps::default();
        assert_eq!(overlaps.begin(collider, owner), Some(owner));
        assert_eq!(overlaps.begin(collider, owner), None);
        let mut exits = 0;
        overlaps.end(collider, |_, _| exits += 1);
        assert_eq!(exits, 1);
        assert!(!overlaps.contains(owner));
    }

    #[derive(Default, Resource)]
    struct Seen(Vec<PortalOverlapEvent>);

    fn record(mut events: EventReader<PortalOverlapEvent>, mut seen: ResMut<Seen>) {
        seen.0.extend(events.iter().copied());
    }

    fn tracker_app() -> App {
        let mut app = App::new();
        app.init_resource::<PortalSettings>()
            .init_resource::<Seen>()
            .add_event::<CollisionEvent>()
            .add_event::<PortalOverlapEvent>()
            .add_system(track_portal_overlaps)
            .add_system(record.after(track_portal_overlaps));
        app
    }

    fn send(app: &mut App, event: CollisionEvent) {
        app.world.resource_mut::<Events<CollisionEvent>>().send(event);
    }

    #[test]
    fn child_colliders_resolve_to_their_body() {
        let mut app = tracker_app();
        let portal = app.world.spawn(PortalOverlaps::default()).id();
        let body = app.world.spawn(RigidBody::Dynamic).id();
        let part_a = app.world.spawn_empty().id();
        let part_b = app.world.spawn_empty().id();
        app.world.entity_mut(body).push_children(&[part_a, part_b]);

        send(&mut app, CollisionEvent::Started(portal, part_a, CollisionEventFlags::SENSOR));
        send(&mut app, CollisionEvent::Started(part_b, portal, CollisionEventFlags::SENSOR));
        app.update();

        let overlaps = app.world.get::<PortalOverlaps>(portal).unwrap();
        assert!(overlaps.contains(body));
        assert_eq!(overlaps.colliders().count(), 2);
        assert_eq!(
            app.world.resource::<Seen>().0,
            vec![PortalOverlapEvent::Enter { portal, owner: body }]
        );

        send(&mut app, CollisionEvent::Stopped(portal, part_a, CollisionEventFlags::SENSOR));
        app.update();
        assert_eq!(app.world.resource::<Seen>().0.len(), 1);

        send(&mut app, CollisionEvent::Stopped(portal, part_b, CollisionEventFlags::SENSOR));
        app.update();
        assert_eq!(
            app.world.resource::<Seen>().0.last(),
            Some(&PortalOverlapEvent::Exit { portal, owner: body })
        );
    }

    #[derive(Default, Resource)]
    struct ListedOnExit(Vec<bool>);

    fn check_membership(
        mut events: EventReader<PortalOverlapEvent>,
        portals: Query<&PortalOverlaps>,
        mut listed: ResMut<ListedOnExit>,
    ) {
        for event in events.iter() {
            if let PortalOverlapEvent::Exit { portal, owner } = *event {
                let still_listed = portals.get(portal).map(|o| o.contains(owner)).unwrap_or(false);
                listed.0.push(still_listed);
            }
        }
    }

    #[test]
    fn exit_readers_find_the_owner_removed() {
        let mut app = tracker_app();
        app.init_resource::<ListedOnExit>()
            .add_system(check_membership.after(track_portal_overlaps));
        let portal = app.world.spawn(PortalOverlaps::default()).id();
        let body = app.world.spawn(RigidBody::Dynamic).id();

        send(&mut app, CollisionEvent::Started(portal, body, CollisionEventFlags::SENSOR));
        app.update();
        send(&mut app, CollisionEvent::Stopped(portal, body, CollisionEventFlags::SENSOR));
        app.update();

        assert_eq!(app.world.resource::<ListedOnExit>().0, vec![false]);
    }

    #[test]
    fn filtered_groups_are_ignored() {
        let mut app = tracker_app();
        let portal = app.world.spawn(PortalOverlaps::default()).id();
        let wall = app
            .world
            .spawn(CollisionGroups::new(crate::plugins::physics::WALLS_GROUP, Group::ALL))
            .id();
        send(&mut app, CollisionEvent::Started(portal, wall, CollisionEventFlags::SENSOR));
        app.update();
        send(&mut app, CollisionEvent::Stopped(portal, wall, CollisionEventFlags::SENSOR));
        app.update();

        assert!(!app.world.get::<PortalOverlaps>(portal).unwrap().is_touching());
        assert!(app.world.resource::<Seen>().0.is_empty());
    }
}
