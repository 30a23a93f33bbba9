//! Portal pairing.

use bevy::{
    prelude::*,
    render::{camera::RenderTarget, view::RenderLayers},
    utils::HashMap,
    window::WindowId,
};

use super::{error::PortalError, Portal, PortalCamera, PORTALS_RENDER_LAYER};

/// Scope in which two portals link to each other.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Reflect)]
pub struct PortalPairId(pub u32);

/// The registered members of one pair, in registration order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PortalPair {
    members: Vec<Entity>,
}

impl PortalPair {
    pub fn members(&self) -> &[Entity] {
        &self.members
    }

    pub fn is_linked(&self) -> bool {
        self.members.len() == 2
    }

    /// First registered member that isn't `portal`.
    pub fn other(&self, portal: Entity) -> Option<Entity> {
        if !self.members.contains(&portal) {
            return None;
        }
        self.members.iter().copied().find(|&p| p != portal)
    }
}

/// Tracks which portals are linked, and which camera looks at them.
#[derive(Debug, Default, Resource)]
pub struct PortalPairRegistry {
    pairs: HashMap<PortalPairId, PortalPair>,
    scopes: HashMap<Entity, PortalPairId>,
    active_camera: Option<Entity>,
}

impl PortalPairRegistry {
    /// Registering an already registered portal is a no-op. A third portal in the same
    /// pair is refused and leaves the pair untouched.
    pub fn register(&mut self, portal: Entity, pair: PortalPairId) -> Result<(), PortalError> {
        if let Some(current) = self.scopes.get(&portal) {
            if *current == pair {
                return Ok(());
            }
            self.unregister(portal);
        }
        let members = &mut self.pairs.entry(pair).or_default().members;
        if members.len() >= 2 {
            return Err(PortalError::PairFull(pair, portal));
        }
        members.push(portal);
        self.scopes.insert(portal, pair);
        Ok(())
    }

    /// Returns the pair the portal was removed from, if it was registered.
    pub fn unregister(&mut self, portal: Entity) -> Option<PortalPairId> {
        let pair = self.scopes.remove(&portal)?;
        if let Some(members) = self.pairs.get_mut(&pair).map(|p| &mut p.members) {
            members.retain(|&p| p != portal);
            if members.is_empty() {
                self.pairs.remove(&pair);
            }
        }
        Some(pair)
    }

    /// The portal linked to `portal`, `None` while it is alone in its pair.
    pub fn other_portal(&self, portal: Entity) -> Option<Entity> {
        let pair = self.scopes.get(&portal)?;
        self.pairs.get(pair)?.other(portal)
    }

    pub fn pair(&self, pair: PortalPairId) -> Option<&PortalPair> {
        self.pairs.get(&pair)
    }

    pub fn pair_of(&self, portal: Entity) -> Option<PortalPairId> {
        self.scopes.get(&portal).copied()
    }

    /// Index of the portal inside its pair, 0 for the first registered one.
    pub fn index_in_pair(&self, portal: Entity) -> Option<usize> {
        let pair = self.pairs.get(self.scopes.get(&portal)?)?;
        pair.members.iter().position(|&p| p == portal)
    }

    pub fn active_camera(&self) -> Option<Entity> {
        self.active_camera
    }

    pub fn set_active_camera(&mut self, camera: Option<Entity>) {
        self.active_camera = camera;
    }
}

pub(super) fn register_portals(
    mut registry: ResMut<PortalPairRegistry>,
    added: Query<(Entity, &Portal), Added<Portal>>,
) {
    for (entity, portal) in &added {
        match registry.register(entity, portal.pair) {
            Ok(()) => {
                info!("Registered portal {:?} in pair {:?}", entity, portal.pair);
                if let Some(other) = registry.other_portal(entity) {
                    info!("Portal {:?} linked to {:?}", entity, other);
                }
            }
            Err(e) => {
                error!("{}", e);
                debug_assert!(false, "{}", e);
            }
        }
    }
}

pub(super) fn unregister_portals(
    mut registry: ResMut<PortalPairRegistry>,
    removed: RemovedComponents<Portal>,
) {
    for entity in removed.iter() {
        if let Some(pair) = registry.unregister(entity) {
            info!("Unregistered portal {:?} from pair {:?}", entity, pair);
        }
    }
}

/// Resolve the camera rendering to the primary window once, and again only if it goes away.
pub(super) fn resolve_active_camera(
    mut commands: Commands,
    mut registry: ResMut<PortalPairRegistry>,
    cameras: Query<(Entity, &Camera, Option<&RenderLayers>), Without<PortalCamera>>,
) {
    if let Some(current) = registry.active_camera() {
        if cameras.contains(current) {
            return;
        }
        warn!("Active camera {:?} is gone", current);
        registry.set_active_camera(None);
    }

    let primary = RenderTarget::Window(WindowId::primary());
    let candidate = cameras
        .iter()
        .filter(|(_, camera, _)| camera.is_active && camera.target == primary)
        .max_by_key(|(_, camera, _)| camera.priority);
    if let Some((entity, _, layers)) = candidate {
        // The viewer has to see the portal surfaces, the portal cameras must not.
        let layers = layers.copied().unwrap_or_default().with(PORTALS_RENDER_LAYER);
        commands.entity(entity).insert(layers);
        info!("Active portal camera is now {:?}", entity);
        registry.set_active_camera(Some(entity));
    }
}
