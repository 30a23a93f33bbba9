use bevy::prelude::Entity;
use thiserror::Error;

use super::registry::PortalPairId;

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("portal pair {0:?} already holds two portals, ignoring {1:?}")]
    PairFull(PortalPairId, Entity),
    #[error("the teleportable visual of {0:?} must be a separate entity")]
    VisualIsObject(Entity),
    #[error("the teleportable visual {0:?} has no mesh and material to replicate")]
    VisualWithoutMesh(Entity),
    #[error("{0:?} already has visible replicas in both of its slots")]
    ReplicaSlotsExhausted(Entity),
    #[error("failed to read the portal settings: {0}")]
    SettingsIo(#[from] std::io::Error),
    #[error("failed to parse the portal settings: {0}")]
    SettingsParse(#[from] serde_json::Error),
    #[error("invalid portal settings: {0}")]
    InvalidSettings(&'static str),
}
