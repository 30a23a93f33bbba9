use std::{fs, io, path::Path};

use bevy::prelude::*;
use bevy_rapier3d::prelude::Group;
use serde::Deserialize;

use crate::plugins::physics::{PLAYER_GROUP, PROPS_GROUP};

use super::error::PortalError;

pub const SETTINGS_PATH: &str = "assets/portal_settings.json";

const MAX_RECURSION_DEPTH: u32 = 8;

/// Tunables of the portal systems, read once at startup.
#[derive(Debug, Clone, PartialEq, Resource, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortalSettings {
    /// Local z coordinate at or below which a tracked object has crossed a portal.
    pub crossing_threshold: f32,
    /// Number of nested portal views rendered through each portal.
    pub max_recursion_depth: u32,
    pub render_target_size: [u32; 2],
    pub portal_half_extents: [f32; 2],
    pub trigger_half_depth: f32,
    /// Collision group bits of the colliders the portal triggers report.
    pub overlap_filter: u32,
}

impl Default for PortalSettings {
    fn default() -> Self {
        PortalSettings {
            crossing_threshold: 0.,
            max_recursion_depth: 3,
            render_target_size: [1280, 720],
            portal_half_extents: [1., 1.],
            trigger_half_depth: 0.6,
            overlap_filter: (PLAYER_GROUP | PROPS_GROUP).bits(),
        }
    }
}

impl PortalSettings {
    pub fn from_json(json: &str) -> Result<Self, PortalError> {
        let settings: PortalSettings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PortalError> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// Load the settings file, falling back to the defaults if it is missing or broken.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(settings) => {
                info!("Loaded portal settings from {}", path.display());
                settings
            }
            Err(PortalError::SettingsIo(e)) if e.kind() == io::ErrorKind::NotFound => {
                info!("No portal settings at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                error!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), PortalError> {
        if !self.crossing_threshold.is_finite() {
            return Err(PortalError::InvalidSettings("crossing_threshold must be finite"));
        }
        if self.max_recursion_depth > MAX_RECURSION_DEPTH {
            return Err(PortalError::InvalidSettings("max_recursion_depth must be at most 8"));
        }
        if self.render_target_size.iter().any(|&s| s == 0) {
            return Err(PortalError::InvalidSettings("render_target_size must be non zero"));
        }
        if self.portal_half_extents.iter().any(|&e| e.is_nan() || e <= 0.)
            || self.trigger_half_depth.is_nan()
            || self.trigger_half_depth <= 0.
        {
            return Err(PortalError::InvalidSettings("portal dimensions must be positive"));
        }
        Ok(())
    }

    pub fn half_extents(&self) -> Vec2 {
        Vec2::from(self.portal_half_extents)
    }

    pub fn overlap_groups(&self) -> Group {
        Group::from_bits_truncate(self.overlap_filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let settings =
            PortalSettings::from_json(r#"{ "crossing_threshold": -0.05, "max_recursion_depth": 2 }"#)
                .unwrap();
        assert_eq!(settings.crossing_threshold, -0.05);
        assert_eq!(settings.max_recursion_depth, 2);
        assert_eq!(settings.render_target_size, [1280, 720]);
        assert_eq!(settings.overlap_groups(), PLAYER_GROUP | PROPS_GROUP);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            PortalSettings::from_json(r#"{ "max_recursion_depth": 40 }"#),
            Err(PortalError::InvalidSettings(_))
        ));
        assert!(matches!(
            PortalSettings::from_json(r#"{ "portal_half_extents": [0.0, 1.0] }"#),
            Err(PortalError::InvalidSettings(_))
        ));
        assert!(matches!(
            PortalSettings::from_json(r#"{ "crossing_treshold": 1.0 }"#),
            Err(PortalError::SettingsParse(_))
        ));
    }

    #[test]
    fn shipped_settings_are_valid() {
        let settings =
            PortalSettings::from_json(include_str!("../../../assets/portal_settings.json")).unwrap();
        assert_eq!(settings.max_recursion_depth, 3);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let settings = PortalSettings::load_or_default("does/not/exist.json");
        assert_eq!(settings, PortalSettings::default());
    }
}
