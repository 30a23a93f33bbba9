use bevy::{
    pbr::{MaterialPipeline, MaterialPipelineKey},
    prelude::*,
    reflect::TypeUuid,
    render::{
        mesh::MeshVertexBufferLayout,
        render_resource::{
            AsBindGroup, RenderPipelineDescriptor, ShaderRef, ShaderType,
            SpecializedMeshPipelineError,
        },
    },
};

use super::{
    camera_rig::PortalSurface, registry::PortalPairRegistry, teleport::SliceClip, PortalResources,
};

/// Surface of a linked portal, showing the render target of the next view level with
/// screen space coordinates.
#[derive(AsBindGroup, Debug, Clone, TypeUuid, Reflect)]
#[uuid = "6f0cf4be-2a4a-4b8e-9d36-1c1e3a3f8d51"]
pub struct OpenPortalMaterial {
    #[texture(0)]
    #[sampler(1)]
    pub texture: Handle<Image>,
}

impl Material for OpenPortalMaterial {
    fn fragment_shader() -> ShaderRef {
        "shaders/portal_open.wgsl".into()
    }

    fn specialize(
        _pipeline: &MaterialPipeline<Self>,
        descriptor: &mut RenderPipelineDescriptor,
        _layout: &MeshVertexBufferLayout,
        _key: MaterialPipelineKey<Self>,
    ) -> Result<(), SpecializedMeshPipelineError> {
        descriptor.primitive.cull_mode = None;
        Ok(())
    }
}

/// Surface of a portal without a partner, or too deep to show anything.
#[derive(AsBindGroup, Debug, Clone, TypeUuid, Reflect)]
#[uuid = "b7d2e0a4-53c1-4f6e-8a2b-91f4c7de0e12"]
pub struct ClosedPortalMaterial {
    #[uniform(0)]
    pub uniform: ClosedPortalUniform,
}

impl From<Color> for ClosedPortalMaterial {
    fn from(color: Color) -> Self {
        ClosedPortalMaterial {
            uniform: ClosedPortalUniform { color },
        }
    }
}

impl Material for ClosedPortalMaterial {
    fn fragment_shader() -> ShaderRef {
        "shaders/portal_closed.wgsl".into()
    }

    fn specialize(
        _pipeline: &MaterialPipeline<Self>,
        descriptor: &mut RenderPipelineDescriptor,
        _layout: &MeshVertexBufferLayout,
        _key: MaterialPipelineKey<Self>,
    ) -> Result<(), SpecializedMeshPipelineError> {
        descriptor.primitive.cull_mode = None;
        Ok(())
    }
}

#[derive(Debug, Clone, ShaderType, Reflect)]
pub struct ClosedPortalUniform {
    pub color: Color,
}

/// Plane keeping every point.
const KEEP_ALL: Vec4 = Vec4::W;

/// Flat shaded surface for objects going through portals. Fragments on the negative side
/// of the clip plane are discarded, so the part of an object which already went through
/// a portal doesn't stick out behind it.
#[derive(AsBindGroup, Debug, Clone, TypeUuid, Reflect)]
#[uuid = "3c5e9a71-0d24-4b8f-a6e2-58b1f0c47d93"]
pub struct SlicedMaterial {
    #[uniform(0)]
    pub uniform: SlicedUniform,
}

#[derive(Debug, Clone, ShaderType, Reflect)]
pub struct SlicedUniform {
    pub color: Color,
    /// World space plane `(n, d)`, points with `n.p + d < 0` are cut.
    pub clip_plane: Vec4,
}

impl From<Color> for SlicedMaterial {
    fn from(color: Color) -> Self {
        SlicedMaterial {
            uniform: SlicedUniform {
                color,
                clip_plane: KEEP_ALL,
            },
        }
    }
}

impl SlicedMaterial {
    pub fn clip(&self) -> Option<Vec4> {
        (self.uniform.clip_plane != KEEP_ALL).then_some(self.uniform.clip_plane)
    }

    pub fn set_clip(&mut self, plane: Option<Vec4>) {
        self.uniform.clip_plane = plane.unwrap_or(KEEP_ALL);
    }
}

impl Material for SlicedMaterial {
    fn fragment_shader() -> ShaderRef {
        "shaders/sliced.wgsl".into()
    }

    fn specialize(
        _pipeline: &MaterialPipeline<Self>,
        descriptor: &mut RenderPipelineDescriptor,
        _layout: &MeshVertexBufferLayout,
        _key: MaterialPipelineKey<Self>,
    ) -> Result<(), SpecializedMeshPipelineError> {
        // The inside of a cut mesh shows through the cut.
        descriptor.primitive.cull_mode = None;
        Ok(())
    }
}

/// The entity got its own copy of the material it was spawned with.
#[derive(Debug, Component)]
pub(super) struct OwnSlicedMaterial;

/// Push the slice planes of the visuals and replicas into their materials. Replicas start
/// out sharing the material of the visual they copy, so every entity gets its own copy the
/// first time its plane differs.
pub(super) fn update_slice_clips(
    mut commands: Commands,
    mut materials: ResMut<Assets<SlicedMaterial>>,
    mut clipped: Query<
        (Entity, &SliceClip, &mut Handle<SlicedMaterial>, Option<&OwnSlicedMaterial>),
        Changed<SliceClip>,
    >,
) {
    for (entity, clip, mut handle, owned) in &mut clipped {
        let mut material = match materials.get(&handle) {
            Some(material) if material.clip() != clip.plane => material.clone(),
            _ => continue,
        };
        material.set_clip(clip.plane);
        if owned.is_some() {
            if let Some(current) = materials.get_mut(&handle) {
                *current = material;
            }
        } else {
            *handle = materials.add(material);
            commands.entity(entity).insert(OwnSlicedMaterial);
        }
    }
}

/// Swap the surfaces between the open and closed materials as portals get linked and
/// unlinked.
pub(super) fn update_portal_surfaces(
    mut commands: Commands,
    registry: Res<PortalPairRegistry>,
    resources: Res<PortalResources>,
    surfaces: Query<(
        Entity,
        &PortalSurface,
        Option<&Handle<OpenPortalMaterial>>,
        Option<&Handle<ClosedPortalMaterial>>,
    )>,
) {
    for (entity, surface, open, closed) in &surfaces {
        let linked = registry.other_portal(surface.portal).is_some();
        match (&surface.open, linked) {
            (Some(material), true) => {
                if open.is_none() {
                    debug!("Opening portal {:?} at depth {}", surface.portal, surface.depth);
                    commands
                        .entity(entity)
                        .remove::<Handle<ClosedPortalMaterial>>()
                        .insert(material.clone());
                }
            }
            _ => {
                let index = registry.index_in_pair(surface.portal).unwrap_or(0);
                let expected = &resources.closed_materials[index % 2];
                if open.is_some() || closed != Some(expected) {
                    commands
                        .entity(entity)
                        .remove::<Handle<OpenPortalMaterial>>()
                        .insert(expected.clone());
                }
            }
        }
    }
}
