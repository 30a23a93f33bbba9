//! Hand-off between the camera rig and whatever renders the portal views.
//!
//! Nested views are issued depth first. Every level is entered before the levels it
//! contains and exited after them, and drawing happens on the way back up, so the
//! innermost view is drawn first and every enclosing level can composite the one it
//! contains.

use bevy::prelude::*;

use super::{camera_rig::PerspectiveLens, geometry::plane_to_view_space};

/// One virtual camera to render.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlannedView {
    pub portal: Entity,
    /// 1 for the view seen directly through the portal.
    pub depth: u32,
    pub camera: Transform,
    pub lens: PerspectiveLens,
    /// World space plane of the exit portal, positive on the visible side.
    pub clip_plane: Vec4,
}

impl PlannedView {
    pub fn view_clip_plane(&self) -> Vec4 {
        plane_to_view_space(&self.camera, self.clip_plane)
    }
}

/// Receives the plan. `enter` and `exit` bracket everything rendered inside a level, and
/// whatever `enter` changes on shared state has to be undone by the matching `exit`.
pub trait PortalRenderBackend {
    fn enter(&mut self, view: &PlannedView);
    fn draw(&mut self, view: &PlannedView);
    fn exit(&mut self, view: &PlannedView);
}

/// Exits its level when dropped.
struct LevelScope<'a, B: PortalRenderBackend> {
    backend: &'a mut B,
    view: &'a PlannedView,
}

impl<'a, B: PortalRenderBackend> LevelScope<'a, B> {
    fn enter(backend: &'a mut B, view: &'a PlannedView) -> Self {
        backend.enter(view);
        LevelScope { backend, view }
    }

    fn backend(&mut self) -> &mut B {
        self.backend
    }
}

impl<'a, B: PortalRenderBackend> Drop for LevelScope<'a, B> {
    fn drop(&mut self) {
        self.backend.exit(self.view);
    }
}

/// Views to render this frame, one chain per portal ordered from depth 1 inwards.
#[derive(Debug, Default, Clone, Resource)]
pub struct PortalRenderPlan {
    chains: Vec<Vec<PlannedView>>,
}

impl PortalRenderPlan {
    pub fn clear(&mut self) {
        self.chains.clear();
    }

    pub fn push_chain(&mut self, chain: Vec<PlannedView>) {
        if !chain.is_empty() {
            self.chains.push(chain);
        }
    }

    pub fn view_count(&self) -> usize {
        self.chains.iter().map(Vec::len).sum()
    }

    pub fn views(&self) -> impl Iterator<Item = &PlannedView> {
        self.chains.iter().flatten()
    }

    pub fn find(&self, portal: Entity, depth: u32) -> Option<&PlannedView> {
        self.views().find(|v| v.portal == portal && v.depth == depth)
    }

    pub fn issue<B: PortalRenderBackend>(&self, backend: &mut B) {
        for chain in &self.chains {
            issue_nested(chain, backend);
        }
    }
}

fn issue_nested<B: PortalRenderBackend>(chain: &[PlannedView], backend: &mut B) {
    if let Some((outer, inner)) = chain.split_first() {
        let mut scope = LevelScope::enter(backend, outer);
        issue_nested(inner, scope.backend());
        scope.backend().draw(outer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Call {
        Enter(u32),
        Draw(u32),
        Exit(u32),
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<Call>,
    }

    impl PortalRenderBackend for Recorder {
        fn enter(&mut self, view: &PlannedView) {
            self.calls.push(Call::Enter(view.depth));
        }

        fn draw(&mut self, view: &PlannedView) {
            self.calls.push(Call::Draw(view.depth));
        }

        fn exit(&mut self, view: &PlannedView) {
            self.calls.push(Call::Exit(view.depth));
        }
    }

    fn chain(portal: Entity, depth: u32) -> Vec<PlannedView> {
        (1..=depth)
            .map(|depth| PlannedView {
                portal,
                depth,
                camera: Transform::from_xyz(0., 0., depth as f32 * 10.),
                lens: PerspectiveLens::default(),
                clip_plane: Vec4::Z,
            })
            .collect()
    }

    #[test]
    fn inner_levels_are_drawn_first() {
        let mut plan = PortalRenderPlan::default();
        plan.push_chain(chain(Entity::from_raw(1), 3));
        let mut recorder = Recorder::default();
        plan.issue(&mut recorder);
        assert_eq!(
            recorder.calls,
            vec![
                Call::Enter(1),
                Call::Enter(2),
                Call::Enter(3),
                Call::Draw(3),
                Call::Exit(3),
                Call::Draw(2),
                Call::Exit(2),
                Call::Draw(1),
                Call::Exit(1),
            ]
        );
    }

    #[test]
    fn chains_are_independent() {
        let (a, b) = (Entity::from_raw(1), Entity::from_raw(2));
        let mut plan = PortalRenderPlan::default();
        plan.push_chain(chain(a, 2));
        plan.push_chain(Vec::new());
        plan.push_chain(chain(b, 1));
        assert_eq!(plan.view_count(), 3);
        assert!(plan.find(b, 1).is_some());
        assert!(plan.find(b, 2).is_none());

        let mut recorder = Recorder::default();
        plan.issue(&mut recorder);
        let entered = recorder.calls.iter().filter(|c| matches!(c, Call::Enter(_))).count();
        let exited = recorder.calls.iter().filter(|c| matches!(c, Call::Exit(_))).count();
        assert_eq!(entered, 3);
        assert_eq!(exited, 3);
        assert_eq!(recorder.calls.last(), Some(&Call::Exit(1)));
    }
}
