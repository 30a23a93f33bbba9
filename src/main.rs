#![allow(clippy::type_complexity, clippy::too_many_arguments)]

use bevy::prelude::*;

mod plugins;
mod util;

fn main() {
    App::new().add_plugin(plugins::game::GamePlugin).run();
}
