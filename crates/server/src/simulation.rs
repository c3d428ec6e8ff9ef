use glam::Vec3;

use crate::player::{MAX_HEALTH, Player};

const ARENA_HALF_EXTENT: f32 = 50.0;

pub fn simulate_player(player: &mut Player, dt: f32, health_regen: f32) {
    let health = *player.health.get();
    if health < MAX_HEALTH {
        let gained = player.accumulate_regen(health_regen * dt);
        if gained > 0 {
            player.health.set((health + gained).min(MAX_HEALTH));
        }
    }

    if player.velocity.length_squared() > 0.0001 {
        let mut position = *player.position.get() + player.velocity * dt;
        for axis in [0, 2] {
            if position[axis].abs() > ARENA_HALF_EXTENT {
                position[axis] = position[axis].clamp(-ARENA_HALF_EXTENT, ARENA_HALF_EXTENT);
                player.velocity[axis] = -player.velocity[axis];
            }
        }
        player.position.set(position);
    }
}

/// Deterministic starting drift so spawned players spread out.
pub fn initial_velocity(seed: u32) -> Vec3 {
    let angle = (seed as f32) * 2.399_963;
    let (sin, cos) = angle.sin_cos();
    Vec3::new(cos, 0.0, sin) * 2.0
}
