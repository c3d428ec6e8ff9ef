use glam::Vec3;
use tether::{Entity, EntityType, ReplicatedVariable, Variable};

pub const MAX_HEALTH: i32 = 100;

pub struct Player {
    pub health: Variable<i32>,
    pub position: Variable<Vec3>,
    pub name: Variable<String>,
    /// Server-side only, never replicated.
    pub velocity: Vec3,
    regen_carry: f32,
}

impl Player {
    /// Whole health points earned from `amount`, keeping the fraction.
    pub fn accumulate_regen(&mut self, amount: f32) -> i32 {
        self.regen_carry += amount;
        let whole = self.regen_carry.floor();
        self.regen_carry -= whole;
        whole as i32
    }
}

impl Entity for Player {
    fn variables(&self) -> Vec<&dyn ReplicatedVariable> {
        vec![&self.health as &dyn ReplicatedVariable, &self.position, &self.name]
    }

    fn variables_mut(&mut self) -> Vec<&mut dyn ReplicatedVariable> {
        vec![
            &mut self.health as &mut dyn ReplicatedVariable,
            &mut self.position,
            &mut self.name,
        ]
    }
}

impl EntityType for Player {
    const TYPE_NAME: &'static str = "Player";
    const VARIABLES: &'static [&'static str] = &["Health", "Position", "Name"];

    fn create() -> Self {
        Self {
            health: Variable::new(MAX_HEALTH),
            position: Variable::new(Vec3::ZERO),
            name: Variable::new(String::new()),
            velocity: Vec3::ZERO,
            regen_carry: 0.0,
        }
    }
}
