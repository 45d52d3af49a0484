use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const WORLD_WIDTH: f32 = 800.0;
pub const WORLD_HEIGHT: f32 = 600.0;
pub const UNIT_SIZE: f32 = 16.0;
pub const UNIT_MAX_SPEED: f32 = 120.0;

/// Complete world state at one instant.
///
/// Cloning produces a fully independent value: every field is owned, so a
/// copy handed to a client can be mutated without touching the original.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct WorldState {
    pub tick: u64,
    pub hp: i64,
    pub units: BTreeMap<u32, Unit>,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_units(units: impl IntoIterator<Item = Unit>) -> Self {
        Self {
            tick: 0,
            hp: 0,
            units: units.into_iter().map(|unit| (unit.id, unit)).collect(),
        }
    }

    pub fn spawn(&mut self, unit: Unit) {
        self.units.insert(unit.id, unit);
    }

    pub fn living_units(&self) -> usize {
        self.units.values().filter(|unit| unit.is_alive()).count()
    }

    /// Encodes the snapshot for the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Unit {
    pub id: u32,
    pub owner: u64,
    pub x: f32,
    pub y: f32,
    pub vel_x: f32,
    pub vel_y: f32,
    pub hp: i32,
}

impl Unit {
    pub fn new(id: u32, owner: u64, x: f32, y: f32) -> Self {
        Self {
            id,
            owner,
            x,
            y,
            vel_x: 0.0,
            vel_y: 0.0,
            hp: 100,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.hp > 0
    }

    /// Sets the velocity, limited to `UNIT_MAX_SPEED` per axis.
    pub fn set_velocity(&mut self, vel_x: f32, vel_y: f32) {
        self.vel_x = vel_x.clamp(-UNIT_MAX_SPEED, UNIT_MAX_SPEED);
        self.vel_y = vel_y.clamp(-UNIT_MAX_SPEED, UNIT_MAX_SPEED);
    }

    /// Moves the unit by `dt` seconds and keeps it inside the world.
    ///
    /// Hitting a wall stops movement along that axis.
    pub fn integrate(&mut self, dt: f32) {
        self.x += self.vel_x * dt;
        self.y += self.vel_y * dt;

        let max_x = WORLD_WIDTH - UNIT_SIZE;
        let max_y = WORLD_HEIGHT - UNIT_SIZE;

        if self.x <= 0.0 || self.x >= max_x {
            self.x = self.x.clamp(0.0, max_x);
            self.vel_x = 0.0;
        }
        if self.y <= 0.0 || self.y >= max_y {
            self.y = self.y.clamp(0.0, max_y);
            self.vel_y = 0.0;
        }
    }
}
