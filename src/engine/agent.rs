use std::cell::RefCell;
use std::rc::Rc;

use serde::Serialize;
use thiserror::Error;

use super::config::*;
use super::grid::Point;
use super::query::{QueryError, QueryView, ScanResult};
use super::shop::Shop;

/// Facing direction of an agent. Declaration order is counter-clockwise,
/// which is what rotations step through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Up,
    Left,
    Down,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [Direction::Up, Direction::Left, Direction::Down, Direction::Right];

    /// Unit step `(dx, dy)` for a move in this direction. Rows grow downward.
    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }

    pub fn rotate(self, rotation: Rotation) -> Direction {
        let idx = Direction::ALL.iter().position(|d| *d == self).unwrap_or(0) as i32;
        let step = match rotation {
            Rotation::Left => 1,
            Rotation::Right => -1,
            Rotation::Back => 2,
        };
        Direction::ALL[(idx + step).rem_euclid(4) as usize]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "UP",
            Direction::Left => "LEFT",
            Direction::Down => "DOWN",
            Direction::Right => "RIGHT",
        }
    }

    /// Ordinal used by the scripting constants.
    pub fn code(self) -> i32 {
        match self {
            Direction::Up => 0,
            Direction::Left => 1,
            Direction::Down => 2,
            Direction::Right => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Direction> {
        Direction::ALL.get(usize::try_from(code).ok()?).copied()
    }
}

/// Relative turn applied to the current facing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Left,
    Right,
    Back,
}

impl Rotation {
    pub fn code(self) -> i32 {
        match self {
            Rotation::Left => 0,
            Rotation::Right => 1,
            Rotation::Back => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Rotation> {
        match code {
            0 => Some(Rotation::Left),
            1 => Some(Rotation::Right),
            2 => Some(Rotation::Back),
            _ => None,
        }
    }
}

/// The four integer attributes of an agent. Setters clamp into the
/// configured `[MIN, MAX]` range, so the fields never leave it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AgentStats {
    health: i32,
    power: i32,
    currency: i32,
    range: i32,
}

impl Default for AgentStats {
    fn default() -> Self {
        AgentStats {
            health: DEFAULT_HEALTH,
            power: DEFAULT_POWER,
            currency: DEFAULT_CURRENCY,
            range: DEFAULT_RANGE,
        }
    }
}

impl AgentStats {
    pub fn new(health: i32, power: i32, currency: i32, range: i32) -> Self {
        let mut stats = AgentStats::default();
        stats.set_health(health);
        stats.set_power(power);
        stats.set_currency(currency);
        stats.set_range(range);
        stats
    }

    pub fn health(&self) -> i32 {
        self.health
    }

    pub fn power(&self) -> i32 {
        self.power
    }

    pub fn currency(&self) -> i32 {
        self.currency
    }

    pub fn range(&self) -> i32 {
        self.range
    }

    pub fn set_health(&mut self, v: i32) {
        self.health = v.clamp(MIN_HEALTH, MAX_HEALTH);
    }

    pub fn set_power(&mut self, v: i32) {
        self.power = v.clamp(MIN_POWER, MAX_POWER);
    }

    pub fn set_currency(&mut self, v: i32) {
        self.currency = v.clamp(MIN_CURRENCY, MAX_CURRENCY);
    }

    pub fn set_range(&mut self, v: i32) {
        self.range = v.clamp(MIN_RANGE, MAX_RANGE);
    }

    /// True once health has dropped to its floor.
    pub fn is_spent(&self) -> bool {
        self.health <= MIN_HEALTH
    }
}

/// Failure raised while an agent was deciding. The decision is discarded.
#[derive(Debug, Error)]
pub enum AgentFault {
    #[error("script error: {0}")]
    Script(String),
    #[error("decision panicked: {0}")]
    Panicked(String),
}

impl From<mlua::Error> for AgentFault {
    fn from(e: mlua::Error) -> Self {
        AgentFault::Script(e.to_string())
    }
}

/// Everything an agent may read or change during one decision call.
///
/// Stats, direction and the queued move are a working copy: the arena
/// commits them back only when the decision returns without a fault.
pub struct Decision {
    pub name: String,
    pub cycle: u64,
    pub view: QueryView,
    pub stats: AgentStats,
    pub direction: Direction,
    pub pending: Option<Direction>,
    pub rates: ExchangeRates,
    pub output: Vec<String>,
}

impl Decision {
    pub fn shop(&mut self) -> Shop<'_> {
        Shop::new(&mut self.stats, &self.rates)
    }

    pub fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
    }

    pub fn turn(&mut self, rotation: Rotation) {
        self.direction = self.direction.rotate(rotation);
    }

    /// Queue one step in the current facing. A later call in the same
    /// decision replaces the earlier one.
    pub fn move_forward(&mut self) {
        self.pending = Some(self.direction);
    }

    /// Scan around `(x, y)` with the agent's current range.
    pub fn scan(&self, x: i32, y: i32) -> Result<ScanResult, QueryError> {
        self.view.scan(Point::new(x, y), self.stats.range())
    }
}

/// A loaded competitor program. Called once per cycle with a fresh decision.
pub trait AgentProgram {
    fn decide(&mut self, decision: &Rc<RefCell<Decision>>) -> Result<(), AgentFault>;
}

impl<F> AgentProgram for F
where
    F: FnMut(&mut Decision) -> Result<(), AgentFault>,
{
    fn decide(&mut self, decision: &Rc<RefCell<Decision>>) -> Result<(), AgentFault> {
        let mut d = decision.borrow_mut();
        self(&mut *d)
    }
}

/// A competitor in the arena.
pub struct Agent {
    pub name: String,
    pub stats: AgentStats,
    pub direction: Direction,
    /// Moved to a new cell during the last cycle.
    pub moving: bool,
    /// Took combat damage during the last cycle.
    pub damaged: bool,
    program: Box<dyn AgentProgram>,
}

impl Agent {
    pub fn new(name: &str, program: Box<dyn AgentProgram>) -> Self {
        Agent {
            name: name.to_string(),
            stats: AgentStats::default(),
            direction: Direction::Up,
            moving: false,
            damaged: false,
            program,
        }
    }

    pub fn from_fn<F>(name: &str, f: F) -> Self
    where
        F: FnMut(&mut Decision) -> Result<(), AgentFault> + 'static,
    {
        Agent::new(name, Box::new(f))
    }

    /// Run the program, turning a panic into `AgentFault::Panicked`.
    pub fn decide(&mut self, decision: &Rc<RefCell<Decision>>) -> Result<(), AgentFault> {
        let program = &mut self.program;
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| program.decide(decision))) {
            Ok(result) => result,
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(AgentFault::Panicked(msg))
            }
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("stats", &self.stats)
            .field("direction", &self.direction)
            .finish()
    }
}
