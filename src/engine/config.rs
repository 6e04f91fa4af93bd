// Agent attribute limits and defaults
pub const DEFAULT_HEALTH: i32 = 10;
pub const DEFAULT_POWER: i32 = 1;
pub const DEFAULT_CURRENCY: i32 = 0;
pub const DEFAULT_RANGE: i32 = 1;

pub const MIN_HEALTH: i32 = 0;
pub const MIN_POWER: i32 = 1;
pub const MIN_CURRENCY: i32 = 0;
pub const MIN_RANGE: i32 = 1;

pub const MAX_HEALTH: i32 = 100;
pub const MAX_POWER: i32 = 50;
pub const MAX_CURRENCY: i32 = 9999;
pub const MAX_RANGE: i32 = 10;

// Scheduler timing
pub const MS_PER_TICK: u64 = 100;
pub const TICKS_PER_UPDATE: u64 = 8;

// Cycle rules
pub const CYCLES_PER_ATTRITION: u64 = 10;
pub const PICKUP_VARIANCE: i32 = 3;
pub const MIN_PICKUPS: i32 = 4;

// Grid sizing
pub const CELLS_PER_AGENT: usize = 100;
pub const MIN_ROWS: usize = 25;
pub const MAX_ROWS: usize = 40;

// Shop exchange rates (currency per attribute point)
pub const CURRENCY_PER_POWER: i32 = 3;
pub const CURRENCY_PER_HEALTH: i32 = 2;
pub const CURRENCY_PER_RANGE: i32 = 4;

/// Currency cost (and refund) of one point of each purchasable attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeRates {
    pub power: i32,
    pub health: i32,
    pub range: i32,
}

impl Default for ExchangeRates {
    fn default() -> Self {
        ExchangeRates {
            power: CURRENCY_PER_POWER,
            health: CURRENCY_PER_HEALTH,
            range: CURRENCY_PER_RANGE,
        }
    }
}

/// Static parameters of one arena, supplied at construction.
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    pub cells_per_agent: usize,
    pub min_rows: usize,
    pub max_rows: usize,
    pub cycles_per_attrition: u64,
    pub pickup_variance: i32,
    pub min_pickups: i32,
    pub rates: ExchangeRates,
    /// Seed for the arena RNG. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        ArenaConfig {
            cells_per_agent: CELLS_PER_AGENT,
            min_rows: MIN_ROWS,
            max_rows: MAX_ROWS,
            cycles_per_attrition: CYCLES_PER_ATTRITION,
            pickup_variance: PICKUP_VARIANCE,
            min_pickups: MIN_PICKUPS,
            rates: ExchangeRates::default(),
            seed: None,
        }
    }
}

/// Timing of the match scheduler: animation ticks and update cycles.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub ms_per_tick: u64,
    pub ticks_per_update: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            ms_per_tick: MS_PER_TICK,
            ticks_per_update: TICKS_PER_UPDATE,
        }
    }
}
