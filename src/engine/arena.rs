use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use thiserror::Error;

use super::agent::{Agent, AgentFault, Decision, Direction};
use super::config::*;
use super::grid::{AgentId, Cell, Grid, Point};
use super::query::{GridSnapshot, QueryView};

/// Pixel size of the presentation surface the arena is laid out for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DisplaySize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArenaError {
    #[error("display {width}x{height} cannot hold an arena")]
    InvalidDisplay { width: u32, height: u32 },
    #[error("{agents} agents do not fit into {cells} cells")]
    TooManyAgents { agents: usize, cells: usize },
}

/// Final standings, winner first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ranking {
    pub standings: Vec<String>,
}

impl Ranking {
    pub fn winner(&self) -> Option<&str> {
        self.standings.first().map(String::as_str)
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct AgentSnapshot {
    pub name: String,
    pub x: i32,
    pub y: i32,
    pub health: i32,
    pub power: i32,
    pub currency: i32,
    pub range: i32,
    pub direction: Direction,
    pub moving: bool,
    pub damaged: bool,
}

/// State of the arena for presentation consumers.
#[derive(Clone, Debug, Serialize)]
pub struct ArenaSnapshot {
    pub cycle: u64,
    pub rows: usize,
    pub cols: usize,
    pub cell_size: u32,
    pub agents: Vec<AgentSnapshot>,
    pub pickups: Vec<Point>,
}

/// Grid dimensions `(rows, cols, cell_size)` for `agents` competitors on `display`.
pub fn layout(
    agents: usize,
    display: DisplaySize,
    config: &ArenaConfig,
) -> Result<(usize, usize, u32), ArenaError> {
    let invalid = ArenaError::InvalidDisplay {
        width: display.width,
        height: display.height,
    };
    if display.width == 0 || display.height == 0 {
        return Err(invalid);
    }
    let area = (agents * config.cells_per_agent) as f64;
    let ideal = (area * display.height as f64 / display.width as f64).sqrt().floor() as usize;
    let rows = ideal.clamp(config.min_rows, config.max_rows.max(config.min_rows));
    if rows == 0 {
        return Err(invalid);
    }
    let cell_size = display.height / rows as u32;
    if cell_size == 0 {
        return Err(invalid);
    }
    let cols = (display.width / cell_size) as usize;
    if cols == 0 {
        return Err(invalid);
    }
    Ok((rows, cols, cell_size))
}

/// The simulation: grid, agents, and the update-cycle protocol.
pub struct Arena {
    pub config: ArenaConfig,
    pub grid: Grid,
    pub cell_size: u32,
    pub cycle: u64,
    agents: HashMap<AgentId, Agent>,
    next_agent_id: AgentId,
    eliminated: Vec<String>,
    ranking: Option<Ranking>,
    rng: StdRng,
}

impl Arena {
    /// Lay out the grid for `agents` and place each on a random empty cell.
    pub fn new(agents: Vec<Agent>, display: DisplaySize, config: ArenaConfig) -> Result<Self, ArenaError> {
        let (rows, cols, cell_size) = layout(agents.len(), display, &config)?;
        let mut arena = Arena::empty(rows, cols, cell_size, config)?;
        if agents.len() > arena.grid.len() {
            return Err(ArenaError::TooManyAgents {
                agents: agents.len(),
                cells: arena.grid.len(),
            });
        }
        for agent in agents {
            let p = arena
                .grid
                .random_empty_point(&mut arena.rng)
                .ok_or(ArenaError::TooManyAgents {
                    agents: arena.agents.len() + 1,
                    cells: arena.grid.len(),
                })?;
            arena.place_agent(agent, p);
        }
        Ok(arena)
    }

    /// An arena of fixed dimensions with no agents. Used to stage scenarios.
    pub fn empty(rows: usize, cols: usize, cell_size: u32, config: ArenaConfig) -> Result<Self, ArenaError> {
        if rows == 0 || cols == 0 {
            return Err(ArenaError::InvalidDisplay {
                width: cols as u32 * cell_size,
                height: rows as u32 * cell_size,
            });
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Arena {
            config,
            grid: Grid::new(rows, cols),
            cell_size,
            cycle: 1,
            agents: HashMap::new(),
            next_agent_id: 1,
            eliminated: Vec::new(),
            ranking: None,
            rng,
        })
    }

    /// Put `agent` on `p`, replacing whatever the cell held.
    pub fn place_agent(&mut self, agent: Agent, p: Point) -> AgentId {
        let id = self.next_agent_id;
        self.next_agent_id += 1;
        if let Some(Cell::Agent(old)) = self.grid.get(p) {
            self.agents.remove(&old);
        }
        self.grid.set(p, Cell::Agent(id));
        self.agents.insert(id, agent);
        id
    }

    pub fn place_pickup(&mut self, p: Point) -> bool {
        self.grid.is_empty_at(p) && self.grid.set(p, Cell::Pickup)
    }

    pub fn agent(&self, name: &str) -> Option<&Agent> {
        self.agents.values().find(|a| a.name == name)
    }

    pub fn agent_mut(&mut self, name: &str) -> Option<&mut Agent> {
        self.agents.values_mut().find(|a| a.name == name)
    }

    pub fn position_of(&self, name: &str) -> Option<Point> {
        let (id, _) = self.agents.iter().find(|(_, a)| a.name == name)?;
        self.grid.locate(*id)
    }

    /// Agents still on the grid, including ones zeroed by combat this cycle.
    pub fn live_count(&self) -> usize {
        self.agents.len()
    }

    pub fn eliminated(&self) -> &[String] {
        &self.eliminated
    }

    pub fn ranking(&self) -> Option<&Ranking> {
        self.ranking.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.ranking.is_some()
    }

    /// Run one update cycle. Returns the ranking once the match has ended.
    pub fn run_cycle(&mut self) -> Option<Ranking> {
        if let Some(r) = &self.ranking {
            return Some(r.clone());
        }
        let started = Instant::now();

        for agent in self.agents.values_mut() {
            agent.moving = false;
            agent.damaged = false;
        }

        self.spawn_pickups();

        let attrition = self.config.cycles_per_attrition > 0
            && self.cycle % self.config.cycles_per_attrition == 0;

        let mut processed: HashSet<AgentId> = HashSet::new();
        for idx in 0..self.grid.len() {
            let p = Point::new((idx % self.grid.cols) as i32, (idx / self.grid.cols) as i32);
            if let Some(Cell::Agent(id)) = self.grid.get(p) {
                if processed.insert(id) {
                    self.resolve_agent(id, p, attrition);
                }
            }
        }

        crate::metrics::CYCLES_TOTAL.inc();
        crate::metrics::CYCLE_DURATION_MS.observe(started.elapsed().as_secs_f64() * 1000.0);

        if self.agents.len() <= 1 {
            let remaining: Vec<AgentId> = self
                .grid
                .iter()
                .filter_map(|(_, c)| match c {
                    Cell::Agent(id) => Some(id),
                    _ => None,
                })
                .collect();
            for id in remaining {
                if let Some(agent) = self.agents.get(&id) {
                    self.eliminated.push(agent.name.clone());
                }
            }
            let standings: Vec<String> = self.eliminated.iter().rev().cloned().collect();
            tracing::info!(cycle = self.cycle, winner = ?standings.first(), "Match finished");
            let ranking = Ranking { standings };
            self.ranking = Some(ranking.clone());
            return Some(ranking);
        }

        self.cycle += 1;
        None
    }

    /// Scatter new pickups: about one per live agent, never fewer than the minimum.
    fn spawn_pickups(&mut self) {
        let count = self.pickup_count();
        for _ in 0..count {
            let p = self.grid.random_point(&mut self.rng);
            if self.grid.is_empty_at(p) {
                self.grid.set(p, Cell::Pickup);
            }
        }
    }

    /// Live agents plus a jitter drawn from `[-variance, variance)`, floored at the minimum.
    fn pickup_count(&mut self) -> i32 {
        let variance = self.config.pickup_variance.max(0);
        let jitter = if variance == 0 {
            0
        } else {
            self.rng.gen_range(-variance..variance)
        };
        (self.agents.len() as i32 + jitter).max(self.config.min_pickups)
    }

    fn resolve_agent(&mut self, id: AgentId, pos: Point, attrition: bool) {
        {
            let Some(agent) = self.agents.get_mut(&id) else {
                return;
            };
            if attrition {
                let h = agent.stats.health();
                agent.stats.set_health(h - 1);
            }
            if agent.stats.is_spent() {
                tracing::info!(agent = %agent.name, cycle = self.cycle, "Agent eliminated");
                crate::metrics::ELIMINATIONS_TOTAL.inc();
                self.eliminated.push(agent.name.clone());
                self.agents.remove(&id);
                self.grid.set(pos, Cell::Empty);
                return;
            }
        }

        let agents = &self.agents;
        let snapshot = Rc::new(GridSnapshot::capture(&self.grid, |aid| {
            agents.get(&aid).map(|a| (a.stats.health(), a.stats.power()))
        }));

        let Some(agent) = self.agents.get_mut(&id) else {
            return;
        };
        let decision = Rc::new(RefCell::new(Decision {
            name: agent.name.clone(),
            cycle: self.cycle,
            view: QueryView::new(snapshot, pos, id),
            stats: agent.stats,
            direction: agent.direction,
            pending: None,
            rates: self.config.rates,
            output: Vec::new(),
        }));

        let result = agent.decide(&decision);
        let d = decision.borrow();
        for line in &d.output {
            tracing::debug!(agent = %agent.name, "{line}");
        }
        let step = match result {
            Ok(()) => {
                agent.stats = d.stats;
                agent.direction = d.direction;
                d.pending
            }
            Err(fault) => {
                let kind = match fault {
                    AgentFault::Script(_) => "script",
                    AgentFault::Panicked(_) => "panic",
                };
                crate::metrics::AGENT_FAULTS_TOTAL.with_label_values(&[kind]).inc();
                tracing::warn!(agent = %agent.name, cycle = self.cycle, "Decision discarded: {fault}");
                None
            }
        };
        drop(d);

        if let Some(direction) = step {
            self.move_agent(id, pos, direction);
        }
    }

    /// Apply one queued step from `from`.
    fn move_agent(&mut self, id: AgentId, from: Point, direction: Direction) {
        let (dx, dy) = direction.delta();
        let to = from.offset(dx, dy);
        match self.grid.get(to) {
            None => {}
            Some(Cell::Empty) => self.relocate(id, from, to),
            Some(Cell::Pickup) => {
                if let Some(agent) = self.agents.get_mut(&id) {
                    let c = agent.stats.currency();
                    agent.stats.set_currency(c + 1);
                }
                self.relocate(id, from, to);
            }
            Some(Cell::Agent(other)) if other == id => {}
            Some(Cell::Agent(other)) => self.fight(id, other),
        }
    }

    fn relocate(&mut self, id: AgentId, from: Point, to: Point) {
        self.grid.set(from, Cell::Empty);
        self.grid.set(to, Cell::Agent(id));
        if let Some(agent) = self.agents.get_mut(&id) {
            agent.moving = true;
        }
    }

    /// Both sides lose the other's power at the same time.
    fn fight(&mut self, a: AgentId, b: AgentId) {
        let (Some(pa), Some(pb)) = (
            self.agents.get(&a).map(|x| x.stats.power()),
            self.agents.get(&b).map(|x| x.stats.power()),
        ) else {
            return;
        };
        for (id, damage) in [(a, pb), (b, pa)] {
            if let Some(agent) = self.agents.get_mut(&id) {
                let h = agent.stats.health();
                agent.stats.set_health(h - damage);
                agent.damaged = true;
            }
        }
    }

    pub fn snapshot(&self) -> ArenaSnapshot {
        let mut agents = Vec::with_capacity(self.agents.len());
        let mut pickups = Vec::new();
        for (p, cell) in self.grid.iter() {
            match cell {
                Cell::Pickup => pickups.push(p),
                Cell::Agent(id) => {
                    if let Some(a) = self.agents.get(&id) {
                        agents.push(AgentSnapshot {
                            name: a.name.clone(),
                            x: p.x,
                            y: p.y,
                            health: a.stats.health(),
                            power: a.stats.power(),
                            currency: a.stats.currency(),
                            range: a.stats.range(),
                            direction: a.direction,
                            moving: a.moving,
                            damaged: a.damaged,
                        });
                    }
                }
                Cell::Empty => {}
            }
        }
        ArenaSnapshot {
            cycle: self.cycle,
            rows: self.grid.rows,
            cols: self.grid.cols,
            cell_size: self.cell_size,
            agents,
            pickups,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::agent::AgentStats;

    fn idle(name: &str) -> Agent {
        Agent::from_fn(name, |_d: &mut Decision| Ok(()))
    }

    fn seeded_config() -> ArenaConfig {
        ArenaConfig {
            min_pickups: 0,
            pickup_variance: 0,
            seed: Some(7),
            ..ArenaConfig::default()
        }
    }

    #[test]
    fn test_layout_defaults() {
        let display = DisplaySize { width: 1920, height: 1080 };
        // sqrt(4 * 100 * 1080 / 1920) = 15 -> clamped to 25
        let (rows, cols, cell) = layout(4, display, &ArenaConfig::default()).unwrap();
        assert_eq!((rows, cell, cols), (25, 43, 44));

        // sqrt(40 * 100 * 0.5625) = 47.4 -> clamped to 40
        let (rows, cols, cell) = layout(40, display, &ArenaConfig::default()).unwrap();
        assert_eq!((rows, cell, cols), (40, 27, 71));
    }

    #[test]
    fn test_layout_invalid_display() {
        let cfg = ArenaConfig::default();
        assert!(matches!(
            layout(2, DisplaySize { width: 0, height: 1080 }, &cfg),
            Err(ArenaError::InvalidDisplay { .. })
        ));
        assert!(matches!(
            layout(2, DisplaySize { width: 800, height: 10 }, &cfg),
            Err(ArenaError::InvalidDisplay { .. })
        ));
    }

    #[test]
    fn test_too_many_agents() {
        let cfg = ArenaConfig {
            min_rows: 1,
            max_rows: 1,
            cells_per_agent: 1,
            ..ArenaConfig::default()
        };
        let agents = vec![idle("a"), idle("b"), idle("c")];
        let r = Arena::new(agents, DisplaySize { width: 20, height: 10 }, cfg);
        assert!(matches!(r, Err(ArenaError::TooManyAgents { agents: 3, cells: 2 })));
    }

    #[test]
    fn test_new_places_every_agent() {
        let agents = vec![idle("a"), idle("b"), idle("c")];
        let arena = Arena::new(
            agents,
            DisplaySize { width: 1920, height: 1080 },
            seeded_config(),
        )
        .unwrap();
        assert_eq!(arena.live_count(), 3);
        for name in ["a", "b", "c"] {
            assert!(arena.position_of(name).is_some());
        }
        assert_eq!(arena.cycle, 1);
    }

    #[test]
    fn test_pickup_collection() {
        let mut arena = Arena::empty(5, 5, 10, seeded_config()).unwrap();
        arena.place_agent(
            Agent::from_fn("mover", |d: &mut Decision| {
                d.set_direction(Direction::Right);
                d.move_forward();
                Ok(())
            }),
            Point::new(1, 1),
        );
        arena.place_agent(idle("other"), Point::new(4, 4));
        arena.place_pickup(Point::new(2, 1));

        assert_eq!(arena.run_cycle(), None);
        assert_eq!(arena.position_of("mover"), Some(Point::new(2, 1)));
        assert_eq!(arena.agent("mover").unwrap().stats.currency(), 1);
        assert!(matches!(arena.grid.get(Point::new(2, 1)), Some(Cell::Agent(_))));
        assert_eq!(arena.grid.get(Point::new(1, 1)), Some(Cell::Empty));
        assert!(arena.agent("mover").unwrap().moving);
    }

    #[test]
    fn test_out_of_bounds_step_discarded() {
        let mut arena = Arena::empty(3, 3, 10, seeded_config()).unwrap();
        arena.place_agent(
            Agent::from_fn("edge", |d: &mut Decision| {
                d.move_forward();
                Ok(())
            }),
            Point::new(0, 0),
        );
        arena.place_agent(idle("other"), Point::new(2, 2));
        arena.run_cycle();
        assert_eq!(arena.position_of("edge"), Some(Point::new(0, 0)));
    }

    #[test]
    fn test_combat_simultaneous() {
        let mut arena = Arena::empty(5, 5, 10, seeded_config()).unwrap();
        arena.place_agent(
            Agent::from_fn("a", |d: &mut Decision| {
                d.set_direction(Direction::Down);
                d.move_forward();
                Ok(())
            }),
            Point::new(2, 1),
        );
        arena.place_agent(idle("b"), Point::new(2, 2));
        arena.agent_mut("a").unwrap().stats = AgentStats::new(10, 3, 0, 1);
        arena.agent_mut("b").unwrap().stats = AgentStats::new(4, 5, 0, 1);

        arena.run_cycle();
        assert_eq!(arena.agent("a").unwrap().stats.health(), 5);
        assert_eq!(arena.agent("b").unwrap().stats.health(), 1);
        assert_eq!(arena.position_of("a"), Some(Point::new(2, 1)));
        assert_eq!(arena.position_of("b"), Some(Point::new(2, 2)));
        assert!(arena.agent("a").unwrap().damaged);
        assert!(arena.agent("b").unwrap().damaged);
    }

    #[test]
    fn test_combat_zeroed_agent_removed_next_cycle() {
        let mut arena = Arena::empty(5, 5, 10, seeded_config()).unwrap();
        arena.place_agent(
            Agent::from_fn("hunter", |d: &mut Decision| {
                d.set_direction(Direction::Left);
                d.move_forward();
                Ok(())
            }),
            Point::new(2, 0),
        );
        // prey is scanned before the hunter, so its next resolution is next cycle
        arena.place_agent(idle("prey"), Point::new(1, 0));
        arena.agent_mut("hunter").unwrap().stats = AgentStats::new(10, 20, 0, 1);

        assert_eq!(arena.run_cycle(), None);
        assert_eq!(arena.agent("prey").unwrap().stats.health(), 0);
        assert_eq!(arena.live_count(), 2);

        let ranking = arena.run_cycle().unwrap();
        assert_eq!(ranking.standings, vec!["hunter".to_string(), "prey".to_string()]);
        assert_eq!(ranking.winner(), Some("hunter"));
        assert!(arena.is_finished());
    }

    #[test]
    fn test_attrition_every_kth_cycle() {
        let mut arena = Arena::empty(5, 5, 10, seeded_config()).unwrap();
        arena.place_agent(idle("a"), Point::new(0, 0));
        arena.place_agent(idle("b"), Point::new(4, 4));
        for _ in 0..9 {
            assert_eq!(arena.run_cycle(), None);
        }
        assert_eq!(arena.agent("a").unwrap().stats.health(), DEFAULT_HEALTH);
        arena.run_cycle();
        assert_eq!(arena.agent("a").unwrap().stats.health(), DEFAULT_HEALTH - 1);
        assert_eq!(arena.cycle, 11);
    }

    #[test]
    fn test_agent_moving_ahead_resolved_once() {
        let calls = Rc::new(RefCell::new(0));
        let counter = calls.clone();
        let mut arena = Arena::empty(5, 5, 10, seeded_config()).unwrap();
        arena.place_agent(
            Agent::from_fn("runner", move |d: &mut Decision| {
                *counter.borrow_mut() += 1;
                d.set_direction(Direction::Down);
                d.move_forward();
                Ok(())
            }),
            Point::new(0, 0),
        );
        arena.place_agent(idle("other"), Point::new(4, 4));
        arena.run_cycle();
        assert_eq!(*calls.borrow(), 1);
        assert_eq!(arena.position_of("runner"), Some(Point::new(0, 1)));
    }

    #[test]
    fn test_pickup_spawn_minimum() {
        let cfg = ArenaConfig {
            min_pickups: 4,
            pickup_variance: 0,
            seed: Some(3),
            ..ArenaConfig::default()
        };
        let mut arena = Arena::empty(30, 30, 10, cfg).unwrap();
        arena.place_agent(idle("a"), Point::new(0, 0));
        arena.place_agent(idle("b"), Point::new(29, 29));
        arena.run_cycle();
        let pickups = arena.grid.count_pickups();
        assert!(pickups >= 1 && pickups <= 4, "got {pickups}");
    }

    #[test]
    fn test_pickup_jitter_is_half_open() {
        let cfg = ArenaConfig {
            min_pickups: 0,
            pickup_variance: 3,
            seed: Some(21),
            ..ArenaConfig::default()
        };
        let mut arena = Arena::empty(10, 10, 10, cfg).unwrap();
        for i in 0..5 {
            arena.place_agent(idle(&format!("a{i}")), Point::new(i, 0));
        }
        let counts: Vec<i32> = (0..300).map(|_| arena.pickup_count()).collect();
        // 5 agents with jitter in [-3, 3): the upper bound 8 is never drawn
        assert!(counts.iter().all(|c| (2..=7).contains(c)), "{counts:?}");
        assert!(counts.contains(&2));
        assert!(counts.contains(&7));
    }

    #[test]
    fn test_pickup_count_without_variance() {
        let mut arena = Arena::empty(5, 5, 10, seeded_config()).unwrap();
        arena.place_agent(idle("a"), Point::new(0, 0));
        arena.place_agent(idle("b"), Point::new(4, 4));
        assert_eq!(arena.pickup_count(), 2);
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut arena = Arena::empty(4, 4, 10, seeded_config()).unwrap();
        arena.place_agent(idle("a"), Point::new(1, 2));
        arena.place_pickup(Point::new(3, 3));
        let snap = arena.snapshot();
        assert_eq!(snap.agents.len(), 1);
        assert_eq!(snap.pickups, vec![Point::new(3, 3)]);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["agents"][0]["direction"], "UP");
        assert_eq!(json["agents"][0]["x"], 1);
        assert_eq!(json["cycle"], 1);
    }
}
