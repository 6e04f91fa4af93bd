//! Per-decision read access to the arena.
//!
//! A `QueryView` wraps an immutable snapshot of the grid taken just before an
//! agent decides. The two "closest" queries are one-shot per view: the first
//! call consumes the shot whatever it returns.

use std::rc::Rc;

use serde::Serialize;
use thiserror::Error;

use super::config::MIN_HEALTH;
use super::grid::{AgentId, Cell, Grid, Point};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellView {
    Empty,
    Pickup,
    Agent { id: AgentId, health: i32, power: i32 },
}

/// Frozen copy of the grid with agent vitals inlined.
#[derive(Debug, Clone)]
pub struct GridSnapshot {
    pub rows: usize,
    pub cols: usize,
    cells: Vec<CellView>,
}

impl GridSnapshot {
    /// Copy `grid`, looking up `(health, power)` for each agent cell.
    pub fn capture<F>(grid: &Grid, vitals: F) -> Self
    where
        F: Fn(AgentId) -> Option<(i32, i32)>,
    {
        let cells = grid
            .iter()
            .map(|(_, cell)| match cell {
                Cell::Empty => CellView::Empty,
                Cell::Pickup => CellView::Pickup,
                Cell::Agent(id) => match vitals(id) {
                    Some((health, power)) => CellView::Agent { id, health, power },
                    None => CellView::Empty,
                },
            })
            .collect();
        GridSnapshot {
            rows: grid.rows,
            cols: grid.cols,
            cells,
        }
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= 0 && p.y >= 0 && (p.x as usize) < self.cols && (p.y as usize) < self.rows
    }

    pub fn get(&self, p: Point) -> Option<CellView> {
        if self.contains(p) {
            Some(self.cells[p.y as usize * self.cols + p.x as usize])
        } else {
            None
        }
    }

    fn iter(&self) -> impl Iterator<Item = (Point, CellView)> + '_ {
        let cols = self.cols;
        self.cells
            .iter()
            .enumerate()
            .map(move |(i, c)| (Point::new((i % cols) as i32, (i / cols) as i32), *c))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnemyInfo {
    pub x: i32,
    pub y: i32,
    pub health: i32,
    pub power: i32,
    pub distance: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PickupInfo {
    pub x: i32,
    pub y: i32,
    pub distance: i32,
}

/// Result of an area scan. Entries are in row-major order; `distance` is
/// measured from the scanning agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    pub enemies: Vec<EnemyInfo>,
    pub pickups: Vec<PickupInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("scan centre ({x}, {y}) is outside the arena")]
    OutOfBounds { x: i32, y: i32 },
}

pub struct QueryView {
    snapshot: Rc<GridSnapshot>,
    origin: Point,
    self_id: AgentId,
    enemy_query_used: bool,
    pickup_query_used: bool,
}

impl QueryView {
    pub fn new(snapshot: Rc<GridSnapshot>, origin: Point, self_id: AgentId) -> Self {
        QueryView {
            snapshot,
            origin,
            self_id,
            enemy_query_used: false,
            pickup_query_used: false,
        }
    }

    /// The agent's own cell. Unlimited.
    pub fn position(&self) -> Point {
        self.origin
    }

    pub fn rows(&self) -> usize {
        self.snapshot.rows
    }

    pub fn cols(&self) -> usize {
        self.snapshot.cols
    }

    fn enemy_at(&self, p: Point, cell: CellView) -> Option<EnemyInfo> {
        match cell {
            CellView::Agent { id, health, power } if id != self.self_id && health > MIN_HEALTH => {
                Some(EnemyInfo {
                    x: p.x,
                    y: p.y,
                    health,
                    power,
                    distance: self.origin.manhattan(p),
                })
            }
            _ => None,
        }
    }

    fn pickup_at(&self, p: Point, cell: CellView) -> Option<PickupInfo> {
        match cell {
            CellView::Pickup => Some(PickupInfo {
                x: p.x,
                y: p.y,
                distance: self.origin.manhattan(p),
            }),
            _ => None,
        }
    }

    /// The `n`th closest surviving opponent (1-based). One shot per view.
    pub fn closest_enemy(&mut self, n: usize) -> Option<EnemyInfo> {
        if std::mem::replace(&mut self.enemy_query_used, true) || n == 0 {
            return None;
        }
        // row-major iteration plus a stable sort gives the row, column tie-break
        let mut found: Vec<EnemyInfo> = self
            .snapshot
            .iter()
            .filter_map(|(p, c)| self.enemy_at(p, c))
            .collect();
        found.sort_by_key(|e| e.distance);
        found.get(n - 1).copied()
    }

    /// The `n`th closest pickup (1-based). One shot per view.
    pub fn closest_pickup(&mut self, n: usize) -> Option<PickupInfo> {
        if std::mem::replace(&mut self.pickup_query_used, true) || n == 0 {
            return None;
        }
        let mut found: Vec<PickupInfo> = self
            .snapshot
            .iter()
            .filter_map(|(p, c)| self.pickup_at(p, c))
            .collect();
        found.sort_by_key(|e| e.distance);
        found.get(n - 1).copied()
    }

    /// Opponents and pickups within Manhattan `radius` of `centre` (inclusive).
    pub fn scan(&self, centre: Point, radius: i32) -> Result<ScanResult, QueryError> {
        if !self.snapshot.contains(centre) {
            return Err(QueryError::OutOfBounds {
                x: centre.x,
                y: centre.y,
            });
        }
        let mut result = ScanResult::default();
        for y in (centre.y - radius)..=(centre.y + radius) {
            for x in (centre.x - radius)..=(centre.x + radius) {
                let p = Point::new(x, y);
                if centre.manhattan(p) > radius {
                    continue;
                }
                let Some(cell) = self.snapshot.get(p) else {
                    continue;
                };
                if let Some(e) = self.enemy_at(p, cell) {
                    result.enemies.push(e);
                } else if let Some(pk) = self.pickup_at(p, cell) {
                    result.pickups.push(pk);
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view_with(agents: &[(AgentId, Point, i32, i32)], pickups: &[Point], me: AgentId) -> QueryView {
        let mut grid = Grid::new(10, 10);
        for (id, p, _, _) in agents {
            grid.set(*p, Cell::Agent(*id));
        }
        for p in pickups {
            grid.set(*p, Cell::Pickup);
        }
        let snapshot = GridSnapshot::capture(&grid, |id| {
            agents
                .iter()
                .find(|(aid, _, _, _)| *aid == id)
                .map(|(_, _, h, pw)| (*h, *pw))
        });
        let origin = agents
            .iter()
            .find(|(id, _, _, _)| *id == me)
            .map(|(_, p, _, _)| *p)
            .unwrap();
        QueryView::new(Rc::new(snapshot), origin, me)
    }

    #[test]
    fn test_closest_enemy_one_shot() {
        let mut view = view_with(
            &[(1, Point::new(2, 2), 10, 1), (2, Point::new(2, 5), 7, 4)],
            &[],
            1,
        );
        assert_eq!(view.position(), Point::new(2, 2));
        let e = view.closest_enemy(1).unwrap();
        assert_eq!((e.x, e.y, e.health, e.power, e.distance), (2, 5, 7, 4, 3));
        assert_eq!(view.closest_enemy(1), None);
    }

    #[test]
    fn test_out_of_range_n_consumes_shot() {
        let mut view = view_with(
            &[(1, Point::new(0, 0), 10, 1), (2, Point::new(3, 3), 10, 1)],
            &[],
            1,
        );
        assert_eq!(view.closest_enemy(2), None);
        assert_eq!(view.closest_enemy(1), None);

        let mut view = view_with(&[(1, Point::new(0, 0), 10, 1)], &[Point::new(1, 1)], 1);
        assert_eq!(view.closest_pickup(0), None);
        assert_eq!(view.closest_pickup(1), None);
    }

    #[test]
    fn test_enemy_excludes_spent_agents() {
        let mut view = view_with(
            &[
                (1, Point::new(0, 0), 10, 1),
                (2, Point::new(1, 0), 0, 1),
                (3, Point::new(5, 5), 3, 1),
            ],
            &[],
            1,
        );
        let e = view.closest_enemy(1).unwrap();
        assert_eq!((e.x, e.y), (5, 5));
    }

    #[test]
    fn test_tie_break_row_then_column() {
        // All three at distance 2 from (4, 4).
        let mut view = view_with(
            &[(1, Point::new(4, 4), 10, 1)],
            &[Point::new(6, 4), Point::new(4, 2), Point::new(2, 4)],
            1,
        );
        assert_eq!(view.closest_pickup(1).map(|p| (p.x, p.y)), Some((4, 2)));

        let mut view = view_with(
            &[(1, Point::new(4, 4), 10, 1)],
            &[Point::new(6, 4), Point::new(4, 2), Point::new(2, 4)],
            1,
        );
        assert_eq!(view.closest_pickup(3).map(|p| (p.x, p.y)), Some((6, 4)));
    }

    #[test]
    fn test_scan_radius_inclusive() {
        let view = view_with(
            &[(1, Point::new(5, 5), 10, 1), (2, Point::new(5, 7), 10, 1)],
            &[Point::new(6, 6), Point::new(8, 5)],
            1,
        );
        let r = view.scan(Point::new(5, 5), 2).unwrap();
        assert_eq!(r.enemies.len(), 1);
        assert_eq!(r.pickups.len(), 1);
        assert_eq!((r.pickups[0].x, r.pickups[0].y), (6, 6));

        let r = view.scan(Point::new(8, 5), 1).unwrap();
        assert!(r.enemies.is_empty());
        assert_eq!(r.pickups[0].distance, 3);
    }

    #[test]
    fn test_scan_out_of_bounds() {
        let view = view_with(&[(1, Point::new(0, 0), 10, 1)], &[], 1);
        assert_eq!(
            view.scan(Point::new(10, 0), 1),
            Err(QueryError::OutOfBounds { x: 10, y: 0 })
        );
        // Edge centres are fine; off-grid cells are skipped.
        assert!(view.scan(Point::new(0, 0), 3).is_ok());
    }
}
