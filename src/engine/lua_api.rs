use std::cell::RefCell;
use std::rc::Rc;

use mlua::{Function, Lua, LuaSerdeExt, MultiValue, Result as LuaResult, Value};

use super::agent::{Decision, Direction, Rotation};
use super::config::*;

/// Register all Lua constants into the VM.
pub fn register_constants(lua: &Lua) -> LuaResult<()> {
    let g = lua.globals();

    for d in Direction::ALL {
        g.set(d.as_str(), d.code())?;
    }

    g.set("TURN_LEFT", Rotation::Left.code())?;
    g.set("TURN_RIGHT", Rotation::Right.code())?;
    g.set("TURN_BACK", Rotation::Back.code())?;

    g.set("MAX_HEALTH", MAX_HEALTH)?;
    g.set("MAX_POWER", MAX_POWER)?;
    g.set("MAX_CURRENCY", MAX_CURRENCY)?;
    g.set("MAX_RANGE", MAX_RANGE)?;

    Ok(())
}

/// Helper: get the active decision from Lua app_data or return a Lua error.
fn get_decision(lua: &Lua) -> LuaResult<Rc<RefCell<Decision>>> {
    lua.app_data_ref::<Rc<RefCell<Decision>>>()
        .map(|r| Rc::clone(&r))
        .ok_or_else(|| mlua::Error::runtime("arena API is only available inside cycle()"))
}

/// `n` as a 1-based rank; anything below 1 maps to 0, which never matches.
fn rank(n: Option<i64>) -> usize {
    usize::try_from(n.unwrap_or(1)).unwrap_or(0)
}

/// Register a zero-argument getter over the decision.
fn getter<F>(lua: &Lua, name: &str, f: F) -> LuaResult<()>
where
    F: Fn(&Decision) -> Value + 'static,
{
    lua.globals().set(
        name,
        lua.create_function(move |lua, ()| {
            let d = get_decision(lua)?;
            let d = d.borrow();
            Ok(f(&*d))
        })?,
    )
}

/// Register a zero-argument shop action returning whether it applied.
fn trade<F>(lua: &Lua, name: &str, f: F) -> LuaResult<()>
where
    F: Fn(&mut Decision) -> bool + 'static,
{
    lua.globals().set(
        name,
        lua.create_function(move |lua, ()| {
            let d = get_decision(lua)?;
            let mut d = d.borrow_mut();
            Ok(f(&mut *d))
        })?,
    )
}

/// Register all agent-facing API functions into the Lua VM.
pub fn register_functions(lua: &Lua) -> LuaResult<()> {
    let g = lua.globals();

    // position() -> x, y
    g.set(
        "position",
        lua.create_function(|lua, ()| {
            let d = get_decision(lua)?;
            let p = d.borrow().view.position();
            Ok((p.x, p.y))
        })?,
    )?;

    // closest_enemy(n) -> {x, y, health, power, distance} | nil
    g.set(
        "closest_enemy",
        lua.create_function(|lua, n: Option<i64>| {
            let d = get_decision(lua)?;
            let found = d.borrow_mut().view.closest_enemy(rank(n));
            match found {
                Some(e) => lua.to_value(&e),
                None => Ok(Value::Nil),
            }
        })?,
    )?;

    // closest_pickup(n) -> {x, y, distance} | nil
    g.set(
        "closest_pickup",
        lua.create_function(|lua, n: Option<i64>| {
            let d = get_decision(lua)?;
            let found = d.borrow_mut().view.closest_pickup(rank(n));
            match found {
                Some(p) => lua.to_value(&p),
                None => Ok(Value::Nil),
            }
        })?,
    )?;

    // scan(x, y) -> {enemies = {...}, pickups = {...}} | nil, "out of bounds"
    g.set(
        "scan",
        lua.create_function(|lua, (x, y): (i32, i32)| {
            let d = get_decision(lua)?;
            let result = d.borrow().scan(x, y);
            match result {
                Ok(r) => Ok((lua.to_value(&r)?, None)),
                Err(_) => Ok((Value::Nil, Some("out of bounds"))),
            }
        })?,
    )?;

    getter(lua, "get_health", |d| Value::Integer(d.stats.health() as _))?;
    getter(lua, "get_power", |d| Value::Integer(d.stats.power() as _))?;
    getter(lua, "get_currency", |d| Value::Integer(d.stats.currency() as _))?;
    getter(lua, "get_range", |d| Value::Integer(d.stats.range() as _))?;
    getter(lua, "get_direction", |d| Value::Integer(d.direction.code() as _))?;
    getter(lua, "get_cycle", |d| Value::Integer(d.cycle as _))?;

    // get_name() -> string
    g.set(
        "get_name",
        lua.create_function(|lua, ()| {
            let d = get_decision(lua)?;
            let name = d.borrow().name.clone();
            Ok(name)
        })?,
    )?;

    // set_direction(d)
    g.set(
        "set_direction",
        lua.create_function(|lua, code: i32| {
            let direction = Direction::from_code(code)
                .ok_or_else(|| mlua::Error::runtime(format!("invalid direction {code}")))?;
            let d = get_decision(lua)?;
            d.borrow_mut().set_direction(direction);
            Ok(())
        })?,
    )?;

    // turn(t)
    g.set(
        "turn",
        lua.create_function(|lua, code: i32| {
            let rotation = Rotation::from_code(code)
                .ok_or_else(|| mlua::Error::runtime(format!("invalid turn {code}")))?;
            let d = get_decision(lua)?;
            d.borrow_mut().turn(rotation);
            Ok(())
        })?,
    )?;

    // move() queues one step in the facing direction
    g.set(
        "move",
        lua.create_function(|lua, ()| {
            let d = get_decision(lua)?;
            d.borrow_mut().move_forward();
            Ok(())
        })?,
    )?;

    trade(lua, "buy_power", |d| d.shop().buy_power())?;
    trade(lua, "buy_health", |d| d.shop().buy_health())?;
    trade(lua, "buy_range", |d| d.shop().buy_range())?;
    trade(lua, "sell_power", |d| d.shop().sell_power())?;
    trade(lua, "sell_health", |d| d.shop().sell_health())?;
    trade(lua, "sell_range", |d| d.shop().sell_range())?;

    // print(...) -> captured into the decision output
    let tostring: Function = g.get("tostring")?;
    g.set(
        "print",
        lua.create_function(move |lua, args: MultiValue| {
            let mut parts = Vec::with_capacity(args.len());
            for val in args.iter() {
                parts.push(tostring.call::<String>(val.clone())?);
            }
            let d = get_decision(lua)?;
            d.borrow_mut().output.push(parts.join("\t"));
            Ok(())
        })?,
    )?;

    Ok(())
}

/// Set the decision into a Lua VM's app_data for the duration of a cycle call.
pub fn set_decision(lua: &Lua, decision: Rc<RefCell<Decision>>) {
    lua.set_app_data(decision);
}

/// Remove the decision from a Lua VM's app_data after a cycle call.
pub fn clear_decision(lua: &Lua) {
    lua.remove_app_data::<Rc<RefCell<Decision>>>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::agent::AgentStats;
    use crate::engine::grid::{Cell, Grid, Point};
    use crate::engine::query::{GridSnapshot, QueryView};

    fn setup_test_lua() -> (Lua, Rc<RefCell<Decision>>) {
        let lua = Lua::new();
        register_constants(&lua).unwrap();
        register_functions(&lua).unwrap();

        let mut grid = Grid::new(10, 10);
        grid.set(Point::new(2, 2), Cell::Agent(1));
        grid.set(Point::new(2, 5), Cell::Agent(2));
        grid.set(Point::new(3, 2), Cell::Pickup);
        let snapshot = GridSnapshot::capture(&grid, |id| match id {
            1 => Some((10, 1)),
            2 => Some((8, 4)),
            _ => None,
        });

        let decision = Rc::new(RefCell::new(Decision {
            name: "Tester".to_string(),
            cycle: 3,
            view: QueryView::new(Rc::new(snapshot), Point::new(2, 2), 1),
            stats: AgentStats::new(10, 1, 7, 1),
            direction: Direction::Up,
            pending: None,
            rates: ExchangeRates::default(),
            output: Vec::new(),
        }));
        set_decision(&lua, decision.clone());
        (lua, decision)
    }

    #[test]
    fn test_lua_constants() {
        let (lua, _d) = setup_test_lua();
        let up: i32 = lua.globals().get("UP").unwrap();
        let right: i32 = lua.globals().get("RIGHT").unwrap();
        let back: i32 = lua.globals().get("TURN_BACK").unwrap();
        assert_eq!((up, right, back), (0, 3, 2));
    }

    #[test]
    fn test_lua_position_and_getters() {
        let (lua, _d) = setup_test_lua();
        let (x, y): (i32, i32) = lua.load("return position()").eval().unwrap();
        assert_eq!((x, y), (2, 2));
        let name: String = lua.load("return get_name()").eval().unwrap();
        assert_eq!(name, "Tester");
        let vals: (i32, i32, i32, i32, i32) = lua
            .load("return get_health(), get_power(), get_currency(), get_range(), get_cycle()")
            .eval()
            .unwrap();
        assert_eq!(vals, (10, 1, 7, 1, 3));
    }

    #[test]
    fn test_lua_closest_enemy_once() {
        let (lua, _d) = setup_test_lua();
        let (x, y, h, p, dist): (i32, i32, i32, i32, i32) = lua
            .load("local e = closest_enemy(1); return e.x, e.y, e.health, e.power, e.distance")
            .eval()
            .unwrap();
        assert_eq!((x, y, h, p, dist), (2, 5, 8, 4, 3));
        let again: Value = lua.load("return closest_enemy(1)").eval().unwrap();
        assert!(matches!(again, Value::Nil));
    }

    #[test]
    fn test_lua_closest_pickup_default_rank() {
        let (lua, _d) = setup_test_lua();
        let dist: i32 = lua.load("return closest_pickup().distance").eval().unwrap();
        assert_eq!(dist, 1);
    }

    #[test]
    fn test_lua_scan() {
        let (lua, _d) = setup_test_lua();
        let (enemies, pickups): (i32, i32) = lua
            .load("local r = scan(2, 2); return #r.enemies, #r.pickups")
            .eval()
            .unwrap();
        assert_eq!((enemies, pickups), (0, 1));

        let (r, msg): (Value, String) = lua.load("return scan(40, 40)").eval().unwrap();
        assert!(matches!(r, Value::Nil));
        assert_eq!(msg, "out of bounds");
    }

    #[test]
    fn test_lua_controls() {
        let (lua, d) = setup_test_lua();
        lua.load("set_direction(LEFT); turn(TURN_BACK); move()").exec().unwrap();
        let d = d.borrow();
        assert_eq!(d.direction, Direction::Right);
        assert_eq!(d.pending, Some(Direction::Right));
    }

    #[test]
    fn test_lua_invalid_direction() {
        let (lua, _d) = setup_test_lua();
        assert!(lua.load("set_direction(9)").exec().is_err());
    }

    #[test]
    fn test_lua_shop() {
        let (lua, d) = setup_test_lua();
        let (a, b, c, e): (bool, bool, bool, bool) = lua
            .load("return buy_power(), buy_power(), buy_power(), sell_range()")
            .eval()
            .unwrap();
        assert_eq!((a, b, c, e), (true, true, false, false));
        assert_eq!(d.borrow().stats, AgentStats::new(10, 3, 1, 1));
    }

    #[test]
    fn test_lua_print() {
        let (lua, d) = setup_test_lua();
        lua.load(r#"print("hello", "world", 42)"#).exec().unwrap();
        let d = d.borrow();
        assert_eq!(d.output.len(), 1);
        assert_eq!(d.output[0], "hello\tworld\t42");
    }

    #[test]
    fn test_lua_api_outside_decision() {
        let (lua, _d) = setup_test_lua();
        clear_decision(&lua);
        assert!(lua.load("return position()").eval::<(i32, i32)>().is_err());
        assert!(lua.load("move()").exec().is_err());
    }
}
