use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use mlua::{Function, Lua, Table, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::agent::{Agent, AgentFault, AgentProgram, Decision};
use super::lua_api;

/// Globals removed from every agent VM before the submitted chunk runs.
const STRIPPED_GLOBALS: &[&str] = &[
    "os",
    "io",
    "debug",
    "load",
    "loadstring",
    "loadfile",
    "dofile",
    "require",
    "package",
    "module",
    "collectgarbage",
];

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("{name}: compile failed: {cause}")]
    CompileFailed { name: String, cause: String },
    #[error("{name}: instantiation failed: {cause}")]
    InstantiationFailed { name: String, cause: String },
    #[error("{name}: program does not provide a cycle() method")]
    ContractMismatch { name: String },
}

impl LoaderError {
    /// Short label for metrics and API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            LoaderError::CompileFailed { .. } => "compile_failed",
            LoaderError::InstantiationFailed { .. } => "instantiation_failed",
            LoaderError::ContractMismatch { .. } => "contract_mismatch",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoaderConfig {
    /// When set, every load writes its source under a fresh subdirectory.
    pub artifact_dir: Option<PathBuf>,
}

/// Turns submitted Lua source into agents.
#[derive(Debug, Clone, Default)]
pub struct Loader {
    config: LoaderConfig,
}

/// Unique compilation-unit name: sanitised name plus a short content hash.
pub fn unit_name(name: &str, source: &str) -> String {
    let mut clean: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if clean.is_empty() || clean.starts_with(|c: char| c.is_ascii_digit()) {
        clean.insert(0, '_');
    }
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(source.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{clean}Agent_{}", &digest[..8])
}

fn sandboxed_vm() -> mlua::Result<Lua> {
    let lua = Lua::new();
    {
        let g = lua.globals();
        for name in STRIPPED_GLOBALS {
            g.set(*name, Value::Nil)?;
        }
    }
    lua_api::register_constants(&lua)?;
    lua_api::register_functions(&lua)?;
    Ok(lua)
}

impl Loader {
    pub fn new(config: LoaderConfig) -> Self {
        Loader { config }
    }

    /// Load `source` as an agent named `name`.
    pub fn load(&self, name: &str, source: &str) -> Result<Agent, LoaderError> {
        let program = self.instantiate(name, source)?;
        Ok(Agent::new(name, Box::new(program)))
    }

    /// Run the load pipeline up to a ready program instance.
    pub fn instantiate(&self, name: &str, source: &str) -> Result<LuaProgram, LoaderError> {
        let compile_failed = |cause: String| LoaderError::CompileFailed {
            name: name.to_string(),
            cause,
        };
        let instantiation_failed = |cause: String| LoaderError::InstantiationFailed {
            name: name.to_string(),
            cause,
        };

        let unit = unit_name(name, source);
        if let Some(root) = &self.config.artifact_dir {
            let dir = root.join(uuid::Uuid::new_v4().to_string());
            std::fs::create_dir_all(&dir)
                .and_then(|_| std::fs::write(dir.join(format!("{unit}.lua")), source))
                .map_err(|e| compile_failed(format!("cannot write artifact: {e}")))?;
        }

        let lua = sandboxed_vm().map_err(|e| compile_failed(e.to_string()))?;
        let chunk = lua
            .load(source)
            .set_name(&unit)
            .into_function()
            .map_err(|e| compile_failed(e.to_string()))?;

        let returned: Value = chunk.call(()).map_err(|e| instantiation_failed(e.to_string()))?;
        let init: Function = match returned {
            Value::Function(f) => f,
            Value::Table(t) => match t.get::<Value>("new") {
                Ok(Value::Function(f)) => f,
                Ok(_) => return Err(instantiation_failed("returned table has no new()".into())),
                Err(e) => return Err(instantiation_failed(e.to_string())),
            },
            other => {
                return Err(instantiation_failed(format!(
                    "chunk returned {} instead of an initializer",
                    other.type_name()
                )))
            }
        };

        let instance: Value = init.call(()).map_err(|e| instantiation_failed(e.to_string()))?;
        let contract = LoaderError::ContractMismatch {
            name: name.to_string(),
        };
        let Value::Table(instance) = instance else {
            return Err(contract);
        };
        if !matches!(instance.get::<Value>("cycle"), Ok(Value::Function(_))) {
            return Err(contract);
        }
        instance
            .set("name", name)
            .map_err(|e| instantiation_failed(e.to_string()))?;

        tracing::debug!(agent = %name, unit = %unit, "Program loaded");
        Ok(LuaProgram { lua, instance, unit })
    }
}

/// A loaded Lua agent: its own VM plus the instance table returned by the initializer.
pub struct LuaProgram {
    lua: Lua,
    instance: Table,
    unit: String,
}

impl LuaProgram {
    pub fn instance(&self) -> &Table {
        &self.instance
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }
}

impl AgentProgram for LuaProgram {
    fn decide(&mut self, decision: &Rc<RefCell<Decision>>) -> Result<(), AgentFault> {
        lua_api::set_decision(&self.lua, decision.clone());
        let result = (|| -> mlua::Result<()> {
            let cycle: Function = self.instance.get("cycle")?;
            cycle.call::<()>(self.instance.clone())
        })();
        lua_api::clear_decision(&self.lua);
        result.map_err(AgentFault::from)
    }
}
