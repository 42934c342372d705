//! Lua compiler for livegrid cell functions.
//!
//! A function body is compiled once as a Lua 5.4 chunk. Host access is not
//! installed as globals: each invocation passes fresh closures over its own
//! `ExecutionContext` as chunk arguments, bound to locals by a one-line
//! prefix. A function that indirectly runs another function (a populate
//! that `set`s a cell watched by a trigger) therefore never sees the other
//! call's context.
//!
//! Inside a chunk:
//!
//! | name               | meaning                                         |
//! |--------------------|-------------------------------------------------|
//! | `cell(ref)`        | value of one cell, `nil` when empty             |
//! | `range(ref)`       | values of a block, row-major, with field `n`    |
//! | `collection(name)` | items of a named collection                     |
//! | `own_collection()` | items of the collection the cell's text names   |
//! | `item()`           | item being ranked (rank functions)              |
//! | `set(ref, text)`   | write text into a cell                          |
//! | `this`             | `sheet`, `row`, `col`, `index`, `text`          |
//! | `edit`             | `property`, `old`, `new` (trigger functions)    |
//!
//! Rows, columns and indexes are 1-based on the Lua side.

use std::rc::Rc;

use livegrid_engine::compiler::{CompiledFunction, Diagnostic, Diagnostics, SourceCompiler};
use livegrid_engine::context::ExecutionContext;
use livegrid_engine::function::FunctionKind;
use livegrid_engine::Value;
use mlua::Lua;

/// Binds the per-call arguments. Kept on the first line so that Lua's line
/// numbers match the user's source.
const CHUNK_PREFIX: &str = "local cell, range, collection, own_collection, item, set, this, edit = ...; ";

/// Globals removed from the shared state.
const UNSAFE_GLOBALS: &[&str] = &[
    "os", "io", "debug", "package", "require", "loadfile", "dofile", "load",
];

/// Longest error message kept for a cell's error field.
const MAX_ERROR_LEN: usize = 160;

/// Most empty items a returned table's `n` may add after its last entry.
const MAX_TRAILING_NILS: usize = 1 << 20;

// =============================================================================
// Compiler
// =============================================================================

pub struct LuaCompiler {
    lua: Rc<Lua>,
}

impl std::fmt::Debug for LuaCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaCompiler")
            .field("memory", &self.lua.used_memory())
            .finish()
    }
}

impl LuaCompiler {
    /// A compiler over a fresh, sandboxed Lua state.
    pub fn new() -> mlua::Result<Self> {
        let lua = Lua::new();
        let globals = lua.globals();
        for name in UNSAFE_GLOBALS {
            globals.set(*name, mlua::Value::Nil)?;
        }
        Ok(Self { lua: Rc::new(lua) })
    }
}

impl SourceCompiler for LuaCompiler {
    fn compile(&self, kind: FunctionKind, source: &str) -> Result<Rc<dyn CompiledFunction>, Diagnostics> {
        let chunk = format!("{CHUNK_PREFIX}{source}");
        match self.lua.load(chunk).set_name(format!("={kind}")).into_function() {
            Ok(function) => {
                log::debug!("compiled {} chunk ({} bytes)", kind, source.len());
                Ok(Rc::new(LuaFunction {
                    lua: self.lua.clone(),
                    function,
                }))
            }
            Err(mlua::Error::SyntaxError { message, .. }) => Err(syntax_diagnostics(&message)),
            Err(e) => Err(Diagnostics::error(e.to_string())),
        }
    }
}

/// Lua reports `chunkname:line: message`, one error per compile.
fn syntax_diagnostics(message: &str) -> Diagnostics {
    let first = message.lines().next().unwrap_or(message);
    let parsed = first.split_once(':').and_then(|(_, rest)| {
        let (line, text) = rest.split_once(':')?;
        Some((line.trim().parse::<usize>().ok()?, text.trim()))
    });
    let diagnostic = match parsed {
        Some((line, text)) => Diagnostic::at_line(line, text),
        None => Diagnostic::new(first.trim()),
    };
    Diagnostics::from(vec![diagnostic])
}

// =============================================================================
// Invocation
// =============================================================================

struct LuaFunction {
    lua: Rc<Lua>,
    function: mlua::Function,
}

impl CompiledFunction for LuaFunction {
    fn invoke(&self, ctx: &ExecutionContext<'_>) -> Result<Value, String> {
        let lua = self.lua.as_ref();
        let result = lua.scope(|scope| {
            let cell = scope.create_function(|lua, reference: String| {
                let value = ctx.cell(&reference).map_err(mlua::Error::RuntimeError)?;
                value_to_lua(lua, &value)
            })?;
            let range = scope.create_function(|lua, reference: String| {
                let value = ctx.range(&reference).map_err(mlua::Error::RuntimeError)?;
                value_to_lua(lua, &value)
            })?;
            let collection = scope.create_function(|lua, name: String| value_to_lua(lua, &ctx.collection(&name)))?;
            let own_collection = scope.create_function(|lua, ()| {
                let value = ctx.own_collection().map_err(mlua::Error::RuntimeError)?;
                value_to_lua(lua, &value)
            })?;
            let item = scope.create_function(|lua, ()| value_to_lua(lua, &ctx.item()))?;
            let set = scope.create_function(|_, (reference, text): (String, mlua::Value)| {
                let text = lua_to_value(&text).map_err(mlua::Error::RuntimeError)?.to_text();
                ctx.set_text(&reference, &text).map_err(mlua::Error::RuntimeError)
            })?;

            let this = this_table(lua, ctx)?;
            let edit = match ctx.edit() {
                Some(edit) => {
                    let t = lua.create_table()?;
                    t.set("property", edit.property.as_str())?;
                    t.set("old", value_to_lua(lua, &edit.old)?)?;
                    t.set("new", value_to_lua(lua, &edit.new)?)?;
                    mlua::Value::Table(t)
                }
                None => mlua::Value::Nil,
            };

            self.function
                .call::<mlua::Value>((cell, range, collection, own_collection, item, set, this, edit))
        });

        match result {
            Ok(returned) => lua_to_value(&returned),
            Err(e) => Err(scrub_runtime_error(&e)),
        }
    }
}

fn this_table(lua: &Lua, ctx: &ExecutionContext<'_>) -> mlua::Result<mlua::Table> {
    let t = lua.create_table()?;
    if let Some(location) = ctx.location() {
        t.set("sheet", location.sheet.as_str())?;
        t.set("row", location.row + 1)?;
        t.set("col", location.col + 1)?;
    }
    if let Some(index) = ctx.index() {
        t.set("index", index + 1)?;
    }
    t.set("text", ctx.caller_text())?;
    Ok(t)
}

/// First line of the error, without the traceback.
fn scrub_runtime_error(err: &mlua::Error) -> String {
    let cause = match err {
        mlua::Error::CallbackError { cause, .. } => cause.as_ref(),
        other => other,
    };
    let raw = cause.to_string();
    let first = raw.lines().next().unwrap_or(&raw).trim();
    if first.chars().count() > MAX_ERROR_LEN {
        let cut: String = first.chars().take(MAX_ERROR_LEN - 3).collect();
        format!("{cut}...")
    } else {
        first.to_string()
    }
}

// =============================================================================
// Value conversion
// =============================================================================

fn value_to_lua(lua: &Lua, value: &Value) -> mlua::Result<mlua::Value> {
    match value {
        Value::Empty => Ok(mlua::Value::Nil),
        Value::Bool(b) => Ok(mlua::Value::Boolean(*b)),
        Value::Number(n) => Ok(mlua::Value::Number(*n)),
        Value::Text(s) => Ok(mlua::Value::String(lua.create_string(s)?)),
        Value::List(items) => {
            // Empty items are nil holes, so the length travels as `n`
            let t = lua.create_table_with_capacity(items.len(), 1)?;
            for (i, item) in items.iter().enumerate() {
                t.raw_set(i + 1, value_to_lua(lua, item)?)?;
            }
            t.raw_set("n", items.len())?;
            Ok(mlua::Value::Table(t))
        }
    }
}

fn lua_to_value(value: &mlua::Value) -> Result<Value, String> {
    match value {
        mlua::Value::Nil => Ok(Value::Empty),
        mlua::Value::Boolean(b) => Ok(Value::Bool(*b)),
        mlua::Value::Integer(i) => Ok(Value::Number(*i as f64)),
        mlua::Value::Number(n) => Ok(Value::Number(*n)),
        mlua::Value::String(s) => s
            .to_str()
            .map(|s| Value::Text(s.to_string()))
            .map_err(|_| "function returned a non-UTF8 string".to_string()),
        mlua::Value::Table(t) => table_to_list(t),
        other => Err(format!("unsupported return type: {}", other.type_name())),
    }
}

/// A sequence table (optionally carrying `n`) becomes a list.
fn table_to_list(t: &mlua::Table) -> Result<Value, String> {
    let explicit_len = match t.raw_get::<mlua::Value>("n").map_err(|e| e.to_string())? {
        mlua::Value::Integer(n) if n >= 0 => Some(n as usize),
        mlua::Value::Number(n) if n >= 0.0 && n.fract() == 0.0 => Some(n as usize),
        _ => None,
    };
    let len = match explicit_len {
        // Trailing nils past the last stored index are empty items
        Some(n) if n > max_index(t)?.saturating_add(MAX_TRAILING_NILS) => {
            return Err("function returned a table whose n exceeds its items".to_string());
        }
        Some(n) => n,
        None => t.raw_len(),
    };

    for pair in t.pairs::<mlua::Value, mlua::Value>() {
        let (key, _) = pair.map_err(|e| e.to_string())?;
        let in_sequence = match key {
            mlua::Value::Integer(i) => i >= 1 && (i as usize) <= len,
            mlua::Value::String(s) => explicit_len.is_some() && &*s.as_bytes() == b"n",
            _ => false,
        };
        if !in_sequence {
            return Err("function returned a table that is not a sequence".to_string());
        }
    }

    let mut items = Vec::new();
    for i in 1..=len {
        let item: mlua::Value = t.raw_get(i).map_err(|e| e.to_string())?;
        items.push(lua_to_value(&item)?);
    }
    Ok(Value::List(items))
}

/// Largest positive integer key of `t`, 0 for none.
fn max_index(t: &mlua::Table) -> Result<usize, String> {
    let mut max = 0;
    for pair in t.pairs::<mlua::Value, mlua::Value>() {
        let (key, _) = pair.map_err(|e| e.to_string())?;
        if let mlua::Value::Integer(i) = key {
            if i > 0 {
                max = max.max(i as usize);
            }
        }
    }
    Ok(max)
}
