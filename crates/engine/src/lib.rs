pub mod cell;
pub mod cell_id;
pub mod collection;
pub mod compiler;
pub mod context;
pub mod events;
pub mod function;
pub mod notifier;
pub mod populate;
pub mod recalc;
pub mod refs;
pub mod registry;
pub mod sorted_view;
pub mod store;
pub mod trigger;
pub mod workbook;

#[cfg(test)]
pub mod harness;

pub use cell::{CellKind, Value};
pub use cell_id::{CellId, Location};
pub use compiler::{CompiledFunction, Diagnostic, Diagnostics, SourceCompiler};
pub use context::{EditContext, ExecutionContext};
pub use function::{CellFunction, FunctionError, FunctionKind};
pub use workbook::{Workbook, WorkbookError};
