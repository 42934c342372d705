use serde::{Deserialize, Serialize};

use crate::cell_id::{CellId, Location};

/// A value as seen by user functions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Empty,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<Value>),
}

impl Value {
    /// Interpret raw cell text: empty, number, boolean, or text.
    pub fn from_input(input: &str) -> Self {
        let trimmed = input.trim();

        if trimmed.is_empty() {
            return Value::Empty;
        }

        if let Ok(num) = trimmed.parse::<f64>() {
            return Value::Number(num);
        }

        match trimmed.to_ascii_uppercase().as_str() {
            "TRUE" => Value::Bool(true),
            "FALSE" => Value::Bool(false),
            _ => Value::Text(trimmed.to_string()),
        }
    }

    /// Text written into a cell when this value is the populate result.
    pub fn to_text(&self) -> String {
        match self {
            Value::Empty => String::new(),
            Value::Bool(true) => "TRUE".to_string(),
            Value::Bool(false) => "FALSE".to_string(),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{}", n)
                }
            }
            Value::Text(s) => s.clone(),
            Value::List(items) => items
                .iter()
                .map(Value::to_text)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }
}

/// Whether a cell displays its populate result as text or keeps it structured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellKind {
    #[default]
    Plain,
    /// Populate results go to `populate_result`; `text` is left to the user
    /// (typically the name of the collection the cell shows).
    Collection,
}

/// Failure marker written into `text` when the populate function did not compile.
pub const COMPILE_ERROR_TEXT: &str = "#COMPILE!";
/// Failure marker written into `text` when the populate function failed at run time.
pub const RUN_ERROR_TEXT: &str = "#ERROR!";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub id: CellId,
    pub location: Location,
    pub kind: CellKind,
    pub text: String,
    pub populate_function: Option<String>,
    pub trigger_function: Option<String>,
    /// Last populate/trigger failure, if any
    pub error: Option<String>,
    /// Structured populate result for collection-typed cells
    pub populate_result: Option<Value>,
}

impl Cell {
    pub fn new(id: CellId, location: Location) -> Self {
        Self {
            id,
            location,
            kind: CellKind::Plain,
            text: String::new(),
            populate_function: None,
            trigger_function: None,
            error: None,
            populate_result: None,
        }
    }

    /// The cell's value as user functions see it.
    ///
    /// Collection-typed cells expose their populate result when they have one.
    pub fn value(&self) -> Value {
        match (&self.kind, &self.populate_result) {
            (CellKind::Collection, Some(result)) => result.clone(),
            _ => Value::from_input(&self.text),
        }
    }

    pub fn has_populate_function(&self) -> bool {
        self.populate_function.as_deref().is_some_and(|n| !n.is_empty())
    }

    pub fn has_trigger_function(&self) -> bool {
        self.trigger_function.as_deref().is_some_and(|n| !n.is_empty())
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_from_input() {
        assert_eq!(Value::from_input(""), Value::Empty);
        assert_eq!(Value::from_input("   "), Value::Empty);
        assert_eq!(Value::from_input("5"), Value::Number(5.0));
        assert_eq!(Value::from_input(" 2.5 "), Value::Number(2.5));
        assert_eq!(Value::from_input("true"), Value::Bool(true));
        assert_eq!(Value::from_input("oops"), Value::Text("oops".into()));
    }

    #[test]
    fn test_value_to_text() {
        assert_eq!(Value::Number(6.0).to_text(), "6");
        assert_eq!(Value::Number(-3.0).to_text(), "-3");
        assert_eq!(Value::Number(1.5).to_text(), "1.5");
        assert_eq!(Value::Bool(false).to_text(), "FALSE");
        assert_eq!(Value::Empty.to_text(), "");
        assert_eq!(
            Value::List(vec![Value::Number(1.0), Value::Text("b".into())]).to_text(),
            "1, b"
        );
    }

    #[test]
    fn test_value_as_number() {
        assert_eq!(Value::Number(2.0).as_number(), Some(2.0));
        assert_eq!(Value::Text("4".into()).as_number(), Some(4.0));
        assert_eq!(Value::Text("four".into()).as_number(), None);
        assert_eq!(Value::Empty.as_number(), None);
    }

    #[test]
    fn test_cell_value_by_kind() {
        let mut cell = Cell::new(CellId::from_raw(1), Location::new("Sheet1", 0, 0));
        cell.text = "Orders".into();
        assert_eq!(cell.value(), Value::Text("Orders".into()));

        cell.kind = CellKind::Collection;
        assert_eq!(cell.value(), Value::Text("Orders".into()));

        cell.populate_result = Some(Value::List(vec![Value::Number(1.0)]));
        assert_eq!(cell.value(), Value::List(vec![Value::Number(1.0)]));
    }

    #[test]
    fn test_function_name_presence() {
        let mut cell = Cell::new(CellId::from_raw(1), Location::new("Sheet1", 0, 0));
        assert!(!cell.has_populate_function());
        cell.populate_function = Some(String::new());
        assert!(!cell.has_populate_function());
        cell.populate_function = Some("total".into());
        assert!(cell.has_populate_function());
        assert!(!cell.has_trigger_function());
    }
}
