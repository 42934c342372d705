// End-to-end tests: real Lua chunks driving a workbook.

use std::rc::Rc;

use livegrid_engine::cell::{COMPILE_ERROR_TEXT, RUN_ERROR_TEXT};
use livegrid_engine::{FunctionKind, Value, Workbook};
use livegrid_lua::LuaCompiler;

fn workbook() -> Workbook {
    Workbook::new(Rc::new(LuaCompiler::new().unwrap()))
}

fn populate(wb: &Workbook, address: &str, name: &str, source: &str) {
    wb.define_function(FunctionKind::Populate, name, source);
    wb.set_populate(address, Some(name)).unwrap();
}

// ---------------------------------------------------------------------------
// Propagation
// ---------------------------------------------------------------------------

#[test]
fn test_propagation_and_runtime_error() {
    let wb = workbook();
    wb.set_text("A1", "5").unwrap();
    populate(&wb, "B1", "inc", r#"return cell("A1") + 1"#);
    assert_eq!(wb.text("B1").as_deref(), Some("6"));
    assert_eq!(wb.error("B1"), None);

    wb.set_text("A1", "oops").unwrap();
    assert_eq!(wb.text("B1").as_deref(), Some(RUN_ERROR_TEXT));
    assert!(wb.error("B1").is_some());

    wb.set_text("A1", "41").unwrap();
    assert_eq!(wb.text("B1").as_deref(), Some("42"));
    assert_eq!(wb.error("B1"), None);
}

#[test]
fn test_chain_through_relative_refs() {
    let wb = workbook();
    wb.define_function(FunctionKind::Populate, "double_above", r#"return (cell("R[-1]C") or 0) * 2"#);
    wb.set_text("A1", "1").unwrap();
    for address in ["A2", "A3", "A4"] {
        wb.set_populate(address, Some("double_above")).unwrap();
    }
    assert_eq!(wb.text("A4").as_deref(), Some("8"));

    wb.set_text("A1", "3").unwrap();
    assert_eq!(wb.text("A4").as_deref(), Some("24"));
}

#[test]
fn test_range_sum_follows_every_cell() {
    let wb = workbook();
    for (address, text) in [("A1", "1"), ("A2", "2"), ("B1", "3"), ("B2", "4")] {
        wb.set_text(address, text).unwrap();
    }
    populate(
        &wb,
        "C1",
        "block_sum",
        r#"
local t = range("A1:B2")
local s = 0
for i = 1, t.n do
  s = s + (t[i] or 0)
end
return s
"#,
    );
    assert_eq!(wb.text("C1").as_deref(), Some("10"));

    wb.set_text("B2", "10").unwrap();
    assert_eq!(wb.text("C1").as_deref(), Some("16"));

    wb.remove_cell("A1");
    assert_eq!(wb.text("C1").as_deref(), Some("15"));
}

#[test]
fn test_concatenated_refs_are_dependencies() {
    let wb = workbook();
    wb.set_text("A1", "x").unwrap();
    wb.set_text("B1", "y").unwrap();
    populate(&wb, "C1", "join", r#"return cell("A1") .. "-" ..cell("B1")"#);
    assert_eq!(wb.text("C1").as_deref(), Some("x-y"));

    wb.set_text("A1", "a").unwrap();
    wb.set_text("B1", "b").unwrap();
    assert_eq!(wb.text("C1").as_deref(), Some("a-b"));
}

// ---------------------------------------------------------------------------
// Compile errors
// ---------------------------------------------------------------------------

#[test]
fn test_syntax_error_marks_cell_and_recovers() {
    let wb = workbook();
    populate(&wb, "A1", "broken", "return cell(");
    assert_eq!(wb.text("A1").as_deref(), Some(COMPILE_ERROR_TEXT));
    assert!(wb.error("A1").unwrap().contains("line 1"));

    wb.define_function(FunctionKind::Populate, "broken", "return 7");
    assert_eq!(wb.text("A1").as_deref(), Some("7"));
    assert_eq!(wb.error("A1"), None);
}

#[test]
fn test_sandbox_blocks_os() {
    let wb = workbook();
    populate(&wb, "A1", "escape", "return os.time()");
    assert_eq!(wb.text("A1").as_deref(), Some(RUN_ERROR_TEXT));
}

// ---------------------------------------------------------------------------
// Context tables
// ---------------------------------------------------------------------------

#[test]
fn test_this_describes_the_caller() {
    let wb = workbook();
    populate(
        &wb,
        "B3",
        "whoami",
        r#"return this.sheet .. "!" .. this.row .. "," .. this.col"#,
    );
    assert_eq!(wb.text("B3").as_deref(), Some("Sheet1!3,2"));
}

#[test]
fn test_trigger_sees_edit_and_writes() {
    let wb = workbook();
    wb.define_function(
        FunctionKind::Trigger,
        "audit",
        r#"set("RC[1]", edit.property .. ":" .. tostring(edit.old) .. "->" .. tostring(edit.new))"#,
    );
    wb.set_text("A1", "1").unwrap();
    wb.set_trigger("A1", Some("audit")).unwrap();
    wb.set_text("A1", "2").unwrap();
    assert_eq!(wb.text("B1").as_deref(), Some("text:1.0->2.0"));
    assert_eq!(wb.text("A1").as_deref(), Some("2"));
}

#[test]
fn test_table_result_becomes_list() {
    let wb = workbook();
    populate(&wb, "A1", "three", "return {1, 2, 3}");
    assert_eq!(wb.value("A1"), Value::Text("1, 2, 3".into()));

    populate(&wb, "A2", "map", "return {a = 1}");
    assert_eq!(wb.text("A2").as_deref(), Some(RUN_ERROR_TEXT));
}

#[test]
fn test_oversized_length_field_is_rejected() {
    let wb = workbook();
    populate(&wb, "A1", "huge", "return { n = 2^40 }");
    assert_eq!(wb.text("A1").as_deref(), Some(RUN_ERROR_TEXT));
    assert!(wb.error("A1").unwrap().contains("exceeds"));
}

#[test]
fn test_range_with_trailing_empties_returns_whole() {
    let wb = workbook();
    wb.set_text("A1", "1").unwrap();
    populate(&wb, "C1", "copy", r#"return range("A1:A3")"#);
    assert_eq!(wb.error("C1"), None);
    assert_eq!(wb.text("C1").as_deref(), Some("1, , "));
}

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

#[test]
fn test_collection_count_follows_pushes() {
    let wb = workbook();
    populate(&wb, "A1", "count", r#"return collection("names").n"#);
    assert_eq!(wb.text("A1").as_deref(), Some("0"));

    wb.collections().push("names", Value::Text("ada".into()));
    wb.collections().push("names", Value::Text("bob".into()));
    assert_eq!(wb.text("A1").as_deref(), Some("2"));
}

#[test]
fn test_own_collection_cell() {
    let wb = workbook();
    wb.collections().push("left", Value::Number(1.0));
    wb.collections().push("right", Value::Number(1.0));
    wb.collections().push("right", Value::Number(2.0));

    wb.collection_cell("A1", "left").unwrap();
    populate(&wb, "A1", "size", "return own_collection().n");
    assert_eq!(wb.text("A1").as_deref(), Some("left"));
    assert_eq!(wb.value("A1"), Value::Number(1.0));

    wb.set_text("A1", "right").unwrap();
    assert_eq!(wb.value("A1"), Value::Number(2.0));
    assert_eq!(wb.error("A1"), None);
}

#[test]
fn test_sorted_view_with_lua_rank() {
    let wb = workbook();
    wb.define_function(FunctionKind::Rank, "by_value", "return item()");
    for n in [3.0, 1.0, 2.0] {
        wb.collections().push("scores", Value::Number(n));
    }
    let view = wb.create_sorted_view("sorted", "scores", "by_value");
    assert_eq!(
        view.values(),
        vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)]
    );
}

#[test]
fn test_sorted_view_rank_reads_a_cell() {
    let wb = workbook();
    wb.set_text("A1", "-1").unwrap();
    wb.define_function(FunctionKind::Rank, "signed", r#"return cell("A1") * item()"#);
    for n in [1.0, 3.0, 2.0] {
        wb.collections().push("scores", Value::Number(n));
    }
    let view = wb.create_sorted_view("sorted", "scores", "signed");
    assert_eq!(
        view.values(),
        vec![Value::Number(3.0), Value::Number(2.0), Value::Number(1.0)]
    );
}
