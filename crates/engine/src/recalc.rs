//! Recalculation counters and cycle reporting.

use crate::cell_id::CellId;

/// Running totals kept by the populate manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecalcStats {
    /// Populate functions invoked (successful or not).
    pub runs: usize,

    /// Runs that ended in a compile error, run-time error or panic.
    pub failures: usize,

    /// Nested recalculation requests dropped because the cell was already
    /// executing further up the stack. Immediate self-echoes are not counted.
    pub reentrant_skips: usize,

    /// Cycle reports recorded (can exceed the number kept).
    pub cycles_reported: usize,
}

impl RecalcStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Format as a one-line log entry.
    ///
    /// Format: `[recalc]  12 runs  failures=1  reentrant=0  cycles=0`
    pub fn log_line(&self) -> String {
        format!(
            "[recalc] {:>3} runs  failures={}  reentrant={}  cycles={}",
            self.runs, self.failures, self.reentrant_skips, self.cycles_reported
        )
    }
}

/// Report of a feedback loop cut by the re-entrancy guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Cells on the loop, starting and ending with the cell that was
    /// requested again. May be a subset for long loops.
    pub cells: Vec<CellId>,

    /// Human-readable description of the cycle.
    pub message: String,
}

impl CycleReport {
    pub fn new(cells: Vec<CellId>, message: impl Into<String>) -> Self {
        Self {
            cells,
            message: message.into(),
        }
    }

    /// Build a report from the executing path `cells`.
    pub fn cycle(cells: Vec<CellId>) -> Self {
        let names: Vec<String> = cells.iter().map(|c| c.to_string()).collect();
        let message = match names.as_slice() {
            [first, .., last] if names.len() > 5 => format!(
                "Circular update involving {} cells: {} → ... → {}",
                names.len(),
                first,
                last
            ),
            _ => format!("Circular update: {}", names.join(" → ")),
        };
        Self::new(cells, message)
    }
}

impl std::fmt::Display for CycleReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CycleReport {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(raw: u64) -> CellId {
        CellId::from_raw(raw)
    }

    #[test]
    fn test_stats_default() {
        let stats = RecalcStats::default();
        assert_eq!(stats.runs, 0);
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.reentrant_skips, 0);
        assert_eq!(stats.cycles_reported, 0);
    }

    #[test]
    fn test_stats_log_line() {
        let stats = RecalcStats {
            runs: 12,
            failures: 1,
            reentrant_skips: 2,
            cycles_reported: 0,
        };
        assert_eq!(
            stats.log_line(),
            "[recalc]  12 runs  failures=1  reentrant=2  cycles=0"
        );
    }

    #[test]
    fn test_cycle_report_small_cycle() {
        let report = CycleReport::cycle(vec![cell(1), cell(2), cell(1)]);
        assert_eq!(report.message, "Circular update: #1 → #2 → #1");
    }

    #[test]
    fn test_cycle_report_large_cycle() {
        let cells: Vec<CellId> = (1..=10).map(cell).collect();
        let report = CycleReport::cycle(cells);
        assert!(report.message.contains("..."));
        assert!(report.message.contains("10 cells"));
    }

    #[test]
    fn test_cycle_report_display() {
        let report = CycleReport::new(vec![cell(1)], "Test error");
        assert_eq!(format!("{}", report), "Test error");
    }
}
