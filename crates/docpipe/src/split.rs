//! Document splitting.
//!
//! A source document is partitioned into contiguous, non-overlapping
//! page-bounded units. Units are the grain of parallelism, retry, and cost
//! attribution; splitting itself is a pure function of the page count and
//! the configured threshold.

use rust_decimal::Decimal;

use crate::error::ExtractError;
use crate::record::Record;

/// Contiguous 1-based inclusive page interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
}

impl PageRange {
    pub fn new(start: u32, end: u32) -> Self {
        debug_assert!(start >= 1 && end >= start);
        Self { start, end }
    }

    /// Number of pages in the range.
    pub fn page_count(&self) -> u32 {
        self.end - self.start + 1
    }

    /// Offset added to a unit-local 1-based page number to obtain the
    /// absolute page number.
    pub fn offset(&self) -> u32 {
        self.start - 1
    }

    /// Human-readable label used in error summaries, e.g. `pages 16-30`.
    pub fn label(&self) -> String {
        if self.start == self.end {
            format!("page {}", self.start)
        } else {
            format!("pages {}-{}", self.start, self.end)
        }
    }
}

impl std::fmt::Display for PageRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Lifecycle of a unit inside the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Pending => "pending",
            UnitStatus::Running => "running",
            UnitStatus::Succeeded => "succeeded",
            UnitStatus::Failed => "failed",
        }
    }
}

/// One page-bounded slice of the source document. Owned exclusively by its
/// worker while processing; read-only once terminal.
#[derive(Debug, Clone)]
pub struct Unit {
    /// 0-based position; defines final record ordering regardless of
    /// completion order.
    pub unit_index: usize,
    pub page_range: PageRange,
    pub status: UnitStatus,
    pub extracted_records: Vec<Record>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// Model the extractor actually ran for this unit, once it succeeded.
    pub model_used: Option<String>,
    pub ocr_cost: Decimal,
    pub llm_cost: Decimal,
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

impl Unit {
    pub fn new(unit_index: usize, page_range: PageRange) -> Self {
        Self {
            unit_index,
            page_range,
            status: UnitStatus::Pending,
            extracted_records: Vec::new(),
            tokens_in: 0,
            tokens_out: 0,
            model_used: None,
            ocr_cost: Decimal::ZERO,
            llm_cost: Decimal::ZERO,
            attempt_count: 0,
            last_error: None,
        }
    }

    pub fn page_count(&self) -> u32 {
        self.page_range.page_count()
    }

    pub fn record_count(&self) -> usize {
        self.extracted_records.len()
    }
}

/// Partitions `page_count` pages into units of at most `pages_per_unit`
/// pages. The ranges are contiguous, non-overlapping, and cover `[1,
/// page_count]` exactly; a document at or below the threshold yields one
/// unit. Zero pages is a validation failure.
pub fn split_units(page_count: u32, pages_per_unit: u32) -> Result<Vec<Unit>, ExtractError> {
    if page_count == 0 {
        return Err(ExtractError::ZeroPages);
    }
    let step = pages_per_unit.max(1);

    let mut units = Vec::with_capacity(page_count.div_ceil(step) as usize);
    let mut start = 1u32;
    while start <= page_count {
        let end = (start + step - 1).min(page_count);
        units.push(Unit::new(units.len(), PageRange::new(start, end)));
        start = end + 1;
    }

    log::debug!(
        "Split {} pages into {} unit(s) of up to {} pages",
        page_count,
        units.len(),
        step
    );
    Ok(units)
}
