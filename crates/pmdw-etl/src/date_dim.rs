//! Date dimension generation.
//!
//! Rows are derived from calendar days and only ever appended; keys already
//! present in the warehouse are skipped.

use std::collections::BTreeSet;

use chrono::{Duration, NaiveDate};
use pmdw_core::{parse_source_date, DateDimRow, DateKey, ProjectRecord};
use pmdw_storage::Warehouse;
use tracing::{debug, info};

use crate::EtlError;

/// Inclusive, non-empty range of calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Range spanning both dates in whichever order they come.
    pub fn spanning(a: NaiveDate, b: NaiveDate) -> Self {
        Self {
            start: a.min(b),
            end: a.max(b),
        }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |day| *day <= end)
    }

    pub fn len_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Widen by `days` on each side, saturating at the calendar limits.
    pub fn padded(&self, days: i64) -> Self {
        let pad = Duration::days(days.max(0));
        Self {
            start: self.start.checked_sub_signed(pad).unwrap_or(NaiveDate::MIN),
            end: self.end.checked_add_signed(pad).unwrap_or(NaiveDate::MAX),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DateDimensionBuilder {
    padding_days: i64,
    default_date: NaiveDate,
}

impl DateDimensionBuilder {
    pub fn new(padding_days: i64, default_date: NaiveDate) -> Self {
        Self {
            padding_days,
            default_date,
        }
    }

    /// Range to materialize for `projects`: earliest start to latest end,
    /// padded. Missing bounds fall back to the default date and `today`; an
    /// inverted range is replaced by that fallback before padding.
    pub fn plan(&self, projects: &[ProjectRecord], today: NaiveDate) -> DateRange {
        let earliest = projects
            .iter()
            .filter_map(|p| p.start_date.as_deref().and_then(parse_source_date))
            .min();
        let latest = projects
            .iter()
            .filter_map(|p| p.end_date.as_deref().and_then(parse_source_date))
            .max();

        let fallback = DateRange::spanning(self.default_date, today);
        let range = DateRange::new(
            earliest.unwrap_or(fallback.start),
            latest.unwrap_or(fallback.end),
        )
        .unwrap_or_else(|| {
            debug!(?earliest, ?latest, "inverted project date range, using fallback");
            fallback
        });
        range.padded(self.padding_days)
    }

    /// Insert every day of `range` that `dim_date` does not hold yet.
    pub async fn build(&self, warehouse: &dyn Warehouse, range: &DateRange) -> Result<u64, EtlError> {
        let existing = warehouse
            .date_keys_between(DateKey::from_date(range.start), DateKey::from_date(range.end))
            .await
            .map_err(EtlError::dimension("date"))?;

        let missing: Vec<DateDimRow> = range
            .days()
            .filter(|day| !existing.contains(&DateKey::from_date(*day)))
            .map(DateDimRow::for_date)
            .collect();
        if missing.is_empty() {
            debug!(start = %range.start, end = %range.end, "date dimension already complete");
            return Ok(0);
        }

        let inserted = warehouse
            .insert_dates(&missing)
            .await
            .map_err(EtlError::dimension("date"))?;
        info!(
            start = %range.start,
            end = %range.end,
            days = range.len_days(),
            inserted,
            "date dimension extended"
        );
        Ok(inserted)
    }

    /// Make sure each of `keys` exists in `dim_date`.
    pub async fn ensure_dates(
        &self,
        warehouse: &dyn Warehouse,
        keys: &BTreeSet<DateKey>,
    ) -> Result<u64, EtlError> {
        let (Some(first), Some(last)) = (keys.first(), keys.last()) else {
            return Ok(0);
        };
        let existing = warehouse
            .date_keys_between(*first, *last)
            .await
            .map_err(EtlError::dimension("date"))?;

        let missing: Vec<DateDimRow> = keys
            .difference(&existing)
            .filter_map(|key| key.to_date())
            .map(DateDimRow::for_date)
            .collect();
        if missing.is_empty() {
            return Ok(0);
        }
        let inserted = warehouse
            .insert_dates(&missing)
            .await
            .map_err(EtlError::dimension("date"))?;
        info!(inserted, "added dates referenced by facts outside the planned range");
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmdw_storage::memory::{Fault, MemoryWarehouse};

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn project(id: i64, start: Option<&str>, end: Option<&str>) -> ProjectRecord {
        ProjectRecord {
            project_id: id,
            project_name: None,
            start_date: start.map(str::to_string),
            end_date: end.map(str::to_string),
            client_id: 1,
            team_id: 1,
            budget: None,
            priority: None,
        }
    }

    fn builder() -> DateDimensionBuilder {
        DateDimensionBuilder::new(30, ymd(2023, 1, 1))
    }

    #[test]
    fn plan_pads_observed_bounds() {
        let projects = [
            project(1, Some("2024-01-01"), Some("2024-03-01")),
            project(2, Some("2024-02-10"), Some("garbage")),
        ];
        let range = builder().plan(&projects, ymd(2025, 1, 1));
        assert_eq!(range.start(), ymd(2023, 12, 2));
        assert_eq!(range.end(), ymd(2024, 3, 31));
    }

    #[test]
    fn plan_without_projects_uses_fallback() {
        let range = builder().plan(&[], ymd(2023, 1, 10));
        assert_eq!(range.start(), ymd(2022, 12, 2));
        assert_eq!(range.end(), ymd(2023, 2, 9));
    }

    #[test]
    fn inverted_range_falls_back_instead_of_failing() {
        let projects = [project(1, Some("2024-06-01"), Some("2024-01-01"))];
        let range = DateDimensionBuilder::new(0, ymd(2023, 1, 1)).plan(&projects, ymd(2023, 3, 1));
        assert_eq!(range, DateRange::new(ymd(2023, 1, 1), ymd(2023, 3, 1)).unwrap());
    }

    #[test]
    fn range_enumerates_inclusive_days() {
        let range = DateRange::new(ymd(2024, 2, 27), ymd(2024, 3, 1)).unwrap();
        let days: Vec<_> = range.days().collect();
        assert_eq!(days.len(), 4, "leap day included");
        assert_eq!(range.len_days(), 4);
        assert!(DateRange::new(ymd(2024, 3, 2), ymd(2024, 3, 1)).is_none());
    }

    #[tokio::test]
    async fn rebuilding_the_same_range_inserts_nothing() {
        let warehouse = MemoryWarehouse::new();
        let range = DateRange::new(ymd(2024, 1, 1), ymd(2024, 1, 31)).unwrap();

        assert_eq!(builder().build(&warehouse, &range).await.unwrap(), 31);
        let before = warehouse.dates();
        assert_eq!(builder().build(&warehouse, &range).await.unwrap(), 0);
        assert_eq!(warehouse.dates(), before);
    }

    #[tokio::test]
    async fn overlapping_range_only_appends_new_days() {
        let warehouse = MemoryWarehouse::new();
        let first = DateRange::new(ymd(2024, 1, 1), ymd(2024, 1, 10)).unwrap();
        let second = DateRange::new(ymd(2024, 1, 5), ymd(2024, 1, 15)).unwrap();
        builder().build(&warehouse, &first).await.unwrap();
        assert_eq!(builder().build(&warehouse, &second).await.unwrap(), 5);
        assert_eq!(warehouse.dates().len(), 15);
    }

    #[tokio::test]
    async fn ensure_dates_adds_only_missing_keys() {
        let warehouse = MemoryWarehouse::new();
        let range = DateRange::new(ymd(2024, 1, 1), ymd(2024, 1, 2)).unwrap();
        builder().build(&warehouse, &range).await.unwrap();

        let keys: BTreeSet<_> = [DateKey(20240101), DateKey(20230101)].into_iter().collect();
        assert_eq!(builder().ensure_dates(&warehouse, &keys).await.unwrap(), 1);
        assert_eq!(builder().ensure_dates(&warehouse, &keys).await.unwrap(), 0);
        assert_eq!(builder().ensure_dates(&warehouse, &BTreeSet::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn insert_failure_is_a_dimension_error() {
        let warehouse = MemoryWarehouse::new();
        warehouse.inject(Fault::DateInsert);
        let range = DateRange::new(ymd(2024, 1, 1), ymd(2024, 1, 1)).unwrap();
        let err = builder().build(&warehouse, &range).await.unwrap_err();
        assert_eq!(err.kind(), "DimensionError");
    }
}
