use std::collections::HashSet;
use std::path::Path;

use geojson::{Feature, FeatureCollection};
use polars::df;
use polars::prelude::{
    DataFrame, DataType, Expr, IntoLazy, NamedFrom, SortMultipleOptions, col, len, lit, when,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::HouseholdColumns;
use crate::solar::aggregate::{AggregateRow, COL_TOTAL_SYSTEMS};
use crate::solar::{Cell, PipelineError, Table, checked_total, read_table};

pub const COL_HOUSEHOLDS: &str = "total_domicilios";
pub const COL_DENSITY: &str = "Densidade";

const COL_KEY: &str = "chave";
const COL_FEATURE: &str = "feicao";
const COL_MATCHED: &str = "encontrado";
const COL_ROWS: &str = "linhas";

/// Canonical form of a municipality name: trimmed, single-spaced, title-cased.
///
/// A letter is upper-cased when it follows a non-letter and lower-cased
/// otherwise, so "SÃO JOSÉ DO PIAUÍ " becomes "São José Do Piauí". Accents are
/// kept as they are.
pub fn normalize_key(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, word) in name.split_whitespace().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let mut after_letter = false;
        for c in word.chars() {
            if c.is_alphabetic() {
                if after_letter {
                    out.extend(c.to_lowercase());
                } else {
                    out.extend(c.to_uppercase());
                }
                after_letter = true;
            } else {
                out.push(c);
                after_letter = false;
            }
        }
    }
    out
}

/// Parse a household count such as "12.345". Unparseable values are `None`.
pub fn parse_household_count(cell: &Cell, thousands_separator: char) -> Option<f64> {
    let value = match cell {
        Cell::Number(n) => *n,
        Cell::Text(s) => {
            let digits: String = s
                .chars()
                .filter(|c| *c != thousands_separator && !c.is_whitespace())
                .collect();
            digits.parse::<f64>().ok()?
        }
        Cell::Empty | Cell::Bool(_) => return None,
    };

    (value.is_finite() && value >= 0.0).then_some(value)
}

/// Installed systems per 1,000 households; zero when households are missing or
/// zero, or when there are no systems.
pub fn density_expr() -> Expr {
    let systems = col(COL_TOTAL_SYSTEMS);
    let households = col(COL_HOUSEHOLDS);
    when(
        households
            .clone()
            .gt(lit(0.0))
            .and(systems.clone().gt(lit(0u64))),
    )
    .then(systems.cast(DataType::Float64) / households * lit(1000.0))
    .otherwise(lit(0.0))
    .alias(COL_DENSITY)
}

#[derive(Debug, Clone, PartialEq)]
pub struct HouseholdRow {
    pub municipality: String,
    pub households: Option<f64>,
}

/// Read the census household table.
pub fn read_households(
    path: &Path,
    columns: &HouseholdColumns,
    delimiter: u8,
) -> Result<Vec<HouseholdRow>, PipelineError> {
    let table = read_table(path, delimiter)?;
    households_from_table(&table, columns)
}

pub fn households_from_table(
    table: &Table,
    columns: &HouseholdColumns,
) -> Result<Vec<HouseholdRow>, PipelineError> {
    let municipality = table.column(&columns.municipality)?;
    let households = table.column(&columns.households)?;

    let rows = table
        .rows()
        .iter()
        .filter_map(|row| {
            let name = match Table::cell(row, municipality) {
                Cell::Text(s) if !s.trim().is_empty() => s.clone(),
                _ => return None,
            };
            Some(HouseholdRow {
                municipality: name,
                households: parse_household_count(
                    Table::cell(row, households),
                    columns.thousands_separator,
                ),
            })
        })
        .collect();

    Ok(rows)
}

/// A municipal boundary and the name it is joined on
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryFeature {
    pub name: String,
    pub feature: Feature,
}

pub(crate) fn read_feature_collection(path: &Path) -> Result<FeatureCollection, PipelineError> {
    if !path.is_file() {
        return Err(PipelineError::NotFound(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
    let collection: FeatureCollection = text.parse()?;
    debug!(path = %path.display(), features = collection.features.len(), "loaded features");
    Ok(collection)
}

/// Value of `property`, matching keys the way table headers are matched: trimmed.
pub(crate) fn feature_property<'a>(feature: &'a Feature, property: &str) -> Option<&'a Value> {
    let wanted = property.trim();
    feature.property(wanted).or_else(|| {
        feature
            .properties_iter()
            .find(|(key, _)| key.trim() == wanted)
            .map(|(_, value)| value)
    })
}

/// String value of `property`, or an empty name when the feature lacks it.
pub(crate) fn feature_name(feature: &Feature, property: &str) -> String {
    match feature_property(feature, property) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Fail unless at least one feature carries `property`.
pub(crate) fn require_property(
    collection: &FeatureCollection,
    property: &str,
    path: &Path,
) -> Result<(), PipelineError> {
    if !collection.features.is_empty()
        && !collection
            .features
            .iter()
            .any(|f| feature_property(f, property).is_some())
    {
        return Err(PipelineError::schema(path.display().to_string(), property));
    }
    Ok(())
}

pub fn read_boundaries(path: &Path, name_property: &str) -> Result<Vec<BoundaryFeature>, PipelineError> {
    let collection = read_feature_collection(path)?;
    require_property(&collection, name_property, path)?;

    Ok(collection
        .features
        .into_iter()
        .map(|feature| BoundaryFeature {
            name: feature_name(&feature, name_property),
            feature,
        })
        .collect())
}

/// A boundary with the attributes joined onto it
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRow {
    pub boundary: BoundaryFeature,
    /// Normalized municipality name
    pub key: String,
    pub systems: u64,
    pub households: Option<f64>,
    pub density: f64,
    /// Whether an aggregate row was found for this boundary
    pub matched: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinReport {
    pub boundaries: usize,
    pub matched: usize,
    /// Boundary names with no aggregate row; shown as zero
    pub unmatched_boundaries: Vec<String>,
    /// Aggregate keys that matched no boundary; their systems are not on the map
    pub unused_aggregate_keys: Vec<String>,
    /// Boundaries with systems but no usable household count
    pub missing_households: Vec<String>,
    pub max_systems: u64,
    pub min_positive_density: Option<f64>,
    pub max_density: f64,
}

impl JoinReport {
    pub fn unmatched(&self) -> usize {
        self.unmatched_boundaries.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutput {
    pub rows: Vec<JoinedRow>,
    pub report: JoinReport,
}

/// Systems per normalized key; colliding keys are summed. Blank keys are dropped.
fn systems_by_key(aggregate: &[AggregateRow]) -> Result<DataFrame, PipelineError> {
    checked_total(aggregate.iter().map(|r| r.systems), "aggregate")?;

    let (keys, systems): (Vec<String>, Vec<u64>) = aggregate
        .iter()
        .map(|row| (normalize_key(&row.municipality), row.systems))
        .filter(|(key, _)| !key.is_empty())
        .unzip();
    let rows = keys.len();

    let frame = df!(COL_KEY => keys, COL_TOTAL_SYSTEMS => systems)?
        .lazy()
        .group_by_stable([col(COL_KEY)])
        .agg([col(COL_TOTAL_SYSTEMS).sum()])
        .collect()?;
    if frame.height() < rows {
        debug!(merged = rows - frame.height(), "summed aggregate rows with colliding keys");
    }
    Ok(frame)
}

/// Household count per normalized key; the first row of a colliding key wins.
fn households_by_key(households: &[HouseholdRow]) -> Result<DataFrame, PipelineError> {
    let (keys, counts): (Vec<String>, Vec<Option<f64>>) = households
        .iter()
        .map(|row| (normalize_key(&row.municipality), row.households))
        .filter(|(key, _)| !key.is_empty())
        .unzip();

    let frame = df!(COL_KEY => keys, COL_HOUSEHOLDS => counts)?
        .lazy()
        .group_by_stable([col(COL_KEY)])
        .agg([
            col(COL_HOUSEHOLDS).first(),
            len().cast(DataType::Int64).alias(COL_ROWS),
        ])
        .collect()?;

    let keys = frame.column(COL_KEY)?.str()?;
    let rows = frame.column(COL_ROWS)?.i64()?;
    for (key, count) in keys.into_iter().zip(rows) {
        if let (Some(key), Some(count)) = (key, count) {
            if count > 1 {
                warn!(municipality = key, rows = count, "duplicate household rows, keeping the first");
            }
        }
    }

    Ok(frame.select([COL_KEY, COL_HOUSEHOLDS])?)
}

/// Left-join boundaries against the aggregate and, optionally, household counts.
///
/// Every boundary produces exactly one row, in input order. Aggregate rows
/// whose keys collide after normalization are summed; for households the first
/// row wins. Boundaries with no aggregate row get zero systems.
pub fn join(
    boundaries: Vec<BoundaryFeature>,
    aggregate: &[AggregateRow],
    households: Option<&[HouseholdRow]>,
) -> Result<JoinOutput, PipelineError> {
    let systems = systems_by_key(aggregate)?;
    let household_counts = households.map(households_by_key).transpose()?;

    let keys: Vec<String> = boundaries.iter().map(|b| normalize_key(&b.name)).collect();
    let order: Vec<u64> = (0..boundaries.len()).map(|i| i as u64).collect();

    let mut joined = df!(COL_FEATURE => order, COL_KEY => keys.clone())?
        .lazy()
        .left_join(systems.clone().lazy(), col(COL_KEY), col(COL_KEY))
        .with_column(col(COL_TOTAL_SYSTEMS).is_not_null().alias(COL_MATCHED))
        .with_column(col(COL_TOTAL_SYSTEMS).fill_null(lit(0u64)));
    if let Some(counts) = &household_counts {
        joined = joined
            .left_join(counts.clone().lazy(), col(COL_KEY), col(COL_KEY))
            .with_column(density_expr());
    }
    let joined = joined
        .sort([COL_FEATURE], SortMultipleOptions::default())
        .collect()?;

    if joined.height() != boundaries.len() {
        return Err(PipelineError::unexpected(format!(
            "join produced {} rows for {} boundaries",
            joined.height(),
            boundaries.len()
        )));
    }

    let system_counts = joined.column(COL_TOTAL_SYSTEMS)?.u64()?;
    let matched = joined.column(COL_MATCHED)?.bool()?;
    let (household_values, densities) = match household_counts {
        Some(_) => (
            Some(joined.column(COL_HOUSEHOLDS)?.f64()?),
            Some(joined.column(COL_DENSITY)?.f64()?),
        ),
        None => (None, None),
    };

    let mut report = JoinReport {
        boundaries: boundaries.len(),
        ..JoinReport::default()
    };
    let mut rows = Vec::with_capacity(boundaries.len());

    for (i, (boundary, key)) in boundaries.into_iter().zip(keys).enumerate() {
        let row_systems = system_counts.get(i).unwrap_or(0);
        let row_matched = matched.get(i).unwrap_or(false);
        let row_households = household_values.and_then(|h| h.get(i));
        let row_density = densities.and_then(|d| d.get(i)).unwrap_or(0.0);

        if row_matched {
            report.matched += 1;
        } else {
            report.unmatched_boundaries.push(boundary.name.clone());
        }
        if household_values.is_some() && row_systems > 0 && row_density == 0.0 {
            report.missing_households.push(boundary.name.clone());
        }
        report.max_systems = report.max_systems.max(row_systems);
        report.max_density = report.max_density.max(row_density);
        if row_density > 0.0 {
            report.min_positive_density = Some(
                report
                    .min_positive_density
                    .map_or(row_density, |current| current.min(row_density)),
            );
        }

        rows.push(JoinedRow {
            boundary,
            key,
            systems: row_systems,
            households: row_households,
            density: row_density,
            matched: row_matched,
        });
    }

    let used: HashSet<&str> = rows.iter().map(|r| r.key.as_str()).collect();
    report.unused_aggregate_keys = systems
        .column(COL_KEY)?
        .str()?
        .into_iter()
        .flatten()
        .filter(|key| !used.contains(key))
        .map(str::to_string)
        .collect();

    Ok(JoinOutput { rows, report })
}
