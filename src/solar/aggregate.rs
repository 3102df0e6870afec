use std::path::Path;

use csv::WriterBuilder;
use polars::df;
use polars::prelude::{DataFrame, Expr, IntoLazy, NamedFrom, Series, SortMultipleOptions, col, lit};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::solar::{PipelineError, Table, UTF8_BOM, checked_total, read_table, write_output};

pub const COL_STATE: &str = "uf";
pub const COL_SOURCE: &str = "fonte_resumo";
pub const COL_CLASS: &str = "classe";
pub const COL_SUBGROUP: &str = "subgrupo";
pub const COL_MODALITY: &str = "modalidade";
pub const COL_SCALE: &str = "mini_micro";
pub const COL_SEGMENT: &str = "segmento";
pub const COL_MUNICIPALITY: &str = "municipio";
pub const COL_SYSTEMS: &str = "n_sistemas";

/// Column holding the summed count in the aggregate table
pub const COL_TOTAL_SYSTEMS: &str = "Numero_Sistemas";
/// Field separator of the aggregate table, independent of the input format
pub const AGGREGATE_DELIMITER: u8 = b';';

pub const PHOTOVOLTAIC: &str = "Fotovoltaica";
pub const CONSUMER_CLASSES: &[&str] = &["Residencial", "Rural"];
pub const TARIFF_SUBGROUPS: &[&str] = &["B1", "B2"];
pub const MODALITIES: &[&str] = &[
    "Geração na própria UC",
    "Autoconsumo remoto",
    "Geração compartilhada",
];
pub const MICRO_GENERATION: &str = "MicroGD";
pub const SEGMENTS: &[&str] = &["residencial", "residencial_remoto"];

/// One row of the regulator's installed-capacity export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationRecord {
    pub state: String,
    pub source: String,
    pub class: String,
    pub subgroup: String,
    pub modality: String,
    pub scale: String,
    pub segment: String,
    /// `None` when the cell is blank
    pub municipality: Option<String>,
    pub systems: u64,
}

/// Municipality and the number of systems installed there
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateRow {
    pub municipality: String,
    pub systems: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregate {
    /// Sorted by `systems`, descending
    pub rows: Vec<AggregateRow>,
    /// Records that passed the filter
    pub matched_records: usize,
    /// Systems from matching records that name no municipality
    pub unassigned_systems: u64,
}

impl Aggregate {
    pub fn total_systems(&self) -> u64 {
        self.rows.iter().map(|r| r.systems).sum()
    }
}

/// Residential micro-generation photovoltaic systems in one state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationFilter {
    pub state_code: String,
}

impl InstallationFilter {
    pub fn for_state(state_code: impl Into<String>) -> Self {
        Self {
            state_code: state_code.into(),
        }
    }

    /// Row predicate over a frame holding the installation columns.
    pub fn predicate(&self) -> Expr {
        col(COL_STATE)
            .eq(lit(self.state_code.as_str()))
            .and(col(COL_SOURCE).eq(lit(PHOTOVOLTAIC)))
            .and(is_one_of(COL_CLASS, CONSUMER_CLASSES))
            .and(is_one_of(COL_SUBGROUP, TARIFF_SUBGROUPS))
            .and(is_one_of(COL_MODALITY, MODALITIES))
            .and(col(COL_SCALE).eq(lit(MICRO_GENERATION)))
            .and(is_one_of(COL_SEGMENT, SEGMENTS))
    }
}

fn is_one_of(column: &str, allowed: &[&str]) -> Expr {
    col(column).is_in(lit(Series::new(column.into(), allowed)))
}

impl InstallationRecord {
    /// Extract records from a table, resolving every field the filter and grouping use.
    pub fn from_table(table: &Table) -> Result<Vec<InstallationRecord>, PipelineError> {
        let state = table.column(COL_STATE)?;
        let source = table.column(COL_SOURCE)?;
        let class = table.column(COL_CLASS)?;
        let subgroup = table.column(COL_SUBGROUP)?;
        let modality = table.column(COL_MODALITY)?;
        let scale = table.column(COL_SCALE)?;
        let segment = table.column(COL_SEGMENT)?;
        let municipality = table.column(COL_MUNICIPALITY)?;
        let systems = table.column(COL_SYSTEMS)?;

        table
            .rows()
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let count = Table::cell(row, systems)
                    .to_count()
                    .map_err(|e| table.row_error(i, COL_SYSTEMS, &e))?;
                let name = Table::cell(row, municipality);

                Ok(InstallationRecord {
                    state: Table::cell(row, state).to_text(),
                    source: Table::cell(row, source).to_text(),
                    class: Table::cell(row, class).to_text(),
                    subgroup: Table::cell(row, subgroup).to_text(),
                    modality: Table::cell(row, modality).to_text(),
                    scale: Table::cell(row, scale).to_text(),
                    segment: Table::cell(row, segment).to_text(),
                    municipality: (!name.is_blank()).then(|| name.to_text()),
                    systems: count,
                })
            })
            .collect()
    }
}

fn text_column<'a>(
    records: &'a [InstallationRecord],
    field: impl Fn(&'a InstallationRecord) -> &'a str,
) -> Vec<&'a str> {
    records.iter().map(field).collect()
}

/// Load records into a frame with one column per installation field.
pub fn installations_frame(records: &[InstallationRecord]) -> Result<DataFrame, PipelineError> {
    let municipalities: Vec<Option<&str>> = records
        .iter()
        .map(|r| r.municipality.as_deref())
        .collect();
    let systems: Vec<u64> = records.iter().map(|r| r.systems).collect();

    let frame = df!(
        COL_STATE => text_column(records, |r| r.state.as_str()),
        COL_SOURCE => text_column(records, |r| r.source.as_str()),
        COL_CLASS => text_column(records, |r| r.class.as_str()),
        COL_SUBGROUP => text_column(records, |r| r.subgroup.as_str()),
        COL_MODALITY => text_column(records, |r| r.modality.as_str()),
        COL_SCALE => text_column(records, |r| r.scale.as_str()),
        COL_SEGMENT => text_column(records, |r| r.segment.as_str()),
        COL_MUNICIPALITY => municipalities,
        COL_SYSTEMS => systems
    )?;
    Ok(frame)
}

/// Filter records, sum systems per municipality and rank municipalities.
///
/// Municipality names are grouped exactly as they appear. Ties keep the order
/// in which each municipality was first seen.
pub fn aggregate(
    records: &[InstallationRecord],
    filter: &InstallationFilter,
) -> Result<Aggregate, PipelineError> {
    // bounds every group sum below
    checked_total(records.iter().map(|r| r.systems), "installations")?;

    let matched = installations_frame(records)?
        .lazy()
        .filter(filter.predicate())
        .collect()?;
    let matched_records = matched.height();

    let unassigned = matched
        .clone()
        .lazy()
        .filter(col(COL_MUNICIPALITY).is_null())
        .select([col(COL_SYSTEMS).sum()])
        .collect()?;
    let unassigned_systems = unassigned.column(COL_SYSTEMS)?.u64()?.get(0).unwrap_or(0);

    let grouped = matched
        .lazy()
        .filter(col(COL_MUNICIPALITY).is_not_null())
        .group_by_stable([col(COL_MUNICIPALITY)])
        .agg([col(COL_SYSTEMS).sum().alias(COL_TOTAL_SYSTEMS)])
        .sort(
            [COL_TOTAL_SYSTEMS],
            SortMultipleOptions::default()
                .with_order_descending(true)
                .with_maintain_order(true),
        )
        .collect()?;

    let names = grouped.column(COL_MUNICIPALITY)?.str()?;
    let totals = grouped.column(COL_TOTAL_SYSTEMS)?.u64()?;
    let rows = names
        .into_iter()
        .zip(totals)
        .filter_map(|(name, systems)| {
            Some(AggregateRow {
                municipality: name?.to_string(),
                systems: systems.unwrap_or(0),
            })
        })
        .collect();

    Ok(Aggregate {
        rows,
        matched_records,
        unassigned_systems,
    })
}

/// Serialize the aggregate as `;`-separated UTF-8 with a byte-order marker.
pub fn encode_aggregate(rows: &[AggregateRow]) -> Result<Vec<u8>, PipelineError> {
    let mut writer = WriterBuilder::new()
        .delimiter(AGGREGATE_DELIMITER)
        .from_writer(UTF8_BOM.to_vec());

    writer.write_record([COL_MUNICIPALITY, COL_TOTAL_SYSTEMS])?;
    for row in rows {
        let systems = row.systems.to_string();
        writer.write_record([row.municipality.as_str(), systems.as_str()])?;
    }

    writer
        .into_inner()
        .map_err(|e| PipelineError::unexpected(format!("failed to flush CSV output: {}", e.error())))
}

pub fn write_aggregate(path: &Path, rows: &[AggregateRow]) -> Result<(), PipelineError> {
    let bytes = encode_aggregate(rows)?;
    write_output(path, &bytes)
}

/// Read an aggregate table written by [`write_aggregate`] (or any table with the same columns).
pub fn read_aggregate(path: &Path, delimiter: u8) -> Result<Vec<AggregateRow>, PipelineError> {
    let table = read_table(path, delimiter)?;
    let municipality = table.column(COL_MUNICIPALITY)?;
    let systems = table.column(COL_TOTAL_SYSTEMS)?;

    let mut rows = Vec::with_capacity(table.len());
    for (i, row) in table.rows().iter().enumerate() {
        let name = Table::cell(row, municipality);
        if name.is_blank() {
            continue;
        }
        let count = Table::cell(row, systems)
            .to_count()
            .map_err(|e| table.row_error(i, COL_TOTAL_SYSTEMS, &e))?;
        rows.push(AggregateRow {
            municipality: name.to_text(),
            systems: count,
        });
    }
    checked_total(rows.iter().map(|r| r.systems), table.name())?;

    Ok(rows)
}

/// Summary of one Filter-Aggregate run
#[derive(Debug, Clone)]
pub struct AggregationRun {
    pub columns: Vec<String>,
    pub records: usize,
    pub aggregate: Aggregate,
}

/// Read the installations table, aggregate it and write the hand-off table.
pub fn run_aggregation(config: &PipelineConfig) -> Result<AggregationRun, PipelineError> {
    let state = config.state()?;
    let path = config.installations_path();

    let table = read_table(&path, config.delimiter())?;
    info!(
        path = %path.display(),
        rows = table.len(),
        columns = ?table.headers(),
        "installations table loaded"
    );

    let records = InstallationRecord::from_table(&table)?;
    let filter = InstallationFilter::for_state(state.code);
    let aggregate = aggregate(&records, &filter)?;
    info!(
        state = %state,
        matched = aggregate.matched_records,
        municipalities = aggregate.rows.len(),
        systems = aggregate.total_systems(),
        "installations aggregated"
    );
    if aggregate.unassigned_systems > 0 {
        warn!(
            systems = aggregate.unassigned_systems,
            "matching records without a municipality were left out"
        );
    }

    let output = config.aggregate_path();
    write_aggregate(&output, &aggregate.rows)?;
    info!(path = %output.display(), "aggregate written");

    Ok(AggregationRun {
        columns: table.headers().to_vec(),
        records: records.len(),
        aggregate,
    })
}
