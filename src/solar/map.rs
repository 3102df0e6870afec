use std::path::{Path, PathBuf};

use geojson::{Feature, FeatureCollection};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::solar::aggregate::{
    AGGREGATE_DELIMITER, COL_MUNICIPALITY, COL_TOTAL_SYSTEMS, read_aggregate,
};
use crate::solar::join::{
    COL_DENSITY, COL_HOUSEHOLDS, JoinOutput, JoinedRow, feature_name, join, read_boundaries,
    read_feature_collection, read_households, require_property,
};
use crate::solar::states::BrazilianState;
use crate::solar::{PipelineError, write_output};

/// Which metric the map colours municipalities by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapVariant {
    /// Installed systems per municipality
    Systems,
    /// Installed systems per 1,000 households
    Density,
}

impl MapVariant {
    pub fn metric(&self) -> &'static str {
        match self {
            MapVariant::Systems => COL_TOTAL_SYSTEMS,
            MapVariant::Density => COL_DENSITY,
        }
    }

    /// Map title, e.g. "... por Município no Piauí" or "... na Bahia".
    pub fn title(&self, state: &BrazilianState) -> String {
        let subject = match self {
            MapVariant::Systems => "Número",
            MapVariant::Density => "Densidade",
        };
        format!(
            "{subject} de Sistemas de Geração Solar por Município {}",
            state.locative()
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            MapVariant::Systems => "Número de Sistemas de Geração",
            MapVariant::Density => "Sistemas por 1.000 Domicílios",
        }
    }
}

/// State boundary drawn behind the municipalities
#[derive(Debug, Clone, PartialEq)]
pub struct StateOutline {
    pub name: String,
    pub highlighted: bool,
    pub feature: Feature,
}

/// Read the state layer, flagging the outline whose name equals `highlight`.
pub fn read_state_outlines(
    path: &Path,
    name_property: &str,
    highlight: &str,
) -> Result<Vec<StateOutline>, PipelineError> {
    let collection = read_feature_collection(path)?;
    require_property(&collection, name_property, path)?;

    let outlines: Vec<StateOutline> = collection
        .features
        .into_iter()
        .map(|feature| {
            let name = feature_name(&feature, name_property);
            StateOutline {
                highlighted: name == highlight,
                name,
                feature,
            }
        })
        .collect();

    if !outlines.iter().any(|s| s.highlighted) {
        warn!(state = highlight, path = %path.display(), "state outline not found");
    }
    Ok(outlines)
}

pub struct ChoroplethMap<'a> {
    pub variant: MapVariant,
    pub title: String,
    pub states: &'a [StateOutline],
    pub municipalities: &'a [JoinedRow],
}

fn municipality_feature(row: &JoinedRow, variant: MapVariant) -> Feature {
    let mut feature = row.boundary.feature.clone();
    feature.set_property("layer", "municipality");
    feature.set_property(COL_MUNICIPALITY, row.key.as_str());
    feature.set_property(COL_TOTAL_SYSTEMS, row.systems);
    feature.set_property("matched", row.matched);
    if variant == MapVariant::Density {
        feature.set_property(COL_HOUSEHOLDS, json!(row.households));
        feature.set_property(COL_DENSITY, row.density);
    }
    feature
}

fn state_feature(outline: &StateOutline) -> Feature {
    let mut feature = outline.feature.clone();
    feature.set_property("layer", "state");
    feature.set_property("highlight", outline.highlighted);
    feature
}

/// Build the map layer: state outlines first, then the joined municipalities.
pub fn map_collection(map: &ChoroplethMap<'_>) -> FeatureCollection {
    let features = map
        .states
        .iter()
        .map(state_feature)
        .chain(
            map.municipalities
                .iter()
                .map(|row| municipality_feature(row, map.variant)),
        )
        .collect();

    let mut foreign_members = Map::new();
    foreign_members.insert("title".to_string(), Value::from(map.title.as_str()));
    foreign_members.insert("metric".to_string(), Value::from(map.variant.metric()));
    foreign_members.insert("label".to_string(), Value::from(map.variant.label()));

    FeatureCollection {
        bbox: None,
        features,
        foreign_members: Some(foreign_members),
    }
}

pub fn write_map(path: &Path, map: &ChoroplethMap<'_>) -> Result<(), PipelineError> {
    let bytes = serde_json::to_vec(&map_collection(map))?;
    write_output(path, &bytes)
}

/// Outcome of one Join-and-Derive run
#[derive(Debug, Clone)]
pub struct MapRun {
    pub variant: MapVariant,
    pub output: PathBuf,
    pub joined: JoinOutput,
}

/// Join the aggregate onto the municipal boundaries and write the map layer.
///
/// Nothing is written unless every input was read and joined.
pub fn run_map(config: &PipelineConfig, variant: MapVariant) -> Result<MapRun, PipelineError> {
    let state = config.state()?;

    let boundaries = read_boundaries(
        &config.municipalities_path(),
        &config.municipality_name_property,
    )?;
    let states = read_state_outlines(
        &config.states_path(),
        &config.state_name_property,
        state.name,
    )?;
    let aggregate = read_aggregate(&config.aggregate_path(), AGGREGATE_DELIMITER)?;
    info!(
        boundaries = boundaries.len(),
        municipalities = aggregate.len(),
        "map inputs loaded"
    );

    let households = match variant {
        MapVariant::Density => Some(read_households(
            &config.households_path(),
            &config.households,
            config.delimiter(),
        )?),
        MapVariant::Systems => None,
    };

    let joined = join(boundaries, &aggregate, households.as_deref())?;
    let report = &joined.report;
    if report.unmatched() > 0 {
        warn!(
            unmatched = report.unmatched(),
            "boundaries without aggregate data are shown as zero"
        );
    }
    if !report.unused_aggregate_keys.is_empty() {
        warn!(
            municipalities = ?report.unused_aggregate_keys,
            "aggregate rows matched no boundary"
        );
    }
    if !report.missing_households.is_empty() {
        warn!(
            municipalities = ?report.missing_households,
            "no usable household count, density set to zero"
        );
    }

    let output = match variant {
        MapVariant::Systems => config.systems_map_path(),
        MapVariant::Density => config.density_map_path(),
    };
    let map = ChoroplethMap {
        variant,
        title: variant.title(state),
        states: &states,
        municipalities: &joined.rows,
    };
    write_map(&output, &map)?;
    info!(path = %output.display(), "map layer written");

    Ok(MapRun {
        variant,
        output,
        joined,
    })
}
