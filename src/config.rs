use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::solar::PipelineError;
use crate::solar::states::{self, BrazilianState};

/// Optional override file looked up in the data directory
pub const CONFIG_FILE_NAME: &str = "microgd.json";

/// Column names of the household table and how its counts are formatted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HouseholdColumns {
    pub municipality: String,
    pub households: String,
    pub thousands_separator: char,
}

impl Default for HouseholdColumns {
    fn default() -> Self {
        Self {
            municipality: "Municípios".to_string(),
            households: "Domicílios particulares permanentes - Domicílios".to_string(),
            thousands_separator: '.',
        }
    }
}

/// Input and output locations plus the few knobs the pipelines expose.
///
/// Relative paths are resolved against `data_dir`. Every field has a default,
/// so an override file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,
    pub installations_file: PathBuf,
    pub aggregate_file: PathBuf,
    pub households_file: PathBuf,
    pub municipalities_file: PathBuf,
    pub states_file: PathBuf,
    pub systems_map_file: PathBuf,
    pub density_map_file: PathBuf,
    /// UF code the installation filter keeps
    pub state_code: String,
    /// Feature property holding the municipality name
    pub municipality_name_property: String,
    /// Feature property holding the state name
    pub state_name_property: String,
    pub households: HouseholdColumns,
    /// Field separator for delimited text tables
    pub csv_delimiter: char,
    /// Rows shown in the console ranking
    pub top_n: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            installations_file: "capacidade_instalada.xlsx".into(),
            aggregate_file: "dados_para_mapa.csv".into(),
            households_file: "domicilios.xlsx".into(),
            municipalities_file: "PI_Municipios_2022.json".into(),
            states_file: "br_states.json".into(),
            systems_map_file: "mapa_sistemas_piaui.geojson".into(),
            density_map_file: "mapa_densidade_piaui.geojson".into(),
            state_code: "PI".to_string(),
            municipality_name_property: "name".to_string(),
            state_name_property: "ESTADO".to_string(),
            households: HouseholdColumns::default(),
            csv_delimiter: ';',
            top_n: 10,
        }
    }
}

impl PipelineConfig {
    /// Defaults rooted at `data_dir`, without looking for an override file.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load the configuration for `data_dir`, applying `microgd.json` if present.
    pub fn load(data_dir: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let data_dir = data_dir.into();
        let override_path = data_dir.join(CONFIG_FILE_NAME);

        let mut config = if override_path.is_file() {
            info!(path = %override_path.display(), "applying configuration overrides");
            let text = std::fs::read_to_string(&override_path)
                .map_err(|e| PipelineError::io(&override_path, e))?;
            serde_json::from_str::<PipelineConfig>(&text)?
        } else {
            PipelineConfig::default()
        };
        config.data_dir = data_dir;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        self.state()?;
        if !self.csv_delimiter.is_ascii() {
            return Err(PipelineError::unexpected(format!(
                "csv_delimiter must be a single ASCII character, got '{}'",
                self.csv_delimiter
            )));
        }
        Ok(())
    }

    /// The federative unit selected by `state_code`.
    pub fn state(&self) -> Result<&'static BrazilianState, PipelineError> {
        states::get_state(&self.state_code).ok_or_else(|| {
            PipelineError::unexpected(format!(
                "unknown state code '{}', expected one of {}",
                self.state_code,
                states::list_states().join(", ")
            ))
        })
    }

    pub fn delimiter(&self) -> u8 {
        if self.csv_delimiter.is_ascii() {
            self.csv_delimiter as u8
        } else {
            b';'
        }
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.data_dir.join(path)
    }

    pub fn installations_path(&self) -> PathBuf {
        self.resolve(&self.installations_file)
    }

    pub fn aggregate_path(&self) -> PathBuf {
        self.resolve(&self.aggregate_file)
    }

    pub fn households_path(&self) -> PathBuf {
        self.resolve(&self.households_file)
    }

    pub fn municipalities_path(&self) -> PathBuf {
        self.resolve(&self.municipalities_file)
    }

    pub fn states_path(&self) -> PathBuf {
        self.resolve(&self.states_file)
    }

    pub fn systems_map_path(&self) -> PathBuf {
        self.resolve(&self.systems_map_file)
    }

    pub fn density_map_path(&self) -> PathBuf {
        self.resolve(&self.density_map_file)
    }
}
