use std::path::Path;

use geojson::FeatureCollection;
use microgd_rs::config::PipelineConfig;
use microgd_rs::solar::PipelineError;
use microgd_rs::solar::aggregate::run_aggregation;
use microgd_rs::solar::map::{MapVariant, run_map};
use rust_xlsxwriter::Workbook;
use serde_json::json;
use tempfile::TempDir;

const INSTALLATIONS: &str = "\
 uf ;fonte_resumo; classe;subgrupo;modalidade;mini_micro;segmento;municipio;n_sistemas
PI;Fotovoltaica;Residencial;B1;Geração na própria UC;MicroGD;residencial;Teresina;50
PI;Fotovoltaica;Residencial;B1;Geração na própria UC;MicroGD;residencial;Teresina;30
CE;Fotovoltaica;Residencial;B1;Geração na própria UC;MicroGD;residencial;Fortaleza;90
PI;Fotovoltaica;Rural;B2;Autoconsumo remoto;MicroGD;residencial_remoto;SÃO JOSÉ DO PIAUÍ;7
PI;Fotovoltaica;Residencial;B1;Geração compartilhada;MicroGD;residencial;Picos;123
PI;Fotovoltaica;Comercial;B3;Geração na própria UC;MiniGD;comercial;Picos;400
PI;Eólica;Residencial;B1;Geração na própria UC;MicroGD;residencial;Parnaíba;9
PI;Fotovoltaica;Residencial;B1;Geração na própria UC;MicroGD;residencial;Floriano;7
";

const HOUSEHOLDS: &str = "\
Municípios;Domicílios particulares permanentes - Domicílios
TERESINA;271.302
Picos;12.345
São José do Piauí;2.100
Floriano;-
";

fn municipalities() -> serde_json::Value {
    let names = ["Teresina", "Picos", "São José Do Piauí", "Floriano", "Oeiras"];
    json!({
        "type": "FeatureCollection",
        "features": names.iter().map(|name| json!({
            "type": "Feature",
            "properties": { "name": name },
            "geometry": { "type": "Point", "coordinates": [-42.0, -6.0] }
        })).collect::<Vec<_>>()
    })
}

fn states() -> serde_json::Value {
    json!({
        "type": "FeatureCollection",
        "features": [
            { "type": "Feature", "properties": { "ESTADO": "Ceará" }, "geometry": null },
            { "type": "Feature", "properties": { "ESTADO": "Piauí" }, "geometry": null }
        ]
    })
}

fn setup() -> (TempDir, PipelineConfig) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::write(root.join("capacidade_instalada.csv"), INSTALLATIONS).unwrap();
    std::fs::write(root.join("domicilios.csv"), HOUSEHOLDS).unwrap();
    std::fs::write(root.join("PI_Municipios_2022.json"), municipalities().to_string()).unwrap();
    std::fs::write(root.join("br_states.json"), states().to_string()).unwrap();
    std::fs::write(
        root.join("microgd.json"),
        r#"{ "installations_file": "capacidade_instalada.csv", "households_file": "domicilios.csv" }"#,
    )
    .unwrap();

    let config = PipelineConfig::load(root).unwrap();
    (dir, config)
}

/// Write a one-sheet workbook; whole numbers are stored as numeric cells.
fn write_workbook(path: &Path, rows: &[&[&str]]) {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    for (r, row) in rows.iter().enumerate() {
        for (c, value) in row.iter().enumerate() {
            let (r, c) = (r as u32, c as u16);
            match value.parse::<u64>() {
                Ok(n) => sheet.write_number(r, c, n as f64).unwrap(),
                Err(_) => sheet.write_string(r, c, *value).unwrap(),
            };
        }
    }
    workbook.save(path).unwrap();
}

fn read_layer(path: &Path) -> FeatureCollection {
    std::fs::read_to_string(path).unwrap().parse().unwrap()
}

fn municipality<'a>(layer: &'a FeatureCollection, key: &str) -> &'a geojson::Feature {
    layer
        .features
        .iter()
        .find(|f| f.property("municipio") == Some(&json!(key)))
        .unwrap_or_else(|| panic!("no feature for {key}"))
}

#[test]
fn aggregation_writes_sorted_bom_table() {
    let (_dir, config) = setup();

    let run = run_aggregation(&config).unwrap();
    assert_eq!(run.records, 8);
    assert_eq!(run.aggregate.matched_records, 5);
    assert_eq!(run.aggregate.total_systems(), 50 + 30 + 7 + 123 + 7);

    let bytes = std::fs::read(config.aggregate_path()).unwrap();
    assert!(bytes.starts_with(&[0xEF, 0xBB, 0xBF]));
    assert_eq!(
        std::str::from_utf8(&bytes[3..]).unwrap(),
        "municipio;Numero_Sistemas\nPicos;123\nTeresina;80\nSÃO JOSÉ DO PIAUÍ;7\nFloriano;7\n"
    );
}

#[test]
fn aggregation_is_idempotent() {
    let (_dir, config) = setup();

    run_aggregation(&config).unwrap();
    let first = std::fs::read(config.aggregate_path()).unwrap();
    run_aggregation(&config).unwrap();
    let second = std::fs::read(config.aggregate_path()).unwrap();

    assert_eq!(first, second);
}

#[test]
fn systems_map_covers_every_boundary() {
    let (_dir, config) = setup();
    run_aggregation(&config).unwrap();

    let run = run_map(&config, MapVariant::Systems).unwrap();
    let report = &run.joined.report;
    assert_eq!(run.joined.rows.len(), 5);
    assert_eq!(report.matched, 4);
    assert_eq!(report.unmatched_boundaries, ["Oeiras"]);
    assert!(report.unused_aggregate_keys.is_empty());
    assert_eq!(report.max_systems, 123);

    let layer = read_layer(&config.systems_map_path());
    // two state outlines followed by five municipalities
    assert_eq!(layer.features.len(), 7);
    assert_eq!(
        municipality(&layer, "São José Do Piauí").property("Numero_Sistemas"),
        Some(&json!(7))
    );
    let oeiras = municipality(&layer, "Oeiras");
    assert_eq!(oeiras.property("Numero_Sistemas"), Some(&json!(0)));
    assert!(!oeiras.contains_property("Densidade"));
}

#[test]
fn density_map_derives_per_household_rate() {
    let (_dir, config) = setup();
    run_aggregation(&config).unwrap();

    let run = run_map(&config, MapVariant::Density).unwrap();
    let rows = &run.joined.rows;
    assert_eq!(rows.len(), 5);

    let picos = rows.iter().find(|r| r.key == "Picos").unwrap();
    assert_eq!(picos.households, Some(12345.0));
    assert!((picos.density - 9.9635).abs() < 1e-3);

    let teresina = rows.iter().find(|r| r.key == "Teresina").unwrap();
    assert!((teresina.density - 80.0 / 271302.0 * 1000.0).abs() < 1e-9);

    // "-" is not a number: density falls back to zero
    let floriano = rows.iter().find(|r| r.key == "Floriano").unwrap();
    assert_eq!((floriano.households, floriano.density), (None, 0.0));
    assert_eq!(run.joined.report.missing_households, ["Floriano"]);

    let oeiras = rows.iter().find(|r| r.key == "Oeiras").unwrap();
    assert_eq!((oeiras.systems, oeiras.density), (0, 0.0));

    let layer = read_layer(&config.density_map_path());
    assert_eq!(
        municipality(&layer, "Picos").property("total_domicilios"),
        Some(&json!(12345.0))
    );
    assert_eq!(
        layer.foreign_members.unwrap()["title"],
        json!("Densidade de Sistemas de Geração Solar por Município no Piauí")
    );
}

#[test]
fn missing_household_table_writes_nothing() {
    let (dir, config) = setup();
    run_aggregation(&config).unwrap();
    std::fs::remove_file(dir.path().join("domicilios.csv")).unwrap();

    match run_map(&config, MapVariant::Density) {
        Err(PipelineError::NotFound(path)) => assert_eq!(path, config.households_path()),
        other => panic!("expected NotFound, got {other:?}"),
    }
    assert!(!config.density_map_path().exists());
}

#[test]
fn failed_run_keeps_previous_output() {
    let (dir, config) = setup();
    run_aggregation(&config).unwrap();
    run_map(&config, MapVariant::Systems).unwrap();
    let before = std::fs::read(config.systems_map_path()).unwrap();

    std::fs::write(
        dir.path().join("br_states.json"),
        json!({ "type": "FeatureCollection", "features": [
            { "type": "Feature", "properties": { "NOME": "Piauí" }, "geometry": null }
        ]})
        .to_string(),
    )
    .unwrap();

    assert!(matches!(
        run_map(&config, MapVariant::Systems),
        Err(PipelineError::Schema { column, .. }) if column == "ESTADO"
    ));
    assert_eq!(std::fs::read(config.systems_map_path()).unwrap(), before);
}

#[test]
fn missing_installations_table_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::new(dir.path());

    assert!(matches!(
        run_aggregation(&config),
        Err(PipelineError::NotFound(path)) if path.ends_with("capacidade_instalada.xlsx")
    ));
    assert!(!config.aggregate_path().exists());
}

#[test]
fn missing_filter_column_is_schema_error() {
    let (dir, config) = setup();
    std::fs::write(
        dir.path().join("capacidade_instalada.csv"),
        "uf;fonte_resumo;classe;subgrupo;modalidade;segmento;municipio;n_sistemas\n",
    )
    .unwrap();

    assert!(matches!(
        run_aggregation(&config),
        Err(PipelineError::Schema { column, .. }) if column == "mini_micro"
    ));
}

#[test]
fn spreadsheet_inputs_run_both_pipelines() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let header: &[&str] = &[
        " uf ", "fonte_resumo", "classe ", "subgrupo", "modalidade", "mini_micro", "segmento",
        "municipio", "n_sistemas",
    ];
    let record = |municipio: &'static str, systems: &'static str| -> [&'static str; 9] {
        [
            "PI", "Fotovoltaica", "Residencial", "B1", "Geração na própria UC", "MicroGD",
            "residencial", municipio, systems,
        ]
    };
    let teresina = record("Teresina", "80");
    let picos = record("Picos", "123");
    let floriano = record("Floriano", "4");
    write_workbook(
        &root.join("capacidade_instalada.xlsx"),
        &[header, &teresina, &picos, &floriano],
    );
    write_workbook(
        &root.join("domicilios.xlsx"),
        &[
            &[" Municípios ", "Domicílios particulares permanentes - Domicílios"],
            // thousands separator kept as text, the others are numeric cells
            &["Teresina", "271.302"],
            &["PICOS", "12345"],
            &["Floriano", "2000"],
        ],
    );
    std::fs::write(root.join("PI_Municipios_2022.json"), municipalities().to_string()).unwrap();
    std::fs::write(root.join("br_states.json"), states().to_string()).unwrap();
    let config = PipelineConfig::new(root);

    let run = run_aggregation(&config).unwrap();
    assert_eq!(run.records, 3);
    let bytes = std::fs::read(config.aggregate_path()).unwrap();
    assert_eq!(
        std::str::from_utf8(&bytes[3..]).unwrap(),
        "municipio;Numero_Sistemas\nPicos;123\nTeresina;80\nFloriano;4\n"
    );

    let run = run_map(&config, MapVariant::Density).unwrap();
    let density = |key: &str| run.joined.rows.iter().find(|r| r.key == key).unwrap().density;
    assert!((density("Picos") - 9.9635).abs() < 1e-3);
    assert_eq!(density("Floriano"), 2.0);
    assert!((density("Teresina") - 80.0 / 271302.0 * 1000.0).abs() < 1e-9);
    assert!(run.joined.report.missing_households.is_empty());
}
