use std::collections::HashMap;
use std::env;
use std::fs::{read_to_string, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Deserialize;

#[derive(Deserialize)]
struct TomatbootConfig {
    entries_file: String,
    memory_map_slack: usize,
    default_log_level: String,
    #[serde(default)]
    log_levels: HashMap<String, String>,
}

fn to_level_string(value: &str) -> &'static str {
    match value.to_uppercase().as_str() {
        "OFF" => "LevelFilter::Off",
        "ERROR" => "LevelFilter::Error",
        "WARN" => "LevelFilter::Warn",
        "INFO" => "LevelFilter::Info",
        "DEBUG" => "LevelFilter::Debug",
        "TRACE" => "LevelFilter::Trace",
        _ => panic!("Unknown log level: {}", value),
    }
}

fn main() {
    let config_file = Path::new(&env::var("CARGO_MANIFEST_DIR").unwrap())
        .parent()
        .unwrap()
        .join("tomatboot.toml");

    println!("cargo:rerun-if-changed={}", config_file.display());

    let contents = read_to_string(&config_file).unwrap();
    let config: TomatbootConfig = toml::from_str(&contents).expect("Invalid configuration");

    assert!(
        !config.entries_file.is_empty(),
        "entries_file must not be empty"
    );
    assert!(
        config.memory_map_slack > 0,
        "memory_map_slack must be positive"
    );

    let output = Path::new(&env::var("OUT_DIR").unwrap()).join("config.rs");

    let mut file = BufWriter::new(File::create(output).unwrap());

    write!(
        &mut file,
        "static LOG_LEVEL_FILTERS: phf::Map<&'static str, LevelFilter> = "
    )
    .unwrap();

    let mut builder = phf_codegen::Map::new();
    for (target, max_level) in config.log_levels.iter() {
        builder.entry(target.as_str(), to_level_string(max_level));
    }
    builder.build(&mut file).unwrap();
    writeln!(&mut file, ";").unwrap();

    writeln!(
        &mut file,
        "const DEFAULT_LOG_LEVEL: LevelFilter = {};",
        to_level_string(&config.default_log_level)
    )
    .unwrap();

    writeln!(
        &mut file,
        "const ENTRIES_FILE: &str = {:?};",
        config.entries_file
    )
    .unwrap();
    writeln!(
        &mut file,
        "const MEMORY_MAP_SLACK: usize = {};",
        config.memory_map_slack
    )
    .unwrap();
}
