use std::path::PathBuf;

use serde::Deserialize;

use crate::db;
use crate::error::Error;

fn default_port() -> u16 {
    5432
}

#[derive(Deserialize, Clone)]
pub struct PostgresConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub user: String,
    pub password: String,
    pub dbname: String,
}

impl PostgresConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={}",
            self.host, self.port, self.user, self.password, self.dbname
        )
    }
}

fn default_num_workers() -> usize {
    16
}

#[derive(Deserialize, Clone)]
pub struct HeatmapConfig {
    /// number of parallel matrix workers, each with its own database
    /// connection and shard cache
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
}

impl Default for HeatmapConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
        }
    }
}

fn default_network_region_table() -> String {
    "basic.geofence_active_mobility".to_string()
}

fn default_car_buffer_speed() -> f64 {
    // km/h
    80.0
}

fn default_hole_threshold_sqm() -> f64 {
    // 20 hectares, ~450m x 450m
    200_000.0
}

fn default_insert_batch_size() -> usize {
    800
}

#[derive(Deserialize, Clone)]
pub struct ServerConfig {
    pub postgres: PostgresConfig,

    /// directory holding the per-h3_3 parquet shard cache
    pub cache_dir: PathBuf,

    #[serde(default = "default_network_region_table")]
    pub network_region_table: String,

    /// buffer sizing speed for car catchment areas, km/h
    #[serde(default = "default_car_buffer_speed")]
    pub car_buffer_default_speed: f64,

    /// minimum area of holes kept in contoured polygons
    #[serde(default = "default_hole_threshold_sqm")]
    pub hole_threshold_sqm: f64,

    /// rows per travel-time matrix insert
    #[serde(default = "default_insert_batch_size")]
    pub insert_batch_size: usize,

    /// versioning suffix of the matrix table name
    pub matrix_date_suffix: String,

    #[serde(default)]
    pub heatmap: HeatmapConfig,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if !db::is_valid_table_reference(&self.network_region_table) {
            return Err(Error::InvalidRequest(format!(
                "invalid network region table name: {}",
                self.network_region_table
            )));
        }
        // the suffix is appended to an identifier, so it may start with a
        // digit but must stay within the identifier character set
        if self.matrix_date_suffix.is_empty()
            || !self
                .matrix_date_suffix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::InvalidRequest(format!(
                "invalid matrix date suffix: {}",
                self.matrix_date_suffix
            )));
        }
        if self.insert_batch_size == 0 {
            return Err(Error::InvalidRequest(
                "insert_batch_size must be > 0".to_string(),
            ));
        }
        if self.heatmap.num_workers == 0 {
            return Err(Error::InvalidRequest(
                "heatmap.num_workers must be > 0".to_string(),
            ));
        }
        if !(self.car_buffer_default_speed.is_finite() && self.car_buffer_default_speed > 0.0) {
            return Err(Error::InvalidRequest(
                "car_buffer_default_speed must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
