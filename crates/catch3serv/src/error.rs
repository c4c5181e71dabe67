#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("catchment area buffer extends beyond the loaded network cells")]
    BufferExceedsNetwork,

    #[error("starting point(s) are disconnected from the street network")]
    DisconnectedOrigin,

    #[error("loading network shard {h3_3} failed: {reason}")]
    ShardLoad { h3_3: i32, reason: String },

    #[error(transparent)]
    Database(#[from] tokio_postgres::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Graph(#[from] reachgraph::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),

    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("column {0} is missing from the segment table")]
    MissingColumn(&'static str),

    #[error("invalid h3 index: {0}")]
    InvalidH3Index(String),

    #[error("invalid segment geometry: {0}")]
    InvalidGeometry(String),
}

impl Error {
    /// non-fatal for heatmap processing; the affected cell is skipped
    pub fn is_skippable_cell(&self) -> bool {
        matches!(self, Self::BufferExceedsNetwork | Self::DisconnectedOrigin)
    }
}
