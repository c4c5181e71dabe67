#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("edge list is empty")]
    EmptyEdgeList,

    #[error("mismatched column lengths: {0} <> {1}")]
    MismatchedColumnLengths(usize, usize),

    #[error("no finite coordinates to derive a pixel extent from")]
    EmptyExtent,

    #[error("start node {0} is not part of the compacted network")]
    UnknownStartNode(u32),

    #[error("computation cancelled")]
    Cancelled,
}
