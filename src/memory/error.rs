use thiserror::Error;

#[derive(Error, Debug)]
pub enum AllocError {
    #[error("chunk region: {0} chunks requested, must be nonzero")]
    InvalidChunkCount(usize),

    #[error("mempool '{0}': global pool has insufficient chunks for {1} requested")]
    PoolExhausted(String, usize),

    #[error("objcache '{0}': object size 0 is invalid")]
    InvalidObjectSize(String),

    #[error("objcache '{0}': region exhausted, cannot supply a new chunk")]
    RegionExhausted(String),
}
