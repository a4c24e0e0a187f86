use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum MapError {
    #[error("Virtual address is not aligned to the mapping order")]
    VirtNotAligned,

    #[error("Physical address is not aligned to the mapping order")]
    PhysNotAligned,

    #[error("Mapping order is smaller than a page")]
    OrderTooSmall,

    #[error("Mapping lies outside the range covered by the table")]
    OutOfRange,
}

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum KernelError {
    #[error("Out of memory")]
    NoMemory,

    #[error("Invalid value")]
    InvalidValue,

    #[error("Mapping error: {0}")]
    MappingError(#[from] MapError),

    #[error("Operation not supported")]
    NotSupported,

    #[error("{0}")]
    Other(&'static str),
}

pub type Result<T> = core::result::Result<T, KernelError>;
