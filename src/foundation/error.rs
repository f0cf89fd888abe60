pub type SpryteResult<T> = Result<T, SpryteError>;

#[derive(thiserror::Error, Debug)]
pub enum SpryteError {
    /// A handle referring to an image slot that has been freed and reused, or
    /// never existed. Always a caller bug.
    #[error("stale handle: {0}")]
    StaleHandle(String),

    /// A mutating operation targeted a disposed image.
    #[error("disposed image: {0}")]
    Disposed(String),

    #[error("source and destination must be different images")]
    SameSourceAndDestination,

    #[error("pixel buffer length mismatch: got {got}, want {want}")]
    PixelLength { got: usize, want: usize },

    #[error("validation error: {0}")]
    Validation(String),

    /// The graphics driver failed during a flush or readback. The frame is
    /// aborted; restorable state stays intact for the next context.
    #[error("driver error: {0}")]
    Driver(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SpryteError {
    pub fn stale_handle(msg: impl Into<String>) -> Self {
        Self::StaleHandle(msg.into())
    }

    pub fn disposed(msg: impl Into<String>) -> Self {
        Self::Disposed(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn driver(msg: impl Into<String>) -> Self {
        Self::Driver(msg.into())
    }
}
