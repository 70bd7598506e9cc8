/// Failures specific to the sampling pipeline. I/O and libtorch errors are
/// carried through `anyhow` as they are.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("the number of sampling steps must be between 1 and {max}, got {steps}")]
    InvalidSteps { steps: usize, max: usize },

    #[error("eta must be 0 for PLMS sampling, got {0}")]
    PlmsEta(f64),

    #[error("expected an image tensor of shape (3, height, width), got {0:?}")]
    ImageShape(Vec<i64>),

    #[error("pixel buffer of {len} bytes does not match a {width}x{height} RGB image")]
    ImageBuffer { len: usize, width: u32, height: u32 },
}
