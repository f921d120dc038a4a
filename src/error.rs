use thiserror::Error;

/// Invalid configuration.
///
/// Returned by [`TrainerConfig::validate()`](crate::aae::config::TrainerConfig::validate) and the
/// network constructors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// A size that must be positive was 0.
    #[error("{name} must be greater than 0!")]
    Zero {
        /// The field.
        name: &'static str,
    },
    /// The generator input size does not fit the encoder / decoder geometry.
    #[error("input_size {input_size} is invalid, input_size / 2 must be a power of 4 (ie 2, 8, 32, 128)!")]
    InputSize {
        /// The input size.
        input_size: usize,
    },
    /// The discriminator does not accept the generator encoding.
    #[error("discriminator input_dims {input_dims} != generator encoding_dims {encoding_dims}!")]
    EncodingDims {
        /// Discriminator input dims.
        input_dims: usize,
        /// Generator encoding dims.
        encoding_dims: usize,
    },
    /// A float is negative, NaN, or infinite.
    #[error("{name} = {value} must be finite and non-negative!")]
    Float {
        /// The field.
        name: &'static str,
        /// The value.
        value: f32,
    },
    /// Betas must be in [0, 1).
    #[error("{name} = {value} must be in [0, 1)!")]
    Beta {
        /// The field.
        name: &'static str,
        /// The value.
        value: f32,
    },
}

pub(crate) fn ensure_nonzero(name: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::Zero { name })
    } else {
        Ok(())
    }
}

pub(crate) fn ensure_non_negative(name: &'static str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0. {
        Ok(())
    } else {
        Err(ConfigError::Float { name, value })
    }
}
