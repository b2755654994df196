use serde::{Deserialize, Serialize};

use crate::errors::{GruError, Result};

/// How the first layer consumes its input vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum InputMode {
    /// Input is projected through the layer-0 input weight block
    #[default]
    Linear,
    /// Input is added straight into every gate pre-activation.
    /// Requires the input width to equal the hidden size; layer 0 then has
    /// no input weight block and a single bias block.
    Skip,
}

/// Direction mode of every layer in the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DirectionMode {
    #[default]
    Unidirectional,
    /// A second pass walks each layer from the last timestep back to the first,
    /// with its own weights stored as the mirrored half of every block
    Bidirectional,
}

impl DirectionMode {
    pub fn count(self) -> usize {
        match self {
            DirectionMode::Unidirectional => 1,
            DirectionMode::Bidirectional => 2,
        }
    }

    pub fn is_bidirectional(self) -> bool {
        matches!(self, DirectionMode::Bidirectional)
    }
}

/// Hyperparameters of a packed GRU stack.
///
/// The sequence length is not part of the configuration; it is the length of
/// the [`BatchProfile`](crate::profile::BatchProfile) a pass runs over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GruConfig {
    pub hidden_size: usize,
    pub num_layers: usize,
    pub direction: DirectionMode,
    pub biased: bool,
    pub input_mode: InputMode,
    /// Length of each input vector
    pub input_width: usize,
    /// Declared output width; `None` means `directions * hidden_size`
    pub output_width: Option<usize>,
}

impl GruConfig {
    /// Unidirectional, unbiased, linear-input stack
    pub fn new(hidden_size: usize, num_layers: usize, input_width: usize) -> Self {
        Self {
            hidden_size,
            num_layers,
            direction: DirectionMode::Unidirectional,
            biased: false,
            input_mode: InputMode::Linear,
            input_width,
            output_width: None,
        }
    }

    pub fn with_direction(mut self, direction: DirectionMode) -> Self {
        self.direction = direction;
        self
    }

    pub fn bidirectional(self) -> Self {
        self.with_direction(DirectionMode::Bidirectional)
    }

    pub fn with_bias(mut self, biased: bool) -> Self {
        self.biased = biased;
        self
    }

    pub fn with_input_mode(mut self, input_mode: InputMode) -> Self {
        self.input_mode = input_mode;
        self
    }

    pub fn with_output_width(mut self, output_width: usize) -> Self {
        self.output_width = Some(output_width);
        self
    }

    pub fn directions(&self) -> usize {
        self.direction.count()
    }

    /// Width of the concatenated hidden output of one layer
    pub fn hidden_output_width(&self) -> usize {
        self.directions() * self.hidden_size
    }

    pub fn resolved_output_width(&self) -> usize {
        self.output_width
            .unwrap_or_else(|| self.hidden_output_width())
    }

    pub fn validate(&self) -> Result<()> {
        if self.hidden_size == 0 {
            return Err(GruError::InvalidConfig {
                message: "hidden size must be positive".to_string(),
            });
        }
        if self.num_layers == 0 {
            return Err(GruError::InvalidConfig {
                message: "layer count must be positive".to_string(),
            });
        }
        match self.input_mode {
            InputMode::Skip if self.input_width != self.hidden_size => {
                tracing::warn!(
                    input_width = self.input_width,
                    hidden_size = self.hidden_size,
                    "SKIP input mode needs input width equal to hidden size; nothing computed"
                );
                return Err(GruError::SkipInputWidth {
                    input_width: self.input_width,
                    hidden_size: self.hidden_size,
                });
            }
            InputMode::Linear if self.input_width == 0 => {
                return Err(GruError::InvalidConfig {
                    message: "input width must be positive in LINEAR input mode".to_string(),
                });
            }
            _ => {}
        }
        let output_width = self.resolved_output_width();
        if output_width == 0 {
            return Err(GruError::InvalidConfig {
                message: "output width must be positive".to_string(),
            });
        }
        if output_width > self.hidden_output_width() {
            return Err(GruError::InvalidConfig {
                message: format!(
                    "output width {} exceeds the concatenated hidden width {}",
                    output_width,
                    self.hidden_output_width()
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_output_width_follows_direction() {
        let config = GruConfig::new(8, 2, 5);
        assert_eq!(config.resolved_output_width(), 8);
        assert_eq!(config.bidirectional().resolved_output_width(), 16);
    }

    #[test]
    fn test_skip_mode_rejects_mismatched_width() {
        let config = GruConfig::new(4, 1, 3).with_input_mode(InputMode::Skip);
        assert!(matches!(
            config.validate(),
            Err(GruError::SkipInputWidth {
                input_width: 3,
                hidden_size: 4
            })
        ));

        let config = GruConfig::new(4, 1, 4).with_input_mode(InputMode::Skip);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_output_width_cannot_exceed_hidden_output() {
        let config = GruConfig::new(4, 1, 3).with_output_width(5);
        assert!(matches!(
            config.validate(),
            Err(GruError::InvalidConfig { .. })
        ));
        assert!(GruConfig::new(4, 1, 3).with_output_width(3).validate().is_ok());
        assert!(GruConfig::new(4, 1, 3).with_output_width(0).validate().is_err());
    }

    #[test]
    fn test_zero_sizes_rejected() {
        assert!(GruConfig::new(0, 1, 3).validate().is_err());
        assert!(GruConfig::new(2, 0, 3).validate().is_err());
        assert!(GruConfig::new(2, 1, 0).validate().is_err());
    }
}
