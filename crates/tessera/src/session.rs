//! Prefill-then-step decoding over a built model.

use candle_core::Tensor;
use tessera_core::{Model, ModelInput, ModelType, Result, TesseraError};
use tracing::{debug, trace};

/// Drives one sequence batch through a model: a prompt prefill followed by
/// single-token decode steps at increasing positions.
///
/// Sampling is left to the caller; every call returns logits.
#[derive(Debug)]
pub struct DecodeSession {
    model: Model,
    max_seq_len: usize,
    context_len: usize,
    steps: usize,
}

impl DecodeSession {
    /// Take ownership of `model` and size its caches.
    pub fn new(mut model: Model, max_batch: usize, max_seq_len: usize) -> Result<Self> {
        model.setup_caches(max_batch, max_seq_len)?;
        Ok(Self {
            model,
            max_seq_len,
            context_len: 0,
            steps: 0,
        })
    }

    /// Run the prompt at positions `0..len`, discarding earlier context.
    ///
    /// `input_pos` in `input` is ignored; the prompt always starts at zero.
    pub fn prefill(&mut self, input: ModelInput<'_>) -> Result<Tensor> {
        self.model.reset_caches()?;
        self.context_len = 0;
        self.steps = 0;

        let logits = self.model.forward(without_positions(input))?;
        self.context_len = logits.dim(1)?;
        debug!(context_len = self.context_len, "prefilled prompt");
        Ok(logits)
    }

    /// Decode one token per sequence (`[batch, 1]`) at the next position.
    pub fn step(&mut self, tokens: &Tensor) -> Result<Tensor> {
        if self.context_len == 0 {
            return Err(TesseraError::StateError(
                "prefill must run before decode steps".to_string(),
            ));
        }
        let pos = self.position();
        if pos >= self.max_seq_len {
            return Err(TesseraError::ShapeError(format!(
                "position {pos} exceeds session capacity {}",
                self.max_seq_len
            )));
        }
        let input_pos = Tensor::new(&[pos as u32], tokens.device())?;
        let input = match self.model.model_type() {
            ModelType::TextOnly | ModelType::Llama3_1 => ModelInput::Text {
                tokens,
                input_pos: Some(&input_pos),
            },
            ModelType::Flamingo => ModelInput::Flamingo {
                tokens,
                encoder_input: None,
                encoder_mask: None,
                input_pos: Some(&input_pos),
            },
            ModelType::Llava => ModelInput::Llava {
                tokens,
                encoder_input: None,
                post_tokens: None,
                input_pos: Some(&input_pos),
            },
        };
        let logits = self.model.forward(input)?;
        self.steps += 1;
        trace!(pos, "decoded step");
        Ok(logits)
    }

    /// Position the next step writes to.
    pub fn position(&self) -> usize {
        self.context_len + self.steps
    }

    /// Tokens in the prompt, including any image tokens.
    pub fn context_len(&self) -> usize {
        self.context_len
    }

    /// Decode steps since the last prefill.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// The wrapped model.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Release the model.
    pub fn into_model(self) -> Model {
        self.model
    }
}

fn without_positions(input: ModelInput<'_>) -> ModelInput<'_> {
    match input {
        ModelInput::Text { tokens, .. } => ModelInput::Text {
            tokens,
            input_pos: None,
        },
        ModelInput::Flamingo {
            tokens,
            encoder_input,
            encoder_mask,
            ..
        } => ModelInput::Flamingo {
            tokens,
            encoder_input,
            encoder_mask,
            input_pos: None,
        },
        ModelInput::Llava {
            tokens,
            encoder_input,
            post_tokens,
            ..
        } => ModelInput::Llava {
            tokens,
            encoder_input,
            post_tokens,
            input_pos: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use serde_json::json;
    use tessera_core::ModelConfig;

    fn model() -> Model {
        let config = ModelConfig::from_value(json!({
            "dim": 32,
            "n_heads": 4,
            "n_layers": 1,
            "vocab_size": 20,
            "hidden_dim": 64
        }))
        .unwrap();
        tessera_core::build(&config).unwrap()
    }

    #[test]
    fn positions_advance() {
        let mut session = DecodeSession::new(model(), 1, 8).unwrap();
        let prompt = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu).unwrap();
        let logits = session
            .prefill(ModelInput::Text {
                tokens: &prompt,
                input_pos: None,
            })
            .unwrap();
        assert_eq!(logits.dims(), &[1, 3, 20]);
        assert_eq!(session.position(), 3);

        let next = Tensor::new(&[[4u32]], &Device::Cpu).unwrap();
        assert_eq!(session.step(&next).unwrap().dims(), &[1, 1, 20]);
        assert_eq!(session.position(), 4);
    }

    #[test]
    fn step_before_prefill_is_state_error() {
        let mut session = DecodeSession::new(model(), 1, 8).unwrap();
        let next = Tensor::new(&[[4u32]], &Device::Cpu).unwrap();
        assert!(session.step(&next).unwrap_err().is_state());
    }

    #[test]
    fn capacity_is_enforced() {
        let mut session = DecodeSession::new(model(), 1, 4).unwrap();
        let prompt = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu).unwrap();
        session
            .prefill(ModelInput::Text {
                tokens: &prompt,
                input_pos: None,
            })
            .unwrap();
        let next = Tensor::new(&[[4u32]], &Device::Cpu).unwrap();
        session.step(&next).unwrap();
        assert!(session.step(&next).unwrap_err().is_shape());
    }
}
