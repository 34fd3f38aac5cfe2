use burn::{
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    tensor::cast::ToElement,
    tensor::{Tensor, backend::AutodiffBackend},
};

use crate::conv_model::RgbdVae;
use crate::elbo::Elbo;

/// Stochastic variational inference over the encoder and decoder jointly.
///
/// Owns the VAE and its optimizer; every [`Svi::step`] runs forward,
/// backward and exactly one optimizer update before returning.
pub struct Svi<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<RgbdVae<B>, B>,
{
    model: RgbdVae<B>,
    optimizer: O,
    elbo: Elbo,
    learning_rate: f64,
}

impl<B, O> Svi<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<RgbdVae<B>, B>,
{
    pub fn new(model: RgbdVae<B>, optimizer: O, elbo: Elbo, learning_rate: f64) -> Self {
        Self {
            model,
            optimizer,
            elbo,
            learning_rate,
        }
    }

    /// Take one gradient step on a minibatch and return the detached loss.
    ///
    /// # Arguments
    /// * `x` – observed images `[Batch, 4, S, S]`, values in `[0, 1]`
    ///
    /// # Returns
    /// Negative ELBO summed over the batch. May be non-finite; callers decide
    /// what to do with that.
    pub fn step(&mut self, x: Tensor<B, 4>) -> f64 {
        let loss = self.elbo.loss(&self.model, x);
        let value = loss.clone().into_scalar().to_f64();

        // Backward pass & optimization step. The gradients are consumed here,
        // nothing accumulates into the next step.
        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &self.model);
        self.model = self
            .optimizer
            .step(self.learning_rate, self.model.clone(), grads);

        value
    }

    /// Loss of a minibatch under the evaluation-mode model, no update.
    ///
    /// Normalization layers use their running statistics here.
    pub fn evaluate_loss(&self, x: Tensor<B::InnerBackend, 4>) -> f64 {
        let model = self.model.valid();
        self.elbo.loss(&model, x).into_scalar().to_f64()
    }

    pub fn model(&self) -> &RgbdVae<B> {
        &self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn elbo(&self) -> Elbo {
        self.elbo
    }

    /// Replace model and optimizer state, e.g. after restoring a checkpoint.
    pub fn restore(&mut self, model: RgbdVae<B>, optimizer: O) {
        self.model = model;
        self.optimizer = optimizer;
    }

    pub fn into_parts(self) -> (RgbdVae<B>, O) {
        (self.model, self.optimizer)
    }
}
