use burn::tensor::{Tensor, backend::Backend};

use crate::conv_model::RgbdVae;
use crate::distributions::{Bernoulli, DiagNormal};

/// Generative model `p(x, z) = p(z) p(x | z)` and variational guide `q(z | x)`
/// on top of the encoder and decoder networks.
impl<B: Backend> RgbdVae<B> {
    // --- MODEL ---

    /// Latent prior `N(0, I)`, one independent row per example.
    pub fn prior(&self, batch_size: usize, device: &B::Device) -> DiagNormal<B> {
        DiagNormal::standard(batch_size, self.latent_dim(), device)
    }

    /// Observation model `p(x | z)`: 4×S×S independent Bernoullis per example.
    pub fn likelihood(&self, z: Tensor<B, 2>) -> Bernoulli<B, 4> {
        Bernoulli::from_logits(self.decoder.logits(z))
    }

    /// `log p(z) + log p(x | z)` per example, with `x` the observed images.
    ///
    /// # Arguments
    /// * `x` – observed batch `[Batch, 4, S, S]`
    /// * `z` – latent batch `[Batch, latent_dim]`
    ///
    /// # Returns
    /// Tensor of shape `[Batch]`.
    pub fn log_joint(&self, x: Tensor<B, 4>, z: Tensor<B, 2>) -> Tensor<B, 1> {
        let [batch_size, _] = z.dims();
        let log_prior = self.prior(batch_size, &z.device()).log_prob(z.clone());
        let log_likelihood = self.likelihood(z).log_prob(x);
        log_prior + log_likelihood
    }

    // --- GUIDE ---

    /// Amortized posterior `q(z | x) = N(mu, exp(logvar))`.
    pub fn guide(&self, x: Tensor<B, 4>) -> DiagNormal<B> {
        let (mu, logvar) = self.encoder.forward(x);
        DiagNormal::new(mu, logvar)
    }

    // --- RECONSTRUCTION / GENERATION ---

    /// Encode, draw `z ~ q(z | x)`, and decode to Bernoulli parameters.
    pub fn reconstruct(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let z = self.guide(x).sample();
        self.decoder.forward(z)
    }

    /// Decode `count` draws from the prior.
    pub fn generate(&self, count: usize, device: &B::Device) -> Tensor<B, 4> {
        let z = self.prior(count, device).sample();
        self.decoder.forward(z)
    }
}
