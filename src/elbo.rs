use anyhow::ensure;
use burn::tensor::{Tensor, backend::Backend};

use crate::conv_model::RgbdVae;

/// Monte Carlo estimator of the negative evidence lower bound.
///
/// For a minibatch `x` and `K = num_particles` reparameterized draws
/// `z_k ~ q(z | x)`:
///
/// ```text
/// loss = (1/K) Σ_k Σ_n [ log q(z_kn | x_n) − log p(x_n, z_kn) ]
/// ```
///
/// The batch plate is summed, so dividing an epoch total by the number of
/// examples gives the per-example loss. With `analytic_kl` the
/// `log q − log p(z)` part is replaced by the closed-form KL to the prior.
#[derive(Debug, Clone, Copy)]
pub struct Elbo {
    num_particles: usize,
    analytic_kl: bool,
}

impl Default for Elbo {
    fn default() -> Self {
        Self {
            num_particles: 1,
            analytic_kl: false,
        }
    }
}

impl Elbo {
    /// Fails if `num_particles` is zero.
    pub fn new(num_particles: usize) -> anyhow::Result<Self> {
        ensure!(num_particles > 0, "ELBO needs at least one particle");
        Ok(Self {
            num_particles,
            analytic_kl: false,
        })
    }

    pub fn with_analytic_kl(mut self, analytic_kl: bool) -> Self {
        self.analytic_kl = analytic_kl;
        self
    }

    pub fn num_particles(&self) -> usize {
        self.num_particles
    }

    /// Differentiable loss for one minibatch, shape `[1]`.
    pub fn loss<B: Backend>(&self, vae: &RgbdVae<B>, x: Tensor<B, 4>) -> Tensor<B, 1> {
        let guide = vae.guide(x.clone());

        let particles = (0..self.num_particles)
            .map(|_| {
                let z = guide.rsample();

                let per_example = if self.analytic_kl {
                    let log_likelihood = vae.likelihood(z).log_prob(x.clone());
                    guide.kl_to_standard() - log_likelihood
                } else {
                    let log_q = guide.log_prob(z.clone());
                    let log_p = vae.log_joint(x.clone(), z);
                    log_q - log_p
                };

                // sum over the batch plate
                per_example.sum()
            })
            .collect::<Vec<_>>();

        Tensor::cat(particles, 0).mean()
    }
}
