use burn::tensor::{Distribution, Tensor, activation, backend::Backend};

const LN_2PI: f64 = 1.837_877_066_409_345_3;

/// Sum every dimension except the batch dimension, `[N, ...] → [N]`.
///
/// Dimension 0 is the batch plate for every density in this module; all
/// remaining dimensions form one event.
fn sum_event_dims<B: Backend, const D: usize>(t: Tensor<B, D>) -> Tensor<B, 1> {
    let batch_size = t.dims()[0];
    t.flatten::<2>(1, D - 1).sum_dim(1).reshape([batch_size])
}

// --- GAUSSIAN ---

/// Diagonal Gaussian over `[N, D]`, parameterized by mean and log-variance.
#[derive(Debug, Clone)]
pub struct DiagNormal<B: Backend> {
    pub loc: Tensor<B, 2>,
    pub log_var: Tensor<B, 2>,
}

impl<B: Backend> DiagNormal<B> {
    pub fn new(loc: Tensor<B, 2>, log_var: Tensor<B, 2>) -> Self {
        Self { loc, log_var }
    }

    /// `N(0, I)` with `batch_size` independent rows of dimension `dim`.
    pub fn standard(batch_size: usize, dim: usize, device: &B::Device) -> Self {
        Self {
            loc: Tensor::zeros([batch_size, dim], device),
            log_var: Tensor::zeros([batch_size, dim], device),
        }
    }

    /// Standard deviation, `exp(0.5 * log_var)`.
    pub fn scale(&self) -> Tensor<B, 2> {
        self.log_var.clone().mul_scalar(0.5).exp()
    }

    /// Reparameterized sample `loc + scale * eps`.
    ///
    /// `eps` is a fresh constant tensor, so gradients reach `loc` and
    /// `log_var` but never the noise.
    pub fn rsample(&self) -> Tensor<B, 2> {
        let std = self.scale();
        let eps = Tensor::random_like(&std, Distribution::Normal(0.0, 1.0));
        self.loc.clone() + eps * std
    }

    /// Sample without a gradient path.
    pub fn sample(&self) -> Tensor<B, 2> {
        self.rsample().detach()
    }

    /// Log-density of `value`, summed over the latent dimension: `[N, D] → [N]`.
    pub fn log_prob(&self, value: Tensor<B, 2>) -> Tensor<B, 1> {
        let diff = value - self.loc.clone();
        let inv_var = self.log_var.clone().neg().exp();
        let elementwise = (diff.powf_scalar(2.0) * inv_var + self.log_var.clone())
            .add_scalar(LN_2PI)
            .mul_scalar(-0.5);
        sum_event_dims(elementwise)
    }

    /// Closed-form `KL(self || N(0, I))` per example.
    ///
    /// ```text
    /// KL = 0.5 * Σ( exp(logvar) + mu^2 - logvar - 1 )
    /// ```
    pub fn kl_to_standard(&self) -> Tensor<B, 1> {
        let kl = (self.log_var.clone().exp() + self.loc.clone().powf_scalar(2.0)
            - self.log_var.clone())
        .sub_scalar(1.0)
        .mul_scalar(0.5);
        sum_event_dims(kl)
    }
}

// --- BERNOULLI ---

/// Independent Bernoulli variables over `[N, ...]`, stored as logits.
///
/// Logits keep `log_prob` finite even when `sigmoid(logits)` rounds to 0 or 1.
#[derive(Debug, Clone)]
pub struct Bernoulli<B: Backend, const D: usize> {
    pub logits: Tensor<B, D>,
}

impl<B: Backend, const D: usize> Bernoulli<B, D> {
    pub fn from_logits(logits: Tensor<B, D>) -> Self {
        Self { logits }
    }

    /// Success probabilities in `(0, 1)`.
    pub fn probs(&self) -> Tensor<B, D> {
        activation::sigmoid(self.logits.clone())
    }

    pub fn sample(&self) -> Tensor<B, D> {
        let probs = self.probs().detach();
        Tensor::random_like(&probs, Distribution::Uniform(0.0, 1.0))
            .lower(probs)
            .float()
    }

    /// `x * log σ(l) + (1 - x) * log σ(-l)`, summed over the event dims.
    ///
    /// Values in `[0, 1]` are accepted (continuous relaxation of the observation).
    pub fn log_prob(&self, value: Tensor<B, D>) -> Tensor<B, 1> {
        let log_p = activation::log_sigmoid(self.logits.clone());
        let log_not_p = activation::log_sigmoid(self.logits.clone().neg());
        let elementwise = value.clone() * log_p + value.neg().add_scalar(1.0) * log_not_p;
        sum_event_dims(elementwise)
    }
}
