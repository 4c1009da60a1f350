use ndarray::{Array, Dimension, Ix1, Ix2, Zip};

use crate::network::{Layer, LayerGradient};

/// Adam configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdamConfig {
	pub learning_rate: f32,
	/// Decay of the first moment estimate.
	pub beta_1: f32,
	/// Decay of the second moment estimate.
	pub beta_2: f32,
	/// A value required for numerical stability.
	pub epsilon: f32,
}
impl Default for AdamConfig {
	fn default() -> Self {
		Self {
			learning_rate: 0.001,
			beta_1: 0.9,
			beta_2: 0.999,
			epsilon: 1e-7,
		}
	}
}

struct AdaptiveMomentum<D: Dimension> {
	moment_1: Array<f32, D>,
	moment_2: Array<f32, D>,
}
impl<D: Dimension> AdaptiveMomentum<D> {
	fn zeros(dim: D) -> Self {
		Self {
			moment_1: Array::zeros(dim.clone()),
			moment_2: Array::zeros(dim),
		}
	}
}

struct LayerState {
	weights: AdaptiveMomentum<Ix2>,
	biases: AdaptiveMomentum<Ix1>,
}

/// Adam optimizer as described in [Adam: A Method for Stochastic Optimization](https://arxiv.org/pdf/1412.6980.pdf),
/// with the bias correction folded into the step size.
pub struct Adam {
	config: AdamConfig,
	/// number of steps taken
	time: i32,
	/// created on the first step, one entry per layer
	states: Vec<LayerState>,
}

impl Adam {
	pub fn new(config: AdamConfig) -> Self {
		Self {
			config,
			time: 0,
			states: Vec::new(),
		}
	}

	pub fn time(&self) -> i32 {
		self.time
	}

	/// Apply one update to every layer from its gradient.
	pub fn step(&mut self, layers: &mut [Layer], gradients: &[LayerGradient]) {
		assert_eq!(layers.len(), gradients.len());
		if self.states.is_empty() {
			self.states = layers.iter()
				.map(|layer| LayerState {
					weights: AdaptiveMomentum::zeros(layer.weights.raw_dim()),
					biases: AdaptiveMomentum::zeros(layer.biases.raw_dim()),
				})
				.collect();
		}
		assert_eq!(self.states.len(), layers.len());

		self.time += 1;
		let AdamConfig { learning_rate, beta_1, beta_2, .. } = self.config;
		let alpha = learning_rate * (1.0 - beta_2.powi(self.time)).sqrt() / (1.0 - beta_1.powi(self.time));

		for ((layer, gradient), state) in layers.iter_mut().zip(gradients).zip(self.states.iter_mut()) {
			update(&mut layer.weights, &gradient.weights, &mut state.weights, alpha, &self.config);
			update(&mut layer.biases, &gradient.biases, &mut state.biases, alpha, &self.config);
		}
	}
}

fn update<D: Dimension>(
	param: &mut Array<f32, D>,
	grad: &Array<f32, D>,
	momentum: &mut AdaptiveMomentum<D>,
	alpha: f32,
	config: &AdamConfig,
) {
	assert_eq!(param.shape(), grad.shape());
	Zip::from(param)
		.and(grad)
		.and(&mut momentum.moment_1)
		.and(&mut momentum.moment_2)
		.for_each(|p, &g, m, v| {
			*m += (g - *m) * (1.0 - config.beta_1);
			*v += (g * g - *v) * (1.0 - config.beta_2);
			*p -= *m * alpha / (v.sqrt() + config.epsilon);
		});
}
