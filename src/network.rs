// A feed-forward classifier for 28x28 digit images: dense ReLU hidden layers
// and a dense softmax output, trained with Adam on sparse categorical
// cross-entropy. Inputs are processed a batch at a time, one sample per row.

use std::{fs::File, io::{BufReader, BufWriter, Write}, path::Path};

use anyhow::{ensure, Context, Result};
use chrono::Local;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::RngCore;
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
	io::{NormalizedSample, IMAGE_SIZE, NUM_CLASSES},
	optim::Adam,
	pipeline::{test_batches, Batch},
	utils::{
		argmax, count_correct, relu_backward, sparse_categorical_cross_entropy,
		sparse_categorical_cross_entropy_delta, steps_for, Activation, TrainingOptions,
		WeightInitializer, WrongAnswers,
	},
};

/// Flattened input, three hidden layers of 64 and one output unit per digit.
pub const MNIST_SHAPE: [usize; 5] = [IMAGE_SIZE, 64, 64, 64, NUM_CLASSES];

const FORMAT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Layer {
	/// matrix of shape (inputs_len, neurons_len)
	pub weights: Array2<f32>,
	/// vector of length neurons_len
	pub biases: Array1<f32>,
	pub activation: Activation,
}
impl Layer {
	fn size(&self) -> usize {
		self.biases.len()
	}

	/// Returns (z, activation) for a batch of inputs.
	fn feedforward(&self, x: &Array2<f32>) -> (Array2<f32>, Array2<f32>) {
		assert_eq!(x.ncols(), self.weights.nrows());
		let z = x.dot(&self.weights) + &self.biases;
		let a = self.activation.apply(&z);
		(z, a)
	}
}

pub struct LayerGradient {
	pub weights: Array2<f32>,
	pub biases: Array1<f32>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EpochSummary {
	pub loss: f32,
	pub accuracy: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Evaluation {
	pub loss: f32,
	pub accuracy: f32,
	pub steps: usize,
}

#[derive(Serialize)]
struct ModelFileRef<'a> {
	format_version: u32,
	shape: &'a [usize],
	layers: &'a [Layer],
}

#[derive(Deserialize)]
struct ModelFile {
	format_version: u32,
	shape: Vec<usize>,
	layers: Vec<Layer>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Network {
	shape: Vec<usize>,
	layers: Vec<Layer>,
}

impl Network {
	/// The list ``shape`` contains the number of neurons in the respective
	/// layers of the network, input first. Every layer but the last uses
	/// ReLU, the last one softmax. Weights are drawn with
	/// ``WeightInitializer::GLOROT_UNIFORM`` and biases start at zero.
	pub fn new(shape: &[usize], rng: &mut dyn RngCore) -> Self {
		assert!(shape.len() >= 2, "a network needs an input and an output layer");
		let last = shape.len() - 2;
		Self {
			shape: shape.to_vec(),
			layers: shape.windows(2).enumerate()
				.map(|(i, w)| {
					let (inputs_len, neurons_len) = (w[0], w[1]);
					let weights_data = WeightInitializer::default().f(inputs_len, neurons_len, rng);
					Layer {
						weights: Array2::from_shape_vec((inputs_len, neurons_len), weights_data)
							.expect("initializer yields inputs_len * neurons_len weights"),
						biases: Array1::zeros(neurons_len),
						activation: if i == last { Activation::Softmax } else { Activation::Relu },
					}
				})
				.collect(),
		}
	}

	pub fn mnist(rng: &mut dyn RngCore) -> Self {
		Self::new(&MNIST_SHAPE, rng)
	}

	pub fn shape(&self) -> &[usize] {
		&self.shape
	}

	pub fn num_params(&self) -> usize {
		self.layers.iter()
			.map(|layer| layer.weights.len() + layer.biases.len())
			.sum()
	}

	/// Class probabilities, one row per input row.
	pub fn predict(&self, x: &Array2<f32>) -> Array2<f32> {
		let a = self.layers.iter()
			.fold(x.clone(), |a, layer| layer.feedforward(&a).1);
		assert_eq!(a.ncols(), self.shape[self.shape.len() - 1]);
		a
	}

	/// The most probable digit for a single image.
	pub fn classify(&self, image: ArrayView1<f32>) -> usize {
		let x = image.insert_axis(Axis(0)).to_owned();
		argmax(self.predict(&x).row(0))
	}

	/// Return the gradient of the mean batch loss for every layer,
	/// together with that loss and the output probabilities.
	fn backprop(&self, batch: &Batch) -> (Vec<LayerGradient>, f32, Array2<f32>) {
		// feedforward
		let mut activations = Vec::with_capacity(self.layers.len() + 1);
		activations.push(batch.images.clone());
		let mut zs: Vec<Array2<f32>> = Vec::with_capacity(self.layers.len());
		for layer in self.layers.iter() {
			let (z, a) = layer.feedforward(&activations[activations.len() - 1]);
			zs.push(z);
			activations.push(a);
		}
		let probs = activations.pop().expect("one activation per layer follows the input");
		let loss = sparse_categorical_cross_entropy(&probs, &batch.labels);

		// backward pass, from the output layer down
		let mut delta = sparse_categorical_cross_entropy_delta(&probs, &batch.labels);
		let mut reversed_nabla = Vec::with_capacity(self.layers.len());
		for l in (0..self.layers.len()).rev() {
			let inputs = &activations[l];
			reversed_nabla.push(LayerGradient {
				weights: inputs.t().dot(&delta),
				biases: delta.sum_axis(Axis(0)),
			});
			if l > 0 {
				assert_eq!(self.layers[l - 1].activation, Activation::Relu);
				delta = relu_backward(delta.dot(&self.layers[l].weights.t()), &zs[l - 1]);
				assert_eq!(delta.ncols(), self.layers[l - 1].size());
			}
		}
		reversed_nabla.reverse();
		(reversed_nabla, loss, probs)
	}

	/// One optimization step; returns the batch loss (before the update)
	/// and the number of correctly classified samples.
	pub fn train_on_batch(&mut self, batch: &Batch, optimizer: &mut Adam) -> (f32, usize) {
		let (nabla, loss, probs) = self.backprop(batch);
		optimizer.step(&mut self.layers, &nabla);
		(loss, count_correct(&probs, &batch.labels))
	}

	/// Train for ``options.epochs`` epochs of ``options.steps_per_epoch``
	/// batches drawn from ``stream``, logging loss and accuracy per epoch.
	pub fn fit(
		&mut self,
		stream: &mut impl Iterator<Item = Batch>,
		options: &TrainingOptions,
		optimizer: &mut Adam,
	) -> Result<Vec<EpochSummary>> {
		info!(
			"Training for {} epochs of {} steps (batch size {})",
			options.epochs, options.steps_per_epoch, options.batch_size
		);
		info!(" Epoch |  Loss  | Accuracy | Elapsed ");
		info!("-------|--------|----------|---------");

		let mut summaries = Vec::with_capacity(options.epochs);
		for epoch in 0..options.epochs {
			let t = Local::now();
			let (mut loss_sum, mut correct, mut seen) = (0.0f32, 0, 0);
			for step in 0..options.steps_per_epoch {
				let batch = stream.next()
					.with_context(|| format!("training stream ended at epoch {} step {}", epoch + 1, step))?;
				let (loss, batch_correct) = self.train_on_batch(&batch, optimizer);
				loss_sum += loss;
				correct += batch_correct;
				seen += batch.len();
			}

			let summary = EpochSummary {
				loss: loss_sum / options.steps_per_epoch.max(1) as f32,
				accuracy: correct as f32 / seen.max(1) as f32,
			};
			let elapsed = (Local::now() - t).num_milliseconds() as f64 / 1000.0;
			info!(" {:>5} | {:>6.4} | {:>7.2}% | {:>6.1}s", epoch + 1, summary.loss, summary.accuracy * 100.0, elapsed);
			summaries.push(summary);
		}
		Ok(summaries)
	}

	/// Sum of per-sample losses and number of correct guesses for one batch.
	fn score(&self, batch: &Batch) -> (f32, usize) {
		let probs = self.predict(&batch.images);
		let loss = sparse_categorical_cross_entropy(&probs, &batch.labels);
		(loss * batch.len() as f32, count_correct(&probs, &batch.labels))
	}

	/// One pass over ``test_data`` in batches of ``batch_size``, returning
	/// the per-sample mean loss and the accuracy.
	pub fn evaluate(&self, test_data: &[NormalizedSample], batch_size: usize) -> Evaluation {
		let steps = steps_for(test_data.len(), batch_size);
		let batches: Vec<Batch> = test_batches(test_data, batch_size).take(steps).collect();

		#[cfg(feature = "rayon")]
		let scores: Vec<(f32, usize)> = batches.par_iter().map(|batch| self.score(batch)).collect();
		#[cfg(not(feature = "rayon"))]
		let scores: Vec<(f32, usize)> = batches.iter().map(|batch| self.score(batch)).collect();

		let n = batches.iter().map(Batch::len).sum::<usize>().max(1) as f32;
		let (loss_sum, correct) = scores.into_iter()
			.fold((0.0, 0), |(loss, correct), (l, c)| (loss + l, correct + c));
		let evaluation = Evaluation { loss: loss_sum / n, accuracy: correct as f32 / n, steps };
		debug!("Evaluated {} samples in {} steps: {:?}", test_data.len(), steps, evaluation);
		evaluation
	}

	/// Test samples the network gets wrong, with its guess.
	pub fn wrong_answers<'a>(&self, test_data: &'a [NormalizedSample]) -> WrongAnswers<'a> {
		let mut wrongs = WrongAnswers::new();
		for sample in test_data {
			let guess = self.classify(sample.image.view());
			if guess != sample.label as usize {
				wrongs.push((sample.image.view(), sample.label, guess));
			}
		}
		wrongs
	}

	/// Write shape and weights to ``path`` as gzip-compressed JSON,
	/// replacing any existing file.
	pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
		let path = path.as_ref();
		let file = File::create(path)
			.with_context(|| format!("creating model file {}", path.display()))?;
		let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
		let model = ModelFileRef {
			format_version: FORMAT_VERSION,
			shape: &self.shape,
			layers: &self.layers,
		};
		serde_json::to_writer(&mut encoder, &model)
			.with_context(|| format!("serializing model to {}", path.display()))?;
		encoder.finish()?.flush()?;
		info!("Saved model to {}", path.display());
		Ok(())
	}

	pub fn load(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let file = File::open(path)
			.with_context(|| format!("opening model file {}", path.display()))?;
		let model: ModelFile = serde_json::from_reader(GzDecoder::new(BufReader::new(file)))
			.with_context(|| format!("reading model file {}", path.display()))?;

		ensure!(
			model.format_version == FORMAT_VERSION,
			"unsupported model format version {} in {}",
			model.format_version, path.display()
		);
		ensure!(
			model.shape.len() >= 2 && model.layers.len() == model.shape.len() - 1,
			"{} layers do not match shape {:?}",
			model.layers.len(), model.shape
		);
		let last = model.layers.len() - 1;
		for (i, (layer, w)) in model.layers.iter().zip(model.shape.windows(2)).enumerate() {
			ensure!(
				layer.weights.dim() == (w[0], w[1]) && layer.size() == w[1],
				"layer {} has weights {:?} and {} biases, expected {}x{}",
				i, layer.weights.dim(), layer.size(), w[0], w[1]
			);
			let expected = if i == last { Activation::Softmax } else { Activation::Relu };
			ensure!(layer.activation == expected, "layer {} uses {:?}, expected {:?}", i, layer.activation, expected);
		}

		Ok(Self { shape: model.shape, layers: model.layers })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use ndarray::Array;
	use rand::{rngs::StdRng, Rng, SeedableRng};

	use crate::{optim::AdamConfig, pipeline::TrainStream};

	fn random_samples(n: usize, rng: &mut StdRng) -> Vec<NormalizedSample> {
		(0..n)
			.map(|_| NormalizedSample {
				image: (0..IMAGE_SIZE).map(|_| rng.random::<f32>()).collect(),
				label: rng.random_range(0..10u8),
			})
			.collect()
	}

	/// Each digit lights up its own band of rows.
	fn separable_samples(n: usize) -> Vec<NormalizedSample> {
		(0..n)
			.map(|i| {
				let label = (i % 10) as u8;
				let mut image = Array1::<f32>::zeros(IMAGE_SIZE);
				let start = label as usize * 2 * 28;
				image.slice_mut(ndarray::s![start..start + 56]).fill(1.0);
				NormalizedSample { image, label }
			})
			.collect()
	}

	fn max_weight_diff(a: &Network, b: &Network) -> f32 {
		assert_eq!(a.shape(), b.shape());
		a.layers.iter().zip(&b.layers)
			.flat_map(|(x, y)| {
				let w = x.weights.iter().zip(&y.weights).map(|(p, q)| (p - q).abs());
				let b = x.biases.iter().zip(&y.biases).map(|(p, q)| (p - q).abs());
				w.chain(b).collect::<Vec<_>>()
			})
			.fold(0.0, f32::max)
	}

	fn temp_model_path(name: &str) -> std::path::PathBuf {
		std::env::temp_dir().join(format!("{}-{}.json.gz", name, std::process::id()))
	}

	#[test]
	fn mnist_network_has_expected_topology() {
		let network = Network::mnist(&mut StdRng::seed_from_u64(1));
		assert_eq!(network.shape(), &[784, 64, 64, 64, 10]);
		assert_eq!(network.num_params(), 784 * 64 + 64 + 2 * (64 * 64 + 64) + 64 * 10 + 10);
		assert_eq!(network.layers.iter().map(|l| l.activation).collect::<Vec<_>>(), vec![
			Activation::Relu, Activation::Relu, Activation::Relu, Activation::Softmax,
		]);
		assert!(network.layers.iter().all(|l| l.biases.iter().all(|&b| b == 0.0)));
	}

	#[test]
	fn output_rows_are_probability_distributions() {
		let mut rng = StdRng::seed_from_u64(2);
		let network = Network::mnist(&mut rng);
		let samples = random_samples(16, &mut rng);
		let batch = Batch::from_samples(&samples);

		let probs = network.predict(&batch.images);
		assert_eq!(probs.dim(), (16, 10));
		for row in probs.axis_iter(Axis(0)) {
			assert!((row.sum() - 1.0).abs() < 1e-5);
			assert!(row.iter().all(|&p| p >= 0.0));
		}
		assert!(network.classify(samples[0].image.view()) < 10);
	}

	#[test]
	fn output_layer_gradients_match_finite_differences() {
		let mut rng = StdRng::seed_from_u64(3);
		let network = Network::new(&[IMAGE_SIZE, 8, 4], &mut rng);
		let samples: Vec<NormalizedSample> = random_samples(6, &mut rng).into_iter()
			.map(|s| NormalizedSample { label: s.label % 4, ..s })
			.collect();
		let batch = Batch::from_samples(&samples);
		let (nabla, _, _) = network.backprop(&batch);

		let loss_of = |network: &Network| sparse_categorical_cross_entropy(&network.predict(&batch.images), &batch.labels);
		let h = 1e-2;
		for (i, j) in [(0, 0), (3, 1), (7, 3)] {
			let mut plus = network.clone();
			plus.layers[1].weights[[i, j]] += h;
			let mut minus = network.clone();
			minus.layers[1].weights[[i, j]] -= h;
			let numeric = (loss_of(&plus) - loss_of(&minus)) / (2.0 * h);
			assert!((numeric - nabla[1].weights[[i, j]]).abs() < 1e-3, "w[{},{}]: {} vs {}", i, j, numeric, nabla[1].weights[[i, j]]);
		}
		for j in 0..4 {
			let mut plus = network.clone();
			plus.layers[1].biases[j] += h;
			let mut minus = network.clone();
			minus.layers[1].biases[j] -= h;
			let numeric = (loss_of(&plus) - loss_of(&minus)) / (2.0 * h);
			assert!((numeric - nabla[1].biases[j]).abs() < 1e-3, "b[{}]: {} vs {}", j, numeric, nabla[1].biases[j]);
		}
		assert_eq!(nabla[0].weights.dim(), (IMAGE_SIZE, 8));
		assert_eq!(nabla[0].biases.len(), 8);
	}

	#[test]
	fn fit_reduces_loss_on_separable_digits() {
		let mut rng = StdRng::seed_from_u64(4);
		let samples = separable_samples(100);
		let mut network = Network::mnist(&mut rng);
		let before = network.evaluate(&samples, 32);

		let options = TrainingOptions::new(5, 10, samples.len());
		let mut stream = TrainStream::new(&samples, options.batch_size, samples.len(), StdRng::seed_from_u64(5));
		let mut adam = Adam::new(AdamConfig::default());
		let summaries = network.fit(&mut stream, &options, &mut adam).unwrap();

		assert_eq!(summaries.len(), 5);
		assert_eq!(adam.time(), 50);
		let after = network.evaluate(&samples, 32);
		assert!(after.loss < before.loss, "{:?} -> {:?}", before, after);
		assert!(summaries[4].loss < summaries[0].loss);
	}

	#[test]
	fn fit_fails_when_the_stream_runs_dry() {
		let mut rng = StdRng::seed_from_u64(6);
		let samples = random_samples(10, &mut rng);
		let mut network = Network::new(&[IMAGE_SIZE, 4, 10], &mut rng);
		let mut stream = test_batches(&samples, 4);
		let options = TrainingOptions::new(2, 4, samples.len());
		assert!(network.fit(&mut stream, &options, &mut Adam::new(AdamConfig::default())).is_err());
	}

	#[test]
	fn evaluate_reports_unit_interval_accuracy_over_all_steps() {
		let mut rng = StdRng::seed_from_u64(7);
		let samples = random_samples(70, &mut rng);
		let network = Network::mnist(&mut rng);
		let evaluation = network.evaluate(&samples, 32);

		assert_eq!(evaluation.steps, 3);
		assert!((0.0..=1.0).contains(&evaluation.accuracy));
		assert!(evaluation.loss > 0.0);
		// single-row and batched products may round differently on near ties
		let wrongs = network.wrong_answers(&samples);
		let expected = ((1.0 - evaluation.accuracy) * 70.0).round() as i64;
		assert!((wrongs.len() as i64 - expected).abs() <= 1);
	}

	#[test]
	fn reloaded_model_predicts_identically() {
		let mut rng = StdRng::seed_from_u64(8);
		let network = Network::mnist(&mut rng);
		let held_out = Batch::from_samples(&random_samples(5, &mut rng));
		let path = temp_model_path("reload");

		network.save(&path).unwrap();
		let reloaded = Network::load(&path).unwrap();
		std::fs::remove_file(&path).unwrap();

		assert!(max_weight_diff(&reloaded, &network) < 1e-6);
		let diff = &network.predict(&held_out.images) - &reloaded.predict(&held_out.images);
		assert!(diff.iter().all(|d| d.abs() < 1e-6));
	}

	#[test]
	fn save_overwrites_existing_file() {
		let path = temp_model_path("overwrite");
		std::fs::write(&path, b"stale").unwrap();

		let first = Network::new(&[IMAGE_SIZE, 4, 10], &mut StdRng::seed_from_u64(9));
		first.save(&path).unwrap();
		let second = Network::new(&[IMAGE_SIZE, 4, 10], &mut StdRng::seed_from_u64(10));
		second.save(&path).unwrap();
		let reloaded = Network::load(&path).unwrap();
		std::fs::remove_file(&path).unwrap();

		assert!(max_weight_diff(&reloaded, &second) < 1e-6);
		assert!(max_weight_diff(&reloaded, &first) > 1e-3);
	}

	#[test]
	fn load_rejects_inconsistent_shapes() {
		let path = temp_model_path("bad-shape");
		let mut network = Network::new(&[IMAGE_SIZE, 4, 10], &mut StdRng::seed_from_u64(11));
		network.layers[1].weights = Array::zeros((5, 10));
		network.save(&path).unwrap();
		let result = Network::load(&path);
		std::fs::remove_file(&path).unwrap();
		assert!(result.is_err());
	}
}
