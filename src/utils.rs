use anyhow::{anyhow, Result};
use make_it_braille::BrailleImg;
use ndarray::{Array2, ArrayView1, Axis, Zip};
use rand::{distr::{Distribution, StandardUniform}, RngCore};
use serde::{Deserialize, Serialize};

use crate::io::IMAGE_WIDTH;

pub const CLASS_NAMES: [&str; 10] = [
	"Zero",
	"One",
	"Two",
	"Three",
	"Four",
	"Five",
	"Six",
	"Seven",
	"Eight",
	"Nine",
];

/// Probabilities are clipped to `[EPSILON, 1 - EPSILON]` before taking logs.
const EPSILON: f32 = 1e-7;

/// (pixels, label, guess)
type WrongAnswer<'a> = (ArrayView1<'a, f32>, u8, usize);

pub struct WrongAnswers<'a> {
	answers: Vec<WrongAnswer<'a>>,
}
impl<'a> WrongAnswers<'a> {
	pub fn new() -> Self {
		Self {
			answers: Vec::new(),
		}
	}

	pub fn push(&mut self, answer: WrongAnswer<'a>) {
		self.answers.push(answer);
	}

	pub fn len(&self) -> usize {
		self.answers.len()
	}

	pub fn dump(&self) -> Result<()> {
		for chunk in self.answers.chunks(5) {
			dump_wrong_chunk(chunk)?;
		}
		println!("Wrong guesses: {}", self.answers.len());
		Ok(())
	}
}

fn dump_wrong_chunk(chunk: &[WrongAnswer]) -> Result<()> {
	let mut img = BrailleImg::new((IMAGE_WIDTH * chunk.len()) as u32, IMAGE_WIDTH as u32);
	let mut labels: String = String::new();
	let mut guesses: String = String::new();
	for (i, (pixels, label, guess)) in chunk.iter().enumerate() {
		draw_image(&mut img, pixels, (i * IMAGE_WIDTH) as u32, 0)?;
		labels.push_str(&format!(" Label: {:?}      ", label));
		guesses.push_str(&format!("(Guess: {:?})     ", guess));
	}
	println!("{}", img.as_str(false, true));
	println!("{}", labels);
	println!("{}", guesses);
	Ok(())
}

/// Render one digit with the class the model picked for it.
pub fn dump_prediction(pixels: ArrayView1<f32>, guess: usize) -> Result<()> {
	let mut img = BrailleImg::new(IMAGE_WIDTH as u32, IMAGE_WIDTH as u32);
	draw_image(&mut img, &pixels, 0, 0)?;
	println!("{}", img.as_str(false, true));
	println!(" = {} ({})", guess, CLASS_NAMES[guess]);
	Ok(())
}

fn draw_image(img: &mut BrailleImg, pixels: &ArrayView1<f32>, x: u32, y: u32) -> Result<()> {
	for (i, val) in pixels.iter().enumerate() {
		let x1 = x + (i % IMAGE_WIDTH) as u32;
		let y1 = y + (i / IMAGE_WIDTH) as u32;
		img.set_dot(x1, y1, *val > 0.5)
			.map_err(|_| anyhow!("dot ({}, {}) outside the braille canvas", x1, y1))?;
	}
	Ok(())
}

#[derive(Clone, Copy)]
pub struct WeightInitializer {
	_f: fn(fan_in: usize, fan_out: usize, rng: &mut dyn RngCore) -> Vec<f32>,
}
impl WeightInitializer {
	/// Draw each weight uniformly from `[-limit, limit]` with
	/// `limit = sqrt(6 / (fan_in + fan_out))` (Glorot & Bengio).
	pub const GLOROT_UNIFORM: WeightInitializer = WeightInitializer {
		_f: |fan_in, fan_out, rng| {
			let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
			(0..fan_in * fan_out)
				.map(|_| {
					let u: f32 = StandardUniform.sample(rng);
					(2.0 * u - 1.0) * limit
				})
				.collect()
		},
	};

	#[inline]
	pub fn f(&self, fan_in: usize, fan_out: usize, rng: &mut dyn RngCore) -> Vec<f32> {
		(self._f)(fan_in, fan_out, rng)
	}
}
impl Default for WeightInitializer {
	fn default() -> Self {
		Self::GLOROT_UNIFORM
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
	Relu,
	Softmax,
}
impl Activation {
	pub fn apply(&self, z: &Array2<f32>) -> Array2<f32> {
		match self {
			Activation::Relu => z.mapv(relu),
			Activation::Softmax => softmax(z),
		}
	}
}

pub fn relu(z: f32) -> f32 {
	z.max(0.0)
}

pub fn relu_prime(z: f32) -> f32 {
	if z > 0.0 { 1.0 } else { 0.0 }
}

/// Row-wise softmax, shifted by the row max for stability.
pub fn softmax(z: &Array2<f32>) -> Array2<f32> {
	let mut out = z.clone();
	for mut row in out.axis_iter_mut(Axis(0)) {
		let max = row.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
		row.mapv_inplace(|x| (x - max).exp());
		let sum = row.sum();
		row.mapv_inplace(|x| x / sum);
	}
	out
}

/// Mean of `-ln p[label]` over the rows of `probs`.
pub fn sparse_categorical_cross_entropy(probs: &Array2<f32>, labels: &[u8]) -> f32 {
	assert_eq!(probs.nrows(), labels.len());
	let total: f32 = probs.axis_iter(Axis(0)).zip(labels)
		.map(|(row, &label)| -row[label as usize].clamp(EPSILON, 1.0 - EPSILON).ln())
		.sum();
	total / labels.len() as f32
}

/// Gradient of the mean cross-entropy with respect to the softmax logits.
pub fn sparse_categorical_cross_entropy_delta(probs: &Array2<f32>, labels: &[u8]) -> Array2<f32> {
	assert_eq!(probs.nrows(), labels.len());
	let mut delta = probs.clone();
	for (mut row, &label) in delta.axis_iter_mut(Axis(0)).zip(labels) {
		row[label as usize] -= 1.0;
	}
	delta / labels.len() as f32
}

pub fn argmax(row: ArrayView1<f32>) -> usize {
	row.iter().enumerate()
		.fold((0, f32::NEG_INFINITY), |best, (i, &x)| if x > best.1 { (i, x) } else { best })
		.0
}

/// Number of rows whose argmax equals the label.
pub fn count_correct(probs: &Array2<f32>, labels: &[u8]) -> usize {
	probs.axis_iter(Axis(0)).zip(labels)
		.filter(|(row, label)| argmax(row.view()) == **label as usize)
		.count()
}

/// `dz = da * relu'(z)`, elementwise.
pub fn relu_backward(da: Array2<f32>, z: &Array2<f32>) -> Array2<f32> {
	let mut dz = da;
	Zip::from(&mut dz).and(z).for_each(|d, &z| *d *= relu_prime(z));
	dz
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrainingOptions {
	pub epochs: usize,
	pub batch_size: usize,
	pub steps_per_epoch: usize,
}
impl TrainingOptions {
	/// Size each epoch so that every training sample is seen once.
	pub fn new(epochs: usize, batch_size: usize, num_train_examples: usize) -> Self {
		Self {
			epochs,
			batch_size,
			steps_per_epoch: steps_for(num_train_examples, batch_size),
		}
	}
}

/// `ceil(num_examples / batch_size)`
pub fn steps_for(num_examples: usize, batch_size: usize) -> usize {
	assert!(batch_size > 0);
	num_examples.div_ceil(batch_size)
}
