// Batch streams over the normalized MNIST splits.
//
// The training stream repeats the split forever and draws from a shuffle
// buffer as large as the split, so any number of steps can be taken from it.
// The test stream is the split in order, cut into batches.

use ndarray::{Array2, ArrayView1, Axis};
use rand::Rng;

use crate::io::{NormalizedSample, IMAGE_SIZE};

pub struct Batch {
	/// matrix of shape (batch_len, 784)
	pub images: Array2<f32>,
	pub labels: Vec<u8>,
}
impl Batch {
	pub fn from_samples<'a>(samples: impl IntoIterator<Item = &'a NormalizedSample>) -> Self {
		let mut rows: Vec<ArrayView1<f32>> = Vec::new();
		let mut labels = Vec::new();
		for sample in samples {
			assert_eq!(sample.image.len(), IMAGE_SIZE);
			rows.push(sample.image.view());
			labels.push(sample.label);
		}
		let images = if rows.is_empty() {
			Array2::zeros((0, IMAGE_SIZE))
		} else {
			ndarray::stack(Axis(0), &rows).expect("rows share the image shape")
		};
		Self { images, labels }
	}

	pub fn len(&self) -> usize {
		self.labels.len()
	}
}

pub struct TrainStream<'a, R: Rng> {
	samples: &'a [NormalizedSample],
	batch_size: usize,
	/// indices into `samples` waiting to be drawn
	buffer: Vec<usize>,
	/// next index the repeated split feeds into the buffer
	cursor: usize,
	rng: R,
}
impl<'a, R: Rng> TrainStream<'a, R> {
	/// Repeat `samples` indefinitely, shuffle through a buffer of
	/// `buffer_size` elements and group into batches of `batch_size`.
	pub fn new(samples: &'a [NormalizedSample], batch_size: usize, buffer_size: usize, rng: R) -> Self {
		assert!(!samples.is_empty(), "cannot repeat an empty split");
		assert!(batch_size > 0 && buffer_size > 0);
		let mut stream = Self {
			samples,
			batch_size,
			buffer: Vec::with_capacity(buffer_size),
			cursor: 0,
			rng,
		};
		while stream.buffer.len() < buffer_size {
			let index = stream.next_source_index();
			stream.buffer.push(index);
		}
		stream
	}

	fn next_source_index(&mut self) -> usize {
		let index = self.cursor;
		self.cursor = (self.cursor + 1) % self.samples.len();
		index
	}

	/// Draw a random buffered element and refill its slot from the repeated split.
	fn next_sample_index(&mut self) -> usize {
		let slot = self.rng.random_range(0..self.buffer.len());
		let refill = self.next_source_index();
		std::mem::replace(&mut self.buffer[slot], refill)
	}
}
impl<R: Rng> Iterator for TrainStream<'_, R> {
	type Item = Batch;

	fn next(&mut self) -> Option<Batch> {
		let indices: Vec<usize> = (0..self.batch_size)
			.map(|_| self.next_sample_index())
			.collect();
		Some(Batch::from_samples(indices.iter().map(|&i| &self.samples[i])))
	}
}

/// In-order batches over `samples`; the last one holds the remainder.
pub fn test_batches(samples: &[NormalizedSample], batch_size: usize) -> impl Iterator<Item = Batch> + '_ {
	assert!(batch_size > 0);
	samples.chunks(batch_size).map(|chunk| Batch::from_samples(chunk))
}
