use anyhow::{ensure, Result};
use log::info;
use mnist::MnistBuilder;
use ndarray::Array1;

pub const IMAGE_WIDTH: usize = 28;
pub const IMAGE_SIZE: usize = IMAGE_WIDTH * IMAGE_WIDTH;
pub const NUM_CLASSES: usize = 10;

const TRAIN_LEN: u32 = 60_000;
const TEST_LEN: u32 = 10_000;

#[cfg(not(feature = "download"))]
const DATA_FILES: [&str; 4] = [
	"train-images-idx3-ubyte",
	"train-labels-idx1-ubyte",
	"t10k-images-idx3-ubyte",
	"t10k-labels-idx1-ubyte",
];

/// A raw dataset sample: 784 row-major pixels in [0, 255] and its digit.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
	pub image: Vec<u8>,
	pub label: u8,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedSample {
	pub image: Array1<f32>,
	pub label: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DatasetInfo {
	pub num_train_examples: usize,
	pub num_test_examples: usize,
}

pub struct Dataset {
	pub training_data: Vec<Sample>,
	pub test_data: Vec<Sample>,
}
impl Dataset {
	/// Pair up the flat image and label buffers of both splits.
	pub fn from_raw(trn_img: &[u8], trn_lbl: &[u8], tst_img: &[u8], tst_lbl: &[u8]) -> Result<Self> {
		Ok(Self {
			training_data: split_samples("train", trn_img, trn_lbl)?,
			test_data: split_samples("test", tst_img, tst_lbl)?,
		})
	}

	pub fn info(&self) -> DatasetInfo {
		DatasetInfo {
			num_train_examples: self.training_data.len(),
			num_test_examples: self.test_data.len(),
		}
	}
}

fn split_samples(split: &str, images: &[u8], labels: &[u8]) -> Result<Vec<Sample>> {
	ensure!(
		images.len() == labels.len() * IMAGE_SIZE,
		"{} split has {} image bytes for {} labels",
		split, images.len(), labels.len()
	);
	images.chunks(IMAGE_SIZE).zip(labels)
		.map(|(image, &label)| {
			ensure!((label as usize) < NUM_CLASSES, "{} split has out of range label {}", split, label);
			Ok(Sample { image: image.to_vec(), label })
		})
		.collect()
}

/// Load the MNIST train and test splits from `base_path`.
///
/// Without the `download` feature the IDX files must already be extracted
/// there; the `mnist` crate panics on missing files, so their presence is
/// checked up front.
pub fn import_images(base_path: &str) -> Result<Dataset> {
	let mut builder = MnistBuilder::new();
	builder
		.label_format_digit()
		.training_set_length(TRAIN_LEN)
		.validation_set_length(0)
		.test_set_length(TEST_LEN)
		.base_path(base_path);

	#[cfg(feature = "download")]
	builder.download_and_extract();

	#[cfg(not(feature = "download"))]
	ensure_files_present(base_path)?;

	let mnist = builder.finalize();
	let dataset = Dataset::from_raw(&mnist.trn_img, &mnist.trn_lbl, &mnist.tst_img, &mnist.tst_lbl)?;
	let info = dataset.info();
	info!("Loaded MNIST: {} training / {} test samples", info.num_train_examples, info.num_test_examples);
	Ok(dataset)
}

#[cfg(not(feature = "download"))]
fn ensure_files_present(base_path: &str) -> Result<()> {
	use std::path::Path;

	for file in DATA_FILES.iter() {
		let path = Path::new(base_path).join(file);
		ensure!(
			path.exists(),
			"missing MNIST file {}: extract it there or build with the `download` feature",
			path.display()
		);
	}
	Ok(())
}

/// Scale pixel intensities from [0, 255] to [0, 1]; the label is untouched.
pub fn normalize(sample: &Sample) -> NormalizedSample {
	NormalizedSample {
		image: sample.image.iter().map(|&px| px as f32 / 255.0).collect(),
		label: sample.label,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn normalize_scales_every_intensity_into_unit_range() {
		for v in 0..=255u8 {
			let sample = Sample { image: vec![v; IMAGE_SIZE], label: 3 };
			let normalized = normalize(&sample);
			assert_eq!(normalized.label, 3);
			assert_eq!(normalized.image.len(), IMAGE_SIZE);
			for &x in normalized.image.iter() {
				assert_eq!(x, v as f32 / 255.0);
				assert!((0.0..=1.0).contains(&x));
			}
		}
	}

	#[test]
	fn from_raw_pairs_images_with_labels() {
		let mut trn_img = vec![0u8; IMAGE_SIZE * 3];
		trn_img[IMAGE_SIZE] = 255;
		let dataset = Dataset::from_raw(&trn_img, &[1, 2, 3], &vec![7u8; IMAGE_SIZE], &[9]).unwrap();

		assert_eq!(dataset.info(), DatasetInfo { num_train_examples: 3, num_test_examples: 1 });
		assert_eq!(dataset.training_data[1].label, 2);
		assert_eq!(dataset.training_data[1].image[0], 255);
		assert_eq!(dataset.test_data[0].image, vec![7u8; IMAGE_SIZE]);
	}

	#[test]
	fn from_raw_rejects_mismatched_split() {
		assert!(Dataset::from_raw(&vec![0u8; IMAGE_SIZE * 2], &[1], &[], &[]).is_err());
		assert!(Dataset::from_raw(&vec![0u8; IMAGE_SIZE], &[10], &[], &[]).is_err());
	}

	#[cfg(not(feature = "download"))]
	#[test]
	fn import_reports_missing_files() {
		let err = import_images("/nonexistent/mnist/").err().unwrap();
		assert!(err.to_string().contains("train-images-idx3-ubyte"));
	}
}
