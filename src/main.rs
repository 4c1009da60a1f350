#[cfg(feature = "blas")]
extern crate blas_src;

mod io;
mod network;
mod optim;
mod pipeline;
mod utils;

use anyhow::{ensure, Result};
use log::{info, log_enabled, Level};
use rand::{rngs::StdRng, SeedableRng};

use io::NormalizedSample;
use network::Network;
use optim::{Adam, AdamConfig};
use pipeline::{Batch, TrainStream};
use utils::TrainingOptions;

const BATCH_SIZE: usize = 32;
const EPOCHS: usize = 10;
const DATA_DIR: &str = "data/";
const MODEL_PATH: &str = "model.json.gz";
/// Test digits the reloaded model is checked against.
const HELD_OUT_LEN: usize = 5;

fn main() -> Result<()> {
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

	let data = io::import_images(DATA_DIR)?;
	let info = data.info();
	ensure!(info.num_train_examples > 0, "the training split is empty");
	let training_data: Vec<NormalizedSample> = data.training_data.iter().map(io::normalize).collect();
	let test_data: Vec<NormalizedSample> = data.test_data.iter().map(io::normalize).collect();

	let mut network = Network::mnist(&mut StdRng::from_os_rng());
	info!("Network {:?} with {} parameters", network.shape(), network.num_params());

	let options = TrainingOptions::new(EPOCHS, BATCH_SIZE, info.num_train_examples);
	let mut stream = TrainStream::new(&training_data, BATCH_SIZE, info.num_train_examples, StdRng::from_os_rng());
	let mut adam = Adam::new(AdamConfig::default());
	let summaries = network.fit(&mut stream, &options, &mut adam)?;
	if let Some(last) = summaries.last() {
		info!("Trained {} steps, final epoch loss {:.4}", adam.time(), last.loss);
	}

	let evaluation = network.evaluate(&test_data, BATCH_SIZE);
	info!(
		"Test loss {:.4}, accuracy {:.4} ({} steps)",
		evaluation.loss, evaluation.accuracy, evaluation.steps
	);
	println!("Test accuracy: {}", evaluation.accuracy);

	if log_enabled!(Level::Debug) {
		let wrongs = network.wrong_answers(&test_data);
		info!("{} test digits misclassified", wrongs.len());
		wrongs.dump()?;
	}

	network.save(MODEL_PATH)?;
	check_reload(&network, &test_data)
}

/// Reload the saved model and make sure it agrees with the one in memory.
fn check_reload(network: &Network, test_data: &[NormalizedSample]) -> Result<()> {
	let reloaded = Network::load(MODEL_PATH)?;
	let held_out = &test_data[..HELD_OUT_LEN.min(test_data.len())];
	let batch = Batch::from_samples(held_out);

	let deviation = (&network.predict(&batch.images) - &reloaded.predict(&batch.images))
		.fold(0.0f32, |max, d| max.max(d.abs()));
	ensure!(deviation < 1e-5, "reloaded model deviates by {} from the trained one", deviation);
	info!("Reloaded {} reproduces the trained predictions", MODEL_PATH);

	if log_enabled!(Level::Debug) {
		for sample in held_out {
			utils::dump_prediction(sample.image.view(), reloaded.classify(sample.image.view()))?;
		}
	}
	Ok(())
}
