use crate::artifacts::{Artifacts, MODEL_CONFIG_NAME, TRAINING_CONFIG_NAME, load_config_file};
use crate::backend::MainDevice;
use crate::dataset::MriSliceDataset;
use crate::error::{Error, Result};
use crate::model::SegNetConfig;
use crate::training::{self, TrainingConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const HELP: &str = "\
Left ventricle segmentation

Trains and evaluates a fully convolutional network segmenting the left ventricle
in cardiac MRI slices stored as TFRecord files.
Models, optimizers, progress and configurations are persisted in an artifacts directory.

USAGE:
    lv-segment [OPTIONS]

When no --training or --evaluation flag is provided, the program exits after handling configuration logic.

BEHAVIOR OVERVIEW
- The program manages two configurations: training config and model config.
- If --training-config or --model-config is given, the corresponding config is loaded from the specified file and saved to the artifacts directory (overwriting any existing file).
- If no explicit config file is provided for a component, the program attempts to load it from the artifacts directory; if absent, a default configuration is created and saved.
- The artifacts directory (--artifacts-path) is used to read/write model weights, optimizer state, progress and configurations. If not specified, a new temporary directory is created and its path is logged.
- With --remove-artifacts, any existing model, optimizer and progress files in the artifacts directory are deleted before training (if --training is active).
- An interrupted training resumes from the last checkpoint in the artifacts directory.
- If both --training and --evaluation are specified, the evaluation data is also scored after each epoch, and the trained model is evaluated at the end.

FLAGS:
    -h, --help                  Show this help message and exit

OPTIONS:
    -t, --training              Run training (creates or updates model / optimizer)
    -e, --evaluation            Compute the loss, Dice and IoU of the saved model on --eval-data
    -r, --remove-artifacts      Delete existing model, optimizer and progress files from the artifacts directory before training
                                (has no effect if --training is not used)
    -c, --training-config <PATH>
                                Load training configuration from this file (overrides any config in artifacts directory)
    -m, --model-config <PATH>   Load model configuration from this file (overrides any config in artifacts directory)
    -a, --artifacts-path <PATH>
                                Directory where configurations, model weights, and optimizer state are saved and loaded.
                                If the directory does not exist, it will be created.
                                Defaults to a newly created temporary directory.
        --train-data <PATH>     TFRecord file of training slices (required by --training)
        --eval-data <PATH>      TFRecord file of evaluation slices (required by --evaluation)
";

#[derive(Debug)]
pub struct AppArgs {
    pub training: bool,
    pub evaluation: bool,
    pub remove_artifacts: bool,
    pub training_config: Option<PathBuf>,
    pub model_config: Option<PathBuf>,
    pub artifacts_path: PathBuf,
    pub train_data: Option<PathBuf>,
    pub eval_data: Option<PathBuf>,
}

impl AppArgs {
    /// Parses the process arguments, `None` when help was requested.
    pub fn parse() -> Result<Option<Self>> {
        Self::parse_from(std::env::args_os().skip(1).collect())
    }

    pub fn parse_from(args: Vec<OsString>) -> Result<Option<Self>> {
        let mut pargs = pico_args::Arguments::from_vec(args);

        // Help has a higher priority and should be handled separately.
        if pargs.contains(["-h", "--help"]) {
            return Ok(None);
        }

        let artifacts_path =
            match pargs.opt_value_from_os_str(["-a", "--artifacts-path"], parse_path)? {
                Some(path) => path,
                None => new_artifacts_path()?,
            };
        let args = AppArgs {
            training_config: pargs
                .opt_value_from_os_str(["-c", "--training-config"], parse_path)?,
            model_config: pargs.opt_value_from_os_str(["-m", "--model-config"], parse_path)?,
            artifacts_path,
            train_data: pargs.opt_value_from_os_str("--train-data", parse_path)?,
            eval_data: pargs.opt_value_from_os_str("--eval-data", parse_path)?,
            // must parse flags after values
            training: pargs.contains(["-t", "--training"]),
            evaluation: pargs.contains(["-e", "--evaluation"]),
            remove_artifacts: pargs.contains(["-r", "--remove-artifacts"]),
        };

        let remaining = pargs.finish();
        if !remaining.is_empty() {
            return Err(Error::Config(format!("unused arguments: {remaining:?}")));
        }

        Ok(Some(args))
    }

    /// Creates the artifacts directory, removing old checkpoints if a fresh training was asked.
    pub fn prepare_artifacts<B: Backend>(&self) -> Result<Artifacts> {
        let artifacts = Artifacts::new(&self.artifacts_path);
        artifacts.create()?;
        if self.remove_artifacts && self.training {
            artifacts.remove_checkpoints::<B>()?;
        }
        Ok(artifacts)
    }

    pub fn load_training_config(&self, artifacts: &Artifacts) -> Result<Option<TrainingConfig>> {
        match &self.training_config {
            Some(path) => {
                log::info!("Loading training config from {path:?}");
                load_config_file(path).map(Some)
            }
            None => artifacts.load_config(TRAINING_CONFIG_NAME),
        }
    }

    pub fn load_model_config(&self, artifacts: &Artifacts) -> Result<Option<SegNetConfig>> {
        match &self.model_config {
            Some(path) => {
                log::info!("Loading model config from {path:?}");
                load_config_file(path).map(Some)
            }
            None => artifacts.load_config(MODEL_CONFIG_NAME),
        }
    }

    /// Neither training nor evaluation was asked for.
    pub fn is_idle(&self) -> bool {
        !self.training && !self.evaluation
    }
}

fn parse_path(s: &std::ffi::OsStr) -> Result<PathBuf, &'static str> {
    Ok(s.into())
}

fn new_artifacts_path() -> Result<PathBuf> {
    // e.g. /tmp/lv-segment-abcd-0
    let prefix = format!("{}-", std::env!("CARGO_PKG_NAME"));
    let tmp = temp_dir::TempDir::with_prefix(prefix)
        .map_err(|e| Error::io(std::env::temp_dir(), e))?
        .dont_delete_on_drop();
    let path = tmp.path().to_path_buf();
    log::info!("new artifacts directory: {path:?}");
    Ok(path)
}

fn required<'a>(path: &'a Option<PathBuf>, flag: &str, data_flag: &str) -> Result<&'a Path> {
    path.as_deref()
        .ok_or_else(|| Error::Config(format!("{flag} requires {data_flag} <PATH>")))
}

pub fn launch<B, AutoB>(app_args: &AppArgs) -> Result<()>
where
    B: Backend + MainDevice,
    AutoB: AutodiffBackend + MainDevice,
{
    let artifacts = app_args.prepare_artifacts::<AutoB>()?;

    // setup training and model configs
    let training_config = app_args
        .load_training_config(&artifacts)?
        .unwrap_or_else(|| TrainingConfig::new(training::optimizer_config()));
    let model_config = app_args
        .load_model_config(&artifacts)?
        .unwrap_or_else(SegNetConfig::new);
    // save configs
    artifacts.save_config(TRAINING_CONFIG_NAME, &training_config)?;
    artifacts.save_config(MODEL_CONFIG_NAME, &model_config)?;

    let load = |path: &Path| {
        MriSliceDataset::from_records(
            path,
            training_config.geometry.clone(),
            model_config.num_classes,
            training_config.pixel_scale,
        )
    };

    if app_args.training {
        let train_data = load(required(&app_args.train_data, "--training", "--train-data")?)?;
        let eval_data = app_args.eval_data.as_deref().map(load).transpose()?;
        let training_device = AutoB::main_device();
        training::train::<AutoB>(
            &training_config,
            &model_config,
            train_data,
            eval_data,
            &artifacts,
            training_device,
        )?;
    }

    if app_args.evaluation {
        let eval_data = load(required(&app_args.eval_data, "--evaluation", "--eval-data")?)?;
        let eval_device = B::main_device();
        training::evaluate_saved::<B>(
            &training_config,
            &model_config,
            eval_data,
            &artifacts,
            eval_device,
        )?;
    }

    if app_args.is_idle() {
        log::info!("neither training nor evaluation were enabled");
    }

    Ok(())
}
