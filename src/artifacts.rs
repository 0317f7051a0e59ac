use crate::backend::RecorderTy;
use crate::error::{Error, Result};
use crate::model::{SegNet, SegNetConfig};
use crate::training::SegOptimizer;
use burn::module::AutodiffModule;
use burn::optim::{Optimizer, SgdConfig};
use burn::prelude::*;
use burn::record::{FileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use std::path::{Path, PathBuf};

pub const TRAINING_CONFIG_NAME: &str = "training_config";
pub const MODEL_CONFIG_NAME: &str = "model_config";
pub const PROGRESS_NAME: &str = "progress";
pub const MODEL_NAME: &str = "model";
pub const OPTIM_NAME: &str = "optim";

/// How far a training run got, saved next to each checkpoint.
#[derive(Config, Debug, PartialEq)]
pub struct TrainingProgress {
    /// Optimizer steps taken so far.
    #[config(default = 0)]
    pub global_step: usize,
    /// Fully completed epochs.
    #[config(default = 0)]
    pub epoch: usize,
}

/// Directory holding the configurations, model weights, optimizer state and progress of a run.
#[derive(Debug, Clone)]
pub struct Artifacts {
    dir: PathBuf,
}

impl Artifacts {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn create(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| Error::io(&self.dir, e))
    }

    /// Removes previous checkpoints and progress so training starts over.
    pub fn remove_checkpoints<B: Backend>(&self) -> Result<()> {
        log::info!("Removing checkpoints from {:?}", self.dir);
        for path in [
            self.record_path::<B>(MODEL_NAME),
            self.record_path::<B>(OPTIM_NAME),
            self.config_path(PROGRESS_NAME),
        ] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(path, e)),
            }
        }
        Ok(())
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.dir.join(name).with_extension("json")
    }

    fn record_path<B: Backend>(&self, name: &str) -> PathBuf {
        let file_ext = <RecorderTy as FileRecorder<B>>::file_extension();
        self.dir.join(name).with_extension(file_ext)
    }

    fn exists(path: &Path) -> Result<bool> {
        std::fs::exists(path).map_err(|e| Error::io(path, e))
    }

    pub fn save_config(&self, name: &str, config: &impl Config) -> Result<()> {
        let path = self.config_path(name);
        log::info!("Saving {name} into {path:?}");
        config.save(&path).map_err(|e| Error::io(path, e))
    }

    pub fn load_config<C: Config>(&self, name: &str) -> Result<Option<C>> {
        let path = self.config_path(name);
        if !Self::exists(&path)? {
            return Ok(None);
        }
        log::info!("Loading {name} from {path:?}");
        Ok(Some(load_config_file(&path)?))
    }

    pub fn save_progress(&self, progress: &TrainingProgress) -> Result<()> {
        let path = self.config_path(PROGRESS_NAME);
        progress.save(&path).map_err(|e| Error::io(path, e))
    }

    pub fn load_progress(&self) -> Result<TrainingProgress> {
        let path = self.config_path(PROGRESS_NAME);
        if Self::exists(&path)? {
            load_config_file(&path)
        } else {
            Ok(TrainingProgress::new())
        }
    }

    pub fn save_model<B: Backend, M: Module<B>>(&self, model: &M) -> Result<()> {
        let path = self.dir.join(MODEL_NAME);
        log::info!("Saving model to {:?}", self.record_path::<B>(MODEL_NAME));
        model
            .clone()
            .save_file(path, &RecorderTy::new()) // ext added automatically
            .map_err(Error::from)
    }

    /// Loads the saved weights into `model`, or `None` if nothing was saved yet.
    pub fn load_model<B: Backend, M: Module<B>>(
        &self,
        model: M,
        device: &B::Device,
    ) -> Result<Option<M>> {
        if !Self::exists(&self.record_path::<B>(MODEL_NAME))? {
            return Ok(None);
        }
        log::info!("Loading model from {:?}", self.record_path::<B>(MODEL_NAME));
        let model = model.load_file(self.dir.join(MODEL_NAME), &RecorderTy::new(), device)?;
        Ok(Some(model))
    }

    pub fn load_or_init_model<B: Backend>(
        &self,
        model_config: &SegNetConfig,
        device: &B::Device,
    ) -> Result<SegNet<B>> {
        if let Some(model) = self.load_model::<B, _>(model_config.init(device), device)? {
            return Ok(model);
        }
        log::info!("Initializing new model");
        let model = model_config.init(device);
        self.save_model::<B, _>(&model)?;
        Ok(model)
    }

    pub fn save_optim<AutoB, AutoM, Optim>(&self, optim: &Optim) -> Result<()>
    where
        AutoB: AutodiffBackend,
        AutoM: AutodiffModule<AutoB>,
        Optim: Optimizer<AutoM, AutoB>,
    {
        log::info!("Saving optim to {:?}", self.record_path::<AutoB>(OPTIM_NAME));
        RecorderTy::new()
            .record(optim.to_record(), self.dir.join(OPTIM_NAME))?;
        Ok(())
    }

    /// Loads the saved state into `optim`, or `None` if nothing was saved yet.
    pub fn load_optim<AutoB, AutoM, Optim>(
        &self,
        optim: Optim,
        device: &AutoB::Device,
    ) -> Result<Option<Optim>>
    where
        AutoB: AutodiffBackend,
        AutoM: AutodiffModule<AutoB>,
        Optim: Optimizer<AutoM, AutoB>,
    {
        if !Self::exists(&self.record_path::<AutoB>(OPTIM_NAME))? {
            return Ok(None);
        }
        log::info!("Loading optim from {:?}", self.record_path::<AutoB>(OPTIM_NAME));
        let record = RecorderTy::new().load(self.dir.join(OPTIM_NAME), device)?;
        Ok(Some(optim.load_record(record)))
    }

    pub fn load_or_init_optim<AutoB: AutodiffBackend>(
        &self,
        optim_config: &SgdConfig,
        device: &AutoB::Device,
    ) -> Result<SegOptimizer<AutoB>> {
        let optim: SegOptimizer<AutoB> = optim_config.init();
        if let Some(optim) = self.load_optim::<AutoB, SegNet<AutoB>, _>(optim, device)? {
            return Ok(optim);
        }
        log::info!("Initializing new optim");
        let optim: SegOptimizer<AutoB> = optim_config.init();
        self.save_optim::<AutoB, SegNet<AutoB>, _>(&optim)?;
        Ok(optim)
    }
}

/// Loads a config file, as given on the command line.
pub fn load_config_file<C: Config>(path: &Path) -> Result<C> {
    C::load(path).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SegNetConfig;
    use crate::model::tests::tiny_config;
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::SgdConfig;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    #[test]
    fn missing_files_load_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = Artifacts::new(dir.path().join("run"));
        artifacts.create().unwrap();

        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);
        assert!(artifacts.load_model::<TestBackend, _>(model, &device).unwrap().is_none());
        assert!(
            artifacts
                .load_config::<SegNetConfig>(MODEL_CONFIG_NAME)
                .unwrap()
                .is_none()
        );
        assert_eq!(artifacts.load_progress().unwrap(), TrainingProgress::new());
    }

    #[test]
    fn configs_and_progress_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = Artifacts::new(dir.path());
        artifacts.create().unwrap();

        let config = tiny_config().with_dropout(0.25);
        artifacts.save_config(MODEL_CONFIG_NAME, &config).unwrap();
        let loaded: SegNetConfig = artifacts.load_config(MODEL_CONFIG_NAME).unwrap().unwrap();
        assert_eq!(loaded.conv1_filters, 4);
        assert_eq!(loaded.dropout, 0.25);

        let progress = TrainingProgress::new().with_global_step(42).with_epoch(3);
        artifacts.save_progress(&progress).unwrap();
        assert_eq!(artifacts.load_progress().unwrap(), progress);
    }

    #[test]
    fn model_and_optim_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = Artifacts::new(dir.path());
        artifacts.create().unwrap();
        let device = Default::default();

        let saved = tiny_config().init::<TestAutodiffBackend>(&device);
        artifacts.save_model::<TestAutodiffBackend, _>(&saved).unwrap();
        let optim = SgdConfig::new().init::<TestAutodiffBackend, crate::model::SegNet<_>>();
        artifacts.save_optim::<TestAutodiffBackend, crate::model::SegNet<_>, _>(&optim).unwrap();
        artifacts.save_progress(&TrainingProgress::new().with_global_step(7)).unwrap();

        let fresh = tiny_config().init::<TestAutodiffBackend>(&device);
        let loaded = artifacts
            .load_model::<TestAutodiffBackend, _>(fresh, &device)
            .unwrap()
            .unwrap();
        // compact records are half precision
        let diff = (saved.conv2.weight.val() - loaded.conv2.weight.val())
            .abs()
            .max()
            .into_scalar();
        assert!(diff < 1e-2);

        let optim = SgdConfig::new().init::<TestAutodiffBackend, crate::model::SegNet<_>>();
        let loaded = artifacts
            .load_optim::<TestAutodiffBackend, crate::model::SegNet<_>, _>(optim, &device)
            .unwrap();
        assert!(loaded.is_some());

        artifacts
            .remove_checkpoints::<TestAutodiffBackend>()
            .unwrap();
        let fresh = tiny_config().init::<TestAutodiffBackend>(&device);
        assert!(artifacts.load_model::<TestAutodiffBackend, _>(fresh, &device).unwrap().is_none());
        assert_eq!(artifacts.load_progress().unwrap().global_step, 0);
    }
}
