use crate::artifacts::{Artifacts, TrainingProgress};
use crate::dataset::{ImageGeometry, MriBatch, MriBatcher, MriSliceDataset, PIXEL_SCALE};
use crate::error::{Error, Result};
use crate::loss::{PixelCrossEntropyLoss, PixelCrossEntropyLossConfig};
use crate::metric::{LV_CLASS, OverlapCounts, OverlapInput, OverlapMetric};
use crate::model::{SegNet, SegNetConfig};
use crate::schedule::{ExponentialDecay, ExponentialDecayConfig};
use burn::data::dataloader::{DataLoader, DataLoaderBuilder, Progress};
use burn::data::dataset::Dataset;
use burn::module::AutodiffModule;
use burn::nn::loss::Reduction;
use burn::optim::{GradientsParams, Optimizer, Sgd, SgdConfig, adaptor::OptimizerAdaptor};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::train::metric::{Adaptor, LossInput, LossMetric, Metric, MetricMetadata, Numeric};
use std::fmt;
use std::sync::Arc;

pub type SegOptimizer<AutoB> =
    OptimizerAdaptor<Sgd<<AutoB as AutodiffBackend>::InnerBackend>, SegNet<AutoB>, AutoB>;

pub type Dataloader<B> = Arc<dyn DataLoader<B, MriBatch<B>>>;

#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub optimizer: SgdConfig,
    #[config(default = "ExponentialDecayConfig::new()")]
    pub schedule: ExponentialDecayConfig,
    #[config(default = "PixelCrossEntropyLossConfig::new()")]
    pub loss: PixelCrossEntropyLossConfig,
    #[config(default = 1)]
    pub num_epochs: usize,
    #[config(default = 1)]
    pub batch_size: usize,
    #[config(default = 2)]
    pub num_workers: usize,
    #[config(default = 0)]
    pub seed: u64,
    /// Steps between progress logs, 0 disables them.
    #[config(default = 100)]
    pub log_interval: usize,
    /// Steps between checkpoints, 0 only saves at the end of each epoch.
    #[config(default = 1000)]
    pub checkpoint_interval: usize,
    #[config(default = "ImageGeometry::new()")]
    pub geometry: ImageGeometry,
    #[config(default = "PIXEL_SCALE")]
    pub pixel_scale: f32,
    #[config(default = "LV_CLASS")]
    pub foreground_class: usize,
}

impl TrainingConfig {
    pub fn validate(&self, model_config: &SegNetConfig) -> Result<()> {
        if self.num_epochs == 0 {
            return Err(Error::Config("num_epochs must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.foreground_class >= model_config.num_classes {
            return Err(Error::Config(format!(
                "foreground class {} is not one of the {} classes",
                self.foreground_class, model_config.num_classes
            )));
        }
        model_config.validate()?;
        model_config.validate_geometry(&self.geometry)?;
        self.loss.validate(model_config.num_classes)?;
        self.schedule.init().map(|_| ())
    }

    fn check_dataset(&self, dataset: &MriSliceDataset) -> Result<()> {
        if dataset.geometry() != &self.geometry {
            return Err(Error::Config(format!(
                "dataset images are {}x{}, the configuration expects {}x{}",
                dataset.geometry().height,
                dataset.geometry().width,
                self.geometry.height,
                self.geometry.width
            )));
        }
        if dataset.is_empty() {
            return Err(Error::Config("the dataset has no slices".into()));
        }
        Ok(())
    }
}

pub fn optimizer_config() -> SgdConfig {
    SgdConfig::new()
}

pub struct SegmentationOutput<B: Backend> {
    /// # Shape
    /// [1]
    pub loss: Tensor<B, 1>,
    /// # Shape
    /// [batch_size, num_classes, height, width]
    pub output: Tensor<B, 4>,
    /// # Shape
    /// [batch_size, height, width]
    pub targets: Tensor<B, 3, Int>,
}

impl<B: Backend> Adaptor<LossInput<B>> for SegmentationOutput<B> {
    fn adapt(&self) -> LossInput<B> {
        // one entry per slice, so the running loss weights batches by their size
        let [batch_size, _height, _width] = self.targets.dims();
        LossInput::new(self.loss.clone().repeat_dim(0, batch_size))
    }
}

impl<B: Backend> Adaptor<OverlapInput<B>> for SegmentationOutput<B> {
    fn adapt(&self) -> OverlapInput<B> {
        OverlapInput::from_logits(self.output.clone(), self.targets.clone())
    }
}

impl<B: Backend> SegNet<B> {
    pub fn forward_segmentation(
        &self,
        batch: MriBatch<B>,
        criterion: &PixelCrossEntropyLoss,
    ) -> SegmentationOutput<B> {
        let output = self.forward(batch.images);
        let loss = criterion.forward(output.clone(), batch.targets.clone(), Reduction::Mean);
        SegmentationOutput {
            loss,
            output,
            targets: batch.targets,
        }
    }
}

/// Mean loss and foreground overlap over a whole dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationReport {
    pub loss: f64,
    pub counts: OverlapCounts,
    pub num_slices: usize,
}

impl EvaluationReport {
    pub fn dice(&self) -> Option<f64> {
        self.counts.dice()
    }

    pub fn iou(&self) -> Option<f64> {
        self.counts.iou()
    }
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} slices, Loss {:.4}, Dice {}, IoU {} (intersection {}, label {}, predicted {})",
            self.num_slices,
            self.loss,
            score(self.dice()),
            score(self.iou()),
            self.counts.intersection,
            self.counts.label,
            self.counts.predicted,
        )
    }
}

pub fn dataloader<B: Backend>(
    dataset: MriSliceDataset,
    config: &TrainingConfig,
    shuffle: bool,
    device: &B::Device,
) -> Dataloader<B> {
    let builder = DataLoaderBuilder::new(MriBatcher::new(config.geometry.clone()))
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .set_device(device.clone());
    let builder = if shuffle {
        builder.shuffle(config.seed)
    } else {
        builder
    };
    builder.build(dataset)
}

/// Trains the model stored in `artifacts`, starting from fresh weights when there is none.
///
/// Checkpoints and progress are written back to `artifacts`, so an interrupted run
/// resumes with the epoch that didn't complete and keeps its learning-rate schedule.
pub fn train<AutoB: AutodiffBackend>(
    training_config: &TrainingConfig,
    model_config: &SegNetConfig,
    train_data: MriSliceDataset,
    eval_data: Option<MriSliceDataset>,
    artifacts: &Artifacts,
    device: AutoB::Device,
) -> Result<SegNet<AutoB>> {
    training_config.validate(model_config)?;
    training_config.check_dataset(&train_data)?;
    if let Some(eval_data) = &eval_data {
        training_config.check_dataset(eval_data)?;
    }

    AutoB::seed(&device, training_config.seed);

    let mut model = artifacts.load_or_init_model::<AutoB>(model_config, &device)?;
    let mut optim = artifacts.load_or_init_optim::<AutoB>(&training_config.optimizer, &device)?;
    let mut progress = artifacts.load_progress()?;
    let mut schedule = training_config
        .schedule
        .init()?
        .with_global_step(progress.global_step);
    let criterion = training_config.loss.init();

    let dataloader_train = dataloader::<AutoB>(train_data, training_config, true, &device);
    let dataloader_eval = eval_data
        .map(|data| dataloader::<AutoB::InnerBackend>(data, training_config, false, &device));
    let mut metric_meta = MetricMetadata {
        progress: Progress::new(0, dataloader_train.num_items()),
        epoch: progress.epoch,
        epoch_total: training_config.num_epochs,
        iteration: progress.global_step,
        lr: None,
    };

    if progress.epoch >= training_config.num_epochs {
        log::info!(
            "All {} epochs already completed (step {})",
            training_config.num_epochs,
            progress.global_step
        );
        return Ok(model);
    }

    log::info!(
        "Starting training at epoch {}, step {}",
        progress.epoch + 1,
        progress.global_step
    );
    for epoch in progress.epoch + 1..training_config.num_epochs + 1 {
        metric_meta.epoch = epoch;
        model = epoch_train(
            &dataloader_train,
            model,
            &mut optim,
            &mut schedule,
            &criterion,
            training_config,
            &mut progress,
            &mut metric_meta,
            artifacts,
        )?;

        progress.epoch = epoch;
        save_checkpoint(artifacts, &model, &optim, &progress)?;

        if let Some(dataloader_eval) = &dataloader_eval {
            let report = evaluate(
                &model.valid(),
                dataloader_eval,
                &criterion,
                training_config.foreground_class,
            );
            log::info!(
                "Epoch {epoch}/{}, Evaluation: {report}",
                training_config.num_epochs
            );
        }
    }
    log::info!("Training finished at step {}", progress.global_step);

    Ok(model)
}

fn save_checkpoint<AutoB: AutodiffBackend>(
    artifacts: &Artifacts,
    model: &SegNet<AutoB>,
    optim: &SegOptimizer<AutoB>,
    progress: &TrainingProgress,
) -> Result<()> {
    artifacts.save_model::<AutoB, _>(model)?;
    artifacts.save_optim::<AutoB, SegNet<AutoB>, _>(optim)?;
    artifacts.save_progress(progress)
}

#[allow(clippy::too_many_arguments)]
fn epoch_train<AutoB: AutodiffBackend>(
    dataloader: &Dataloader<AutoB>,
    mut model: SegNet<AutoB>,
    optim: &mut SegOptimizer<AutoB>,
    schedule: &mut ExponentialDecay,
    criterion: &PixelCrossEntropyLoss,
    config: &TrainingConfig,
    progress: &mut TrainingProgress,
    metric_meta: &mut MetricMetadata,
    artifacts: &Artifacts,
) -> Result<SegNet<AutoB>> {
    let num_batches = dataloader.num_items().div_ceil(config.batch_size);
    let mut loss_metric = LossMetric::<AutoB>::new();
    // only updated on logged steps, the argmax isn't needed otherwise
    let mut overlap_metric = OverlapMetric::<AutoB>::new(config.foreground_class);
    metric_meta.progress = Progress::new(0, dataloader.num_items());

    for (b, batch) in dataloader.iter().enumerate() {
        let [batch_size, _channels, _height, _width] = batch.images.dims();
        if b == 0 {
            log::debug!(
                "images {:?}, targets {:?}",
                batch.images.dims(),
                batch.targets.dims()
            );
        }

        let lr = schedule.step();
        metric_meta.iteration += 1;
        metric_meta.progress.items_processed += batch_size;
        metric_meta.lr = Some(lr);

        let output = model.forward_segmentation(batch, criterion);
        if b == 0 {
            log::debug!("logits {:?}", output.output.dims());
        }
        loss_metric.update(&output.adapt(), metric_meta);

        let log_step = config.log_interval > 0 && schedule.global_step() % config.log_interval == 0;
        if log_step {
            overlap_metric.update(&output.adapt(), metric_meta);
        }

        let grads = output.loss.backward();
        let grads = GradientsParams::from_grads(grads, &model);
        model = optim.step(lr, model, grads);
        progress.global_step = schedule.global_step();

        if log_step {
            log::info!(
                "Epoch {}/{}, Batch {:0>4}/{num_batches}, Step {}, LR {lr:.3e}, \
                 Loss {:.4}, Avg Loss {:.4}, Dice {}",
                metric_meta.epoch,
                metric_meta.epoch_total,
                b + 1,
                progress.global_step,
                loss_metric.value().current(),
                loss_metric.running_value().current(),
                score(overlap_metric.last_counts().dice()),
            );
        }

        if config.checkpoint_interval > 0 && progress.global_step % config.checkpoint_interval == 0
        {
            save_checkpoint(artifacts, &model, optim, progress)?;
        }
    }

    if overlap_metric.num_batches() > 0 {
        log::info!(
            "Epoch {}/{}, Avg Loss {:.4}, Logged Dice {:.4}",
            metric_meta.epoch,
            metric_meta.epoch_total,
            loss_metric.running_value().current(),
            overlap_metric.running_value().current(),
        );
    } else {
        log::info!(
            "Epoch {}/{}, Avg Loss {:.4}",
            metric_meta.epoch,
            metric_meta.epoch_total,
            loss_metric.running_value().current(),
        );
    }

    Ok(model)
}

fn score(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_owned(), |v| format!("{v:.4}"))
}

/// Runs the model over every batch, accumulating the loss and the overlap counts.
pub fn evaluate<B: Backend>(
    model: &SegNet<B>,
    dataloader: &Dataloader<B>,
    criterion: &PixelCrossEntropyLoss,
    foreground_class: usize,
) -> EvaluationReport {
    let mut metric_meta = MetricMetadata {
        progress: Progress::new(0, dataloader.num_items()),
        epoch: 1,
        epoch_total: 1,
        iteration: 0,
        lr: None,
    };
    let mut loss_metric = LossMetric::<B>::new();
    let mut overlap_metric = OverlapMetric::<B>::new(foreground_class);

    for batch in dataloader.iter() {
        let [batch_size, _channels, _height, _width] = batch.images.dims();
        metric_meta.iteration += 1;
        metric_meta.progress.items_processed += batch_size;

        let output = model.forward_segmentation(batch, criterion);
        loss_metric.update(&output.adapt(), &metric_meta);
        overlap_metric.update(&output.adapt(), &metric_meta);
    }

    let num_slices = metric_meta.progress.items_processed;
    EvaluationReport {
        loss: if num_slices > 0 {
            loss_metric.running_value().current()
        } else {
            0.0
        },
        counts: overlap_metric.counts(),
        num_slices,
    }
}

/// Evaluates the model saved in `artifacts` on `eval_data`.
pub fn evaluate_saved<B: Backend>(
    training_config: &TrainingConfig,
    model_config: &SegNetConfig,
    eval_data: MriSliceDataset,
    artifacts: &Artifacts,
    device: B::Device,
) -> Result<EvaluationReport> {
    training_config.validate(model_config)?;
    training_config.check_dataset(&eval_data)?;

    let model = artifacts
        .load_model::<B, _>(model_config.init(&device), &device)?
        .ok_or_else(|| Error::MissingModel(artifacts.dir().to_path_buf()))?;
    let criterion = training_config.loss.init();
    let dataloader = dataloader::<B>(eval_data, training_config, false, &device);

    let report = evaluate(
        &model,
        &dataloader,
        &criterion,
        training_config.foreground_class,
    );
    log::info!("Evaluation: {report}");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::square_slice;
    use crate::model::tests::tiny_config;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn geometry() -> ImageGeometry {
        ImageGeometry::new().with_height(32).with_width(32)
    }

    fn dataset(num_slices: usize) -> MriSliceDataset {
        let geometry = geometry();
        let records = (0..num_slices)
            .map(|i| square_slice(&geometry, 64 * i as i64))
            .collect::<Vec<_>>();
        MriSliceDataset::from_record_bytes(records, geometry, 2, PIXEL_SCALE).unwrap()
    }

    fn config() -> TrainingConfig {
        TrainingConfig::new(optimizer_config())
            .with_schedule(
                ExponentialDecayConfig::new()
                    .with_initial_lr(0.01)
                    .with_decay_steps(2)
                    .with_decay_rate(0.9),
            )
            .with_geometry(geometry())
            .with_batch_size(2)
            .with_num_workers(1)
            .with_log_interval(1)
            .with_checkpoint_interval(3)
    }

    #[test]
    fn rejects_inconsistent_configs() {
        let model_config = tiny_config();
        assert!(config().validate(&model_config).is_ok());
        assert!(matches!(
            config().with_num_epochs(0).validate(&model_config),
            Err(Error::Config(_))
        ));
        assert!(config().with_batch_size(0).validate(&model_config).is_err());
        assert!(config().with_foreground_class(2).validate(&model_config).is_err());
        assert!(matches!(
            config()
                .with_geometry(ImageGeometry::new().with_height(30).with_width(32))
                .validate(&model_config),
            Err(Error::Geometry { .. })
        ));
        let weighted = |weights: Vec<f32>| {
            config().with_loss(PixelCrossEntropyLossConfig::new().with_class_weights(Some(weights)))
        };
        assert!(matches!(
            weighted(vec![1.0]).validate(&model_config),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            weighted(vec![0.0, 0.0]).validate(&model_config),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            config().validate(&tiny_config().with_dropout(1.5)),
            Err(Error::Config(_))
        ));

        let other_geometry = ImageGeometry::new().with_height(16).with_width(16);
        let records = vec![square_slice(&other_geometry, 0)];
        let data =
            MriSliceDataset::from_record_bytes(records, other_geometry, 2, PIXEL_SCALE).unwrap();
        assert!(config().check_dataset(&data).is_err());
    }

    #[test]
    fn trains_checkpoints_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = Artifacts::new(dir.path());
        artifacts.create().unwrap();
        let device = Default::default();
        let model_config = tiny_config();

        // 5 slices in batches of 2: 3 steps per epoch
        let config = config().with_num_epochs(2);
        train::<TestAutodiffBackend>(
            &config,
            &model_config,
            dataset(5),
            Some(dataset(2)),
            &artifacts,
            device,
        )
        .unwrap();

        let progress = artifacts.load_progress().unwrap();
        assert_eq!(progress, TrainingProgress::new().with_global_step(6).with_epoch(2));

        // already complete, nothing more happens
        train::<TestAutodiffBackend>(&config, &model_config, dataset(5), None, &artifacts, device)
            .unwrap();
        assert_eq!(artifacts.load_progress().unwrap().global_step, 6);

        // one more epoch continues from the saved step
        let config = config.with_num_epochs(3);
        train::<TestAutodiffBackend>(&config, &model_config, dataset(5), None, &artifacts, device)
            .unwrap();
        assert_eq!(
            artifacts.load_progress().unwrap(),
            TrainingProgress::new().with_global_step(9).with_epoch(3)
        );
    }

    #[test]
    fn evaluates_the_saved_model() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = Artifacts::new(dir.path());
        artifacts.create().unwrap();
        let device = Default::default();
        let model_config = tiny_config();
        let config = config();

        assert!(matches!(
            evaluate_saved::<TestBackend>(&config, &model_config, dataset(3), &artifacts, device),
            Err(Error::MissingModel(_))
        ));

        train::<TestAutodiffBackend>(&config, &model_config, dataset(4), None, &artifacts, device)
            .unwrap();
        let report =
            evaluate_saved::<TestBackend>(&config, &model_config, dataset(3), &artifacts, device)
                .unwrap();

        assert_eq!(report.num_slices, 3);
        assert!(report.loss.is_finite() && report.loss > 0.0);
        // the centered square is a quarter of each 32x32 slice
        assert_eq!(report.counts.label, 3 * 16 * 16);
        assert!(report.counts.intersection <= report.counts.label);
        assert!(report.counts.intersection <= report.counts.predicted);
        if let Some(dice) = report.dice() {
            assert!((0.0..=1.0).contains(&dice));
        }
    }

    #[test]
    fn evaluation_loss_is_a_per_slice_mean() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);
        let criterion = PixelCrossEntropyLossConfig::new().init();
        let data = dataset(3);

        // batches of 2 and 1 slices
        let batched = dataloader::<TestBackend>(dataset(3), &config(), false, &device);
        let report = evaluate(&model, &batched, &criterion, LV_CLASS);

        let single = dataloader::<TestBackend>(data, &config().with_batch_size(1), false, &device);
        let per_slice = evaluate(&model, &single, &criterion, LV_CLASS);

        assert_eq!(report.num_slices, 3);
        assert_eq!(report.counts, per_slice.counts);
        assert!((report.loss - per_slice.loss).abs() < 1e-5, "{report} vs {per_slice}");
    }

    #[test]
    fn sgd_steps_lower_the_loss_on_a_fixed_batch() {
        let device = Default::default();
        TestAutodiffBackend::seed(&device, 0);
        let mut model = tiny_config().init::<TestAutodiffBackend>(&device);
        let mut optim: SegOptimizer<TestAutodiffBackend> = optimizer_config().init();
        let criterion = PixelCrossEntropyLossConfig::new().init();

        let data = dataset(2);
        let items = vec![data.get(0).unwrap(), data.get(1).unwrap()];
        let batcher = MriBatcher::new(geometry());
        let batch: MriBatch<TestAutodiffBackend> =
            burn::data::dataloader::batcher::Batcher::batch(&batcher, items, &device);

        let mut losses = Vec::new();
        for _ in 0..5 {
            let output = model.forward_segmentation(batch.clone(), &criterion);
            losses.push(output.loss.clone().into_scalar());
            let grads = GradientsParams::from_grads(output.loss.backward(), &model);
            model = optim.step(1e-2, model, grads);
        }
        assert!(losses[4] < losses[0], "losses: {losses:?}");
    }
}
