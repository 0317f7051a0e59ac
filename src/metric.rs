use burn::prelude::*;
use burn::tensor::ElementConversion;
use burn::train::metric::state::{FormatOptions, NumericMetricState};
use burn::train::metric::{Metric, MetricMetadata, Numeric, NumericEntry, SerializedEntry};
use std::iter::Sum;
use std::marker::PhantomData;
use std::ops::{Add, AddAssign};
use std::sync::Arc;

/// Class id of the left ventricle in the label masks.
pub const LV_CLASS: usize = 1;

/// Foreground pixel areas of a prediction and its label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlapCounts {
    /// Pixels that are foreground in both the prediction and the label.
    pub intersection: u64,
    /// Foreground pixels of the label.
    pub label: u64,
    /// Foreground pixels of the prediction.
    pub predicted: u64,
}

impl OverlapCounts {
    /// `2|X ∩ Y| / (|X| + |Y|)`, undefined when both masks are empty.
    pub fn dice(&self) -> Option<f64> {
        let denominator = self.label + self.predicted;
        (denominator != 0).then(|| 2.0 * self.intersection as f64 / denominator as f64)
    }

    /// `|X ∩ Y| / |X ∪ Y|`, undefined when both masks are empty.
    pub fn iou(&self) -> Option<f64> {
        let union = self.label + self.predicted - self.intersection;
        (union != 0).then(|| self.intersection as f64 / union as f64)
    }
}

impl Add for OverlapCounts {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            intersection: self.intersection + rhs.intersection,
            label: self.label + rhs.label,
            predicted: self.predicted + rhs.predicted,
        }
    }
}

impl AddAssign for OverlapCounts {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sum for OverlapCounts {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

/// Counts the foreground areas of the most likely class of each pixel against the labels.
///
/// # Shapes
///   - logits [batch, num_classes, height, width]
///   - targets [batch, height, width]
pub fn overlap_counts<B: Backend>(
    logits: Tensor<B, 4>,
    targets: Tensor<B, 3, Int>,
    foreground_class: usize,
) -> OverlapCounts {
    let [batch, _num_classes, height, width] = logits.dims();
    debug_assert_eq!([batch, height, width], targets.dims());
    let input = OverlapInput::from_logits(logits, targets);
    mask_overlap(input.predictions, input.targets, foreground_class)
}

/// Same as [`overlap_counts`], over already decided classes.
///
/// # Shapes
///   - predictions [batch, height, width]
///   - targets [batch, height, width]
pub fn mask_overlap<B: Backend>(
    predictions: Tensor<B, 3, Int>,
    targets: Tensor<B, 3, Int>,
    foreground_class: usize,
) -> OverlapCounts {
    debug_assert_eq!(predictions.dims(), targets.dims());
    let foreground = foreground_class as i64;
    let predicted = predictions.equal_elem(foreground).int();
    let label = targets.equal_elem(foreground).int();
    let intersection = predicted.clone() * label.clone();

    let count = |mask: Tensor<B, 3, Int>| mask.sum().into_scalar().elem::<i64>() as u64;
    OverlapCounts {
        intersection: count(intersection),
        label: count(label),
        predicted: count(predicted),
    }
}

/// Decided classes and labels of a batch, the input of [`OverlapMetric`].
pub struct OverlapInput<B: Backend> {
    /// # Shape
    /// [batch_size, height, width]
    pub predictions: Tensor<B, 3, Int>,
    /// # Shape
    /// [batch_size, height, width]
    pub targets: Tensor<B, 3, Int>,
}

impl<B: Backend> OverlapInput<B> {
    pub fn new(predictions: Tensor<B, 3, Int>, targets: Tensor<B, 3, Int>) -> Self {
        Self {
            predictions,
            targets,
        }
    }

    /// Takes the most likely class of each pixel.
    ///
    /// # Shapes
    ///   - logits [batch, num_classes, height, width]
    ///   - targets [batch, height, width]
    pub fn from_logits(logits: Tensor<B, 4>, targets: Tensor<B, 3, Int>) -> Self {
        let [batch, height, width] = targets.dims();
        Self::new(logits.argmax(1).reshape([batch, height, width]), targets)
    }
}

/// Foreground Dice score of each batch, accumulating [`OverlapCounts`] over batches.
///
/// The running value is the Dice score of the summed counts, not the mean of the
/// per-batch scores. Two empty masks agree perfectly and score 1.
#[derive(Clone)]
pub struct OverlapMetric<B: Backend> {
    name: Arc<String>,
    foreground_class: usize,
    state: NumericMetricState,
    last: OverlapCounts,
    counts: OverlapCounts,
    num_batches: usize,
    _b: PhantomData<B>,
}

impl<B: Backend> OverlapMetric<B> {
    pub fn new(foreground_class: usize) -> Self {
        Self {
            name: Arc::new("Dice".to_owned()),
            foreground_class,
            state: NumericMetricState::default(),
            last: OverlapCounts::default(),
            counts: OverlapCounts::default(),
            num_batches: 0,
            _b: PhantomData,
        }
    }

    /// Counts accumulated since the last [clear](Metric::clear).
    pub fn counts(&self) -> OverlapCounts {
        self.counts
    }

    /// Counts of the latest batch.
    pub fn last_counts(&self) -> OverlapCounts {
        self.last
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches
    }
}

impl<B: Backend> Metric for OverlapMetric<B> {
    type Input = OverlapInput<B>;

    fn name(&self) -> Arc<String> {
        self.name.clone()
    }

    fn update(&mut self, item: &OverlapInput<B>, _metadata: &MetricMetadata) -> SerializedEntry {
        let [batch_size, _height, _width] = item.targets.dims();
        let counts = mask_overlap(
            item.predictions.clone(),
            item.targets.clone(),
            self.foreground_class,
        );
        self.last = counts;
        self.counts += counts;
        self.num_batches += 1;

        self.state.update(
            counts.dice().unwrap_or(1.0),
            batch_size,
            FormatOptions::new(self.name()).precision(4),
        )
    }

    fn clear(&mut self) {
        self.state.reset();
        self.last = OverlapCounts::default();
        self.counts = OverlapCounts::default();
        self.num_batches = 0;
    }
}

impl<B: Backend> Numeric for OverlapMetric<B> {
    fn value(&self) -> NumericEntry {
        NumericEntry::Value(self.last.dice().unwrap_or(1.0))
    }

    fn running_value(&self) -> NumericEntry {
        NumericEntry::Value(self.counts.dice().unwrap_or(1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn counts_foreground_areas() {
        let device = Default::default();
        // predicted classes: [[1, 1], [0, 0]] (background scores first)
        let logits = Tensor::<TestBackend, 4>::from_data(
            [[[[0., 0.], [1., 1.]], [[1., 1.], [0., 0.]]]],
            &device,
        );
        let targets = Tensor::<TestBackend, 3, Int>::from_data([[[1, 0], [1, 0]]], &device);

        let counts = overlap_counts(logits, targets, LV_CLASS);
        assert_eq!(
            counts,
            OverlapCounts {
                intersection: 1,
                label: 2,
                predicted: 2
            }
        );
        assert_eq!(counts.dice(), Some(0.5));
        assert_eq!(counts.iou(), Some(1.0 / 3.0));
    }

    #[test]
    fn perfect_and_disjoint_masks() {
        let device = Default::default();
        let mask = Tensor::<TestBackend, 3, Int>::from_data([[[0, 1, 1], [0, 0, 1]]], &device);
        let perfect = mask_overlap(mask.clone(), mask.clone(), LV_CLASS);
        assert_eq!(perfect.dice(), Some(1.0));
        assert_eq!(perfect.iou(), Some(1.0));

        let inverse = mask.clone().equal_elem(0).int();
        let disjoint = mask_overlap(inverse, mask, LV_CLASS);
        assert_eq!(disjoint.intersection, 0);
        assert_eq!(disjoint.dice(), Some(0.0));
    }

    #[test]
    fn empty_masks_have_no_score() {
        let empty = OverlapCounts::default();
        assert_eq!(empty.dice(), None);
        assert_eq!(empty.iou(), None);
    }

    #[test]
    fn accumulates_over_batches() {
        let a = OverlapCounts {
            intersection: 3,
            label: 4,
            predicted: 5,
        };
        let b = OverlapCounts {
            intersection: 1,
            label: 4,
            predicted: 1,
        };
        assert_eq!([a, b].into_iter().sum::<OverlapCounts>(), a + b);
    }

    #[test]
    fn metric_scores_the_summed_counts() {
        let device = Default::default();
        let meta = MetricMetadata {
            progress: burn::data::dataloader::Progress::new(0, 3),
            epoch: 1,
            epoch_total: 1,
            iteration: 0,
            lr: None,
        };
        let mut metric = OverlapMetric::<TestBackend>::new(LV_CLASS);
        let mask = |data: [[i64; 2]; 2]| {
            Tensor::<TestBackend, 3, Int>::from_data([data], &device)
        };

        // intersection 1, label 2, predicted 1
        let first = OverlapInput::new(mask([[1, 0], [0, 0]]), mask([[1, 1], [0, 0]]));
        metric.update(&first, &meta);
        assert_eq!(metric.value().current(), 2.0 / 3.0);

        // intersection 0, label 1, predicted 1
        let second = OverlapInput::new(mask([[0, 0], [0, 1]]), mask([[0, 0], [1, 0]]));
        metric.update(&second, &meta);
        assert_eq!(metric.value().current(), 0.0);
        assert_eq!(metric.num_batches(), 2);
        assert_eq!(
            metric.counts(),
            OverlapCounts {
                intersection: 1,
                label: 3,
                predicted: 2
            }
        );
        assert_eq!(metric.running_value().current(), 2.0 / 5.0);

        metric.clear();
        assert_eq!(metric.num_batches(), 0);
        assert_eq!(metric.counts(), OverlapCounts::default());

        // nothing to find and nothing found
        let empty = OverlapInput::new(mask([[0, 0], [0, 0]]), mask([[0, 0], [0, 0]]));
        metric.update(&empty, &meta);
        assert_eq!(metric.running_value().current(), 1.0);
    }

    #[test]
    fn tied_scores_predict_background() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 4>::zeros([2, 2, 3, 3], &device);
        let targets = Tensor::<TestBackend, 3, Int>::ones([2, 3, 3], &device);

        let counts = overlap_counts(logits, targets, LV_CLASS);
        assert_eq!(counts.predicted, 0);
        assert_eq!(counts.intersection, 0);
        assert_eq!(counts.label, 18);
        assert_eq!(counts.dice(), Some(0.0));
    }
}
