use crate::error::{Error, Result};
use burn::nn::loss::Reduction;
use burn::prelude::*;
use burn::tensor::activation::log_softmax;

/// Configuration to create a [pixel-wise cross-entropy loss](PixelCrossEntropyLoss) using the [init function](PixelCrossEntropyLossConfig::init).
#[derive(Config, Debug)]
pub struct PixelCrossEntropyLossConfig {
    /// Per-class weights, used to counter the small area of the foreground.
    ///
    /// When set, the mean reduction divides by the summed weights of the targets.
    #[config(default = "None")]
    pub class_weights: Option<Vec<f32>>,
}

impl PixelCrossEntropyLossConfig {
    /// Checks the class weights against the number of classes of the model.
    pub fn validate(&self, num_classes: usize) -> Result<()> {
        let Some(weights) = &self.class_weights else {
            return Ok(());
        };
        if weights.len() != num_classes {
            return Err(Error::Config(format!(
                "{} class weights given for {num_classes} classes",
                weights.len()
            )));
        }
        if let Some(weight) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
            return Err(Error::Config(format!(
                "class weight {weight} must be finite and non-negative"
            )));
        }
        if weights.iter().sum::<f32>() <= 0.0 {
            return Err(Error::Config("class weights must not all be zero".into()));
        }
        Ok(())
    }

    /// Initialize [pixel-wise cross-entropy loss](PixelCrossEntropyLoss).
    pub fn init(&self) -> PixelCrossEntropyLoss {
        PixelCrossEntropyLoss {
            class_weights: self.class_weights.clone(),
        }
    }
}

/// Softmax cross-entropy between per-pixel class scores and per-pixel class ids.
///
/// Should be created using [PixelCrossEntropyLossConfig]
#[derive(Clone, Debug, Default)]
pub struct PixelCrossEntropyLoss {
    pub class_weights: Option<Vec<f32>>,
}

impl PixelCrossEntropyLoss {
    /// Compute the criterion on the input tensor.
    ///
    /// # Shapes
    ///
    /// - logits: `[batch_size, num_classes, height, width]`
    /// - targets: `[batch_size, height, width]`
    pub fn forward<B: Backend>(
        &self,
        logits: Tensor<B, 4>,
        targets: Tensor<B, 3, Int>,
        reduction: Reduction,
    ) -> Tensor<B, 1> {
        let [batch, height, width] = targets.dims();
        let nll = self.negative_log_likelihood(logits, targets.clone());
        let num_pixels = batch * height * width;

        match self.pixel_weights(targets.reshape([num_pixels])) {
            None => match reduction {
                Reduction::Mean | Reduction::Auto => nll.mean(),
                Reduction::Sum => nll.sum(),
            },
            Some(weights) => {
                let weighted = nll * weights.clone();
                match reduction {
                    Reduction::Mean | Reduction::Auto => weighted.sum() / weights.sum(),
                    Reduction::Sum => weighted.sum(),
                }
            }
        }
    }

    /// Compute the criterion on the input tensor without reducing.
    ///
    /// # Shapes
    ///
    /// - logits: `[batch_size, num_classes, height, width]`
    /// - targets: `[batch_size, height, width]`
    /// - output: `[batch_size, height, width]`
    pub fn forward_no_reduction<B: Backend>(
        &self,
        logits: Tensor<B, 4>,
        targets: Tensor<B, 3, Int>,
    ) -> Tensor<B, 3> {
        let [batch, height, width] = targets.dims();
        let num_pixels = batch * height * width;
        let nll = self.negative_log_likelihood(logits, targets.clone());
        let loss = match self.pixel_weights(targets.reshape([num_pixels])) {
            None => nll,
            Some(weights) => nll * weights,
        };
        loss.reshape([batch, height, width])
    }

    /// # Shapes
    ///
    /// - output: `[batch_size * height * width]`
    fn negative_log_likelihood<B: Backend>(
        &self,
        logits: Tensor<B, 4>,
        targets: Tensor<B, 3, Int>,
    ) -> Tensor<B, 1> {
        let [batch, num_classes, height, width] = logits.dims();
        debug_assert_eq!([batch, height, width], targets.dims());
        let num_pixels = batch * height * width;

        // classes last, one row per pixel
        let logits = logits
            .swap_dims(1, 2)
            .swap_dims(2, 3)
            .reshape([num_pixels, num_classes]);
        let targets = targets.reshape([num_pixels, 1]);

        log_softmax(logits, 1)
            .gather(1, targets)
            .neg()
            .reshape([num_pixels])
    }

    fn pixel_weights<B: Backend>(&self, targets: Tensor<B, 1, Int>) -> Option<Tensor<B, 1>> {
        let class_weights = self.class_weights.as_ref()?;
        let device = targets.device();
        let data = TensorData::new(class_weights.clone(), [class_weights.len()])
            .convert::<B::FloatElem>();
        let class_weights = Tensor::<B, 1>::from_data(data, &device);
        Some(class_weights.select(0, targets))
    }
}
