use crate::dataset::ImageGeometry;
use crate::error::{Error, Result};
use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{Dropout, DropoutConfig, Initializer, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Total downsampling of the encoder, undone by the single upscoring layer.
pub const OUTPUT_STRIDE: usize = 16;

/// Fully convolutional encoder/decoder producing per-pixel class scores.
///
/// Two strided conv + max-pool stages bring the image down by 16, two
/// stride-1 convs refine the features, a 1x1 conv scores each class and a
/// single transposed conv upscores back to the input resolution.
#[derive(Module, Debug)]
pub struct SegNet<B: Backend> {
    /// 5x5, stride 2.
    pub conv1: Conv2d<B>,
    pub pool1: MaxPool2d,
    /// 5x5, stride 2.
    pub conv2: Conv2d<B>,
    pub pool2: MaxPool2d,
    /// 3x3, stride 1.
    pub conv3: Conv2d<B>,
    /// 3x3, stride 1.
    pub conv4: Conv2d<B>,
    pub dropout: Dropout,
    /// 1x1 class scores.
    pub score: Conv2d<B>,
    /// 31x31, stride 16.
    pub upscore: ConvTranspose2d<B>,
}

#[derive(Config, Debug)]
pub struct SegNetConfig {
    /// Background plus left ventricle.
    #[config(default = 2)]
    pub num_classes: usize,
    #[config(default = 100)]
    pub conv1_filters: usize,
    #[config(default = 200)]
    pub conv2_filters: usize,
    #[config(default = 300)]
    pub conv3_filters: usize,
    #[config(default = 300)]
    pub conv4_filters: usize,
    /// Drop probability applied after `conv4` while training.
    #[config(default = 0.0)]
    pub dropout: f64,
    /// Standard deviation of the zero-mean normal weight initializer.
    #[config(default = 0.1)]
    pub init_std: f64,
}

impl SegNetConfig {
    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> SegNet<B> {
        let initializer = Initializer::Normal {
            mean: 0.0,
            std: self.init_std,
        };
        let conv = |channels: [usize; 2], kernel: usize, stride: usize| {
            Conv2dConfig::new(channels, [kernel, kernel])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(kernel / 2, kernel / 2))
                .with_bias(false)
                .with_initializer(initializer.clone())
                .init(device)
        };
        let pool = || MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();

        // out = (in - 1) * 16 - 2 * 8 + 31 + 1 = 16 * in
        let upscore = ConvTranspose2dConfig::new([self.num_classes, self.num_classes], [31, 31])
            .with_stride([OUTPUT_STRIDE, OUTPUT_STRIDE])
            .with_padding([8, 8])
            .with_padding_out([1, 1])
            .with_bias(false)
            .with_initializer(initializer.clone())
            .init(device);

        SegNet {
            conv1: conv([1, self.conv1_filters], 5, 2),
            pool1: pool(),
            conv2: conv([self.conv1_filters, self.conv2_filters], 5, 2),
            pool2: pool(),
            conv3: conv([self.conv2_filters, self.conv3_filters], 3, 1),
            conv4: conv([self.conv3_filters, self.conv4_filters], 3, 1),
            dropout: DropoutConfig::new(self.dropout).init(),
            score: conv([self.conv4_filters, self.num_classes], 1, 1),
            upscore,
        }
    }

    /// Rejects settings the layers can't be built with.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.dropout) {
            return Err(Error::Config(format!(
                "dropout {} must be a probability in [0, 1]",
                self.dropout
            )));
        }
        Ok(())
    }

    /// Checks that images of this geometry come back at full resolution.
    pub fn validate_geometry(&self, geometry: &ImageGeometry) -> Result<()> {
        let (height, width) = (geometry.height, geometry.width);
        let valid = |side: usize| side != 0 && side % OUTPUT_STRIDE == 0;
        if valid(height) && valid(width) {
            Ok(())
        } else {
            Err(Error::Geometry {
                height,
                width,
                stride: OUTPUT_STRIDE,
            })
        }
    }
}

impl<B: Backend> SegNet<B> {
    /// # Shapes
    ///   - Input [batch, 1, height, width]
    ///   - Output [batch, num_classes, height, width]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = images.dims();
        debug_assert_eq!(channels, 1);

        let x = relu(self.conv1.forward(images));
        let x = self.pool1.forward(x);
        debug_assert_eq!([height / 4, width / 4], [x.dims()[2], x.dims()[3]]);

        let x = relu(self.conv2.forward(x));
        let x = self.pool2.forward(x);
        debug_assert_eq!(
            [height / OUTPUT_STRIDE, width / OUTPUT_STRIDE],
            [x.dims()[2], x.dims()[3]]
        );

        let x = relu(self.conv3.forward(x));
        let x = relu(self.conv4.forward(x));
        let x = self.dropout.forward(x);

        let x = self.score.forward(x);
        let x = self.upscore.forward(x);
        let [_batch, num_classes, _height, _width] = x.dims();
        debug_assert_eq!([batch, num_classes, height, width], x.dims());

        x
    }

    /// Most likely class of each pixel.
    ///
    /// # Shapes
    ///   - Input [batch, 1, height, width]
    ///   - Output [batch, height, width]
    pub fn predict(&self, images: Tensor<B, 4>) -> Tensor<B, 3, Int> {
        let [batch, _channels, height, width] = images.dims();
        self.forward(images)
            .argmax(1)
            .reshape([batch, height, width])
    }
}
