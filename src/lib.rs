pub mod artifacts;
pub mod backend;
pub mod cli;
pub mod dataset;
pub mod error;
pub mod example;
pub mod loss;
pub mod metric;
pub mod model;
pub mod record;
pub mod schedule;
pub mod training;

mod protos {
    include!(concat!(env!("OUT_DIR"), "/tf-protos/mod.rs"));
}

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::artifacts::{Artifacts, TrainingProgress};
    pub use crate::dataset::{ImageGeometry, MriBatch, MriBatcher, MriSlice, MriSliceDataset};
    pub use crate::error::{Error, Result};
    pub use crate::loss::{PixelCrossEntropyLoss, PixelCrossEntropyLossConfig};
    pub use crate::metric::{OverlapCounts, OverlapInput, OverlapMetric, overlap_counts};
    pub use crate::model::{SegNet, SegNetConfig};
    pub use crate::schedule::{ExponentialDecay, ExponentialDecayConfig};
    pub use crate::training::{EvaluationReport, TrainingConfig, evaluate, train};
}
