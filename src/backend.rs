use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

pub type Element = f32;

#[cfg(feature = "ndarray")]
pub type MainBackend = burn::backend::NdArray<Element, i64>;
#[cfg(all(feature = "wgpu", not(feature = "ndarray")))]
pub type MainBackend = burn::backend::wgpu::Wgpu<Element, i32>;
#[cfg(all(feature = "tch-cpu", not(any(feature = "ndarray", feature = "wgpu"))))]
pub type MainBackend = burn::backend::libtorch::LibTorch<Element>;

/// Model, optimizer and progress files, e.g. `model.mpk.gz`.
pub type RecorderTy = burn::record::CompactRecorder;

pub trait MainDevice: Backend {
    fn main_device() -> <Self as Backend>::Device {
        Default::default()
    }
}

#[cfg(feature = "_dev-has-backend")]
impl MainDevice for MainBackend {}

#[cfg(feature = "_dev-has-backend")]
pub type MainAutoBackend = burn::backend::Autodiff<MainBackend>;
#[cfg(feature = "_dev-has-backend")]
impl MainDevice for MainAutoBackend {
    fn main_device() -> <Self as Backend>::Device {
        <<Self as AutodiffBackend>::InnerBackend as MainDevice>::main_device()
    }
}
