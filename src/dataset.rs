use crate::error::{Error, Result};
use crate::example::{Example, Feature};
use crate::record::read_records;
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::{
    Dataset, InMemDataset,
    transform::{Mapper, MapperDataset},
};
use burn::prelude::*;
use num_traits::AsPrimitive;
use std::path::Path;

/// Feature holding the image, as raw little-endian `i64` pixels.
pub const IMAGE_FEATURE: &str = "img_raw";
/// Feature holding the label mask, as raw `u8` class ids.
pub const LABEL_FEATURE: &str = "label_raw";
/// Raw pixel intensities are multiplied by this factor.
pub const PIXEL_SCALE: f32 = 1. / 1024.;

#[derive(Config, Debug, PartialEq)]
pub struct ImageGeometry {
    #[config(default = 256)]
    pub height: usize,
    #[config(default = 256)]
    pub width: usize,
}

impl ImageGeometry {
    pub fn pixels(&self) -> usize {
        self.height * self.width
    }
}

/// One MRI slice with its segmentation mask.
#[derive(Debug, Clone, PartialEq)]
pub struct MriSlice {
    /// Scaled pixel intensities, row-major.
    ///
    /// # Shape
    /// [height * width]
    pub image: Vec<f32>,

    /// Per-pixel class id, `1` where the left ventricle is.
    ///
    /// # Shape
    /// [height * width]
    pub label: Vec<u8>,
}

#[derive(Debug, Clone)]
struct RawSlice {
    pixels: Vec<i64>,
    label: Vec<u8>,
}

struct ScalePixels {
    scale: f32,
}

impl Mapper<RawSlice, MriSlice> for ScalePixels {
    fn map(&self, item: &RawSlice) -> MriSlice {
        let image = item
            .pixels
            .iter()
            .map(|pixel| {
                let value: f32 = pixel.as_();
                value * self.scale
            })
            .collect();
        MriSlice {
            image,
            label: item.label.clone(),
        }
    }
}

fn decode_raw(record: &[u8], geometry: &ImageGeometry, num_classes: usize) -> Result<RawSlice> {
    let example = Example::decode(record)?;
    let pixels = geometry.pixels();

    let img_raw = example.bytes(IMAGE_FEATURE)?;
    if img_raw.len() != pixels * size_of::<i64>() {
        return Err(Error::PixelCount {
            feature: IMAGE_FEATURE,
            expected: pixels,
            actual: img_raw.len() / size_of::<i64>(),
        });
    }
    let pixels_i64 = img_raw
        .chunks_exact(size_of::<i64>())
        .map(|chunk| {
            let mut le = [0u8; 8];
            le.copy_from_slice(chunk);
            i64::from_le_bytes(le)
        })
        .collect();

    let label = example.bytes(LABEL_FEATURE)?;
    if label.len() != pixels {
        return Err(Error::PixelCount {
            feature: LABEL_FEATURE,
            expected: pixels,
            actual: label.len(),
        });
    }
    if let Some(&value) = label.iter().find(|&&v| v as usize >= num_classes) {
        return Err(Error::LabelRange { value, num_classes });
    }

    Ok(RawSlice {
        pixels: pixels_i64,
        label: label.to_vec(),
    })
}

/// Decodes one serialized example into a scaled slice.
pub fn decode_slice(
    record: &[u8],
    geometry: &ImageGeometry,
    num_classes: usize,
    pixel_scale: f32,
) -> Result<MriSlice> {
    let raw = decode_raw(record, geometry, num_classes)?;
    Ok(ScalePixels { scale: pixel_scale }.map(&raw))
}

/// Encodes a slice of raw pixels and labels the way [`decode_slice`] expects it.
pub fn encode_slice(pixels: &[i64], label: &[u8]) -> Result<Vec<u8>> {
    let img_raw = pixels.iter().flat_map(|p| p.to_le_bytes()).collect();
    Example::new()
        .with_feature(IMAGE_FEATURE, Feature::Bytes(vec![img_raw]))
        .with_feature(LABEL_FEATURE, Feature::Bytes(vec![label.to_vec()]))
        .encode()
}

type MappedDataset = MapperDataset<InMemDataset<RawSlice>, ScalePixels, RawSlice>;

/// Cardiac MRI slices with their left-ventricle masks, read from a TFRecord file.
///
/// Every record is decoded and validated when the dataset is built,
/// pixel scaling is applied when an item is fetched.
pub struct MriSliceDataset {
    dataset: MappedDataset,
    geometry: ImageGeometry,
}

impl Dataset<MriSlice> for MriSliceDataset {
    fn get(&self, index: usize) -> Option<MriSlice> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

impl MriSliceDataset {
    pub fn from_records(
        path: &Path,
        geometry: ImageGeometry,
        num_classes: usize,
        pixel_scale: f32,
    ) -> Result<Self> {
        let records = read_records(path)?;
        let dataset = Self::from_record_bytes(records, geometry, num_classes, pixel_scale)?;
        log::info!("Loaded {} slices from {path:?}", dataset.len());
        Ok(dataset)
    }

    pub fn from_record_bytes(
        records: impl IntoIterator<Item = Vec<u8>>,
        geometry: ImageGeometry,
        num_classes: usize,
        pixel_scale: f32,
    ) -> Result<Self> {
        let items = records
            .into_iter()
            .enumerate()
            .map(|(index, record)| {
                decode_raw(&record, &geometry, num_classes).map_err(|e| e.in_record(index))
            })
            .collect::<Result<Vec<_>>>()?;

        let dataset = InMemDataset::new(items);
        let dataset = MapperDataset::new(dataset, ScalePixels { scale: pixel_scale });
        Ok(Self { dataset, geometry })
    }

    pub fn geometry(&self) -> &ImageGeometry {
        &self.geometry
    }
}

#[derive(Clone, Debug)]
pub struct MriBatcher {
    geometry: ImageGeometry,
}

impl MriBatcher {
    pub fn new(geometry: ImageGeometry) -> Self {
        Self { geometry }
    }
}

#[derive(Clone, Debug)]
pub struct MriBatch<B: Backend> {
    /// Scaled intensities.
    ///
    /// # Shape
    /// [batch_size, 1, height, width]
    pub images: Tensor<B, 4>,
    /// # Shape
    /// [batch_size, height, width]
    pub targets: Tensor<B, 3, Int>,
}

impl<B: Backend> Batcher<B, MriSlice, MriBatch<B>> for MriBatcher {
    fn batch(&self, items: Vec<MriSlice>, device: &B::Device) -> MriBatch<B> {
        let [height, width] = [self.geometry.height, self.geometry.width];
        let (items_image, items_label): (Vec<_>, Vec<_>) = items
            .into_iter()
            .map(|item| (item.image, item.label))
            .unzip();

        let images = items_image
            .into_iter()
            .map(|image| TensorData::new(image, [1, 1, height, width]).convert::<B::FloatElem>())
            .map(|data| Tensor::<B, 4>::from_data(data, device))
            .collect();
        let targets = items_label
            .into_iter()
            .map(|label| TensorData::new(label, [1, height, width]).convert::<B::IntElem>())
            .map(|data| Tensor::<B, 3, Int>::from_data(data, device))
            .collect();

        MriBatch {
            images: Tensor::cat(images, 0),
            targets: Tensor::cat(targets, 0),
        }
    }
}
