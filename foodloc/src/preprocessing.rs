use anyhow::Result;
use image::{imageops::FilterType, DynamicImage, RgbImage};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::heatmap::TensorLayout;

/// Pixel normalization expected by a backbone, following the Keras
/// `preprocess_input` conventions of the network family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Preprocessing {
    /// VGG16/VGG19: RGB to BGR, ImageNet mean subtracted, no scaling
    Caffe,
    /// Xception, Inception, MobileNet: scaled to [-1, 1]
    Tf,
    /// Scaled to [0, 1] then normalized with ImageNet mean and std
    Torch,
}

const CAFFE_MEAN_BGR: [f32; 3] = [103.939, 116.779, 123.68];
const TORCH_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const TORCH_STD: [f32; 3] = [0.229, 0.224, 0.225];

impl Preprocessing {
    /// Normalize one RGB pixel; the returned channels are in model order.
    fn normalize(self, rgb: [u8; 3]) -> [f32; 3] {
        let [r, g, b] = rgb.map(f32::from);
        match self {
            Preprocessing::Caffe => [
                b - CAFFE_MEAN_BGR[0],
                g - CAFFE_MEAN_BGR[1],
                r - CAFFE_MEAN_BGR[2],
            ],
            Preprocessing::Tf => [r / 127.5 - 1.0, g / 127.5 - 1.0, b / 127.5 - 1.0],
            Preprocessing::Torch => {
                let mut out = [r, g, b];
                for (c, v) in out.iter_mut().enumerate() {
                    *v = (*v / 255.0 - TORCH_MEAN[c]) / TORCH_STD[c];
                }
                out
            }
        }
    }
}

/// Resize an image to exactly `width × height` with bicubic filtering.
pub fn resize_exact(img: &DynamicImage, width: u32, height: u32) -> RgbImage {
    let rgb = img.to_rgb8();
    if rgb.dimensions() == (width, height) {
        return rgb;
    }
    image::imageops::resize(&rgb, width, height, FilterType::CatmullRom)
}

/// Convert an RGB image into a normalized single-image batch tensor.
pub fn image_to_tensor(
    img: &RgbImage,
    preprocessing: Preprocessing,
    layout: TensorLayout,
) -> Result<Array4<f32>> {
    let (width, height) = img.dimensions();
    let (w, h) = (width as usize, height as usize);

    let mut tensor = match layout {
        TensorLayout::Nhwc => Array4::<f32>::zeros((1, h, w, 3)),
        TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, h, w)),
    };

    for (x, y, pixel) in img.enumerate_pixels() {
        let values = preprocessing.normalize(pixel.0);
        let (x, y) = (x as usize, y as usize);
        for (c, v) in values.into_iter().enumerate() {
            match layout {
                TensorLayout::Nhwc => tensor[[0, y, x, c]] = v,
                TensorLayout::Nchw => tensor[[0, c, y, x]] = v,
            }
        }
    }

    if tensor.iter().any(|v| !v.is_finite()) {
        return Err(anyhow::anyhow!("Preprocessed tensor contains non-finite values"));
    }

    Ok(tensor)
}
