use image::RgbImage;
use image::imageops::{self, FilterType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One step of the image preprocessing applied before batching.
///
/// Image steps (`resize`, `center_crop`) operate on the decoded RGB image and must come before
/// the tensor steps (`to_tensor`, `normalize`). Conversion to a tensor happens implicitly at the
/// end of the pipeline when no tensor step is configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformStep {
    Resize { height: u32, width: u32 },
    CenterCrop { height: u32, width: u32 },
    ToTensor,
    Normalize { mean: [f32; 3], std: [f32; 3] },
}

impl TransformStep {
    fn name(&self) -> &'static str {
        match self {
            TransformStep::Resize { .. } => "resize",
            TransformStep::CenterCrop { .. } => "center_crop",
            TransformStep::ToTensor => "to_tensor",
            TransformStep::Normalize { .. } => "normalize",
        }
    }

    fn is_image_step(&self) -> bool {
        matches!(
            self,
            TransformStep::Resize { .. } | TransformStep::CenterCrop { .. }
        )
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TransformError {
    #[error("Transform step {position} (`{step}`) operates on images and must come before tensor conversion")]
    ImageStepAfterTensor { position: usize, step: &'static str },
    #[error("Transform step {position} (`{step}`) has a zero dimension")]
    ZeroDimension { position: usize, step: &'static str },
    #[error("Transform step {position} (`normalize`) has a non-positive standard deviation")]
    InvalidStd { position: usize },
}

/// A CHW float image, the per-item unit a batch is assembled from.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    /// `[channels, height, width]`
    pub shape: [usize; 3],
    pub data: Vec<f32>,
}

impl ImageTensor {
    /// Converts an RGB image to CHW layout with values scaled to `[0, 1]`.
    pub fn from_rgb(image: &RgbImage) -> Self {
        let (width, height) = image.dimensions();
        let (width, height) = (width as usize, height as usize);
        let plane = width * height;
        let mut data = vec![0.0; 3 * plane];
        for (x, y, pixel) in image.enumerate_pixels() {
            let offset = y as usize * width + x as usize;
            for (channel, value) in pixel.0.iter().enumerate() {
                data[channel * plane + offset] = f32::from(*value) / 255.0;
            }
        }
        Self {
            shape: [3, height, width],
            data,
        }
    }

    fn normalize(&mut self, mean: &[f32; 3], std: &[f32; 3]) {
        let plane = self.shape[1] * self.shape[2];
        for (channel, values) in self.data.chunks_mut(plane.max(1)).enumerate() {
            let (mean, std) = (mean[channel % 3], std[channel % 3]);
            values.iter_mut().for_each(|v| *v = (*v - mean) / std);
        }
    }
}

/// A validated sequence of [`TransformStep`]s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformPipeline {
    steps: Vec<TransformStep>,
}

impl TransformPipeline {
    pub fn new(steps: Vec<TransformStep>) -> Result<Self, TransformError> {
        let mut tensor_stage = false;
        for (position, step) in steps.iter().enumerate() {
            match step {
                TransformStep::Resize { height, width }
                | TransformStep::CenterCrop { height, width } => {
                    if *height == 0 || *width == 0 {
                        return Err(TransformError::ZeroDimension {
                            position,
                            step: step.name(),
                        });
                    }
                }
                TransformStep::Normalize { std, .. } => {
                    if std.iter().any(|s| *s <= 0.0) {
                        return Err(TransformError::InvalidStd { position });
                    }
                }
                TransformStep::ToTensor => {}
            }
            if step.is_image_step() && tensor_stage {
                return Err(TransformError::ImageStepAfterTensor {
                    position,
                    step: step.name(),
                });
            }
            tensor_stage |= !step.is_image_step();
        }
        Ok(Self { steps })
    }

    /// A pipeline that only converts images to tensors.
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> &[TransformStep] {
        &self.steps
    }

    pub fn apply(&self, image: RgbImage) -> ImageTensor {
        let mut image = image;
        let mut tensor: Option<ImageTensor> = None;
        for step in &self.steps {
            match step {
                TransformStep::Resize { height, width } => {
                    image = imageops::resize(&image, *width, *height, FilterType::Triangle);
                }
                TransformStep::CenterCrop { height, width } => {
                    image = center_crop(&image, *width, *height);
                }
                TransformStep::ToTensor => {
                    tensor.get_or_insert_with(|| ImageTensor::from_rgb(&image));
                }
                TransformStep::Normalize { mean, std } => {
                    tensor
                        .get_or_insert_with(|| ImageTensor::from_rgb(&image))
                        .normalize(mean, std);
                }
            }
        }
        tensor.unwrap_or_else(|| ImageTensor::from_rgb(&image))
    }
}

// Crops larger than the image are clamped to the image size.
fn center_crop(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    let (img_width, img_height) = image.dimensions();
    let width = width.min(img_width);
    let height = height.min(img_height);
    let x = (img_width - width) / 2;
    let y = (img_height - height) / 2;
    imageops::crop_imm(image, x, y, width, height).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn to_tensor_uses_chw_layout() {
        let mut image = RgbImage::new(2, 1);
        image.put_pixel(0, 0, Rgb([255, 0, 0]));
        image.put_pixel(1, 0, Rgb([0, 255, 51]));

        let tensor = TransformPipeline::identity().apply(image);

        assert_eq!(tensor.shape, [3, 1, 2]);
        assert_eq!(tensor.data, vec![1.0, 0.0, 0.0, 1.0, 0.0, 0.2]);
    }

    #[test]
    fn resize_then_crop_sets_final_shape() {
        let pipeline = TransformPipeline::new(vec![
            TransformStep::Resize {
                height: 8,
                width: 10,
            },
            TransformStep::CenterCrop {
                height: 4,
                width: 4,
            },
        ])
        .unwrap();

        let tensor = pipeline.apply(RgbImage::from_pixel(3, 3, Rgb([10, 20, 30])));

        assert_eq!(tensor.shape, [3, 4, 4]);
    }

    #[test]
    fn center_crop_is_clamped_to_image() {
        let pipeline = TransformPipeline::new(vec![TransformStep::CenterCrop {
            height: 10,
            width: 2,
        }])
        .unwrap();

        let tensor = pipeline.apply(RgbImage::new(4, 3));

        assert_eq!(tensor.shape, [3, 3, 2]);
    }

    #[test]
    fn normalize_is_applied_per_channel() {
        let pipeline = TransformPipeline::new(vec![TransformStep::Normalize {
            mean: [0.5, 0.0, 1.0],
            std: [0.5, 1.0, 2.0],
        }])
        .unwrap();

        let tensor = pipeline.apply(RgbImage::from_pixel(1, 1, Rgb([255, 255, 0])));

        assert_eq!(tensor.data, vec![1.0, 1.0, -0.5]);
    }

    #[test]
    fn image_step_after_normalize_is_rejected() {
        let err = TransformPipeline::new(vec![
            TransformStep::ToTensor,
            TransformStep::Resize {
                height: 2,
                width: 2,
            },
        ])
        .unwrap_err();

        assert_eq!(
            err,
            TransformError::ImageStepAfterTensor {
                position: 1,
                step: "resize"
            }
        );
    }

    #[test]
    fn zero_std_is_rejected() {
        let err = TransformPipeline::new(vec![TransformStep::Normalize {
            mean: [0.0; 3],
            std: [1.0, 0.0, 1.0],
        }])
        .unwrap_err();

        assert_eq!(err, TransformError::InvalidStd { position: 0 });
    }

    #[test]
    fn steps_deserialize_from_tagged_tables() {
        let steps: Vec<TransformStep> = serde_json::from_str(
            r#"[{"type": "resize", "height": 4, "width": 5}, {"type": "to_tensor"}]"#,
        )
        .unwrap();

        assert_eq!(
            steps,
            vec![
                TransformStep::Resize {
                    height: 4,
                    width: 5
                },
                TransformStep::ToTensor
            ]
        );
    }
}
