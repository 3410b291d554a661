use crate::model::{FullModel, ImageClassifier};
use burn::config::Config;
use burn::module::{Module, Param};
use burn::prelude::{Backend, Tensor};
use image::codecs::png::PngEncoder;
use image::{ImageEncoder, Rgb, RgbImage};

pub type TestBackend = burn::backend::NdArray;

pub fn device() -> <TestBackend as Backend>::Device {
    Default::default()
}

#[derive(Config, Debug)]
pub struct ChannelClassifierConfig {
    #[config(default = 3)]
    pub channels: usize,
}

impl ChannelClassifierConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ChannelClassifier<B> {
        ChannelClassifier {
            scale: Param::from_tensor(Tensor::ones([self.channels], device)),
        }
    }

    pub fn init_zeros<B: Backend>(&self, device: &B::Device) -> ChannelClassifier<B> {
        ChannelClassifier {
            scale: Param::from_tensor(Tensor::zeros([self.channels], device)),
        }
    }
}

/// Scores each class by the mean intensity of the matching channel, so a solid red, green or
/// blue image is classified as 0, 1 or 2.
#[derive(Module, Debug)]
pub struct ChannelClassifier<B: Backend> {
    scale: Param<Tensor<B, 1>>,
}

impl<B: Backend> ChannelClassifier<B> {
    pub fn scale_values(&self) -> Vec<f32> {
        self.scale.val().into_data().to_vec::<f32>().unwrap()
    }
}

impl<B: Backend> ImageClassifier<B> for ChannelClassifier<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, channels, _, _] = images.dims();
        let means = images.mean_dim(3).mean_dim(2).reshape([batch, channels]);
        means * self.scale.val().unsqueeze::<2>()
    }
}

impl<B: Backend> FullModel<B> for ChannelClassifier<B> {
    type Config = ChannelClassifierConfig;

    fn from_config(config: &Self::Config, device: &B::Device) -> Self {
        config.init(device)
    }
}

pub const RED: [u8; 3] = [255, 0, 0];
pub const GREEN: [u8; 3] = [0, 255, 0];
pub const BLUE: [u8; 3] = [0, 0, 255];

pub fn solid_image(color: [u8; 3], size: u32) -> RgbImage {
    RgbImage::from_pixel(size, size, Rgb(color))
}

pub fn solid_png(color: [u8; 3], size: u32) -> Vec<u8> {
    let image = solid_image(color, size);
    let mut bytes = Vec::new();
    PngEncoder::new(&mut bytes)
        .write_image(image.as_raw(), size, size, image::ExtendedColorType::Rgb8)
        .unwrap();
    bytes
}
