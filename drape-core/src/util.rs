use std::io::Cursor;

use anyhow::Result;
use base64::{prelude::BASE64_STANDARD, Engine};
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Shape, Tensor};
use image::{imageops::FilterType, DynamicImage};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::DeviceMap;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                tracing::info!("Running on CPU, to run on GPU(metal), build with `--features metal`");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                tracing::info!("Running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Loads an image as a (3, size, size) f32 tensor normalized to [-1, 1].
///
/// Non-RGB inputs are converted and images whose dimensions differ from
/// `size` are resized with a Lanczos filter.
pub fn image_to_tensor(img: &DynamicImage, size: usize, device: &Device) -> Result<Tensor> {
    let rgb = img.to_rgb8();
    let rgb = if rgb.dimensions() != (size as u32, size as u32) {
        image::imageops::resize(&rgb, size as u32, size as u32, FilterType::Lanczos3)
    } else {
        rgb
    };
    let data = rgb.into_raw();
    let tensor = Tensor::from_vec(data, (size, size, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?;
    Ok(((tensor / 127.5)? - 1.0)?)
}

pub fn image_to_png_bytes(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}

pub fn png_to_base64(png: &[u8]) -> String {
    BASE64_STANDARD.encode(png)
}

/// Samples standard-normal values from `rng` into an f32 tensor.
///
/// Drawing on the host keeps seeded runs identical regardless of which
/// device the tensor ends up on.
pub fn seeded_randn<S: Into<Shape>, R: Rng>(shape: S, rng: &mut R, device: &Device) -> Result<Tensor> {
    let shape = shape.into();
    let values: Vec<f32> = (0..shape.elem_count())
        .map(|_| rng.sample(StandardNormal))
        .collect();
    Ok(Tensor::from_vec(values, shape, &Device::Cpu)?.to_device(device)?)
}
