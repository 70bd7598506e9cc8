//! Conversions from pixel tensors to images on disk.
//!
//! Pixel tensors are channel-first floats in `[0, 1]`, images are 8-bit and
//! channel-last.
use crate::error::Error;
use std::path::Path;
use tch::{Device, Kind, Tensor};

/// Converts a `(3, height, width)` tensor with values in `[0, 1]` to an RGB image.
pub fn to_rgb_image(image: &Tensor) -> anyhow::Result<image::RgbImage> {
    let size = image.size();
    let (height, width) = match size.as_slice() {
        &[3, height, width] => (height as u32, width as u32),
        _ => return Err(Error::ImageShape(size).into()),
    };
    let pixels = (image.to_device(Device::Cpu) * 255.)
        .to_kind(Kind::Uint8)
        .permute([1, 2, 0])
        .contiguous()
        .view([-1]);
    let pixels = Vec::<u8>::try_from(&pixels)?;
    let len = pixels.len();
    image::RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| Error::ImageBuffer { len, width, height }.into())
}

pub fn save_png<P: AsRef<Path>>(image: &Tensor, path: P) -> anyhow::Result<()> {
    let path = path.as_ref();
    to_rgb_image(image)?.save(path).map_err(|e| {
        let context = format!("error writing {:?}", path.to_string_lossy());
        anyhow::Error::new(e).context(context)
    })
}

/// Lays a `(batch, channels, height, width)` tensor out as a single image
/// with `nrow` images per row, separated and surrounded by `padding` zero
/// pixels. A batch holding a single image is returned as is.
pub fn make_grid(images: &Tensor, nrow: i64, padding: i64) -> anyhow::Result<Tensor> {
    let (batch, channels, height, width) = images.size4()?;
    if batch == 1 {
        return Ok(images.get(0));
    }
    let columns = nrow.clamp(1, batch);
    let rows = (batch + columns - 1) / columns;
    let (cell_height, cell_width) = (height + padding, width + padding);
    let grid = Tensor::zeros(
        [channels, rows * cell_height + padding, columns * cell_width + padding],
        (images.kind(), images.device()),
    );
    for index in 0..batch {
        let (row, column) = (index / columns, index % columns);
        grid.narrow(1, row * cell_height + padding, height)
            .narrow(2, column * cell_width + padding, width)
            .copy_(&images.get(index));
    }
    Ok(grid)
}
