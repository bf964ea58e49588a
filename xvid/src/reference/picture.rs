use super::bitstream::{PayloadReader, UnitWriter};
use crate::{
    codec::CodecError,
    image::{ColorSpace, ImageMut, ImageRef},
    types::PlaneErrors,
};

pub const MB_SIZE: usize = 16;

/// No residual needs a larger level, even at quantizer 1.
const MAX_LEVEL: i32 = 255;

/// Where one of a picture's planes lives inside a caller's buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PlaneLocation {
    buffer: usize,
    offset: usize,
    stride: usize,
}

/// Maps the Y, U and V planes of a 4:2:0 picture onto an image layout.
fn locate_planes(color_space: ColorSpace, strides: &[usize], height: usize) -> Result<[PlaneLocation; 3], CodecError> {
    let at = |buffer, offset, stride| PlaneLocation { buffer, offset, stride };
    match color_space {
        ColorSpace::Planar => Ok([at(0, 0, strides[0]), at(1, 0, strides[1]), at(2, 0, strides[2])]),
        ColorSpace::I420 | ColorSpace::Yv12 => {
            let stride = strides[0];
            let first = stride * height;
            let second = first + stride / 2 * (height / 2);
            let (u, v) = match color_space {
                ColorSpace::I420 => (first, second),
                _ => (second, first),
            };
            Ok([at(0, 0, stride), at(0, u, stride / 2), at(0, v, stride / 2)])
        }
        other => {
            log::warn!("the reference codec doesn't support {:?} images", other);
            Err(CodecError::FAIL)
        }
    }
}

/// Whether a `w`x`h` plane fits inside a buffer at the given location.
fn fits(location: &PlaneLocation, buffer_len: usize, w: usize, h: usize) -> bool {
    h == 0 || (location.stride >= w && location.offset + (h - 1) * location.stride + w <= buffer_len)
}

/// A 4:2:0 picture with tightly packed planes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Picture {
    width: usize,
    height: usize,
    planes: [Vec<u8>; 3],
}

impl Picture {
    pub fn new(width: u32, height: u32, value: u8) -> Self {
        let (width, height) = (width as usize, height as usize);
        let chroma = width / 2 * (height / 2);
        Self {
            width,
            height,
            planes: [vec![value; width * height], vec![value; chroma], vec![value; chroma]],
        }
    }

    pub fn plane_size(&self, plane: usize) -> (usize, usize) {
        match plane {
            0 => (self.width, self.height),
            _ => (self.width / 2, self.height / 2),
        }
    }

    #[cfg(test)]
    pub fn plane(&self, plane: usize) -> &[u8] {
        &self.planes[plane]
    }

    pub fn as_image(&self, color_space: ColorSpace) -> ImageRef<'_> {
        ImageRef {
            color_space,
            vertical_flip: false,
            planes: self.planes.iter().map(|p| p.as_slice()).collect(),
            strides: (0..3).map(|i| self.plane_size(i).0).collect(),
        }
    }

    /// Copies a caller's image into the picture.
    pub fn import(&mut self, image: &ImageRef<'_>) -> Result<(), CodecError> {
        let locations = locate_planes(image.color_space, &image.strides, self.height)?;
        for (i, location) in locations.iter().enumerate() {
            let (w, h) = self.plane_size(i);
            let src = image.planes[location.buffer];
            if !fits(location, src.len(), w, h) {
                log::warn!("input plane {} is too small for a {}x{} picture", i, self.width, self.height);
                return Err(CodecError::FAIL);
            }
            for y in 0..h {
                let row = if image.vertical_flip { h - 1 - y } else { y };
                let start = location.offset + row * location.stride;
                self.planes[i][y * w..(y + 1) * w].copy_from_slice(&src[start..start + w]);
            }
        }
        Ok(())
    }

    /// Copies the picture into a caller's image, adding `brightness` to the luma plane.
    pub fn export(&self, image: &mut ImageMut<'_>, brightness: i32) -> Result<(), CodecError> {
        let locations = locate_planes(image.color_space, &image.strides, self.height)?;
        for (i, location) in locations.iter().enumerate() {
            let (w, h) = self.plane_size(i);
            let dst = &mut *image.planes[location.buffer];
            if !fits(location, dst.len(), w, h) {
                log::warn!("output plane {} is too small for a {}x{} picture", i, self.width, self.height);
                return Err(CodecError::FAIL);
            }
            for y in 0..h {
                let row = if image.vertical_flip { h - 1 - y } else { y };
                let start = location.offset + row * location.stride;
                let src = &self.planes[i][y * w..(y + 1) * w];
                let dst = &mut dst[start..start + w];
                if i == 0 && brightness != 0 {
                    for (d, &s) in dst.iter_mut().zip(src) {
                        *d = (s as i32 + brightness).clamp(0, 255) as u8;
                    }
                } else {
                    dst.copy_from_slice(src);
                }
            }
        }
        Ok(())
    }

    /// Sums of squared differences against another picture of the same size.
    pub fn sse(&self, other: &Picture) -> PlaneErrors {
        let plane = |i: usize| -> u64 {
            self.planes[i]
                .iter()
                .zip(&other.planes[i])
                .map(|(&a, &b)| {
                    let d = a as i64 - b as i64;
                    (d * d) as u64
                })
                .sum()
        };
        PlaneErrors {
            y: plane(0),
            u: plane(1),
            v: plane(2),
        }
    }
}

/// The coordinates of a block's samples, clipped to the plane.
fn block_samples(width: usize, height: usize, size: usize, bx: usize, by: usize) -> impl Iterator<Item = (usize, usize)> {
    let (x0, y0) = (bx * size, by * size);
    let (x1, y1) = ((x0 + size).min(width), (y0 + size).min(height));
    (y0..y1).flat_map(move |y| (x0..x1).map(move |x| (x, y)))
}

fn block_size(plane: usize) -> usize {
    match plane {
        0 => MB_SIZE,
        _ => MB_SIZE / 2,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockCounts {
    pub intra: u32,
    pub inter: u32,
    pub uncoded: u32,
}

pub struct PictureCoding<'a> {
    pub mb_width: usize,
    pub mb_height: usize,
    /// One quantizer per macroblock, in raster order.
    pub quantizers: &'a [u8],
    /// `None` for intra pictures.
    pub reference: Option<&'a Picture>,
    pub greyscale: bool,
}

fn quantize(residual: i32, quantizer: i32) -> i32 {
    let step = 2 * quantizer;
    residual.signum() * ((residual.abs() + quantizer) / step)
}

impl<'a> PictureCoding<'a> {
    fn predictor(&self, plane: usize, index: usize) -> i32 {
        match self.reference {
            Some(reference) => reference.planes[plane][index] as i32,
            None => 128,
        }
    }

    fn coded_planes(&self) -> usize {
        if self.greyscale {
            1
        } else {
            3
        }
    }

    fn grey_chroma(&self, picture: &mut Picture) {
        if self.greyscale {
            picture.planes[1].fill(128);
            picture.planes[2].fill(128);
        }
    }

    /// Codes `source`, writing the macroblocks and the decoder's reconstruction of them.
    pub fn encode(&self, w: &mut UnitWriter<'_>, source: &Picture, recon: &mut Picture) -> Result<BlockCounts, CodecError> {
        let mut counts = BlockCounts::default();
        let mut mb_levels: Vec<Vec<i32>> = vec![Vec::new(); 3];
        for mb_y in 0..self.mb_height {
            for mb_x in 0..self.mb_width {
                let q = self.quantizers[mb_y * self.mb_width + mb_x] as i32;
                let mut any = false;
                for (plane, plane_levels) in mb_levels.iter_mut().enumerate().take(self.coded_planes()) {
                    plane_levels.clear();
                    let size = block_size(plane);
                    let (pw, ph) = source.plane_size(plane);
                    for (x, y) in block_samples(pw, ph, size, mb_x, mb_y) {
                        let i = y * pw + x;
                        let level = quantize(source.planes[plane][i] as i32 - self.predictor(plane, i), q);
                        any |= level != 0;
                        plane_levels.push(level);
                    }
                }

                let skip = self.reference.is_some() && !any;
                if self.reference.is_some() {
                    w.put_u8(u8::from(!skip))?;
                }
                if self.reference.is_none() {
                    counts.intra += 1;
                } else if skip {
                    counts.uncoded += 1;
                } else {
                    counts.inter += 1;
                }

                for (plane, plane_levels) in mb_levels.iter().enumerate().take(self.coded_planes()) {
                    if !skip {
                        write_levels(w, plane_levels)?;
                    }
                    let size = block_size(plane);
                    let (pw, ph) = source.plane_size(plane);
                    for ((x, y), &level) in block_samples(pw, ph, size, mb_x, mb_y).zip(plane_levels) {
                        let i = y * pw + x;
                        recon.planes[plane][i] = (self.predictor(plane, i) + level * 2 * q).clamp(0, 255) as u8;
                    }
                }
            }
        }
        self.grey_chroma(recon);
        Ok(counts)
    }

    pub fn decode(&self, r: &mut PayloadReader<'_>, picture: &mut Picture) -> Result<(), CodecError> {
        let mut levels = Vec::with_capacity(MB_SIZE * MB_SIZE);
        for mb_y in 0..self.mb_height {
            for mb_x in 0..self.mb_width {
                let q = self.quantizers[mb_y * self.mb_width + mb_x] as i32;
                let coded = match self.reference {
                    Some(_) => r.u8()? != 0,
                    None => true,
                };
                for plane in 0..self.coded_planes() {
                    let size = block_size(plane);
                    let (pw, ph) = picture.plane_size(plane);
                    let samples = block_samples(pw, ph, size, mb_x, mb_y).count();
                    levels.clear();
                    if coded {
                        read_levels(r, samples, &mut levels)?;
                    } else {
                        levels.resize(samples, 0);
                    }
                    for ((x, y), &level) in block_samples(pw, ph, size, mb_x, mb_y).zip(&levels) {
                        let i = y * pw + x;
                        picture.planes[plane][i] = (self.predictor(plane, i) + level * 2 * q).clamp(0, 255) as u8;
                    }
                }
            }
        }
        self.grey_chroma(picture);
        Ok(())
    }
}

/// Codes a block as (zero run, level) pairs preceded by the pair count.
fn write_levels(w: &mut UnitWriter<'_>, levels: &[i32]) -> Result<(), CodecError> {
    let pairs = levels.iter().filter(|&&l| l != 0).count();
    w.put_varint(pairs as u32)?;
    let mut run = 0;
    for &level in levels {
        if level == 0 {
            run += 1;
        } else {
            w.put_varint(run)?;
            w.put_signed(level)?;
            run = 0;
        }
    }
    Ok(())
}

fn read_levels(r: &mut PayloadReader<'_>, samples: usize, levels: &mut Vec<i32>) -> Result<(), CodecError> {
    let pairs = r.varint()? as usize;
    for _ in 0..pairs {
        let run = r.varint()? as usize;
        if levels.len() + run >= samples {
            return Err(CodecError::FORMAT);
        }
        levels.resize(levels.len() + run, 0);
        let level = r.signed()?;
        if !(-MAX_LEVEL..=MAX_LEVEL).contains(&level) {
            return Err(CodecError::FORMAT);
        }
        levels.push(level);
    }
    levels.resize(samples, 0);
    Ok(())
}
