use crate::error::{Error, Result};

/// The memory layout of an image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ColorSpace {
    /// 4:2:0 with separate Y, U and V planes.
    #[default]
    Planar,
    /// 4:2:0 packed into a single buffer, Y then U then V.
    I420,
    /// 4:2:0 packed into a single buffer, Y then V then U.
    Yv12,
    Yuy2,
    Uyvy,
    Yvyu,
    Rgb,
    Bgr,
    Bgra,
    Abgr,
    Rgba,
    Argb,
    Rgb555,
    Rgb565,
    /// Decode output only: exposes the decoder's own planes without copying.
    Internal,
    /// Decode output only: no image is produced.
    NoOutput,
}

impl ColorSpace {
    pub fn plane_count(&self) -> usize {
        match self {
            Self::Planar | Self::Internal => 3,
            Self::NoOutput => 0,
            _ => 1,
        }
    }

    /// The average number of bits each pixel occupies in the given plane.
    pub fn bits_per_pixel(&self, plane: usize) -> usize {
        match self {
            Self::Planar | Self::Internal => match plane {
                0 => 8,
                _ => 2,
            },
            Self::I420 | Self::Yv12 => 12,
            Self::Yuy2 | Self::Uyvy | Self::Yvyu | Self::Rgb555 | Self::Rgb565 => 16,
            Self::Rgb | Self::Bgr => 24,
            Self::Bgra | Self::Abgr | Self::Rgba | Self::Argb => 32,
            Self::NoOutput => 0,
        }
    }

    /// The number of bits each pixel occupies in one row of the given plane. This differs from
    /// `bits_per_pixel` for layouts with vertically subsampled chroma.
    pub fn row_bits(&self, plane: usize) -> usize {
        match self {
            Self::Planar | Self::Internal => match plane {
                0 => 8,
                _ => 4,
            },
            Self::I420 | Self::Yv12 => 8,
            _ => self.bits_per_pixel(plane),
        }
    }

    /// The stride used for a plane when the caller leaves it as zero.
    pub fn tight_stride(&self, plane: usize, width: u32) -> usize {
        (width as usize * self.row_bits(plane) + 7) / 8
    }

    /// The smallest buffer that can hold a plane with the given stride.
    pub fn min_plane_len(&self, plane: usize, height: u32, stride: usize) -> usize {
        let row_bits = self.row_bits(plane);
        if row_bits == 0 {
            return 0;
        }
        ((stride as u64 * height as u64 * self.bits_per_pixel(plane) as u64) / row_bits as u64) as usize
    }

    fn is_output_only(&self) -> bool {
        matches!(self, Self::Internal | Self::NoOutput)
    }
}

/// An image made of one or more planes. Input images may borrow their planes (`Image<&[u8]>`);
/// output images own them so that the decoder can allocate missing ones.
///
/// A stride of zero means the plane's rows are tightly packed. An empty `strides` vector is the same
/// as all zeros.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Image<P = Vec<u8>> {
    pub color_space: ColorSpace,
    pub vertical_flip: bool,
    pub planes: Vec<P>,
    pub strides: Vec<usize>,
}

impl<P> Image<P> {
    pub fn new(color_space: ColorSpace) -> Self {
        Self {
            color_space,
            vertical_flip: false,
            planes: Vec::new(),
            strides: Vec::new(),
        }
    }

    /// Returns the stride of every plane, substituting the tight row length for zeros.
    pub fn effective_strides(&self, width: u32) -> Vec<usize> {
        (0..self.color_space.plane_count())
            .map(|i| match self.strides.get(i).copied().unwrap_or(0) {
                0 => self.color_space.tight_stride(i, width),
                s => s,
            })
            .collect()
    }

    fn check_stride_count(&self) -> Result<()> {
        let expected = self.color_space.plane_count();
        if !self.strides.is_empty() && self.strides.len() != expected {
            return Err(Error::usage(format!(
                "{:?} images have {} planes but {} strides were given",
                self.color_space,
                expected,
                self.strides.len()
            )));
        }
        Ok(())
    }

    fn check_stride(&self, plane: usize, stride: usize, width: u32) -> Result<()> {
        let tight = self.color_space.tight_stride(plane, width);
        if stride < tight {
            return Err(Error::usage(format!("stride {stride} of plane {plane} is less than the row length {tight}")));
        }
        Ok(())
    }
}

impl<P: AsRef<[u8]>> Image<P> {
    /// Validates the image as codec input and borrows its planes.
    pub(crate) fn native_input(&self, width: u32, height: u32) -> Result<ImageRef<'_>> {
        if self.color_space.is_output_only() {
            return Err(Error::usage(format!("{:?} cannot be used as an input layout", self.color_space)));
        }
        let expected = self.color_space.plane_count();
        if self.planes.len() != expected {
            return Err(Error::usage(format!(
                "{:?} images have {} planes but {} were given",
                self.color_space,
                expected,
                self.planes.len()
            )));
        }
        self.check_stride_count()?;
        let strides = self.effective_strides(width);
        for (i, (plane, &stride)) in self.planes.iter().zip(&strides).enumerate() {
            self.check_stride(i, stride, width)?;
            let min = self.color_space.min_plane_len(i, height, stride);
            if plane.as_ref().len() < min {
                return Err(Error::usage(format!("plane {i} is {} bytes but at least {min} are required", plane.as_ref().len())));
            }
        }
        Ok(ImageRef {
            color_space: self.color_space,
            vertical_flip: self.vertical_flip,
            planes: self.planes.iter().map(|p| p.as_ref()).collect(),
            strides,
        })
    }
}

impl Image<Vec<u8>> {
    /// Validates the image as codec output, allocating planes the caller left empty and replacing
    /// zero strides with the tight row length.
    pub(crate) fn native_output(&mut self, width: u32, height: u32) -> Result<NativeOutput<'_>> {
        match self.color_space {
            ColorSpace::NoOutput | ColorSpace::Internal => {
                if !self.planes.is_empty() {
                    return Err(Error::usage(format!("{:?} output must not supply planes", self.color_space)));
                }
                return Ok(match self.color_space {
                    ColorSpace::Internal => NativeOutput::Internal,
                    _ => NativeOutput::None,
                });
            }
            _ => {}
        }
        if width == 0 || height == 0 {
            return Ok(NativeOutput::None);
        }

        let expected = self.color_space.plane_count();
        if self.planes.is_empty() {
            self.planes.resize_with(expected, Vec::new);
        } else if self.planes.len() != expected {
            return Err(Error::usage(format!(
                "{:?} images have {} planes but {} were given",
                self.color_space,
                expected,
                self.planes.len()
            )));
        }
        self.check_stride_count()?;
        let strides = self.effective_strides(width);
        for (i, &stride) in strides.iter().enumerate() {
            self.check_stride(i, stride, width)?;
            let min = self.color_space.min_plane_len(i, height, stride);
            let plane = &mut self.planes[i];
            if plane.is_empty() {
                plane.resize(min, 0);
            } else if plane.len() < min {
                return Err(Error::usage(format!("plane {i} is {} bytes but at least {min} are required", plane.len())));
            }
        }
        self.strides.clone_from(&strides);

        Ok(NativeOutput::Planes(ImageMut {
            color_space: self.color_space,
            vertical_flip: self.vertical_flip,
            planes: self.planes.iter_mut().map(|p| p.as_mut_slice()).collect(),
            strides,
        }))
    }
}

/// A borrowed, validated, read-only image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRef<'a> {
    pub color_space: ColorSpace,
    pub vertical_flip: bool,
    pub planes: Vec<&'a [u8]>,
    pub strides: Vec<usize>,
}

impl<'a> ImageRef<'a> {
    /// Copies the planes out into an owned image.
    pub fn to_image(&self) -> Image {
        Image {
            color_space: self.color_space,
            vertical_flip: self.vertical_flip,
            planes: self.planes.iter().map(|p| p.to_vec()).collect(),
            strides: self.strides.clone(),
        }
    }

    /// Returns row `y` of a plane, `len` bytes long.
    pub fn row(&self, plane: usize, y: usize, len: usize) -> &'a [u8] {
        let start = y * self.strides[plane];
        &self.planes[plane][start..start + len]
    }
}

/// A borrowed, validated, writable image.
#[derive(Debug)]
pub struct ImageMut<'a> {
    pub color_space: ColorSpace,
    pub vertical_flip: bool,
    pub planes: Vec<&'a mut [u8]>,
    pub strides: Vec<usize>,
}

/// Where the codec should put a decoded picture.
#[derive(Debug)]
pub enum NativeOutput<'a> {
    /// Nothing is written, either by request or because the dimensions aren't known yet.
    None,
    /// The picture stays in the codec's buffers and is exposed afterwards.
    Internal,
    Planes(ImageMut<'a>),
}
