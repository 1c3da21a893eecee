/*
 *  display/canvas.rs
 *
 *  usbd480fb - USB raster display driver
 *  (c) 2020-26 Stuart Hunter
 *
 *  embedded-graphics draw target over an exposed frame
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  See <http://www.gnu.org/licenses/> to get a copy of the GNU General
 *  Public License.
 *
 */

use embedded_graphics::geometry::{OriginDimensions, Size};
use embedded_graphics::pixelcolor::raw::RawU16;
use embedded_graphics::pixelcolor::{IntoStorage, Rgb565};
use embedded_graphics::prelude::*;
use thiserror::Error;

use crate::display::memory::{FrameHandle, WeakFrame};
use crate::display::traits::PixelBufferInfo;

/// The session behind the canvas has been detached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("frame memory has been released")]
pub struct FrameReleased;

/// Draws RGB565 pixels, little endian, straight into frame memory.
///
/// Each draw call holds the frame lock once for the whole batch. The canvas
/// does not keep the frame alive; once its session detaches every draw
/// fails with [`FrameReleased`].
#[derive(Debug, Clone)]
pub struct FrameCanvas {
    frame: WeakFrame,
    w: usize,
    h: usize,
    stride: usize,
}

impl FrameCanvas {
    pub fn new(frame: WeakFrame, info: &PixelBufferInfo) -> Self {
        Self {
            frame,
            w: info.width as usize,
            h: info.height as usize,
            stride: info.line_length,
        }
    }

    /// Byte offset of a pixel, None when off the frame
    #[inline]
    fn offset(&self, p: Point) -> Option<usize> {
        if p.x >= 0 && p.y >= 0 {
            let (x, y) = (p.x as usize, p.y as usize);
            if x < self.w && y < self.h {
                return Some(y * self.stride + x * 2);
            }
        }
        None
    }

    fn frame(&self) -> Result<FrameHandle, FrameReleased> {
        self.frame.upgrade().ok_or(FrameReleased)
    }

    /// Read a pixel back
    pub fn pixel(&self, p: Point) -> Option<Rgb565> {
        let i = self.offset(p)?;
        self.frame().ok()?.read(|bytes| {
            bytes
                .get(i..i + 2)
                .map(|px| Rgb565::from(RawU16::new(u16::from_le_bytes([px[0], px[1]]))))
        })
    }
}

impl OriginDimensions for FrameCanvas {
    fn size(&self) -> Size {
        Size::new(self.w as u32, self.h as u32)
    }
}

impl DrawTarget for FrameCanvas {
    type Color = Rgb565;
    type Error = FrameReleased;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        self.frame()?.write(|bytes| {
            for Pixel(p, c) in pixels {
                if let Some(px) = self.offset(p).and_then(|i| bytes.get_mut(i..i + 2)) {
                    px.copy_from_slice(&c.into_storage().to_le_bytes());
                }
            }
        });
        Ok(())
    }

    fn clear(&mut self, color: Self::Color) -> Result<(), Self::Error> {
        let raw = color.into_storage().to_le_bytes();
        self.frame()?.write(|bytes| {
            for px in bytes.chunks_exact_mut(2) {
                px.copy_from_slice(&raw);
            }
        });
        Ok(())
    }
}
