// Copyright (C) 2026 The sanchez developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory frames and the append-only frame store.

use bytes::Bytes;

use crate::{Config, Error, FormatError, MAX_FRAME_COUNT};

/// One still image: row-major 8-bit RGB, `width * height * 3` bytes.
///
/// All frames within one container or stream share the same geometry.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Bytes,
}

impl Frame {
    /// Wraps row-major RGB bytes, validating the length against the
    /// geometry.
    pub fn from_rgb(width: u32, height: u32, data: impl Into<Bytes>) -> Result<Self, Error> {
        if width == 0 || height == 0 {
            return Err(FormatError::UnsupportedGeometry { width, height }.into());
        }
        let data = data.into();
        let expected = (width as usize) * (height as usize) * 3;
        if data.len() != expected {
            return Err(FormatError::ShortFrame {
                expected,
                actual: data.len(),
            }
            .into());
        }
        Ok(Frame {
            width,
            height,
            data,
        })
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    #[inline]
    pub fn into_data(self) -> Bytes {
        self.data
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Append-only collection of same-geometry frames, used by the container
/// writer and the stream server.
#[derive(Debug)]
pub struct FrameStore {
    width: u32,
    height: u32,
    frames: Vec<Frame>,
}

impl FrameStore {
    pub fn new(width: u32, height: u32) -> Result<Self, Error> {
        // Validate geometry up front so push never has to re-check ranges.
        Config::new(width, height, 0)?;
        Ok(FrameStore {
            width,
            height,
            frames: Vec::new(),
        })
    }

    /// Appends a frame, enforcing the store's geometry.
    pub fn push(&mut self, frame: Frame) -> Result<(), Error> {
        if (frame.width(), frame.height()) != (self.width, self.height) {
            return Err(Error::Geometry {
                expected_width: self.width,
                expected_height: self.height,
                width: frame.width(),
                height: frame.height(),
            });
        }
        if self.frames.len() as u32 == MAX_FRAME_COUNT {
            return Err(Error::Overflow {
                field: "frame_count",
                value: u64::from(MAX_FRAME_COUNT) + 1,
                max: MAX_FRAME_COUNT.into(),
            });
        }
        self.frames.push(frame);
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[inline]
    pub fn get(&self, i: usize) -> Option<&Frame> {
        self.frames.get(i)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Frame> {
        self.frames.iter()
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// The container config describing this store's current contents.
    pub fn config(&self) -> Result<Config, Error> {
        Config::new(self.width, self.height, self.frames.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Frame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for _ in 0..width * height {
            data.extend_from_slice(&rgb);
        }
        Frame::from_rgb(width, height, data).unwrap()
    }

    #[test]
    fn frame_length_enforced() {
        Frame::from_rgb(2, 2, vec![0u8; 12]).unwrap();
        Frame::from_rgb(2, 2, vec![0u8; 11]).unwrap_err();
        Frame::from_rgb(2, 2, vec![0u8; 13]).unwrap_err();
        Frame::from_rgb(0, 2, vec![]).unwrap_err();
    }

    #[test]
    fn store_enforces_geometry() {
        let mut store = FrameStore::new(2, 2).unwrap();
        store.push(solid(2, 2, [0xff, 0, 0])).unwrap();
        match store.push(solid(3, 2, [0, 0xff, 0])) {
            Err(Error::Geometry { .. }) => {}
            o => panic!("expected geometry error, got {:?}", o),
        }
        assert_eq!(store.len(), 1);
        let config = store.config().unwrap();
        assert_eq!((config.width(), config.height()), (2, 2));
        assert_eq!(config.frame_count(), 1);
    }

    #[test]
    fn store_rejects_bad_geometry() {
        FrameStore::new(0, 2).unwrap_err();
        FrameStore::new(2, 10_000).unwrap_err();
    }
}
