// Copyright (C) 2026 The sanchez developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `.sanchez` container file reader and writer.
//!
//! Layout (bit-exact):
//! * line 1: single-line JSON metadata object, `\n`-terminated;
//! * line 2: 15 ASCII digits `WWWWHHHHFFFFFFF`, `\n`-terminated;
//! * lines 3..: one frame per line (see [crate::codec]), each
//!   `\n`-terminated, ending the file with a trailing newline.
//!
//! The writer picks one encoding for the whole file; the reader dispatches
//! per line, so mixed files are accepted.

use std::io::{BufRead, Write};

use log::trace;

use crate::codec::{self, Encoding};
use crate::frame::{Frame, FrameStore};
use crate::{Config, Error, FormatError, Metadata};

/// Writes a `.sanchez` file: header up front, then exactly
/// `config.frame_count()` frames.
pub struct Writer<W: Write> {
    sink: W,
    config: Config,
    encoding: Encoding,
    written: u32,
}

impl<W: Write> Writer<W> {
    /// Emits the metadata and config lines.
    pub fn new(
        mut sink: W,
        metadata: &Metadata,
        config: Config,
        encoding: Encoding,
    ) -> Result<Self, Error> {
        let json = serde_json::to_string(metadata).map_err(FormatError::InvalidJson)?;
        sink.write_all(json.as_bytes())?;
        sink.write_all(b"\n")?;
        sink.write_all(config.encode_line().as_bytes())?;
        sink.write_all(b"\n")?;
        Ok(Writer {
            sink,
            config,
            encoding,
            written: 0,
        })
    }

    /// Appends one frame line. The frame must match the config geometry,
    /// and no more than `frame_count` frames may be written.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        if (frame.width(), frame.height()) != (self.config.width(), self.config.height()) {
            return Err(Error::Geometry {
                expected_width: self.config.width(),
                expected_height: self.config.height(),
                width: frame.width(),
                height: frame.height(),
            });
        }
        if self.written == self.config.frame_count() {
            return Err(FormatError::FrameCountMismatch {
                expected: self.config.frame_count(),
                actual: self.written + 1,
            }
            .into());
        }
        let line = codec::encode_line(frame, self.encoding)?;
        self.sink.write_all(line.as_bytes())?;
        self.sink.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    /// Flushes and returns the sink, verifying the declared frame count was
    /// reached.
    pub fn finish(mut self) -> Result<W, Error> {
        if self.written != self.config.frame_count() {
            return Err(FormatError::FrameCountMismatch {
                expected: self.config.frame_count(),
                actual: self.written,
            }
            .into());
        }
        self.sink.flush()?;
        Ok(self.sink)
    }
}

/// One-shot write of a whole [FrameStore].
pub fn write<W: Write>(
    sink: W,
    metadata: &Metadata,
    store: &FrameStore,
    encoding: Encoding,
) -> Result<W, Error> {
    let config = store.config()?;
    let mut w = Writer::new(sink, metadata, config, encoding)?;
    for frame in store.iter() {
        w.write_frame(frame)?;
    }
    w.finish()
}

/// Reads a `.sanchez` file: the header eagerly, frames lazily.
#[derive(Debug)]
pub struct Reader<R: BufRead> {
    src: R,
    metadata: Metadata,
    config: Config,
    read: u32,
}

impl<R: BufRead> Reader<R> {
    /// Consumes exactly the two header lines.
    pub fn new(mut src: R) -> Result<Self, Error> {
        let meta_line = read_line(&mut src)?
            .ok_or(FormatError::MalformedHeader("missing metadata line"))?;
        let metadata: Metadata =
            serde_json::from_str(&meta_line).map_err(FormatError::InvalidJson)?;
        let config_line = read_line(&mut src)?
            .ok_or(FormatError::MalformedHeader("missing config line"))?;
        let config = Config::parse_line(&config_line)?;
        trace!(
            "container header: {}x{}, {} frames",
            config.width(),
            config.height(),
            config.frame_count()
        );
        Ok(Reader {
            src,
            metadata,
            config,
            read: 0,
        })
    }

    #[inline]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    #[inline]
    pub fn config(&self) -> Config {
        self.config
    }

    /// Reads the next frame line, or `None` at the declared end of stream.
    pub fn read_frame(&mut self) -> Result<Option<Frame>, Error> {
        if self.read == self.config.frame_count() {
            // Anything beyond the declared count is an error, not a frame.
            return match read_line(&mut self.src)? {
                None => Ok(None),
                Some(_) => Err(FormatError::TrailingData.into()),
            };
        }
        let line = match read_line(&mut self.src)? {
            Some(l) => l,
            None => {
                return Err(FormatError::FrameCountMismatch {
                    expected: self.config.frame_count(),
                    actual: self.read,
                }
                .into())
            }
        };
        let data = codec::decode_line(&line, &self.config)?;
        self.read += 1;
        Ok(Some(Frame::from_rgb(
            self.config.width(),
            self.config.height(),
            data,
        )?))
    }

    /// Lazy, finite, non-restartable frame sequence.
    pub fn frames(self) -> Frames<R> {
        Frames {
            reader: Some(self),
        }
    }

    /// Reads the remaining frames into a [FrameStore].
    pub fn read_store(mut self) -> Result<(Metadata, FrameStore), Error> {
        let mut store = FrameStore::new(self.config.width(), self.config.height())?;
        while let Some(frame) = self.read_frame()? {
            store.push(frame)?;
        }
        Ok((self.metadata, store))
    }
}

/// Iterator over a reader's frames. Fuses after the first error or the end
/// of the stream.
pub struct Frames<R: BufRead> {
    reader: Option<Reader<R>>,
}

impl<R: BufRead> Iterator for Frames<R> {
    type Item = Result<Frame, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        match reader.read_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.reader = None;
                None
            }
            Err(e) => {
                self.reader = None;
                Some(Err(e))
            }
        }
    }
}

/// Reads one `\n`-terminated line, without the terminator. `None` on EOF.
fn read_line<R: BufRead>(src: &mut R) -> Result<Option<String>, Error> {
    let mut line = String::new();
    if src.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    if line.ends_with('\n') {
        line.pop();
    }
    Ok(Some(line))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_metadata() -> Metadata {
        Metadata {
            title: "t".to_owned(),
            creator: "c".to_owned(),
            created_at: "2026-01-02T01:30:43Z".to_owned(),
            seconds: "0.04".to_owned(),
        }
    }

    fn single_frame_store() -> FrameStore {
        let mut store = FrameStore::new(2, 2).unwrap();
        store
            .push(
                Frame::from_rgb(
                    2,
                    2,
                    vec![
                        0xff, 0x00, 0x00, 0x00, 0xff, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff, 0xff,
                    ],
                )
                .unwrap(),
            )
            .unwrap();
        store
    }

    fn round_trip(encoding: Encoding) {
        let store = single_frame_store();
        let bytes = write(Vec::new(), &test_metadata(), &store, encoding).unwrap();
        let reader = Reader::new(&bytes[..]).unwrap();
        assert_eq!(reader.metadata(), &test_metadata());
        assert_eq!(reader.config().frame_count(), 1);
        let (_, back) = reader.read_store().unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back.get(0).unwrap().data(), store.get(0).unwrap().data());
    }

    #[test]
    fn round_trip_compressed() {
        round_trip(Encoding::Compressed);
    }

    #[test]
    fn round_trip_hex() {
        round_trip(Encoding::Hex);
    }

    #[test]
    fn single_frame_file_layout() {
        let bytes = write(
            Vec::new(),
            &test_metadata(),
            &single_frame_store(),
            Encoding::Hex,
        )
        .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.ends_with('\n'));
        let lines: Vec<&str> = text.trim_end_matches('\n').split('\n').collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "000200020000001");
        assert_eq!(lines[2], "{FF0000,00FF00,0000FF,FFFFFF}");
    }

    #[test]
    fn mixed_encodings_accepted() {
        let mut file = String::new();
        file.push_str(&serde_json::to_string(&test_metadata()).unwrap());
        file.push('\n');
        file.push_str("000100020000002\n");
        // One compressed line, one hex line.
        let px = Frame::from_rgb(1, 2, vec![1, 2, 3, 4, 5, 6]).unwrap();
        file.push_str(&codec::encode_line(&px, Encoding::Compressed).unwrap());
        file.push('\n');
        file.push_str("{010203,040506}\n");
        let (_, store) = Reader::new(file.as_bytes()).unwrap().read_store().unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(0).unwrap().data(), store.get(1).unwrap().data());
    }

    #[test]
    fn geometry_mismatch_on_write() {
        let config = Config::new(2, 2, 2).unwrap();
        let header = format!(
            "{}\n{}\n",
            serde_json::to_string(&test_metadata()).unwrap(),
            config.encode_line()
        );
        let mut sink = Vec::new();
        let mut w = Writer::new(&mut sink, &test_metadata(), config, Encoding::Hex).unwrap();
        let bad = Frame::from_rgb(3, 2, vec![0u8; 18]).unwrap();
        match w.write_frame(&bad) {
            Err(Error::Geometry { .. }) => {}
            o => panic!("expected geometry error, got {:?}", o),
        }
        drop(w);
        assert_eq!(sink.len(), header.len(), "no bytes written beyond header");
    }

    #[test]
    fn frame_count_enforced_on_write() {
        let config = Config::new(2, 2, 2).unwrap();
        let frame = single_frame_store().get(0).unwrap().clone();
        let mut w = Writer::new(Vec::new(), &test_metadata(), config, Encoding::Hex).unwrap();
        w.write_frame(&frame).unwrap();
        match w.finish() {
            Err(Error::Format(FormatError::FrameCountMismatch { .. })) => {}
            o => panic!("expected count mismatch, got {:?}", o),
        }
    }

    #[test]
    fn trailing_frame_line_rejected() {
        let store = single_frame_store();
        let mut bytes = write(Vec::new(), &test_metadata(), &store, Encoding::Hex).unwrap();
        bytes.extend_from_slice(b"{FF0000,00FF00,0000FF,FFFFFF}\n");
        let mut reader = Reader::new(&bytes[..]).unwrap();
        reader.read_frame().unwrap().unwrap();
        match reader.read_frame() {
            Err(Error::Format(FormatError::TrailingData)) => {}
            o => panic!("expected trailing data, got {:?}", o),
        }
    }

    #[test]
    fn truncated_file_rejected() {
        let store = single_frame_store();
        let bytes = write(Vec::new(), &test_metadata(), &store, Encoding::Hex).unwrap();
        // Drop the frame line entirely.
        let header_end = bytes
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == b'\n')
            .nth(1)
            .unwrap()
            .0;
        let mut reader = Reader::new(&bytes[..=header_end]).unwrap();
        match reader.read_frame() {
            Err(Error::Format(FormatError::FrameCountMismatch { .. })) => {}
            o => panic!("expected count mismatch, got {:?}", o),
        }
    }

    #[test]
    fn bad_headers_rejected() {
        Reader::new(&b""[..]).unwrap_err();
        Reader::new(&b"not json\n000200020000001\n"[..]).unwrap_err();
        Reader::new(&b"{\"title\":\"t\",\"creator\":\"c\",\"created_at\":\"x\",\"seconds\":\"1\"}\n"[..])
            .unwrap_err();
        Reader::new(
            &b"{\"title\":\"t\",\"creator\":\"c\",\"created_at\":\"x\",\"seconds\":\"1\"}\nshort\n"[..],
        )
        .unwrap_err();
    }

    #[test]
    fn frames_iterator_is_lazy_and_fused() {
        let mut store = FrameStore::new(1, 1).unwrap();
        for i in 0..3u8 {
            store
                .push(Frame::from_rgb(1, 1, vec![i, i, i]).unwrap())
                .unwrap();
        }
        let bytes = write(Vec::new(), &test_metadata(), &store, Encoding::Compressed).unwrap();
        let mut it = Reader::new(&bytes[..]).unwrap().frames();
        assert_eq!(it.next().unwrap().unwrap().data()[0], 0);
        assert_eq!(it.next().unwrap().unwrap().data()[0], 1);
        assert_eq!(it.next().unwrap().unwrap().data()[0], 2);
        assert!(it.next().is_none());
        assert!(it.next().is_none());
    }
}
