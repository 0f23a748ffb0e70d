//! MJPEG stream splitting
//!
//! `rpicam-vid --codec mjpeg -o -` emits back-to-back JPEGs on stdout with
//! no framing. Frames are recovered by scanning for the JPEG start/end
//! markers (SOI `FF D8`, EOI `FF D9`); reads can split a frame anywhere so
//! the assembler carries partial data between pushes.

use bytes::{Bytes, BytesMut};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Incremental splitter turning a raw MJPEG byte stream into whole JPEGs.
#[derive(Default)]
pub struct JpegAssembler {
    buf: BytesMut,
}

impl JpegAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning any frames completed by this chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find_marker(&self.buf, SOI) else {
                // No frame start in sight; junk before a future SOI is
                // unbounded only if the encoder misbehaves, keep the tail.
                let keep = self.buf.len().min(1);
                let drop = self.buf.len() - keep;
                if drop > 0 {
                    let _ = self.buf.split_to(drop);
                }
                return frames;
            };
            // Discard garbage before the frame start
            if start > 0 {
                let _ = self.buf.split_to(start);
            }

            let Some(end) = find_marker(&self.buf[SOI.len()..], EOI) else {
                return frames;
            };
            let frame_len = SOI.len() + end + EOI.len();
            frames.push(self.buf.split_to(frame_len).freeze());
        }
    }

    /// Bytes of the partial frame currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn find_marker(haystack: &[u8], marker: [u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == marker)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut v = SOI.to_vec();
        v.extend_from_slice(body);
        v.extend_from_slice(&EOI);
        v
    }

    #[test]
    fn single_frame_in_one_push() {
        let mut asm = JpegAssembler::new();
        let frames = asm.push(&jpeg(b"hello"));
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &jpeg(b"hello")[..]);
        assert_eq!(asm.buffered(), 0);
    }

    #[test]
    fn frame_split_across_pushes() {
        let data = jpeg(&[0x11; 64]);
        let mut asm = JpegAssembler::new();

        assert!(asm.push(&data[..10]).is_empty());
        assert!(asm.push(&data[10..40]).is_empty());
        let frames = asm.push(&data[40..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &data[..]);
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut wire = jpeg(b"one");
        wire.extend(jpeg(b"two"));
        wire.extend(jpeg(b"three"));

        let mut asm = JpegAssembler::new();
        let frames = asm.push(&wire);
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[1][..], &jpeg(b"two")[..]);
    }

    #[test]
    fn garbage_before_soi_is_discarded() {
        let mut wire = vec![0x00, 0x01, 0x02];
        wire.extend(jpeg(b"ok"));

        let mut asm = JpegAssembler::new();
        let frames = asm.push(&wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &jpeg(b"ok")[..]);
    }

    #[test]
    fn eoi_marker_split_across_chunk_boundary() {
        let data = jpeg(b"payload");
        let cut = data.len() - 1; // split inside the EOI marker
        let mut asm = JpegAssembler::new();
        assert!(asm.push(&data[..cut]).is_empty());
        let frames = asm.push(&data[cut..]);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn body_containing_marker_like_bytes() {
        // 0xFF 0xD9 inside the entropy-coded body would truncate; real
        // encoders escape those, so the splitter treating the first EOI as
        // the end matches what rpicam-vid produces.
        let data = jpeg(b"\x01\x02\x03");
        let mut asm = JpegAssembler::new();
        assert_eq!(asm.push(&data).len(), 1);
    }
}
