// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Binary framing for the `/buffers` WebSocket's data path: a magic byte,
//! a length-prefixed session id, then a snapshot payload (see
//! [`crate::snapshot`]). This mirrors the daemon's own `Chunk` framing
//! (kind tag + little-endian length prefix + payload) one level up, wrapping
//! a whole session id + snapshot instead of a single data chunk.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

pub const BUFFER_FRAME_MAGIC: u8 = 0xBF;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error decoding buffer frame: {0}")]
    Io(#[from] io::Error),
    #[error("bad magic byte, expected 0xBF")]
    BadMagic,
    #[error("session id is not valid utf-8")]
    InvalidUtf8,
}

/// A single binary frame pushed to a `/buffers` subscriber: the session id
/// it belongs to, plus the raw snapshot payload bytes (already encoded via
/// [`crate::snapshot::GridSnapshot::encode`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferFrame {
    pub session_id: String,
    pub snapshot: Vec<u8>,
}

impl BufferFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 4 + self.session_id.len() + self.snapshot.len());
        self.encode_into(&mut out).expect("writing to a Vec<u8> cannot fail");
        out
    }

    pub fn encode_into<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(BUFFER_FRAME_MAGIC)?;
        w.write_u32::<LittleEndian>(self.session_id.len() as u32)?;
        w.write_all(self.session_id.as_bytes())?;
        w.write_all(&self.snapshot)?;
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let mut cursor = io::Cursor::new(buf);
        Self::decode_from(&mut cursor)
    }

    pub fn decode_from<R: Read>(r: &mut R) -> Result<Self, FrameError> {
        let magic = r.read_u8()?;
        if magic != BUFFER_FRAME_MAGIC {
            return Err(FrameError::BadMagic);
        }
        let id_len = r.read_u32::<LittleEndian>()?;
        let mut id_bytes = vec![0u8; id_len as usize];
        r.read_exact(&mut id_bytes)?;
        let session_id = String::from_utf8(id_bytes).map_err(|_| FrameError::InvalidUtf8)?;

        let mut snapshot = Vec::new();
        r.read_to_end(&mut snapshot)?;

        Ok(BufferFrame { session_id, snapshot })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn buffer_frame_round_trip() {
        let frame = BufferFrame {
            session_id: "11111111-1111-1111-1111-111111111111".to_string(),
            snapshot: vec![0x56, 0x54, 0x01, 0, 1, 2, 3],
        };
        let encoded = frame.encode();
        assert_eq!(encoded[0], BUFFER_FRAME_MAGIC);
        let decoded = BufferFrame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = [0x00, 0, 0, 0, 0];
        let err = BufferFrame::decode(&buf).unwrap_err();
        assert!(matches!(err, FrameError::BadMagic));
    }
}
