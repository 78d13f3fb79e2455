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

//! Asciinema v2 event types for `stream-out`. The first line of the file is
//! a [`StreamHeader`]; every subsequent line is a [`StreamEvent`] encoded as
//! a three-element JSON array.

use serde::de::Error as _;
use serde_derive::{Deserialize as De, Serialize as Se};

#[derive(Se, De, Debug, Clone, PartialEq)]
pub struct StreamHeader {
    pub version: u32,
    pub width: u32,
    pub height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

impl StreamHeader {
    pub fn new(width: u32, height: u32) -> Self {
        StreamHeader { version: 2, width, height, timestamp: None }
    }
}

/// A single `[timestamp, kind, payload]` asciinema record.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Output { at: f64, data: String },
    Resize { at: f64, cols: u32, rows: u32 },
    Exit { at: f64, code: i32, session_id: String },
}

impl StreamEvent {
    pub fn to_line(&self) -> String {
        serde_json::to_string(&self.to_json()).expect("StreamEvent always serializes")
    }

    fn to_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            StreamEvent::Output { at, data } => json!([at, "o", data]),
            StreamEvent::Resize { at, cols, rows } => json!([at, "r", format!("{cols}x{rows}")]),
            StreamEvent::Exit { at, code, session_id } => json!([at, "x", ["exit", code, session_id]]),
        }
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(line)?;
        let arr = value.as_array().ok_or_else(|| {
            serde::de::Error::custom("expected a three-element array")
        })?;
        if arr.len() != 3 {
            return Err(serde::de::Error::custom("expected exactly three elements"));
        }
        let at = arr[0].as_f64().ok_or_else(|| serde::de::Error::custom("timestamp must be a number"))?;
        let kind = arr[1].as_str().ok_or_else(|| serde::de::Error::custom("kind must be a string"))?;

        match kind {
            "o" => {
                let data = arr[2].as_str().ok_or_else(|| serde::de::Error::custom("payload must be a string"))?;
                Ok(StreamEvent::Output { at, data: data.to_string() })
            }
            "r" => {
                let spec = arr[2].as_str().ok_or_else(|| serde::de::Error::custom("payload must be a string"))?;
                let (cols_str, rows_str) = spec
                    .split_once('x')
                    .ok_or_else(|| serde::de::Error::custom("resize payload must be '<cols>x<rows>'"))?;
                let cols = cols_str.parse().map_err(serde::de::Error::custom)?;
                let rows = rows_str.parse().map_err(serde::de::Error::custom)?;
                Ok(StreamEvent::Resize { at, cols, rows })
            }
            "x" => {
                let tuple = arr[2].as_array().ok_or_else(|| serde::de::Error::custom("exit payload must be an array"))?;
                if tuple.len() != 3 {
                    return Err(serde::de::Error::custom("exit payload must have three elements"));
                }
                let code = tuple[1].as_i64().ok_or_else(|| serde::de::Error::custom("exit code must be an integer"))? as i32;
                let session_id = tuple[2].as_str().ok_or_else(|| serde::de::Error::custom("session id must be a string"))?;
                Ok(StreamEvent::Exit { at, code, session_id: session_id.to_string() })
            }
            other => Err(serde::de::Error::custom(format!("unknown event kind '{other}'"))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = StreamHeader::new(80, 24);
        let line = serde_json::to_string(&header).unwrap();
        let back: StreamHeader = serde_json::from_str(&line).unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn output_event_round_trips() {
        let ev = StreamEvent::Output { at: 0.512, data: "hi\r\n".to_string() };
        let line = ev.to_line();
        let back = StreamEvent::from_line(&line).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn exit_event_round_trips() {
        let ev = StreamEvent::Exit { at: 1.0, code: 0, session_id: "abc".to_string() };
        let line = ev.to_line();
        assert_eq!(line, r#"[1.0,"x",["exit",0,"abc"]]"#);
        let back = StreamEvent::from_line(&line).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn resize_event_round_trips() {
        let ev = StreamEvent::Resize { at: 2.0, cols: 132, rows: 40 };
        let line = ev.to_line();
        let back = StreamEvent::from_line(&line).unwrap();
        assert_eq!(back, ev);
    }
}
