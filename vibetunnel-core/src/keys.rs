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

//! Translates the special-key names the session API accepts for
//! `POST /sessions/:id/input` into the VT100 byte sequences a shell expects
//! to see on its stdin.

use crate::error::VtError;

pub fn translate(name: &str) -> Result<Vec<u8>, VtError> {
    if let Some(bytes) = lookup_fixed(name) {
        return Ok(bytes.to_vec());
    }

    if let Some(letter) = name.strip_prefix("ctrl+") {
        return ctrl_byte(letter).map(|b| vec![b]);
    }
    if let Some(ch) = name.strip_prefix("alt+") {
        let mut bytes = vec![0x1B];
        bytes.extend(ch.as_bytes());
        return Ok(bytes);
    }

    Err(VtError::UnknownKey(name.to_string()))
}

fn lookup_fixed(name: &str) -> Option<&'static [u8]> {
    Some(match name {
        "enter" => b"\r",
        "ctrl_enter" => b"\r",
        "shift_enter" => b"\x1B\x0D",
        "escape" => b"\x1B",
        "tab" => b"\t",
        "backspace" => b"\x7F",
        "arrow_up" => b"\x1B[A",
        "arrow_down" => b"\x1B[B",
        "arrow_right" => b"\x1B[C",
        "arrow_left" => b"\x1B[D",
        "home" => b"\x1B[H",
        "end" => b"\x1B[F",
        "pageup" => b"\x1B[5~",
        "pagedown" => b"\x1B[6~",
        "delete" => b"\x1B[3~",
        "insert" => b"\x1B[2~",
        "f1" => b"\x1BOP",
        "f2" => b"\x1BOQ",
        "f3" => b"\x1BOR",
        "f4" => b"\x1BOS",
        "f5" => b"\x1B[15~",
        "f6" => b"\x1B[17~",
        "f7" => b"\x1B[18~",
        "f8" => b"\x1B[19~",
        "f9" => b"\x1B[20~",
        "f10" => b"\x1B[21~",
        "f11" => b"\x1B[23~",
        "f12" => b"\x1B[24~",
        _ => return None,
    })
}

fn ctrl_byte(letter: &str) -> Result<u8, VtError> {
    let ch = letter
        .chars()
        .next()
        .filter(|c| letter.chars().count() == 1)
        .ok_or_else(|| VtError::UnknownKey(format!("ctrl+{letter}")))?;
    let upper = ch.to_ascii_uppercase();
    if !upper.is_ascii_alphabetic() {
        return Err(VtError::UnknownKey(format!("ctrl+{letter}")));
    }
    Ok((upper as u8) - b'A' + 1)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fixed_keys() {
        assert_eq!(translate("enter").unwrap(), b"\r");
        assert_eq!(translate("arrow_up").unwrap(), b"\x1B[A");
        assert_eq!(translate("f12").unwrap(), b"\x1B[24~");
        assert_eq!(translate("shift_enter").unwrap(), b"\x1B\x0D");
    }

    #[test]
    fn ctrl_letters() {
        assert_eq!(translate("ctrl+a").unwrap(), vec![1]);
        assert_eq!(translate("ctrl+c").unwrap(), vec![3]);
        assert_eq!(translate("ctrl+z").unwrap(), vec![26]);
    }

    #[test]
    fn alt_letters() {
        assert_eq!(translate("alt+f").unwrap(), vec![0x1B, b'f']);
    }

    #[test]
    fn unknown_key_errors() {
        assert!(matches!(translate("not_a_key"), Err(VtError::UnknownKey(_))));
        assert!(matches!(translate("ctrl+1"), Err(VtError::UnknownKey(_))));
    }
}
