//! Terminal daemon wire protocol.
//!
//! Frames to and from the in-container daemon are prefixed by a one
//! character type code. Client input is filtered so terminal mouse report
//! sequences never reach the daemon's stdin.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Type code for data frames.
pub const FRAME_DATA: u8 = b'0';
/// Type code for window title frames (daemon to client).
pub const FRAME_TITLE: u8 = b'1';
/// Reserved type code.
pub const FRAME_RESERVED: u8 = b'2';
/// Type code for resize frames (client to daemon).
pub const FRAME_RESIZE: u8 = b'1';

/// Phrases a daemon emits when the underlying session is gone.
const TERMINATION_MARKERS: &[&str] = &[
    "screen is terminating",
    "session terminated",
    "[exited]",
    "no server running",
];

// CSI mouse reports in their common SGR and X10 encodings, plus the
// urxvt decimal form.
static MOUSE_SGR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[<\d+;\d+;\d+[mM]").expect("valid SGR mouse regex"));
static MOUSE_X10: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[M[\x20-\x7f]{3}").expect("valid X10 mouse regex"));
static MOUSE_URXVT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[\d+;\d+;\d+M").expect("valid urxvt mouse regex"));

/// Strip CSI mouse-report sequences from client input.
pub fn filter_mouse_reports(input: &str) -> String {
    let pass1 = MOUSE_SGR.replace_all(input, "");
    let pass2 = MOUSE_X10.replace_all(&pass1, "");
    MOUSE_URXVT.replace_all(&pass2, "").into_owned()
}

/// Encode client keystrokes as a data frame.
pub fn encode_input(text: &str) -> Vec<u8> {
    let filtered = filter_mouse_reports(text);
    let mut frame = Vec::with_capacity(filtered.len() + 1);
    frame.push(FRAME_DATA);
    frame.extend_from_slice(filtered.as_bytes());
    frame
}

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub columns: u16,
    pub rows: u16,
}

/// Encode a resize frame.
pub fn encode_resize(size: WindowSize) -> Vec<u8> {
    let json = serde_json::to_string(&size).expect("window size serializes");
    let mut frame = Vec::with_capacity(json.len() + 1);
    frame.push(FRAME_RESIZE);
    frame.extend_from_slice(json.as_bytes());
    frame
}

/// The handshake sent immediately after the socket opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(rename = "AuthToken")]
    pub auth_token: String,
    pub columns: u16,
    pub rows: u16,
}

/// Encode the initial handshake message.
pub fn encode_handshake(size: WindowSize) -> Vec<u8> {
    let handshake = Handshake {
        auth_token: String::new(),
        columns: size.columns,
        rows: size.rows,
    };
    serde_json::to_vec(&handshake).expect("handshake serializes")
}

/// A frame received from the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonFrame<'a> {
    /// Terminal output, displayed verbatim.
    Data(&'a [u8]),
    /// Window title update.
    Title(&'a [u8]),
    /// Reserved / unknown payload.
    Other(u8, &'a [u8]),
}

/// Split a daemon frame into its type code and payload.
pub fn decode_frame(frame: &[u8]) -> Option<DaemonFrame<'_>> {
    let (&code, payload) = frame.split_first()?;
    Some(match code {
        FRAME_DATA => DaemonFrame::Data(payload),
        FRAME_TITLE => DaemonFrame::Title(payload),
        other => DaemonFrame::Other(other, payload),
    })
}

/// Whether a data payload signals that the underlying session ended.
pub fn is_termination_message(data: &str) -> bool {
    let lower = data.to_lowercase();
    TERMINATION_MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_input_passes_through() {
        assert_eq!(encode_input("ls -la\n"), b"0ls -la\n");
    }

    #[test]
    fn sgr_mouse_reports_stripped() {
        let input = "a\x1b[<35;10;20Mb\x1b[<0;1;1mc";
        assert_eq!(filter_mouse_reports(input), "abc");
    }

    #[test]
    fn x10_mouse_reports_stripped() {
        let input = "x\x1b[M %(y";
        assert_eq!(filter_mouse_reports(input), "xy");
    }

    #[test]
    fn urxvt_mouse_reports_stripped() {
        let input = "q\x1b[32;10;20Mw";
        assert_eq!(filter_mouse_reports(input), "qw");
    }

    #[test]
    fn non_mouse_escapes_survive() {
        // Arrow key and color sequences are not mouse reports.
        let input = "\x1b[A\x1b[31m";
        assert_eq!(filter_mouse_reports(input), input);
    }

    #[test]
    fn resize_frame_shape() {
        let frame = encode_resize(WindowSize {
            columns: 120,
            rows: 40,
        });
        assert_eq!(frame[0], b'1');
        let size: WindowSize = serde_json::from_slice(&frame[1..]).unwrap();
        assert_eq!(size.columns, 120);
        assert_eq!(size.rows, 40);
    }

    #[test]
    fn handshake_shape() {
        let bytes = encode_handshake(WindowSize {
            columns: 80,
            rows: 24,
        });
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["AuthToken"], "");
        assert_eq!(value["columns"], 80);
        assert_eq!(value["rows"], 24);
    }

    #[test]
    fn frame_decoding() {
        assert_eq!(decode_frame(b"0hello"), Some(DaemonFrame::Data(b"hello")));
        assert_eq!(decode_frame(b"1title"), Some(DaemonFrame::Title(b"title")));
        assert_eq!(decode_frame(b"2x"), Some(DaemonFrame::Other(b'2', b"x")));
        assert_eq!(decode_frame(b""), None);
    }

    #[test]
    fn termination_detection() {
        assert!(is_termination_message("Screen is terminating"));
        assert!(is_termination_message("the SESSION TERMINATED early"));
        assert!(is_termination_message("bash: [exited]"));
        assert!(is_termination_message("No server running on /tmp/tmux-0"));
        assert!(!is_termination_message("all good"));
    }
}
