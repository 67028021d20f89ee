//! Block-mode framing for structured GUI clients.
//!
//! A client in block mode prefixes every command with a sequence number:
//! `"<digits> <command>"`. The server captures all output produced while
//! that command runs and returns it as one delimited unit, so the client
//! can pair each response with the request that caused it:
//!
//! ```text
//! START <id> SEPARATOR <result-code> SEPARATOR <captured-output> END\n
//! ```
//!
//! Input with no leading sequence number gets an immediate error frame
//! with identifier `0` and the no-sequence result code; the command is
//! not dispatched.

/// Frame delimiter bytes.
pub const BLOCK_START: u8 = 0x15;
pub const BLOCK_SEPARATOR: u8 = 0x16;
pub const BLOCK_END: u8 = 0x17;

/// Result code for input that carried no parseable sequence number.
pub const CODE_NOSEQUENCE: u32 = 519;
/// Result code for a command the registry does not recognize.
pub const CODE_BADCOMMAND: u32 = 512;

/// Split a block-mode request into `(sequence_id, command_text)`.
///
/// The sequence id is one or more ASCII digits followed by exactly one
/// space. Returns `None` for anything else, including an all-digit line
/// with no command after it.
pub fn parse_request(line: &str) -> Option<(&str, &str)> {
    let digits_end = line.find(|c: char| !c.is_ascii_digit())?;
    if digits_end == 0 {
        return None;
    }
    let (digits, rest) = line.split_at(digits_end);
    let rest = rest.strip_prefix(' ')?;
    Some((digits, rest))
}

/// Assemble one framed response unit, newline-terminated.
pub fn frame(sequence_id: &str, code: u32, payload: &str) -> String {
    let mut out = String::with_capacity(sequence_id.len() + payload.len() + 16);
    out.push(BLOCK_START as char);
    out.push_str(sequence_id);
    out.push(BLOCK_SEPARATOR as char);
    out.push_str(&code.to_string());
    out.push(BLOCK_SEPARATOR as char);
    out.push_str(payload);
    out.push(BLOCK_END as char);
    out.push('\n');
    out
}

/// The error frame sent for a request with no sequence number.
pub fn no_sequence_frame() -> String {
    frame("0", CODE_NOSEQUENCE, "")
}
