//! LSP position ↔ rope character index conversion.
//!
//! LSP positions are line/column pairs whose column unit depends on the
//! negotiated offset encoding; ropes index by Unicode codepoint. Columns
//! past the end of a line clamp to the line end (servers routinely send
//! `character: u32::MAX` to mean "end of line"); a line past the end of the
//! document does not convert.

use lsp_types::Position;
use ropey::Rope;

use crate::connection::OffsetEncoding;

/// Converts an LSP position to a rope character index.
///
/// Returns `None` when the line does not exist.
pub fn lsp_position_to_char(text: &Rope, pos: Position, encoding: OffsetEncoding) -> Option<usize> {
	let line_idx = pos.line as usize;
	if line_idx >= text.len_lines() {
		return None;
	}
	let line_start = text.line_to_char(line_idx);
	let line = text.line(line_idx);
	let target = pos.character as usize;
	// Rope lines carry their terminator; clamping must stop before it so
	// an oversized column lands at the end of the text, not past the break.
	let text_len = line_text_chars(&line);

	let col = match encoding {
		OffsetEncoding::Utf32 => target.min(text_len),
		OffsetEncoding::Utf8 => {
			let mut chars = 0;
			let mut bytes = 0;
			for ch in line.chars().take(text_len) {
				if bytes >= target {
					break;
				}
				bytes += ch.len_utf8();
				chars += 1;
			}
			chars
		}
		OffsetEncoding::Utf16 => {
			let mut chars = 0;
			let mut units = 0;
			for ch in line.chars().take(text_len) {
				if units >= target {
					break;
				}
				units += ch.len_utf16();
				chars += 1;
			}
			chars
		}
	};

	Some(line_start + col)
}

/// Number of chars in a rope line excluding its line break.
fn line_text_chars(line: &ropey::RopeSlice<'_>) -> usize {
	let mut len = line.len_chars();
	while len > 0 {
		let ch = line.char(len - 1);
		if ch == '\n' || ch == '\r' {
			len -= 1;
		} else {
			break;
		}
	}
	len
}

/// Converts a rope character index to an LSP position.
///
/// Returns `None` when the index is out of bounds.
pub fn char_to_lsp_position(text: &Rope, char_idx: usize, encoding: OffsetEncoding) -> Option<Position> {
	if char_idx > text.len_chars() {
		return None;
	}
	let line_idx = text.char_to_line(char_idx);
	let line_start = text.line_to_char(line_idx);
	let line = text.line(line_idx);
	let col_chars = char_idx - line_start;

	let character = match encoding {
		OffsetEncoding::Utf32 => col_chars,
		OffsetEncoding::Utf8 => line.chars().take(col_chars).map(|ch| ch.len_utf8()).sum(),
		OffsetEncoding::Utf16 => line.chars().take(col_chars).map(|ch| ch.len_utf16()).sum(),
	};

	Some(Position {
		line: line_idx as u32,
		character: character as u32,
	})
}
