//! Terminal escape stripping.
//!
//! Removes 7-bit C1 (`ESC` + Fe byte) and CSI (`ESC [ params intermediates final`)
//! sequences. Everything else, including a dangling `ESC` at the end of a chunk,
//! passes through untouched.

use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("escape pattern is valid")
});

/// Strip escape sequences from `text`.
///
/// Removal can join an `ESC` with the byte after a removed sequence, forming a new
/// sequence, so stripping repeats until nothing matches. Every pass shortens the text.
pub fn clean(text: &str) -> String {
	let mut current = match ANSI_ESCAPE.replace_all(text, "") {
		Cow::Borrowed(_) => return text.to_string(),
		Cow::Owned(next) => next,
	};
	loop {
		let next = ANSI_ESCAPE.replace_all(&current, "").into_owned();
		if next.len() == current.len() {
			return current;
		}
		current = next;
	}
}

/// Lossy UTF-8 decode, then [`clean`].
pub fn clean_bytes(raw: &[u8]) -> String {
	clean(&String::from_utf8_lossy(raw))
}

/// Longest trailing escape sequence held back waiting for its final byte.
const ESCAPE_HOLDBACK: usize = 64;

/// Length of `bytes` that can be sent now, without a trailing incomplete UTF-8
/// sequence or a trailing escape sequence that has not reached its final byte.
pub fn deliverable_len(bytes: &[u8]) -> usize {
	let len = complete_len(bytes);
	let window = len.saturating_sub(ESCAPE_HOLDBACK);
	match bytes[window..len].iter().rposition(|&b| b == 0x1B) {
		Some(pos) if is_unterminated_escape(&bytes[window + pos + 1..len]) => window + pos,
		_ => len,
	}
}

/// `rest` is what follows an `ESC`: nothing yet, or a CSI still in its parameter bytes.
fn is_unterminated_escape(rest: &[u8]) -> bool {
	match rest.split_first() {
		None => true,
		Some((b'[', params)) => params.iter().all(|b| (0x20..=0x3F).contains(b)),
		Some(_) => false,
	}
}

/// Length of `bytes` without a trailing incomplete UTF-8 sequence.
fn complete_len(bytes: &[u8]) -> usize {
	let len = bytes.len();
	for back in 1..=len.min(4) {
		let byte = bytes[len - back];
		if byte & 0xC0 == 0x80 {
			continue;
		}
		let width = match byte {
			0xF0..=0xF7 => 4,
			0xE0..=0xEF => 3,
			0xC0..=0xDF => 2,
			_ => 1,
		};
		return if width > back { len - back } else { len };
	}
	len
}
