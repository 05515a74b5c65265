//! Deciding which entries are pages, and in what order.

use std::cmp::Ordering;
use std::iter::Peekable;
use std::path::Path;
use std::str::Chars;

const PAGE_EXTENSIONS: [&str; 12] =
    ["jpg", "jpeg", "png", "gif", "webp", "bmp", "avif", "jxl", "tif", "tiff", "heic", "heif"];
/// Resource fork junk written by macOS archivers.
const MACOS_METADATA_DIR: &str = "__MACOSX/";

/// Normalize an archive entry name: forward slashes only, no leading `./`
/// or `/`.
#[must_use]
pub fn normalize_entry_name(name: &str) -> String {
    let mut normalized = name.replace('\\', "/");
    loop {
        if let Some(rest) = normalized.strip_prefix("./") {
            normalized = rest.to_string();
        } else if let Some(rest) = normalized.strip_prefix('/') {
            normalized = rest.to_string();
        } else {
            return normalized;
        }
    }
}

/// Whether an entry (archive member or file in a folder) is a displayable
/// page.
#[must_use]
pub fn is_page(name: &str) -> bool {
    let normalized = normalize_entry_name(name);
    if normalized.ends_with('/') || normalized.contains(MACOS_METADATA_DIR) {
        return false;
    }
    let path = Path::new(&normalized);
    let hidden = path.file_name().and_then(|n| n.to_str()).is_none_or(|n| n.starts_with('.'));
    if hidden {
        return false;
    }
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
        .is_some_and(|ext| PAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Compare two names the way a person would order pages: runs of digits by
/// numeric value, everything else case-insensitively. `page2` sorts before
/// `page10`.
#[must_use]
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();
    loop {
        match (left.peek().copied(), right.peek().copied()) {
            // Equal under natural rules ("01" vs "1"), fall back to a total order.
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let lnum = take_digits(&mut left);
                let rnum = take_digits(&mut right);
                match compare_digits(&lnum, &rnum) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            },
            (Some(l), Some(r)) => {
                match l.to_lowercase().cmp(r.to_lowercase()) {
                    Ordering::Equal => {},
                    other => return other,
                }
                left.next();
                right.next();
            },
        }
    }
}

fn take_digits(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.next_if(char::is_ascii_digit) {
        digits.push(c);
    }
    digits
}

fn compare_digits(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}
