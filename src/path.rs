//! sdmmc-storage - Path helpers
//!
//! Paths are '/'-separated and absolute. Everything that arrives from the
//! outside (URLs, action arguments) goes through `normalize` before it is
//! used to find anything on the card.

use alloc::borrow::ToOwned;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

pub const SEPARATOR: char = '/';

/// A path climbed above the directory it was meant to stay inside.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathEscape;

impl core::fmt::Display for PathEscape {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "path escapes its root")
    }
}

/// Collapse repeated separators, drop `.` components and resolve `..`. The
/// result is absolute and has no trailing separator (except for `/`).
pub fn normalize(path: &str) -> Result<String, PathEscape> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split(SEPARATOR) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop().ok_or(PathEscape)?;
            }
            part => parts.push(part),
        }
    }
    if parts.is_empty() {
        return Ok(String::from("/"));
    }
    let mut out = String::with_capacity(path.len() + 1);
    for part in parts {
        out.push(SEPARATOR);
        out.push_str(part);
    }
    Ok(out)
}

pub fn is_absolute(path: &str) -> bool {
    path.starts_with(SEPARATOR)
}

pub fn trailing_slash(path: &str) -> bool {
    path.ends_with(SEPARATOR)
}

/// Join two paths with exactly one separator between them.
pub fn join(first: &str, second: &str) -> String {
    let mut result = first.to_owned();
    match (trailing_slash(first), is_absolute(second)) {
        (false, false) => result.push(SEPARATOR),
        (true, true) => {
            result.pop();
        }
        _ => {}
    }
    result.push_str(second);
    result
}

/// The path as seen from inside `root`. Paths outside `root` come back
/// unchanged.
pub fn remove_root_path(path: &str, root: &str) -> String {
    let root = root.trim_end_matches(SEPARATOR);
    match path.strip_prefix(root) {
        Some("") => String::from("/"),
        Some(rest) if is_absolute(rest) => rest.to_owned(),
        _ => path.to_owned(),
    }
}

/// The non-empty components of a path.
pub fn split(path: &str) -> Vec<&str> {
    path.split(SEPARATOR).filter(|p| !p.is_empty()).collect()
}

/// Everything after the last separator.
pub fn file_name(path: &str) -> &str {
    match path.rfind(SEPARATOR) {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Everything after the last `.`, or nothing.
pub fn extension(file: &str) -> &str {
    match file.rfind('.') {
        Some(pos) => &file[pos + 1..],
        None => "",
    }
}

// (extension, description, MIME type)
static FILE_TYPES: [(&str, &str, &str); 20] = [
    ("mp3", "Audio (MP3)", "audio/mpeg"),
    ("wav", "Audio (WAV)", "audio/vnd.wav"),
    ("png", "Image (PNG)", "image/png"),
    ("jpg", "Image (JPG)", "image/jpeg"),
    ("jpeg", "Image (JPEG)", "image/jpeg"),
    ("bmp", "Image (BMP)", "image/bmp"),
    ("txt", "Text (TXT)", "text/plain"),
    ("log", "Text (LOG)", "text/plain"),
    ("csv", "Text (CSV)", "text/csv"),
    ("html", "Web (HTML)", "text/html"),
    ("css", "Web (CSS)", "text/css"),
    ("js", "Web (JS)", "text/javascript"),
    ("json", "Data (JSON)", "application/json"),
    ("xml", "Data (XML)", "application/xml"),
    ("zip", "Archive (ZIP)", "application/zip"),
    ("gz", "Archive (GZ)", "application/gzip"),
    ("tar", "Archive (TAR)", "application/x-tar"),
    ("mp4", "Video (MP4)", "video/mp4"),
    ("avi", "Video (AVI)", "video/x-msvideo"),
    ("webm", "Video (WEBM)", "video/webm"),
];

fn lookup(file: &str) -> Option<&'static (&'static str, &'static str, &'static str)> {
    let ext = extension(file);
    FILE_TYPES.iter().find(|(known, _, _)| known.eq_ignore_ascii_case(ext))
}

/// A human readable description of a file, for listings.
pub fn file_type(file: &str) -> String {
    let ext = extension(file);
    if ext.is_empty() {
        return String::from("File");
    }
    match lookup(file) {
        Some((_, description, _)) => String::from(*description),
        None => format!("File ({})", ext.to_ascii_lowercase()),
    }
}

pub fn mime_type(file: &str) -> &'static str {
    match lookup(file) {
        Some((_, _, mime)) => *mime,
        None => "application/octet-stream",
    }
}

/// Undo URL percent-encoding. `None` for malformed escapes or bytes that
/// aren't UTF-8.
pub fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        match bytes[idx] {
            b'%' => {
                let hex = bytes.get(idx + 1..idx + 3)?;
                if !hex.iter().all(u8::is_ascii_hexdigit) {
                    return None;
                }
                let hex = core::str::from_utf8(hex).ok()?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                idx += 3;
            }
            b => {
                out.push(b);
                idx += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

/// Escape everything except unreserved characters and the separator.
pub fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        if b.is_ascii_alphanumeric() || b"-_.~/".contains(&b) {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}
