//! Media Resource Locator helpers. Every path crossing a component boundary
//! is an RFC 3986 URL with a scheme; local files use `file://` plus an
//! absolute, percent-encoded path.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const HEX: &[u8; 16] = b"0123456789ABCDEF";

fn is_safe(c: u8) -> bool {
    if cfg!(windows) && c == b'\\' {
        return true;
    }
    matches!(c, b'.' | b'-' | b'_' | b'~' | b'/')
}

fn encode_segment(out: &mut String, segment: &str, extra: &str) {
    for &c in segment.as_bytes() {
        let keep = c.is_ascii_alphanumeric()
            || is_safe(c)
            || (!extra.is_empty() && extra.as_bytes().contains(&c));
        if keep {
            out.push(c as char);
        } else {
            out.push('%');
            out.push(HEX[(c >> 4) as usize] as char);
            out.push(HEX[(c & 0xF) as usize] as char);
        }
    }
}

/// Percent-encode an mrl, preserving the scheme and, for non-file schemes,
/// allowing `@` and `:` in the host segment so credentials and ports
/// survive verbatim.
pub fn encode(input: &str) -> String {
    let mut res = String::with_capacity(input.len());
    let mut rest = input;
    if let Some(scheme_pos) = input.find("://") {
        let after_scheme = scheme_pos + 3;
        res.push_str(&input[..after_scheme]);
        rest = &input[after_scheme..];
        if &input[..scheme_pos] != "file" {
            match rest.find('/') {
                Some(end_host) => {
                    encode_segment(&mut res, &rest[..end_host], "@:");
                    rest = &rest[end_host..];
                }
                None => {
                    encode_segment(&mut res, rest, "@:");
                    return res;
                }
            }
        }
    }
    #[cfg(windows)]
    {
        // Keep the ':' after a drive letter untouched; any other ':' in a
        // windows path is invalid and gets encoded below.
        let b = rest.as_bytes();
        if b.len() >= 3 && b[0] == b'/' && b[1].is_ascii_alphabetic() && b[2] == b':' {
            res.push_str(&rest[..3]);
            rest = &rest[3..];
        }
    }
    encode_segment(&mut res, rest, "");
    res
}

/// Decode every percent-encoded sequence. Fails on a truncated sequence
/// (`%` with fewer than two trailing hex digits).
pub fn decode(input: &str) -> Result<String> {
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len()
                || !bytes[i + 1].is_ascii_hexdigit()
                || !bytes[i + 2].is_ascii_hexdigit()
            {
                return Err(Error::BadMrl(input.to_string()));
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    let decoded = urlencoding::decode_binary(input.as_bytes());
    Ok(String::from_utf8_lossy(&decoded).into_owned())
}

/// The scheme of an mrl, including the `://` separator.
pub fn scheme(mrl: &str) -> Result<&str> {
    match mrl.find("://") {
        Some(pos) => Ok(&mrl[..pos + 3]),
        None => Err(Error::UnhandledScheme(mrl.to_string())),
    }
}

pub fn strip_scheme(mrl: &str) -> Result<&str> {
    match mrl.find("://") {
        Some(pos) => Ok(&mrl[pos + 3..]),
        None => Err(Error::UnhandledScheme(mrl.to_string())),
    }
}

pub fn scheme_is(scheme: &str, mrl: &str) -> bool {
    mrl.len() >= scheme.len() && mrl[..scheme.len()].eq_ignore_ascii_case(scheme)
}

/// Convert a `file://` mrl to a local filesystem path.
pub fn to_local_path(mrl: &str) -> Result<PathBuf> {
    if !scheme_is("file://", mrl) {
        return Err(Error::UnhandledScheme(mrl.to_string()));
    }
    let path = decode(&mrl[7..])?;
    #[cfg(windows)]
    {
        let mut path = path;
        // `file:///C:/...` carries a leading slash that is part of the url
        // representation only.
        if path.starts_with('/') && path.as_bytes().get(1).is_some_and(u8::is_ascii_alphabetic) {
            path.remove(0);
        }
        let path = path.replace('/', "\\");
        return Ok(PathBuf::from(path));
    }
    #[cfg(not(windows))]
    Ok(PathBuf::from(path))
}

/// Convert an absolute local path to a `file://` mrl.
pub fn from_local_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    #[cfg(windows)]
    let raw: Cow<'_, str> = Cow::Owned(format!("/{}", raw.replace('\\', "/")));
    #[cfg(not(windows))]
    let raw: Cow<'_, str> = raw;
    format!("file://{}", encode(&raw))
}

/// Ensure the mrl designates a folder, i.e. ends with a `/`.
pub fn to_folder_mrl(mrl: &str) -> String {
    if mrl.ends_with('/') {
        mrl.to_string()
    } else {
        format!("{mrl}/")
    }
}

/// Leaf segment of an mrl, still percent-encoded. A trailing slash is
/// ignored so the name of a folder mrl is its last path component.
pub fn file_name(mrl: &str) -> &str {
    let trimmed = mrl.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed,
    }
}

/// Everything up to and including the last `/`.
pub fn directory(mrl: &str) -> &str {
    let trimmed = mrl.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => &mrl[..pos + 1],
        None => "",
    }
}

/// Lower-cased extension of the leaf segment, without the dot.
pub fn extension(mrl: &str) -> Option<String> {
    let name = file_name(mrl);
    let pos = name.rfind('.')?;
    if pos == 0 || pos + 1 == name.len() {
        return None;
    }
    Some(name[pos + 1..].to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_local() {
        assert_eq!(
            encode("file:///tmp/some file.mkv"),
            "file:///tmp/some%20file.mkv"
        );
        assert_eq!(encode("/a/b#c"), "/a/b%23c");
        assert_eq!(encode("file:///a%b"), "file:///a%25b");
    }

    #[test]
    fn test_encode_preserves_host() {
        assert_eq!(
            encode("smb://user@nas:445/share/My Files"),
            "smb://user@nas:445/share/My%20Files"
        );
        // No path segment at all: the whole remainder is the host.
        assert_eq!(encode("smb://nas:139"), "smb://nas:139");
        // file:// host rules do not apply: everything after the scheme is a
        // path, ':' included.
        assert_eq!(encode("file:///a:b"), "file:///a%3Ab");
    }

    #[test]
    fn test_decode() {
        assert_eq!(decode("file:///a%20b").unwrap(), "file:///a b");
        assert_eq!(decode("plain").unwrap(), "plain");
        assert!(decode("broken%2").is_err());
        assert!(decode("broken%zz").is_err());
    }

    #[test]
    fn test_roundtrip() {
        for mrl in [
            "file:///home/user/M%C3%BCsic/t%C3%AEtle.mp3",
            "smb://nas/share/a%20b/c.avi",
            "file:///simple/path.mkv",
        ] {
            assert_eq!(encode(&decode(mrl).unwrap()), mrl);
        }
    }

    #[test]
    fn test_scheme_helpers() {
        assert_eq!(scheme("smb://host/share").unwrap(), "smb://");
        assert_eq!(strip_scheme("smb://host/share").unwrap(), "host/share");
        assert!(scheme("no-scheme-here").is_err());
        assert!(scheme_is("file://", "FILE:///tmp"));
        assert!(!scheme_is("smb://", "file:///tmp"));
    }

    #[test]
    #[cfg(not(windows))]
    fn test_local_path_conversions() {
        assert_eq!(
            to_local_path("file:///tmp/a%20b.mkv").unwrap(),
            PathBuf::from("/tmp/a b.mkv")
        );
        assert!(to_local_path("smb://host/share").is_err());
        assert_eq!(
            from_local_path(Path::new("/tmp/a b.mkv")),
            "file:///tmp/a%20b.mkv"
        );
    }

    #[test]
    fn test_file_name_and_directory() {
        assert_eq!(file_name("file:///a/b/c.mkv"), "c.mkv");
        assert_eq!(file_name("file:///a/b/"), "b");
        assert_eq!(directory("file:///a/b/c.mkv"), "file:///a/b/");
        assert_eq!(to_folder_mrl("file:///a/b"), "file:///a/b/");
        assert_eq!(to_folder_mrl("file:///a/b/"), "file:///a/b/");
    }

    #[test]
    fn test_extension() {
        assert_eq!(extension("file:///a/b/C.MKV").as_deref(), Some("mkv"));
        assert_eq!(extension("file:///a/b/noext"), None);
        assert_eq!(extension("file:///a/b/.hidden"), None);
        assert_eq!(extension("file:///a/b/trailing."), None);
    }
}
