//! Directory listing with natural ordering.

use std::cmp::Ordering;
use std::path::Path;

use crate::error::{DatasetError, Result};

/// Extensions treated as image files (compared case-insensitively).
pub const IMAGE_EXTENSIONS: &[&str] = &["tiff", "tif", "jpg", "jpeg", "png"];

/// True if `name` has a recognized image extension and is not hidden.
pub fn is_image_file(name: &str) -> bool {
    if name.starts_with('.') {
        return false;
    }
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Compare strings so that embedded numbers sort by value
/// (`img_2` before `img_10`).
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut ai = a.chars().peekable();
    let mut bi = b.chars().peekable();

    loop {
        match (ai.peek().copied(), bi.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(ca), Some(cb)) if ca.is_ascii_digit() && cb.is_ascii_digit() => {
                let na = take_number(&mut ai);
                let nb = take_number(&mut bi);
                let ord = compare_digit_runs(&na, &nb);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(ca), Some(cb)) => {
                if ca != cb {
                    return ca.cmp(&cb);
                }
                ai.next();
                bi.next();
            }
        }
    }
}

fn take_number(it: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(&c) = it.peek() {
        if !c.is_ascii_digit() {
            break;
        }
        digits.push(c);
        it.next();
    }
    digits
}

fn compare_digit_runs(a: &str, b: &str) -> Ordering {
    let ta = a.trim_start_matches('0');
    let tb = b.trim_start_matches('0');
    ta.len()
        .cmp(&tb.len())
        .then_with(|| ta.cmp(tb))
        .then_with(|| a.len().cmp(&b.len()))
}

/// List image filenames in `dir`, naturally sorted.
pub fn list_images(dir: &Path) -> Result<Vec<String>> {
    let entries = std::fs::read_dir(dir).map_err(|e| DatasetError::io(dir, e))?;

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| is_image_file(name))
        .collect();

    names.sort_by(|a, b| natural_cmp(a, b));
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_order() {
        let mut names = vec!["im10.png", "im2.png", "im1.png", "im02.png", "a.png"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["a.png", "im1.png", "im2.png", "im02.png", "im10.png"]);
    }

    #[test]
    fn test_image_filter() {
        assert!(is_image_file("frame.TIFF"));
        assert!(is_image_file("x.jpeg"));
        assert!(!is_image_file(".hidden.png"));
        assert!(!is_image_file("notes.txt"));
        assert!(!is_image_file("tiff"));
    }

    #[test]
    fn test_list_images_skips_non_images() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b10.png", "b9.png", "readme.md", ".DS_Store"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub.png")).unwrap();

        let listed = list_images(dir.path()).unwrap();
        assert_eq!(listed, vec!["b9.png".to_string(), "b10.png".to_string()]);
    }
}
