//! Output file naming.
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;

/// Slugs are cut to this many characters before the hash suffix.
const MAX_SLUG_LEN: usize = 200;

/// Builds a file name stem from a prompt: the timestamp (now when not given)
/// followed by the ASCII part of the prompt, every character besides ASCII
/// alphanumerics, `.` and `_` replaced with `_`, and a 4 digit hash suffix.
pub fn mk_slug(prompt: &str, time: Option<&str>) -> String {
    let time = match time {
        Some(time) => time.to_string(),
        None => chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
    };
    let text: String = time.chars().chain(prompt.chars().filter(char::is_ascii)).collect();
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    let slug: String = text
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' { c } else { '_' })
        .take(MAX_SLUG_LEN)
        .collect();
    format!("{slug}{:04x}", hasher.finish() & 0xffff)
}

pub fn sample_file_name(index: usize) -> String {
    format!("{index:04}.png")
}

/// Number of entries in `dir`, sample numbering continues from there.
pub fn count_entries<P: AsRef<Path>>(dir: P) -> std::io::Result<usize> {
    Ok(std::fs::read_dir(dir)?.count())
}
