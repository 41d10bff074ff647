use lazy_static::lazy_static;
use regex::Regex;

const ALLOWED_EXTS: [&str; 11] = [
    ".mkv", ".mp4", ".avi", ".mov", ".wmv", ".flv", ".webm", ".mpeg", ".mpg", // video files
    ".srt", ".sub", // subtitles
];

const SAMPLE_MAX_BYTES: u64 = 100 * 1024 * 1024;

lazy_static! {
    static ref PART_FILTERS: Vec<Regex> = vec![
        Regex::new(r"^lore$").unwrap(),
        Regex::new(r"^histories(( and| &) lore)?$").unwrap(),
        Regex::new(r"sample").unwrap(),
        Regex::new(r"^behind.the.scenes$").unwrap(),
        Regex::new(r"^deleted.and.extended.scenes$").unwrap(),
        Regex::new(r"^deleted.scenes$").unwrap(),
        Regex::new(r"^extras?$").unwrap(),
        Regex::new(r"^featurettes$").unwrap(),
        Regex::new(r"^interviews$").unwrap(),
        Regex::new(r"^scenes$").unwrap(),
        Regex::new(r"^shorts$").unwrap(),
    ];
}

/// Policy knobs from §4.A's "File listing policy": extension allow-list,
/// sample-file skip (unless explicitly allowed), and a file size range.
pub struct FilePolicy {
    pub add_samples: bool,
    pub min_file_size: u64,
    pub max_file_size: u64,
}

impl Default for FilePolicy {
    fn default() -> Self {
        Self {
            add_samples: false,
            min_file_size: 0,
            max_file_size: u64::MAX,
        }
    }
}

pub fn should_ignore_file(path: &str, size: u64, policy: &FilePolicy) -> bool {
    if !ALLOWED_EXTS.iter().any(|ext| path.to_lowercase().ends_with(ext)) {
        return true;
    }

    if size < policy.min_file_size || size > policy.max_file_size {
        return true;
    }

    let is_sample = path.to_lowercase().contains("sample") && size < SAMPLE_MAX_BYTES;
    if is_sample && !policy.add_samples {
        return true;
    }

    should_ignore_path(path)
}

pub fn should_ignore_path(input: &str) -> bool {
    if !ALLOWED_EXTS.iter().any(|ext| input.to_lowercase().ends_with(ext)) {
        return true;
    }

    let path_parts = input.split('/');
    for path_part in path_parts {
        if path_part.is_empty() {
            continue;
        }

        let path_part = path_part.to_lowercase();
        let is_filtered = PART_FILTERS.iter().any(|regex| regex.is_match(&path_part));
        if is_filtered {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_ignore_path() {
        assert_eq!(should_ignore_path("torrent/samples/video.mp4"), true);
        assert_eq!(
            should_ignore_path("trailer park boys/season 1/episode 1.mp4"),
            false
        );
    }

    #[test]
    fn test_should_ignore_file_respects_size_range() {
        let policy = FilePolicy {
            min_file_size: 10_000_000,
            ..Default::default()
        };
        assert!(should_ignore_file("show/episode.mkv", 1_000, &policy));
        assert!(!should_ignore_file("show/episode.mkv", 20_000_000, &policy));
    }

    #[test]
    fn test_should_ignore_file_samples_toggle() {
        let deny = FilePolicy::default();
        assert!(should_ignore_file("show/sample.mkv", 1_000_000, &deny));

        let allow = FilePolicy {
            add_samples: true,
            ..Default::default()
        };
        assert!(!should_ignore_file("show/sample.mkv", 1_000_000, &allow));
    }
}
