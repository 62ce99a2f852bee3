use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

/// Hands out `{base}-{timestamp_ms}{ext}` names for uploads.
///
/// The timestamp is strictly increasing for the lifetime of the generator,
/// two uploads in the same millisecond never share a name.
#[derive(Debug, Default)]
pub struct StoredNameGenerator {
    last: AtomicI64,
}

impl StoredNameGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_name(&self, original_name: &str) -> String {
        self.name_at(original_name, Utc::now().timestamp_millis())
    }

    fn name_at(&self, original_name: &str, now_ms: i64) -> String {
        let (base, ext) = split_name(original_name);
        format!("{}-{}{}", base, self.next_timestamp(now_ms), ext)
    }

    fn next_timestamp(&self, now_ms: i64) -> i64 {
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = now_ms.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}

/// Splits the basename of an uploaded file name into a URL safe
/// base and its extension (including the dot).
pub fn split_name(original_name: &str) -> (String, String) {
    let basename = original_name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();

    let (base, ext) = match basename.rfind('.') {
        Some(idx) if idx > 0 => basename.split_at(idx),
        _ => (basename, ""),
    };

    let base: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let base = if base.is_empty() { "photo".to_string() } else { base };
    let ext = if ext.len() > 1 && ext[1..].chars().all(|c| c.is_ascii_alphanumeric()) {
        ext.to_string()
    } else {
        String::new()
    };

    (base, ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_name() {
        assert_eq!(split_name("cat.png"), ("cat".into(), ".png".into()));
        assert_eq!(split_name("../../etc/cat.JPG"), ("cat".into(), ".JPG".into()));
        assert_eq!(split_name("C:\\photos\\my dog.jpeg"), ("my_dog".into(), ".jpeg".into()));
        assert_eq!(split_name(".hidden"), (".hidden".into(), "".into()));
        assert_eq!(split_name(""), ("photo".into(), "".into()));
        assert_eq!(split_name("archive.tar.gz"), ("archive.tar".into(), ".gz".into()));
    }

    #[test]
    fn test_names_never_repeat_within_a_millisecond() {
        let names = StoredNameGenerator::new();
        let first = names.name_at("cat.png", 1_000);
        let second = names.name_at("cat.png", 1_000);
        let third = names.name_at("cat.png", 999);

        assert_eq!(first, "cat-1000.png");
        assert_eq!(second, "cat-1001.png");
        assert_eq!(third, "cat-1002.png");
        assert_eq!(names.name_at("cat.png", 5_000), "cat-5000.png");
    }
}
