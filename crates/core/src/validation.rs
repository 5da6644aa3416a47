//! Upload validation: file names, types, sizes, expiry and download limits

use chrono::Duration;

use crate::config::UploadPolicy;
use crate::error::CoreError;

const MAX_FILENAME_CHARS: usize = 255;

/// Strip any client-side directory part and characters that are unsafe in
/// storage keys or response headers.
pub fn sanitize_filename(filename: &str) -> String {
    // Browsers on Windows may send the full path
    let last = filename
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(filename);

    let cleaned: String = last
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect();

    let trimmed = cleaned.trim().trim_start_matches('.').trim();
    trimmed.chars().take(MAX_FILENAME_CHARS).collect()
}

/// Lowercased extension without the dot
pub fn extension_of(filename: &str) -> Option<String> {
    std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

impl UploadPolicy {
    /// Validate and sanitize a client-supplied file name
    pub fn check_name(&self, raw: &str) -> Result<String, CoreError> {
        let name = sanitize_filename(raw);
        if name.is_empty() {
            return Err(CoreError::Validation("File name is empty".to_string()));
        }
        if let Some(ext) = extension_of(&name) {
            if self.blocked_extensions.iter().any(|b| *b == ext) {
                return Err(CoreError::BlockedExtension(ext));
            }
        }
        Ok(name)
    }

    pub fn check_content_type(&self, content_type: &str) -> Result<(), CoreError> {
        if self.allowed_content_types.is_empty() {
            return Ok(());
        }
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_lowercase();
        let allowed = self.allowed_content_types.iter().any(|allowed| {
            match allowed.strip_suffix("/*") {
                Some(prefix) => essence.split('/').next() == Some(prefix),
                None => *allowed == essence,
            }
        });
        if allowed {
            Ok(())
        } else {
            Err(CoreError::Validation(format!(
                "Content type {} is not allowed",
                essence
            )))
        }
    }

    pub fn check_size(&self, size: u64) -> Result<(), CoreError> {
        if size == 0 {
            return Err(CoreError::Validation("File is empty".to_string()));
        }
        if size > self.max_upload_bytes {
            return Err(CoreError::TooLarge(self.max_upload_bytes));
        }
        Ok(())
    }

    pub fn resolve_expiry(&self, requested_hours: Option<i64>) -> Result<Duration, CoreError> {
        let hours = requested_hours.unwrap_or(self.default_expiry_hours);
        Ok(Duration::hours(hours.clamp(1, self.max_expiry_hours.max(1))))
    }

    pub fn resolve_max_downloads(&self, requested: Option<i32>) -> Result<Option<i32>, CoreError> {
        match requested {
            None => Ok(None),
            Some(n) if (1..=self.max_download_limit).contains(&n) => Ok(Some(n)),
            Some(_) => Err(CoreError::Validation(format!(
                "Download limit must be between 1 and {}",
                self.max_download_limit
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_list;

    #[test]
    fn sanitize_strips_paths_and_specials() {
        assert_eq!(sanitize_filename("C:\\Users\\me\\doc.pdf"), "doc.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("a\"b<c>.txt"), "a_b_c_.txt");
        assert_eq!(sanitize_filename("line\r\nbreak.txt"), "linebreak.txt");
        assert_eq!(sanitize_filename("..hidden"), "hidden");
        assert_eq!(sanitize_filename("   "), "");
        assert_eq!(sanitize_filename(&"x".repeat(400)).len(), 255);
    }

    #[test]
    fn blocked_extensions_are_case_insensitive() {
        let policy = UploadPolicy::default();
        assert!(matches!(
            policy.check_name("setup.EXE"),
            Err(CoreError::BlockedExtension(ext)) if ext == "exe"
        ));
        assert_eq!(policy.check_name("notes.txt").unwrap(), "notes.txt");
        assert!(policy.check_name("").is_err());
    }

    #[test]
    fn content_type_allow_list_supports_wildcards() {
        let policy = UploadPolicy {
            allowed_content_types: parse_list("image/*, application/pdf"),
            ..UploadPolicy::default()
        };
        assert!(policy.check_content_type("image/png").is_ok());
        assert!(policy.check_content_type("application/pdf; charset=binary").is_ok());
        assert!(policy.check_content_type("text/html").is_err());

        let open = UploadPolicy::default();
        assert!(open.check_content_type("text/html").is_ok());
    }

    #[test]
    fn size_limits() {
        let policy = UploadPolicy {
            max_upload_bytes: 100,
            ..UploadPolicy::default()
        };
        assert!(policy.check_size(100).is_ok());
        assert!(matches!(policy.check_size(101), Err(CoreError::TooLarge(100))));
        assert!(policy.check_size(0).is_err());
    }

    #[test]
    fn expiry_and_download_limits() {
        let policy = UploadPolicy::default();
        assert_eq!(policy.resolve_expiry(None).unwrap(), Duration::hours(24));
        assert_eq!(policy.resolve_expiry(Some(2)).unwrap(), Duration::hours(2));
        assert_eq!(policy.resolve_expiry(Some(0)).unwrap(), Duration::hours(1));
        assert_eq!(policy.resolve_expiry(Some(-5)).unwrap(), Duration::hours(1));
        assert_eq!(policy.resolve_expiry(Some(721)).unwrap(), Duration::hours(720));

        assert_eq!(policy.resolve_max_downloads(None).unwrap(), None);
        assert_eq!(policy.resolve_max_downloads(Some(5)).unwrap(), Some(5));
        assert!(policy.resolve_max_downloads(Some(0)).is_err());
        assert!(policy.resolve_max_downloads(Some(1001)).is_err());
    }
}
