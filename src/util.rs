use crate::error::MkvmError;

/// Validate a disk size string: digits followed by exactly one of `K`, `M`, `G`, `T`.
///
/// Mirrors what `qemu-img resize` accepts without ambiguity, e.g. `"32G"` or `"512M"`.
pub fn validate_disk_size(s: &str) -> Result<(), MkvmError> {
    let valid = s.is_ascii()
        && s.len() >= 2
        && s[..s.len() - 1].bytes().all(|b| b.is_ascii_digit())
        && matches!(s.as_bytes()[s.len() - 1], b'K' | b'M' | b'G' | b'T');
    if !valid {
        return Err(MkvmError::InvalidArgument {
            message: format!("disk size must match [0-9]+[KMGT] (got '{s}')"),
        });
    }
    Ok(())
}

/// Extract `MemAvailable` from the contents of `/proc/meminfo`, in MB.
pub fn parse_mem_available_mb(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
}

/// Render a command line for logs, quoting arguments that contain whitespace.
pub fn shell_words<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    words
        .into_iter()
        .map(|w| {
            let w = w.as_ref();
            if w.is_empty() || w.contains(char::is_whitespace) {
                format!("'{w}'")
            } else {
                w.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
