use chrono::{DateTime, Utc};

pub fn build_host() -> &'static str {
    option_env!("SPM_BUILD_HOST").unwrap_or("unknown")
}

/// Seconds since the Unix epoch, stamped by build.rs; 0 when the binary
/// was built without the stamp.
fn build_epoch() -> i64 {
    option_env!("SPM_BUILD_EPOCH")
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

fn format_epoch(secs: i64) -> String {
    match DateTime::<Utc>::from_timestamp(secs, 0) {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "unknown".to_string(),
    }
}

pub fn build_time() -> String {
    format_epoch(build_epoch())
}

pub fn banner() -> String {
    format!(
        "spm {} (built on {} at {})",
        env!("CARGO_PKG_VERSION"),
        build_host(),
        build_time()
    )
}
