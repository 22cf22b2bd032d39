pub mod format_utils {
    /// Human-readable byte count, 1024-based, two decimals.
    pub fn format_bytes(bytes: u64) -> String {
        let mut value = bytes as f64;
        for unit in ["B", "KB", "MB", "GB", "TB"] {
            if value < 1024.0 {
                return format!("{:.2} {}", value, unit);
            }
            value /= 1024.0;
        }
        format!("{:.2} PB", value)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_format_bytes() {
            assert_eq!(format_bytes(0), "0.00 B");
            assert_eq!(format_bytes(512), "512.00 B");
            assert_eq!(format_bytes(1024), "1.00 KB");
            assert_eq!(format_bytes(1536), "1.50 KB");
            assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
            assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.00 GB");
        }
    }
}
