//! Resident memory sampling and human readable formatting.

use std::time::Duration;

/// Resident set size of this process, when the platform exposes it.
#[cfg(target_os = "linux")]
pub fn resident_bytes() -> Option<u64> {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| parse_vm_rss(&status))
}

/// `VmRSS` from a `/proc/<pid>/status` listing, in bytes.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_vm_rss(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

#[cfg(target_os = "macos")]
pub fn resident_bytes() -> Option<u64> {
    use std::process::Command;

    let pid = std::process::id();
    Command::new("ps")
        .args(["-o", "rss=", "-p", &pid.to_string()])
        .output()
        .ok()
        .and_then(|output| {
            String::from_utf8(output.stdout)
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(|kb| kb * 1024)
        })
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn resident_bytes() -> Option<u64> {
    None
}

/// Signed byte count, e.g. `"1.5 MB"` or `"-4 kB"`.
pub fn format_bytes(bytes: i64) -> String {
    const UNITS: [&str; 4] = ["kB", "MB", "GB", "TB"];
    let sign = if bytes < 0 { "-" } else { "" };
    let mut value = bytes.unsigned_abs() as f64;
    if value < 1024.0 {
        return format!("{}{} bytes", sign, bytes.unsigned_abs());
    }
    let mut unit = UNITS[0];
    value /= 1024.0;
    for next in &UNITS[1..] {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{}{} {}", sign, trim_fraction(value), unit)
}

/// Wall time, e.g. `"12.5 ms"` or `"1.02 s"`.
pub fn format_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos >= 1_000_000_000 {
        format!("{} s", trim_fraction(duration.as_secs_f64()))
    } else if nanos >= 1_000_000 {
        format!("{} ms", trim_fraction(nanos as f64 / 1e6))
    } else if nanos >= 1_000 {
        format!("{} μs", trim_fraction(nanos as f64 / 1e3))
    } else {
        format!("{} ns", nanos)
    }
}

fn trim_fraction(value: f64) -> String {
    let formatted = format!("{:.2}", value);
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tfezz-worker\nVmPeak:\t  20000 kB\nVmRSS:\t   6144 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss(status), Some(6144 * 1024));
        assert_eq!(parse_vm_rss("Name:\tkthreadd\n"), None);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 bytes");
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(4096), "4 kB");
        assert_eq!(format_bytes(-1536), "-1.5 kB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3 MB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_nanos(800)), "800 ns");
        assert_eq!(format_duration(Duration::from_micros(250)), "250 μs");
        assert_eq!(format_duration(Duration::from_micros(12_500)), "12.5 ms");
        assert_eq!(format_duration(Duration::from_millis(1020)), "1.02 s");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resident_bytes_is_sampled() {
        assert!(resident_bytes().unwrap() > 0);
    }
}
