// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process memory probe used by the performance sampler.
//!
//! Reads the resident set size from `/proc/self/status`. On platforms
//! without procfs the probe returns an error and the sampler skips the tick.

use std::fs::File;
use std::io::{self, BufRead};
use tracing::trace;

const PROC_SELF_STATUS_PATH: &str = "/proc/self/status";

const BYTES_PER_MIB: f64 = 1_048_576.0;

/// Resident memory of the current process, in MiB.
pub fn resident_memory_mb() -> Result<f64, io::Error> {
    resident_memory_mb_from_path(PROC_SELF_STATUS_PATH)
}

/// Parses the `VmRSS:` line of a `/proc/<pid>/status` file.
///
/// ```text
/// VmRSS:	   12345 kB
/// ```
fn resident_memory_mb_from_path(path: &str) -> Result<f64, io::Error> {
    let file = File::open(path)?;
    let reader = io::BufReader::new(file);

    for line in reader.lines() {
        let line = line?;
        let Some(rest) = line.strip_prefix("VmRSS:") else {
            continue;
        };
        let mut parts = rest.split_whitespace();
        let value: Option<f64> = parts.next().and_then(|v| v.parse().ok());
        let unit = parts.next();

        return match (value, unit) {
            (Some(kb), Some("kB")) => {
                trace!("VmRSS from {path}: {kb} kB");
                Ok(kb * 1024.0 / BYTES_PER_MIB)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to parse VmRSS line in {path}: {line}"),
            )),
        };
    }

    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("VmRSS not found in {path}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn path_from_root(file: &str) -> String {
        let mut safe_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        safe_path.push(file);
        safe_path.to_str().unwrap().to_string()
    }

    #[test]
    fn test_parses_vmrss() {
        let path = path_from_root("./tests/proc/status/valid_status");
        let mb = resident_memory_mb_from_path(&path).unwrap();
        assert!((mb - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_missing_vmrss_is_not_found() {
        let path = path_from_root("./tests/proc/status/missing_vmrss_status");
        let err = resident_memory_mb_from_path(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_malformed_vmrss_is_invalid_data() {
        let path = path_from_root("./tests/proc/status/malformed_vmrss_status");
        let err = resident_memory_mb_from_path(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_missing_file_is_error() {
        let path = path_from_root("./tests/proc/status/nonexistent_status");
        let err = resident_memory_mb_from_path(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_reads_own_process() {
        let mb = resident_memory_mb().unwrap();
        assert!(mb > 0.0);
    }
}
