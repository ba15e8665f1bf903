//! Run persistence (C9) — atomic write of `RunRecord`, raw NDJSON output, and a
//! run-id + timestamp directory naming convention (§4.9).
//!
//! Never overwrites a partial file in place: every file is written to a sibling
//! `.tmp` path and renamed into place, atomic within the same filesystem.

use crate::error::Result;
use pipeline_core::types::RunRecord;
use rand::RngCore;
use std::path::{Path, PathBuf};

/// Sanitize a run id for use as (part of) a directory name: anything outside
/// `[A-Za-z0-9._-]` becomes `_`.
fn sanitize(run_id: &str) -> String {
    run_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// 8 random bytes, hex-encoded, used when the caller has no run id yet.
pub fn generate_run_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// `YYYYMMDDTHHMMSS-<sanitized_run_id>`, UTC.
pub fn run_dir_name(now: chrono::DateTime<chrono::Utc>, run_id: &str) -> String {
    format!("{}-{}", now.format("%Y%m%dT%H%M%S"), sanitize(run_id))
}

pub struct PersistedRun {
    pub dir: PathBuf,
}

/// Create `<runs_root>/<dir_name>/`, write `stats.json` (pretty-printed + trailing
/// newline) and `output.log` (stdout then stderr), each via write-then-rename.
pub fn persist(
    runs_root: &Path,
    now: chrono::DateTime<chrono::Utc>,
    record: &RunRecord,
    stdout: &str,
    stderr: &str,
) -> Result<PersistedRun> {
    let dir_name = run_dir_name(now, &record.run_id);
    let dir = runs_root.join(&dir_name);
    std::fs::create_dir_all(&dir)?;

    let mut stats = serde_json::to_string_pretty(record)?;
    stats.push('\n');
    atomic_write(&dir.join("stats.json"), stats.as_bytes())?;

    let mut log = String::with_capacity(stdout.len() + stderr.len());
    log.push_str(stdout);
    log.push_str(stderr);
    atomic_write(&dir.join("output.log"), log.as_bytes())?;

    Ok(PersistedRun { dir })
}

fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::types::RunRecordStatus;

    fn tempdir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "pipeline-host-persist-test-{}-{}",
            std::process::id(),
            {
                use std::time::{SystemTime, UNIX_EPOCH};
                SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos()
            }
        ));
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    #[test]
    fn dir_name_matches_invariant_4() {
        let now = chrono::Utc::now();
        let name = run_dir_name(now, "ab/cd ef");
        let (prefix, suffix) = name.split_once('-').unwrap();
        assert_eq!(prefix.len(), 15);
        chrono::NaiveDateTime::parse_from_str(prefix, "%Y%m%dT%H%M%S").unwrap();
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'));
    }

    #[test]
    fn persisted_files_are_written_and_renamed() {
        let root = tempdir();
        let record = RunRecord {
            run_id: "deadbeef".into(),
            timestamp: "2026-07-28T00:00:00.000Z".into(),
            status: RunRecordStatus::Success,
            docker_exit_code: 0,
            cwd: "/work".into(),
            pipeline: None,
            agent_result: None,
            normalized: None,
            error_type: None,
            error_message: None,
        };
        let result = persist(&root, chrono::Utc::now(), &record, "out\n", "err\n").unwrap();
        assert!(result.dir.join("stats.json").is_file());
        assert!(result.dir.join("output.log").is_file());
        assert!(!result.dir.join("stats.tmp").exists());
        let contents = std::fs::read_to_string(result.dir.join("output.log")).unwrap();
        assert_eq!(contents, "out\nerr\n");
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn generated_run_id_is_16_hex_chars() {
        let id = generate_run_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
