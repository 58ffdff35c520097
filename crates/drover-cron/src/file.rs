use std::io::ErrorKind;
use std::path::Path;

use tracing::{error, info};

use crate::crontab::parse_crontab;
use crate::error::Result;
use crate::item::ParsedCronItem;

/// Load and parse a crontab file.
///
/// A missing file disables cron (empty schedule). An unreadable file is
/// logged and also yields an empty schedule. Parse errors propagate.
pub fn load_crontab_file(path: &Path) -> Result<Vec<ParsedCronItem>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!(path = %path.display(), "no crontab file found, cron is disabled");
            return Ok(Vec::new());
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to read crontab file");
            return Ok(Vec::new());
        }
    };

    let items = parse_crontab(&text)?;
    info!(path = %path.display(), count = items.len(), "crontab loaded");
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_means_no_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let items = load_crontab_file(&dir.path().join("crontab")).unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn reads_and_parses_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# maintenance").unwrap();
        writeln!(file, "0 3 * * * vacuum ?fill=1h").unwrap();
        let items = load_crontab_file(file.path()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].task, "vacuum");
    }

    #[test]
    fn parse_errors_propagate() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "61 * * * * broken").unwrap();
        assert!(load_crontab_file(file.path()).is_err());
    }
}
