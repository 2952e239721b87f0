use crate::classify::{Advice, Classification};
use crate::event::{FailureEvent, Phase};
use crate::error::FailureError;
use chrono::{DateTime, Local, SecondsFormat};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Appends failure events to one JSON-lines file per local calendar day.
pub struct Recorder {
    dir: PathBuf,
}

impl Recorder {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, FailureError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|source| FailureError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record(&self, event: FailureEvent) -> Result<PathBuf, FailureError> {
        self.record_at(event, Local::now())
    }

    /// Records with an explicit clock reading; fills id, timestamp and
    /// classification when absent.
    pub fn record_at(&self, mut event: FailureEvent, now: DateTime<Local>) -> Result<PathBuf, FailureError> {
        if event.error.trim().is_empty() {
            return Err(FailureError::MissingError);
        }
        if event.id.trim().is_empty() {
            event.id = format!("fail-{}", now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros() * 1000));
        }
        if event.timestamp.trim().is_empty() {
            event.timestamp = now.to_rfc3339_opts(SecondsFormat::AutoSi, false);
        }
        event.ensure_classified();

        let target = self.dir.join(format!("{}.jsonl", now.format("%Y%m%d")));
        let io_err = |source| FailureError::Io {
            path: target.clone(),
            source,
        };

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&target).map_err(io_err)?;

        let line = serde_json::to_string(&event)?;
        writeln!(file, "{}", line).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        tracing::debug!("recorded failure {} ({}) in {}", event.id, event.phase, target.display());
        Ok(target)
    }
}

/// What a best-effort record produced. `log_path` is `None` when the write
/// itself failed.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub phase: Phase,
    pub classification: Classification,
    pub advice: Advice,
    pub log_path: Option<PathBuf>,
}

impl Recorded {
    /// The operator-facing line printed when failure debugging is on.
    pub fn debug_line(&self) -> String {
        let log = self
            .log_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "n/a".to_string());
        format!(
            "Failure handling: phase={} category={} retryable={} log={} suggestion={}",
            self.phase, self.classification.category, self.advice.retryable, log, self.advice.suggestion
        )
    }
}

/// Classifies and records `event`, never failing. Recording problems are
/// logged and reported through `log_path`.
pub fn record_best_effort(dir: &Path, mut event: FailureEvent) -> Recorded {
    let classification = event.ensure_classified().clone();
    let advice = event.advice();
    let phase = event.phase;

    let log_path = match Recorder::new(dir).and_then(|recorder| recorder.record(event)) {
        Ok(path) => Some(path),
        Err(e) => {
            tracing::warn!("failed to record failure event: {}", e);
            None
        }
    };

    Recorded {
        phase,
        classification,
        advice,
        log_path,
    }
}

fn read_events(path: &Path) -> Result<Vec<FailureEvent>, FailureError> {
    let io_err = |source| FailureError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = std::fs::File::open(path).map_err(io_err)?;
    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(io_err)?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut event: FailureEvent = serde_json::from_str(line).map_err(|source| FailureError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        event.ensure_classified();
        events.push(event);
    }
    Ok(events)
}

/// Filters for [`list_events`]. A zero limit means unlimited.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub limit: usize,
    pub phase: Option<Phase>,
    pub category: Option<String>,
}

/// Events newest first: day files in reverse name order, lines in reverse.
/// A missing directory is an empty log.
pub fn list_events(dir: &Path, query: &EventQuery) -> Result<Vec<FailureEvent>, FailureError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(FailureError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().map(|e| e == "jsonl").unwrap_or(false))
        .collect();
    files.sort();

    let category = query
        .category
        .as_deref()
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty());

    let mut out = Vec::new();
    for file in files.iter().rev() {
        for event in read_events(file)?.into_iter().rev() {
            if query.phase.is_some_and(|phase| phase != event.phase) {
                continue;
            }
            let event_category = event.classification.as_ref().map(|c| c.category.as_str());
            if let Some(wanted) = &category {
                if event_category != Some(wanted.as_str()) {
                    continue;
                }
            }
            out.push(event);
            if query.limit > 0 && out.len() >= query.limit {
                return Ok(out);
            }
        }
    }
    Ok(out)
}

pub fn find_event(dir: &Path, id: &str) -> Result<FailureEvent, FailureError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(FailureError::MissingId);
    }
    list_events(dir, &EventQuery::default())?
        .into_iter()
        .find(|event| event.id.trim() == id)
        .ok_or_else(|| FailureError::NotFound(id.to_string()))
}
