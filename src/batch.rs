//! Batch Runner: drives Data-Actions one after another into a reporter.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{info, warn};

use crate::action::DataAction;
use crate::domain::{ExistencePolicy, OnError, PathDisplay};
use crate::error::PrepError;
use crate::output::StatusSink;
use crate::policy::PolicyContext;
use crate::status::{Status, StatusEvent};

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    /// Overrides the policy of every action in the batch.
    pub policy: Option<ExistencePolicy>,
    pub on_error: OnError,
    pub path: PathDisplay,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub done: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.done + self.skipped + self.failed
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    fn tally(&mut self, status: Option<Status>) {
        match status {
            Some(Status::Done) => self.done += 1,
            Some(Status::Skipped) => self.skipped += 1,
            _ => self.failed += 1,
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchRunner {
    options: BatchOptions,
    context: PolicyContext,
}

impl BatchRunner {
    pub fn new(options: BatchOptions) -> Self {
        Self {
            options,
            context: PolicyContext::new(),
        }
    }

    /// Run inside an enclosing policy context, e.g. a batch nested in
    /// another one.
    pub fn with_context(mut self, context: PolicyContext) -> Self {
        self.context = context;
        self
    }

    /// Run every action to completion, in order.
    ///
    /// `PathDisplay::Short` needs all destinations up front, so the action
    /// sequence is collected before the first one runs.
    pub fn run<I, A>(&mut self, actions: I, sink: &mut dyn StatusSink) -> Result<BatchSummary, PrepError>
    where
        I: IntoIterator<Item = A>,
        A: DataAction,
    {
        let options = self.options;
        let scope = self.context.scoped(options.policy);
        let mut summary = BatchSummary::default();

        match options.path {
            PathDisplay::Short => {
                let actions: Vec<A> = actions.into_iter().collect();
                let names = short_paths(actions.iter().map(|action| action.destination()));
                for (action, name) in actions.into_iter().zip(names) {
                    run_guarded(action, name, &scope, options.on_error, sink, &mut summary)?;
                }
            }
            mode => {
                for action in actions {
                    let name = display_path(action.destination(), mode);
                    run_guarded(action, name, &scope, options.on_error, sink, &mut summary)?;
                }
            }
        }

        info!(
            done = summary.done,
            skipped = summary.skipped,
            failed = summary.failed,
            "batch finished"
        );
        sink.finish(&summary);
        Ok(summary)
    }
}

fn run_guarded<A: DataAction>(
    mut action: A,
    name: String,
    context: &PolicyContext,
    on_error: OnError,
    sink: &mut dyn StatusSink,
    summary: &mut BatchSummary,
) -> Result<(), PrepError> {
    action.apply_policy(context);
    let mut row = StatusEvent::default();
    let mut emit = |mut event: StatusEvent, row: &mut StatusEvent| {
        event.path = Some(name.clone());
        row.merge(&event);
        sink.record(&event);
    };

    for item in action {
        match item {
            Ok(event) => emit(event, &mut row),
            Err(err) => match on_error {
                OnError::Raise => {
                    summary.failed += 1;
                    return Err(err);
                }
                OnError::Yield => {
                    warn!(path = %name, %err, "action failed");
                    emit(StatusEvent::error(err.to_string()), &mut row);
                    break;
                }
            },
        }
    }

    if !row.is_terminal() {
        emit(
            StatusEvent::error("action ended without a final status"),
            &mut row,
        );
    }
    summary.tally(row.status);
    Ok(())
}

pub fn display_path(path: &Utf8Path, mode: PathDisplay) -> String {
    match mode {
        PathDisplay::Name => path.file_name().unwrap_or(path.as_str()).to_string(),
        PathDisplay::Full => path.to_string(),
        PathDisplay::Absolute => absolute(path).to_string(),
        PathDisplay::Short => short_paths([path]).pop().unwrap_or_default(),
    }
}

fn absolute(path: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .ok()
        .and_then(|cwd| Utf8PathBuf::from_path_buf(cwd).ok())
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|| path.to_path_buf())
}

/// Strip the directory prefix shared by all `paths`. A single path shows
/// its name; paths with nothing in common stay whole.
pub fn short_paths<'a, I>(paths: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a Utf8Path>,
{
    let paths: Vec<&Utf8Path> = paths.into_iter().collect();
    if paths.len() == 1 {
        return vec![display_path(paths[0], PathDisplay::Name)];
    }

    let mut common: Option<Vec<&str>> = None;
    for path in &paths {
        let parent: Vec<&str> = path
            .parent()
            .map(|parent| parent.components().map(|c| c.as_str()).collect())
            .unwrap_or_default();
        common = Some(match common {
            None => parent,
            Some(prefix) => prefix
                .into_iter()
                .zip(parent)
                .take_while(|(left, right)| left == right)
                .map(|(left, _)| left)
                .collect(),
        });
    }
    let depth = common.map(|prefix| prefix.len()).unwrap_or(0);

    paths
        .iter()
        .map(|path| {
            if depth == 0 {
                return path.to_string();
            }
            let rest: Utf8PathBuf = path.components().skip(depth).map(|c| c.as_str()).collect();
            rest.to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_strips_common_directories() {
        let names = short_paths([
            Utf8Path::new("data/raw/IXI/T1/IXI002.nii.gz"),
            Utf8Path::new("data/raw/IXI/T2/IXI002.nii.gz"),
            Utf8Path::new("data/raw/IXI/participants.tsv"),
        ]);
        assert_eq!(
            names,
            vec!["T1/IXI002.nii.gz", "T2/IXI002.nii.gz", "participants.tsv"]
        );
    }

    #[test]
    fn short_edge_cases() {
        assert_eq!(
            short_paths([Utf8Path::new("data/raw/IXI-T1.tar")]),
            vec!["IXI-T1.tar"]
        );
        assert_eq!(
            short_paths([Utf8Path::new("a/x.tar"), Utf8Path::new("b/y.tar")]),
            vec!["a/x.tar", "b/y.tar"]
        );
    }

    #[test]
    fn display_modes() {
        let path = Utf8Path::new("raw/IXI-T1.tar");
        assert_eq!(display_path(path, PathDisplay::Name), "IXI-T1.tar");
        assert_eq!(display_path(path, PathDisplay::Full), "raw/IXI-T1.tar");
        assert!(display_path(path, PathDisplay::Absolute).ends_with("raw/IXI-T1.tar"));
        assert!(Utf8Path::new(&display_path(path, PathDisplay::Absolute)).is_absolute());
    }

    #[test]
    fn summary_tally() {
        let mut summary = BatchSummary::default();
        summary.tally(Some(Status::Done));
        summary.tally(Some(Status::Skipped));
        summary.tally(Some(Status::Error));
        summary.tally(None);
        assert_eq!(summary.total(), 4);
        assert_eq!(summary.failed, 2);
        assert!(!summary.is_success());
    }
}
