//! Existence Policy: whether an existing destination is regenerated.

use std::ops::{Deref, DerefMut};

use tracing::{debug, error, info, warn};

use crate::digest::file_digest;
use crate::domain::{ExistencePolicy, TransferTarget};
use crate::error::PrepError;
use crate::status::StatusEvent;
use crate::store::{file_mtime, file_size, lexists, same_instant};

pub const ALREADY_EXISTS: &str = "already exists";

/// Outcome of evaluating a policy against a destination.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Proceed,
    /// Leave the destination alone; the event is the one to report.
    Skip(StatusEvent),
}

impl Verdict {
    fn skip() -> Self {
        Verdict::Skip(StatusEvent::skipped(ALREADY_EXISTS))
    }
}

/// Decide whether `target` should be written under `policy`.
///
/// A missing destination always proceeds. `ErrorIfPresent` on an existing
/// destination is an error, never a status event.
pub fn evaluate(target: &TransferTarget, policy: ExistencePolicy) -> Result<Verdict, PrepError> {
    let dst = target.destination();
    if !lexists(dst) {
        info!(path = %dst, "destination does not exist: write it");
        return Ok(Verdict::Proceed);
    }

    match policy {
        ExistencePolicy::ErrorIfPresent => {
            error!(path = %dst, "destination already exists");
            Err(PrepError::AlreadyExists(dst.to_path_buf()))
        }
        ExistencePolicy::Skip => {
            info!(path = %dst, "destination already exists: skip");
            Ok(Verdict::skip())
        }
        ExistencePolicy::Overwrite => {
            info!(path = %dst, "destination already exists: overwrite");
            Ok(Verdict::Proceed)
        }
        ExistencePolicy::DifferByMetadata => differ_by_metadata(target),
        ExistencePolicy::RefreshIfStale => refresh_if_stale(target),
    }
}

fn differ_by_metadata(target: &TransferTarget) -> Result<Verdict, PrepError> {
    let dst = target.destination();
    if let Some(expected) = target.size {
        let local = file_size(dst)?;
        if local != expected {
            info!(path = %dst, local, expected, "size does not match expected size: regenerate");
            return Ok(Verdict::Proceed);
        }
    }
    if let Some((algorithm, expected)) = target.digests.authoritative() {
        let local = file_digest(dst, algorithm)?;
        if local != expected {
            info!(path = %dst, %algorithm, "digest does not match expected digest: regenerate");
            return Ok(Verdict::Proceed);
        }
        info!(path = %dst, %algorithm, "digest matches: skip");
        return Ok(Verdict::skip());
    }
    if target.size.is_none() {
        // Nothing to compare against: the existing file is taken as current.
        debug!(path = %dst, "no size or digest declared: treating as up to date");
    } else {
        info!(path = %dst, "size matches: skip");
    }
    Ok(Verdict::skip())
}

fn refresh_if_stale(target: &TransferTarget) -> Result<Verdict, PrepError> {
    let dst = target.destination();
    let Some(expected) = target.mtime else {
        warn!(path = %dst, "no mtime in the record: regenerate");
        return Ok(Verdict::Proceed);
    };
    let local = file_mtime(dst)?;
    if !same_instant(local, expected) {
        info!(path = %dst, %local, %expected, "destination is not fresh: regenerate");
        return Ok(Verdict::Proceed);
    }
    // Only a declared size can overrule a matching mtime.
    if let Some(size) = target.size {
        if file_size(dst)? != size {
            info!(path = %dst, "mtime matches but size differs: regenerate");
            return Ok(Verdict::Proceed);
        }
    }
    info!(path = %dst, "destination is fresh enough: skip");
    Ok(Verdict::skip())
}

/// Scoped policy override threaded down to actions explicitly.
///
/// The innermost scope wins and is dropped when its guard goes out of
/// scope. Effective policy: innermost override, then the action's own
/// policy, then [`ExistencePolicy::default`].
#[derive(Debug, Clone, Default)]
pub struct PolicyContext {
    overrides: Vec<ExistencePolicy>,
}

impl PolicyContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<ExistencePolicy> {
        self.overrides.last().copied()
    }

    pub fn resolve(&self, instance: Option<ExistencePolicy>) -> ExistencePolicy {
        self.current().or(instance).unwrap_or_default()
    }

    /// Enter a scope overriding the policy; `None` leaves the current one.
    pub fn scoped(&mut self, policy: Option<ExistencePolicy>) -> PolicyScope<'_> {
        let pushed = match policy {
            Some(policy) => {
                debug!(%policy, "entering policy scope");
                self.overrides.push(policy);
                true
            }
            None => false,
        };
        PolicyScope {
            context: self,
            pushed,
        }
    }
}

pub struct PolicyScope<'a> {
    context: &'a mut PolicyContext,
    pushed: bool,
}

impl Deref for PolicyScope<'_> {
    type Target = PolicyContext;

    fn deref(&self) -> &PolicyContext {
        self.context
    }
}

impl DerefMut for PolicyScope<'_> {
    fn deref_mut(&mut self) -> &mut PolicyContext {
        self.context
    }
}

impl Drop for PolicyScope<'_> {
    fn drop(&mut self) {
        if self.pushed {
            self.context.overrides.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn innermost_scope_wins_and_restores() {
        let mut context = PolicyContext::new();
        assert_eq!(context.resolve(None), ExistencePolicy::DifferByMetadata);
        assert_eq!(
            context.resolve(Some(ExistencePolicy::Skip)),
            ExistencePolicy::Skip
        );
        {
            let mut outer = context.scoped(Some(ExistencePolicy::Overwrite));
            assert_eq!(
                outer.resolve(Some(ExistencePolicy::Skip)),
                ExistencePolicy::Overwrite
            );
            {
                let inner = outer.scoped(Some(ExistencePolicy::RefreshIfStale));
                assert_eq!(inner.resolve(None), ExistencePolicy::RefreshIfStale);
            }
            assert_eq!(outer.current(), Some(ExistencePolicy::Overwrite));
            let unchanged = outer.scoped(None);
            assert_eq!(unchanged.current(), Some(ExistencePolicy::Overwrite));
        }
        assert_eq!(context.current(), None);
    }
}
