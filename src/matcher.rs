//! Finding work: recent sessions for conversion, and sessions of a source
//! archive that no destination bucket holds yet.
//!
//! The archives share no key. Two sessions are the same visit when their
//! normalized study date and time are equal; see [`DateTimeMatch`].
//!
//! A session whose identity cannot be read is reported as
//! [`Match::Unidentified`]; only failed archive queries end the walk.

use std::vec;

use chrono::NaiveDate;
use tracing::{debug, error, info};

use crate::archive::{Archive, ArchiveError, ProjectFilter, SessionFilter};
use crate::convert::dicom::DicomInspector;
use crate::error::Error;
use crate::model::{normalize_date, normalize_time, SessionRecord, StudyIdentity};

/// Decides whether an existing destination session is the candidate visit.
pub trait MatchStrategy {
    fn same_session(&self, candidate: &StudyIdentity, existing: &SessionRecord) -> bool;
}

/// Exact equality of normalized date and normalized time. The study UID is
/// deliberately not compared.
#[derive(Debug, Default, Clone, Copy)]
pub struct DateTimeMatch;

impl MatchStrategy for DateTimeMatch {
    fn same_session(&self, candidate: &StudyIdentity, existing: &SessionRecord) -> bool {
        normalize_date(&existing.date) == candidate.date
            && normalize_time(&existing.time) == candidate.time
    }
}

/// Resolves the study identity of a source session.
pub trait IdentityProbe {
    fn identity(&self, session: &SessionRecord) -> Result<StudyIdentity, Error>;
}

/// Reads the identity from the first DICOM file of the first scan that has any.
pub struct DicomIdentityProbe<'a> {
    archive: &'a dyn Archive,
    inspector: &'a dyn DicomInspector,
}

impl<'a> DicomIdentityProbe<'a> {
    pub fn new(archive: &'a dyn Archive, inspector: &'a dyn DicomInspector) -> Self {
        Self { archive, inspector }
    }
}

impl IdentityProbe for DicomIdentityProbe<'_> {
    fn identity(&self, session: &SessionRecord) -> Result<StudyIdentity, Error> {
        let dir = tempfile::Builder::new().prefix("identity-").tempdir()?;
        for scan in self.archive.scans(session)? {
            let files = self.archive.scan_files(session, &scan.series)?;
            let Some(first) = files.first() else {
                continue;
            };
            let path = dir.path().join(first);
            self.archive.download_file(session, &scan.series, first, &path)?;
            return Ok(self.inspector.study_identity(&path)?);
        }
        Err(Error::Archive(ArchiveError::NotFound(format!(
            "no DICOM files in session {}",
            session.session_id
        ))))
    }
}

/// A source session that is missing from every destination bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub session: SessionRecord,
    pub identity: StudyIdentity,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Match {
    New(Candidate),
    Present {
        session: SessionRecord,
        bucket: String,
    },
    /// No study identity could be read from the session's files. The
    /// session is looked at again on the next run.
    Unidentified {
        session: SessionRecord,
        reason: String,
    },
}

/// Recent sessions of every project matching `pattern` (exact name, or
/// `LIKE` style with `%`).
pub fn recent_sessions(
    archive: &dyn Archive,
    pattern: &str,
    inserted_after: Option<NaiveDate>,
) -> Result<vec::IntoIter<SessionRecord>, ArchiveError> {
    info!("Fetching new sessions in projects like {}", pattern);
    let filter = SessionFilter::project(ProjectFilter::parse(pattern)).inserted_after(inserted_after);
    let sessions = archive.find_sessions(&filter)?;
    debug!("{} sessions match {}", sessions.len(), pattern);
    Ok(sessions.into_iter())
}

pub struct SessionMatcher<'a> {
    source: &'a dyn Archive,
    destination: &'a dyn Archive,
    probe: &'a dyn IdentityProbe,
    legacy_buckets: Vec<String>,
    strategy: Box<dyn MatchStrategy + 'a>,
}

impl<'a> SessionMatcher<'a> {
    pub fn new(
        source: &'a dyn Archive,
        destination: &'a dyn Archive,
        probe: &'a dyn IdentityProbe,
        legacy_buckets: Vec<String>,
    ) -> Self {
        Self {
            source,
            destination,
            probe,
            legacy_buckets,
            strategy: Box::new(DateTimeMatch),
        }
    }

    pub fn with_strategy(mut self, strategy: Box<dyn MatchStrategy + 'a>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Buckets checked for `destination_project`: the project itself first,
    /// then the legacy buckets.
    pub fn buckets(&self, destination_project: &str) -> Vec<String> {
        let mut buckets = vec![destination_project.to_string()];
        for bucket in &self.legacy_buckets {
            if !buckets.contains(bucket) {
                buckets.push(bucket.clone());
            }
        }
        buckets
    }

    /// Lazily walk the source sessions of `source_project`, probing each one
    /// only when the iterator reaches it.
    pub fn new_sessions(
        &self,
        source_project: &str,
        destination_project: &str,
        inserted_after: Option<NaiveDate>,
    ) -> Result<NewSessions<'_>, ArchiveError> {
        info!("Fetching {} sessions", source_project);
        let filter = SessionFilter::project(ProjectFilter::Exact(source_project.to_string()))
            .inserted_after(inserted_after);
        let pending = self.source.find_sessions(&filter)?.into_iter();
        Ok(NewSessions {
            matcher: self,
            buckets: self.buckets(destination_project),
            pending,
        })
    }

    /// First bucket holding a session equivalent to `identity`, if any.
    pub fn find_bucket(
        &self,
        subject_label: &str,
        identity: &StudyIdentity,
        buckets: &[String],
    ) -> Result<Option<String>, ArchiveError> {
        for bucket in buckets {
            debug!("Fetching {} sessions for subject {}", bucket, subject_label);
            let filter = SessionFilter::project(ProjectFilter::Exact(bucket.clone()))
                .with_subject(subject_label);
            let existing = self.destination.find_sessions(&filter)?;
            if existing
                .iter()
                .any(|session| self.strategy.same_session(identity, session))
            {
                return Ok(Some(bucket.clone()));
            }
        }
        Ok(None)
    }

    fn evaluate(&self, session: SessionRecord, buckets: &[String]) -> Result<Match, Error> {
        let identity = match self.probe.identity(&session) {
            Ok(identity) => identity,
            Err(e) => {
                error!(
                    "Error reading the study identity of {},{}: {}",
                    session.subject_label, session.label, e
                );
                return Ok(Match::Unidentified {
                    reason: e.to_string(),
                    session,
                });
            }
        };
        match self.find_bucket(&session.subject_label, &identity, buckets)? {
            Some(bucket) => {
                info!(
                    "{},{},{} exists in {}, skipping",
                    session.subject_label, identity.date, identity.time, bucket
                );
                Ok(Match::Present { session, bucket })
            }
            None => {
                info!(
                    "{},{},{} doesn't exist in the destination archive",
                    session.subject_label, identity.date, identity.time
                );
                Ok(Match::New(Candidate { session, identity }))
            }
        }
    }
}

/// Iterator returned by [`SessionMatcher::new_sessions`]. Dropping it and
/// calling `new_sessions` again restarts from the source query.
pub struct NewSessions<'m> {
    matcher: &'m SessionMatcher<'m>,
    buckets: Vec<String>,
    pending: vec::IntoIter<SessionRecord>,
}

impl Iterator for NewSessions<'_> {
    type Item = Result<Match, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let session = self.pending.next()?;
        Some(self.matcher.evaluate(session, &self.buckets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn existing(date: &str, time: &str) -> SessionRecord {
        SessionRecord {
            project: "FMRI_HD_024".into(),
            subject_id: "S1".into(),
            subject_label: "0001".into(),
            session_id: "E1".into(),
            label: "12345".into(),
            date: date.into(),
            time: time.into(),
            insert_date: None,
        }
    }

    #[test]
    fn test_date_time_match_normalizes_both_sides() {
        let candidate = StudyIdentity::new("1.2.3", "20120105", "134512.250");
        assert!(DateTimeMatch.same_session(&candidate, &existing("2012-01-05", "13:45:12")));
    }

    #[test]
    fn test_any_field_difference_is_a_different_session() {
        let candidate = StudyIdentity::new("1.2.3", "20120105", "134512");
        assert!(!DateTimeMatch.same_session(&candidate, &existing("2012-01-06", "13:45:12")));
        assert!(!DateTimeMatch.same_session(&candidate, &existing("2012-01-05", "13:45:13")));
    }

    #[test]
    fn test_uid_is_not_part_of_identity() {
        let a = StudyIdentity::new("1.2.3", "20120105", "134512");
        let b = StudyIdentity::new("9.9.9", "20120105", "134512");
        let session = existing("20120105", "134512");
        assert_eq!(
            DateTimeMatch.same_session(&a, &session),
            DateTimeMatch.same_session(&b, &session)
        );
    }
}
