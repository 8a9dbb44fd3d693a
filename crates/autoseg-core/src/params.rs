//! Job parameters.
//!
//! The seven required inputs of a job are collected once at startup from
//! trailing `KEY VALUE` argument pairs and the process environment
//! (arguments win), validated, and frozen into a [`JobParameters`] value that
//! every later phase borrows.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::error::JobError;
use crate::log::mask_token;
use crate::storage::ObjectUri;

static UPLOAD_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("invalid upload id pattern"));

/// The required parameter keys, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamKey {
    /// Remote location of the input archive.
    InputLocation,
    /// Remote prefix the artifact is published under.
    OutputLocation,
    /// Image series identifier.
    SeriesId,
    /// Parent study identifier.
    StudyId,
    /// Patient identifier.
    PatientId,
    /// Authorization token for object storage.
    AuthToken,
    /// Identifier of the uploaded file; used to name local and remote paths.
    FileUploadId,
}

impl ParamKey {
    /// Every key, in canonical order.
    pub const ALL: [Self; 7] = [
        Self::InputLocation,
        Self::OutputLocation,
        Self::SeriesId,
        Self::StudyId,
        Self::PatientId,
        Self::AuthToken,
        Self::FileUploadId,
    ];

    /// Environment variable name, also the canonical argument key.
    #[must_use]
    pub const fn env_name(self) -> &'static str {
        match self {
            Self::InputLocation => "INPUT_LOCATION",
            Self::OutputLocation => "OUTPUT_LOCATION",
            Self::SeriesId => "SERIES_ID",
            Self::StudyId => "STUDY_ID",
            Self::PatientId => "PATIENT_ID",
            Self::AuthToken => "AUTH_TOKEN",
            Self::FileUploadId => "FILE_UPLOAD_ID",
        }
    }

    /// Resolve an argument key such as `series-id`, `--SERIES_ID`, or
    /// `series_id`.
    #[must_use]
    pub fn from_arg(raw: &str) -> Option<Self> {
        let normalized = raw
            .trim_start_matches('-')
            .replace('-', "_")
            .to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|key| key.env_name() == normalized)
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.env_name())
    }
}

/// A file-upload identifier restricted to `[A-Za-z0-9_-]`.
///
/// Only values of this type are ever joined onto filesystem paths or remote
/// keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadId(String);

impl UploadId {
    /// Validate an upload identifier.
    ///
    /// # Errors
    ///
    /// Returns `JobError::InvalidParameter` if `raw` is empty or contains a
    /// character outside `[A-Za-z0-9_-]`.
    pub fn parse(raw: &str) -> Result<Self, JobError> {
        if UPLOAD_ID_PATTERN.is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(JobError::invalid_parameter(
                ParamKey::FileUploadId.env_name(),
                "must match [A-Za-z0-9_-]+",
            ))
        }
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable, validated parameters of one job.
#[derive(Debug)]
pub struct JobParameters {
    input_location: ObjectUri,
    output_location: ObjectUri,
    series_id: String,
    study_id: String,
    patient_id: String,
    auth_token: SecretString,
    upload_id: UploadId,
}

impl JobParameters {
    /// Collect and validate parameters.
    ///
    /// `args` are trailing `KEY VALUE` pairs; `env` looks up environment
    /// variables by their canonical name. A value given in `args` overrides
    /// the environment. Empty values count as absent.
    ///
    /// # Errors
    ///
    /// - `InvalidParameter` for an odd number of argument tokens, an unknown
    ///   key, a malformed upload identifier, or a malformed location.
    /// - `MissingParameter` naming every absent key.
    pub fn from_sources<F>(args: &[String], env: F) -> Result<Self, JobError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if args.len() % 2 != 0 {
            return Err(JobError::invalid_parameter(
                args.last().map_or("", String::as_str),
                "arguments must be KEY VALUE pairs",
            ));
        }

        let mut from_args = BTreeMap::new();
        for pair in args.chunks_exact(2) {
            let key = ParamKey::from_arg(&pair[0])
                .ok_or_else(|| JobError::invalid_parameter(&pair[0], "unknown parameter"))?;
            from_args.insert(key, pair[1].clone());
        }

        let mut values = BTreeMap::new();
        let mut missing = Vec::new();
        for key in ParamKey::ALL {
            let value = from_args
                .remove(&key)
                .filter(|v| !v.trim().is_empty())
                .or_else(|| env(key.env_name()).filter(|v| !v.trim().is_empty()));
            match value {
                Some(value) => {
                    values.insert(key, value);
                },
                None => missing.push(key.env_name().to_string()),
            }
        }
        if !missing.is_empty() {
            return Err(JobError::MissingParameter { keys: missing });
        }

        let mut take = |key: ParamKey| values.remove(&key).unwrap_or_default();

        // The upload id is checked before anything else is derived from the
        // parameters, since it ends up in local paths.
        let upload_id = UploadId::parse(take(ParamKey::FileUploadId).trim())?;

        let input_raw = take(ParamKey::InputLocation);
        let input_location = ObjectUri::parse(input_raw.trim())
            .filter(|uri| !uri.key().is_empty())
            .ok_or_else(|| {
                JobError::invalid_parameter(
                    ParamKey::InputLocation.env_name(),
                    "expected scheme://bucket/key",
                )
            })?;
        let output_raw = take(ParamKey::OutputLocation);
        let output_location = ObjectUri::parse(output_raw.trim()).ok_or_else(|| {
            JobError::invalid_parameter(
                ParamKey::OutputLocation.env_name(),
                "expected scheme://bucket[/prefix]",
            )
        })?;

        Ok(Self {
            input_location,
            output_location,
            series_id: take(ParamKey::SeriesId).trim().to_string(),
            study_id: take(ParamKey::StudyId).trim().to_string(),
            patient_id: take(ParamKey::PatientId).trim().to_string(),
            auth_token: SecretString::from(take(ParamKey::AuthToken)),
            upload_id,
        })
    }

    /// Remote input archive.
    #[must_use]
    pub const fn input_location(&self) -> &ObjectUri {
        &self.input_location
    }

    /// Remote output prefix.
    #[must_use]
    pub const fn output_location(&self) -> &ObjectUri {
        &self.output_location
    }

    /// Series identifier, the key of the status record.
    #[must_use]
    pub fn series_id(&self) -> &str {
        &self.series_id
    }

    /// Study identifier.
    #[must_use]
    pub fn study_id(&self) -> &str {
        &self.study_id
    }

    /// Patient identifier.
    #[must_use]
    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    /// Authorization token.
    #[must_use]
    pub const fn auth_token(&self) -> &SecretString {
        &self.auth_token
    }

    /// Validated upload identifier.
    #[must_use]
    pub const fn upload_id(&self) -> &UploadId {
        &self.upload_id
    }

    /// Token rendered for logs.
    #[must_use]
    pub fn masked_token(&self) -> String {
        mask_token(self.auth_token.expose_secret())
    }

    /// Emit the accepted parameters with the token masked.
    pub fn log_summary(&self) {
        info!(
            input = %self.input_location,
            output = %self.output_location,
            series_id = %self.series_id,
            study_id = %self.study_id,
            patient_id = %self.patient_id,
            upload_id = %self.upload_id,
            auth_token = %self.masked_token(),
            "job parameters accepted"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn full_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("INPUT_LOCATION", "gs://uploads/batch/abc.zip"),
            ("OUTPUT_LOCATION", "gs://results/rt"),
            ("SERIES_ID", "1.2.3"),
            ("STUDY_ID", "9.8"),
            ("PATIENT_ID", "P-001"),
            ("AUTH_TOKEN", "tok_0123456789abcdef"),
            ("FILE_UPLOAD_ID", "abc_123-x"),
        ])
    }

    fn lookup<'a>(
        env: &'a HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| env.get(key).map(|v| (*v).to_string())
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_from_env_only() {
        let env = full_env();
        let params = JobParameters::from_sources(&[], lookup(&env)).unwrap();
        assert_eq!(params.series_id(), "1.2.3");
        assert_eq!(params.upload_id().as_str(), "abc_123-x");
        assert_eq!(params.input_location().bucket(), "uploads");
        assert_eq!(params.input_location().key(), "batch/abc.zip");
        assert_eq!(params.output_location().key(), "rt");
        assert_eq!(params.auth_token().expose_secret(), "tok_0123456789abcdef");
    }

    #[test]
    fn test_arguments_override_environment() {
        let env = full_env();
        let args = strings(&["series-id", "4.5.6", "--PATIENT_ID", "P-002"]);
        let params = JobParameters::from_sources(&args, lookup(&env)).unwrap();
        assert_eq!(params.series_id(), "4.5.6");
        assert_eq!(params.patient_id(), "P-002");
        assert_eq!(params.study_id(), "9.8");
    }

    #[test]
    fn test_reports_every_missing_key() {
        let mut env = full_env();
        env.remove("SERIES_ID");
        env.remove("AUTH_TOKEN");
        env.insert("PATIENT_ID", "   ");

        let err = JobParameters::from_sources(&[], lookup(&env)).unwrap_err();
        match err {
            JobError::MissingParameter { keys } => {
                assert_eq!(keys, vec!["SERIES_ID", "PATIENT_ID", "AUTH_TOKEN"]);
            },
            other => panic!("expected MissingParameter, got {other:?}"),
        }
    }

    #[test]
    fn test_every_subset_of_missing_keys_is_reported_exactly() {
        let env = full_env();
        for mask in 1_u32..(1 << ParamKey::ALL.len()) {
            let absent: Vec<&str> = ParamKey::ALL
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, key)| key.env_name())
                .collect();
            let partial: HashMap<_, _> = env
                .iter()
                .filter(|(k, _)| !absent.contains(k))
                .map(|(k, v)| (*k, *v))
                .collect();

            match JobParameters::from_sources(&[], lookup(&partial)) {
                Err(JobError::MissingParameter { keys }) => assert_eq!(keys, absent),
                other => panic!("mask {mask:#b}: expected MissingParameter, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_rejects_unsafe_upload_ids() {
        for bad in ["../etc", "a b", "id;rm -rf", "x/y", "ab$c", "üpload", "a.b"] {
            let mut env = full_env();
            env.insert("FILE_UPLOAD_ID", bad);
            let err = JobParameters::from_sources(&[], lookup(&env)).unwrap_err();
            assert!(
                matches!(&err, JobError::InvalidParameter { key, .. } if key == "FILE_UPLOAD_ID"),
                "{bad:?} should be rejected, got {err:?}"
            );
        }
    }

    #[test]
    fn test_rejects_malformed_arguments() {
        let env = full_env();
        let odd = strings(&["SERIES_ID"]);
        assert!(matches!(
            JobParameters::from_sources(&odd, lookup(&env)),
            Err(JobError::InvalidParameter { .. })
        ));

        let unknown = strings(&["COLOR", "blue"]);
        assert!(matches!(
            JobParameters::from_sources(&unknown, lookup(&env)),
            Err(JobError::InvalidParameter { key, .. }) if key == "COLOR"
        ));
    }

    #[test]
    fn test_rejects_malformed_locations() {
        let mut env = full_env();
        env.insert("INPUT_LOCATION", "gs://uploads");
        assert!(matches!(
            JobParameters::from_sources(&[], lookup(&env)),
            Err(JobError::InvalidParameter { key, .. }) if key == "INPUT_LOCATION"
        ));

        let mut env = full_env();
        env.insert("OUTPUT_LOCATION", "/local/path");
        assert!(matches!(
            JobParameters::from_sources(&[], lookup(&env)),
            Err(JobError::InvalidParameter { key, .. }) if key == "OUTPUT_LOCATION"
        ));
    }

    #[test]
    fn test_debug_never_reveals_token() {
        let env = full_env();
        let params = JobParameters::from_sources(&[], lookup(&env)).unwrap();
        let rendered = format!("{params:?}");
        assert!(!rendered.contains("0123456789abcdef"));
        assert_eq!(params.masked_token(), "tok_…cdef");
    }
}
