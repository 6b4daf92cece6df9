use crate::crds::BuildRun;
use kube::ResourceExt;
use sha1::{Digest, Sha1};

const MAX_K8S_NAME_LENGTH: usize = 63;
const JOB_SUFFIX: &str = "-build";
const SERVICE_ACCOUNT_SUFFIX: &str = "-sa";
const HASH_LENGTH: usize = 8;

pub struct ResourceNaming;

impl ResourceNaming {
    /// Name of the execution job for a run; stable across reconciles
    pub fn job_name(run: &BuildRun) -> String {
        Self::with_suffix(&run.name_any(), JOB_SUFFIX)
    }

    /// Name of the service account generated for a run
    pub fn service_account_name(run: &BuildRun) -> String {
        Self::with_suffix(&run.name_any(), SERVICE_ACCOUNT_SUFFIX)
    }

    fn with_suffix(base: &str, suffix: &str) -> String {
        let name = format!("{base}{suffix}");
        if name.len() <= MAX_K8S_NAME_LENGTH {
            return name;
        }

        // Keep a readable prefix and disambiguate with a hash of the full base
        let hash = Self::hash_string(base);
        let available = MAX_K8S_NAME_LENGTH - suffix.len() - HASH_LENGTH - 1;
        let prefix: String = base.chars().take(available).collect();
        format!("{}-{hash}{suffix}", prefix.trim_end_matches('-'))
    }

    fn hash_string(value: &str) -> String {
        let digest = Sha1::digest(value.as_bytes());
        hex::encode(digest)[..HASH_LENGTH].to_string()
    }
}
